//! Remote objects.
//!
//! A route handler may return a [`RemoteObject`] instead of plain data. The
//! producing client snapshots the object's plain fields, keeps its methods
//! in an [`ObjectRegistry`] under a fresh uuid, and sends the snapshot. The
//! receiving client gets an [`ObjectProxy`] whose [`ObjectProxy::call`]
//! performs a `function_call` round trip back to the producer.
//!
//! Exported methods live for a bounded time. Once expired they are
//! unreachable and the producer answers calls with
//! `"The called function has either expired or has never been registered"`.

use crate::client::Client;
use crate::error::ClientError;
use crate::routes::Reply;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;
use winerp_wire::{FunctionCall, Message, ObjectPayload};

/// Default lifetime of an exported object.
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(30);

/// Expiry horizon used when a lifetime does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// A method callable through a proxy: positional and keyword arguments in,
/// a [`Reply`] out.
pub type RemoteMethod =
    Arc<dyn Fn(Vec<Value>, Map<String, Value>) -> BoxFuture<'static, anyhow::Result<Reply>> + Send + Sync>;

/// One field of a [`Snapshot`].
#[derive(Clone)]
pub enum Field {
    Value(Value),
    /// A nested object, rendered up to the export depth.
    Object(Arc<dyn Transferable>),
    List(Vec<Field>),
}

/// The transferable view of an object: a type name, plain fields, and the
/// methods it exposes.
pub struct Snapshot {
    name: String,
    fields: Vec<(String, Field)>,
    methods: BTreeMap<String, RemoteMethod>,
}

impl Snapshot {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            methods: BTreeMap::new(),
        }
    }

    /// Add a plain-data field.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((key.into(), Field::Value(value.into())));
        self
    }

    /// Add a nested object field.
    pub fn object(mut self, key: impl Into<String>, object: impl Transferable + 'static) -> Self {
        self.fields
            .push((key.into(), Field::Object(Arc::new(object))));
        self
    }

    /// Add a list field of arbitrary [`Field`]s.
    pub fn list(mut self, key: impl Into<String>, items: Vec<Field>) -> Self {
        self.fields.push((key.into(), Field::List(items)));
        self
    }

    /// Expose a method.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(Vec<Value>, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Reply>> + Send + 'static,
    {
        let method: RemoteMethod = Arc::new(move |args, kwargs| method(args, kwargs).boxed());
        self.methods.insert(name.into(), method);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("name", &self.name)
            .field("fields", &self.fields.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Types that can be sent as a remote object.
pub trait Transferable: Send + Sync {
    fn to_transferable(&self) -> Snapshot;
}

impl Transferable for Snapshot {
    fn to_transferable(&self) -> Snapshot {
        Snapshot {
            name: self.name.clone(),
            fields: self.fields.clone(),
            methods: self.methods.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Expiry {
    After(Duration),
    Until(DateTime<Utc>),
}

/// An object prepared for export, with its export options.
pub struct RemoteObject {
    snapshot: Snapshot,
    depth: usize,
    expiry: Expiry,
    methods: Option<Vec<String>>,
    include_iterables: bool,
}

impl RemoteObject {
    pub fn new(object: &dyn Transferable) -> Self {
        Self {
            snapshot: object.to_transferable(),
            depth: 1,
            expiry: Expiry::After(DEFAULT_EXPIRY),
            methods: None,
            include_iterables: true,
        }
    }

    /// How many levels of nested objects are rendered as fields. Deeper
    /// objects are sent as their type name.
    pub fn depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn expire_after(mut self, ttl: Duration) -> Self {
        self.expiry = Expiry::After(ttl);
        self
    }

    /// Keep the exported methods reachable until `at`.
    pub fn keep_until(mut self, at: DateTime<Utc>) -> Self {
        self.expiry = Expiry::Until(at);
        self
    }

    /// Export only the named methods.
    pub fn methods<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Whether sequence fields are sent. Defaults to true.
    pub fn include_iterables(mut self, include: bool) -> Self {
        self.include_iterables = include;
        self
    }

    pub fn name(&self) -> &str {
        &self.snapshot.name
    }

    fn ttl(&self) -> Duration {
        match self.expiry {
            Expiry::After(ttl) => ttl,
            Expiry::Until(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
        }
    }

    fn exported_methods(&self) -> BTreeMap<String, RemoteMethod> {
        match &self.methods {
            None => self.snapshot.methods.clone(),
            Some(wanted) => self
                .snapshot
                .methods
                .iter()
                .filter(|(name, _)| wanted.iter().any(|w| w == *name))
                .map(|(name, method)| (name.clone(), Arc::clone(method)))
                .collect(),
        }
    }

    fn render_attrs(&self) -> Map<String, Value> {
        render_fields(&self.snapshot.fields, self.depth, self.include_iterables)
    }
}

fn render_fields(fields: &[(String, Field)], depth: usize, iterables: bool) -> Map<String, Value> {
    fields
        .iter()
        .filter_map(|(key, field)| render_field(field, depth, iterables).map(|v| (key.clone(), v)))
        .collect()
}

fn render_field(field: &Field, depth: usize, iterables: bool) -> Option<Value> {
    match field {
        Field::Value(Value::Array(_)) if !iterables => None,
        Field::Value(value) => Some(value.clone()),
        Field::Object(object) => {
            let nested = object.to_transferable();
            if depth == 0 {
                Some(Value::String(nested.name))
            } else {
                Some(Value::Object(render_fields(&nested.fields, depth - 1, iterables)))
            }
        }
        Field::List(_) if !iterables => None,
        Field::List(items) => Some(Value::Array(
            items
                .iter()
                .filter_map(|item| render_field(item, depth, iterables))
                .collect(),
        )),
    }
}

struct Exported {
    methods: BTreeMap<String, RemoteMethod>,
    expires_at: Instant,
}

/// Objects this client has exported, by uuid.
#[derive(Clone, Default)]
pub struct ObjectRegistry {
    objects: Arc<DashMap<String, Exported>>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the object's methods and produce its wire snapshot. A timer
    /// task purges the entry at expiry. Must be called within a Tokio runtime.
    pub fn export(&self, object: RemoteObject) -> ObjectPayload {
        let uuid = Uuid::new_v4().to_string();
        let ttl = object.ttl();
        let now = Instant::now();
        let expires_at = now.checked_add(ttl).unwrap_or(now + FAR_FUTURE);
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let methods = object.exported_methods();

        let payload = ObjectPayload {
            name: object.snapshot.name.clone(),
            uuid: uuid.clone(),
            attrs: object.render_attrs(),
            methods: methods.keys().map(|name| (name.clone(), true)).collect(),
            expires_at_ms: Some(Utc::now().timestamp_millis().saturating_add(ttl_ms)),
        };

        debug!(object = %payload.name, uuid = %uuid, ttl_ms, "Object exported");
        self.objects.insert(
            uuid.clone(),
            Exported {
                methods,
                expires_at,
            },
        );

        let objects = Arc::clone(&self.objects);
        tokio::spawn(async move {
            tokio::time::sleep_until(expires_at).await;
            if objects.remove(&uuid).is_some() {
                debug!(uuid = %uuid, "Exported object expired");
            }
        });

        payload
    }

    /// The live method `name` of object `uuid`, if any.
    pub fn method(&self, uuid: &str, name: &str) -> Option<RemoteMethod> {
        let (expired, method) = match self.objects.get(uuid) {
            None => return None,
            Some(entry) if Instant::now() >= entry.expires_at => (true, None),
            Some(entry) => (false, entry.methods.get(name).cloned()),
        };
        if expired {
            self.objects.remove(uuid);
        }
        method
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.objects.contains_key(uuid)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRegistry")
            .field("objects", &self.objects.len())
            .finish()
    }
}

/// Stand-in for an object living in another client.
#[derive(Debug, Clone)]
pub struct ObjectProxy {
    client: Client,
    source: String,
    payload: ObjectPayload,
    timeout: Duration,
}

impl ObjectProxy {
    pub(crate) fn new(client: Client, source: String, payload: ObjectPayload) -> Self {
        let timeout = client.config().function_call_timeout;
        Self {
            client,
            source,
            payload,
            timeout,
        }
    }

    /// Type name of the original object.
    pub fn name(&self) -> &str {
        &self.payload.name
    }

    pub fn uuid(&self) -> &str {
        &self.payload.uuid
    }

    /// Name of the client owning the object.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn attr(&self, key: &str) -> Option<&Value> {
        self.payload.attrs.get(key)
    }

    pub fn attrs(&self) -> &Map<String, Value> {
        &self.payload.attrs
    }

    pub fn methods(&self) -> Vec<&str> {
        self.payload
            .methods
            .iter()
            .filter(|(_, exported)| **exported)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.payload.methods.get(name).copied().unwrap_or(false)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.payload
            .expires_at_ms
            .and_then(DateTime::<Utc>::from_timestamp_millis)
    }

    pub fn is_expired(&self) -> bool {
        self.payload
            .expires_at_ms
            .is_some_and(|ms| ms <= Utc::now().timestamp_millis())
    }

    /// Override the deadline for method calls.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Invoke `method` on the original object.
    pub async fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Output, ClientError> {
        if !self.has_method(method) {
            return Err(ClientError::UnknownMethod(method.to_string()));
        }
        let call = FunctionCall {
            object: self.payload.uuid.clone(),
            method: method.to_string(),
            args,
            kwargs,
        };
        let reply = self
            .client
            .function_call(&self.source, call, self.timeout)
            .await?;
        Output::from_reply(&self.client, reply)
    }
}

/// Result of a call: plain data or a proxy for a remote object.
#[derive(Debug, Clone)]
pub enum Output {
    Value(Value),
    Object(ObjectProxy),
}

impl Output {
    pub(crate) fn from_reply(client: &Client, reply: Message) -> Result<Self, ClientError> {
        if !reply.is_pseudo_object() {
            return Ok(Self::Value(reply.into_data()));
        }
        let source = reply.id().unwrap_or_default().to_string();
        let payload: ObjectPayload = serde_json::from_value(reply.into_data())?;
        Ok(Self::Object(ObjectProxy::new(client.clone(), source, payload)))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Object(_) => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Object(_) => None,
        }
    }

    pub fn into_object(self) -> Option<ObjectProxy> {
        match self {
            Self::Object(proxy) => Some(proxy),
            Self::Value(_) => None,
        }
    }

    /// Deserialize a plain-data result.
    pub fn parse<T: DeserializeOwned>(self) -> Result<T, ClientError> {
        match self {
            Self::Value(value) => Ok(serde_json::from_value(value)?),
            Self::Object(proxy) => Err(ClientError::InvalidArguments(format!(
                "expected plain data, got remote object {}",
                proxy.name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Engine;

    impl Transferable for Engine {
        fn to_transferable(&self) -> Snapshot {
            Snapshot::new("Engine")
                .field("cylinders", 4)
                .object("maker", Maker)
                .method("start", |_, _| async { Ok(Reply::from(json!("vroom"))) })
        }
    }

    struct Maker;

    impl Transferable for Maker {
        fn to_transferable(&self) -> Snapshot {
            Snapshot::new("Maker")
                .field("country", "JP")
                .object("parent", Snapshot::new("Holding").field("listed", true))
        }
    }

    fn car() -> Snapshot {
        Snapshot::new("Car")
            .field("wheels", 4)
            .field("tags", json!(["red", "fast"]))
            .object("engine", Engine)
            .list("spares", vec![Field::Value(json!("tyre")), Field::Object(Arc::new(Maker))])
            .method("honk", |_, _| async { Ok(Reply::from(json!("beep"))) })
            .method("drive", |args: Vec<Value>, _| async move {
                Ok(Reply::from(json!({ "km": args.first().cloned().unwrap_or(json!(0)) })))
            })
    }

    #[test]
    fn test_render_depth_one() {
        let object = RemoteObject::new(&car());
        let attrs = object.render_attrs();
        assert_eq!(attrs["wheels"], json!(4));
        assert_eq!(attrs["tags"], json!(["red", "fast"]));
        // Nested methods are not exported, nested-nested objects collapse to names.
        assert_eq!(attrs["engine"], json!({ "cylinders": 4, "maker": "Maker" }));
        assert_eq!(attrs["spares"], json!(["tyre", { "country": "JP", "parent": "Holding" }]));
    }

    #[test]
    fn test_render_depth_zero_and_no_iterables() {
        let object = RemoteObject::new(&car()).depth(0).include_iterables(false);
        let attrs = object.render_attrs();
        assert_eq!(attrs["engine"], json!("Engine"));
        assert!(!attrs.contains_key("tags"));
        assert!(!attrs.contains_key("spares"));
    }

    #[test]
    fn test_render_deeper() {
        let attrs = RemoteObject::new(&car()).depth(2).render_attrs();
        assert_eq!(attrs["engine"]["maker"], json!({ "country": "JP", "parent": "Holding" }));
    }

    #[tokio::test]
    async fn test_export_restricts_methods() {
        let registry = ObjectRegistry::new();
        let payload = registry.export(RemoteObject::new(&car()).methods(["honk"]));
        assert_eq!(payload.name, "Car");
        assert_eq!(payload.methods.keys().collect::<Vec<_>>(), vec!["honk"]);
        assert!(payload.expires_at_ms.is_some());

        let honk = registry.method(&payload.uuid, "honk").unwrap();
        match honk(Vec::new(), Map::new()).await.unwrap() {
            Reply::Value(value) => assert_eq!(value, json!("beep")),
            other => panic!("Expected value, got {other:?}"),
        }
        assert!(registry.method(&payload.uuid, "drive").is_none());
        assert!(registry.method("no-such-object", "honk").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_object_unreachable_and_purged() {
        let registry = ObjectRegistry::new();
        let payload = registry.export(RemoteObject::new(&car()).expire_after(Duration::from_secs(5)));
        assert!(registry.method(&payload.uuid, "honk").is_some());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(registry.method(&payload.uuid, "honk").is_none());

        tokio::task::yield_now().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unbounded_lifetime_saturates() {
        let registry = ObjectRegistry::new();
        let payload = registry.export(RemoteObject::new(&car()).expire_after(Duration::MAX));
        assert_eq!(payload.expires_at_ms, Some(i64::MAX));
        assert!(registry.method(&payload.uuid, "honk").is_some());
    }

    #[tokio::test]
    async fn test_keep_until_in_past_expires_immediately() {
        let registry = ObjectRegistry::new();
        let payload = registry
            .export(RemoteObject::new(&car()).keep_until(Utc::now() - chrono::Duration::seconds(10)));
        assert!(registry.method(&payload.uuid, "honk").is_none());
    }
}
