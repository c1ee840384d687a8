//! Route registry.

use crate::error::ClientError;
use crate::object::RemoteObject;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// What a route handler (or remote method) hands back to its caller.
pub enum Reply {
    /// Plain data, sent as-is.
    Value(Value),
    /// A live object; the caller receives a proxy.
    Object(RemoteObject),
}

impl Reply {
    /// Serialize any value into a plain-data reply.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::Value(serde_json::to_value(value)?))
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<RemoteObject> for Reply {
    fn from(object: RemoteObject) -> Self {
        Self::Object(object)
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Object(object) => f.debug_tuple("Object").field(&object.name()).finish(),
        }
    }
}

/// A named operation other clients can invoke.
///
/// `caller` is the verified name of the requesting client; `args` are the
/// keyword arguments it sent. Any closure
/// `Fn(String, Map<String, Value>) -> impl Future<Output = anyhow::Result<Reply>>`
/// is a route.
#[async_trait]
pub trait Route: Send + Sync {
    async fn handle(&self, caller: &str, args: Map<String, Value>) -> anyhow::Result<Reply>;
}

#[async_trait]
impl<F, Fut> Route for F
where
    F: Fn(String, Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Reply>> + Send + 'static,
{
    async fn handle(&self, caller: &str, args: Map<String, Value>) -> anyhow::Result<Reply> {
        (self)(caller.to_string(), args).await
    }
}

/// Routes this client serves, by name.
#[derive(Default)]
pub struct RouteRegistry {
    routes: RwLock<HashMap<String, Arc<dyn Route>>>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `route` under `name`. Names are unique.
    pub fn add(&self, name: &str, route: impl Route + 'static) -> Result<(), ClientError> {
        if name.is_empty() {
            return Err(ClientError::InvalidArguments(
                "route name must not be empty".to_string(),
            ));
        }
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        if routes.contains_key(name) {
            return Err(ClientError::RouteExists(name.to_string()));
        }
        routes.insert(name.to_string(), Arc::new(route));
        debug!(route = %name, "Route registered");
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<(), ClientError> {
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ClientError::RouteNotRegistered(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Route>> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// Registered route names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for RouteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteRegistry")
            .field("routes", &self.names())
            .finish()
    }
}
