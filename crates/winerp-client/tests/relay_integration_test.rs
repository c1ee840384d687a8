//! End-to-end tests: a real relay on an ephemeral port and real clients
//! talking to it over WebSockets.

use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use winerp_client::wire::reason;
use winerp_client::{
    Client, ClientConfig, ClientError, ConnectionState, Event, EventKind, RemoteObject, Reply,
    Snapshot, Transferable,
};
use winerp_server::{Server, ServerConfig};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn start_relay() -> Arc<Server> {
    let config = ServerConfig {
        port: 0,
        ..ServerConfig::default()
    };
    let (server, _accept) = Server::start(config).await.unwrap();
    server
}

fn client_config(server: &Server, name: &str) -> ClientConfig {
    ClientConfig {
        host: "127.0.0.1".to_string(),
        port: server.local_addr().port(),
        reconnect: false,
        ..ClientConfig::new(name)
    }
}

async fn connect(server: &Server, name: &str) -> Client {
    let client = Client::new(client_config(server, name));
    client.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), client.wait_until_ready())
        .await
        .expect("client never became ready")
        .unwrap();
    client
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

fn add_sum_route(client: &Client) {
    client
        .add_route("sum", |caller: String, args: Map<String, Value>| async move {
            let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
            let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
            Ok(Reply::from(json!({ "caller": caller, "sum": a + b })))
        })
        .unwrap();
}

struct Counter {
    label: String,
    count: Arc<AtomicI64>,
}

impl Transferable for Counter {
    fn to_transferable(&self) -> Snapshot {
        let inc = Arc::clone(&self.count);
        let get = Arc::clone(&self.count);
        Snapshot::new("Counter")
            .field("label", self.label.clone())
            .field("count", self.count.load(Ordering::SeqCst))
            .method("increment", move |args: Vec<Value>, _kwargs| {
                let count = Arc::clone(&inc);
                async move {
                    let by = args.first().and_then(Value::as_i64).unwrap_or(1);
                    Ok(Reply::from(json!(count.fetch_add(by, Ordering::SeqCst) + by)))
                }
            })
            .method("get", move |_, _| {
                let count = Arc::clone(&get);
                async move { Ok(Reply::from(json!(count.load(Ordering::SeqCst)))) }
            })
    }
}

fn add_counter_route(client: &Client, name: &str, ttl: Duration) {
    let count = Arc::new(AtomicI64::new(0));
    client
        .add_route(name, move |_caller: String, _args: Map<String, Value>| {
            let count = Arc::clone(&count);
            async move {
                let counter = Counter {
                    label: "clicks".to_string(),
                    count,
                };
                Ok(Reply::from(
                    RemoteObject::new(&counter)
                        .methods(["increment"])
                        .expire_after(ttl),
                ))
            }
        })
        .unwrap();
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_call_roundtrip_sees_caller() {
    let server = start_relay().await;
    let alpha = connect(&server, "alpha").await;
    let beta = connect(&server, "beta").await;
    add_sum_route(&beta);

    let result: Value = alpha
        .call("sum", "beta", json!({ "a": 2, "b": 3 }))
        .await
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(result, json!({ "caller": "alpha", "sum": 5 }));

    let via_peer = alpha
        .peer("beta")
        .call("sum", json!({ "a": 10, "b": -4 }))
        .await
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(via_peer["sum"], json!(6));
}

#[tokio::test]
async fn test_missing_route_is_route_not_found() {
    let server = start_relay().await;
    let alpha = connect(&server, "alpha").await;
    let _beta = connect(&server, "beta").await;

    let err = alpha.call("missing", "beta", Value::Null).await.unwrap_err();
    assert!(matches!(err, ClientError::RouteNotFound(route) if route == "missing"));
}

#[tokio::test]
async fn test_unknown_and_same_destination() {
    let server = start_relay().await;
    let alpha = connect(&server, "alpha").await;
    add_sum_route(&alpha);

    let err = alpha.call("sum", "nobody", json!({})).await.unwrap_err();
    assert!(matches!(err, ClientError::DestinationNotFound));

    let err = alpha.call("sum", "alpha", json!({})).await.unwrap_err();
    assert!(matches!(err, ClientError::SameDestination));
}

#[tokio::test]
async fn test_handler_error_is_remote_error() {
    let server = start_relay().await;
    let alpha = connect(&server, "alpha").await;
    let beta = connect(&server, "beta").await;
    beta.add_route("divide", |_caller: String, _args: Map<String, Value>| async move {
        anyhow::bail!("division by zero")
    })
    .unwrap();

    match alpha.call("divide", "beta", json!({})).await {
        Err(ClientError::Remote { message, traceback }) => {
            assert_eq!(message, "division by zero");
            assert!(traceback.contains("division by zero"));
        }
        other => panic!("Expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_panicking_handler_is_remote_error() {
    let server = start_relay().await;
    let alpha = connect(&server, "alpha").await;
    let beta = connect(&server, "beta").await;
    add_sum_route(&beta);
    beta.add_route("boom", |_caller: String, _args: Map<String, Value>| async move {
        let empty: Vec<i64> = Vec::new();
        Ok(Reply::from(json!(empty[3])))
    })
    .unwrap();

    match alpha
        .call_with_timeout("boom", "beta", json!({}), Duration::from_secs(2))
        .await
    {
        Err(ClientError::Remote { message, .. }) => {
            assert!(message.contains("panicked"), "{message}")
        }
        other => panic!("Expected remote error, got {other:?}"),
    }

    let still_works = alpha
        .call("sum", "beta", json!({ "a": 2, "b": 3 }))
        .await
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(still_works["sum"], json!(5));
}

struct Fuse;

impl Transferable for Fuse {
    fn to_transferable(&self) -> Snapshot {
        Snapshot::new("Fuse").method("blow", |_, _| async move {
            if true {
                panic!("fuse blown");
            }
            Ok(Reply::from(Value::Null))
        })
    }
}

#[tokio::test]
async fn test_panicking_remote_method_is_remote_error() {
    let server = start_relay().await;
    let alpha = connect(&server, "alpha").await;
    let beta = connect(&server, "beta").await;
    beta.add_route("fuse", |_caller: String, _args: Map<String, Value>| async move {
        Ok(Reply::from(RemoteObject::new(&Fuse)))
    })
    .unwrap();

    let proxy = alpha
        .call("fuse", "beta", Value::Null)
        .await
        .unwrap()
        .into_object()
        .unwrap();
    match tokio::time::timeout(
        Duration::from_secs(2),
        proxy.call("blow", Vec::new(), Map::new()),
    )
    .await
    .expect("panicking method sent no reply")
    {
        Err(ClientError::Remote { message, .. }) => {
            assert!(message.contains("fuse blown"), "{message}")
        }
        other => panic!("Expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_timeout_then_late_response_is_harmless() {
    let server = start_relay().await;
    let alpha = connect(&server, "alpha").await;
    let beta = connect(&server, "beta").await;
    add_sum_route(&beta);
    beta.add_route("slow", |_caller: String, _args: Map<String, Value>| async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(Reply::from(json!("late")))
    })
    .unwrap();

    let err = alpha
        .call_with_timeout("slow", "beta", json!({}), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)));

    // The tardy reply surfaces as an error event, not a crash.
    match alpha
        .wait_for(EventKind::Error, Some(Duration::from_secs(3)))
        .await
        .unwrap()
    {
        Event::Error { message } => assert!(message.contains("No pending request"), "{message}"),
        other => panic!("Expected error event, got {other:?}"),
    }

    let still_works = alpha
        .call("sum", "beta", json!({ "a": 1, "b": 1 }))
        .await
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(still_works["sum"], json!(2));
}

#[tokio::test]
async fn test_close_fails_outstanding_call() {
    let server = start_relay().await;
    let alpha = connect(&server, "alpha").await;
    let beta = connect(&server, "beta").await;
    beta.add_route("hang", |_caller: String, _args: Map<String, Value>| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Reply::from(Value::Null))
    })
    .unwrap();

    let pending = tokio::spawn({
        let alpha = alpha.clone();
        async move { alpha.call("hang", "beta", json!({})).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    alpha.close().await;

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(ClientError::ConnectionLost)));
    assert_eq!(alpha.state(), ConnectionState::Disconnected);
    assert!(matches!(
        alpha.call("hang", "beta", json!({})).await,
        Err(ClientError::NotConnected)
    ));
}

#[tokio::test]
async fn test_request_event_dispatched() {
    let server = start_relay().await;
    let alpha = connect(&server, "alpha").await;
    let beta = connect(&server, "beta").await;
    add_sum_route(&beta);

    let (tx, mut rx) = mpsc::unbounded_channel();
    beta.on(EventKind::Request, move |event| {
        let tx = tx.clone();
        async move {
            tx.send(event).ok();
            Ok(())
        }
    });

    alpha.call("sum", "beta", json!({})).await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        Event::Request {
            route: "sum".to_string(),
            caller: "alpha".to_string()
        }
    );
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_start_twice_rejected() {
    let server = start_relay().await;
    let alpha = connect(&server, "alpha").await;
    assert!(matches!(alpha.start().await, Err(ClientError::AlreadyConnected)));

    let unnamed = Client::new(client_config(&server, ""));
    assert!(matches!(
        unnamed.start().await,
        Err(ClientError::InvalidArguments(_))
    ));
}

#[tokio::test]
async fn test_duplicate_name_held_then_promoted() {
    let server = start_relay().await;
    let first = connect(&server, "alpha").await;
    let beta = connect(&server, "beta").await;

    let second = Client::new(client_config(&server, "alpha"));
    second
        .add_route("which", |_caller: String, _args: Map<String, Value>| async move {
            Ok(Reply::from(json!("second")))
        })
        .unwrap();
    second.start().await.unwrap();
    eventually(|| second.is_on_hold()).await;

    assert!(matches!(
        second.call("which", "beta", json!({})).await,
        Err(ClientError::OnHold)
    ));

    first.close().await;
    tokio::time::timeout(Duration::from_secs(5), second.wait_until_ready())
        .await
        .unwrap()
        .unwrap();
    assert!(second.is_authorized());

    let answer = beta
        .call("which", "alpha", json!({}))
        .await
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(answer, json!("second"));
}

#[tokio::test]
async fn test_newer_duplicate_displaces_held_client() {
    let server = start_relay().await;
    let first = connect(&server, "alpha").await;

    let second = Client::new(client_config(&server, "alpha"));
    second.start().await.unwrap();
    eventually(|| second.is_on_hold()).await;

    let third = Client::new(client_config(&server, "alpha"));
    third.start().await.unwrap();
    eventually(|| third.is_on_hold()).await;
    eventually(|| second.state() == ConnectionState::Verifying).await;
    assert!(matches!(
        second.call("sum", "beta", json!({})).await,
        Err(ClientError::NotAuthorized)
    ));

    first.close().await;
    tokio::time::timeout(Duration::from_secs(5), third.wait_until_ready())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.state(), ConnectionState::Verifying);
}

#[tokio::test]
async fn test_ping_reflects_membership() {
    let server = start_relay().await;
    let alpha = connect(&server, "alpha").await;
    let beta = connect(&server, "beta").await;

    assert!(alpha.ping(Some("beta")).await);
    assert!(alpha.ping(None).await);
    assert!(!alpha.ping(Some("ghost")).await);
    assert!(alpha.peer("beta").ping().await);

    beta.close().await;
    let mut gone = false;
    for _ in 0..100 {
        if !alpha.ping(Some("beta")).await {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(gone, "beta still reported as connected");
}

#[tokio::test]
async fn test_client_listing() {
    let server = start_relay().await;
    let alpha = connect(&server, "alpha").await;
    let _gamma = connect(&server, "gamma").await;
    let _beta = connect(&server, "beta").await;

    assert_eq!(alpha.clients().await.unwrap(), vec!["alpha", "beta", "gamma"]);
}

// ---------------------------------------------------------------------------
// Broadcast
// ---------------------------------------------------------------------------

fn collect_information(client: &Client) -> mpsc::UnboundedReceiver<(Value, Option<String>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.on(EventKind::Information, move |event| {
        let tx = tx.clone();
        async move {
            if let Event::Information { data, sender } = event {
                tx.send((data, sender)).ok();
            }
            Ok(())
        }
    });
    rx
}

#[tokio::test]
async fn test_broadcast_reaches_every_other_client_once() {
    let server = start_relay().await;
    let alpha = connect(&server, "alpha").await;
    let beta = connect(&server, "beta").await;
    let gamma = connect(&server, "gamma").await;
    let mut at_alpha = collect_information(&alpha);
    let mut at_beta = collect_information(&beta);
    let mut at_gamma = collect_information(&gamma);

    alpha.broadcast(json!({ "hello": 1 }), &[]).unwrap();

    for rx in [&mut at_beta, &mut at_gamma] {
        let (data, sender) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data, json!({ "hello": 1 }));
        assert_eq!(sender.as_deref(), Some("alpha"));
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(at_alpha.try_recv().is_err());
    assert!(at_beta.try_recv().is_err());
    assert!(at_gamma.try_recv().is_err());
}

#[tokio::test]
async fn test_targeted_broadcast() {
    let server = start_relay().await;
    let alpha = connect(&server, "alpha").await;
    let beta = connect(&server, "beta").await;
    let gamma = connect(&server, "gamma").await;
    let mut at_beta = collect_information(&beta);
    let mut at_gamma = collect_information(&gamma);

    alpha.broadcast(json!("only beta"), &["beta"]).unwrap();
    alpha.peer("beta").inform(json!("again")).unwrap();

    let (first, _) = tokio::time::timeout(Duration::from_secs(2), at_beta.recv())
        .await
        .unwrap()
        .unwrap();
    let (second, _) = tokio::time::timeout(Duration::from_secs(2), at_beta.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, json!("only beta"));
    assert_eq!(second, json!("again"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(at_gamma.try_recv().is_err());
}

// ---------------------------------------------------------------------------
// Remote objects
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_remote_object_methods_run_in_origin() {
    let server = start_relay().await;
    let alpha = connect(&server, "alpha").await;
    let beta = connect(&server, "beta").await;
    add_counter_route(&beta, "counter", Duration::from_secs(30));

    let proxy = alpha
        .call("counter", "beta", Value::Null)
        .await
        .unwrap()
        .into_object()
        .expect("expected a remote object");
    assert_eq!(proxy.name(), "Counter");
    assert_eq!(proxy.source(), "beta");
    assert_eq!(proxy.attr("label"), Some(&json!("clicks")));
    assert_eq!(proxy.methods(), vec!["increment"]);
    assert!(!proxy.is_expired());

    let first = proxy.call("increment", vec![json!(2)], Map::new()).await.unwrap();
    assert_eq!(first.into_value(), Some(json!(2)));
    let second = proxy.call("increment", Vec::new(), Map::new()).await.unwrap();
    assert_eq!(second.into_value(), Some(json!(3)));

    assert!(matches!(
        proxy.call("get", Vec::new(), Map::new()).await,
        Err(ClientError::UnknownMethod(method)) if method == "get"
    ));
}

#[tokio::test]
async fn test_expired_remote_object_not_found() {
    let server = start_relay().await;
    let alpha = connect(&server, "alpha").await;
    let beta = connect(&server, "beta").await;
    add_counter_route(&beta, "short", Duration::from_millis(200));

    let proxy = alpha
        .call("short", "beta", Value::Null)
        .await
        .unwrap()
        .into_object()
        .unwrap();
    assert!(proxy.call("increment", Vec::new(), Map::new()).await.is_ok());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(proxy.is_expired());
    match proxy.call("increment", Vec::new(), Map::new()).await {
        Err(ClientError::Remote { message, .. }) => {
            assert_eq!(message, reason::FUNCTION_NOT_FOUND)
        }
        other => panic!("Expected not-found error, got {other:?}"),
    }
}
