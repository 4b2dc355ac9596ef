//! Integration tests for the Connection public interface.
//!
//! Two connections are wired together over an in-memory transport pair.
//! Tests that need to control exactly what the peer sends talk to the raw
//! transport end instead of a second connection.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use tandem_core::{
    CommandSignature, CommandTable, Connection, ConnectionBuilder, ConnectionConfig,
    ConnectionObserver, EventReceiver, MemoryTransport, NoResponseCause, Packet, PacketFactory,
    PacketKind, Phase, RemoteFailure, RpcError, Slot, Transport, TransportEvent,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Client and server connections over a linked pair.
fn connected_pair() -> (Connection, Connection) {
    init_tracing();
    let ((a, a_rx), (b, b_rx)) = MemoryTransport::pair("client", "server");
    a.connect();
    let client = Connection::builder(a, a_rx).start().unwrap();
    let server = Connection::builder(b, b_rx).start().unwrap();
    (client, server)
}

/// A client connection whose peer is a raw transport end driven by the test.
fn client_with_raw_peer(
    config: ConnectionConfig,
) -> (Connection, Arc<MemoryTransport>, MemoryTransport, EventReceiver) {
    init_tracing();
    let ((a, a_rx), (b, b_rx)) = MemoryTransport::pair("client", "server");
    a.connect();
    let a = Arc::new(a);
    let client = ConnectionBuilder::from_shared(a.clone(), a_rx)
        .config(config)
        .start()
        .unwrap();
    (client, a, b, b_rx)
}

/// Next packet delivered to a raw end, skipping connection events.
async fn next_packet(events: &mut EventReceiver) -> Packet {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for a packet")
            .expect("event channel closed");
        if let TransportEvent::MessageReceived(packet) = event {
            return packet;
        }
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl ConnectionObserver for Recorder {
    fn on_message_sent(&self, packet: &Packet) {
        self.push(format!("sent {} {}", packet.kind(), packet.command()));
    }

    fn on_message_received(&self, packet: &Packet) {
        self.push(format!("received {} {}", packet.kind(), packet.command()));
    }

    fn on_exception(&self, error: &RpcError) {
        self.push(format!("exception {}", error));
    }

    fn on_connected(&self) {
        self.push("connected".to_string());
    }

    fn on_disconnected(&self) {
        self.push("disconnected".to_string());
    }
}

/// Transport wrapper that counts `close` calls.
struct CountingTransport {
    inner: MemoryTransport,
    closes: AtomicUsize,
}

impl CountingTransport {
    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// A connected pair whose first end is wrapped in a `CountingTransport`.
/// The second end is returned raw so the test can drive it.
fn counting_end() -> (Arc<CountingTransport>, EventReceiver, MemoryTransport, EventReceiver) {
    init_tracing();
    let ((a, a_rx), (b, b_rx)) = MemoryTransport::pair("server", "client");
    a.connect();
    let transport = Arc::new(CountingTransport {
        inner: a,
        closes: AtomicUsize::new(0),
    });
    (transport, a_rx, b, b_rx)
}

/// Bind "Work" to a function that reports entry and then blocks its thread
/// until released. Returns the entry signal and the release handle.
fn bind_blocking_work(connection: &Connection) -> (mpsc::Receiver<()>, mpsc::Sender<()>) {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let latch = Mutex::new((entered_tx, release_rx));
    connection
        .register_function("Work", move |_| {
            let latch = latch.lock().unwrap();
            let _ = latch.0.send(());
            let _ = latch.1.recv();
            Ok(json!("done"))
        })
        .unwrap();
    (entered_rx, release_tx)
}

async fn wait_entered(entered: mpsc::Receiver<()>) {
    tokio::task::spawn_blocking(move || entered.recv_timeout(Duration::from_secs(2)))
        .await
        .unwrap()
        .expect("bound function never ran");
}

#[async_trait]
impl Transport for CountingTransport {
    async fn send(&self, packet: Packet) -> tandem_core::Result<()> {
        self.inner.send(packet).await
    }

    async fn close(&self) -> tandem_core::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await
    }

    fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    fn local_name(&self) -> &str {
        self.inner.local_name()
    }

    fn remote_name(&self) -> &str {
        self.inner.remote_name()
    }
}

// ========================================
// Calls
// ========================================

#[tokio::test]
async fn test_get_int_returns_21() {
    let (client, server) = connected_pair();
    server
        .register_function("GetInt", |_| Ok(json!(21)))
        .unwrap();

    let value: i32 = client.call_async("GetInt").await.unwrap();
    assert_eq!(value, 21);
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_calls_flow_both_ways() {
    let (client, server) = connected_pair();
    server
        .register_typed_function("Greet", |name: String| Ok(format!("hello {}", name)))
        .unwrap();
    client
        .register_typed_function("Double", |n: i64| Ok(n * 2))
        .unwrap();

    let greeting: String = client.call_async_with("Greet", "client").await.unwrap();
    let doubled: i64 = server.call_async_with("Double", &21).await.unwrap();
    assert_eq!(greeting, "hello client");
    assert_eq!(doubled, 42);
}

#[tokio::test]
async fn test_invoke_discards_result() {
    let (client, server) = connected_pair();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    server
        .register_function("Touch", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!("ignored"))
        })
        .unwrap();

    client.invoke_async("Touch").await.unwrap();
    client.invoke_async_with("Touch", &[1, 2, 3]).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_many_concurrent_calls_are_correlated() {
    let (client, server) = connected_pair();
    server
        .register_typed_function("Square", |n: u64| Ok(n * n))
        .unwrap();

    let calls: Vec<_> = (0..50u64)
        .map(|n| {
            let client = client.clone();
            tokio::spawn(async move { (n, client.call_async_with::<_, u64>("Square", &n).await) })
        })
        .collect();

    for call in calls {
        let (n, result) = call.await.unwrap();
        assert_eq!(result.unwrap(), n * n);
    }
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_call_from_blocking_thread() {
    let (client, server) = connected_pair();
    server
        .register_function("GetInt", |_| Ok(json!(21)))
        .unwrap();

    let blocking = client.clone();
    let value = tokio::task::spawn_blocking(move || {
        blocking.invoke("GetInt")?;
        blocking.call_with::<_, i32>("GetInt", &Value::Null)
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(value, 21);
}

#[tokio::test]
async fn test_nested_blocking_call_on_current_thread_fails_fast() {
    let (client, server) = connected_pair();
    client.register_function("Inner", |_| Ok(json!(21))).unwrap();
    let nested = server.clone();
    server
        .register_function("Outer", move |_| {
            nested
                .call::<i32>("Inner")
                .map(|value| json!(value * 2))
                .map_err(|e| e.to_remote_failure())
        })
        .unwrap();

    let err = tokio::time::timeout(Duration::from_secs(2), client.call_async::<i32>("Outer"))
        .await
        .expect("nested call stalled the runtime")
        .unwrap_err();
    match err {
        RpcError::RemoteFailure { failure, .. } => assert_eq!(failure.kind, "would_block"),
        other => panic!("Expected RemoteFailure, got: {:?}", other),
    }

    // The runtime is still usable afterwards.
    server.register_function("GetInt", |_| Ok(json!(21))).unwrap();
    assert_eq!(client.call_async::<i32>("GetInt").await.unwrap(), 21);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_nested_blocking_call_on_multi_thread_completes() {
    let (client, server) = connected_pair();
    client.register_function("Inner", |_| Ok(json!(21))).unwrap();
    let nested = server.clone();
    server
        .register_function("Outer", move |_| {
            nested
                .call::<i32>("Inner")
                .map(|value| json!(value * 2))
                .map_err(|e| e.to_remote_failure())
        })
        .unwrap();

    let value = tokio::time::timeout(Duration::from_secs(2), client.call_async::<i32>("Outer"))
        .await
        .expect("nested call deadlocked")
        .unwrap();
    assert_eq!(value, 42);
}

// ========================================
// Timeouts and no-response outcomes
// ========================================

#[tokio::test(start_paused = true)]
async fn test_missing_times_out_and_leaves_table_empty() {
    let (client, _peer, _b, _b_rx) =
        client_with_raw_peer(ConnectionConfig::new().with_response_timeout_ms(200));

    let started = tokio::time::Instant::now();
    let err = client.call_async::<i32>("Missing").await.unwrap_err();

    assert!(err.is_timeout(), "expected timeout, got: {:?}", err);
    assert!(!err.is_remote_failure());
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_zero_timeout_fails_even_with_instant_responder() {
    let (client, server) = connected_pair();
    server
        .register_function("GetInt", |_| Ok(json!(21)))
        .unwrap();
    client.set_response_timeout_ms(0);

    let err = client.call_async::<i32>("GetInt").await.unwrap_err();
    assert_eq!(
        err.no_response_cause(),
        Some(&NoResponseCause::Timeout(Duration::ZERO))
    );
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_response_before_deadline_succeeds_and_late_one_is_dropped() {
    let (client, _peer, b, mut b_rx) =
        client_with_raw_peer(ConnectionConfig::new().with_response_timeout_ms(100));
    let responder = PacketFactory::seeded(0);

    // Answered in time.
    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call_async::<i32>("Fast").await })
    };
    let command = next_packet(&mut b_rx).await;
    b.send(responder.create_response_with(&command, json!(1)))
        .await
        .unwrap();
    assert_eq!(call.await.unwrap().unwrap(), 1);

    // Answered after the deadline.
    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call_async::<i32>("Slow").await })
    };
    let command = next_packet(&mut b_rx).await;
    assert!(call.await.unwrap().unwrap_err().is_timeout());
    b.send(responder.create_response_with(&command, json!(2)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.pending_count(), 0);
    assert!(client.is_running());
}

#[tokio::test]
async fn test_disconnect_cancels_every_in_flight_call() {
    let (client, a, _b, mut b_rx) = client_with_raw_peer(ConnectionConfig::new());

    let calls: Vec<_> = (0..3)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.call_async::<i32>(&format!("Hang{}", i)).await })
        })
        .collect();
    for _ in 0..3 {
        next_packet(&mut b_rx).await;
    }
    wait_until(|| client.pending_count() == 3).await;

    a.disconnect();

    for call in calls {
        let err = call.await.unwrap().unwrap_err();
        assert!(err.is_no_response());
        assert!(!err.is_remote_failure());
        assert_eq!(err.no_response_cause(), Some(&NoResponseCause::Disconnected));
    }
    assert_eq!(client.pending_count(), 0);
    wait_until(|| client.connection_count() == 0).await;
}

#[tokio::test]
async fn test_transport_exception_faults_pending_calls() {
    let (client, a, _b, mut b_rx) = client_with_raw_peer(ConnectionConfig::new());

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.invoke_async("Hang").await })
    };
    next_packet(&mut b_rx).await;
    wait_until(|| client.pending_count() == 1).await;

    a.raise_exception("socket reset");

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(
        err.no_response_cause(),
        Some(&NoResponseCause::TransportFault("socket reset".into()))
    );
    let message = client.failed_once().await.unwrap();
    assert!(message.contains("socket reset"));
}

#[tokio::test]
async fn test_clear_and_fail_pending() {
    let (client, _a, _b, mut b_rx) = client_with_raw_peer(ConnectionConfig::new());

    let cleared = {
        let client = client.clone();
        tokio::spawn(async move { client.invoke_async("First").await })
    };
    next_packet(&mut b_rx).await;
    wait_until(|| client.pending_count() == 1).await;
    assert_eq!(client.clear_pending(), 1);
    assert_eq!(
        cleared.await.unwrap().unwrap_err().no_response_cause(),
        Some(&NoResponseCause::Cancelled)
    );

    let failed = {
        let client = client.clone();
        tokio::spawn(async move { client.invoke_async("Second").await })
    };
    next_packet(&mut b_rx).await;
    wait_until(|| client.pending_count() == 1).await;
    assert_eq!(client.fail_pending(RemoteFailure::new("shutdown", "bye")), 1);
    match failed.await.unwrap().unwrap_err() {
        RpcError::RemoteFailure { command, failure } => {
            assert_eq!(command, "Second");
            assert_eq!(failure.kind, "shutdown");
        }
        other => panic!("Expected RemoteFailure, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_response_cancellation_is_no_response() {
    let (client, _a, b, mut b_rx) = client_with_raw_peer(ConnectionConfig::new());
    let responder = PacketFactory::seeded(0);

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.invoke_async("Busy").await })
    };
    let command = next_packet(&mut b_rx).await;
    b.send(responder.create_response_cancellation(&command, Some("overloaded".into())))
        .await
        .unwrap();

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(
        err.no_response_cause(),
        Some(&NoResponseCause::RemoteCancelled(Some("overloaded".into())))
    );
}

// ========================================
// Inbound dispatch
// ========================================

#[tokio::test]
async fn test_failing_and_panicking_functions_reply_once() {
    init_tracing();
    let ((a, mut a_rx), (b, b_rx)) = MemoryTransport::pair("client", "server");
    a.connect();
    let server = Connection::builder(b, b_rx).start().unwrap();
    server
        .register_function("Fail", |_| Err(RemoteFailure::new("boom", "always fails")))
        .unwrap();
    server
        .register_function("Panic", |_| panic!("kaboom"))
        .unwrap();
    let factory = PacketFactory::seeded(500);

    for (name, kind) in [("Fail", "boom"), ("Panic", "panic")] {
        let command = factory.create_command(name);
        a.send(command.clone()).await.unwrap();

        let reply = next_packet(&mut a_rx).await;
        assert_eq!(reply.id(), command.id());
        assert_eq!(reply.kind(), PacketKind::ResponseFailure);
        assert_eq!(reply.failure().unwrap().kind, kind);
    }

    // Nothing else arrives, and the server keeps serving.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(a_rx.try_recv().is_err());
    server.register_function("Ok", |_| Ok(json!(true))).unwrap();
    let command = factory.create_command("Ok");
    a.send(command.clone()).await.unwrap();
    assert_eq!(next_packet(&mut a_rx).await.kind(), PacketKind::Response);
}

#[tokio::test]
async fn test_remote_failure_reaches_caller() {
    let (client, server) = connected_pair();
    server
        .register_function("Divide", |_| {
            Err(RemoteFailure::new("division_by_zero", "denominator was 0"))
        })
        .unwrap();

    let err = client.call_async::<f64>("Divide").await.unwrap_err();
    assert!(err.is_remote_failure());
    assert!(!err.is_no_response());
}

#[tokio::test]
async fn test_unknown_command_is_reported_on_both_sides() {
    let (client, server) = connected_pair();

    let err = client.invoke_async("Nope").await.unwrap_err();
    match err {
        RpcError::RemoteFailure { failure, .. } => assert_eq!(failure.kind, "unknown_command"),
        other => panic!("Expected RemoteFailure, got: {:?}", other),
    }
    let message = server.failed_once().await.unwrap();
    assert!(message.contains("Nope"));
}

#[tokio::test]
async fn test_fallback_command_table() {
    const DIV_REM: CommandSignature = CommandSignature::new(
        "DivRem",
        &[
            Slot::output("quotient"),
            Slot::input("dividend"),
            Slot::input("divisor"),
            Slot::output("remainder"),
        ],
    );
    init_tracing();
    let ((a, a_rx), (b, b_rx)) = MemoryTransport::pair("client", "server");
    a.connect();
    let table = CommandTable::new().with_command(DIV_REM, |args| {
        let a = args[0].as_i64().unwrap_or(0);
        let b = args[1].as_i64().unwrap_or(1);
        Ok(vec![json!(a / b), json!(a % b)])
    });
    let _server = Connection::builder(b, b_rx).fallback(table).start().unwrap();
    let client = Connection::builder(a, a_rx).start().unwrap();

    let results = client
        .call_signature_async(&DIV_REM, vec![json!(17), json!(5)])
        .await
        .unwrap();
    assert_eq!(results, vec![json!(3), json!(2)]);
}

#[tokio::test]
async fn test_registry_takes_precedence_over_fallback() {
    const WHO: CommandSignature = CommandSignature::new("Who", &[Slot::output("name")]);
    init_tracing();
    let ((a, a_rx), (b, b_rx)) = MemoryTransport::pair("client", "server");
    a.connect();
    let table = CommandTable::new().with_command(WHO, |_| Ok(vec![json!("table")]));
    let server = Connection::builder(b, b_rx).fallback(table).start().unwrap();
    let client = Connection::builder(a, a_rx).start().unwrap();

    let name: String = client.call_async("Who").await.unwrap();
    assert_eq!(name, "table");

    server.register_function("Who", |_| Ok(json!("registry"))).unwrap();
    let name: String = client.call_async("Who").await.unwrap();
    assert_eq!(name, "registry");

    assert!(server.remove_function("Who"));
    let name: String = client.call_async("Who").await.unwrap();
    assert_eq!(name, "table");
}

#[tokio::test]
async fn test_observer_sees_traffic_in_order() {
    init_tracing();
    let ((a, a_rx), (b, b_rx)) = MemoryTransport::pair("client", "server");
    let client_log = Arc::new(Recorder::default());
    let server_log = Arc::new(Recorder::default());

    let server = Connection::builder(b, b_rx)
        .observer(server_log.clone())
        .start()
        .unwrap();
    server.register_function("GetInt", |_| Ok(json!(21))).unwrap();
    a.connect();
    let client = Connection::builder(a, a_rx)
        .observer(client_log.clone())
        .start()
        .unwrap();

    client.connected_once().await.unwrap();
    let _: i32 = client.call_async("GetInt").await.unwrap();
    wait_until(|| server_log.events().len() == 3).await;

    assert_eq!(
        client_log.events(),
        vec![
            "connected".to_string(),
            "sent command GetInt".to_string(),
            "received response GetInt".to_string(),
        ]
    );
    assert_eq!(
        server_log.events(),
        vec![
            "connected".to_string(),
            "received command GetInt".to_string(),
            "sent response GetInt".to_string(),
        ]
    );
}

// ========================================
// Disposal
// ========================================

#[tokio::test]
async fn test_dispose_fails_in_flight_call_and_is_idempotent() {
    let (client, _a, _b, mut b_rx) = client_with_raw_peer(ConnectionConfig::new());

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call_async::<i32>("Hang").await })
    };
    next_packet(&mut b_rx).await;
    wait_until(|| client.pending_count() == 1).await;

    client.dispose_async().await.unwrap();
    let err = call.await.unwrap().unwrap_err();
    assert!(err.is_disposed());
    assert_eq!(err.no_response_cause(), Some(&NoResponseCause::Disposed));

    client.dispose_async().await.unwrap();
    client.dispose().unwrap();
    client.cancel().unwrap();
    assert_eq!(client.state().phase, Phase::Disposed);
    assert!(!client.is_running());
}

#[tokio::test]
async fn test_calls_after_dispose_fail_fast() {
    let (client, server) = connected_pair();
    server.register_function("GetInt", |_| Ok(json!(21))).unwrap();
    client.dispose_async().await.unwrap();

    let err = client.call_async::<i32>("GetInt").await.unwrap_err();
    assert!(matches!(err, RpcError::Disposed));
    assert!(matches!(
        client.connected_once().await,
        Err(RpcError::Disposed)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dispose_tears_down_once() {
    init_tracing();
    let ((a, a_rx), (_b, _b_rx)) = MemoryTransport::pair("client", "server");
    a.connect();
    let transport = Arc::new(CountingTransport {
        inner: a,
        closes: AtomicUsize::new(0),
    });
    let client = ConnectionBuilder::from_shared(transport.clone(), a_rx)
        .start()
        .unwrap();

    let tasks = vec![
        {
            let client = client.clone();
            tokio::spawn(async move { client.dispose() })
        },
        {
            let client = client.clone();
            tokio::spawn(async move { client.dispose_async().await })
        },
        {
            let client = client.clone();
            tokio::spawn(async move { client.cancel() })
        },
    ];
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    client.disposed().await;

    let state = client.state();
    assert_eq!(state.phase, Phase::Disposed);
    assert!(state.queued.len() <= 2);
    assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_repeated_sync_dispose_is_ok() {
    let (transport, events, _peer, _peer_rx) = counting_end();
    let client = ConnectionBuilder::from_shared(transport.clone(), events)
        .start()
        .unwrap();

    client.dispose().unwrap();
    client.dispose().unwrap();

    // A current-thread runtime gets no chance to run until the test yields,
    // so the connection is visibly between the two halves of teardown.
    let state = client.state();
    assert!(state.phase.is_tearing_down());
    assert!(state.queued.is_empty());
    assert!(!client.is_running());
    assert_eq!(transport.closes(), 0);

    client.disposed().await;
    assert_eq!(client.state().phase, Phase::Disposed);
    assert_eq!(transport.closes(), 1);
    client.dispose().unwrap();
    assert_eq!(transport.closes(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispose_on_multi_thread_worker_waits_for_close() {
    let (transport, events, _peer, _peer_rx) = counting_end();
    let client = ConnectionBuilder::from_shared(transport.clone(), events)
        .start()
        .unwrap();
    client.register_function("GetInt", |_| Ok(json!(21))).unwrap();

    client.dispose().unwrap();
    assert_eq!(client.state().phase, Phase::Disposed);
    assert_eq!(transport.closes(), 1);
    assert!(client.function_names().is_empty());
    assert!(!client.is_running());
}

#[test]
fn test_dispose_from_plain_thread_waits_for_close() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let (transport, events, _peer, _peer_rx) = counting_end();
    let client = {
        let _entered = runtime.enter();
        ConnectionBuilder::from_shared(transport.clone(), events)
            .start()
            .unwrap()
    };

    let disposer = client.clone();
    std::thread::spawn(move || disposer.dispose())
        .join()
        .unwrap()
        .unwrap();
    assert_eq!(client.state().phase, Phase::Disposed);
    assert_eq!(transport.closes(), 1);

    // Blocking calls on a disposed connection fail before reaching the runtime.
    assert!(matches!(client.invoke("GetInt"), Err(RpcError::Disposed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dispose_waits_for_running_dispatch() {
    let (transport, events, peer, _peer_rx) = counting_end();
    let server = ConnectionBuilder::from_shared(transport.clone(), events)
        .start()
        .unwrap();
    let (entered, release) = bind_blocking_work(&server);

    peer.send(PacketFactory::seeded(1).create_command("Work"))
        .await
        .unwrap();
    wait_entered(entered).await;

    let disposing = {
        let server = server.clone();
        tokio::spawn(async move { server.dispose_async().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.state().phase.is_tearing_down());
    assert_eq!(transport.closes(), 0);
    assert!(!disposing.is_finished());

    release.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), disposing)
        .await
        .expect("teardown did not finish after the function returned")
        .unwrap()
        .unwrap();
    assert_eq!(server.state().phase, Phase::Disposed);
    assert_eq!(transport.closes(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dispose_gives_up_on_stuck_dispatch_after_drain_timeout() {
    let (transport, events, peer, _peer_rx) = counting_end();
    let server = ConnectionBuilder::from_shared(transport.clone(), events)
        .config(ConnectionConfig::new().with_dispose_drain_timeout(Duration::from_millis(50)))
        .start()
        .unwrap();
    let (entered, release) = bind_blocking_work(&server);

    peer.send(PacketFactory::seeded(1).create_command("Work"))
        .await
        .unwrap();
    wait_entered(entered).await;

    tokio::time::timeout(Duration::from_secs(2), server.dispose_async())
        .await
        .expect("teardown waited past its drain bound")
        .unwrap();
    assert_eq!(server.state().phase, Phase::Disposed);
    assert_eq!(transport.closes(), 1);

    release.send(()).unwrap();
}

#[tokio::test]
async fn test_dropping_last_handle_finalizes() {
    init_tracing();
    let ((a, a_rx), (_b, _b_rx)) = MemoryTransport::pair("client", "server");
    a.connect();
    let transport = Arc::new(CountingTransport {
        inner: a,
        closes: AtomicUsize::new(0),
    });
    let client = ConnectionBuilder::from_shared(transport.clone(), a_rx)
        .start()
        .unwrap();
    let clone = client.clone();

    drop(client);
    tokio::task::yield_now().await;
    assert_eq!(transport.closes.load(Ordering::SeqCst), 0);

    drop(clone);
    wait_until(|| transport.closes.load(Ordering::SeqCst) == 1).await;
}

#[test]
fn test_dropping_last_handle_off_runtime_thread_closes_transport() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let (transport, events, _peer, _peer_rx) = counting_end();
    let client = {
        let _entered = runtime.enter();
        ConnectionBuilder::from_shared(transport.clone(), events)
            .start()
            .unwrap()
    };

    std::thread::spawn(move || drop(client)).join().unwrap();
    runtime.block_on(wait_until(|| transport.closes() == 1));
}
