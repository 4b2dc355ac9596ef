//! Connection: the call façade and event loop over one transport.
//!
//! A `Connection` owns a transport, a pending-call table, a function
//! registry and a dispatcher. Outbound calls are correlated by packet id;
//! inbound packets are dispatched each on their own task.
//!
//! # Thread Safety
//!
//! `Connection` is a cheap `Clone` handle. All clones share state; the last
//! clone to drop finalizes the connection if it was not disposed explicitly.

use crate::binding::{CommandSignature, FallbackDispatch};
use crate::cancel::LifetimeToken;
use crate::config::{ConnectionConfig, ResponseTimeout, RpcConfig};
use crate::dispatch::{Dispatcher, Routed};
use crate::error::{NoResponseCause, RemoteFailure, Result, RpcError};
use crate::factory::PacketFactory;
use crate::lifecycle::{DisposeKind, Lifecycle, LifecycleSnapshot, TaskGate, Transition};
use crate::observer::{ConnectionObserver, NoopObserver, OnceSignal};
use crate::packet::Packet;
use crate::pending::{CallOutcome, PendingCallTable};
use crate::registry::FunctionRegistry;
use crate::transport::{EventReceiver, Transport, TransportEvent};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Builder for a [`Connection`].
///
/// # Example
///
/// ```rust,ignore
/// let ((transport, events), _peer) = MemoryTransport::pair("client", "server");
/// let connection = Connection::builder(transport, events)
///     .config(ConnectionConfig::new().with_response_timeout_ms(5_000))
///     .start()?;
/// ```
pub struct ConnectionBuilder {
    transport: Arc<dyn Transport>,
    events: EventReceiver,
    config: ConnectionConfig,
    observer: Arc<dyn ConnectionObserver>,
    fallback: Option<Arc<dyn FallbackDispatch>>,
}

impl ConnectionBuilder {
    /// Create a builder over a transport and the receiver of its events.
    pub fn new<T: Transport>(transport: T, events: EventReceiver) -> Self {
        Self {
            transport: Arc::new(transport),
            events,
            config: ConnectionConfig::default(),
            observer: Arc::new(NoopObserver),
            fallback: None,
        }
    }

    /// Use an already shared transport.
    pub fn from_shared(transport: Arc<dyn Transport>, events: EventReceiver) -> Self {
        Self {
            transport,
            events,
            config: ConnectionConfig::default(),
            observer: Arc::new(NoopObserver),
            fallback: None,
        }
    }

    /// Replace the default configuration.
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Observe traffic and connection changes.
    pub fn observer<O: ConnectionObserver>(mut self, observer: Arc<O>) -> Self {
        self.observer = observer;
        self
    }

    /// Handle commands the function registry does not know.
    pub fn fallback<F: FallbackDispatch>(mut self, fallback: F) -> Self {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    /// Start the connection's event loop on the current tokio runtime.
    pub fn start(self) -> Result<Connection> {
        let runtime = Handle::try_current().map_err(|_| {
            RpcError::Internal("a connection must be started inside a tokio runtime".into())
        })?;

        let pending = Arc::new(PendingCallTable::new());
        let registry = Arc::new(FunctionRegistry::new());
        let factory = Arc::new(match self.config.id_seed {
            Some(seed) => PacketFactory::seeded(seed),
            None => PacketFactory::new(),
        });
        let mut dispatcher = Dispatcher::new(pending.clone(), registry.clone(), factory.clone());
        if let Some(fallback) = self.fallback {
            dispatcher = dispatcher.with_fallback(fallback);
        }

        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            response_timeout_ms: AtomicI64::new(self.config.response_timeout_ms),
            drain_timeout: self.config.dispose_drain_timeout(),
            transport: self.transport,
            pending,
            registry,
            factory,
            dispatcher,
            observer: self.observer,
            lifecycle: Lifecycle::new(),
            token: LifetimeToken::new(),
            gate: Arc::new(TaskGate::new()),
            connection_count: AtomicUsize::new(0),
            connected: OnceSignal::new(),
            failed: OnceSignal::new(),
            disposed: OnceSignal::new(),
            runtime: runtime.clone(),
        });

        let event_task = runtime.spawn(run_event_loop(shared.clone(), self.events));
        info!(
            "Connection {} started ({} -> {})",
            shared.id,
            shared.transport.local_name(),
            shared.transport.remote_name()
        );

        Ok(Connection {
            inner: Arc::new(ConnectionInner {
                shared,
                event_task: Mutex::new(Some(event_task)),
            }),
        })
    }
}

/// State shared by the façade, the event loop and dispatch tasks.
struct Shared {
    id: Uuid,
    response_timeout_ms: AtomicI64,
    drain_timeout: Duration,
    transport: Arc<dyn Transport>,
    pending: Arc<PendingCallTable>,
    registry: Arc<FunctionRegistry>,
    factory: Arc<PacketFactory>,
    dispatcher: Dispatcher,
    observer: Arc<dyn ConnectionObserver>,
    lifecycle: Lifecycle,
    token: LifetimeToken,
    gate: Arc<TaskGate>,
    connection_count: AtomicUsize,
    connected: OnceSignal<()>,
    failed: OnceSignal<String>,
    disposed: OnceSignal<()>,
    runtime: Handle,
}

struct ConnectionInner {
    shared: Arc<Shared>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

/// A bidirectional RPC connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = &self.inner.shared;
        f.debug_struct("Connection")
            .field("id", &shared.id)
            .field("local_name", &shared.transport.local_name())
            .field("remote_name", &shared.transport.remote_name())
            .field("phase", &shared.lifecycle.phase())
            .field("pending", &shared.pending.len())
            .finish()
    }
}

enum SendWake {
    Sent(Result<()>),
    Expired,
    Shutdown,
}

enum WaitWake {
    Settled(CallOutcome),
    Expired,
    Shutdown,
}

async fn run_event_loop(shared: Arc<Shared>, mut events: EventReceiver) {
    loop {
        let event = tokio::select! {
            _ = shared.token.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => {
                    debug!("Connection {}: transport event channel closed", shared.id);
                    break;
                }
            },
        };
        Shared::handle_event(&shared, event);
    }
    debug!("Connection {}: event loop stopped", shared.id);
}

impl Shared {
    fn handle_event(this: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::MessageReceived(packet) => {
                this.observer.on_message_received(&packet);
                let Some(guard) = TaskGate::enter(&this.gate) else {
                    debug!("Connection {}: ignoring {} during teardown", this.id, packet);
                    return;
                };
                let shared = this.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    shared.dispatch(packet).await;
                });
            }
            TransportEvent::ExceptionOccurred(message) => {
                error!("Connection {}: transport fault: {}", this.id, message);
                this.report_exception(&RpcError::transport(message.clone()));
                this.pending
                    .cancel_all(NoResponseCause::TransportFault(message));
            }
            TransportEvent::Connected => {
                let count = this.connection_count.fetch_add(1, Ordering::SeqCst) + 1;
                info!(
                    "Connection {}: peer '{}' connected (count {})",
                    this.id,
                    this.transport.remote_name(),
                    count
                );
                this.observer.on_connected();
                this.connected.set(());
            }
            TransportEvent::Disconnected => {
                let _ = this
                    .connection_count
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
                info!(
                    "Connection {}: peer '{}' disconnected",
                    this.id,
                    this.transport.remote_name()
                );
                this.pending.cancel_all(NoResponseCause::Disconnected);
                this.observer.on_disconnected();
            }
        }
    }

    async fn dispatch(&self, packet: Packet) {
        match self.dispatcher.route(packet).await {
            Routed::Reply(reply) => self.send_reply(reply).await,
            Routed::Unhandled { error, reply } => {
                self.report_exception(&error);
                self.send_reply(reply).await;
            }
            Routed::Resolved { .. } | Routed::Dropped { .. } => {}
        }
    }

    async fn send_reply(&self, reply: Packet) {
        let sent = reply.clone();
        tokio::select! {
            _ = self.token.cancelled() => {
                debug!("Connection {}: reply {} abandoned on shutdown", self.id, sent);
            }
            result = self.transport.send(reply) => match result {
                Ok(()) => self.observer.on_message_sent(&sent),
                Err(e) => warn!("Connection {}: failed to send {}: {}", self.id, sent, e),
            },
        }
    }

    fn report_exception(&self, error: &RpcError) {
        self.observer.on_exception(error);
        self.failed.set(error.to_string());
    }

    async fn call(&self, name: &str, parameter: Value) -> Result<Value> {
        self.lifecycle.ensure_active()?;
        if name.is_empty() || name.len() > RpcConfig::MAX_COMMAND_NAME_LEN {
            return Err(RpcError::InvalidArguments {
                command: name.to_string(),
                message: format!(
                    "command names must be 1 to {} bytes",
                    RpcConfig::MAX_COMMAND_NAME_LEN
                ),
            });
        }

        let command = self.factory.create_command_with(name, parameter);
        let id = command.id();
        let mut call = self.pending.register(id)?;

        let timeout = ResponseTimeout::from_millis(self.response_timeout_ms.load(Ordering::SeqCst));
        let limit = timeout.as_duration().unwrap_or_default();
        let deadline = match timeout {
            ResponseTimeout::Immediate => {
                self.pending.remove(id);
                return Err(RpcError::no_response(name, NoResponseCause::Timeout(limit)));
            }
            ResponseTimeout::After(after) => Some(Instant::now() + after),
            ResponseTimeout::Infinite => None,
        };
        let expired = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expired);

        let sent = command.clone();
        let wake = tokio::select! {
            biased;
            _ = self.token.cancelled() => SendWake::Shutdown,
            _ = &mut expired => SendWake::Expired,
            result = self.transport.send(command) => SendWake::Sent(result),
        };
        match wake {
            SendWake::Sent(Ok(())) => self.observer.on_message_sent(&sent),
            SendWake::Sent(Err(e)) => {
                self.pending.remove(id);
                debug!("Connection {}: send of {} failed: {}", self.id, sent, e);
                return Err(e);
            }
            SendWake::Expired => {
                self.pending.remove(id);
                return Err(RpcError::no_response(name, NoResponseCause::Timeout(limit)));
            }
            SendWake::Shutdown => {
                self.pending.remove(id);
                return Err(RpcError::no_response(name, NoResponseCause::Disposed));
            }
        }

        let wake = tokio::select! {
            biased;
            outcome = call.outcome() => WaitWake::Settled(outcome),
            _ = &mut expired => WaitWake::Expired,
            _ = self.token.cancelled() => WaitWake::Shutdown,
        };
        // If removal fails the slot was settled concurrently; take that outcome.
        let outcome = match wake {
            WaitWake::Settled(outcome) => outcome,
            WaitWake::Expired if self.pending.remove(id) => {
                debug!("Connection {}: {} timed out after {:?}", self.id, sent, limit);
                CallOutcome::Cancelled(NoResponseCause::Timeout(limit))
            }
            WaitWake::Shutdown if self.pending.remove(id) => {
                CallOutcome::Cancelled(NoResponseCause::Disposed)
            }
            WaitWake::Expired | WaitWake::Shutdown => call.outcome().await,
        };

        match outcome {
            CallOutcome::Completed(value) => Ok(value),
            CallOutcome::Cancelled(cause) => Err(RpcError::no_response(name, cause)),
            CallOutcome::Failed(failure) => Err(RpcError::RemoteFailure {
                command: name.to_string(),
                failure,
            }),
        }
    }

    /// Synchronous half of teardown; safe to run from `Drop`.
    fn shutdown_now(&self, kind: DisposeKind) {
        info!("Connection {}: {:?} teardown started", self.id, kind);
        self.pending.close();
        self.pending.cancel_all(NoResponseCause::Disposed);
        self.token.cancel();
        self.gate.close();
    }

    /// Spawn the asynchronous half of teardown on the connection's runtime.
    fn spawn_completion(self: &Arc<Self>) -> JoinHandle<()> {
        let completion = Completion {
            shared: self.clone(),
            done: false,
        };
        self.runtime.spawn(completion.run())
    }

    /// Asynchronous half of teardown: drain dispatch tasks, then close the transport.
    async fn complete_teardown(&self) {
        if tokio::time::timeout(self.drain_timeout, self.gate.drained())
            .await
            .is_err()
        {
            warn!(
                "Connection {}: {} dispatch task(s) still running after {:?}",
                self.id,
                self.gate.active(),
                self.drain_timeout
            );
        }
        if let Err(e) = self.transport.close().await {
            warn!("Connection {}: failed to close transport: {}", self.id, e);
        }
        self.finish_teardown();
    }

    fn finish_teardown(&self) {
        self.registry.clear();
        self.lifecycle.finish();
        self.disposed.set(());
        info!("Connection {}: disposed", self.id);
    }
}

/// Owns the asynchronous half of teardown.
///
/// A runtime that shuts down drops its tasks, possibly before they were
/// ever polled. Teardown is then still marked complete so `disposed()`
/// waiters wake up.
struct Completion {
    shared: Arc<Shared>,
    done: bool,
}

impl Completion {
    async fn run(mut self) {
        self.shared.complete_teardown().await;
        self.done = true;
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.done {
            warn!(
                "Connection {}: runtime stopped during teardown; transport may be left open",
                self.shared.id
            );
            self.shared.finish_teardown();
        }
    }
}

impl ConnectionInner {
    fn abort_event_loop(&self) {
        let task = self
            .event_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Run the synchronous steps and hand the rest to the runtime.
    ///
    /// Only the caller that won [`Lifecycle::begin`] may call this.
    fn start_teardown(&self, kind: DisposeKind) -> JoinHandle<()> {
        self.shared.shutdown_now(kind);
        self.abort_event_loop();
        let completion = self.shared.spawn_completion();
        self.shared.lifecycle.release();
        completion
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        // The last handle may drop on any thread, so completion goes to the
        // connection's own runtime rather than whatever is current here.
        if let Ok(Transition::Won) = self.shared.lifecycle.begin(DisposeKind::Finalize) {
            self.start_teardown(DisposeKind::Finalize);
        }
    }
}

impl Connection {
    /// Start building a connection over `transport`.
    pub fn builder<T: Transport>(transport: T, events: EventReceiver) -> ConnectionBuilder {
        ConnectionBuilder::new(transport, events)
    }

    // ========================================
    // Async calls
    // ========================================

    /// Call `name` with no parameter and decode the result.
    pub async fn call_async<TOut: DeserializeOwned>(&self, name: &str) -> Result<TOut> {
        let value = self.call_value_async(name, Value::Null).await?;
        decode(name, value)
    }

    /// Call `name` with a parameter and decode the result.
    pub async fn call_async_with<TIn, TOut>(&self, name: &str, parameter: &TIn) -> Result<TOut>
    where
        TIn: Serialize + ?Sized,
        TOut: DeserializeOwned,
    {
        let parameter = encode(name, parameter)?;
        let value = self.call_value_async(name, parameter).await?;
        decode(name, value)
    }

    /// Call `name` and ignore the result value.
    pub async fn invoke_async(&self, name: &str) -> Result<()> {
        self.call_value_async(name, Value::Null).await.map(|_| ())
    }

    /// Call `name` with a parameter and ignore the result value.
    pub async fn invoke_async_with<TIn: Serialize + ?Sized>(
        &self,
        name: &str,
        parameter: &TIn,
    ) -> Result<()> {
        let parameter = encode(name, parameter)?;
        self.call_value_async(name, parameter).await.map(|_| ())
    }

    /// Untyped call.
    pub async fn call_value_async(&self, name: &str, parameter: Value) -> Result<Value> {
        self.inner.shared.call(name, parameter).await
    }

    /// Call a command described by a signature.
    ///
    /// `args` holds one value per input slot; the result holds one value per
    /// output slot.
    pub async fn call_signature_async(
        &self,
        signature: &CommandSignature,
        args: Vec<Value>,
    ) -> Result<Vec<Value>> {
        let parameter = signature.pack_args(args)?;
        let value = self.call_value_async(signature.name, parameter).await?;
        signature.unpack_results(value)
    }

    // ========================================
    // Blocking calls
    // ========================================

    /// Blocking form of [`Connection::call_async`].
    ///
    /// Runs the call on the connection's runtime and parks the current
    /// thread. On a multi-thread runtime worker, including inside a bound
    /// function, the worker is handed off with `block_in_place` first. On a
    /// thread driving a current-thread runtime this fails with
    /// `WouldBlock` instead of deadlocking.
    pub fn call<TOut: DeserializeOwned>(&self, name: &str) -> Result<TOut> {
        let value = self.block_on_call(name, Value::Null)?;
        decode(name, value)
    }

    /// Blocking form of [`Connection::call_async_with`].
    pub fn call_with<TIn, TOut>(&self, name: &str, parameter: &TIn) -> Result<TOut>
    where
        TIn: Serialize + ?Sized,
        TOut: DeserializeOwned,
    {
        let parameter = encode(name, parameter)?;
        let value = self.block_on_call(name, parameter)?;
        decode(name, value)
    }

    /// Blocking form of [`Connection::invoke_async`].
    pub fn invoke(&self, name: &str) -> Result<()> {
        self.block_on_call(name, Value::Null).map(|_| ())
    }

    /// Blocking form of [`Connection::invoke_async_with`].
    pub fn invoke_with<TIn: Serialize + ?Sized>(&self, name: &str, parameter: &TIn) -> Result<()> {
        let parameter = encode(name, parameter)?;
        self.block_on_call(name, parameter).map(|_| ())
    }

    fn block_on_call(&self, name: &str, parameter: Value) -> Result<Value> {
        self.inner.shared.token.check()?;
        let shared = self.inner.shared.clone();
        let command = name.to_string();
        self.block_on_runtime("call", async move { shared.call(&command, parameter).await })?
    }

    /// Run `future` on the connection's runtime and park this thread until it ends.
    fn block_on_runtime<F>(&self, operation: &'static str, future: F) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let on_worker = match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::CurrentThread => {
                return Err(RpcError::WouldBlock { operation });
            }
            Ok(_) => true,
            Err(_) => false,
        };

        let task = self.inner.shared.runtime.spawn(future);
        let joined = if on_worker {
            tokio::task::block_in_place(|| futures::executor::block_on(task))
        } else {
            futures::executor::block_on(task)
        };
        joined.map_err(|e| RpcError::Internal(format!("{} task failed: {}", operation, e)))
    }

    // ========================================
    // Local functions
    // ========================================

    /// Bind `name` so the peer can call it.
    pub fn register_function<F>(&self, name: impl Into<String>, function: F) -> Result<()>
    where
        F: Fn(Value) -> std::result::Result<Value, RemoteFailure> + Send + Sync + 'static,
    {
        self.inner.shared.lifecycle.ensure_active()?;
        self.inner.shared.registry.set(name, function);
        Ok(())
    }

    /// Bind a typed function; parameter and result go through serde.
    pub fn register_typed_function<TIn, TOut, F>(&self, name: impl Into<String>, function: F) -> Result<()>
    where
        TIn: DeserializeOwned,
        TOut: Serialize,
        F: Fn(TIn) -> std::result::Result<TOut, RemoteFailure> + Send + Sync + 'static,
    {
        self.inner.shared.lifecycle.ensure_active()?;
        self.inner.shared.registry.set_typed(name, function);
        Ok(())
    }

    /// Unbind `name`. Returns true if it was bound.
    pub fn remove_function(&self, name: &str) -> bool {
        self.inner.shared.registry.remove(name)
    }

    /// Names of all bound functions.
    pub fn function_names(&self) -> Vec<String> {
        self.inner.shared.registry.names()
    }

    // ========================================
    // Pending calls
    // ========================================

    /// Cancel every in-flight call. Returns how many were cancelled.
    pub fn clear_pending(&self) -> usize {
        self.inner.shared.pending.cancel_all(NoResponseCause::Cancelled)
    }

    /// Fail every in-flight call with `failure`.
    pub fn fail_pending(&self, failure: RemoteFailure) -> usize {
        self.inner.shared.pending.fail_all(failure)
    }

    /// Number of outbound calls still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.shared.pending.len()
    }

    /// Current response timeout: `-1` waits forever, `0` fails immediately.
    pub fn response_timeout_ms(&self) -> i64 {
        self.inner.shared.response_timeout_ms.load(Ordering::SeqCst)
    }

    /// Change the response timeout for calls started from now on.
    pub fn set_response_timeout_ms(&self, ms: i64) {
        self.inner.shared.response_timeout_ms.store(ms, Ordering::SeqCst);
    }

    // ========================================
    // State
    // ========================================

    /// Unique id of this connection, used in log lines.
    pub fn id(&self) -> Uuid {
        self.inner.shared.id
    }

    /// Not disposed and the transport reports itself running.
    pub fn is_running(&self) -> bool {
        self.inner.shared.lifecycle.is_active() && self.inner.shared.transport.is_running()
    }

    /// Name of this end, as reported by the transport.
    pub fn local_name(&self) -> &str {
        self.inner.shared.transport.local_name()
    }

    /// Name of the peer, as reported by the transport.
    pub fn remote_name(&self) -> &str {
        self.inner.shared.transport.remote_name()
    }

    /// Number of peers currently connected.
    pub fn connection_count(&self) -> usize {
        self.inner.shared.connection_count.load(Ordering::SeqCst)
    }

    /// Teardown phase plus any dispose requests that arrived while it ran.
    pub fn state(&self) -> LifecycleSnapshot {
        self.inner.shared.lifecycle.snapshot()
    }

    /// Resolves the first time a peer connects.
    ///
    /// Fails with `Disposed` if the connection is torn down first.
    pub async fn connected_once(&self) -> Result<()> {
        let shared = &self.inner.shared;
        tokio::select! {
            biased;
            _ = shared.connected.wait() => Ok(()),
            _ = shared.token.cancelled() => Err(RpcError::Disposed),
        }
    }

    /// Resolves with the first exception the connection reports.
    ///
    /// Fails with `Disposed` if the connection is torn down first.
    pub async fn failed_once(&self) -> Result<String> {
        let shared = &self.inner.shared;
        tokio::select! {
            biased;
            message = shared.failed.wait() => Ok(message),
            _ = shared.token.cancelled() => Err(RpcError::Disposed),
        }
    }

    /// Resolves once teardown has fully completed.
    pub async fn disposed(&self) {
        self.inner.shared.disposed.wait().await
    }

    // ========================================
    // Teardown
    // ========================================

    /// Dispose the connection and wait for the transport to close.
    ///
    /// In-flight calls fail with a `Disposed` cause right away. The wait
    /// works from plain threads and from multi-thread runtime workers. A
    /// thread driving a current-thread runtime cannot park, so there this
    /// only begins teardown: the phase stays tearing-down until the runtime
    /// gets to run, and [`Connection::disposed`] resolves on completion.
    ///
    /// Calling it again, or concurrently from another thread once teardown
    /// has started, returns `Ok`.
    pub fn dispose(&self) -> Result<()> {
        self.begin(DisposeKind::Sync)?;
        let shared = self.inner.shared.clone();
        if shared.disposed.is_set() {
            return Ok(());
        }
        match self.block_on_runtime("dispose", async move { shared.disposed.wait().await }) {
            Err(RpcError::WouldBlock { .. }) => {
                debug!(
                    "Connection {}: dispose continues on the runtime",
                    self.inner.shared.id
                );
                Ok(())
            }
            Err(_) if self.inner.shared.disposed.is_set() => Ok(()),
            other => other,
        }
    }

    /// Dispose the connection and wait for teardown to complete.
    pub async fn dispose_async(&self) -> Result<()> {
        match self.begin(DisposeKind::Async)? {
            Some(task) => {
                if let Err(e) = task.await {
                    return Err(RpcError::Internal(format!("teardown task failed: {}", e)));
                }
            }
            None => self.disposed().await,
        }
        Ok(())
    }

    /// Teardown triggered by an external cancellation request.
    ///
    /// Never blocks; await [`Connection::disposed`] for completion.
    pub fn cancel(&self) -> Result<()> {
        self.begin(DisposeKind::Cancel).map(|_| ())
    }

    fn begin(&self, kind: DisposeKind) -> Result<Option<JoinHandle<()>>> {
        match self.inner.shared.lifecycle.begin(kind)? {
            Transition::Won => Ok(Some(self.inner.start_teardown(kind))),
            Transition::Queued { running } => {
                debug!(
                    "Connection {}: {:?} queued behind {:?}",
                    self.inner.shared.id, kind, running
                );
                Ok(None)
            }
            Transition::AlreadyDisposed => Ok(None),
        }
    }
}

fn encode<T: Serialize + ?Sized>(command: &str, parameter: &T) -> Result<Value> {
    serde_json::to_value(parameter).map_err(|e| RpcError::InvalidArguments {
        command: command.to_string(),
        message: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(command: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| RpcError::Decode {
        command: command.to_string(),
        message: e.to_string(),
    })
}
