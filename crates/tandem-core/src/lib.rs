//! Tandem Core - bidirectional RPC correlation and dispatch.
//!
//! Both ends of a [`Connection`] can call each other. Outbound calls are
//! correlated with their responses by packet id; inbound commands run
//! locally bound functions and are answered with exactly one response.
//! The byte-level transport is pluggable through the [`Transport`] trait.
//!
//! # Example
//!
//! ```rust,ignore
//! use tandem_core::{Connection, MemoryTransport};
//!
//! #[tokio::main]
//! async fn main() -> tandem_core::Result<()> {
//!     let ((client_end, client_events), (server_end, server_events)) =
//!         MemoryTransport::pair("client", "server");
//!     client_end.connect();
//!
//!     let server = Connection::builder(server_end, server_events).start()?;
//!     server.register_function("GetInt", |_| Ok(serde_json::json!(21)))?;
//!
//!     let client = Connection::builder(client_end, client_events).start()?;
//!     let value: i32 = client.call_async("GetInt").await?;
//!     assert_eq!(value, 21);
//!
//!     client.dispose_async().await?;
//!     Ok(())
//! }
//! ```

pub mod binding;
pub mod cancel;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod factory;
pub mod lifecycle;
pub mod observer;
pub mod packet;
pub mod pending;
pub mod registry;
pub mod transport;

// Re-export commonly used types
pub use binding::{CommandSignature, CommandTable, FallbackDispatch, Slot, SlotDirection};
pub use cancel::{CancelledError, LifetimeToken};
pub use config::{ConnectionConfig, ResponseTimeout, RpcConfig};
pub use connection::{Connection, ConnectionBuilder};
pub use dispatch::{Dispatcher, Routed};
pub use error::{NoResponseCause, RemoteFailure, Result, RpcError};
pub use factory::PacketFactory;
pub use lifecycle::{DisposeKind, Lifecycle, LifecycleSnapshot, Phase, TaskGate, Transition};
pub use observer::{ConnectionObserver, NoopObserver, OnceSignal};
pub use packet::{Packet, PacketKind};
pub use pending::{CallOutcome, PendingCall, PendingCallTable};
pub use registry::{BoundFunction, FunctionRegistry};
pub use transport::{event_channel, EventReceiver, EventSender, MemoryTransport, Transport, TransportEvent};
