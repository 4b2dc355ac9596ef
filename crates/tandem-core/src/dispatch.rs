//! Inbound packet routing.
//!
//! Response-family packets settle a pending call. Command-family packets run
//! a bound function (registry first, then the optional fallback) and produce
//! exactly one reply. Nothing a bound function does escapes this module.

use crate::binding::FallbackDispatch;
use crate::error::{NoResponseCause, RemoteFailure, RpcError};
use crate::factory::PacketFactory;
use crate::packet::{Packet, PacketKind};
use crate::pending::{CallOutcome, PendingCallTable};
use crate::registry::FunctionRegistry;
use std::sync::Arc;
use tracing::{debug, warn};

/// What happened to one inbound packet.
#[derive(Debug)]
pub enum Routed {
    /// A pending call was settled.
    Resolved { id: u64 },
    /// A response for an id nobody is waiting on (late or duplicate).
    Dropped { id: u64 },
    /// A command was handled; send this packet back.
    Reply(Packet),
    /// No handler knows the command. `reply` tells the peer so.
    Unhandled { error: RpcError, reply: Packet },
}

impl Routed {
    /// The packet to send back, if any.
    pub fn reply(&self) -> Option<&Packet> {
        match self {
            Routed::Reply(packet) | Routed::Unhandled { reply: packet, .. } => Some(packet),
            _ => None,
        }
    }
}

/// Routes inbound packets to the pending table or to local functions.
pub struct Dispatcher {
    pending: Arc<PendingCallTable>,
    registry: Arc<FunctionRegistry>,
    factory: Arc<PacketFactory>,
    fallback: Option<Arc<dyn FallbackDispatch>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.pending.len())
            .field("registry", &self.registry)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        pending: Arc<PendingCallTable>,
        registry: Arc<FunctionRegistry>,
        factory: Arc<PacketFactory>,
    ) -> Self {
        Self {
            pending,
            registry,
            factory,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackDispatch>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Route one inbound packet.
    pub async fn route(&self, packet: Packet) -> Routed {
        if packet.kind().is_response_family() {
            self.settle(packet)
        } else {
            self.execute(packet).await
        }
    }

    fn settle(&self, packet: Packet) -> Routed {
        let id = packet.id();
        let outcome = match packet.kind() {
            PacketKind::ResponseCancellation => {
                CallOutcome::Cancelled(NoResponseCause::RemoteCancelled(packet.cancellation_reason()))
            }
            PacketKind::ResponseFailure => {
                CallOutcome::Failed(RemoteFailure::from_parameter(packet.parameter()))
            }
            _ => CallOutcome::Completed(packet.into_parameter()),
        };

        if self.pending.settle(id, outcome) {
            debug!("Settled pending call {}", id);
            Routed::Resolved { id }
        } else {
            debug!("Dropped response for unknown id {}", id);
            Routed::Dropped { id }
        }
    }

    async fn execute(&self, packet: Packet) -> Routed {
        let result = match self
            .registry
            .invoke(packet.command(), packet.parameter().clone())
        {
            Some(result) => Some(result),
            None => match &self.fallback {
                Some(fallback) => {
                    fallback
                        .dispatch(packet.command(), packet.parameter().clone())
                        .await
                }
                None => None,
            },
        };

        match result {
            Some(Ok(value)) => Routed::Reply(self.factory.create_response_with(&packet, value)),
            Some(Err(failure)) => {
                debug!("'{}' failed locally: {}", packet.command(), failure);
                Routed::Reply(self.factory.create_response_failure(&packet, &failure))
            }
            None => {
                let error = RpcError::Protocol {
                    message: format!(
                        "no handler for {} '{}' (id {})",
                        packet.kind(),
                        packet.command(),
                        packet.id()
                    ),
                };
                warn!("{}", error);
                let reply = self
                    .factory
                    .create_response_failure(&packet, &error.to_remote_failure());
                Routed::Unhandled { error, reply }
            }
        }
    }
}
