//! Packet id minting.

use crate::error::RemoteFailure;
use crate::packet::{Packet, PacketKind};
use rand::Rng;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Mints command packets with fresh ids and builds correlated responses.
///
/// Ids come from a 64-bit counter seeded randomly, so two connections in
/// different runs are unlikely to reuse each other's ids, and one factory
/// never hands out the same id twice until the counter wraps.
#[derive(Debug)]
pub struct PacketFactory {
    next_id: AtomicU64,
}

impl Default for PacketFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketFactory {
    /// Create a factory with a random starting id.
    pub fn new() -> Self {
        // Keep the seed in the lower half of the range so wrapping is not a concern.
        let seed = rand::rng().random::<u32>() as u64;
        Self::seeded(seed)
    }

    /// Create a factory whose first id is `seed`.
    pub fn seeded(seed: u64) -> Self {
        Self {
            next_id: AtomicU64::new(seed),
        }
    }

    fn mint_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Peek at the id the next command will get.
    pub fn peek_next_id(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }

    pub fn create_command(&self, name: impl Into<String>) -> Packet {
        self.create_command_with(name, Value::Null)
    }

    pub fn create_command_with(&self, name: impl Into<String>, parameter: Value) -> Packet {
        Packet::from_parts(self.mint_id(), name, parameter, PacketKind::Command)
    }

    pub fn create_command_cancellation(
        &self,
        name: impl Into<String>,
        reason: Option<String>,
    ) -> Packet {
        let parameter = reason.map(Value::String).unwrap_or(Value::Null);
        Packet::from_parts(self.mint_id(), name, parameter, PacketKind::CommandCancellation)
    }

    pub fn create_command_failure(&self, name: impl Into<String>, failure: &RemoteFailure) -> Packet {
        Packet::from_parts(
            self.mint_id(),
            name,
            failure.to_parameter(),
            PacketKind::CommandFailure,
        )
    }

    pub fn create_response(&self, command: &Packet) -> Packet {
        self.create_response_with(command, Value::Null)
    }

    pub fn create_response_with(&self, command: &Packet, parameter: Value) -> Packet {
        Packet::from_parts(command.id(), command.command(), parameter, PacketKind::Response)
    }

    pub fn create_response_cancellation(&self, command: &Packet, reason: Option<String>) -> Packet {
        let parameter = reason.map(Value::String).unwrap_or(Value::Null);
        Packet::from_parts(
            command.id(),
            command.command(),
            parameter,
            PacketKind::ResponseCancellation,
        )
    }

    pub fn create_response_failure(&self, command: &Packet, failure: &RemoteFailure) -> Packet {
        Packet::from_parts(
            command.id(),
            command.command(),
            failure.to_parameter(),
            PacketKind::ResponseFailure,
        )
    }
}
