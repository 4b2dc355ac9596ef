//! Packet type shared by both ends of a connection.
//!
//! A packet is either part of the *command* family (asks the receiver to run
//! something) or the *response* family (answers an earlier command by id).

use crate::error::RemoteFailure;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind tag of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    Command,
    Response,
    CommandCancellation,
    CommandFailure,
    ResponseCancellation,
    ResponseFailure,
}

impl PacketKind {
    /// Response, ResponseCancellation or ResponseFailure.
    pub fn is_response_family(&self) -> bool {
        matches!(
            self,
            PacketKind::Response | PacketKind::ResponseCancellation | PacketKind::ResponseFailure
        )
    }

    /// Command, CommandCancellation or CommandFailure.
    pub fn is_command_family(&self) -> bool {
        !self.is_response_family()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PacketKind::Command => "command",
            PacketKind::Response => "response",
            PacketKind::CommandCancellation => "command_cancellation",
            PacketKind::CommandFailure => "command_failure",
            PacketKind::ResponseCancellation => "response_cancellation",
            PacketKind::ResponseFailure => "response_failure",
        }
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An immutable, uniquely identified message.
///
/// Packets are normally minted by a [`PacketFactory`](crate::factory::PacketFactory)
/// so that ids stay unique and responses copy their command's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    id: u64,
    command: String,
    #[serde(default)]
    parameter: Value,
    kind: PacketKind,
}

impl Packet {
    /// Assemble a packet from raw parts.
    ///
    /// Transports that decode packets off the wire use this; everything else
    /// should go through the factory.
    pub fn from_parts(id: u64, command: impl Into<String>, parameter: Value, kind: PacketKind) -> Self {
        Self {
            id,
            command: command.into(),
            parameter,
            kind,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn parameter(&self) -> &Value {
        &self.parameter
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// Take ownership of the parameter.
    pub fn into_parameter(self) -> Value {
        self.parameter
    }

    /// True if this packet answers `command` (same id, response family).
    pub fn answers(&self, command: &Packet) -> bool {
        self.kind.is_response_family() && self.id == command.id
    }

    /// Failure carried by a `*Failure` packet.
    pub fn failure(&self) -> Option<RemoteFailure> {
        match self.kind {
            PacketKind::CommandFailure | PacketKind::ResponseFailure => {
                Some(RemoteFailure::from_parameter(&self.parameter))
            }
            _ => None,
        }
    }

    /// Reason carried by a `*Cancellation` packet, if it has one.
    pub fn cancellation_reason(&self) -> Option<String> {
        match self.kind {
            PacketKind::CommandCancellation | PacketKind::ResponseCancellation => {
                self.parameter.as_str().map(str::to_string)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{} '{}'", self.kind, self.id, self.command)
    }
}
