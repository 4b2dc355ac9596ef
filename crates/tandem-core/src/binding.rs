//! Statically assembled command tables for typed bindings.
//!
//! Generated (or hand-written) interface bindings describe each command with
//! a [`CommandSignature`]: an ordered list of argument and result slots. The
//! signature decides how arguments are packed into a packet parameter and
//! how results come back:
//!
//! - no slots: `null`
//! - one slot: the bare value
//! - several slots: a JSON array in slot order
//!
//! A [`CommandTable`] maps names to handlers and plugs into the dispatcher
//! as its fallback, after the dynamic function registry.

use crate::error::{RemoteFailure, Result, RpcError};
use crate::registry::call_guarded;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Which way a slot's value flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDirection {
    /// Sent to the callee only.
    In,
    /// Produced by the callee only.
    Out,
    /// Sent to the callee and returned updated.
    InOut,
}

/// One named argument or result position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub name: &'static str,
    pub direction: SlotDirection,
}

impl Slot {
    pub const fn input(name: &'static str) -> Self {
        Self {
            name,
            direction: SlotDirection::In,
        }
    }

    pub const fn output(name: &'static str) -> Self {
        Self {
            name,
            direction: SlotDirection::Out,
        }
    }

    pub const fn in_out(name: &'static str) -> Self {
        Self {
            name,
            direction: SlotDirection::InOut,
        }
    }

    fn is_input(&self) -> bool {
        matches!(self.direction, SlotDirection::In | SlotDirection::InOut)
    }

    fn is_output(&self) -> bool {
        matches!(self.direction, SlotDirection::Out | SlotDirection::InOut)
    }
}

/// Shape of one remote command.
///
/// The return value, if any, is modelled as an `Out` slot; by convention it
/// comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSignature {
    pub name: &'static str,
    pub slots: &'static [Slot],
}

impl CommandSignature {
    pub const fn new(name: &'static str, slots: &'static [Slot]) -> Self {
        Self { name, slots }
    }

    pub fn input_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_input()).count()
    }

    pub fn output_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_output()).count()
    }

    /// Pack caller-side argument values (one per input slot) into a parameter.
    pub fn pack_args(&self, args: Vec<Value>) -> Result<Value> {
        pack(self.name, "argument", self.input_count(), args)
    }

    /// Unpack a parameter into one value per input slot.
    pub fn unpack_args(&self, parameter: Value) -> Result<Vec<Value>> {
        unpack(self.name, "argument", self.input_count(), parameter)
    }

    /// Pack callee-side results (one per output slot) into a response parameter.
    pub fn pack_results(&self, results: Vec<Value>) -> Result<Value> {
        pack(self.name, "result", self.output_count(), results)
    }

    /// Unpack a response parameter into one value per output slot.
    pub fn unpack_results(&self, parameter: Value) -> Result<Vec<Value>> {
        unpack(self.name, "result", self.output_count(), parameter)
    }
}

fn pack(command: &str, what: &str, expected: usize, mut values: Vec<Value>) -> Result<Value> {
    if values.len() != expected {
        return Err(RpcError::InvalidArguments {
            command: command.to_string(),
            message: format!("expected {} {} value(s), got {}", expected, what, values.len()),
        });
    }
    Ok(match expected {
        0 => Value::Null,
        1 => values.remove(0),
        _ => Value::Array(values),
    })
}

fn unpack(command: &str, what: &str, expected: usize, parameter: Value) -> Result<Vec<Value>> {
    match (expected, parameter) {
        (0, _) => Ok(Vec::new()),
        (1, value) => Ok(vec![value]),
        (n, Value::Array(values)) if values.len() == n => Ok(values),
        (n, other) => Err(RpcError::InvalidArguments {
            command: command.to_string(),
            message: format!("expected an array of {} {} value(s), got {}", n, what, other),
        }),
    }
}

/// Last-resort handler for commands the function registry does not know.
#[async_trait]
pub trait FallbackDispatch: Send + Sync + 'static {
    /// Handle `command`. Returns `None` if the command is not recognized.
    async fn dispatch(
        &self,
        command: &str,
        parameter: Value,
    ) -> Option<std::result::Result<Value, RemoteFailure>>;
}

type TableHandler =
    Arc<dyn Fn(Vec<Value>) -> std::result::Result<Vec<Value>, RemoteFailure> + Send + Sync>;

struct TableEntry {
    signature: CommandSignature,
    handler: TableHandler,
}

/// Name → (signature, handler) map built once at setup.
///
/// # Example
///
/// ```
/// use tandem_core::binding::{CommandSignature, CommandTable, Slot};
/// use serde_json::json;
///
/// const ADD: CommandSignature = CommandSignature::new(
///     "Add",
///     &[Slot::output("sum"), Slot::input("a"), Slot::input("b")],
/// );
///
/// let table = CommandTable::new().with_command(ADD, |args| {
///     let sum = args[0].as_i64().unwrap_or(0) + args[1].as_i64().unwrap_or(0);
///     Ok(vec![json!(sum)])
/// });
/// assert!(table.signature("Add").is_some());
/// ```
#[derive(Default)]
pub struct CommandTable {
    entries: HashMap<&'static str, TableEntry>,
}

impl std::fmt::Debug for CommandTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("CommandTable").field("commands", &names).finish()
    }
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a command. The handler receives one value per input slot and
    /// must return one value per output slot.
    pub fn with_command<F>(mut self, signature: CommandSignature, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> std::result::Result<Vec<Value>, RemoteFailure> + Send + Sync + 'static,
    {
        self.entries.insert(
            signature.name,
            TableEntry {
                signature,
                handler: Arc::new(handler),
            },
        );
        self
    }

    pub fn signature(&self, name: &str) -> Option<CommandSignature> {
        self.entries.get(name).map(|e| e.signature)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run the handler for `command` synchronously.
    pub fn handle(
        &self,
        command: &str,
        parameter: Value,
    ) -> Option<std::result::Result<Value, RemoteFailure>> {
        let entry = self.entries.get(command)?;
        let signature = entry.signature;
        let args = match signature.unpack_args(parameter) {
            Ok(args) => args,
            Err(e) => return Some(Err(e.to_remote_failure())),
        };
        let handler = entry.handler.clone();
        Some(call_guarded(command, move || {
            let results = handler(args)?;
            signature
                .pack_results(results)
                .map_err(|e| RemoteFailure::new("invalid_result", e.to_string()))
        }))
    }
}

#[async_trait]
impl FallbackDispatch for CommandTable {
    async fn dispatch(
        &self,
        command: &str,
        parameter: Value,
    ) -> Option<std::result::Result<Value, RemoteFailure>> {
        self.handle(command, parameter)
    }
}
