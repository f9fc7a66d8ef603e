//! Message catalog for the petri net debug protocol
//!
//! Every frame on the wire carries a single [`Message`]: a `type` tag and an optional JSON
//! `payload`. Outgoing messages are built through the constructors on [`Message`]; incoming
//! messages are interpreted through [`Incoming`], which validates the payload of every known
//! message type and leaves unknown types untouched for forward compatibility.
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ProtocolError;

/// Payload of a `detach`/`detachAndExit` message for a clean shutdown
pub const CLEAN_DETACH_REASON: &str = "kbye";

pub mod types {
    pub const HELLO: &str = "hello";
    pub const EHLO: &str = "ehlo";
    pub const ERROR: &str = "error";
    pub const START: &str = "start";
    pub const STOP: &str = "stop";
    pub const PAUSE: &str = "pause";
    pub const RESUME: &str = "resume";
    pub const RELOAD: &str = "reload";
    pub const ACK: &str = "ack";
    pub const DETACH: &str = "detach";
    pub const DETACH_AND_EXIT: &str = "detachAndExit";
    pub const BREAKPOINTS: &str = "breakpoints";
    pub const STATES: &str = "states";
    pub const EVALUATE: &str = "evaluate";
    pub const EVALUATION: &str = "evaluation";
}

/// A single protocol message, exactly as it is encoded inside a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Message {
    pub fn new(r#type: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            r#type: r#type.into(),
            payload,
        }
    }

    fn bare(r#type: &str) -> Self {
        Self::new(r#type, None)
    }

    pub fn hello(version: &str) -> Self {
        Self::new(types::HELLO, Some(json!({ "version": version })))
    }

    pub fn ehlo() -> Self {
        Self::bare(types::EHLO)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(types::ERROR, Some(Value::String(text.into())))
    }

    /// Ask the engine to start executing, stating the hash of the build we expect it to run
    pub fn start(hash: &str) -> Self {
        Self::new(types::START, Some(json!({ "hash": hash })))
    }

    pub fn stop() -> Self {
        Self::bare(types::STOP)
    }

    pub fn pause() -> Self {
        Self::bare(types::PAUSE)
    }

    pub fn resume() -> Self {
        Self::bare(types::RESUME)
    }

    pub fn reload() -> Self {
        Self::bare(types::RELOAD)
    }

    pub fn ack(operation: &str) -> Self {
        Self::new(types::ACK, Some(Value::String(operation.to_string())))
    }

    pub fn detach() -> Self {
        Self::bare(types::DETACH)
    }

    pub fn detach_and_exit() -> Self {
        Self::bare(types::DETACH_AND_EXIT)
    }

    /// Termination notice sent by the engine; `reason` is [`CLEAN_DETACH_REASON`] for a clean
    /// shutdown
    pub fn detached(exit: bool, reason: &str) -> Self {
        let r#type = if exit {
            types::DETACH_AND_EXIT
        } else {
            types::DETACH
        };
        Self::new(r#type, Some(Value::String(reason.to_string())))
    }

    /// Full snapshot of the breakpoint set
    pub fn breakpoints(ids: impl IntoIterator<Item = u64>) -> Self {
        let ids: Vec<Value> = ids.into_iter().map(Value::from).collect();
        Self::new(types::BREAKPOINTS, Some(Value::Array(ids)))
    }

    pub fn states(states: &[StateCount]) -> Self {
        Self::new(types::STATES, Some(json!(states)))
    }

    /// Ask the engine to load and run a compiled evaluator module
    pub fn evaluate(lib: &std::path::Path, language: &str) -> Self {
        Self::new(
            types::EVALUATE,
            Some(json!({ "lib": lib.to_string_lossy(), "language": language })),
        )
    }

    pub fn evaluation(eval: &str, lib: Option<&std::path::Path>) -> Self {
        let mut payload = json!({ "eval": eval });
        if let Some(lib) = lib {
            payload["lib"] = Value::String(lib.to_string_lossy().into_owned());
        }
        Self::new(types::EVALUATION, Some(payload))
    }

    /// Returns the payload if it is a JSON string
    pub fn payload_str(&self) -> Option<&str> {
        self.payload.as_ref().and_then(Value::as_str)
    }
}

/// One entry of a `states` message: an entity and the number of tokens it currently holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCount {
    pub id: u64,
    pub count: u32,
}

/// The operation an `ack` message confirms
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    Start,
    Stop,
    /// The engine ended execution on its own
    Stopped,
    Pause,
    Resume,
    Reload,
    Other(String),
}

impl From<&str> for Ack {
    fn from(value: &str) -> Self {
        match value {
            "start" => Ack::Start,
            "stop" => Ack::Stop,
            "stopped" => Ack::Stopped,
            "pause" => Ack::Pause,
            "resume" => Ack::Resume,
            "reload" => Ack::Reload,
            other => Ack::Other(other.to_string()),
        }
    }
}

/// Typed view of a message received from the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Ehlo,
    Error(String),
    Ack(Ack),
    Detach { exit: bool, reason: String },
    States(Vec<StateCount>),
    Evaluation { eval: String, lib: Option<PathBuf> },
    /// Any message type this client does not act upon
    Other(String),
}

#[derive(Deserialize)]
struct EvaluationPayload {
    eval: String,
    #[serde(default)]
    lib: Option<PathBuf>,
}

impl Incoming {
    /// Interpret a raw message, validating the payload of every known message type
    pub fn parse(message: Message) -> Result<Self, ProtocolError> {
        let Message { r#type, payload } = message;
        let incoming = match r#type.as_str() {
            types::EHLO => Incoming::Ehlo,
            types::ERROR => Incoming::Error(string_payload(&r#type, payload)?),
            types::ACK => Incoming::Ack(Ack::from(string_payload(&r#type, payload)?.as_str())),
            types::DETACH | types::DETACH_AND_EXIT => Incoming::Detach {
                exit: r#type == types::DETACH_AND_EXIT,
                reason: string_payload(&r#type, payload)?,
            },
            types::STATES => Incoming::States(typed_payload(&r#type, payload)?),
            types::EVALUATION => {
                let EvaluationPayload { eval, lib } = typed_payload(&r#type, payload)?;
                Incoming::Evaluation { eval, lib }
            }
            _ => Incoming::Other(r#type),
        };
        Ok(incoming)
    }
}

fn string_payload(r#type: &str, payload: Option<Value>) -> Result<String, ProtocolError> {
    match payload {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(ProtocolError::InvalidPayload {
            kind: r#type.to_string(),
            reason: format!("expected a string, got {other}"),
        }),
        None => Err(ProtocolError::MissingPayload(r#type.to_string())),
    }
}

fn typed_payload<T>(r#type: &str, payload: Option<Value>) -> Result<T, ProtocolError>
where
    T: for<'de> Deserialize<'de>,
{
    let payload = payload.ok_or_else(|| ProtocolError::MissingPayload(r#type.to_string()))?;
    serde_json::from_value(payload).map_err(|e| ProtocolError::InvalidPayload {
        kind: r#type.to_string(),
        reason: e.to_string(),
    })
}
