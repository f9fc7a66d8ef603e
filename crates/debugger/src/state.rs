//! Session and execution state of a debug client
//!
//! The client tracks two things: whether a session with a debug server exists
//! ([`SessionState`]) and, once it does, whether the petri net is executing ([`Execution`]).
//! Internally both are folded into a single [`ClientState`] so that an execution state can only
//! exist while a session is established.
use std::collections::BTreeMap;

use crate::{error::DebugError, types::EntityId};

/// Lifecycle of the connection to a debug server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Starting,
    Started,
}

/// Execution status of the petri net while a session is established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Execution {
    #[default]
    Idle,
    Running,
    Paused,
}

/// What subscribers see of the client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub session: SessionState,
    pub execution: Execution,
}

impl Snapshot {
    pub fn is_attached(&self) -> bool {
        self.session == SessionState::Started
    }

    /// True while the petri net executes, including while it is paused
    pub fn is_running(&self) -> bool {
        self.execution != Execution::Idle
    }

    pub fn is_paused(&self) -> bool {
        self.execution == Execution::Paused
    }
}

/// Events that cause the client state to change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    BeginAttach,
    Handshaken,
    PetriStarted,
    PetriStopped,
    Paused,
    Resumed,
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum ClientState {
    #[default]
    Stopped,
    Starting,
    Started(Execution),
}

impl ClientState {
    pub(crate) fn apply(self, transition: Transition) -> Result<ClientState, DebugError> {
        let next = match (self, transition) {
            (ClientState::Stopped, Transition::BeginAttach) => ClientState::Starting,
            (ClientState::Starting, Transition::Handshaken) => {
                ClientState::Started(Execution::Idle)
            }
            (ClientState::Started(Execution::Idle), Transition::PetriStarted) => {
                ClientState::Started(Execution::Running)
            }
            (ClientState::Started(_), Transition::PetriStopped) => {
                ClientState::Started(Execution::Idle)
            }
            (
                ClientState::Started(Execution::Running | Execution::Paused),
                Transition::Paused,
            ) => ClientState::Started(Execution::Paused),
            (
                ClientState::Started(Execution::Running | Execution::Paused),
                Transition::Resumed,
            ) => ClientState::Started(Execution::Running),
            (_, Transition::Detached) => ClientState::Stopped,
            (from, transition) => {
                return Err(DebugError::IllegalTransition {
                    from: from.snapshot(),
                    transition,
                });
            }
        };
        Ok(next)
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        match self {
            ClientState::Stopped => Snapshot {
                session: SessionState::Stopped,
                execution: Execution::Idle,
            },
            ClientState::Starting => Snapshot {
                session: SessionState::Starting,
                execution: Execution::Idle,
            },
            ClientState::Started(execution) => Snapshot {
                session: SessionState::Started,
                execution: *execution,
            },
        }
    }
}

/// Notifications published by the client
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The session or execution state changed
    StateChanged(Snapshot),
    /// The compiled petri net could not be loaded into this process
    UnableToLoadModule(String),
    StatusMessage(String),
    /// Result of an expression evaluation
    Evaluated(String),
    EvaluationFailed(String),
    /// The debug server reported an error; the session remains usable
    ServerError(String),
    /// The session ended abnormally
    UnrecoverableError(String),
    /// Full set of active states and their token counts
    ActiveStatesChanged(BTreeMap<EntityId, u32>),
}
