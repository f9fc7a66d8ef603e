use std::path::PathBuf;

use crate::{
    state::{Snapshot, Transition},
    types::EntityId,
};

/// Failures specific to a debugging session
///
/// These are returned wrapped in an [`eyre::Report`], and can be recovered with
/// [`eyre::Report::downcast_ref`].
#[derive(Debug, thiserror::Error)]
pub enum DebugError {
    #[error("not attached to a debug server")]
    NotAttached,

    #[error("already attached to a debug server")]
    AlreadyAttached,

    #[error(
        "the expression refers to the petri net's variables, which only exist while it is running"
    )]
    InstanceNotRunning,

    #[error("compilation failed:\n{0}")]
    Compilation(String),

    #[error("debug server refused the session: {0}")]
    HandshakeRejected(String),

    #[error("invalid message received from the debug server during handshake: {0}")]
    InvalidHandshake(String),

    #[error(
        "entity {0} reported by the debug server does not exist, has the document changed since it was compiled?"
    )]
    UnknownEntity(EntityId),

    #[error("entity {0} reported by the debug server as active is not a state")]
    NotAState(EntityId),

    #[error("the petri net was forcefully closed: {0}")]
    RemoteTermination(String),

    #[error("cannot apply {transition:?} while {from:?}")]
    IllegalTransition {
        from: Snapshot,
        transition: Transition,
    },

    #[error("unable to load module {}: {reason}", .path.display())]
    ModuleLoad { path: PathBuf, reason: String },
}
