//! Client side of a live debugging session with a petri net
//!
//! [`DebugClient`] attaches to the debug server hosted by a running petri net, controls its
//! execution, manages breakpoints and evaluates expressions against it. Everything it learns
//! from the server is published as [`Event`]s.
mod collaborators;
mod debugger;
mod error;
mod evaluation;
mod internals;
mod registry;
pub(crate) mod state;
mod types;
mod utils;

pub use collaborators::{CodeGenerator, Document, LibraryLoader, NativeModule};
pub use debugger::DebugClient;
pub use error::DebugError;
pub use evaluation::references_live_variables;
pub use internals::CLIENT_VERSION;
pub use state::{Event, Execution, SessionState, Snapshot, Transition};
pub use types::{Entity, EntityId, EntityKind};

pub use config::{DebugSettings, Language};
