//! Seams to the rest of the editor
//!
//! The client does not know how petri nets are stored, turned into code, compiled or loaded.
//! Those jobs are delegated to implementations of the traits in this module.
use std::path::{Path, PathBuf};

use config::DebugSettings;

use crate::{
    error::DebugError,
    types::{Entity, EntityId},
};

/// The petri net document being debugged
pub trait Document: Send + Sync {
    fn settings(&self) -> DebugSettings;

    /// Hash of the generated code, the debug server refuses to run a different build
    fn content_hash(&self) -> String;

    fn entity_by_id(&self, id: EntityId) -> Option<Entity>;

    /// Where the petri net source is generated
    fn source_path(&self) -> PathBuf;

    /// Where the compiled petri net is written
    fn library_path(&self) -> PathBuf;

    /// Compile `source` into a loadable module at `output`
    ///
    /// Returns the compiler diagnostics. Empty diagnostics mean success.
    fn compile_source(&self, source: &Path, output: &Path) -> eyre::Result<String>;
}

/// Generates source code from the document
pub trait CodeGenerator: Send + Sync {
    fn write_petri_source(&self, output: &Path) -> eyre::Result<()>;

    /// Write a program that evaluates `expression` in the context of the running petri net
    fn write_expression_evaluator(
        &self,
        expression: &str,
        output: &Path,
        user_data: &[String],
    ) -> eyre::Result<()>;
}

/// Loads compiled modules into this process
pub trait LibraryLoader: Send + Sync {
    fn load(&self, path: &Path) -> eyre::Result<Box<dyn NativeModule>>;
}

/// A compiled module loaded into this process
pub trait NativeModule: Send {
    /// Host the petri net's debug server on `port`, returning once it accepts connections
    fn start_debug_server(&mut self, port: u16) -> eyre::Result<()>;

    fn stop_debug_server(&mut self);

    /// Run the evaluator contained in this module against the petri net held by `instance`
    fn evaluate(&self, instance: &dyn NativeModule) -> eyre::Result<String>;

    fn unload(&mut self);
}

/// A module that is unloaded when dropped
pub(crate) struct LoadedModule {
    path: PathBuf,
    module: Box<dyn NativeModule>,
}

impl LoadedModule {
    pub(crate) fn load(loader: &dyn LibraryLoader, path: &Path) -> Result<Self, DebugError> {
        tracing::debug!(path = %path.display(), "loading module");
        let module = loader.load(path).map_err(|e| DebugError::ModuleLoad {
            path: path.to_path_buf(),
            reason: format!("{e:#}"),
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            module,
        })
    }

    pub(crate) fn module(&self) -> &dyn NativeModule {
        self.module.as_ref()
    }
}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        tracing::debug!(path = %self.path.display(), "unloading module");
        self.module.unload();
    }
}

/// The petri net hosted in this process together with its debug server
///
/// Dropping it stops the server before the module is unloaded.
pub(crate) struct EmbeddedServer {
    module: LoadedModule,
}

impl EmbeddedServer {
    pub(crate) fn start(mut module: LoadedModule, port: u16) -> eyre::Result<Self> {
        tracing::debug!(%port, "starting embedded debug server");
        module.module.start_debug_server(port)?;
        Ok(Self { module })
    }

    pub(crate) fn module(&self) -> &dyn NativeModule {
        self.module.module()
    }
}

impl Drop for EmbeddedServer {
    fn drop(&mut self) {
        tracing::debug!("stopping embedded debug server");
        self.module.module.stop_debug_server();
    }
}
