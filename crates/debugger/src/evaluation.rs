//! Evaluating expressions against a running petri net
//!
//! An expression is turned into a small program by the [`CodeGenerator`], compiled into a
//! temporary module and then either run in this process against the embedded petri net, or
//! handed to the remote engine which answers with an `evaluation` message.
//!
//! [`CodeGenerator`]: crate::CodeGenerator
use std::env::consts::DLL_EXTENSION;
use std::path::Path;

use config::Language;
use eyre::WrapErr;
use tempfile::TempPath;
use transport::Message;

use crate::{
    collaborators::LoadedModule, error::DebugError, internals::DebuggerInternals, state::Event,
    utils::with_lock,
};

const TEMP_PREFIX: &str = "petri-eval-";

/// Whether `expression` refers to one of the petri net's variables (`$name`)
pub fn references_live_variables(expression: &str) -> bool {
    let mut chars = expression.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' && chars.peek().is_some_and(|&n| n.is_alphabetic() || n == '_') {
            return true;
        }
    }
    false
}

impl DebuggerInternals {
    #[tracing::instrument(skip(self, user_data))]
    pub(crate) fn evaluate(&self, expression: &str, user_data: &[String]) -> eyre::Result<()> {
        let snapshot = self.require_attached()?;
        if references_live_variables(expression) && !snapshot.is_running() {
            return Err(DebugError::InstanceNotRunning.into());
        }

        self.compile_and_run(expression, user_data)
            .inspect_err(|e| self.emit(Event::EvaluationFailed(format!("{e:#}"))))
    }

    fn compile_and_run(&self, expression: &str, user_data: &[String]) -> eyre::Result<()> {
        let settings = self.document.settings();
        let module = self.compile_evaluator(expression, user_data, settings.language)?;
        if settings.run_in_editor {
            self.evaluate_in_process(module)
        } else {
            self.evaluate_remotely(module, settings.language)
        }
    }

    /// Generate and compile the evaluator, returning the path of the compiled module
    fn compile_evaluator(
        &self,
        expression: &str,
        user_data: &[String],
        language: Language,
    ) -> eyre::Result<TempPath> {
        let source = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(language.source_extension())
            .tempfile()
            .wrap_err("creating evaluator source file")?
            .into_temp_path();
        self.generator
            .write_expression_evaluator(expression, &source, user_data)
            .wrap_err("generating evaluator")?;

        let module = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(&format!(".{DLL_EXTENSION}"))
            .tempfile()
            .wrap_err("creating evaluator module file")?
            .into_temp_path();
        let diagnostics = self
            .document
            .compile_source(&source, &module)
            .wrap_err("compiling evaluator")?;
        if !diagnostics.trim().is_empty() {
            return Err(DebugError::Compilation(diagnostics).into());
        }
        Ok(module)
    }

    fn evaluate_in_process(&self, module: TempPath) -> eyre::Result<()> {
        let evaluator = LoadedModule::load(&*self.loader, &module)
            .inspect_err(|e| self.emit(Event::UnableToLoadModule(e.to_string())))?;
        let result = with_lock("embedded", &self.embedded, |embedded| match embedded.as_ref() {
            Some(server) => evaluator.module().evaluate(server.module()),
            None => Err(DebugError::NotAttached.into()),
        })?;

        // unload before the file goes away
        drop(evaluator);
        drop(module);
        self.emit(Event::Evaluated(result));
        Ok(())
    }

    fn evaluate_remotely(&self, module: TempPath, language: Language) -> eyre::Result<()> {
        let path = module.to_path_buf();
        with_lock("pending evaluations", &self.pending_evaluations, |mut pending| {
            pending.insert(path.clone(), module)
        });

        if let Err(e) = self.send(Message::evaluate(&path, language.as_str())) {
            self.finish_evaluation(&path);
            return Err(e);
        }
        Ok(())
    }

    /// Delete an evaluator module once the engine is done with it
    pub(crate) fn finish_evaluation(&self, lib: &Path) {
        let finished = with_lock("pending evaluations", &self.pending_evaluations, |mut pending| {
            pending.remove(lib)
        });
        match finished {
            Some(module) => {
                if let Err(e) = module.close() {
                    tracing::warn!(path = %lib.display(), error = %e, "removing evaluator module");
                }
            }
            None => {
                tracing::debug!(path = %lib.display(), "evaluation result for a module not sent by this client");
                match std::fs::remove_file(lib) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        tracing::warn!(path = %lib.display(), error = %e, "removing evaluator module")
                    }
                }
            }
        }
    }
}
