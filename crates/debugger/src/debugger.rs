use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use eyre::WrapErr;
use transport::{CodecError, Message};

use crate::{
    collaborators::{CodeGenerator, Document, LibraryLoader},
    error::DebugError,
    internals::{CONNECT_TIMEOUT, DebuggerInternals, HANDSHAKE_TIMEOUT},
    state::{Event, SessionState, Snapshot},
    types::EntityId,
    utils::with_lock,
};

/// How long to wait for the server to confirm a detach before closing the connection
pub(crate) const DETACH_GRACE: Duration = Duration::from_secs(2);

const ATTACH_TIMEOUT: Duration = CONNECT_TIMEOUT
    .saturating_add(HANDSHAKE_TIMEOUT)
    .saturating_add(Duration::from_secs(1));

/// The receiver thread of an attached session
struct Receiver {
    thread: JoinHandle<()>,
    /// Signalled when the thread is about to exit
    done: crossbeam_channel::Receiver<()>,
}

/// Sends on the done channel when the receiver thread exits, even by panicking
struct DoneGuard(crossbeam_channel::Sender<()>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

/// Live debugging session with a petri net
///
/// The client connects to the debug server hosted by the petri net, either in another process
/// (possibly on another machine) or in this one when the settings ask for the petri net to run
/// in the editor. Every change of state is published as an [`Event`], see
/// [`DebugClient::events`].
pub struct DebugClient {
    internals: Arc<DebuggerInternals>,
    receiver: Mutex<Option<Receiver>>,
    rx: crossbeam_channel::Receiver<Event>,
}

impl DebugClient {
    pub fn new(
        document: Arc<dyn Document>,
        generator: Arc<dyn CodeGenerator>,
        loader: Arc<dyn LibraryLoader>,
    ) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            internals: Arc::new(DebuggerInternals::new(document, generator, loader, tx)),
            receiver: Mutex::new(None),
            rx,
        }
    }

    /// Subscribe to the events of this client
    pub fn events(&self) -> crossbeam_channel::Receiver<Event> {
        self.rx.clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.internals.snapshot()
    }

    pub fn session_state(&self) -> SessionState {
        self.snapshot().session
    }

    pub fn is_running(&self) -> bool {
        self.snapshot().is_running()
    }

    pub fn is_paused(&self) -> bool {
        self.snapshot().is_paused()
    }

    /// Connect to the debug server and perform the handshake
    ///
    /// When the petri net runs in the editor it is built and loaded first, and its debug server
    /// started on the configured port. Returns once the server accepted the session.
    #[tracing::instrument(skip(self))]
    pub fn attach(&self) -> eyre::Result<()> {
        if let Some(previous) = with_lock("receiver", &self.receiver, |mut r| r.take()) {
            if self.session_state() != SessionState::Stopped {
                with_lock("receiver", &self.receiver, |mut r| *r = Some(previous));
                return Err(DebugError::AlreadyAttached.into());
            }
            join(previous);
        }

        self.internals.begin_attach()?;

        let settings = self.internals.document.settings();
        let port = settings.port;
        let host = if settings.run_in_editor {
            if let Err(e) = self.internals.start_embedded_server(port) {
                self.internals.teardown();
                // a module that failed to load has been reported already
                if !matches!(
                    e.downcast_ref::<DebugError>(),
                    Some(DebugError::ModuleLoad { .. })
                ) {
                    self.internals
                        .emit(Event::UnrecoverableError(format!("{e:#}")));
                }
                return Err(e);
            }
            "127.0.0.1".to_string()
        } else {
            settings.hostname
        };

        let (established_tx, established_rx) = oneshot::channel();
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let internals = Arc::clone(&self.internals);
        let spawned = thread::Builder::new()
            .name("petri-debug-receiver".to_string())
            .spawn(move || {
                let _done = DoneGuard(done_tx);
                internals.run_receiver(&host, port, established_tx);
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                self.internals.teardown();
                return Err(e).wrap_err("spawning receiver thread");
            }
        };
        with_lock("receiver", &self.receiver, |mut r| {
            *r = Some(Receiver {
                thread,
                done: done_rx,
            })
        });

        match established_rx.recv_timeout(ATTACH_TIMEOUT) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, "no answer from receiver thread");
                self.internals.request_shutdown();
                if let Some(receiver) = with_lock("receiver", &self.receiver, |mut r| r.take()) {
                    join(receiver);
                }
                self.internals.teardown();
                eyre::bail!("timed out attaching to the debug server")
            }
        }
    }

    /// End the session
    ///
    /// A petri net running in the editor is stopped first and asked to exit. The server gets
    /// a short grace period to confirm before the connection is closed regardless.
    #[tracing::instrument(skip(self))]
    pub fn detach(&self) -> eyre::Result<()> {
        let Some(receiver) = with_lock("receiver", &self.receiver, |mut r| r.take()) else {
            self.internals.teardown();
            return Ok(());
        };

        self.internals.begin_closing();
        if self.snapshot().is_attached() {
            let message = if self.internals.document.settings().run_in_editor {
                if let Err(e) = self.internals.stop_petri() {
                    tracing::debug!(error = %e, "stopping petri net before detaching");
                }
                Message::detach_and_exit()
            } else {
                Message::detach()
            };
            if let Err(e) = self.internals.send(message) {
                tracing::debug!(error = %e, "sending detach");
            }
        }

        if receiver.done.recv_timeout(DETACH_GRACE).is_err() {
            tracing::warn!("debug server did not end the session, closing the connection");
            self.internals.request_shutdown();
        }
        join(receiver);
        self.internals.teardown();
        Ok(())
    }

    /// Start executing the petri net, does nothing if it is already running
    pub fn start_petri(&self) -> eyre::Result<()> {
        self.command(|internals| internals.start_petri())
    }

    /// Stop executing the petri net, releasing a pause first
    pub fn stop_petri(&self) -> eyre::Result<()> {
        self.command(|internals| internals.stop_petri())
    }

    /// Pause or resume the petri net
    ///
    /// While the petri net is not running there is nothing to pause, subscribers are simply
    /// told the current state again.
    pub fn set_pause(&self, pause: bool) -> eyre::Result<()> {
        self.command(|internals| internals.set_pause(pause))
    }

    /// Rebuild the petri net and have the engine run the new build
    ///
    /// A petri net running in the editor is detached, rebuilt and attached again. A remote
    /// engine is asked to reload and, if `start_after_reload`, is started once it confirms.
    #[tracing::instrument(skip(self))]
    pub fn reload_petri(&self, start_after_reload: bool) -> eyre::Result<()> {
        self.internals.require_attached()?;
        self.stop_petri()?;

        if self.internals.document.settings().run_in_editor {
            self.detach()?;
            self.attach()?;
            if start_after_reload {
                self.start_petri()?;
            }
            Ok(())
        } else {
            self.command(|internals| internals.hot_reload(start_after_reload))
        }
    }

    /// Send the breakpoint set to the engine if the petri net is running
    ///
    /// Adding or removing a breakpoint does this already. Breakpoints set before attaching
    /// are sent once the handshake completes.
    pub fn update_breakpoints(&self) -> eyre::Result<()> {
        self.command(|internals| internals.update_breakpoints())
    }

    /// Returns false if the breakpoint was already set
    pub fn add_breakpoint(&self, id: EntityId) -> eyre::Result<bool> {
        let added = self.internals.breakpoints.insert(id);
        if added && self.snapshot().is_attached() {
            self.update_breakpoints()?;
        }
        Ok(added)
    }

    /// Returns false if there was no such breakpoint
    pub fn remove_breakpoint(&self, id: EntityId) -> eyre::Result<bool> {
        let removed = self.internals.breakpoints.remove(id);
        if removed && self.snapshot().is_attached() {
            self.update_breakpoints()?;
        }
        Ok(removed)
    }

    pub fn breakpoints(&self) -> Vec<EntityId> {
        self.internals.breakpoints.ids()
    }

    /// Token counts of the states last reported active
    pub fn active_states(&self) -> BTreeMap<EntityId, u32> {
        self.internals.active_states.snapshot()
    }

    pub fn is_active(&self, id: EntityId) -> bool {
        self.internals.active_states.count(id).is_some()
    }

    /// Evaluate `expression` in the context of the petri net
    ///
    /// The result arrives as [`Event::Evaluated`], immediately when the petri net runs in the
    /// editor and once the engine answers otherwise. Expressions using the petri net's
    /// variables (`$name`) need it to be running.
    pub fn evaluate(&self, expression: &str, user_data: &[String]) -> eyre::Result<()> {
        self.command(|internals| internals.evaluate(expression, user_data))
    }

    /// Run a command, ending the session if the connection failed underneath it
    fn command<T, F>(&self, f: F) -> eyre::Result<T>
    where
        F: FnOnce(&DebuggerInternals) -> eyre::Result<T>,
    {
        f(&self.internals).inspect_err(|e| {
            if e.downcast_ref::<CodecError>().is_some() {
                tracing::error!(error = %format!("{e:#}"), "lost connection to debug server");
                self.internals
                    .emit(Event::UnrecoverableError(format!("{e:#}")));
                if let Err(e) = self.detach() {
                    tracing::warn!(error = %e, "detaching after connection failure");
                }
            }
        })
    }
}

fn join(receiver: Receiver) {
    if receiver.thread.join().is_err() {
        tracing::error!("receiver thread panicked");
    }
}

impl Drop for DebugClient {
    fn drop(&mut self) {
        if self.session_state() != SessionState::Stopped {
            tracing::error!("debug client dropped while attached, detaching");
        }
        if let Err(e) = self.detach() {
            tracing::warn!(error = %e, "detaching on drop");
        }
    }
}
