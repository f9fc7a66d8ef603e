use std::{
    collections::{BTreeMap, HashMap},
    io::{Read, Write},
    net::TcpStream,
    ops::ControlFlow,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crossbeam_channel::Sender;
use eyre::WrapErr;
use tempfile::TempPath;
use transport::{
    Ack, CLEAN_DETACH_REASON, FrameReader, FrameTransport, Incoming, Message, PollResult,
    StateCount, TcpTransport, io::ShutdownHandle, write_frame,
};

use crate::{
    collaborators::{CodeGenerator, Document, EmbeddedServer, LibraryLoader, LoadedModule},
    error::DebugError,
    registry::{ActiveStates, Breakpoints},
    state::{ClientState, Event, Execution, Snapshot, Transition},
    types::EntityId,
    utils::with_lock,
};

/// Version announced to the debug server in the handshake
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared between the caller facing client and its receiver thread
pub(crate) struct DebuggerInternals {
    pub(crate) document: Arc<dyn Document>,
    pub(crate) generator: Arc<dyn CodeGenerator>,
    pub(crate) loader: Arc<dyn LibraryLoader>,
    publisher: Sender<Event>,

    state: Mutex<ClientState>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    connection: Mutex<Option<ShutdownHandle>>,
    pub(crate) embedded: Mutex<Option<EmbeddedServer>>,

    pub(crate) breakpoints: Breakpoints,
    pub(crate) active_states: ActiveStates,
    /// Evaluator modules handed to a remote engine, deleted once it has answered
    pub(crate) pending_evaluations: Mutex<HashMap<PathBuf, TempPath>>,

    start_after_reload: AtomicBool,
    /// A `start` has been sent and not yet acknowledged
    start_requested: AtomicBool,
    /// Set while detaching: the connection going away is expected
    closing: AtomicBool,
    /// Tells the receiver thread to stop at its next idle poll
    shutdown: AtomicBool,
}

impl DebuggerInternals {
    pub(crate) fn new(
        document: Arc<dyn Document>,
        generator: Arc<dyn CodeGenerator>,
        loader: Arc<dyn LibraryLoader>,
        publisher: Sender<Event>,
    ) -> Self {
        Self {
            document,
            generator,
            loader,
            publisher,
            state: Mutex::new(ClientState::default()),
            writer: Mutex::new(None),
            connection: Mutex::new(None),
            embedded: Mutex::new(None),
            breakpoints: Breakpoints::default(),
            active_states: ActiveStates::default(),
            pending_evaluations: Mutex::new(HashMap::new()),
            start_after_reload: AtomicBool::new(false),
            start_requested: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    pub(crate) fn emit(&self, event: Event) {
        tracing::debug!(?event, "publishing event");
        let _ = self.publisher.send(event);
    }

    pub(crate) fn status(&self, message: &str) {
        self.emit(Event::StatusMessage(message.to_string()));
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        with_lock("state", &self.state, |state| state.snapshot())
    }

    pub(crate) fn require_attached(&self) -> Result<Snapshot, DebugError> {
        let snapshot = self.snapshot();
        if snapshot.is_attached() {
            Ok(snapshot)
        } else {
            Err(DebugError::NotAttached)
        }
    }

    /// Apply a transition, notifying subscribers before the state lock is released
    pub(crate) fn transition(&self, transition: Transition) -> Result<Snapshot, DebugError> {
        with_lock("state", &self.state, |mut state| {
            let next = state.apply(transition)?;
            *state = next;
            let snapshot = next.snapshot();
            tracing::debug!(?transition, ?snapshot, "state changed");
            self.emit(Event::StateChanged(snapshot));
            Ok(snapshot)
        })
    }

    /// Like [`Self::transition`], but an illegal transition is only logged
    fn try_transition(&self, transition: Transition) -> bool {
        match self.transition(transition) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring state change");
                false
            }
        }
    }

    /// Publish the current state without changing it
    pub(crate) fn notify_state(&self) {
        with_lock("state", &self.state, |state| {
            self.emit(Event::StateChanged(state.snapshot()))
        });
    }

    pub(crate) fn begin_attach(&self) -> Result<(), DebugError> {
        self.transition(Transition::BeginAttach)
            .map_err(|_| DebugError::AlreadyAttached)?;
        self.closing.store(false, Ordering::SeqCst);
        self.shutdown.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn begin_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// Stop the receiver thread without waiting for the server
    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        with_lock("connection", &self.connection, |connection| {
            if let Some(connection) = connection.as_ref() {
                connection.shutdown();
            }
        });
    }

    #[tracing::instrument(skip(self, message), fields(kind = %message.r#type))]
    pub(crate) fn send(&self, message: Message) -> eyre::Result<()> {
        tracing::debug!("sending message");
        with_lock("writer", &self.writer, |mut writer| match writer.as_mut() {
            Some(writer) => write_frame(&mut **writer, &message)
                .wrap_err_with(|| format!("sending {} message", message.r#type)),
            None => Err(DebugError::NotAttached.into()),
        })
    }

    /// Build the petri net from the current document
    pub(crate) fn rebuild(&self) -> eyre::Result<PathBuf> {
        let source = self.document.source_path();
        let library = self.document.library_path();
        tracing::debug!(source = %source.display(), library = %library.display(), "building petri net");

        self.generator
            .write_petri_source(&source)
            .wrap_err("generating petri net source")?;
        let diagnostics = self
            .document
            .compile_source(&source, &library)
            .wrap_err("compiling petri net")?;
        if !diagnostics.trim().is_empty() {
            return Err(DebugError::Compilation(diagnostics).into());
        }
        Ok(library)
    }

    /// Build and load the petri net into this process, hosting its debug server on `port`
    pub(crate) fn start_embedded_server(&self, port: u16) -> eyre::Result<()> {
        let library = self.rebuild()?;
        let module = LoadedModule::load(&*self.loader, &library).inspect_err(|e| {
            self.emit(Event::UnableToLoadModule(e.to_string()));
        })?;
        let server = EmbeddedServer::start(module, port).wrap_err("starting debug server")?;
        with_lock("embedded", &self.embedded, |mut embedded| {
            *embedded = Some(server)
        });
        Ok(())
    }

    /// Body of the receiver thread
    ///
    /// Connects, performs the handshake, reports its outcome through `established` and then
    /// processes messages until the session ends.
    pub(crate) fn run_receiver(
        &self,
        host: &str,
        port: u16,
        established: oneshot::Sender<eyre::Result<()>>,
    ) {
        let reader = match self.connect(host, port) {
            Ok(reader) => reader,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "unable to attach");
                self.teardown();
                self.emit(Event::UnrecoverableError(format!("{e:#}")));
                if established.send(Err(e)).is_err() {
                    tracing::debug!("attach gave up waiting");
                }
                return;
            }
        };
        if established.send(Ok(())).is_err() {
            tracing::debug!("attach gave up waiting");
        }

        let result = self.receive(reader);
        self.teardown();
        match result {
            Ok(()) => tracing::debug!("session ended"),
            Err(e) if self.closing.load(Ordering::SeqCst) => {
                tracing::debug!(error = %e, "connection error while detaching");
            }
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "session ended abnormally");
                self.emit(Event::UnrecoverableError(format!("{e:#}")));
            }
        }
    }

    fn connect(&self, host: &str, port: u16) -> eyre::Result<FrameReader<TcpStream>> {
        let transport = TcpTransport::connect_timeout((host, port), CONNECT_TIMEOUT)
            .wrap_err_with(|| format!("connecting to debug server at {host}:{port}"))?;
        let connection = transport.shutdown_handle()?;
        let (reader, writer) = transport.split()?;
        with_lock("connection", &self.connection, |mut c| *c = Some(connection));
        with_lock("writer", &self.writer, |mut w| *w = Some(Box::new(writer)));

        self.send(Message::hello(CLIENT_VERSION))?;
        let mut reader = FrameReader::new(reader);
        match self.wait_for_handshake(&mut reader)? {
            Incoming::Ehlo => {}
            Incoming::Error(reason) => return Err(DebugError::HandshakeRejected(reason).into()),
            other => return Err(DebugError::InvalidHandshake(format!("{other:?}")).into()),
        }

        self.transition(Transition::Handshaken)?;
        self.send_breakpoints()?;
        self.status("Attached to the debug server");
        Ok(reader)
    }

    fn wait_for_handshake<R: Read>(&self, reader: &mut FrameReader<R>) -> eyre::Result<Incoming> {
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            match reader
                .try_poll_message()
                .wrap_err("waiting for handshake reply")?
            {
                PollResult::Message(message) => {
                    return Incoming::parse(message)
                        .map_err(|e| DebugError::InvalidHandshake(e.to_string()).into());
                }
                PollResult::Closed => {
                    return Err(DebugError::InvalidHandshake("connection closed".into()).into());
                }
                PollResult::Idle => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        eyre::bail!("attach cancelled");
                    }
                    if Instant::now() >= deadline {
                        return Err(DebugError::InvalidHandshake("no reply".into()).into());
                    }
                }
            }
        }
    }

    fn receive<R: Read>(&self, mut reader: FrameReader<R>) -> eyre::Result<()> {
        loop {
            let message = match reader.try_poll_message() {
                Ok(PollResult::Message(message)) => message,
                Ok(PollResult::Idle) => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        tracing::debug!("receiver shutting down");
                        return Ok(());
                    }
                    continue;
                }
                Ok(PollResult::Closed) => {
                    if self.closing.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    eyre::bail!("the debug server closed the connection");
                }
                Err(e) => return Err(e).wrap_err("reading from debug server"),
            };

            tracing::debug!(?message, "received message");
            if self.on_message(message)?.is_break() {
                return Ok(());
            }
        }
    }

    fn on_message(&self, message: Message) -> eyre::Result<ControlFlow<()>> {
        let incoming = Incoming::parse(message).wrap_err("invalid message from debug server")?;
        match incoming {
            Incoming::Ack(ack) => self.on_ack(ack)?,
            Incoming::Error(text) => {
                tracing::warn!(%text, "debug server reported an error");
                self.start_requested.store(false, Ordering::SeqCst);
                self.emit(Event::ServerError(text));
                if self.snapshot().is_running() {
                    self.stop_petri()?;
                }
            }
            Incoming::Detach { reason, .. } if reason == CLEAN_DETACH_REASON => {
                tracing::debug!("debug server ended the session");
                return Ok(ControlFlow::Break(()));
            }
            Incoming::Detach { reason, .. } => {
                return Err(DebugError::RemoteTermination(reason).into());
            }
            Incoming::States(states) => self.on_states(states)?,
            Incoming::Evaluation { eval, lib } => {
                if let Some(lib) = lib {
                    self.finish_evaluation(&lib);
                }
                self.emit(Event::Evaluated(eval));
            }
            Incoming::Ehlo => tracing::warn!("unexpected ehlo outside of the handshake"),
            Incoming::Other(kind) => tracing::debug!(%kind, "ignoring message"),
        }
        Ok(ControlFlow::Continue(()))
    }

    fn on_ack(&self, ack: Ack) -> eyre::Result<()> {
        match ack {
            Ack::Start => {
                self.start_requested.store(false, Ordering::SeqCst);
                if self.try_transition(Transition::PetriStarted) {
                    self.send_breakpoints()?;
                    self.status("The petri net is running");
                }
            }
            Ack::Stop => tracing::debug!("debug server stopped the petri net"),
            Ack::Stopped => self.petri_stopped(),
            Ack::Pause => {
                if self.try_transition(Transition::Paused) {
                    self.status("The petri net is paused");
                }
            }
            Ack::Resume => {
                if self.try_transition(Transition::Resumed) {
                    self.status("The petri net is running");
                }
            }
            Ack::Reload => {
                self.status("The petri net has been reloaded");
                if self.start_after_reload.swap(false, Ordering::SeqCst) {
                    self.start_petri()?;
                }
            }
            Ack::Other(operation) => tracing::debug!(%operation, "ignoring acknowledgement"),
        }
        Ok(())
    }

    fn on_states(&self, states: Vec<StateCount>) -> eyre::Result<()> {
        let mut counts = BTreeMap::new();
        for StateCount { id, count } in states {
            let id = EntityId(id);
            match self.document.entity_by_id(id) {
                None => return Err(DebugError::UnknownEntity(id).into()),
                Some(entity) if !entity.is_state() => {
                    return Err(DebugError::NotAState(id).into());
                }
                Some(_) => {
                    counts.insert(id, count);
                }
            }
        }
        self.active_states.replace(counts, |counts| {
            self.emit(Event::ActiveStatesChanged(counts.clone()))
        });
        Ok(())
    }

    /// Local part of stopping the petri net
    fn petri_stopped(&self) {
        self.start_requested.store(false, Ordering::SeqCst);
        if self.try_transition(Transition::PetriStopped) {
            self.active_states.clear(|counts| {
                self.emit(Event::ActiveStatesChanged(counts.clone()))
            });
            self.status("The petri net is stopped");
        }
    }

    fn send_breakpoints(&self) -> eyre::Result<()> {
        let ids = self.breakpoints.ids();
        self.send(Message::breakpoints(ids.into_iter().map(|id| id.0)))
    }

    pub(crate) fn start_petri(&self) -> eyre::Result<()> {
        let snapshot = self.require_attached()?;
        if snapshot.is_running() {
            tracing::debug!("petri net already running");
            return Ok(());
        }
        if self.start_requested.swap(true, Ordering::SeqCst) {
            tracing::debug!("petri net start already requested");
            return Ok(());
        }
        self.send(Message::start(&self.document.content_hash()))
            .inspect_err(|_| self.start_requested.store(false, Ordering::SeqCst))
    }

    pub(crate) fn stop_petri(&self) -> eyre::Result<()> {
        let snapshot = self.require_attached()?;
        match snapshot.execution {
            Execution::Idle => {
                tracing::debug!("petri net not running");
                return Ok(());
            }
            Execution::Paused => {
                self.send(Message::resume())?;
                self.send(Message::stop())?;
            }
            Execution::Running => self.send(Message::stop())?,
        }
        self.petri_stopped();
        Ok(())
    }

    pub(crate) fn set_pause(&self, pause: bool) -> eyre::Result<()> {
        match (self.require_attached()?.execution, pause) {
            (Execution::Idle, _) => self.notify_state(),
            (Execution::Running, true) => self.send(Message::pause())?,
            (Execution::Paused, false) => self.send(Message::resume())?,
            _ => tracing::debug!(%pause, "petri net already in the requested state"),
        }
        Ok(())
    }

    pub(crate) fn update_breakpoints(&self) -> eyre::Result<()> {
        if self.require_attached()?.is_running() {
            self.send_breakpoints()
        } else {
            Ok(())
        }
    }

    /// Rebuild and ask the connected engine to swap in the new build
    pub(crate) fn hot_reload(&self, start_after_reload: bool) -> eyre::Result<()> {
        self.rebuild()?;
        self.start_after_reload
            .store(start_after_reload, Ordering::SeqCst);
        self.send(Message::reload())
    }

    /// Release everything held for the session and return to [`ClientState::Stopped`]
    ///
    /// Safe to call more than once, subscribers are only notified of actual changes.
    pub(crate) fn teardown(&self) {
        if let Some(connection) = with_lock("connection", &self.connection, |mut c| c.take()) {
            connection.shutdown();
        }
        drop(with_lock("writer", &self.writer, |mut w| w.take()));
        drop(with_lock(
            "pending evaluations",
            &self.pending_evaluations,
            |mut pending| std::mem::take(&mut *pending),
        ));
        self.start_after_reload.store(false, Ordering::SeqCst);
        self.start_requested.store(false, Ordering::SeqCst);
        drop(with_lock("embedded", &self.embedded, |mut e| e.take()));

        with_lock("state", &self.state, |mut state| {
            if *state != ClientState::Stopped {
                *state = ClientState::Stopped;
                self.emit(Event::StateChanged(state.snapshot()));
            }
        });
        self.active_states.clear(|counts| {
            self.emit(Event::ActiveStatesChanged(counts.clone()))
        });
    }
}
