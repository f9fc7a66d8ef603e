//! Shared fixtures for the debug client tests
//!
//! [`MockEngine`] plays the debug server side of the protocol over TCP. The mock collaborators
//! stand in for the editor: documents, code generation, compilation and module loading.
#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    fs,
    io::IsTerminal,
    net::TcpListener,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use debugger::{
    CodeGenerator, DebugClient, DebugSettings, Document, Entity, EntityId, Event, Language,
    LibraryLoader, NativeModule,
};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;
use transport::{FrameReader, Message, PollResult, write_frame};

// test suite "constructor"
#[ctor::ctor]
fn init() {
    let in_ci = std::env::var("CI")
        .map(|val| val == "true")
        .unwrap_or(false);

    if std::io::stderr().is_terminal() || in_ci {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .json()
            .try_init();
    }

    // error traces
    let _ = color_eyre::install();
}

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Outgoing pseudo message that makes the mock engine drop the connection
const DISCONNECT: &str = "mock-disconnect";

/// How the mock engine answers `hello`
#[derive(Debug, Clone)]
pub enum Handshake {
    Accept,
    Reject(String),
    /// Answer with a message that is not part of the handshake
    Garbage,
    Silent,
}

/// Debug server side of the protocol
///
/// Every message the client sends is forwarded to [`MockEngine::next_message`]. Unless
/// created through [`MockEngine::without_acks`], control messages are acknowledged the way a
/// real engine does, and `detach`/`detachAndExit` are answered with a clean `kbye`.
#[derive(Clone)]
pub struct MockEngine {
    pub port: u16,
    incoming: Receiver<Message>,
    outgoing: Sender<Message>,
}

impl MockEngine {
    pub fn spawn(handshake: Handshake) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("binding mock engine");
        Self::serve(listener, handshake, true)
    }

    pub fn without_acks() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("binding mock engine");
        Self::serve(listener, Handshake::Accept, false)
    }

    pub fn on_port(port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).expect("binding mock engine");
        Self::serve(listener, Handshake::Accept, true)
    }

    fn serve(listener: TcpListener, handshake: Handshake, auto_ack: bool) -> Self {
        let port = listener.local_addr().expect("mock engine address").port();
        let (incoming_tx, incoming) = crossbeam_channel::unbounded();
        let (outgoing, outgoing_rx) = crossbeam_channel::unbounded::<Message>();

        thread::spawn(move || {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            drop(listener);
            stream
                .set_read_timeout(Some(Duration::from_millis(10)))
                .expect("setting read timeout");
            let mut writer = stream.try_clone().expect("cloning mock engine stream");
            let mut reader = FrameReader::new(stream);

            loop {
                while let Ok(message) = outgoing_rx.try_recv() {
                    if message.r#type == DISCONNECT {
                        return;
                    }
                    if write_frame(&mut writer, &message).is_err() {
                        return;
                    }
                }

                let message = match reader.try_poll_message() {
                    Ok(PollResult::Message(message)) => message,
                    Ok(PollResult::Idle) => continue,
                    Ok(PollResult::Closed) | Err(_) => return,
                };
                tracing::debug!(?message, "mock engine received message");
                let _ = incoming_tx.send(message.clone());

                let (reply, finished) = respond(&message, &handshake, auto_ack);
                if let Some(reply) = reply {
                    if write_frame(&mut writer, &reply).is_err() {
                        return;
                    }
                }
                if finished {
                    return;
                }
            }
        });

        Self {
            port,
            incoming,
            outgoing,
        }
    }

    /// Send a message to the client
    pub fn send(&self, message: Message) {
        self.outgoing
            .send(message)
            .expect("mock engine is not running");
    }

    /// Drop the connection without saying goodbye
    pub fn disconnect(&self) {
        self.send(Message::new(DISCONNECT, None));
    }

    pub fn next_message(&self) -> Message {
        match self.incoming.recv_timeout(TIMEOUT) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) => panic!("no message received by mock engine"),
            Err(RecvTimeoutError::Disconnected) => panic!("mock engine stopped"),
        }
    }

    /// Wait for the next message, asserting its type
    pub fn expect(&self, r#type: &str) -> Message {
        let message = self.next_message();
        assert_eq!(message.r#type, r#type, "unexpected message {message:?}");
        message
    }

    /// Assert that the client sends nothing for a while
    pub fn assert_quiet(&self) {
        if let Ok(message) = self.incoming.recv_timeout(Duration::from_millis(300)) {
            panic!("unexpected message {message:?}");
        }
    }
}

fn respond(message: &Message, handshake: &Handshake, auto_ack: bool) -> (Option<Message>, bool) {
    match message.r#type.as_str() {
        "hello" => match handshake {
            Handshake::Accept => (Some(Message::ehlo()), false),
            Handshake::Reject(reason) => (Some(Message::error(reason.clone())), true),
            Handshake::Garbage => (Some(Message::ack("start")), false),
            Handshake::Silent => (None, false),
        },
        "detach" if auto_ack => (Some(Message::detached(false, "kbye")), true),
        "detachAndExit" if auto_ack => (Some(Message::detached(true, "kbye")), true),
        "start" | "stop" | "pause" | "resume" | "reload" if auto_ack => {
            (Some(Message::ack(&message.r#type)), false)
        }
        _ => (None, false),
    }
}

/// Wraps a client and buffers events that a test is not waiting for yet
pub struct Harness {
    pub client: DebugClient,
    events: Receiver<Event>,
    buffer: VecDeque<Event>,
}

impl Harness {
    pub fn new(client: DebugClient) -> Self {
        let events = client.events();
        Self {
            client,
            events,
            buffer: VecDeque::new(),
        }
    }

    /// Wait for an event matching the predicate, buffering non-matching events
    #[tracing::instrument(skip(self, pred))]
    pub fn wait_for_event<F>(&mut self, message: &str, pred: F) -> Event
    where
        F: Fn(&Event) -> bool,
    {
        tracing::debug!("waiting for {message} event");
        loop {
            if let Some(pos) = self.buffer.iter().position(&pred) {
                return self.buffer.remove(pos).unwrap();
            }

            let event = match self.events.recv_timeout(TIMEOUT) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => {
                    panic!("timeout waiting for {message} event");
                }
                Err(RecvTimeoutError::Disconnected) => {
                    panic!("channel disconnected while waiting for {message} event");
                }
            };

            if pred(&event) {
                tracing::debug!(?event, "received expected event");
                return event;
            }
            tracing::trace!(?event, "non-matching event, buffering for later");
            self.buffer.push_back(event);
        }
    }

    /// All events published so far that have not been consumed
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events: Vec<Event> = self.buffer.drain(..).collect();
        events.extend(self.events.try_iter());
        events
    }
}

pub fn is_state_change(event: &Event) -> bool {
    matches!(event, Event::StateChanged(_))
}

/// Shared record of what the mock collaborators were asked to do
#[derive(Debug, Default)]
pub struct Log {
    entries: Mutex<Vec<String>>,
}

impl Log {
    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }
}

pub struct MockDocument {
    pub settings: Mutex<DebugSettings>,
    entities: HashMap<EntityId, Entity>,
    /// Diagnostics reported for the next compilations
    pub diagnostics: Mutex<String>,
    /// Source files that existed when they were compiled, with their contents
    pub compiled: Mutex<Vec<(PathBuf, String)>>,
    /// Modules written by the compiler
    pub outputs: Mutex<Vec<PathBuf>>,
    dir: TempDir,
}

impl MockDocument {
    pub fn new(settings: DebugSettings) -> Self {
        let entities = [
            Entity::state(1, "Idle"),
            Entity::state(2, "Working"),
            Entity::state(3, "Done"),
            Entity::transition(10, "begin"),
        ]
        .into_iter()
        .map(|entity| (entity.id, entity))
        .collect();

        Self {
            settings: Mutex::new(settings),
            entities,
            diagnostics: Mutex::new(String::new()),
            compiled: Mutex::new(Vec::new()),
            outputs: Mutex::new(Vec::new()),
            dir: tempfile::tempdir().expect("creating document directory"),
        }
    }

    pub fn remote(port: u16) -> Self {
        Self::new(DebugSettings {
            hostname: "127.0.0.1".to_string(),
            port,
            run_in_editor: false,
            language: Language::Cpp,
        })
    }

    pub fn in_editor(port: u16) -> Self {
        Self::new(DebugSettings {
            hostname: "127.0.0.1".to_string(),
            port,
            run_in_editor: true,
            language: Language::Cpp,
        })
    }
}

impl Document for MockDocument {
    fn settings(&self) -> DebugSettings {
        self.settings.lock().unwrap().clone()
    }

    fn content_hash(&self) -> String {
        "0123abcd".to_string()
    }

    fn entity_by_id(&self, id: EntityId) -> Option<Entity> {
        self.entities.get(&id).cloned()
    }

    fn source_path(&self) -> PathBuf {
        self.dir.path().join("petri.cpp")
    }

    fn library_path(&self) -> PathBuf {
        self.dir.path().join("petri.so")
    }

    fn compile_source(&self, source: &Path, output: &Path) -> eyre::Result<String> {
        let contents = fs::read_to_string(source)?;
        self.compiled
            .lock()
            .unwrap()
            .push((source.to_path_buf(), contents.clone()));

        let diagnostics = self.diagnostics.lock().unwrap().clone();
        if diagnostics.is_empty() {
            fs::write(output, contents)?;
            self.outputs.lock().unwrap().push(output.to_path_buf());
        }
        Ok(diagnostics)
    }
}

#[derive(Default)]
pub struct MockGenerator {
    pub evaluators: Mutex<Vec<(String, Vec<String>)>>,
}

impl CodeGenerator for MockGenerator {
    fn write_petri_source(&self, output: &Path) -> eyre::Result<()> {
        fs::write(output, "petri")?;
        Ok(())
    }

    fn write_expression_evaluator(
        &self,
        expression: &str,
        output: &Path,
        user_data: &[String],
    ) -> eyre::Result<()> {
        self.evaluators
            .lock()
            .unwrap()
            .push((expression.to_string(), user_data.to_vec()));
        fs::write(output, format!("evaluate {expression}"))?;
        Ok(())
    }
}

/// Loads modules compiled by [`MockDocument`]
///
/// The petri net module hosts a [`MockEngine`] as its debug server. Evaluator modules answer
/// with the expression they were generated from.
pub struct MockLoader {
    pub log: Arc<Log>,
    pub fail: Mutex<bool>,
    /// Engines started by petri net modules, most recent last
    pub engines: Arc<Mutex<Vec<MockEngine>>>,
}

impl MockLoader {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Log::default()),
            fail: Mutex::new(false),
            engines: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn engine(&self) -> MockEngine {
        self.engines
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no debug server started")
    }
}

impl LibraryLoader for MockLoader {
    fn load(&self, path: &Path) -> eyre::Result<Box<dyn NativeModule>> {
        if *self.fail.lock().unwrap() {
            eyre::bail!("no such module");
        }
        let contents = fs::read_to_string(path)?;
        self.log.push(format!("load {contents}"));
        Ok(Box::new(MockModule {
            contents,
            path: path.to_path_buf(),
            log: Arc::clone(&self.log),
            engines: Arc::clone(&self.engines),
        }))
    }
}

struct MockModule {
    contents: String,
    path: PathBuf,
    log: Arc<Log>,
    engines: Arc<Mutex<Vec<MockEngine>>>,
}

impl NativeModule for MockModule {
    fn start_debug_server(&mut self, port: u16) -> eyre::Result<()> {
        self.log.push("start server");
        self.engines.lock().unwrap().push(MockEngine::on_port(port));
        Ok(())
    }

    fn stop_debug_server(&mut self) {
        self.log.push("stop server");
    }

    fn evaluate(&self, instance: &dyn NativeModule) -> eyre::Result<String> {
        // the module file must still exist while it is loaded
        assert!(self.path.exists());
        let _ = instance;
        let expression = self
            .contents
            .strip_prefix("evaluate ")
            .ok_or_else(|| eyre::eyre!("not an evaluator"))?;
        Ok(format!("{expression} = 42"))
    }

    fn unload(&mut self) {
        self.log.push(format!("unload {}", self.contents));
    }
}

pub struct Fixture {
    pub document: Arc<MockDocument>,
    pub generator: Arc<MockGenerator>,
    pub loader: Arc<MockLoader>,
}

impl Fixture {
    pub fn new(document: MockDocument) -> Self {
        Self {
            document: Arc::new(document),
            generator: Arc::new(MockGenerator::default()),
            loader: Arc::new(MockLoader::new()),
        }
    }

    pub fn client(&self) -> Harness {
        Harness::new(DebugClient::new(
            Arc::clone(&self.document) as Arc<dyn Document>,
            Arc::clone(&self.generator) as Arc<dyn CodeGenerator>,
            Arc::clone(&self.loader) as Arc<dyn LibraryLoader>,
        ))
    }
}

/// Attach to `engine`, consuming the handshake messages
pub fn attached(fixture: &Fixture, engine: &MockEngine) -> Harness {
    let mut harness = fixture.client();
    harness.client.attach().expect("attaching");
    engine.expect("hello");
    engine.expect("breakpoints");
    harness.wait_for_event("attached", |e| {
        matches!(e, Event::StateChanged(s) if s.is_attached())
    });
    harness
}
