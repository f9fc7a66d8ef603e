use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use clap::Parser;
use color_eyre::eyre::{self, Context};
use config::{DebugSettings, Language};
use crossbeam_channel::Receiver;
use debugger::{
    CodeGenerator, DebugClient, Document, Entity, EntityId, Event, LibraryLoader, NativeModule,
};
use tracing_subscriber::filter::EnvFilter;

const HELP: &str = "\
commands:
  attach | detach
  start | stop | pause | resume
  reload [start]      rebuild and reload, optionally starting afterwards
  break <id>          add a breakpoint
  unbreak <id>        remove a breakpoint
  breakpoints         list breakpoints
  states              list active states
  eval <expression>   evaluate an expression
  status | help | quit";

/// The command line has no document: every id is taken to be a state
struct CliDocument {
    settings: DebugSettings,
    hash: String,
}

impl Document for CliDocument {
    fn settings(&self) -> DebugSettings {
        self.settings.clone()
    }

    fn content_hash(&self) -> String {
        self.hash.clone()
    }

    fn entity_by_id(&self, id: EntityId) -> Option<Entity> {
        Some(Entity::state(id, format!("#{id}")))
    }

    fn source_path(&self) -> PathBuf {
        std::env::temp_dir().join("petri-debug").join("petri")
    }

    fn library_path(&self) -> PathBuf {
        std::env::temp_dir().join("petri-debug").join("petri.lib")
    }

    fn compile_source(&self, _source: &Path, _output: &Path) -> eyre::Result<String> {
        eyre::bail!("no compiler is available from the command line")
    }
}

struct NoCodeGenerator;

impl CodeGenerator for NoCodeGenerator {
    fn write_petri_source(&self, _output: &Path) -> eyre::Result<()> {
        eyre::bail!("no code generator is available from the command line")
    }

    fn write_expression_evaluator(
        &self,
        _expression: &str,
        _output: &Path,
        _user_data: &[String],
    ) -> eyre::Result<()> {
        eyre::bail!("no code generator is available from the command line")
    }
}

struct NoLoader;

impl LibraryLoader for NoLoader {
    fn load(&self, path: &Path) -> eyre::Result<Box<dyn NativeModule>> {
        eyre::bail!("cannot load {} from the command line", path.display())
    }
}

struct App {
    client: DebugClient,
    client_events: Receiver<Event>,
    input_rx: Receiver<String>,

    #[allow(dead_code)]
    input_thread: JoinHandle<()>,
}

impl App {
    fn new(client: DebugClient) -> Self {
        let client_events = client.events();

        // handle input
        let (input_tx, input_rx) = crossbeam_channel::unbounded();
        let input_thread = std::thread::spawn(move || {
            let mut buffer = String::new();
            loop {
                match std::io::stdin().read_line(&mut buffer) {
                    Ok(0) | Err(_) => {
                        let _ = input_tx.send("quit".to_string());
                        return;
                    }
                    Ok(_) => {
                        let _ = input_tx.send(buffer.trim().to_owned());
                        buffer.clear();
                    }
                }
            }
        });

        Self {
            client,
            client_events,
            input_rx,
            input_thread,
        }
    }

    fn loop_step(&mut self) -> eyre::Result<ShouldQuit> {
        print!("> ");
        std::io::stdout().flush()?;

        crossbeam_channel::select! {
            recv(self.input_rx) -> input => match input {
                Ok(input) => self.handle_input(&input),
                Err(_) => Ok(ShouldQuit::True),
            },
            recv(self.client_events) -> event => {
                if let Ok(event) = event {
                    self.handle_event(event);
                }
                Ok(ShouldQuit::False)
            },
        }
    }

    #[tracing::instrument(skip(self))]
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::StateChanged(snapshot) => {
                println!("session {:?}, petri net {:?}", snapshot.session, snapshot.execution)
            }
            Event::UnableToLoadModule(reason) => println!("unable to load module: {reason}"),
            Event::StatusMessage(text) => println!("{text}"),
            Event::Evaluated(value) => println!("= {value}"),
            Event::EvaluationFailed(reason) => println!("evaluation failed: {reason}"),
            Event::ServerError(text) => println!("debug server error: {text}"),
            Event::UnrecoverableError(text) => println!("session ended: {text}"),
            Event::ActiveStatesChanged(states) => print_states(&states),
        }
    }

    fn handle_input(&mut self, input: &str) -> eyre::Result<ShouldQuit> {
        let (command, argument) = match input.split_once(char::is_whitespace) {
            Some((command, argument)) => (command, argument.trim()),
            None => (input, ""),
        };

        let result = match command {
            "" => Ok(()),
            "q" | "quit" => return Ok(ShouldQuit::True),
            "help" => {
                println!("{HELP}");
                Ok(())
            }
            "attach" => self.client.attach(),
            "detach" => self.client.detach(),
            "start" => self.client.start_petri(),
            "stop" => self.client.stop_petri(),
            "pause" => self.client.set_pause(true),
            "resume" => self.client.set_pause(false),
            "reload" => self.client.reload_petri(argument == "start"),
            "break" => parse_id(argument).and_then(|id| {
                if !self.client.add_breakpoint(id)? {
                    println!("breakpoint {id} already set");
                }
                Ok(())
            }),
            "unbreak" => parse_id(argument).and_then(|id| {
                if !self.client.remove_breakpoint(id)? {
                    println!("no breakpoint on {id}");
                }
                Ok(())
            }),
            "breakpoints" => {
                let ids: Vec<String> = self
                    .client
                    .breakpoints()
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                println!("breakpoints: [{}]", ids.join(", "));
                Ok(())
            }
            "states" => {
                print_states(&self.client.active_states());
                Ok(())
            }
            "eval" => self.client.evaluate(argument, &[]),
            "status" => {
                let snapshot = self.client.snapshot();
                println!(
                    "session {:?}, petri net {:?}",
                    snapshot.session, snapshot.execution
                );
                Ok(())
            }
            other => {
                println!("unknown command '{other}', try 'help'");
                Ok(())
            }
        };

        // command failures are reported and the prompt continues
        if let Err(e) = result {
            tracing::warn!(error = %format!("{e:#}"), %command, "command failed");
            println!("error: {e:#}");
        }
        Ok(ShouldQuit::False)
    }
}

fn parse_id(argument: &str) -> eyre::Result<EntityId> {
    let id: u64 = argument
        .parse()
        .wrap_err_with(|| format!("invalid entity id '{argument}'"))?;
    Ok(EntityId(id))
}

fn print_states(states: &std::collections::BTreeMap<EntityId, u32>) {
    if states.is_empty() {
        println!("no active states");
        return;
    }
    for (id, count) in states {
        println!("  #{id}: {count}");
    }
}

#[derive(Debug, Parser)]
#[command(name = "petri-debug", about = "Debug a running petri net")]
struct Args {
    /// Settings file, defaults to the user configuration directory
    #[clap(short, long)]
    config: Option<PathBuf>,

    #[clap(long)]
    host: Option<String>,

    #[clap(short, long)]
    port: Option<u16>,

    #[clap(short, long)]
    language: Option<Language>,

    /// Hash of the build the engine is expected to run
    #[clap(long, default_value = "")]
    hash: String,

    #[clap(short, long)]
    breakpoints: Vec<u64>,

    /// Attach immediately
    #[clap(short, long)]
    attach: bool,
}

fn main() -> eyre::Result<()> {
    color_eyre::install().context("installing color_eyre")?;
    let log_file = std::fs::File::create("petri-debug.log")?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(Mutex::new(log_file))
        .init();

    let args = Args::parse();
    let mut settings =
        config::load_or_default(args.config.as_deref()).context("loading settings")?;
    if let Some(host) = args.host {
        settings.hostname = host;
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(language) = args.language {
        settings.language = language;
    }
    if settings.run_in_editor {
        tracing::warn!("running in the editor is not available from the command line");
        settings.run_in_editor = false;
    }
    tracing::debug!(?settings, "loaded settings");

    let document = CliDocument {
        settings,
        hash: args.hash,
    };
    let client = DebugClient::new(
        Arc::new(document),
        Arc::new(NoCodeGenerator),
        Arc::new(NoLoader),
    );
    for id in args.breakpoints {
        tracing::debug!(%id, "adding breakpoint");
        client
            .add_breakpoint(EntityId(id))
            .context("adding breakpoint")?;
    }

    let mut app = App::new(client);
    if args.attach {
        if let Err(e) = app.client.attach() {
            println!("error: {e:#}");
        }
    }

    loop {
        match app.loop_step() {
            Ok(ShouldQuit::True) => break,
            Ok(ShouldQuit::False) => {}
            Err(e) => eyre::bail!("Error running command: {e}"),
        }
    }

    app.client.detach().context("detaching")?;
    Ok(())
}

enum ShouldQuit {
    True,
    False,
}
