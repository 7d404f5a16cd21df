//! bridged - terminal sessions and on-device inference over stdin/stdout
//!
//! Reads one request per line and answers with one JSON line. Events
//! (session output, exits, training progress) are printed as JSON lines as
//! they happen.
//!
//! # Quick Start
//!
//! ```text
//! bridged                 # PTY sessions with the default shell
//! bridged --loopback      # In-process echo sessions (demo mode)
//! bridged -c my.toml      # Explicit configuration file
//! ```
//!
//! # Requests
//!
//! | Request | Action |
//! |---------|--------|
//! | `new [cwd]` | Create a session |
//! | `exec <id> <command...>` | Run a command, return the transcript |
//! | `read <id>` | Return the transcript |
//! | `resize <id> <cols> <rows>` | Resize a session |
//! | `close <id>` | Close a session |
//! | `list` | List live sessions |
//! | `load <path> [accel] [in] [out]` | Load a model |
//! | `unload` | Drop the active model |
//! | `infer <v,v,...>` | Run inference |
//! | `train <epochs> <lr> [batch] [split]` | Start a training run |
//! | `stop` | Stop the training run |
//! | `device` | Show accelerators and supported operations |

use std::env;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use serde_json::{json, Value};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bridged::config::{self, Config};
use bridged::core::{
    CommandDispatcher, LoopbackBackend, PtyBackend, SessionId, SessionOptions, SessionRegistry,
    TerminalBackend,
};
use bridged::events::EventEmitter;
use bridged::inference::{
    Accelerator, DenseBackend, InferencePipeline, ModelConfig, Trainer, TrainingConfig,
};
use bridged::{BridgeError, Result};

/// Command line options
#[derive(Debug, Default)]
struct CliArgs {
    /// Explicit configuration file
    config: Option<PathBuf>,
    /// Shell override
    shell: Option<String>,
    /// Use the in-process echo backend
    loopback: bool,
}

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_version() {
    eprintln!("bridged {}", VERSION);
}

fn print_help() {
    eprintln!("bridged {} - terminal sessions and on-device inference", VERSION);
    eprintln!();
    eprintln!("Usage: bridged [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config <PATH>   Configuration file (default: ~/.bridged/config.toml)");
    eprintln!("  -s, --shell <CMD>     Shell for new sessions");
    eprintln!("      --loopback        Echo sessions instead of a real PTY");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("{}", REQUEST_HELP);
    eprintln!();
    eprintln!("Logs: ~/.bridged/bridged.log (RUST_LOG overrides the configured level)");
}

const REQUEST_HELP: &str = "\
Requests (one per line):
  new [cwd]                          Create a session
  exec <id> <command...>             Run a command and capture the transcript
  read <id>                          Full transcript
  resize <id> <cols> <rows>          Resize a session
  close <id>                         Close a session
  list                               Live sessions
  load <path> [accel] [in] [out]     Load a model (accel: cpu, gpu, npu, auto)
  unload                             Drop the active model
  infer <v,v,...>                    Run inference
  train <epochs> <lr> [batch] [split]  Start a training run
  stop                               Stop the training run
  device                             Accelerators and supported operations
  quit                               Exit";

fn parse_args() -> std::result::Result<CliArgs, String> {
    let args: Vec<String> = env::args().collect();
    let mut cli = CliArgs::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-c" | "--config" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing config path".to_string());
                }
                cli.config = Some(PathBuf::from(&args[i]));
            }
            "-s" | "--shell" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing shell argument".to_string());
                }
                cli.shell = Some(args[i].clone());
            }
            "--loopback" => {
                cli.loopback = true;
            }
            arg => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
        }
        i += 1;
    }

    Ok(cli)
}

/// Log to ~/.bridged/bridged.log; stdout carries the protocol
fn init_logging(level: &str) {
    let log_path = config::data_dir()
        .map(|dir| dir.join("bridged.log"))
        .unwrap_or_else(|| PathBuf::from("bridged.log"));

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .try_init();
    }
}

/// A parsed request line
#[derive(Debug, Clone, PartialEq)]
enum Request {
    New { cwd: Option<PathBuf> },
    Exec { id: SessionId, command: String },
    Read { id: SessionId },
    Resize { id: SessionId, cols: u16, rows: u16 },
    Close { id: SessionId },
    List,
    Load(ModelConfig),
    Unload,
    Infer(Vec<f32>),
    Train(TrainingConfig),
    Stop,
    Device,
    Help,
    Quit,
}

fn arg<'a>(words: &[&'a str], index: usize, name: &str) -> Result<&'a str> {
    words
        .get(index)
        .copied()
        .ok_or_else(|| BridgeError::InvalidArgument(format!("missing {}", name)))
}

fn number<T: std::str::FromStr>(word: &str, name: &str) -> Result<T> {
    word.parse()
        .map_err(|_| BridgeError::InvalidArgument(format!("invalid {} '{}'", name, word)))
}

fn parse_request(line: &str) -> Result<Option<Request>> {
    let line = line.trim();
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some(&verb) = words.first() else {
        return Ok(None);
    };
    let id = |index: usize| arg(&words, index, "session id").map(SessionId::from);

    let request = match verb {
        "new" => Request::New {
            cwd: words.get(1).map(PathBuf::from),
        },
        "exec" => {
            let id = id(1)?;
            // Keep the command's own spacing
            let command = line[verb.len()..]
                .trim_start()
                .strip_prefix(id.as_str())
                .map(str::trim_start)
                .unwrap_or_default()
                .to_string();
            if command.is_empty() {
                return Err(BridgeError::InvalidArgument("missing command".to_string()));
            }
            Request::Exec { id, command }
        }
        "read" => Request::Read { id: id(1)? },
        "resize" => Request::Resize {
            id: id(1)?,
            cols: number(arg(&words, 2, "cols")?, "cols")?,
            rows: number(arg(&words, 3, "rows")?, "rows")?,
        },
        "close" => Request::Close { id: id(1)? },
        "list" => Request::List,
        "load" => {
            let mut model = ModelConfig::new(arg(&words, 1, "model path")?);
            if let Some(accel) = words.get(2) {
                model = model.with_accelerator(accel.parse::<Accelerator>()?);
            }
            if let Some(input) = words.get(3) {
                model.input_shape = vec![number(input, "input width")?];
            }
            if let Some(output) = words.get(4) {
                model.output_shape = vec![number(output, "output width")?];
            }
            Request::Load(model)
        }
        "unload" => Request::Unload,
        "infer" => {
            let values = words[1..]
                .join(" ")
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|v| !v.is_empty())
                .map(|v| number(v, "input value"))
                .collect::<Result<Vec<f32>>>()?;
            Request::Infer(values)
        }
        "train" => {
            let defaults = TrainingConfig::default();
            Request::Train(TrainingConfig {
                epochs: number(arg(&words, 1, "epochs")?, "epochs")?,
                learning_rate: number(arg(&words, 2, "learning rate")?, "learning rate")?,
                batch_size: match words.get(3) {
                    Some(w) => number(w, "batch size")?,
                    None => defaults.batch_size,
                },
                validation_split: match words.get(4) {
                    Some(w) => number(w, "validation split")?,
                    None => defaults.validation_split,
                },
            })
        }
        "stop" => Request::Stop,
        "device" => Request::Device,
        "help" => Request::Help,
        "quit" | "exit" => Request::Quit,
        other => {
            return Err(BridgeError::InvalidArgument(format!("unknown request '{}'", other)));
        }
    };
    Ok(Some(request))
}

/// Everything a request can touch
struct Service {
    config: Config,
    dispatcher: CommandDispatcher,
    pipeline: Arc<InferencePipeline>,
    trainer: Trainer,
}

impl Service {
    fn new(config: Config, backend: Arc<dyn TerminalBackend>, events: EventEmitter) -> Self {
        let registry = Arc::new(SessionRegistry::with_config(
            backend,
            events.clone(),
            &config.session,
        ));
        let dispatcher = CommandDispatcher::new(registry, config.session.settle());
        let pipeline = Arc::new(InferencePipeline::new(
            Arc::new(DenseBackend::new()),
            &config.inference,
        ));
        let trainer = Trainer::new(pipeline.clone(), events, config.training.epoch_interval());

        Self {
            config,
            dispatcher,
            pipeline,
            trainer,
        }
    }

    fn handle(&self, request: Request) -> Result<Value> {
        let registry = self.dispatcher.registry();

        Ok(match request {
            Request::New { cwd } => {
                let mut options = SessionOptions::from_config(&self.config);
                if let Some(cwd) = cwd {
                    options = options.with_cwd(cwd);
                }
                json!({ "session": registry.create(&options)? })
            }
            Request::Exec { id, command } => json!(self.dispatcher.execute(&id, &command)?),
            Request::Read { id } => {
                json!({ "session": id, "transcript": self.dispatcher.read(&id)? })
            }
            Request::Resize { id, cols, rows } => {
                self.dispatcher.resize(&id, cols, rows)?;
                json!({ "session": id, "cols": cols, "rows": rows })
            }
            Request::Close { id } => {
                self.dispatcher.close(&id)?;
                json!(true)
            }
            Request::List => json!(registry.list()),
            Request::Load(model) => {
                let handle = self.pipeline.load(&model)?;
                json!({
                    "path": handle.path,
                    "accelerator": handle.accelerator,
                    "inputWidth": handle.input_width,
                    "outputWidth": handle.output_width,
                })
            }
            Request::Unload => json!(self.pipeline.unload()),
            Request::Infer(values) => {
                let result = self.pipeline.infer(&values)?;
                json!({ "output": result.outputs, "latencyMs": result.latency_ms() })
            }
            Request::Train(training) => {
                self.trainer.start(training)?;
                json!(true)
            }
            Request::Stop => json!(self.trainer.stop()),
            Request::Device => json!(self.pipeline.device_info()),
            Request::Help => json!(REQUEST_HELP),
            Request::Quit => json!("bye"),
        })
    }

    fn shutdown(&self) {
        self.trainer.stop();
        self.dispatcher.registry().clear();
    }
}

fn respond(result: Result<Value>) -> Value {
    match result {
        Ok(value) => json!({ "ok": value }),
        Err(e) => json!({ "error": { "code": e.code(), "message": e.to_string() } }),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = match parse_args() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    if cli.shell.is_some() {
        config.shell = cli.shell.clone();
    }

    init_logging(&config.log_level);
    info!("bridged {} starting (loopback: {})", VERSION, cli.loopback);

    let backend: Arc<dyn TerminalBackend> = if cli.loopback {
        Arc::new(LoopbackBackend::new())
    } else {
        Arc::new(PtyBackend::new())
    };

    let events = EventEmitter::new();
    let event_rx = events.subscribe();
    thread::Builder::new()
        .name("events".to_string())
        .spawn(move || {
            for event in event_rx {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Failed to encode {} event: {}", event.name(), e),
                }
            }
        })?;

    let service = Service::new(config, backend, events);

    for line in io::stdin().lock().lines() {
        let line = line?;
        let request = match parse_request(&line) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(e) => {
                println!("{}", respond(Err(e)));
                continue;
            }
        };

        let quit = request == Request::Quit;
        let response = respond(service.handle(request));
        if let Some(err) = response.get("error") {
            error!("Request failed: {}", err);
        }
        println!("{}", response);

        if quit {
            break;
        }
    }

    service.shutdown();
    info!("bridged exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exec_keeps_spacing() {
        let request = parse_request("exec session-1 echo  'a  b'").unwrap().unwrap();
        assert_eq!(
            request,
            Request::Exec {
                id: SessionId::from("session-1"),
                command: "echo  'a  b'".to_string(),
            }
        );
        assert!(parse_request("exec session-1").is_err());
    }

    #[test]
    fn test_parse_numbers() {
        assert_eq!(
            parse_request("resize session-2 40 10").unwrap(),
            Some(Request::Resize {
                id: SessionId::from("session-2"),
                cols: 40,
                rows: 10,
            })
        );
        assert_eq!(
            parse_request("infer 1, 2.5,-3").unwrap(),
            Some(Request::Infer(vec![1.0, 2.5, -3.0]))
        );
        assert_eq!(
            parse_request("resize session-2 wide 10").unwrap_err().code(),
            "INVALID_ARGUMENT"
        );
    }

    #[test]
    fn test_parse_load_and_train() {
        let Some(Request::Load(model)) = parse_request("load m.toml npu 3 1").unwrap() else {
            panic!("expected load");
        };
        assert_eq!(model.accelerator, Accelerator::Npu);
        assert_eq!(model.input_shape, vec![3]);
        assert_eq!(model.output_shape, vec![1]);

        let Some(Request::Train(training)) = parse_request("train 5 0.01").unwrap() else {
            panic!("expected train");
        };
        assert_eq!(training.epochs, 5);
        assert_eq!(training.batch_size, TrainingConfig::default().batch_size);

        assert!(parse_request("load m.toml tpu").is_err());
    }

    #[test]
    fn test_blank_and_unknown() {
        assert_eq!(parse_request("   ").unwrap(), None);
        assert!(parse_request("launch").is_err());
    }

    #[test]
    fn test_service_round_trip() {
        let mut config = Config::default();
        config.session.settle_ms = 50;
        let service = Service::new(config, Arc::new(LoopbackBackend::new()), EventEmitter::new());

        let created = respond(service.handle(Request::New { cwd: None }));
        let id = created["ok"]["session"].as_str().unwrap().to_string();
        assert_eq!(id, "session-1");

        let request = parse_request(&format!("exec {} echo hello", id)).unwrap().unwrap();
        let output = respond(service.handle(request));
        assert!(output["ok"]["transcript"].as_str().unwrap().contains("hello"));

        let missing = respond(service.handle(Request::Read {
            id: SessionId::from("session-9"),
        }));
        assert_eq!(missing["error"]["code"], "NOT_FOUND");

        let infer = respond(service.handle(Request::Infer(vec![1.0])));
        assert_eq!(infer["error"]["code"], "NOT_LOADED");

        service.shutdown();
        assert!(service.dispatcher.registry().is_empty());
    }
}
