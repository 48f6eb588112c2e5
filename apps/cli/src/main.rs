use std::cell::Cell;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;

use cannuccia_core::config::Config;
use cannuccia_core::engine::Engine;
use cannuccia_core::events::ProgressHandler;
use cannuccia_core::ops::{FlashElfOp, Operation, StartDevicesOp, StopDevicesOp};
use clap::Parser;
use tracing::{error, info};

const EXIT_INIT_FAILURE: u8 = 1;
const EXIT_PARSE_ERROR: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "cnprog",
    author,
    version,
    about = "Programmer for CANnuccia networks",
    long_about = "Flashes ELF firmware to CANnuccia bootloader devices over a shared CAN bus, \
and bulk-unlocks or re-locks device sets."
)]
struct Args {
    /// CAN driver to use
    #[arg(short = 'b', long = "backend", default_value = "socketcan")]
    backend: String,

    /// CAN interface name within that driver
    #[arg(short = 'i', long = "interface", default_value = "vcan0")]
    interface: String,

    /// Load the CAN binding from a TOML config file instead
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Operations to run in order: start+<id>[,<id>...], stop+<id>[,<id>...],
    /// flash+<id>+<elf-file>
    #[arg(required = true)]
    operations: Vec<String>,
}

/// One parsed positional operation.
enum OpSpec {
    Start(Vec<u8>),
    Stop(Vec<u8>),
    Flash(u8, PathBuf),
}

fn parse_dev_id(token: &str) -> Result<u8, String> {
    let parsed = match token.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => token.parse::<u8>(),
    };
    parsed.map_err(|_| format!("invalid device id \"{token}\""))
}

fn parse_dev_ids(tokens: &str) -> Result<Vec<u8>, String> {
    tokens.split(',').map(parse_dev_id).collect()
}

fn parse_op_spec(spec: &str) -> Result<OpSpec, String> {
    match spec.split_once('+') {
        Some(("start", ids)) => Ok(OpSpec::Start(parse_dev_ids(ids)?)),
        Some(("stop", ids)) => Ok(OpSpec::Stop(parse_dev_ids(ids)?)),
        Some(("flash", rest)) => {
            let (id, path) = rest
                .split_once('+')
                .ok_or_else(|| format!("flash needs an id and a file: \"{spec}\""))?;
            Ok(OpSpec::Flash(parse_dev_id(id)?, PathBuf::from(path)))
        }
        _ => Err(format!(
            "unknown operation \"{spec}\" (expected start+..., stop+... or flash+...)"
        )),
    }
}

/// Progress callback printing to stderr; flips `failed` on a negative
/// terminal report.
fn cli_progress(label: String, failed: Rc<Cell<bool>>) -> ProgressHandler {
    Box::new(move |message, progress| {
        if progress < 0 {
            eprintln!("✗ {label} failed [{progress}]: {message}");
            failed.set(true);
        } else {
            eprint!("\r[{progress:>3}%] {message}");
            if progress == 100 {
                eprintln!();
            }
        }
    })
}

fn main() -> ExitCode {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::WARN.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    // All operation specs must parse before anything touches the bus.
    let mut specs = Vec::new();
    for spec in &args.operations {
        match parse_op_spec(spec) {
            Ok(spec) => specs.push(spec),
            Err(e) => {
                eprintln!("✗ {e}");
                return ExitCode::from(EXIT_PARSE_ERROR);
            }
        }
    }

    let config = match &args.config {
        Some(path) => match Config::load_from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("✗ Failed to load config: {e}");
                return ExitCode::from(EXIT_INIT_FAILURE);
            }
        },
        None => Config {
            can_backend: args.backend.clone(),
            can_interface: args.interface.clone(),
        },
    };

    info!(
        backend = %config.can_backend,
        interface = %config.can_interface,
        "Opening CAN link"
    );
    let mut engine = match Engine::from_config(&config) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "Engine init failed");
            eprintln!("✗ {e}");
            return ExitCode::from(EXIT_INIT_FAILURE);
        }
    };

    let failed = Rc::new(Cell::new(false));
    for spec in specs {
        let op = match spec {
            OpSpec::Start(ids) => Operation::StartDevices(StartDevicesOp::new(
                ids,
                cli_progress("start".to_string(), failed.clone()),
            )),
            OpSpec::Stop(ids) => Operation::StopDevices(StopDevicesOp::new(
                ids,
                cli_progress("stop".to_string(), failed.clone()),
            )),
            OpSpec::Flash(dev_id, path) => {
                let elf_data = match std::fs::read(&path) {
                    Ok(data) => data,
                    Err(e) => {
                        eprintln!("✗ Failed to read {}: {e}", path.display());
                        return ExitCode::from(EXIT_INIT_FAILURE);
                    }
                };
                Operation::FlashElf(FlashElfOp::new(
                    dev_id,
                    elf_data,
                    cli_progress(format!("flash 0x{dev_id:02X}"), failed.clone()),
                ))
            }
        };
        engine.enqueue(op);
    }

    if let Err(e) = engine.run() {
        error!(error = %e, "Engine stopped");
        eprintln!("✗ {e}");
        return ExitCode::from(EXIT_INIT_FAILURE);
    }

    if failed.get() {
        ExitCode::from(EXIT_INIT_FAILURE)
    } else {
        ExitCode::SUCCESS
    }
}
