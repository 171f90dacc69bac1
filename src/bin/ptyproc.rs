//! ptyproc - run a command under a PTY and relay its streams
//!
//! Copies our stdin to the child's primary channel and the child's output
//! to our stdout. In console mode the child's stderr is relayed to our
//! stderr; the auxiliary channel, when enabled, is relayed there too.
//! Exits with the child's exit code.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use mochi_ptyproc::{ProcessConfig, PtyProcess, PtyReader, WindowSize};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut cols: Option<u16> = None;
    let mut rows: Option<u16> = None;
    let mut aux = false;
    let mut console = false;
    let mut legacy = false;
    let mut config_path: Option<PathBuf> = None;
    let mut command: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--cols" => {
                i += 1;
                cols = args.get(i).and_then(|v| v.parse().ok());
            },
            "-r" | "--rows" => {
                i += 1;
                rows = args.get(i).and_then(|v| v.parse().ok());
            },
            "--aux" => aux = true,
            "--console" => console = true,
            "--legacy" => legacy = true,
            "--config" => {
                i += 1;
                config_path = args.get(i).map(PathBuf::from);
            },
            "-h" | "--help" => {
                print_help();
                return ExitCode::SUCCESS;
            },
            "--" => {
                command.extend(args[i + 1..].iter().cloned());
                break;
            },
            _ => {
                command.extend(args[i..].iter().cloned());
                break;
            },
        }
        i += 1;
    }

    let mut config = match &config_path {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("ptyproc: {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            },
        },
        None => ProcessConfig::default(),
    };

    if !command.is_empty() {
        config.command = command;
    }
    if config.command.is_empty() {
        config.command = vec![default_shell()];
    }
    if cols.is_some() || rows.is_some() {
        config.initial_columns = cols.or(config.initial_columns);
        config.initial_rows = rows.or(config.initial_rows);
    } else if config.initial_size().is_none() {
        config = config.size(WindowSize::default());
    }
    config.auxiliary_channel |= aux;
    config.console |= console;
    config.legacy_emulation |= legacy;

    tracing::info!("Starting {:?}", config.command);

    let process = match PtyProcess::start(config) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("ptyproc: {}", e);
            return ExitCode::FAILURE;
        },
    };

    match relay(&process) {
        Ok(()) => {},
        Err(e) => {
            eprintln!("ptyproc: {}", e);
            let _ = process.destroy();
            return ExitCode::FAILURE;
        },
    }

    let status = process.wait_for();
    tracing::info!("Child {} finished: {}", process.pid(), status);
    match u8::try_from(status.code()) {
        Ok(code) => ExitCode::from(code),
        Err(_) => ExitCode::FAILURE,
    }
}

fn relay(process: &PtyProcess) -> mochi_ptyproc::Result<()> {
    let writer = process.writer()?;
    thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if (&*writer).write_all(&buf[..n]).is_err() {
                        break;
                    }
                },
            }
        }
    });

    let mut side_relays = Vec::new();
    side_relays.push(spawn_copy(process.error_reader()?));
    if let Some(aux) = process.aux_reader()? {
        side_relays.push(spawn_copy(aux));
    }

    copy_stream(&*process.reader()?, &mut io::stdout());

    for relay in side_relays {
        let _ = relay.join();
    }
    Ok(())
}

fn spawn_copy(reader: Arc<PtyReader>) -> thread::JoinHandle<()> {
    thread::spawn(move || copy_stream(&*reader, &mut io::stderr()))
}

fn copy_stream(reader: &PtyReader, out: &mut dyn Write) {
    let mut buf = [0u8; 4096];
    loop {
        match (&*reader).read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if out.write_all(&buf[..n]).is_err() {
                    break;
                }
                let _ = out.flush();
            },
            Err(e) => {
                tracing::error!("Read error: {}", e);
                break;
            },
        }
    }
}

fn load_config(path: &PathBuf) -> Result<ProcessConfig, Box<dyn std::error::Error>> {
    let json = std::fs::read_to_string(path)?;
    Ok(ProcessConfig::from_json(&json)?)
}

#[cfg(unix)]
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

#[cfg(windows)]
fn default_shell() -> String {
    std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
}

fn print_help() {
    println!(
        r#"ptyproc - run a command under a pseudoterminal

USAGE:
    ptyproc [OPTIONS] [--] [COMMAND [ARGS...]]

OPTIONS:
    -c, --cols <N>       Initial column count (default: 80)
    -r, --rows <N>       Initial row count (default: 24)
        --aux            Allocate an auxiliary channel; the argument
                         _DBG_PTY_ is replaced by its slave name
        --console        Full-console mode: echo off, stderr on its own channel
        --legacy         Use legacy pty emulation (Windows only)
        --config <FILE>  Load a JSON process configuration
    -h, --help           Print help information

Without a command, $SHELL (or /bin/sh) is started.
Set RUST_LOG=debug to see lifecycle logging on stderr."#
    );
}
