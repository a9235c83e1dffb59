use std::{panic, path::PathBuf, process::ExitCode};

use anyhow::{Context, Error};
use chrono::Utc;
use clap::Parser;
use log::{error, LevelFilter};

use mirroot::{
    cli::{Cli, Commands},
    session_log_path, ExitKind, InterruptFlag, MultiLogger, SessionLog,
};
use mirroot_api::{
    constants::MIRROOT_LOG_DIR,
    error::{InternalError, MirrootError},
};

/// Sets up stderr logging plus, for commands that keep one, the session log.
/// Returns the session log path.
fn setup_logging(args: &Cli) -> Result<PathBuf, Error> {
    let log_path = session_log_path(MIRROOT_LOG_DIR, args.command.name(), Utc::now());

    let mut multilogger = MultiLogger::new()
        // Add regular env_logger to output to stderr
        .with_logger(Box::new(
            env_logger::builder()
                .format_timestamp(None)
                .filter_level(args.verbosity)
                .build(),
        ))
        // Every parsed menu entry is traced; nobody needs that on stderr or on disk
        .with_global_filter("osutils::grub", LevelFilter::Debug);

    if args.command.keeps_session_log() {
        let session_log = SessionLog::new(&log_path);
        if !session_log.is_open() {
            eprintln!(
                "Continuing without session log '{}'",
                session_log.path().display()
            );
        }
        multilogger.add_logger(session_log.into_logger());
    }

    multilogger.init().context("Logger already registered")?;
    Ok(log_path)
}

fn run_mirroot(args: &Cli, log_path: PathBuf) -> Result<(), MirrootError> {
    let interrupt = match args.command {
        // The agent runs unattended under systemd; it has no session to unwind.
        Commands::FirstBoot | Commands::Status { .. } => InterruptFlag::default(),
        _ => InterruptFlag::install()
            .map_err(|e| MirrootError::with_source(InternalError::Internal("Signal setup"), e))?,
    };

    let res = panic::catch_unwind(move || mirroot::run(&args.command, &log_path, interrupt));
    match res {
        Err(e) => Err(MirrootError::new(InternalError::Panic(format!("{e:?}")))),
        Ok(r) => r,
    }
}

fn main() -> ExitCode {
    // Parse args
    let args = Cli::parse();

    // Initialize the loggers
    let log_path = match setup_logging(&args) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e:?}");
            return ExitCode::from(ExitKind::SetupFailed as u8);
        }
    };

    let res = run_mirroot(&args, log_path);
    log::logger().flush();
    match res {
        Ok(()) => ExitCode::from(ExitKind::Done as u8),
        Err(e) => {
            error!("Mirroot '{}' failed: {e:?}", args.command);
            log::logger().flush();
            ExitCode::from(ExitKind::for_error(&e) as u8)
        }
    }
}
