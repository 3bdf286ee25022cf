//! psync: delta-transfer directory synchronizer
//!
//! Command-line entry point: parses flags, sets up logging, dispatches to
//! local, remote, or server mode, and maps session errors onto the
//! documented exit codes.

use clap::Parser;
use tracing::{info, Level};

use psync::cli::{Args, Location};
use psync::error::SyncError;
use psync::session;

#[compio::main]
async fn main() {
    let args = Args::parse();

    let max_level = if args.quiet {
        Level::ERROR
    } else {
        match args.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };
    // Server mode shares stdout with the wire protocol; logs go to stderr
    // unconditionally.
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(max_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to install logger");
    }

    if let Err(e) = args.validate() {
        eprintln!("psync: {e}");
        std::process::exit(e.exit_code());
    }

    let result = run(&args).await;
    match result {
        Ok(()) => {}
        Err(e) => {
            eprintln!("psync: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(args: &Args) -> Result<(), SyncError> {
    let config = args.session_config();

    if let Some(dest) = &args.server {
        let stats = session::run_server(config, dest).await?;
        stats.log_summary();
        return Ok(());
    }

    let source = args.source_location();
    let dest = args.dest_location();
    info!("psync v{}", env!("CARGO_PKG_VERSION"));

    let stats = match (source, dest) {
        (Location::Local(source), Location::Local(dest)) => {
            session::sync_local(config, source, dest).await?
        }
        (Location::Local(source), Location::Remote { user, host, path }) => {
            session::sync_remote(
                config,
                source,
                &args.remote_shell,
                user.as_deref(),
                &host,
                &path,
            )
            .await?
        }
        (Location::Remote { .. }, _) => {
            return Err(SyncError::Config(
                "pulling from a remote source is not supported".to_string(),
            ));
        }
    };

    stats.log_summary();
    if stats.files_failed > 0 && stats.files_transferred == 0 && stats.files_skipped == 0 {
        return Err(SyncError::HashMismatch("no files succeeded".to_string()));
    }
    Ok(())
}
