//! tsmod CLI: stream MPEG transport streams to HiDes / ITE it950x modulators.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

use clap::Parser;

mod cli;

/// Shutdown flag, set by the Ctrl+C handler. Also handed to the session as
/// its cancellation flag so a blocked send gives up promptly.
pub static SHUTDOWN: LazyLock<Arc<AtomicBool>> =
    LazyLock::new(|| Arc::new(AtomicBool::new(false)));

#[derive(Parser)]
#[command(
    name = "tsmod",
    version,
    about = "Stream MPEG transport streams to HiDes / ITE it950x DVB-T modulators"
)]
struct Args {
    /// Output as JSON (for devices, info, gain, transmit, bitrate, config)
    #[arg(long, global = true)]
    json: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Use this config file instead of the platform default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: cli::Command,
}

fn log_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    }
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_filter(args.verbose)))
        .format_timestamp(None)
        .format_target(false)
        .init();

    let shutdown = Arc::clone(&*SHUTDOWN);
    ctrlc::set_handler(move || {
        shutdown.store(true, Ordering::SeqCst);
    })
    .ok();

    if let Err(e) = cli::run(args.command, args.json, args.config.as_deref()) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_log_level() {
        assert_eq!(log_filter(0), "warn");
        assert_eq!(log_filter(1), "debug");
        assert_eq!(log_filter(2), "trace");
        assert_eq!(log_filter(9), "trace");
    }

    #[test]
    fn args_parse_globals_after_subcommand() {
        let args = Args::try_parse_from(["tsmod", "devices", "--json", "-vv"]).unwrap();
        assert!(args.json);
        assert_eq!(args.verbose, 2);
        assert!(args.config.is_none());
    }
}
