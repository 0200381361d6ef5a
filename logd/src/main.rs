use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{info, warn};

use ipctools::{Logger, LoggerConfig, ShmAllocator, ShmemConfig};

#[derive(clap::Parser)]
#[clap(about = "Collects records from a shared-memory logger and prints them")]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "ipctools-logd.toml")]
    config: String,
    /// Print local records (with milliseconds) instead of syslog lines.
    #[clap(long)]
    local: bool,
    #[clap(short = 'v', long)]
    verbose: bool,
}

#[derive(Serialize, Deserialize)]
#[serde(default)]
struct DaemonConfig {
    shmem: ShmemConfig,
    logger: LoggerConfig,
    hostname: String,
    poll_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> DaemonConfig {
        DaemonConfig {
            shmem: ShmemConfig::default(),
            logger: LoggerConfig::default(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            poll_ms: 500,
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let opts: Opts = Opts::parse();
    let log_level = if opts.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .init();

    let cfg: DaemonConfig = confy::load_path(&opts.config)?;
    let alloc = ShmAllocator::create(&cfg.shmem)?;
    let logger = Logger::create(&cfg.logger, &alloc)?;
    info!(segment = %cfg.shmem.name, logger = %cfg.logger.name, "logd ready");

    let closing = watch_signals()?;
    run(&logger, &cfg, &opts, &closing)?;
    Ok(())
}

fn watch_signals() -> Result<Arc<AtomicBool>, Box<dyn Error>> {
    let closing = Arc::new(AtomicBool::new(false));
    let mut signals = Signals::new(&[SIGHUP, SIGINT, SIGQUIT, SIGTERM])?;
    let flag = Arc::clone(&closing);
    thread::spawn(move || {
        for signal in signals.forever() {
            info!(signal, "shutting down");
            flag.store(true, Ordering::SeqCst);
        }
    });
    Ok(closing)
}

fn run(logger: &Logger<'_>, cfg: &DaemonConfig, opts: &Opts, closing: &AtomicBool) -> Result<(), Box<dyn Error>> {
    let poll = Duration::from_millis(cfg.poll_ms.max(1));
    let mut drained = 0u64;
    while !closing.load(Ordering::Relaxed) {
        let entry = match logger.dequeue_timed(poll)? {
            Some(entry) => entry,
            None => continue,
        };
        if opts.local {
            println!("{}", *entry);
        } else {
            println!("{}", entry.syslog_line(&cfg.hostname));
        }
        if let Err(e) = logger.free(entry) {
            warn!(error = %e, "failed to release log record");
        }
        drained += 1;
    }

    let pending = logger.for_each(|msg, _: &mut ()| println!("{}", msg), &mut ())?;
    info!(drained, pending, "logd stopped");
    Ok(())
}
