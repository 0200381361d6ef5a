use std::error::Error;
use std::io::{self, BufRead};

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, warn};

use ipctools::{Category, Enqueued, Level, Logger, LoggerConfig, Record, ShmAllocator, ShmemConfig};

#[derive(clap::Parser)]
#[clap(about = "Sends records to a running logd through shared memory")]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "ipctools-logd.toml")]
    config: String,
    /// Category bits of the record.
    #[clap(long, default_value_t = Category::MODULE.bits())]
    category: u32,
    #[clap(short = 'l', long, default_value = "info", value_parser = parse_level)]
    level: Level,
    #[clap(short = 'o', long, default_value = "logsend")]
    originator: String,
    /// Log each record sent.
    #[clap(short = 'v', long)]
    verbose: bool,
    /// Message text; lines are read from stdin when omitted.
    message: Vec<String>,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(default)]
struct SenderConfig {
    shmem: ShmemConfig,
    logger: LoggerConfig,
}

fn parse_level(name: &str) -> Result<Level, String> {
    let level = match name.to_ascii_lowercase().as_str() {
        "emerg" => Level::EMERG,
        "alert" => Level::ALERT,
        "crit" => Level::CRIT,
        "error" | "err" => Level::ERROR,
        "warning" | "warn" => Level::WARNING,
        "notice" => Level::NOTICE,
        "info" => Level::INFO,
        "debug" => Level::DEBUG,
        other => return Err(format!("unknown level '{}'", other)),
    };
    Ok(level)
}

fn main() -> Result<(), Box<dyn Error>> {
    let opts: Opts = Opts::parse();
    let log_level = if opts.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(io::stderr)
        .init();

    let cfg: SenderConfig = confy::load_path(&opts.config)?;
    let alloc = ShmAllocator::attach(&cfg.shmem)?;
    let logger = Logger::attach(&cfg.logger, &alloc)?;

    if opts.message.is_empty() {
        for line in io::stdin().lock().lines() {
            send(&logger, &opts, &line?)?;
        }
    } else {
        send(&logger, &opts, &opts.message.join(" "))?;
    }
    Ok(())
}

fn send(logger: &Logger<'_>, opts: &Opts, text: &str) -> Result<(), Box<dyn Error>> {
    let record = Record::new(Category(opts.category), opts.level, &opts.originator, text);
    match logger.enqueue(&record)? {
        Enqueued::Queued => debug!(
            originator = %opts.originator,
            category = opts.category,
            level = opts.level.bits(),
            len = text.len(),
            "sent record"
        ),
        Enqueued::Filtered => warn!(
            category = opts.category,
            level = opts.level.bits(),
            "filtered by the logger's masks: {}",
            text
        ),
    }
    Ok(())
}
