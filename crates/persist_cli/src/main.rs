//! CLI smoke entry point.
//!
//! # Responsibility
//! - Allocate a batch of identifiers from a SQLite-backed sequence to verify
//!   `persist_core` wiring end to end.
//! - Keep output deterministic for quick local sanity checks.
//!
//! Usage: `persist_cli <db-path> [sequence] [count] [native|table]`
//!
//! Set `PERSIST_LOG_DIR` (absolute) to also write core logs there.

use log::info;
use persist_core::{
    core_version, default_log_level, init_logging, PersistConfig, SequenceAllocator,
    SequenceStrategy, SqliteSequenceStore, SqliteSessionFactory,
};
use std::error::Error;
use std::process::ExitCode;

const DEFAULT_SEQUENCE: &str = "seq_base";
const DEFAULT_COUNT: usize = 3;

struct Args {
    db_path: String,
    sequence: String,
    count: usize,
    strategy: SequenceStrategy,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("persist_cli error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let args = parse_args(std::env::args().skip(1).collect())?;
    if let Ok(log_dir) = std::env::var("PERSIST_LOG_DIR") {
        init_logging(default_log_level(), &log_dir)?;
    }

    let config = PersistConfig {
        sequence_strategy: args.strategy,
        ..PersistConfig::default()
    };
    config.validate()?;

    let sessions = SqliteSessionFactory::new(
        persist_core::db::DbTarget::file(&args.db_path),
        config.busy_timeout(),
    )?;
    let store = SqliteSequenceStore::new(sessions, &config);
    let allocator =
        SequenceAllocator::with_defaults(store, config.default_increment, config.default_min_value);

    allocator.register(&args.sequence, 0)?;
    let ids = allocator.allocate(&args.sequence, args.count)?;
    info!(
        "event=cli_allocate module=cli status=ok name={} count={}",
        args.sequence,
        ids.len()
    );

    let rendered: Vec<String> = ids.iter().map(u64::to_string).collect();
    println!("persist_core version={}", core_version());
    println!(
        "sequence={} strategy={} ids={}",
        args.sequence,
        args.strategy.as_str(),
        rendered.join(",")
    );
    Ok(())
}

fn parse_args(raw: Vec<String>) -> Result<Args, String> {
    let mut raw = raw.into_iter();
    let db_path = raw
        .next()
        .ok_or_else(|| "usage: persist_cli <db-path> [sequence] [count] [native|table]".to_string())?;
    let sequence = raw.next().unwrap_or_else(|| DEFAULT_SEQUENCE.to_string());
    let count = match raw.next() {
        Some(value) => value
            .parse::<usize>()
            .map_err(|err| format!("invalid count `{value}`: {err}"))?,
        None => DEFAULT_COUNT,
    };
    let strategy = match raw.next().as_deref() {
        None | Some("native") | Some("seq") => SequenceStrategy::Native,
        Some("table") => SequenceStrategy::Table,
        Some(other) => return Err(format!("unknown strategy `{other}`")),
    };

    Ok(Args {
        db_path,
        sequence,
        count,
        strategy,
    })
}
