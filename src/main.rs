use std::process::ExitCode;

use mulebridge::config::Settings;
use mulebridge::db::queries::HistoryQueries;
use mulebridge::{db, logging, Result};

fn run() -> Result<()> {
    let settings = Settings::from_env();
    if settings.log_to_stderr {
        logging::init_stderr()?;
    } else {
        logging::init(&settings.log_dir)?;
    }

    let db = db::init(&settings.history_db)?;
    let removed = db.cleanup(settings.retention_days)?;
    let counts = db.status_counts()?;
    tracing::info!(
        "history maintenance done removed={} total={}",
        removed,
        counts.total()
    );

    println!("{}", serde_json::to_string_pretty(&counts)?);
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("mulebridge failed: {}", err);
            eprintln!("mulebridge: {}", err);
            ExitCode::FAILURE
        }
    }
}
