//! Command-line front end for eventkit.
//!
//! # Responsibility
//! - Expose rounding and rule expansion for quick local checks.
//! - Drive a file-backed repeat series end to end.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use eventkit_core::{
    default_log_level, expand_capped, init_logging, open_db, round_datetime, Event,
    PropagationEngine, Precision, RepeatRule, Rounding, SqliteEventRepository,
};
use log::info;
use std::path::{Path, PathBuf};

#[derive(Debug, Parser)]
#[command(name = "eventkit", version, about = "Calendar event rounding and repeat series tools")]
struct Cli {
    /// Absolute directory for rolling log files; logging is off when omitted.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// trace|debug|info|warn|error
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Round an RFC 3339 timestamp to a precision grid.
    Round {
        timestamp: String,
        /// Seconds, a unit suffixed number (15m, 1h, 1d) or a weekday (MON).
        #[arg(short, long)]
        precision: Precision,
        #[arg(short, long, default_value = "nearest")]
        mode: Rounding,
    },
    /// List occurrences of a repeat rule.
    Expand {
        /// RFC 3339 anchor.
        anchor: String,
        /// e.g. FREQ=WEEKLY;INTERVAL=2;COUNT=5
        rule: RepeatRule,
        /// Stop after this many occurrences.
        #[arg(short, long, default_value_t = 100)]
        limit: u16,
    },
    /// Create a repeat series in a database file and list its children.
    Series {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        title: String,
        /// RFC 3339 start of the master event.
        #[arg(long)]
        start: String,
        #[arg(long)]
        rule: RepeatRule,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(log_dir) = &cli.log_dir {
        let level = cli.log_level.as_deref().unwrap_or(default_log_level());
        init_logging(level, log_dir).context("failed to initialize logging")?;
    }

    match cli.command {
        Command::Round {
            timestamp,
            precision,
            mode,
        } => {
            let rounded = round_datetime(parse_instant(&timestamp)?, precision, mode)?;
            println!("{}", format_instant(rounded));
        }
        Command::Expand {
            anchor,
            rule,
            limit,
        } => {
            let occurrences = expand_capped(parse_instant(&anchor)?, &rule, limit)?;
            let truncated = occurrences.is_truncated();
            for occurrence in occurrences {
                println!("{}", format_instant(occurrence));
            }
            if truncated {
                eprintln!("output truncated at {limit} occurrences");
            }
        }
        Command::Series {
            db,
            title,
            start,
            rule,
        } => run_series(&db, &title, parse_instant(&start)?, &rule)?,
    }

    Ok(())
}

fn run_series(db: &Path, title: &str, start: DateTime<Utc>, rule: &RepeatRule) -> Result<()> {
    if !rule.is_bounded() {
        bail!("series rule `{rule}` needs COUNT or UNTIL");
    }

    let conn = open_db(db).with_context(|| format!("failed to open `{}`", db.display()))?;
    let engine = PropagationEngine::new(SqliteEventRepository::try_new(&conn)?);

    let master = Event::new(title, start).with_repeat(rule.to_string());
    let master_id = engine.create_master(&master)?;
    let report = engine.propagate(master_id)?;
    info!(
        "event=cli_series module=cli status=ok master_id={} created={}",
        master_id, report.created
    );

    println!("master {master_id} {}", format_instant(start));
    for child in engine.repeat_events(master_id)? {
        println!("child  {} {}", child.id, format_instant(child.start));
    }
    Ok(())
}

fn parse_instant(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .with_context(|| format!("`{value}` is not an RFC 3339 timestamp"))
}

fn format_instant(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}
