//! Command-line surface and run orchestration.
//!
//! Parses the CLI, builds the engine (config, API client, schema metadata,
//! resolved working set), runs the requested operation, writes the run
//! report, and maps the totals to an exit code.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use crate::uplink::api::ApiClient;
use crate::uplink::config::AppConfig;
use crate::uplink::delete::Deleter;
use crate::uplink::directory;
use crate::uplink::dispatch::{Engine, ReprocessPolicy, RunError};
use crate::uplink::fetch::{Counter, Fetcher};
use crate::uplink::metadata::MetadataProvider;
use crate::uplink::report::RunReporter;
use crate::uplink::send::Sender;
use crate::uplink::truncate::Truncator;
use crate::uplink::validate::Validator;

/// Nothing was sent because every payload was skipped.
pub const EXIT_ALL_SKIPPED: i32 = 3;
/// Nothing succeeded and at least one payload failed.
pub const EXIT_ALL_FAILED: i32 = 4;

#[derive(Parser)]
#[command(
    name = "uplink",
    version,
    about = "Bulk NDJSON client for dependency-ordered REST APIs"
)]
pub struct Cli {
    /// Path to the TOML config file.
    #[arg(short = 'c', long, global = true, default_value = "uplink.toml")]
    pub config: PathBuf,

    /// Resources to work on: names, prefix*/*suffix patterns, comma lists.
    #[arg(short = 's', long, global = true, default_value = "*")]
    pub selector: String,

    /// Resources to leave out, same syntax as the selector.
    #[arg(short = 'e', long, global = true, default_value = "")]
    pub exclude: String,

    /// Where to write the run report (or the counts, for `count`).
    #[arg(long, global = true, value_name = "PATH")]
    pub results_file: Option<PathBuf>,

    /// Config overrides as dotted key=value pairs, repeatable.
    #[arg(long = "set", global = true, value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,

    /// Discard cached schema documents and descriptor values.
    #[arg(long, global = true)]
    pub wipe_cache: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Send local payloads to the API in dependency order.
    Send {
        /// Resend payloads even when the change-log says they went already.
        #[arg(short = 'f', long)]
        force: bool,

        /// Resend payloads last sent before this timestamp.
        #[arg(long, value_name = "TIMESTAMP")]
        older_than: Option<String>,

        /// Resend payloads last sent after this timestamp.
        #[arg(long, value_name = "TIMESTAMP")]
        newer_than: Option<String>,

        /// Resend payloads whose last attempt got one of these statuses.
        #[arg(long, value_name = "CODES", value_delimiter = ',')]
        resend_status_codes: Vec<u16>,
    },

    /// Check local payloads against the API's schemas without sending.
    Validate,

    /// Delete previously-sent payloads from the API, dependents first.
    Delete {
        /// Skip the confirmation prompt.
        #[arg(short = 'f', long)]
        force: bool,
    },

    /// Delete EVERY record of the selected resources from the API.
    Truncate {
        /// Skip the confirmation prompt.
        #[arg(short = 'f', long)]
        force: bool,
    },

    /// Download the selected resources into local NDJSON files.
    Fetch {
        /// Keep only these top-level fields of each record.
        #[arg(long, value_name = "FIELDS", value_delimiter = ',')]
        keep_keys: Vec<String>,

        /// Remove these top-level fields from each record.
        #[arg(long, value_name = "FIELDS", value_delimiter = ',')]
        drop_keys: Vec<String>,
    },

    /// Print record counts for the selected resources.
    Count,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Send { .. } => "send",
            Command::Validate => "validate",
            Command::Delete { .. } => "delete",
            Command::Truncate { .. } => "truncate",
            Command::Fetch { .. } => "fetch",
            Command::Count => "count",
        }
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, or a bare date (midnight UTC).
fn parse_timestamp(text: &str) -> Result<i64> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Ok(parsed.timestamp());
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Ok(parsed.and_utc().timestamp());
    }
    if let Ok(parsed) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        if let Some(midnight) = parsed.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc().timestamp());
        }
    }
    bail!("unrecognized timestamp '{text}' (expected RFC 3339 or YYYY-MM-DD[ HH:MM:SS])")
}

pub struct Program;

impl Program {
    /// Runs the requested operation to completion and returns the process
    /// exit code. Fatal setup problems surface as errors.
    pub async fn run(cli: Cli, mut config: AppConfig) -> Result<i32> {
        if let Command::Delete { force: true } | Command::Truncate { force: true } = cli.command {
            config.run.force_delete = true;
        }
        let config = Arc::new(config);

        let api = Arc::new(
            ApiClient::connect(&config)
                .await
                .context("connecting to the API")?,
        );
        let meta = MetadataProvider::discover(
            api.clone(),
            &config.api.namespace,
            &config.state_dir,
            cli.wipe_cache,
        )
        .await
        .context("discovering API metadata")?;

        let ordered = meta.resources().to_vec();
        let resources = directory::resolve(&ordered, &cli.selector, &cli.exclude)?;
        info!(
            "working set: {} resource(s) out of {}",
            resources.len(),
            ordered.len()
        );

        let policy = match &cli.command {
            Command::Send {
                force,
                older_than,
                newer_than,
                resend_status_codes,
            } => ReprocessPolicy {
                force: *force,
                older_than: older_than
                    .as_deref()
                    .map(parse_timestamp)
                    .transpose()
                    .context("--older-than")?,
                newer_than: newer_than
                    .as_deref()
                    .map(parse_timestamp)
                    .transpose()
                    .context("--newer-than")?,
                resend_status_codes: resend_status_codes.clone(),
            },
            _ => ReprocessPolicy::default(),
        };
        let (keep_keys, drop_keys) = match &cli.command {
            Command::Fetch {
                keep_keys,
                drop_keys,
            } => (keep_keys.clone(), drop_keys.clone()),
            _ => (Vec::new(), Vec::new()),
        };

        let engine = Arc::new(Engine {
            config: config.clone(),
            api,
            meta,
            resources,
            policy,
            keep_keys,
            drop_keys,
            reporter: RunReporter::new(cli.command.name()),
            wipe_cache: cli.wipe_cache,
            run_failures: Arc::new(AtomicUsize::new(0)),
        });

        let outcome = match &cli.command {
            Command::Send { .. } => Sender::new(engine.clone()).send().await,
            Command::Validate => match Validator::build(engine.clone()).await {
                Ok(validator) => validator.validate().await,
                Err(e) => Err(e),
            },
            Command::Delete { .. } => Deleter::new(engine.clone()).delete().await,
            Command::Truncate { .. } => Truncator::new(engine.clone()).truncate().await,
            Command::Fetch { .. } => Fetcher::new(engine.clone()).fetch().await,
            Command::Count => {
                Counter::new(engine.clone())
                    .count(cli.results_file.as_deref())
                    .await
            }
        };

        // `count` uses the results file for its counts; every other command
        // writes the structured run report there.
        if !matches!(cli.command, Command::Count) {
            if let Some(path) = &cli.results_file {
                engine.reporter.write(path).context("writing run report")?;
                info!("wrote run report to {}", path.display());
            }
        }

        match outcome {
            Ok(()) => {}
            Err(RunError::NotConfirmed) => {
                info!("nothing done");
                return Ok(0);
            }
            Err(e @ RunError::TooManyFailures { .. }) => {
                error!("{e}");
                return Ok(1);
            }
            Err(e) => return Err(e.into()),
        }

        let totals = engine.reporter.totals();
        info!(
            "run complete: {} processed, {} skipped, {} failed",
            totals.processed, totals.skipped, totals.failed
        );
        if totals.processed == 0 && totals.failed > 0 {
            return Ok(EXIT_ALL_FAILED);
        }
        if totals.processed == 0 && totals.failed == 0 && totals.skipped > 0 {
            return Ok(EXIT_ALL_SKIPPED);
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_parse_in_all_three_forms() {
        assert_eq!(
            parse_timestamp("1970-01-01T00:00:10Z").unwrap(),
            10
        );
        assert_eq!(
            parse_timestamp("1970-01-01 00:01:00").unwrap(),
            60
        );
        assert_eq!(parse_timestamp("1970-01-02").unwrap(), 86_400);
        assert!(parse_timestamp("next tuesday").is_err());
    }

    #[test]
    fn cli_parses_a_send_invocation() {
        let cli = Cli::parse_from([
            "uplink",
            "send",
            "--older-than",
            "2026-01-01",
            "--resend-status-codes",
            "500,502",
            "-s",
            "student*",
        ]);
        assert_eq!(cli.selector, "student*");
        match cli.command {
            Command::Send {
                resend_status_codes,
                older_than,
                ..
            } => {
                assert_eq!(resend_status_codes, vec![500, 502]);
                assert_eq!(older_than.as_deref(), Some("2026-01-01"));
            }
            _ => panic!("expected send"),
        }
    }

    #[test]
    fn set_overrides_are_collected_in_order() {
        let cli = Cli::parse_from([
            "uplink",
            "count",
            "--set",
            "connection.pool_size=2",
            "--set",
            "run.max_failures=5",
        ]);
        assert_eq!(
            cli.overrides,
            vec!["connection.pool_size=2", "run.max_failures=5"]
        );
    }
}
