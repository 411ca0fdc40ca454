//! z3sync — synchronize a Zotero library with a local Z3 triple store.
//!
//! # Usage
//!
//! ```bash
//! # Pull a group library into z3.db
//! z3sync --library-id 4711 --api-key $ZOTERO_KEY
//!
//! # Push local edits, local side wins conflicts, fetch attachments
//! z3sync --library-id 4711 --api-key $ZOTERO_KEY --merge-priority local --download-files
//!
//! # Show the last 10 sync runs
//! z3sync --library-id 4711 --history 10
//! ```

mod config;
mod sync_log;
mod zotero;

use anyhow::{Context, Result};
use clap::Parser;
use config::{LibraryType, SyncConfig};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use z3_core::{MergePolicy, SyncEngine, SyncOptions, SyncReport, TripleStore};
use zotero::ZoteroClient;

#[derive(Parser, Debug)]
#[command(name = "z3sync")]
#[command(author = "Z3 Contributors")]
#[command(about = "Synchronize a Zotero library with a Z3 triple store")]
#[command(disable_version_flag = true)]
struct Cli {
    /// Zotero API key
    #[arg(long, env = "ZOTERO_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Zotero library (group or user) id
    #[arg(long)]
    library_id: String,

    /// Sync from this library version instead of the checkpoint
    #[arg(long)]
    version: Option<u64>,

    /// Replace the local library metadata with the remote's
    #[arg(long)]
    get_library_data: bool,

    /// Triple store database file
    #[arg(long, default_value = "z3.db")]
    database: PathBuf,

    /// Download attachment files
    #[arg(long)]
    download_files: bool,

    /// Purge subjects deleted on either side instead of flagging them
    #[arg(long)]
    remove_deleted: bool,

    /// Conflict policy: remote, local or ignore
    #[arg(long)]
    merge_priority: Option<MergePolicy>,

    /// Library type: group or user
    #[arg(long)]
    library_type: Option<LibraryType>,

    /// Config file (default: z3sync.json next to the database)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Zotero API base URL
    #[arg(long)]
    api_url: Option<String>,

    /// Print the last N sync log entries and exit
    #[arg(long, value_name = "N")]
    history: Option<usize>,
}

impl Cli {
    fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| SyncConfig::default_path(&self.database))
    }
}

/// Engine options: flags first, then the config file.
fn build_options(cli: &Cli, config: &SyncConfig) -> SyncOptions {
    SyncOptions {
        merge_policy: cli.merge_priority.unwrap_or(config.merge_priority),
        remove_deleted: cli.remove_deleted || config.remove_deleted,
        download_files: cli.download_files || config.download_files,
        get_library_data: cli.get_library_data,
        since_version: cli.version,
        retry: config.retry_policy(),
        download_concurrency: config.download_concurrency.max(1),
    }
}

fn print_report(report: &SyncReport) {
    println!("Sync {}", if report.is_success() { "completed" } else { "finished with errors" });
    println!("  {}", report);
    if let Some(err) = &report.remote_error {
        println!("  Remote listing failed: {}", err);
    }
    for (key, reason) in &report.failed {
        println!("  Failed {}: {}", key, reason);
    }
    if report.cancelled {
        println!("  Interrupted; unprocessed subjects will be picked up next run");
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let config_path = cli.config_path();
    let config = SyncConfig::load(&config_path)?;

    let store = TripleStore::open(&cli.database)
        .with_context(|| format!("Failed to open database {:?}", cli.database))?;

    if let Some(limit) = cli.history {
        sync_log::print_sync_log(&store, limit, &mut io::stdout())?;
        return Ok(true);
    }

    if cli.api_key.is_none() {
        warn!("no API key given; only public libraries are readable");
    }
    let library_type = cli.library_type.unwrap_or(config.library_type);
    let api_url = cli.api_url.as_deref().unwrap_or(&config.api_url);
    let client = ZoteroClient::new(
        api_url,
        library_type,
        &cli.library_id,
        cli.api_key.clone(),
        config.page_size,
    )?;

    let options = build_options(&cli, &config);
    info!(
        library = %cli.library_id,
        %library_type,
        policy = %options.merge_policy,
        database = ?cli.database,
        "starting sync"
    );

    let engine = SyncEngine::new(&store, &client, options);
    let cancel = engine.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current subject");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let report = engine.sync().await.context("Sync failed")?;
    print_report(&report);
    Ok(report.is_success())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("z3sync=info,z3_core=info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("z3sync").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_library_id_is_required() {
        assert!(Cli::try_parse_from(["z3sync", "--api-key", "k"]).is_err());
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&["--library-id", "4711"]);
        assert_eq!(cli.database, PathBuf::from("z3.db"));
        assert_eq!(cli.config_path(), PathBuf::from("z3sync.json"));

        let options = build_options(&cli, &SyncConfig::default());
        assert_eq!(options.merge_policy, MergePolicy::Remote);
        assert!(!options.remove_deleted);
        assert!(!options.download_files);
        assert_eq!(options.since_version, None);
    }

    #[test]
    fn test_flags_override_config() {
        let config = SyncConfig {
            merge_priority: MergePolicy::Ignore,
            download_files: true,
            ..SyncConfig::default()
        };

        let cli = parse(&["--library-id", "4711"]);
        let options = build_options(&cli, &config);
        assert_eq!(options.merge_policy, MergePolicy::Ignore);
        assert!(options.download_files);

        let cli = parse(&[
            "--library-id",
            "4711",
            "--merge-priority",
            "local",
            "--version",
            "120",
            "--remove-deleted",
            "--get-library-data",
        ]);
        let options = build_options(&cli, &config);
        assert_eq!(options.merge_policy, MergePolicy::Local);
        assert_eq!(options.since_version, Some(120));
        assert!(options.remove_deleted);
        assert!(options.get_library_data);
    }

    #[test]
    fn test_invalid_merge_priority_is_rejected() {
        assert!(
            Cli::try_parse_from(["z3sync", "--library-id", "1", "--merge-priority", "newest"])
                .is_err()
        );
    }

    #[test]
    fn test_config_path_follows_database() {
        let cli = parse(&["--library-id", "1", "--database", "/srv/z3/lib.db"]);
        assert_eq!(cli.config_path(), Path::new("/srv/z3/z3sync.json"));

        let cli = parse(&["--library-id", "1", "--config", "/etc/z3sync.json"]);
        assert_eq!(cli.config_path(), Path::new("/etc/z3sync.json"));
        assert_eq!(cli.library_type, None);
    }

    #[tokio::test]
    async fn test_history_on_empty_database() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let db = temp_dir.path().join("z3.db");
        let cli = parse(&[
            "--library-id",
            "1",
            "--database",
            db.to_str().unwrap(),
            "--history",
            "3",
        ]);
        assert!(run(cli).await.unwrap());
        assert!(db.exists());
    }
}
