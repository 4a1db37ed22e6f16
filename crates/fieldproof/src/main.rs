//! `fieldproof` - CLI for the offline artifact queue
//!
//! This binary lists, verifies, uploads and removes the sealed captures held
//! in the local store.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::Parser;
use tracing::warn;

use fieldproof::cli::{Cli, Command, ConfigCommand, QueueCommand, VerifyCommand};
use fieldproof::queue::UploadOutcome;
use fieldproof::transport::Unconfigured;
use fieldproof::{
    init_logging, ArtifactStore, Config, HttpTransport, OfflineQueue, SealedArtifact, Sealer,
    SqliteStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Load configuration
    let config = Config::load_from(cli.config.clone())?;

    match cli.command {
        Command::Queue(queue_cmd) => handle_queue(&config, queue_cmd).await,
        Command::Status(status_cmd) => handle_status(&config, status_cmd.json),
        Command::Verify(verify_cmd) => handle_verify(&config, &verify_cmd),
        Command::Config(config_cmd) => handle_config(&config, config_cmd),
    }
}

fn open_store(config: &Config) -> anyhow::Result<Arc<SqliteStore>> {
    let path = config.database_path();
    let store = SqliteStore::open(&path)
        .with_context(|| format!("failed to open artifact store at {}", path.display()))?;
    Ok(Arc::new(store))
}

/// Artifacts shown by `queue list`. An unavailable store reads as empty.
async fn queued_artifacts(config: &Config, org: Option<&str>) -> Vec<SealedArtifact> {
    let store = match open_store(config) {
        Ok(store) => store,
        Err(e) => {
            warn!("Artifact store unavailable, listing nothing: {:#}", e);
            return Vec::new();
        }
    };
    let queue = OfflineQueue::new(store, Arc::new(Unconfigured));
    match org {
        Some(org) => queue.list_for_organization(org).await,
        None => queue.list().await,
    }
}

async fn handle_queue(config: &Config, cmd: QueueCommand) -> anyhow::Result<()> {
    match cmd {
        QueueCommand::List { json, org } => {
            let artifacts = queued_artifacts(config, org.as_deref()).await;
            if json {
                let manifests: Vec<_> = artifacts.iter().map(SealedArtifact::manifest).collect();
                println!("{}", serde_json::to_string_pretty(&manifests)?);
            } else if artifacts.is_empty() {
                println!("No queued artifacts.");
            } else {
                println!(
                    "{:<36}  {:<12}  {:<20}  {:>7}  {:<9}  FLAGS",
                    "ID", "TASK", "STARTED", "SECS", "STATE"
                );
                for artifact in &artifacts {
                    print_artifact_row(artifact);
                }
            }
        }
        QueueCommand::Upload { id, all } => {
            let Some(endpoint) = config.upload.endpoint.as_deref() else {
                bail!(
                    "no upload endpoint configured (set upload.endpoint in {})",
                    Config::default_config_path().display()
                );
            };
            let store = open_store(config)?;
            let transport = HttpTransport::new(endpoint, config.upload_timeout())?;
            let queue = Arc::new(OfflineQueue::new(store, Arc::new(transport)));
            queue.recover_interrupted().await?;

            if all {
                let summary = queue.upload_all().await;
                println!(
                    "Uploaded {}, failed {}, skipped {} of {}.",
                    summary.uploaded,
                    summary.failed,
                    summary.skipped,
                    summary.attempted()
                );
                for (id, reason) in &summary.errors {
                    println!("  {id}: {reason}");
                }
                if summary.failed > 0 {
                    bail!("{} upload(s) failed", summary.failed);
                }
            } else if let Some(id) = id {
                match queue.upload_one(&id).await? {
                    UploadOutcome::Uploaded => println!("Uploaded {id}."),
                    UploadOutcome::Skipped(reason) => println!("Skipped {id}: {reason:?}."),
                    UploadOutcome::Failed(reason) => bail!("upload of {id} failed: {reason}"),
                    UploadOutcome::Removed => println!("Artifact {id} was removed during upload."),
                }
            }
        }
        QueueCommand::Remove { id, yes } => {
            if !yes {
                println!("This permanently deletes artifact {id}, uploaded or not.");
                println!("Use --yes to confirm.");
                return Ok(());
            }
            let store = open_store(config)?;
            if store.delete(&id)? {
                println!("Removed {id}.");
            } else {
                bail!("no artifact with id {id}");
            }
        }
    }
    Ok(())
}

fn print_artifact_row(artifact: &SealedArtifact) {
    let started = format_timestamp(artifact.started_at_ms());
    let flags = artifact.compliance_flags().violations();
    println!(
        "{:<36}  {:<12}  {:<20}  {:>7.1}  {:<9}  {}",
        artifact.id(),
        artifact.task_id(),
        started,
        ms_to_secs(artifact.duration_ms()),
        artifact.upload_state(),
        if flags.is_empty() {
            "-".to_string()
        } else {
            flags.join(",")
        }
    );
}

fn format_timestamp(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms).map_or_else(
        || ms.to_string(),
        |at| at.format("%Y-%m-%d %H:%M:%S").to_string(),
    )
}

#[allow(clippy::cast_precision_loss)]
fn ms_to_secs(ms: i64) -> f64 {
    ms as f64 / 1000.0
}

fn handle_status(config: &Config, json: bool) -> anyhow::Result<()> {
    let stats = match open_store(config).and_then(|store| Ok(store.stats()?)) {
        Ok(stats) => Some(stats),
        Err(e) => {
            warn!("Artifact store unavailable, no statistics: {:#}", e);
            None
        }
    };

    if json {
        let status = serde_json::json!({
            "database_path": config.database_path(),
            "upload_endpoint": config.upload.endpoint,
            "stats": stats,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("fieldproof status");
        println!("-----------------");
        println!("Database:      {}", config.database_path().display());
        println!(
            "Endpoint:      {}",
            config.upload.endpoint.as_deref().unwrap_or("(not configured)")
        );
        let Some(stats) = stats else {
            println!("Artifacts:     (store unavailable)");
            return Ok(());
        };
        println!("Artifacts:     {}", stats.total_artifacts);
        println!("  pending:     {}", stats.pending);
        println!("  uploading:   {}", stats.uploading);
        println!("  uploaded:    {}", stats.uploaded);
        println!("  failed:      {}", stats.failed);
        if let Some(oldest) = stats.oldest_capture {
            println!("Oldest:        {}", oldest.format("%Y-%m-%d %H:%M:%S"));
        }
        if let Some(newest) = stats.newest_capture {
            println!("Newest:        {}", newest.format("%Y-%m-%d %H:%M:%S"));
        }
        println!("Size:          {} bytes", stats.db_size_bytes);
    }
    Ok(())
}

fn handle_verify(config: &Config, cmd: &VerifyCommand) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let Some(artifact) = store.get(&cmd.id)? else {
        bail!("no artifact with id {}", cmd.id);
    };
    let verification = Sealer.verify(&artifact)?;

    if cmd.json {
        let report = serde_json::json!({
            "id": artifact.id(),
            "media_digest": artifact.media_digest(),
            "metadata_digest": artifact.metadata_digest(),
            "media_ok": verification.media_ok,
            "metadata_ok": verification.metadata_ok,
            "intact": verification.is_intact(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Artifact:  {}", artifact.id());
        println!(
            "Media:     {} ({})",
            artifact.media_digest(),
            if verification.media_ok { "ok" } else { "MISMATCH" }
        );
        println!(
            "Metadata:  {} ({})",
            artifact.metadata_digest(),
            if verification.metadata_ok { "ok" } else { "MISMATCH" }
        );
    }

    if !verification.is_intact() {
        bail!("artifact {} does not match its seal", artifact.id());
    }
    Ok(())
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Capture]");
                println!("  Max duration (s):   {}", config.capture.max_duration_secs);
                println!("  Frame rate:         {}", config.capture.frame_rate);
                println!(
                    "  Canvas:             {}x{}",
                    config.capture.width, config.capture.height
                );
                println!("  Chunk interval:     {} ms", config.capture.chunk_interval_ms);
                println!("  Codec hint:         {}", config.capture.codec_hint);
                println!();
                println!("[Location]");
                println!(
                    "  Accuracy threshold: {} m",
                    config.location.accuracy_threshold_m
                );
                println!("  Stale after:        {} ms", config.location.stale_after_ms);
                println!("  Fix timeout:        {} ms", config.location.fix_timeout_ms);
                println!();
                println!("[Overlay]");
                println!("  Watermark:          {}", config.overlay.watermark);
                println!();
                println!("[Storage]");
                println!("  Database path:      {}", config.database_path().display());
                println!();
                println!("[Upload]");
                println!(
                    "  Endpoint:           {}",
                    config.upload.endpoint.as_deref().unwrap_or("(not configured)")
                );
                println!("  Timeout (s):        {}", config.upload.timeout_secs);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => println!("Configuration error: {e}"),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldproof::artifact::SessionRecord;
    use fieldproof::session::{Party, TaskRef};
    use fieldproof::{ComplianceFlags, MediaPayload, SessionContext};

    fn config_at(path: std::path::PathBuf) -> Config {
        let mut config = Config::default();
        config.storage.database_path = Some(path);
        config
    }

    fn artifact(org: &str, started_at_ms: i64) -> SealedArtifact {
        let context = SessionContext::new(
            TaskRef::new("T-1", "C-1"),
            Party::new("op-1", "Ana"),
            Party::new(org, "Org"),
            started_at_ms,
        );
        SealedArtifact::seal(
            &context,
            SessionRecord {
                started_at_ms,
                ended_at_ms: started_at_ms + 1_000,
                location_timeline: Vec::new(),
                compliance_flags: ComplianceFlags::default(),
            },
            MediaPayload::webm(vec![1u8, 2, 3]),
            &Sealer,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_list_with_unopenable_store_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the database directory should be.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let config = config_at(blocker.join("artifacts.db"));

        assert!(open_store(&config).is_err());
        assert!(queued_artifacts(&config, None).await.is_empty());
        assert!(queued_artifacts(&config, Some("org-1")).await.is_empty());
        assert!(handle_status(&config, true).is_ok());
    }

    #[tokio::test]
    async fn test_list_filters_by_organization() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_at(dir.path().join("artifacts.db"));
        {
            let store = open_store(&config).unwrap();
            store.put(&artifact("org-1", 1_000)).unwrap();
            store.put(&artifact("org-2", 2_000)).unwrap();
            store.put(&artifact("org-1", 3_000)).unwrap();
        }

        assert_eq!(queued_artifacts(&config, None).await.len(), 3);
        let org1 = queued_artifacts(&config, Some("org-1")).await;
        let started: Vec<i64> = org1.iter().map(SealedArtifact::started_at_ms).collect();
        assert_eq!(started, vec![3_000, 1_000]);
    }
}
