use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use shardup_protocol::UploadState;
use shardup_transfer::FileSource;
use shardup_upload::{
    MemoryUploadService, UploadConfig, UploadCoordinator, UploadError, UploadEvent, UploadOutcome,
};

const USAGE: &str = "usage: shardup-demo [--config <path>] <file>...";

struct Args {
    config: Option<PathBuf>,
    files: Vec<PathBuf>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Args> {
    let mut config = None;
    let mut files = Vec::new();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            "-h" | "--help" => bail!(USAGE),
            _ => files.push(PathBuf::from(arg)),
        }
    }
    if files.is_empty() {
        bail!(USAGE);
    }
    Ok(Args { config, files })
}

fn file_name(path: &Path) -> anyhow::Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .with_context(|| format!("no usable file name in {}", path.display()))
}

/// Logs one upload result. Returns `false` if it failed.
fn report(file: &str, result: &Result<UploadOutcome, UploadError>) -> bool {
    match result {
        Ok(outcome) => {
            tracing::info!(
                file,
                hash = %outcome.file_hash,
                instant = outcome.instant,
                "finished"
            );
            true
        }
        Err(e) => {
            tracing::error!(file, error = %e, "upload failed");
            false
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,shardup=debug")),
        )
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    let config = match &args.config {
        Some(path) => UploadConfig::load(path)?,
        None => UploadConfig::default(),
    };

    let service = Arc::new(MemoryUploadService::new().with_latency(Duration::from_millis(50)));
    let coordinator = Arc::new(UploadCoordinator::new(Arc::clone(&service), config));
    let mut events = coordinator
        .take_events()
        .context("event receiver already taken")?;

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                UploadEvent::StateChanged { file_id, state } => {
                    if state != UploadState::Completed {
                        println!("[{file_id}] {state:?}");
                    }
                }
                UploadEvent::Progress(p) => {
                    let eta = p
                        .eta_seconds
                        .map(|secs| format!("  eta {secs:.1}s"))
                        .unwrap_or_default();
                    println!(
                        "[{}] {:5.1}%  {}/{} chunks  {:.0} B/s{eta}",
                        p.file_id,
                        p.percentage(),
                        p.uploaded_chunks,
                        p.total_chunks,
                        p.bytes_per_second
                    );
                }
                UploadEvent::ChunkRetry {
                    file_id,
                    index,
                    attempt,
                    error,
                } => println!("[{file_id}] chunk {index} retry after attempt {attempt}: {error}"),
                UploadEvent::Completed {
                    file_id,
                    url,
                    instant,
                } => {
                    let how = if instant { "instant transfer" } else { "uploaded" };
                    println!("[{file_id}] done ({how}) -> {}", url.unwrap_or_default());
                }
                UploadEvent::Failed { file_id, error } => println!("[{file_id}] failed: {error}"),
                UploadEvent::Cancelled { file_id } => println!("[{file_id}] cancelled"),
            }
        }
    });

    let mut uploads = JoinSet::new();
    for path in &args.files {
        let source = FileSource::open(path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        let name = file_name(path)?;
        let file_id = uuid::Uuid::new_v4().to_string();
        let coordinator = Arc::clone(&coordinator);
        uploads.spawn(async move { (name.clone(), coordinator.upload(file_id, name, source).await) });
    }

    let mut failed = 0;
    while let Some(joined) = uploads.join_next().await {
        let (name, result) = joined?;
        if !report(&name, &result) {
            failed += 1;
        }
    }

    // Same content again: the service already has it.
    let first = &args.files[0];
    let name = file_name(first)?;
    let again = coordinator
        .upload(
            uuid::Uuid::new_v4().to_string(),
            name.clone(),
            FileSource::open(first)?,
        )
        .await;
    if !report(&name, &again) {
        failed += 1;
    }

    let snapshot = service.snapshot();
    tracing::info!(
        files = snapshot.uploaded_files.len(),
        chunk_uploads = service.stored_uploads(),
        max_in_flight = service.max_in_flight(),
        "service state"
    );

    drop(coordinator);
    let _ = printer.await;

    if failed > 0 {
        bail!("{failed} upload(s) failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> anyhow::Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn parses_files_and_config() {
        let parsed = args(&["--config", "cfg.json", "a.bin", "b.bin"]).unwrap();
        assert_eq!(parsed.config, Some(PathBuf::from("cfg.json")));
        assert_eq!(parsed.files.len(), 2);
    }

    #[test]
    fn requires_a_file() {
        assert!(args(&[]).is_err());
        assert!(args(&["--config", "cfg.json"]).is_err());
        assert!(args(&["--config"]).is_err());
    }

    #[test]
    fn report_counts_failures() {
        let outcome = UploadOutcome {
            file_id: "f1".into(),
            file_hash: "abc".into(),
            url: Some("/uploads/a.bin".into()),
            instant: true,
            uploaded_chunks: 0,
            resumed_chunks: 0,
        };
        assert!(report("a.bin", &Ok(outcome)));
        assert!(!report("a.bin", &Err(UploadError::Cancelled)));
        assert!(!report(
            "a.bin",
            &Err(UploadError::AlreadyActive("f1".into()))
        ));
    }

    #[test]
    fn file_name_from_path() {
        assert_eq!(file_name(Path::new("/tmp/movie.mp4")).unwrap(), "movie.mp4");
        assert!(file_name(Path::new("/")).is_err());
    }
}
