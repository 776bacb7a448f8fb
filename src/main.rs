//! Stream Ledger demo
//!
//! Appends to a stream stored under a local directory, then reads it back
//! through a named cursor. Run it twice to see the cursor resume.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | STREAM_LEDGER_DATA_DIR | ./stream-ledger-data | Segment and metadata files |
//! | STREAM_LEDGER_CONFIG | (none) | TOML config file |
//! | STREAM_LEDGER_STREAM | demo | Stream name |
//! | STREAM_LEDGER_APPENDS | 10 | Entries appended per run |
//!
//! `STREAM_LEDGER_*` config overrides and `RUST_LOG` apply as usual.

use std::path::PathBuf;
use std::sync::Arc;
use stream_ledger::observability::{init_tracing, LoggingConfig};
use stream_ledger::storage::{LocalFsMetadataBackend, LocalFsSegmentStore};
use stream_ledger::{LogConfig, StreamRegistry};

const DEFAULT_APPENDS: usize = 10;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(&LoggingConfig::from_env());

    let mut config = match std::env::var("STREAM_LEDGER_CONFIG") {
        Ok(path) => LogConfig::from_file(path)?,
        Err(_) => LogConfig::default(),
    };
    config.apply_env_overrides()?;

    let data_dir = std::env::var("STREAM_LEDGER_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("stream-ledger-data"));
    let stream = std::env::var("STREAM_LEDGER_STREAM").unwrap_or_else(|_| "demo".to_string());
    let appends = std::env::var("STREAM_LEDGER_APPENDS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_APPENDS);

    println!("Stream Ledger");
    println!("=============");
    println!("Data dir: {}", data_dir.display());
    println!("Stream:   {}", stream);
    println!("Rollover: {:?}", config.rollover);
    println!();

    let segments = Arc::new(LocalFsSegmentStore::new(data_dir.join("segments")));
    let backend = Arc::new(LocalFsMetadataBackend::new(data_dir.join("metadata")));
    let registry = StreamRegistry::new(config, segments, backend).with_durable_cursors();

    let manager = registry.open(&stream).await?;
    let before = manager.entry_count();
    for i in 0..appends {
        let position = manager
            .add_entry(format!("{} message {}", stream, before + i as u64))
            .await?;
        tracing::debug!(%position, "appended");
    }

    let meta = manager.metadata();
    println!(
        "Appended {} entries; {} total across {} segment(s)",
        appends,
        meta.total_entries(),
        meta.segments.len()
    );

    let cursor = manager.open_cursor("demo-reader").await?;
    println!("Cursor resumes at {}", cursor.position());
    let mut read = 0;
    loop {
        let batch = cursor.read_entries(64).await?;
        if batch.is_empty() {
            break;
        }
        for entry in &batch {
            println!("  {} {}", entry.position, String::from_utf8_lossy(&entry.payload));
        }
        read += batch.len();
    }
    println!("Read {} entries, cursor now at {}", read, cursor.position());

    cursor.close().await?;
    registry.close_all().await?;
    Ok(())
}
