use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mini_spool_common::{AlwaysUpload, Clock, SystemClock};
use mini_spool_segment::{creation_time_from, decode_records, Directory, StopReason};
use mini_spool_storage::{BatchSize, PerformancePreset, PresetOverride, UploadFrequency, GRANTED_DIR, PENDING_DIR};
use mini_spool_upload::{FeatureHandle, FeatureSpec, PayloadFormat, SpoolCore};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

mod config;
mod intake;

use config::SpoolConfig;
use intake::DirectoryIntake;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(|s| s.as_str()).unwrap_or("demo");

    match cmd {
        "demo" => run_demo().await?,
        "run" => {
            let config_path = args.get(2).cloned().unwrap_or_else(|| {
                eprintln!("Usage: mini-spool run <config.toml>");
                std::process::exit(1);
            });
            run_config(Path::new(&config_path)).await?;
        }
        "inspect" => {
            let dir = args.get(2).cloned().unwrap_or_else(|| {
                eprintln!("Usage: mini-spool inspect <feature dir>");
                std::process::exit(1);
            });
            inspect(Path::new(&dir))?;
        }
        _ => {
            eprintln!("Usage: mini-spool [demo|run <config.toml>|inspect <feature dir>]");
            std::process::exit(1);
        }
    }

    Ok(())
}

#[derive(Serialize)]
struct DemoLog<'a> {
    date: u64,
    status: &'a str,
    service: &'a str,
    message: String,
}

#[derive(Serialize)]
struct DemoView {
    view: String,
    time_spent_ms: u64,
}

async fn run_demo() -> anyhow::Result<()> {
    println!("=== Mini-Spool Demo ===\n");

    let root = std::env::temp_dir().join(format!("mini-spool-demo-{}", std::process::id()));
    let outbox = root.join("outbox");
    let _ = std::fs::remove_dir_all(&root);

    let preset = PerformancePreset::new(BatchSize::Small, UploadFrequency::Frequent).updated(&PresetOverride {
        max_objects_in_file: Some(10),
        ..Default::default()
    });
    let max_object_size = preset.max_object_size;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let core = SpoolCore::new(&root.join("data"), preset, clock.clone())?;

    let logs = core.register_feature(FeatureSpec {
        name: "logs".to_string(),
        uploader: Arc::new(DirectoryIntake::new(&outbox)),
        conditions: Arc::new(AlwaysUpload),
        payload_format: PayloadFormat::json_array(),
        preset: None,
    })?;
    let rum = core.register_feature(FeatureSpec {
        name: "rum".to_string(),
        uploader: Arc::new(DirectoryIntake::flaky(&outbox, 2)),
        conditions: Arc::new(AlwaysUpload),
        payload_format: PayloadFormat::newline_delimited(),
        preset: None,
    })?;

    println!("Writing 25 log events and 8 RUM views (the RUM intake fails twice first)...");
    for i in 0..25u64 {
        logs.write(&DemoLog {
            date: clock.now().as_millis(),
            status: if i % 5 == 0 { "error" } else { "info" },
            service: "demo-app",
            message: format!("request {i} handled"),
        });
    }
    for i in 0..8u64 {
        rum.write(&DemoView {
            view: format!("/screen/{i}"),
            time_spent_ms: 150 * (i + 1),
        });
    }
    println!("Writing one oversized event (dropped by the writer)...");
    logs.write_bytes(vec![b'x'; max_object_size as usize + 1]);

    println!("Waiting for delivery...\n");
    let deadline = Instant::now() + Duration::from_secs(30);
    while Instant::now() < deadline {
        if is_drained(&core, &logs, 25) && is_drained(&core, &rum, 8) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    for feature in [&logs, &rum] {
        println!("[{}]\n{}", feature.name(), feature.metrics());
    }
    let delivered = count_files(&outbox.join("logs")) + count_files(&outbox.join("rum"));
    println!("Payloads in outbox: {delivered}");

    logs.shutdown().await;
    rum.shutdown().await;
    let _ = std::fs::remove_dir_all(&root);

    println!("\n=== Demo Complete ===");
    Ok(())
}

fn is_drained(core: &SpoolCore, feature: &FeatureHandle, expected_events: u64) -> bool {
    feature.metrics().events_written >= expected_events
        && count_files(&core.root().join(feature.name()).join(GRANTED_DIR)) == 0
}

fn count_files(dir: &Path) -> usize {
    Directory::open(dir).and_then(|d| d.files()).map(|f| f.len()).unwrap_or(0)
}

async fn run_config(path: &Path) -> anyhow::Result<()> {
    let config = SpoolConfig::load(path)?;
    let core = SpoolCore::with_tracking_consent(
        &config.root,
        config.preset(),
        Arc::new(SystemClock),
        config.tracking_consent,
    )?;
    let intake = Arc::new(DirectoryIntake::new(&config.outbox_dir));

    let mut features = Vec::new();
    for feature in &config.features {
        features.push(core.register_feature(FeatureSpec {
            name: feature.name.clone(),
            uploader: intake.clone(),
            conditions: Arc::new(AlwaysUpload),
            payload_format: feature.format.payload_format(),
            preset: config.feature_preset(feature),
        })?);
    }

    println!(
        "Spooling {} feature(s) under {} into {}",
        features.len(),
        core.root().display(),
        intake.outbox().display()
    );
    println!("Reading events from stdin as `<feature>\\t<payload>` lines; Ctrl-C to stop.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => route(&features, &line),
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "failed to read stdin");
                    stdin_open = false;
                }
            },
        }
    }

    println!("\nFlushing...");
    for feature in features {
        let flushed = feature.flush().await;
        println!("[{}] flushed {flushed} batch(es)\n{}", feature.name(), feature.metrics());
        feature.shutdown().await;
    }
    Ok(())
}

/// `<feature>\t<payload>` goes to that feature; a bare line goes to the first.
fn route(features: &[FeatureHandle], line: &str) {
    if line.trim().is_empty() {
        return;
    }
    let (target, payload) = match line.split_once('\t') {
        Some((name, payload)) => (features.iter().find(|f| f.name() == name), payload),
        None => (features.first(), line),
    };
    match target {
        Some(feature) => feature.write_bytes(payload.as_bytes().to_vec()),
        None => warn!(line, "no such feature, dropping event"),
    }
}

/// Inspect a feature directory, or a single segment directory.
fn inspect(path: &Path) -> anyhow::Result<()> {
    if !path.is_dir() {
        anyhow::bail!("{} is not a directory", path.display());
    }
    let subdirs: Vec<&str> = [GRANTED_DIR, PENDING_DIR]
        .into_iter()
        .filter(|sub| path.join(sub).is_dir())
        .collect();
    if subdirs.is_empty() {
        return inspect_segments(path);
    }
    for sub in subdirs {
        println!("[{sub}]");
        inspect_segments(&path.join(sub))?;
        println!();
    }
    Ok(())
}

fn inspect_segments(path: &Path) -> anyhow::Result<()> {
    let directory = Directory::open(path)?;
    let mut files = directory.files()?;
    files.sort_by(|a, b| a.name().cmp(b.name()));

    let now = SystemClock.now();
    let max_record_size = PerformancePreset::default().max_object_size;

    println!(
        "{:<22} {:>10} {:>10} {:>8} {:>8}  status",
        "segment", "age", "bytes", "records", "skipped"
    );
    let mut total_bytes = 0usize;
    for file in &files {
        let data = file.read_all()?;
        total_bytes += data.len();
        let decoded = decode_records(&data, max_record_size);
        let age = now.duration_since(creation_time_from(file.name()));
        let status = match decoded.stopped {
            None => "ok".to_string(),
            Some(StopReason::Truncated { offset }) => format!("truncated at {offset}"),
            Some(StopReason::Unframed { offset }) => format!("unframed at {offset}"),
        };
        println!(
            "{:<22} {:>9.1}s {:>10} {:>8} {:>8}  {}",
            file.name(),
            age.as_secs_f64(),
            data.len(),
            decoded.records.len(),
            decoded.skipped,
            status
        );
    }
    println!("{} segment(s), {} bytes", files.len(), total_bytes);
    Ok(())
}
