// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Simulated ingest run.
//!
//! Demonstrates:
//! 1. Opening the engine over a temp dir (CSV log + SQLite file + rate state)
//! 2. Syncing several operations against a throttling simulated API
//! 3. Watching the pacing delay adapt per operation
//! 4. Re-running the same jobs (keyed store unchanged, log grows)
//! 5. Displaying metrics
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! RUST_LOG=ingest_engine=debug cargo run --example simulated_sync
//! ```

use std::sync::Arc;
use std::time::Duration;

use ingest_engine::dispatch::simulated::SimulatedApi;
use ingest_engine::{CsvLog, IngestConfig, IngestEngine, KeyedStore, StrategyRegistry, SyncJob};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::{json, Value};

const OPERATIONS: [&str; 4] = [
    "listOrgSites",
    "searchSiteWiredClients",
    "getSiteSleSummaryTrend",
    "listSiteSleImpactedApplications",
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           ingest-engine: Simulated Sync Example               ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and open the engine
    // ─────────────────────────────────────────────────────────────────────────
    let dir = tempfile::tempdir()?;
    let mut config = IngestConfig::default();
    config.rate.initial_delay_ms = 200;
    config.rate.min_delay_ms = 5;
    config.dispatch.page_limit = 25;
    config.dispatch.rate_limit_backoff_ms = 50;
    config.output.csv_dir = dir.path().join("csv");
    config.output.sql_url = format!("sqlite:{}", dir.path().join("ingest.db").display());
    config.output.rate_state_path = Some(dir.path().join("rate_state.jsonl"));

    println!("📦 Output directory: {}", dir.path().display());
    let engine = IngestEngine::open(
        config.clone(),
        StrategyRegistry::network_defaults()?,
        Arc::new(simulated_api()),
    )
    .await?;

    // ─────────────────────────────────────────────────────────────────────────
    // 2-3. First run: pacing learns each operation's limit
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🚀 First run...");
    run(&engine).await?;
    print_pacing(&engine);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Second run over the same outputs
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔁 Second run (same data)...");
    run(&engine).await?;

    println!("\n📖 Output sizes:");
    let log = CsvLog::new(&config.output.csv_dir);
    for op in OPERATIONS {
        let keyed = engine.writer().keyed().rows(op).await?.len();
        let logged = log.read_rows(op).await?.len();
        println!("   └─ {:<34} keyed={:<4} log={}", op, keyed, logged);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Engine Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    engine.shutdown().await?;
    println!("   ✅ Rate state saved to {}", dir.path().join("rate_state.jsonl").display());

    Ok(())
}

async fn run(engine: &IngestEngine) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = OPERATIONS.iter().map(|op| SyncJob::new(*op)).collect();
    for report in engine.sync_all(jobs, None).await? {
        println!("   └─ {}", report);
    }
    Ok(())
}

fn print_pacing(engine: &IngestEngine) {
    println!("\n⏱️  Learned pacing:");
    for op in OPERATIONS {
        if let Some(state) = engine.controller().snapshot(op) {
            println!(
                "   └─ {:<34} delay={:>6.0}ms baseline={:>6.0}ms",
                op,
                state.current_delay * 1000.0,
                state.learned_baseline * 1000.0
            );
        }
    }
}

fn simulated_api() -> SimulatedApi {
    let sites: Vec<Value> = (0..60)
        .map(|i| json!({"id": format!("site-{:02}", i), "name": format!("Site {}", i), "timezone": "Europe/London"}))
        .collect();
    let clients: Vec<Value> = (0..90)
        .map(|i| {
            json!({
                "mac": format!("5c5b35{:06x}", i),
                "site_id": format!("site-{:02}", i % 6),
                "hostname": format!("host-{}", i),
                "vlan": [10, 20],
            })
        })
        .collect();
    let trend: Vec<Value> = (0..6)
        .map(|i| {
            json!({
                "site_id": format!("site-{:02}", i),
                "metric": "coverage",
                "samples": (0..4).map(|s| json!({"value": 0.9 - f64::from(s) * 0.05})).collect::<Vec<_>>(),
            })
        })
        .collect();
    let impacted: Vec<Value> = ["Zoom", "Teams", "Slack"]
        .iter()
        .enumerate()
        .map(|(i, app)| json!({"site_id": "site-00", "metric": "coverage", "name": app, "degraded": i}))
        .collect();

    SimulatedApi::new()
        .with_dataset("listOrgSites", sites)
        .with_dataset("searchSiteWiredClients", clients)
        .with_dataset("getSiteSleSummaryTrend", trend)
        .with_dataset("listSiteSleImpactedApplications", impacted)
        .with_min_spacing("listOrgSites", Duration::from_millis(60))
        .with_min_spacing("searchSiteWiredClients", Duration::from_millis(120))
}

/// Dump all metrics from the debugging recorder
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_, key) = composite_key.into_parts();
        let name = key.name().to_string();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let avg = if count > 0 { sum / count as f64 } else { 0.0 };
                histograms.push((name, label_str, count, avg));
            }
        }
    }

    counters.sort();
    gauges.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
    histograms.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));

    if !counters.is_empty() {
        println!("   ┌─ Counters (cumulative)");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges (current value)");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.3}", name, labels, value);
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms (distributions)");
        for (name, labels, count, avg) in &histograms {
            println!("   │  └─ {}{} count={} avg={:.4}", name, labels, count, avg);
        }
    }
    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
