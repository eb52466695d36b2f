// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic tristore-sync usage example.
//!
//! Runs entirely in memory, so no Airtable, Postgres or Pinecone account is
//! needed. Demonstrates:
//! 1. Writing records to all three stores in parallel
//! 2. A partial write (the vector store rejects one record)
//! 3. Intent-based reads
//! 4. Consistency reports and a scheduler pass repairing the divergence
//! 5. Displaying metrics
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use tristore_sync::{
    AdapterError, FaultOp, InMemoryAdapter, LogicalRecord, MemoryLedger, QueryIntent, RepairLedger, RetryPolicy,
    StoreKind, StoreSet, SyncConfig, SyncEngine,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           tristore-sync: Basic Usage Example                  ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Build the engine over in-memory stores
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring tristore-sync (in-memory stores)...");
    let relational = Arc::new(InMemoryAdapter::new(StoreKind::Relational));
    let visual = Arc::new(InMemoryAdapter::new(StoreKind::Visual));
    let vector = Arc::new(InMemoryAdapter::new(StoreKind::Vector));
    let ledger = Arc::new(MemoryLedger::new());

    let stores = StoreSet::new(relational.clone(), visual.clone(), vector.clone())?;
    let engine = SyncEngine::new(SyncConfig::default(), stores, ledger.clone())
        .with_retry_policy(RetryPolicy::immediate(5));
    println!("   State: {:?}", engine.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Write a few records (one will be partial)
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Writing 4 records...");
    let titles = ["Hearing notes", "Transcript 12", "Witness list", "Exhibit A"];

    // The third record's vector is "malformed"; one flaky visual call too.
    visual.inject_failures(FaultOp::Write, [AdapterError::Unavailable("502 from gateway".into())]);

    let mut ids = Vec::new();
    for (n, title) in titles.iter().enumerate() {
        if n == 2 {
            vector.inject_failures(FaultOp::Write, [AdapterError::Rejected("dimension mismatch".into())]);
        }
        let record = LogicalRecord::new("content")
            .with_field("title", *title)
            .with_field("view_count", n as f64)
            .with_field("embedding", vec![0.1_f32 * (n as f32 + 1.0); 8]);
        let result = engine.write(record).await?;
        println!(
            "   └─ {} v{} partial={} failed={:?} ({:?})",
            result.id,
            result.sync_version,
            result.partial,
            result.failed_stores(),
            result.elapsed
        );
        ids.push(result.id);
    }
    println!("   Retry queue depth: {}", ledger.retry_depth().await?);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Intent-based reads
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📖 Reading back by intent...");
    for intent in [QueryIntent::VisualBrowse, QueryIntent::ComplexQuery, QueryIntent::SemanticSearch] {
        let copy = engine.read(&ids[0], intent).await?;
        let fields: Vec<_> = copy.map(|r| r.fields.into_keys().collect()).unwrap_or_default();
        println!("   └─ {:?} → {:?}", intent, fields);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Consistency check and a scheduler pass
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔍 Consistency reports...");
    for id in &ids {
        let report = engine.consistency_report(id).await;
        println!("   └─ {}: consistent={} skew={}ms", id, report.is_consistent, report.max_skew_ms);
    }

    println!("\n🔧 Running one scheduler pass...");
    let summary = engine.run_pass().await?;
    println!("   └─ {:?}", summary);
    println!("   Retry queue depth: {}", ledger.retry_depth().await?);
    println!("   Consistent now: {}", engine.consistency_report(&ids[2]).await.is_consistent);

    let health = engine.health_check().await;
    println!("\n🩺 Health: {:?}", health.stores);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Dump raw metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    engine.shutdown();
    println!("\n🛑 Shutdown complete! State: {:?}", engine.state());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics grouped by kind
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
                histograms.push((name, label_str, count, sum));
            }
        }
    }

    counters.sort();
    gauges.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    histograms.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    if !counters.is_empty() {
        println!("   ┌─ Counters (cumulative)");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges (current value)");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms (distributions)");
        for (name, labels, count, sum) in &histograms {
            let avg = if *count > 0 { sum / *count as f64 } else { 0.0 };
            println!("   │  └─ {}{} count={} avg={:.6}", name, labels, count, avg);
        }
    }
    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
