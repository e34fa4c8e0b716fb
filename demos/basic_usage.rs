// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic usage of query-cache against the in-process store.
//!
//! Run with:
//! ```bash
//! cargo run --example basic_usage
//! ```
//!
//! Set `REDIS_URL` to run the same flow against a real Redis.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use query_cache::{
    HybridSearch, LockFallback, QueryCacheConfig, SearchRequest, SearchStrategy, StrategyError,
    StrategyHit, Ttl,
};

/// Keyword matches over a fixed corpus
struct Keyword;

#[async_trait]
impl SearchStrategy for Keyword {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<StrategyHit>, StrategyError> {
        let corpus = [
            ("rust-101", "intro to rust ownership"),
            ("rust-async", "async rust with tokio"),
            ("go-101", "intro to go"),
        ];
        let mut hits: Vec<StrategyHit> = corpus
            .iter()
            .map(|(id, text)| {
                let score = query.split_whitespace().filter(|w| text.contains(w)).count();
                StrategyHit::new(*id, score as f64)
            })
            .filter(|h| h.score > 0.0)
            .collect();
        hits.truncate(limit);
        Ok(hits)
    }
}

/// Stand-in for an embedding similarity backend
struct Vector;

#[async_trait]
impl SearchStrategy for Vector {
    fn name(&self) -> &str {
        "vector"
    }

    async fn search(&self, _query: &str, limit: usize) -> Result<Vec<StrategyHit>, StrategyError> {
        let mut hits = vec![
            StrategyHit::new("rust-async", 0.91),
            StrategyHit::new("rust-101", 0.84),
            StrategyHit::new("go-101", 0.40),
        ];
        hits.truncate(limit);
        Ok(hits)
    }
}

#[tokio::main]
async fn main() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           query-cache: Basic Usage Example                    ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and connect
    // ─────────────────────────────────────────────────────────────────────────
    let mut config = QueryCacheConfig::new(LockFallback::WaitForPeer {
        poll_interval: Duration::from_millis(20),
        max_wait: Duration::from_secs(5),
    });
    config.redis_url = std::env::var("REDIS_URL").ok();
    config.redis_namespace = Some("demo:".into());

    let store = config.connect_store().await.expect("failed to connect store");
    let memo = config.build(store);
    println!("📦 Store: {}", if config.redis_url.is_some() { "redis" } else { "in-memory" });

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Single-flight memoization
    // ─────────────────────────────────────────────────────────────────────────
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let enrolments = Arc::new(
        memo.wrap(
            "course_enrolments",
            move |course: String| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    Ok::<_, String>(course.len() as u64 * 100)
                }
            },
            config.default_ttl(),
        )
        .with_tags(&["enrolments"]),
    );

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let f = enrolments.clone();
            tokio::spawn(async move { f.call("rust".to_string()).await })
        })
        .collect();
    for handle in handles {
        let value = handle.await.expect("task panicked").expect("memoized call failed");
        assert_eq!(value, 400);
    }
    println!("🔁 20 concurrent callers, computation ran {} time(s)", calls.load(Ordering::SeqCst));

    let removed = memo
        .cache()
        .invalidate_by_tag("enrolments")
        .await
        .expect("tag invalidation failed");
    println!("🧹 Invalidated {} entry(ies) tagged 'enrolments'", removed);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Hybrid search with cached fused pages
    // ─────────────────────────────────────────────────────────────────────────
    let search = HybridSearch::new()
        .with_cache(memo.cache().clone(), Ttl::from_secs(60))
        .with_strategy(Arc::new(Keyword))
        .with_strategy(Arc::new(Vector));

    let request = SearchRequest::new("intro rust")
        .weight("keyword", 0.6)
        .weight("vector", 0.4)
        .limit(3);

    for round in 1..=2 {
        let hits = search.search(&request).await.expect("search failed");
        println!("\n🔎 Round {} for '{}':", round, request.query());
        for hit in &hits {
            println!("   {:<12} {:.3}  {:?}", hit.document_id, hit.combined_score, hit.source_scores);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Stats and metrics
    // ─────────────────────────────────────────────────────────────────────────
    let stats = memo.cache().stats();
    println!(
        "\n📊 hits={} misses={} sets={} errors={} hit_rate={:.2}",
        stats.hits,
        stats.misses,
        stats.sets,
        stats.errors,
        stats.hit_rate()
    );

    println!("\n📈 Metrics:");
    for (key, _, _, value) in snapshotter.snapshot().into_vec() {
        if let DebugValue::Counter(n) = value {
            println!("   {} = {}", key.key().name(), n);
        }
    }
}
