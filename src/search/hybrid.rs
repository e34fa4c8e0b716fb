// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Hybrid search driver: run strategies concurrently, fuse, optionally cache.
//!
//! ```text
//! request ──▶ cache hit? ─────────────────────────────▶ page
//!         └─▶ spawn every strategy on tokio
//!               text   ─┐
//!               vector ─┼─▶ fuse ─▶ cache set (tag "search") ─▶ page
//!               ...    ─┘
//! ```
//!
//! A strategy that errors or panics contributes no hits; the search only
//! fails when every strategy failed.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::fusion::{fuse, SearchHit, SearchRequest, StrategyHit, StrategyResults};
use crate::cache::{ResultCache, Ttl};
use crate::key_codec::{EncodingError, KeyArgs, KeyCodec};
use crate::metrics::{record_fusion, record_strategy_failure};

/// Tag attached to every cached search page
pub const SEARCH_TAG: &str = "search";

/// How many candidates each strategy is asked for, relative to the page end
const DEFAULT_CANDIDATE_FACTOR: usize = 2;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StrategyError {
    #[error("search backend error: {0}")]
    Backend(String),

    #[error("query rejected: {0}")]
    InvalidQuery(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("no search strategies registered")]
    NoStrategies,

    #[error("all {} search strategies failed: {}", .failures.len(), .failures.join("; "))]
    AllStrategiesFailed { failures: Vec<String> },

    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// One independent way of scoring documents against a query.
#[async_trait]
pub trait SearchStrategy: Send + Sync {
    /// Name used to look up this strategy's weight in a request
    fn name(&self) -> &str;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<StrategyHit>, StrategyError>;
}

pub struct HybridSearch {
    strategies: RwLock<Vec<Arc<dyn SearchStrategy>>>,
    cache: Option<(Arc<ResultCache>, Ttl)>,
    codec: KeyCodec,
    key_prefix: String,
    candidate_factor: usize,
}

impl HybridSearch {
    #[must_use]
    pub fn new() -> Self {
        Self {
            strategies: RwLock::new(Vec::new()),
            cache: None,
            codec: KeyCodec::new(),
            key_prefix: "qc".to_string(),
            candidate_factor: DEFAULT_CANDIDATE_FACTOR,
        }
    }

    /// Cache fused pages in `cache` for `ttl`, tagged [`SEARCH_TAG`].
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<ResultCache>, ttl: Ttl) -> Self {
        self.cache = Some((cache, ttl));
        self
    }

    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_candidate_factor(mut self, factor: usize) -> Self {
        self.candidate_factor = factor.max(1);
        self
    }

    #[must_use]
    pub fn with_strategy(self, strategy: Arc<dyn SearchStrategy>) -> Self {
        self.register(strategy);
        self
    }

    /// Add a strategy. A strategy with an already registered name replaces it.
    pub fn register(&self, strategy: Arc<dyn SearchStrategy>) {
        let mut strategies = self.strategies.write();
        strategies.retain(|s| s.name() != strategy.name());
        strategies.push(strategy);
    }

    #[must_use]
    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies.read().iter().map(|s| s.name().to_string()).collect()
    }

    /// Cache key for `request`. Requests that fuse identically because of
    /// a non-finite weight share a key.
    pub fn cache_key(&self, request: &SearchRequest) -> Result<String, EncodingError> {
        let args = KeyArgs::single(&request.with_finite_weights())?;
        self.codec.build(&self.key_prefix, "hybrid_search", &args)
    }

    #[instrument(skip(self, request), fields(query = %request.query()))]
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, SearchError> {
        let key = match &self.cache {
            Some((cache, _)) => {
                let key = self.cache_key(request)?;
                if let Some(page) = cache.get::<Vec<SearchHit>>(&key).await {
                    debug!(key = %key, "Search served from cache");
                    return Ok(page);
                }
                Some(key)
            }
            None => None,
        };

        let results = self.run_strategies(request).await?;
        let page = fuse(request, &results);
        record_fusion(results.len(), page.len());

        if let (Some((cache, ttl)), Some(key)) = (&self.cache, key) {
            if let Err(e) = cache.set(&key, &page, *ttl, &[SEARCH_TAG]).await {
                warn!(key = %key, error = %e, "Fused search page not cached");
            }
        }
        Ok(page)
    }

    async fn run_strategies(&self, request: &SearchRequest) -> Result<Vec<StrategyResults>, SearchError> {
        // Snapshot so the lock is never held across an await
        let strategies: Vec<Arc<dyn SearchStrategy>> = self.strategies.read().clone();
        if strategies.is_empty() {
            return Err(SearchError::NoStrategies);
        }

        let depth = request
            .page_offset()
            .saturating_add(request.page_limit())
            .saturating_mul(self.candidate_factor);

        let handles: Vec<_> = strategies
            .into_iter()
            .map(|strategy| {
                let name = strategy.name().to_string();
                let query = request.query().to_string();
                let handle = tokio::spawn(async move { strategy.search(&query, depth).await });
                (name, handle)
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        let mut failures = Vec::new();
        for (name, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome.map_err(|e| e.to_string()),
                Err(join_error) => Err(format!("strategy task failed: {}", join_error)),
            };
            match outcome {
                Ok(hits) => results.push(StrategyResults::new(name, hits)),
                Err(reason) => {
                    warn!(strategy = %name, error = %reason, "Search strategy failed, continuing without it");
                    record_strategy_failure(&name);
                    failures.push(format!("{}: {}", name, reason));
                }
            }
        }

        if results.is_empty() {
            return Err(SearchError::AllStrategiesFailed { failures });
        }
        Ok(results)
    }
}

impl Default for HybridSearch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        name: &'static str,
        hits: Vec<StrategyHit>,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(name: &'static str, pairs: &[(&str, f64)]) -> Arc<Self> {
            Arc::new(Self {
                name,
                hits: pairs.iter().map(|(d, s)| StrategyHit::new(*d, *s)).collect(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SearchStrategy for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn search(&self, _query: &str, limit: usize) -> Result<Vec<StrategyHit>, StrategyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.hits.iter().take(limit).cloned().collect())
        }
    }

    struct Broken;

    #[async_trait]
    impl SearchStrategy for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<StrategyHit>, StrategyError> {
            Err(StrategyError::Backend("index offline".into()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl SearchStrategy for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<StrategyHit>, StrategyError> {
            panic!("strategy bug")
        }
    }

    fn request() -> SearchRequest {
        SearchRequest::new("rust async")
            .weight("text", 0.6)
            .weight("vector", 0.4)
            .limit(5)
    }

    #[tokio::test]
    async fn test_fuses_all_strategies() {
        let search = HybridSearch::new()
            .with_strategy(Fixed::new("text", &[("a", 3.0), ("b", 1.0)]))
            .with_strategy(Fixed::new("vector", &[("b", 0.9), ("c", 0.1)]));

        let page = search.search(&request()).await.unwrap();
        let ids: Vec<&str> = page.iter().map(|h| h.document_id.as_str()).collect();
        // a: 0.6, b: 0.4, c: 0.0
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_failing_strategy_degrades() {
        let search = HybridSearch::new()
            .with_strategy(Fixed::new("text", &[("a", 1.0)]))
            .with_strategy(Arc::new(Broken))
            .with_strategy(Arc::new(Panicking));

        let page = search.search(&request()).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].document_id, "a");
    }

    #[tokio::test]
    async fn test_all_failing_is_an_error() {
        let search = HybridSearch::new()
            .with_strategy(Arc::new(Broken))
            .with_strategy(Arc::new(Panicking));

        match search.search(&request()).await {
            Err(SearchError::AllStrategiesFailed { failures }) => assert_eq!(failures.len(), 2),
            other => panic!("expected AllStrategiesFailed, got {:?}", other),
        }
        assert!(matches!(
            HybridSearch::new().search(&request()).await,
            Err(SearchError::NoStrategies)
        ));
    }

    #[tokio::test]
    async fn test_register_replaces_same_name() {
        let search = HybridSearch::new()
            .with_strategy(Fixed::new("text", &[("old", 1.0)]))
            .with_strategy(Fixed::new("text", &[("new", 1.0)]));
        assert_eq!(search.strategy_names(), vec!["text".to_string()]);

        let page = search.search(&request()).await.unwrap();
        assert_eq!(page[0].document_id, "new");
    }

    #[tokio::test]
    async fn test_pages_are_cached_and_tag_invalidated() {
        let cache = Arc::new(ResultCache::new(Arc::new(InMemoryStore::new())));
        let text = Fixed::new("text", &[("a", 1.0), ("b", 0.5)]);
        let search = HybridSearch::new()
            .with_cache(cache.clone(), Ttl::from_secs(60))
            .with_strategy(text.clone());

        let first = search.search(&request()).await.unwrap();
        let second = search.search(&request()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(text.calls.load(Ordering::SeqCst), 1);

        // A different page is a different cache key
        search.search(&request().offset(1)).await.unwrap();
        assert_eq!(text.calls.load(Ordering::SeqCst), 2);

        assert_eq!(cache.invalidate_by_tag(SEARCH_TAG).await.unwrap(), 2);
        search.search(&request()).await.unwrap();
        assert_eq!(text.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_finite_weight_is_searchable_and_cached() {
        let cache = Arc::new(ResultCache::new(Arc::new(InMemoryStore::new())));
        let text = Fixed::new("text", &[("a", 1.0), ("b", 0.5)]);
        let search = HybridSearch::new()
            .with_cache(cache, Ttl::from_secs(60))
            .with_strategy(text.clone());

        let nan = request().weight("vector", f64::NAN);
        let zero = request().weight("vector", 0.0);
        assert_eq!(search.cache_key(&nan).unwrap(), search.cache_key(&zero).unwrap());

        let first = search.search(&nan).await.unwrap();
        assert_eq!(search.search(&zero).await.unwrap(), first);
        assert_eq!(text.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_candidate_depth() {
        let pairs: Vec<(String, f64)> = (0..20).map(|i| (format!("d{:02}", i), 20.0 - i as f64)).collect();
        let borrowed: Vec<(&str, f64)> = pairs.iter().map(|(d, s)| (d.as_str(), *s)).collect();
        let text = Fixed::new("text", &borrowed);
        let search = HybridSearch::new().with_strategy(text);

        let page = search
            .search(&SearchRequest::new("q").weight("text", 1.0).offset(3).limit(2))
            .await
            .unwrap();
        let ids: Vec<&str> = page.iter().map(|h| h.document_id.as_str()).collect();
        assert_eq!(ids, vec!["d03", "d04"]);
    }
}
