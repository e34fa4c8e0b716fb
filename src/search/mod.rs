// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Multi-strategy search
//!
//! Strategies (full-text, vector, anything implementing [`SearchStrategy`])
//! are external collaborators. This module merges what they return.
//!
//! # Architecture
//!
//! ```text
//! SearchRequest (query, weights, page, mode)
//!     ↓
//! HybridSearch ──→ SearchStrategy × N (concurrent)
//!     ↓
//! fuse() ──→ Vec<SearchHit>
//!     ↓
//! ResultCache (optional, tag "search")
//! ```

mod fusion;
mod hybrid;

pub use fusion::{
    fuse, FusionMode, SearchHit, SearchRequest, StrategyHit, StrategyResults, DEFAULT_RRF_K,
};
pub use hybrid::{HybridSearch, SearchError, SearchStrategy, StrategyError, SEARCH_TAG};
