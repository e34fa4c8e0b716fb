// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared key-value store seam and its adapters.
//!
//! - [`traits`]: the [`KvStore`](traits::KvStore) trait every adapter implements
//! - [`memory`]: in-process DashMap store (single process, tests)
//! - [`redis`]: Redis via `ConnectionManager`
//! - [`glob`]: glob matching shared with the in-process SCAN emulation

pub mod glob;
pub mod memory;
pub mod redis;
pub mod traits;
