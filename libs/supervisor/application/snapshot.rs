//! In-process cache of the daily per-ticker snapshots.
//!
//! Owned by the application context and passed explicitly; refreshed from
//! the store after each daily analytics run, cleared by the kill switch.

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::domain::models::ShareSnapshot;

#[derive(Default)]
pub struct SnapshotCache {
    inner: Mutex<HashMap<String, ShareSnapshot>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole cache with a fresh day's snapshots.
    pub fn replace_all(&self, snapshots: Vec<ShareSnapshot>) {
        let mut inner = self.inner.lock();
        inner.clear();
        for snapshot in snapshots {
            inner.insert(snapshot.ticker.clone(), snapshot);
        }
    }

    /// Case-insensitive ticker lookup.
    pub fn get(&self, ticker: &str) -> Option<ShareSnapshot> {
        let inner = self.inner.lock();
        if let Some(snapshot) = inner.get(ticker) {
            return Some(snapshot.clone());
        }
        inner
            .values()
            .find(|s| s.ticker.eq_ignore_ascii_case(ticker))
            .cloned()
    }

    pub fn tickers(&self) -> Vec<String> {
        let mut tickers: Vec<String> = self.inner.lock().keys().cloned().collect();
        tickers.sort();
        tickers
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.len();
        inner.clear();
        count
    }
}
