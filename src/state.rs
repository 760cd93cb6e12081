//! Application state shared across request handlers.

use crate::offsets::cache::OffsetCache;

/// Shared state handed to every handler. Clone-cheap (Arc-backed internals).
#[derive(Clone)]
pub struct AppState {
    pub cache: OffsetCache,
}

impl AppState {
    pub fn new(cache: OffsetCache) -> Self {
        Self { cache }
    }
}
