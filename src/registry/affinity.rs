use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{QueueError, Result};

#[derive(Debug, Default)]
struct AffinityData {
    by_id: HashMap<u32, Arc<str>>,
    by_token: HashMap<Arc<str>, u32>,
    last_id: u32,
}

/// Token ⇄ id interner for affinity hints.
///
/// The scheduling side of affinities (worker preference bookkeeping) lives
/// outside this engine; jobs only carry the resolved id and printing needs
/// the token back.
#[derive(Debug, Default)]
pub struct AffinityRegistry {
    data: Mutex<AffinityData>,
}

impl AffinityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get-or-create an affinity id. The empty token means "no affinity"
    /// and resolves to the reserved id 0.
    pub fn resolve(&self, token: &str) -> u32 {
        if token.is_empty() {
            return 0;
        }
        let mut data = self.data.lock();
        if let Some(&id) = data.by_token.get(token) {
            return id;
        }
        loop {
            data.last_id = data.last_id.wrapping_add(1);
            if data.last_id != 0 && !data.by_id.contains_key(&data.last_id) {
                break;
            }
        }
        let id = data.last_id;
        let shared: Arc<str> = Arc::from(token);
        data.by_id.insert(id, shared.clone());
        data.by_token.insert(shared, id);
        id
    }

    pub fn token(&self, affinity_id: u32) -> Result<Arc<str>> {
        let data = self.data.lock();
        data.by_id
            .get(&affinity_id)
            .cloned()
            .ok_or_else(|| QueueError::AffinityNotFound(affinity_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.data.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().by_id.is_empty()
    }
}
