use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

/// Books with a stage currently submitted. A book is claimed by at most one
/// stage at a time; the claim ends when its guard drops.
#[derive(Clone, Default)]
pub struct InFlightRegistry {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims all of `ids` or none. On conflict returns the ids already held.
    pub fn claim(&self, ids: &[String]) -> Result<InFlightGuard, Vec<String>> {
        let mut held = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        let busy: Vec<String> = ids.iter().filter(|id| held.contains(*id)).cloned().collect();
        if !busy.is_empty() {
            return Err(busy);
        }
        held.extend(ids.iter().cloned());
        Ok(InFlightGuard {
            ids: ids.to_vec(),
            registry: self.clone(),
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }
}

#[must_use = "the claim is released when the guard drops"]
pub struct InFlightGuard {
    ids: Vec<String>,
    registry: InFlightRegistry,
}

impl InFlightGuard {
    pub fn ids(&self) -> &[String] {
        &self.ids
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut held = self
            .registry
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for id in &self.ids {
            held.remove(id);
        }
    }
}
