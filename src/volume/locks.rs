//! In-process lock table keyed by volume id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Table = HashMap<String, Arc<AsyncMutex<()>>>;

/// Serializes operations on the same volume id. Ids nobody holds or waits
/// for are dropped from the table.
#[derive(Debug, Default, Clone)]
pub struct IdLocks {
    table: Arc<Mutex<Table>>,
}

impl IdLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait until `id` is free and hold it until the guard is dropped.
    pub async fn lock(&self, id: &str) -> IdGuard {
        let lock = self
            .table()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let guard = lock.clone().lock_owned().await;
        IdGuard {
            id: id.to_string(),
            table: self.table.clone(),
            lock,
            guard: Some(guard),
        }
    }

    /// Number of ids currently held or waited for.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct IdGuard {
    id: String,
    table: Arc<Mutex<Table>>,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the table and one here: nobody else is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            table.remove(&self.id);
        }
    }
}
