//! Persistence and the single-writer application state
//!
//! Every mutation, whether from a CLI edit or a voice tool-call batch, goes
//! through [`SharedState::update`], which swaps in a whole new snapshot and
//! saves it once.

mod schema;
mod sqlite;

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;

use crate::model::DataSnapshot;
use crate::Result;

pub use schema::SCHEMA_VERSION;
pub use sqlite::SqliteStore;

/// Backing store for application data
pub trait DataStore: Send + Sync {
    /// Load the persisted snapshot, or an empty one on first run
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read
    fn load(&self) -> Result<DataSnapshot>;

    /// Replace the persisted snapshot
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be written
    fn save(&self, snapshot: &DataSnapshot) -> Result<()>;
}

/// In-memory store for tests and headless runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: StdMutex<DataSnapshot>,
    saves: StdMutex<usize>,
}

impl MemoryStore {
    /// Create a store seeded with `snapshot`
    #[must_use]
    pub fn with_snapshot(snapshot: DataSnapshot) -> Self {
        Self {
            data: StdMutex::new(snapshot),
            saves: StdMutex::new(0),
        }
    }

    /// Number of times `save` has been called
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.lock().map(|n| *n).unwrap_or_default()
    }
}

impl DataStore for MemoryStore {
    fn load(&self) -> Result<DataSnapshot> {
        Ok(self.data.lock().map(|d| d.clone()).unwrap_or_default())
    }

    fn save(&self, snapshot: &DataSnapshot) -> Result<()> {
        if let Ok(mut data) = self.data.lock() {
            *data = snapshot.clone();
        }
        if let Ok(mut saves) = self.saves.lock() {
            *saves += 1;
        }
        Ok(())
    }
}

/// Shared application state with a single-writer commit path
#[derive(Clone)]
pub struct SharedState {
    current: Arc<Mutex<DataSnapshot>>,
    store: Arc<dyn DataStore>,
}

impl SharedState {
    /// Load the initial snapshot from `store`
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read
    pub fn open(store: Arc<dyn DataStore>) -> Result<Self> {
        let snapshot = store.load()?;
        tracing::debug!(
            projects = snapshot.projects.len(),
            dates = snapshot.calendar.len(),
            "application state loaded"
        );
        Ok(Self {
            current: Arc::new(Mutex::new(snapshot)),
            store,
        })
    }

    /// Copy of the current snapshot
    pub async fn snapshot(&self) -> DataSnapshot {
        self.current.lock().await.clone()
    }

    /// Apply `f` to a working copy and commit it if anything changed
    ///
    /// # Errors
    ///
    /// Returns error if saving the new snapshot fails
    pub async fn update<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut DataSnapshot) -> R,
    {
        let (out, saved) = self.apply(f).await;
        saved.map(|_| out)
    }

    /// Like [`Self::update`], but hands back the output of `f` even when the
    /// save fails, along with whether a new snapshot was committed
    ///
    /// The writer lock is held for the whole call, so no other update can
    /// observe or interleave with the working copy. The new snapshot is saved
    /// before it replaces the shared one; on save failure nothing changes.
    pub async fn apply<F, R>(&self, f: F) -> (R, Result<bool>)
    where
        F: FnOnce(&mut DataSnapshot) -> R,
    {
        let mut current = self.current.lock().await;
        let mut working = current.clone();
        let out = f(&mut working);

        if working == *current {
            return (out, Ok(false));
        }

        debug_assert!(working.is_consistent());
        if let Err(e) = self.store.save(&working) {
            tracing::warn!(error = %e, "failed to save snapshot");
            return (out, Err(e));
        }
        *current = working;
        tracing::debug!("snapshot committed");
        (out, Ok(true))
    }
}
