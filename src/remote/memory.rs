use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::{value_as_number, value_as_string, MonitorSnapshot, RemoteStore, SyncError};

#[derive(Debug, Default)]
struct Inner {
    values: HashMap<String, Value>,
    failing: HashSet<String>,
    fail_writes: bool,
    ready: bool,
    reads: usize,
    writes: Vec<(String, MonitorSnapshot)>,
}

/// In-process store with last-writer-wins semantics per leaf path.
///
/// Used by the simulated hardware mode and as the test double for the sync
/// backend. Clones share state, so a test can keep a handle while the agent
/// owns another.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A ready, empty store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                ready: true,
                ..Default::default()
            })),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.inner.lock().ready = ready;
    }

    pub fn set(&self, path: &str, value: impl Into<Value>) {
        self.inner.lock().values.insert(path.to_string(), value.into());
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        self.inner.lock().values.get(path).cloned()
    }

    /// Make every read of `path` fail with a transport error until cleared.
    pub fn fail_reads(&self, path: &str, fail: bool) {
        let mut inner = self.inner.lock();
        if fail {
            inner.failing.insert(path.to_string());
        } else {
            inner.failing.remove(path);
        }
    }

    /// Reject every write with a transport error until cleared.
    pub fn fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    /// Number of read attempts that reached the store.
    pub fn read_count(&self) -> usize {
        self.inner.lock().reads
    }

    pub fn writes(&self) -> Vec<(String, MonitorSnapshot)> {
        self.inner.lock().writes.clone()
    }

    fn lookup(&self, path: &str) -> Result<Value, SyncError> {
        let mut inner = self.inner.lock();
        if !inner.ready {
            return Err(SyncError::NotReady);
        }
        inner.reads += 1;
        if inner.failing.contains(path) {
            return Err(SyncError::Transport(format!("simulated failure reading {path}")));
        }
        inner
            .values
            .get(path)
            .cloned()
            .ok_or_else(|| SyncError::Missing(path.to_string()))
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn ready(&self) -> bool {
        self.inner.lock().ready
    }

    async fn read_string(&self, path: &str) -> Result<String, SyncError> {
        let value = self.lookup(path)?;
        value_as_string(path, &value)
    }

    async fn read_number(&self, path: &str) -> Result<f64, SyncError> {
        let value = self.lookup(path)?;
        value_as_number(path, &value)
    }

    async fn write_json(&self, path: &str, snapshot: &MonitorSnapshot) -> Result<(), SyncError> {
        let doc = serde_json::to_value(snapshot)
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let mut inner = self.inner.lock();
        if !inner.ready {
            return Err(SyncError::NotReady);
        }
        if inner.fail_writes {
            return Err(SyncError::Transport(format!("simulated failure writing {path}")));
        }
        if let Value::Object(fields) = doc {
            for (key, value) in fields {
                inner.values.insert(super::child_path(path, &key), value);
            }
        }
        inner.writes.push((path.to_string(), *snapshot));
        Ok(())
    }
}
