//! Persistent per-module state.
//!
//! Each module (the daemon itself, every helper) owns a JSON object stored
//! at `<data_root>/<module>.json`. Objects are read lazily on first access
//! and held in memory; [`DataStore::write`] flushes a module only when it
//! has been modified. Persistence is best-effort: write failures are logged
//! and never propagate to the caller.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::config::atomic_write;

/// Data store shared between the daemon and its helpers.
pub type SharedData = Arc<Mutex<DataStore>>;

/// Per-module JSON state with dirty tracking.
#[derive(Debug)]
pub struct DataStore {
    root: PathBuf,
    modules: BTreeMap<String, Map<String, Value>>,
    dirty: HashSet<String>,
}

impl DataStore {
    /// Creates a store rooted at `root`. Nothing is read until accessed.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            modules: BTreeMap::new(),
            dirty: HashSet::new(),
        }
    }

    /// Wraps the store for sharing.
    #[must_use]
    pub fn into_shared(self) -> SharedData {
        Arc::new(Mutex::new(self))
    }

    /// Directory holding the module files.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, module: &str) -> PathBuf {
        self.root.join(format!("{module}.json"))
    }

    fn module(&mut self, module: &str) -> &mut Map<String, Value> {
        let path = self.path_for(module);
        self.modules
            .entry(module.to_string())
            .or_insert_with(|| read_module(&path))
    }

    /// Reads `module.key`.
    pub fn get(&mut self, module: &str, key: &str) -> Option<Value> {
        self.module(module).get(key).cloned()
    }

    /// Sets `module.key`, marking the module dirty.
    pub fn set(&mut self, module: &str, key: &str, value: Value) {
        self.module(module).insert(key.to_string(), value);
        self.dirty.insert(module.to_string());
    }

    /// Removes `module.key`, marking the module dirty if it existed.
    pub fn remove(&mut self, module: &str, key: &str) -> Option<Value> {
        let removed = self.module(module).remove(key);
        if removed.is_some() {
            self.dirty.insert(module.to_string());
        }
        removed
    }

    /// Whether `module` has unwritten changes.
    #[must_use]
    pub fn is_dirty(&self, module: &str) -> bool {
        self.dirty.contains(module)
    }

    /// Flushes `module` if it is dirty.
    pub fn write(&mut self, module: &str) {
        if !self.dirty.contains(module) {
            return;
        }
        let Some(map) = self.modules.get(module) else {
            return;
        };
        let path = self.path_for(module);
        let bytes = match serde_json::to_vec(map) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(module, "failed to serialize data: {e}");
                return;
            },
        };
        match atomic_write(&path, &bytes) {
            Ok(()) => {
                self.dirty.remove(module);
                debug!(path = %path.display(), "data written");
            },
            Err(e) => error!(path = %path.display(), "failed to write data: {e}"),
        }
    }

    /// Flushes every dirty module.
    pub fn write_all(&mut self) {
        let dirty: Vec<String> = self.dirty.iter().cloned().collect();
        for module in dirty {
            self.write(&module);
        }
    }
}

fn read_module(path: &Path) -> Map<String, Value> {
    match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                warn!(path = %path.display(), "data file is not an object, starting fresh");
                Map::new()
            },
            Err(e) => {
                warn!(path = %path.display(), "failed to parse data file: {e}");
                Map::new()
            },
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
        Err(e) => {
            warn!(path = %path.display(), "failed to read data file: {e}");
            Map::new()
        },
    }
}

/// A handle on one module of a [`SharedData`].
#[derive(Debug, Clone)]
pub struct DataSection {
    store: SharedData,
    module: String,
}

impl DataSection {
    /// Scopes `store` to `module`.
    #[must_use]
    pub fn new(store: SharedData, module: impl Into<String>) -> Self {
        Self {
            store,
            module: module.into(),
        }
    }

    /// Module name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.module
    }

    /// Reads a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.store
            .lock()
            .expect("data lock poisoned")
            .get(&self.module, key)
    }

    /// Reads a numeric key.
    #[must_use]
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    /// Reads a string key.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_string))
    }

    /// Sets a key (in memory).
    pub fn set(&self, key: &str, value: impl Into<Value>) {
        self.store
            .lock()
            .expect("data lock poisoned")
            .set(&self.module, key, value.into());
    }

    /// Removes a key (in memory).
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.store
            .lock()
            .expect("data lock poisoned")
            .remove(&self.module, key)
    }

    /// Flushes this module if dirty.
    pub fn write(&self) {
        self.store
            .lock()
            .expect("data lock poisoned")
            .write(&self.module);
    }
}
