//! Named integer counters published for observation.
//!
//! Each cache owns a struct of [`Counter`]s and registers a snapshot closure
//! with the process-wide [`Registry`]; the HTTP server renders the registry
//! as JSON under `/debug/vars`.

use dashmap::DashMap;
use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing integer counter.
///
/// Serializes as its current value.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Serialize for Counter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.get())
    }
}

type SnapshotFn = Box<dyn Fn() -> serde_json::Value + Send + Sync>;

/// Registry of named metric groups.
#[derive(Default)]
pub struct Registry {
    vars: DashMap<String, SnapshotFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a named variable. The closure is invoked on every snapshot.
    pub fn publish<F>(&self, name: &str, f: F)
    where
        F: Fn() -> serde_json::Value + Send + Sync + 'static,
    {
        self.vars.insert(name.to_string(), Box::new(f));
    }

    /// Snapshot all published variables as a JSON object.
    pub fn snapshot(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for entry in self.vars.iter() {
            map.insert(entry.key().clone(), (entry.value())());
        }
        serde_json::Value::Object(map)
    }
}
