use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// In-memory key-value data backing the reference peer and the in-memory client.
///
/// The store is thread-safe and cloned cheaply; clones share the same data.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl Store {
    pub fn new() -> Store {
        Self::default()
    }

    pub fn lock(&self) -> StoreLocked<'_> {
        StoreLocked {
            keys: self
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }
}

pub struct StoreLocked<'a> {
    keys: MutexGuard<'a, HashMap<String, String>>,
}

impl<'a> StoreLocked<'a> {
    pub fn set(&mut self, key: String, value: String) {
        self.keys.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.keys.get(key).cloned()
    }
}
