//! Session store capability.
//!
//! The socket persists transport fallback history here so a remembered
//! long-poll fallback survives reconnects within the same session.

use std::cell::RefCell;
use std::collections::HashMap;

/// A minimal key-value session store.
pub trait SessionStore {
    /// Read a value.
    fn get_item(&self, key: &str) -> Option<String>;

    /// Write a value, replacing any prior one.
    fn set_item(&self, key: &str, value: &str);

    /// Remove a value.
    fn remove_item(&self, key: &str);
}

/// In-memory session store, the default when the embedding provides none.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: RefCell<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items.borrow().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) {
        self.items.borrow_mut().insert(key.to_string(), value.to_string());
    }

    fn remove_item(&self, key: &str) {
        self.items.borrow_mut().remove(key);
    }
}
