//! Shared reference data.

use std::collections::HashMap;
use std::hash::Hash;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Read-mostly cache filled on first use and clearable between tests.
#[derive(Debug, Default)]
pub struct ReferenceCache<K, V> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K, V> ReferenceCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.entries.write().insert(key, value)
    }

    pub fn get_or_insert_with(&self, key: K, init: impl FnOnce() -> V) -> V {
        if let Some(value) = self.entries.read().get(&key) {
            return value.clone();
        }
        self.entries.write().entry(key).or_insert_with(init).clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

pub type ActorDirectory = ReferenceCache<String, String>;

/// Actor id -> display name, shared by every room in the process.
pub static ACTOR_DIRECTORY: Lazy<ActorDirectory> = Lazy::new(ActorDirectory::new);

pub fn display_name(actor_id: &str) -> String {
    ACTOR_DIRECTORY
        .get(&actor_id.to_string())
        .unwrap_or_else(|| actor_id.to_string())
}

/// Human-readable typing line for a sorted list of actor ids.
pub fn describe_typing(actors: &[String]) -> Option<String> {
    let names: Vec<String> = actors.iter().map(|a| display_name(a)).collect();
    match names.as_slice() {
        [] => None,
        [one] => Some(format!("{one} is typing")),
        [first, second] => Some(format!("{first} and {second} are typing")),
        [first, second, rest @ ..] => Some(format!(
            "{first}, {second} and {} others are typing",
            rest.len()
        )),
    }
}
