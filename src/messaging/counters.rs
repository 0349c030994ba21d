use std::collections::HashMap;

use crate::messaging::topic::Part;

struct Entry {
    parts: Vec<Part>,
    count: usize,
}

/// Per-connection subscription refcounts, keyed by the presented access-key
/// bytes. A client may subscribe through several overlapping expressions;
/// the trie entry is only created on the first reference and removed on the
/// last. Callers guard this with the connection's own mutex.
#[derive(Default)]
pub struct Counters {
    entries: HashMap<Vec<u8>, Entry>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    /// Bump the refcount, recording the pattern on first use. Returns true
    /// on the 0→1 transition.
    pub fn increment(&mut self, key: &[u8], parts: &[Part]) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.count += 1;
                false
            }
            None => {
                self.entries.insert(
                    key.to_vec(),
                    Entry {
                        parts: parts.to_vec(),
                        count: 1,
                    },
                );
                true
            }
        }
    }

    /// Drop one reference. Returns the stored pattern and whether this was
    /// the 1→0 transition; `None` when the key was never counted.
    pub fn decrement(&mut self, key: &[u8]) -> Option<(Vec<Part>, bool)> {
        let entry = self.entries.get_mut(key)?;
        entry.count -= 1;
        if entry.count == 0 {
            let entry = self.entries.remove(key).expect("entry present");
            Some((entry.parts, true))
        } else {
            Some((entry.parts.clone(), false))
        }
    }

    /// Snapshot of every counted pattern, for unsubscribe-all on close.
    pub fn all(&self) -> Vec<Vec<Part>> {
        self.entries.values().map(|e| e.parts.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
