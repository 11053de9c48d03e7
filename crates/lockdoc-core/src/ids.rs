use std::{collections::HashMap, hash::Hash};

/// A monotonic source of numeric identifiers.
///
/// Every engine instance owns its own counters, so independent conversions
/// never share identifier sequences.
#[derive(Debug, Clone)]
pub struct IdCounter {
    next: u64,
}

impl IdCounter {
    /// Creates a counter whose first identifier is `1`.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self { next: first }
    }

    /// Hands out the next identifier.
    pub fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }

    /// Returns the identifier the next call to [`IdCounter::next_id`] will hand out.
    pub fn peek(&self) -> u64 {
        self.next
    }
}

impl Default for IdCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Assigns a stable identifier to every distinct value it is shown.
pub struct Interner<T> {
    map: HashMap<T, u64>,
    counter: IdCounter,
}

impl<T: Eq + Hash + Clone> Interner<T> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            counter: IdCounter::new(),
        }
    }

    /// Returns the identifier of `value` and whether it was assigned just now.
    pub fn intern(&mut self, value: &T) -> (u64, bool) {
        if let Some(id) = self.map.get(value) {
            (*id, false)
        } else {
            let id = self.counter.next_id();
            self.map.insert(value.clone(), id);
            (id, true)
        }
    }

    pub fn get(&self, value: &T) -> Option<u64> {
        self.map.get(value).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<T: Eq + Hash + Clone> Default for Interner<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{IdCounter, Interner};

    #[test]
    fn counters_are_independent() {
        let mut a = IdCounter::new();
        let mut b = IdCounter::new();

        assert_eq!(a.next_id(), 1);
        assert_eq!(a.next_id(), 2);
        assert_eq!(b.next_id(), 1);
        assert_eq!(a.peek(), 3);
    }

    #[test]
    fn interner_reuses_identifiers() {
        let mut types = Interner::new();

        assert_eq!(types.intern(&String::from("task_struct")), (1, true));
        assert_eq!(types.intern(&String::from("inode")), (2, true));
        assert_eq!(types.intern(&String::from("task_struct")), (1, false));
        assert_eq!(types.get(&String::from("inode")), Some(2));
        assert_eq!(types.len(), 2);
    }
}
