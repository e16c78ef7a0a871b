use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use sluice_common::models::Priority;

type Slot = (Reverse<Priority>, u64);

/// Priority queue, FIFO within a priority, with removal by id.
pub(crate) struct PriorityQueue<T> {
    items: BTreeMap<Slot, (String, T)>,
    index: HashMap<String, Slot>,
    seq: u64,
}

impl<T> PriorityQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            items: BTreeMap::new(),
            index: HashMap::new(),
            seq: 0,
        }
    }

    pub(crate) fn push(&mut self, id: String, priority: Priority, item: T) {
        let slot = (Reverse(priority), self.seq);
        self.seq += 1;
        self.index.insert(id.clone(), slot);
        self.items.insert(slot, (id, item));
    }

    /// Remove and return the first item, in priority order, that `ready` accepts.
    pub(crate) fn pop_first_ready<F>(&mut self, mut ready: F) -> Option<(String, T)>
    where
        F: FnMut(Priority, &T) -> bool,
    {
        let slot = self
            .items
            .iter()
            .find(|((Reverse(priority), _), (_, item))| ready(*priority, item))
            .map(|(slot, _)| *slot)?;
        let (id, item) = self.items.remove(&slot)?;
        self.index.remove(&id);
        Some((id, item))
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<T> {
        let slot = self.index.remove(id)?;
        self.items.remove(&slot).map(|(_, item)| item)
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn count_by_priority(&self) -> BTreeMap<Priority, usize> {
        let mut counts = BTreeMap::new();
        for (Reverse(priority), _) in self.items.keys() {
            *counts.entry(*priority).or_insert(0) += 1;
        }
        counts
    }

    pub(crate) fn drain(&mut self) -> Vec<(String, T)> {
        self.index.clear();
        std::mem::take(&mut self.items).into_values().collect()
    }
}
