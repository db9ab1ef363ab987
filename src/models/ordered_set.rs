use serde::{Deserialize, Serialize};

/// An insertion-ordered set with a hard capacity.
///
/// Used by the Merger (spec §4.3) to union multi-valued fields like
/// references, CWE IDs, vendors and products. Existing members are always
/// kept; once `cap` is reached, new members are dropped from the tail of
/// the incoming batch rather than evicting anything already present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderedCappedSet<T> {
    items: Vec<T>,
    cap: Option<usize>,
}

impl<T: PartialEq + Clone> OrderedCappedSet<T> {
    pub fn new(cap: Option<usize>) -> Self {
        Self {
            items: Vec::new(),
            cap,
        }
    }

    pub fn from_vec(items: Vec<T>, cap: Option<usize>) -> Self {
        let mut set = Self::new(cap);
        set.extend(items);
        set
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items
    }

    fn room(&self) -> usize {
        match self.cap {
            Some(cap) => cap.saturating_sub(self.items.len()),
            None => usize::MAX,
        }
    }

    /// Inserts `item` if not already present and capacity remains.
    /// Returns `true` if the item was added.
    pub fn insert(&mut self, item: T) -> bool {
        if self.items.contains(&item) {
            return false;
        }
        if self.room() == 0 {
            return false;
        }
        self.items.push(item);
        true
    }

    /// Extends with new items in order, dropping the tail once `cap` is
    /// reached. Existing items are never displaced.
    pub fn extend(&mut self, new_items: impl IntoIterator<Item = T>) -> usize {
        let mut added = 0;
        for item in new_items {
            if self.insert(item.clone()) {
                added += 1;
            } else if self.room() == 0 && !self.items.contains(&item) {
                // capacity exhausted, remaining new items are dropped
                continue;
            }
        }
        added
    }
}
