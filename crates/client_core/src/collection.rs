//! Observable, ordered story list.
//!
//! Every mutation notifies all observers synchronously before it returns, in
//! the order mutations were applied. Observers receive the change together
//! with the full post-mutation contents, so a renderer never has to replay
//! history to know what is on screen.

use shared::domain::Story;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionChange {
    /// Contents were replaced wholesale.
    Reset,
    Appended {
        index: usize,
    },
    /// An entry was swapped for a newer copy of the same story.
    Replaced {
        index: usize,
        previous: Story,
    },
    /// One or more entries were removed; `removed` is in collection order.
    Removed {
        removed: Vec<Story>,
    },
}

pub type Observer = Box<dyn FnMut(&CollectionChange, &[Story]) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct ReactiveCollection {
    items: Vec<Story>,
    observers: Vec<(SubscriptionId, Observer)>,
    next_subscription: u64,
}

impl ReactiveCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: Observer) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.observers.push((id, observer));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(existing, _)| *existing != id);
        self.observers.len() != before
    }

    pub fn items(&self) -> &[Story] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn position(&self, predicate: impl Fn(&Story) -> bool) -> Option<usize> {
        self.items.iter().position(predicate)
    }

    pub fn reset(&mut self, items: Vec<Story>) {
        self.items = items;
        self.notify(&CollectionChange::Reset);
    }

    pub fn append(&mut self, item: Story) {
        self.items.push(item);
        let index = self.items.len() - 1;
        self.notify(&CollectionChange::Appended { index });
    }

    /// Swaps the entry at `index`. Returns `None` without notifying when the
    /// index is out of bounds.
    pub fn replace_at(&mut self, index: usize, item: Story) -> Option<Story> {
        let slot = self.items.get_mut(index)?;
        let previous = std::mem::replace(slot, item);
        self.notify(&CollectionChange::Replaced {
            index,
            previous: previous.clone(),
        });
        Some(previous)
    }

    /// Removes every entry matching `predicate`.
    ///
    /// Observers hear about it once, and only if something was removed.
    pub fn remove_matching(&mut self, predicate: impl Fn(&Story) -> bool) -> Vec<Story> {
        if !self.items.iter().any(&predicate) {
            return Vec::new();
        }

        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.items.len());
        for story in self.items.drain(..) {
            if predicate(&story) {
                removed.push(story);
            } else {
                kept.push(story);
            }
        }
        self.items = kept;

        self.notify(&CollectionChange::Removed {
            removed: removed.clone(),
        });
        removed
    }

    fn notify(&mut self, change: &CollectionChange) {
        let items = &self.items;
        for (_, observer) in &mut self.observers {
            observer(change, items);
        }
    }
}

#[cfg(test)]
#[path = "tests/collection_tests.rs"]
mod tests;
