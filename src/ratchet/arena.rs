use crate::ratchet::chain::MessageKey;
use std::collections::BTreeMap;

/// Keys derived ahead of the receiving chain for messages that have not
/// arrived yet, indexed by counter.
///
/// A key leaves the arena exactly once: consumed by its message, or evicted
/// when the chain has moved too far past it. Either way it is zeroed on drop.
#[derive(Default)]
pub(crate) struct SkippedKeys {
    keys: BTreeMap<u64, MessageKey>,
}

impl SkippedKeys {
    pub(crate) fn insert(&mut self, counter: u64, key: MessageKey) {
        self.keys.insert(counter, key);
    }

    pub(crate) fn take(&mut self, counter: u64) -> Option<MessageKey> {
        self.keys.remove(&counter)
    }

    /// Drops every key for a counter below `min_counter`.
    pub(crate) fn evict_below(&mut self, min_counter: u64) -> usize {
        let retained = self.keys.split_off(&min_counter);
        let evicted = std::mem::replace(&mut self.keys, retained);
        evicted.len()
    }

    pub(crate) fn clear(&mut self) {
        self.keys.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }
}
