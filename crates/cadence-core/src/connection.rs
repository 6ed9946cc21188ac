//! Generation-tagged connection keys: everywhere except the control
//! endpoint's own table, a
//! connection is referred to by `ConnKey`, never by an owning handle.

use std::collections::HashMap;

use crate::event_loop::IoToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub index: usize,
    pub generation: u64,
}

/// A minimal generational slab: indices are reused, but a stale `ConnKey`
/// from before a slot was freed and reused never resolves to the new
/// occupant.
#[derive(Debug, Default)]
pub struct Slab<T> {
    slots: Vec<Option<(u64, T)>>,
    free: Vec<usize>,
}

impl<T> Slab<T> {
    pub fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new() }
    }

    pub fn insert(&mut self, value: T) -> ConnKey {
        if let Some(index) = self.free.pop() {
            let generation = self.slots[index].as_ref().map(|(g, _)| g + 1).unwrap_or(0);
            self.slots[index] = Some((generation, value));
            ConnKey { index, generation }
        } else {
            let index = self.slots.len();
            self.slots.push(Some((0, value)));
            ConnKey { index, generation: 0 }
        }
    }

    pub fn remove(&mut self, key: ConnKey) -> Option<T> {
        match self.slots.get_mut(key.index) {
            Some(slot @ Some((gen, _))) if *gen == key.generation => {
                let (_, value) = slot.take().unwrap();
                self.free.push(key.index);
                Some(value)
            }
            _ => None,
        }
    }

    pub fn get(&self, key: ConnKey) -> Option<&T> {
        match self.slots.get(key.index) {
            Some(Some((gen, value))) if *gen == key.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: ConnKey) -> Option<&mut T> {
        match self.slots.get_mut(key.index) {
            Some(Some((gen, value))) if *gen == key.generation => Some(value),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnKey, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.as_ref().map(|(generation, value)| (ConnKey { index, generation: *generation }, value))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ConnKey, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            slot.as_mut().map(|(generation, value)| (ConnKey { index, generation: *generation }, value))
        })
    }
}

/// `IoToken` → `ConnKey` lookup, so the event core can dispatch a
/// readiness notification straight to the owning connection record
/// without scanning the whole table — a `Readiness::Io` event carries a
/// token, never the fd itself, so this is keyed on what dispatch
/// actually has in hand.
#[derive(Debug, Default)]
pub struct TokenIndex {
    by_token: HashMap<IoToken, ConnKey>,
}

impl TokenIndex {
    pub fn new() -> Self {
        Self { by_token: HashMap::new() }
    }

    pub fn insert(&mut self, token: IoToken, key: ConnKey) {
        self.by_token.insert(token, key);
    }

    pub fn remove(&mut self, token: IoToken) {
        self.by_token.remove(&token);
    }

    pub fn get(&self, token: IoToken) -> Option<ConnKey> {
        self.by_token.get(&token).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_key_does_not_resolve_after_reuse() {
        let mut slab: Slab<&'static str> = Slab::new();
        let a = slab.insert("a");
        slab.remove(a);
        let b = slab.insert("b");
        assert_eq!(a.index, b.index);
        assert_ne!(a.generation, b.generation);
        assert!(slab.get(a).is_none());
        assert_eq!(slab.get(b), Some(&"b"));
    }

    #[test]
    fn token_index_resolves_and_forgets() {
        let mut slab: Slab<&'static str> = Slab::new();
        let key = slab.insert("conn");
        let mut tokens = TokenIndex::new();
        let token = IoToken(7);

        tokens.insert(token, key);
        assert_eq!(tokens.get(token), Some(key));

        tokens.remove(token);
        assert_eq!(tokens.get(token), None);
    }
}
