//! Stable-index arena for meshes and instances.
//!
//! Slots are never shifted. A freed slot is reused by the next insertion,
//! and its generation counter is bumped so a [`PoolHandle`] taken before the
//! removal no longer resolves.
//!
//! Two iteration views are exposed:
//! - [`ResourcePool::allocated`] walks every slot ever created, live or not.
//!   Binding arrays are sized from this view.
//! - [`ResourcePool::in_use`] walks live entries only, in ascending slot
//!   order. Builds and traversal use this view.

use std::collections::HashMap;
use std::hash::Hash;

/// Generation-checked reference to a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolHandle {
    index: u32,
    generation: u32,
}

impl PoolHandle {
    /// Slot index inside the pool.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Result of [`ResourcePool::insert_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    /// The key was already registered at this index; nothing was built.
    Existing(u32),
    /// A new entry was constructed at this index.
    Created(u32),
}

impl Insert {
    pub fn index(&self) -> u32 {
        match *self {
            Insert::Existing(index) | Insert::Created(index) => index,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Insert::Created(_))
    }
}

struct Slot<K, T> {
    generation: u32,
    entry: Option<(K, T)>,
}

/// Arena keyed by an external id with stable slot indices.
pub struct ResourcePool<K, T> {
    /// Every slot ever allocated.
    slots: Vec<Slot<K, T>>,
    /// Free slot indices.
    free_slots: Vec<u32>,
    /// External key to slot index.
    key_to_index: HashMap<K, u32>,
}

impl<K, T> Default for ResourcePool<K, T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            key_to_index: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone, T> ResourcePool<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key`, building the entry only if it is not present yet.
    ///
    /// `build` receives the slot index the entry will occupy. If it fails,
    /// the slot is not consumed and the pool is left exactly as before.
    pub fn insert_with<E>(
        &mut self,
        key: K,
        build: impl FnOnce(u32) -> Result<T, E>,
    ) -> Result<Insert, E> {
        if let Some(&index) = self.key_to_index.get(&key) {
            return Ok(Insert::Existing(index));
        }

        let index = self.next_index();
        let value = build(index)?;

        if self.free_slots.last() == Some(&index) {
            self.free_slots.pop();
        } else {
            self.slots.push(Slot {
                generation: 0,
                entry: None,
            });
        }

        self.slots[index as usize].entry = Some((key.clone(), value));
        self.key_to_index.insert(key, index);
        Ok(Insert::Created(index))
    }

    /// Free the slot at `index` without moving any other entry.
    pub fn remove(&mut self, index: u32) -> Option<T> {
        let slot = self.slots.get_mut(index as usize)?;
        let (key, value) = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.key_to_index.remove(&key);
        self.free_slots.push(index);
        Some(value)
    }

    pub fn find(&self, key: &K) -> Option<u32> {
        self.key_to_index.get(key).copied()
    }

    pub fn get(&self, index: u32) -> Option<&T> {
        self.slots
            .get(index as usize)
            .and_then(|slot| slot.entry.as_ref())
            .map(|(_, value)| value)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut T> {
        self.slots
            .get_mut(index as usize)
            .and_then(|slot| slot.entry.as_mut())
            .map(|(_, value)| value)
    }

    /// Handle for the live entry at `index`.
    pub fn handle(&self, index: u32) -> Option<PoolHandle> {
        let slot = self.slots.get(index as usize)?;
        slot.entry.as_ref().map(|_| PoolHandle {
            index,
            generation: slot.generation,
        })
    }

    /// Resolve a handle, failing if its slot was freed since it was taken.
    pub fn resolve(&self, handle: PoolHandle) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref().map(|(_, value)| value)
    }

    pub fn key(&self, index: u32) -> Option<&K> {
        self.slots
            .get(index as usize)
            .and_then(|slot| slot.entry.as_ref())
            .map(|(key, _)| key)
    }

    /// Number of slots ever allocated, live or free.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.key_to_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_to_index.is_empty()
    }

    /// Every allocated slot in index order, `None` for free ones.
    pub fn allocated(&self) -> impl Iterator<Item = (u32, Option<&T>)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| (index as u32, slot.entry.as_ref().map(|(_, value)| value)))
    }

    /// Live entries in ascending slot order.
    pub fn in_use(&self) -> impl Iterator<Item = (u32, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|(_, value)| (index as u32, value))
        })
    }

    /// Remove every entry, keeping nothing allocated.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free_slots.clear();
        self.key_to_index.clear();
    }

    fn next_index(&self) -> u32 {
        match self.free_slots.last() {
            Some(&index) => index,
            None => self.slots.len() as u32,
        }
    }
}
