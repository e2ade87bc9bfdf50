use super::entity::Entity;
use super::WorldError;

/// Fixed-capacity slot table. Slot 0 is never handed out, so a zero index
/// on the wire always means "nobody".
#[derive(Debug)]
pub struct Registry<T> {
    slots: Vec<Option<T>>,
    len: usize,
}

impl<T: Entity> Registry<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            len: 0,
        }
    }

    /// Places `entity` in the lowest free slot and records the slot on it.
    pub fn register(&mut self, mut entity: T) -> Result<usize, WorldError> {
        let slot = self
            .slots
            .iter()
            .skip(1)
            .position(Option::is_none)
            .map(|index| index + 1)
            .ok_or(WorldError::RegistryFull(self.slots.len()))?;
        entity.core_mut().slot = slot;
        self.slots[slot] = Some(entity);
        self.len += 1;
        Ok(slot)
    }

    pub fn unregister(&mut self, slot: usize) -> Option<T> {
        let removed = self.slots.get_mut(slot).and_then(Option::take);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    pub fn get(&self, slot: usize) -> Option<&T> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut T> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    pub fn contains(&self, slot: usize) -> bool {
        self.get(slot).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| entry.as_ref().map(|entity| (slot, entity)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(slot, entry)| entry.as_mut().map(|entity| (slot, entity)))
    }

    /// Occupied slots in ascending order.
    pub fn slots(&self) -> Vec<usize> {
        self.iter().map(|(slot, _)| slot).collect()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Usable slots, excluding the reserved slot 0.
    pub fn capacity(&self) -> usize {
        self.slots.len().saturating_sub(1)
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.capacity()
    }
}
