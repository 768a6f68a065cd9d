use crate::profiling::profile_function;
use std::{mem::MaybeUninit, num::NonZeroU64};

/// Generational key into a [`SlotMap`].
///
/// Packs a 32-bit generation and a 32-bit index into a single non-zero
/// word, so `Option<SlotKey>` is the same size as `SlotKey`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotKey(NonZeroU64);

impl SlotKey {
    pub fn new(generation: u32, idx: u32) -> Self {
        // The index is stored offset by one so the all-zero bit pattern
        // can never be produced.
        Self(unsafe {
            NonZeroU64::new(((generation as u64) << 32) | (idx as u64 + 1)).unwrap_unchecked()
        })
    }

    pub fn generation(&self) -> u32 {
        (self.0.get() >> 32) as u32
    }

    pub fn index(&self) -> u32 {
        (self.0.get() & u32::MAX as u64) as u32 - 1
    }
}

struct Slot<T> {
    generation: u32,
    live: bool,
    data: MaybeUninit<T>,
}

/// Generational-handle storage with stale-key detection.
///
/// Removing an entry bumps its slot's generation; a key minted before the
/// removal panics on use instead of silently aliasing the new occupant.
pub struct SlotMap<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> SlotMap<T> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, data: T) -> SlotKey {
        profile_function!();
        self.len += 1;
        if let Some(idx) = self.free.pop() {
            let slot = &mut self.slots[idx as usize];
            slot.data = MaybeUninit::new(data);
            slot.live = true;
            SlotKey::new(slot.generation, idx)
        } else {
            let idx = self.slots.len();
            self.slots.push(Slot {
                generation: 0,
                live: true,
                data: MaybeUninit::new(data),
            });
            SlotKey::new(0, idx as u32)
        }
    }

    fn check(&self, key: SlotKey) -> &Slot<T> {
        let slot = &self.slots[key.index() as usize];
        assert!(slot.live, "slot was freed");
        assert_eq!(
            slot.generation,
            key.generation(),
            "invalid generation, use after free!"
        );
        slot
    }

    pub fn get(&self, key: SlotKey) -> &T {
        profile_function!();
        let slot = self.check(key);
        unsafe { slot.data.assume_init_ref() }
    }

    pub fn get_mut(&mut self, key: SlotKey) -> &mut T {
        profile_function!();
        self.check(key);
        let slot = &mut self.slots[key.index() as usize];
        unsafe { slot.data.assume_init_mut() }
    }

    pub fn contains(&self, key: SlotKey) -> bool {
        self.slots
            .get(key.index() as usize)
            .is_some_and(|slot| slot.live && slot.generation == key.generation())
    }

    pub fn remove(&mut self, key: SlotKey) -> T {
        profile_function!();
        self.check(key);
        let index = key.index();
        let slot = &mut self.slots[index as usize];
        let data = unsafe { slot.data.assume_init_read() };
        slot.generation += 1;
        slot.live = false;
        slot.data = MaybeUninit::uninit();
        self.free.push(index);
        self.len -= 1;
        data
    }

    pub fn iter(&self) -> SlotMapIter<'_, T> {
        SlotMapIter { map: self, idx: 0 }
    }
}

impl<T> Drop for SlotMap<T> {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if slot.live {
                unsafe { slot.data.assume_init_drop() };
            }
        }
    }
}

pub struct SlotMapIter<'a, T> {
    map: &'a SlotMap<T>,
    idx: usize,
}

impl<'a, T> Iterator for SlotMapIter<'a, T> {
    type Item = (SlotKey, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(slot) = self.map.slots.get(self.idx) {
            self.idx += 1;
            if slot.live {
                let key = SlotKey::new(slot.generation, (self.idx - 1) as u32);
                // SAFETY: live slots hold initialized data
                return Some((key, unsafe { slot.data.assume_init_ref() }));
            }
        }
        None
    }
}

static_assertions::assert_eq_size!(SlotKey, Option<SlotKey>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_map_insert() {
        let mut map = SlotMap::<u8>::new();
        let key = map.insert(15);
        assert_eq!(key.generation(), 0);
        assert_eq!(key.index(), 0);
        assert_eq!(*map.get(key), 15);
        assert_eq!(map.len(), 1);
    }

    #[test]
    #[should_panic]
    fn test_slot_map_uaf() {
        let mut map = SlotMap::<u8>::new();
        let key = map.insert(15);
        map.remove(key);
        let _ = map.get(key);
    }

    #[test]
    fn test_slot_map_reuse_bumps_generation() {
        let mut map = SlotMap::<u8>::new();
        let key = map.insert(15);
        map.remove(key);
        let new_key = map.insert(45);
        assert_eq!(key.index(), new_key.index());
        assert_ne!(key.generation(), new_key.generation());
        assert_eq!(*map.get(new_key), 45);
    }

    #[test]
    fn test_slot_map_iter_skips_removed() {
        let mut map = SlotMap::<u32>::new();
        let keys: Vec<_> = (0..100).map(|i| map.insert(i)).collect();
        map.remove(keys[0]);
        map.remove(keys[1]);
        let collected: Vec<_> = map.iter().map(|(_, v)| *v).collect();
        assert_eq!(collected.len(), 98);
        for (i, v) in collected.iter().enumerate() {
            assert_eq!(*v, (i + 2) as u32);
        }
    }

    #[test]
    fn test_slot_map_drops_live_entries() {
        use std::sync::Arc;
        let marker = Arc::new(());
        let mut map = SlotMap::new();
        map.insert(marker.clone());
        map.insert(marker.clone());
        drop(map);
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
