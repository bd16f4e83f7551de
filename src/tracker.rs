//! Slot-table handle tracker.
//!
//! A runtime tracks the contexts it owns and a context tracks the values it
//! owns, so that owner teardown can bulk-invalidate every outstanding handle
//! without walking host-side containers. The owner holds a growable arena of
//! slots; a handle is `{index, generation}`. Removing an entry tombstones
//! the slot and bumps its generation, so a stale handle can never resolve to
//! a recycled slot.

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Handle {
    index: u32,
    generation: u32,
}

enum Entry<T> {
    Live { generation: u32, item: T },
    Vacant { generation: u32 },
}

pub(crate) struct Tracker<T> {
    slots: Vec<Entry<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Tracker<T> {
    pub(crate) fn new() -> Self {
        Tracker {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub(crate) fn insert(&mut self, item: T) -> Handle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let generation = match *slot {
                Entry::Vacant { generation } => generation,
                Entry::Live { .. } => unreachable!("free list pointed at a live slot"),
            };
            *slot = Entry::Live { generation, item };
            return Handle { index, generation };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Entry::Live {
            generation: 0,
            item,
        });
        Handle {
            index,
            generation: 0,
        }
    }

    pub(crate) fn get(&self, handle: Handle) -> Option<&T> {
        match self.slots.get(handle.index as usize) {
            Some(Entry::Live { generation, item }) if *generation == handle.generation => {
                Some(item)
            }
            _ => None,
        }
    }

    pub(crate) fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    pub(crate) fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        match slot {
            Entry::Live { generation, .. } if *generation == handle.generation => {
                let next = handle.generation.wrapping_add(1);
                let old = std::mem::replace(slot, Entry::Vacant { generation: next });
                self.free.push(handle.index);
                self.live -= 1;
                match old {
                    Entry::Live { item, .. } => Some(item),
                    Entry::Vacant { .. } => unreachable!(),
                }
            }
            _ => None,
        }
    }

    /// Removes every live entry, invoking `f` on each. Outstanding handles
    /// all become stale.
    pub(crate) fn drain(&mut self, mut f: impl FnMut(T)) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Entry::Live { generation, .. } = slot {
                let next = generation.wrapping_add(1);
                let old = std::mem::replace(slot, Entry::Vacant { generation: next });
                self.free.push(index as u32);
                if let Entry::Live { item, .. } = old {
                    f(item);
                }
            }
        }
        self.live = 0;
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }
}
