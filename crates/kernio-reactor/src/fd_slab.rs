//! Slab of pollable descriptor states.
//!
//! States are jointly referenced by the backend and by in-flight control
//! blocks, so handles carry a generation stamp: a completion that races a
//! `forget` resolves to a stale generation and is dropped instead of
//! touching a recycled slot.

use kernio_core::poll::PollableFdState;

/// Opaque handle to one pollable state. Not copyable: the handle is
/// consumed by `forget`, which is the only way to free the state.
#[derive(Debug)]
pub struct PollableFd {
    slot: u16,
    gen: u16,
}

impl PollableFd {
    /// Packed id stored in kernel user-data words.
    #[inline]
    pub fn id(&self) -> u32 {
        (self.gen as u32) << 16 | self.slot as u32
    }
}

struct Entry {
    gen: u16,
    state: Option<Box<PollableFdState>>,
}

pub struct FdSlab {
    entries: Vec<Entry>,
    free: Vec<u16>,
}

impl FdSlab {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, state: PollableFdState) -> PollableFd {
        match self.free.pop() {
            Some(slot) => {
                let entry = &mut self.entries[slot as usize];
                entry.state = Some(Box::new(state));
                PollableFd { slot, gen: entry.gen }
            }
            None => {
                let slot = self.entries.len() as u16;
                self.entries.push(Entry {
                    gen: 0,
                    state: Some(Box::new(state)),
                });
                PollableFd { slot, gen: 0 }
            }
        }
    }

    pub fn get(&self, fd: &PollableFd) -> &PollableFdState {
        self.entries[fd.slot as usize]
            .state
            .as_deref()
            .expect("pollable state already forgotten")
    }

    pub fn get_mut(&mut self, fd: &PollableFd) -> &mut PollableFdState {
        self.entries[fd.slot as usize]
            .state
            .as_deref_mut()
            .expect("pollable state already forgotten")
    }

    /// Resolve a packed id from a kernel completion. Stale generations
    /// (the state was forgotten while the event was in flight) yield None.
    pub fn lookup(&mut self, id: u32) -> Option<&mut PollableFdState> {
        let slot = (id & 0xffff) as usize;
        let gen = (id >> 16) as u16;
        match self.entries.get_mut(slot) {
            Some(entry) if entry.gen == gen => entry.state.as_deref_mut(),
            _ => None,
        }
    }

    /// Free the state; the handle is consumed and the slot's generation
    /// advances so in-flight ids go stale.
    pub fn remove(&mut self, fd: PollableFd) -> Box<PollableFdState> {
        let entry = &mut self.entries[fd.slot as usize];
        debug_assert_eq!(entry.gen, fd.gen);
        let state = entry.state.take().expect("pollable state already forgotten");
        entry.gen = entry.gen.wrapping_add(1);
        self.free.push(fd.slot);
        state
    }

    pub fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FdSlab {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernio_core::fd::FileDesc;
    use kernio_core::poll::Speculation;

    #[test]
    fn stale_generation_lookups_miss() {
        let mut slab = FdSlab::new();
        let (r, _w) = FileDesc::pipe().unwrap();
        let fd = slab.insert(PollableFdState::new(r, Speculation::default()));
        let id = fd.id();
        assert!(slab.lookup(id).is_some());
        slab.remove(fd);
        assert!(slab.lookup(id).is_none());

        // The slot is recycled under a new generation; the old id still
        // misses.
        let (r2, _w2) = FileDesc::pipe().unwrap();
        let fd2 = slab.insert(PollableFdState::new(r2, Speculation::default()));
        assert!(slab.lookup(id).is_none());
        assert!(slab.lookup(fd2.id()).is_some());
        slab.remove(fd2);
        assert!(slab.is_empty());
    }
}
