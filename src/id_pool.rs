//! A free-list object pool for per-request execution state.

/// A pool that leases reusable values out and hands back a generation-checked token for each
/// lease. Values returned via [`release`](IdPool::release) are parked in their slot and reused
/// by the next lease, so buffers they carry keep their capacity across requests.
#[derive(Debug)]
pub(crate) struct IdPool<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    leased: usize,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    parked: Option<T>,
}

/// Token identifying one lease. Stale tokens (from a previous lease of the same slot) are
/// rejected by `release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolId {
    index: usize,
    generation: u32,
}

impl PoolId {
    /// The slot index, usable as a dense per-lease identifier while the lease is live.
    pub(crate) fn index(&self) -> usize {
        self.index
    }
}

impl<T: Default> IdPool<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: vec![],
            free: vec![],
            leased: 0,
        }
    }

    /// Takes a value out of the pool, reusing a parked one when available.
    pub(crate) fn lease(&mut self) -> (PoolId, T) {
        self.leased += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            let value = slot.parked.take().unwrap_or_default();
            (
                PoolId {
                    index,
                    generation: slot.generation,
                },
                value,
            )
        } else {
            let generation = 0;
            self.slots.push(Slot {
                generation,
                parked: None,
            });
            (
                PoolId {
                    index: self.slots.len() - 1,
                    generation,
                },
                T::default(),
            )
        }
    }

    /// Parks `value` back in its slot. A stale id (the slot was re-leased since) drops the
    /// value instead.
    pub(crate) fn release(&mut self, id: PoolId, value: T) {
        let Some(slot) = self.slots.get_mut(id.index) else {
            return;
        };
        if slot.generation != id.generation || slot.parked.is_some() {
            return;
        }
        slot.generation = slot.generation.wrapping_add(1);
        slot.parked = Some(value);
        self.free.push(id.index);
        self.leased -= 1;
    }

    /// Number of currently leased values.
    #[cfg(test)]
    pub(crate) fn leased(&self) -> usize {
        self.leased
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn reuses_released_slots() {
        let mut pool: IdPool<Vec<u8>> = IdPool::new();
        let (id_a, mut a) = pool.lease();
        let (id_b, _b) = pool.lease();
        assert_eq!(id_a.index(), 0);
        assert_eq!(id_b.index(), 1);
        assert_eq!(pool.leased(), 2);

        a.extend_from_slice(&[1, 2, 3]);
        let capacity = a.capacity();
        a.clear();
        pool.release(id_a, a);
        assert_eq!(pool.leased(), 1);

        // The freed slot (and its buffer capacity) comes back first.
        let (id_c, c) = pool.lease();
        assert_eq!(id_c.index(), 0);
        assert!(c.capacity() >= capacity);
        assert!(c.is_empty());
    }

    #[test]
    fn stale_release_is_ignored() {
        let mut pool: IdPool<Vec<u8>> = IdPool::new();
        let (id_first, first) = pool.lease();
        pool.release(id_first, first);
        let (id_second, second) = pool.lease();

        // Releasing with the token from the first lease must not free the slot again.
        pool.release(id_first, vec![9]);
        assert_eq!(pool.leased(), 1);

        pool.release(id_second, second);
        assert_eq!(pool.leased(), 0);
    }
}
