//! The per-worker query slot table.
//!
//! One slot per possible DNS message id. Every slot is always on exactly one
//! of two lists: *unused* (the id is free) or *outstanding* (a query with
//! that id is on the wire). The lists are doubly linked through indices
//! embedded in the slot array, so a slot is reachable in O(1) by id and
//! removable from its list in O(1).
//!
//! List discipline: acquiring takes the head of unused and prepends to
//! outstanding, so the outstanding tail is always the oldest in-flight
//! query. Completed and timed-out slots append to unused, keeping
//! recently-used ids away from immediate reuse; cancellation and send
//! failures prepend, because no response can arrive for those ids anyway.

pub const NUM_SLOTS: usize = 65_536;

/// `sent_at` value for a slot that is acquired but not yet on the wire.
pub const UNSENT: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListTag {
    Unused,
    Outstanding,
}

#[derive(Debug)]
pub struct Slot {
    /// Send timestamp in run microseconds, or [`UNSENT`].
    pub sent_at: u64,
    /// Index of the socket the query left on.
    pub sock: usize,
    /// Copy of the input record, kept only for verbose tracing.
    pub desc: Option<String>,
    list: ListTag,
    prev: Option<u16>,
    next: Option<u16>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ListEnds {
    head: Option<u16>,
    tail: Option<u16>,
    len: usize,
}

pub struct SlotTable {
    slots: Vec<Slot>,
    unused: ListEnds,
    outstanding: ListEnds,
}

impl SlotTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(NUM_SLOTS);
        for id in 0..NUM_SLOTS {
            slots.push(Slot {
                sent_at: UNSENT,
                sock: 0,
                desc: None,
                list: ListTag::Unused,
                prev: (id > 0).then(|| (id - 1) as u16),
                next: (id < NUM_SLOTS - 1).then(|| (id + 1) as u16),
            });
        }

        Self {
            slots,
            unused: ListEnds {
                head: Some(0),
                tail: Some((NUM_SLOTS - 1) as u16),
                len: NUM_SLOTS,
            },
            outstanding: ListEnds::default(),
        }
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len
    }

    pub fn unused_len(&self) -> usize {
        self.unused.len
    }

    /// The oldest in-flight query, i.e. the timeout sweep's first candidate.
    pub fn oldest_outstanding(&self) -> Option<u16> {
        self.outstanding.tail
    }

    pub fn slot(&self, id: u16) -> &Slot {
        &self.slots[id as usize]
    }

    pub fn slot_mut(&mut self, id: u16) -> &mut Slot {
        &mut self.slots[id as usize]
    }

    pub fn is_outstanding(&self, id: u16) -> bool {
        self.slots[id as usize].list == ListTag::Outstanding
    }

    /// Takes a free id and marks it in flight, in the acquired-but-unsent
    /// state. `None` only when every id is outstanding.
    pub fn acquire(&mut self) -> Option<u16> {
        let id = self.unused.head?;
        self.unlink(id);
        self.push_front(id, ListTag::Outstanding);

        let slot = &mut self.slots[id as usize];
        slot.sent_at = UNSENT;
        slot.sock = 0;
        slot.desc = None;

        Some(id)
    }

    /// Returns an id for immediate reuse (send failure, cancellation).
    pub fn release_front(&mut self, id: u16) {
        self.unlink(id);
        self.push_front(id, ListTag::Unused);
    }

    /// Returns an id to the back of the free list (completion, timeout).
    pub fn release_back(&mut self, id: u16) {
        self.unlink(id);
        self.push_back(id, ListTag::Unused);
    }

    fn ends_mut(&mut self, tag: ListTag) -> &mut ListEnds {
        match tag {
            ListTag::Unused => &mut self.unused,
            ListTag::Outstanding => &mut self.outstanding,
        }
    }

    fn unlink(&mut self, id: u16) {
        let (prev, next, tag) = {
            let slot = &self.slots[id as usize];
            (slot.prev, slot.next, slot.list)
        };

        match prev {
            Some(p) => self.slots[p as usize].next = next,
            None => self.ends_mut(tag).head = next,
        }
        match next {
            Some(n) => self.slots[n as usize].prev = prev,
            None => self.ends_mut(tag).tail = prev,
        }
        self.ends_mut(tag).len -= 1;

        let slot = &mut self.slots[id as usize];
        slot.prev = None;
        slot.next = None;
    }

    fn push_front(&mut self, id: u16, tag: ListTag) {
        let old_head = self.ends_mut(tag).head;

        let slot = &mut self.slots[id as usize];
        slot.list = tag;
        slot.prev = None;
        slot.next = old_head;

        match old_head {
            Some(h) => self.slots[h as usize].prev = Some(id),
            None => self.ends_mut(tag).tail = Some(id),
        }
        let ends = self.ends_mut(tag);
        ends.head = Some(id);
        ends.len += 1;
    }

    fn push_back(&mut self, id: u16, tag: ListTag) {
        let old_tail = self.ends_mut(tag).tail;

        let slot = &mut self.slots[id as usize];
        slot.list = tag;
        slot.prev = old_tail;
        slot.next = None;

        match old_tail {
            Some(t) => self.slots[t as usize].next = Some(id),
            None => self.ends_mut(tag).head = Some(id),
        }
        let ends = self.ends_mut(tag);
        ends.tail = Some(id);
        ends.len += 1;
    }
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn unused_ids(table: &SlotTable) -> Vec<u16> {
        let mut ids = Vec::new();
        let mut cursor = table.unused.head;
        while let Some(id) = cursor {
            ids.push(id);
            cursor = table.slots[id as usize].next;
        }
        ids
    }

    #[test]
    fn starts_with_every_slot_unused() {
        let table = SlotTable::new();

        assert_eq!(table.unused_len(), NUM_SLOTS);
        assert_eq!(table.outstanding_len(), 0);
        assert_eq!(table.oldest_outstanding(), None);
    }

    #[test]
    fn acquire_hands_out_ids_in_order() {
        let mut table = SlotTable::new();

        assert_eq!(table.acquire(), Some(0));
        assert_eq!(table.acquire(), Some(1));
        assert_eq!(table.acquire(), Some(2));
        assert_eq!(table.outstanding_len(), 3);
        assert_eq!(table.unused_len(), NUM_SLOTS - 3);
    }

    #[test]
    fn acquired_slot_starts_in_unsent_state() {
        let mut table = SlotTable::new();
        let id = table.acquire().unwrap();

        assert_eq!(table.slot(id).sent_at, UNSENT);
        assert!(table.slot(id).desc.is_none());
        assert!(table.is_outstanding(id));
    }

    #[test]
    fn oldest_outstanding_is_the_first_acquired() {
        let mut table = SlotTable::new();
        let first = table.acquire().unwrap();
        let _second = table.acquire().unwrap();
        let _third = table.acquire().unwrap();

        assert_eq!(table.oldest_outstanding(), Some(first));
    }

    #[test]
    fn release_back_defers_reuse() {
        let mut table = SlotTable::new();
        let id = table.acquire().unwrap();
        table.release_back(id);

        // The id went to the back of the free list, so the next acquire
        // picks a different one.
        assert_ne!(table.acquire(), Some(id));
        assert_eq!(unused_ids(&table).last().copied(), Some(id));
    }

    #[test]
    fn release_front_allows_immediate_reuse() {
        let mut table = SlotTable::new();
        let id = table.acquire().unwrap();
        table.release_front(id);

        assert_eq!(table.acquire(), Some(id));
    }

    #[test]
    fn acquire_exhausts_at_capacity() {
        let mut table = SlotTable::new();
        for _ in 0..NUM_SLOTS {
            assert!(table.acquire().is_some());
        }

        assert_eq!(table.acquire(), None);
        assert_eq!(table.outstanding_len(), NUM_SLOTS);
        assert_eq!(table.unused_len(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Any interleaving of acquire/release keeps every slot on exactly
        /// one list.
        #[test]
        fn list_membership_is_total(ops in proptest::collection::vec(0u8..4, 1..200)) {
            let mut table = SlotTable::new();
            let mut in_flight: Vec<u16> = Vec::new();

            for op in ops {
                match op {
                    0 | 1 => {
                        if let Some(id) = table.acquire() {
                            in_flight.push(id);
                        }
                    }
                    2 => {
                        if let Some(id) = in_flight.pop() {
                            table.release_back(id);
                        }
                    }
                    _ => {
                        if let Some(id) = in_flight.pop() {
                            table.release_front(id);
                        }
                    }
                }

                prop_assert_eq!(table.unused_len() + table.outstanding_len(), NUM_SLOTS);
                prop_assert_eq!(table.outstanding_len(), in_flight.len());
            }

            for &id in &in_flight {
                prop_assert!(table.is_outstanding(id));
            }
        }
    }
}
