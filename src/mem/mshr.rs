//! Miss-status-holding registers.
//!
//! An entry lives from the cycle a miss is forwarded to the lower level until
//! the fill retires: ISSUED while the lower level works (no ready stamp),
//! RETURNED once the response arrives (ready stamp set), then freed by the
//! fill step. At most one entry exists per block key; later misses to the
//! same block merge their waiters into the existing entry. Once issued, a
//! miss runs to completion.

use crate::address::Address;
use crate::mem::operable::Cycle;
use crate::mem::request::{merge_dependents, MemRequest};

/// (quantised address, address-space id) identifying one outstanding block.
pub type BlockKey = (u64, u16);

#[derive(Debug)]
pub struct MshrEntry {
    pub key: BlockKey,
    /// The request that allocated the entry.
    pub request: MemRequest,
    /// Later requests coalesced onto this miss.
    pub waiters: Vec<MemRequest>,
    /// Set when the lower-level response arrives; the fill retires once this
    /// stamp passes.
    pub ready_at: Option<Cycle>,
    pub cycle_issued: Cycle,
    pub data: Address,
    pub pf_metadata: u32,
}

impl MshrEntry {
    fn new(key: BlockKey, request: MemRequest, now: Cycle) -> Self {
        MshrEntry {
            key,
            request,
            waiters: Vec::new(),
            ready_at: None,
            cycle_issued: now,
            data: Address::default(),
            pf_metadata: 0,
        }
    }

    /// All instruction ids woken by this fill.
    pub fn dependents(&self) -> Vec<u64> {
        let mut ids = self.request.instr_depend_on_me.clone();
        for waiter in &self.waiters {
            merge_dependents(&mut ids, &waiter.instr_depend_on_me);
        }
        ids
    }
}

#[derive(Debug)]
pub struct MshrTable {
    capacity: usize,
    entries: Vec<MshrEntry>,
}

impl MshrTable {
    pub fn new(capacity: usize) -> Self {
        MshrTable {
            capacity,
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn occupancy(&self) -> usize {
        self.entries.len()
    }

    pub fn occupancy_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.entries.len() as f64 / self.capacity as f64
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn get(&self, key: BlockKey) -> Option<&MshrEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    pub fn get_mut(&mut self, key: BlockKey) -> Option<&mut MshrEntry> {
        self.entries.iter_mut().find(|e| e.key == key)
    }

    /// Allocate a fresh entry. The caller must have confirmed the lower-level
    /// enqueue succeeded so the exists-iff-outstanding invariant holds.
    pub fn allocate(&mut self, key: BlockKey, request: MemRequest, now: Cycle) -> &mut MshrEntry {
        debug_assert!(self.get(key).is_none(), "duplicate MSHR for {key:?}");
        debug_assert!(!self.is_full());
        self.entries.push(MshrEntry::new(key, request, now));
        self.entries.last_mut().unwrap()
    }

    /// Coalesce `request` onto the outstanding miss for `key`. Returns false
    /// if no such miss exists. Prefetch origin levels are OR-merged and a
    /// demand arrival promotes a prefetch entry to fill this level.
    pub fn merge(&mut self, key: BlockKey, request: MemRequest) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|e| e.key == key) else {
            return false;
        };
        entry.request.pf_origin_level |= request.pf_origin_level;
        if request.kind != crate::mem::request::AccessKind::Prefetch {
            entry.request.fill_this_level = true;
        }
        entry.waiters.push(request);
        true
    }

    /// Record the lower-level response: ISSUED becomes RETURNED.
    pub fn mark_returned(&mut self, key: BlockKey, ready_at: Cycle, data: Address, pf_metadata: u32) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|e| e.key == key) else {
            return false;
        };
        entry.ready_at = Some(ready_at);
        entry.data = data;
        entry.pf_metadata = pf_metadata;
        true
    }

    /// Take the next fill due at `now`: smallest ready stamp, allocation
    /// order breaking ties.
    pub fn pop_ready(&mut self, now: Cycle) -> Option<MshrEntry> {
        let mut best: Option<(usize, Cycle)> = None;
        for (idx, entry) in self.entries.iter().enumerate() {
            if let Some(ready) = entry.ready_at {
                if ready <= now && best.map_or(true, |(_, b)| ready < b) {
                    best = Some((idx, ready));
                }
            }
        }
        best.map(|(idx, _)| self.entries.remove(idx))
    }

    /// Put back an entry whose retirement stalled (e.g. the writeback queue
    /// below is full). Retried next cycle.
    pub fn restore(&mut self, entry: MshrEntry) {
        self.entries.insert(0, entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::mem::request::{AccessKind, MemRequest};

    fn load(addr: u64, instr: u64) -> MemRequest {
        let mut req = MemRequest::new(AccessKind::Load, Address::new(addr));
        req.instr_id = instr;
        req.instr_depend_on_me = vec![instr];
        req
    }

    fn key_of(addr: u64) -> BlockKey {
        (addr >> 6, 0)
    }

    #[test]
    fn one_entry_per_block_with_merged_waiters() {
        let mut table = MshrTable::new(4);
        table.allocate(key_of(0x1000), load(0x1000, 1), 0);
        assert!(table.merge(key_of(0x1000), load(0x1008, 2)));
        assert_eq!(table.occupancy(), 1);
        let deps = table.get(key_of(0x1000)).unwrap().dependents();
        assert_eq!(deps, vec![1, 2]);
    }

    #[test]
    fn merge_fails_without_an_outstanding_miss() {
        let mut table = MshrTable::new(4);
        assert!(!table.merge(key_of(0x2000), load(0x2000, 1)));
    }

    #[test]
    fn entries_retire_in_ready_order() {
        let mut table = MshrTable::new(4);
        table.allocate(key_of(0x1000), load(0x1000, 1), 0);
        table.allocate(key_of(0x2000), load(0x2000, 2), 0);
        assert!(table.mark_returned(key_of(0x2000), 10, Address::default(), 0));
        assert!(table.mark_returned(key_of(0x1000), 12, Address::default(), 0));

        assert!(table.pop_ready(9).is_none());
        assert_eq!(table.pop_ready(20).unwrap().key, key_of(0x2000));
        assert_eq!(table.pop_ready(20).unwrap().key, key_of(0x1000));
        assert!(table.pop_ready(20).is_none());
    }

    #[test]
    fn issued_entries_never_retire() {
        let mut table = MshrTable::new(2);
        table.allocate(key_of(0x1000), load(0x1000, 1), 0);
        assert!(table.pop_ready(u64::MAX).is_none());
    }

    #[test]
    fn capacity_is_enforced_by_the_caller_visible_flag() {
        let mut table = MshrTable::new(2);
        table.allocate(key_of(0x1000), load(0x1000, 1), 0);
        assert!(!table.is_full());
        table.allocate(key_of(0x2000), load(0x2000, 2), 0);
        assert!(table.is_full());
        assert!((table.occupancy_ratio() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn demand_merge_promotes_a_prefetch_entry() {
        let mut table = MshrTable::new(2);
        let mut pf = MemRequest::new(AccessKind::Prefetch, Address::new(0x3000));
        pf.fill_this_level = false;
        table.allocate(key_of(0x3000), pf, 0);
        assert!(table.merge(key_of(0x3000), load(0x3000, 7)));
        assert!(table.get(key_of(0x3000)).unwrap().request.fill_this_level);
    }
}
