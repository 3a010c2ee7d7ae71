//! Set-associative cache. One type serves the data/instruction caches, the
//! TLBs (page-granularity blocks, ASID-tagged) and the shared LLC; geometry
//! and policy modules come from configuration.
//!
//! Per cycle, in contract order: retire pending fills, drain inbound writes,
//! drain inbound reads and prefetches, then run the prefetcher's cycle hook.
//! Backpressure is expressed by leaving requests in their queue; nothing is
//! ever dropped on a full MSHR or a full lower-level queue.

use std::collections::VecDeque;
use std::sync::Arc;

use log::debug;
use serde::Deserialize;

use crate::address::Address;
use crate::mem::channel::ChannelRef;
use crate::mem::mshr::{BlockKey, MshrEntry, MshrTable};
use crate::mem::operable::{Cycle, Operable};
use crate::mem::request::{AccessKind, MemRequest, MemResponse};
use crate::modules::{CacheOps, Prefetcher, Replacement};

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheBlock {
    pub valid: bool,
    pub dirty: bool,
    /// Set when the block was brought in by a prefetch and has not yet been
    /// touched by a demand access.
    pub prefetch: bool,
    pub address: Address,
    pub v_address: Address,
    /// Fill payload; TLB entries keep the translated physical address here.
    pub data: Address,
    pub ip: Address,
    pub cpu: usize,
    pub asid: u16,
    pub pf_metadata: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub sets: usize,
    pub ways: usize,
    pub mshr_size: usize,
    pub hit_latency: Cycle,
    pub fill_latency: Cycle,
    pub max_read: usize,
    pub max_write: usize,
    pub max_fill: usize,
    /// Block quantisation: 6 for caches, 12 for TLBs.
    pub offset_bits: u32,
    /// Capacity of the cache's own prefetch queue.
    pub pq_size: usize,
    /// Whether a write miss allocates (as an RFO) or is dropped.
    pub write_allocate: bool,
    pub virtual_prefetch: bool,
    /// TLBs tag blocks and MSHRs with the address-space id.
    pub match_asid: bool,
    /// Identity bit OR-ed into the prefetch origin mask of issued prefetches.
    pub level_bit: u8,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            sets: 64,
            ways: 8,
            mshr_size: 16,
            hit_latency: 4,
            fill_latency: 1,
            max_read: 8,
            max_write: 8,
            max_fill: 8,
            offset_bits: crate::constants::LOG2_BLOCK_SIZE,
            pq_size: 16,
            write_allocate: true,
            virtual_prefetch: false,
            match_asid: false,
            level_bit: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: [u64; 5],
    pub misses: [u64; 5],
    pub mshr_merged: u64,
    pub mshr_returns: u64,
    /// Sum over retired fills of (retire cycle - issue cycle).
    pub mshr_return_cycles: u64,
    pub pf_requested: u64,
    pub pf_issued: u64,
    pub pf_useful: u64,
    pub pf_useless: u64,
    pub pf_late: u64,
    pub writebacks: u64,
}

impl CacheStats {
    pub fn total_hits(&self) -> u64 {
        self.hits.iter().sum()
    }

    pub fn total_misses(&self) -> u64 {
        self.misses.iter().sum()
    }
}

enum ReadOutcome {
    Consumed,
    /// The request could not be consumed this cycle; it goes back to the
    /// head of its queue.
    Stall,
}

pub struct Cache {
    name: String,
    config: CacheConfig,
    blocks: Vec<CacheBlock>,
    mshr: MshrTable,
    internal_pq: VecDeque<MemRequest>,
    uppers: Vec<ChannelRef>,
    lower: ChannelRef,
    replacement: Box<dyn Replacement>,
    prefetcher: Box<dyn Prefetcher>,
    warmup: bool,
    pub stats: CacheStats,
}

impl Cache {
    pub fn new(
        name: impl Into<String>,
        config: CacheConfig,
        uppers: Vec<ChannelRef>,
        lower: ChannelRef,
        replacement: Box<dyn Replacement>,
        prefetcher: Box<dyn Prefetcher>,
    ) -> Self {
        assert!(config.sets > 0 && config.ways > 0, "degenerate cache geometry");
        assert!(config.mshr_size > 0, "cache requires at least one MSHR");
        let blocks = vec![CacheBlock::default(); config.sets * config.ways];
        Cache {
            name: name.into(),
            mshr: MshrTable::new(config.mshr_size),
            internal_pq: VecDeque::with_capacity(config.pq_size),
            blocks,
            config,
            uppers,
            lower,
            replacement,
            prefetcher,
            warmup: false,
            stats: CacheStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn geometry(&self) -> (usize, usize) {
        (self.config.sets, self.config.ways)
    }

    pub fn blocks(&self) -> &[CacheBlock] {
        &self.blocks
    }

    pub fn mshr_occupancy(&self) -> usize {
        self.mshr.occupancy()
    }

    fn quantise(&self, addr: Address) -> u64 {
        addr.value() >> self.config.offset_bits
    }

    fn key_for(&self, addr: Address, asid: u16) -> BlockKey {
        (self.quantise(addr), if self.config.match_asid { asid } else { 0 })
    }

    fn set_index(&self, addr: Address) -> usize {
        (self.quantise(addr) % self.config.sets as u64) as usize
    }

    fn lookup(&self, addr: Address, asid: u16) -> Option<(usize, usize)> {
        let set = self.set_index(addr);
        let tag = self.quantise(addr);
        let row = &self.blocks[set * self.config.ways..(set + 1) * self.config.ways];
        row.iter()
            .position(|b| {
                b.valid
                    && self.quantise(b.address) == tag
                    && (!self.config.match_asid || b.asid == asid)
            })
            .map(|way| (set, way))
    }

    fn make_ops(&self) -> CacheOps {
        CacheOps::new(
            self.mshr.occupancy(),
            self.mshr.capacity(),
            self.config.pq_size.saturating_sub(self.internal_pq.len()),
            self.config.virtual_prefetch,
        )
    }

    fn drain_ops(&mut self, ops: CacheOps, now: Cycle) {
        for pf in ops.take_requests() {
            let mut req = MemRequest::new(AccessKind::Prefetch, pf.address);
            req.fill_this_level = pf.fill_this_level;
            req.pf_metadata = pf.metadata;
            req.pf_origin_level = self.config.level_bit;
            req.event_cycle = now;
            self.stats.pf_requested += 1;
            self.internal_pq.push_back(req);
        }
    }

    /// Record the lower level's responses against their MSHR entries.
    fn collect_responses(&mut self, now: Cycle) {
        loop {
            let resp = {
                let mut lower = self.lower.write().expect("channel lock poisoned");
                lower.pop_ready_response(now)
            };
            let Some(resp) = resp else { break };
            let key = self.key_for(resp.address, resp.asid);
            if !self
                .mshr
                .mark_returned(key, now + self.config.fill_latency, resp.data, resp.pf_metadata)
            {
                debug!("{}: response for {:#x} has no MSHR", self.name, resp.address.value());
            }
        }
    }

    /// Write one retired fill into the array and notify the waiters. Hands
    /// the entry back when the victim writeback has no room below; it stays
    /// RETURNED and retries next cycle.
    fn retire_fill(&mut self, mut entry: MshrEntry, now: Cycle) -> Result<(), MshrEntry> {
        let req = &entry.request;
        let addr = req.address;
        let kind = req.kind;

        if req.fill_this_level && self.lookup(addr, req.asid).is_none() {
            let set = self.set_index(addr);
            let row = &self.blocks[set * self.config.ways..(set + 1) * self.config.ways];
            let way = match row.iter().position(|b| !b.valid) {
                Some(way) => way,
                None => {
                    let way = self.replacement.find_victim(
                        req.cpu,
                        req.instr_id,
                        set,
                        row,
                        req.ip,
                        addr,
                        kind,
                    );
                    assert!(way < self.config.ways, "{}: victim way out of range", self.name);
                    way
                }
            };

            let victim = self.blocks[set * self.config.ways + way];
            if victim.valid && victim.dirty {
                let mut wb = MemRequest::new(AccessKind::Write, victim.address);
                wb.v_address = victim.v_address;
                wb.data = victim.data;
                wb.cpu = victim.cpu;
                wb.asid = victim.asid;
                wb.event_cycle = now;
                let accepted = {
                    let mut lower = self.lower.write().expect("channel lock poisoned");
                    lower.add_wq(wb, now)
                };
                if !accepted {
                    return Err(entry);
                }
                self.stats.writebacks += 1;
            }
            if victim.valid && victim.prefetch {
                self.stats.pf_useless += 1;
            }

            let mut ops = self.make_ops();
            let metadata = self.prefetcher.cache_fill(
                &mut ops,
                addr,
                set,
                way,
                kind == AccessKind::Prefetch,
                if victim.valid { victim.address } else { Address::default() },
                entry.pf_metadata,
            );
            self.drain_ops(ops, now);

            self.blocks[set * self.config.ways + way] = CacheBlock {
                valid: true,
                dirty: kind == AccessKind::Rfo,
                prefetch: kind == AccessKind::Prefetch,
                address: addr,
                v_address: req.v_address,
                data: entry.data,
                ip: req.ip,
                cpu: req.cpu,
                asid: req.asid,
                pf_metadata: metadata,
            };

            self.replacement.update_state(
                req.cpu,
                set,
                way,
                addr,
                req.ip,
                if victim.valid { victim.address } else { Address::default() },
                kind,
                false,
            );

            if kind == AccessKind::Prefetch {
                self.stats.pf_issued += 1;
            }
        }

        self.stats.mshr_returns += 1;
        self.stats.mshr_return_cycles += now.saturating_sub(entry.cycle_issued);

        let dependents = entry.dependents();
        let mut resp = MemResponse::for_request(&entry.request);
        resp.data = entry.data;
        resp.pf_metadata = entry.pf_metadata;
        resp.event_cycle = now;
        resp.instr_depend_on_me = dependents;

        let mut destinations: Vec<ChannelRef> = Vec::new();
        entry
            .waiters
            .drain(..)
            .flat_map(|w| w.to_return)
            .chain(entry.request.to_return.drain(..))
            .for_each(|dest| {
                if !destinations.iter().any(|d| Arc::ptr_eq(d, &dest)) {
                    destinations.push(dest);
                }
            });
        for dest in destinations {
            let mut ch = dest.write().expect("channel lock poisoned");
            ch.push_response(resp.clone(), now);
        }
        Ok(())
    }

    fn handle_write(&mut self, req: MemRequest, now: Cycle) -> ReadOutcome {
        if let Some((set, way)) = self.lookup(req.address, req.asid) {
            self.stats.hits[AccessKind::Write.index()] += 1;
            let victim_addr = self.blocks[set * self.config.ways + way].address;
            self.replacement.update_state(
                req.cpu,
                set,
                way,
                req.address,
                req.ip,
                victim_addr,
                AccessKind::Write,
                true,
            );
            let block = &mut self.blocks[set * self.config.ways + way];
            block.dirty = true;
            return ReadOutcome::Consumed;
        }

        if !self.config.write_allocate {
            self.stats.misses[AccessKind::Write.index()] += 1;
            return ReadOutcome::Consumed;
        }

        // Allocate on write miss by fetching ownership of the block; the
        // miss is accounted as the RFO it becomes.
        let mut rfo = req;
        rfo.kind = AccessKind::Rfo;
        self.handle_miss(rfo, now)
    }

    fn handle_read(&mut self, req: MemRequest, now: Cycle) -> ReadOutcome {
        if let Some((set, way)) = self.lookup(req.address, req.asid) {
            let block = self.blocks[set * self.config.ways + way];
            let demand = req.kind != AccessKind::Prefetch;
            let useful = block.prefetch && demand;
            if useful {
                self.stats.pf_useful += 1;
            }

            let mut ops = self.make_ops();
            let metadata = self.prefetcher.cache_operate(
                &mut ops,
                req.address,
                req.ip,
                true,
                useful,
                req.kind,
                block.pf_metadata,
            );
            self.drain_ops(ops, now);

            self.replacement.update_state(
                req.cpu,
                set,
                way,
                req.address,
                req.ip,
                block.address,
                req.kind,
                true,
            );

            let block = &mut self.blocks[set * self.config.ways + way];
            block.prefetch = false;
            block.pf_metadata = metadata;
            if req.kind == AccessKind::Rfo {
                block.dirty = true;
            }
            let data = block.data;

            self.stats.hits[req.kind.index()] += 1;

            if !req.to_return.is_empty() {
                let mut resp = MemResponse::for_request(&req);
                resp.data = data;
                resp.event_cycle = now + self.config.hit_latency;
                for dest in &req.to_return {
                    let mut ch = dest.write().expect("channel lock poisoned");
                    ch.push_response(resp.clone(), now);
                }
            }
            return ReadOutcome::Consumed;
        }

        let (addr, ip, kind, metadata) = (req.address, req.ip, req.kind, req.pf_metadata);
        match self.handle_miss(req, now) {
            // the prefetcher sees each access exactly once, so a stalled
            // request trains it on the retry that consumes it
            ReadOutcome::Stall => ReadOutcome::Stall,
            ReadOutcome::Consumed => {
                let mut ops = self.make_ops();
                let _ = self.prefetcher.cache_operate(&mut ops, addr, ip, false, false, kind, metadata);
                self.drain_ops(ops, now);
                ReadOutcome::Consumed
            }
        }
    }

    fn handle_miss(&mut self, req: MemRequest, now: Cycle) -> ReadOutcome {
        let key = self.key_for(req.address, req.asid);

        if let Some(entry) = self.mshr.get(key) {
            debug_assert!(entry.request.mergeable_with(&req, self.config.offset_bits, self.config.match_asid));
            let was_prefetch = entry.request.kind == AccessKind::Prefetch;
            let demand = req.kind != AccessKind::Prefetch;
            self.stats.misses[req.kind.index()] += 1;
            self.stats.mshr_merged += 1;
            if was_prefetch && demand {
                // the prefetch was on the right block but has not landed yet
                self.stats.pf_useful += 1;
                self.stats.pf_late += 1;
            }
            // a demand promotes a prefetch entry; an ownership request makes
            // the eventual fill dirty
            if (was_prefetch && demand) || req.kind == AccessKind::Rfo {
                self.mshr.get_mut(key).unwrap().request.kind = req.kind;
            }
            self.mshr.merge(key, req);
            return ReadOutcome::Consumed;
        }

        // Forward-only prefetches target a lower level and need no MSHR.
        if req.kind == AccessKind::Prefetch && !req.fill_this_level {
            let mut fwd = req.clone();
            fwd.fill_this_level = true;
            fwd.event_cycle = now + self.config.hit_latency;
            let accepted = {
                let mut lower = self.lower.write().expect("channel lock poisoned");
                lower.add_pq(fwd, now)
            };
            if !accepted {
                return ReadOutcome::Stall;
            }
            self.stats.misses[req.kind.index()] += 1;
            return ReadOutcome::Consumed;
        }

        if self.mshr.is_full() {
            return ReadOutcome::Stall;
        }

        let mut fwd = req.clone();
        fwd.fill_this_level = true;
        fwd.to_return = vec![self.lower.clone()];
        fwd.instr_depend_on_me.clear();
        fwd.event_cycle = now + self.config.hit_latency;
        let accepted = {
            let mut lower = self.lower.write().expect("channel lock poisoned");
            if fwd.kind == AccessKind::Prefetch {
                lower.add_pq(fwd, now)
            } else {
                lower.add_rq(fwd, now)
            }
        };
        if !accepted {
            return ReadOutcome::Stall;
        }

        self.stats.misses[req.kind.index()] += 1;
        self.mshr.allocate(key, req, now);
        ReadOutcome::Consumed
    }

    /// Drain up to `budget` ready entries from one inbound queue, restoring
    /// whatever stalls. Returns the remaining budget.
    fn drain_queue(
        &mut self,
        which: QueueKind,
        upper_idx: usize,
        mut budget: usize,
        now: Cycle,
    ) -> usize {
        let upper = self.uppers[upper_idx].clone();
        while budget > 0 {
            let req = {
                let mut ch = upper.write().expect("channel lock poisoned");
                match which {
                    QueueKind::Read => ch.pop_ready_rq(now),
                    QueueKind::Write => ch.pop_ready_wq(now),
                    QueueKind::Prefetch => ch.pop_ready_pq(now),
                }
            };
            let Some(req) = req else { break };
            let outcome = match which {
                QueueKind::Write => self.handle_write(req.clone(), now),
                _ => self.handle_read(req.clone(), now),
            };
            match outcome {
                ReadOutcome::Consumed => budget -= 1,
                ReadOutcome::Stall => {
                    let mut ch = upper.write().expect("channel lock poisoned");
                    match which {
                        QueueKind::Read => ch.unpop_rq(vec![req]),
                        QueueKind::Write => ch.unpop_wq(vec![req]),
                        QueueKind::Prefetch => ch.unpop_pq(vec![req]),
                    }
                    break;
                }
            }
        }
        budget
    }

    fn drain_internal_pq(&mut self, mut budget: usize, now: Cycle) -> usize {
        while budget > 0 {
            let Some(front) = self.internal_pq.front() else { break };
            if front.event_cycle > now {
                break;
            }
            let req = self.internal_pq.pop_front().unwrap();
            match self.handle_read(req.clone(), now) {
                ReadOutcome::Consumed => budget -= 1,
                ReadOutcome::Stall => {
                    self.internal_pq.push_front(req);
                    break;
                }
            }
        }
        budget
    }
}

#[derive(Clone, Copy)]
enum QueueKind {
    Read,
    Write,
    Prefetch,
}

impl Operable for Cache {
    fn operate(&mut self, now: Cycle) {
        // 1. retire fills whose stamp has passed
        self.collect_responses(now);
        let mut fills = self.config.max_fill;
        while fills > 0 {
            let Some(entry) = self.mshr.pop_ready(now) else { break };
            match self.retire_fill(entry, now) {
                Ok(()) => fills -= 1,
                Err(entry) => {
                    // writeback backpressure: nothing below took the victim
                    self.mshr.restore(entry);
                    break;
                }
            }
        }

        // 2. inbound writes
        let mut wbudget = self.config.max_write;
        for idx in 0..self.uppers.len() {
            if wbudget == 0 {
                break;
            }
            wbudget = self.drain_queue(QueueKind::Write, idx, wbudget, now);
        }

        // 3. inbound reads, the cache's own prefetches, inbound prefetches
        let mut rbudget = self.config.max_read;
        for idx in 0..self.uppers.len() {
            if rbudget == 0 {
                break;
            }
            rbudget = self.drain_queue(QueueKind::Read, idx, rbudget, now);
        }
        if rbudget > 0 {
            rbudget = self.drain_internal_pq(rbudget, now);
        }
        for idx in 0..self.uppers.len() {
            if rbudget == 0 {
                break;
            }
            rbudget = self.drain_queue(QueueKind::Prefetch, idx, rbudget, now);
        }

        // 4. prefetcher cycle hook
        let mut ops = self.make_ops();
        self.prefetcher.cycle_operate(&mut ops);
        self.drain_ops(ops, now);
    }

    fn begin_phase(&mut self, warmup: bool) {
        self.warmup = warmup;
        self.stats = CacheStats::default();
    }

    fn end_phase(&mut self) {
        if !self.warmup {
            self.prefetcher.final_stats();
            self.replacement.final_stats();
        }
    }
}
