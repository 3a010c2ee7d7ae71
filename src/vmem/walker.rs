//! Page-table walker.
//!
//! Sits below the last-level TLB and above the data cache: a translation
//! request becomes `levels` dependent reads into the hierarchy, one per
//! page-table level, the last of which yields the physical frame. Walks to
//! the same page in the same address space merge; different address spaces
//! never share a walk. Small per-level structure caches let a warm walker
//! skip the upper-level reads.

use std::sync::{Arc, RwLock};

use log::debug;
use serde::Deserialize;

use crate::address::Address;
use crate::constants::LOG2_BLOCK_SIZE;
use crate::mem::channel::ChannelRef;
use crate::mem::operable::{Cycle, Operable};
use crate::mem::request::{merge_dependents, AccessKind, MemRequest, MemResponse};
use crate::vmem::VirtualMemory;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WalkerConfig {
    /// Concurrent walks held in flight.
    pub walk_table_size: usize,
    /// Entries per page-structure cache level.
    pub pscl_entries: usize,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        WalkerConfig {
            walk_table_size: 8,
            pscl_entries: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WalkerStats {
    pub walks_started: u64,
    pub walks_merged: u64,
    pub walks_completed: u64,
    pub steps_issued: u64,
    pub pscl_skips: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkState {
    /// The next level's read still has to be enqueued below.
    Pending,
    /// A read for the PTE at this block is outstanding.
    Outstanding(Address),
}

struct WalkEntry {
    v_address: Address,
    asid: u16,
    cpu: usize,
    instr_id: u64,
    ip: Address,
    /// Level of the read being issued or awaited; 1 is the leaf.
    level: u32,
    state: WalkState,
    destinations: Vec<ChannelRef>,
    dependents: Vec<u64>,
}

/// Direct-mapped (asid, node index) presence cache for one level.
struct Pscl {
    entries: Vec<Option<(u16, u64)>>,
}

impl Pscl {
    fn new(entries: usize) -> Self {
        Pscl {
            entries: (0..entries.max(1)).map(|_| None).collect(),
        }
    }

    fn slot(&self, key: u64) -> usize {
        (key % self.entries.len() as u64) as usize
    }

    fn contains(&self, asid: u16, key: u64) -> bool {
        self.entries[self.slot(key)] == Some((asid, key))
    }

    fn insert(&mut self, asid: u16, key: u64) {
        let slot = self.slot(key);
        self.entries[slot] = Some((asid, key));
    }
}

pub struct PageWalker {
    name: String,
    config: WalkerConfig,
    upper: ChannelRef,
    lower: ChannelRef,
    vmem: Arc<RwLock<VirtualMemory>>,
    walks: Vec<WalkEntry>,
    /// Indexed by level - 1; level 1 is never cached (it is the leaf).
    pscl: Vec<Pscl>,
    pub stats: WalkerStats,
}

impl PageWalker {
    pub fn new(
        name: impl Into<String>,
        config: WalkerConfig,
        upper: ChannelRef,
        lower: ChannelRef,
        vmem: Arc<RwLock<VirtualMemory>>,
    ) -> Self {
        let levels = vmem.read().expect("vmem lock poisoned").levels();
        PageWalker {
            name: name.into(),
            config,
            upper,
            lower,
            vmem,
            walks: Vec::new(),
            pscl: (0..levels).map(|_| Pscl::new(config.pscl_entries)).collect(),
            stats: WalkerStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_flight(&self) -> usize {
        self.walks.len()
    }

    fn same_walk(entry: &WalkEntry, asid: u16, vaddr: Address) -> bool {
        entry.asid == asid
            && (entry.v_address.value() >> crate::constants::LOG2_PAGE_SIZE)
                == (vaddr.value() >> crate::constants::LOG2_PAGE_SIZE)
    }

    /// Level to start from, skipping levels whose structure caches know the
    /// node already.
    fn start_level(&mut self, asid: u16, vaddr: Address, levels: u32) -> u32 {
        let vmem = self.vmem.read().expect("vmem lock poisoned");
        for level in 2..=levels {
            if self.pscl[(level - 1) as usize].contains(asid, vmem.node_index(vaddr, level)) {
                self.stats.pscl_skips += 1;
                return level - 1;
            }
        }
        levels
    }

    fn advance_returned(&mut self, now: Cycle) {
        loop {
            let resp = {
                let mut lower = self.lower.write().expect("channel lock poisoned");
                lower.pop_ready_response(now)
            };
            let Some(resp) = resp else { break };
            let block = resp.address.value() >> LOG2_BLOCK_SIZE;

            let mut finished: Vec<usize> = Vec::new();
            for idx in 0..self.walks.len() {
                let WalkState::Outstanding(pte) = self.walks[idx].state else {
                    continue;
                };
                if pte.value() >> LOG2_BLOCK_SIZE != block {
                    continue;
                }
                let level = self.walks[idx].level;
                {
                    let vmem = self.vmem.read().expect("vmem lock poisoned");
                    let key = vmem.node_index(self.walks[idx].v_address, level);
                    self.pscl[(level - 1) as usize].insert(self.walks[idx].asid, key);
                }
                if level == 1 {
                    finished.push(idx);
                } else {
                    self.walks[idx].level = level - 1;
                    self.walks[idx].state = WalkState::Pending;
                }
            }

            for idx in finished.into_iter().rev() {
                let walk = self.walks.remove(idx);
                self.complete_walk(walk, now);
            }
        }
    }

    fn complete_walk(&mut self, walk: WalkEntry, now: Cycle) {
        let (pa, fault) = {
            let mut vmem = self.vmem.write().expect("vmem lock poisoned");
            vmem.va_to_pa(walk.asid, walk.v_address)
        };
        let penalty = if fault {
            self.vmem.read().expect("vmem lock poisoned").minor_fault_penalty()
        } else {
            0
        };

        let resp = MemResponse {
            address: walk.v_address,
            v_address: walk.v_address,
            data: pa,
            asid: walk.asid,
            pf_metadata: 0,
            event_cycle: now + penalty,
            instr_depend_on_me: walk.dependents,
        };
        for dest in &walk.destinations {
            let mut ch = dest.write().expect("channel lock poisoned");
            ch.push_response(resp.clone(), now);
        }
        self.stats.walks_completed += 1;
        debug!(
            "{}: walk of {:#x} asid {} -> {:#x}{}",
            self.name,
            walk.v_address.value(),
            walk.asid,
            pa.value(),
            if fault { " (minor fault)" } else { "" }
        );
    }

    fn issue_pending(&mut self, now: Cycle) {
        for idx in 0..self.walks.len() {
            if self.walks[idx].state != WalkState::Pending {
                continue;
            }
            let (pte_pa, _) = {
                let mut vmem = self.vmem.write().expect("vmem lock poisoned");
                vmem.get_pte_pa(self.walks[idx].asid, self.walks[idx].v_address, self.walks[idx].level)
            };

            let mut read = MemRequest::new(AccessKind::Translation, pte_pa);
            read.v_address = self.walks[idx].v_address;
            read.cpu = self.walks[idx].cpu;
            read.asid = self.walks[idx].asid;
            read.instr_id = self.walks[idx].instr_id;
            read.ip = self.walks[idx].ip;
            read.event_cycle = now;
            read.to_return = vec![self.lower.clone()];

            let accepted = {
                let mut lower = self.lower.write().expect("channel lock poisoned");
                lower.add_rq(read, now)
            };
            if !accepted {
                break;
            }
            self.walks[idx].state = WalkState::Outstanding(pte_pa);
            self.stats.steps_issued += 1;
        }
    }

    fn accept_requests(&mut self, now: Cycle) {
        loop {
            if self.walks.len() >= self.config.walk_table_size {
                break;
            }
            let req = {
                let mut upper = self.upper.write().expect("channel lock poisoned");
                upper.pop_ready_rq(now)
            };
            let Some(req) = req else { break };

            if let Some(entry) = self
                .walks
                .iter_mut()
                .find(|w| Self::same_walk(w, req.asid, req.v_address))
            {
                for dest in req.to_return {
                    if !entry.destinations.iter().any(|d| Arc::ptr_eq(d, &dest)) {
                        entry.destinations.push(dest);
                    }
                }
                merge_dependents(&mut entry.dependents, &req.instr_depend_on_me);
                self.stats.walks_merged += 1;
                continue;
            }

            let levels = self.vmem.read().expect("vmem lock poisoned").levels();
            let level = self.start_level(req.asid, req.v_address, levels);
            self.walks.push(WalkEntry {
                v_address: req.v_address,
                asid: req.asid,
                cpu: req.cpu,
                instr_id: req.instr_id,
                ip: req.ip,
                level,
                state: WalkState::Pending,
                destinations: req.to_return,
                dependents: req.instr_depend_on_me,
            });
            self.stats.walks_started += 1;
        }
    }
}

impl Operable for PageWalker {
    fn operate(&mut self, now: Cycle) {
        self.advance_returned(now);
        self.accept_requests(now);
        self.issue_pending(now);
    }

    fn begin_phase(&mut self, _warmup: bool) {
        self.stats = WalkerStats::default();
    }

    fn end_phase(&mut self) {
        debug!(
            "{}: {} walks, {} merged, {} steps, {} structure-cache skips",
            self.name,
            self.stats.walks_completed,
            self.stats.walks_merged,
            self.stats.steps_issued,
            self.stats.pscl_skips
        );
    }
}
