//! Pluggable policy modules: replacement, prefetch, branch direction.
//!
//! Modules never hold a reference to their owning cache. The cache passes a
//! [`CacheOps`] handle into every hook; prefetches requested through it are
//! drained into the cache's own prefetch queue after the hook returns.

pub mod bimodal;
pub mod gasp;
pub mod lru;
pub mod next_line;
pub mod ship;

use crate::address::{Address, BlockNumber};
use crate::mem::cache::CacheBlock;
use crate::mem::request::AccessKind;

/// A prefetch requested by a module, before the cache turns it into a queue
/// entry.
#[derive(Debug, Clone, Copy)]
pub struct PrefetchRequest {
    pub address: Address,
    pub fill_this_level: bool,
    pub metadata: u32,
}

/// The slice of cache state a module is allowed to see and the only way it
/// may inject work.
pub struct CacheOps {
    requests: Vec<PrefetchRequest>,
    mshr_occupancy: usize,
    mshr_capacity: usize,
    pq_free: usize,
    virtual_prefetch: bool,
}

impl CacheOps {
    pub(crate) fn new(
        mshr_occupancy: usize,
        mshr_capacity: usize,
        pq_free: usize,
        virtual_prefetch: bool,
    ) -> Self {
        CacheOps {
            requests: Vec::new(),
            mshr_occupancy,
            mshr_capacity,
            pq_free,
            virtual_prefetch,
        }
    }

    /// Request a prefetch of the block containing `addr`. Refused while the
    /// MSHRs are at least half full unless the line will fill this level, and
    /// refused when the prefetch queue has no room. Returns whether the
    /// request was queued.
    pub fn prefetch_line(&mut self, addr: Address, fill_this_level: bool, metadata: u32) -> bool {
        let block = Address::from(BlockNumber::from(addr));
        if self.mshr_occupancy_ratio() >= 0.5 && !fill_this_level {
            return false;
        }
        if self.pq_free == 0 {
            return false;
        }
        self.pq_free -= 1;
        self.requests.push(PrefetchRequest {
            address: block,
            fill_this_level,
            metadata,
        });
        true
    }

    pub fn mshr_occupancy_ratio(&self) -> f64 {
        if self.mshr_capacity == 0 {
            return 1.0;
        }
        self.mshr_occupancy as f64 / self.mshr_capacity as f64
    }

    pub fn virtual_prefetch(&self) -> bool {
        self.virtual_prefetch
    }

    pub(crate) fn take_requests(self) -> Vec<PrefetchRequest> {
        self.requests
    }
}

/// Victim selection and recency bookkeeping for one cache.
///
/// `find_victim` is total: it must return a way in `[0, ways)`.
/// `update_state` is called exactly once per access, hit or fill; modules may
/// ignore writeback hits.
pub trait Replacement {
    #[allow(clippy::too_many_arguments)]
    fn find_victim(
        &mut self,
        cpu: usize,
        instr_id: u64,
        set: usize,
        row: &[CacheBlock],
        ip: Address,
        addr: Address,
        kind: AccessKind,
    ) -> usize;

    #[allow(clippy::too_many_arguments)]
    fn update_state(
        &mut self,
        cpu: usize,
        set: usize,
        way: usize,
        addr: Address,
        ip: Address,
        victim_addr: Address,
        kind: AccessKind,
        hit: bool,
    );

    fn final_stats(&self) {}
}

/// Prefetch policy for one cache. Hook return values become the prefetch
/// metadata stored with the block.
pub trait Prefetcher {
    /// Called on every tag lookup of a read or translation, hit or miss.
    /// `useful` reports that the access hit a block brought in by a prefetch.
    #[allow(clippy::too_many_arguments)]
    fn cache_operate(
        &mut self,
        ops: &mut CacheOps,
        addr: Address,
        ip: Address,
        hit: bool,
        useful: bool,
        kind: AccessKind,
        metadata: u32,
    ) -> u32;

    /// Called when a fill lands in the array.
    #[allow(clippy::too_many_arguments)]
    fn cache_fill(
        &mut self,
        ops: &mut CacheOps,
        addr: Address,
        set: usize,
        way: usize,
        prefetch: bool,
        evicted: Address,
        metadata: u32,
    ) -> u32;

    /// Called once per cycle after queue processing.
    fn cycle_operate(&mut self, _ops: &mut CacheOps) {}

    fn final_stats(&self) {}
}

/// Branch direction prediction for the core model.
pub trait BranchPredictor {
    fn predict(&mut self, ip: Address) -> bool;
    fn update(&mut self, ip: Address, taken: bool);
}

/// A prefetcher that never prefetches. The default for every cache.
#[derive(Debug, Default)]
pub struct NoPrefetch;

impl Prefetcher for NoPrefetch {
    fn cache_operate(
        &mut self,
        _ops: &mut CacheOps,
        _addr: Address,
        _ip: Address,
        _hit: bool,
        _useful: bool,
        _kind: AccessKind,
        metadata: u32,
    ) -> u32 {
        metadata
    }

    fn cache_fill(
        &mut self,
        _ops: &mut CacheOps,
        _addr: Address,
        _set: usize,
        _way: usize,
        _prefetch: bool,
        _evicted: Address,
        metadata: u32,
    ) -> u32 {
        metadata
    }
}

pub fn build_prefetcher(name: &str) -> Option<Box<dyn Prefetcher>> {
    match name {
        "no" => Some(Box::new(NoPrefetch)),
        "next_line" => Some(Box::new(next_line::NextLine::default())),
        "gasp" => Some(Box::new(gasp::Gasp::new())),
        _ => None,
    }
}

pub fn build_replacement(name: &str, sets: usize, ways: usize, cpus: usize) -> Option<Box<dyn Replacement>> {
    match name {
        "lru" => Some(Box::new(lru::Lru::new(sets, ways))),
        "ship" => Some(Box::new(ship::Ship::new(sets, ways, cpus))),
        _ => None,
    }
}

pub fn build_branch_predictor(name: &str) -> Option<Box<dyn BranchPredictor>> {
    match name {
        "bimodal" => Some(Box::new(bimodal::Bimodal::default())),
        _ => None,
    }
}
