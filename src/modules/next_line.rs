use crate::address::{Address, BlockNumber};
use crate::constants::BLOCK_SIZE;
use crate::mem::request::AccessKind;
use crate::modules::{CacheOps, Prefetcher};

/// Prefetch the block immediately after every demand access.
#[derive(Debug, Default)]
pub struct NextLine;

impl Prefetcher for NextLine {
    fn cache_operate(
        &mut self,
        ops: &mut CacheOps,
        addr: Address,
        _ip: Address,
        _hit: bool,
        _useful: bool,
        kind: AccessKind,
        metadata: u32,
    ) -> u32 {
        if kind == AccessKind::Load || kind == AccessKind::Rfo {
            let next = Address::from(BlockNumber::from(addr)).offset_by(BLOCK_SIZE as i64);
            ops.prefetch_line(next, true, metadata);
        }
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
