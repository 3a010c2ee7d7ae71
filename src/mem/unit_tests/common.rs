//! Shared scaffolding for the hierarchy scenario tests.

use crate::address::Address;
use crate::mem::cache::{Cache, CacheConfig};
use crate::mem::channel::{link, ChannelConfig, ChannelRef};
use crate::mem::operable::{Cycle, Operable};
use crate::mem::request::{AccessKind, MemRequest, MemResponse};
use crate::modules::lru::Lru;
use crate::modules::NoPrefetch;

/// A terminal unit that answers every read and prefetch after a fixed
/// latency and swallows writes. Stands in for whatever sits below the unit
/// under test.
pub struct SinkUnit {
    channel: ChannelRef,
    latency: Cycle,
    pub reads_seen: u64,
    pub writes_seen: u64,
}

impl SinkUnit {
    pub fn new(channel: ChannelRef, latency: Cycle) -> Self {
        SinkUnit {
            channel,
            latency,
            reads_seen: 0,
            writes_seen: 0,
        }
    }

    fn respond(&self, req: &MemRequest, now: Cycle) {
        let mut resp = MemResponse::for_request(req);
        resp.event_cycle = now + self.latency;
        for dest in &req.to_return {
            let mut ch = dest.write().expect("channel lock poisoned");
            ch.push_response(resp.clone(), now);
        }
    }
}

impl Operable for SinkUnit {
    fn operate(&mut self, now: Cycle) {
        loop {
            let req = {
                let mut ch = self.channel.write().expect("channel lock poisoned");
                ch.pop_ready_rq(now)
            };
            let Some(req) = req else { break };
            self.reads_seen += 1;
            self.respond(&req, now);
        }
        loop {
            let req = {
                let mut ch = self.channel.write().expect("channel lock poisoned");
                ch.pop_ready_pq(now)
            };
            let Some(req) = req else { break };
            self.reads_seen += 1;
            self.respond(&req, now);
        }
        loop {
            let req = {
                let mut ch = self.channel.write().expect("channel lock poisoned");
                ch.pop_ready_wq(now)
            };
            if req.is_none() {
                break;
            }
            self.writes_seen += 1;
        }
    }
}

pub fn test_channel(name: &str) -> ChannelRef {
    link(name, ChannelConfig::default())
}

pub fn small_cache(config: CacheConfig, uppers: Vec<ChannelRef>, lower: ChannelRef) -> Cache {
    let (sets, ways) = (config.sets, config.ways);
    Cache::new(
        "uut",
        config,
        uppers,
        lower,
        Box::new(Lru::new(sets, ways)),
        Box::new(NoPrefetch),
    )
}

pub fn load_request(addr: u64, instr_id: u64, dest: &ChannelRef) -> MemRequest {
    let mut req = MemRequest::new(AccessKind::Load, Address::new(addr));
    req.instr_id = instr_id;
    req.instr_depend_on_me = vec![instr_id];
    req.to_return = vec![dest.clone()];
    req
}

/// At most one valid way may hold a given block in any set.
pub fn assert_tag_exclusive(cache: &Cache) {
    let (sets, ways) = cache.geometry();
    for set in 0..sets {
        let row = &cache.blocks()[set * ways..(set + 1) * ways];
        for (i, a) in row.iter().enumerate() {
            if !a.valid {
                continue;
            }
            for b in row.iter().skip(i + 1) {
                assert!(
                    !(b.valid && b.address == a.address && b.asid == a.asid),
                    "duplicate block {:#x} in set {set}",
                    a.address.value()
                );
            }
        }
    }
}
