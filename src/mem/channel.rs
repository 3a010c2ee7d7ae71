//! The link between two operable units.
//!
//! A channel owns three bounded request queues (reads, writes, prefetches)
//! flowing downward and an unbounded response queue flowing upward. A request
//! enqueued on cycle C with latency L becomes visible on cycle C+L: entries
//! are stamped with an `event_cycle` and consumers skip entries that are not
//! yet due. Ordering within a queue is FIFO; only the DRAM scheduler reorders
//! after dequeue.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::mem::operable::Cycle;
use crate::mem::request::{MemRequest, MemResponse};

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub latency: Cycle,
    pub rq_size: usize,
    pub wq_size: usize,
    pub pq_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            latency: 1,
            rq_size: 32,
            wq_size: 32,
            pq_size: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ChannelStats {
    pub rq_enqueued: u64,
    pub wq_enqueued: u64,
    pub pq_enqueued: u64,
    pub rq_full: u64,
    pub wq_full: u64,
    pub pq_full: u64,
}

#[derive(Debug)]
pub struct MemChannel {
    name: String,
    latency: Cycle,
    rq: VecDeque<MemRequest>,
    wq: VecDeque<MemRequest>,
    pq: VecDeque<MemRequest>,
    rq_size: usize,
    wq_size: usize,
    pq_size: usize,
    returned: VecDeque<MemResponse>,
    pub stats: ChannelStats,
}

pub type ChannelRef = Arc<RwLock<MemChannel>>;

/// Create a channel shared between a producer and a consumer.
pub fn link(name: impl Into<String>, config: ChannelConfig) -> ChannelRef {
    Arc::new(RwLock::new(MemChannel::new(name, config)))
}

impl MemChannel {
    pub fn new(name: impl Into<String>, config: ChannelConfig) -> Self {
        MemChannel {
            name: name.into(),
            latency: config.latency,
            rq: VecDeque::with_capacity(config.rq_size),
            wq: VecDeque::with_capacity(config.wq_size),
            pq: VecDeque::with_capacity(config.pq_size),
            rq_size: config.rq_size,
            wq_size: config.wq_size,
            pq_size: config.pq_size,
            returned: VecDeque::new(),
            stats: ChannelStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn latency(&self) -> Cycle {
        self.latency
    }

    fn stamp(&self, mut req: MemRequest, now: Cycle) -> MemRequest {
        req.event_cycle = req.event_cycle.max(now + self.latency);
        req.cycle_enqueued = now;
        req
    }

    /// Enqueue a read. Returns false on backpressure; the caller retries next
    /// cycle.
    pub fn add_rq(&mut self, req: MemRequest, now: Cycle) -> bool {
        if self.rq.len() >= self.rq_size {
            self.stats.rq_full += 1;
            return false;
        }
        let req = self.stamp(req, now);
        self.rq.push_back(req);
        self.stats.rq_enqueued += 1;
        true
    }

    pub fn add_wq(&mut self, req: MemRequest, now: Cycle) -> bool {
        if self.wq.len() >= self.wq_size {
            self.stats.wq_full += 1;
            return false;
        }
        let req = self.stamp(req, now);
        self.wq.push_back(req);
        self.stats.wq_enqueued += 1;
        true
    }

    pub fn add_pq(&mut self, req: MemRequest, now: Cycle) -> bool {
        if self.pq.len() >= self.pq_size {
            self.stats.pq_full += 1;
            return false;
        }
        let req = self.stamp(req, now);
        self.pq.push_back(req);
        self.stats.pq_enqueued += 1;
        true
    }

    pub fn rq_occupancy(&self) -> usize {
        self.rq.len()
    }

    pub fn wq_occupancy(&self) -> usize {
        self.wq.len()
    }

    pub fn pq_occupancy(&self) -> usize {
        self.pq.len()
    }

    fn pop_ready(queue: &mut VecDeque<MemRequest>, now: Cycle) -> Option<MemRequest> {
        match queue.front() {
            Some(front) if front.event_cycle <= now => queue.pop_front(),
            _ => None,
        }
    }

    /// Dequeue the oldest read whose visibility stamp has passed.
    pub fn pop_ready_rq(&mut self, now: Cycle) -> Option<MemRequest> {
        Self::pop_ready(&mut self.rq, now)
    }

    pub fn pop_ready_wq(&mut self, now: Cycle) -> Option<MemRequest> {
        Self::pop_ready(&mut self.wq, now)
    }

    pub fn pop_ready_pq(&mut self, now: Cycle) -> Option<MemRequest> {
        Self::pop_ready(&mut self.pq, now)
    }

    /// Return unconsumed requests to the head, preserving FIFO order.
    pub fn unpop_rq(&mut self, requests: Vec<MemRequest>) {
        for req in requests.into_iter().rev() {
            self.rq.push_front(req);
        }
    }

    pub fn unpop_wq(&mut self, requests: Vec<MemRequest>) {
        for req in requests.into_iter().rev() {
            self.wq.push_front(req);
        }
    }

    pub fn unpop_pq(&mut self, requests: Vec<MemRequest>) {
        for req in requests.into_iter().rev() {
            self.pq.push_front(req);
        }
    }

    /// Deliver a fill upward. The producer stamps the service latency into
    /// `event_cycle`; the channel adds its own one-way latency.
    pub fn push_response(&mut self, mut resp: MemResponse, now: Cycle) {
        resp.event_cycle = resp.event_cycle.max(now + self.latency);
        self.returned.push_back(resp);
    }

    pub fn pop_ready_response(&mut self, now: Cycle) -> Option<MemResponse> {
        match self.returned.front() {
            Some(front) if front.event_cycle <= now => self.returned.pop_front(),
            _ => None,
        }
    }

    pub fn response_occupancy(&self) -> usize {
        self.returned.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::mem::request::AccessKind;

    fn read_to(addr: u64) -> MemRequest {
        MemRequest::new(AccessKind::Load, Address::new(addr))
    }

    #[test]
    fn requests_become_visible_after_the_one_way_latency() {
        let mut ch = MemChannel::new(
            "t",
            ChannelConfig {
                latency: 3,
                ..ChannelConfig::default()
            },
        );
        assert!(ch.add_rq(read_to(0x40), 10));
        assert!(ch.pop_ready_rq(12).is_none());
        let req = ch.pop_ready_rq(13).expect("due at enqueue + latency");
        assert_eq!(req.event_cycle, 13);
    }

    #[test]
    fn producer_stamp_is_never_shortened() {
        let mut ch = MemChannel::new(
            "t",
            ChannelConfig {
                latency: 1,
                ..ChannelConfig::default()
            },
        );
        let mut req = read_to(0x40);
        req.event_cycle = 50;
        assert!(ch.add_rq(req, 10));
        assert!(ch.pop_ready_rq(49).is_none());
        assert!(ch.pop_ready_rq(50).is_some());
    }

    #[test]
    fn full_queue_rejects_without_consuming() {
        let mut ch = MemChannel::new(
            "t",
            ChannelConfig {
                rq_size: 2,
                ..ChannelConfig::default()
            },
        );
        assert!(ch.add_rq(read_to(0x40), 0));
        assert!(ch.add_rq(read_to(0x80), 0));
        assert!(!ch.add_rq(read_to(0xc0), 0));
        assert_eq!(ch.stats.rq_full, 1);
        assert_eq!(ch.rq_occupancy(), 2);
    }

    #[test]
    fn fifo_order_is_preserved_across_unpop() {
        let mut ch = MemChannel::new("t", ChannelConfig::default());
        for addr in [0x40u64, 0x80, 0xc0] {
            assert!(ch.add_rq(read_to(addr), 0));
        }
        let a = ch.pop_ready_rq(10).unwrap();
        let b = ch.pop_ready_rq(10).unwrap();
        ch.unpop_rq(vec![a, b]);
        assert_eq!(ch.pop_ready_rq(10).unwrap().address.value(), 0x40);
        assert_eq!(ch.pop_ready_rq(10).unwrap().address.value(), 0x80);
        assert_eq!(ch.pop_ready_rq(10).unwrap().address.value(), 0xc0);
    }

    #[test]
    fn responses_honor_the_producer_event_cycle() {
        let mut ch = MemChannel::new("t", ChannelConfig::default());
        let mut resp = MemResponse::for_request(&read_to(0x40));
        resp.event_cycle = 25;
        ch.push_response(resp, 20);
        assert!(ch.pop_ready_response(24).is_none());
        assert!(ch.pop_ready_response(25).is_some());
    }
}
