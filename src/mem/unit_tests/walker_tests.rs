use std::sync::{Arc, RwLock};

use super::common::{test_channel, SinkUnit};
use crate::address::Address;
use crate::mem::channel::ChannelRef;
use crate::mem::operable::Operable;
use crate::mem::request::{AccessKind, MemRequest};
use crate::vmem::walker::{PageWalker, WalkerConfig};
use crate::vmem::{VirtualMemory, VmemConfig};

const LEVELS: u32 = 5;

struct Testbench {
    walker: PageWalker,
    sink: SinkUnit,
    upper: ChannelRef,
    lower: ChannelRef,
    dest: ChannelRef,
}

impl Testbench {
    fn new() -> Self {
        let vmem = Arc::new(RwLock::new(VirtualMemory::new(VmemConfig {
            levels: LEVELS,
            pte_page_size: 1 << 12,
            minor_fault_penalty: 200,
        })));
        let upper = test_channel("stlb->ptw");
        let lower = test_channel("ptw->l1d");
        let dest = test_channel("response-sink");
        let walker = PageWalker::new(
            "uut-ptw",
            WalkerConfig::default(),
            upper.clone(),
            lower.clone(),
            vmem,
        );
        let sink = SinkUnit::new(lower.clone(), 5);
        Testbench {
            walker,
            sink,
            upper,
            lower,
            dest,
        }
    }

    fn translation(&self, vaddr: u64, asid: u16, instr_id: u64) -> MemRequest {
        let mut req = MemRequest::new(AccessKind::Translation, Address::new(vaddr));
        req.asid = asid;
        req.instr_id = instr_id;
        req.instr_depend_on_me = vec![instr_id];
        req.to_return = vec![self.dest.clone()];
        req
    }

    fn issue(&mut self, req: MemRequest, now: u64) {
        let mut ch = self.upper.write().unwrap();
        assert!(ch.add_rq(req, now));
    }

    fn run(&mut self, from: u64, cycles: u64) -> u64 {
        let mut responses = 0;
        for cycle in from..from + cycles {
            self.walker.operate(cycle);
            self.sink.operate(cycle);
            while self.dest.write().unwrap().pop_ready_response(cycle).is_some() {
                responses += 1;
            }
        }
        responses
    }

    fn lower_reads(&self) -> u64 {
        self.lower.read().unwrap().stats.rq_enqueued
    }
}

#[test]
fn two_asids_walk_independently_when_spaced_apart() {
    let mut tb = Testbench::new();
    let vaddr = 0xdead_beef_dead_beef;

    let first = tb.translation(vaddr, 0, 1);
    tb.issue(first, 0);
    let responses = tb.run(0, 10_000);
    assert_eq!(responses, 1);
    assert_eq!(tb.lower_reads(), LEVELS as u64);

    let second = tb.translation(vaddr, 1, 2);
    tb.issue(second, 10_000);
    let responses = tb.run(10_000, 10_000);
    assert_eq!(responses, 1);
    assert_eq!(tb.lower_reads(), 2 * LEVELS as u64);
}

#[test]
fn two_asids_walk_independently_when_simultaneous() {
    let mut tb = Testbench::new();
    let vaddr = 0xdead_beef_dead_beef;

    let first = tb.translation(vaddr, 0, 1);
    let second = tb.translation(vaddr, 1, 2);
    tb.issue(first, 0);
    tb.issue(second, 0);

    let responses = tb.run(0, 10_000);
    assert_eq!(responses, 2);
    assert_eq!(tb.lower_reads(), 2 * LEVELS as u64);
    assert_eq!(tb.walker.in_flight(), 0);
}

#[test]
fn same_page_walks_merge_into_one() {
    let mut tb = Testbench::new();
    let vaddr = 0x1234_5678_9000;

    // same ASID, same page, different requesters
    let dest_b = test_channel("second-dest");
    let first = tb.translation(vaddr, 0, 1);
    let mut second = tb.translation(vaddr | 0x10, 0, 2);
    second.to_return = vec![dest_b.clone()];
    tb.issue(first, 0);
    tb.issue(second, 0);

    let responses = tb.run(0, 10_000);
    // one walk below, both requesters answered
    assert_eq!(tb.lower_reads(), LEVELS as u64);
    assert_eq!(responses, 1);
    let mut other = 0;
    while dest_b.write().unwrap().pop_ready_response(10_000).is_some() {
        other += 1;
    }
    assert_eq!(other, 1);
    assert_eq!(tb.walker.stats.walks_merged, 1);
}

#[test]
fn warm_walks_skip_cached_upper_levels() {
    let mut tb = Testbench::new();

    let first = tb.translation(0x4000_0000, 0, 1);
    tb.issue(first, 0);
    tb.run(0, 5_000);
    assert_eq!(tb.lower_reads(), LEVELS as u64);

    // a neighbouring page shares every upper-level node
    let second = tb.translation(0x4000_1000, 0, 2);
    tb.issue(second, 5_000);
    tb.run(5_000, 5_000);
    assert!(
        tb.lower_reads() < 2 * LEVELS as u64,
        "the structure caches should shorten the second walk"
    );
}

#[test]
fn the_final_response_carries_the_physical_frame() {
    let mut tb = Testbench::new();
    let vaddr = 0xaaaa_bbbb_c123;
    let req = tb.translation(vaddr, 0, 1);
    tb.issue(req, 0);

    let mut got = None;
    for cycle in 0..10_000 {
        tb.walker.operate(cycle);
        tb.sink.operate(cycle);
        if let Some(resp) = tb.dest.write().unwrap().pop_ready_response(cycle) {
            got = Some((resp, cycle));
            break;
        }
    }
    let (resp, at) = got.expect("walk never completed");
    assert!(at > 0, "translation must take simulated time");
    assert_eq!(resp.v_address, Address::new(vaddr));
    assert!(!resp.data.is_zero());
    assert_eq!(resp.data.page_offset(), Address::new(vaddr).page_offset());
    assert!(resp.instr_depend_on_me.contains(&1));
}
