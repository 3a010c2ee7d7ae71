//! A deliberately small in-order core standing in for a full out-of-order
//! model: it exists to drive the memory hierarchy with realistic request
//! streams and to own the retired-instruction count that ends a phase.
//!
//! Every instruction fetch goes through the instruction TLB and L1I; every
//! data operand is translated through the data TLB before its load is issued
//! to L1D. Stores retire by writing into the L1D write queue once
//! translated. Wakeup uses stable instruction ids carried on requests, never
//! references into the window.

use std::collections::VecDeque;

use log::error;
use serde::Deserialize;

use crate::address::{Address, BlockNumber, PageNumber};
use crate::mem::channel::ChannelRef;
use crate::mem::operable::{Cycle, Operable};
use crate::mem::request::{AccessKind, MemRequest, MemResponse};
use crate::modules::BranchPredictor;
use crate::sim::trace::TraceReader;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub fetch_width: usize,
    pub retire_width: usize,
    pub rob_size: usize,
    pub mispredict_penalty: Cycle,
    pub branch_predictor: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            fetch_width: 4,
            retire_width: 4,
            rob_size: 128,
            mispredict_penalty: 20,
            branch_predictor: "bimodal".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuStats {
    pub instructions: u64,
    pub cycles: u64,
    pub branches: u64,
    pub mispredicts: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpState {
    NeedTranslate,
    Translating,
    /// Translated; carries the physical address of the access.
    Translated(Address),
    /// Read outstanding at the carried physical address.
    Reading(Address),
    Done,
}

#[derive(Debug, Clone, Copy)]
struct MemOp {
    vaddr: Address,
    state: OpState,
}

impl MemOp {
    fn new(vaddr: Address) -> Self {
        MemOp {
            vaddr,
            state: OpState::NeedTranslate,
        }
    }
}

#[derive(Debug)]
struct InflightInstr {
    id: u64,
    ip: Address,
    asid: u16,
    fetch: MemOp,
    loads: Vec<MemOp>,
    stores: Vec<MemOp>,
}

impl InflightInstr {
    fn loads_done(&self) -> bool {
        self.loads.iter().all(|op| op.state == OpState::Done)
    }

    fn stores_ready(&self) -> bool {
        self.stores
            .iter()
            .all(|op| matches!(op.state, OpState::Translated(_) | OpState::Done))
    }
}

pub struct Cpu {
    index: usize,
    config: CoreConfig,
    trace: TraceReader,
    rob: VecDeque<InflightInstr>,
    next_instr_id: u64,
    itlb: ChannelRef,
    l1i: ChannelRef,
    dtlb: ChannelRef,
    l1d: ChannelRef,
    bpred: Box<dyn BranchPredictor>,
    fetch_resume_at: Cycle,
    trace_done: bool,
    show_heartbeat: bool,
    heartbeat_interval: u64,
    next_heartbeat: u64,
    total_retired: u64,
    total_cycles: u64,
    pub stats: CpuStats,
}

impl Cpu {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        config: CoreConfig,
        trace: TraceReader,
        itlb: ChannelRef,
        l1i: ChannelRef,
        dtlb: ChannelRef,
        l1d: ChannelRef,
        bpred: Box<dyn BranchPredictor>,
        heartbeat_interval: u64,
    ) -> Self {
        Cpu {
            index,
            config,
            trace,
            rob: VecDeque::new(),
            next_instr_id: 0,
            itlb,
            l1i,
            dtlb,
            l1d,
            bpred,
            fetch_resume_at: 0,
            trace_done: false,
            show_heartbeat: heartbeat_interval > 0,
            heartbeat_interval,
            next_heartbeat: heartbeat_interval,
            total_retired: 0,
            total_cycles: 0,
            stats: CpuStats::default(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn hide_heartbeat(&mut self) {
        self.show_heartbeat = false;
    }

    pub fn retired_this_phase(&self) -> u64 {
        self.stats.instructions
    }

    /// A phase ends when the retirement target is met, or earlier if the
    /// trace ran dry and the window drained.
    pub fn phase_complete(&self, target: u64) -> bool {
        self.stats.instructions >= target || (self.trace_done && self.rob.is_empty())
    }

    fn splice_translation(resp_data: Address, vaddr: Address) -> Address {
        Address::from_page_parts(PageNumber::from(resp_data), vaddr.page_offset())
    }

    fn apply_translation(op: &mut MemOp, resp: &MemResponse) {
        if op.state == OpState::Translating
            && PageNumber::from(op.vaddr) == PageNumber::from(resp.v_address)
        {
            op.state = OpState::Translated(Self::splice_translation(resp.data, op.vaddr));
        }
    }

    fn drain_responses(&mut self, now: Cycle) {
        loop {
            let resp = {
                let mut ch = self.itlb.write().expect("channel lock poisoned");
                ch.pop_ready_response(now)
            };
            let Some(resp) = resp else { break };
            for instr in self.rob.iter_mut() {
                if resp.instr_depend_on_me.contains(&instr.id) {
                    Self::apply_translation(&mut instr.fetch, &resp);
                }
            }
        }

        loop {
            let resp = {
                let mut ch = self.l1i.write().expect("channel lock poisoned");
                ch.pop_ready_response(now)
            };
            let Some(resp) = resp else { break };
            for instr in self.rob.iter_mut() {
                if resp.instr_depend_on_me.contains(&instr.id)
                    && matches!(instr.fetch.state, OpState::Reading(_))
                {
                    instr.fetch.state = OpState::Done;
                }
            }
        }

        loop {
            let resp = {
                let mut ch = self.dtlb.write().expect("channel lock poisoned");
                ch.pop_ready_response(now)
            };
            let Some(resp) = resp else { break };
            for instr in self.rob.iter_mut() {
                if !resp.instr_depend_on_me.contains(&instr.id) {
                    continue;
                }
                for op in instr.loads.iter_mut().chain(instr.stores.iter_mut()) {
                    Self::apply_translation(op, &resp);
                }
            }
        }

        loop {
            let resp = {
                let mut ch = self.l1d.write().expect("channel lock poisoned");
                ch.pop_ready_response(now)
            };
            let Some(resp) = resp else { break };
            let block = BlockNumber::from(resp.address);
            for instr in self.rob.iter_mut() {
                if !resp.instr_depend_on_me.contains(&instr.id) {
                    continue;
                }
                for op in instr.loads.iter_mut() {
                    if let OpState::Reading(pa) = op.state {
                        if BlockNumber::from(pa) == block {
                            op.state = OpState::Done;
                        }
                    }
                }
            }
        }
    }

    fn translation_request(&self, vaddr: Address, instr_id: u64, ip: Address, asid: u16, dest: &ChannelRef) -> MemRequest {
        let mut req = MemRequest::new(AccessKind::Translation, vaddr);
        req.v_address = vaddr;
        req.cpu = self.index;
        req.asid = asid;
        req.instr_id = instr_id;
        req.ip = ip;
        req.instr_depend_on_me = vec![instr_id];
        req.to_return = vec![dest.clone()];
        req
    }

    fn issue_memory_ops(&mut self, now: Cycle) {
        for idx in 0..self.rob.len() {
            let (id, ip, asid) = (self.rob[idx].id, self.rob[idx].ip, self.rob[idx].asid);

            // instruction fetch path
            match self.rob[idx].fetch.state {
                OpState::NeedTranslate => {
                    let req = self.translation_request(ip, id, ip, asid, &self.itlb);
                    let accepted = {
                        let mut ch = self.itlb.write().expect("channel lock poisoned");
                        ch.add_rq(req, now)
                    };
                    if accepted {
                        self.rob[idx].fetch.state = OpState::Translating;
                    }
                }
                OpState::Translated(pa) => {
                    let mut req = MemRequest::new(AccessKind::Load, pa);
                    req.v_address = ip;
                    req.cpu = self.index;
                    req.asid = asid;
                    req.instr_id = id;
                    req.ip = ip;
                    req.instr_depend_on_me = vec![id];
                    req.to_return = vec![self.l1i.clone()];
                    let accepted = {
                        let mut ch = self.l1i.write().expect("channel lock poisoned");
                        ch.add_rq(req, now)
                    };
                    if accepted {
                        self.rob[idx].fetch.state = OpState::Reading(pa);
                    }
                }
                _ => {}
            }

            // data operands
            for op_idx in 0..self.rob[idx].loads.len() + self.rob[idx].stores.len() {
                let is_load = op_idx < self.rob[idx].loads.len();
                let store_idx = op_idx.saturating_sub(self.rob[idx].loads.len());
                let op = if is_load {
                    self.rob[idx].loads[op_idx]
                } else {
                    self.rob[idx].stores[store_idx]
                };

                match op.state {
                    OpState::NeedTranslate => {
                        let req = self.translation_request(op.vaddr, id, ip, asid, &self.dtlb);
                        let accepted = {
                            let mut ch = self.dtlb.write().expect("channel lock poisoned");
                            ch.add_rq(req, now)
                        };
                        if accepted {
                            let slot = if is_load {
                                &mut self.rob[idx].loads[op_idx]
                            } else {
                                &mut self.rob[idx].stores[store_idx]
                            };
                            slot.state = OpState::Translating;
                        }
                    }
                    OpState::Translated(pa) if is_load => {
                        let mut req = MemRequest::new(AccessKind::Load, pa);
                        req.v_address = op.vaddr;
                        req.cpu = self.index;
                        req.asid = asid;
                        req.instr_id = id;
                        req.ip = ip;
                        req.instr_depend_on_me = vec![id];
                        req.to_return = vec![self.l1d.clone()];
                        let accepted = {
                            let mut ch = self.l1d.write().expect("channel lock poisoned");
                            ch.add_rq(req, now)
                        };
                        if accepted {
                            self.rob[idx].loads[op_idx].state = OpState::Reading(pa);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    fn fetch_instrs(&mut self, now: Cycle) {
        if now < self.fetch_resume_at || self.trace_done {
            return;
        }
        for _ in 0..self.config.fetch_width {
            if self.rob.len() >= self.config.rob_size {
                break;
            }
            let record = match self.trace.next_instr() {
                Ok(Some(record)) => record,
                Ok(None) => {
                    self.trace_done = true;
                    break;
                }
                Err(e) => {
                    error!("cpu {}: trace read failed: {e:#}", self.index);
                    self.trace_done = true;
                    break;
                }
            };

            let id = self.next_instr_id;
            self.next_instr_id += 1;
            let ip = Address::new(record.ip);
            self.rob.push_back(InflightInstr {
                id,
                ip,
                asid: record.asid,
                fetch: MemOp::new(ip),
                loads: record.source_memory.iter().map(|&a| MemOp::new(Address::new(a))).collect(),
                stores: record
                    .destination_memory
                    .iter()
                    .map(|&a| MemOp::new(Address::new(a)))
                    .collect(),
            });

            if record.is_branch {
                self.stats.branches += 1;
                let predicted = self.bpred.predict(ip);
                self.bpred.update(ip, record.branch_taken);
                if predicted != record.branch_taken {
                    self.stats.mispredicts += 1;
                    self.fetch_resume_at = now + self.config.mispredict_penalty;
                    break;
                }
            }
        }
    }

    fn retire(&mut self, now: Cycle) {
        for _ in 0..self.config.retire_width {
            let Some(head) = self.rob.front() else { break };
            if head.fetch.state != OpState::Done || !head.loads_done() || !head.stores_ready() {
                break;
            }

            // stores drain into the write queue at retirement
            let mut all_written = true;
            let (id, ip, asid) = (head.id, head.ip, head.asid);
            for op_idx in 0..self.rob[0].stores.len() {
                let op = self.rob[0].stores[op_idx];
                if let OpState::Translated(pa) = op.state {
                    let mut req = MemRequest::new(AccessKind::Write, pa);
                    req.v_address = op.vaddr;
                    req.cpu = self.index;
                    req.asid = asid;
                    req.instr_id = id;
                    req.ip = ip;
                    let accepted = {
                        let mut ch = self.l1d.write().expect("channel lock poisoned");
                        ch.add_wq(req, now)
                    };
                    if accepted {
                        self.rob[0].stores[op_idx].state = OpState::Done;
                    } else {
                        all_written = false;
                        break;
                    }
                }
            }
            if !all_written {
                break;
            }

            self.rob.pop_front();
            self.stats.instructions += 1;
            self.total_retired += 1;

            if self.show_heartbeat && self.total_retired >= self.next_heartbeat {
                let ipc = self.total_retired as f64 / self.total_cycles.max(1) as f64;
                println!(
                    "Heartbeat CPU {} instructions: {} cycles: {} cumulative IPC: {:.4}",
                    self.index, self.total_retired, self.total_cycles, ipc
                );
                self.next_heartbeat += self.heartbeat_interval;
            }
        }
    }
}

impl Operable for Cpu {
    fn operate(&mut self, now: Cycle) {
        self.drain_responses(now);
        self.retire(now);
        self.issue_memory_ops(now);
        self.fetch_instrs(now);
        self.stats.cycles += 1;
        self.total_cycles += 1;
    }

    fn begin_phase(&mut self, _warmup: bool) {
        self.stats = CpuStats::default();
    }
}
