//! DRAM controller: one unit owning every channel behind the LLC.
//!
//! Each channel keeps slot arrays for reads and writes, per-bank row-buffer
//! state, and a shared return data bus. Scheduling is first-ready FCFS: each
//! cycle the oldest ready, unscheduled entry whose bank is idle is issued to
//! its bank; the open-row state decides whether the access pays tCAS alone or
//! the full tRP+tRCD+tCAS. Write drain is hysteretic between two queue
//! watermarks, and each rank blocks periodically for refresh.

use log::trace;
use serde::Deserialize;

use crate::address::Address;
use crate::constants::LOG2_BLOCK_SIZE;
use crate::mem::channel::ChannelRef;
use crate::mem::operable::{Cycle, Operable};
use crate::mem::request::{AccessKind, MemRequest, MemResponse};

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct DramConfig {
    pub channels: usize,
    pub ranks: usize,
    pub banks: usize,
    pub columns: usize,
    pub rq_size: usize,
    pub wq_size: usize,
    /// Precharge, row-activate and column-access latencies in cycles.
    pub trp: Cycle,
    pub trcd: Cycle,
    pub tcas: Cycle,
    /// Cycles the data bus needs to return one block.
    pub dbus_return_time: Cycle,
    /// Cycles between per-rank refresh windows; 0 disables refresh.
    pub refresh_period: Cycle,
    /// Length of one refresh window.
    pub refresh_time: Cycle,
    pub write_high_watermark: f64,
    pub write_low_watermark: f64,
}

impl Default for DramConfig {
    fn default() -> Self {
        DramConfig {
            channels: 1,
            ranks: 1,
            banks: 8,
            columns: 128,
            rq_size: 48,
            wq_size: 48,
            trp: 20,
            trcd: 20,
            tcas: 32,
            dbus_return_time: 16,
            refresh_period: 12_500,
            refresh_time: 560,
            write_high_watermark: 0.875,
            write_low_watermark: 0.5,
        }
    }
}

impl DramConfig {
    fn channel_bits(&self) -> u32 {
        self.channels.trailing_zeros()
    }

    fn bank_bits(&self) -> u32 {
        self.banks.trailing_zeros()
    }

    fn column_bits(&self) -> u32 {
        self.columns.trailing_zeros()
    }

    fn rank_bits(&self) -> u32 {
        self.ranks.trailing_zeros()
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, v) in [
            ("channels", self.channels),
            ("ranks", self.ranks),
            ("banks", self.banks),
            ("columns", self.columns),
        ] {
            if !v.is_power_of_two() {
                return Err(format!("dram {name} must be a power of two, got {v}"));
            }
        }
        Ok(())
    }
}

/// Address decomposition, low to high bits: block offset, channel, bank,
/// column, rank, row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DramCoordinates {
    pub channel: usize,
    pub bank: usize,
    pub column: usize,
    pub rank: usize,
    pub row: u64,
}

pub fn decode(config: &DramConfig, addr: Address) -> DramCoordinates {
    let mut value = addr.value() >> LOG2_BLOCK_SIZE;
    let mut take = |bits: u32| {
        let field = value & ((1u64 << bits) - 1);
        value >>= bits;
        field
    };
    let channel = take(config.channel_bits()) as usize;
    let bank = take(config.bank_bits()) as usize;
    let column = take(config.column_bits()) as usize;
    let rank = take(config.rank_bits()) as usize;
    let row = value;
    DramCoordinates {
        channel,
        bank,
        column,
        rank,
        row,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum QueueSel {
    #[default]
    Read,
    Write,
}

#[derive(Debug)]
pub(crate) struct DramSlot {
    pub(crate) request: MemRequest,
    pub(crate) arrival: Cycle,
    pub(crate) scheduled: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct Bank {
    open_row: Option<u64>,
    busy_until: Cycle,
    active: Option<(QueueSel, usize)>,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct DramChannelStats {
    pub row_hits: u64,
    pub row_misses: u64,
    pub reads_returned: u64,
    pub writes_drained: u64,
    pub refreshes: u64,
}

pub(crate) struct DramChannel {
    pub(crate) rq: Vec<Option<DramSlot>>,
    pub(crate) wq: Vec<Option<DramSlot>>,
    banks: Vec<Bank>,
    write_mode: bool,
    dbus_ready_at: Cycle,
    next_refresh: Vec<Cycle>,
    refresh_until: Vec<Cycle>,
    pub(crate) stats: DramChannelStats,
}

impl DramChannel {
    fn new(config: &DramConfig) -> Self {
        DramChannel {
            rq: (0..config.rq_size).map(|_| None).collect(),
            wq: (0..config.wq_size).map(|_| None).collect(),
            banks: vec![Bank::default(); config.ranks * config.banks],
            write_mode: false,
            dbus_ready_at: 0,
            next_refresh: vec![config.refresh_period; config.ranks],
            refresh_until: vec![0; config.ranks],
            stats: DramChannelStats::default(),
        }
    }

    fn wq_occupancy(&self) -> usize {
        self.wq.iter().filter(|s| s.is_some()).count()
    }

    fn rank_refreshing(&self, rank: usize, now: Cycle) -> bool {
        now < self.refresh_until[rank]
    }
}

pub struct DramController {
    config: DramConfig,
    uppers: Vec<ChannelRef>,
    pub(crate) channels: Vec<DramChannel>,
}

impl DramController {
    pub fn new(config: DramConfig, uppers: Vec<ChannelRef>) -> Self {
        let channels = (0..config.channels).map(|_| DramChannel::new(&config)).collect();
        DramController {
            config,
            uppers,
            channels,
        }
    }

    pub fn stats(&self) -> Vec<DramChannelStats> {
        self.channels.iter().map(|c| c.stats).collect()
    }

    /// Load a request directly into a channel queue. Used by the driver path
    /// that drains the LLC channel, and by tests that preload a schedule.
    pub(crate) fn insert(&mut self, req: MemRequest, arrival: Cycle) -> bool {
        let coords = decode(&self.config, req.address);
        let channel = &mut self.channels[coords.channel];
        let queue = if req.kind == AccessKind::Write {
            &mut channel.wq
        } else {
            &mut channel.rq
        };
        match queue.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(DramSlot {
                    request: req,
                    arrival,
                    scheduled: false,
                });
                true
            }
            None => false,
        }
    }

    fn complete_bank_accesses(&mut self, now: Cycle) {
        let config = self.config;
        for channel in &mut self.channels {
            for bank_idx in 0..channel.banks.len() {
                let Some((sel, slot_idx)) = channel.banks[bank_idx].active else {
                    continue;
                };
                if channel.banks[bank_idx].busy_until > now {
                    continue;
                }
                match sel {
                    QueueSel::Read => {
                        let slot = channel.rq[slot_idx].take().expect("active slot vanished");
                        let start = channel.dbus_ready_at.max(now);
                        let done = start + config.dbus_return_time;
                        channel.dbus_ready_at = done;
                        // bank stays busy while its data crosses the bus
                        channel.banks[bank_idx].busy_until = done;
                        channel.banks[bank_idx].active = None;
                        channel.stats.reads_returned += 1;

                        let mut resp = MemResponse::for_request(&slot.request);
                        resp.event_cycle = done;
                        for dest in &slot.request.to_return {
                            let mut ch = dest.write().expect("channel lock poisoned");
                            ch.push_response(resp.clone(), now);
                        }
                    }
                    QueueSel::Write => {
                        channel.wq[slot_idx].take().expect("active slot vanished");
                        channel.banks[bank_idx].active = None;
                        channel.stats.writes_drained += 1;
                    }
                }
            }
        }
    }

    fn schedule_refresh(&mut self, now: Cycle) {
        if self.config.refresh_period == 0 {
            return;
        }
        for channel in &mut self.channels {
            for rank in 0..self.config.ranks {
                if now >= channel.next_refresh[rank] {
                    channel.refresh_until[rank] = now + self.config.refresh_time;
                    channel.next_refresh[rank] += self.config.refresh_period;
                    channel.stats.refreshes += 1;
                }
            }
        }
    }

    fn swap_write_mode(&mut self) {
        let high = (self.config.wq_size as f64 * self.config.write_high_watermark).ceil() as usize;
        let low = (self.config.wq_size as f64 * self.config.write_low_watermark) as usize;
        for channel in &mut self.channels {
            let wq_occ = channel.wq_occupancy();
            let rq_occ = channel.rq.iter().filter(|s| s.is_some()).count();
            if channel.write_mode {
                if wq_occ == 0 || (rq_occ > 0 && wq_occ < low.max(1)) {
                    channel.write_mode = false;
                }
            } else if wq_occ >= high.max(1) || (rq_occ == 0 && wq_occ > 0) {
                channel.write_mode = true;
            }
        }
    }

    fn drain_uppers(&mut self, now: Cycle) {
        for idx in 0..self.uppers.len() {
            let upper = self.uppers[idx].clone();
            loop {
                let req = {
                    let mut ch = upper.write().expect("channel lock poisoned");
                    ch.pop_ready_rq(now)
                };
                let Some(req) = req else { break };
                let arrival = req.event_cycle;
                if !self.insert(req.clone(), arrival) {
                    let mut ch = upper.write().expect("channel lock poisoned");
                    ch.unpop_rq(vec![req]);
                    break;
                }
            }
            loop {
                let req = {
                    let mut ch = upper.write().expect("channel lock poisoned");
                    let r = ch.pop_ready_pq(now);
                    if r.is_some() {
                        r
                    } else {
                        ch.pop_ready_wq(now)
                    }
                };
                let Some(req) = req else { break };
                let arrival = req.event_cycle;
                if !self.insert(req.clone(), arrival) {
                    let mut ch = upper.write().expect("channel lock poisoned");
                    if req.kind == AccessKind::Write {
                        ch.unpop_wq(vec![req]);
                    } else {
                        ch.unpop_pq(vec![req]);
                    }
                    break;
                }
            }
        }
    }

    /// Issue at most one bank command per channel: the oldest ready,
    /// unscheduled entry of the active queue whose bank is idle, with
    /// (arrival, cpu, instr id) as the stable order.
    fn schedule_packets(&mut self, now: Cycle) {
        let config = self.config;
        for channel in &mut self.channels {
            let queue_sel = if channel.write_mode {
                QueueSel::Write
            } else {
                QueueSel::Read
            };
            let queue = match queue_sel {
                QueueSel::Read => &channel.rq,
                QueueSel::Write => &channel.wq,
            };

            let mut best: Option<(usize, (Cycle, usize, u64), DramCoordinates)> = None;
            for (idx, slot) in queue.iter().enumerate() {
                let Some(slot) = slot else { continue };
                if slot.scheduled || slot.arrival > now {
                    continue;
                }
                let coords = decode(&config, slot.request.address);
                let bank = &channel.banks[coords.rank * config.banks + coords.bank];
                if bank.active.is_some() || bank.busy_until > now {
                    continue;
                }
                if channel.rank_refreshing(coords.rank, now) {
                    continue;
                }
                let order = (slot.arrival, slot.request.cpu, slot.request.instr_id);
                if best.as_ref().map_or(true, |(_, b, _)| order < *b) {
                    best = Some((idx, order, coords));
                }
            }

            let Some((idx, _, coords)) = best else { continue };
            let bank_idx = coords.rank * config.banks + coords.bank;
            let row_hit = channel.banks[bank_idx].open_row == Some(coords.row);
            let latency = if row_hit {
                channel.stats.row_hits += 1;
                config.tcas
            } else {
                channel.stats.row_misses += 1;
                config.trp + config.trcd + config.tcas
            };
            trace!(
                "dram schedule: slot {idx} bank {bank_idx} row {} ({}) at {now}",
                coords.row,
                if row_hit { "hit" } else { "miss" }
            );

            channel.banks[bank_idx].open_row = Some(coords.row);
            channel.banks[bank_idx].busy_until = now + latency;
            channel.banks[bank_idx].active = Some((queue_sel, idx));
            let queue = match queue_sel {
                QueueSel::Read => &mut channel.rq,
                QueueSel::Write => &mut channel.wq,
            };
            queue[idx].as_mut().unwrap().scheduled = true;
        }
    }
}

impl Operable for DramController {
    fn operate(&mut self, now: Cycle) {
        self.complete_bank_accesses(now);
        self.schedule_refresh(now);
        self.swap_write_mode();
        self.drain_uppers(now);
        self.schedule_packets(now);
    }

    fn begin_phase(&mut self, _warmup: bool) {
        for channel in &mut self.channels {
            channel.stats = DramChannelStats::default();
        }
    }
}
