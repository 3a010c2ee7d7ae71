//! Per-phase statistics and the two printers.
//!
//! The JSON document is the wire contract: hit/miss counts keyed by access
//! type per cache, MSHR return latency as a sum/count pair, per-CPU IPC,
//! prefetcher usefulness counts and per-channel DRAM row-hit figures.

use std::collections::BTreeMap;
use std::io::Write;

use anyhow::Result;
use serde::Serialize;

use crate::core::CpuStats;
use crate::mem::cache::CacheStats;
use crate::mem::dram::DramChannelStats;
use crate::mem::request::AccessKind;

#[derive(Debug, Clone, Serialize)]
pub struct CpuReport {
    pub index: usize,
    pub instructions: u64,
    pub cycles: u64,
    pub ipc: f64,
    pub branches: u64,
    pub mispredicts: u64,
}

impl CpuReport {
    pub fn new(index: usize, stats: &CpuStats) -> Self {
        CpuReport {
            index,
            instructions: stats.instructions,
            cycles: stats.cycles,
            ipc: stats.instructions as f64 / stats.cycles.max(1) as f64,
            branches: stats.branches,
            mispredicts: stats.mispredicts,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheReport {
    pub name: String,
    pub hits: BTreeMap<String, u64>,
    pub misses: BTreeMap<String, u64>,
    pub mshr_merged: u64,
    pub mshr_returns: u64,
    pub mshr_return_cycles: u64,
    pub prefetch_requested: u64,
    pub prefetch_issued: u64,
    pub prefetch_useful: u64,
    pub prefetch_useless: u64,
    pub prefetch_late: u64,
    pub writebacks: u64,
}

impl CacheReport {
    pub fn new(name: &str, stats: &CacheStats) -> Self {
        let by_kind = |counts: &[u64; 5]| -> BTreeMap<String, u64> {
            AccessKind::ALL
                .iter()
                .map(|kind| (kind.name().to_string(), counts[kind.index()]))
                .collect()
        };
        CacheReport {
            name: name.to_string(),
            hits: by_kind(&stats.hits),
            misses: by_kind(&stats.misses),
            mshr_merged: stats.mshr_merged,
            mshr_returns: stats.mshr_returns,
            mshr_return_cycles: stats.mshr_return_cycles,
            prefetch_requested: stats.pf_requested,
            prefetch_issued: stats.pf_issued,
            prefetch_useful: stats.pf_useful,
            prefetch_useless: stats.pf_useless,
            prefetch_late: stats.pf_late,
            writebacks: stats.writebacks,
        }
    }

    fn total_hits(&self) -> u64 {
        self.hits.values().sum()
    }

    fn total_misses(&self) -> u64 {
        self.misses.values().sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DramReport {
    pub channel: usize,
    pub row_hits: u64,
    pub row_misses: u64,
    pub row_hit_rate: f64,
    pub reads_returned: u64,
    pub writes_drained: u64,
    pub refreshes: u64,
}

impl DramReport {
    pub fn new(channel: usize, stats: &DramChannelStats) -> Self {
        let accesses = stats.row_hits + stats.row_misses;
        DramReport {
            channel,
            row_hits: stats.row_hits,
            row_misses: stats.row_misses,
            row_hit_rate: stats.row_hits as f64 / accesses.max(1) as f64,
            reads_returned: stats.reads_returned,
            writes_drained: stats.writes_drained,
            refreshes: stats.refreshes,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseStats {
    pub name: String,
    pub cpus: Vec<CpuReport>,
    pub caches: Vec<CacheReport>,
    pub dram: Vec<DramReport>,
}

pub fn print_plain(out: &mut impl Write, phases: &[PhaseStats]) -> Result<()> {
    for phase in phases {
        writeln!(out)?;
        writeln!(out, "=== {} ===", phase.name)?;
        for cpu in &phase.cpus {
            writeln!(
                out,
                "CPU {} cumulative IPC: {:.4} instructions: {} cycles: {}",
                cpu.index, cpu.ipc, cpu.instructions, cpu.cycles
            )?;
            writeln!(
                out,
                "CPU {} branches: {} mispredicts: {}",
                cpu.index, cpu.branches, cpu.mispredicts
            )?;
        }
        for cache in &phase.caches {
            writeln!(
                out,
                "{} TOTAL  accesses: {} hits: {} misses: {}",
                cache.name,
                cache.total_hits() + cache.total_misses(),
                cache.total_hits(),
                cache.total_misses()
            )?;
            for kind in AccessKind::ALL {
                let hits = cache.hits[kind.name()];
                let misses = cache.misses[kind.name()];
                if hits + misses > 0 {
                    writeln!(out, "{} {:<12} hits: {} misses: {}", cache.name, kind.name(), hits, misses)?;
                }
            }
            if cache.mshr_returns > 0 {
                writeln!(
                    out,
                    "{} average miss latency: {:.2} cycles",
                    cache.name,
                    cache.mshr_return_cycles as f64 / cache.mshr_returns as f64
                )?;
            }
            if cache.prefetch_requested > 0 {
                writeln!(
                    out,
                    "{} prefetches requested: {} issued: {} useful: {} useless: {} late: {}",
                    cache.name,
                    cache.prefetch_requested,
                    cache.prefetch_issued,
                    cache.prefetch_useful,
                    cache.prefetch_useless,
                    cache.prefetch_late
                )?;
            }
        }
        for dram in &phase.dram {
            writeln!(
                out,
                "DRAM channel {} row hits: {} row misses: {} ({:.1}% row hit rate)",
                dram.channel,
                dram.row_hits,
                dram.row_misses,
                dram.row_hit_rate * 100.0
            )?;
        }
    }
    Ok(())
}

pub fn print_json(out: &mut impl Write, phases: &[PhaseStats]) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, phases)?;
    writeln!(out)?;
    Ok(())
}
