//! Builds the simulated machine from a config and runs its phases.
//!
//! Wiring, per CPU: core -> {ITLB, L1I, DTLB, L1D}; ITLB/DTLB -> STLB ->
//! page walker -> L1D; L1I/L1D -> L2 -> shared LLC -> DRAM. The driver holds
//! one global cycle counter and advances every unit exactly once per cycle in
//! a fixed order; all cross-unit traffic rides channels with at least one
//! cycle of latency, so the intra-cycle order is not observable in simulated
//! time.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Context, Result};
use log::info;

use crate::core::Cpu;
use crate::mem::cache::Cache;
use crate::mem::channel::{link, ChannelRef};
use crate::mem::dram::DramController;
use crate::mem::operable::{Cycle, Operable};
use crate::modules::{build_branch_predictor, build_prefetcher, build_replacement};
use crate::sim::config::{CacheSection, SimConfig};
use crate::sim::stats::{CacheReport, CpuReport, DramReport, PhaseStats};
use crate::sim::trace::TraceReader;
use crate::vmem::walker::PageWalker;
use crate::vmem::VirtualMemory;

#[derive(Debug, Clone)]
pub struct PhaseInfo {
    pub name: String,
    pub is_warmup: bool,
    pub length: u64,
}

pub struct SimTop {
    cycle: Cycle,
    cpus: Vec<Cpu>,
    caches: Vec<Cache>,
    walkers: Vec<PageWalker>,
    dram: DramController,
}

fn build_cache(
    name: String,
    section: &CacheSection,
    uppers: Vec<ChannelRef>,
    lower: ChannelRef,
    num_cpus: usize,
) -> Result<Cache> {
    let replacement = build_replacement(
        &section.replacement,
        section.cache.sets,
        section.cache.ways,
        num_cpus,
    )
    .with_context(|| format!("{name}: unknown replacement module '{}'", section.replacement))?;
    let prefetcher = build_prefetcher(&section.prefetcher)
        .with_context(|| format!("{name}: unknown prefetcher module '{}'", section.prefetcher))?;
    Ok(Cache::new(
        name,
        section.cache.clone(),
        uppers,
        lower,
        replacement,
        prefetcher,
    ))
}

impl SimTop {
    pub fn new(
        config: &SimConfig,
        trace_paths: &[PathBuf],
        cloudsuite: bool,
        repeat: bool,
    ) -> Result<SimTop> {
        if trace_paths.len() != config.num_cpus {
            bail!(
                "expected {} trace(s) for {} cpu(s), got {}",
                config.num_cpus,
                config.num_cpus,
                trace_paths.len()
            );
        }

        let vmem = Arc::new(RwLock::new(VirtualMemory::new(config.vmem)));

        let llc_to_dram = link("LLC->DRAM", config.dram_queues);
        let mut llc_uppers: Vec<ChannelRef> = Vec::new();

        let mut cpus = Vec::new();
        let mut caches = Vec::new();
        let mut walkers = Vec::new();

        for i in 0..config.num_cpus {
            let cpu_l1i = link(format!("cpu{i}->L1I"), config.l1i.queues);
            let cpu_l1d = link(format!("cpu{i}->L1D"), config.l1d.queues);
            let cpu_itlb = link(format!("cpu{i}->ITLB"), config.itlb.queues);
            let cpu_dtlb = link(format!("cpu{i}->DTLB"), config.dtlb.queues);
            let l1i_l2 = link(format!("cpu{i}_L1I->L2"), config.l2.queues);
            let l1d_l2 = link(format!("cpu{i}_L1D->L2"), config.l2.queues);
            let itlb_stlb = link(format!("cpu{i}_ITLB->STLB"), config.stlb.queues);
            let dtlb_stlb = link(format!("cpu{i}_DTLB->STLB"), config.stlb.queues);
            let stlb_ptw = link(format!("cpu{i}_STLB->PTW"), config.ptw.queues);
            let ptw_l1d = link(format!("cpu{i}_PTW->L1D"), config.l1d.queues);
            let l2_llc = link(format!("cpu{i}_L2->LLC"), config.llc.queues);

            caches.push(build_cache(
                format!("cpu{i}_L1I"),
                &config.l1i,
                vec![cpu_l1i.clone()],
                l1i_l2.clone(),
                config.num_cpus,
            )?);
            caches.push(build_cache(
                format!("cpu{i}_L1D"),
                &config.l1d,
                vec![cpu_l1d.clone(), ptw_l1d.clone()],
                l1d_l2.clone(),
                config.num_cpus,
            )?);
            caches.push(build_cache(
                format!("cpu{i}_ITLB"),
                &config.itlb,
                vec![cpu_itlb.clone()],
                itlb_stlb.clone(),
                config.num_cpus,
            )?);
            caches.push(build_cache(
                format!("cpu{i}_DTLB"),
                &config.dtlb,
                vec![cpu_dtlb.clone()],
                dtlb_stlb.clone(),
                config.num_cpus,
            )?);
            caches.push(build_cache(
                format!("cpu{i}_L2"),
                &config.l2,
                vec![l1i_l2.clone(), l1d_l2.clone()],
                l2_llc.clone(),
                config.num_cpus,
            )?);
            caches.push(build_cache(
                format!("cpu{i}_STLB"),
                &config.stlb,
                vec![itlb_stlb.clone(), dtlb_stlb.clone()],
                stlb_ptw.clone(),
                config.num_cpus,
            )?);

            walkers.push(PageWalker::new(
                format!("cpu{i}_PTW"),
                config.ptw.walker,
                stlb_ptw.clone(),
                ptw_l1d.clone(),
                vmem.clone(),
            ));

            llc_uppers.push(l2_llc);

            let trace = TraceReader::open(&trace_paths[i], i, cloudsuite, repeat)?;
            let bpred = build_branch_predictor(&config.core.branch_predictor).with_context(|| {
                format!("unknown branch predictor module '{}'", config.core.branch_predictor)
            })?;
            cpus.push(Cpu::new(
                i,
                config.core.clone(),
                trace,
                cpu_itlb,
                cpu_l1i,
                cpu_dtlb,
                cpu_l1d,
                bpred,
                config.heartbeat,
            ));
        }

        caches.push(build_cache(
            "LLC".to_string(),
            &config.llc,
            llc_uppers,
            llc_to_dram.clone(),
            config.num_cpus,
        )?);

        let dram = DramController::new(config.dram, vec![llc_to_dram]);

        Ok(SimTop {
            cycle: 0,
            cpus,
            caches,
            walkers,
            dram,
        })
    }

    pub fn hide_heartbeat(&mut self) {
        for cpu in &mut self.cpus {
            cpu.hide_heartbeat();
        }
    }

    fn operate_all(&mut self) {
        let now = self.cycle;
        for cpu in &mut self.cpus {
            cpu.operate(now);
        }
        for cache in &mut self.caches {
            cache.operate(now);
        }
        for walker in &mut self.walkers {
            walker.operate(now);
        }
        self.dram.operate(now);
        self.cycle += 1;
    }

    pub fn run_phase(&mut self, phase: &PhaseInfo) -> PhaseStats {
        info!("phase '{}' begins at cycle {}", phase.name, self.cycle);
        for cpu in &mut self.cpus {
            cpu.begin_phase(phase.is_warmup);
        }
        for cache in &mut self.caches {
            cache.begin_phase(phase.is_warmup);
        }
        for walker in &mut self.walkers {
            walker.begin_phase(phase.is_warmup);
        }
        self.dram.begin_phase(phase.is_warmup);

        while !self.cpus.iter().all(|c| c.phase_complete(phase.length)) {
            self.operate_all();
        }

        for cpu in &mut self.cpus {
            cpu.end_phase();
        }
        for cache in &mut self.caches {
            cache.end_phase();
        }
        for walker in &mut self.walkers {
            walker.end_phase();
        }
        self.dram.end_phase();
        info!("phase '{}' ends at cycle {}", phase.name, self.cycle);

        PhaseStats {
            name: phase.name.clone(),
            cpus: self
                .cpus
                .iter()
                .map(|c| CpuReport::new(c.index(), &c.stats))
                .collect(),
            caches: self
                .caches
                .iter()
                .map(|c| CacheReport::new(c.name(), &c.stats))
                .collect(),
            dram: self
                .dram
                .stats()
                .iter()
                .enumerate()
                .map(|(i, s)| DramReport::new(i, s))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// ip + flags + 2 dreg + 4 sreg + 2 dmem + 4 smem, little endian.
    fn record(ip: u64, is_branch: bool, taken: bool, load: u64, store: u64) -> [u8; 64] {
        let mut rec = [0u8; 64];
        rec[0..8].copy_from_slice(&ip.to_le_bytes());
        rec[8] = is_branch as u8;
        rec[9] = taken as u8;
        rec[16..24].copy_from_slice(&store.to_le_bytes());
        rec[32..40].copy_from_slice(&load.to_le_bytes());
        rec
    }

    fn synthetic_trace(tag: &str, instructions: usize) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("betatron-top-{}-{tag}.trace", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        for i in 0..instructions {
            let ip = 0x40_0000 + (i as u64 % 1024) * 4;
            let is_branch = i % 10 == 9;
            let taken = i % 20 == 19;
            let load = if i % 3 == 0 {
                0x1000_0000 + (i as u64 % 512) * 64
            } else {
                0
            };
            let store = if i % 17 == 0 { 0x2000_0000 + (i as u64 % 64) * 64 } else { 0 };
            file.write_all(&record(ip, is_branch, taken, load, store)).unwrap();
        }
        path
    }

    fn quiet_config() -> SimConfig {
        let mut config = SimConfig::default();
        config.heartbeat = 0;
        config
    }

    fn run_phases(tag: &str) -> Vec<PhaseStats> {
        let trace = synthetic_trace(tag, 4000);
        let config = quiet_config();
        let mut top = SimTop::new(&config, &[trace.clone()], false, true).unwrap();
        let phases = [
            PhaseInfo {
                name: "Warmup".to_string(),
                is_warmup: true,
                length: 200,
            },
            PhaseInfo {
                name: "Simulation".to_string(),
                is_warmup: false,
                length: 1000,
            },
        ];
        let stats = phases.iter().map(|p| top.run_phase(p)).collect();
        std::fs::remove_file(trace).ok();
        stats
    }

    #[test]
    fn a_short_run_retires_the_requested_instructions() {
        let stats = run_phases("smoke");
        assert_eq!(stats.len(), 2);
        assert!(stats[0].cpus[0].instructions >= 200);
        assert!(stats[1].cpus[0].instructions >= 1000);
        assert!(stats[1].cpus[0].ipc > 0.0);

        let l1i = stats[1].caches.iter().find(|c| c.name == "cpu0_L1I").unwrap();
        assert!(l1i.hits.values().sum::<u64>() > 0, "instruction fetches must hit L1I");
        let dtlb = stats[1].caches.iter().find(|c| c.name == "cpu0_DTLB").unwrap();
        assert!(
            dtlb.hits["TRANSLATION"] + dtlb.misses["TRANSLATION"] > 0,
            "loads must consult the DTLB"
        );
        // the cold hierarchy reached memory during warmup
        let warm_dram = &stats[0].dram[0];
        assert!(warm_dram.row_hits + warm_dram.row_misses > 0);
    }

    #[test]
    fn identical_runs_produce_identical_statistics() {
        let a = run_phases("det-a");
        let b = run_phases("det-b");
        let a_json = serde_json::to_string(&a).unwrap();
        let b_json = serde_json::to_string(&b).unwrap();
        assert_eq!(a_json, b_json);
    }

    #[test]
    fn mismatched_trace_count_is_rejected() {
        let config = quiet_config();
        let err = SimTop::new(&config, &[], false, false);
        assert!(err.is_err());
    }
}
