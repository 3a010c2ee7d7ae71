//! Run configuration.
//!
//! Everything the original generated at build time is a declarative TOML
//! document here, mapped onto per-component config records at startup and
//! immutable for the lifetime of the run. Missing sections and fields fall
//! back to their defaults, so an empty file is a valid single-core setup.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::constants::LOG2_PAGE_SIZE;
use crate::core::CoreConfig;
use crate::mem::cache::CacheConfig;
use crate::mem::channel::ChannelConfig;
use crate::mem::dram::DramConfig;
use crate::vmem::walker::WalkerConfig;
use crate::vmem::VmemConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    #[serde(flatten)]
    pub cache: CacheConfig,
    pub prefetcher: String,
    pub replacement: String,
    /// The channel feeding this cache from above.
    pub queues: ChannelConfig,
}

impl Default for CacheSection {
    fn default() -> Self {
        CacheSection {
            cache: CacheConfig::default(),
            prefetcher: "no".to_string(),
            replacement: "lru".to_string(),
            queues: ChannelConfig::default(),
        }
    }
}

impl CacheSection {
    fn sized(sets: usize, ways: usize, hit_latency: u64, mshr_size: usize) -> Self {
        CacheSection {
            cache: CacheConfig {
                sets,
                ways,
                hit_latency,
                mshr_size,
                ..CacheConfig::default()
            },
            ..CacheSection::default()
        }
    }

    fn tlb(sets: usize, ways: usize, hit_latency: u64) -> Self {
        let mut section = Self::sized(sets, ways, hit_latency, 8);
        section.cache.offset_bits = LOG2_PAGE_SIZE;
        section.cache.match_asid = true;
        section.cache.write_allocate = false;
        section
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WalkerSection {
    #[serde(flatten)]
    pub walker: WalkerConfig,
    pub queues: ChannelConfig,
}

impl Default for WalkerSection {
    fn default() -> Self {
        WalkerSection {
            walker: WalkerConfig::default(),
            queues: ChannelConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub num_cpus: usize,
    /// Retired instructions between heartbeat lines; 0 disables.
    pub heartbeat: u64,
    pub core: CoreConfig,
    pub l1i: CacheSection,
    pub l1d: CacheSection,
    pub l2: CacheSection,
    pub llc: CacheSection,
    pub itlb: CacheSection,
    pub dtlb: CacheSection,
    pub stlb: CacheSection,
    pub ptw: WalkerSection,
    pub dram: DramConfig,
    /// The channel between the LLC and the memory controller.
    pub dram_queues: ChannelConfig,
    pub vmem: VmemConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        let mut l1i = CacheSection::sized(64, 8, 4, 8);
        l1i.cache.level_bit = 1;
        let mut l1d = CacheSection::sized(64, 12, 5, 16);
        l1d.cache.level_bit = 1;
        let mut l2 = CacheSection::sized(1024, 8, 10, 32);
        l2.cache.level_bit = 2;
        let mut llc = CacheSection::sized(2048, 16, 20, 64);
        llc.cache.level_bit = 4;

        SimConfig {
            num_cpus: 1,
            heartbeat: 10_000_000,
            core: CoreConfig::default(),
            l1i,
            l1d,
            l2,
            llc,
            itlb: CacheSection::tlb(16, 4, 1),
            dtlb: CacheSection::tlb(16, 4, 1),
            stlb: CacheSection::tlb(128, 12, 8),
            ptw: WalkerSection::default(),
            dram: DramConfig::default(),
            dram_queues: ChannelConfig {
                latency: 1,
                rq_size: 64,
                wq_size: 64,
                pq_size: 64,
            },
            vmem: VmemConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn load(path: Option<&Path>) -> Result<SimConfig> {
        let config = match path {
            None => SimConfig::default(),
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("cannot read config {}", path.display()))?;
                toml::from_str(&text)
                    .with_context(|| format!("cannot parse config {}", path.display()))?
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_cpus == 0 {
            bail!("num_cpus must be at least 1");
        }
        for (name, section) in [
            ("l1i", &self.l1i),
            ("l1d", &self.l1d),
            ("l2", &self.l2),
            ("llc", &self.llc),
            ("itlb", &self.itlb),
            ("dtlb", &self.dtlb),
            ("stlb", &self.stlb),
        ] {
            if !section.cache.sets.is_power_of_two() {
                bail!("{name}: sets must be a power of two, got {}", section.cache.sets);
            }
            if section.cache.ways == 0 || section.cache.mshr_size == 0 {
                bail!("{name}: ways and mshr_size must be nonzero");
            }
        }
        if let Err(msg) = self.dram.validate() {
            bail!("{msg}");
        }
        Ok(())
    }
}
