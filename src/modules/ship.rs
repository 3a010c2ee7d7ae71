//! SHIP replacement: RRIP re-reference counters steered by a signature
//! history counter table, trained on a handful of sampler sets.

use crate::address::{lg2, Address};
use crate::mem::cache::CacheBlock;
use crate::mem::request::AccessKind;
use crate::modules::Replacement;

const MAX_RRPV: u8 = 3;
const SAMPLER_SETS: usize = 256;
const SHCT_PRIME: usize = 16381;
const SHCT_MAX: i8 = 3;

#[derive(Debug, Clone, Copy, Default)]
struct SamplerEntry {
    valid: bool,
    used: bool,
    address: u64,
    ip: u64,
    last_used: u64,
}

pub struct Ship {
    ways: usize,
    rrpv: Vec<u8>,
    /// Sorted set indices sampled for SHCT training.
    rand_sets: Vec<usize>,
    sampler: Vec<SamplerEntry>,
    /// Saturating [0, SHCT_MAX] counters per cpu, indexed by ip mod prime.
    shct: Vec<Vec<i8>>,
    access_count: u64,
    addr_shamt: u32,
}

impl Ship {
    pub fn new(sets: usize, ways: usize, cpus: usize) -> Self {
        // fixed-seed LCG keeps the sampled sets identical across runs; a
        // collision redraws from the sequence until a fresh value appears
        let target = SAMPLER_SETS.min(sets);
        let mut rand_sets: Vec<usize> = Vec::with_capacity(target);
        let mut rand_seed: u64 = 1103515245 + 12345;
        for _ in 0..target {
            let mut val = ((rand_seed / 65536) % sets as u64) as usize;
            let mut loc = rand_sets.partition_point(|&s| s < val);
            while rand_sets.get(loc) == Some(&val) {
                rand_seed = rand_seed.wrapping_mul(1103515245).wrapping_add(12345);
                val = ((rand_seed / 65536) % sets as u64) as usize;
                loc = rand_sets.partition_point(|&s| s < val);
            }
            rand_sets.insert(loc, val);
        }

        Ship {
            ways,
            rrpv: vec![MAX_RRPV; sets * ways],
            sampler: vec![SamplerEntry::default(); SAMPLER_SETS.min(sets) * ways],
            rand_sets,
            shct: vec![vec![0; SHCT_PRIME]; cpus.max(1)],
            access_count: 0,
            addr_shamt: 8 + lg2(ways.next_power_of_two() as u64),
        }
    }

    fn shct_bump(&mut self, cpu: usize, ip: u64, up: bool) {
        let counter = &mut self.shct[cpu][(ip % SHCT_PRIME as u64) as usize];
        if up {
            *counter = (*counter + 1).min(SHCT_MAX);
        } else {
            *counter = (*counter - 1).max(0);
        }
    }
}

impl Replacement for Ship {
    fn find_victim(
        &mut self,
        _cpu: usize,
        _instr_id: u64,
        set: usize,
        _row: &[CacheBlock],
        _ip: Address,
        _addr: Address,
        _kind: AccessKind,
    ) -> usize {
        // look for a max-RRPV line, aging the set until one appears
        loop {
            let row = &mut self.rrpv[set * self.ways..(set + 1) * self.ways];
            if let Some(way) = row.iter().position(|&r| r == MAX_RRPV) {
                return way;
            }
            for r in row.iter_mut() {
                *r += 1;
            }
        }
    }

    fn update_state(
        &mut self,
        cpu: usize,
        set: usize,
        way: usize,
        addr: Address,
        ip: Address,
        _victim_addr: Address,
        kind: AccessKind,
        hit: bool,
    ) {
        // handle writeback access
        if kind == AccessKind::Write {
            if !hit {
                self.rrpv[set * self.ways + way] = MAX_RRPV - 1;
            }
            return;
        }

        if let Some(s_idx) = self.rand_sets.iter().position(|&s| s == set) {
            let begin = s_idx * self.ways;
            let end = begin + self.ways;
            let shamt = self.addr_shamt;
            let match_idx = (begin..end).find(|&i| {
                let e = &self.sampler[i];
                e.valid && (e.address >> shamt) == (addr.value() >> shamt)
            });
            let idx = match match_idx {
                Some(idx) => {
                    let trained_ip = self.sampler[idx].ip;
                    self.shct_bump(cpu, trained_ip, false);
                    self.sampler[idx].used = true;
                    idx
                }
                None => {
                    let idx = (begin..end)
                        .min_by_key(|&i| self.sampler[i].last_used)
                        .unwrap();
                    if self.sampler[idx].used {
                        let evicted_ip = self.sampler[idx].ip;
                        self.shct_bump(cpu, evicted_ip, true);
                    }
                    self.sampler[idx] = SamplerEntry {
                        valid: true,
                        used: false,
                        address: addr.value(),
                        ip: ip.value(),
                        last_used: 0,
                    };
                    idx
                }
            };
            self.sampler[idx].last_used = self.access_count;
            self.access_count += 1;
        }

        if hit {
            self.rrpv[set * self.ways + way] = 0;
        } else {
            self.rrpv[set * self.ways + way] = MAX_RRPV - 1;
            if self.shct[cpu][(ip.value() % SHCT_PRIME as u64) as usize] == SHCT_MAX {
                self.rrpv[set * self.ways + way] = MAX_RRPV;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(ship: &mut Ship, set: usize, way: usize, addr: u64, ip: u64, kind: AccessKind, hit: bool) {
        ship.update_state(
            0,
            set,
            way,
            Address::new(addr),
            Address::new(ip),
            Address::default(),
            kind,
            hit,
        );
    }

    #[test]
    fn fresh_sets_evict_way_zero_first() {
        let mut ship = Ship::new(64, 4, 1);
        let row = vec![CacheBlock::default(); 4];
        let way = ship.find_victim(0, 0, 0, &row, Address::default(), Address::default(), AccessKind::Load);
        assert_eq!(way, 0);
    }

    #[test]
    fn a_hit_protects_the_way() {
        let mut ship = Ship::new(64, 2, 1);
        update(&mut ship, 3, 0, 0x1000, 0x400, AccessKind::Load, false);
        update(&mut ship, 3, 0, 0x1000, 0x400, AccessKind::Load, true);
        let row = vec![CacheBlock::default(); 2];
        let way = ship.find_victim(0, 0, 3, &row, Address::default(), Address::default(), AccessKind::Load);
        assert_eq!(way, 1, "the re-referenced way must not be the victim");
    }

    #[test]
    fn victim_search_ages_until_a_candidate_appears() {
        let mut ship = Ship::new(64, 2, 1);
        update(&mut ship, 5, 0, 0x1000, 0x400, AccessKind::Load, true);
        update(&mut ship, 5, 1, 0x2000, 0x404, AccessKind::Load, true);
        let row = vec![CacheBlock::default(); 2];
        let way = ship.find_victim(0, 0, 5, &row, Address::default(), Address::default(), AccessKind::Load);
        assert!(way < 2);
    }

    #[test]
    fn writeback_misses_insert_at_long_rerpv() {
        let mut ship = Ship::new(64, 2, 1);
        update(&mut ship, 7, 1, 0x3000, 0, AccessKind::Write, false);
        assert_eq!(ship.rrpv[7 * 2 + 1], MAX_RRPV - 1);
        // writeback hit leaves state alone
        update(&mut ship, 7, 1, 0x3000, 0, AccessKind::Write, true);
        assert_eq!(ship.rrpv[7 * 2 + 1], MAX_RRPV - 1);
    }

    #[test]
    fn sampled_sets_are_deterministic() {
        let a = Ship::new(2048, 16, 1);
        let b = Ship::new(2048, 16, 1);
        assert_eq!(a.rand_sets, b.rand_sets);
        assert_eq!(a.rand_sets.len(), SAMPLER_SETS);
    }
}
