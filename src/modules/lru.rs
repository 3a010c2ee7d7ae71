use crate::address::Address;
use crate::mem::cache::CacheBlock;
use crate::mem::request::AccessKind;
use crate::modules::Replacement;

/// Evict the way with the most distant last use.
pub struct Lru {
    ways: usize,
    last_used_cycles: Vec<u64>,
    cycle: u64,
}

impl Lru {
    pub fn new(sets: usize, ways: usize) -> Self {
        Lru {
            ways,
            last_used_cycles: vec![0; sets * ways],
            cycle: 0,
        }
    }
}

impl Replacement for Lru {
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
        let row = &self.last_used_cycles[set * self.ways..(set + 1) * self.ways];
        row.iter()
            .enumerate()
            .min_by_key(|(_, &used)| used)
            .map(|(way, _)| way)
            .unwrap_or(0)
    }

    fn update_state(
        &mut self,
        _cpu: usize,
        set: usize,
        way: usize,
        _addr: Address,
        _ip: Address,
        _victim_addr: Address,
        kind: AccessKind,
        hit: bool,
    ) {
        // Skip this for writeback hits
        if hit && kind == AccessKind::Write {
            return;
        }
        self.last_used_cycles[set * self.ways + way] = self.cycle;
        self.cycle += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(lru: &mut Lru, set: usize, way: usize) {
        lru.update_state(
            0,
            set,
            way,
            Address::default(),
            Address::default(),
            Address::default(),
            AccessKind::Load,
            true,
        );
    }

    #[test]
    fn victim_is_the_least_recently_touched_way() {
        let mut lru = Lru::new(1, 4);
        for way in [0, 1, 2, 3, 0, 2, 3] {
            touch(&mut lru, 0, way);
        }
        let row = vec![CacheBlock::default(); 4];
        let victim = lru.find_victim(0, 0, 0, &row, Address::default(), Address::default(), AccessKind::Load);
        assert_eq!(victim, 1);
    }

    #[test]
    fn writeback_hits_do_not_refresh_recency() {
        let mut lru = Lru::new(1, 2);
        touch(&mut lru, 0, 0);
        touch(&mut lru, 0, 1);
        lru.update_state(
            0,
            0,
            0,
            Address::default(),
            Address::default(),
            Address::default(),
            AccessKind::Write,
            true,
        );
        let row = vec![CacheBlock::default(); 2];
        let victim = lru.find_victim(0, 0, 0, &row, Address::default(), Address::default(), AccessKind::Load);
        assert_eq!(victim, 0);
    }

    #[test]
    fn victim_is_always_in_range() {
        let mut lru = Lru::new(4, 8);
        let row = vec![CacheBlock::default(); 8];
        for set in 0..4 {
            let way = lru.find_victim(0, 0, set, &row, Address::default(), Address::default(), AccessKind::Load);
            assert!(way < 8);
        }
    }
}
