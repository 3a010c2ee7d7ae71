//! Virtual memory: per-ASID radix page tables over a bump frame allocator.
//!
//! The allocator is purely functional state shared by every walker through an
//! `Arc<RwLock<_>>`; timing lives in the walker and the TLBs. Frame
//! allocation is deterministic so that identical runs touch identical
//! physical addresses.

pub mod walker;

use std::collections::HashMap;

use serde::Deserialize;

use crate::address::{bitmask, lg2, Address, PageNumber};
use crate::constants::{LOG2_PAGE_SIZE, PAGE_SIZE, PTE_BYTES};
use crate::mem::operable::Cycle;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct VmemConfig {
    /// Depth of the page-table radix tree.
    pub levels: u32,
    /// Size in bytes of one page-table node.
    pub pte_page_size: u64,
    /// Extra latency charged when a walk allocates a fresh frame.
    pub minor_fault_penalty: Cycle,
}

impl Default for VmemConfig {
    fn default() -> Self {
        VmemConfig {
            levels: 5,
            pte_page_size: PAGE_SIZE,
            minor_fault_penalty: 200,
        }
    }
}

pub struct VirtualMemory {
    config: VmemConfig,
    /// log2 of the number of PTEs per page-table node.
    bits_per_level: u32,
    /// Next free physical frame, as a page number. Frame 0 stays reserved so
    /// a zero physical address always means "absent".
    next_free_page: u64,
    /// Sub-page bump state for page-table nodes smaller than a frame.
    pte_pool_base: u64,
    pte_pool_used: u64,
    vpage_to_ppage: HashMap<(u16, u64), u64>,
    /// (asid, level, node index) -> byte address of the page-table node.
    page_table: HashMap<(u16, u32, u64), u64>,
}

impl VirtualMemory {
    pub fn new(config: VmemConfig) -> Self {
        assert!(config.levels >= 1, "page table needs at least one level");
        assert!(
            config.pte_page_size.is_power_of_two() && config.pte_page_size >= PTE_BYTES,
            "pte page size must be a power of two no smaller than one PTE"
        );
        VirtualMemory {
            bits_per_level: lg2(config.pte_page_size / PTE_BYTES),
            config,
            next_free_page: 1,
            pte_pool_base: 0,
            pte_pool_used: 0,
            vpage_to_ppage: HashMap::new(),
            page_table: HashMap::new(),
        }
    }

    pub fn levels(&self) -> u32 {
        self.config.levels
    }

    pub fn minor_fault_penalty(&self) -> Cycle {
        self.config.minor_fault_penalty
    }

    /// Right-shift that isolates the page-table index bits for `level`.
    pub fn shamt(&self, level: u32) -> u32 {
        debug_assert!(level >= 1);
        LOG2_PAGE_SIZE + self.bits_per_level * (level - 1)
    }

    /// Index into the level-`level` page-table node for `vaddr`.
    pub fn get_offset(&self, vaddr: Address, level: u32) -> u64 {
        let shamt = self.shamt(level);
        let shifted = if shamt >= 64 { 0 } else { vaddr.value() >> shamt };
        shifted & bitmask(self.bits_per_level)
    }

    /// Bits of `vaddr` above the index range of `level`, identifying the
    /// page-table node the index selects into.
    pub fn node_index(&self, vaddr: Address, level: u32) -> u64 {
        let shift = self.shamt(level) + self.bits_per_level;
        if shift >= 64 {
            0
        } else {
            vaddr.value() >> shift
        }
    }

    fn allocate_frame(&mut self) -> u64 {
        let ppn = self.next_free_page;
        self.next_free_page += 1;
        ppn
    }

    fn allocate_pte_node(&mut self) -> u64 {
        let size = self.config.pte_page_size;
        if size >= PAGE_SIZE {
            let frames = size / PAGE_SIZE;
            let base = self.allocate_frame() << LOG2_PAGE_SIZE;
            for _ in 1..frames {
                self.allocate_frame();
            }
            base
        } else {
            if self.pte_pool_used + size > PAGE_SIZE || self.pte_pool_base == 0 {
                self.pte_pool_base = self.allocate_frame() << LOG2_PAGE_SIZE;
                self.pte_pool_used = 0;
            }
            let base = self.pte_pool_base + self.pte_pool_used;
            self.pte_pool_used += size;
            base
        }
    }

    /// Physical address of the PTE consulted at `level` of a walk for
    /// `vaddr`, creating the page-table node on first touch. The flag
    /// reports whether the node was freshly created.
    pub fn get_pte_pa(&mut self, asid: u16, vaddr: Address, level: u32) -> (Address, bool) {
        let key = (asid, level, self.node_index(vaddr, level));
        let (base, fresh) = match self.page_table.get(&key) {
            Some(base) => (*base, false),
            None => {
                let base = self.allocate_pte_node();
                self.page_table.insert(key, base);
                (base, true)
            }
        };
        let pa = base + self.get_offset(vaddr, level) * PTE_BYTES;
        (Address::new(pa), fresh)
    }

    /// Translate a virtual page, allocating a physical frame on first touch.
    /// The flag reports a minor fault (fresh allocation).
    pub fn va_to_pa(&mut self, asid: u16, vaddr: Address) -> (Address, bool) {
        let vpn = PageNumber::from(vaddr).value();
        let (ppn, fault) = match self.vpage_to_ppage.get(&(asid, vpn)) {
            Some(ppn) => (*ppn, false),
            None => {
                let ppn = self.allocate_frame();
                self.vpage_to_ppage.insert((asid, vpn), ppn);
                (ppn, true)
            }
        };
        (
            Address::from_page_parts(PageNumber::new(ppn), vaddr.page_offset()),
            fault,
        )
    }
}
