use crate::address::Address;
use crate::mem::channel::ChannelRef;
use crate::mem::operable::Cycle;

/// What a request is asking the memory system to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Load,
    Rfo,
    Prefetch,
    Write,
    Translation,
}

impl AccessKind {
    pub const ALL: [AccessKind; 5] = [
        AccessKind::Load,
        AccessKind::Rfo,
        AccessKind::Prefetch,
        AccessKind::Write,
        AccessKind::Translation,
    ];

    pub fn index(self) -> usize {
        match self {
            AccessKind::Load => 0,
            AccessKind::Rfo => 1,
            AccessKind::Prefetch => 2,
            AccessKind::Write => 3,
            AccessKind::Translation => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AccessKind::Load => "LOAD",
            AccessKind::Rfo => "RFO",
            AccessKind::Prefetch => "PREFETCH",
            AccessKind::Write => "WRITE",
            AccessKind::Translation => "TRANSLATION",
        }
    }
}

/// One in-flight memory request.
///
/// `event_cycle` is the earliest cycle at which the request is eligible for
/// further processing; consumers skip entries whose stamp lies in the future.
/// `to_return` lists the channels whose response queues must see the fill.
#[derive(Debug, Clone)]
pub struct MemRequest {
    pub v_address: Address,
    /// Physical address; equals `v_address` until translation fills it in.
    pub address: Address,
    /// Payload carried back on fills. Translation requests return the
    /// physical address here.
    pub data: Address,
    pub instr_id: u64,
    pub ip: Address,
    pub kind: AccessKind,
    pub cpu: usize,
    pub asid: u16,
    pub pf_metadata: u32,
    /// Bit per cache level that requested this prefetch; merged with OR.
    pub pf_origin_level: u8,
    /// Whether a prefetch allocates in the cache currently holding it.
    pub fill_this_level: bool,
    pub event_cycle: Cycle,
    pub cycle_enqueued: Cycle,
    pub to_return: Vec<ChannelRef>,
    /// Stable ids of instructions woken by the fill.
    pub instr_depend_on_me: Vec<u64>,
}

impl MemRequest {
    pub fn new(kind: AccessKind, address: Address) -> Self {
        MemRequest {
            v_address: address,
            address,
            data: Address::default(),
            instr_id: 0,
            ip: Address::default(),
            kind,
            cpu: 0,
            asid: 0,
            pf_metadata: 0,
            pf_origin_level: 0,
            fill_this_level: true,
            event_cycle: 0,
            cycle_enqueued: 0,
            to_return: Vec::new(),
            instr_depend_on_me: Vec::new(),
        }
    }

    /// Whether this request may share an MSHR with `other`. Writes never
    /// coalesce; everything else merges when it names the same block in the
    /// same address space.
    pub fn mergeable_with(&self, other: &MemRequest, offset_bits: u32, match_asid: bool) -> bool {
        if self.kind == AccessKind::Write || other.kind == AccessKind::Write {
            return false;
        }
        if match_asid && self.asid != other.asid {
            return false;
        }
        (self.address.value() >> offset_bits) == (other.address.value() >> offset_bits)
    }
}

/// A completed request travelling back up the hierarchy.
#[derive(Debug, Clone)]
pub struct MemResponse {
    pub address: Address,
    pub v_address: Address,
    pub data: Address,
    pub asid: u16,
    pub pf_metadata: u32,
    pub event_cycle: Cycle,
    pub instr_depend_on_me: Vec<u64>,
}

impl MemResponse {
    pub fn for_request(req: &MemRequest) -> Self {
        MemResponse {
            address: req.address,
            v_address: req.v_address,
            data: req.data,
            asid: req.asid,
            pf_metadata: req.pf_metadata,
            event_cycle: 0,
            instr_depend_on_me: req.instr_depend_on_me.clone(),
        }
    }
}

/// Append `src`'s wakeup list onto `dst`, dropping duplicates.
pub fn merge_dependents(dst: &mut Vec<u64>, src: &[u64]) {
    for id in src {
        if !dst.contains(id) {
            dst.push(*id);
        }
    }
}
