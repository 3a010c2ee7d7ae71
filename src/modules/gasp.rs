//! Lookahead prefetcher driven by delta classification.
//!
//! Per-IP input-buffer entries carry the last touched block, the recent
//! delta-class sequence, the predicted next class and a confidence counter.
//! A small dictionary maps raw block deltas onto a bounded set of class ids
//! and a lightweight sequence predictor guesses the next class. Once
//! confidence crosses the threshold, a lookahead walks the predicted stride,
//! one `prefetch_line` per cycle, stopping at the page boundary unless the
//! cache allows virtual prefetching. A refused prefetch is retried next
//! cycle.

use crate::address::{Address, BlockNumber, PageNumber};
use crate::constants::BLOCK_SIZE;
use crate::mem::request::AccessKind;
use crate::modules::{CacheOps, Prefetcher};

const INPUT_BUFFER_SETS: usize = 256;
const INPUT_BUFFER_WAYS: usize = 4;
const NUM_CLASSES: usize = 4;
const SEQUENCE_SIZE: usize = 4;
const PREFETCH_DEGREE: u32 = 3;
const CONFIDENCE_THRESHOLD: u8 = 12;
const MAX_CONFIDENCE: u8 = 15;

/// Class id meaning "no prediction".
const NO_CLASS: u8 = NUM_CLASSES as u8;

#[derive(Debug, Clone, Copy)]
struct BufferEntry {
    ip: u64,
    last_block: u64,
    sequence: [u8; SEQUENCE_SIZE],
    predicted: u8,
    confidence: u8,
    last_used: u64,
}

#[derive(Debug, Default)]
struct InputBuffer {
    entries: Vec<Option<BufferEntry>>,
    access: u64,
}

impl InputBuffer {
    fn new() -> Self {
        InputBuffer {
            entries: vec![None; INPUT_BUFFER_SETS * INPUT_BUFFER_WAYS],
            access: 0,
        }
    }

    fn set_of(ip: u64) -> usize {
        (ip % INPUT_BUFFER_SETS as u64) as usize
    }

    fn read(&mut self, ip: u64) -> Option<BufferEntry> {
        let begin = Self::set_of(ip) * INPUT_BUFFER_WAYS;
        for idx in begin..begin + INPUT_BUFFER_WAYS {
            if let Some(entry) = self.entries[idx] {
                if entry.ip == ip {
                    return Some(entry);
                }
            }
        }
        None
    }

    fn write(&mut self, mut entry: BufferEntry) {
        self.access += 1;
        entry.last_used = self.access;
        let begin = Self::set_of(entry.ip) * INPUT_BUFFER_WAYS;
        let row = begin..begin + INPUT_BUFFER_WAYS;

        let slot = row
            .clone()
            .find(|&i| self.entries[i].map_or(false, |e| e.ip == entry.ip))
            .or_else(|| row.clone().find(|&i| self.entries[i].is_none()))
            .unwrap_or_else(|| {
                row.min_by_key(|&i| self.entries[i].map_or(0, |e| e.last_used))
                    .unwrap()
            });
        self.entries[slot] = Some(entry);
    }
}

/// Bounded map from observed block deltas to small class ids.
#[derive(Debug)]
struct Dictionary {
    classes: Vec<Option<(i64, u64)>>,
    access: u64,
}

impl Dictionary {
    fn new() -> Self {
        Dictionary {
            classes: vec![None; NUM_CLASSES],
            access: 0,
        }
    }

    fn write(&mut self, delta: i64) -> u8 {
        self.access += 1;
        if let Some(idx) = self
            .classes
            .iter()
            .position(|c| c.map_or(false, |(d, _)| d == delta))
        {
            self.classes[idx] = Some((delta, self.access));
            return idx as u8;
        }
        let idx = self
            .classes
            .iter()
            .position(|c| c.is_none())
            .unwrap_or_else(|| {
                self.classes
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, c)| c.map_or(0, |(_, used)| used))
                    .map(|(i, _)| i)
                    .unwrap()
            });
        self.classes[idx] = Some((delta, self.access));
        idx as u8
    }

    fn read(&self, class: u8) -> Option<i64> {
        self.classes
            .get(class as usize)
            .and_then(|c| c.map(|(delta, _)| delta))
    }
}

/// Perceptron-style vote table over the class sequence.
#[derive(Debug)]
struct SequencePredictor {
    weights: [[[i8; NUM_CLASSES]; NUM_CLASSES + 1]; SEQUENCE_SIZE],
}

impl SequencePredictor {
    fn new() -> Self {
        SequencePredictor {
            weights: [[[0; NUM_CLASSES]; NUM_CLASSES + 1]; SEQUENCE_SIZE],
        }
    }

    fn predict(&self, sequence: &[u8; SEQUENCE_SIZE]) -> u8 {
        let mut best = 0usize;
        let mut best_score = i32::MIN;
        for class in 0..NUM_CLASSES {
            let score: i32 = (0..SEQUENCE_SIZE)
                .map(|pos| self.weights[pos][sequence[pos] as usize][class] as i32)
                .sum();
            if score > best_score {
                best_score = score;
                best = class;
            }
        }
        best as u8
    }

    fn fit(&mut self, sequence: &[u8; SEQUENCE_SIZE], target: u8) {
        let mispredicted = self.predict(sequence);
        for pos in 0..SEQUENCE_SIZE {
            let row = &mut self.weights[pos][sequence[pos] as usize];
            row[target as usize] = row[target as usize].saturating_add(1);
            if mispredicted != target {
                row[mispredicted as usize] = row[mispredicted as usize].saturating_sub(1);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Lookahead {
    address: u64,
    stride: i64,
    degree: u32,
}

pub struct Gasp {
    input_buffer: InputBuffer,
    dictionary: Dictionary,
    predictor: SequencePredictor,
    active_lookahead: Option<Lookahead>,
}

impl Gasp {
    pub fn new() -> Self {
        Gasp {
            input_buffer: InputBuffer::new(),
            dictionary: Dictionary::new(),
            predictor: SequencePredictor::new(),
            active_lookahead: None,
        }
    }

    fn bump(confidence: u8) -> u8 {
        confidence.saturating_add(1).min(MAX_CONFIDENCE)
    }

    fn drop(confidence: u8) -> u8 {
        confidence.saturating_sub(1)
    }

    /// Classify the delta for `ip` and, with enough confidence, return the
    /// predicted next block.
    fn predict(&mut self, ip: u64, block: u64) -> Option<u64> {
        let Some(entry) = self.input_buffer.read(ip) else {
            self.input_buffer.write(BufferEntry {
                ip,
                last_block: block,
                sequence: [NO_CLASS; SEQUENCE_SIZE],
                predicted: NO_CLASS,
                confidence: 0,
                last_used: 0,
            });
            return None;
        };

        let delta = block as i64 - entry.last_block as i64;
        let class = self.dictionary.write(delta);
        let mut sequence = entry.sequence;
        sequence.rotate_left(1);
        sequence[SEQUENCE_SIZE - 1] = class;

        if entry.predicted == class {
            let confidence = Self::bump(entry.confidence);
            let predicted = self.predictor.predict(&sequence);
            // an emitting access leaves the stored entry untouched
            if confidence >= CONFIDENCE_THRESHOLD {
                if let Some(stride) = self.dictionary.read(predicted) {
                    return Some(block.wrapping_add(stride as u64));
                }
            }
            self.input_buffer.write(BufferEntry {
                ip,
                last_block: block,
                sequence,
                predicted,
                confidence,
                last_used: 0,
            });
            None
        } else if entry.predicted != NO_CLASS {
            // wrong prediction: lose confidence and retrain on the old
            // sequence before re-entering the unpredicted state
            let confidence = Self::drop(entry.confidence);
            self.predictor.fit(&entry.sequence, class);
            self.input_buffer.write(BufferEntry {
                ip,
                last_block: block,
                sequence,
                predicted: NO_CLASS,
                confidence,
                last_used: 0,
            });
            None
        } else {
            let predicted = self.predictor.predict(&sequence);
            if entry.confidence >= CONFIDENCE_THRESHOLD {
                if let Some(stride) = self.dictionary.read(predicted) {
                    return Some(block.wrapping_add(stride as u64));
                }
            }
            self.input_buffer.write(BufferEntry {
                ip,
                last_block: block,
                sequence,
                predicted,
                confidence: entry.confidence,
                last_used: 0,
            });
            None
        }
    }

    fn initiate_lookahead(&mut self, ip: u64, block: u64) {
        if let Some(predicted_block) = self.predict(ip, block) {
            let stride = predicted_block as i64 - block as i64;
            if stride != 0 {
                self.active_lookahead = Some(Lookahead {
                    address: block << crate::constants::LOG2_BLOCK_SIZE,
                    stride,
                    degree: PREFETCH_DEGREE,
                });
            }
        }
    }

    fn advance_lookahead(&mut self, ops: &mut CacheOps) {
        let Some(Lookahead {
            address,
            stride,
            degree,
        }) = self.active_lookahead
        else {
            return;
        };
        debug_assert!(degree > 0);

        let pf_address = (address as i64 + stride * BLOCK_SIZE as i64) as u64;
        let same_page = PageNumber::from(Address::new(pf_address)) == PageNumber::from(Address::new(address));
        if !ops.virtual_prefetch() && !same_page {
            self.active_lookahead = None;
            return;
        }

        let fill_this_level = ops.mshr_occupancy_ratio() < 0.5;
        if ops.prefetch_line(Address::new(pf_address), fill_this_level, 0) {
            if degree <= 1 {
                self.active_lookahead = None;
            } else {
                self.active_lookahead = Some(Lookahead {
                    address: pf_address,
                    stride,
                    degree: degree - 1,
                });
            }
        }
        // on refusal the same step is retried next cycle
    }
}

impl Default for Gasp {
    fn default() -> Self {
        Gasp::new()
    }
}

impl Prefetcher for Gasp {
    fn cache_operate(
        &mut self,
        _ops: &mut CacheOps,
        addr: Address,
        ip: Address,
        _hit: bool,
        _useful: bool,
        kind: AccessKind,
        metadata: u32,
    ) -> u32 {
        if matches!(kind, AccessKind::Load | AccessKind::Rfo) {
            self.initiate_lookahead(ip.value(), BlockNumber::from(addr).value());
        }
        metadata
    }

    fn cache_fill(
        &mut self,
        _ops: &mut CacheOps,
        _addr: Address,
        _set: usize,
        _way: usize,
        _prefetch: bool,
        _evicted: Address,
        metadata: u32,
    ) -> u32 {
        metadata
    }

    fn cycle_operate(&mut self, ops: &mut CacheOps) {
        self.advance_lookahead(ops);
    }
}
