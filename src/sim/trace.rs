//! Binary instruction-trace decoding.
//!
//! Records are fixed-layout little-endian structures; zero entries in the
//! register and memory-operand arrays mean "absent". The CloudSuite variant
//! widens the operand arrays and appends a 2-byte address-space id. When
//! repetition is enabled the reader rewinds at end of file, otherwise it
//! reports exhaustion and the phase winds down.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;

/// ip + 2 flag bytes + 2 dreg + 4 sreg + 2 dmem + 4 smem.
const RECORD_BYTES: usize = 8 + 1 + 1 + 2 + 4 + 2 * 8 + 4 * 8;
/// ip + 2 flag bytes + 4 dreg + 4 sreg + 4 dmem + 4 smem + asid[2].
const CLOUDSUITE_RECORD_BYTES: usize = 8 + 1 + 1 + 4 + 4 + 4 * 8 + 4 * 8 + 2;

/// One decoded trace record, enriched with the address space it runs in.
#[derive(Debug, Clone, Default)]
pub struct TraceInstr {
    pub ip: u64,
    pub is_branch: bool,
    pub branch_taken: bool,
    pub destination_memory: Vec<u64>,
    pub source_memory: Vec<u64>,
    pub asid: u16,
}

pub struct TraceReader {
    path: PathBuf,
    file: BufReader<File>,
    cloudsuite: bool,
    repeat: bool,
    default_asid: u16,
    exhausted: bool,
}

impl TraceReader {
    pub fn open(path: &Path, cpu: usize, cloudsuite: bool, repeat: bool) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("cannot open trace {}", path.display()))?;
        Ok(TraceReader {
            path: path.to_path_buf(),
            file: BufReader::new(file),
            cloudsuite,
            repeat,
            default_asid: cpu as u16,
            exhausted: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exhausted(&self) -> bool {
        self.exhausted
    }

    fn read_record(&mut self, buf: &mut [u8]) -> Result<bool> {
        match self.file.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                if !self.repeat {
                    return Ok(false);
                }
                info!("trace {} wrapped around", self.path.display());
                self.file
                    .seek(SeekFrom::Start(0))
                    .with_context(|| format!("cannot rewind trace {}", self.path.display()))?;
                self.file
                    .read_exact(buf)
                    .with_context(|| format!("trace {} is shorter than one record", self.path.display()))?;
                Ok(true)
            }
            Err(e) => Err(e).with_context(|| format!("cannot read trace {}", self.path.display())),
        }
    }

    /// Decode the next instruction, or `None` once a non-repeating trace
    /// runs out.
    pub fn next_instr(&mut self) -> Result<Option<TraceInstr>> {
        if self.exhausted {
            return Ok(None);
        }
        if self.cloudsuite {
            let mut buf = [0u8; CLOUDSUITE_RECORD_BYTES];
            if !self.read_record(&mut buf)? {
                self.exhausted = true;
                return Ok(None);
            }
            Ok(Some(decode_cloudsuite(&buf)))
        } else {
            let mut buf = [0u8; RECORD_BYTES];
            if !self.read_record(&mut buf)? {
                self.exhausted = true;
                return Ok(None);
            }
            Ok(Some(decode_standard(&buf, self.default_asid)))
        }
    }
}

fn u64_at(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}

fn mem_operands(buf: &[u8], at: usize, count: usize) -> Vec<u64> {
    (0..count)
        .map(|i| u64_at(buf, at + i * 8))
        .filter(|&a| a != 0)
        .collect()
}

fn decode_standard(buf: &[u8], asid: u16) -> TraceInstr {
    let ip = u64_at(buf, 0);
    let is_branch = buf[8] != 0;
    let branch_taken = buf[9] != 0;
    // 2 destination + 4 source register bytes precede the memory operands
    let dmem_at = 10 + 2 + 4;
    let smem_at = dmem_at + 2 * 8;
    TraceInstr {
        ip,
        is_branch,
        branch_taken,
        destination_memory: mem_operands(buf, dmem_at, 2),
        source_memory: mem_operands(buf, smem_at, 4),
        asid,
    }
}

fn decode_cloudsuite(buf: &[u8]) -> TraceInstr {
    let ip = u64_at(buf, 0);
    let is_branch = buf[8] != 0;
    let branch_taken = buf[9] != 0;
    let dmem_at = 10 + 4 + 4;
    let smem_at = dmem_at + 4 * 8;
    let asid_at = smem_at + 4 * 8;
    TraceInstr {
        ip,
        is_branch,
        branch_taken,
        destination_memory: mem_operands(buf, dmem_at, 4),
        source_memory: mem_operands(buf, smem_at, 4),
        asid: u16::from_le_bytes([buf[asid_at], buf[asid_at + 1]]),
    }
}
