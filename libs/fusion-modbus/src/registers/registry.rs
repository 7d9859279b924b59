//! Subregistries and the registry
//!
//! A [`Subregistry`] groups registers that share a lifecycle (for example all alarm
//! registers of one connector). The [`Registry`] maps protocol reads and writes onto
//! them and guarantees that no two registers overlap.
//!
//! All access is serialized by one mutex. Observers fire while it is held, so an
//! observer must not call back into the registry.

use super::register::Register;
use crate::error::{ModbusError, ModbusResult};
use crate::unsolicited::Segment;
use parking_lot::Mutex;
use tracing::{debug, trace};

fn overlap_error(a: &Register, b: &Register) -> ModbusError {
    ModbusError::RegisterOverlap {
        first_start: a.start(),
        first_len: a.words(),
        second_start: b.start(),
        second_len: b.words(),
    }
}

fn check_disjoint<'a>(registers: impl Iterator<Item = &'a Register>) -> ModbusResult<()> {
    let mut sorted: Vec<&Register> = registers.collect();
    sorted.sort_by_key(|r| r.start());
    for pair in sorted.windows(2) {
        if pair[0].overlaps(pair[1]) {
            return Err(overlap_error(pair[0], pair[1]));
        }
    }
    Ok(())
}

/// Registers sharing a lifecycle, owned by value
#[derive(Debug)]
pub struct Subregistry {
    name: String,
    registers: Vec<Register>,
}

impl Subregistry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registers: Vec::new(),
        }
    }

    /// Add a register, rejecting it if it overlaps one already present
    pub fn add(&mut self, register: Register) -> ModbusResult<()> {
        if let Some(existing) = self.registers.iter().find(|r| r.overlaps(&register)) {
            return Err(overlap_error(existing, &register));
        }
        self.registers.push(register);
        Ok(())
    }

    /// Builder form of [`add`](Self::add)
    pub fn with(mut self, register: Register) -> ModbusResult<Self> {
        self.add(register)?;
        Ok(self)
    }

    pub fn verify_overlap(&self) -> ModbusResult<()> {
        check_disjoint(self.registers.iter())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registers(&self) -> &[Register] {
        &self.registers
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }
}

/// All subregistries exposed to the protocol
#[derive(Debug, Default)]
pub struct Registry {
    subregistries: Mutex<Vec<Subregistry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subregistry; fails if any of its registers overlaps an existing one
    pub fn add(&self, subregistry: Subregistry) -> ModbusResult<()> {
        subregistry.verify_overlap()?;
        let mut subregistries = self.subregistries.lock();
        for existing in subregistries.iter() {
            for a in existing.registers() {
                if let Some(b) = subregistry.registers().iter().find(|b| a.overlaps(b)) {
                    return Err(overlap_error(a, b));
                }
            }
        }
        debug!(
            "Registered subregistry '{}' with {} registers",
            subregistry.name(),
            subregistry.len()
        );
        subregistries.push(subregistry);
        Ok(())
    }

    /// Check global non-overlap across every subregistry
    pub fn verify_overlap(&self) -> ModbusResult<()> {
        let subregistries = self.subregistries.lock();
        check_disjoint(subregistries.iter().flat_map(|s| s.registers().iter()))
    }

    /// Number of registers across all subregistries
    pub fn register_count(&self) -> usize {
        self.subregistries.lock().iter().map(Subregistry::len).sum()
    }

    /// Read `words` registers starting at `address`, in wire order
    ///
    /// Addresses without a register read as zero.
    pub fn on_read(&self, address: u16, words: u16) -> ModbusResult<Vec<u8>> {
        if address as u32 + words as u32 > 0x1_0000 {
            return Err(ModbusError::InvalidLength(words as usize * 2));
        }
        let mut out = vec![0u8; words as usize * 2];
        let subregistries = self.subregistries.lock();
        for register in subregistries
            .iter()
            .flat_map(|s| s.registers().iter())
            .filter(|r| r.intersects(address, words))
        {
            let wire = register.read_wire();
            let (dst, src, len) = span(register, address, words);
            out[dst..dst + len].copy_from_slice(&wire[src..src + len]);
        }
        trace!("Read 0x{:04X}+{}: {}", address, words, hex::encode(&out));
        Ok(out)
    }

    /// Write wire-order `bytes` starting at `address`
    ///
    /// Registers partially covered by the write are merged with their current value
    /// and written back whole. Every touched register is validated before any is
    /// written. Addresses without a register are ignored.
    pub fn on_write(&self, address: u16, bytes: &[u8]) -> ModbusResult<()> {
        if bytes.len() % 2 != 0 {
            return Err(ModbusError::InvalidLength(bytes.len()));
        }
        let words = (bytes.len() / 2) as u16;
        if address as u32 + words as u32 > 0x1_0000 {
            return Err(ModbusError::InvalidLength(bytes.len()));
        }
        trace!("Write 0x{:04X}: {}", address, hex::encode(bytes));

        let subregistries = self.subregistries.lock();
        let mut pending = Vec::new();
        for register in subregistries
            .iter()
            .flat_map(|s| s.registers().iter())
            .filter(|r| r.intersects(address, words))
        {
            let mut merged = register.wire_value();
            let (src, dst, len) = span(register, address, words);
            merged[dst..dst + len].copy_from_slice(&bytes[src..src + len]);
            register.validate_wire(&merged)?;
            pending.push((register, merged));
        }
        for (register, merged) in pending {
            register.write_wire(&merged)?;
        }
        Ok(())
    }

    /// Collect a segment for every register due for an unsolicited report
    pub fn take_report_segments(&self) -> Vec<Segment> {
        let subregistries = self.subregistries.lock();
        subregistries
            .iter()
            .flat_map(|s| s.registers().iter())
            .filter(|r| r.take_report())
            .map(|r| Segment::new(r.start(), r.wire_value()))
            .collect()
    }
}

/// Overlap between a register and an access window, in bytes:
/// `(offset in window, offset in register, length)`
fn span(register: &Register, address: u16, words: u16) -> (usize, usize, usize) {
    let window_start = address as u32;
    let window_end = window_start + words as u32;
    let first = window_start.max(register.start() as u32);
    let last = window_end.min(register.end());
    let window_offset = (first - window_start) as usize * 2;
    let register_offset = (first - register.start() as u32) as usize * 2;
    (window_offset, register_offset, (last - first) as usize * 2)
}
