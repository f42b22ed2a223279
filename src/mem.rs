use std::fmt;

use symexpr::Value;

/// One location in memory: a symbolic address paired with symbolic data.
///
/// Every memory address conceptually holds a unique named value from the
/// start of evaluation, but cells are only materialized when an address is
/// actually read or written. The `clobbered` flag marks a cell whose value
/// may have been invalidated by a later possibly-aliasing write; its next
/// read produces a fresh value. The `written` flag distinguishes cells that
/// originate from an explicit write from cells that materialize an implicit
/// initial read.
#[derive(Debug, Clone)]
pub struct MemoryCell {
    address: Value<32>,
    data: Value<32>,
    nbytes: usize,
    clobbered: bool,
    written: bool,
}

impl MemoryCell {
    /// Creates an unclobbered, unwritten cell. Data of narrower widths is
    /// zero-extended into the 32-bit `data` by the caller.
    pub fn new(address: Value<32>, data: Value<32>, nbytes: usize) -> Self {
        assert!(
            matches!(nbytes, 1 | 2 | 4),
            "unsupported memory access size of {nbytes} bytes"
        );
        Self {
            address,
            data,
            nbytes,
            clobbered: false,
            written: false,
        }
    }

    pub fn address(&self) -> &Value<32> {
        &self.address
    }

    pub fn data(&self) -> &Value<32> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Value<32> {
        &mut self.data
    }

    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    pub fn is_clobbered(&self) -> bool {
        self.clobbered
    }

    pub fn set_clobbered(&mut self) {
        self.clobbered = true;
    }

    pub fn clear_clobbered(&mut self) {
        self.clobbered = false;
    }

    pub fn is_written(&self) -> bool {
        self.written
    }

    pub fn set_written(&mut self) {
        self.written = true;
    }

    /// True if this cell and `other` are provably the same memory location:
    /// structurally equal address expressions and equal sizes.
    pub fn must_alias(&self, other: &MemoryCell) -> bool {
        self.nbytes == other.nbytes && self.address == other.address
    }

    /// True unless this cell and `other` are provably disjoint. Disjointness
    /// is only provable when both addresses are known constants and the byte
    /// ranges do not intersect.
    pub fn may_alias(&self, other: &MemoryCell) -> bool {
        if self.must_alias(other) {
            return true;
        }
        if let (Some(a), Some(b)) = (self.address.as_known(), other.address.as_known()) {
            let a_end = a + self.nbytes as u64;
            let b_end = b + other.nbytes as u64;
            return a < b_end && b < a_end;
        }
        true
    }
}

impl fmt::Display for MemoryCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "memory[{}; {} bytes] = {}",
            self.address, self.nbytes, self.data
        )?;
        if self.clobbered {
            f.write_str(" (clobbered)")?;
        }
        if self.written {
            f.write_str(" (written)")?;
        }
        Ok(())
    }
}

/// An insertion-ordered sequence of memory cells.
///
/// The order carries no meaning beyond making traversals deterministic.
#[derive(Debug, Clone, Default)]
pub struct Memory {
    cells: Vec<MemoryCell>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn push(&mut self, cell: MemoryCell) {
        self.cells.push(cell);
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryCell> {
        self.cells.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut MemoryCell> {
        self.cells.iter_mut()
    }

    pub fn retain(&mut self, keep: impl FnMut(&MemoryCell) -> bool) {
        self.cells.retain(keep);
    }
}
