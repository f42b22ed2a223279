use std::fmt;

use symexpr::{RenameMap, Value};

use crate::mem::Memory;

/// Number of general-purpose registers.
pub const N_GPRS: usize = 8;

/// Number of segment registers.
pub const N_SEGREGS: usize = 6;

/// Number of status flags.
pub const N_FLAGS: usize = 16;

/// The entire state of the machine: instruction pointer, register file,
/// flags, and memory.
///
/// A freshly constructed state holds a distinct unknown in every slot and an
/// empty memory: nothing is assumed about the machine beyond the widths of
/// its storage locations. The assignment of register and flag indices to
/// architectural names is the dispatcher's business; the core only enforces
/// the index ranges.
#[derive(Debug, Clone)]
pub struct State {
    pub(crate) ip: Value<32>,
    pub(crate) gprs: [Value<32>; N_GPRS],
    pub(crate) segregs: [Value<16>; N_SEGREGS],
    pub(crate) flags: [Value<1>; N_FLAGS],
    pub(crate) mem: Memory,
}

impl State {
    /// Creates a state with fresh unknowns in every slot and empty memory.
    pub fn new() -> Self {
        Self {
            ip: Value::unknown(),
            gprs: std::array::from_fn(|_| Value::unknown()),
            segregs: std::array::from_fn(|_| Value::unknown()),
            flags: std::array::from_fn(|_| Value::unknown()),
            mem: Memory::new(),
        }
    }

    /// Reinitializes every slot to a fresh unknown and clears memory.
    pub fn reset(&mut self) {
        *self = State::new();
    }

    pub fn ip(&self) -> &Value<32> {
        &self.ip
    }

    pub fn gpr(&self, r: usize) -> &Value<32> {
        assert!(r < N_GPRS, "general-purpose register {r} out of range");
        &self.gprs[r]
    }

    pub fn segreg(&self, sr: usize) -> &Value<16> {
        assert!(sr < N_SEGREGS, "segment register {sr} out of range");
        &self.segregs[sr]
    }

    pub fn flag(&self, f: usize) -> &Value<1> {
        assert!(f < N_FLAGS, "flag {f} out of range");
        &self.flags[f]
    }

    pub fn memory(&self) -> &Memory {
        &self.mem
    }

    /// Componentwise structural equality of the register file: general
    /// purpose registers, segment registers, and flags. The instruction
    /// pointer and memory are compared separately.
    pub fn equal_registers(&self, other: &State) -> bool {
        self.gprs == other.gprs && self.segregs == other.segregs && self.flags == other.flags
    }

    pub(crate) fn fmt_with(
        &self,
        f: &mut fmt::Formatter<'_>,
        mut rmap: Option<&mut RenameMap>,
    ) -> fmt::Result {
        fn slot(
            f: &mut fmt::Formatter<'_>,
            rmap: Option<&mut RenameMap>,
            name: &str,
            expr: &symexpr::ExprRef,
        ) -> fmt::Result {
            write!(f, "{name:<10} = ")?;
            expr.fmt_with(f, rmap)?;
            writeln!(f)
        }

        slot(f, rmap.as_deref_mut(), "ip", self.ip.expr())?;
        for (i, gpr) in self.gprs.iter().enumerate() {
            slot(f, rmap.as_deref_mut(), &format!("gpr[{i}]"), gpr.expr())?;
        }
        for (i, segreg) in self.segregs.iter().enumerate() {
            slot(f, rmap.as_deref_mut(), &format!("segreg[{i}]"), segreg.expr())?;
        }
        for (i, flag) in self.flags.iter().enumerate() {
            slot(f, rmap.as_deref_mut(), &format!("flag[{i}]"), flag.expr())?;
        }
        for cell in self.mem.iter() {
            write!(f, "memory[")?;
            cell.address().expr().fmt_with(f, rmap.as_deref_mut())?;
            write!(f, "; {} bytes] = ", cell.nbytes())?;
            cell.data().expr().fmt_with(f, rmap.as_deref_mut())?;
            if cell.is_clobbered() {
                f.write_str(" (clobbered)")?;
            }
            if cell.is_written() {
                f.write_str(" (written)")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, None)
    }
}
