/// Operators for internal nodes of an expression tree.
///
/// Operators that take a shift or size operand place it before the bit vector
/// being operated on, so a rendered expression reads with the (usually
/// constant) amount first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// Addition. One or more operands, all the same width.
    Add,
    /// Boolean AND. All operands are single-bit values.
    BoolAnd,
    /// Boolean OR. All operands are single-bit values.
    BoolOr,
    /// Bitwise AND. One or more operands, all the same width.
    BitAnd,
    /// Bitwise OR. One or more operands, all the same width.
    BitOr,
    /// Bitwise exclusive OR. One or more operands, all the same width.
    BitXor,
    /// One's complement. Operand width equals the result width.
    Invert,
    /// Two's complement. One operand.
    Negate,
    /// Concatenation. The first operand becomes the high-order bits.
    Concat,
    /// Extract bits `[lo, hi)` of the third operand; the first two operands
    /// are known constants `lo` and `hi`.
    Extract,
    /// Unsigned extension. Extend the second operand to the width given by
    /// the first (a known constant), introducing zeros at the msb.
    ZeroExtend,
    /// Signed extension. Extend the second operand to the width given by the
    /// first (a known constant), replicating the most significant bit.
    SignExtend,
    /// Shift left introducing zeros at the lsb; operands are `(shift, x)`.
    Shl0,
    /// Shift left introducing ones at the lsb; operands are `(shift, x)`.
    Shl1,
    /// Shift right introducing zeros at the msb; operands are `(shift, x)`.
    Shr0,
    /// Shift right introducing ones at the msb; operands are `(shift, x)`.
    Shr1,
    /// Arithmetic shift right; operands are `(shift, x)`.
    Asr,
    /// Rotate left; operands are `(amount, x)`.
    Rol,
    /// Rotate right; operands are `(amount, x)`.
    Ror,
    /// Equality. Two operands of the same width; single-bit result.
    Eq,
    /// Inequality. Two operands of the same width; single-bit result.
    Ne,
    /// Equal to zero. One operand; single-bit result.
    IsZero,
    /// If-then-else. Single-bit selector, then two branches of equal width.
    Ite,
    /// Signed multiplication. Result width is the sum of the operand widths.
    SignedMul,
    /// Unsigned multiplication. Result width is the sum of the operand widths.
    UnsignedMul,
    /// Signed division `a / b`. Result width is the width of `a`.
    SignedDiv,
    /// Unsigned division `a / b`. Result width is the width of `a`.
    UnsignedDiv,
    /// Signed modulus `a % b`. Result width is the width of `b`.
    SignedMod,
    /// Unsigned modulus `a % b`. Result width is the width of `b`.
    UnsignedMod,
    /// Least significant set bit position, or zero when no bit is set.
    Lssb,
    /// Most significant set bit position, or zero when no bit is set.
    Mssb,
    /// Sentinel operator. Never constructed by evaluation.
    Noop,
}

impl Op {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Op::Add => "add",
            Op::BoolAnd => "and",
            Op::BoolOr => "or",
            Op::BitAnd => "bv-and",
            Op::BitOr => "bv-or",
            Op::BitXor => "bv-xor",
            Op::Invert => "invert",
            Op::Negate => "negate",
            Op::Concat => "concat",
            Op::Extract => "extract",
            Op::ZeroExtend => "uextend",
            Op::SignExtend => "sextend",
            Op::Shl0 => "shl0",
            Op::Shl1 => "shl1",
            Op::Shr0 => "shr0",
            Op::Shr1 => "shr1",
            Op::Asr => "asr",
            Op::Rol => "rol",
            Op::Ror => "ror",
            Op::Eq => "eq",
            Op::Ne => "ne",
            Op::IsZero => "zerop",
            Op::Ite => "ite",
            Op::SignedMul => "smul",
            Op::UnsignedMul => "umul",
            Op::SignedDiv => "sdiv",
            Op::UnsignedDiv => "udiv",
            Op::SignedMod => "smod",
            Op::UnsignedMod => "umod",
            Op::Lssb => "lssb",
            Op::Mssb => "mssb",
            Op::Noop => "noop",
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}
