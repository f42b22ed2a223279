use std::fmt;

use log::{debug, trace};

use symexpr::{Expr, ExprRef, Op, RenameMap, Value};

use crate::mem::MemoryCell;
use crate::state::{N_FLAGS, N_GPRS, N_SEGREGS, State};

/// An instruction record as delivered by the decoding front end.
///
/// The policy needs nothing but the address; opcode and operand shape are
/// consumed by the dispatcher that drives the policy's primitives.
pub trait Instruction {
    /// Address of the first byte of the encoded instruction.
    fn address(&self) -> u32;
}

/// Classification of a memory address against the stack and frame pointers.
///
/// Used when popped-memory discarding is enabled: references made through
/// the stack pointer are assumed not to alias references made through the
/// frame pointer, and neither aliases memory referenced any other way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryReferenceType {
    StackPtr,
    FramePtr,
    OtherPtr,
}

fn mask_u64(width: usize) -> u64 {
    if width == 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Extracts bits `[lo, hi)` of `expr`, folding known constants and eliding
/// the whole-width extraction.
fn extract_expr(lo: usize, hi: usize, expr: &ExprRef) -> ExprRef {
    debug_assert!(lo < hi && hi <= expr.width());
    if let Some(bits) = expr.as_known() {
        return Expr::known(hi - lo, bits >> lo);
    }
    if lo == 0 && hi == expr.width() {
        return expr.clone();
    }
    Expr::operation(
        hi - lo,
        Op::Extract,
        [
            Expr::known(32, lo as u64),
            Expr::known(32, hi as u64),
            expr.clone(),
        ],
    )
}

/// Extends or shrinks `expr` to `to` bits, adding zeros at the msb. Known
/// constants fold; same-width extension returns the input unchanged;
/// narrowing extracts the low bits.
fn uextend_expr(expr: &ExprRef, to: usize) -> ExprRef {
    if let Some(bits) = expr.as_known() {
        return Expr::known(to, bits);
    }
    let from = expr.width();
    if to == from {
        expr.clone()
    } else if to < from {
        extract_expr(0, to, expr)
    } else {
        Expr::operation(
            to,
            Op::ZeroExtend,
            [Expr::known(32, to as u64), expr.clone()],
        )
    }
}

/// Extends or shrinks `expr` to `to` bits, replicating the msb. Known
/// constants fold; same-width extension returns the input unchanged;
/// narrowing extracts the low bits.
fn sextend_expr(expr: &ExprRef, to: usize) -> ExprRef {
    let from = expr.width();
    if let Some(bits) = expr.as_known() {
        let extended = if to > from && (bits >> (from - 1)) & 1 == 1 {
            bits | !mask_u64(from)
        } else {
            bits
        };
        return Expr::known(to, extended);
    }
    if to == from {
        expr.clone()
    } else if to < from {
        extract_expr(0, to, expr)
    } else {
        Expr::operation(
            to,
            Op::SignExtend,
            [Expr::known(32, to as u64), expr.clone()],
        )
    }
}

/// Adds two equal-width expressions. Two known operands fold to their sum
/// modulo the width, and adding zero returns the other operand unchanged.
fn add_expr(a: &ExprRef, b: &ExprRef) -> ExprRef {
    let width = a.width();
    debug_assert_eq!(width, b.width());
    if let Some(x) = a.as_known() {
        if let Some(y) = b.as_known() {
            return Expr::known(width, x.wrapping_add(y));
        }
        if x == 0 {
            return b.clone();
        }
    } else if b.as_known() == Some(0) {
        return a.clone();
    }
    Expr::operation(width, Op::Add, [a.clone(), b.clone()])
}

fn binary<const W: usize>(op: Op, a: &Value<W>, b: &Value<W>) -> Value<W> {
    Value::from_expr(Expr::operation(W, op, [a.expr().clone(), b.expr().clone()]))
}

fn shifted<const W: usize, const S: usize>(op: Op, a: &Value<W>, amount: &Value<S>) -> Value<W> {
    Value::from_expr(Expr::operation(
        W,
        op,
        [amount.expr().clone(), a.expr().clone()],
    ))
}

fn reference_type(
    gprs: &[Value<32>; N_GPRS],
    sp: usize,
    fp: usize,
    addr: &Value<32>,
) -> MemoryReferenceType {
    if let Some(id) = addr.expr().unknown_id() {
        if gprs[sp].expr().unknown_id() == Some(id) {
            return MemoryReferenceType::StackPtr;
        }
        if gprs[fp].expr().unknown_id() == Some(id) {
            return MemoryReferenceType::FramePtr;
        }
        return MemoryReferenceType::OtherPtr;
    }
    if addr == &gprs[sp] {
        return MemoryReferenceType::StackPtr;
    }
    if addr == &gprs[fp] {
        return MemoryReferenceType::FramePtr;
    }
    MemoryReferenceType::OtherPtr
}

/// The symbolic semantic policy: the complete set of primitive operations an
/// opcode dispatcher needs to emulate one basic block over an expression
/// tree value domain.
///
/// The policy holds two machine states. `cur` is updated by every primitive;
/// `orig` is the snapshot of the machine before the first instruction.
/// Reading memory never seen before retroactively materializes the implicit
/// initial value in `orig`, so the original state observed through any fixed
/// read pattern behaves as an immutable snapshot even though its memory
/// vector grows on demand. Instances must not be shared between threads.
///
/// Between construction and the first [`Policy::start_instruction`] the two
/// states are identical and share variable identifiers; registers seeded in
/// that window become part of the original snapshot.
pub struct Policy {
    orig: State,
    cur: State,
    cur_insn_addr: Option<u32>,
    discard_popped_memory: bool,
    ninsns: usize,
    sp_register: usize,
    fp_register: usize,
}

impl Policy {
    pub fn new() -> Self {
        let cur = State::new();
        Self {
            orig: cur.clone(),
            cur,
            cur_insn_addr: None,
            discard_popped_memory: false,
            ninsns: 0,
            sp_register: 4,
            fp_register: 5,
        }
    }

    /// The current machine state.
    pub fn state(&self) -> &State {
        &self.cur
    }

    /// The current machine state, mutably. Intended for seeding registers
    /// before the first instruction and for inspection afterwards.
    pub fn state_mut(&mut self) -> &mut State {
        &mut self.cur
    }

    /// The machine state as of the start of the first instruction.
    pub fn original_state(&self) -> &State {
        &self.orig
    }

    /// The number of instructions started so far.
    pub fn instruction_count(&self) -> usize {
        self.ninsns
    }

    /// The address of the instruction currently being processed, between
    /// [`Policy::start_instruction`] and [`Policy::finish_instruction`].
    pub fn current_instruction_address(&self) -> Option<u32> {
        self.cur_insn_addr
    }

    /// Controls whether memory below the stack pointer is discarded after
    /// each instruction. Off by default.
    pub fn set_discard_popped_memory(&mut self, discard: bool) {
        self.discard_popped_memory = discard;
    }

    pub fn discard_popped_memory(&self) -> bool {
        self.discard_popped_memory
    }

    /// Assigns the general-purpose register index treated as the stack
    /// pointer by the address classification. Defaults to 4.
    pub fn set_stack_pointer_register(&mut self, r: usize) {
        assert!(r < N_GPRS, "general-purpose register {r} out of range");
        self.sp_register = r;
    }

    /// Assigns the general-purpose register index treated as the frame
    /// pointer by the address classification. Defaults to 5.
    pub fn set_frame_pointer_register(&mut self, r: usize) {
        assert!(r < N_GPRS, "general-purpose register {r} out of range");
        self.fp_register = r;
    }

    /// Begins an instruction: points `ip` at the instruction and, on the
    /// first instruction only, snapshots the current state as the original
    /// state so that registers seeded beforehand are part of the snapshot.
    pub fn start_instruction(&mut self, insn: &impl Instruction) {
        trace!(
            "starting instruction {n} at {address:#010x}",
            n = self.ninsns,
            address = insn.address()
        );
        self.cur.ip = Value::number(insn.address() as u64);
        if self.ninsns == 0 {
            self.orig = self.cur.clone();
        }
        self.ninsns += 1;
        self.cur_insn_addr = Some(insn.address());
    }

    /// Ends an instruction. With popped-memory discarding enabled, cells
    /// provably below a known stack pointer are evicted.
    pub fn finish_instruction(&mut self, _insn: &impl Instruction) {
        if self.discard_popped_memory {
            self.discard_popped_cells();
        }
        self.cur_insn_addr = None;
    }

    /// Evicts cells whose address is provably below the stack pointer. Only
    /// cells with a known constant address compared against a known constant
    /// stack pointer qualify; everything else is retained.
    fn discard_popped_cells(&mut self) {
        let Some(sp) = self.cur.gprs[self.sp_register].as_known() else {
            return;
        };
        self.cur.mem.retain(|cell| {
            let popped = cell.address().as_known().is_some_and(|address| address < sp);
            if popped {
                trace!("discarding popped {cell}");
            }
            !popped
        });
    }

    /*
     * Value constructors
     */

    /// The single-bit true value.
    pub fn true_(&self) -> Value<1> {
        Value::number(1)
    }

    /// The single-bit false value.
    pub fn false_(&self) -> Value<1> {
        Value::number(0)
    }

    /// A single-bit value about which nothing is known.
    pub fn undefined_(&self) -> Value<1> {
        Value::unknown()
    }

    /// A known constant of width `W`.
    pub fn number<const W: usize>(&self, n: u64) -> Value<W> {
        Value::number(n)
    }

    /*
     * Register, flag, and instruction pointer access
     */

    pub fn read_gpr(&self, r: usize) -> Value<32> {
        assert!(r < N_GPRS, "general-purpose register {r} out of range");
        self.cur.gprs[r].clone()
    }

    pub fn write_gpr(&mut self, r: usize, value: Value<32>) {
        assert!(r < N_GPRS, "general-purpose register {r} out of range");
        self.cur.gprs[r] = value;
    }

    pub fn read_segreg(&self, sr: usize) -> Value<16> {
        assert!(sr < N_SEGREGS, "segment register {sr} out of range");
        self.cur.segregs[sr].clone()
    }

    pub fn write_segreg(&mut self, sr: usize, value: Value<16>) {
        assert!(sr < N_SEGREGS, "segment register {sr} out of range");
        self.cur.segregs[sr] = value;
    }

    pub fn read_flag(&self, f: usize) -> Value<1> {
        assert!(f < N_FLAGS, "flag {f} out of range");
        self.cur.flags[f].clone()
    }

    pub fn write_flag(&mut self, f: usize, value: Value<1>) {
        assert!(f < N_FLAGS, "flag {f} out of range");
        self.cur.flags[f] = value;
    }

    pub fn read_ip(&self) -> Value<32> {
        self.cur.ip.clone()
    }

    pub fn write_ip(&mut self, value: Value<32>) {
        self.cur.ip = value;
    }

    /*
     * Memory access
     */

    /// Reads `W` bits of memory. The segment register is accepted for future
    /// segmented addressing and currently unused; the `cond` guard is
    /// plumbed through for a conditional-access refinement and currently
    /// ignored (the read is unconditional).
    ///
    /// Reading an address returns the same value as long as no intervening
    /// write could alias it. The first read of an address also records the
    /// value in the original state, retroactively defining the memory's
    /// initial contents.
    pub fn read_memory<const W: usize>(
        &mut self,
        _segreg: usize,
        addr: &Value<32>,
        _cond: &Value<1>,
    ) -> Value<W> {
        Self::mem_read(&mut self.cur, Some(&mut self.orig), addr)
    }

    /// Writes `W` bits of memory. Existing cells that may alias the written
    /// address are clobbered; a must-aliased cell is replaced outright. The
    /// segment register and `cond` guard are treated as in
    /// [`Policy::read_memory`].
    pub fn write_memory<const W: usize>(
        &mut self,
        _segreg: usize,
        addr: &Value<32>,
        data: &Value<W>,
        _cond: &Value<1>,
    ) {
        self.mem_write(addr, data);
    }

    /// Reads `W` bits from the original state's memory, materializing the
    /// implicit initial value if the address has never been seen. Reading
    /// the original state never consults the current state.
    pub fn read_original_memory<const W: usize>(&mut self, addr: &Value<32>) -> Value<W> {
        Self::mem_read(&mut self.orig, None, addr)
    }

    /// Classifies `addr` against the current stack and frame pointer
    /// registers: an address sharing the pointer's unknown variable, or
    /// structurally equal to it, references that pointer's region.
    pub fn memory_reference_type(&self, addr: &Value<32>) -> MemoryReferenceType {
        reference_type(&self.cur.gprs, self.sp_register, self.fp_register, addr)
    }

    fn mem_read<const W: usize>(
        state: &mut State,
        orig: Option<&mut State>,
        addr: &Value<32>,
    ) -> Value<W> {
        const {
            assert!(W == 8 || W == 16 || W == 32);
        }
        fn narrowed<const W: usize>(data: &Value<32>) -> Value<W> {
            Value::from_expr(uextend_expr(data.expr(), W))
        }

        let probe = MemoryCell::new(addr.clone(), Value::unknown(), W / 8);
        let mut aliased = false;

        for cell in state.mem.iter_mut() {
            if probe.must_alias(cell) {
                if cell.is_clobbered() {
                    // The stored value was invalidated by an aliasing
                    // write; this read pins a fresh value.
                    cell.clear_clobbered();
                    *cell.data_mut() = probe.data().clone();
                    return narrowed(probe.data());
                }
                return narrowed(cell.data());
            } else if probe.may_alias(cell) && cell.is_written() {
                aliased = true;
            }
        }

        if let Some(orig) = orig {
            if !aliased {
                // Not present and not aliased by any write in this state, so
                // the initial value applies: take it from the original state
                // or define it there now.
                if let Some(cell) = orig.mem.iter().find(|cell| probe.must_alias(cell)) {
                    debug_assert!(!cell.is_clobbered() && !cell.is_written());
                    let cell = cell.clone();
                    let result = narrowed(cell.data());
                    state.mem.push(cell);
                    return result;
                }
                orig.mem.push(probe.clone());
            }
        }

        let result = narrowed(probe.data());
        state.mem.push(probe);
        result
    }

    fn mem_write<const W: usize>(&mut self, addr: &Value<32>, data: &Value<W>) {
        const {
            assert!(W == 8 || W == 16 || W == 32);
        }
        let mut cell = MemoryCell::new(addr.clone(), Value::from_expr(uextend_expr(data.expr(), 32)), W / 8);
        cell.set_written();

        let State { gprs, mem, .. } = &mut self.cur;
        let category = reference_type(gprs, self.sp_register, self.fp_register, addr);
        let mut saved = false;

        for existing in mem.iter_mut() {
            if cell.must_alias(existing) {
                *existing = cell.clone();
                saved = true;
            } else if self.discard_popped_memory
                && category
                    != reference_type(gprs, self.sp_register, self.fp_register, existing.address())
            {
                // Stack-, frame-, and other-pointer references are assumed
                // pairwise disjoint while popped memory is being discarded.
            } else if cell.may_alias(existing) {
                debug!("clobbering {existing}");
                existing.set_clobbered();
            }
        }

        if !saved {
            mem.push(cell);
        }
    }

    /*
     * Arithmetic, bitwise, shift, and comparison primitives
     */

    /// Adds two values. Known operands fold to their sum modulo the width,
    /// and adding zero returns the other operand unchanged.
    pub fn add<const W: usize>(&self, a: &Value<W>, b: &Value<W>) -> Value<W> {
        Value::from_expr(add_expr(a.expr(), b.expr()))
    }

    /// Adds two values and a carry-in bit, returning the sum and the
    /// per-bit carry-out vector: bit `i` of the carry is the carry produced
    /// into bit `i + 1` of the sum.
    pub fn add_with_carries<const W: usize>(
        &self,
        a: &Value<W>,
        b: &Value<W>,
        carry_in: &Value<1>,
    ) -> (Value<W>, Value<W>) {
        const {
            assert!(W >= 1 && W < 64);
        }
        let wide = W + 1;
        let aa = uextend_expr(a.expr(), wide);
        let bb = uextend_expr(b.expr(), wide);
        let cc = uextend_expr(carry_in.expr(), wide);
        let wide_sum = add_expr(&aa, &add_expr(&bb, &cc));
        let toggles = Expr::operation(
            wide,
            Op::BitXor,
            [aa, Expr::operation(wide, Op::BitXor, [bb, wide_sum])],
        );
        let carry_out = Value::from_expr(extract_expr(1, wide, &toggles));

        let carry = uextend_expr(carry_in.expr(), W);
        let sum = Value::from_expr(add_expr(a.expr(), &add_expr(b.expr(), &carry)));
        (sum, carry_out)
    }

    /// Bitwise AND of two values.
    pub fn and<const W: usize>(&self, a: &Value<W>, b: &Value<W>) -> Value<W> {
        binary(Op::BitAnd, a, b)
    }

    /// Bitwise OR of two values.
    pub fn or<const W: usize>(&self, a: &Value<W>, b: &Value<W>) -> Value<W> {
        binary(Op::BitOr, a, b)
    }

    /// Bitwise exclusive OR of two values.
    pub fn xor<const W: usize>(&self, a: &Value<W>, b: &Value<W>) -> Value<W> {
        binary(Op::BitXor, a, b)
    }

    /// Boolean conjunction of two single-bit values.
    pub fn boolean_and(&self, a: &Value<1>, b: &Value<1>) -> Value<1> {
        binary(Op::BoolAnd, a, b)
    }

    /// Boolean disjunction of two single-bit values.
    pub fn boolean_or(&self, a: &Value<1>, b: &Value<1>) -> Value<1> {
        binary(Op::BoolOr, a, b)
    }

    /// One's complement. A known operand folds.
    pub fn invert<const W: usize>(&self, a: &Value<W>) -> Value<W> {
        if let Some(bits) = a.as_known() {
            return Value::number(!bits);
        }
        Value::from_expr(Expr::operation(W, Op::Invert, [a.expr().clone()]))
    }

    /// Two's complement.
    pub fn negate<const W: usize>(&self, a: &Value<W>) -> Value<W> {
        Value::from_expr(Expr::operation(W, Op::Negate, [a.expr().clone()]))
    }

    /// Concatenates `high` and `low`; `high` supplies the high-order bits.
    pub fn concat<const HI: usize, const LO: usize, const OUT: usize>(
        &self,
        high: &Value<HI>,
        low: &Value<LO>,
    ) -> Value<OUT> {
        const {
            assert!(OUT == HI + LO);
        }
        Value::from_expr(Expr::operation(
            OUT,
            Op::Concat,
            [high.expr().clone(), low.expr().clone()],
        ))
    }

    /// Extracts bits `[LO, HI)` of `a`, shifted to the low-order positions.
    pub fn extract<const LO: usize, const HI: usize, const W: usize, const OUT: usize>(
        &self,
        a: &Value<W>,
    ) -> Value<OUT> {
        const {
            assert!(LO < HI && HI <= W && OUT == HI - LO);
        }
        Value::from_expr(extract_expr(LO, HI, a.expr()))
    }

    /// Extends or shrinks `a` to `TO` bits by adding or removing high-order
    /// bits; added bits are zeros. Same-width extension returns the operand
    /// unchanged.
    pub fn unsigned_extend<const FROM: usize, const TO: usize>(
        &self,
        a: &Value<FROM>,
    ) -> Value<TO> {
        Value::from_expr(uextend_expr(a.expr(), TO))
    }

    /// Extends `a` to `TO` bits by replicating the most significant bit, or
    /// shrinks it by removing high-order bits. Same-width extension returns
    /// the operand unchanged.
    pub fn signed_extend<const FROM: usize, const TO: usize>(&self, a: &Value<FROM>) -> Value<TO> {
        Value::from_expr(sextend_expr(a.expr(), TO))
    }

    /// Shifts `a` left by `amount` bits, introducing zeros at the lsb.
    pub fn shift_left<const W: usize, const S: usize>(
        &self,
        a: &Value<W>,
        amount: &Value<S>,
    ) -> Value<W> {
        shifted(Op::Shl0, a, amount)
    }

    /// Shifts `a` left by `amount` bits, introducing ones at the lsb.
    pub fn shift_left_ones<const W: usize, const S: usize>(
        &self,
        a: &Value<W>,
        amount: &Value<S>,
    ) -> Value<W> {
        shifted(Op::Shl1, a, amount)
    }

    /// Shifts `a` right by `amount` bits, introducing zeros at the msb.
    pub fn shift_right<const W: usize, const S: usize>(
        &self,
        a: &Value<W>,
        amount: &Value<S>,
    ) -> Value<W> {
        shifted(Op::Shr0, a, amount)
    }

    /// Shifts `a` right by `amount` bits, introducing ones at the msb.
    pub fn shift_right_ones<const W: usize, const S: usize>(
        &self,
        a: &Value<W>,
        amount: &Value<S>,
    ) -> Value<W> {
        shifted(Op::Shr1, a, amount)
    }

    /// Shifts `a` right by `amount` bits, replicating the sign bit.
    pub fn shift_right_arithmetic<const W: usize, const S: usize>(
        &self,
        a: &Value<W>,
        amount: &Value<S>,
    ) -> Value<W> {
        shifted(Op::Asr, a, amount)
    }

    /// Rotates the bits of `a` left by `amount`.
    pub fn rotate_left<const W: usize, const S: usize>(
        &self,
        a: &Value<W>,
        amount: &Value<S>,
    ) -> Value<W> {
        shifted(Op::Rol, a, amount)
    }

    /// Rotates the bits of `a` right by `amount`.
    pub fn rotate_right<const W: usize, const S: usize>(
        &self,
        a: &Value<W>,
        amount: &Value<S>,
    ) -> Value<W> {
        shifted(Op::Ror, a, amount)
    }

    /// Single-bit equality of two equal-width values.
    pub fn equals<const W: usize>(&self, a: &Value<W>, b: &Value<W>) -> Value<1> {
        Value::from_expr(Expr::operation(
            1,
            Op::Eq,
            [a.expr().clone(), b.expr().clone()],
        ))
    }

    /// Single-bit inequality of two equal-width values.
    pub fn not_equals<const W: usize>(&self, a: &Value<W>, b: &Value<W>) -> Value<1> {
        Value::from_expr(Expr::operation(
            1,
            Op::Ne,
            [a.expr().clone(), b.expr().clone()],
        ))
    }

    /// A single bit that is set iff `a` is zero.
    pub fn equal_to_zero<const W: usize>(&self, a: &Value<W>) -> Value<1> {
        Value::from_expr(Expr::operation(1, Op::IsZero, [a.expr().clone()]))
    }

    /// Selects `if_true` or `if_false` by the single-bit selector. No
    /// constant folding is performed on the selector.
    pub fn ite<const W: usize>(
        &self,
        sel: &Value<1>,
        if_true: &Value<W>,
        if_false: &Value<W>,
    ) -> Value<W> {
        Value::from_expr(Expr::operation(
            W,
            Op::Ite,
            [
                sel.expr().clone(),
                if_true.expr().clone(),
                if_false.expr().clone(),
            ],
        ))
    }

    /// Position of the least significant set bit, or zero when none is set.
    pub fn least_significant_set_bit<const W: usize>(&self, a: &Value<W>) -> Value<W> {
        Value::from_expr(Expr::operation(W, Op::Lssb, [a.expr().clone()]))
    }

    /// Position of the most significant set bit, or zero when none is set.
    pub fn most_significant_set_bit<const W: usize>(&self, a: &Value<W>) -> Value<W> {
        Value::from_expr(Expr::operation(W, Op::Mssb, [a.expr().clone()]))
    }

    /// Multiplies two signed values into their combined width.
    pub fn signed_multiply<const A: usize, const B: usize, const OUT: usize>(
        &self,
        a: &Value<A>,
        b: &Value<B>,
    ) -> Value<OUT> {
        const {
            assert!(OUT == A + B);
        }
        Value::from_expr(Expr::operation(
            OUT,
            Op::SignedMul,
            [a.expr().clone(), b.expr().clone()],
        ))
    }

    /// Multiplies two unsigned values into their combined width.
    pub fn unsigned_multiply<const A: usize, const B: usize, const OUT: usize>(
        &self,
        a: &Value<A>,
        b: &Value<B>,
    ) -> Value<OUT> {
        const {
            assert!(OUT == A + B);
        }
        Value::from_expr(Expr::operation(
            OUT,
            Op::UnsignedMul,
            [a.expr().clone(), b.expr().clone()],
        ))
    }

    /// Divides two signed values; the result has the dividend's width. A
    /// zero divisor yields an unconstrained symbolic result; guarding is
    /// the caller's responsibility.
    pub fn signed_divide<const A: usize, const B: usize>(
        &self,
        a: &Value<A>,
        b: &Value<B>,
    ) -> Value<A> {
        Value::from_expr(Expr::operation(
            A,
            Op::SignedDiv,
            [a.expr().clone(), b.expr().clone()],
        ))
    }

    /// Divides two unsigned values; the result has the dividend's width. A
    /// zero divisor is treated as in [`Policy::signed_divide`].
    pub fn unsigned_divide<const A: usize, const B: usize>(
        &self,
        a: &Value<A>,
        b: &Value<B>,
    ) -> Value<A> {
        Value::from_expr(Expr::operation(
            A,
            Op::UnsignedDiv,
            [a.expr().clone(), b.expr().clone()],
        ))
    }

    /// Signed modulus `a % b`; the result has the divisor's width.
    pub fn signed_modulo<const A: usize, const B: usize>(
        &self,
        a: &Value<A>,
        b: &Value<B>,
    ) -> Value<B> {
        Value::from_expr(Expr::operation(
            B,
            Op::SignedMod,
            [a.expr().clone(), b.expr().clone()],
        ))
    }

    /// Unsigned modulus `a % b`; the result has the divisor's width.
    pub fn unsigned_modulo<const A: usize, const B: usize>(
        &self,
        a: &Value<A>,
        b: &Value<B>,
    ) -> Value<B> {
        Value::from_expr(Expr::operation(
            B,
            Op::UnsignedMod,
            [a.expr().clone(), b.expr().clone()],
        ))
    }

    /*
     * Control hooks
     */

    /// Called for CALL instructions before the new value reaches `ip`.
    pub fn filter_call_target(&self, a: Value<32>) -> Value<32> {
        a
    }

    /// Called for RET instructions before `ip` is adjusted.
    pub fn filter_return_target(&self, a: Value<32>) -> Value<32> {
        a
    }

    /// Called for indirect JMP instructions before `ip` is adjusted.
    pub fn filter_indirect_jump_target(&self, a: Value<32>) -> Value<32> {
        a
    }

    /// Called for the HLT instruction.
    pub fn hlt(&mut self) {}

    /// Called for the RDTSC instruction.
    pub fn rdtsc(&mut self) -> Value<64> {
        Value::number(0)
    }

    /// Called for the INT instruction: the handler may do anything, so the
    /// entire machine state is reset to fresh unknowns.
    pub fn interrupt(&mut self, num: u8) {
        trace!("interrupt {num}: resetting machine state");
        self.cur.reset();
    }

    /*
     * State comparison and fingerprinting
     */

    /// The memory cells of `state` that are pertinent to a state-equality
    /// comparison: written, not clobbered, and holding a value that differs
    /// from the original state's value at a must-aliased address. Memory
    /// that has only been read never qualifies.
    pub fn memory_for_equality<'a>(&'a self, state: &'a State) -> Vec<&'a MemoryCell> {
        state
            .mem
            .iter()
            .filter(|cell| cell.is_written() && !cell.is_clobbered())
            .filter(|cell| {
                !self
                    .orig
                    .mem
                    .iter()
                    .any(|original| cell.must_alias(original) && cell.data() == original.data())
            })
            .collect()
    }

    /// Compares two states: componentwise register equality plus pointwise
    /// correspondence of the equality-pertinent memory cells, matched by
    /// must-alias without regard to insertion order.
    pub fn equal_states(&self, a: &State, b: &State) -> bool {
        if !a.equal_registers(b) {
            return false;
        }
        fn matched(x: &MemoryCell, candidates: &[&MemoryCell]) -> bool {
            candidates
                .iter()
                .any(|y| x.must_alias(y) && x.data() == y.data())
        }
        let cells_a = self.memory_for_equality(a);
        let cells_b = self.memory_for_equality(b);
        cells_a.len() == cells_b.len()
            && cells_a.iter().all(|cell| matched(cell, &cells_b))
            && cells_b.iter().all(|cell| matched(cell, &cells_a))
    }

    /// The difference between the current state and the original snapshot:
    /// registers and flags that changed, plus the equality-pertinent memory
    /// cells. The rendering renames variables to first-use ordinals, so it
    /// is stable across runs and suitable for hashing.
    pub fn diff(&self) -> StateDiff<'_> {
        StateDiff { policy: self }
    }

    /// Lowercase hex SHA-1 of the canonical state-diff rendering, for
    /// deduplication and regression baselines. The empty string when the
    /// crate is built without the `fingerprint` feature.
    #[cfg(feature = "fingerprint")]
    pub fn fingerprint(&self) -> String {
        use std::fmt::Write as _;

        use sha1::{Digest, Sha1};

        let mut hasher = Sha1::new();
        hasher.update(self.diff().to_string().as_bytes());
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(2 * digest.len());
        for byte in digest {
            write!(hex, "{byte:02x}").expect("writing to a string cannot fail");
        }
        hex
    }

    /// Lowercase hex SHA-1 of the canonical state-diff rendering, for
    /// deduplication and regression baselines. The empty string when the
    /// crate is built without the `fingerprint` feature.
    #[cfg(not(feature = "fingerprint"))]
    pub fn fingerprint(&self) -> String {
        String::new()
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.cur.fmt_with(f, None)
    }
}

/// Displays the delta between a policy's current and original states. See
/// [`Policy::diff`].
pub struct StateDiff<'a> {
    policy: &'a Policy,
}

impl fmt::Display for StateDiff<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn entry(
            f: &mut fmt::Formatter<'_>,
            rmap: &mut RenameMap,
            name: &str,
            old: &ExprRef,
            new: &ExprRef,
        ) -> fmt::Result {
            write!(f, "{name}: ")?;
            old.fmt_with(f, Some(rmap))?;
            f.write_str(" -> ")?;
            new.fmt_with(f, Some(rmap))?;
            writeln!(f)
        }

        let orig = &self.policy.orig;
        let cur = &self.policy.cur;
        let mut rmap = RenameMap::new();

        if orig.ip != cur.ip {
            entry(f, &mut rmap, "ip", orig.ip.expr(), cur.ip.expr())?;
        }
        for i in 0..N_GPRS {
            if orig.gprs[i] != cur.gprs[i] {
                entry(
                    f,
                    &mut rmap,
                    &format!("gpr[{i}]"),
                    orig.gprs[i].expr(),
                    cur.gprs[i].expr(),
                )?;
            }
        }
        for i in 0..N_SEGREGS {
            if orig.segregs[i] != cur.segregs[i] {
                entry(
                    f,
                    &mut rmap,
                    &format!("segreg[{i}]"),
                    orig.segregs[i].expr(),
                    cur.segregs[i].expr(),
                )?;
            }
        }
        for i in 0..N_FLAGS {
            if orig.flags[i] != cur.flags[i] {
                entry(
                    f,
                    &mut rmap,
                    &format!("flag[{i}]"),
                    orig.flags[i].expr(),
                    cur.flags[i].expr(),
                )?;
            }
        }
        for cell in self.policy.memory_for_equality(cur) {
            write!(f, "memory[")?;
            cell.address().expr().fmt_with(f, Some(&mut rmap))?;
            write!(f, "; {} bytes] = ", cell.nbytes())?;
            cell.data().expr().fmt_with(f, Some(&mut rmap))?;
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Insn(u32);

    impl Instruction for Insn {
        fn address(&self) -> u32 {
            self.0
        }
    }

    #[test]
    fn add_of_known_values_folds() {
        let mut policy = Policy::new();
        policy.write_gpr(0, policy.number(5));
        policy.write_gpr(1, policy.number(7));
        let sum = policy.add(&policy.read_gpr(0), &policy.read_gpr(1));
        policy.write_gpr(0, sum);

        assert!(policy.read_gpr(0).is_known());
        assert_eq!(policy.read_gpr(0).value(), 12);
    }

    #[test]
    fn add_folds_modulo_width() {
        let policy = Policy::new();
        let sum = policy.add(&policy.number::<8>(0xff), &policy.number::<8>(1));
        assert_eq!(sum.value(), 0);
    }

    #[test]
    fn adding_zero_is_identity() {
        let policy = Policy::new();
        let x = Value::<32>::unknown();
        let zero = policy.number::<32>(0);
        assert_eq!(policy.add(&x, &zero), x);
        assert_eq!(policy.add(&zero, &x), x);
    }

    #[test]
    fn invert_folds_known_values() {
        let policy = Policy::new();
        let inverted = policy.invert(&policy.number::<8>(0x0f));
        assert_eq!(inverted.value(), 0xf0);

        let x = Value::<8>::unknown();
        assert!(!policy.invert(&x).is_known());
    }

    #[test]
    fn same_width_extension_is_identity() {
        let policy = Policy::new();
        let x = Value::<32>::unknown();
        assert_eq!(policy.unsigned_extend::<32, 32>(&x), x);
        assert_eq!(policy.signed_extend::<32, 32>(&x), x);
    }

    #[test]
    fn extension_folds_known_values() {
        let policy = Policy::new();
        let zext: Value<16> = policy.unsigned_extend(&policy.number::<8>(0xff));
        assert_eq!(zext.value(), 0x00ff);

        let sext: Value<16> = policy.signed_extend(&policy.number::<8>(0x80));
        assert_eq!(sext.value(), 0xff80);

        let positive: Value<16> = policy.signed_extend(&policy.number::<8>(0x7f));
        assert_eq!(positive.value(), 0x007f);
    }

    #[test]
    fn narrowing_extension_keeps_low_bits() {
        let policy = Policy::new();
        let narrowed: Value<8> = policy.unsigned_extend(&policy.number::<16>(0xdead));
        assert_eq!(narrowed.value(), 0xad);

        let x = Value::<16>::unknown();
        let narrowed: Value<8> = policy.unsigned_extend(&x);
        assert_eq!(narrowed.expr().op(), Some(Op::Extract));
        assert_eq!(narrowed.width(), 8);
    }

    #[test]
    fn extract_folds_known_values() {
        let policy = Policy::new();
        let nibble: Value<4> = policy.extract::<4, 8, 16, 4>(&policy.number::<16>(0xabcd));
        assert_eq!(nibble.value(), 0xc);
    }

    #[test]
    fn add_with_carries_folds_known_sum() {
        let policy = Policy::new();
        let (sum, carries) = policy.add_with_carries(
            &policy.number::<8>(0xff),
            &policy.number::<8>(1),
            &policy.false_(),
        );
        assert_eq!(sum.value(), 0);
        assert_eq!(carries.width(), 8);
    }

    #[test]
    fn ite_does_not_fold() {
        let policy = Policy::new();
        let ite = policy.ite(
            &policy.true_(),
            &policy.number::<32>(1),
            &policy.number::<32>(2),
        );
        assert!(!ite.is_known());
        assert_eq!(ite.expr().op(), Some(Op::Ite));
    }

    #[test]
    fn multiply_widens() {
        let policy = Policy::new();
        let a = Value::<16>::unknown();
        let b = Value::<16>::unknown();
        let product: Value<32> = policy.unsigned_multiply(&a, &b);
        assert_eq!(product.width(), 32);
    }

    #[test]
    fn repeated_reads_return_the_same_value() {
        let mut policy = Policy::new();
        let addr = policy.number::<32>(0x2000);
        let cond = policy.true_();
        let first: Value<32> = policy.read_memory(0, &addr, &cond);
        let second: Value<32> = policy.read_memory(0, &addr, &cond);
        assert_eq!(first, second);

        // The first read retroactively defines the initial memory value
        assert_eq!(policy.original_state().memory().len(), 1);
        assert_eq!(policy.state().memory().len(), 1);
    }

    #[test]
    fn original_reads_and_current_reads_see_the_same_initial_value() {
        let mut policy = Policy::new();
        let addr = policy.number::<32>(0x2000);
        let initial: Value<32> = policy.read_original_memory(&addr);
        assert_eq!(policy.original_state().memory().len(), 1);
        assert!(policy.state().memory().is_empty());

        // A later read through the current state picks up the same value
        let cond = policy.true_();
        let read: Value<32> = policy.read_memory(0, &addr, &cond);
        assert_eq!(read, initial);
        assert_eq!(policy.state().memory().len(), 1);
    }

    #[test]
    fn read_after_must_aliased_write_returns_written_value() {
        let mut policy = Policy::new();
        let addr = policy.number::<32>(0x1000);
        let data = policy.number::<32>(0xdead);
        let cond = policy.true_();
        policy.write_memory(0, &addr, &data, &cond);

        let read: Value<32> = policy.read_memory(0, &addr, &cond);
        assert_eq!(read, data);

        // Writes never propagate into the original state
        assert!(policy.original_state().memory().is_empty());
    }

    #[test]
    fn write_to_unknown_address_clobbers_aliases() {
        let mut policy = Policy::new();
        let addr = policy.number::<32>(0x1000);
        let cond = policy.true_();
        policy.write_memory(0, &addr, &policy.number::<32>(0xdead), &cond);

        // Store through a register whose value is unknown
        policy.write_memory(0, &policy.read_gpr(2), &policy.number::<32>(0xbeef), &cond);

        let reread: Value<32> = policy.read_memory(0, &addr, &cond);
        assert_ne!(reread, policy.number::<32>(0xdead));

        // The fresh value is pinned: the next read sees it again
        let reread_again: Value<32> = policy.read_memory(0, &addr, &cond);
        assert_eq!(reread, reread_again);
    }

    #[test]
    fn must_aliased_write_replaces_in_place() {
        let mut policy = Policy::new();
        let addr = policy.number::<32>(0x1000);
        let cond = policy.true_();
        policy.write_memory(0, &addr, &policy.number::<32>(1), &cond);
        policy.write_memory(0, &addr, &policy.number::<32>(2), &cond);

        assert_eq!(policy.state().memory().len(), 1);
        let read: Value<32> = policy.read_memory(0, &addr, &cond);
        assert_eq!(read.value(), 2);
    }

    #[test]
    fn narrow_accesses_zero_extend_through_memory() {
        let mut policy = Policy::new();
        let addr = policy.number::<32>(0x3000);
        let cond = policy.true_();
        policy.write_memory(0, &addr, &policy.number::<8>(0xab), &cond);

        let read: Value<8> = policy.read_memory(0, &addr, &cond);
        assert_eq!(read.value(), 0xab);
    }

    #[test]
    fn start_instruction_sets_ip_and_snapshots_seeded_state() {
        let mut policy = Policy::new();
        // Seed a register before the first instruction
        policy.write_gpr(0, policy.number(42));

        policy.start_instruction(&Insn(0x8048000));
        assert_eq!(policy.read_ip().value(), 0x8048000);
        assert_eq!(policy.original_state().gpr(0).value(), 42);
        assert_eq!(policy.instruction_count(), 1);
        assert_eq!(policy.current_instruction_address(), Some(0x8048000));

        // A second instruction must not re-snapshot
        policy.write_gpr(0, policy.number(43));
        policy.start_instruction(&Insn(0x8048005));
        policy.finish_instruction(&Insn(0x8048005));
        assert_eq!(policy.original_state().gpr(0).value(), 42);
        assert_eq!(policy.current_instruction_address(), None);
    }

    #[test]
    fn interrupt_resets_machine_state() {
        let mut policy = Policy::new();
        policy.write_gpr(0, policy.number(42));
        let cond = policy.true_();
        policy.write_memory(0, &policy.number::<32>(0x1000), &policy.number::<32>(1), &cond);

        policy.interrupt(3);
        assert!(!policy.read_gpr(0).is_known());
        assert!(policy.state().memory().is_empty());
    }

    #[test]
    fn fresh_states_compare_equal() {
        let policy = Policy::new();
        assert!(policy.equal_states(policy.state(), policy.original_state()));
    }

    #[test]
    fn register_writes_break_state_equality() {
        let mut policy = Policy::new();
        policy.write_gpr(0, policy.number(42));
        assert!(!policy.equal_states(policy.state(), policy.original_state()));
    }

    #[test]
    fn memory_writes_break_state_equality() {
        let mut policy = Policy::new();
        let cond = policy.true_();
        policy.write_memory(0, &policy.number::<32>(0x1000), &policy.number::<32>(1), &cond);
        assert!(!policy.equal_states(policy.state(), policy.original_state()));
    }

    #[test]
    fn writing_back_the_read_value_preserves_state_equality() {
        let mut policy = Policy::new();
        let addr = policy.number::<32>(0x1000);
        let cond = policy.true_();
        let value: Value<32> = policy.read_memory(0, &addr, &cond);
        policy.write_memory(0, &addr, &value, &cond);
        assert!(policy.equal_states(policy.state(), policy.original_state()));
    }

    #[test]
    fn clobbered_cells_are_not_pertinent_to_equality() {
        let mut policy = Policy::new();
        let cond = policy.true_();
        policy.write_memory(0, &policy.number::<32>(0x1000), &policy.number::<32>(1), &cond);
        // Clobber everything with a write through an unknown address
        policy.write_memory(0, &policy.read_gpr(2), &policy.number::<32>(2), &cond);

        let pertinent = policy.memory_for_equality(policy.state());
        assert_eq!(pertinent.len(), 1);
        assert_eq!(pertinent[0].data().value(), 2);
    }

    #[test]
    fn addresses_classify_against_stack_and_frame_pointers() {
        let policy = Policy::new();
        assert_eq!(
            policy.memory_reference_type(&policy.read_gpr(4)),
            MemoryReferenceType::StackPtr
        );
        assert_eq!(
            policy.memory_reference_type(&policy.read_gpr(5)),
            MemoryReferenceType::FramePtr
        );
        assert_eq!(
            policy.memory_reference_type(&policy.read_gpr(0)),
            MemoryReferenceType::OtherPtr
        );
        assert_eq!(
            policy.memory_reference_type(&Value::number(0x1000)),
            MemoryReferenceType::OtherPtr
        );
    }

    #[test]
    fn stack_categories_suppress_clobbering_when_discarding() {
        let mut policy = Policy::new();
        policy.set_discard_popped_memory(true);
        let cond = policy.true_();

        let stack_addr = policy.read_gpr(4);
        let stack_data = policy.number::<32>(0x1111);
        policy.write_memory(0, &stack_addr, &stack_data, &cond);

        // A write through an unrelated register would normally clobber the
        // stack cell; the category carve-out keeps it intact.
        policy.write_memory(0, &policy.read_gpr(2), &policy.number::<32>(0x2222), &cond);

        let reread: Value<32> = policy.read_memory(0, &stack_addr, &cond);
        assert_eq!(reread, stack_data);
    }

    #[test]
    fn discarding_evicts_cells_below_a_known_stack_pointer() {
        let mut policy = Policy::new();
        policy.set_discard_popped_memory(true);
        policy.write_gpr(4, policy.number(0x1000));
        let cond = policy.true_();

        policy.start_instruction(&Insn(0x400000));
        policy.write_memory(0, &policy.number::<32>(0x0ff0), &policy.number::<32>(1), &cond);
        policy.write_memory(0, &policy.number::<32>(0x1010), &policy.number::<32>(2), &cond);
        policy.finish_instruction(&Insn(0x400000));

        let remaining: Vec<_> = policy.state().memory().iter().collect();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].address().value(), 0x1010);
    }

    #[test]
    fn control_hooks() {
        let mut policy = Policy::new();
        let target = Value::<32>::unknown();
        assert_eq!(policy.filter_call_target(target.clone()), target);
        assert_eq!(policy.filter_return_target(target.clone()), target);
        assert_eq!(policy.filter_indirect_jump_target(target.clone()), target);

        policy.hlt();
        let tsc = policy.rdtsc();
        assert_eq!(tsc.value(), 0);
        assert_eq!(tsc.width(), 64);
    }

    #[test]
    fn diff_reports_changed_registers_and_memory() {
        let mut policy = Policy::new();
        policy.write_gpr(3, policy.number(42));
        let cond = policy.true_();
        policy.write_memory(0, &policy.number::<32>(0x1000), &policy.number::<32>(7), &cond);

        let rendered = policy.diff().to_string();
        assert!(rendered.contains("gpr[3]"));
        assert!(rendered.contains("0x2a:32"));
        assert!(rendered.contains("memory[0x1000:32; 4 bytes]"));
        assert!(!rendered.contains("gpr[0]"));
    }

    #[cfg(feature = "fingerprint")]
    #[test]
    fn fingerprints_are_stable_across_runs() {
        let run = || {
            let mut policy = Policy::new();
            policy.start_instruction(&Insn(0x400000));
            policy.write_gpr(0, policy.number(42));
            let cond = policy.true_();
            let addr = policy.number::<32>(0x1000);
            let value: Value<32> = policy.read_memory(0, &addr, &cond);
            let sum = policy.add(&value, &policy.number(4));
            policy.write_memory(0, &addr, &sum, &cond);
            policy.finish_instruction(&Insn(0x400000));
            policy.fingerprint()
        };

        let first = run();
        assert_eq!(first.len(), 40);
        assert_eq!(first, run());

        let mut different = Policy::new();
        different.write_gpr(0, different.number(43));
        assert_ne!(first, different.fingerprint());
    }
}
