use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

use crate::op::Op;
use crate::rename::RenameMap;

/// Maximum bit width an expression may carry. Known constants are stored in a
/// `u64`, so wider nodes cannot represent their folded values.
pub const MAX_WIDTH: usize = 64;

static NEXT_UNKNOWN: AtomicU64 = AtomicU64::new(0);

/// Mask selecting the low `width` bits of a `u64`.
fn mask(width: usize) -> u64 {
    debug_assert!(width > 0 && width <= MAX_WIDTH);
    if width == MAX_WIDTH {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// A node of an expression tree.
///
/// Every node carries a positive bit width that is immutable after
/// construction. Leaves are either known constants (bits above the width are
/// zero) or unknown variables with a process-unique identifier; internal
/// nodes apply an [`Op`] to an ordered list of children. Width relationships
/// between an operator and its children are enforced at construction; a
/// violation is a programming error in the caller and aborts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// A known constant value.
    Known { width: usize, bits: u64 },
    /// An unconstrained variable, unique by identifier.
    Unknown { width: usize, id: u64 },
    /// An operator applied to one or more child expressions.
    Operation {
        width: usize,
        op: Op,
        children: SmallVec<[ExprRef; 3]>,
    },
}

/// A shared handle to an expression node.
///
/// Structurally identical subterms may share one allocation; sharing is a
/// transparent optimization and never observable through the API. Equality is
/// structural, with pointer identity as a fast path.
#[derive(Debug, Clone)]
pub struct ExprRef(Rc<Expr>);

impl Expr {
    /// Creates a fresh unknown of the given width. Each call yields a
    /// distinct identifier.
    pub fn unknown(width: usize) -> ExprRef {
        assert!(width > 0 && width <= MAX_WIDTH, "invalid width {width}");
        let id = NEXT_UNKNOWN.fetch_add(1, Ordering::SeqCst);
        ExprRef(Rc::new(Expr::Unknown { width, id }))
    }

    /// Creates a known constant of the given width. Bits of `bits` above the
    /// width are discarded.
    pub fn known(width: usize, bits: u64) -> ExprRef {
        assert!(width > 0 && width <= MAX_WIDTH, "invalid width {width}");
        ExprRef(Rc::new(Expr::Known {
            width,
            bits: bits & mask(width),
        }))
    }

    /// Creates an internal node applying `op` to `children`, checking the
    /// operator's width contract.
    pub fn operation(
        width: usize,
        op: Op,
        children: impl IntoIterator<Item = ExprRef>,
    ) -> ExprRef {
        assert!(width > 0 && width <= MAX_WIDTH, "invalid width {width}");
        let children: SmallVec<[ExprRef; 3]> = children.into_iter().collect();
        check_width_contract(width, op, &children);
        ExprRef(Rc::new(Expr::Operation {
            width,
            op,
            children,
        }))
    }

    /// The number of significant bits of this expression.
    pub fn width(&self) -> usize {
        match self {
            Expr::Known { width, .. }
            | Expr::Unknown { width, .. }
            | Expr::Operation { width, .. } => *width,
        }
    }

    /// Returns true if this node is a known constant leaf.
    pub fn is_known(&self) -> bool {
        matches!(self, Expr::Known { .. })
    }

    /// The value of a known constant leaf, or `None`.
    pub fn as_known(&self) -> Option<u64> {
        match self {
            Expr::Known { bits, .. } => Some(*bits),
            _ => None,
        }
    }

    /// The value of a known constant leaf. Calling this on anything else is
    /// a programming error.
    pub fn value(&self) -> u64 {
        self.as_known().expect("expression is not a known constant")
    }

    /// The identifier of an unknown-variable leaf, or `None`.
    pub fn unknown_id(&self) -> Option<u64> {
        match self {
            Expr::Unknown { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// The operator of an internal node, or `None` for leaves.
    pub fn op(&self) -> Option<Op> {
        match self {
            Expr::Operation { op, .. } => Some(*op),
            _ => None,
        }
    }

    /// The children of an internal node; empty for leaves.
    pub fn children(&self) -> &[ExprRef] {
        match self {
            Expr::Operation { children, .. } => children,
            _ => &[],
        }
    }

    /// Formats this expression, renaming unknown identifiers to first-use
    /// ordinals through `rmap` so that the rendering is stable across runs.
    pub fn fmt_with(&self, f: &mut fmt::Formatter<'_>, mut rmap: Option<&mut RenameMap>) -> fmt::Result {
        match self {
            Expr::Known { width, bits } => write!(f, "{bits:#x}:{width}"),
            Expr::Unknown { width, id } => {
                let name = match rmap {
                    Some(ref mut rmap) => rmap.rename(*id),
                    None => *id,
                };
                write!(f, "v{name}:{width}")
            }
            Expr::Operation { width, op, children } => {
                write!(f, "({op}:{width}")?;
                for child in children {
                    f.write_str(" ")?;
                    child.fmt_with(f, rmap.as_deref_mut())?;
                }
                f.write_str(")")
            }
        }
    }
}

impl ExprRef {
    pub fn width(&self) -> usize {
        self.0.width()
    }

    /// Returns true if `self` and `other` share the same allocation. This is
    /// cheaper than structural equality but strictly less complete.
    pub fn ptr_eq(&self, other: &ExprRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl std::ops::Deref for ExprRef {
    type Target = Expr;

    fn deref(&self) -> &Expr {
        &self.0
    }
}

impl PartialEq for ExprRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0) || *self.0 == *other.0
    }
}

impl Eq for ExprRef {}

impl fmt::Display for ExprRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt_with(f, None)
    }
}

/// Enforces the per-operator width contract at construction time.
fn check_width_contract(width: usize, op: Op, children: &[ExprRef]) {
    let all_children_have_width =
        |w: usize| children.iter().all(|c| c.width() == w);

    match op {
        Op::Add | Op::BitAnd | Op::BitOr | Op::BitXor => {
            assert!(!children.is_empty(), "{op} requires at least one operand");
            assert!(
                all_children_have_width(width),
                "{op} operands must all have the result width {width}"
            );
        }
        Op::BoolAnd | Op::BoolOr => {
            assert!(!children.is_empty(), "{op} requires at least one operand");
            assert!(width == 1, "{op} result must be a single bit");
            assert!(all_children_have_width(1), "{op} operands must be single bits");
        }
        Op::Invert => {
            assert!(!children.is_empty(), "{op} requires at least one operand");
            assert!(
                all_children_have_width(width),
                "{op} operands must all have the result width {width}"
            );
        }
        Op::Negate | Op::Lssb | Op::Mssb => {
            assert!(children.len() == 1, "{op} takes exactly one operand");
            assert!(
                children[0].width() == width,
                "{op} operand must have the result width {width}"
            );
        }
        Op::Concat => {
            assert!(children.len() >= 2, "{op} takes at least two operands");
            let sum: usize = children.iter().map(|c| c.width()).sum();
            assert!(
                sum == width,
                "{op} result width {width} must be the sum of operand widths {sum}"
            );
        }
        Op::Extract => {
            assert!(children.len() == 3, "{op} takes (lo, hi, x)");
            let lo = children[0].value() as usize;
            let hi = children[1].value() as usize;
            assert!(
                lo < hi && hi <= children[2].width(),
                "{op} bounds [{lo}, {hi}) exceed operand width {}",
                children[2].width()
            );
            assert!(width == hi - lo, "{op} result width must be {}", hi - lo);
        }
        Op::ZeroExtend | Op::SignExtend => {
            assert!(children.len() == 2, "{op} takes (width, x)");
            assert!(
                children[0].value() as usize == width,
                "{op} target width operand must equal the result width {width}"
            );
            assert!(
                width >= children[1].width(),
                "{op} cannot narrow {} bits to {width}",
                children[1].width()
            );
        }
        Op::Shl0 | Op::Shl1 | Op::Shr0 | Op::Shr1 | Op::Asr | Op::Rol | Op::Ror => {
            assert!(children.len() == 2, "{op} takes (shift, x)");
            assert!(
                children[1].width() == width,
                "{op} operand must have the result width {width}"
            );
        }
        Op::Eq | Op::Ne => {
            assert!(children.len() == 2, "{op} takes two operands");
            assert!(width == 1, "{op} result must be a single bit");
            assert!(
                children[0].width() == children[1].width(),
                "{op} operands must have equal widths"
            );
        }
        Op::IsZero => {
            assert!(children.len() == 1, "{op} takes exactly one operand");
            assert!(width == 1, "{op} result must be a single bit");
        }
        Op::Ite => {
            assert!(children.len() == 3, "{op} takes (selector, then, else)");
            assert!(children[0].width() == 1, "{op} selector must be a single bit");
            assert!(
                children[1].width() == width && children[2].width() == width,
                "{op} branches must have the result width {width}"
            );
        }
        Op::SignedMul | Op::UnsignedMul => {
            assert!(children.len() == 2, "{op} takes two operands");
            assert!(
                children[0].width() + children[1].width() == width,
                "{op} result width must be the sum of the operand widths"
            );
        }
        Op::SignedDiv | Op::UnsignedDiv => {
            assert!(children.len() == 2, "{op} takes two operands");
            assert!(
                children[0].width() == width,
                "{op} result width must match the dividend width"
            );
        }
        Op::SignedMod | Op::UnsignedMod => {
            assert!(children.len() == 2, "{op} takes two operands");
            assert!(
                children[1].width() == width,
                "{op} result width must match the divisor width"
            );
        }
        Op::Noop => {
            assert!(children.is_empty(), "{op} takes no operands");
        }
    }
}
