use std::fmt;

use crate::node::{Expr, ExprRef, MAX_WIDTH};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("expression width {actual} does not match required width {required}")]
    WidthMismatch { required: usize, actual: usize },

    #[error("expression is not a known constant")]
    NotAConstant,
}

/// A handle to an expression whose width is part of the static type.
///
/// Operations that combine values of incompatible widths fail to compile
/// rather than misbehave at run time. Conversions from untyped [`ExprRef`]
/// handles are checked at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value<const W: usize> {
    expr: ExprRef,
}

impl<const W: usize> Value<W> {
    /// Creates a fresh unknown of width `W`. Each call yields a value with a
    /// distinct identifier.
    pub fn unknown() -> Self {
        const {
            assert!(W > 0 && W <= MAX_WIDTH);
        }
        Self {
            expr: Expr::unknown(W),
        }
    }

    /// Creates a known constant of width `W`. Bits of `n` above the width
    /// are discarded.
    pub fn number(n: u64) -> Self {
        const {
            assert!(W > 0 && W <= MAX_WIDTH);
        }
        Self {
            expr: Expr::known(W, n),
        }
    }

    /// Wraps an expression known to have width `W`. A width disagreement is
    /// a programming error and aborts; use `TryFrom` for checked conversion.
    pub fn from_expr(expr: ExprRef) -> Self {
        assert!(
            expr.width() == W,
            "expression width {} does not match value width {W}",
            expr.width()
        );
        Self { expr }
    }

    pub fn expr(&self) -> &ExprRef {
        &self.expr
    }

    pub fn into_expr(self) -> ExprRef {
        self.expr
    }

    pub fn width(&self) -> usize {
        W
    }

    /// Returns true if this value is a known constant.
    pub fn is_known(&self) -> bool {
        self.expr.is_known()
    }

    /// The value of a known constant, or `None`.
    pub fn as_known(&self) -> Option<u64> {
        self.expr.as_known()
    }

    /// The value of a known constant. Calling this on a non-constant is a
    /// programming error.
    pub fn value(&self) -> u64 {
        self.expr.value()
    }

    /// The value of a known constant, or [`Error::NotAConstant`].
    pub fn try_value(&self) -> Result<u64> {
        self.expr.as_known().ok_or(Error::NotAConstant)
    }
}

/// A fresh unknown, mirroring the behavior of an uninitialized machine slot.
impl<const W: usize> Default for Value<W> {
    fn default() -> Self {
        Self::unknown()
    }
}

impl<const W: usize> TryFrom<ExprRef> for Value<W> {
    type Error = Error;

    fn try_from(expr: ExprRef) -> Result<Self> {
        if expr.width() == W {
            Ok(Self { expr })
        } else {
            Err(Error::WidthMismatch {
                required: W,
                actual: expr.width(),
            })
        }
    }
}

impl<const W: usize> fmt::Display for Value<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)
    }
}
