mod node;
mod op;
mod rename;
mod value;

pub use crate::node::{Expr, ExprRef};
pub use crate::op::Op;
pub use crate::rename::RenameMap;
pub use crate::value::{Error, Result, Value};

#[cfg(test)]
mod tests;
