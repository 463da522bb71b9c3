use std::fmt::Debug;

use crate::arch::{ArchId, Reg};
use crate::error::Result;

/// The execution engine the hooks run against.
///
/// The engine owns all emulation state: the concrete register file, concrete memory, and the symbolic bindings on
/// top of both. Nothing in this crate keeps a second copy; every read and write goes through these methods.
pub trait Engine {
    /// A symbolic expression (bit-vector or boolean term) in the engine's formula algebra.
    type Expr: Clone + Debug;

    fn arch(&self) -> ArchId;

    fn register(&self, reg: Reg) -> u64;
    fn set_register(&mut self, reg: Reg, value: u64);

    fn read_memory(&self, addr: u64, data: &mut [u8]) -> Result<()>;
    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()>;

    fn is_symbolic(&self, addr: u64) -> bool;

    /// Replaces the byte at `addr` with a fresh symbolic variable named `label` and returns that variable.
    fn symbolize_memory(&mut self, addr: u64, label: &str) -> Result<Self::Expr>;

    /// The expression currently bound to the byte at `addr`, if the byte is symbolic.
    fn memory_expr(&self, addr: u64) -> Option<Self::Expr>;

    fn assign_register_expr(&mut self, reg: Reg, expr: Self::Expr);
    fn add_constraint(&mut self, expr: Self::Expr);

    fn bv(&self, value: u64, bits: u32) -> Self::Expr;
    fn equal(&self, lhs: Self::Expr, rhs: Self::Expr) -> Self::Expr;
    fn ite(&self, cond: Self::Expr, then: Self::Expr, otherwise: Self::Expr) -> Self::Expr;
    fn land(&self, lhs: Self::Expr, rhs: Self::Expr) -> Self::Expr;
    fn bvuge(&self, lhs: Self::Expr, rhs: Self::Expr) -> Self::Expr;
    fn bvult(&self, lhs: Self::Expr, rhs: Self::Expr) -> Self::Expr;
}

/// The engine's single-step primitive: execute the instruction at the current instruction pointer.
pub trait Step<E: Engine> {
    fn step(&mut self, engine: &mut E) -> Result<()>;
}

impl<E: Engine, F: FnMut(&mut E) -> Result<()>> Step<E> for F {
    fn step(&mut self, engine: &mut E) -> Result<()> {
        self(engine)
    }
}
