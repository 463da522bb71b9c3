//! A small reference engine.
//!
//! [`SimEngine`] keeps a concrete register file, concrete mapped memory (see [`Memories`]), and per-byte symbolic
//! bindings on top of it, mirroring how a concolic engine tracks both views of the same state. It has no instruction
//! decoder; drivers step it through the [`crate::engine::Step`] trait. Expressions are plain trees that can be
//! evaluated under a [`Model`], which is enough to check the formulas the hooks build.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::arch::{ArchId, Reg};
use crate::engine::Engine;
use crate::error::Result;
use crate::image::ImageInfo;
use crate::memory::Memories;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub u32);

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "var_{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expr {
    Const { value: u64, bits: u32 },
    Var { id: VarId, bits: u32 },
    Eq(Box<Expr>, Box<Expr>),
    Ite(Box<Expr>, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Uge(Box<Expr>, Box<Expr>),
    Ult(Box<Expr>, Box<Expr>),
}

/// An assignment of values to symbolic variables.
pub type Model = HashMap<VarId, u64>;

fn truncate(value: u64, bits: u32) -> u64 {
    if bits >= 64 {
        value
    } else {
        value & ((1 << bits) - 1)
    }
}

impl Expr {
    pub fn bits(&self) -> u32 {
        match self {
            Expr::Const { bits, .. } | Expr::Var { bits, .. } => *bits,
            Expr::Ite(_, then, _) => then.bits(),
            Expr::Eq(..) | Expr::And(..) | Expr::Uge(..) | Expr::Ult(..) => 1,
        }
    }

    /// Evaluates the expression. Returns `None` if a variable it depends on has no value in `model`.
    pub fn eval(&self, model: &Model) -> Option<u64> {
        Some(match self {
            Expr::Const { value, bits } => truncate(*value, *bits),
            Expr::Var { id, bits } => truncate(*model.get(id)?, *bits),
            Expr::Eq(a, b) => (a.eval(model)? == b.eval(model)?) as u64,
            Expr::Ite(cond, then, otherwise) => {
                if cond.eval(model)? != 0 {
                    then.eval(model)?
                } else {
                    otherwise.eval(model)?
                }
            },
            Expr::And(a, b) => (a.eval(model)? != 0 && b.eval(model)? != 0) as u64,
            Expr::Uge(a, b) => (a.eval(model)? >= b.eval(model)?) as u64,
            Expr::Ult(a, b) => (a.eval(model)? < b.eval(model)?) as u64,
        })
    }

    pub fn vars(&self) -> Vec<VarId> {
        let mut out = Vec::new();
        self.collect_vars(&mut out);
        out.sort();
        out.dedup();
        out
    }

    fn collect_vars(&self, out: &mut Vec<VarId>) {
        match self {
            Expr::Const { .. } => (),
            Expr::Var { id, .. } => out.push(*id),
            Expr::Ite(a, b, c) => {
                a.collect_vars(out);
                b.collect_vars(out);
                c.collect_vars(out);
            },
            Expr::Eq(a, b) | Expr::And(a, b) | Expr::Uge(a, b) | Expr::Ult(a, b) => {
                a.collect_vars(out);
                b.collect_vars(out);
            },
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const { value, bits } => write!(f, "(_ bv{value} {bits})"),
            Expr::Var { id, .. } => write!(f, "{id}"),
            Expr::Eq(a, b) => write!(f, "(= {a} {b})"),
            Expr::Ite(c, t, e) => write!(f, "(ite {c} {t} {e})"),
            Expr::And(a, b) => write!(f, "(and {a} {b})"),
            Expr::Uge(a, b) => write!(f, "(bvuge {a} {b})"),
            Expr::Ult(a, b) => write!(f, "(bvult {a} {b})"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub addr: u64,
}

#[derive(Clone, Debug)]
pub struct SimEngine {
    arch: ArchId,
    registers: HashMap<Reg, u64>,
    register_exprs: HashMap<Reg, Expr>,
    memory: Memories,
    symbolic: BTreeMap<u64, Expr>,
    variables: Vec<Variable>,
    constraints: Vec<Expr>,
}

impl SimEngine {
    pub fn new(arch: ArchId) -> SimEngine {
        SimEngine {
            arch,
            registers: HashMap::new(),
            register_exprs: HashMap::new(),
            memory: Memories::new(),
            symbolic: BTreeMap::new(),
            variables: Vec::new(),
            constraints: Vec::new(),
        }
    }

    pub fn map(&mut self, addr: u64, len: usize) -> Result<()> {
        self.memory.map(addr, len)
    }

    pub fn memory(&self) -> &Memories {
        &self.memory
    }

    /// Maps every loadable segment of `image` (page-granular) and copies its file contents.
    pub fn load_image(&mut self, image: &ImageInfo) -> Result<()> {
        for range in image.mapped_ranges() {
            self.memory.map(range.start, (range.end - range.start) as usize)?;
        }

        for segment in image.segments.iter() {
            self.memory.write(segment.addr, &segment.data)?;
        }

        Ok(())
    }

    pub fn register_expr(&self, reg: Reg) -> Option<&Expr> {
        self.register_exprs.get(&reg)
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn variable(&self, name: &str) -> Option<VarId> {
        self.variables
            .iter()
            .position(|v| v.name == name)
            .map(|index| VarId(index as u32))
    }

    pub fn constraints(&self) -> &[Expr] {
        &self.constraints
    }

    /// Addresses of all bytes that are currently symbolic, in ascending order.
    pub fn symbolic_addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.symbolic.keys().copied()
    }

    fn mask(&self) -> u64 {
        self.arch.profile().mask()
    }
}

impl Engine for SimEngine {
    type Expr = Expr;

    fn arch(&self) -> ArchId {
        self.arch
    }

    fn register(&self, reg: Reg) -> u64 {
        self.registers.get(&reg).copied().unwrap_or(0)
    }

    fn set_register(&mut self, reg: Reg, value: u64) {
        let value = value & self.mask();
        self.register_exprs.remove(&reg);
        self.registers.insert(reg, value);
    }

    fn read_memory(&self, addr: u64, data: &mut [u8]) -> Result<()> {
        self.memory.read(addr, data)
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.memory.write(addr, data)?;
        let end = addr + data.len() as u64;
        let concretized = self.symbolic.range(addr..end).map(|(&a, _)| a).collect::<Vec<_>>();
        for a in concretized {
            self.symbolic.remove(&a);
        }

        Ok(())
    }

    fn is_symbolic(&self, addr: u64) -> bool {
        self.symbolic.contains_key(&addr)
    }

    fn symbolize_memory(&mut self, addr: u64, label: &str) -> Result<Expr> {
        let mut b = [0u8; 1];
        self.memory.read(addr, &mut b)?;

        let id = VarId(self.variables.len() as u32);
        self.variables.push(Variable {
            name: label.to_string(),
            addr,
        });

        let var = Expr::Var {
            id,
            bits: 8,
        };
        self.symbolic.insert(addr, var.clone());
        Ok(var)
    }

    fn memory_expr(&self, addr: u64) -> Option<Expr> {
        self.symbolic.get(&addr).cloned()
    }

    fn assign_register_expr(&mut self, reg: Reg, expr: Expr) {
        self.register_exprs.insert(reg, expr);
    }

    fn add_constraint(&mut self, expr: Expr) {
        self.constraints.push(expr);
    }

    fn bv(&self, value: u64, bits: u32) -> Expr {
        Expr::Const {
            value: truncate(value, bits),
            bits,
        }
    }

    fn equal(&self, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Eq(Box::new(lhs), Box::new(rhs))
    }

    fn ite(&self, cond: Expr, then: Expr, otherwise: Expr) -> Expr {
        Expr::Ite(Box::new(cond), Box::new(then), Box::new(otherwise))
    }

    fn land(&self, lhs: Expr, rhs: Expr) -> Expr {
        Expr::And(Box::new(lhs), Box::new(rhs))
    }

    fn bvuge(&self, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Uge(Box::new(lhs), Box::new(rhs))
    }

    fn bvult(&self, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Ult(Box::new(lhs), Box::new(rhs))
    }
}
