//! Hook table: synthetic addresses bound to handlers.
//!
//! A [`HookTable`] is built once from a list of [`Registration`]s. Each registration gets the next word-aligned slot
//! starting at the configured base, so the table is fully determined by the order of the list. After construction the
//! table is read-only and can be queried by address (during dispatch) or by name (during patching).

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::ops::Range;

use crate::abi::Abi;
use crate::config::HookConfig;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::heap::Heap;

pub mod handlers;
pub mod patch;

pub use handlers::default_hooks;
pub use patch::{install, Patch, PatchReport, PatchSource};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// Takes over the program entry: the handler sets the instruction pointer itself.
    EntryTrampoline,
    /// A regular call that returns to its caller.
    NormalStub,
    /// A reserved slot without a handler. Reaching it is fatal.
    Invalid,
}

/// How the dispatch loop continues after a handler ran.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Continuation {
    /// Write the return value and return to the caller.
    Resume,
    /// The handler already pointed the instruction pointer somewhere; leave it there.
    ResumeAtRegisterIP,
    Terminate,
    Fault,
}

/// Result of a handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HookResult<X> {
    /// Concrete value for the return register. `None` leaves the register alone.
    pub value: Option<u64>,
    /// Symbolic value bound to the return register after the concrete value is written.
    pub symbolic: Option<X>,
    pub continuation: Continuation,
}

impl<X> HookResult<X> {
    pub fn resume(value: u64) -> Self {
        HookResult {
            value: Some(value),
            symbolic: None,
            continuation: Continuation::Resume,
        }
    }

    pub fn redirected() -> Self {
        HookResult {
            value: None,
            symbolic: None,
            continuation: Continuation::ResumeAtRegisterIP,
        }
    }

    pub fn terminate(status: u64) -> Self {
        HookResult {
            value: Some(status),
            symbolic: None,
            continuation: Continuation::Terminate,
        }
    }

    pub fn with_symbolic(mut self, expr: X) -> Self {
        self.symbolic = Some(expr);
        self
    }
}

/// Everything a handler may touch while it runs.
pub struct HookCtx<'a, E: Engine> {
    pub abi: Abi<'a, E>,
    pub heap: &'a mut Heap,
    pub config: &'a HookConfig,
    pub out: &'a mut dyn Write,
    pub name: &'a str,
}

impl<'a, E: Engine> HookCtx<'a, E> {
    pub fn arg(&self, index: usize) -> Result<u64> {
        self.abi.arg(index)
    }

    pub fn alloc(&mut self, bytes: &[u8]) -> Result<u64> {
        self.heap.allocate(self.abi.engine_mut(), bytes)
    }

    pub fn alloc_cstr(&mut self, s: &str) -> Result<u64> {
        self.heap.allocate_cstr(self.abi.engine_mut(), s)
    }
}

pub type Handler<E> = fn(&mut HookCtx<'_, E>) -> Result<HookResult<<E as Engine>::Expr>>;

pub struct Registration<E: Engine> {
    pub name: String,
    pub kind: HookKind,
    pub handler: Option<Handler<E>>,
}

impl<E: Engine> Registration<E> {
    pub fn stub(name: impl Into<String>, handler: Handler<E>) -> Self {
        Registration {
            name: name.into(),
            kind: HookKind::NormalStub,
            handler: Some(handler),
        }
    }

    pub fn entry(name: impl Into<String>, handler: Handler<E>) -> Self {
        Registration {
            name: name.into(),
            kind: HookKind::EntryTrampoline,
            handler: Some(handler),
        }
    }

    pub fn invalid(name: impl Into<String>) -> Self {
        Registration {
            name: name.into(),
            kind: HookKind::Invalid,
            handler: None,
        }
    }
}

pub struct HookEntry<E: Engine> {
    pub name: String,
    pub addr: u64,
    pub kind: HookKind,
    pub handler: Option<Handler<E>>,
}

impl<E: Engine> fmt::Debug for HookEntry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookEntry")
            .field("name", &self.name)
            .field("addr", &format_args!("0x{:X}", self.addr))
            .field("kind", &self.kind)
            .finish()
    }
}

pub struct HookTable<E: Engine> {
    base: u64,
    word: u64,
    entries: Vec<HookEntry<E>>,
    by_addr: HashMap<u64, usize>,
    by_name: HashMap<String, usize>,
}

impl<E: Engine> HookTable<E> {
    pub fn build(base: u64, word: u64, registrations: impl IntoIterator<Item = Registration<E>>) -> Result<Self> {
        let mut table = HookTable {
            base,
            word,
            entries: Vec::new(),
            by_addr: HashMap::new(),
            by_name: HashMap::new(),
        };

        for registration in registrations {
            if table.by_name.contains_key(&registration.name) {
                return Err(Error::DuplicateHook(registration.name));
            }

            if registration.kind != HookKind::Invalid && registration.handler.is_none() {
                return Err(Error::MissingHandler(registration.name));
            }

            let index = table.entries.len();
            let addr = (index as u64)
                .checked_mul(word)
                .and_then(|offset| base.checked_add(offset))
                .filter(|addr| addr.checked_add(word).is_some())
                .ok_or(Error::InvalidLayout {
                    region: "hook table",
                    base,
                    size: (index as u64 + 1).saturating_mul(word),
                })?;
            table.by_addr.insert(addr, index);
            table.by_name.insert(registration.name.clone(), index);
            table.entries.push(HookEntry {
                name: registration.name,
                addr,
                kind: registration.kind,
                handler: registration.handler,
            });
        }

        Ok(table)
    }

    pub fn by_addr(&self, addr: u64) -> Option<&HookEntry<E>> {
        self.by_addr.get(&addr).map(|&index| &self.entries[index])
    }

    pub fn by_name(&self, name: &str) -> Option<&HookEntry<E>> {
        self.by_name.get(name).map(|&index| &self.entries[index])
    }

    pub fn iter(&self) -> impl Iterator<Item = &HookEntry<E>> {
        self.entries.iter()
    }

    pub fn addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().map(|e| e.addr)
    }

    /// The reserved address range, one word per entry.
    pub fn range(&self) -> Range<u64> {
        self.base..self.base + self.entries.len() as u64 * self.word
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimEngine;

    fn nothing(_: &mut HookCtx<'_, SimEngine>) -> Result<HookResult<crate::sim::Expr>> {
        Ok(HookResult::resume(0))
    }

    #[test]
    fn slots_are_consecutive_words() {
        let table = HookTable::<SimEngine>::build(
            0x1000_0000,
            4,
            vec![Registration::stub("puts", nothing), Registration::invalid("system"), Registration::stub("exit", nothing)],
        )
        .unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(table.addresses().collect::<Vec<_>>(), vec![0x1000_0000, 0x1000_0004, 0x1000_0008]);
        assert_eq!(table.range(), 0x1000_0000..0x1000_000C);
        assert_eq!(table.by_name("system").unwrap().kind, HookKind::Invalid);
        assert_eq!(table.by_addr(0x1000_0008).unwrap().name, "exit");
        assert!(table.by_addr(0x1000_0002).is_none());
        assert!(table.by_name("printf").is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let result = HookTable::<SimEngine>::build(
            0x1000_0000,
            8,
            vec![Registration::stub("puts", nothing), Registration::invalid("puts")],
        );
        assert!(matches!(result, Err(Error::DuplicateHook(name)) if name == "puts"));
    }

    #[test]
    fn table_must_fit_below_end_of_address_space() {
        let result = HookTable::<SimEngine>::build(
            u64::MAX - 0xF,
            8,
            vec![Registration::stub("puts", nothing), Registration::stub("exit", nothing), Registration::invalid("system")],
        );
        assert!(matches!(
            result,
            Err(Error::InvalidLayout {
                region: "hook table",
                size: 0x10,
                ..
            })
        ));

        let table = HookTable::<SimEngine>::build(u64::MAX - 0xF, 8, vec![Registration::stub("puts", nothing)]).unwrap();
        assert_eq!(table.range(), u64::MAX - 0xF..u64::MAX - 0x7);
    }

    #[test]
    fn stubs_need_handlers() {
        let registration = Registration::<SimEngine> {
            name: "puts".to_string(),
            kind: HookKind::NormalStub,
            handler: None,
        };
        assert!(matches!(HookTable::build(0, 8, [registration]), Err(Error::MissingHandler(_))));
    }

    #[test]
    fn default_hooks_build() {
        let table = HookTable::<SimEngine>::build(0x1000_0000, 8, default_hooks()).unwrap();
        assert_eq!(table.by_name("__libc_start_main").unwrap().kind, HookKind::EntryTrampoline);
        for name in ["printf", "puts", "fflush", "getlogin", "usleep", "sleep", "putchar", "exit", "strlen", "fgets"] {
            assert_eq!(table.by_name(name).unwrap().kind, HookKind::NormalStub, "{name}");
        }
        assert!(table.iter().all(|e| e.addr % 8 == 0));
    }
}
