use log::{debug, info};

use crate::abi::Abi;
use crate::arch::Profile;
use crate::engine::Engine;
use crate::error::Result;
use crate::hooks::HookTable;
use crate::image::ImageInfo;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PatchSource {
    Relocation,
    Symbol,
}

/// A single word-sized cell that now points into the hook table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Patch {
    pub source: PatchSource,
    pub name: String,
    pub location: u64,
    /// Little-endian contents of the cell before it was patched.
    pub previous: Vec<u8>,
    pub target: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatchReport {
    pub patches: Vec<Patch>,
}

impl PatchReport {
    pub fn is_patched(&self, name: &str) -> bool {
        self.patches.iter().any(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

/// Redirects the image's imports to the hook table.
///
/// Every relocation whose symbol has a hook gets the hook address written to its target cell. Symbols with a nonzero
/// value get the same treatment at the symbol's address, which covers images that resolve imports through their own
/// tables. Names without a hook are left alone.
pub fn install<E: Engine>(
    engine: &mut E, profile: &'static Profile, table: &HookTable<E>, image: &ImageInfo,
) -> Result<PatchReport> {
    let mut abi = Abi::new(engine, profile)?;
    let mut report = PatchReport::default();

    let relocations = image
        .relocations
        .iter()
        .map(|r| (PatchSource::Relocation, r.symbol.as_str(), r.addr));
    let symbols = image
        .symbols
        .iter()
        .filter(|s| s.value != 0)
        .map(|s| (PatchSource::Symbol, s.name.as_str(), s.value));

    for (source, name, location) in relocations.chain(symbols) {
        let Some(entry) = table.by_name(name) else {
            continue
        };

        let mut previous = vec![0u8; profile.word as usize];
        abi.engine().read_memory(location, &mut previous)?;
        abi.write_word(location, entry.addr)?;

        debug!(
            "Patched {source:?} {name} at 0x{location:X}: {} -> 0x{:X}",
            hex::encode(&previous),
            entry.addr
        );
        report.patches.push(Patch {
            source,
            name: name.to_string(),
            location,
            previous,
            target: entry.addr,
        });
    }

    info!("Patched {} import location(s)", report.len());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{ArchId, X86, X86_64};
    use crate::error::Error;
    use crate::hooks::{default_hooks, Registration};
    use crate::image::{Relocation, Symbol};
    use crate::sim::SimEngine;

    const GOT: u64 = 0x404000;

    fn image(arch: ArchId) -> ImageInfo {
        ImageInfo {
            arch,
            entry_point: 0x401000,
            relocations: vec![
                Relocation {
                    addr: GOT,
                    symbol: "puts".to_string(),
                },
                Relocation {
                    addr: GOT + 0x10,
                    symbol: "__cxa_finalize".to_string(),
                },
                Relocation {
                    addr: GOT + 0x20,
                    symbol: "strlen".to_string(),
                },
            ],
            symbols: vec![
                Symbol {
                    name: "fgets".to_string(),
                    value: GOT + 0x30,
                },
                Symbol {
                    name: "printf".to_string(),
                    value: 0,
                },
            ],
            segments: Vec::new(),
        }
    }

    fn engine(arch: ArchId) -> SimEngine {
        let mut e = SimEngine::new(arch);
        e.map(GOT, 0x1000).unwrap();
        e.write_memory(GOT, &[0x11; 0x40]).unwrap();
        e
    }

    #[test_log::test]
    fn relocations_and_symbols_are_patched() {
        let mut e = engine(ArchId::X86_64);
        let table = HookTable::build(0x1000_0000, 8, default_hooks()).unwrap();
        let report = install(&mut e, &X86_64, &table, &image(ArchId::X86_64)).unwrap();

        assert_eq!(report.len(), 3);
        assert!(report.is_patched("puts"));
        assert!(report.is_patched("strlen"));
        assert!(report.is_patched("fgets"));
        assert!(!report.is_patched("__cxa_finalize"));
        assert!(!report.is_patched("printf"));

        let puts = &report.patches[0];
        assert_eq!(puts.source, PatchSource::Relocation);
        assert_eq!(puts.previous, vec![0x11; 8]);
        assert_eq!(puts.target, table.by_name("puts").unwrap().addr);
        assert_eq!(report.patches[2].source, PatchSource::Symbol);

        let mut cell = [0u8; 8];
        for (location, name) in [(GOT, "puts"), (GOT + 0x20, "strlen"), (GOT + 0x30, "fgets")] {
            e.read_memory(location, &mut cell).unwrap();
            assert_eq!(u64::from_le_bytes(cell), table.by_name(name).unwrap().addr, "{name}");
        }

        e.read_memory(GOT + 0x10, &mut cell).unwrap();
        assert_eq!(cell, [0x11; 8]);
    }

    #[test]
    fn cells_are_word_sized() {
        let mut e = engine(ArchId::X86);
        let table = HookTable::build(0x1000_0000, 4, [Registration::invalid("puts")]).unwrap();
        let report = install(&mut e, &X86, &table, &image(ArchId::X86)).unwrap();
        assert_eq!(report.len(), 1);

        let mut cell = [0u8; 8];
        e.read_memory(GOT, &mut cell).unwrap();
        assert_eq!(cell, [0x00, 0x00, 0x00, 0x10, 0x11, 0x11, 0x11, 0x11]);
    }

    #[test]
    fn unmapped_cell_is_an_error() {
        let mut e = SimEngine::new(ArchId::X86_64);
        let table = HookTable::build(0x1000_0000, 8, default_hooks()).unwrap();
        assert!(matches!(
            install(&mut e, &X86_64, &table, &image(ArchId::X86_64)),
            Err(Error::UnmappedMemoryAccess { .. })
        ));
    }
}
