use std::iter::once;
use std::ops::Range;

use log::debug;

use crate::engine::Engine;
use crate::error::{Error, Result};

/// Bump allocator for data the hooks hand to the emulated program.
///
/// Allocations are never freed or reused: the region lives as long as the session.
#[derive(Clone, Debug)]
pub struct Heap {
    range: Range<u64>,
    cursor: u64,
}

impl Heap {
    pub fn new(range: Range<u64>) -> Heap {
        Heap {
            cursor: range.start,
            range,
        }
    }

    pub fn range(&self) -> Range<u64> {
        self.range.clone()
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn used(&self) -> u64 {
        self.cursor - self.range.start
    }

    pub fn allocate<E: Engine>(&mut self, engine: &mut E, bytes: &[u8]) -> Result<u64> {
        let len = bytes.len() as u64;
        let end = self.cursor.checked_add(len).filter(|&end| end <= self.range.end);
        let Some(end) = end else {
            return Err(Error::HeapExhausted {
                requested: len,
                cursor: self.cursor,
                end: self.range.end,
            });
        };

        let addr = self.cursor;
        engine.write_memory(addr, bytes)?;
        self.cursor = end;

        debug!("Allocated 0x{:X}..0x{:X} (length=0x{:X})", addr, end, len);
        Ok(addr)
    }

    pub fn allocate_cstr<E: Engine>(&mut self, engine: &mut E, s: &str) -> Result<u64> {
        let total = s.bytes().chain(once(0)).collect::<Vec<_>>();
        self.allocate(engine, &total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ArchId;
    use crate::sim::SimEngine;

    fn setup() -> (SimEngine, Heap) {
        let mut e = SimEngine::new(ArchId::X86_64);
        e.map(0xB000_0000, 0x100).unwrap();
        (e, Heap::new(0xB000_0000..0xB000_0100))
    }

    #[test]
    fn allocations_are_adjacent_and_disjoint() {
        let (mut e, mut heap) = setup();
        let a1 = heap.allocate(&mut e, b"hello").unwrap();
        let a2 = heap.allocate(&mut e, b"world!!").unwrap();

        assert_eq!(a1, 0xB000_0000);
        assert_eq!(a2, a1 + 5);
        assert!(a1 + 5 <= a2);
        assert_eq!(heap.used(), 12);

        let mut data = [0u8; 12];
        e.read_memory(a1, &mut data).unwrap();
        assert_eq!(&data, b"helloworld!!");
    }

    #[test]
    fn cstr_is_terminated() {
        let (mut e, mut heap) = setup();
        let a = heap.allocate_cstr(&mut e, "./programm").unwrap();
        assert_eq!(heap.cursor(), a + 11);

        let mut data = Vec::new();
        e.memory().read_while(a, |b| b != 0, &mut data).unwrap();
        assert_eq!(data, b"./programm");
    }

    #[test]
    fn exhaustion_leaves_cursor_untouched() {
        let (mut e, mut heap) = setup();
        heap.allocate(&mut e, &[0xAA; 0xF0]).unwrap();
        let cursor = heap.cursor();

        assert!(matches!(
            heap.allocate(&mut e, &[0xBB; 0x20]),
            Err(Error::HeapExhausted {
                requested: 0x20,
                ..
            })
        ));
        assert_eq!(heap.cursor(), cursor);

        heap.allocate(&mut e, &[0xCC; 0x10]).unwrap();
        assert_eq!(heap.cursor(), heap.range().end);
    }
}
