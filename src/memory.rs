use std::ops::Range;

use log::trace;

use crate::error::{Error, Result};

/// A set of non-overlapping mapped regions of concrete bytes.
#[derive(Clone, Debug, Default)]
pub struct Memories {
    items: Vec<(u64, Box<[u8]>)>,
}

impl Memories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `len` zeroed bytes at `addr`.
    pub fn map(&mut self, addr: u64, len: usize) -> Result<()> {
        let end = addr.checked_add(len as u64).ok_or(Error::InvalidLayout {
            region: "mapping",
            base: addr,
            size: len as u64,
        })?;
        let range = addr..end;
        if let Some((other_addr, other_data)) = self
            .items
            .iter()
            .find(|(other_addr, other_data)| range.start < other_addr + other_data.len() as u64 && *other_addr < range.end)
        {
            return Err(Error::AddressOverlap {
                first: "mapping",
                first_range: range,
                second: "existing mapping",
                second_range: *other_addr..other_addr + other_data.len() as u64,
            });
        }

        trace!("Mapping 0x{:X}..0x{:X}", range.start, range.end);
        self.items.push((addr, vec![0; len].into_boxed_slice()));
        Ok(())
    }

    pub fn regions(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        self.items.iter().map(|(addr, data)| *addr..addr + data.len() as u64)
    }

    fn find(&self, addr: u64) -> Option<&(u64, Box<[u8]>)> {
        self.items
            .iter()
            .find(|(data_addr, data)| addr >= *data_addr && addr < data_addr + data.len() as u64)
    }

    pub fn is_mapped(&self, addr: u64) -> bool {
        self.find(addr).is_some()
    }

    pub fn contains_entire(&self, mut range: Range<u64>) -> bool {
        while !range.is_empty() {
            let addr = range.start;
            if let Some((start, memdata)) = self.find(addr) {
                let new_addr = start + memdata.len() as u64;
                if new_addr >= range.end {
                    return true;
                } else {
                    range = new_addr..range.end;
                }
            } else {
                return false;
            }
        }

        true
    }

    pub fn write(&mut self, mut addr: u64, mut data: &[u8]) -> Result<()> {
        let full = span(addr, data.len())?;
        if !self.contains_entire(full.clone()) {
            return Err(Error::UnmappedMemoryAccess {
                range: full,
            });
        }

        trace!("write 0x{addr:X}: {}", hex::encode(data));
        while !data.is_empty() {
            let (start, memdata) = self
                .items
                .iter_mut()
                .find(|(data_addr, data)| addr >= *data_addr && addr < *data_addr + data.len() as u64)
                .ok_or(Error::UnmappedMemoryAccess {
                    range: full.clone(),
                })?;
            let offset = (addr - *start) as usize;
            let num_bytes = data.len().min(memdata.len() - offset);
            memdata[offset..offset + num_bytes].copy_from_slice(&data[..num_bytes]);

            addr += num_bytes as u64;
            data = &data[num_bytes..];
        }

        Ok(())
    }

    pub fn read(&self, mut addr: u64, mut data: &mut [u8]) -> Result<()> {
        let full = span(addr, data.len())?;
        while !data.is_empty() {
            let (start, memdata) = self.find(addr).ok_or(Error::UnmappedMemoryAccess {
                range: full.clone(),
            })?;
            let offset = (addr - *start) as usize;
            let num_bytes = data.len().min(memdata.len() - offset);
            data[..num_bytes].copy_from_slice(&memdata[offset..offset + num_bytes]);

            addr += num_bytes as u64;
            data = &mut data[num_bytes..];
        }

        Ok(())
    }

    pub fn read_while(&self, mut addr: u64, mut cond: impl FnMut(u8) -> bool, data: &mut Vec<u8>) -> Result<()> {
        let mut b = [0u8; 1];
        loop {
            self.read(addr, &mut b)?;
            if cond(b[0]) {
                data.push(b[0]);
            } else {
                return Ok(())
            }

            addr += 1;
        }
    }
}

/// The accessed range, or an unmapped access if it runs past the end of the address space.
fn span(addr: u64, len: usize) -> Result<Range<u64>> {
    match addr.checked_add(len as u64) {
        Some(end) => Ok(addr..end),
        None => Err(Error::UnmappedMemoryAccess {
            range: addr..u64::MAX,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_past_end_of_address_space_is_unmapped() {
        let mut m = Memories::new();
        m.map(0x1000, 0x10).unwrap();

        let mut b = [0u8; 2];
        assert!(matches!(m.read(u64::MAX, &mut b), Err(Error::UnmappedMemoryAccess { .. })));
        assert!(matches!(m.write(u64::MAX - 1, &[1, 2, 3]), Err(Error::UnmappedMemoryAccess { .. })));
        assert!(matches!(m.map(u64::MAX - 4, 0x10), Err(Error::InvalidLayout { region: "mapping", .. })));
    }

    #[test]
    fn write_across_adjacent_regions() {
        let mut m = Memories::new();
        m.map(0x1000, 0x10).unwrap();
        m.map(0x1010, 0x10).unwrap();

        m.write(0x100C, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let mut data = [0u8; 8];
        m.read(0x100C, &mut data).unwrap();
        assert_eq!(data, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(m.contains_entire(0x1000..0x1020));
        assert!(!m.contains_entire(0x1000..0x1021));
    }

    #[test]
    fn overlapping_map_is_rejected() {
        let mut m = Memories::new();
        m.map(0x1000, 0x100).unwrap();
        assert!(matches!(m.map(0x10F0, 0x100), Err(Error::AddressOverlap { .. })));
        m.map(0x1100, 0x100).unwrap();
    }

    #[test]
    fn unmapped_access_fails_without_partial_write() {
        let mut m = Memories::new();
        m.map(0x1000, 0x10).unwrap();

        let err = m.write(0x100E, &[0xAA; 4]).unwrap_err();
        assert!(matches!(err, Error::UnmappedMemoryAccess { range } if range == (0x100E..0x1012)));

        let mut data = [0u8; 2];
        m.read(0x100E, &mut data).unwrap();
        assert_eq!(data, [0, 0]);

        assert!(m.read(0x2000, &mut data).is_err());
    }

    #[test]
    fn read_while_stops_at_condition() {
        let mut m = Memories::new();
        m.map(0, 0x10).unwrap();
        m.write(0, b"hi!\0").unwrap();

        let mut data = Vec::new();
        m.read_while(0, |b| b != 0, &mut data).unwrap();
        assert_eq!(data, b"hi!");
    }
}
