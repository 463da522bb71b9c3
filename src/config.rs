//! Session configuration.
//!
//! Everything here has a default, so an empty JSON object (or no file at all) gives the standard harness setup.

use std::fs::File;
use std::io::BufReader;
use std::ops::Range;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Where the harness puts its synthetic regions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Layout {
    /// First synthetic hook address. Entries occupy one word each from here on.
    pub hook_base: u64,
    pub heap_base: u64,
    pub heap_size: u64,
    /// Initial stack pointer. The stack grows down from here.
    pub stack_top: u64,
    pub stack_size: u64,
}

impl Default for Layout {
    fn default() -> Self {
        Layout {
            hook_base: 0x1000_0000,
            heap_base: 0xB000_0000,
            heap_size: 0x10_0000,
            stack_top: 0xA000_0000,
            stack_size: 0x10_0000,
        }
    }
}

impl Layout {
    pub fn heap(&self) -> Result<Range<u64>> {
        let end = self.heap_base.checked_add(self.heap_size).ok_or(Error::InvalidLayout {
            region: "heap",
            base: self.heap_base,
            size: self.heap_size,
        })?;
        Ok(self.heap_base..end)
    }

    /// The stack region below `stack_top`.
    pub fn stack(&self) -> Result<Range<u64>> {
        let start = self.stack_top.checked_sub(self.stack_size).ok_or(Error::InvalidLayout {
            region: "stack",
            base: self.stack_top,
            size: self.stack_size,
        })?;
        Ok(start..self.stack_top)
    }

    /// Checks that the hook range, the heap, the stack and every image range are pairwise disjoint.
    pub fn validate(&self, hooks: Range<u64>, image: &[Range<u64>]) -> Result<()> {
        let mut ranges = vec![("hook table", hooks), ("heap", self.heap()?), ("stack", self.stack()?)];
        ranges.extend(image.iter().map(|r| ("image", r.clone())));

        for (i, (first, first_range)) in ranges.iter().enumerate() {
            for (second, second_range) in ranges[i + 1..].iter() {
                if *first == "image" && *second == "image" {
                    continue
                }

                if first_range.start < second_range.end && second_range.start < first_range.end {
                    return Err(Error::AddressOverlap {
                        first: *first,
                        first_range: first_range.clone(),
                        second: *second,
                        second_range: second_range.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// What `strlen` returns when the string contains symbolic bytes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrlenPolicy {
    /// Return the length of the current concrete bytes and bind the symbolic length to the return register.
    #[default]
    ConcreteAndSymbolic,
    /// Only bind the symbolic length; the concrete return register is left alone.
    SymbolicOnly,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputLength {
    /// Use the size argument the program passed.
    #[default]
    Argument,
    Fixed(u64),
}

/// How bounded-input hooks (`fgets`) symbolize their buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputPolicy {
    /// Constrain each symbolized byte to printable ASCII (`0x20..0x7F`).
    pub printable: bool,
    pub length: InputLength,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    pub layout: Layout,
    /// Argument vector handed to the program's `main`.
    pub argv: Vec<String>,
    /// What `getlogin` reports.
    pub login: String,
    /// Maximum number of bytes scanned when looking for a string terminator.
    pub max_string_len: u64,
    pub strlen: StrlenPolicy,
    pub input: InputPolicy,
    /// Imports that must never be called. They are patched to an address that faults when reached.
    pub unbound: Vec<String>,
}

impl Default for HookConfig {
    fn default() -> Self {
        HookConfig {
            layout: Layout::default(),
            argv: ["./programm", "1", "2", "3", "4"].iter().map(|s| s.to_string()).collect(),
            login: "Hacker1337".to_string(),
            max_string_len: 0x1000,
            strlen: StrlenPolicy::default(),
            input: InputPolicy::default(),
            unbound: Vec::new(),
        }
    }
}

impl HookConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(Error::from)
    }
}
