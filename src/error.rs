use std::io;
use std::ops::Range;

use crate::arch::ArchId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("Unknown register role {role:?} for {arch}")]
    UnknownRole { role: String, arch: String },

    #[error("Profile is for {profile} but the engine is configured for {engine}")]
    ArchMismatch { profile: ArchId, engine: ArchId },

    #[error("Reached invalid hook at 0x{address:X}")]
    InvalidHookReached { address: u64 },

    #[error("No terminator within 0x{window:X} bytes of string at 0x{address:X}")]
    UnterminatedString { address: u64, window: u64 },

    #[error("Tried to access unmapped memory: 0x{:X}..0x{:X}", .range.start, .range.end)]
    UnmappedMemoryAccess { range: Range<u64> },

    #[error("Address ranges overlap: {first} 0x{:X}..0x{:X} and {second} 0x{:X}..0x{:X}",
        .first_range.start, .first_range.end, .second_range.start, .second_range.end)]
    AddressOverlap {
        first: &'static str,
        first_range: Range<u64>,
        second: &'static str,
        second_range: Range<u64>,
    },

    #[error("{region} at 0x{base:X} with size 0x{size:X} does not fit in the address space")]
    InvalidLayout { region: &'static str, base: u64, size: u64 },

    #[error("Hook {0:?} registered twice")]
    DuplicateHook(String),

    #[error("Hook {0:?} needs a handler")]
    MissingHandler(String),

    #[error("Heap exhausted: cannot allocate 0x{requested:X} bytes at 0x{cursor:X} (end 0x{end:X})")]
    HeapExhausted { requested: u64, cursor: u64, end: u64 },

    #[error("Invalid image: {0}")]
    Image(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
