//! Intercepts calls from an emulated binary into its C library.
//!
//! The image's imports are patched to point at synthetic addresses. When execution reaches one of those addresses the
//! [`Dispatcher`] runs a handler that reads arguments through the [`Abi`] view, performs the call's effect on the
//! engine, and returns control to the caller. Handlers can attach symbolic values, which is how `strlen` and `fgets`
//! feed a concolic engine.

pub mod abi;
pub mod arch;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod heap;
pub mod hex;
pub mod hooks;
pub mod image;
pub mod memory;
pub mod sim;

pub use abi::Abi;
pub use arch::{ArchId, Profile, Reg, Role};
pub use config::HookConfig;
pub use dispatch::{Dispatcher, Exit};
pub use engine::{Engine, Step};
pub use error::{Error, Result};
pub use hooks::{Continuation, HookKind, HookResult, HookTable};
