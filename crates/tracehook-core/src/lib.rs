//! Live code-patching engine for self-instrumenting x86_64 Linux processes.
//!
//! This crate discovers instrumentable modules and functions in the
//! current process, builds per-module trampolines, and rewrites function
//! prologues in place so that every matched function dispatches through
//! a fixed [`tracehook_sdk::DispatchTargets`] triplet before running its
//! original body. The hard part isn't the rewrite itself: other threads
//! may be executing the bytes being rewritten at the moment of the write,
//! so the engine runs a short signal-based handshake around every
//! general-purpose patch to make sure no thread ever observes a torn
//! instruction.
//!
//! ```rust,ignore
//! use tracehook_core::{Engine, PatchConfig};
//! use tracehook_sdk::DispatchTargets;
//!
//! let targets = DispatchTargets::new(entry as usize, exit as usize, dentry as usize)?;
//! let mut engine = Engine::new(targets, PatchConfig::from_env());
//! engine.init(&loader, &["*"], &[])?;
//! engine.update()?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod compiler_assisted;
pub mod config;
pub mod disasm;
#[cfg(test)]
pub mod elf_ref;
pub mod engine;
pub mod error;
pub mod instr_store;
mod maps;
pub mod module;
pub mod pattern;
pub mod protocol;
pub mod signals;
pub mod stats;

pub use config::PatchConfig;
pub use engine::{Engine, ProcessState};
pub use error::EngineError;

pub use tracehook_sdk::{
    DispatchTargets, FailReason, ModuleSource, PatchOutcome, Section, SectionKind, SkipReason,
    StrategyTag, Symbol, SymbolTable, SymbolType,
};
