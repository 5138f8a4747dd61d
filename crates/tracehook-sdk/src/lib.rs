//! Shared vocabulary for the tracehook dynamic code-patching engine.
//!
//! This crate carries no patching logic itself. It exists so that the
//! engine (`tracehook-core`) and anything embedding it agree on the same
//! small set of ABI-facing types without either side depending on the
//! other's internals: the per-function patch strategy, the symbol shape
//! the engine expects a loader to hand it, the narrow ELF contract the
//! engine consumes modules through, and the outcome vocabulary a patch
//! pass reports back.
//!
//! ```rust,ignore
//! use tracehook_sdk::{DispatchTargets, StrategyTag, Symbol, SymbolType};
//!
//! let targets = DispatchTargets::new(entry as usize, exit as usize, dentry as usize)
//!     .expect("dispatch targets must be non-null");
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod dispatch;
mod elf;
mod outcome;
mod types;

pub use dispatch::{DispatchError, DispatchTargets};
pub use elf::{ModuleSource, Section, SectionKind, SymbolTable};
pub use outcome::{FailReason, PatchOutcome, SkipReason};
pub use types::{StrategyTag, Symbol, SymbolType};
