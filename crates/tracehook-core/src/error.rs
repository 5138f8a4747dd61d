//! Top-level error types for batch-fatal conditions.
//!
//! Per-symbol results never use these: a symbol that can't be patched is a
//! [`tracehook_sdk::PatchOutcome::Failed`], not an `Err`. These types are
//! for conditions that abort an entire `init`/`update` pass.

use std::io;
use thiserror::Error;

/// A resource the engine could not obtain from the kernel.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// `mmap` for a trampoline or instruction-store page failed.
    #[error("mmap failed: {0}")]
    Mmap(#[source] io::Error),
    /// `mprotect` to flip a page between writable and executable failed.
    #[error("mprotect failed: {0}")]
    Mprotect(#[source] io::Error),
    /// `sigaction` to install the trap or steering handler failed.
    #[error("sigaction failed: {0}")]
    Sigaction(#[source] io::Error),
    /// No unused real-time signal slot (`SIGRTMIN`..`SIGRTMAX`) could be
    /// found for the steering handshake.
    #[error("no unused real-time signal available for the steering handshake")]
    SigrtExhausted,
    /// `membarrier(MEMBARRIER_CMD_PRIVATE_EXPEDITED_SYNC_CORE)` is not
    /// supported by this kernel and the legacy SIGRT+cpuid fallback also
    /// failed.
    #[error("no instruction-cache serialization mechanism available: {0}")]
    SerializationUnavailable(#[source] io::Error),
}

/// Fatal errors from [`crate::Engine::init`], [`crate::Engine::update`], or
/// [`crate::Engine::teardown`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// A kernel resource needed before any patching can proceed was
    /// unavailable.
    #[error(transparent)]
    Resource(#[from] ResourceError),
    /// An internal map lookup that should be infallible by construction
    /// came back empty.
    ///
    /// This can only be reported from instrumenter-thread code (recovery,
    /// teardown); the equivalent situation inside the trap or steering
    /// signal handler cannot return a `Result` and aborts the process
    /// instead, since there is no safe way to unwind out of signal
    /// context with a corrupted map.
    #[error("internal lookup miss for address {address:#x}")]
    LookupMiss {
        /// The address that should have had a map entry.
        address: usize,
    },
    /// `init` was called a second time on an already-initialized engine.
    #[error("engine already initialized")]
    AlreadyInitialized,
    /// `update` or `teardown` was called before `init`.
    #[error("engine not yet initialized")]
    NotInitialized,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_error_wraps_into_engine_error() {
        let e: EngineError = ResourceError::SigrtExhausted.into();
        assert!(matches!(e, EngineError::Resource(ResourceError::SigrtExhausted)));
    }
}
