//! Environment-driven engine configuration, read once at [`crate::Engine::init`].

use std::env;

/// The unconditional floor below which no strategy will even be
/// attempted: a `call` instruction plus at least one following byte to
/// overwrite with a trap.
pub const MIN_PATCHABLE_SIZE: u64 = 6;

/// Configuration read once from the environment at `init` time.
///
/// There is no config file and no `serde` layer here: this reads two
/// environment variables and nothing else, deliberately keeping that
/// surface rather than growing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchConfig {
    /// Minimum symbol size, in bytes, to attempt a patch on. Functions
    /// smaller than `max(MIN_PATCHABLE_SIZE, patch_min_size)` are skipped
    /// with [`tracehook_sdk::SkipReason::TooSmall`].
    pub patch_min_size: u64,
    /// Minimum symbol size, in bytes, to attempt an unpatch on. Allowed
    /// to differ from `patch_min_size` because unpatching a
    /// `PATCHABLE`/`FENTRY` site only needs room for the 5-byte NOP it
    /// restores, not a full call instruction.
    pub unpatch_min_size: u64,
}

impl PatchConfig {
    /// Reads `TRACEHOOK_PATCH_SIZE` and `TRACEHOOK_UNPATCH_SIZE`, falling back
    /// to [`MIN_PATCHABLE_SIZE`] for either that is unset or unparsable.
    pub fn from_env() -> Self {
        Self {
            patch_min_size: read_size_env("TRACEHOOK_PATCH_SIZE").unwrap_or(MIN_PATCHABLE_SIZE),
            unpatch_min_size: read_size_env("TRACEHOOK_UNPATCH_SIZE").unwrap_or(MIN_PATCHABLE_SIZE),
        }
    }

    /// The effective minimum patch size: the larger of the unconditional
    /// floor and the configured one.
    pub fn effective_patch_min_size(&self) -> u64 {
        self.patch_min_size.max(MIN_PATCHABLE_SIZE)
    }
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self { patch_min_size: MIN_PATCHABLE_SIZE, unpatch_min_size: MIN_PATCHABLE_SIZE }
    }
}

fn read_size_env(key: &str) -> Option<u64> {
    env::var(key).ok()?.parse().ok()
}
