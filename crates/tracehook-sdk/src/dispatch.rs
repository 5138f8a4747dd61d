use thiserror::Error;

/// The three fixed trampoline targets a patched prologue dispatches to.
///
/// Fixed once at `Engine::init` and immutable thereafter: every trampoline
/// the engine builds for the lifetime of the process jumps at one of these
/// three addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchTargets {
    /// Called on function entry, before the original prologue runs.
    entry: usize,
    /// Called on function exit (return-address interception).
    exit: usize,
    /// Called for sites patched with the `dentry` (dynamic-entry) ABI,
    /// used by `Fentry`/`Pg`-strategy sites that already expect a single
    /// call-target rewrite rather than a full trampoline jump.
    dentry: usize,
}

/// `DispatchTargets::new` was given a null address.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("dispatch target address must be non-null")]
pub struct DispatchError;

impl DispatchTargets {
    /// Builds a target triplet, rejecting null addresses up front so every
    /// later trampoline write can assume a valid call target.
    pub fn new(entry: usize, exit: usize, dentry: usize) -> Result<Self, DispatchError> {
        if entry == 0 || exit == 0 || dentry == 0 {
            return Err(DispatchError);
        }
        Ok(Self { entry, exit, dentry })
    }

    /// Entry trampoline target.
    pub fn entry(&self) -> usize {
        self.entry
    }

    /// Exit trampoline target.
    pub fn exit(&self) -> usize {
        self.exit
    }

    /// `dentry`-ABI call target, for `Fentry`/`Pg` strategy sites.
    pub fn dentry(&self) -> usize {
        self.dentry
    }
}
