use thiserror::Error;

/// Why a candidate symbol was skipped without attempting a patch.
///
/// Skips are not failures: the candidate was never going to be patched
/// (it didn't match the pattern list, or it's on the always-skip list, or
/// it's too small for any strategy to touch), so they're counted
/// separately from [`FailReason`] in the per-module diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SkipReason {
    /// Did not match the effective patch-pattern list.
    #[error("no pattern match")]
    NoMatch,
    /// On the always-skip list (`_start`, `__libc_csu_init`, ...), or not
    /// an `STT_FUNC` symbol.
    #[error("always-skip symbol or non-function symbol type")]
    NonInstrumentable,
    /// Smaller than both the call-instruction floor and the configured
    /// minimum patch size.
    #[error("symbol smaller than the minimum patchable size")]
    TooSmall,
    /// An `IFUNC` resolver stub; not a stable call target.
    #[error("symbol is an ifunc resolver")]
    IFunc,
    /// An unpatch pass matched this symbol, but it was never patched (or
    /// was already unpatched). Not an error: unpatch is idempotent.
    #[error("symbol is not currently patched")]
    NotPatched,
}

/// Why a patch attempt on a matched, instrumentable symbol did not
/// succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailReason {
    /// The disassembler shim refused the prologue (unsupported
    /// instruction, insufficient bytes before a control-flow instruction
    /// it couldn't relocate, and similar).
    #[error("prologue could not be disassembled or relocated: {0}")]
    Disassembly(String),
    /// The instruction store ran out of pre-reserved capacity for either
    /// relocated bytes or a trampoline slot.
    #[error("instruction store exhausted")]
    StoreExhausted,
    /// A previous attempt on this symbol left it half-patched and it is
    /// now on the bad-symbol list; it will not be retried.
    #[error("symbol previously recorded as a bad symbol")]
    BadSymbol,
    /// The cross-thread steering handshake could not complete (a peer
    /// thread could not be signalled, or did not reach the rendezvous).
    #[error("steering handshake failed: {0}")]
    Steering(String),
}

/// The per-symbol result of a patch (or unpatch) attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The symbol is now patched (or, for an unpatch pass, restored).
    Success,
    /// The symbol was never attempted.
    Skipped(SkipReason),
    /// The symbol was attempted and the rewrite did not complete.
    Failed(FailReason),
}

impl PatchOutcome {
    /// `true` for [`PatchOutcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, PatchOutcome::Success)
    }

    /// `true` for [`PatchOutcome::Skipped`].
    pub fn is_skipped(&self) -> bool {
        matches!(self, PatchOutcome::Skipped(_))
    }

    /// `true` for [`PatchOutcome::Failed`].
    pub fn is_failed(&self) -> bool {
        matches!(self, PatchOutcome::Failed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates_match_their_variant() {
        assert!(PatchOutcome::Success.is_success());
        assert!(PatchOutcome::Skipped(SkipReason::NoMatch).is_skipped());
        assert!(PatchOutcome::Failed(FailReason::StoreExhausted).is_failed());
        assert!(!PatchOutcome::Success.is_failed());
    }
}
