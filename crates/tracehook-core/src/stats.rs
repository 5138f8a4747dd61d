//! Per-module patch statistics and the integer-only percentage
//! arithmetic used to render them.

use std::fmt;

/// Integer-only percentage split into whole and hundredths parts. Kept
/// as integer arithmetic not for any resource constraint but so the
/// rendered value is bit-for-bit reproducible between runs, which the
/// exact-integer tests rely on.
pub fn calc_percent(n: u64, total: u64) -> (u64, u64) {
    if total == 0 {
        return (0, 0);
    }
    let quot = 100 * n / total;
    let rem = (100 * n - quot * total) * 100 / total;
    (quot, rem)
}

/// Aggregate outcome counts for one module's patch (or unpatch) pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchStats {
    /// Candidate symbols considered (matched the pattern list and passed
    /// the always-skip/size filters).
    pub total: u64,
    /// Symbols successfully patched.
    pub patched: u64,
    /// Symbols attempted and failed.
    pub failed: u64,
    /// Symbols skipped before any attempt.
    pub skipped: u64,
    /// Symbols in the module that did not match the pattern list at all
    /// (tracked separately from `skipped`, which is post-match).
    pub no_match: u64,
}

impl PatchStats {
    /// `patched` as a percentage of `total`, as `(whole, hundredths)`.
    pub fn patched_percent(&self) -> (u64, u64) {
        calc_percent(self.patched, self.total)
    }
}

impl fmt::Display for PatchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (whole, frac) = self.patched_percent();
        write!(
            f,
            "{}/{} patched ({whole}.{frac:02}%), {} failed, {} skipped, {} no-match",
            self.patched, self.total, self.failed, self.skipped, self.no_match
        )
    }
}
