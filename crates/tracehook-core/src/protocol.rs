//! The general-purpose (`StrategyTag::None`) patch protocol: the
//! seven-step sequence that rewrites a live prologue to a `call
//! trampoline` while other threads may be executing it, plus the
//! async-signal-safe trap and steering handlers the sequence depends on.
//!
//! Step sequence:
//!
//! 1. Caller has already disassembled, relocated, and saved the original
//!    prologue (see [`crate::disasm`], [`crate::instr_store`]).
//! 2. Install a trap record for the site, write `0xCC` at its first byte,
//!    fence.
//! 3. Herd peer threads: register a steering entry for the site, signal
//!    every thread with the steering real-time signal. Any peer whose
//!    `RIP` is sitting exactly at the site gets its `ucontext_t` rewritten
//!    to emulate `call trampoline` right there, so it can never resume
//!    into a half-written instruction.
//! 4. Write the 4-byte `call` displacement (bytes 1..5).
//! 5. Serialize instruction caches across cores ([`crate::signals`]).
//! 6. Arm: flip the site's first byte from `0xCC` to `0xE8`.
//! 7. Remove the trap record and steering entry; the site is now a plain
//!    live call and traps are no longer expected there.

use crate::error::{EngineError, ResourceError};
use crate::maps::SignalSafeMap;
use crate::signals;
use once_cell::sync::OnceCell;
use std::sync::atomic::{fence, AtomicPtr, Ordering};

/// A site with a trap installed: where the emulated call should land,
/// and the bookkeeping needed to synthesize a correct return address.
#[derive(Debug, Clone, Copy)]
struct TrapRecord {
    trampoline_addr: usize,
    function_start: usize,
    /// Canonical return address external code expects (`function_start +
    /// prologue_len`), used as the pushed return address regardless of
    /// where the trap actually fired.
    emulated_return: usize,
    /// Where the relocated prologue copy (or the post-prologue original
    /// code) actually resumes; recorded in the emulated-return-address
    /// map if it differs from `emulated_return`.
    real_return: usize,
}

/// What to do with a peer thread caught by the steering handler at a
/// given address.
#[derive(Debug, Clone, Copy)]
enum SteeringAction {
    /// The thread is sitting exactly where the trap byte would be (or
    /// now is): treat it exactly like a trap, synthesizing `call
    /// trampoline` as if it had just entered the function.
    EmulateEntry { trampoline_addr: usize, emulated_return: usize },
    /// The thread is somewhere else inside the window being rewritten
    /// (mid-prologue, or already running in the out-of-line copy during
    /// unpatch); just move `RIP` to the equivalent point in the other
    /// copy, with no call synthesis — it already "entered" normally.
    Redirect { target: usize },
}

/// Everything the trap/steering handlers need, reachable from signal
/// context through a single global pointer (signal handlers are plain
/// `extern "C"` functions; they cannot capture state).
pub struct PatchProtocol {
    trap_records: SignalSafeMap<TrapRecord>,
    steering: SignalSafeMap<SteeringAction>,
    emulated_returns: SignalSafeMap<usize>,
    legacy_sigrt: libc::c_int,
}

static ACTIVE: OnceCell<AtomicPtr<PatchProtocol>> = OnceCell::new();

impl PatchProtocol {
    /// Builds a protocol instance. `capacity_hint` sizes the trap/
    /// steering/emulated-return maps; it is never grown afterwards since
    /// they may be read from signal context.
    pub fn new(capacity_hint: usize) -> Result<Self, ResourceError> {
        Ok(PatchProtocol {
            trap_records: SignalSafeMap::with_capacity(capacity_hint),
            steering: SignalSafeMap::with_capacity(capacity_hint),
            emulated_returns: SignalSafeMap::with_capacity(capacity_hint),
            legacy_sigrt: signals::find_unused_sigrt()?,
        })
    }

    /// Installs the `SIGTRAP` and steering-signal handlers and publishes
    /// `self` as the active protocol instance. Must be called exactly
    /// once per process; a second call returns
    /// [`EngineError::AlreadyInitialized`].
    pub fn install(self: Box<Self>) -> Result<&'static Self, EngineError> {
        let leaked: &'static Self = Box::leak(self);
        let cell = ACTIVE.get_or_init(|| AtomicPtr::new(std::ptr::null_mut()));
        let prev = cell.compare_exchange(
            std::ptr::null_mut(),
            leaked as *const Self as *mut Self,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if prev.is_err() {
            return Err(EngineError::AlreadyInitialized);
        }

        unsafe {
            signals::install_signal_handler(libc::SIGTRAP, trap_handler)?;
            signals::install_signal_handler(leaked.legacy_sigrt, steering_handler)?;
        }
        Ok(leaked)
    }

    /// Resolves an emulated return address (one synthesized by the trap
    /// or steering handler) back to the real continuation address.
    /// Returns `emulated` unchanged if no ENDBR64 shift applied.
    pub fn resolve_return_address(&self, emulated: usize) -> usize {
        match self.emulated_returns.get(emulated) {
            Some(p) => unsafe { *p },
            None => emulated,
        }
    }

    /// Runs the seven-step protocol for one site. `site.steering_points`
    /// carries one `(original_addr, relocated_addr)` pair per instruction
    /// boundary in the prologue window; every boundary other than
    /// `site_addr` itself gets a plain [`SteeringAction::Redirect`] into
    /// the relocated copy, since a peer thread sitting there is already
    /// mid-execution and must simply continue, not receive a synthesized
    /// fresh call.
    pub fn patch_site(&self, site: PreparedPatch) -> Result<(), crate::FailReason> {
        let record = TrapRecord {
            trampoline_addr: site.trampoline_addr,
            function_start: site.function_start,
            emulated_return: site.emulated_return,
            real_return: site.real_return,
        };
        self.trap_records.insert(site.site_addr, record);
        if site.emulated_return != site.real_return {
            self.emulated_returns.insert(site.emulated_return, site.real_return);
        }

        unsafe {
            std::ptr::write_volatile(site.site_addr as *mut u8, 0xCC);
        }
        fence(Ordering::SeqCst);

        for &(orig_addr, relocated_addr) in &site.steering_points {
            let action = if orig_addr == site.site_addr {
                SteeringAction::EmulateEntry {
                    trampoline_addr: site.trampoline_addr,
                    emulated_return: site.emulated_return,
                }
            } else {
                SteeringAction::Redirect { target: relocated_addr }
            };
            self.steering.insert(orig_addr, action);
        }
        signals::send_signal_to_all_threads(self.legacy_sigrt)
            .map_err(|e| crate::FailReason::Steering(e.to_string()))?;

        unsafe {
            let disp_ptr = (site.site_addr + 1) as *mut u32;
            std::ptr::write_unaligned(disp_ptr, site.call_displacement);
        }

        signals::serialize_instruction_cache(self.legacy_sigrt)
            .map_err(|e| crate::FailReason::Steering(e.to_string()))?;

        unsafe {
            std::ptr::write_volatile(site.site_addr as *mut u8, 0xE8);
        }

        for &(orig_addr, _) in &site.steering_points {
            self.steering.remove(orig_addr);
        }
        self.trap_records.remove(site.site_addr);
        Ok(())
    }

    /// Reverses a patched site back to its saved original bytes. Used
    /// both for a normal unpatch pass and for bad-symbol recovery on
    /// teardown.
    ///
    /// Mirrors `patch_site`'s herding step in reverse: any peer thread
    /// still running inside the relocated out-of-line copy gets steered
    /// back to the equivalent point in the just-restored original, so it
    /// never resumes into code the instruction store may reuse or unmap
    /// later.
    pub fn unpatch_site(&self, site: UnpatchSite) -> Result<(), crate::FailReason> {
        self.trap_records.remove(site.site_addr);
        for &(orig_addr, _) in &site.steering_points {
            self.steering.remove(orig_addr);
        }

        unsafe {
            std::ptr::write_volatile(site.site_addr as *mut u8, 0xCC);
        }
        fence(Ordering::SeqCst);
        unsafe {
            std::ptr::copy_nonoverlapping(
                site.original_bytes.as_ptr(),
                site.site_addr as *mut u8,
                site.original_bytes.len(),
            );
        }

        for &(orig_addr, relocated_addr) in &site.steering_points {
            self.steering.insert(relocated_addr, SteeringAction::Redirect { target: orig_addr });
        }
        signals::send_signal_to_all_threads(self.legacy_sigrt)
            .map_err(|e| crate::FailReason::Steering(e.to_string()))?;

        signals::serialize_instruction_cache(self.legacy_sigrt)
            .map_err(|e| crate::FailReason::Steering(e.to_string()))?;

        for &(_, relocated_addr) in &site.steering_points {
            self.steering.remove(relocated_addr);
        }
        Ok(())
    }
}

/// A fully-prepared patch site ready for [`PatchProtocol::patch_site`]:
/// disassembly, relocation, and original-byte saving have already
/// happened upstream.
pub struct PreparedPatch {
    /// Address of the first byte being rewritten.
    pub site_addr: usize,
    /// Trampoline this site's `call` targets once armed.
    pub trampoline_addr: usize,
    /// The patched function's entry address.
    pub function_start: usize,
    /// `rel32` displacement from `site_addr + 5` to `trampoline_addr`.
    pub call_displacement: u32,
    /// Canonical return address (`function_start + prologue_len`).
    pub emulated_return: usize,
    /// Actual continuation address if it differs from `emulated_return`
    /// (ENDBR64 shift); equal to `emulated_return` otherwise.
    pub real_return: usize,
    /// `(original_addr, relocated_addr)` for every instruction boundary in
    /// the prologue window, including `site_addr` itself. Every entry
    /// other than `site_addr` gets a [`SteeringAction::Redirect`]; only
    /// `site_addr` gets the full call-emulating treatment.
    pub steering_points: Vec<(usize, usize)>,
}

/// A previously patched site being reversed: the bytes to restore, and
/// the same boundary list used to herd peers back out of the relocated
/// copy.
pub struct UnpatchSite {
    /// Address of the first byte being restored.
    pub site_addr: usize,
    /// The bytes saved at patch time.
    pub original_bytes: Vec<u8>,
    /// `(original_addr, relocated_addr)` pairs, reused in reverse: any
    /// peer thread caught at `relocated_addr` gets redirected back to
    /// `original_addr`.
    pub steering_points: Vec<(usize, usize)>,
}

/// Rewrites `ctx`'s `RIP`/`RSP` to emulate `call target` as if the CPU
/// had executed it at the trap site, pushing `return_addr`.
///
/// # Safety
/// Must only run inside a signal handler operating on its own delivered
/// `ucontext_t`.
unsafe fn emulate_call(ctx: *mut libc::c_void, target: usize, return_addr: usize) {
    let ucontext = &mut *(ctx as *mut libc::ucontext_t);
    let rsp = ucontext.uc_mcontext.gregs[libc::REG_RSP as usize] as usize;
    let new_rsp = rsp - 8;
    std::ptr::write((new_rsp) as *mut u64, return_addr as u64);
    ucontext.uc_mcontext.gregs[libc::REG_RSP as usize] = new_rsp as i64;
    ucontext.uc_mcontext.gregs[libc::REG_RIP as usize] = target as i64;
}

/// Rewrites `ctx`'s `RIP` alone, for a peer thread that is already
/// mid-execution inside the window being rewritten and just needs to
/// continue at the equivalent point in the other copy; unlike
/// [`emulate_call`] this never touches `RSP`.
///
/// # Safety
/// Must only run inside a signal handler operating on its own delivered
/// `ucontext_t`.
unsafe fn redirect_rip(ctx: *mut libc::c_void, target: usize) {
    let ucontext = &mut *(ctx as *mut libc::ucontext_t);
    ucontext.uc_mcontext.gregs[libc::REG_RIP as usize] = target as i64;
}

fn active_protocol() -> Option<&'static PatchProtocol> {
    let ptr = ACTIVE.get()?.load(Ordering::Acquire);
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { &*ptr })
    }
}

/// `SIGTRAP` handler: a thread hit the `0xCC` installed at a patch site
/// mid-rewrite. Async-signal-safe: no allocation, no lock, no logging.
extern "C" fn trap_handler(_sig: libc::c_int, _info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let Some(protocol) = active_protocol() else {
        // No protocol installed; nothing we can safely do but terminate
        // (this can only happen if the trap fired after teardown, which
        // is a correctness bug in map lifecycle, not a runtime condition).
        unsafe { libc::abort() };
    };

    let rip = unsafe {
        let ucontext = &*(ctx as *const libc::ucontext_t);
        ucontext.uc_mcontext.gregs[libc::REG_RIP as usize] as usize
    };
    // INT3 leaves RIP one past the trapping byte.
    let site_addr = rip.wrapping_sub(1);

    match protocol.trap_records.get(site_addr) {
        Some(record_ptr) => {
            let record = unsafe { *record_ptr };
            unsafe { emulate_call(ctx, record.trampoline_addr, record.emulated_return) };
        }
        None => unsafe { libc::abort() },
    }
}

/// Steering handler: fired on every thread during step 3 of the patch
/// protocol. A thread whose `RIP` is not at a site currently being
/// herded does nothing and returns immediately.
extern "C" fn steering_handler(_sig: libc::c_int, _info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let Some(protocol) = active_protocol() else { return };

    let rip = unsafe {
        let ucontext = &*(ctx as *const libc::ucontext_t);
        ucontext.uc_mcontext.gregs[libc::REG_RIP as usize] as usize
    };

    if let Some(action_ptr) = protocol.steering.get(rip) {
        let action = unsafe { *action_ptr };
        match action {
            SteeringAction::EmulateEntry { trampoline_addr, emulated_return } => {
                unsafe { emulate_call(ctx, trampoline_addr, emulated_return) };
            }
            SteeringAction::Redirect { target } => {
                unsafe { redirect_rip(ctx, target) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_return_address_passes_through_when_unmapped() {
        let protocol = PatchProtocol::new(8).unwrap();
        assert_eq!(protocol.resolve_return_address(0x4000), 0x4000);
    }

    #[test]
    fn resolve_return_address_follows_the_endbr_shift_mapping() {
        let protocol = PatchProtocol::new(8).unwrap();
        protocol.emulated_returns.insert(0x4000, 0x4004);
        assert_eq!(protocol.resolve_return_address(0x4000), 0x4004);
    }
}
