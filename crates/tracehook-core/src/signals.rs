//! Low-level OS primitives the patch protocol builds its handshake on:
//! finding a spare real-time signal, enumerating peer threads, and
//! serializing instruction caches across cores. The orchestration that
//! uses these (the trap handler, the steering handler, the seven-step
//! patch protocol) lives in [`crate::protocol`]; this module only talks
//! to the kernel.

use crate::error::ResourceError;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

/// Not registered with `libc`/the kernel uapi headers directly; pulled
/// from `linux/membarrier.h`.
const MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED_SYNC_CORE: libc::c_int = 64;
const MEMBARRIER_CMD_PRIVATE_EXPEDITED_SYNC_CORE: libc::c_int = 32;

static MEMBARRIER_REGISTERED: AtomicBool = AtomicBool::new(false);

/// Serializes every core's instruction cache/pipeline so a just-written
/// displacement is visible before the site is armed.
///
/// Prefers `membarrier(MEMBARRIER_CMD_PRIVATE_EXPEDITED_SYNC_CORE)`
/// (registering once, lazily, on first use); on kernels that predate it
/// (`ENOSYS`) falls back to [`legacy_serialize_via_signal`], a
/// SIGRT+cpuid trick.
pub fn serialize_instruction_cache(legacy_sigrt: libc::c_int) -> Result<(), ResourceError> {
    if !MEMBARRIER_REGISTERED.load(Ordering::Relaxed) {
        let ret = unsafe {
            libc::syscall(libc::SYS_membarrier, MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED_SYNC_CORE, 0)
        };
        if ret == 0 {
            MEMBARRIER_REGISTERED.store(true, Ordering::Relaxed);
        } else {
            return legacy_serialize_via_signal(legacy_sigrt);
        }
    }

    let ret = unsafe { libc::syscall(libc::SYS_membarrier, MEMBARRIER_CMD_PRIVATE_EXPEDITED_SYNC_CORE, 0) };
    if ret == 0 {
        Ok(())
    } else {
        legacy_serialize_via_signal(legacy_sigrt)
    }
}

/// Pre-`membarrier` fallback: send `sig` to every peer thread. Each
/// thread's handler executes a serializing instruction (`cpuid`) before
/// returning, which is enough to flush its instruction pipeline.
fn legacy_serialize_via_signal(sig: libc::c_int) -> Result<(), ResourceError> {
    send_signal_to_all_threads(sig).map_err(ResourceError::Sigaction)
}

/// Every thread ID in the current process, read from `/proc/self/task`.
pub fn enumerate_thread_ids() -> io::Result<Vec<libc::pid_t>> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir("/proc/self/task")? {
        let entry = entry?;
        if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse::<libc::pid_t>().ok()) {
            ids.push(tid);
        }
    }
    Ok(ids)
}

/// Sends `sig` to every thread in the process (including the caller) via
/// `tgkill`.
pub fn send_signal_to_all_threads(sig: libc::c_int) -> io::Result<()> {
    let pid = unsafe { libc::getpid() };
    for tid in enumerate_thread_ids()? {
        let ret = unsafe { libc::syscall(libc::SYS_tgkill, pid, tid, sig) };
        if ret != 0 {
            // A thread that exited between the scan and the signal is not
            // an error worth aborting the pass over.
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err);
            }
        }
    }
    Ok(())
}

/// Finds the lowest-numbered real-time signal not already claimed by
/// this process (checked via `sigaction`'s "query" form: a `NULL` new
/// action just reads the current disposition).
pub fn find_unused_sigrt() -> Result<libc::c_int, ResourceError> {
    let lo = unsafe { libc::SIGRTMIN() };
    let hi = unsafe { libc::SIGRTMAX() };
    for sig in lo..=hi {
        let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::sigaction(sig, std::ptr::null(), &mut old) };
        if ret != 0 {
            continue;
        }
        if old.sa_sigaction == libc::SIG_DFL {
            return Ok(sig);
        }
    }
    Err(ResourceError::SigrtExhausted)
}

/// Installs `handler` for `sig` with `SA_SIGINFO | SA_RESTART` so a trap
/// mid-syscall doesn't spuriously fail the interrupted call.
///
/// # Safety
/// `handler` must be async-signal-safe: no allocation, no locking, no
/// logging, and it must only touch its own `ucontext_t` argument.
pub unsafe fn install_signal_handler(
    sig: libc::c_int,
    handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void),
) -> Result<(), ResourceError> {
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = handler as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    libc::sigemptyset(&mut action.sa_mask);
    let ret = libc::sigaction(sig, &action, std::ptr::null_mut());
    if ret != 0 {
        return Err(ResourceError::Sigaction(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerate_thread_ids_includes_the_current_thread() {
        let ids = enumerate_thread_ids().unwrap();
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as libc::pid_t;
        assert!(ids.contains(&tid));
    }

    #[test]
    fn find_unused_sigrt_returns_a_value_in_range() {
        let sig = find_unused_sigrt().unwrap();
        assert!(sig >= unsafe { libc::SIGRTMIN() });
        assert!(sig <= unsafe { libc::SIGRTMAX() });
    }
}
