//! Atomic rewrites for the three compiler-assisted strategies
//! (`FentryNop`/`Patchable`, `Xray`, `Fentry`/`Pg`). None of these need
//! the steering handshake [`crate::protocol`] implements: the compiler
//! already reserved a fixed, naturally-aligned slot for them, so a single
//! aligned store is atomic with respect to any thread concurrently
//! fetching the instruction.

use crate::FailReason;

/// A NOP-sled call slot (`FentryNop`/`Patchable`) or an XRay sled entry:
/// 5 bytes of `call`/`jmp rel32` plus 3 bytes of padding, occupying one
/// naturally-aligned 8-byte word.
fn write_call_word(site_addr: usize, opcode: u8, trampoline_addr: usize) -> Result<(), FailReason> {
    if site_addr % 8 != 0 {
        return Err(FailReason::Disassembly(format!(
            "compiler-assisted call slot at {site_addr:#x} is not 8-byte aligned"
        )));
    }
    let disp = (trampoline_addr as i64 - (site_addr as i64 + 5)) as i32;
    let mut bytes = [0x90u8; 8];
    bytes[0] = opcode;
    bytes[1..5].copy_from_slice(&disp.to_le_bytes());
    let word = u64::from_le_bytes(bytes);
    unsafe {
        std::ptr::write_volatile(site_addr as *mut u64, word);
    }
    Ok(())
}

/// Patches a `FentryNop`/`Patchable` NOP-sled slot to `call trampoline`.
pub fn patch_nop_sled(site_addr: usize, trampoline_addr: usize) -> Result<(), FailReason> {
    write_call_word(site_addr, 0xE8, trampoline_addr)
}

/// Restores a `FentryNop`/`Patchable` slot to an 8-byte NOP sled.
pub fn unpatch_nop_sled(site_addr: usize) -> Result<(), FailReason> {
    if site_addr % 8 != 0 {
        return Err(FailReason::Disassembly(format!("call slot at {site_addr:#x} is not 8-byte aligned")));
    }
    let word = u64::from_le_bytes([0x90; 8]);
    unsafe {
        std::ptr::write_volatile(site_addr as *mut u64, word);
    }
    Ok(())
}

/// Patches an XRay entry sled (`call trampoline`).
pub fn patch_xray_entry(site_addr: usize, trampoline_addr: usize) -> Result<(), FailReason> {
    write_call_word(site_addr, 0xE8, trampoline_addr)
}

/// Patches an XRay exit sled (`jmp trampoline`); XRay's exit sled is a
/// tail jump rather than a call since there is no return into it.
pub fn patch_xray_exit(site_addr: usize, trampoline_addr: usize) -> Result<(), FailReason> {
    write_call_word(site_addr, 0xE9, trampoline_addr)
}

/// Restores either XRay sled to an 8-byte NOP sled.
pub fn unpatch_xray_sled(site_addr: usize) -> Result<(), FailReason> {
    unpatch_nop_sled(site_addr)
}

/// Rewrites the displacement of an already-live `call` (a `Fentry`/`Pg`
/// site) to point at `trampoline_addr` instead of its original target.
/// The opcode byte is untouched; only the 4-byte operand changes.
pub fn rewrite_live_call_target(site_addr: usize, trampoline_addr: usize) -> Result<(), FailReason> {
    let disp = (trampoline_addr as i64 - (site_addr as i64 + 5)) as i32;
    unsafe {
        std::ptr::write_unaligned((site_addr + 1) as *mut u32, disp as u32);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Decoder, DecoderOptions};
    use std::alloc::{alloc, dealloc, Layout};

    fn with_aligned_buffer(f: impl FnOnce(usize)) {
        let layout = Layout::from_size_align(16, 8).unwrap();
        let ptr = unsafe { alloc(layout) };
        unsafe { std::ptr::write_bytes(ptr, 0x90, 16) };
        f(ptr as usize);
        unsafe { dealloc(ptr, layout) };
    }

    #[test]
    fn patch_nop_sled_encodes_a_decodable_call() {
        with_aligned_buffer(|addr| {
            patch_nop_sled(addr, addr + 0x1000).unwrap();
            let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, 8) };
            let mut decoder = Decoder::with_ip(64, bytes, addr as u64, DecoderOptions::NONE);
            let instr = decoder.decode();
            assert_eq!(instr.code(), iced_x86::Code::Call_rel32_64);
            assert_eq!(instr.near_branch_target(), (addr + 0x1000) as u64);
        });
    }

    #[test]
    fn unpatch_nop_sled_restores_all_nops() {
        with_aligned_buffer(|addr| {
            patch_nop_sled(addr, addr + 0x1000).unwrap();
            unpatch_nop_sled(addr).unwrap();
            let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, 8) };
            assert_eq!(bytes, &[0x90u8; 8]);
        });
    }

    #[test]
    fn rejects_misaligned_slot() {
        with_aligned_buffer(|addr| {
            assert!(patch_nop_sled(addr + 1, addr + 0x1000).is_err());
        });
    }

    #[test]
    fn xray_exit_encodes_a_jmp() {
        with_aligned_buffer(|addr| {
            patch_xray_exit(addr, addr + 0x1000).unwrap();
            let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, 8) };
            let mut decoder = Decoder::with_ip(64, bytes, addr as u64, DecoderOptions::NONE);
            let instr = decoder.decode();
            assert_eq!(instr.code(), iced_x86::Code::Jmp_rel32_64);
        });
    }

    #[test]
    fn rewrite_live_call_target_changes_only_the_operand() {
        with_aligned_buffer(|addr| {
            patch_nop_sled(addr, addr + 0x1000).unwrap();
            rewrite_live_call_target(addr, addr + 0x2000).unwrap();
            let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, 8) };
            assert_eq!(bytes[0], 0xE8);
            let mut decoder = Decoder::with_ip(64, bytes, addr as u64, DecoderOptions::NONE);
            let instr = decoder.decode();
            assert_eq!(instr.near_branch_target(), (addr + 0x2000) as u64);
        });
    }
}
