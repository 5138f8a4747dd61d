//! Drives `Engine::init` against a live page while several OS threads spin
//! on the patch site, sandwiching each read of the 4-byte displacement
//! between two reads of the opcode byte. Because the protocol only ever
//! touches the displacement while the opcode is the installed `0xCC` trap
//! (see `tracehook_core::protocol`), a reader that sees the same opcode
//! before and after its displacement read, and that opcode is not `0xCC`,
//! is guaranteed to have read a fully-written, non-torn value.
//!
//! Like `patch_roundtrip.rs`, this file keeps to exactly one test that
//! calls `Engine::init` (the patch protocol is a single process-wide
//! singleton).

use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use tracehook_core::config::PatchConfig;
use tracehook_core::engine::Engine;
use tracehook_core::module::indirect_jump_bytes;
use tracehook_sdk::{DispatchTargets, ModuleSource, Section, Symbol, SymbolTable, SymbolType};

const PROLOGUE: [u8; 6] = [0x55, 0x48, 0x89, 0xe5, 0x31, 0xc0];
const ORIGINAL_TAIL: [u8; 4] = [0x48, 0x89, 0xe5, 0x31];
const TRAP_BYTE: u8 = 0xcc;
const ARMED_BYTE: u8 = 0xe8;

struct OnePageModule {
    start: u64,
    size: u64,
}

impl ModuleSource for OnePageModule {
    fn load_bias(&self) -> u64 {
        0
    }
    fn text_range(&self) -> (u64, u64) {
        (self.start, self.size)
    }
    fn sections(&self) -> &[Section] {
        &[]
    }
}

struct OneSymbolTable(Vec<Symbol>);

impl SymbolTable for OneSymbolTable {
    fn symbols(&self) -> &[Symbol] {
        &self.0
    }
}

/// Reads the opcode byte, then the 4 displacement bytes, then the opcode
/// byte again. Returns `Some(tail)` only when the two opcode reads agree
/// and neither is the trap byte, meaning the middle read cannot have
/// straddled a write.
unsafe fn sandwich_read(site: *const u8) -> Option<(u8, [u8; 4])> {
    let before = ptr::read_volatile(site);
    let tail = [
        ptr::read_volatile(site.add(1)),
        ptr::read_volatile(site.add(2)),
        ptr::read_volatile(site.add(3)),
        ptr::read_volatile(site.add(4)),
    ];
    let after = ptr::read_volatile(site);
    if before == after && before != TRAP_BYTE {
        Some((before, tail))
    } else {
        None
    }
}

#[test]
fn concurrent_readers_never_observe_a_torn_call_site() {
    let page_len = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    let page = unsafe {
        libc::mmap(
            ptr::null_mut(),
            page_len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(page, libc::MAP_FAILED);
    let page = page as *mut u8;
    unsafe {
        ptr::copy_nonoverlapping(PROLOGUE.as_ptr(), page, PROLOGUE.len());
        libc::mprotect(page as *mut libc::c_void, page_len, libc::PROT_READ | libc::PROT_EXEC);
    }
    let site_addr = page as usize;

    let stop = Arc::new(AtomicBool::new(false));
    let violation = Arc::new(AtomicBool::new(false));
    let reader_count = 4;
    let barrier = Arc::new(Barrier::new(reader_count + 1));

    let readers: Vec<_> = (0..reader_count)
        .map(|_| {
            let stop = stop.clone();
            let violation = violation.clone();
            let barrier = barrier.clone();
            let site = site_addr;
            thread::spawn(move || {
                barrier.wait();
                while !stop.load(Ordering::Relaxed) {
                    if let Some((opcode, tail)) = unsafe { sandwich_read(site as *const u8) } {
                        let consistent = match opcode {
                            0x55 => tail == ORIGINAL_TAIL,
                            ARMED_BYTE => true, // displacement value itself validated after the patch completes
                            _ => false,
                        };
                        if !consistent {
                            violation.store(true, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();

    barrier.wait();

    let function_start = site_addr as u64;
    let module = OnePageModule { start: function_start, size: page_len as u64 };
    let symbols = OneSymbolTable(vec![Symbol {
        name: "probe".into(),
        addr: function_start,
        size: PROLOGUE.len() as u64,
        sym_type: SymbolType::Func,
    }]);
    let targets = DispatchTargets::new(0x1000, 0x2000, 0x3000).unwrap();
    let mut engine = Engine::new(targets, PatchConfig::default());
    engine.init("probe-module", &module, &symbols, &["probe"], &[]).expect("init should patch the one matching symbol");

    stop.store(true, Ordering::Relaxed);
    for r in readers {
        r.join().unwrap();
    }

    assert!(!violation.load(Ordering::Relaxed), "a reader observed a torn or inconsistent call site");

    let site_bytes = unsafe { std::slice::from_raw_parts(page as *const u8, 5) };
    assert_eq!(site_bytes[0], ARMED_BYTE);
    let disp = i32::from_le_bytes([site_bytes[1], site_bytes[2], site_bytes[3], site_bytes[4]]);
    let trampoline_addr = (function_start as i64 + 5 + disp as i64) as usize;
    let trampoline_bytes = unsafe { std::slice::from_raw_parts(trampoline_addr as *const u8, 16) };
    assert_eq!(trampoline_bytes, &indirect_jump_bytes(targets.entry())[..]);

    unsafe {
        libc::munmap(page as *mut libc::c_void, page_len);
    }
}
