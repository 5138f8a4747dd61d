//! Module descriptor, strategy detection, and trampoline construction.
//!
//! One [`ModuleDescriptor`] exists per loaded ELF module (the main binary
//! plus every `dlopen`ed shared object the engine has scanned). Strategy
//! detection looks for a compiler-assistance section first, falls back
//! to scanning the entry prologue for a recognizable NOP sled, and
//! finally checks whether a live call to a known trace-entry symbol is
//! already sitting at the prologue.

use crate::error::ResourceError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracehook_sdk::{SectionKind, StrategyTag};

/// The raw bytes of a 16-byte indirect-jump trampoline stub:
/// `ds: jmp [rip+1]; int3` followed by the 8-byte absolute target.
const TRAMPOLINE_STUB_PREFIX: [u8; 8] = [0x3e, 0xff, 0x25, 0x01, 0x00, 0x00, 0x00, 0xcc];

/// Page size assumed for trampoline placement and text-segment growth
/// (spec.md §4.4): the standard x86_64 Linux page size.
const PAGE_SIZE: u64 = 4096;

fn align_up(addr: u64, align: u64) -> u64 {
    (addr + align - 1) & !(align - 1)
}

/// Builds the 16-byte indirect-jump stub for `target`: `jmp [rip+1];
/// int3` followed by the absolute 8-byte target. Used both for
/// per-module trampolines and for the relocated prologue's resumption
/// tail (see `crate::engine::patch_general`) — an indirect jump through
/// an absolute pointer works regardless of how far the instruction store
/// ends up from the patched site, where a direct `jmp rel32` would be
/// limited to +/-2GiB.
pub fn indirect_jump_bytes(target: usize) -> [u8; 16] {
    let mut bytes = [0x90u8; 16];
    bytes[..8].copy_from_slice(&TRAMPOLINE_STUB_PREFIX);
    bytes[8..].copy_from_slice(&(target as u64).to_le_bytes());
    bytes
}

/// Addresses of the legacy trace-entry symbols, used to recognize an
/// already-live call at a function's entry as `Fentry`/`Pg` rather than
/// falling through to the general-purpose `None` strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceFunctionAddrs {
    /// Address of `__fentry__`, if the module/process has one.
    pub fentry: Option<u64>,
    /// Address of the legacy `mcount`/`_mcount` profiling hook.
    pub pg: Option<u64>,
}

/// A symbol identity used to key the bad-symbol set: address plus size,
/// not address alone, so a jump into the *middle* of an unrelated
/// function is attributed to that function rather than merged with a
/// different symbol that happens to start at the same address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolKey {
    /// Symbol start, absolute (load-bias applied).
    pub addr: u64,
    /// Symbol size in bytes.
    pub size: u64,
}

/// What teardown needs to restore a symbol whose patch attempt aborted
/// after a trap was already installed (spec.md 4.7 step 6). A symbol
/// recorded bad for some other reason (e.g. a corrupted landing detected
/// via [`ModuleDescriptor::add_bad_symbol_if_inside`]) carries no
/// recovery record: there is nothing this process wrote that needs
/// undoing.
#[derive(Debug, Clone)]
pub struct BadSymbolRecord {
    /// Address of the first byte a trap was installed at.
    pub site_addr: usize,
    /// The bytes to restore.
    pub original_bytes: Vec<u8>,
    /// Instruction-boundary pairs for the reverse steering handshake; see
    /// `crate::protocol::UnpatchSite`.
    pub steering_points: Vec<(usize, usize)>,
}

/// Per-module state: text range, default patch strategy, lazily-built
/// trampoline, and the set of symbols recorded bad during this run.
pub struct ModuleDescriptor {
    /// Module name (file path or `a.out`/`[vdso]`-style pseudo-name).
    pub name: String,
    /// Address this module was loaded at.
    pub load_bias: u64,
    /// Start of the module's executable segment, absolute.
    pub text_start: u64,
    /// Size of the module's executable segment, including any
    /// trampoline-tail growth from [`Self::reserve_trampoline_slot`].
    /// Mutable (the trampoline builder extends it by one page when the
    /// last page has no trailing slack), so it lives behind an atomic
    /// rather than as a plain field.
    text_size: AtomicU64,
    /// The strategy most functions in this module are expected to use,
    /// decided once from section presence at module-scan time. Individual
    /// functions may still fall back to [`StrategyTag::None`] if they
    /// lack the expected compiler assistance.
    pub default_strategy: StrategyTag,
    /// Trampoline base address, built lazily on first patch in this
    /// module (0 means "not yet built").
    trampoline_addr: AtomicUsize,
    /// Symbols recorded as bad, with recovery data for the ones this
    /// process itself half-patched (`Some`) versus ones merely flagged
    /// via a corrupted landing (`None`).
    bad_symbols: RwLock<HashMap<SymbolKey, Option<BadSymbolRecord>>>,
}

impl ModuleDescriptor {
    /// Builds a descriptor for a freshly scanned module.
    pub fn new(name: String, load_bias: u64, text_start: u64, text_size: u64, default_strategy: StrategyTag) -> Self {
        ModuleDescriptor {
            name,
            load_bias,
            text_start,
            text_size: AtomicU64::new(text_size),
            default_strategy,
            trampoline_addr: AtomicUsize::new(0),
            bad_symbols: RwLock::new(HashMap::new()),
        }
    }

    /// Current size of the module's executable segment, including any
    /// trampoline-tail growth.
    pub fn text_size(&self) -> u64 {
        self.text_size.load(Ordering::Acquire)
    }

    /// Whether `addr` falls inside this module's executable segment.
    pub fn contains_text(&self, addr: u64) -> bool {
        addr >= self.text_start && addr < self.text_start + self.text_size()
    }

    /// Runs `f` with this module's text segment temporarily flipped to
    /// read+write+execute, then restores it to read+execute regardless of
    /// what `f` did — matching §5's "per-module text pages" resource: the
    /// only writer is the instrumenter, and only for the duration of one
    /// patch (or unpatch) batch. A real `.text` mapping is read+exec only,
    /// so every byte the protocol or the compiler-assisted rewrites write
    /// directly into a function's prologue depends on this toggle having
    /// already run.
    pub fn with_writable_text<R>(&self, f: impl FnOnce() -> R) -> Result<R, ResourceError> {
        unsafe {
            region::protect(self.text_start as *const u8, self.text_size() as usize, region::Protection::READ_WRITE_EXECUTE)
                .map_err(|e| ResourceError::Mprotect(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
        }
        let result = f();
        // Re-read text_size: `f` may have grown it via
        // `reserve_trampoline_slot`, and the freshly mmap'd tail page
        // must be restored to read+execute along with the rest.
        unsafe {
            region::protect(self.text_start as *const u8, self.text_size() as usize, region::Protection::READ_EXECUTE)
                .map_err(|e| ResourceError::Mprotect(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
        }
        Ok(result)
    }

    /// Returns the module's trampoline address, building it via `build`
    /// on first use. `build` receives the instruction store and must
    /// return the address of a freshly constructed trampoline.
    pub fn trampoline_addr(
        &self,
        build: impl FnOnce() -> Result<usize, ResourceError>,
    ) -> Result<usize, ResourceError> {
        let existing = self.trampoline_addr.load(Ordering::Acquire);
        if existing != 0 {
            return Ok(existing);
        }
        let built = build()?;
        self.trampoline_addr.store(built, Ordering::Release);
        Ok(built)
    }

    /// Records `key` as bad with no recovery data. A jump landing exactly
    /// at a symbol's start is a legitimate call and must never reach
    /// this; see [`Self::add_bad_symbol_if_inside`].
    pub fn add_bad_symbol(&self, key: SymbolKey) {
        self.bad_symbols.write().entry(key).or_insert(None);
    }

    /// Records `symbol` as bad only if `landing` falls strictly inside
    /// its range; a landing exactly at `symbol.addr` is a legitimate call
    /// target and is not a bad symbol. Returns whether it was recorded.
    pub fn add_bad_symbol_if_inside(&self, symbol: SymbolKey, landing: u64) -> bool {
        if landing > symbol.addr && landing < symbol.addr + symbol.size {
            self.add_bad_symbol(symbol);
            true
        } else {
            false
        }
    }

    /// Records `key` as bad along with the bytes/steering data needed to
    /// restore it at teardown: this process installed a trap at `record
    /// .site_addr` and the patch attempt then aborted before reaching
    /// step 7.
    pub fn add_bad_symbol_with_recovery(&self, key: SymbolKey, record: BadSymbolRecord) {
        self.bad_symbols.write().insert(key, Some(record));
    }

    /// Whether `key` was previously recorded as bad.
    pub fn is_bad_symbol(&self, key: &SymbolKey) -> bool {
        self.bad_symbols.read().contains_key(key)
    }

    /// Number of symbols currently recorded as bad.
    pub fn bad_symbol_count(&self) -> usize {
        self.bad_symbols.read().len()
    }

    /// Whether this module currently has any symbol recorded bad.
    pub fn has_any_bad_symbol(&self) -> bool {
        self.bad_symbol_count() > 0
    }

    /// Drains every bad symbol carrying recovery data, leaving
    /// membership-only entries in place. Call at teardown to restore
    /// half-patched sites before the process (or engine instance) goes
    /// away.
    pub fn drain_recoverable_bad_symbols(&self) -> Vec<(SymbolKey, BadSymbolRecord)> {
        let mut out = Vec::new();
        let mut guard = self.bad_symbols.write();
        for (key, slot) in guard.iter_mut() {
            if let Some(record) = slot.take() {
                out.push((*key, record));
            }
        }
        out
    }

    /// Reserves `size` bytes of executable memory at the tail of this
    /// module's text segment, per spec.md §4.4: if the page already
    /// backing the end of `.text` has `size` bytes of trailing slack past
    /// `text_start + text_size`, the slot lands there and `text_size`
    /// grows by exactly `size`; otherwise the text region is extended by
    /// one fixed-address anonymous read+write+execute page placed right
    /// after the current last page, and the slot lands at its start.
    /// Never grows by more than one page: a 16- or 32-byte trampoline
    /// slot always fits inside a single page's worth of new mapping.
    pub fn reserve_trampoline_slot(&self, size: u64) -> Result<usize, ResourceError> {
        let text_size = self.text_size();
        let text_end = self.text_start + text_size;
        let page_end = align_up(text_end.max(self.text_start), PAGE_SIZE);
        let slack = page_end - text_end;

        if slack >= size {
            self.text_size.store(text_size + size, Ordering::Release);
            return Ok(text_end as usize);
        }

        unsafe {
            let mapped = libc::mmap(
                page_end as *mut libc::c_void,
                PAGE_SIZE as usize,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                -1,
                0,
            );
            if mapped == libc::MAP_FAILED {
                return Err(ResourceError::Mmap(std::io::Error::last_os_error()));
            }
        }
        self.text_size.store((page_end - self.text_start) + size, Ordering::Release);
        Ok(page_end as usize)
    }
}

/// Decides a module's default strategy: section presence first, then a
/// NOP-sled scan over the supplied sample prologue, then nothing (defer
/// to per-function `None` handling).
pub fn detect_module_strategy(sections_has: impl Fn(SectionKind) -> bool, sample_prologue: &[u8]) -> StrategyTag {
    if sections_has(SectionKind::XrayInstrMap) {
        return StrategyTag::Xray;
    }
    if sections_has(SectionKind::PatchableFunctionEntries) {
        return StrategyTag::Patchable;
    }
    if sections_has(SectionKind::McountLoc) {
        return StrategyTag::FentryNop;
    }
    const NOP5: [u8; 5] = [0x0f, 0x1f, 0x44, 0x00, 0x00];
    if sample_prologue.len() >= 5 && sample_prologue[..5] == NOP5 {
        return StrategyTag::FentryNop;
    }
    StrategyTag::None
}

/// Classifies a single function's prologue against a module's default
/// strategy, downgrading to a live-call strategy or `None` as needed.
pub fn detect_function_strategy(
    module_default: StrategyTag,
    prologue: &[u8],
    call_target: Option<u64>,
    trace_fns: &TraceFunctionAddrs,
) -> StrategyTag {
    match module_default {
        StrategyTag::Xray | StrategyTag::Patchable | StrategyTag::FentryNop => module_default,
        _ => {
            if prologue.first() == Some(&0xE8) {
                if let Some(target) = call_target {
                    if Some(target) == trace_fns.fentry {
                        return StrategyTag::Fentry;
                    }
                    if Some(target) == trace_fns.pg {
                        return StrategyTag::Pg;
                    }
                }
            }
            StrategyTag::None
        }
    }
}

/// Builds trampoline stubs: raw jump-through-pointer shims the patched
/// prologue ultimately targets. Placed at the tail of the owning
/// module's text segment (spec.md §4.4), not in the instruction store —
/// the instruction store holds relocated prologue copies, which live for
/// the lifetime of one patched site, while a trampoline is per-module and
/// needs to sit near the code it redirects so a direct-range `call` could
/// reach it (the indirect-through-pointer shape below doesn't strictly
/// need that, but the spec's placement rule is unconditional).
pub struct TrampolineBuilder;

impl TrampolineBuilder {
    /// One 16-byte stub: `ds: jmp [rip+1]; int3` then an 8-byte absolute
    /// target.
    pub fn build_stub(module: &ModuleDescriptor, target: usize) -> Result<usize, ResourceError> {
        let addr = module.reserve_trampoline_slot(16)?;
        let bytes = indirect_jump_bytes(target);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        }
        Ok(addr)
    }

    /// XRay sites get two adjacent 16-byte slots reserved as one 32-byte
    /// block, one for the entry sled and one for the exit sled.
    pub fn build_xray_stubs(
        module: &ModuleDescriptor,
        entry_target: usize,
        exit_target: usize,
    ) -> Result<(usize, usize), ResourceError> {
        let base = module.reserve_trampoline_slot(32)?;
        let entry_bytes = indirect_jump_bytes(entry_target);
        let exit_bytes = indirect_jump_bytes(exit_target);
        unsafe {
            std::ptr::copy_nonoverlapping(entry_bytes.as_ptr(), base as *mut u8, entry_bytes.len());
            std::ptr::copy_nonoverlapping(exit_bytes.as_ptr(), (base + 16) as *mut u8, exit_bytes.len());
        }
        Ok((base, base + 16))
    }
}
