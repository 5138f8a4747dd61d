//! Top-level engine: module discovery state machine, per-symbol strategy
//! dispatch, and the public `init`/`update`/`handle_module_loaded`/
//! `teardown` surface.

use crate::compiler_assisted;
use crate::config::PatchConfig;
use crate::disasm::{self, CALL_INSN_SIZE};
use crate::error::EngineError;
use crate::instr_store::{InstructionStore, SavedPrologue};
use crate::module::{
    detect_function_strategy, detect_module_strategy, BadSymbolRecord, ModuleDescriptor, SymbolKey, TraceFunctionAddrs, TrampolineBuilder,
};
use crate::pattern::PatternList;
use crate::protocol::{PatchProtocol, PreparedPatch, UnpatchSite};
use crate::stats::PatchStats;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracehook_sdk::{DispatchTargets, FailReason, ModuleSource, PatchOutcome, SkipReason, StrategyTag, SymbolTable, SymbolType};
use tracing::{debug, info, warn};

/// Bookkeeping needed to reverse a compiler-assisted-strategy patch.
/// `patch_general`'s `None`-strategy sites don't need this: their
/// reversal data lives in [`InstructionStore::lookup`] instead.
#[derive(Debug, Clone, Copy)]
enum PatchedOther {
    NopSled { site_addr: usize },
    Xray { entry_addr: usize, exit_addr: usize },
    LiveCall { site_addr: usize, original_target: usize },
}

/// Symbols the engine never instruments regardless of the pattern list:
/// process bootstrap code that either runs before the engine can
/// possibly be initialized or whose prologue shape the strategy detector
/// cannot reason about safely.
const ALWAYS_SKIP: &[&str] = &["_start", "__libc_csu_init", "__libc_csu_fini", "__libc_start_main"];

/// Module discovery progresses monotonically through these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// No module has been scanned yet.
    None,
    /// Only the main binary has been scanned (`init` has run).
    MainOnly,
    /// The main binary and every `dlopen`ed module matching the pattern
    /// lists seen so far have been scanned (`update` has run at least
    /// once).
    All,
}

/// The live code-patching engine. One instance owns all global state for
/// the process: there is no supported way to run two engines in the same
/// process (see `DESIGN.md`).
pub struct Engine {
    targets: DispatchTargets,
    config: PatchConfig,
    trace_fns: TraceFunctionAddrs,
    state: ProcessState,
    modules: RwLock<Vec<Arc<ModuleDescriptor>>>,
    store: Arc<InstructionStore>,
    protocol: Option<&'static PatchProtocol>,
    patch_patterns: PatternList,
    unpatch_patterns: PatternList,
    stats: RwLock<HashMap<String, PatchStats>>,
    /// Reversal bookkeeping for compiler-assisted-strategy sites, keyed
    /// by `function_start`. `None`-strategy sites don't need an entry
    /// here: [`InstructionStore::lookup`] already carries everything
    /// needed to reverse them.
    patched_other: RwLock<HashMap<usize, PatchedOther>>,
}

impl Engine {
    /// Builds an uninitialized engine. Call [`Self::init`] before
    /// anything else.
    pub fn new(targets: DispatchTargets, config: PatchConfig) -> Self {
        Engine {
            targets,
            config,
            trace_fns: TraceFunctionAddrs::default(),
            state: ProcessState::None,
            modules: RwLock::new(Vec::new()),
            store: Arc::new(InstructionStore::new(4096)),
            protocol: None,
            patch_patterns: PatternList::empty(),
            unpatch_patterns: PatternList::empty(),
            stats: RwLock::new(HashMap::new()),
            patched_other: RwLock::new(HashMap::new()),
        }
    }

    /// Addresses of `__fentry__`/`mcount`, used to recognize an
    /// already-live call at a function's entry. Optional: if unset, such
    /// functions fall back to the general-purpose `None` strategy.
    pub fn set_trace_function_addrs(&mut self, trace_fns: TraceFunctionAddrs) {
        self.trace_fns = trace_fns;
    }

    /// Compiles the patch/unpatch pattern lists, installs the signal
    /// handlers, and scans the main binary.
    pub fn init<M: ModuleSource, S: SymbolTable>(
        &mut self,
        main_name: &str,
        main_module: &M,
        main_symbols: &S,
        patch_patterns: &[&str],
        unpatch_patterns: &[&str],
    ) -> Result<(), EngineError> {
        if self.state != ProcessState::None {
            return Err(EngineError::AlreadyInitialized);
        }

        self.patch_patterns = PatternList::build(patch_patterns).map_err(|e| {
            tracing::error!(error = %e, "invalid patch pattern");
            EngineError::NotInitialized
        })?;
        self.unpatch_patterns = PatternList::build(unpatch_patterns).map_err(|e| {
            tracing::error!(error = %e, "invalid unpatch pattern");
            EngineError::NotInitialized
        })?;

        let protocol = Box::new(PatchProtocol::new(4096)?);
        self.protocol = Some(protocol.install()?);

        self.state = ProcessState::MainOnly;
        let stats = self.scan_and_patch_module(main_name, main_module, main_symbols)?;
        self.stats.write().insert(main_name.to_string(), stats);
        info!(module = main_name, "scanned main binary");
        Ok(())
    }

    /// Transitions to [`ProcessState::All`]. In this port there is no
    /// separate deferred-module queue to flush (see `DESIGN.md`); callers
    /// discover newly `dlopen`ed modules themselves and report them via
    /// [`Self::handle_module_loaded`].
    pub fn update(&mut self) -> Result<(), EngineError> {
        if self.state == ProcessState::None {
            return Err(EngineError::NotInitialized);
        }
        self.state = ProcessState::All;
        Ok(())
    }

    /// Scans a module loaded after `init` (typically from a `dlopen`
    /// callback) and patches whatever in it matches the pattern lists.
    /// Skips the scan entirely if no pattern even mentions this module's
    /// name, mirroring `match_pattern_module`'s qualifier-only check.
    pub fn handle_module_loaded<M: ModuleSource, S: SymbolTable>(
        &mut self,
        name: &str,
        module: &M,
        symbols: &S,
    ) -> Result<PatchStats, EngineError> {
        if self.state == ProcessState::None {
            return Err(EngineError::NotInitialized);
        }
        if !self.patch_patterns.module_could_match(name) && !self.unpatch_patterns.module_could_match(name) {
            debug!(module = name, "no pattern references this module, skipping scan");
            return Ok(PatchStats::default());
        }
        let stats = self.scan_and_patch_module(name, module, symbols)?;
        self.stats.write().insert(name.to_string(), stats);
        Ok(stats)
    }

    /// Bad-symbol recovery followed by instruction-store teardown.
    ///
    /// Actual page release is intentionally a no-op here: freeing live
    /// code pages out from under threads that might still be executing
    /// relocated copies is unsafe at arbitrary teardown time, so the
    /// pages are reclaimed by the OS at process exit instead.
    pub fn teardown(&mut self) -> Result<(), EngineError> {
        if self.state == ProcessState::None {
            return Err(EngineError::NotInitialized);
        }
        let Some(protocol) = self.protocol else { return Err(EngineError::NotInitialized) };
        for module in self.modules.read().iter() {
            for (key, record) in module.drain_recoverable_bad_symbols() {
                let site = UnpatchSite {
                    site_addr: record.site_addr,
                    original_bytes: record.original_bytes,
                    steering_points: record.steering_points,
                };
                match protocol.unpatch_site(site) {
                    Ok(()) => info!(module = %module.name, addr = %format_args!("{:#x}", key.addr), "recovered bad symbol at teardown"),
                    Err(reason) => warn!(module = %module.name, addr = %format_args!("{:#x}", key.addr), %reason, "bad-symbol recovery failed"),
                }
            }
            if module.has_any_bad_symbol() {
                warn!(module = %module.name, "module torn down with symbols left on the bad-symbol list");
            }
        }
        self.state = ProcessState::None;
        Ok(())
    }

    /// Reverses every previously patched symbol in `symbols` that matches
    /// the unpatch pattern list, restoring original bytes (for `None`
    /// -strategy sites) or the appropriate NOP sled (for compiler
    /// -assisted sites). Idempotent: a symbol that was never patched, or
    /// already unpatched, is counted as skipped rather than failed.
    pub fn unpatch<S: SymbolTable>(&self, module_name: &str, symbols: &S) -> Result<PatchStats, EngineError> {
        let Some(module) = self.modules.read().iter().find(|m| m.name == module_name).cloned() else {
            return Ok(PatchStats::default());
        };
        module
            .with_writable_text(|| {
                let mut stats = PatchStats::default();
                for sym in symbols.symbols() {
                    if !self.unpatch_patterns.matches(&sym.name, module_name) {
                        stats.no_match += 1;
                        continue;
                    }
                    let function_start = (module.load_bias + sym.addr) as usize;
                    match self.unpatch_symbol(function_start) {
                        PatchOutcome::Success => stats.patched += 1,
                        PatchOutcome::Skipped(_) => stats.skipped += 1,
                        PatchOutcome::Failed(_) => stats.failed += 1,
                    }
                    stats.total += 1;
                }
                stats
            })
            .map_err(EngineError::from)
    }

    /// Reverses a single patched function, dispatching by whichever
    /// bookkeeping map (if any) still has an entry for it.
    fn unpatch_symbol(&self, function_start: usize) -> PatchOutcome {
        if let Some(saved_ptr) = self.store.lookup(function_start) {
            let saved = unsafe { &*saved_ptr };
            let Some(protocol) = self.protocol else {
                return PatchOutcome::Failed(FailReason::Steering("protocol not installed".into()));
            };
            let result = protocol.unpatch_site(UnpatchSite {
                site_addr: saved.site_addr,
                original_bytes: saved.original_bytes.clone(),
                steering_points: saved.steering_points.clone(),
            });
            return match result {
                Ok(()) => {
                    self.store.forget(function_start);
                    PatchOutcome::Success
                }
                Err(reason) => PatchOutcome::Failed(reason),
            };
        }

        match self.patched_other.write().remove(&function_start) {
            Some(PatchedOther::NopSled { site_addr }) => match compiler_assisted::unpatch_nop_sled(site_addr) {
                Ok(()) => PatchOutcome::Success,
                Err(reason) => PatchOutcome::Failed(reason),
            },
            Some(PatchedOther::Xray { entry_addr, exit_addr }) => {
                let entry = compiler_assisted::unpatch_xray_sled(entry_addr);
                let exit = compiler_assisted::unpatch_xray_sled(exit_addr);
                match entry.and(exit) {
                    Ok(()) => PatchOutcome::Success,
                    Err(reason) => PatchOutcome::Failed(reason),
                }
            }
            Some(PatchedOther::LiveCall { site_addr, original_target }) => {
                match compiler_assisted::rewrite_live_call_target(site_addr, original_target) {
                    Ok(()) => PatchOutcome::Success,
                    Err(reason) => PatchOutcome::Failed(reason),
                }
            }
            None => PatchOutcome::Skipped(SkipReason::NotPatched),
        }
    }

    /// Resolves a return address captured on the stack during the
    /// transient patch-install trap/steering window back to the
    /// canonical `function_start + prologue_length` address external
    /// stack walkers expect. Outside that narrow window this is the
    /// identity function.
    pub fn resolve_return_address(&self, addr: usize) -> usize {
        self.protocol.map(|p| p.resolve_return_address(addr)).unwrap_or(addr)
    }

    /// Current module-discovery state.
    pub fn state(&self) -> ProcessState {
        self.state
    }

    fn scan_and_patch_module<M: ModuleSource, S: SymbolTable>(&self, name: &str, module: &M, symbols: &S) -> Result<PatchStats, EngineError> {
        let (text_start, text_size) = module.text_range();
        let sample = if text_size > 0 {
            unsafe { std::slice::from_raw_parts((module.load_bias() + text_start) as *const u8, 16.min(text_size as usize)) }
        } else {
            &[]
        };
        let default_strategy = detect_module_strategy(|kind| module.section(kind).is_some(), sample);
        let descriptor = Arc::new(ModuleDescriptor::new(
            name.to_string(),
            module.load_bias(),
            module.load_bias() + text_start,
            text_size,
            default_strategy,
        ));
        self.modules.write().push(descriptor.clone());

        descriptor
            .with_writable_text(|| {
                let mut stats = PatchStats::default();
                for sym in symbols.symbols() {
                    let unpatch_wins = self.unpatch_patterns.matches(&sym.name, name) && !self.patch_patterns.matches(&sym.name, name);
                    if unpatch_wins {
                        continue;
                    }
                    if !self.patch_patterns.matches(&sym.name, name) {
                        stats.no_match += 1;
                        continue;
                    }

                    let outcome = self.patch_symbol(&descriptor, sym);
                    match outcome {
                        PatchOutcome::Success => stats.patched += 1,
                        PatchOutcome::Skipped(_) => stats.skipped += 1,
                        PatchOutcome::Failed(_) => stats.failed += 1,
                    }
                    stats.total += 1;
                }
                stats
            })
            .map_err(EngineError::from)
    }

    fn patch_symbol(&self, module: &Arc<ModuleDescriptor>, sym: &tracehook_sdk::Symbol) -> PatchOutcome {
        if ALWAYS_SKIP.contains(&sym.name.as_str()) || sym.sym_type == SymbolType::Other {
            return PatchOutcome::Skipped(SkipReason::NonInstrumentable);
        }
        if sym.sym_type == SymbolType::IFunc {
            return PatchOutcome::Skipped(SkipReason::IFunc);
        }
        let min_size = self.config.effective_patch_min_size();
        if sym.size != 0 && sym.size < min_size {
            return PatchOutcome::Skipped(SkipReason::TooSmall);
        }

        let function_start = (module.load_bias + sym.addr) as usize;
        let key = SymbolKey { addr: function_start as u64, size: sym.size };
        if module.is_bad_symbol(&key) {
            return PatchOutcome::Failed(FailReason::BadSymbol);
        }

        let read_len = sym.size.max(CALL_INSN_SIZE + 4).min(64) as usize;
        let prologue_bytes = unsafe { std::slice::from_raw_parts(function_start as *const u8, read_len) };
        let call_target = read_call_target(prologue_bytes, function_start as u64);
        let strategy = detect_function_strategy(module.default_strategy, prologue_bytes, call_target, &self.trace_fns);

        let result = match strategy {
            StrategyTag::Xray => self.patch_xray(module, function_start),
            StrategyTag::FentryNop | StrategyTag::Patchable => self.patch_nop_sled(module, function_start),
            StrategyTag::Fentry | StrategyTag::Pg => self.patch_live_call(module, function_start),
            StrategyTag::None => self.patch_general(module, function_start, prologue_bytes, key),
        };

        if let Err(ref reason) = result {
            if matches!(reason, FailReason::Steering(_)) {
                // A trap was already installed (steering/serialization is
                // the only way `patch_general` can fail once it reaches
                // the protocol), so this site needs teardown to restore
                // it; the recovery record was already stashed there.
                debug!(addr = %format_args!("{:#x}", key.addr), "bad symbol recorded with recovery data");
            } else {
                module.add_bad_symbol(key);
            }
        }
        match result {
            Ok(()) => PatchOutcome::Success,
            Err(reason) => PatchOutcome::Failed(reason),
        }
    }

    fn patch_xray(&self, module: &Arc<ModuleDescriptor>, function_start: usize) -> Result<(), FailReason> {
        let targets = &self.targets;
        // `build_xray_stubs` reserves one 32-byte block (spec.md §4.4) and
        // always returns `(base, base + 16)`; only the base needs caching
        // since the exit stub's address is a fixed offset from it.
        let entry_stub = module
            .trampoline_addr(|| TrampolineBuilder::build_xray_stubs(module, targets.entry(), targets.exit()).map(|(e, _)| e))
            .map_err(|e| FailReason::Disassembly(e.to_string()))?;
        let exit_stub = entry_stub + 16;
        let entry_addr = function_start;
        let exit_addr = function_start + 16;
        compiler_assisted::patch_xray_entry(entry_addr, entry_stub)?;
        compiler_assisted::patch_xray_exit(exit_addr, exit_stub)?;
        self.patched_other.write().insert(function_start, PatchedOther::Xray { entry_addr, exit_addr });
        Ok(())
    }

    fn patch_nop_sled(&self, module: &Arc<ModuleDescriptor>, function_start: usize) -> Result<(), FailReason> {
        let trampoline = module
            .trampoline_addr(|| TrampolineBuilder::build_stub(module, self.targets.dentry()))
            .map_err(|e| FailReason::Disassembly(e.to_string()))?;
        compiler_assisted::patch_nop_sled(function_start, trampoline)?;
        self.patched_other.write().insert(function_start, PatchedOther::NopSled { site_addr: function_start });
        Ok(())
    }

    fn patch_live_call(&self, module: &Arc<ModuleDescriptor>, function_start: usize) -> Result<(), FailReason> {
        let trampoline = module
            .trampoline_addr(|| TrampolineBuilder::build_stub(module, self.targets.dentry()))
            .map_err(|e| FailReason::Disassembly(e.to_string()))?;
        let read_len = 5.min(64);
        let original_bytes = unsafe { std::slice::from_raw_parts(function_start as *const u8, read_len) };
        let original_target =
            read_call_target(original_bytes, function_start as u64).ok_or_else(|| FailReason::Disassembly("live-call site is not a call".into()))?;
        compiler_assisted::rewrite_live_call_target(function_start, trampoline)?;
        self.patched_other
            .write()
            .insert(function_start, PatchedOther::LiveCall { site_addr: function_start, original_target: original_target as usize });
        Ok(())
    }

    fn patch_general(&self, module: &Arc<ModuleDescriptor>, function_start: usize, prologue_bytes: &[u8], key: SymbolKey) -> Result<(), FailReason> {
        let min_len = CALL_INSN_SIZE + if has_endbr64(prologue_bytes) { 4 } else { 0 };
        let decoded = disasm::decode_prologue(prologue_bytes, function_start as u64, min_len)
            .map_err(|e| FailReason::Disassembly(e.to_string()))?;

        let site_addr = function_start + if decoded.has_intel_cet { 4 } else { 0 };
        let real_return = function_start + decoded.len as usize;
        let needs_resume_jump = !decoded.has_jump;

        let mut upper_bound = disasm::relocated_upper_bound(&decoded) as usize;
        if needs_resume_jump {
            upper_bound += 16;
        }
        let relocated_addr = self.store.reserve(upper_bound, 16).map_err(|_| FailReason::StoreExhausted)?;
        let mut relocated_bytes = disasm::relocate(&decoded.instructions, relocated_addr as u64)
            .map_err(|e| FailReason::Disassembly(e.to_string()))?;

        // Instruction boundaries are computed from the relocated bytes
        // before any resume-jump tail is appended, so the instruction
        // counts between `decoded.instructions` and `relocated_bytes`
        // still line up one to one.
        let steering_points = disasm::instruction_boundaries(&decoded.instructions, &relocated_bytes, relocated_addr as u64)
            .into_iter()
            .map(|(orig, reloc)| (orig as usize, reloc as usize))
            .collect::<Vec<_>>();

        if needs_resume_jump {
            relocated_bytes.extend_from_slice(&crate::module::indirect_jump_bytes(real_return));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(relocated_bytes.as_ptr(), relocated_addr as *mut u8, relocated_bytes.len());
        }

        let trampoline_addr = module
            .trampoline_addr(|| TrampolineBuilder::build_stub(module, self.targets.entry()))
            .map_err(|_| FailReason::StoreExhausted)?;
        self.store.freeze_all().map_err(|_| FailReason::StoreExhausted)?;

        // `original_bytes` must cover exactly what `site_addr` overwrites
        // (`decoded.len - (site_addr - function_start)` bytes), not the
        // whole decoded prologue: when an ENDBR64 leads the prologue,
        // `site_addr` sits 4 bytes past `function_start` and those 4
        // leading bytes are never touched, so saving them here would
        // shift everything after them by 4 on unpatch.
        let site_offset = site_addr - function_start;
        let original_bytes = prologue_bytes[site_offset..decoded.len as usize].to_vec();
        let call_displacement = (trampoline_addr as i64 - (site_addr as i64 + CALL_INSN_SIZE as i64)) as u32;
        let emulated_return = site_addr + CALL_INSN_SIZE as usize;

        self.store.record(
            function_start,
            SavedPrologue {
                site_addr,
                original_bytes: original_bytes.clone(),
                relocated_ptr: relocated_addr,
                relocated_len: relocated_bytes.len(),
                trampoline_addr,
                steering_points: steering_points.clone(),
            },
        );

        let Some(protocol) = self.protocol else { return Err(FailReason::Steering("protocol not installed".into())) };
        let result = protocol.patch_site(PreparedPatch {
            site_addr,
            trampoline_addr,
            function_start,
            call_displacement,
            emulated_return,
            real_return,
            steering_points: steering_points.clone(),
        });
        if let Err(reason) = result {
            module.add_bad_symbol_with_recovery(
                key,
                BadSymbolRecord { site_addr, original_bytes, steering_points },
            );
            return Err(reason);
        }

        // Any prologue bytes past `site_addr + CALL_INSN_SIZE` (inside the
        // relocated window but beyond the 5-byte call) are left as-is per
        // spec.md §8 scenario 1 ("unchanged garbage"): they're dead once
        // the call lands in the trampoline and never executed in place.

        Ok(())
    }
}

fn has_endbr64(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[0..4] == [0xf3, 0x0f, 0x1e, 0xfa]
}

fn read_call_target(bytes: &[u8], ip: u64) -> Option<u64> {
    if bytes.len() < 5 || bytes[0] != 0xE8 {
        return None;
    }
    let disp = i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    Some((ip as i64 + 5 + disp as i64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_endbr64_recognizes_the_prefix() {
        assert!(has_endbr64(&[0xf3, 0x0f, 0x1e, 0xfa, 0x90]));
        assert!(!has_endbr64(&[0x90, 0x90, 0x90, 0x90]));
    }

    #[test]
    fn read_call_target_decodes_the_displacement() {
        // call rel32 to ip+5+0x10 = ip+0x15
        let bytes = [0xE8, 0x10, 0x00, 0x00, 0x00];
        assert_eq!(read_call_target(&bytes, 0x1000), Some(0x1015));
    }

    #[test]
    fn read_call_target_rejects_non_call_opcode() {
        let bytes = [0x90, 0x90, 0x90, 0x90, 0x90];
        assert_eq!(read_call_target(&bytes, 0x1000), None);
    }
}
