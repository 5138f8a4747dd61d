//! Disassembler shim: decode a function's prologue, classify its control
//! flow, and re-encode it at a new address for the instruction store.
//!
//! Wraps `iced-x86` rather than hand-rolling relocation: `BlockEncoder`
//! already recomputes both intra-block and out-of-block branch
//! displacements after a block of instructions moves, including growing
//! a short `Jcc` to its near form when the new displacement no longer
//! fits in 8 bits, which subsumes a hand-built branch-fixup table; see
//! `DESIGN.md` for the full reasoning. What's left for us to do by hand
//! is deciding *how much* of the prologue to capture as one relocatable
//! block, and rejecting control flow `BlockEncoder` can't safely move
//! (indirect jumps/calls, and anything that isn't a ENDBR64 prefix
//! covering less than the minimum patch size).

use iced_x86::{BlockEncoder, BlockEncoderOptions, Code, Decoder, DecoderOptions, FlowControl, Instruction, InstructionBlock};
use thiserror::Error;

/// Bytes an `E8 rel32` call instruction occupies; the minimum contiguous
/// span every strategy needs before it can write a displacement.
pub const CALL_INSN_SIZE: u64 = 5;

/// A decoded, not-yet-relocated function prologue.
#[derive(Debug, Clone)]
pub struct DecodedPrologue {
    /// Instructions covering `[func_addr, func_addr + len)`, in order.
    pub instructions: Vec<Instruction>,
    /// Total bytes covered; always `>= min_len` the caller requested, and
    /// always an exact multiple of the decoded instruction boundaries
    /// (never splits an instruction).
    pub len: u64,
    /// Whether the window contains a branch/call (conditional or
    /// unconditional, direct only) that `BlockEncoder` must re-target on
    /// relocation.
    pub has_branch: bool,
    /// Whether the first instruction is an `ENDBR64` (Intel CET) marker.
    /// The trap handler's emulated-return-address bookkeeping needs this:
    /// a caller who jumped past an ENDBR64 lands 4 bytes later than
    /// `func_addr`.
    pub has_intel_cet: bool,
    /// Whether the window ends in an unconditional direct jump. Decoding
    /// always stops at such an instruction (bytes past it aren't
    /// guaranteed to be reachable fall-through code), and the relocated
    /// copy needs no trailing resume-jump since the jump itself already
    /// transfers control away.
    pub has_jump: bool,
}

/// Why a prologue window could not be decoded or relocated.
#[derive(Debug, Error)]
pub enum DisasmError {
    /// Ran out of bytes before covering `min_len`.
    #[error("prologue truncated before the minimum patchable size")]
    Truncated,
    /// The decoder produced an invalid/unknown opcode.
    #[error("invalid instruction at offset {offset}")]
    InvalidInstruction {
        /// Byte offset from the window start.
        offset: u64,
    },
    /// A control-flow instruction `BlockEncoder` cannot safely relocate
    /// (indirect call/jump, `ret`, or a branch via register/memory
    /// operand) falls inside the window.
    #[error("unsupported control flow instruction {0:?} in prologue window")]
    UnsupportedControlFlow(Code),
    /// `BlockEncoder` failed to re-encode the relocated block.
    #[error("relocation failed: {0}")]
    Relocation(String),
}

/// Decodes instructions starting at `ip` from `code` until at least
/// `min_len` bytes are covered, never splitting an instruction, and never
/// reading past an unconditional direct jump (bytes after one aren't
/// guaranteed to be reachable fall-through code).
pub fn decode_prologue(code: &[u8], ip: u64, min_len: u64) -> Result<DecodedPrologue, DisasmError> {
    let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
    let mut instructions = Vec::new();
    let mut has_branch = false;
    let mut has_intel_cet = false;
    let mut has_jump = false;
    let mut covered = 0u64;

    loop {
        if decoder.position() >= code.len() {
            return Err(DisasmError::Truncated);
        }
        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(DisasmError::InvalidInstruction { offset: covered });
        }
        if instr.code() == Code::Endbr64 && instructions.is_empty() {
            has_intel_cet = true;
        }
        let stop = match instr.flow_control() {
            FlowControl::Next => false,
            FlowControl::Call => {
                if instr.is_call_near_indirect() {
                    return Err(DisasmError::UnsupportedControlFlow(instr.code()));
                }
                has_branch = true;
                false
            }
            FlowControl::ConditionalBranch => {
                if instr.is_jmp_near_indirect() {
                    return Err(DisasmError::UnsupportedControlFlow(instr.code()));
                }
                has_branch = true;
                false
            }
            FlowControl::UnconditionalBranch => {
                if instr.is_jmp_near_indirect() {
                    return Err(DisasmError::UnsupportedControlFlow(instr.code()));
                }
                has_branch = true;
                has_jump = true;
                true
            }
            _ => return Err(DisasmError::UnsupportedControlFlow(instr.code())),
        };
        covered += instr.len() as u64;
        instructions.push(instr);
        if stop || covered >= min_len {
            break;
        }
    }

    if covered < min_len {
        return Err(DisasmError::Truncated);
    }

    Ok(DecodedPrologue { instructions, len: covered, has_branch, has_intel_cet, has_jump })
}

/// Re-encodes `instructions` (as decoded by [`decode_prologue`]) to run
/// starting at `new_ip`, letting `BlockEncoder` fix up every relative
/// operand.
pub fn relocate(instructions: &[Instruction], new_ip: u64) -> Result<Vec<u8>, DisasmError> {
    let block = InstructionBlock::new(instructions, new_ip);
    let result = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE)
        .map_err(|e| DisasmError::Relocation(e.to_string()))?;
    Ok(result.code_buffer)
}

/// Pairs each original instruction's absolute address with the address it
/// landed at in the relocated copy, by re-decoding the already-relocated
/// bytes in lock-step with the original instruction list. `relocated`
/// must be exactly the output of [`relocate`] for `instructions` (no
/// trailing resume-jump appended yet) so the instruction counts line up.
///
/// Used to build the steering protocol's per-instruction-boundary entries
/// (see `crate::protocol`): a peer thread's `RIP` can only ever sit at an
/// instruction boundary, never mid-instruction, so boundaries are the
/// only addresses the steering handshake needs to cover.
pub fn instruction_boundaries(instructions: &[Instruction], relocated: &[u8], new_ip: u64) -> Vec<(u64, u64)> {
    let mut decoder = Decoder::with_ip(64, relocated, new_ip, DecoderOptions::NONE);
    let mut pairs = Vec::with_capacity(instructions.len());
    for orig in instructions {
        if decoder.position() >= relocated.len() {
            break;
        }
        let new_addr = decoder.ip();
        decoder.decode();
        pairs.push((orig.ip(), new_addr));
    }
    pairs
}

/// Upper bound on the relocated size, for instruction-store reservation.
///
/// Every decoded instruction keeps its length except a branch, which may
/// grow by up to 4 bytes if `BlockEncoder` has to widen a short-form
/// `Jcc`/`jmp` into its near (`rel32`) form.
pub fn relocated_upper_bound(prologue: &DecodedPrologue) -> u64 {
    prologue
        .instructions
        .iter()
        .map(|i| {
            let growth = match i.flow_control() {
                FlowControl::ConditionalBranch | FlowControl::UnconditionalBranch => 4,
                _ => 0,
            };
            i.len() as u64 + growth
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    // `endbr64; mov eax, 1; ret` — ENDBR64 prefix followed by a simple body.
    const ENDBR_PROLOGUE: [u8; 9] = [0xf3, 0x0f, 0x1e, 0xfa, 0xb8, 0x01, 0x00, 0x00, 0x00];

    #[test]
    fn decodes_endbr64_prefixed_prologue() {
        let decoded = decode_prologue(&ENDBR_PROLOGUE, 0x1000, CALL_INSN_SIZE).unwrap();
        assert!(decoded.has_intel_cet);
        assert!(!decoded.has_branch);
        assert!(decoded.len >= CALL_INSN_SIZE);
    }

    #[test]
    fn rejects_prologue_that_is_too_short() {
        // single `nop` is nowhere near CALL_INSN_SIZE and nothing follows it.
        let code = [0x90u8];
        let err = decode_prologue(&code, 0x1000, CALL_INSN_SIZE).unwrap_err();
        assert!(matches!(err, DisasmError::Truncated));
    }

    #[test]
    fn relocates_a_plain_mov_prologue() {
        // `mov eax, 1; mov ecx, 2` — no RIP-relative or branch content.
        let code = [0xb8, 0x01, 0x00, 0x00, 0x00, 0xb9, 0x02, 0x00, 0x00, 0x00];
        let decoded = decode_prologue(&code, 0x1000, CALL_INSN_SIZE).unwrap();
        let relocated = relocate(&decoded.instructions, 0x2000).unwrap();
        assert_eq!(relocated.len() as u64, decoded.len);
    }

    #[test]
    fn rejects_indirect_call_in_window() {
        // `call rax` (ff d0)
        let code = [0xff, 0xd0, 0x90, 0x90, 0x90];
        let err = decode_prologue(&code, 0x1000, CALL_INSN_SIZE).unwrap_err();
        assert!(matches!(err, DisasmError::UnsupportedControlFlow(_)));
    }

    #[test]
    fn relocated_upper_bound_budgets_growth_for_branches() {
        // short `je +0` (75 00) then padding to reach the minimum size;
        // the conditional branch doesn't end decoding (only an
        // unconditional one does) but could still grow to its near form.
        let code = [0x75, 0x00, 0x90, 0x90, 0x90];
        let decoded = decode_prologue(&code, 0x1000, CALL_INSN_SIZE).unwrap();
        assert!(!decoded.has_jump);
        assert!(relocated_upper_bound(&decoded) >= decoded.len);
    }

    #[test]
    fn decoding_stops_at_an_unconditional_jump() {
        // `jmp +0` (eb 00) immediately satisfies a 2-byte minimum and
        // ends decoding even though more bytes follow in the buffer.
        let code = [0xeb, 0x00, 0x90, 0x90, 0x90, 0x90];
        let decoded = decode_prologue(&code, 0x1000, 2).unwrap();
        assert!(decoded.has_jump);
        assert_eq!(decoded.len, 2);
        assert_eq!(decoded.instructions.len(), 1);
    }

    #[test]
    fn unconditional_jump_before_the_minimum_size_is_truncated() {
        // same jump, but it satisfies only 2 of a required 5 bytes and
        // nothing legitimately follows it to relocate instead.
        let code = [0xeb, 0x00, 0x90, 0x90, 0x90, 0x90];
        let err = decode_prologue(&code, 0x1000, CALL_INSN_SIZE).unwrap_err();
        assert!(matches!(err, DisasmError::Truncated));
    }

    #[test]
    fn instruction_boundaries_pairs_original_and_relocated_addresses() {
        let code = [0xb8, 0x01, 0x00, 0x00, 0x00, 0xb9, 0x02, 0x00, 0x00, 0x00];
        let decoded = decode_prologue(&code, 0x1000, CALL_INSN_SIZE).unwrap();
        let relocated = relocate(&decoded.instructions, 0x2000).unwrap();
        let pairs = instruction_boundaries(&decoded.instructions, &relocated, 0x2000);
        assert_eq!(pairs, vec![(0x1000, 0x2000), (0x1005, 0x2005)]);
    }
}
