//! `goblin`-backed reference implementation of `tracehook_sdk`'s narrow
//! ELF contract, built only for this crate's own tests. The engine
//! itself never parses ELF; real embedders supply their own
//! [`ModuleSource`]/[`SymbolTable`] from whatever loader they already
//! have.

use goblin::elf::Elf;
use tracehook_sdk::{ModuleSource, Section, SectionKind, Symbol, SymbolTable, SymbolType};

/// A module's relevant layout, parsed once from its ELF bytes.
pub struct GoblinModule {
    load_bias: u64,
    text_start: u64,
    text_size: u64,
    sections: Vec<Section>,
}

impl ModuleSource for GoblinModule {
    fn load_bias(&self) -> u64 {
        self.load_bias
    }

    fn text_range(&self) -> (u64, u64) {
        (self.text_start, self.text_size)
    }

    fn sections(&self) -> &[Section] {
        &self.sections
    }
}

/// A module's function symbols, parsed once from its ELF bytes.
pub struct GoblinSymtab {
    symbols: Vec<Symbol>,
}

impl SymbolTable for GoblinSymtab {
    fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }
}

/// Parses `bytes` as an ELF file and builds both halves of the contract.
pub fn load_from_bytes(bytes: &[u8], load_bias: u64) -> Result<(GoblinModule, GoblinSymtab), String> {
    let elf = Elf::parse(bytes).map_err(|e| e.to_string())?;

    let mut text_start = 0u64;
    let mut text_size = 0u64;
    for ph in &elf.program_headers {
        if ph.p_type == goblin::elf::program_header::PT_LOAD && (ph.p_flags & goblin::elf::program_header::PF_X) != 0 {
            text_start = ph.p_vaddr;
            text_size = ph.p_memsz;
            break;
        }
    }

    let mut sections = Vec::new();
    for sh in &elf.section_headers {
        let name = elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("");
        let kind = match name {
            "__mcount_loc" => SectionKind::McountLoc,
            "xray_instr_map" => SectionKind::XrayInstrMap,
            "__patchable_function_entries" => SectionKind::PatchableFunctionEntries,
            _ => SectionKind::Other,
        };
        if kind != SectionKind::Other {
            sections.push(Section { kind, addr: sh.sh_addr, size: sh.sh_size });
        }
    }

    const STT_GNU_IFUNC: u8 = 10;
    let mut symbols = Vec::new();
    for sym in elf.syms.iter() {
        if sym.st_name == 0 || sym.st_value == 0 {
            continue;
        }
        let name = elf.strtab.get_at(sym.st_name).unwrap_or("").to_string();
        let sym_type = if sym.st_info & 0xf == STT_GNU_IFUNC {
            SymbolType::IFunc
        } else if sym.is_function() {
            SymbolType::Func
        } else {
            SymbolType::Other
        };
        symbols.push(Symbol { name, addr: sym.st_value, size: sym.st_size, sym_type });
    }

    Ok((GoblinModule { load_bias, text_start, text_size, sections }, GoblinSymtab { symbols }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_elf_bytes() {
        assert!(load_from_bytes(b"not an elf file", 0).is_err());
    }

    #[test]
    fn parses_the_test_binary_itself() {
        let bytes = std::fs::read("/proc/self/exe").expect("reading the running test binary");
        let (module, _symtab) = load_from_bytes(&bytes, 0).expect("a real linked binary must parse");
        let (_start, size) = module.text_range();
        assert!(size > 0, "the test binary must have an executable segment");
    }
}
