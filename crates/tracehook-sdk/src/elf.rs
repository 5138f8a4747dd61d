use crate::Symbol;

/// Classification of the handful of ELF sections the strategy detector
/// looks for, narrowed to exactly what it needs and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    /// `__mcount_loc`: a table of call-site addresses emitted by `-pg`.
    McountLoc,
    /// `xray_instr_map`: LLVM XRay's sled-location table.
    XrayInstrMap,
    /// `__patchable_function_entries`: GCC's patchable-entry table.
    PatchableFunctionEntries,
    /// Anything else; present so callers can still see unrecognized
    /// sections without the contract growing a new variant per loader.
    Other,
}

/// One section header, narrowed to the fields the strategy detector reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    /// Which of the recognized kinds this section is.
    pub kind: SectionKind,
    /// File/load offset of the section's first byte within the module.
    pub addr: u64,
    /// Section size in bytes.
    pub size: u64,
}

/// The narrow slice of a loaded ELF module the engine needs.
///
/// Deliberately not a general ELF parser: no relocations, no dynamic
/// symbol resolution, no debug info. A `ModuleSource` answers exactly the
/// two questions module discovery asks: where is this module's text, and
/// which of the compiler-assistance sections does it carry.
pub trait ModuleSource {
    /// The address this module was loaded at (zero for a non-PIE main
    /// binary), added to every offset the engine computes.
    fn load_bias(&self) -> u64;

    /// `(start, size)` of the module's single executable `PT_LOAD`
    /// segment, as an offset from `load_bias`.
    fn text_range(&self) -> (u64, u64);

    /// Every section relevant to strategy detection; sections of
    /// [`SectionKind::Other`] may be omitted entirely.
    fn sections(&self) -> &[Section];

    /// Convenience lookup for a specific recognized section kind.
    fn section(&self, kind: SectionKind) -> Option<&Section> {
        self.sections().iter().find(|s| s.kind == kind)
    }
}

/// The narrow slice of a module's symbol table the engine needs.
pub trait SymbolTable {
    /// All function-ish symbols in the module, in no particular order.
    fn symbols(&self) -> &[Symbol];

    /// The symbol whose `[addr, addr+size)` range contains `offset`, if
    /// any. Used both for normal patch-target resolution and for
    /// bad-symbol attribution on trap-handler landing sites.
    fn find_containing(&self, offset: u64) -> Option<&Symbol> {
        self.symbols().iter().find(|s| s.contains(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SymbolType;

    struct FakeModule {
        sections: Vec<Section>,
    }

    impl ModuleSource for FakeModule {
        fn load_bias(&self) -> u64 {
            0
        }
        fn text_range(&self) -> (u64, u64) {
            (0, 0x1000)
        }
        fn sections(&self) -> &[Section] {
            &self.sections
        }
    }

    #[test]
    fn section_lookup_finds_recognized_kind() {
        let m = FakeModule {
            sections: vec![Section { kind: SectionKind::XrayInstrMap, addr: 0x10, size: 0x20 }],
        };
        assert_eq!(m.section(SectionKind::XrayInstrMap).unwrap().addr, 0x10);
        assert!(m.section(SectionKind::McountLoc).is_none());
    }

    struct FakeSymtab(Vec<Symbol>);

    impl SymbolTable for FakeSymtab {
        fn symbols(&self) -> &[Symbol] {
            &self.0
        }
    }

    #[test]
    fn find_containing_picks_the_enclosing_symbol() {
        let t = FakeSymtab(vec![
            Symbol { name: "a".into(), addr: 0, size: 0x10, sym_type: SymbolType::Func },
            Symbol { name: "b".into(), addr: 0x10, size: 0x10, sym_type: SymbolType::Func },
        ]);
        assert_eq!(t.find_containing(0x15).unwrap().name, "b");
        assert!(t.find_containing(0x20).is_none());
    }
}
