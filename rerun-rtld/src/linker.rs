use std::collections::HashMap;

use object::{
    Object, ObjectKind, ObjectSection, ObjectSymbol, RelocationEncoding, RelocationKind,
    RelocationTarget, SectionIndex, SectionKind, SymbolKind, SymbolSection,
};
use rerun_mem::Memory;

use crate::{
    patch::{encode_branch26, PatchData, PatchKind},
    DispatcherInfo, LinkError, LinkResult, Linker, FULL_DISPATCH_SYMBOL, QUICK_DISPATCH_SYMBOL,
};

const ENTRY_SYMBOL_PREFIX: &str = "func_";

/// The name of the symbol that marks the host entry point of the guest function at `addr`.
pub fn entry_symbol_name(addr: u64) -> String {
    format!("{ENTRY_SYMBOL_PREFIX}{addr:x}")
}

/// Extracts the guest address from an entry symbol name.
pub fn parse_entry_symbol(name: &str) -> Option<u64> {
    let hex = name.strip_prefix(ENTRY_SYMBOL_PREFIX)?;
    if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Placement {
    Code,
    Data,
}

fn section_placement(kind: SectionKind) -> Option<Placement> {
    match kind {
        SectionKind::Text => Some(Placement::Code),
        SectionKind::Data
        | SectionKind::ReadOnlyData
        | SectionKind::ReadOnlyDataWithRel
        | SectionKind::ReadOnlyString
        | SectionKind::UninitializedData => Some(Placement::Data),
        _ => None,
    }
}

fn host_architecture() -> Option<object::Architecture> {
    match target_lexicon::HOST.architecture {
        target_lexicon::Architecture::X86_64 => Some(object::Architecture::X86_64),
        target_lexicon::Architecture::Aarch64(_) => Some(object::Architecture::Aarch64),
        _ => None,
    }
}

struct PlacedSection {
    base: u64,
    placement: Placement,
    bytes: Vec<u8>,
}

/// Links ELF relocatable objects (one per translated guest function) into the runtime arenas.
pub struct ObjectLinker {
    /// Host symbols available to relocations: runtime entry points and globals defined by
    /// previously loaded objects.
    symbols: HashMap<String, u64>,

    /// Host entry points indexed by guest address.
    entries: HashMap<u64, u64>,

    /// The number of objects linked so far.
    pub loaded_objects: usize,
}

impl ObjectLinker {
    pub fn new(info: &DispatcherInfo) -> Self {
        let mut linker =
            Self { symbols: HashMap::new(), entries: HashMap::new(), loaded_objects: 0 };
        linker.define_symbol(QUICK_DISPATCH_SYMBOL, info.quick_dispatch_func as u64);
        linker.define_symbol(FULL_DISPATCH_SYMBOL, info.full_dispatch_func as u64);
        linker
    }

    /// Look up a symbol previously made available to objects.
    pub fn symbol(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    fn place_sections(
        &self,
        mem: &mut Memory,
        file: &object::File,
    ) -> LinkResult<HashMap<SectionIndex, PlacedSection>> {
        let mut placed = HashMap::new();
        for section in file.sections() {
            let Some(placement) = section_placement(section.kind()) else {
                continue;
            };
            let size = section.size() as usize;
            if size == 0 {
                continue;
            }

            let align = section.align() as usize;
            let ptr = match placement {
                Placement::Code => mem.alloc_code(size, align)?,
                Placement::Data => mem.alloc_data(size, align)?,
            };

            let mut bytes = match section.kind() {
                SectionKind::UninitializedData => vec![],
                _ => section.data().map_err(LinkError::Parse)?.to_vec(),
            };
            bytes.resize(size, 0);

            tracing::trace!(
                "placed {} ({size:#x} bytes) at {:#x}",
                section.name().unwrap_or("<unknown>"),
                ptr as u64
            );
            placed.insert(section.index(), PlacedSection { base: ptr as u64, placement, bytes });
        }
        Ok(placed)
    }

    fn symbol_address(
        &self,
        placed: &HashMap<SectionIndex, PlacedSection>,
        symbol: &object::Symbol,
    ) -> LinkResult<u64> {
        let name = || symbol.name().unwrap_or("<unknown>").to_string();
        match symbol.section() {
            SymbolSection::Section(index) => placed
                .get(&index)
                .map(|section| section.base + symbol.address())
                .ok_or_else(|| LinkError::UndefinedSymbol(name())),
            SymbolSection::Absolute => Ok(symbol.address()),
            SymbolSection::Undefined => {
                self.symbols.get(&name()).copied().ok_or_else(|| LinkError::UndefinedSymbol(name()))
            }
            _ => Err(LinkError::UndefinedSymbol(name())),
        }
    }

    fn relocate(
        &self,
        file: &object::File,
        placed: &mut HashMap<SectionIndex, PlacedSection>,
    ) -> LinkResult<()> {
        let mut fixups = vec![];
        for section in file.sections() {
            let Some(base) = placed.get(&section.index()).map(|x| x.base) else {
                continue;
            };
            for (offset, reloc) in section.relocations() {
                let target = match reloc.target() {
                    RelocationTarget::Symbol(index) => {
                        let symbol = file.symbol_by_index(index).map_err(LinkError::Parse)?;
                        self.symbol_address(placed, &symbol)?
                    }
                    RelocationTarget::Section(index) => placed
                        .get(&index)
                        .map(|x| x.base)
                        .ok_or(LinkError::BadObject("relocation against unloaded section"))?,
                    RelocationTarget::Absolute => 0,
                    _ => return Err(LinkError::UnsupportedRelocation(format!("{reloc:?}"))),
                };
                fixups.push((section.index(), offset, base + offset, target, reloc));
            }
        }

        for (index, offset, place, target, reloc) in fixups {
            let Some(section) = placed.get_mut(&index) else {
                continue;
            };
            apply_relocation(&mut section.bytes, offset as usize, place, target, &reloc)?;
        }
        Ok(())
    }
}

fn read_field(buf: &[u8], offset: usize, bits: u8) -> LinkResult<i64> {
    if bits != 32 && bits != 64 {
        return Err(LinkError::UnsupportedRelocation(format!("{bits}-bit implicit addend")));
    }
    let field = buf
        .get(offset..offset + bits as usize / 8)
        .ok_or(LinkError::BadObject("relocation out of bounds"))?;
    let mut bytes = [0; 8];
    bytes[..field.len()].copy_from_slice(field);
    let value = i64::from_le_bytes(bytes);
    Ok(match bits {
        32 => value as i32 as i64,
        _ => value,
    })
}

fn write_field(buf: &mut [u8], offset: usize, value: &[u8]) -> LinkResult<()> {
    buf.get_mut(offset..offset + value.len())
        .ok_or(LinkError::BadObject("relocation out of bounds"))?
        .copy_from_slice(value);
    Ok(())
}

fn apply_relocation(
    buf: &mut [u8],
    offset: usize,
    place: u64,
    target: u64,
    reloc: &object::Relocation,
) -> LinkResult<()> {
    let addend = match reloc.has_implicit_addend() {
        true => read_field(buf, offset, reloc.size())?,
        false => reloc.addend(),
    };
    let value = target.wrapping_add(addend as u64);
    let overflow = || LinkError::Overflow { place, target: value };

    match (reloc.kind(), reloc.encoding(), reloc.size()) {
        (RelocationKind::Absolute, _, 64) => write_field(buf, offset, &value.to_le_bytes()),
        (RelocationKind::Absolute, RelocationEncoding::X86Signed, 32) => {
            let value = i32::try_from(value as i64).map_err(|_| overflow())?;
            write_field(buf, offset, &value.to_le_bytes())
        }
        (RelocationKind::Absolute, _, 32) => {
            let value = u32::try_from(value).map_err(|_| overflow())?;
            write_field(buf, offset, &value.to_le_bytes())
        }
        (
            RelocationKind::Relative | RelocationKind::PltRelative,
            RelocationEncoding::AArch64Call,
            26,
        ) => {
            let insn = read_field(buf, offset, 32)? as u32;
            let insn = encode_branch26(insn, place, value).ok_or_else(overflow)?;
            write_field(buf, offset, &insn.to_le_bytes())
        }
        (RelocationKind::Relative | RelocationKind::PltRelative, _, 32) => {
            let delta = value.wrapping_sub(place) as i64;
            let delta = i32::try_from(delta).map_err(|_| overflow())?;
            write_field(buf, offset, &delta.to_le_bytes())
        }
        (RelocationKind::Relative, _, 64) => {
            write_field(buf, offset, &value.wrapping_sub(place).to_le_bytes())
        }
        _ => Err(LinkError::UnsupportedRelocation(format!("{reloc:?}"))),
    }
}

impl Linker for ObjectLinker {
    fn resolve(&mut self, addr: u64) -> LinkResult<u64> {
        self.entries.get(&addr).copied().ok_or(LinkError::NotFound)
    }

    fn add_object(&mut self, mem: &mut Memory, object: &[u8], anchor: u64) -> LinkResult<()> {
        if self.entries.contains_key(&anchor) {
            return Err(LinkError::Duplicate(anchor));
        }

        let file = object::File::parse(object).map_err(LinkError::Parse)?;
        if file.kind() != ObjectKind::Relocatable {
            return Err(LinkError::BadObject("not a relocatable object"));
        }
        if host_architecture() != Some(file.architecture()) {
            return Err(LinkError::BadObject("object was built for a different architecture"));
        }

        // Each guest address is provided by at most one object.
        for symbol in file.symbols() {
            if symbol.is_undefined() || !symbol.is_global() {
                continue;
            }
            let guest = symbol.name().ok().and_then(parse_entry_symbol);
            if let Some(guest) = guest.filter(|guest| self.entries.contains_key(guest)) {
                return Err(LinkError::Duplicate(guest));
            }
        }

        let mut placed = self.place_sections(mem, &file)?;
        self.relocate(&file, &mut placed)?;

        for section in placed.values() {
            let dst = section.base as *mut u8;
            match section.placement {
                // Safety: the destination was allocated from the code arena above and nothing is
                // executing from it yet.
                Placement::Code => unsafe { mem.write_code(dst, &section.bytes)? },
                // Safety: the destination was allocated from the data arena with this size.
                Placement::Data => unsafe {
                    std::ptr::copy_nonoverlapping(section.bytes.as_ptr(), dst, section.bytes.len())
                },
            }
        }

        // Nothing is registered until the object is known to provide `anchor`.
        let mut entries = vec![];
        let mut globals = vec![];
        let mut functions = vec![];
        for symbol in file.symbols() {
            if symbol.is_undefined() || !symbol.is_global() {
                continue;
            }
            let Ok(name) = symbol.name() else {
                continue;
            };
            let Ok(addr) = self.symbol_address(&placed, &symbol) else {
                continue;
            };
            if let Some(guest) = parse_entry_symbol(name) {
                entries.push((guest, addr));
            }
            if symbol.kind() == SymbolKind::Text {
                functions.push(addr);
            }
            globals.push((name, addr));
        }

        let entry = match entries.iter().find(|(guest, _)| *guest == anchor) {
            Some(&(_, entry)) => entry,
            // Objects that contain a single function do not need to name it.
            None => match functions.as_slice() {
                &[entry] => entry,
                _ => return Err(LinkError::NoEntry(anchor)),
            },
        };

        self.entries.extend(entries);
        self.entries.insert(anchor, entry);
        for (name, addr) in globals {
            self.symbols.entry(name.to_string()).or_insert(addr);
        }

        self.loaded_objects += 1;
        tracing::debug!(
            "linked object for {anchor:#x}: entry={entry:#x}, sections={}",
            placed.len()
        );
        Ok(())
    }

    fn patch(&mut self, mem: &mut Memory, patch: &PatchData, target: u64) -> LinkResult<()> {
        let addr = patch.patch_addr;
        let bad_site = || LinkError::Memory(rerun_mem::ArenaError::OutOfBounds);
        match patch.kind() {
            Some(PatchKind::None) => Ok(()),
            Some(PatchKind::Rel32) => {
                let delta = target.wrapping_sub(addr.wrapping_add(4)) as i64;
                let delta = i32::try_from(delta)
                    .map_err(|_| LinkError::Overflow { place: addr, target })?;
                // Safety: `write_code` checks that the site lies inside of allocated code.
                unsafe { mem.write_code(addr as *mut u8, &delta.to_le_bytes())? };
                Ok(())
            }
            Some(PatchKind::Abs64) => {
                if mem.code.contains(addr as usize) {
                    // Safety: `write_code` checks that the site lies inside of allocated code.
                    unsafe { mem.write_code(addr as *mut u8, &target.to_le_bytes())? };
                }
                else if mem.data.contains(addr as usize) && mem.data.contains(addr as usize + 7) {
                    // Safety: the slot lies inside of allocated data memory.
                    unsafe { (addr as *mut u64).write_unaligned(target) };
                }
                else {
                    return Err(bad_site());
                }
                Ok(())
            }
            Some(PatchKind::Branch26) => {
                if !mem.code.contains(addr as usize) || !mem.code.contains(addr as usize + 3) {
                    return Err(bad_site());
                }
                // Safety: the instruction lies inside of allocated code memory.
                let insn = unsafe { (addr as *const u32).read_unaligned() };
                let insn = encode_branch26(insn, addr, target)
                    .ok_or(LinkError::Overflow { place: addr, target })?;
                // Safety: see above.
                unsafe { mem.write_code(addr as *mut u8, &insn.to_le_bytes())? };
                Ok(())
            }
            None => Err(LinkError::UnsupportedRelocation(format!("patch kind {}", patch.kind))),
        }
    }

    fn define_symbol(&mut self, name: &str, addr: u64) {
        tracing::trace!("defining runtime symbol {name} = {addr:#x}");
        self.symbols.insert(name.to_string(), addr);
    }
}
