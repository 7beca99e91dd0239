/// How the call site described by [PatchData] encodes its target.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PatchKind {
    /// The call site cannot be patched.
    None = 0,

    /// A 32-bit displacement relative to the end of the field (x86 `call`/`jmp rel32`).
    Rel32 = 1,

    /// A 64-bit absolute address, either inline in code or in a data slot.
    Abs64 = 2,

    /// An AArch64 `b`/`bl` instruction with a 26-bit word offset.
    Branch26 = 3,
}

/// Metadata passed by generated code to the full dispatcher, describing which guest address to
/// resolve and where the resolved host address should be written back.
///
/// The layout is shared with generated code.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PatchData {
    /// The guest address the call site refers to.
    pub sym_addr: u64,

    /// The host address of the field to rewrite.
    pub patch_addr: u64,

    /// A [PatchKind] value.
    pub kind: u32,
}

impl PatchData {
    pub fn new(sym_addr: u64, patch_addr: u64, kind: PatchKind) -> Self {
        Self { sym_addr, patch_addr, kind: kind as u32 }
    }

    pub fn kind(&self) -> Option<PatchKind> {
        Some(match self.kind {
            0 => PatchKind::None,
            1 => PatchKind::Rel32,
            2 => PatchKind::Abs64,
            3 => PatchKind::Branch26,
            _ => return None,
        })
    }
}

/// Re-encode the offset field of an AArch64 `b`/`bl` instruction located at `place` so that it
/// branches to `target`. Returns `None` if the target is misaligned or out of range.
pub(crate) fn encode_branch26(insn: u32, place: u64, target: u64) -> Option<u32> {
    const RANGE: i64 = 1 << 27;

    let delta = target.wrapping_sub(place) as i64;
    if delta & 0b11 != 0 || !(-RANGE..RANGE).contains(&delta) {
        return None;
    }
    Some((insn & !0x03ff_ffff) | ((delta >> 2) as u32 & 0x03ff_ffff))
}

#[test]
fn branch26_encoding() {
    const BL: u32 = 0x9400_0000;
    assert_eq!(encode_branch26(BL, 0x1000, 0x1008), Some(BL | 2));
    assert_eq!(encode_branch26(BL, 0x1008, 0x1000), Some(BL | 0x03ff_fffe));
    assert_eq!(encode_branch26(BL, 0x1000, 0x1002), None);
    assert_eq!(encode_branch26(BL, 0x1000, 0x1000 + (1 << 27)), None);
    assert_eq!(encode_branch26(BL, 0x1000 + (1 << 27), 0x1000), Some(BL | 0x0200_0000));
}
