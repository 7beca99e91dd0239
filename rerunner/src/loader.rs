//! Maps a static guest executable into the address space of the runtime.

use anyhow::Context;
use object::{
    elf,
    read::elf::{FileHeader, ProgramHeader},
    Endianness,
};
use rerun_mem::{align_down, align_up, page_size};

/// Information about the loaded executable needed to build the initial stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestImage {
    pub entry: u64,
    pub phdr: u64,
    pub phent: u64,
    pub phnum: u64,

    /// The page aligned regions mapped for the image.
    pub mappings: Vec<(u64, u64)>,
}

fn host_machine() -> u16 {
    match target_lexicon::HOST.architecture {
        target_lexicon::Architecture::X86_64 => elf::EM_X86_64,
        target_lexicon::Architecture::Aarch64(_) => elf::EM_AARCH64,
        _ => elf::EM_NONE,
    }
}

pub(crate) fn segment_prot(flags: u32) -> libc::c_int {
    let mut prot = libc::PROT_NONE;
    prot |= if (flags & elf::PF_R) == 0 { 0 } else { libc::PROT_READ };
    prot |= if (flags & elf::PF_W) == 0 { 0 } else { libc::PROT_WRITE };
    prot |= if (flags & elf::PF_X) == 0 { 0 } else { libc::PROT_EXEC };
    prot
}

pub fn load_file(path: &std::path::Path) -> anyhow::Result<GuestImage> {
    let data = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    load(&data).with_context(|| format!("failed to load {}", path.display()))
}

/// Map the `PT_LOAD` segments of the ELF executable in `data` at their link time addresses.
pub fn load(data: &[u8]) -> anyhow::Result<GuestImage> {
    let header = elf::FileHeader64::<Endianness>::parse(data)?;
    let endian = header.endian()?;

    anyhow::ensure!(
        header.e_type(endian) == elf::ET_EXEC,
        "only statically linked, non-PIE executables are supported"
    );
    anyhow::ensure!(
        header.e_machine(endian) == host_machine(),
        "executable was built for a different architecture (e_machine={})",
        header.e_machine(endian)
    );

    let segments = header.program_headers(endian, data)?;
    let mut image = GuestImage {
        entry: header.e_entry(endian),
        phent: header.e_phentsize(endian) as u64,
        phnum: segments.len() as u64,
        ..GuestImage::default()
    };

    let page_size = page_size() as u64;
    for segment in segments {
        match segment.p_type(endian) {
            elf::PT_LOAD => {}
            elf::PT_PHDR => {
                image.phdr = segment.p_vaddr(endian);
                continue;
            }
            elf::PT_INTERP => anyhow::bail!("dynamically linked executables are not supported"),
            _ => continue,
        }

        let vaddr = segment.p_vaddr(endian);
        let memsz = segment.p_memsz(endian);
        let file_range = segment.file_range(endian);
        let bytes = segment
            .data(endian, data)
            .map_err(|_| anyhow::format_err!("segment at {vaddr:#x} is out of bounds"))?;
        anyhow::ensure!(memsz >= bytes.len() as u64, "segment at {vaddr:#x} has invalid size");

        let start = align_down(vaddr as usize, page_size as usize) as u64;
        let end = align_up((vaddr + memsz) as usize, page_size as usize) as u64;
        map_fixed(start, end - start)?;

        // Safety: the range was just mapped as read/write.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), vaddr as *mut u8, bytes.len());
        }

        let prot = segment_prot(segment.p_flags(endian));
        // Safety: only changes the protection of the mapping created above.
        let len = (end - start) as usize;
        if unsafe { libc::mprotect(start as *mut libc::c_void, len, prot) } != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("failed to protect segment at {vaddr:#x}"));
        }
        tracing::debug!(
            "mapped segment {vaddr:#x}..{:#x} (file={:#x}..{:#x}, prot={prot:#x})",
            vaddr + memsz,
            file_range.0,
            file_range.0 + file_range.1
        );

        // Without a `PT_PHDR` segment the headers are found through the segment that maps them.
        let phoff = header.e_phoff(endian);
        if image.phdr == 0 && (file_range.0..file_range.0 + file_range.1).contains(&phoff) {
            image.phdr = vaddr + (phoff - file_range.0);
        }
        image.mappings.push((start, end - start));
    }

    anyhow::ensure!(!image.mappings.is_empty(), "executable has no loadable segments");
    Ok(image)
}

fn map_fixed(addr: u64, len: u64) -> anyhow::Result<()> {
    let ptr = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            len as usize,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("failed to map {addr:#x}..{:#x}", addr + len));
    }
    if ptr as u64 != addr {
        // Older kernels treat the address as a hint.
        unsafe { libc::munmap(ptr, len as usize) };
        anyhow::bail!("{addr:#x}..{:#x} is already in use", addr + len);
    }
    Ok(())
}
