use crate::{
    config::UserArgs,
    loader::{self, GuestImage},
    stack::{self, HostInfo, StackBuilder},
};

fn temp_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("rerunner-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn parse_user_args() {
    let args = UserArgs::parse("3 ./bin/ls ls -l /tmp\n").unwrap();
    assert_eq!(args.binary, std::path::Path::new("./bin/ls"));
    assert_eq!(args.argv, ["ls", "-l", "/tmp"]);

    let args = UserArgs::parse("0 /bin/true").unwrap();
    assert!(args.argv.is_empty());

    // Trailing tokens beyond `argc` are ignored.
    let args = UserArgs::parse("1 a.out a.out extra").unwrap();
    assert_eq!(args.argv, ["a.out"]);
}

#[test]
fn invalid_user_args() {
    assert!(UserArgs::parse("").is_err());
    assert!(UserArgs::parse("two a.out").is_err());
    assert!(UserArgs::parse("1").is_err());
    assert!(UserArgs::parse("3 a.out a.out b").is_err());
}

#[test]
fn read_user_args() {
    let dir = temp_dir("user-args");
    assert!(UserArgs::read(&dir).is_err());

    std::fs::write(dir.join("user_args"), "2 /bin/echo echo hello").unwrap();
    let args = UserArgs::read(&dir).unwrap();
    assert_eq!(args.binary, std::path::Path::new("/bin/echo"));
    assert_eq!(args.argv, ["echo", "hello"]);

    std::fs::remove_dir_all(&dir).unwrap();
}

const STACK_BASE: u64 = 0x7fff_0000;

struct GuestMem<'a>(&'a [u8]);

impl GuestMem<'_> {
    fn offset(&self, addr: u64) -> usize {
        (addr - STACK_BASE) as usize
    }

    fn u64(&self, addr: u64) -> u64 {
        let offset = self.offset(addr);
        u64::from_le_bytes(self.0[offset..offset + 8].try_into().unwrap())
    }

    fn cstr(&self, addr: u64) -> &[u8] {
        let bytes = &self.0[self.offset(addr)..];
        &bytes[..bytes.iter().position(|b| *b == 0).unwrap()]
    }
}

fn test_host() -> HostInfo {
    HostInfo {
        platform: "x86_64".into(),
        hwcap: 0x8001,
        random: [0xaa; 16],
        page_size: 0x1000,
        clock_ticks: 100,
        uid: 1000,
        euid: 1001,
        gid: 1002,
        egid: 1003,
    }
}

fn test_image() -> GuestImage {
    GuestImage { entry: 0x401000, phdr: 0x400040, phent: 56, phnum: 4, mappings: vec![] }
}

#[test]
fn initial_stack_layout() {
    let mut buf = vec![0; 0x1000];
    let mut builder = StackBuilder::new(&mut buf, STACK_BASE);
    let sp = stack::build_initial_stack(
        &mut builder,
        &[&b"prog"[..], &b"arg"[..]],
        &[&b"HOME=/root"[..]],
        &test_image(),
        &test_host(),
    )
    .unwrap();
    assert_eq!(sp % 16, 0);

    let mem = GuestMem(&buf);
    assert_eq!(mem.u64(sp), 2);
    assert_eq!(mem.cstr(mem.u64(sp + 8)), b"prog");
    assert_eq!(mem.cstr(mem.u64(sp + 16)), b"arg");
    assert_eq!(mem.u64(sp + 24), 0);
    assert_eq!(mem.cstr(mem.u64(sp + 32)), b"HOME=/root");
    assert_eq!(mem.u64(sp + 40), 0);

    let mut auxv = vec![];
    let mut addr = sp + 48;
    loop {
        let (key, value) = (mem.u64(addr), mem.u64(addr + 8));
        auxv.push((key, value));
        addr += 16;
        if key == stack::AT_NULL {
            break;
        }
    }

    let get = |key| auxv.iter().find(|(k, _)| *k == key).map(|(_, v)| *v).unwrap();
    assert_eq!(get(stack::AT_ENTRY), 0x401000);
    assert_eq!(get(stack::AT_PHDR), 0x400040);
    assert_eq!(get(stack::AT_PHENT), 56);
    assert_eq!(get(stack::AT_PHNUM), 4);
    assert_eq!(get(stack::AT_PAGESZ), 0x1000);
    assert_eq!(get(stack::AT_UID), 1000);
    assert_eq!(get(stack::AT_EGID), 1003);
    assert_eq!(get(stack::AT_HWCAP), 0x8001);
    assert_eq!(get(stack::AT_HWCAP2), 0);
    assert_eq!(get(stack::AT_SECURE), 0);
    assert_eq!(mem.cstr(get(stack::AT_PLATFORM)), b"x86_64");

    let random = mem.offset(get(stack::AT_RANDOM));
    assert_eq!(&buf[random..random + 16], &[0xaa; 16]);
    assert_eq!(auxv.len(), 16);
}

#[test]
fn initial_stack_is_aligned() {
    fn check(argc: u8, envc: u8) -> bool {
        let argv = vec![&b"a"[..]; argc as usize % 16];
        let envp = vec![&b"K=V"[..]; envc as usize % 16];

        let mut buf = vec![0; 0x2000];
        let mut builder = StackBuilder::new(&mut buf, STACK_BASE);
        let sp =
            stack::build_initial_stack(&mut builder, &argv, &envp, &test_image(), &test_host())
                .unwrap();
        sp % 16 == 0 && GuestMem(&buf).u64(sp) == argv.len() as u64
    }
    quickcheck::quickcheck(check as fn(u8, u8) -> bool);
}

#[test]
fn stack_overflow_is_an_error() {
    let mut buf = vec![0; 64];
    let mut builder = StackBuilder::new(&mut buf, STACK_BASE);
    assert!(builder.push_cstr(b"hello").is_ok());
    assert!(builder.push_cstr(b"nul\0byte").is_err());
    let result = stack::build_initial_stack(&mut builder, &[], &[], &test_image(), &test_host());
    assert!(result.is_err());
}

#[test]
fn host_info() {
    let host = HostInfo::current();
    assert_eq!(host.page_size, rerun_mem::page_size() as u64);
    assert!(!host.platform.is_empty());
}

#[test]
fn guest_stack_has_room_for_arguments() {
    let mut stack = stack::GuestStack::map(0x10000).unwrap();
    let mut builder = stack.builder();
    let sp = stack::build_initial_stack(
        &mut builder,
        &[&b"prog"[..]],
        &[],
        &test_image(),
        &HostInfo::current(),
    )
    .unwrap();
    assert_eq!(sp % 16, 0);
    assert_eq!(unsafe { (sp as *const u64).read() }, 1);
}

mod elf {
    use object::{
        elf::{self, FileHeader64, ProgramHeader64},
        pod::bytes_of,
        Endianness, U16, U32, U64,
    };

    const E: Endianness = Endianness::Little;

    pub struct Segment {
        pub p_type: u32,
        pub flags: u32,
        pub vaddr: u64,
        pub memsz: u64,
    }

    /// Build an executable where every segment maps the whole file.
    pub fn build(e_type: u16, machine: u16, entry: u64, segments: &[Segment]) -> Vec<u8> {
        let ehsize = std::mem::size_of::<FileHeader64<Endianness>>();
        let phentsize = std::mem::size_of::<ProgramHeader64<Endianness>>();
        let file_size = (ehsize + segments.len() * phentsize + 16) as u64;

        let header = FileHeader64::<Endianness> {
            e_ident: elf::Ident {
                magic: elf::ELFMAG,
                class: elf::ELFCLASS64,
                data: elf::ELFDATA2LSB,
                version: elf::EV_CURRENT,
                os_abi: elf::ELFOSABI_NONE,
                abi_version: 0,
                padding: [0; 7],
            },
            e_type: U16::new(E, e_type),
            e_machine: U16::new(E, machine),
            e_version: U32::new(E, elf::EV_CURRENT as u32),
            e_entry: U64::new(E, entry),
            e_phoff: U64::new(E, ehsize as u64),
            e_shoff: U64::new(E, 0),
            e_flags: U32::new(E, 0),
            e_ehsize: U16::new(E, ehsize as u16),
            e_phentsize: U16::new(E, phentsize as u16),
            e_phnum: U16::new(E, segments.len() as u16),
            e_shentsize: U16::new(E, 0),
            e_shnum: U16::new(E, 0),
            e_shstrndx: U16::new(E, 0),
        };

        let mut data = bytes_of(&header).to_vec();
        for segment in segments {
            let phdr = ProgramHeader64::<Endianness> {
                p_type: U32::new(E, segment.p_type),
                p_flags: U32::new(E, segment.flags),
                p_offset: U64::new(E, 0),
                p_vaddr: U64::new(E, segment.vaddr),
                p_paddr: U64::new(E, segment.vaddr),
                p_filesz: U64::new(E, file_size),
                p_memsz: U64::new(E, segment.memsz),
                p_align: U64::new(E, 0x1000),
            };
            data.extend_from_slice(bytes_of(&phdr));
        }
        data.extend_from_slice(&[0xcc; 16]);
        data
    }

    pub fn host_machine() -> u16 {
        if cfg!(target_arch = "aarch64") { elf::EM_AARCH64 } else { elf::EM_X86_64 }
    }
}

#[test]
fn segment_protection() {
    use object::elf::{PF_R, PF_W, PF_X};

    assert_eq!(loader::segment_prot(PF_R), libc::PROT_READ);
    assert_eq!(loader::segment_prot(PF_R | PF_W), libc::PROT_READ | libc::PROT_WRITE);
    assert_eq!(loader::segment_prot(PF_R | PF_X), libc::PROT_READ | libc::PROT_EXEC);
    assert_eq!(loader::segment_prot(0), libc::PROT_NONE);
}

#[test]
fn rejects_unsupported_executables() {
    use object::elf::{EM_AARCH64, EM_X86_64, ET_DYN, ET_EXEC, PF_R, PT_INTERP, PT_LOAD};

    assert!(loader::load(b"not an elf file").is_err());
    assert!(loader::load(&[]).is_err());

    let load = |vaddr| elf::Segment { p_type: PT_LOAD, flags: PF_R, vaddr, memsz: 0x1000 };
    let machine = elf::host_machine();

    // Position independent executables and shared objects.
    let data = elf::build(ET_DYN, machine, 0x1000, &[load(0)]);
    assert!(loader::load(&data).is_err());

    // Executables for another architecture.
    let other = if machine == EM_X86_64 { EM_AARCH64 } else { EM_X86_64 };
    let data = elf::build(ET_EXEC, other, 0x1000, &[load(0x3100_0000_0000)]);
    assert!(loader::load(&data).is_err());

    // Dynamically linked executables.
    let interp = elf::Segment { p_type: PT_INTERP, flags: 0, vaddr: 0, memsz: 0 };
    let data = elf::build(ET_EXEC, machine, 0x1000, &[interp]);
    assert!(loader::load(&data).is_err());

    let data = elf::build(ET_EXEC, machine, 0x1000, &[]);
    assert!(loader::load(&data).is_err());
}

#[cfg(all(any(target_arch = "x86_64", target_arch = "aarch64"), target_os = "linux"))]
#[test]
fn loads_segments_at_fixed_addresses() {
    use object::elf::{ET_EXEC, PF_R, PF_W, PT_LOAD};

    let vaddr = 0x3200_0000_0000;
    let segment = elf::Segment { p_type: PT_LOAD, flags: PF_R | PF_W, vaddr, memsz: 0x2000 };
    let data = elf::build(ET_EXEC, elf::host_machine(), vaddr + 0x78, &[segment]);

    let image = loader::load(&data).unwrap();
    assert_eq!(image.entry, vaddr + 0x78);
    assert_eq!(image.phdr, vaddr + 64);
    assert_eq!(image.phent, 56);
    assert_eq!(image.phnum, 1);
    assert_eq!(image.mappings, [(vaddr, 0x2000)]);

    let mapped = unsafe { std::slice::from_raw_parts(vaddr as *const u8, 0x2000) };
    assert_eq!(&mapped[..data.len()], &data[..]);
    assert!(mapped[data.len()..].iter().all(|b| *b == 0));

    // The range is now in use.
    assert!(loader::load(&data).is_err());

    for (start, len) in image.mappings {
        unsafe { libc::munmap(start as *mut libc::c_void, len as usize) };
    }
}
