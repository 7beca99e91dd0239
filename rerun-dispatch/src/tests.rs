use std::{cell::RefCell, collections::HashMap, path::PathBuf, rc::Rc};

use rerun_cpu::{DispatchKind, ExecutionState, GlobalState, QuickCache};
use rerun_mem::{page_size, Memory};
use rerun_rtld::{FunctionStore, LinkError, LinkResult, Linker, PatchData, PatchKind, StoreError};

use crate::{dispatch, lookup_or_resolve, try_resolve, ResolveError};

/// Records the interactions of the resolver with the linker.
#[derive(Default)]
struct LinkerLog {
    resolves: Vec<u64>,
    loads: Vec<u64>,
    patches: Vec<(u64, u64)>,
}

/// A linker that treats the contents of an object as an opaque blob and maps each guest address to
/// a fixed host address.
struct MockLinker {
    entries: HashMap<u64, u64>,
    log: Rc<RefCell<LinkerLog>>,
}

fn host_entry(addr: u64) -> u64 {
    0x7000_0000_0000 + addr
}

impl Linker for MockLinker {
    fn resolve(&mut self, addr: u64) -> LinkResult<u64> {
        self.log.borrow_mut().resolves.push(addr);
        self.entries.get(&addr).copied().ok_or(LinkError::NotFound)
    }

    fn add_object(&mut self, _: &mut Memory, object: &[u8], anchor: u64) -> LinkResult<()> {
        match object {
            b"bad" => return Err(LinkError::BadObject("bad object")),
            b"empty" => {}
            _ => {
                if self.entries.insert(anchor, host_entry(anchor)).is_some() {
                    return Err(LinkError::Duplicate(anchor));
                }
            }
        }
        self.log.borrow_mut().loads.push(anchor);
        Ok(())
    }

    fn patch(&mut self, _: &mut Memory, patch: &PatchData, target: u64) -> LinkResult<()> {
        match patch.kind() {
            Some(PatchKind::Rel32) => {
                self.log.borrow_mut().patches.push((patch.patch_addr, target));
                Ok(())
            }
            _ => Err(LinkError::UnsupportedRelocation("mock".into())),
        }
    }

    fn define_symbol(&mut self, _: &str, _: u64) {}
}

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("rerun-dispatch-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

struct Harness {
    dir: PathBuf,
    global: Box<GlobalState>,
    state: *mut ExecutionState,
    log: Rc<RefCell<LinkerLog>>,
}

impl Harness {
    fn new(name: &str) -> Self {
        let dir = temp_dir(name);
        let log = Rc::new(RefCell::new(LinkerLog::default()));
        let linker = MockLinker { entries: HashMap::new(), log: log.clone() };
        let memory = Memory::init(None, 0x100 * page_size(), 0x10 * page_size()).unwrap();
        let mut global = GlobalState::new(
            Box::new(linker),
            FunctionStore::new(&dir),
            memory,
            dispatch::get(DispatchKind::Generic),
        );
        let state = global.new_execution_state().unwrap();
        Self { dir, global, state, log }
    }

    fn add_function(&self, addr: u64, content: &[u8]) {
        std::fs::write(self.dir.join(format!("{addr:x}")), content).unwrap();
    }

    fn state(&mut self) -> &mut ExecutionState {
        unsafe { &mut *self.state }
    }

    fn dispatch(&mut self, addr: u64) -> Result<u64, ResolveError> {
        self.state().set_pc(addr);
        let pc = self.state().pc();
        lookup_or_resolve(self.state(), pc)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

#[test]
fn first_dispatch_loads_object() {
    let mut h = Harness::new("first");
    h.add_function(0x401000, b"function");

    assert_eq!(h.dispatch(0x401000).unwrap(), host_entry(0x401000));
    assert_eq!(h.log.borrow().loads, [0x401000]);
    assert_eq!(h.log.borrow().resolves, [0x401000, 0x401000]);

    let entry = h.state().quick_cache.entry(QuickCache::index(0x401000));
    assert_eq!((entry.tag, entry.target), (0x401000, host_entry(0x401000)));
    assert_eq!(h.state().quick_cache.occupied(), 1);

    assert_eq!(h.global.stats.objects_loaded, 1);
    assert_eq!(h.global.stats.resolutions, 1);

    // The object was copied into the data arena.
    assert!(h.global.memory.data.brk() - h.global.memory.data.start() >= page_size());
}

#[test]
fn second_dispatch_hits_cache() {
    let mut h = Harness::new("second");
    h.add_function(0x401000, b"function");
    let first = h.dispatch(0x401000).unwrap();

    // A hit must not touch the store.
    std::fs::remove_file(h.dir.join("401000")).unwrap();
    let resolves = h.log.borrow().resolves.len();

    assert_eq!(h.dispatch(0x401000).unwrap(), first);
    assert_eq!(h.log.borrow().resolves.len(), resolves);
    assert_eq!(h.log.borrow().loads, [0x401000]);
    assert_eq!(h.global.stats.resolutions, 1);
}

#[test]
fn colliding_addresses_thrash() {
    let mut h = Harness::new("collide");
    let a = 0x401000;
    let b = a + ((rerun_cpu::QUICK_CACHE_ENTRIES as u64) << rerun_cpu::QUICK_CACHE_SHIFT);
    assert_eq!(QuickCache::index(a), QuickCache::index(b));
    h.add_function(a, b"a");
    h.add_function(b, b"b");

    for _ in 0..4 {
        assert_eq!(h.dispatch(a).unwrap(), host_entry(a));
        assert_eq!(h.dispatch(b).unwrap(), host_entry(b));
    }

    // Every dispatch missed, but each object was only loaded once.
    assert_eq!(h.global.stats.resolutions, 8);
    assert_eq!(h.log.borrow().loads, [a, b]);
    assert_eq!(h.state().quick_cache.lookup(a), None);
    assert_eq!(h.state().quick_cache.lookup(b), Some(host_entry(b)));
}

#[test]
fn missing_object_is_an_error() {
    let mut h = Harness::new("missing");

    let err = h.dispatch(0x401000).unwrap_err();
    assert!(matches!(err, ResolveError::Store(StoreError::Open(_))), "{err:?}");
    assert_eq!(err.code(), -libc::ENOENT);

    assert_eq!(h.state().quick_cache.occupied(), 0);
    assert!(h.log.borrow().loads.is_empty());
    assert_eq!(h.global.stats.objects_loaded, 0);
}

#[test]
fn rejected_objects_are_errors() {
    let mut h = Harness::new("rejected");
    h.add_function(0x401000, b"bad");
    h.add_function(0x402000, b"empty");

    let err = h.dispatch(0x401000).unwrap_err();
    assert!(matches!(err, ResolveError::Link(LinkError::BadObject(_))), "{err:?}");
    assert_eq!(err.code(), -libc::ENOEXEC);

    let err = h.dispatch(0x402000).unwrap_err();
    assert!(matches!(err, ResolveError::Unresolved), "{err:?}");
    assert_eq!(err.code(), -libc::ENOENT);

    assert_eq!(h.state().quick_cache.occupied(), 0);
}

#[test]
fn address_zero_is_invalid() {
    let mut h = Harness::new("zero");
    let err = h.dispatch(0).unwrap_err();
    assert!(matches!(err, ResolveError::InvalidAddress));
    assert!(h.log.borrow().resolves.is_empty());
}

#[test]
fn detached_state_is_an_error() {
    let mut h = Harness::new("detached");
    h.add_function(0x401000, b"function");
    h.state().global = std::ptr::null_mut();
    assert!(matches!(h.dispatch(0x401000), Err(ResolveError::Detached)));
}

#[test]
fn patch_data_selects_target_and_patches_site() {
    let mut h = Harness::new("patch");
    h.add_function(0x401000, b"function");
    h.add_function(0x402000, b"function");

    // The patch data overrides the dispatched address.
    let patch = PatchData::new(0x402000, 0x1234, PatchKind::Rel32);
    let target = try_resolve(h.state(), 0x401000, Some(&patch)).unwrap();
    assert_eq!(target, host_entry(0x402000));
    assert_eq!(h.log.borrow().loads, [0x402000]);
    assert_eq!(h.log.borrow().patches, [(0x1234, host_entry(0x402000))]);
    assert_eq!(h.state().quick_cache.lookup(0x402000), Some(target));
    assert_eq!(h.state().quick_cache.lookup(0x401000), None);
    assert_eq!(h.global.stats.patched_sites, 1);

    // Call sites without patch information are left alone.
    let patch = PatchData::new(0x401000, 0, PatchKind::None);
    try_resolve(h.state(), 0x401000, Some(&patch)).unwrap();
    assert_eq!(h.log.borrow().patches.len(), 1);

    // Patch failures do not prevent dispatch.
    let patch = PatchData::new(0x401000, 0x5678, PatchKind::Abs64);
    assert_eq!(try_resolve(h.state(), 0x401000, Some(&patch)).unwrap(), host_entry(0x401000));
    assert_eq!(h.global.stats.patched_sites, 1);
}

#[test]
fn resolution_is_idempotent() {
    fn check(addrs: Vec<u16>) -> bool {
        let mut h = Harness::new("idempotent");
        let addrs: Vec<u64> = addrs.into_iter().map(|x| (x as u64 + 1) << 4).collect();
        for addr in &addrs {
            h.add_function(*addr, b"function");
        }

        for addr in &addrs {
            let first = h.dispatch(*addr).unwrap();
            let second = h.dispatch(*addr).unwrap();
            if first != host_entry(*addr) || first != second {
                return false;
            }
        }

        let mut unique = addrs.clone();
        unique.sort_unstable();
        unique.dedup();
        let mut loads = h.log.borrow().loads.clone();
        loads.sort_unstable();
        loads == unique
    }
    quickcheck::QuickCheck::new().tests(20).quickcheck(check as fn(Vec<u16>) -> bool);
}

#[test]
fn dispatcher_descriptors() {
    let generic = dispatch::get(DispatchKind::Generic);
    assert_eq!(generic.quick_dispatch_func, crate::rerun_dispatch_generic as usize);
    assert_eq!(generic.full_dispatch_func, generic.quick_dispatch_func);
    assert_eq!(generic.patch_data_reg, 6);

    let pinned = dispatch::get(DispatchKind::Pinned);
    if dispatch::pinned_supported() {
        assert_ne!(pinned.quick_dispatch_func, pinned.full_dispatch_func);
        assert_ne!(pinned.quick_dispatch_func, generic.quick_dispatch_func);
        let expected = if cfg!(target_arch = "x86_64") { 14 } else { 16 };
        assert_eq!(pinned.patch_data_reg, expected);
    }
    else {
        assert_eq!(pinned.quick_dispatch_func, generic.quick_dispatch_func);
    }

    let symbols = dispatch::runtime_symbols(DispatchKind::Generic);
    assert_eq!(symbols, [("rerun_dispatch_generic", generic.quick_dispatch_func)]);
    let symbols = dispatch::runtime_symbols(DispatchKind::Pinned);
    assert_eq!(symbols.len() > 1, dispatch::pinned_supported());
}

/// Tests that execute translated code. Tests that never return run in a child process.
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
mod exec {
    use object::{
        write::{self, StandardSection},
        Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope,
    };
    use rerun_cpu::RuntimeConfig;

    use super::*;

    const CHILD_ENV: &str = "RERUN_DISPATCH_TEST_CHILD";

    /// `mov qword ptr [rdi], 0x402000; ret`
    const GENERIC_NEXT: &[u8] = &[0x48, 0xc7, 0x07, 0x00, 0x20, 0x40, 0x00, 0xc3];

    /// `mov rdi, [rdi + 8]; mov eax, SYS_exit_group; syscall`
    const GENERIC_EXIT: &[u8] =
        &[0x48, 0x8b, 0x7f, 0x08, 0xb8, 0xe7, 0x00, 0x00, 0x00, 0x0f, 0x05];

    /// `mov ebx, 0x402000; ret`
    const PINNED_NEXT: &[u8] = &[0xbb, 0x00, 0x20, 0x40, 0x00, 0xc3];

    /// `mov rdi, rax; mov eax, SYS_exit_group; syscall`
    const PINNED_EXIT: &[u8] = &[0x48, 0x89, 0xc7, 0xb8, 0xe7, 0x00, 0x00, 0x00, 0x0f, 0x05];

    fn function_object(addr: u64, code: &[u8]) -> Vec<u8> {
        let mut obj =
            write::Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        let text = obj.section_id(StandardSection::Text);
        let offset = obj.append_section_data(text, code, 16);
        obj.add_symbol(write::Symbol {
            name: rerun_rtld::entry_symbol_name(addr).into_bytes(),
            value: offset,
            size: code.len() as u64,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: write::SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        obj.write().unwrap()
    }

    fn runtime(name: &str, kind: DispatchKind, functions: &[(u64, &[u8])]) -> Box<GlobalState> {
        let dir = temp_dir(name);
        for (addr, code) in functions {
            std::fs::write(dir.join(format!("{addr:x}")), function_object(*addr, code)).unwrap();
        }
        let config = RuntimeConfig {
            dispatch: kind,
            mem_base: None,
            data_size: 0x100 * page_size(),
            code_size: 0x100 * page_size(),
            ..RuntimeConfig::default()
        };
        crate::new_runtime(&config, FunctionStore::new(dir)).unwrap()
    }

    fn is_child(test: &str) -> bool {
        std::env::var(CHILD_ENV).map_or(false, |x| x == test)
    }

    fn run_child(test: &str) -> std::process::ExitStatus {
        std::process::Command::new(std::env::current_exe().unwrap())
            .args(["--exact", test, "--nocapture", "--test-threads=1"])
            .env(CHILD_ENV, test)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .unwrap()
    }

    #[test]
    fn generic_step_runs_loaded_code() {
        let mut global = runtime("step", DispatchKind::Generic, &[(0x401000, GENERIC_NEXT)]);
        let state = unsafe { &mut *global.new_execution_state().unwrap() };
        state.set_pc(0x401000);

        let regs = state.regs_ptr();
        unsafe { crate::rerun_dispatch_generic(regs) };
        assert_eq!(state.pc(), 0x402000);
        assert_eq!(global.stats.objects_loaded, 1);

        // The second step for the same address is served by the quick cache.
        state.set_pc(0x401000);
        unsafe { crate::rerun_dispatch_generic(regs) };
        assert_eq!(state.pc(), 0x402000);
        assert_eq!(global.stats.resolutions, 1);

        std::fs::remove_dir_all(global.store.dir()).unwrap();
    }

    fn run_loop(
        name: &str,
        kind: DispatchKind,
        functions: &[(u64, &[u8])],
        setup: fn(&mut GlobalState, &mut ExecutionState),
    ) -> ! {
        let global = Box::leak(runtime(name, kind, functions));
        let state = unsafe { &mut *global.new_execution_state().unwrap() };
        unsafe { ExecutionState::install(state).unwrap() };
        state.set_pc(0x401000);
        state.regs.set(1, 42);
        setup(global, state);

        let loop_func = global.dispatcher.loop_func;
        unsafe { loop_func(state.regs_ptr()) }
    }

    #[test]
    fn generic_loop() {
        const NAME: &str = "tests::exec::generic_loop";
        if is_child(NAME) {
            let functions: &[(u64, &[u8])] = &[(0x401000, GENERIC_NEXT), (0x402000, GENERIC_EXIT)];
            run_loop("generic-loop", DispatchKind::Generic, functions, |_, _| {});
        }
        assert_eq!(run_child(NAME).code(), Some(42));
    }

    fn record_signal(state: &mut ExecutionState, signal: i32) {
        state.regs.set(1, signal as u64);
    }

    #[test]
    fn generic_loop_delivers_signals() {
        const NAME: &str = "tests::exec::generic_loop_delivers_signals";
        if is_child(NAME) {
            let functions: &[(u64, &[u8])] = &[(0x401000, GENERIC_NEXT), (0x402000, GENERIC_EXIT)];
            run_loop("signal-loop", DispatchKind::Generic, functions, |global, state| {
                global.signal_hook = Some(record_signal as rerun_cpu::SignalHook);
                state.raise_signal(libc::SIGUSR1);
            });
        }
        assert_eq!(run_child(NAME).code(), Some(libc::SIGUSR1));
    }

    #[test]
    fn pinned_loop() {
        const NAME: &str = "tests::exec::pinned_loop";
        if is_child(NAME) {
            let functions: &[(u64, &[u8])] = &[(0x401000, PINNED_NEXT), (0x402000, PINNED_EXIT)];
            run_loop("pinned-loop", DispatchKind::Pinned, functions, |_, _| {});
        }
        assert_eq!(run_child(NAME).code(), Some(42));
    }

    #[test]
    fn missing_object_exits_with_error_code() {
        const NAME: &str = "tests::exec::missing_object_exits_with_error_code";
        if is_child(NAME) {
            run_loop("missing-loop", DispatchKind::Generic, &[], |_, _| {});
        }
        // Exit status is the negated errno, truncated to 8 bits.
        assert_eq!(run_child(NAME).code(), Some(-libc::ENOENT & 0xff));
    }
}
