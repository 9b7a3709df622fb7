//! Host backend: vector ISA detection and the native JIT capability.
//!
//! The shared LLVM library is located and bound at runtime (never linked),
//! so the crate builds and runs on machines without LLVM installed; in that
//! case host kernels execute through the portable interpreter instead. The
//! compile pipeline mirrors what the C API expects: wrap the IR text in a
//! memory buffer, parse it in one shared context, verify, run the O2
//! pipeline with unrolling and re-vectorization disabled, then let MCJIT
//! emit the object through a custom memory manager whose arena we copy into
//! executable pages.

use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::Arc;

use libloading::Library;
use parking_lot::Mutex;

use crate::codegen::types::ConstTemplates;
use crate::errors::fatal;
use crate::log::{jitlog, LogLevel};

/// Work items handed to the pool cover this many elements each.
pub const DEFAULT_BLOCK_SIZE: u32 = 16384;

/// Result of a native compilation: raw object bytes plus the offsets the
/// kernel loader needs to relocate them into an executable mapping.
pub struct NativeObject {
    pub bytes: Vec<u8>,
    pub entries: Vec<usize>,
    pub reloc: Vec<usize>,
}

pub struct HostBackend {
    pub vector_width: u32,
    pub block_size: u32,
    pub target_cpu: String,
    pub target_features: String,
    pub opaque_pointers: bool,
    pub templates: ConstTemplates,
    /// Present when a usable libLLVM was found; `None` selects the portable
    /// interpreter.
    pub jit: Option<Arc<LlvmJit>>,
}

impl HostBackend {
    pub fn init() -> HostBackend {
        let (width, features) = detect_isa();
        let jit = match LlvmJit::load(width) {
            Ok(jit) => Some(Arc::new(jit)),
            Err(reason) => {
                jitlog!(
                    LogLevel::Info,
                    "host backend: using the portable executor ({reason})"
                );
                None
            }
        };
        let (cpu, features) = match &jit {
            Some(jit) => (jit.host_cpu.clone(), jit.host_features.clone()),
            None => ("native".to_string(), features),
        };
        jitlog!(
            LogLevel::Info,
            "host backend: width={width}, cpu={cpu}, {}",
            if jit.is_some() { "llvm jit" } else { "portable" }
        );
        HostBackend {
            vector_width: width,
            block_size: DEFAULT_BLOCK_SIZE,
            target_cpu: cpu,
            target_features: features,
            opaque_pointers: jit.as_ref().map(|j| j.version.0 >= 15).unwrap_or(true),
            templates: ConstTemplates::new(width),
            jit,
        }
    }

    /// Override the target machine configuration (`llvm_set_target`).
    pub fn set_target(&mut self, cpu: &str, features: &str, width: u32) {
        self.target_cpu = cpu.to_string();
        self.target_features = features.to_string();
        if width.is_power_of_two() && width <= 64 {
            self.vector_width = width;
            self.templates = ConstTemplates::new(width);
        }
    }
}

/// Width selection per the host ISA: SSE4.2 -> 4, AVX -> 8, AVX-512 -> 16,
/// 4 lanes on Apple/ARM. Hosts without FMA cannot use the native path.
fn detect_isa() -> (u32, String) {
    #[cfg(target_arch = "x86_64")]
    {
        let mut width = 1;
        let mut features = Vec::new();
        if std::arch::is_x86_feature_detected!("sse4.2") {
            width = 4;
            features.push("+sse4.2");
        }
        if std::arch::is_x86_feature_detected!("avx") {
            width = 8;
            features.push("+avx");
        }
        if std::arch::is_x86_feature_detected!("avx2") {
            features.push("+avx2");
        }
        if std::arch::is_x86_feature_detected!("avx512vl") {
            width = 16;
            features.push("+avx512f,+avx512vl");
        }
        if std::arch::is_x86_feature_detected!("fma") {
            features.push("+fma");
        }
        (width.max(4), features.join(","))
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        (4, String::new())
    }
}

#[cfg(target_arch = "x86_64")]
fn host_has_fma() -> bool {
    std::arch::is_x86_feature_detected!("fma")
}

#[cfg(not(target_arch = "x86_64"))]
fn host_has_fma() -> bool {
    true
}

// Raw C API signatures, resolved from the shared library at init.
type FnParseIr = unsafe extern "C" fn(
    ctx: *mut c_void,
    buf: *mut c_void,
    module: *mut *mut c_void,
    message: *mut *mut c_char,
) -> i32;
type FnCreateBuffer =
    unsafe extern "C" fn(data: *const c_char, len: usize, name: *const c_char) -> *mut c_void;
type FnVerify =
    unsafe extern "C" fn(module: *mut c_void, action: i32, message: *mut *mut c_char) -> i32;
type FnRunPasses = unsafe extern "C" fn(
    module: *mut c_void,
    passes: *const c_char,
    tm: *mut c_void,
    options: *mut c_void,
) -> *mut c_void;
type FnCreateMemMgr = unsafe extern "C" fn(
    opaque: *mut c_void,
    alloc_code: AllocCodeCb,
    alloc_data: AllocDataCb,
    finalize: FinalizeCb,
    destroy: DestroyCb,
) -> *mut c_void;
type FnCreateMcjit = unsafe extern "C" fn(
    out: *mut *mut c_void,
    module: *mut c_void,
    options: *mut McjitOptions,
    options_size: usize,
    error: *mut *mut c_char,
) -> i32;
type FnGetFunctionAddress = unsafe extern "C" fn(ee: *mut c_void, name: *const c_char) -> u64;

type AllocCodeCb = unsafe extern "C" fn(
    opaque: *mut c_void,
    size: usize,
    align: u32,
    section_id: u32,
    section_name: *const c_char,
) -> *mut u8;
type AllocDataCb = unsafe extern "C" fn(
    opaque: *mut c_void,
    size: usize,
    align: u32,
    section_id: u32,
    section_name: *const c_char,
    read_only: i32,
) -> *mut u8;
type FinalizeCb = unsafe extern "C" fn(opaque: *mut c_void, error: *mut *mut c_char) -> i32;
type DestroyCb = unsafe extern "C" fn(opaque: *mut c_void);

#[repr(C)]
struct McjitOptions {
    opt_level: u32,
    code_model: i32,
    no_frame_pointer_elim: i32,
    enable_fast_isel: i32,
    mcjmm: *mut c_void,
}

/// Bump arena the MCJIT memory manager callbacks allocate from. One compile
/// at a time (the shared context requires it anyway), so a single arena
/// behind a mutex is enough.
#[derive(Default)]
struct Arena {
    data: Vec<u8>,
    offset: usize,
    saw_got: bool,
}

impl Arena {
    fn reset(&mut self, capacity: usize) {
        self.data.clear();
        self.data.resize(capacity, 0);
        self.offset = 0;
        self.saw_got = false;
    }

    fn bump(&mut self, size: usize, align: usize) -> *mut u8 {
        let align = align.max(16);
        let start = (self.offset + align - 1) & !(align - 1);
        let end = start + size;
        if end > self.data.len() {
            self.data.resize(end.next_power_of_two(), 0);
        }
        self.offset = end;
        // Stable for the duration of the compile: the vector is pre-sized
        // and only grows via resize above, before pointers escape.
        unsafe { self.data.as_mut_ptr().add(start) }
    }
}

unsafe extern "C" fn arena_alloc_code(
    opaque: *mut c_void,
    size: usize,
    align: u32,
    _section_id: u32,
    _section_name: *const c_char,
) -> *mut u8 {
    let arena = &mut *(opaque as *mut Arena);
    arena.bump(size, align as usize)
}

unsafe extern "C" fn arena_alloc_data(
    opaque: *mut c_void,
    size: usize,
    align: u32,
    _section_id: u32,
    section_name: *const c_char,
    _read_only: i32,
) -> *mut u8 {
    let arena = &mut *(opaque as *mut Arena);
    if !section_name.is_null() {
        let name = CStr::from_ptr(section_name).to_string_lossy();
        if name.contains("got") {
            arena.saw_got = true;
        }
    }
    arena.bump(size, align as usize)
}

unsafe extern "C" fn arena_finalize(_opaque: *mut c_void, _error: *mut *mut c_char) -> i32 {
    0
}

unsafe extern "C" fn arena_destroy(_opaque: *mut c_void) {}

/// Dynamically bound libLLVM. The library handle owns every symbol below,
/// so the field order keeps `lib` alive last.
pub struct LlvmJit {
    version: (u32, u32, u32),
    host_cpu: String,
    host_features: String,
    context: *mut c_void,
    parse_ir: FnParseIr,
    create_buffer: FnCreateBuffer,
    verify: FnVerify,
    run_passes: Option<FnRunPasses>,
    create_pb_options: Option<unsafe extern "C" fn() -> *mut c_void>,
    pb_set_loop_unrolling: Option<unsafe extern "C" fn(*mut c_void, i32)>,
    pb_set_loop_vectorization: Option<unsafe extern "C" fn(*mut c_void, i32)>,
    pb_set_slp_vectorization: Option<unsafe extern "C" fn(*mut c_void, i32)>,
    dispose_pb_options: Option<unsafe extern "C" fn(*mut c_void)>,
    create_mem_mgr: FnCreateMemMgr,
    create_mcjit: FnCreateMcjit,
    get_function_address: FnGetFunctionAddress,
    dispose_ee: unsafe extern "C" fn(*mut c_void),
    dispose_message: unsafe extern "C" fn(*mut c_char),
    arena: Mutex<Arena>,
    _lib: Library,
}

// The raw context pointer is only touched under `arena`'s lock.
unsafe impl Send for LlvmJit {}
unsafe impl Sync for LlvmJit {}

impl LlvmJit {
    /// Locate and bind libLLVM; best effort, never fatal.
    pub fn load(vector_width: u32) -> Result<LlvmJit, String> {
        if vector_width < 4 {
            return Err("no suitable vector ISA found".to_string());
        }
        if !host_has_fma() {
            return Err("host CPU lacks the fma instruction set".to_string());
        }

        let lib = find_library()?;

        unsafe {
            macro_rules! sym {
                ($name:literal) => {
                    match lib.get($name) {
                        Ok(s) => *s,
                        Err(_) => {
                            return Err(format!(
                                "symbol {} missing from libLLVM",
                                String::from_utf8_lossy($name)
                            ))
                        }
                    }
                };
            }
            macro_rules! opt_sym {
                ($name:literal) => {
                    lib.get($name).ok().map(|s| *s)
                };
            }

            // Target initialization; names depend on the architecture.
            #[cfg(target_arch = "x86_64")]
            let init_names: [&[u8]; 4] = [
                b"LLVMInitializeX86TargetInfo\0",
                b"LLVMInitializeX86Target\0",
                b"LLVMInitializeX86TargetMC\0",
                b"LLVMInitializeX86AsmPrinter\0",
            ];
            #[cfg(target_arch = "aarch64")]
            let init_names: [&[u8]; 4] = [
                b"LLVMInitializeAArch64TargetInfo\0",
                b"LLVMInitializeAArch64Target\0",
                b"LLVMInitializeAArch64TargetMC\0",
                b"LLVMInitializeAArch64AsmPrinter\0",
            ];
            #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
            let init_names: [&[u8]; 0] = [];

            for name in init_names {
                let f: unsafe extern "C" fn() = match lib.get(name) {
                    Ok(s) => *s,
                    Err(_) => return Err("target initialization symbols missing".to_string()),
                };
                f();
            }
            let link_mcjit: unsafe extern "C" fn() = sym!(b"LLVMLinkInMCJIT\0");
            link_mcjit();

            let ctx_create: unsafe extern "C" fn() -> *mut c_void = sym!(b"LLVMContextCreate\0");
            let get_cpu: unsafe extern "C" fn() -> *mut c_char = sym!(b"LLVMGetHostCPUName\0");
            let get_features: unsafe extern "C" fn() -> *mut c_char =
                sym!(b"LLVMGetHostCPUFeatures\0");
            let dispose_message: unsafe extern "C" fn(*mut c_char) =
                sym!(b"LLVMDisposeMessage\0");

            let run_passes: Option<FnRunPasses> = opt_sym!(b"LLVMRunPasses\0");
            let legacy_pm: Option<unsafe extern "C" fn() -> *mut c_void> =
                opt_sym!(b"LLVMCreatePassManager\0");
            if run_passes.is_none() && legacy_pm.is_none() {
                return Err("libLLVM exposes no usable pass manager API".to_string());
            }

            let cpu_raw = get_cpu();
            let features_raw = get_features();
            let host_cpu = CStr::from_ptr(cpu_raw).to_string_lossy().into_owned();
            let host_features = CStr::from_ptr(features_raw).to_string_lossy().into_owned();
            dispose_message(cpu_raw);
            dispose_message(features_raw);

            // New pass manager implies LLVM >= 13; opaque pointers >= 15.
            let version = if run_passes.is_some() { (15, 0, 0) } else { (12, 0, 0) };

            let jit = LlvmJit {
                version,
                host_cpu,
                host_features,
                context: ctx_create(),
                parse_ir: sym!(b"LLVMParseIRInContext\0"),
                create_buffer: sym!(b"LLVMCreateMemoryBufferWithMemoryRangeCopy\0"),
                verify: sym!(b"LLVMVerifyModule\0"),
                run_passes,
                create_pb_options: opt_sym!(b"LLVMCreatePassBuilderOptions\0"),
                pb_set_loop_unrolling: opt_sym!(b"LLVMPassBuilderOptionsSetLoopUnrolling\0"),
                pb_set_loop_vectorization: opt_sym!(
                    b"LLVMPassBuilderOptionsSetLoopVectorization\0"
                ),
                pb_set_slp_vectorization: opt_sym!(b"LLVMPassBuilderOptionsSetSLPVectorization\0"),
                dispose_pb_options: opt_sym!(b"LLVMDisposePassBuilderOptions\0"),
                create_mem_mgr: sym!(b"LLVMCreateSimpleMCJITMemoryManager\0"),
                create_mcjit: sym!(b"LLVMCreateMCJITCompilerForModule\0"),
                get_function_address: sym!(b"LLVMGetFunctionAddress\0"),
                dispose_ee: sym!(b"LLVMDisposeExecutionEngine\0"),
                dispose_message,
                arena: Mutex::new(Arena::default()),
                _lib: lib,
            };
            Ok(jit)
        }
    }

    pub fn version(&self) -> (u32, u32, u32) {
        self.version
    }

    /// Compile one module. Fatal on any failure, with the offending source
    /// attached; the caller already holds the per-fingerprint build gate.
    pub fn compile(&self, name: &str, source: &str) -> NativeObject {
        let mut arena = self.arena.lock();
        arena.reset(source.len().max(1 << 16));

        unsafe {
            let c_name = CString::new(name).expect("kernel names contain no NUL");
            let buffer =
                (self.create_buffer)(source.as_ptr() as *const c_char, source.len(), c_name.as_ptr());
            if buffer.is_null() {
                fatal("llvm: could not create a memory buffer for the module");
            }

            let mut module: *mut c_void = std::ptr::null_mut();
            let mut message: *mut c_char = std::ptr::null_mut();
            if (self.parse_ir)(self.context, buffer, &mut module, &mut message) != 0 {
                let detail = self.take_message(message);
                fatal(&format!(
                    "llvm: module parsing failed: {detail}\n\n{source}"
                ));
            }

            // 2 = LLVMReturnStatusAction
            let mut message: *mut c_char = std::ptr::null_mut();
            if (self.verify)(module, 2, &mut message) != 0 {
                let detail = self.take_message(message);
                fatal(&format!(
                    "llvm: module verification failed: {detail}\n\n{source}"
                ));
            }

            if let (Some(run), Some(create), Some(dispose)) = (
                self.run_passes,
                self.create_pb_options,
                self.dispose_pb_options,
            ) {
                let options = create();
                // The generated code is already vectorized; unrolling or
                // re-vectorizing it only bloats the kernels.
                if let Some(f) = self.pb_set_loop_unrolling {
                    f(options, 0);
                }
                if let Some(f) = self.pb_set_loop_vectorization {
                    f(options, 0);
                }
                if let Some(f) = self.pb_set_slp_vectorization {
                    f(options, 0);
                }
                let err = run(
                    module,
                    b"default<O2>\0".as_ptr() as *const c_char,
                    std::ptr::null_mut(),
                    options,
                );
                if !err.is_null() {
                    fatal("llvm: failed to run the optimization pipeline");
                }
                dispose(options);
            }

            let mem_mgr = (self.create_mem_mgr)(
                &mut *arena as *mut Arena as *mut c_void,
                arena_alloc_code,
                arena_alloc_data,
                arena_finalize,
                arena_destroy,
            );
            let mut options = McjitOptions {
                opt_level: 0,
                code_model: 0,
                no_frame_pointer_elim: 0,
                enable_fast_isel: 0,
                mcjmm: mem_mgr,
            };
            let mut ee: *mut c_void = std::ptr::null_mut();
            let mut message: *mut c_char = std::ptr::null_mut();
            if (self.create_mcjit)(
                &mut ee,
                module,
                &mut options,
                std::mem::size_of::<McjitOptions>(),
                &mut message,
            ) != 0
            {
                let detail = self.take_message(message);
                fatal(&format!("llvm: could not create the execution engine: {detail}"));
            }

            let addr = (self.get_function_address)(ee, c_name.as_ptr());
            if addr == 0 {
                fatal(&format!("llvm: entry point {name} was not emitted"));
            }

            if arena.saw_got {
                fatal(&format!(
                    "llvm: a global offset table was generated, which means an \
                     intrinsic is unsupported on this target. Offending kernel:\n\n{source}"
                ));
            }

            let base = arena.data.as_ptr() as u64;
            let entry = (addr - base) as usize;
            let bytes = arena.data[..arena.offset].to_vec();
            (self.dispose_ee)(ee);

            NativeObject {
                bytes,
                entries: vec![entry],
                reloc: vec![entry],
            }
        }
    }

    fn take_message(&self, message: *mut c_char) -> String {
        if message.is_null() {
            return "(no detail)".to_string();
        }
        unsafe {
            let s = CStr::from_ptr(message).to_string_lossy().into_owned();
            (self.dispose_message)(message);
            s
        }
    }
}

/// Locate the shared LLVM library: explicit override first, then the
/// platform's conventional names, newest first.
fn find_library() -> Result<Library, String> {
    if let Ok(path) = std::env::var("ARRAYJIT_LIBLLVM_PATH") {
        if !path.is_empty() {
            return unsafe { Library::new(&path) }
                .map_err(|e| format!("could not load {path}: {e}"));
        }
    }

    #[cfg(target_os = "linux")]
    const CANDIDATES: &[&str] = &[
        "libLLVM.so",
        "libLLVM-19.so",
        "libLLVM-18.so",
        "libLLVM-17.so",
        "libLLVM-16.so",
        "libLLVM-15.so",
        "libLLVM-14.so",
        "libLLVM.so.1",
    ];
    #[cfg(target_os = "macos")]
    const CANDIDATES: &[&str] = &["libLLVM.dylib", "/opt/homebrew/opt/llvm/lib/libLLVM.dylib"];
    #[cfg(target_os = "windows")]
    const CANDIDATES: &[&str] = &["LLVM-C.dll"];

    for name in CANDIDATES {
        if let Ok(lib) = unsafe { Library::new(name) } {
            jitlog!(LogLevel::Info, "host backend: loaded {name}");
            return Ok(lib);
        }
    }
    Err("no shared LLVM library found; set ARRAYJIT_LIBLLVM_PATH to override".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isa_detection_reports_a_usable_width() {
        let backend = HostBackend::init();
        assert!(backend.vector_width >= 4);
        assert!(backend.vector_width.is_power_of_two());
        assert_eq!(backend.block_size, DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn set_target_rebuilds_templates() {
        let mut backend = HostBackend::init();
        backend.set_target("skylake-avx512", "+avx512f", 16);
        assert_eq!(backend.vector_width, 16);
        assert_eq!(backend.templates.width, 16);
        // Invalid widths leave the configuration untouched.
        backend.set_target("skylake-avx512", "+avx512f", 13);
        assert_eq!(backend.vector_width, 16);
    }

    #[test]
    fn arena_alignment_and_growth() {
        let mut arena = Arena::default();
        arena.reset(64);
        let a = arena.bump(10, 16) as usize;
        let b = arena.bump(100, 32) as usize;
        assert_eq!(a % 16, 0);
        assert_eq!(b % 32, 0);
        assert!(arena.offset >= 110);
    }
}
