//! CUDA backend: driver discovery, device management, module loading and
//! kernel launches.
//!
//! The driver library is located and bound at runtime. Devices must offer
//! unified addressing and managed memory; each suitable device retains its
//! primary context and a small pool of non-blocking sub-streams with
//! timing-disabled events. All driver entry points funnel through
//! [`CudaApi`], so the rest of the runtime never sees a raw symbol.

use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::Arc;

use libloading::Library;

use crate::errors::fatal;
use crate::log::{jitlog, LogLevel};

/// Non-blocking sub-streams (and paired events) created per device.
pub const SUB_STREAMS: usize = 4;

const CU_STREAM_NON_BLOCKING: u32 = 1;
const CU_EVENT_DISABLE_TIMING: u32 = 2;

// Device attribute identifiers from the driver API.
const ATTR_MULTIPROCESSOR_COUNT: i32 = 16;
const ATTR_UNIFIED_ADDRESSING: i32 = 41;
const ATTR_COMPUTE_CAPABILITY_MAJOR: i32 = 75;
const ATTR_COMPUTE_CAPABILITY_MINOR: i32 = 76;
const ATTR_MANAGED_MEMORY: i32 = 83;
const ATTR_MAX_SHARED_MEMORY_PER_BLOCK_OPTIN: i32 = 97;

const CU_MEM_ATTACH_GLOBAL: u32 = 1;

pub type CuResult = i32;

#[derive(Debug, Clone)]
pub struct Device {
    pub id: i32,
    pub compute_capability: u32,
    pub num_sm: u32,
    pub shared_memory_bytes: u32,
    pub context: usize,
    pub sub_streams: Vec<usize>,
    pub sub_events: Vec<usize>,
    pub peers: Vec<i32>,
}

/// Driver entry points, bound once at init.
pub struct CudaApi {
    init: unsafe extern "C" fn(u32) -> CuResult,
    device_get_count: unsafe extern "C" fn(*mut i32) -> CuResult,
    device_get_name: unsafe extern "C" fn(*mut c_char, i32, i32) -> CuResult,
    device_get_attribute: unsafe extern "C" fn(*mut i32, i32, i32) -> CuResult,
    device_total_mem: unsafe extern "C" fn(*mut usize, i32) -> CuResult,
    primary_ctx_retain: unsafe extern "C" fn(*mut usize, i32) -> CuResult,
    primary_ctx_release: unsafe extern "C" fn(i32) -> CuResult,
    ctx_push_current: unsafe extern "C" fn(usize) -> CuResult,
    ctx_pop_current: unsafe extern "C" fn(*mut usize) -> CuResult,
    ctx_synchronize: unsafe extern "C" fn() -> CuResult,
    stream_create: unsafe extern "C" fn(*mut usize, u32) -> CuResult,
    stream_destroy: unsafe extern "C" fn(usize) -> CuResult,
    stream_synchronize: unsafe extern "C" fn(usize) -> CuResult,
    event_create: unsafe extern "C" fn(*mut usize, u32) -> CuResult,
    event_destroy: unsafe extern "C" fn(usize) -> CuResult,
    event_record: unsafe extern "C" fn(usize, usize) -> CuResult,
    event_query: unsafe extern "C" fn(usize) -> CuResult,
    module_load_data: unsafe extern "C" fn(*mut usize, *const c_void) -> CuResult,
    module_unload: unsafe extern "C" fn(usize) -> CuResult,
    module_get_function: unsafe extern "C" fn(*mut usize, usize, *const c_char) -> CuResult,
    launch_kernel: unsafe extern "C" fn(
        usize,
        u32,
        u32,
        u32,
        u32,
        u32,
        u32,
        u32,
        usize,
        *mut *mut c_void,
        *mut *mut c_void,
    ) -> CuResult,
    mem_alloc: unsafe extern "C" fn(*mut usize, usize) -> CuResult,
    mem_alloc_managed: unsafe extern "C" fn(*mut usize, usize, u32) -> CuResult,
    mem_alloc_host: unsafe extern "C" fn(*mut usize, usize) -> CuResult,
    mem_free: unsafe extern "C" fn(usize) -> CuResult,
    mem_free_host: unsafe extern "C" fn(usize) -> CuResult,
    memcpy_htod_async: unsafe extern "C" fn(usize, *const c_void, usize, usize) -> CuResult,
    memcpy_dtoh_async: unsafe extern "C" fn(*mut c_void, usize, usize, usize) -> CuResult,
    device_can_access_peer: unsafe extern "C" fn(*mut i32, i32, i32) -> CuResult,
    ctx_enable_peer_access: unsafe extern "C" fn(usize, u32) -> CuResult,
    get_error_string: Option<unsafe extern "C" fn(CuResult, *mut *const c_char) -> CuResult>,
    _lib: Library,
}

unsafe impl Send for CudaApi {}
unsafe impl Sync for CudaApi {}

impl CudaApi {
    fn error_string(&self, rv: CuResult) -> String {
        if let Some(f) = self.get_error_string {
            let mut msg: *const c_char = std::ptr::null();
            unsafe {
                if f(rv, &mut msg) == 0 && !msg.is_null() {
                    return CStr::from_ptr(msg).to_string_lossy().into_owned();
                }
            }
        }
        format!("driver error {rv}")
    }

    fn check(&self, rv: CuResult, what: &str) {
        if rv != 0 {
            fatal(&format!("cuda: {what} failed: {}", self.error_string(rv)));
        }
    }
}

/// Push/pop the context of one device around driver calls.
pub struct ScopedContext<'a> {
    api: &'a CudaApi,
}

impl<'a> ScopedContext<'a> {
    pub fn new(api: &'a CudaApi, context: usize) -> Self {
        unsafe {
            api.check((api.ctx_push_current)(context), "cuCtxPushCurrent");
        }
        ScopedContext { api }
    }
}

impl Drop for ScopedContext<'_> {
    fn drop(&mut self) {
        let mut old = 0usize;
        unsafe {
            let _ = (self.api.ctx_pop_current)(&mut old);
        }
    }
}

pub struct CudaBackend {
    pub api: Arc<CudaApi>,
    pub devices: Vec<Device>,
}

impl CudaBackend {
    /// Best-effort driver initialization; `Err` carries the reason the
    /// backend stays inactive.
    pub fn init() -> Result<CudaBackend, String> {
        let api = Arc::new(load_api()?);

        unsafe {
            let rv = (api.init)(0);
            if rv != 0 {
                return Err(format!("cuInit failed: {}", api.error_string(rv)));
            }

            let mut count = 0i32;
            api.check((api.device_get_count)(&mut count), "cuDeviceGetCount");
            if count == 0 {
                return Err("no CUDA devices present".to_string());
            }

            let mut devices = Vec::new();
            for id in 0..count {
                let mut name = [0 as c_char; 256];
                api.check(
                    (api.device_get_name)(name.as_mut_ptr(), name.len() as i32, id),
                    "cuDeviceGetName",
                );
                let attr = |which: i32, label: &str| -> i32 {
                    let mut value = 0i32;
                    api.check((api.device_get_attribute)(&mut value, which, id), label);
                    value
                };
                let unified = attr(ATTR_UNIFIED_ADDRESSING, "unified addressing query");
                let managed = attr(ATTR_MANAGED_MEMORY, "managed memory query");
                let cc_major = attr(ATTR_COMPUTE_CAPABILITY_MAJOR, "compute capability query");
                let cc_minor = attr(ATTR_COMPUTE_CAPABILITY_MINOR, "compute capability query");
                let num_sm = attr(ATTR_MULTIPROCESSOR_COUNT, "SM count query");
                let shared = attr(
                    ATTR_MAX_SHARED_MEMORY_PER_BLOCK_OPTIN,
                    "shared memory query",
                );
                let mut total_mem = 0usize;
                api.check((api.device_total_mem)(&mut total_mem, id), "cuDeviceTotalMem");

                jitlog!(
                    LogLevel::Info,
                    " - found CUDA device {id}: \"{}\" (compute cap. {cc_major}.{cc_minor}, \
                     {num_sm} SMs, {} MiB)",
                    CStr::from_ptr(name.as_ptr()).to_string_lossy(),
                    total_mem >> 20
                );

                if unified == 0 {
                    jitlog!(
                        LogLevel::Warn,
                        " - device {id} lacks unified addressing, skipping"
                    );
                    continue;
                }
                if managed == 0 {
                    jitlog!(
                        LogLevel::Warn,
                        " - device {id} lacks managed memory, skipping"
                    );
                    continue;
                }

                let mut context = 0usize;
                api.check(
                    (api.primary_ctx_retain)(&mut context, id),
                    "cuDevicePrimaryCtxRetain",
                );

                let guard = ScopedContext::new(&api, context);
                let mut sub_streams = Vec::with_capacity(SUB_STREAMS);
                let mut sub_events = Vec::with_capacity(SUB_STREAMS);
                for _ in 0..SUB_STREAMS {
                    let mut stream = 0usize;
                    api.check(
                        (api.stream_create)(&mut stream, CU_STREAM_NON_BLOCKING),
                        "cuStreamCreate",
                    );
                    let mut event = 0usize;
                    api.check(
                        (api.event_create)(&mut event, CU_EVENT_DISABLE_TIMING),
                        "cuEventCreate",
                    );
                    sub_streams.push(stream);
                    sub_events.push(event);
                }
                drop(guard);

                devices.push(Device {
                    id,
                    compute_capability: (cc_major * 10 + cc_minor) as u32,
                    num_sm: num_sm as u32,
                    shared_memory_bytes: shared as u32,
                    context,
                    sub_streams,
                    sub_events,
                    peers: Vec::new(),
                });
            }

            if devices.is_empty() {
                return Err("no compatible CUDA devices found".to_string());
            }

            // Peer-to-peer access where the topology allows it.
            let ids: Vec<(i32, usize)> = devices.iter().map(|d| (d.id, d.context)).collect();
            for a in &mut devices {
                for &(peer_id, peer_ctx) in &ids {
                    if a.id == peer_id {
                        continue;
                    }
                    let mut ok = 0i32;
                    api.check(
                        (api.device_can_access_peer)(&mut ok, a.id, peer_id),
                        "cuDeviceCanAccessPeer",
                    );
                    if ok != 0 {
                        let _guard = ScopedContext::new(&api, a.context);
                        let rv = (api.ctx_enable_peer_access)(peer_ctx, 0);
                        // CUDA_ERROR_PEER_ACCESS_ALREADY_ENABLED = 704
                        if rv != 0 && rv != 704 {
                            api.check(rv, "cuCtxEnablePeerAccess");
                        }
                        jitlog!(
                            LogLevel::Debug,
                            " - enabled peer access {} -> {peer_id}",
                            a.id
                        );
                        a.peers.push(peer_id);
                    }
                }
            }

            Ok(CudaBackend { api, devices })
        }
    }

    pub fn device(&self, index: i32) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == index)
    }

    pub fn create_stream(&self, device: &Device) -> (usize, usize) {
        let _guard = ScopedContext::new(&self.api, device.context);
        let mut stream = 0usize;
        let mut event = 0usize;
        unsafe {
            self.api.check(
                (self.api.stream_create)(&mut stream, CU_STREAM_NON_BLOCKING),
                "cuStreamCreate",
            );
            self.api.check(
                (self.api.event_create)(&mut event, CU_EVENT_DISABLE_TIMING),
                "cuEventCreate",
            );
        }
        (stream, event)
    }

    pub fn destroy_stream(&self, context: usize, stream: usize, event: usize) {
        let _guard = ScopedContext::new(&self.api, context);
        unsafe {
            self.api
                .check((self.api.stream_synchronize)(stream), "cuStreamSynchronize");
            self.api.check((self.api.event_destroy)(event), "cuEventDestroy");
            self.api
                .check((self.api.stream_destroy)(stream), "cuStreamDestroy");
        }
    }

    pub fn sync_stream(&self, context: usize, stream: usize) {
        let _guard = ScopedContext::new(&self.api, context);
        unsafe {
            self.api
                .check((self.api.stream_synchronize)(stream), "cuStreamSynchronize");
        }
    }

    pub fn sync_context(&self, context: usize) {
        let _guard = ScopedContext::new(&self.api, context);
        unsafe {
            self.api.check((self.api.ctx_synchronize)(), "cuCtxSynchronize");
        }
    }

    pub fn record_event(&self, context: usize, event: usize, stream: usize) {
        let _guard = ScopedContext::new(&self.api, context);
        unsafe {
            self.api
                .check((self.api.event_record)(event, stream), "cuEventRecord");
        }
    }

    /// `true` once the event completed.
    pub fn event_done(&self, context: usize, event: usize) -> bool {
        let _guard = ScopedContext::new(&self.api, context);
        // CUDA_ERROR_NOT_READY = 600
        let rv = unsafe { (self.api.event_query)(event) };
        match rv {
            0 => true,
            600 => false,
            _ => {
                self.api.check(rv, "cuEventQuery");
                false
            }
        }
    }

    pub fn mem_alloc(&self, context: usize, managed: bool, size: usize) -> Option<usize> {
        let _guard = ScopedContext::new(&self.api, context);
        let mut ptr = 0usize;
        let rv = unsafe {
            if managed {
                (self.api.mem_alloc_managed)(&mut ptr, size, CU_MEM_ATTACH_GLOBAL)
            } else {
                (self.api.mem_alloc)(&mut ptr, size)
            }
        };
        (rv == 0).then_some(ptr)
    }

    pub fn mem_alloc_host(&self, context: usize, size: usize) -> Option<usize> {
        let _guard = ScopedContext::new(&self.api, context);
        let mut ptr = 0usize;
        let rv = unsafe { (self.api.mem_alloc_host)(&mut ptr, size) };
        (rv == 0).then_some(ptr)
    }

    pub fn mem_free(&self, context: usize, ptr: usize, host: bool) {
        let _guard = ScopedContext::new(&self.api, context);
        unsafe {
            let rv = if host {
                (self.api.mem_free_host)(ptr)
            } else {
                (self.api.mem_free)(ptr)
            };
            self.api.check(rv, "cuMemFree");
        }
    }

    pub fn copy_to_device(&self, context: usize, dst: usize, src: &[u8], stream: usize) {
        let _guard = ScopedContext::new(&self.api, context);
        unsafe {
            self.api.check(
                (self.api.memcpy_htod_async)(dst, src.as_ptr() as *const c_void, src.len(), stream),
                "cuMemcpyHtoDAsync",
            );
        }
    }

    pub fn copy_to_host(&self, context: usize, dst: &mut [u8], src: usize, stream: usize) {
        let _guard = ScopedContext::new(&self.api, context);
        unsafe {
            self.api.check(
                (self.api.memcpy_dtoh_async)(
                    dst.as_mut_ptr() as *mut c_void,
                    src,
                    dst.len(),
                    stream,
                ),
                "cuMemcpyDtoHAsync",
            );
        }
    }

    /// Load a PTX module and resolve every entry in `entry_names`.
    pub fn module_load(&self, context: usize, ptx: &str, entry_names: &[String]) -> (usize, Vec<usize>) {
        let _guard = ScopedContext::new(&self.api, context);
        // The loader expects NUL-terminated image data.
        let image = CString::new(ptx.replace('\0', "")).expect("PTX source");
        let mut module = 0usize;
        unsafe {
            let rv = (self.api.module_load_data)(&mut module, image.as_ptr() as *const c_void);
            if rv != 0 {
                fatal(&format!(
                    "cuda: PTX module rejected by the driver: {}\n\n{ptx}",
                    self.api.error_string(rv)
                ));
            }
            let mut functions = Vec::with_capacity(entry_names.len());
            for name in entry_names {
                let c_name = CString::new(name.as_str()).expect("entry name");
                let mut func = 0usize;
                self.api.check(
                    (self.api.module_get_function)(&mut func, module, c_name.as_ptr()),
                    "cuModuleGetFunction",
                );
                functions.push(func);
            }
            (module, functions)
        }
    }

    pub fn module_unload(&self, context: usize, module: usize) {
        let _guard = ScopedContext::new(&self.api, context);
        unsafe {
            self.api
                .check((self.api.module_unload)(module), "cuModuleUnload");
        }
    }

    /// Launch `func` over `size` elements on `stream`; one thread per lane,
    /// block shape derived from the device's SM count.
    pub fn launch(
        &self,
        device: &Device,
        func: usize,
        stream: usize,
        size: u32,
        params_device: usize,
    ) {
        let _guard = ScopedContext::new(&self.api, device.context);
        let block = 128u32;
        let grid = size.div_ceil(block).max(1).min(device.num_sm * 32);

        let mut size_arg = size;
        let mut table_arg = params_device as u64;
        let mut kernel_params: [*mut c_void; 2] = [
            &mut size_arg as *mut u32 as *mut c_void,
            &mut table_arg as *mut u64 as *mut c_void,
        ];
        unsafe {
            self.api.check(
                (self.api.launch_kernel)(
                    func,
                    grid,
                    1,
                    1,
                    block,
                    1,
                    1,
                    0,
                    stream,
                    kernel_params.as_mut_ptr(),
                    std::ptr::null_mut(),
                ),
                "cuLaunchKernel",
            );
        }
    }

    /// Shutdown: drain and release every device's resources.
    pub fn shutdown(&mut self) {
        unsafe {
            for device in &self.devices {
                {
                    let _guard = ScopedContext::new(&self.api, device.context);
                    for (&stream, &event) in device.sub_streams.iter().zip(&device.sub_events) {
                        let _ = (self.api.event_destroy)(event);
                        let _ = (self.api.stream_destroy)(stream);
                    }
                }
                let _ = (self.api.primary_ctx_release)(device.id);
            }
        }
        self.devices.clear();
    }
}

/// Stream synchronization through a bare API handle (used while the global
/// runtime lock is released).
pub fn sync_stream_raw(api: &CudaApi, context: usize, stream: usize) {
    let _guard = ScopedContext::new(api, context);
    unsafe {
        api.check((api.stream_synchronize)(stream), "cuStreamSynchronize");
    }
}

pub fn sync_context_raw(api: &CudaApi, context: usize) {
    let _guard = ScopedContext::new(api, context);
    unsafe {
        api.check((api.ctx_synchronize)(), "cuCtxSynchronize");
    }
}

fn load_api() -> Result<CudaApi, String> {
    let lib = find_library()?;
    unsafe {
        macro_rules! sym {
            ($name:literal) => {
                match lib.get($name) {
                    Ok(s) => *s,
                    Err(_) => {
                        return Err(format!(
                            "driver symbol {} missing",
                            String::from_utf8_lossy($name)
                        ))
                    }
                }
            };
        }
        Ok(CudaApi {
            init: sym!(b"cuInit\0"),
            device_get_count: sym!(b"cuDeviceGetCount\0"),
            device_get_name: sym!(b"cuDeviceGetName\0"),
            device_get_attribute: sym!(b"cuDeviceGetAttribute\0"),
            device_total_mem: sym!(b"cuDeviceTotalMem_v2\0"),
            primary_ctx_retain: sym!(b"cuDevicePrimaryCtxRetain\0"),
            primary_ctx_release: sym!(b"cuDevicePrimaryCtxRelease_v2\0"),
            ctx_push_current: sym!(b"cuCtxPushCurrent_v2\0"),
            ctx_pop_current: sym!(b"cuCtxPopCurrent_v2\0"),
            ctx_synchronize: sym!(b"cuCtxSynchronize\0"),
            stream_create: sym!(b"cuStreamCreate\0"),
            stream_destroy: sym!(b"cuStreamDestroy_v2\0"),
            stream_synchronize: sym!(b"cuStreamSynchronize\0"),
            event_create: sym!(b"cuEventCreate\0"),
            event_destroy: sym!(b"cuEventDestroy_v2\0"),
            event_record: sym!(b"cuEventRecord\0"),
            event_query: sym!(b"cuEventQuery\0"),
            module_load_data: sym!(b"cuModuleLoadData\0"),
            module_unload: sym!(b"cuModuleUnload\0"),
            module_get_function: sym!(b"cuModuleGetFunction\0"),
            launch_kernel: sym!(b"cuLaunchKernel\0"),
            mem_alloc: sym!(b"cuMemAlloc_v2\0"),
            mem_alloc_managed: sym!(b"cuMemAllocManaged\0"),
            mem_alloc_host: sym!(b"cuMemAllocHost_v2\0"),
            mem_free: sym!(b"cuMemFree_v2\0"),
            mem_free_host: sym!(b"cuMemFreeHost\0"),
            memcpy_htod_async: sym!(b"cuMemcpyHtoDAsync_v2\0"),
            memcpy_dtoh_async: sym!(b"cuMemcpyDtoHAsync_v2\0"),
            device_can_access_peer: sym!(b"cuDeviceCanAccessPeer\0"),
            ctx_enable_peer_access: sym!(b"cuCtxEnablePeerAccess\0"),
            get_error_string: lib.get(b"cuGetErrorString\0").ok().map(|s| *s),
            _lib: lib,
        })
    }
}

fn find_library() -> Result<Library, String> {
    if let Ok(path) = std::env::var("ARRAYJIT_LIBCUDA_PATH") {
        if !path.is_empty() {
            return unsafe { Library::new(&path) }
                .map_err(|e| format!("could not load {path}: {e}"));
        }
    }

    #[cfg(target_os = "linux")]
    const CANDIDATES: &[&str] = &["libcuda.so", "libcuda.so.1"];
    #[cfg(target_os = "macos")]
    const CANDIDATES: &[&str] = &["libcuda.dylib"];
    #[cfg(target_os = "windows")]
    const CANDIDATES: &[&str] = &["nvcuda.dll"];

    for name in CANDIDATES {
        if let Ok(lib) = unsafe { Library::new(name) } {
            jitlog!(LogLevel::Info, "cuda backend: loaded {name}");
            return Ok(lib);
        }
    }
    Err(
        "no CUDA driver library found; set ARRAYJIT_LIBCUDA_PATH to override"
            .to_string(),
    )
}
