//! Process-wide runtime state and the lock discipline around it.
//!
//! One mutex guards everything shared: variable store, CSE index, kernel
//! cache, allocator pools, device list and the thread-state registry. Public
//! entry points lock exactly once and hand `&mut State` down; the few places
//! that block (sync, backend compile) release the lock for the duration via
//! `MutexGuard::unlocked`. Thread states are reached through thread-local
//! slots holding indexed handles into `State::tss`.

use std::cell::Cell;
use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};

use crate::backend::cuda::CudaBackend;
use crate::backend::llvm::HostBackend;
use crate::backend::JitBackend;
use crate::errors::{Error, Result};
use crate::kernel::{disk, KernelCache, KernelImage};
use crate::log::{jitlog, LogLevel};
use crate::malloc::{AllocType, Allocator};
use crate::pool::TaskPool;
use crate::registry::Registry;
use crate::thread_state::{ReleaseEntry, ReleaseFence, ThreadState};
use crate::var::VariableStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Statistics {
    /// Kernel served from the in-memory cache.
    pub kernel_hits: u64,
    /// Kernel reconstructed from the disk cache.
    pub kernel_soft_misses: u64,
    /// Kernel compiled from scratch.
    pub kernel_hard_misses: u64,
    pub kernel_launches: u64,
}

pub struct State {
    pub store: VariableStore,
    pub alloc: Allocator,
    pub registry: Registry,
    pub kernels: KernelCache,
    pub tss: Vec<Arc<Mutex<ThreadState>>>,
    /// Bumped at shutdown so stale thread-local slots are re-created.
    pub tss_generation: u64,
    pub host: Option<HostBackend>,
    pub cuda: Option<CudaBackend>,
    pub pool: Option<Arc<TaskPool>>,
    pub cache_dir: Option<PathBuf>,
    pub stats: Statistics,
    pub scope_ctr: u32,
    pub has_host: bool,
    pub has_cuda: bool,
}

// Buffers and foreign handles are plain addresses whose ownership the
// allocator and kernel cache track explicitly.
unsafe impl Send for State {}

impl State {
    fn new() -> State {
        State {
            store: VariableStore::new(),
            alloc: Allocator::new(),
            registry: Registry::new(),
            kernels: KernelCache::new(),
            tss: Vec::new(),
            tss_generation: 1,
            host: None,
            cuda: None,
            pool: None,
            cache_dir: None,
            stats: Statistics::default(),
            scope_ctr: 0,
            has_host: false,
            has_cuda: false,
        }
    }
}

static STATE: Lazy<Mutex<State>> = Lazy::new(|| Mutex::new(State::new()));

pub fn lock() -> MutexGuard<'static, State> {
    STATE.lock()
}

thread_local! {
    static TLS_HOST: Cell<(u64, usize)> = const { Cell::new((0, 0)) };
    static TLS_CUDA: Cell<(u64, usize)> = const { Cell::new((0, 0)) };
}

fn tls_slot(backend: JitBackend) -> &'static std::thread::LocalKey<Cell<(u64, usize)>> {
    match backend {
        JitBackend::Host => &TLS_HOST,
        JitBackend::Cuda => &TLS_CUDA,
    }
}

/// Initialize the requested backends (idempotent, best effort).
pub fn init(state: &mut State, llvm: bool, cuda: bool) {
    if state.has_host || state.has_cuda || (!llvm && !cuda) {
        return;
    }

    match disk::cache_dir() {
        Ok(dir) => match disk::ensure_dir(&dir) {
            Ok(()) => state.cache_dir = Some(dir),
            Err(e) => {
                jitlog!(
                    LogLevel::Warn,
                    "init(): could not create cache directory {}: {e}",
                    dir.display()
                );
            }
        },
        Err(e) => jitlog!(LogLevel::Warn, "init(): no cache directory: {e}"),
    }

    if llvm {
        if state.host.is_none() {
            state.host = Some(HostBackend::init());
        }
        state.has_host = true;
        if state.pool.is_none() {
            state.pool = Some(Arc::new(TaskPool::new(TaskPool::default_workers())));
        }
    }

    if cuda && cfg!(not(target_os = "macos")) {
        if state.cuda.is_none() {
            match CudaBackend::init() {
                Ok(backend) => {
                    state.cuda = Some(backend);
                    state.has_cuda = true;
                }
                Err(reason) => {
                    jitlog!(LogLevel::Info, "init(): CUDA backend inactive: {reason}");
                }
            }
        } else {
            state.has_cuda = true;
        }
    }

    state.stats = Statistics::default();
    jitlog!(
        LogLevel::Info,
        "init(): host={}, cuda={} ({} devices)",
        state.has_host,
        state.has_cuda,
        state.cuda.as_ref().map(|c| c.devices.len()).unwrap_or(0)
    );
}

/// Acquire (or lazily create) the calling thread's state for `backend`.
pub fn thread_state(
    state: &mut State,
    backend: JitBackend,
) -> Result<Arc<Mutex<ThreadState>>> {
    let slot = tls_slot(backend);
    let (generation, index) = slot.with(Cell::get);
    if generation == state.tss_generation && index != 0 {
        if let Some(ts) = state.tss.get(index - 1) {
            return Ok(Arc::clone(ts));
        }
    }

    let ts = match backend {
        JitBackend::Host => {
            if !state.has_host {
                return Err(Error::BackendInactive(
                    "host",
                    "the LLVM/host backend was not initialized; call init() first".to_string(),
                ));
            }
            ThreadState::host()
        }
        JitBackend::Cuda => {
            let Some(cuda) = state.cuda.as_ref() else {
                return Err(Error::BackendInactive(
                    "cuda",
                    "no CUDA driver library or no compatible device was found; set \
                     ARRAYJIT_LIBCUDA_PATH to point at the driver"
                        .to_string(),
                ));
            };
            let device = cuda.devices.first().cloned().ok_or_else(|| {
                Error::BackendInactive("cuda", "no compatible CUDA devices".to_string())
            })?;
            let (stream, event) = cuda.create_stream(&device);
            ThreadState::cuda(device.id, device.context, stream, event)
        }
    };

    let ts = Arc::new(Mutex::new(ts));
    state.tss.push(Arc::clone(&ts));
    let generation = state.tss_generation;
    let index = state.tss.len();
    slot.with(|cell| cell.set((generation, index)));
    Ok(ts)
}

/// Current thread's state if it already exists (never creates one).
pub fn existing_thread_state(
    state: &State,
    backend: JitBackend,
) -> Option<Arc<Mutex<ThreadState>>> {
    let (generation, index) = tls_slot(backend).with(Cell::get);
    if generation == state.tss_generation && index != 0 {
        state.tss.get(index - 1).cloned()
    } else {
        None
    }
}

/// Route buffers released by dying variables onto the owning thread's
/// release chain (behind its current stream/task), or straight back to the
/// pools when nothing is in flight.
pub fn dispose_trash(state: &mut State, trash: Vec<usize>) {
    for ptr in trash {
        let alloc = state.alloc.release(ptr);
        let backend = if alloc.kind.is_host() {
            JitBackend::Host
        } else {
            JitBackend::Cuda
        };
        let fence = existing_thread_state(state, backend)
            .map(|ts| ts.lock().current_fence())
            .unwrap_or(ReleaseFence::None);
        match fence {
            ReleaseFence::None => state.alloc.reclaim(ptr, alloc),
            fence => {
                if let Some(ts) = existing_thread_state(state, backend) {
                    ts.lock().release_chain.push(ReleaseEntry { ptr, alloc, fence });
                } else {
                    state.alloc.reclaim(ptr, alloc);
                }
            }
        }
    }
}

/// Walk one release chain and reclaim every entry whose fence completed.
pub fn flush_release_chain(state: &mut State, ts: &Arc<Mutex<ThreadState>>) {
    let mut ts = ts.lock();
    let chain = std::mem::take(&mut ts.release_chain);
    for entry in chain {
        let done = match &entry.fence {
            ReleaseFence::None => true,
            ReleaseFence::Task(handle) => handle.is_finished(),
            ReleaseFence::Event { context, event } => state
                .cuda
                .as_ref()
                .map(|c| c.event_done(*context, *event))
                .unwrap_or(true),
        };
        if done {
            state.alloc.reclaim(entry.ptr, entry.alloc);
        } else {
            ts.release_chain.push(entry);
        }
    }
}

/// Platform allocation callback for device memory kinds.
pub fn raw_device_alloc<'a>(
    cuda: &'a Option<CudaBackend>,
    kind: AllocType,
    context: usize,
) -> impl FnMut(usize) -> Option<usize> + 'a {
    move |size| {
        let cuda = cuda.as_ref()?;
        match kind {
            AllocType::Device => cuda.mem_alloc(context, false, size),
            AllocType::Managed => cuda.mem_alloc(context, true, size),
            AllocType::HostPinned => cuda.mem_alloc_host(context, size),
            _ => None,
        }
    }
}

/// Wait until this thread's work drained. The global lock is released while
/// waiting.
pub fn sync_thread(guard: &mut MutexGuard<'_, State>) {
    for backend in [JitBackend::Host, JitBackend::Cuda] {
        let Some(ts) = existing_thread_state(guard, backend) else {
            continue;
        };
        sync_thread_state(guard, &ts);
        flush_release_chain(guard, &ts);
    }
}

pub fn sync_thread_state(guard: &mut MutexGuard<'_, State>, ts: &Arc<Mutex<ThreadState>>) {
    let (backend, task, context, stream) = {
        let mut ts = ts.lock();
        (
            ts.backend,
            ts.task.take(),
            ts.context,
            ts.stream,
        )
    };
    match backend {
        JitBackend::Host => {
            if let Some(task) = task {
                MutexGuard::unlocked(guard, || task.wait());
            }
        }
        JitBackend::Cuda => {
            // The cloned API handle keeps the driver binding alive while the
            // global lock is dropped for the wait.
            if let Some(api) = guard.cuda.as_ref().map(|c| Arc::clone(&c.api)) {
                MutexGuard::unlocked(guard, || {
                    crate::backend::cuda::sync_stream_raw(&api, context, stream);
                });
            }
        }
    }
}

/// Wait for all host tasks and the current device context.
pub fn sync_device(guard: &mut MutexGuard<'_, State>) {
    if let Some(ts) = existing_thread_state(guard, JitBackend::Cuda) {
        let context = ts.lock().context;
        if let Some(api) = guard.cuda.as_ref().map(|c| Arc::clone(&c.api)) {
            MutexGuard::unlocked(guard, || {
                crate::backend::cuda::sync_context_raw(&api, context);
            });
        }
        flush_release_chain(guard, &ts);
    }
    let host_states: Vec<_> = guard
        .tss
        .iter()
        .filter(|ts| ts.lock().backend == JitBackend::Host)
        .cloned()
        .collect();
    for ts in host_states {
        sync_thread_state(guard, &ts);
        flush_release_chain(guard, &ts);
    }
}

/// Wait for every registered thread state.
pub fn sync_all_devices(guard: &mut MutexGuard<'_, State>) {
    let all: Vec<_> = guard.tss.to_vec();
    for ts in all {
        sync_thread_state(guard, &ts);
        flush_release_chain(guard, &ts);
    }
}

/// Rebind the calling thread to device `index` (CUDA).
pub fn cuda_set_device(guard: &mut MutexGuard<'_, State>, index: i32) -> Result<()> {
    let ts = thread_state(guard, JitBackend::Cuda)?;
    {
        let ts_ref = ts.lock();
        if ts_ref.device == index {
            return Ok(());
        }
    }
    let device = {
        let cuda = guard
            .cuda
            .as_ref()
            .ok_or_else(|| Error::BackendInactive("cuda", "not initialized".to_string()))?;
        cuda.device(index)
            .cloned()
            .ok_or_else(|| {
                Error::invalid(format!(
                    "cuda_set_device({index}): must be in the range 0..{}",
                    cuda.devices.len()
                ))
            })?
    };
    jitlog!(LogLevel::Info, "cuda_set_device({index})");

    sync_thread_state(guard, &ts);
    flush_release_chain(guard, &ts);

    let cuda = guard.cuda.as_ref().expect("checked above");
    let mut ts = ts.lock();
    cuda.destroy_stream(ts.context, ts.stream, ts.event);
    let (stream, event) = cuda.create_stream(&device);
    ts.device = device.id;
    ts.context = device.context;
    ts.stream = stream;
    ts.event = event;
    Ok(())
}

/// Release everything. `light` keeps the backend library bindings loaded so
/// a subsequent `init` is cheap; the variable leak report runs either way.
pub fn shutdown(guard: &mut MutexGuard<'_, State>, light: bool) {
    if !guard.has_host && !guard.has_cuda {
        return;
    }
    jitlog!(
        LogLevel::Info,
        "shutdown(): releasing {} thread state{}",
        guard.tss.len(),
        if guard.tss.len() == 1 { "" } else { "s" }
    );

    // Drain all pending work, then reclaim every deferred release.
    let all: Vec<_> = guard.tss.to_vec();
    for ts in &all {
        sync_thread_state(guard, ts);
        flush_release_chain(guard, ts);
    }
    for ts in &all {
        let mut ts = ts.lock();
        if !ts.active_mask.is_empty() {
            jitlog!(
                LogLevel::Warn,
                "shutdown(): leaked {} active mask scopes",
                ts.active_mask.len()
            );
        }
        if ts.backend == JitBackend::Cuda {
            if let Some(cuda) = guard.cuda.as_ref() {
                cuda.destroy_stream(ts.context, ts.stream, ts.event);
            }
        }
        ts.stream = 0;
        ts.event = 0;
    }
    guard.tss.clear();
    guard.tss_generation += 1;

    if let Some(pool) = guard.pool.take() {
        pool.destroy();
    }

    // Kernel cache: unload device modules, then drop the records.
    let kernels = guard.kernels.clear();
    if !kernels.is_empty() {
        jitlog!(
            LogLevel::Info,
            "shutdown(): releasing {} kernel{}",
            kernels.len(),
            if kernels.len() == 1 { "" } else { "s" }
        );
    }
    for kernel in kernels {
        if let KernelImage::Cuda(image) = &kernel.image {
            if let Some(cuda) = guard.cuda.as_ref() {
                for (device, (module, _)) in image.modules.lock().drain() {
                    if let Some(dev) = cuda.device(device) {
                        cuda.module_unload(dev.context, module);
                    }
                }
            }
        }
    }

    report_leaks(guard);

    let leaked_registry = guard.registry.report_leaks();
    if leaked_registry > 0 {
        jitlog!(
            LogLevel::Warn,
            "shutdown(): {leaked_registry} registry entries are still registered"
        );
    }
    guard.registry.clear();

    // Allocator teardown; device blocks go back through the driver.
    let cuda = guard.cuda.take();
    guard.alloc.shutdown(&mut |ptr, alloc| {
        if let Some(cuda) = cuda.as_ref() {
            if let Some(device) = cuda.device(alloc.device) {
                cuda.mem_free(device.context, ptr, alloc.kind == AllocType::HostPinned);
            }
        }
    });
    guard.cuda = cuda;

    if !light {
        if let Some(mut cuda) = guard.cuda.take() {
            cuda.shutdown();
        }
        guard.host = None;
    }

    guard.has_host = false;
    guard.has_cuda = false;
    jitlog!(LogLevel::Info, "shutdown(): done");
}

/// Variable leak report, capped at ten lines like the rest of the
/// diagnostics.
fn report_leaks(state: &mut State) {
    if state.store.is_empty() {
        if state.store.cse_len() != 0 {
            crate::errors::fatal("shutdown(): the CSE index leaked entries");
        }
        return;
    }

    let mut ids: Vec<_> = state.store.ids().collect();
    ids.sort_unstable();
    jitlog!(LogLevel::Warn, "shutdown(): detected variable leaks:");
    for (count, id) in ids.iter().enumerate() {
        if count == 10 {
            jitlog!(LogLevel::Warn, " - (skipping the remainder)");
            break;
        }
        let v = state.store.var(*id);
        jitlog!(
            LogLevel::Warn,
            " - variable r{id} is still referenced (internal={}, external={})",
            v.ref_int,
            v.ref_ext
        );
    }
    jitlog!(
        LogLevel::Warn,
        "shutdown(): {} variables are still referenced",
        ids.len()
    );
}
