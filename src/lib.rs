//! arrayjit — a tracing JIT compiler and runtime for numerical array
//! programs.
//!
//! Symbolic array expressions are recorded into a graph of reference-counted
//! variables with common-subexpression elimination and literal folding.
//! Forcing a value schedules the live roots into kernel launch groups,
//! generates source (LLVM IR for the host, PTX for CUDA), compiles it
//! through a two-tier content-addressed cache, and launches the result on
//! the calling thread's stream or task chain.
//!
//! ```no_run
//! use arrayjit as jit;
//! use jit::{JitBackend, VarKind, VarType};
//!
//! jit::init(true, false);
//! let a = jit::var_new_literal(JitBackend::Host, VarType::Float32, 1, 3.0f32.to_bits() as u64)?;
//! let b = jit::var_new_counter(JitBackend::Host, 8)?;
//! let bf = jit::var_new_op(VarKind::Cast, VarType::Float32, 0, &[b])?;
//! let c = jit::var_new_op(VarKind::Add, VarType::Float32, 0, &[a, bf])?;
//! assert_eq!(f32::from_bits(jit::var_read(c, 4)? as u32), 7.0);
//! for v in [a, b, bf, c] {
//!     jit::var_dec_ref_ext(v)?;
//! }
//! jit::shutdown(false);
//! # Ok::<(), jit::Error>(())
//! ```

pub mod backend;
pub mod codegen;
pub mod errors;
pub mod eval;
pub mod kernel;
pub mod log;
pub mod malloc;
pub mod op;
pub mod pool;
pub mod registry;
pub mod state;
pub mod thread_state;
pub mod var;

pub use backend::JitBackend;
pub use errors::{Error, Result};
pub use kernel::Fingerprint;
pub use log::{LogCallback, LogLevel};
pub use malloc::AllocType;
pub use state::Statistics;
pub use var::{VarId, VarKind, VarType};

// ---------------------------------------------------------------------------
// Init / shutdown / logging
// ---------------------------------------------------------------------------

/// Initialize the runtime. `llvm` enables the host backend (native LLVM JIT
/// when a shared libLLVM is found, the portable executor otherwise), `cuda`
/// the GPU backend. Idempotent; missing drivers downgrade with a log entry
/// instead of failing.
pub fn init(llvm: bool, cuda: bool) {
    let mut guard = state::lock();
    state::init(&mut guard, llvm, cuda);
}

/// Release all runtime state: drain every thread state, drop the kernel
/// cache, report variable leaks (up to ten) and reset the allocator.
/// `light` keeps the backend library bindings loaded for a cheap re-init.
pub fn shutdown(light: bool) {
    let mut guard = state::lock();
    state::shutdown(&mut guard, light);
}

/// Level gate of the stderr sink.
pub fn set_log_level(level: LogLevel) {
    log::set_stderr_level(level);
}

/// Install (or clear) the callback sink.
pub fn set_log_callback(level: LogLevel, callback: Option<LogCallback>) {
    log::set_callback(level, callback);
}

/// Snapshot of the kernel cache / launch counters.
pub fn stats() -> Statistics {
    state::lock().stats
}

/// Number of live variables (diagnostics, tests).
pub fn var_count() -> usize {
    state::lock().store.len()
}

// ---------------------------------------------------------------------------
// Variable construction
// ---------------------------------------------------------------------------

/// Create a literal constant; `value` holds the element's bit pattern.
pub fn var_new_literal(backend: JitBackend, vt: VarType, size: u32, value: u64) -> Result<VarId> {
    let mut guard = state::lock();
    op::new_literal(&mut guard, backend, vt, size, value)
}

/// Copy host bytes into a fresh evaluated array variable.
pub fn var_new_data(backend: JitBackend, vt: VarType, size: u32, bytes: &[u8]) -> Result<VarId> {
    let mut guard = state::lock();
    op::new_data(&mut guard, backend, vt, size, bytes)
}

/// Create an operation node; see [`VarKind`] for the opcode table. Passing
/// `size == 0` infers the broadcast size from the operands.
pub fn var_new_op(kind: VarKind, vt: VarType, size: u32, deps: &[VarId]) -> Result<VarId> {
    let mut guard = state::lock();
    op::new_op(&mut guard, kind, vt, size, deps)
}

/// Lane index array `[0, 1, .., size)`.
pub fn var_new_counter(backend: JitBackend, size: u32) -> Result<VarId> {
    let mut guard = state::lock();
    op::new_counter(&mut guard, backend, size)
}

/// Input materialized only at launch from a caller-supplied buffer.
pub fn var_new_placeholder(backend: JitBackend, vt: VarType, size: u32) -> Result<VarId> {
    let mut guard = state::lock();
    op::new_placeholder(&mut guard, backend, vt, size)
}

pub fn var_bind_placeholder(id: VarId, ptr: usize) -> Result<()> {
    let mut guard = state::lock();
    op::bind_placeholder(&mut guard, id, ptr)
}

/// `source[index]` with random access.
pub fn var_gather(source: VarId, index: VarId) -> Result<VarId> {
    let mut guard = state::lock();
    op::gather(&mut guard, source, index)
}

/// `target[index] = value`, queued as a side effect. The returned handle
/// may be dropped immediately; the write still happens at the next
/// evaluation, and `target` reads as dirty until then.
pub fn var_scatter(target: VarId, value: VarId, index: VarId) -> Result<VarId> {
    let mut guard = state::lock();
    op::scatter(&mut guard, target, value, index)
}

/// Pin `id` so scheduling cannot eliminate it even without external reads.
pub fn var_mark_side_effect(id: VarId) -> Result<()> {
    let mut guard = state::lock();
    op::mark_side_effect(&mut guard, id)
}

/// Open a fresh value-numbering scope on the calling thread.
pub fn new_scope(backend: JitBackend) -> Result<u32> {
    let mut guard = state::lock();
    op::new_scope(&mut guard, backend)
}

// ---------------------------------------------------------------------------
// Reference counting and queries
// ---------------------------------------------------------------------------

pub fn var_inc_ref_ext(id: VarId) {
    let mut guard = state::lock();
    guard.store.inc_ref_ext(id);
}

pub fn var_dec_ref_ext(id: VarId) -> Result<()> {
    let mut guard = state::lock();
    let mut trash = Vec::new();
    guard.store.dec_ref_ext(id, &mut trash);
    state::dispose_trash(&mut guard, trash);
    Ok(())
}

pub fn var_exists(id: VarId) -> bool {
    state::lock().store.contains(id)
}

pub fn var_type(id: VarId) -> VarType {
    state::lock().store.var(id).vt
}

pub fn var_size(id: VarId) -> u32 {
    state::lock().store.var(id).size
}

pub fn var_ref_ext(id: VarId) -> u32 {
    state::lock().store.var(id).ref_ext
}

pub fn var_ref_int(id: VarId) -> u32 {
    state::lock().store.var(id).ref_int
}

pub fn var_is_evaluated(id: VarId) -> bool {
    state::lock().store.var(id).evaluated
}

pub fn var_is_literal(id: VarId) -> bool {
    state::lock().store.var(id).is_literal()
}

pub fn var_is_dirty(id: VarId) -> bool {
    state::lock().store.var(id).dirty
}

pub fn var_set_label(id: VarId, label: Option<&str>) -> Result<()> {
    let mut guard = state::lock();
    op::set_label(&mut guard, id, label)
}

pub fn var_label(id: VarId) -> Option<String> {
    state::lock().store.label(id).map(str::to_string)
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Queue `id` for evaluation at the next [`eval`].
pub fn var_schedule(id: VarId) -> Result<()> {
    let mut guard = state::lock();
    eval::schedule_var(&mut guard, id).map(|_| ())
}

/// Force evaluation of `id` (and everything scheduled with it).
pub fn var_eval(id: VarId) -> Result<()> {
    let mut guard = state::lock();
    eval::eval_var(&mut guard, id)
}

/// Evaluate everything queued on the calling thread.
pub fn eval() -> Result<()> {
    let mut guard = state::lock();
    for backend in [JitBackend::Host, JitBackend::Cuda] {
        let has = match backend {
            JitBackend::Host => guard.has_host,
            JitBackend::Cuda => guard.has_cuda,
        };
        if has {
            eval::eval_backend(&mut guard, backend)?;
        }
    }
    Ok(())
}

/// Force evaluation and read one element's bit pattern.
pub fn var_read(id: VarId, index: u32) -> Result<u64> {
    let mut guard = state::lock();
    eval::read_element(&mut guard, id, index)
}

// ---------------------------------------------------------------------------
// Backend control and synchronization
// ---------------------------------------------------------------------------

/// Rebind the calling thread to CUDA device `index`: the current stream is
/// flushed and destroyed, a fresh stream/event pair is created on the new
/// device's primary context.
pub fn cuda_set_device(index: i32) -> Result<()> {
    let mut guard = state::lock();
    state::cuda_set_device(&mut guard, index)
}

/// Override the host target machine (CPU name, feature string, vector
/// width). Kernels compiled afterwards use the new configuration.
pub fn llvm_set_target(cpu: &str, features: &str, width: u32) -> Result<()> {
    let mut guard = state::lock();
    match guard.host.as_mut() {
        Some(host) => {
            host.set_target(cpu, features, width);
            Ok(())
        }
        None => Err(Error::BackendInactive(
            "host",
            "not initialized".to_string(),
        )),
    }
}

/// Current host vector width (lanes per generated loop iteration).
pub fn llvm_vector_width() -> u32 {
    state::lock().host.as_ref().map(|h| h.vector_width).unwrap_or(0)
}

/// Wait for the calling thread's stream/task to drain.
pub fn sync_thread() {
    let mut guard = state::lock();
    state::sync_thread(&mut guard);
}

/// Wait for all host tasks and the current GPU context.
pub fn sync_device() {
    let mut guard = state::lock();
    state::sync_device(&mut guard);
}

/// Wait for every registered thread state.
pub fn sync_all_devices() {
    let mut guard = state::lock();
    state::sync_all_devices(&mut guard);
}

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

/// Allocate `size` bytes of `kind` memory (pooled).
pub fn malloc(kind: AllocType, size: usize) -> Result<usize> {
    let mut guard = state::lock();
    let (device, context) = if kind.is_host() {
        (-1, 0)
    } else {
        let ts = state::thread_state(&mut guard, JitBackend::Cuda)?;
        let ts = ts.lock();
        (ts.device, ts.context)
    };
    let state = &mut *guard;
    let mut raw = state::raw_device_alloc(&state.cuda, kind, context);
    state.alloc.malloc(kind, device, size, &mut raw)
}

/// Release a pointer obtained from [`malloc`]. Reclamation is deferred
/// behind the owning stream/task.
pub fn free(ptr: usize) {
    let mut guard = state::lock();
    state::dispose_trash(&mut guard, vec![ptr]);
}

/// Drain the allocator pools and return backing memory to the platform.
pub fn malloc_trim() {
    let mut guard = state::lock();
    let state = &mut *guard;
    let cuda = &state.cuda;
    state.alloc.trim(&mut |ptr, alloc| {
        if let Some(cuda) = cuda.as_ref() {
            if let Some(device) = cuda.device(alloc.device) {
                cuda.mem_free(device.context, ptr, alloc.kind == AllocType::HostPinned);
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Register an opaque pointer under `domain`; returns its dense ID.
pub fn registry_put(domain: &str, ptr: usize) -> Result<u32> {
    state::lock().registry.put(domain, ptr)
}

pub fn registry_get(domain: &str, id: u32) -> Result<usize> {
    state::lock().registry.get(domain, id)
}

pub fn registry_remove(domain: &str, id: u32) -> Result<()> {
    state::lock().registry.remove(domain, id)
}
