//! Kernel evaluation: cache lookup, backend compilation and launch.

pub mod schedule;

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::backend::{portable, JitBackend};
use crate::codegen;
use crate::errors::{Error, Result};
use crate::kernel::cache::Lookup;
use crate::kernel::program::Program;
use crate::kernel::{disk, CudaImage, Kernel, KernelImage, NativeImage};
use crate::log::{jitlog, LogLevel};
use crate::malloc::AllocType;
use crate::state::{self, State};
use crate::thread_state::ThreadState;
use crate::var::{VarId, VarType};

use schedule::{Group, ParamBinding};

/// Evaluate everything queued on the calling thread's state for `backend`:
/// explicitly scheduled variables plus pending side effects.
pub fn eval_backend(guard: &mut MutexGuard<'_, State>, backend: JitBackend) -> Result<()> {
    let ts = state::thread_state(guard, backend)?;

    let (mut roots, side_effects) = {
        let mut ts = ts.lock();
        (
            std::mem::take(&mut ts.scheduled),
            std::mem::take(&mut ts.side_effects),
        )
    };
    roots.retain(|&id| {
        guard
            .store
            .try_var(id)
            .map(|v| !v.evaluated || v.dirty)
            .unwrap_or(false)
    });
    roots.extend(side_effects.iter().copied());
    if roots.is_empty() {
        return Ok(());
    }

    jitlog!(
        LogLevel::Debug,
        "eval(): evaluating {} root{} on the {} backend",
        roots.len(),
        if roots.len() == 1 { "" } else { "s" },
        backend.name()
    );

    let groups = schedule::schedule(&guard.store, &roots, &side_effects)?;
    for group in groups {
        execute_group(guard, &ts, group)?;
    }
    Ok(())
}

/// Queue a variable for evaluation at the next `eval`.
pub fn schedule_var(guard: &mut MutexGuard<'_, State>, id: VarId) -> Result<bool> {
    let v = guard.store.var(id);
    if v.evaluated && !v.dirty {
        return Ok(false);
    }
    if v.is_literal() && v.vt == VarType::Pointer {
        return Ok(false);
    }
    let backend = v.backend;
    let ts = state::thread_state(guard, backend)?;
    ts.lock().scheduled.push(id);
    Ok(true)
}

/// Force evaluation of one variable.
pub fn eval_var(guard: &mut MutexGuard<'_, State>, id: VarId) -> Result<()> {
    let backend = guard.store.var(id).backend;
    if schedule_var(guard, id)? || !guard.store.var(id).evaluated || guard.store.var(id).dirty {
        eval_backend(guard, backend)?;
    }
    Ok(())
}

fn execute_group(
    guard: &mut MutexGuard<'_, State>,
    ts: &Arc<Mutex<ThreadState>>,
    group: Group,
) -> Result<()> {
    let kernel = acquire_kernel(guard, ts, &group)?;

    // Bind parameter buffers; outputs are allocated here.
    let (device, context) = {
        let ts = ts.lock();
        (ts.device, ts.context)
    };
    let elem_count = group.size.max(1) as usize;
    let mut params: Vec<usize> = Vec::with_capacity(group.bindings.len());
    let mut trash = Vec::new();
    for &binding in &group.bindings {
        let ptr = match binding {
            ParamBinding::Buffer(v) => {
                let var = guard.store.var(v);
                if var.data == 0 {
                    return Err(Error::invalid(format!(
                        "eval(): variable r{v} was scheduled as an input but has no buffer"
                    )));
                }
                var.data
            }
            ParamBinding::Address(v) => guard.store.var(v).literal as usize,
            ParamBinding::External(v) => {
                let var = guard.store.var(v);
                if var.data == 0 {
                    return Err(Error::invalid(format!(
                        "eval(): placeholder r{v} was never bound to a buffer"
                    )));
                }
                var.data
            }
            ParamBinding::Output(v) => {
                let vt = guard.store.var(v).vt;
                // Host kernels process whole vectors; the trailing partial
                // vector must stay inside the buffer.
                let padded = match group.backend {
                    JitBackend::Host => elem_count.next_multiple_of(16),
                    JitBackend::Cuda => elem_count,
                };
                let bytes = padded * vt.size().max(1);
                let kind = match group.backend {
                    JitBackend::Host => AllocType::HostAsync,
                    JitBackend::Cuda => AllocType::Device,
                };
                let state = &mut **guard;
                let mut raw = state::raw_device_alloc(&state.cuda, kind, context);
                state.alloc.malloc(kind, device, bytes, &mut raw)?
            }
        };
        params.push(ptr);
    }

    launch(guard, ts, &group, &kernel, params.clone())?;
    guard.stats.kernel_launches += 1;

    // Materialize outputs and consume side effects.
    for &(id, slot) in &group.outputs {
        guard.store.make_data(id, params[slot as usize], &mut trash);
    }
    for &target in &group.scatter_targets {
        if guard.store.contains(target) {
            guard.store.var_mut(target).dirty = false;
        }
    }
    for &se in &group.side_effects {
        guard.store.dec_ref_int(se, &mut trash);
    }
    state::dispose_trash(guard, trash);
    Ok(())
}

/// Two-tier cache lookup with the per-fingerprint build gate.
fn acquire_kernel(
    guard: &mut MutexGuard<'_, State>,
    ts: &Arc<Mutex<ThreadState>>,
    group: &Group,
) -> Result<Arc<Kernel>> {
    let fingerprint = group.fingerprint;
    loop {
        match guard.kernels.lookup(fingerprint) {
            Lookup::Hit(kernel) => {
                guard.stats.kernel_hits += 1;
                return Ok(kernel);
            }
            Lookup::Busy(gate) => {
                MutexGuard::unlocked(guard, || gate.wait());
                continue;
            }
            Lookup::Build(_gate) => {
                let result = build_kernel(guard, ts, group);
                match result {
                    Ok(kernel) => {
                        guard.kernels.finish_build(Arc::clone(&kernel));
                        return Ok(kernel);
                    }
                    Err(e) => {
                        guard.kernels.abort_build(fingerprint);
                        return Err(e);
                    }
                }
            }
        }
    }
}

fn expected_tag(guard: &State, backend: JitBackend) -> disk::BackendTag {
    match backend {
        JitBackend::Cuda => disk::BackendTag::Cuda,
        JitBackend::Host => {
            if guard.host.as_ref().and_then(|h| h.jit.as_ref()).is_some() {
                disk::BackendTag::Native
            } else {
                disk::BackendTag::Portable
            }
        }
    }
}

fn build_kernel(
    guard: &mut MutexGuard<'_, State>,
    ts: &Arc<Mutex<ThreadState>>,
    group: &Group,
) -> Result<Arc<Kernel>> {
    let fingerprint = group.fingerprint;
    let tag = expected_tag(&**guard, group.backend);

    // L2 first: a matching on-disk artifact is a soft miss.
    if let Some(dir) = guard.cache_dir.clone() {
        match disk::read(&dir, fingerprint) {
            Ok(Some(entry)) if entry.backend == tag => {
                if let Some(kernel) = reconstruct(guard, ts, group, entry)? {
                    guard.stats.kernel_soft_misses += 1;
                    jitlog!(LogLevel::Debug, "kernel {fingerprint}: disk cache hit");
                    return Ok(kernel);
                }
            }
            Ok(_) => {}
            Err(e) => {
                jitlog!(LogLevel::Warn, "kernel {fingerprint}: cache read failed: {e}");
            }
        }
    }

    guard.stats.kernel_hard_misses += 1;
    let (kernel, metadata, payload) = compile(guard, ts, group)?;

    if let Some(dir) = guard.cache_dir.clone() {
        if let Err(e) = disk::write(&dir, fingerprint, tag, &metadata, &payload) {
            jitlog!(LogLevel::Warn, "kernel {fingerprint}: cache write failed: {e}");
        }
    }
    Ok(kernel)
}

/// Rebuild a kernel from its on-disk artifact. `Ok(None)` degrades to a
/// hard miss.
fn reconstruct(
    guard: &mut MutexGuard<'_, State>,
    ts: &Arc<Mutex<ThreadState>>,
    group: &Group,
    entry: disk::DiskKernel,
) -> Result<Option<Arc<Kernel>>> {
    let fingerprint = group.fingerprint;
    let kernel = match entry.backend {
        disk::BackendTag::Native => {
            let Some((entries, reloc)) = disk::decode_native_metadata(&entry.metadata) else {
                return Ok(None);
            };
            let size = entry.payload.len();
            let image = NativeImage::new(&entry.payload, entries, reloc)?;
            Kernel {
                fingerprint,
                image: KernelImage::Native(image),
                size,
            }
        }
        disk::BackendTag::Portable => {
            let Some((backend, program)) = Program::deserialize(&entry.payload) else {
                return Ok(None);
            };
            if backend != JitBackend::Host {
                return Ok(None);
            }
            Kernel {
                fingerprint,
                image: KernelImage::Portable(Arc::new(program)),
                size: entry.payload.len(),
            }
        }
        disk::BackendTag::Cuda => {
            let Some(entry_names) = disk::decode_entry_names(&entry.metadata) else {
                return Ok(None);
            };
            let Ok(ptx) = String::from_utf8(entry.payload) else {
                return Ok(None);
            };
            let (device, context) = {
                let ts = ts.lock();
                (ts.device, ts.context)
            };
            let Some(cuda) = guard.cuda.as_ref() else {
                return Ok(None);
            };
            let (module, functions) = cuda.module_load(context, &ptx, &entry_names);
            let size = ptx.len();
            let image = CudaImage::new(entry_names, ptx.into());
            image.modules.lock().insert(device, (module, functions));
            Kernel {
                fingerprint,
                image: KernelImage::Cuda(image),
                size,
            }
        }
    };
    Ok(Some(Arc::new(kernel)))
}

/// Hard-miss compilation for the group's backend.
fn compile(
    guard: &mut MutexGuard<'_, State>,
    ts: &Arc<Mutex<ThreadState>>,
    group: &Group,
) -> Result<(Arc<Kernel>, Vec<u8>, Vec<u8>)> {
    let fingerprint = group.fingerprint;
    match group.backend {
        JitBackend::Host => {
            let host = guard
                .host
                .as_ref()
                .ok_or_else(|| Error::BackendInactive("host", "not initialized".to_string()))?;
            match host.jit.as_ref() {
                Some(jit) => {
                    let jit = Arc::clone(jit);
                    let source = codegen::llvm::emit(
                        &group.program,
                        fingerprint,
                        host.vector_width,
                        &host.target_cpu,
                        &host.target_features,
                    );
                    let name = codegen::kernel_name(fingerprint);
                    jitlog!(
                        LogLevel::Debug,
                        "kernel {fingerprint}: compiling ({} bytes of IR)",
                        source.len()
                    );
                    // The build gate is held; other threads wait on it while
                    // the global lock is free.
                    let object =
                        MutexGuard::unlocked(guard, || jit.compile(&name, &source));
                    let metadata = disk::encode_native_metadata(&object.entries, &object.reloc);
                    let payload = object.bytes;
                    let image =
                        NativeImage::new(&payload, object.entries.clone(), object.reloc.clone())?;
                    let kernel = Arc::new(Kernel {
                        fingerprint,
                        image: KernelImage::Native(image),
                        size: payload.len(),
                    });
                    Ok((kernel, metadata, payload))
                }
                None => {
                    let program = Arc::new(group.program.clone());
                    let payload = group.desc.clone();
                    let kernel = Arc::new(Kernel {
                        fingerprint,
                        image: KernelImage::Portable(program),
                        size: payload.len(),
                    });
                    Ok((kernel, Vec::new(), payload))
                }
            }
        }
        JitBackend::Cuda => {
            let (device, context) = {
                let ts = ts.lock();
                (ts.device, ts.context)
            };
            let cuda = guard
                .cuda
                .as_ref()
                .ok_or_else(|| Error::BackendInactive("cuda", "not initialized".to_string()))?;
            let cc = cuda
                .device(device)
                .map(|d| d.compute_capability)
                .unwrap_or(50);
            let ptx = codegen::ptx::emit(&group.program, fingerprint, cc);
            let entry_names: Vec<String> = ptx
                .split('\0')
                .skip(1)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            let (module, functions) = cuda.module_load(context, &ptx, &entry_names);
            let metadata = disk::encode_entry_names(&entry_names);
            let payload = ptx.clone().into_bytes();
            let image = CudaImage::new(entry_names, ptx.into());
            image.modules.lock().insert(device, (module, functions));
            let kernel = Arc::new(Kernel {
                fingerprint,
                image: KernelImage::Cuda(image),
                size: payload.len(),
            });
            Ok((kernel, metadata, payload))
        }
    }
}

/// Native host kernel entry signature.
type NativeEntry = unsafe extern "C" fn(u64, u64, *const usize);

fn launch(
    guard: &mut MutexGuard<'_, State>,
    ts: &Arc<Mutex<ThreadState>>,
    group: &Group,
    kernel: &Arc<Kernel>,
    params: Vec<usize>,
) -> Result<()> {
    match &kernel.image {
        KernelImage::Portable(program) => {
            let pool = guard
                .pool
                .as_ref()
                .ok_or_else(|| Error::BackendInactive("host", "pool missing".to_string()))?
                .clone();
            let block_size = guard
                .host
                .as_ref()
                .map(|h| h.block_size as u64)
                .unwrap_or(crate::backend::llvm::DEFAULT_BLOCK_SIZE as u64);
            let program = Arc::clone(program);
            let params = Arc::new(params);
            // Scatter lanes must observe program order, so those kernels run
            // as one serial block.
            let block = if program.has_side_effects() {
                u64::MAX
            } else {
                block_size
            };
            let size = group.size.max(1) as u64;
            let func = {
                let program = Arc::clone(&program);
                let params = Arc::clone(&params);
                Arc::new(move |start: u64, end: u64| unsafe {
                    portable::launch(&program, &params, start, end);
                })
            };
            let mut ts = ts.lock();
            let prev = ts.task.clone();
            ts.task = Some(pool.submit_range(prev, size, block, func));
        }
        KernelImage::Native(image) => {
            let pool = guard
                .pool
                .as_ref()
                .ok_or_else(|| Error::BackendInactive("host", "pool missing".to_string()))?
                .clone();
            let block_size = guard
                .host
                .as_ref()
                .map(|h| h.block_size as u64)
                .unwrap_or(crate::backend::llvm::DEFAULT_BLOCK_SIZE as u64);
            let entry = image.entry_ptr(0);
            let params = Arc::new(params);
            let kernel = Arc::clone(kernel);
            let size = group.size.max(1) as u64;
            let func = {
                let params = Arc::clone(&params);
                Arc::new(move |start: u64, end: u64| unsafe {
                    // The kernel mapping stays alive through the captured Arc.
                    let f: NativeEntry = std::mem::transmute(entry);
                    f(start, end, params.as_ptr());
                    let _ = &kernel;
                })
            };
            let mut ts = ts.lock();
            let prev = ts.task.clone();
            ts.task = Some(pool.submit_range(prev, size, block_size, func));
        }
        KernelImage::Cuda(image) => {
            let (device_index, context, stream, event) = {
                let ts = ts.lock();
                (ts.device, ts.context, ts.stream, ts.event)
            };
            // After a device switch the module must be (re-)loaded on the
            // new device; the retained PTX makes that a driver call, not a
            // recompilation.
            let func = {
                let mut modules = image.modules.lock();
                match modules.get(&device_index) {
                    Some((_, functions)) => functions[0],
                    None => {
                        let cuda = guard.cuda.as_ref().ok_or_else(|| {
                            Error::BackendInactive("cuda", "not initialized".to_string())
                        })?;
                        let (module, functions) =
                            cuda.module_load(context, &image.ptx, &image.entry_names);
                        let f0 = functions[0];
                        modules.insert(device_index, (module, functions));
                        f0
                    }
                }
            };
            // The parameter table itself lives in device memory.
            let table_bytes: Vec<u8> = params
                .iter()
                .flat_map(|p| (*p as u64).to_le_bytes())
                .collect();
            let table = {
                let state = &mut **guard;
                let mut raw = state::raw_device_alloc(&state.cuda, AllocType::Device, context);
                state
                    .alloc
                    .malloc(AllocType::Device, device_index, table_bytes.len(), &mut raw)?
            };
            let cuda = guard
                .cuda
                .as_ref()
                .ok_or_else(|| Error::BackendInactive("cuda", "not initialized".to_string()))?;
            let device = cuda
                .device(device_index)
                .ok_or_else(|| Error::invalid(format!("unknown device {device_index}")))?
                .clone();
            cuda.copy_to_device(context, table, &table_bytes, stream);
            cuda.launch(&device, func, stream, group.size, table);
            cuda.record_event(context, event, stream);

            // The table is released behind the event just recorded.
            let alloc = guard.alloc.release(table);
            ts.lock().release_chain.push(crate::thread_state::ReleaseEntry {
                ptr: table,
                alloc,
                fence: crate::thread_state::ReleaseFence::Event { context, event },
            });
        }
    }
    Ok(())
}

/// Force evaluation (if needed) and read one element of a variable.
pub fn read_element(guard: &mut MutexGuard<'_, State>, id: VarId, index: u32) -> Result<u64> {
    let v = guard.store.var(id);
    if index >= v.size && v.size != 1 {
        return Err(Error::invalid(format!(
            "var_read(r{id}, {index}): index exceeds size {}",
            v.size
        )));
    }
    if v.is_literal() && !v.dirty {
        return Ok(v.literal);
    }
    if !v.evaluated || v.dirty {
        eval_var(guard, id)?;
    }
    state::sync_thread(guard);

    let v = guard.store.var(id);
    let vt = v.vt;
    let data = v.data;
    let index = if v.size == 1 { 0 } else { index };
    if data == 0 {
        return Err(Error::invalid(format!("var_read(r{id}): no buffer present")));
    }
    match v.backend {
        JitBackend::Host => {
            let bits = unsafe { read_element_raw(vt, data, index as usize) };
            Ok(bits)
        }
        JitBackend::Cuda => {
            let (context, stream) = {
                let ts = state::thread_state(guard, JitBackend::Cuda)?;
                let ts = ts.lock();
                (ts.context, ts.stream)
            };
            let cuda = guard
                .cuda
                .as_ref()
                .ok_or_else(|| Error::BackendInactive("cuda", "not initialized".to_string()))?;
            let mut buf = [0u8; 8];
            let elem = vt.size().max(1);
            cuda.copy_to_host(
                context,
                &mut buf[..elem],
                data + index as usize * elem,
                stream,
            );
            let api = Arc::clone(&cuda.api);
            MutexGuard::unlocked(guard, || {
                crate::backend::cuda::sync_stream_raw(&api, context, stream);
            });
            Ok(u64::from_le_bytes(buf))
        }
    }
}

unsafe fn read_element_raw(vt: VarType, data: usize, index: usize) -> u64 {
    let p = (data + index * vt.size().max(1)) as *const u8;
    match vt.size() {
        1 => std::ptr::read_unaligned(p) as u64,
        2 => std::ptr::read_unaligned(p as *const u16) as u64,
        4 => std::ptr::read_unaligned(p as *const u32) as u64,
        _ => std::ptr::read_unaligned(p as *const u64),
    }
}
