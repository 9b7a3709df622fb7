//! Variable construction: literals, data arrays, operations, memory ops.
//!
//! Everything here funnels into `VariableStore::insert`, which performs the
//! structural deduplication. Operations over literal-only operands fold to
//! a literal immediately, using the same scalar table the portable executor
//! runs on.

use parking_lot::MutexGuard;

use crate::backend::JitBackend;
use crate::errors::{fatal, Error, Result};
use crate::eval;
use crate::log::{jitlog, LogLevel};
use crate::malloc::AllocType;
use crate::state::{self, State};
use crate::var::fold;
use crate::var::{VarId, VarKind, VarType, Variable};

fn current_scope(state: &State, backend: JitBackend) -> u32 {
    state::existing_thread_state(state, backend)
        .map(|ts| ts.lock().scope)
        .unwrap_or(0)
}

/// Open a fresh CSE scope on the calling thread.
pub fn new_scope(guard: &mut MutexGuard<'_, State>, backend: JitBackend) -> Result<u32> {
    let scope = guard.scope_ctr.wrapping_add(1);
    guard.scope_ctr = scope;
    let ts = state::thread_state(guard, backend)?;
    ts.lock().scope = scope;
    Ok(scope)
}

/// Create (or find) a literal constant.
pub fn new_literal(
    guard: &mut MutexGuard<'_, State>,
    backend: JitBackend,
    vt: VarType,
    size: u32,
    value: u64,
) -> Result<VarId> {
    if size == 0 {
        return Err(Error::invalid("var_new_literal(): size must be non-zero"));
    }
    if vt == VarType::Void {
        return Err(Error::invalid("var_new_literal(): void literals are not a thing"));
    }
    let mut v = Variable::new(backend, VarKind::Literal, vt, size);
    v.literal = value & fold::type_mask(vt);
    v.scope = current_scope(guard, backend);
    let mut trash = Vec::new();
    let (id, _) = guard.store.insert(v, true, &mut trash);
    guard.store.inc_ref_ext(id);
    state::dispose_trash(guard, trash);
    Ok(id)
}

/// Wrap host bytes into an evaluated data variable (copied to the backend's
/// memory space).
pub fn new_data(
    guard: &mut MutexGuard<'_, State>,
    backend: JitBackend,
    vt: VarType,
    size: u32,
    bytes: &[u8],
) -> Result<VarId> {
    let elem = vt.size().max(1);
    if size == 0 || bytes.len() != size as usize * elem {
        return Err(Error::invalid(format!(
            "var_new_data(): expected {} bytes for {size} x {}, got {}",
            size as usize * elem,
            vt.name(),
            bytes.len()
        )));
    }

    let ts = state::thread_state(guard, backend)?;
    let (device, context, stream) = {
        let ts = ts.lock();
        (ts.device, ts.context, ts.stream)
    };
    let kind = match backend {
        JitBackend::Host => AllocType::HostAsync,
        JitBackend::Cuda => AllocType::Device,
    };
    // Host kernels read whole vectors, so the backing block covers a whole
    // number of lanes.
    let alloc_len = match backend {
        JitBackend::Host => (size as usize).next_multiple_of(16) * elem,
        JitBackend::Cuda => bytes.len(),
    };
    let buffer = {
        let state = &mut **guard;
        let mut raw = state::raw_device_alloc(&state.cuda, kind, context);
        state.alloc.malloc(kind, device, alloc_len, &mut raw)?
    };
    match backend {
        JitBackend::Host => unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), buffer as *mut u8, bytes.len());
        },
        JitBackend::Cuda => {
            let cuda = guard
                .cuda
                .as_ref()
                .ok_or_else(|| Error::BackendInactive("cuda", "not initialized".to_string()))?;
            cuda.copy_to_device(context, buffer, bytes, stream);
        }
    }

    let mut v = Variable::new(backend, VarKind::Data, vt, size);
    v.data = buffer;
    v.evaluated = true;
    let mut trash = Vec::new();
    let (id, _) = guard.store.insert(v, false, &mut trash);
    guard.store.inc_ref_ext(id);
    state::dispose_trash(guard, trash);
    Ok(id)
}

/// Input whose buffer is supplied at launch time.
pub fn new_placeholder(
    guard: &mut MutexGuard<'_, State>,
    backend: JitBackend,
    vt: VarType,
    size: u32,
) -> Result<VarId> {
    if size == 0 {
        return Err(Error::invalid("var_new_placeholder(): size must be non-zero"));
    }
    let mut v = Variable::new(backend, VarKind::Data, vt, size);
    v.placeholder = true;
    let mut trash = Vec::new();
    let (id, _) = guard.store.insert(v, false, &mut trash);
    guard.store.inc_ref_ext(id);
    state::dispose_trash(guard, trash);
    Ok(id)
}

/// Bind a placeholder to a caller-owned buffer.
pub fn bind_placeholder(guard: &mut MutexGuard<'_, State>, id: VarId, ptr: usize) -> Result<()> {
    let v = guard.store.var_mut(id);
    if !v.placeholder {
        return Err(Error::invalid(format!(
            "var_bind_placeholder(r{id}): not a placeholder"
        )));
    }
    v.data = ptr;
    v.retain_data = true;
    Ok(())
}

/// Lane counter 0..size; a size-1 counter collapses to the literal 0.
pub fn new_counter(
    guard: &mut MutexGuard<'_, State>,
    backend: JitBackend,
    size: u32,
) -> Result<VarId> {
    if size == 1 {
        return new_literal(guard, backend, VarType::UInt32, 1, 0);
    }
    let mut v = Variable::new(backend, VarKind::Counter, VarType::UInt32, size);
    v.scope = current_scope(guard, backend);
    let mut trash = Vec::new();
    let (id, _) = guard.store.insert(v, true, &mut trash);
    guard.store.inc_ref_ext(id);
    state::dispose_trash(guard, trash);
    Ok(id)
}

/// Create an IR node over up to four operands. `size` 0 infers the
/// broadcast size from the operands.
pub fn new_op(
    guard: &mut MutexGuard<'_, State>,
    kind: VarKind,
    vt: VarType,
    size: u32,
    deps: &[VarId],
) -> Result<VarId> {
    if deps.len() > 4 {
        return Err(Error::invalid("var_new_op(): 0-4 operands supported"));
    }
    if deps.len() != kind.arity() && !matches!(kind, VarKind::Gather | VarKind::Scatter) {
        return Err(Error::invalid(format!(
            "var_new_op(): \"{}\" takes {} operand(s), got {}",
            kind.name(),
            kind.arity(),
            deps.len()
        )));
    }
    if deps.iter().any(|&d| d == 0) {
        return Err(Error::invalid(
            "var_new_op(): arithmetic involving an uninitialized variable",
        ));
    }
    if kind.is_comparison() && vt != VarType::Bool {
        return Err(Error::invalid(format!(
            "var_new_op(): \"{}\" produces bool, not {}",
            kind.name(),
            vt.name()
        )));
    }

    // Broadcast validation (I5) and backend agreement.
    let backend = guard.store.var(deps[0]).backend;
    let mut inferred: u32 = 0;
    for &d in deps {
        let dv = guard.store.var(d);
        if dv.backend != backend {
            return Err(Error::invalid(
                "var_new_op(): operands live on different backends",
            ));
        }
        inferred = inferred.max(dv.size);
    }
    let size = if size == 0 { inferred } else { size.max(inferred) };
    for &d in deps {
        let ds = guard.store.var(d).size;
        if ds != size && ds != 1 {
            return Err(Error::invalid(format!(
                "var_new_op(): arithmetic involving arrays of incompatible size \
                 ({ds} and {size})"
            )));
        }
    }

    // Pending scatters on any operand are flushed before tracing continues.
    if deps.iter().any(|&d| guard.store.var(d).dirty) {
        eval::eval_backend(guard, backend)?;
        if deps.iter().any(|&d| guard.store.var(d).dirty) {
            fatal("var_new_op(): variable remains dirty after evaluation");
        }
    }

    // Literal folding.
    if kind.is_foldable() && deps.iter().all(|&d| guard.store.var(d).is_literal()) {
        let mut args = [0u64; 4];
        for (i, &d) in deps.iter().enumerate() {
            args[i] = guard.store.var(d).literal;
        }
        let folded = match kind {
            VarKind::Cast | VarKind::Bitcast => {
                let src = guard.store.var(deps[0]).vt;
                fold::eval_cast(src, vt, args[0], kind == VarKind::Bitcast)
            }
            _ => {
                let arg_vt = if kind.is_comparison() {
                    guard.store.var(deps[0]).vt
                } else {
                    vt
                };
                fold::eval_scalar(kind, arg_vt, args)
            }
        };
        if let Some(bits) = folded {
            jitlog!(
                LogLevel::Debug,
                "var_new_op({}): folded to a literal",
                kind.name()
            );
            return new_literal(guard, backend, vt, size, bits);
        }
    }

    let mut v = Variable::new(backend, kind, vt, size);
    v.scope = current_scope(guard, backend);
    for (i, &d) in deps.iter().enumerate() {
        v.dep[i] = d;
        let dv = guard.store.var_mut(d);
        dv.ref_int += 1;
        if dv.placeholder {
            v.placeholder = true;
        }
    }
    let mut trash = Vec::new();
    let (id, _) = guard.store.insert(v, true, &mut trash);
    guard.store.inc_ref_ext(id);
    state::dispose_trash(guard, trash);
    Ok(id)
}

/// Pointer literal referencing an evaluated variable's buffer. The liveness
/// edge sits in slot 3 where the scheduler ignores it.
fn new_pointer(
    guard: &mut MutexGuard<'_, State>,
    target: VarId,
    write: bool,
) -> Result<VarId> {
    let tv = guard.store.var(target);
    if !tv.evaluated || tv.data == 0 {
        return Err(Error::invalid(format!(
            "var_pointer(r{target}): target must be evaluated"
        )));
    }
    let backend = tv.backend;
    let address = tv.data as u64;

    let mut v = Variable::new(backend, VarKind::Literal, VarType::Pointer, 1);
    v.literal = address;
    v.dep[3] = target;
    v.scatter = write;
    guard.store.inc_ref_int(target);
    let mut trash = Vec::new();
    let (id, _) = guard.store.insert(v, true, &mut trash);
    guard.store.inc_ref_ext(id);
    state::dispose_trash(guard, trash);
    Ok(id)
}

/// Random-access read: `source[index]`.
pub fn gather(
    guard: &mut MutexGuard<'_, State>,
    source: VarId,
    index: VarId,
) -> Result<VarId> {
    {
        let v = guard.store.var(source);
        if !v.evaluated || v.dirty {
            eval::eval_var(guard, source)?;
        }
    }
    let vt = guard.store.var(source).vt;
    let size = guard.store.var(index).size;
    let ptr = new_pointer(guard, source, false)?;
    let result = new_op(guard, VarKind::Gather, vt, size, &[ptr, index]);
    let mut trash = Vec::new();
    guard.store.dec_ref_ext(ptr, &mut trash);
    state::dispose_trash(guard, trash);
    result
}

/// Random-access write: `target[index] = value`. Queued as a side effect;
/// the target reads as dirty until the next evaluation.
pub fn scatter(
    guard: &mut MutexGuard<'_, State>,
    target: VarId,
    value: VarId,
    index: VarId,
) -> Result<VarId> {
    {
        let v = guard.store.var(target);
        if !v.evaluated || v.dirty {
            eval::eval_var(guard, target)?;
        }
    }
    let backend = guard.store.var(target).backend;
    let size = guard
        .store
        .var(value)
        .size
        .max(guard.store.var(index).size);

    for &d in &[value, index] {
        let dv = guard.store.var(d);
        if dv.backend != backend {
            return Err(Error::invalid(
                "var_scatter(): operands live on different backends",
            ));
        }
        if dv.size != size && dv.size != 1 {
            return Err(Error::invalid(format!(
                "var_scatter(): arrays of incompatible size ({} and {size})",
                dv.size
            )));
        }
    }

    let ptr = new_pointer(guard, target, true)?;
    let mut v = Variable::new(backend, VarKind::Scatter, VarType::Void, size);
    v.scope = current_scope(guard, backend);
    v.scatter = true;
    v.side_effect = true;
    for (slot, &d) in [ptr, value, index].iter().enumerate() {
        v.dep[slot] = d;
        guard.store.inc_ref_int(d);
    }

    // Side effects never deduplicate.
    let mut trash = Vec::new();
    let (id, _) = guard.store.insert(v, false, &mut trash);
    guard.store.inc_ref_ext(id);
    guard.store.dec_ref_ext(ptr, &mut trash);
    guard.store.var_mut(target).dirty = true;
    state::dispose_trash(guard, trash);

    mark_side_effect(guard, id)?;
    Ok(id)
}

/// Pin a variable into the side-effect queue so the scheduler cannot drop
/// it even with no external reads.
pub fn mark_side_effect(guard: &mut MutexGuard<'_, State>, id: VarId) -> Result<()> {
    let backend = {
        let v = guard.store.var_mut(id);
        v.side_effect = true;
        v.backend
    };
    guard.store.inc_ref_int(id);
    let ts = state::thread_state(guard, backend)?;
    ts.lock().side_effects.push(id);
    Ok(())
}

/// Attach a diagnostic label; rejected when it would break the log format.
pub fn set_label(guard: &mut MutexGuard<'_, State>, id: VarId, label: Option<&str>) -> Result<()> {
    if let Some(l) = label {
        if l.contains('\n') || l.contains('/') {
            return Err(Error::invalid(
                "var_set_label(): labels may not contain newlines or '/'",
            ));
        }
    }
    let backend = guard.store.var(id).backend;
    let prefix = state::existing_thread_state(guard, backend)
        .and_then(|ts| ts.lock().prefix.clone());
    let combined = match (prefix, label) {
        (Some(p), Some(l)) => Some(format!("{p}{l}")),
        (Some(p), None) => Some(p),
        (None, Some(l)) => Some(l.to_string()),
        (None, None) => None,
    };
    jitlog!(
        LogLevel::Debug,
        "var_set_label(r{id}): \"{}\"",
        combined.as_deref().unwrap_or("(null)")
    );
    guard.store.set_label(id, combined);
    Ok(())
}
