//! Evaluation scheduling: topological ordering and kernel group formation.
//!
//! Roots are the side-effect queue plus everything explicitly scheduled.
//! Their unevaluated transitive dependencies are visited depth-first in
//! post-order (slot order within a node, ascending ID across roots) and the
//! resulting sequence is cut into launch groups whenever the backend or the
//! broadcast size changes. Each group is flattened into a [`Program`] whose
//! serialized form doubles as the cache fingerprint, so scheduling the same
//! trace twice always lands on the same kernel.

use std::collections::{HashMap, HashSet};

use crate::backend::JitBackend;
use crate::errors::{Error, Result};
use crate::kernel::program::{Operand, ParamInfo, ProgOp, Program};
use crate::kernel::Fingerprint;
use crate::var::{VarId, VarKind, VarType, VariableStore};

/// How a parameter slot is bound to a buffer at launch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamBinding {
    /// Evaluated variable; bind its buffer.
    Buffer(VarId),
    /// Pointer literal; bind the address stored in its payload.
    Address(VarId),
    /// Placeholder; bind the externally supplied buffer.
    External(VarId),
    /// Output to allocate before launch.
    Output(VarId),
}

impl ParamBinding {
    pub fn var(self) -> VarId {
        match self {
            ParamBinding::Buffer(v)
            | ParamBinding::Address(v)
            | ParamBinding::External(v)
            | ParamBinding::Output(v) => v,
        }
    }
}

/// One kernel launch: the program, its identity, and how each parameter
/// slot maps back to the variable store.
pub struct Group {
    pub backend: JitBackend,
    pub size: u32,
    pub program: Program,
    pub bindings: Vec<ParamBinding>,
    /// `(VarId, param slot)` of every node materialized by this launch.
    pub outputs: Vec<(VarId, u32)>,
    /// Scatter targets whose dirty flag clears once this launch runs.
    pub scatter_targets: Vec<VarId>,
    /// Side-effect nodes consumed by this launch.
    pub side_effects: Vec<VarId>,
    pub fingerprint: Fingerprint,
    pub desc: Vec<u8>,
}

/// A leaf from the group's perspective.
fn is_leaf(store: &VariableStore, id: VarId) -> bool {
    let v = store.var(id);
    v.evaluated || v.placeholder || (v.is_literal() && v.vt == VarType::Pointer)
}

/// Depth-first post-order over the unevaluated dependencies of `roots`.
fn post_order(store: &VariableStore, roots: &[VarId]) -> Vec<VarId> {
    let mut order = Vec::new();
    let mut visited: HashSet<VarId> = HashSet::new();
    let mut stack: Vec<(VarId, usize)> = Vec::new();

    let mut sorted_roots: Vec<VarId> = roots.to_vec();
    sorted_roots.sort_unstable();
    sorted_roots.dedup();

    for root in sorted_roots {
        if visited.contains(&root) || is_leaf(store, root) {
            continue;
        }
        stack.push((root, 0));
        visited.insert(root);
        while let Some((id, slot)) = stack.pop() {
            let v = store.var(id);
            if slot < 4 {
                stack.push((id, slot + 1));
                let dep = v.dep[slot];
                if dep != 0 && !visited.contains(&dep) && !is_leaf(store, dep) {
                    visited.insert(dep);
                    stack.push((dep, 0));
                }
            } else {
                order.push(id);
            }
        }
    }
    order
}

/// Schedule `roots` into launch groups. `side_effects` lists the subset of
/// roots that came from the side-effect queue (they are consumed by their
/// group instead of materialized).
pub fn schedule(
    store: &VariableStore,
    roots: &[VarId],
    side_effects: &[VarId],
) -> Result<Vec<Group>> {
    for &root in roots {
        let v = store.var(root);
        if v.symbolic {
            return Err(Error::invalid(format!(
                "schedule(): variable r{root} is symbolic and cannot be evaluated"
            )));
        }
    }

    let order = post_order(store, roots);
    if order.is_empty() {
        return Ok(Vec::new());
    }

    // Cut the ordered sequence at backend or size boundaries. Size-1 nodes
    // ride along with whatever group is open.
    let mut spans: Vec<(JitBackend, u32, Vec<VarId>)> = Vec::new();
    for &id in &order {
        let v = store.var(id);
        let fits = spans.last().map(|(backend, size, _)| {
            *backend == v.backend && (v.size == *size || v.size == 1 || *size == 1)
        });
        match fits {
            Some(true) => {
                let span = spans.last_mut().expect("non-empty");
                span.1 = span.1.max(v.size);
                span.2.push(id);
            }
            _ => spans.push((v.backend, v.size, vec![id])),
        }
    }

    // A node is materialized when it is a root, still externally referenced,
    // or consumed by a node outside its own span.
    let mut span_of: HashMap<VarId, usize> = HashMap::new();
    for (i, (_, _, ids)) in spans.iter().enumerate() {
        for &id in ids {
            span_of.insert(id, i);
        }
    }
    let root_set: HashSet<VarId> = roots.iter().copied().collect();
    let se_set: HashSet<VarId> = side_effects.iter().copied().collect();
    let mut cross_span: HashSet<VarId> = HashSet::new();
    for (i, (_, _, ids)) in spans.iter().enumerate() {
        for &id in ids {
            for dep in store.var(id).dep {
                if dep != 0 {
                    if let Some(&src) = span_of.get(&dep) {
                        if src != i {
                            cross_span.insert(dep);
                        }
                    }
                }
            }
        }
    }

    let mut groups = Vec::with_capacity(spans.len());
    for (backend, size, ids) in spans {
        groups.push(build_group(
            store,
            backend,
            size,
            &ids,
            &root_set,
            &se_set,
            &cross_span,
        )?);
    }
    Ok(groups)
}

fn build_group(
    store: &VariableStore,
    backend: JitBackend,
    size: u32,
    ids: &[VarId],
    roots: &HashSet<VarId>,
    side_effects: &HashSet<VarId>,
    cross_span: &HashSet<VarId>,
) -> Result<Group> {
    let mut node_index: HashMap<VarId, u32> = HashMap::new();
    let mut param_index: HashMap<VarId, u32> = HashMap::new();
    let mut params: Vec<ParamInfo> = Vec::new();
    let mut bindings: Vec<ParamBinding> = Vec::new();
    let mut ops: Vec<ProgOp> = Vec::new();
    let mut stores: Vec<(u32, u32)> = Vec::new();
    let mut outputs: Vec<(VarId, u32)> = Vec::new();
    let mut scatter_targets: Vec<VarId> = Vec::new();
    let mut group_side_effects: Vec<VarId> = Vec::new();

    for &id in ids {
        let v = store.var(id);
        let mut arg = [Operand::None; 4];
        for (slot, &dep) in v.dep.iter().enumerate() {
            if dep == 0 {
                continue;
            }
            // The liveness edge of a pointer literal stays outside the
            // program; the address alone is handed to the kernel.
            if v.is_literal() && v.vt == VarType::Pointer && slot == 3 {
                continue;
            }
            if let Some(&idx) = node_index.get(&dep) {
                arg[slot] = Operand::Node(idx);
                continue;
            }
            let d = store.var(dep);
            let slot_idx = match param_index.get(&dep) {
                Some(&s) => s,
                None => {
                    let (info, binding) = if d.is_literal() && d.vt == VarType::Pointer {
                        (
                            ParamInfo {
                                vt: VarType::Pointer,
                                scalar: true,
                                pointer: true,
                                output: false,
                            },
                            ParamBinding::Address(dep),
                        )
                    } else if d.placeholder && !d.evaluated {
                        if d.size != 1 && d.size != size {
                            return Err(Error::invalid(format!(
                                "schedule(): placeholder r{dep} has size {} in a group of \
                                 size {size}",
                                d.size
                            )));
                        }
                        (
                            ParamInfo {
                                vt: d.vt,
                                scalar: d.size == 1,
                                pointer: false,
                                output: false,
                            },
                            ParamBinding::External(dep),
                        )
                    } else if d.evaluated {
                        (
                            ParamInfo {
                                vt: d.vt,
                                scalar: d.size == 1,
                                pointer: false,
                                output: false,
                            },
                            ParamBinding::Buffer(dep),
                        )
                    } else {
                        // Materialized by an earlier group of this schedule.
                        (
                            ParamInfo {
                                vt: d.vt,
                                scalar: d.size == 1,
                                pointer: false,
                                output: false,
                            },
                            ParamBinding::Buffer(dep),
                        )
                    };
                    let s = params.len() as u32;
                    params.push(info);
                    bindings.push(binding);
                    param_index.insert(dep, s);
                    s
                }
            };
            arg[slot] = Operand::Param(slot_idx);
        }

        let idx = ops.len() as u32;
        node_index.insert(id, idx);
        ops.push(ProgOp {
            kind: v.kind,
            vt: v.vt,
            scalar: v.size == 1,
            arg,
            literal: if v.is_literal() && v.vt == VarType::Pointer {
                // Addresses never reach the serialized description.
                0
            } else {
                v.literal
            },
        });

        if v.kind == VarKind::Scatter {
            group_side_effects.push(id);
            // dep[0] is the write pointer; its liveness edge names the
            // buffer that stops being dirty once this launch ran.
            let ptr = v.dep[0];
            if ptr != 0 {
                let target = store.var(ptr).dep[3];
                if target != 0 {
                    scatter_targets.push(target);
                }
            }
            continue;
        }

        let materialize = (roots.contains(&id) && !side_effects.contains(&id))
            || v.ref_ext > 0
            || cross_span.contains(&id);
        if materialize && v.vt != VarType::Void {
            let slot = params.len() as u32;
            params.push(ParamInfo {
                vt: v.vt,
                scalar: v.size == 1,
                pointer: false,
                output: true,
            });
            bindings.push(ParamBinding::Output(id));
            stores.push((slot, idx));
            outputs.push((id, slot));
        }
    }

    let program = Program {
        params,
        ops,
        stores,
    };
    let desc = program.serialize(backend);
    let fingerprint = Fingerprint::of(&desc);

    Ok(Group {
        backend,
        size,
        program,
        bindings,
        outputs,
        scatter_targets,
        side_effects: group_side_effects,
        fingerprint,
        desc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::var::Variable;

    fn add_node(
        store: &mut VariableStore,
        kind: VarKind,
        vt: VarType,
        size: u32,
        deps: &[VarId],
    ) -> VarId {
        let mut v = Variable::new(JitBackend::Host, kind, vt, size);
        for (i, &d) in deps.iter().enumerate() {
            v.dep[i] = d;
            store.inc_ref_int(d);
        }
        let mut trash = Vec::new();
        let (id, _) = store.insert(v, true, &mut trash);
        assert!(trash.is_empty());
        id
    }

    fn literal(store: &mut VariableStore, bits: u64) -> VarId {
        let mut v = Variable::new(JitBackend::Host, VarKind::Literal, VarType::Float32, 1);
        v.literal = bits;
        let mut trash = Vec::new();
        let (id, _) = store.insert(v, true, &mut trash);
        id
    }

    #[test]
    fn single_group_with_inlined_literal() {
        let mut store = VariableStore::new();
        let lit = literal(&mut store, 3.0f32.to_bits() as u64);
        let ctr = add_node(&mut store, VarKind::Counter, VarType::UInt32, 8, &[]);
        let cast = add_node(&mut store, VarKind::Cast, VarType::Float32, 8, &[ctr]);
        let sum = add_node(&mut store, VarKind::Add, VarType::Float32, 8, &[cast, lit]);

        let groups = schedule(&store, &[sum], &[]).unwrap();
        assert_eq!(groups.len(), 1);
        let g = &groups[0];
        assert_eq!(g.size, 8);
        // Literal and counter ride inside the program; only the output is a
        // parameter.
        assert_eq!(g.program.params.len(), 1);
        assert!(g.program.params[0].output);
        assert_eq!(g.outputs, vec![(sum, 0)]);
        assert_eq!(g.program.ops.len(), 4);
    }

    #[test]
    fn size_mismatch_splits_groups() {
        let mut store = VariableStore::new();
        let a = add_node(&mut store, VarKind::Counter, VarType::UInt32, 8, &[]);
        let b = add_node(&mut store, VarKind::Counter, VarType::UInt32, 16, &[]);
        let groups = schedule(&store, &[a, b], &[]).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].size, 8);
        assert_eq!(groups[1].size, 16);
    }

    #[test]
    fn deterministic_fingerprints() {
        let build = || {
            let mut store = VariableStore::new();
            // Offset the ID space to show fingerprints do not depend on it.
            let _pad = literal(&mut store, 7);
            let ctr = add_node(&mut store, VarKind::Counter, VarType::UInt32, 32, &[]);
            let sq = add_node(&mut store, VarKind::Mul, VarType::UInt32, 32, &[ctr, ctr]);
            let groups = schedule(&store, &[sq], &[]).unwrap();
            groups[0].fingerprint
        };
        assert_eq!(build(), build());
    }
}
