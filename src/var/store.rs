//! Reference-counted variable store with structural deduplication.

use std::collections::HashMap;

use crate::errors::fatal;
use crate::log::{jitlog, LogLevel};

use super::{VarId, VarKind, VarType, Variable, VariableKey};

type Map<K, V> = HashMap<K, V, ahash::RandomState>;

/// Owns every live IR node, the CSE index and the ID counter.
///
/// All mutation happens under the global runtime lock; the store itself is
/// single-threaded data. Buffers released by dying variables are collected
/// into a caller-provided trash list so the allocator can sequence their
/// reclamation behind the owning stream.
pub struct VariableStore {
    vars: Map<VarId, Variable>,
    cse: Map<VariableKey, VarId>,
    labels: Map<VarId, String>,
    next_id: VarId,
    watermark: u32,
}

impl Default for VariableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableStore {
    pub fn new() -> Self {
        VariableStore {
            vars: Map::default(),
            cse: Map::default(),
            labels: Map::default(),
            next_id: 1,
            watermark: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn cse_len(&self) -> usize {
        self.cse.len()
    }

    pub fn watermark(&self) -> u32 {
        self.watermark
    }

    pub fn contains(&self, id: VarId) -> bool {
        self.vars.contains_key(&id)
    }

    pub fn try_var(&self, id: VarId) -> Option<&Variable> {
        self.vars.get(&id)
    }

    /// Access a variable; unknown IDs indicate a broken invariant upstream.
    pub fn var(&self, id: VarId) -> &Variable {
        match self.vars.get(&id) {
            Some(v) => v,
            None => fatal(&format!("variable r{id}: unknown variable")),
        }
    }

    pub fn var_mut(&mut self, id: VarId) -> &mut Variable {
        match self.vars.get_mut(&id) {
            Some(v) => v,
            None => fatal(&format!("variable r{id}: unknown variable")),
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = VarId> + '_ {
        self.vars.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (VarId, &Variable)> {
        self.vars.iter().map(|(id, v)| (*id, v))
    }

    /// Append a node, collapsing it onto a structurally identical live node
    /// when `enable_cse` holds. Dependency `ref_int` counts must already
    /// reflect the new node; on a CSE hit the duplicate's counts are rolled
    /// back here. Returns the ID and whether the node was deduplicated.
    pub fn insert(
        &mut self,
        v: Variable,
        enable_cse: bool,
        trash: &mut Vec<usize>,
    ) -> (VarId, bool) {
        // Literals participate in value numbering too; only evaluated data
        // (whose identity is its buffer) stays out.
        let cse = enable_cse && v.vt != VarType::Void && !v.is_data();

        if cse {
            let key = VariableKey::new(&v);
            if let Some(&existing) = self.cse.get(&key) {
                for d in v.dep {
                    self.dec_ref_int(d, trash);
                }
                jitlog!(
                    LogLevel::Debug,
                    "var_new({} r{existing}): collapsed by value numbering",
                    v.kind.name()
                );
                return (existing, true);
            }
        }

        let id = self.fresh_id();
        if cse {
            self.cse.insert(VariableKey::new(&v), id);
        }
        if crate::log::enabled(LogLevel::Debug) {
            let deps: Vec<String> = v
                .dep
                .iter()
                .filter(|d| **d != 0)
                .map(|d| format!("r{d}"))
                .collect();
            jitlog!(
                LogLevel::Debug,
                "var_new({} {} r{id}[{}]{}{})",
                v.kind.name(),
                v.vt.name(),
                v.size,
                if deps.is_empty() { "" } else { " <- " },
                deps.join(", ")
            );
        }
        self.vars.insert(id, v);
        self.watermark = self.watermark.max(self.vars.len() as u32);
        (id, false)
    }

    fn fresh_id(&mut self) -> VarId {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if id != 0 && !self.vars.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn inc_ref_ext(&mut self, id: VarId) {
        if id == 0 {
            return;
        }
        let v = self.var_mut(id);
        v.ref_ext += 1;
    }

    pub fn inc_ref_int(&mut self, id: VarId) {
        if id == 0 {
            return;
        }
        let v = self.var_mut(id);
        v.ref_int += 1;
    }

    pub fn dec_ref_ext(&mut self, id: VarId, trash: &mut Vec<usize>) {
        self.dec_ref(id, true, trash);
    }

    pub fn dec_ref_int(&mut self, id: VarId, trash: &mut Vec<usize>) {
        self.dec_ref(id, false, trash);
    }

    /// Decrement one counter and run the destruction cascade iteratively so
    /// that releasing a long dependency chain cannot overflow the stack.
    fn dec_ref(&mut self, id: VarId, external: bool, trash: &mut Vec<usize>) {
        let mut work: Vec<(VarId, bool)> = vec![(id, external)];

        while let Some((id, external)) = work.pop() {
            if id == 0 {
                continue;
            }
            let v = self.var_mut(id);
            if external {
                if v.ref_ext == 0 {
                    fatal(&format!("dec_ref_ext(r{id}): variable has no external references"));
                }
                v.ref_ext -= 1;
            } else {
                if v.ref_int == 0 {
                    fatal(&format!("dec_ref_int(r{id}): variable has no internal references"));
                }
                v.ref_int -= 1;
            }

            if v.total_refs() == 0 {
                let v = self.vars.remove(&id).expect("live variable");
                jitlog!(LogLevel::Trace, "var_free(r{id})");
                if v.is_data() {
                    if !v.retain_data && v.data != 0 {
                        trash.push(v.data);
                    }
                } else {
                    self.cse_drop(id, &v);
                }
                self.labels.remove(&id);
                for d in v.dep {
                    work.push((d, false));
                }
            }
        }
    }

    /// Remove a variable's CSE entry (used on destruction and when a node
    /// turns into evaluated data).
    fn cse_drop(&mut self, id: VarId, v: &Variable) {
        let key = VariableKey::new(v);
        if let Some(&mapped) = self.cse.get(&key) {
            if mapped == id {
                self.cse.remove(&key);
            }
        }
    }

    /// Convert a computed node into evaluated data backed by `buffer`.
    /// Dependency edges are dropped (the values are materialized now) and
    /// the node leaves the CSE index.
    pub fn make_data(&mut self, id: VarId, buffer: usize, trash: &mut Vec<usize>) {
        let v = self.var_mut(id);
        let dep = std::mem::take(&mut v.dep);
        if !v.is_data() {
            // Key must reflect the pre-evaluation dependencies.
            let mut key_var = v.clone();
            key_var.dep = dep;
            self.cse_drop(id, &key_var);
        }
        let v = self.var_mut(id);
        v.kind = VarKind::Data;
        v.data = buffer;
        v.evaluated = true;
        v.literal = 0;
        for d in dep {
            self.dec_ref_int(d, trash);
        }
    }

    pub fn set_label(&mut self, id: VarId, label: Option<String>) {
        match label {
            Some(l) => {
                self.labels.insert(id, l);
            }
            None => {
                self.labels.remove(&id);
            }
        }
    }

    pub fn label(&self, id: VarId) -> Option<&str> {
        self.labels.get(&id).map(|s| s.as_str())
    }

    /// Verify P2: every CSE entry maps back to a live variable whose derived
    /// key equals the index key. Used by tests and the shutdown leak check.
    pub fn check_cse_integrity(&self) -> bool {
        self.cse.iter().all(|(key, &id)| {
            self.vars
                .get(&id)
                .map(|v| VariableKey::new(v) == *key)
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::JitBackend;

    fn literal(value: u64) -> Variable {
        let mut v = Variable::new(JitBackend::Host, VarKind::Literal, VarType::UInt32, 1);
        v.literal = value;
        v
    }

    #[test]
    fn cse_collapses_identical_nodes() {
        let mut store = VariableStore::new();
        let mut trash = Vec::new();

        let (a, hit_a) = store.insert(literal(7), true, &mut trash);
        let (b, hit_b) = store.insert(literal(7), true, &mut trash);
        assert!(!hit_a);
        assert!(hit_b);
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert!(store.check_cse_integrity());
    }

    #[test]
    fn refcount_cascade_releases_chain() {
        let mut store = VariableStore::new();
        let mut trash = Vec::new();

        let (v1, _) = store.insert(literal(1), true, &mut trash);
        store.inc_ref_ext(v1);

        let mut prev = v1;
        let mut chain = vec![v1];
        for _ in 0..3 {
            let mut v = Variable::new(JitBackend::Host, VarKind::Sqrt, VarType::UInt32, 1);
            v.dep[0] = prev;
            store.inc_ref_int(prev);
            let (id, _) = store.insert(v, true, &mut trash);
            store.inc_ref_ext(id);
            // Interior handles are dropped; only the tip stays referenced.
            store.dec_ref_ext(prev, &mut trash);
            chain.push(id);
            prev = id;
        }

        assert_eq!(store.len(), 4);
        store.dec_ref_ext(prev, &mut trash);
        assert_eq!(store.len(), 0);
        assert_eq!(store.cse_len(), 0);
    }

    #[test]
    fn data_buffers_are_trashed_on_free() {
        let mut store = VariableStore::new();
        let mut trash = Vec::new();

        let mut v = Variable::new(JitBackend::Host, VarKind::Data, VarType::Float32, 8);
        v.data = 0xdead0;
        v.evaluated = true;
        let (id, _) = store.insert(v, true, &mut trash);
        store.inc_ref_ext(id);
        store.dec_ref_ext(id, &mut trash);
        assert_eq!(trash, vec![0xdead0]);
    }

    #[test]
    fn make_data_drops_cse_entry_and_deps() {
        let mut store = VariableStore::new();
        let mut trash = Vec::new();

        let (a, _) = store.insert(literal(3), true, &mut trash);
        store.inc_ref_ext(a);

        let mut v = Variable::new(JitBackend::Host, VarKind::Sqrt, VarType::UInt32, 4);
        v.dep[0] = a;
        store.inc_ref_int(a);
        let (b, _) = store.insert(v, true, &mut trash);
        store.inc_ref_ext(b);

        let cse_before = store.cse_len();
        store.make_data(b, 0x1000, &mut trash);
        assert_eq!(store.cse_len(), cse_before - 1);
        assert!(store.var(b).is_data());
        assert_eq!(store.var(b).data, 0x1000);
        assert_eq!(store.var(a).ref_int, 0);
        assert!(store.check_cse_integrity());
    }
}
