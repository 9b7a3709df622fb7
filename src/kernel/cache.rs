//! In-memory kernel cache (L1) with a per-fingerprint build gate.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::{Fingerprint, Kernel};

/// Gate serializing compilation of one fingerprint: the first thread to miss
/// builds, every other thread blocks on the gate (with the global runtime
/// lock released) until the build finished.
pub struct BuildGate {
    done: Mutex<bool>,
    cv: Condvar,
}

impl BuildGate {
    fn new() -> Arc<Self> {
        Arc::new(BuildGate {
            done: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }

    pub fn complete(&self) {
        *self.done.lock() = true;
        self.cv.notify_all();
    }
}

#[derive(Default)]
pub struct KernelCache {
    kernels: HashMap<Fingerprint, Arc<Kernel>>,
    building: HashMap<Fingerprint, Arc<BuildGate>>,
}

/// Outcome of an L1 lookup.
pub enum Lookup {
    Hit(Arc<Kernel>),
    /// Caller owns the build; it must call [`KernelCache::finish_build`]
    /// (or [`KernelCache::abort_build`]) exactly once.
    Build(Arc<BuildGate>),
    /// Another thread is compiling this fingerprint; wait on the gate with
    /// the global lock released, then retry.
    Busy(Arc<BuildGate>),
}

impl KernelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    pub fn get(&self, fingerprint: Fingerprint) -> Option<Arc<Kernel>> {
        self.kernels.get(&fingerprint).cloned()
    }

    pub fn lookup(&mut self, fingerprint: Fingerprint) -> Lookup {
        if let Some(kernel) = self.kernels.get(&fingerprint) {
            return Lookup::Hit(Arc::clone(kernel));
        }
        match self.building.get(&fingerprint) {
            Some(gate) => Lookup::Busy(Arc::clone(gate)),
            None => {
                let gate = BuildGate::new();
                self.building.insert(fingerprint, Arc::clone(&gate));
                Lookup::Build(gate)
            }
        }
    }

    pub fn finish_build(&mut self, kernel: Arc<Kernel>) {
        let fingerprint = kernel.fingerprint;
        self.kernels.insert(fingerprint, kernel);
        if let Some(gate) = self.building.remove(&fingerprint) {
            gate.complete();
        }
    }

    /// Release the gate without publishing a kernel (fatal unwinding path).
    pub fn abort_build(&mut self, fingerprint: Fingerprint) {
        if let Some(gate) = self.building.remove(&fingerprint) {
            gate.complete();
        }
    }

    /// Drop every cached kernel (shutdown). Device modules are unloaded by
    /// the caller before the records disappear.
    pub fn clear(&mut self) -> Vec<Arc<Kernel>> {
        for (_, gate) in self.building.drain() {
            gate.complete();
        }
        self.kernels.drain().map(|(_, k)| k).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Kernel>> {
        self.kernels.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{KernelImage, Program};

    fn kernel(fp: Fingerprint) -> Arc<Kernel> {
        Arc::new(Kernel {
            fingerprint: fp,
            image: KernelImage::Portable(Arc::new(Program::default())),
            size: 0,
        })
    }

    #[test]
    fn build_then_hit() {
        let mut cache = KernelCache::new();
        let fp = Fingerprint::of(b"k1");

        match cache.lookup(fp) {
            Lookup::Build(_) => {}
            _ => panic!("expected build ticket on first miss"),
        }
        // A second requester while the build is pending must wait.
        assert!(matches!(cache.lookup(fp), Lookup::Busy(_)));

        cache.finish_build(kernel(fp));
        assert!(matches!(cache.lookup(fp), Lookup::Hit(_)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn gate_unblocks_waiters() {
        let mut cache = KernelCache::new();
        let fp = Fingerprint::of(b"k2");
        let gate = match cache.lookup(fp) {
            Lookup::Build(g) => g,
            _ => unreachable!(),
        };

        let waiter = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || gate.wait())
        };
        cache.finish_build(kernel(fp));
        waiter.join().unwrap();
    }

    #[test]
    fn abort_releases_gate_without_kernel() {
        let mut cache = KernelCache::new();
        let fp = Fingerprint::of(b"k3");
        let Lookup::Build(_) = cache.lookup(fp) else {
            unreachable!()
        };
        cache.abort_build(fp);
        assert!(matches!(cache.lookup(fp), Lookup::Build(_)));
    }
}
