//! Shared fixtures: the runtime is a process-wide singleton, so tests
//! within one binary serialize on a lock, run against the portable host
//! executor (no libLLVM lookup) and point the kernel cache at a temp dir.
#![allow(dead_code)]

use std::sync::{Mutex, MutexGuard, OnceLock};

use arrayjit as jit;

pub fn serial() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

/// Temp cache directory for this test binary; created once, removed when
/// the process exits.
pub fn cache_dir() -> &'static tempfile::TempDir {
    static DIR: OnceLock<tempfile::TempDir> = OnceLock::new();
    DIR.get_or_init(|| {
        tempfile::Builder::new()
            .prefix("arrayjit-test")
            .tempdir()
            .expect("failed to create temp cache dir")
    })
}

/// Initialize the host backend deterministically: the portable executor is
/// forced by pointing the LLVM override at a path that cannot resolve.
pub fn init_host() {
    std::env::set_var("ARRAYJIT_LIBLLVM_PATH", "/nonexistent/libLLVM.so");
    std::env::set_var("ARRAYJIT_CACHE_DIR", cache_dir().path());
    jit::init(true, false);
}

pub fn f32_bits(v: f32) -> u64 {
    v.to_bits() as u64
}

pub fn bits_f32(bits: u64) -> f32 {
    f32::from_bits(bits as u32)
}

/// Little-endian byte image of an f32 slice.
pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn u32_bytes(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Read a whole f32 array back.
pub fn read_f32(id: jit::VarId, len: u32) -> Vec<f32> {
    (0..len)
        .map(|i| bits_f32(jit::var_read(id, i).expect("var_read")))
        .collect()
}
