//! Allocator pooling and the pointer registry through the public surface.

mod common;

use arrayjit as jit;
use jit::AllocType;

use common::{init_host, serial};

#[test]
fn released_blocks_are_reused_from_the_pool() {
    let _guard = serial();
    init_host();

    let p1 = jit::malloc(AllocType::HostAsync, 1000).unwrap();
    jit::free(p1);
    jit::sync_thread();

    // Same size class, nothing in flight: the pool hands the block back.
    let p2 = jit::malloc(AllocType::HostAsync, 900).unwrap();
    assert_eq!(p1, p2);

    // A different size class allocates fresh backing memory.
    let p3 = jit::malloc(AllocType::HostAsync, 5000).unwrap();
    assert_ne!(p2, p3);

    jit::free(p2);
    jit::free(p3);
    jit::sync_thread();
    jit::malloc_trim();
}

#[test]
fn frees_after_launches_wait_for_the_task_chain() {
    let _guard = serial();
    init_host();

    // Keep a launch in flight so the release chain has a fence to wait on.
    let idx = jit::var_new_counter(jit::JitBackend::Host, 1 << 16).unwrap();
    let sq = jit::var_new_op(jit::VarKind::Mul, jit::VarType::UInt32, 0, &[idx, idx]).unwrap();
    jit::var_eval(sq).unwrap();

    let p = jit::malloc(AllocType::HostAsync, 256).unwrap();
    jit::free(p);

    // After a full sync the deferred release must have been reclaimed.
    jit::sync_thread();
    let q = jit::malloc(AllocType::HostAsync, 256).unwrap();
    assert_eq!(p, q);
    jit::free(q);
    jit::sync_thread();

    jit::var_dec_ref_ext(sq).unwrap();
    jit::var_dec_ref_ext(idx).unwrap();
    jit::sync_thread();
    jit::malloc_trim();
    assert_eq!(jit::var_count(), 0);
}

#[test]
fn device_allocation_requires_the_cuda_backend() {
    let _guard = serial();
    init_host();

    // Only the host backend is initialized in the test environment.
    let r = jit::malloc(AllocType::Device, 64);
    assert!(matches!(r, Err(jit::Error::BackendInactive(..))));
}

#[test]
fn registry_round_trips_and_reuses_ids() {
    let _guard = serial();
    init_host();

    let a = jit::registry_put("shapes", 0x1000).unwrap();
    let b = jit::registry_put("shapes", 0x2000).unwrap();
    let other = jit::registry_put("materials", 0x3000).unwrap();
    assert_eq!((a, b, other), (1, 2, 1));

    assert_eq!(jit::registry_get("shapes", 2).unwrap(), 0x2000);
    assert!(jit::registry_get("shapes", 3).is_err());
    assert!(jit::registry_get("unknown", 1).is_err());

    jit::registry_remove("shapes", 1).unwrap();
    assert!(jit::registry_get("shapes", 1).is_err());
    let again = jit::registry_put("shapes", 0x4000).unwrap();
    assert_eq!(again, 1);

    jit::registry_remove("shapes", 1).unwrap();
    jit::registry_remove("shapes", 2).unwrap();
    jit::registry_remove("materials", 1).unwrap();
}
