//! Kernel cache behavior across the two tiers and across runtime restarts.
//!
//! Each test traces a structurally distinct expression: the cache key is
//! the group fingerprint, which ignores array sizes and variable IDs, so
//! two tests using the same opcode chain would share a kernel.

mod common;

use anyhow::Result;
use arrayjit as jit;
use jit::{JitBackend, VarKind, VarType};

use common::{init_host, read_f32, serial};

fn trace_binary(kind: VarKind, n: u32) -> Result<(jit::VarId, Vec<jit::VarId>)> {
    let a = jit::var_new_data(
        JitBackend::Host,
        VarType::Float32,
        n,
        &common::f32_bytes(&(0..n).map(|i| i as f32 + 1.0).collect::<Vec<_>>()),
    )?;
    let b = jit::var_new_data(
        JitBackend::Host,
        VarType::Float32,
        n,
        &common::f32_bytes(&(0..n).map(|i| (i * 2) as f32 + 1.0).collect::<Vec<_>>()),
    )?;
    let c = jit::var_new_op(kind, VarType::Float32, 0, &[a, b])?;
    Ok((c, vec![a, b, c]))
}

#[test]
fn identical_traces_hit_the_memory_cache() -> Result<()> {
    let _guard = serial();
    init_host();

    let before = jit::stats();
    let (c1, vars1) = trace_binary(VarKind::Add, 1000)?;
    jit::var_eval(c1)?;
    let after_first = jit::stats();
    assert_eq!(after_first.kernel_hard_misses, before.kernel_hard_misses + 1);

    // Same structure again: the scheduler's fingerprint matches, so the
    // compiled kernel is reused even though the variable IDs differ.
    let (c2, vars2) = trace_binary(VarKind::Add, 1000)?;
    jit::var_eval(c2)?;
    let after_second = jit::stats();
    assert_eq!(after_second.kernel_hard_misses, after_first.kernel_hard_misses);
    assert_eq!(after_second.kernel_hits, after_first.kernel_hits + 1);

    assert_eq!(jit::var_read(c1, 10)?, jit::var_read(c2, 10)?);

    for v in vars1.into_iter().chain(vars2) {
        jit::var_dec_ref_ext(v)?;
    }
    assert_eq!(jit::var_count(), 0);
    Ok(())
}

#[test]
fn disk_tier_survives_a_light_shutdown() -> Result<()> {
    let _guard = serial();
    init_host();
    // Fresh counters for this scenario.
    jit::shutdown(true);
    init_host();

    let (c, vars) = trace_binary(VarKind::Sub, 10000)?;
    jit::var_eval(c)?;
    let expect = read_f32(c, 16);
    assert_eq!(jit::stats().kernel_hard_misses, 1);
    assert_eq!(jit::stats().kernel_soft_misses, 0);
    for v in vars {
        jit::var_dec_ref_ext(v)?;
    }

    jit::shutdown(true);
    init_host();

    // Fresh runtime: the in-memory tier is gone, the disk tier is not.
    let (c, vars) = trace_binary(VarKind::Sub, 10000)?;
    jit::var_eval(c)?;
    let stats = jit::stats();
    assert_eq!(stats.kernel_soft_misses, 1);
    assert_eq!(stats.kernel_hard_misses, 0);
    assert_eq!(read_f32(c, 16), expect);

    for v in vars {
        jit::var_dec_ref_ext(v)?;
    }
    assert_eq!(jit::var_count(), 0);
    jit::shutdown(true);
    init_host();
    Ok(())
}

#[test]
fn distinct_traces_produce_distinct_kernels() -> Result<()> {
    let _guard = serial();
    init_host();

    let before = jit::stats();
    let (lo, vars_lo) = trace_binary(VarKind::Min, 64)?;
    jit::var_eval(lo)?;
    let (hi, vars_hi) = trace_binary(VarKind::Max, 64)?;
    jit::var_eval(hi)?;

    let stats = jit::stats();
    assert_eq!(stats.kernel_hard_misses, before.kernel_hard_misses + 2);
    assert_eq!(read_f32(lo, 4)[3], 4.0);
    assert_eq!(read_f32(hi, 4)[3], 7.0);

    for v in vars_lo.into_iter().chain(vars_hi) {
        jit::var_dec_ref_ext(v)?;
    }
    assert_eq!(jit::var_count(), 0);
    Ok(())
}
