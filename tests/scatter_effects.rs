//! Scatter side effects: program-order writes, dirty tracking, and the
//! interaction with subsequent gathers.

mod common;

use arrayjit as jit;
use jit::{JitBackend, VarKind, VarType};

use common::{init_host, read_f32, serial};

#[test]
fn scatter_last_write_wins_in_program_order() {
    let _guard = serial();
    init_host();

    let buf = jit::var_new_data(
        JitBackend::Host,
        VarType::Float32,
        4,
        &common::f32_bytes(&[0.0; 4]),
    )
    .unwrap();
    let values = jit::var_new_data(
        JitBackend::Host,
        VarType::Float32,
        3,
        &common::f32_bytes(&[10.0, 20.0, 30.0]),
    )
    .unwrap();
    let indices = jit::var_new_data(
        JitBackend::Host,
        VarType::UInt32,
        3,
        &common::u32_bytes(&[0, 1, 0]),
    )
    .unwrap();

    let op = jit::var_scatter(buf, values, indices).unwrap();
    assert!(jit::var_is_dirty(buf));
    jit::var_dec_ref_ext(op).unwrap();

    // Reading forces the pending side effect, then synchronizes. Index 0 is
    // written twice; the later lane wins.
    assert_eq!(read_f32(buf, 4), vec![30.0, 20.0, 0.0, 0.0]);
    assert!(!jit::var_is_dirty(buf));

    for v in [values, indices, buf] {
        jit::var_dec_ref_ext(v).unwrap();
    }
    assert_eq!(jit::var_count(), 0);
}

#[test]
fn tracing_over_a_dirty_operand_flushes_the_scatter() {
    let _guard = serial();
    init_host();

    let buf = jit::var_new_data(
        JitBackend::Host,
        VarType::Float32,
        4,
        &common::f32_bytes(&[1.0; 4]),
    )
    .unwrap();
    let value = jit::var_new_literal(
        JitBackend::Host,
        VarType::Float32,
        1,
        common::f32_bits(9.0),
    )
    .unwrap();
    let index = jit::var_new_literal(JitBackend::Host, VarType::UInt32, 1, 2).unwrap();

    let op = jit::var_scatter(buf, value, index).unwrap();
    jit::var_dec_ref_ext(op).unwrap();
    assert!(jit::var_is_dirty(buf));

    // Building an op over the dirty buffer must evaluate the write first.
    let doubled = jit::var_new_op(VarKind::Add, VarType::Float32, 0, &[buf, buf]).unwrap();
    assert!(!jit::var_is_dirty(buf));
    assert_eq!(read_f32(doubled, 4), vec![2.0, 2.0, 18.0, 2.0]);

    for v in [doubled, value, index, buf] {
        jit::var_dec_ref_ext(v).unwrap();
    }
    assert_eq!(jit::var_count(), 0);
}

#[test]
fn scatter_then_gather_round_trip() {
    let _guard = serial();
    init_host();

    let buf = jit::var_new_data(
        JitBackend::Host,
        VarType::Float32,
        8,
        &common::f32_bytes(&[0.0; 8]),
    )
    .unwrap();
    let idx = jit::var_new_counter(JitBackend::Host, 8).unwrap();
    let val = jit::var_new_op(VarKind::Cast, VarType::Float32, 0, &[idx]).unwrap();

    let op = jit::var_scatter(buf, val, idx).unwrap();
    jit::var_dec_ref_ext(op).unwrap();

    let rev_indices = jit::var_new_data(
        JitBackend::Host,
        VarType::UInt32,
        8,
        &common::u32_bytes(&[7, 6, 5, 4, 3, 2, 1, 0]),
    )
    .unwrap();
    let gathered = jit::var_gather(buf, rev_indices).unwrap();
    assert_eq!(
        read_f32(gathered, 8),
        vec![7.0, 6.0, 5.0, 4.0, 3.0, 2.0, 1.0, 0.0]
    );

    for v in [gathered, rev_indices, val, idx, buf] {
        jit::var_dec_ref_ext(v).unwrap();
    }
    assert_eq!(jit::var_count(), 0);
}

#[test]
fn side_effect_runs_without_external_reads() {
    let _guard = serial();
    init_host();

    let buf = jit::var_new_data(
        JitBackend::Host,
        VarType::Float32,
        2,
        &common::f32_bytes(&[0.0, 0.0]),
    )
    .unwrap();
    let value = jit::var_new_literal(
        JitBackend::Host,
        VarType::Float32,
        1,
        common::f32_bits(42.0),
    )
    .unwrap();
    let index = jit::var_new_literal(JitBackend::Host, VarType::UInt32, 1, 1).unwrap();

    // Handle dropped immediately; the side-effect queue keeps it alive.
    let op = jit::var_scatter(buf, value, index).unwrap();
    jit::var_dec_ref_ext(op).unwrap();

    jit::eval().unwrap();
    jit::sync_thread();
    assert_eq!(read_f32(buf, 2), vec![0.0, 42.0]);

    for v in [value, index, buf] {
        jit::var_dec_ref_ext(v).unwrap();
    }
    assert_eq!(jit::var_count(), 0);
}
