//! End-to-end evaluation on the host backend: broadcasting, counters,
//! gathers, multi-group schedules and re-reads after evaluation.

mod common;

use arrayjit as jit;
use jit::{JitBackend, VarKind, VarType};

use common::{f32_bits, init_host, read_f32, serial};

#[test]
fn broadcast_add_evaluates_to_expected_lanes() {
    let _guard = serial();
    init_host();

    let a = jit::var_new_literal(JitBackend::Host, VarType::Float32, 1, f32_bits(3.0)).unwrap();
    let b = jit::var_new_data(
        JitBackend::Host,
        VarType::Float32,
        8,
        &common::f32_bytes(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]),
    )
    .unwrap();
    let c = jit::var_new_op(VarKind::Add, VarType::Float32, 0, &[a, b]).unwrap();
    assert_eq!(jit::var_size(c), 8);

    jit::var_eval(c).unwrap();
    assert!(jit::var_is_evaluated(c));
    assert_eq!(
        read_f32(c, 8),
        vec![3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0]
    );

    for v in [a, b, c] {
        jit::var_dec_ref_ext(v).unwrap();
    }
    assert_eq!(jit::var_count(), 0);
}

#[test]
fn counter_cast_chain_evaluates() {
    let _guard = serial();
    init_host();

    let idx = jit::var_new_counter(JitBackend::Host, 16).unwrap();
    let f = jit::var_new_op(VarKind::Cast, VarType::Float32, 0, &[idx]).unwrap();
    let two = jit::var_new_literal(JitBackend::Host, VarType::Float32, 1, f32_bits(2.0)).unwrap();
    let scaled = jit::var_new_op(VarKind::Fma, VarType::Float32, 0, &[f, two, two]).unwrap();

    let values = read_f32(scaled, 16);
    let expect: Vec<f32> = (0..16).map(|i| i as f32 * 2.0 + 2.0).collect();
    assert_eq!(values, expect);

    for v in [idx, f, two, scaled] {
        jit::var_dec_ref_ext(v).unwrap();
    }
    assert_eq!(jit::var_count(), 0);
}

#[test]
fn select_and_comparison_pipeline() {
    let _guard = serial();
    init_host();

    let idx = jit::var_new_counter(JitBackend::Host, 8).unwrap();
    let four = jit::var_new_literal(JitBackend::Host, VarType::UInt32, 1, 4).unwrap();
    let mask = jit::var_new_op(VarKind::Lt, VarType::Bool, 0, &[idx, four]).unwrap();
    let ones = jit::var_new_literal(JitBackend::Host, VarType::UInt32, 1, 100).unwrap();
    let sel = jit::var_new_op(VarKind::Select, VarType::UInt32, 0, &[mask, ones, idx]).unwrap();

    let values: Vec<u64> = (0..8).map(|i| jit::var_read(sel, i).unwrap()).collect();
    assert_eq!(values, vec![100, 100, 100, 100, 4, 5, 6, 7]);

    for v in [idx, four, mask, ones, sel] {
        jit::var_dec_ref_ext(v).unwrap();
    }
    assert_eq!(jit::var_count(), 0);
}

#[test]
fn gather_reads_through_an_index_array() {
    let _guard = serial();
    init_host();

    let table = jit::var_new_data(
        JitBackend::Host,
        VarType::Float32,
        4,
        &common::f32_bytes(&[10.0, 20.0, 30.0, 40.0]),
    )
    .unwrap();
    let indices = jit::var_new_data(
        JitBackend::Host,
        VarType::UInt32,
        6,
        &common::u32_bytes(&[3, 0, 1, 1, 2, 3]),
    )
    .unwrap();

    let picked = jit::var_gather(table, indices).unwrap();
    assert_eq!(jit::var_size(picked), 6);
    assert_eq!(
        read_f32(picked, 6),
        vec![40.0, 10.0, 20.0, 20.0, 30.0, 40.0]
    );

    for v in [picked, indices, table] {
        jit::var_dec_ref_ext(v).unwrap();
    }
    assert_eq!(jit::var_count(), 0);
}

#[test]
fn mixed_sizes_split_into_multiple_groups() {
    let _guard = serial();
    init_host();

    let small = jit::var_new_counter(JitBackend::Host, 4).unwrap();
    let small_sq = jit::var_new_op(VarKind::Mul, VarType::UInt32, 0, &[small, small]).unwrap();
    let large = jit::var_new_counter(JitBackend::Host, 32).unwrap();
    let large_neg = jit::var_new_op(VarKind::Not, VarType::UInt32, 0, &[large]).unwrap();

    let launches_before = jit::stats().kernel_launches;
    jit::var_schedule(small_sq).unwrap();
    jit::var_schedule(large_neg).unwrap();
    jit::eval().unwrap();
    assert_eq!(jit::stats().kernel_launches, launches_before + 2);

    assert_eq!(jit::var_read(small_sq, 3).unwrap(), 9);
    assert_eq!(jit::var_read(large_neg, 5).unwrap(), !5u32 as u64);

    for v in [small, small_sq, large, large_neg] {
        jit::var_dec_ref_ext(v).unwrap();
    }
    assert_eq!(jit::var_count(), 0);
}

#[test]
fn evaluated_results_are_stable_across_rereads() {
    let _guard = serial();
    init_host();

    let idx = jit::var_new_counter(JitBackend::Host, 8).unwrap();
    let f = jit::var_new_op(VarKind::Cast, VarType::Float32, 0, &[idx]).unwrap();
    let sq = jit::var_new_op(VarKind::Mul, VarType::Float32, 0, &[f, f]).unwrap();

    let first = read_f32(sq, 8);
    let second = read_f32(sq, 8);
    assert_eq!(first, second);
    assert_eq!(first[7], 49.0);

    // A shared subexpression keeps working after its consumer evaluated.
    let cube = jit::var_new_op(VarKind::Mul, VarType::Float32, 0, &[sq, f]).unwrap();
    assert_eq!(read_f32(cube, 8)[2], 8.0);

    for v in [idx, f, sq, cube] {
        jit::var_dec_ref_ext(v).unwrap();
    }
    assert_eq!(jit::var_count(), 0);
}

#[test]
fn placeholder_binds_an_external_buffer() {
    let _guard = serial();
    init_host();

    let external: Vec<f32> = vec![5.0, 6.0, 7.0, 8.0];
    let p = jit::var_new_placeholder(JitBackend::Host, VarType::Float32, 4).unwrap();
    let one = jit::var_new_literal(JitBackend::Host, VarType::Float32, 1, f32_bits(1.0)).unwrap();
    let plus = jit::var_new_op(VarKind::Add, VarType::Float32, 0, &[p, one]).unwrap();

    // Unbound placeholders surface as an argument error at launch.
    assert!(jit::var_eval(plus).is_err());

    jit::var_bind_placeholder(p, external.as_ptr() as usize).unwrap();
    assert_eq!(read_f32(plus, 4), vec![6.0, 7.0, 8.0, 9.0]);

    for v in [plus, one, p] {
        jit::var_dec_ref_ext(v).unwrap();
    }
    assert_eq!(jit::var_count(), 0);
}
