//! Variable store behavior through the public surface: deduplication,
//! folding, broadcast validation and reference counting.

mod common;

use arrayjit as jit;
use jit::{JitBackend, VarKind, VarType};

use common::{f32_bits, init_host, serial};

#[test]
fn cse_collapses_equivalent_nodes() {
    let _guard = serial();
    init_host();

    let x = jit::var_new_data(
        JitBackend::Host,
        VarType::Float32,
        4,
        &common::f32_bytes(&[1.0, 2.0, 3.0, 4.0]),
    )
    .unwrap();

    let before = jit::var_count();
    let y = jit::var_new_op(VarKind::Mul, VarType::Float32, 0, &[x, x]).unwrap();
    let z = jit::var_new_op(VarKind::Mul, VarType::Float32, 0, &[x, x]).unwrap();

    assert_eq!(y, z);
    assert_eq!(jit::var_ref_ext(y), 2);
    assert_eq!(jit::var_count(), before + 1);

    jit::var_dec_ref_ext(z).unwrap();
    jit::var_dec_ref_ext(y).unwrap();
    jit::var_dec_ref_ext(x).unwrap();
    assert_eq!(jit::var_count(), 0);
}

#[test]
fn literal_fold_matches_host_arithmetic() {
    let _guard = serial();
    init_host();

    let launches_before = jit::stats().kernel_launches;
    let a = jit::var_new_literal(JitBackend::Host, VarType::Float32, 1, f32_bits(3.5)).unwrap();
    let b = jit::var_new_literal(JitBackend::Host, VarType::Float32, 1, f32_bits(-1.25)).unwrap();
    let c = jit::var_new_op(VarKind::Mul, VarType::Float32, 0, &[a, b]).unwrap();

    assert!(jit::var_is_literal(c));
    assert_eq!(common::bits_f32(jit::var_read(c, 0).unwrap()), 3.5 * -1.25);
    // Folding happens during tracing; no kernel ran.
    assert_eq!(jit::stats().kernel_launches, launches_before);

    // Integer folding observes wrapping semantics.
    let x = jit::var_new_literal(JitBackend::Host, VarType::UInt8, 1, 250).unwrap();
    let y = jit::var_new_literal(JitBackend::Host, VarType::UInt8, 1, 10).unwrap();
    let z = jit::var_new_op(VarKind::Add, VarType::UInt8, 0, &[x, y]).unwrap();
    assert_eq!(jit::var_read(z, 0).unwrap(), 4);

    for v in [a, b, c, x, y, z] {
        jit::var_dec_ref_ext(v).unwrap();
    }
    assert_eq!(jit::var_count(), 0);
}

#[test]
fn broadcast_rule_accepts_scalars_and_rejects_mismatches() {
    let _guard = serial();
    init_host();

    let scalar = jit::var_new_literal(JitBackend::Host, VarType::Float32, 1, f32_bits(1.0)).unwrap();
    let eight = jit::var_new_data(
        JitBackend::Host,
        VarType::Float32,
        8,
        &common::f32_bytes(&[0.0; 8]),
    )
    .unwrap();
    let five = jit::var_new_data(
        JitBackend::Host,
        VarType::Float32,
        5,
        &common::f32_bytes(&[0.0; 5]),
    )
    .unwrap();

    let ok = jit::var_new_op(VarKind::Add, VarType::Float32, 0, &[scalar, eight]).unwrap();
    assert_eq!(jit::var_size(ok), 8);

    let err = jit::var_new_op(VarKind::Add, VarType::Float32, 0, &[five, eight]);
    assert!(matches!(err, Err(jit::Error::InvalidArgument(_))));

    for v in [ok, scalar, eight, five] {
        jit::var_dec_ref_ext(v).unwrap();
    }
    assert_eq!(jit::var_count(), 0);
}

#[test]
fn refcount_cascade_releases_whole_chain() {
    let _guard = serial();
    init_host();

    let v1 = jit::var_new_data(
        JitBackend::Host,
        VarType::Float32,
        4,
        &common::f32_bytes(&[1.0, 4.0, 9.0, 16.0]),
    )
    .unwrap();
    let v2 = jit::var_new_op(VarKind::Sqrt, VarType::Float32, 0, &[v1]).unwrap();
    let v3 = jit::var_new_op(VarKind::Neg, VarType::Float32, 0, &[v2]).unwrap();
    let v4 = jit::var_new_op(VarKind::Abs, VarType::Float32, 0, &[v3]).unwrap();

    // Interior handles go away; the graph stays alive through v4.
    jit::var_dec_ref_ext(v1).unwrap();
    jit::var_dec_ref_ext(v2).unwrap();
    jit::var_dec_ref_ext(v3).unwrap();
    assert_eq!(jit::var_count(), 4);
    assert!(jit::var_exists(v1));

    jit::var_dec_ref_ext(v4).unwrap();
    assert_eq!(jit::var_count(), 0);
}

#[test]
fn comparison_ops_require_bool_type() {
    let _guard = serial();
    init_host();

    let a = jit::var_new_literal(JitBackend::Host, VarType::Int32, 1, 1).unwrap();
    let err = jit::var_new_op(VarKind::Lt, VarType::Int32, 0, &[a, a]);
    assert!(matches!(err, Err(jit::Error::InvalidArgument(_))));

    let ok = jit::var_new_op(VarKind::Lt, VarType::Bool, 0, &[a, a]).unwrap();
    assert_eq!(jit::var_read(ok, 0).unwrap(), 0);

    jit::var_dec_ref_ext(ok).unwrap();
    jit::var_dec_ref_ext(a).unwrap();
    assert_eq!(jit::var_count(), 0);
}

#[test]
fn labels_round_trip_and_reject_separators() {
    let _guard = serial();
    init_host();

    let a = jit::var_new_literal(JitBackend::Host, VarType::Float32, 1, 0).unwrap();
    jit::var_set_label(a, Some("positions")).unwrap();
    assert_eq!(jit::var_label(a).as_deref(), Some("positions"));

    assert!(jit::var_set_label(a, Some("bad/label")).is_err());
    assert!(jit::var_set_label(a, Some("bad\nlabel")).is_err());

    jit::var_set_label(a, None).unwrap();
    assert_eq!(jit::var_label(a), None);

    jit::var_dec_ref_ext(a).unwrap();
    assert_eq!(jit::var_count(), 0);
}
