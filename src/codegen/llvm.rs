//! LLVM IR text emission for host kernels.
//!
//! The kernel receives `(i64 start, i64 end, ptr params)` and processes the
//! iteration space in vectors of `width` lanes. Allocations are padded to
//! their size class, so the trailing partial vector stays inside the backing
//! block and no epilogue loop is required. Scatter lanes are written in
//! ascending order so program order decides duplicate-index writes.

use std::collections::BTreeSet;
use std::fmt::Write;

use crate::kernel::program::{Operand, ProgOp, Program};
use crate::kernel::Fingerprint;
use crate::var::{VarKind, VarType};

use super::kernel_name;
use super::types::{llvm_name, llvm_splat_const};

pub struct Emitter<'a> {
    program: &'a Program,
    width: u32,
    out: String,
    decls: BTreeSet<String>,
    tmp: u32,
}

/// Render a scheduled group as an LLVM module.
pub fn emit(
    program: &Program,
    fingerprint: Fingerprint,
    width: u32,
    target_cpu: &str,
    target_features: &str,
) -> String {
    Emitter {
        program,
        width,
        out: String::with_capacity(4096),
        decls: BTreeSet::new(),
        tmp: 0,
    }
    .run(fingerprint, target_cpu, target_features)
}

impl<'a> Emitter<'a> {
    fn run(mut self, fingerprint: Fingerprint, cpu: &str, features: &str) -> String {
        let name = kernel_name(fingerprint);
        let _ = writeln!(
            self.out,
            "define void @{name}(i64 %start, i64 %end, ptr noalias %params) #0 {{"
        );
        self.out.push_str("entry:\n");
        self.emit_param_setup();
        self.out.push_str("    br label %body\n\nbody:\n");
        self.out.push_str(
            "    %index = phi i64 [ %start, %entry ], [ %index_next, %body ]\n",
        );
        self.emit_param_loads();
        for i in 0..self.program.ops.len() {
            self.emit_op(i as u32);
        }
        self.emit_stores();
        let _ = writeln!(self.out, "    %index_next = add nuw nsw i64 %index, {}", self.width);
        self.out
            .push_str("    %cond = icmp ult i64 %index_next, %end\n");
        self.out.push_str("    br i1 %cond, label %body, label %done\n\ndone:\n    ret void\n}\n");

        let mut module = String::with_capacity(self.out.len() + 512);
        for decl in &self.decls {
            module.push_str(decl);
            module.push('\n');
        }
        if !self.decls.is_empty() {
            module.push('\n');
        }
        module.push_str(&self.out);
        let _ = write!(
            module,
            "\nattributes #0 = {{ norecurse nounwind \"frame-pointer\"=\"none\" \
             \"target-cpu\"=\"{cpu}\" \"target-features\"=\"{features}\" }}\n"
        );
        module
    }

    fn vty(&self, vt: VarType) -> String {
        format!("<{} x {}>", self.width, llvm_name(vt))
    }

    fn temp(&mut self) -> String {
        self.tmp += 1;
        format!("%t{}", self.tmp)
    }

    /// Load the raw parameter pointers and splat scalar inputs once.
    fn emit_param_setup(&mut self) {
        for (slot, p) in self.program.params.iter().enumerate() {
            if slot == 0 {
                let _ = writeln!(self.out, "    %p0 = load ptr, ptr %params, align 8");
            } else {
                let _ = writeln!(
                    self.out,
                    "    %p{slot}_ptr = getelementptr inbounds ptr, ptr %params, i64 {slot}\n    \
                     %p{slot} = load ptr, ptr %p{slot}_ptr, align 8"
                );
            }
            if p.pointer || p.output {
                continue;
            }
            if p.scalar {
                // Uniform input: one scalar load in the preamble, splat to a
                // full vector.
                let ty = llvm_name(p.vt);
                let vty = self.vty(p.vt);
                let _ = writeln!(
                    self.out,
                    "    %p{slot}_0 = load {ty}, ptr %p{slot}, align {}\n    \
                     %p{slot}_ins = insertelement {vty} poison, {ty} %p{slot}_0, i32 0\n    \
                     %p{slot}s = shufflevector {vty} %p{slot}_ins, {vty} poison, <{} x i32> zeroinitializer",
                    p.vt.size().max(1),
                    self.width
                );
            }
        }
    }

    /// Per-iteration vector loads of the non-uniform inputs.
    fn emit_param_loads(&mut self) {
        for (slot, p) in self.program.params.iter().enumerate() {
            if p.pointer || p.output || p.scalar {
                continue;
            }
            let ty = llvm_name(p.vt);
            let vty = self.vty(p.vt);
            let _ = writeln!(
                self.out,
                "    %p{slot}_gep = getelementptr inbounds {ty}, ptr %p{slot}, i64 %index\n    \
                 %p{slot}v = load {vty}, ptr %p{slot}_gep, align {}",
                p.vt.size().max(1)
            );
        }
    }

    /// SSA value of an operand (vector of `width` lanes, or a raw pointer
    /// for pointer params).
    fn value(&self, op: Operand) -> String {
        match op {
            Operand::None => "<none>".to_string(),
            Operand::Node(i) => {
                let node = &self.program.ops[i as usize];
                if node.kind == VarKind::Literal {
                    llvm_splat_const(node.vt, self.width, node.literal)
                } else {
                    format!("%r{i}")
                }
            }
            Operand::Param(slot) => {
                let p = &self.program.params[slot as usize];
                if p.pointer {
                    format!("%p{slot}")
                } else if p.scalar {
                    format!("%p{slot}s")
                } else {
                    format!("%p{slot}v")
                }
            }
        }
    }

    fn operand_vt(&self, op: Operand) -> VarType {
        self.program.operand_vt(op)
    }

    fn intrinsic(&mut self, name: &str, ret: &str, args: &[&str]) -> String {
        let decl = format!("declare {ret} @{name}({})", args.join(", "));
        self.decls.insert(decl);
        format!("@{name}")
    }

    fn vec_suffix(&self, vt: VarType) -> String {
        let elem = match vt {
            VarType::Bool => "i1",
            VarType::Float16 => "f16",
            VarType::Float32 => "f32",
            VarType::Float64 => "f64",
            _ => match vt.size() {
                1 => "i8",
                2 => "i16",
                4 => "i32",
                _ => "i64",
            },
        };
        format!("v{}{}", self.width, elem)
    }

    fn emit_op(&mut self, index: u32) {
        use VarKind::*;
        let op = self.program.ops[index as usize];
        let r = format!("%r{index}");
        let vt = op.vt;
        let vty = self.vty(vt);
        let a = self.value(op.arg[0]);
        let b = self.value(op.arg[1]);
        let c = self.value(op.arg[2]);

        match op.kind {
            Invalid | Data => {
                // Data never appears as an op; leaves become params.
            }
            Literal => {
                // Inlined at each use.
            }
            Counter => {
                let step: Vec<String> = (0..self.width)
                    .map(|i| format!("i32 {i}"))
                    .collect();
                let t = self.temp();
                let t2 = self.temp();
                let _ = writeln!(
                    self.out,
                    "    {t} = trunc i64 %index to i32\n    \
                     {t2} = insertelement <{w} x i32> poison, i32 {t}, i32 0\n    \
                     {r}_base = shufflevector <{w} x i32> {t2}, <{w} x i32> poison, <{w} x i32> zeroinitializer\n    \
                     {r} = add <{w} x i32> {r}_base, <{step}>",
                    w = self.width,
                    step = step.join(", ")
                );
            }
            Neg => {
                if vt.is_float() {
                    let _ = writeln!(self.out, "    {r} = fneg {vty} {a}");
                } else {
                    let _ = writeln!(
                        self.out,
                        "    {r} = sub {vty} zeroinitializer, {a}"
                    );
                }
            }
            Not => {
                let ones = llvm_splat_const(
                    vt,
                    self.width,
                    if vt == VarType::Bool { 1 } else { u64::MAX },
                );
                let _ = writeln!(self.out, "    {r} = xor {vty} {a}, {ones}");
            }
            Sqrt | Abs | Ceil | Floor | Round | Trunc | Sin | Cos | Exp2 | Log2
                if vt.is_float() || op.kind == Abs =>
            {
                let base = match op.kind {
                    Sqrt => "llvm.sqrt",
                    Abs => {
                        if vt.is_float() {
                            "llvm.fabs"
                        } else {
                            "llvm.abs"
                        }
                    }
                    Ceil => "llvm.ceil",
                    Floor => "llvm.floor",
                    Round => "llvm.roundeven",
                    Trunc => "llvm.trunc",
                    Sin => "llvm.sin",
                    Cos => "llvm.cos",
                    Exp2 => "llvm.exp2",
                    _ => "llvm.log2",
                };
                let name = format!("{base}.{}", self.vec_suffix(vt));
                if op.kind == Abs && !vt.is_float() {
                    let f = self.intrinsic(&name, &vty, &[&vty, "i1"]);
                    let _ = writeln!(
                        self.out,
                        "    {r} = call {vty} {f}({vty} {a}, i1 false)"
                    );
                } else {
                    let f = self.intrinsic(&name, &vty, &[&vty]);
                    let _ = writeln!(self.out, "    {r} = call {vty} {f}({vty} {a})");
                }
            }
            Rcp => {
                let ones = llvm_splat_const(vt, self.width, match vt {
                    VarType::Float32 => f32::to_bits(1.0) as u64,
                    VarType::Float64 => f64::to_bits(1.0),
                    _ => 0x3c00,
                });
                let _ = writeln!(self.out, "    {r} = fdiv {vty} {ones}, {a}");
            }
            Rsqrt => {
                let name = format!("llvm.sqrt.{}", self.vec_suffix(vt));
                let f = self.intrinsic(&name, &vty, &[&vty]);
                let ones = llvm_splat_const(vt, self.width, match vt {
                    VarType::Float32 => f32::to_bits(1.0) as u64,
                    VarType::Float64 => f64::to_bits(1.0),
                    _ => 0x3c00,
                });
                let _ = writeln!(
                    self.out,
                    "    {r}_sq = call {vty} {f}({vty} {a})\n    {r} = fdiv {vty} {ones}, {r}_sq"
                );
            }
            Popc | Clz | Ctz => {
                let base = match op.kind {
                    Popc => "llvm.ctpop",
                    Clz => "llvm.ctlz",
                    _ => "llvm.cttz",
                };
                let name = format!("{base}.{}", self.vec_suffix(vt));
                if op.kind == Popc {
                    let f = self.intrinsic(&name, &vty, &[&vty]);
                    let _ = writeln!(self.out, "    {r} = call {vty} {f}({vty} {a})");
                } else {
                    let f = self.intrinsic(&name, &vty, &[&vty, "i1"]);
                    let _ = writeln!(
                        self.out,
                        "    {r} = call {vty} {f}({vty} {a}, i1 false)"
                    );
                }
            }
            Add | Sub | Mul | Div | Mod | And | Or | Xor | Shl | Shr => {
                let inst = match (op.kind, vt.is_float(), vt.is_signed()) {
                    (Add, true, _) => "fadd",
                    (Add, false, _) => "add",
                    (Sub, true, _) => "fsub",
                    (Sub, false, _) => "sub",
                    (Mul, true, _) => "fmul",
                    (Mul, false, _) => "mul",
                    (Div, true, _) => "fdiv",
                    (Div, false, true) => "sdiv",
                    (Div, false, false) => "udiv",
                    (Mod, true, _) => "frem",
                    (Mod, false, true) => "srem",
                    (Mod, false, false) => "urem",
                    (And, ..) => "and",
                    (Or, ..) => "or",
                    (Xor, ..) => "xor",
                    (Shl, ..) => "shl",
                    (Shr, _, true) => "ashr",
                    (Shr, _, false) => "lshr",
                    _ => unreachable!(),
                };
                let _ = writeln!(self.out, "    {r} = {inst} {vty} {a}, {b}");
            }
            Min | Max => {
                let base = match (op.kind, vt.is_float(), vt.is_signed()) {
                    (Min, true, _) => "llvm.minnum",
                    (Max, true, _) => "llvm.maxnum",
                    (Min, false, true) => "llvm.smin",
                    (Min, false, false) => "llvm.umin",
                    (Max, false, true) => "llvm.smax",
                    (Max, false, false) => "llvm.umax",
                    _ => unreachable!(),
                };
                let name = format!("{base}.{}", self.vec_suffix(vt));
                let f = self.intrinsic(&name, &vty, &[&vty, &vty]);
                let _ = writeln!(
                    self.out,
                    "    {r} = call {vty} {f}({vty} {a}, {vty} {b})"
                );
            }
            Mulhi => {
                let wide = match vt.size() {
                    1 => "i16",
                    2 => "i32",
                    4 => "i64",
                    _ => "i128",
                };
                let wvty = format!("<{} x {}>", self.width, wide);
                let ext = if vt.is_signed() { "sext" } else { "zext" };
                let _ = writeln!(
                    self.out,
                    "    {r}_a = {ext} {vty} {a} to {wvty}\n    \
                     {r}_b = {ext} {vty} {b} to {wvty}\n    \
                     {r}_m = mul {wvty} {r}_a, {r}_b\n    \
                     {r}_s = lshr {wvty} {r}_m, {shift}\n    \
                     {r} = trunc {wvty} {r}_s to {vty}",
                    shift = splat_int(wide, self.width, (vt.size() * 8) as u64),
                );
            }
            Eq | Neq | Lt | Le | Gt | Ge => {
                let src = self.operand_vt(op.arg[0]);
                let sv = self.vty(src);
                let (inst, pred) = if src.is_float() {
                    (
                        "fcmp",
                        match op.kind {
                            Eq => "oeq",
                            Neq => "une",
                            Lt => "olt",
                            Le => "ole",
                            Gt => "ogt",
                            _ => "oge",
                        },
                    )
                } else {
                    (
                        "icmp",
                        match (op.kind, src.is_signed()) {
                            (Eq, _) => "eq",
                            (Neq, _) => "ne",
                            (Lt, true) => "slt",
                            (Lt, false) => "ult",
                            (Le, true) => "sle",
                            (Le, false) => "ule",
                            (Gt, true) => "sgt",
                            (Gt, false) => "ugt",
                            (_, true) => "sge",
                            (_, false) => "uge",
                        },
                    )
                };
                let _ = writeln!(self.out, "    {r} = {inst} {pred} {sv} {a}, {b}");
            }
            Fma => {
                if vt.is_float() {
                    let name = format!("llvm.fma.{}", self.vec_suffix(vt));
                    let f = self.intrinsic(&name, &vty, &[&vty, &vty, &vty]);
                    let _ = writeln!(
                        self.out,
                        "    {r} = call {vty} {f}({vty} {a}, {vty} {b}, {vty} {c})"
                    );
                } else {
                    let _ = writeln!(
                        self.out,
                        "    {r}_m = mul {vty} {a}, {b}\n    {r} = add {vty} {r}_m, {c}"
                    );
                }
            }
            Select => {
                let tv = self.vty(vt);
                let cond_ty = format!("<{} x i1>", self.width);
                let _ = writeln!(
                    self.out,
                    "    {r} = select {cond_ty} {a}, {tv} {b}, {tv} {c}"
                );
            }
            Cast => {
                let src = self.operand_vt(op.arg[0]);
                let sv = self.vty(src);
                let inst = cast_inst(src, vt);
                let _ = writeln!(self.out, "    {r} = {inst} {sv} {a} to {vty}");
            }
            Bitcast => {
                let src = self.operand_vt(op.arg[0]);
                let sv = self.vty(src);
                let _ = writeln!(self.out, "    {r} = bitcast {sv} {a} to {vty}");
            }
            Gather => {
                self.emit_gather(index, &op, &r);
            }
            Scatter => {
                self.emit_scatter(&op);
            }
            Dispatch => {
                self.emit_dispatch(index, &op, &r);
            }
            other => {
                crate::errors::fatal(&format!(
                    "llvm codegen: opcode \"{}\" has no emission rule for type {}",
                    other.name(),
                    vt.name()
                ));
            }
        }
    }

    /// Scalarized gather: the index vector is decomposed lane by lane.
    fn emit_gather(&mut self, index: u32, op: &ProgOp, r: &str) {
        let vt = op.vt;
        let ty = llvm_name(vt);
        let vty = self.vty(vt);
        let ptr = self.value(op.arg[0]);
        let idx = self.value(op.arg[1]);
        let ivt = self.operand_vt(op.arg[1]);
        let ivty = self.vty(ivt);
        let iname = llvm_name(ivt);

        let mut prev = format!("{vty} poison");
        for lane in 0..self.width {
            let li = format!("%g{index}_{lane}_i");
            let le = format!("%g{index}_{lane}_e");
            let lp = format!("%g{index}_{lane}_p");
            let lv = format!("%g{index}_{lane}_v");
            let out = if lane + 1 == self.width {
                r.to_string()
            } else {
                format!("%g{index}_{lane}")
            };
            let _ = writeln!(
                self.out,
                "    {li} = extractelement {ivty} {idx}, i32 {lane}\n    \
                 {le} = {ext} {iname} {li} to i64\n    \
                 {lp} = getelementptr inbounds {ty}, ptr {ptr}, i64 {le}\n    \
                 {lv} = load {ty}, ptr {lp}, align {align}\n    \
                 {out} = insertelement {prev}, {ty} {lv}, i32 {lane}",
                ext = if ivt.is_signed() { "sext" } else { "zext" },
                align = vt.size().max(1),
            );
            prev = format!("{vty} {out}");
        }
    }

    /// Scatter serialized to ascending scalar lanes (program order wins on
    /// duplicate indices).
    fn emit_scatter(&mut self, op: &ProgOp) {
        let ptr = self.value(op.arg[0]);
        let value = self.value(op.arg[1]);
        let idx = self.value(op.arg[2]);
        let vvt = self.operand_vt(op.arg[1]);
        let ivt = self.operand_vt(op.arg[2]);
        let ty = llvm_name(vvt);
        let vty = self.vty(vvt);
        let ivty = self.vty(ivt);
        let iname = llvm_name(ivt);

        self.tmp += 1;
        let s = self.tmp;
        for lane in 0..self.width {
            let _ = writeln!(
                self.out,
                "    %s{s}_{lane}_i = extractelement {ivty} {idx}, i32 {lane}\n    \
                 %s{s}_{lane}_e = {ext} {iname} %s{s}_{lane}_i to i64\n    \
                 %s{s}_{lane}_v = extractelement {vty} {value}, i32 {lane}\n    \
                 %s{s}_{lane}_p = getelementptr inbounds {ty}, ptr {ptr}, i64 %s{s}_{lane}_e\n    \
                 store {ty} %s{s}_{lane}_v, ptr %s{s}_{lane}_p, align {align}",
                ext = if ivt.is_signed() { "sext" } else { "zext" },
                align = vvt.size().max(1),
            );
        }
    }

    /// Indirect call through the callables table (relocation slot 1).
    fn emit_dispatch(&mut self, index: u32, op: &ProgOp, r: &str) {
        let vt = op.vt;
        let ty = llvm_name(vt);
        let vty = self.vty(vt);
        let idx = self.value(op.arg[0]);
        let ivt = self.operand_vt(op.arg[0]);
        let ivty = self.vty(ivt);
        let iname = llvm_name(ivt);
        self.decls
            .insert("@callables = internal constant ptr null".to_string());

        let mut prev = format!("{vty} poison");
        for lane in 0..self.width {
            let out = if lane + 1 == self.width {
                r.to_string()
            } else {
                format!("%d{index}_{lane}")
            };
            let _ = writeln!(
                self.out,
                "    %d{index}_{lane}_i = extractelement {ivty} {idx}, i32 {lane}\n    \
                 %d{index}_{lane}_e = {ext} {iname} %d{index}_{lane}_i to i64\n    \
                 %d{index}_{lane}_t = load ptr, ptr @callables, align 8\n    \
                 %d{index}_{lane}_s = getelementptr inbounds ptr, ptr %d{index}_{lane}_t, i64 %d{index}_{lane}_e\n    \
                 %d{index}_{lane}_f = load ptr, ptr %d{index}_{lane}_s, align 8\n    \
                 %d{index}_{lane}_v = call {ty} %d{index}_{lane}_f(i64 %index, ptr %params)\n    \
                 {out} = insertelement {prev}, {ty} %d{index}_{lane}_v, i32 {lane}",
                ext = if ivt.is_signed() { "sext" } else { "zext" },
            );
            prev = format!("{vty} {out}");
        }
    }

    fn emit_stores(&mut self) {
        for &(slot, node) in &self.program.stores {
            let p = self.program.params[slot as usize];
            let value = self.value(Operand::Node(node));
            let ty = llvm_name(p.vt);
            let vty = self.vty(p.vt);
            let _ = writeln!(
                self.out,
                "    %o{slot}_gep = getelementptr inbounds {ty}, ptr %p{slot}, i64 %index\n    \
                 store {vty} {value}, ptr %o{slot}_gep, align {}",
                p.vt.size().max(1)
            );
        }
    }
}

fn splat_int(elem: &str, width: u32, value: u64) -> String {
    let mut out = String::from("<");
    for i in 0..width {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{elem} {value}");
    }
    out.push('>');
    out
}

fn cast_inst(src: VarType, dst: VarType) -> &'static str {
    if src.is_float() && dst.is_float() {
        if dst.size() < src.size() {
            "fptrunc"
        } else {
            "fpext"
        }
    } else if src.is_float() {
        if dst.is_signed() {
            "fptosi"
        } else {
            "fptoui"
        }
    } else if dst.is_float() {
        if src.is_signed() {
            "sitofp"
        } else {
            "uitofp"
        }
    } else if dst.size() < src.size() {
        "trunc"
    } else if dst.size() == src.size() {
        "bitcast"
    } else if src.is_signed() {
        "sext"
    } else {
        "zext"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::JitBackend;
    use crate::kernel::program::ParamInfo;

    fn add_program() -> Program {
        Program {
            params: vec![
                ParamInfo {
                    vt: VarType::Float32,
                    scalar: false,
                    pointer: false,
                    output: false,
                },
                ParamInfo {
                    vt: VarType::Float32,
                    scalar: true,
                    pointer: false,
                    output: false,
                },
                ParamInfo {
                    vt: VarType::Float32,
                    scalar: false,
                    pointer: false,
                    output: true,
                },
            ],
            ops: vec![ProgOp {
                kind: VarKind::Add,
                vt: VarType::Float32,
                scalar: false,
                arg: [
                    Operand::Param(0),
                    Operand::Param(1),
                    Operand::None,
                    Operand::None,
                ],
                literal: 0,
            }],
            stores: vec![(2, 0)],
        }
    }

    #[test]
    fn emits_entry_signature_and_loop() {
        let p = add_program();
        let fp = Fingerprint::of(&p.serialize(JitBackend::Host));
        let ir = emit(&p, fp, 8, "skylake", "+avx2,+fma");

        assert!(ir.contains(&format!(
            "define void @{}(i64 %start, i64 %end, ptr noalias %params)",
            kernel_name(fp)
        )));
        assert!(ir.contains("%r0 = fadd <8 x float> %p0v, %p1s"));
        assert!(ir.contains("store <8 x float> %r0, ptr %o2_gep"));
        assert!(ir.contains("\"target-cpu\"=\"skylake\""));
        assert!(ir.contains("icmp ult i64 %index_next, %end"));
    }

    #[test]
    fn emission_is_deterministic() {
        let p = add_program();
        let fp = Fingerprint::of(&p.serialize(JitBackend::Host));
        let a = emit(&p, fp, 8, "skylake", "+avx2");
        let b = emit(&p, fp, 8, "skylake", "+avx2");
        assert_eq!(a, b);
    }

    #[test]
    fn literal_operands_are_inlined_splats() {
        let mut p = add_program();
        p.ops.insert(
            0,
            ProgOp {
                kind: VarKind::Literal,
                vt: VarType::Float32,
                scalar: true,
                arg: [Operand::None; 4],
                literal: 3.0f32.to_bits() as u64,
            },
        );
        p.ops[1].arg[1] = Operand::Node(0);
        p.stores = vec![(2, 1)];
        let fp = Fingerprint::of(&p.serialize(JitBackend::Host));
        let ir = emit(&p, fp, 4, "apple-m1", "");
        assert!(ir.contains("fadd <4 x float> %p0v, <float 0x4008000000000000"));
    }
}
