//! PTX text emission for CUDA kernels.
//!
//! One thread per element: the kernel computes its global index, bails out
//! past `size`, loads its lane from every input parameter, runs the ops and
//! stores the outputs. Registers are typed PTX classes allocated in emission
//! order; the final module appends a NUL-terminated entry-name table so the
//! module loader can resolve every `.entry` without re-parsing the source.

use std::fmt::Write;

use crate::kernel::program::{Operand, Program};
use crate::kernel::Fingerprint;
use crate::var::{VarKind, VarType};

use super::kernel_name;
use super::types::{ptx_name, ptx_name_bin, ptx_scalar_const};

/// Register classes: pred, b16 half, f32, f64, b32, b64.
const CLASS_COUNT: usize = 6;

#[derive(Clone, Copy, PartialEq, Eq)]
enum RegClass {
    Pred = 0,
    Half,
    F32,
    F64,
    B32,
    B64,
}

fn class_of(vt: VarType) -> RegClass {
    match vt {
        VarType::Bool => RegClass::Pred,
        VarType::Float16 => RegClass::Half,
        VarType::Float32 => RegClass::F32,
        VarType::Float64 => RegClass::F64,
        _ if vt.size() <= 4 => RegClass::B32,
        _ => RegClass::B64,
    }
}

struct Emitter<'a> {
    program: &'a Program,
    body: String,
    counts: [u32; CLASS_COUNT],
    /// Value string per op: a register name or an inline immediate.
    values: Vec<String>,
    /// Base-address register per parameter slot.
    param_reg: Vec<String>,
}

pub fn emit(program: &Program, fingerprint: Fingerprint, compute_capability: u32) -> String {
    let mut e = Emitter {
        program,
        body: String::with_capacity(4096),
        counts: [0; CLASS_COUNT],
        values: vec![String::new(); program.ops.len()],
        param_reg: Vec::with_capacity(program.params.len()),
    };
    e.run(fingerprint, compute_capability)
}

impl<'a> Emitter<'a> {
    fn alloc(&mut self, class: RegClass) -> String {
        let prefix = match class {
            RegClass::Pred => "%p",
            RegClass::Half => "%h",
            RegClass::F32 => "%f",
            RegClass::F64 => "%d",
            RegClass::B32 => "%r",
            RegClass::B64 => "%rd",
        };
        let idx = self.counts[class as usize];
        self.counts[class as usize] += 1;
        format!("{prefix}{idx}")
    }

    fn alloc_for(&mut self, vt: VarType) -> String {
        self.alloc(class_of(vt))
    }

    fn value(&self, op: Operand) -> String {
        match op {
            Operand::None => "<none>".to_string(),
            Operand::Node(i) => self.values[i as usize].clone(),
            Operand::Param(_) => unreachable!("params are pre-loaded into registers"),
        }
    }

    fn run(mut self, fingerprint: Fingerprint, cc: u32) -> String {
        let name = kernel_name(fingerprint);

        // Thread index and bounds check.
        let ctaid = self.alloc(RegClass::B32);
        let ntid = self.alloc(RegClass::B32);
        let tid = self.alloc(RegClass::B32);
        let index = self.alloc(RegClass::B32);
        let size = self.alloc(RegClass::B32);
        let oob = self.alloc(RegClass::Pred);
        let params = self.alloc(RegClass::B64);
        let index64 = self.alloc(RegClass::B64);
        let _ = writeln!(
            self.body,
            "    mov.u32 {ctaid}, %ctaid.x;\n    mov.u32 {ntid}, %ntid.x;\n    \
             mov.u32 {tid}, %tid.x;\n    mad.lo.u32 {index}, {ctaid}, {ntid}, {tid};\n    \
             ld.param.u32 {size}, [size];\n    setp.ge.u32 {oob}, {index}, {size};\n    \
             @{oob} bra L_done;\n\n    ld.param.u64 {params}, [params];\n    \
             cvt.u64.u32 {index64}, {index};"
        );

        // Parameter bases and input lane loads.
        for slot in 0..self.program.params.len() {
            let base = self.alloc(RegClass::B64);
            let _ = writeln!(
                self.body,
                "    ld.global.u64 {base}, [{params}+{}];",
                slot * 8
            );
            self.param_reg.push(base);
        }
        let mut param_value = vec![String::new(); self.program.params.len()];
        for slot in 0..self.program.params.len() {
            let p = self.program.params[slot];
            if p.output {
                continue;
            }
            if p.pointer {
                param_value[slot] = self.param_reg[slot].clone();
                continue;
            }
            let addr = if p.scalar {
                self.param_reg[slot].clone()
            } else {
                let addr = self.alloc(RegClass::B64);
                let _ = writeln!(
                    self.body,
                    "    mad.lo.u64 {addr}, {index64}, {}, {};",
                    p.vt.size(),
                    self.param_reg[slot]
                );
                addr
            };
            param_value[slot] = self.emit_load(p.vt, &addr);
        }

        self.body.push('\n');
        for i in 0..self.program.ops.len() {
            self.emit_op(i, &param_value, &index);
        }

        // Output stores.
        for k in 0..self.program.stores.len() {
            let (slot, node) = self.program.stores[k];
            let p = self.program.params[slot as usize];
            let addr = self.alloc(RegClass::B64);
            let value = self.values[node as usize].clone();
            let base = self.param_reg[slot as usize].clone();
            let _ = writeln!(
                self.body,
                "    mad.lo.u64 {addr}, {index64}, {}, {base};",
                p.vt.size()
            );
            self.emit_store(p.vt, &addr, &value);
        }

        self.body.push_str("\nL_done:\n    ret;\n");

        // Assemble the module around the finished body so the register
        // declarations carry exact counts.
        let mut out = String::with_capacity(self.body.len() + 512);
        let _ = writeln!(
            out,
            ".version 6.3\n.target sm_{cc}\n.address_size 64\n"
        );
        let _ = writeln!(
            out,
            ".entry {name}(.param .u32 size, .param .u64 params) {{"
        );
        let decls: [(&str, &str); CLASS_COUNT] = [
            ("pred", "%p"),
            ("b16", "%h"),
            ("f32", "%f"),
            ("f64", "%d"),
            ("b32", "%r"),
            ("b64", "%rd"),
        ];
        for (i, (ty, prefix)) in decls.iter().enumerate() {
            if self.counts[i] > 0 {
                let _ = writeln!(out, "    .reg .{ty} {prefix}<{}>;", self.counts[i]);
            }
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push_str("}\n");

        // NUL-terminated entry table for the loader.
        out.push('\0');
        out.push_str(&name);
        out.push('\0');
        out
    }

    fn emit_load(&mut self, vt: VarType, addr: &str) -> String {
        match vt {
            VarType::Bool => {
                let tmp = self.alloc(RegClass::B32);
                let pred = self.alloc(RegClass::Pred);
                let _ = writeln!(
                    self.body,
                    "    ld.global.u8 {tmp}, [{addr}];\n    setp.ne.u32 {pred}, {tmp}, 0;"
                );
                pred
            }
            _ => {
                let reg = self.alloc_for(vt);
                let _ = writeln!(self.body, "    ld.global.{} {reg}, [{addr}];", ptx_name(vt));
                reg
            }
        }
    }

    fn emit_store(&mut self, vt: VarType, addr: &str, value: &str) {
        match vt {
            VarType::Bool => {
                let tmp = self.alloc(RegClass::B32);
                let _ = writeln!(
                    self.body,
                    "    selp.u32 {tmp}, 1, 0, {value};\n    st.global.u8 [{addr}], {tmp};"
                );
            }
            _ => {
                let _ = writeln!(self.body, "    st.global.{} [{addr}], {value};", ptx_name(vt));
            }
        }
    }

    fn emit_op(&mut self, index: usize, param_value: &[String], thread_index: &str) {
        use VarKind::*;
        let op = self.program.ops[index];
        let vt = op.vt;
        let t = ptx_name(vt);
        let tb = ptx_name_bin(vt);

        let resolve = |e: &Emitter<'a>, o: Operand| -> String {
            match o {
                Operand::Param(slot) => param_value[slot as usize].clone(),
                Operand::Node(i) => {
                    let node = &e.program.ops[i as usize];
                    if node.kind == Literal {
                        ptx_scalar_const(node.vt, node.literal)
                    } else {
                        e.values[i as usize].clone()
                    }
                }
                Operand::None => "<none>".to_string(),
            }
        };
        let a = resolve(self, op.arg[0]);
        let b = resolve(self, op.arg[1]);
        let c = resolve(self, op.arg[2]);

        match op.kind {
            Invalid | Data => {}
            Literal => {
                // Immediates are folded into their uses; nothing to emit.
                self.values[index] = ptx_scalar_const(vt, op.literal);
            }
            Counter => {
                let r = self.alloc_for(vt);
                let _ = writeln!(self.body, "    mov.u32 {r}, {thread_index};");
                self.values[index] = r;
            }
            Neg | Abs => {
                let inst = if op.kind == Neg { "neg" } else { "abs" };
                let r = self.alloc_for(vt);
                let _ = writeln!(self.body, "    {inst}.{t} {r}, {a};");
                self.values[index] = r;
            }
            Not => {
                let r = self.alloc_for(vt);
                if vt == VarType::Bool {
                    let _ = writeln!(self.body, "    not.pred {r}, {a};");
                } else {
                    let _ = writeln!(self.body, "    not.{tb} {r}, {a};");
                }
                self.values[index] = r;
            }
            Sqrt => {
                let r = self.alloc_for(vt);
                let _ = writeln!(self.body, "    sqrt.rn.{t} {r}, {a};");
                self.values[index] = r;
            }
            Rcp => {
                let r = self.alloc_for(vt);
                let _ = writeln!(self.body, "    rcp.rn.{t} {r}, {a};");
                self.values[index] = r;
            }
            Rsqrt => {
                let sq = self.alloc_for(vt);
                let r = self.alloc_for(vt);
                let _ = writeln!(
                    self.body,
                    "    sqrt.rn.{t} {sq}, {a};\n    rcp.rn.{t} {r}, {sq};"
                );
                self.values[index] = r;
            }
            Ceil | Floor | Round | Trunc => {
                let modifier = match op.kind {
                    Ceil => "rpi",
                    Floor => "rmi",
                    Round => "rni",
                    _ => "rzi",
                };
                let r = self.alloc_for(vt);
                let _ = writeln!(self.body, "    cvt.{modifier}.{t}.{t} {r}, {a};");
                self.values[index] = r;
            }
            Sin | Cos | Exp2 | Log2 => {
                if vt != VarType::Float32 {
                    crate::errors::fatal(&format!(
                        "ptx codegen: \"{}\" is only available for float32",
                        op.kind.name()
                    ));
                }
                let inst = match op.kind {
                    Sin => "sin.approx.f32",
                    Cos => "cos.approx.f32",
                    Exp2 => "ex2.approx.f32",
                    _ => "lg2.approx.f32",
                };
                let r = self.alloc_for(vt);
                let _ = writeln!(self.body, "    {inst} {r}, {a};");
                self.values[index] = r;
            }
            Popc | Clz => {
                let inst = if op.kind == Popc { "popc" } else { "clz" };
                let r = self.alloc(RegClass::B32);
                let _ = writeln!(self.body, "    {inst}.{tb} {r}, {a};");
                self.values[index] = r;
            }
            Ctz => {
                // brev + clz is the canonical PTX idiom.
                let rev = self.alloc_for(vt);
                let r = self.alloc(RegClass::B32);
                let _ = writeln!(
                    self.body,
                    "    brev.{tb} {rev}, {a};\n    clz.{tb} {r}, {rev};"
                );
                self.values[index] = r;
            }
            Add | Sub | Min | Max | And | Or | Xor => {
                let r = self.alloc_for(vt);
                if vt == VarType::Bool {
                    let inst = match op.kind {
                        And => "and",
                        Or => "or",
                        Xor => "xor",
                        _ => crate::errors::fatal("ptx codegen: arithmetic on predicates"),
                    };
                    let _ = writeln!(self.body, "    {inst}.pred {r}, {a}, {b};");
                } else {
                    let inst = match op.kind {
                        Add => "add",
                        Sub => "sub",
                        Min => "min",
                        Max => "max",
                        And => "and",
                        Or => "or",
                        _ => "xor",
                    };
                    let suffix = if matches!(op.kind, And | Or | Xor) { tb } else { t };
                    let _ = writeln!(self.body, "    {inst}.{suffix} {r}, {a}, {b};");
                }
                self.values[index] = r;
            }
            Mul => {
                let r = self.alloc_for(vt);
                if vt.is_float() {
                    let _ = writeln!(self.body, "    mul.{t} {r}, {a}, {b};");
                } else {
                    let _ = writeln!(self.body, "    mul.lo.{t} {r}, {a}, {b};");
                }
                self.values[index] = r;
            }
            Mulhi => {
                let r = self.alloc_for(vt);
                let _ = writeln!(self.body, "    mul.hi.{t} {r}, {a}, {b};");
                self.values[index] = r;
            }
            Div => {
                let r = self.alloc_for(vt);
                if vt.is_float() {
                    let _ = writeln!(self.body, "    div.rn.{t} {r}, {a}, {b};");
                } else {
                    let _ = writeln!(self.body, "    div.{t} {r}, {a}, {b};");
                }
                self.values[index] = r;
            }
            Mod => {
                if vt.is_float() {
                    crate::errors::fatal("ptx codegen: floating point remainder is unsupported");
                }
                let r = self.alloc_for(vt);
                let _ = writeln!(self.body, "    rem.{t} {r}, {a}, {b};");
                self.values[index] = r;
            }
            Shl | Shr => {
                let r = self.alloc_for(vt);
                let inst = if op.kind == Shl {
                    format!("shl.{tb}")
                } else {
                    format!("shr.{t}")
                };
                let _ = writeln!(self.body, "    {inst} {r}, {a}, {b};");
                self.values[index] = r;
            }
            Eq | Neq | Lt | Le | Gt | Ge => {
                let src = self.program.operand_vt(op.arg[0]);
                let pred = self.alloc(RegClass::Pred);
                let cmp = match op.kind {
                    Eq => "eq",
                    Neq => "ne",
                    Lt => "lt",
                    Le => "le",
                    Gt => "gt",
                    _ => "ge",
                };
                let _ = writeln!(
                    self.body,
                    "    setp.{cmp}.{} {pred}, {a}, {b};",
                    ptx_name(src)
                );
                self.values[index] = pred;
            }
            Fma => {
                let r = self.alloc_for(vt);
                if vt.is_float() {
                    let _ = writeln!(self.body, "    fma.rn.{t} {r}, {a}, {b}, {c};");
                } else {
                    let _ = writeln!(self.body, "    mad.lo.{t} {r}, {a}, {b}, {c};");
                }
                self.values[index] = r;
            }
            Select => {
                let r = self.alloc_for(vt);
                if vt == VarType::Bool {
                    let t1 = self.alloc(RegClass::Pred);
                    let t2 = self.alloc(RegClass::Pred);
                    let t3 = self.alloc(RegClass::Pred);
                    let _ = writeln!(
                        self.body,
                        "    and.pred {t1}, {a}, {b};\n    not.pred {t2}, {a};\n    \
                         and.pred {t3}, {t2}, {c};\n    or.pred {r}, {t1}, {t3};"
                    );
                } else {
                    let _ = writeln!(self.body, "    selp.{tb} {r}, {b}, {c}, {a};");
                }
                self.values[index] = r;
            }
            Cast => {
                let src = self.program.operand_vt(op.arg[0]);
                self.values[index] = self.emit_cast(src, vt, &a);
            }
            Bitcast => {
                let r = self.alloc_for(vt);
                let _ = writeln!(self.body, "    mov.{tb} {r}, {a};");
                self.values[index] = r;
            }
            Gather => {
                let ivt = self.program.operand_vt(op.arg[1]);
                let idx64 = self.widen_index(ivt, &b);
                let addr = self.alloc(RegClass::B64);
                let _ = writeln!(
                    self.body,
                    "    mad.lo.u64 {addr}, {idx64}, {}, {a};",
                    vt.size()
                );
                self.values[index] = self.emit_load(vt, &addr);
            }
            Scatter => {
                let vvt = self.program.operand_vt(op.arg[1]);
                let ivt = self.program.operand_vt(op.arg[2]);
                let idx64 = self.widen_index(ivt, &c);
                let addr = self.alloc(RegClass::B64);
                let _ = writeln!(
                    self.body,
                    "    mad.lo.u64 {addr}, {idx64}, {}, {a};",
                    vvt.size()
                );
                self.emit_store(vvt, &addr, &b);
            }
            Dispatch => {
                crate::errors::fatal(
                    "ptx codegen: indirect dispatch requires the callables extension",
                );
            }
        }
    }

    fn widen_index(&mut self, ivt: VarType, value: &str) -> String {
        if ivt.size() == 8 {
            return value.to_string();
        }
        let r = self.alloc(RegClass::B64);
        let _ = writeln!(self.body, "    cvt.u64.{} {r}, {value};", ptx_name(ivt));
        r
    }

    fn emit_cast(&mut self, src: VarType, dst: VarType, value: &str) -> String {
        if src == dst {
            return value.to_string();
        }
        if src == VarType::Bool {
            let r = self.alloc_for(dst);
            let _ = writeln!(
                self.body,
                "    selp.{} {r}, 1, 0, {value};",
                ptx_name_bin(dst)
            );
            return r;
        }
        if dst == VarType::Bool {
            let pred = self.alloc(RegClass::Pred);
            let _ = writeln!(
                self.body,
                "    setp.ne.{} {pred}, {value}, 0;",
                ptx_name(src)
            );
            return pred;
        }
        let r = self.alloc_for(dst);
        let modifier = if src.is_float() && !dst.is_float() {
            "rzi."
        } else if !src.is_float() && dst.is_float() {
            "rn."
        } else if src.is_float() && dst.is_float() && dst.size() < src.size() {
            "rn."
        } else {
            ""
        };
        let _ = writeln!(
            self.body,
            "    cvt.{modifier}{}.{} {r}, {value};",
            ptx_name(dst),
            ptx_name(src)
        );
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::JitBackend;
    use crate::kernel::program::{ParamInfo, ProgOp};

    fn mul_program() -> Program {
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
                    scalar: false,
                    pointer: false,
                    output: true,
                },
            ],
            ops: vec![ProgOp {
                kind: VarKind::Mul,
                vt: VarType::Float32,
                scalar: false,
                arg: [
                    Operand::Param(0),
                    Operand::Param(0),
                    Operand::None,
                    Operand::None,
                ],
                literal: 0,
            }],
            stores: vec![(1, 0)],
        }
    }

    #[test]
    fn emits_entry_and_bounds_check() {
        let p = mul_program();
        let fp = Fingerprint::of(&p.serialize(JitBackend::Cuda));
        let ptx = emit(&p, fp, 70);

        assert!(ptx.contains(".target sm_70"));
        assert!(ptx.contains(&format!(
            ".entry {}(.param .u32 size, .param .u64 params)",
            kernel_name(fp)
        )));
        assert!(ptx.contains("mad.lo.u32"));
        assert!(ptx.contains("mul.f32"));
        assert!(ptx.contains("st.global.f32"));
    }

    #[test]
    fn entry_table_is_nul_terminated() {
        let p = mul_program();
        let fp = Fingerprint::of(&p.serialize(JitBackend::Cuda));
        let ptx = emit(&p, fp, 50);
        let names: Vec<&str> = ptx
            .split('\0')
            .skip(1)
            .filter(|s| !s.is_empty())
            .collect();
        assert_eq!(names, vec![kernel_name(fp).as_str()]);
    }

    #[test]
    fn register_declarations_match_usage() {
        let p = mul_program();
        let fp = Fingerprint::of(&p.serialize(JitBackend::Cuda));
        let ptx = emit(&p, fp, 50);
        assert!(ptx.contains(".reg .f32 %f<"));
        assert!(ptx.contains(".reg .b64 %rd<"));
        // Determinism
        assert_eq!(ptx, emit(&p, fp, 50));
    }
}
