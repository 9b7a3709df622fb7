//! Portable host executor.
//!
//! When no usable shared LLVM library is found at init, host kernels are
//! "compiled" to their serialized [`Program`] and interpreted lane by lane.
//! Fingerprints, the two cache tiers, statistics and launch sequencing are
//! identical to the native path; only the artifact differs. The interpreter
//! shares its scalar semantics with the constant folder, so folded literals
//! and executed kernels always agree.

use crate::errors::fatal;
use crate::kernel::program::{Operand, Program};
use crate::var::fold::{self, eval_scalar};
use crate::var::{VarKind, VarType};

/// Read one element's bit pattern from a raw buffer.
///
/// # Safety
/// `addr` must point at least `index + 1` elements of type `vt`.
unsafe fn read_scalar(vt: VarType, addr: usize, index: u64) -> u64 {
    let p = (addr + index as usize * vt.size()) as *const u8;
    match vt.size() {
        1 => std::ptr::read_unaligned(p) as u64,
        2 => std::ptr::read_unaligned(p as *const u16) as u64,
        4 => std::ptr::read_unaligned(p as *const u32) as u64,
        _ => std::ptr::read_unaligned(p as *const u64),
    }
}

/// # Safety
/// `addr` must point at least `index + 1` writable elements of type `vt`.
unsafe fn write_scalar(vt: VarType, addr: usize, index: u64, bits: u64) {
    let p = (addr + index as usize * vt.size()) as *mut u8;
    match vt.size() {
        1 => std::ptr::write_unaligned(p, bits as u8),
        2 => std::ptr::write_unaligned(p as *mut u16, bits as u16),
        4 => std::ptr::write_unaligned(p as *mut u32, bits as u32),
        _ => std::ptr::write_unaligned(p as *mut u64, bits),
    }
}

/// Execute `program` over lanes `[start, end)` against the bound parameter
/// buffers. Callers launch scatter-bearing programs as a single block so
/// lanes run in ascending order and program order decides duplicate writes.
///
/// # Safety
/// Every entry of `params` must be a live buffer large enough for the lane
/// range (or a single element for scalar/pointer slots).
pub unsafe fn launch(program: &Program, params: &[usize], start: u64, end: u64) {
    debug_assert_eq!(params.len(), program.params.len());
    let mut regs = vec![0u64; program.ops.len()];

    for lane in start..end {
        for (k, op) in program.ops.iter().enumerate() {
            let value = |operand: Operand, regs: &[u64]| -> u64 {
                match operand {
                    Operand::None => 0,
                    Operand::Node(i) => regs[i as usize],
                    Operand::Param(slot) => {
                        let info = program.params[slot as usize];
                        if info.pointer {
                            params[slot as usize] as u64
                        } else {
                            let index = if info.scalar { 0 } else { lane };
                            read_scalar(info.vt, params[slot as usize], index)
                        }
                    }
                }
            };

            regs[k] = match op.kind {
                VarKind::Literal => op.literal,
                VarKind::Counter => lane & fold::type_mask(op.vt),
                VarKind::Gather => {
                    let addr = value(op.arg[0], &regs) as usize;
                    let index = value(op.arg[1], &regs);
                    read_scalar(op.vt, addr, index)
                }
                VarKind::Scatter => {
                    let addr = value(op.arg[0], &regs) as usize;
                    let v = value(op.arg[1], &regs);
                    let index = value(op.arg[2], &regs);
                    let vvt = program.operand_vt(op.arg[1]);
                    write_scalar(vvt, addr, index, v);
                    0
                }
                VarKind::Cast | VarKind::Bitcast => {
                    let src = program.operand_vt(op.arg[0]);
                    let bits = value(op.arg[0], &regs);
                    match fold::eval_cast(src, op.vt, bits, op.kind == VarKind::Bitcast) {
                        Some(v) => v,
                        None => fatal(&format!(
                            "portable kernel: cannot convert {} to {}",
                            src.name(),
                            op.vt.name()
                        )),
                    }
                }
                VarKind::Data | VarKind::Invalid | VarKind::Dispatch => fatal(&format!(
                    "portable kernel: opcode \"{}\" cannot be interpreted",
                    op.kind.name()
                )),
                kind => {
                    let vt = if kind.is_comparison() {
                        program.operand_vt(op.arg[0])
                    } else {
                        op.vt
                    };
                    let args = [
                        value(op.arg[0], &regs),
                        value(op.arg[1], &regs),
                        value(op.arg[2], &regs),
                        value(op.arg[3], &regs),
                    ];
                    match eval_scalar(kind, vt, args) {
                        Some(v) => v,
                        None => fatal(&format!(
                            "portable kernel: opcode \"{}\" is undefined for type {} \
                             (operands {:x?})",
                            kind.name(),
                            vt.name(),
                            args
                        )),
                    }
                }
            };
        }

        for &(slot, node) in &program.stores {
            let info = program.params[slot as usize];
            write_scalar(info.vt, params[slot as usize], lane, regs[node as usize]);
        }
    }
}
