//! Backend-neutral kernel program.
//!
//! A scheduled launch group is flattened into this little SSA program: one
//! op per IR node in the scheduler's emission order, operands referring
//! either to earlier ops or to parameter slots (buffers bound at launch).
//! The same structure serves four consumers: the serialized form is hashed
//! into the cache fingerprint and persisted for the portable backend, the
//! code generators render it to LLVM IR or PTX text, and the portable
//! executor interprets it directly.

use crate::backend::JitBackend;
use crate::var::{VarKind, VarType};

/// Operand reference inside a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    None,
    /// Result of an earlier op (index into `Program::ops`).
    Node(u32),
    /// Parameter slot (index into `Program::params`).
    Param(u32),
}

impl Operand {
    fn encode(self, n_params: u32) -> u32 {
        match self {
            Operand::None => 0,
            Operand::Param(slot) => 1 + slot,
            Operand::Node(idx) => 1 + n_params + idx,
        }
    }

    fn decode(raw: u32, n_params: u32) -> Operand {
        if raw == 0 {
            Operand::None
        } else if raw <= n_params {
            Operand::Param(raw - 1)
        } else {
            Operand::Node(raw - 1 - n_params)
        }
    }
}

/// One buffer argument of the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamInfo {
    pub vt: VarType,
    /// Broadcast input of size 1 (element 0 is read for every lane).
    pub scalar: bool,
    /// Raw address argument (gather/scatter target), not indexed per lane.
    pub pointer: bool,
    /// Output slot written by a `store` entry.
    pub output: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgOp {
    pub kind: VarKind,
    pub vt: VarType,
    /// The op produces a uniform (size-1) value.
    pub scalar: bool,
    pub arg: [Operand; 4],
    pub literal: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    pub params: Vec<ParamInfo>,
    pub ops: Vec<ProgOp>,
    /// `(param slot, op index)` pairs materialized at the end of each lane.
    pub stores: Vec<(u32, u32)>,
}

impl Program {
    /// Type of an operand, resolved against the program.
    pub fn operand_vt(&self, op: Operand) -> VarType {
        match op {
            Operand::None => VarType::Void,
            Operand::Param(slot) => self.params[slot as usize].vt,
            Operand::Node(idx) => self.ops[idx as usize].vt,
        }
    }

    /// A program containing a scatter must run its lanes serially so that
    /// program order decides which write to a duplicated index wins.
    pub fn has_side_effects(&self) -> bool {
        self.ops.iter().any(|op| op.kind == VarKind::Scatter)
    }

    /// Deterministic byte serialization. Hashing this yields the kernel
    /// fingerprint; the portable backend also persists it as the compiled
    /// artifact. Buffer addresses never appear here.
    pub fn serialize(&self, backend: JitBackend) -> Vec<u8> {
        let n_params = self.params.len() as u32;
        let mut out = Vec::with_capacity(16 + self.ops.len() * 26);
        out.push(backend as u8);
        push_u32(&mut out, n_params);
        for p in &self.params {
            out.push(p.vt as u8);
            out.push(p.scalar as u8 | (p.pointer as u8) << 1 | (p.output as u8) << 2);
        }
        push_u32(&mut out, self.ops.len() as u32);
        for op in &self.ops {
            out.push(op.kind as u8);
            out.push(op.vt as u8);
            out.push(op.scalar as u8);
            for a in op.arg {
                push_u32(&mut out, a.encode(n_params));
            }
            push_u64(&mut out, op.literal);
        }
        push_u32(&mut out, self.stores.len() as u32);
        for &(slot, node) in &self.stores {
            push_u32(&mut out, slot);
            push_u32(&mut out, node);
        }
        out
    }

    pub fn deserialize(data: &[u8]) -> Option<(JitBackend, Program)> {
        let mut cur = Cursor { data, pos: 0 };
        let backend = JitBackend::from_u8(cur.u8()?)?;
        let n_params = cur.u32()?;
        let mut params = Vec::with_capacity(n_params as usize);
        for _ in 0..n_params {
            let vt = VarType::from_u8(cur.u8()?)?;
            let flags = cur.u8()?;
            params.push(ParamInfo {
                vt,
                scalar: flags & 1 != 0,
                pointer: flags & 2 != 0,
                output: flags & 4 != 0,
            });
        }
        let n_ops = cur.u32()?;
        let mut ops = Vec::with_capacity(n_ops as usize);
        for _ in 0..n_ops {
            let kind = VarKind::from_u8(cur.u8()?)?;
            let vt = VarType::from_u8(cur.u8()?)?;
            let scalar = cur.u8()? != 0;
            let mut arg = [Operand::None; 4];
            for slot in &mut arg {
                *slot = Operand::decode(cur.u32()?, n_params);
            }
            let literal = cur.u64()?;
            ops.push(ProgOp {
                kind,
                vt,
                scalar,
                arg,
                literal,
            });
        }
        let n_stores = cur.u32()?;
        let mut stores = Vec::with_capacity(n_stores as usize);
        for _ in 0..n_stores {
            let slot = cur.u32()?;
            let node = cur.u32()?;
            stores.push((slot, node));
        }
        if cur.pos != data.len() {
            return None;
        }
        Some((
            backend,
            Program {
                params,
                ops,
                stores,
            },
        ))
    }
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u32(&mut self) -> Option<u32> {
        let bytes = self.data.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    }

    fn u64(&mut self) -> Option<u64> {
        let bytes = self.data.get(self.pos..self.pos + 8)?;
        self.pos += 8;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Program {
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
            ops: vec![
                ProgOp {
                    kind: VarKind::Literal,
                    vt: VarType::Float32,
                    scalar: true,
                    arg: [Operand::None; 4],
                    literal: 3.0f32.to_bits() as u64,
                },
                ProgOp {
                    kind: VarKind::Add,
                    vt: VarType::Float32,
                    scalar: false,
                    arg: [
                        Operand::Param(0),
                        Operand::Node(0),
                        Operand::None,
                        Operand::None,
                    ],
                    literal: 0,
                },
            ],
            stores: vec![(1, 1)],
        }
    }

    #[test]
    fn serialization_round_trips() {
        let p = sample();
        let bytes = p.serialize(JitBackend::Host);
        let (backend, q) = Program::deserialize(&bytes).unwrap();
        assert_eq!(backend, JitBackend::Host);
        assert_eq!(p, q);
    }

    #[test]
    fn serialization_is_deterministic_and_content_sensitive() {
        let p = sample();
        assert_eq!(p.serialize(JitBackend::Host), p.serialize(JitBackend::Host));
        assert_ne!(p.serialize(JitBackend::Host), p.serialize(JitBackend::Cuda));

        let mut q = sample();
        q.ops[1].kind = VarKind::Mul;
        assert_ne!(p.serialize(JitBackend::Host), q.serialize(JitBackend::Host));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = sample().serialize(JitBackend::Host);
        assert!(Program::deserialize(&bytes[..bytes.len() - 1]).is_none());
    }
}
