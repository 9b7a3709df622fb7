//! Structural CSE key.
//!
//! The key packs every field that determines a node's value into eight
//! 32-bit words. Equality is bytewise; hashing runs aHash over the packed
//! words. Two live variables may never share a key (checked at shutdown).

use super::{VarKind, VarType, Variable};
use crate::backend::JitBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct VariableKey {
    pub size: u32,
    pub dep: [u32; 4],
    /// kind | type << 8 | backend << 16 | flags << 24
    pub packed: u32,
    pub literal: u64,
}

const FLAG_PLACEHOLDER: u32 = 1 << 0;
const FLAG_SYMBOLIC: u32 = 1 << 1;
const FLAG_SCATTER: u32 = 1 << 2;

impl VariableKey {
    pub fn new(v: &Variable) -> Self {
        let mut flags = 0;
        if v.placeholder {
            flags |= FLAG_PLACEHOLDER;
        }
        if v.symbolic {
            flags |= FLAG_SYMBOLIC;
        }
        if v.scatter {
            flags |= FLAG_SCATTER;
        }
        VariableKey {
            size: v.size,
            dep: v.dep,
            packed: v.kind as u32
                | (v.vt as u32) << 8
                | (v.backend as u32) << 16
                | flags << 24,
            // The scope counter lives in the literal word for nodes that
            // carry no payload, so nodes from different scopes never collapse.
            literal: if v.kind == VarKind::Literal || v.kind == VarKind::Cast {
                v.literal
            } else {
                v.literal ^ ((v.scope as u64) << 32).wrapping_mul(0x9e3779b97f4a7c15)
            },
        }
    }

    pub fn kind(&self) -> VarKind {
        VarKind::from_u8((self.packed & 0xff) as u8).unwrap_or(VarKind::Invalid)
    }

    pub fn vt(&self) -> VarType {
        VarType::from_u8(((self.packed >> 8) & 0xff) as u8).unwrap_or(VarType::Void)
    }

    pub fn backend(&self) -> JitBackend {
        if (self.packed >> 16) & 0xff == JitBackend::Cuda as u32 {
            JitBackend::Cuda
        } else {
            JitBackend::Host
        }
    }
}

const _: () = assert!(std::mem::size_of::<VariableKey>() == 8 * std::mem::size_of::<u32>());

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Variable {
        let mut v = Variable::new(JitBackend::Host, VarKind::Add, VarType::Float32, 16);
        v.dep = [3, 4, 0, 0];
        v
    }

    #[test]
    fn equal_structure_equal_key() {
        let a = sample();
        let b = sample();
        assert_eq!(VariableKey::new(&a), VariableKey::new(&b));
    }

    #[test]
    fn key_distinguishes_every_field() {
        let base = VariableKey::new(&sample());

        let mut v = sample();
        v.size = 17;
        assert_ne!(VariableKey::new(&v), base);

        let mut v = sample();
        v.dep[1] = 5;
        assert_ne!(VariableKey::new(&v), base);

        let mut v = sample();
        v.kind = VarKind::Mul;
        assert_ne!(VariableKey::new(&v), base);

        let mut v = sample();
        v.vt = VarType::Float64;
        assert_ne!(VariableKey::new(&v), base);

        let mut v = sample();
        v.backend = JitBackend::Cuda;
        assert_ne!(VariableKey::new(&v), base);

        let mut v = sample();
        v.scope = 9;
        assert_ne!(VariableKey::new(&v), base);
    }
}
