//! Per-type source templates used by both code generators.

use crate::var::{VarType, VAR_TYPE_COUNT};

/// LLVM IR scalar type names (sign is carried by the instruction, not the
/// type).
pub const LLVM_NAME: [&str; VAR_TYPE_COUNT] = [
    "???", "i1", "i8", "i8", "i16", "i16", "i32", "i32", "i64", "i64", "i64", "half", "float",
    "double",
];

/// PTX operand type suffixes.
pub const PTX_NAME: [&str; VAR_TYPE_COUNT] = [
    "???", "pred", "s8", "u8", "s16", "u16", "s32", "u32", "s64", "u64", "u64", "f16", "f32",
    "f64",
];

/// PTX suffixes for unsigned/bit-level views of each type.
pub const PTX_NAME_BIN: [&str; VAR_TYPE_COUNT] = [
    "???", "pred", "b8", "b8", "b16", "b16", "b32", "b32", "b64", "b64", "b64", "b16", "b32",
    "b64",
];

/// PTX register class prefix per type.
pub const PTX_REG_PREFIX: [&str; VAR_TYPE_COUNT] = [
    "%u", "%p", "%r", "%r", "%r", "%r", "%r", "%r", "%rd", "%rd", "%rd", "%h", "%f", "%d",
];

pub fn llvm_name(vt: VarType) -> &'static str {
    LLVM_NAME[vt as usize]
}

pub fn ptx_name(vt: VarType) -> &'static str {
    PTX_NAME[vt as usize]
}

pub fn ptx_name_bin(vt: VarType) -> &'static str {
    PTX_NAME_BIN[vt as usize]
}

pub fn ptx_reg_prefix(vt: VarType) -> &'static str {
    PTX_REG_PREFIX[vt as usize]
}

/// Render one scalar constant the way LLVM IR spells it. Floats use the
/// hexadecimal form so the value survives round-tripping exactly.
pub fn llvm_scalar_const(vt: VarType, bits: u64) -> String {
    match vt {
        VarType::Bool => if bits & 1 != 0 { "true" } else { "false" }.to_string(),
        VarType::Float32 => {
            // LLVM spells f32 constants as f64 hex with the low mantissa
            // bits zeroed.
            let wide = f32::from_bits(bits as u32) as f64;
            format!("0x{:016X}", wide.to_bits())
        }
        VarType::Float64 => format!("0x{bits:016X}"),
        VarType::Float16 => format!("0xH{:04X}", bits as u16),
        _ if vt.is_unsigned_int() => format!("{}", crate::var::fold::to_u64(vt, bits)),
        _ => format!("{}", crate::var::fold::to_i64(vt, bits)),
    }
}

/// `<T c, T c, ...>` splat of one constant across `width` lanes, without
/// the leading vector type.
pub fn llvm_splat_const(vt: VarType, width: u32, bits: u64) -> String {
    let scalar = llvm_scalar_const(vt, bits);
    let name = llvm_name(vt);
    let mut out = String::with_capacity(width as usize * (name.len() + scalar.len() + 3) + 2);
    out.push('<');
    for i in 0..width {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(name);
        out.push(' ');
        out.push_str(&scalar);
    }
    out.push('>');
    out
}

/// All-ones / all-zeros splats, pre-materialized at backend init for every
/// type so the hot emission path only concatenates.
pub struct ConstTemplates {
    pub width: u32,
    pub ones: [String; VAR_TYPE_COUNT],
    pub zeros: [String; VAR_TYPE_COUNT],
}

impl ConstTemplates {
    pub fn new(width: u32) -> Self {
        let mut ones: [String; VAR_TYPE_COUNT] = Default::default();
        let mut zeros: [String; VAR_TYPE_COUNT] = Default::default();
        for i in 1..VAR_TYPE_COUNT {
            let vt = VarType::from_u8(i as u8).expect("type index in range");
            let ones_bits = match vt {
                VarType::Bool => 1,
                VarType::Float32 => f32::to_bits(1.0) as u64,
                VarType::Float64 => f64::to_bits(1.0),
                VarType::Float16 => 0x3c00,
                _ => u64::MAX,
            };
            ones[i] = llvm_splat_const(vt, width, ones_bits);
            zeros[i] = llvm_splat_const(vt, width, 0);
        }
        ConstTemplates { width, ones, zeros }
    }

    pub fn ones(&self, vt: VarType) -> &str {
        &self.ones[vt as usize]
    }

    pub fn zeros(&self, vt: VarType) -> &str {
        &self.zeros[vt as usize]
    }
}

/// Render one scalar constant as a PTX immediate.
pub fn ptx_scalar_const(vt: VarType, bits: u64) -> String {
    match vt {
        VarType::Bool => format!("{}", bits & 1),
        VarType::Float32 => format!("0f{:08X}", bits as u32),
        VarType::Float64 => format!("0d{bits:016X}"),
        VarType::Float16 => format!("0x{:04X}", bits as u16),
        _ if vt.is_unsigned_int() => format!("{}", crate::var::fold::to_u64(vt, bits)),
        _ => format!("{}", crate::var::fold::to_i64(vt, bits)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llvm_float_constants_use_hex_doubles() {
        assert_eq!(
            llvm_scalar_const(VarType::Float32, 1.0f32.to_bits() as u64),
            "0x3FF0000000000000"
        );
        assert_eq!(llvm_scalar_const(VarType::Int32, (-3i32) as u32 as u64), "-3");
        assert_eq!(llvm_scalar_const(VarType::UInt8, 0xff), "255");
        assert_eq!(llvm_scalar_const(VarType::Bool, 1), "true");
    }

    #[test]
    fn splat_width_matches() {
        let s = llvm_splat_const(VarType::Float32, 4, 0);
        assert_eq!(s.matches("float").count(), 4);
        assert!(s.starts_with('<') && s.ends_with('>'));

        let t = ConstTemplates::new(8);
        assert_eq!(t.width, 8);
        assert_eq!(t.ones(VarType::Int32).matches("i32 -1").count(), 8);
        assert_eq!(t.zeros(VarType::Float64).matches("double 0x00").count(), 8);
    }

    #[test]
    fn ptx_constants() {
        assert_eq!(ptx_scalar_const(VarType::Float32, 1.0f32.to_bits() as u64), "0f3F800000");
        assert_eq!(ptx_scalar_const(VarType::UInt8, 0xff), "255");
        assert_eq!(ptx_scalar_const(VarType::Int8, 0xff), "-1");
        assert_eq!(ptx_scalar_const(VarType::Bool, 3), "1");
    }

    #[test]
    fn type_tables_cover_every_variant() {
        for i in 1..VAR_TYPE_COUNT {
            let vt = VarType::from_u8(i as u8).unwrap();
            assert_ne!(llvm_name(vt), "???");
            assert_ne!(ptx_name(vt), "???");
            assert_ne!(ptx_name_bin(vt), "???");
            assert!(!ptx_reg_prefix(vt).is_empty());
        }
    }
}
