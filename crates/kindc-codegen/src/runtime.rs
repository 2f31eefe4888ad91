//! Native primitives: descriptor table and calling convention.
//!
//! Every call into the runtime names a primitive (`number::add`,
//! `bitvm::ldlocRef`, a user `//% shim=`...). The template image exports the
//! address of each primitive; [`NativeTable`] maps names to those resolved
//! descriptors and validates call sites against them.
//!
//! Arguments travel in r0..r3, so a native takes at most four. The caller
//! keeps ownership of reference arguments: a call mask marks the
//! reference-typed positions, and the caller drops them right after the
//! call returns.

use std::collections::BTreeMap;

use kindc_types::ast::BinOp;
use serde::{Deserialize, Serialize};

use crate::error::{CodegenError, CodegenResult};
use crate::types::{TypeClass, MAX_NATIVE_ARGS};

// ══════════════════════════════════════════════════════════════════════════════
// Descriptors
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NativeKind {
    /// No result.
    #[serde(rename = "P")]
    Procedure,
    /// Result in r0.
    #[serde(rename = "F")]
    Function,
    /// A constant; the descriptor value is the enum value.
    #[serde(rename = "E")]
    EnumValue,
}

impl NativeKind {
    pub fn letter(self) -> char {
        match self {
            Self::Procedure => 'P',
            Self::Function => 'F',
            Self::EnumValue => 'E',
        }
    }
}

/// One entry of a template or extension function table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NativeKind,
    pub args: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeDescriptor {
    pub name: String,
    pub kind: NativeKind,
    pub arity: u8,
    /// Absolute address for procedures and functions, value for enums.
    pub value: u32,
}

/// Read-only name → descriptor map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeTable {
    entries: BTreeMap<String, NativeDescriptor>,
}

impl NativeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, desc: NativeDescriptor) {
        self.entries.insert(desc.name.clone(), desc);
    }

    pub fn insert_enum(&mut self, name: &str, value: i32) {
        self.insert(NativeDescriptor {
            name: name.to_string(),
            kind: NativeKind::EnumValue,
            arity: 0,
            value: value as u32,
        });
    }

    pub fn get(&self, name: &str) -> Option<&NativeDescriptor> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NativeDescriptor> {
        self.entries.values()
    }

    /// Look up a primitive the generated code calls.
    pub fn lookup(&self, name: &str) -> CodegenResult<&NativeDescriptor> {
        self.get(name)
            .ok_or_else(|| CodegenError::UnresolvedNative(format!("function not found: {name}")))
    }

    /// Validate a source-level call of a native-bound declaration.
    pub fn check_call(&self, name: &str, has_ret: bool, argc: usize) -> CodegenResult<&NativeDescriptor> {
        let desc = self.lookup(name)?;
        let expected = if has_ret {
            NativeKind::Function
        } else {
            NativeKind::Procedure
        };
        if desc.kind != expected {
            return Err(CodegenError::UnresolvedNative(format!(
                "{name} is declared as {} but used as {}",
                desc.kind.letter(),
                expected.letter()
            )));
        }
        if desc.arity as usize != argc {
            return Err(CodegenError::UnresolvedNative(format!(
                "argument number mismatch for {name}: {argc} vs {} in the runtime",
                desc.arity
            )));
        }
        if argc > MAX_NATIVE_ARGS {
            return Err(CodegenError::UnresolvedNative(format!(
                "{name} takes {argc} arguments; at most {MAX_NATIVE_ARGS} are supported"
            )));
        }
        Ok(desc)
    }

    /// Address of a primitive relative to the start of the code region.
    pub fn relative_address(&self, name: &str, bytecode_start: u32) -> Option<i64> {
        let desc = self.get(name)?;
        match desc.kind {
            NativeKind::EnumValue => None,
            _ => Some(i64::from(desc.value) - i64::from(bytecode_start)),
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Primitive names
// ══════════════════════════════════════════════════════════════════════════════

// ── Reference counting ──
pub const INCR: &str = "bitvm::incr";
pub const DECR: &str = "bitvm::decr";

// ── Boxes, globals, fields, closures ──
pub const MKLOC: &str = "bitvm::mkloc";
pub const LDLOC: &str = "bitvm::ldloc";
pub const STLOC: &str = "bitvm::stloc";
pub const LDGLB: &str = "bitvm::ldglb";
pub const STGLB: &str = "bitvm::stglb";
pub const LDFLD: &str = "bitvm::ldfld";
pub const STFLD: &str = "bitvm::stfld";
pub const STCLO: &str = "bitvm::stclo";
pub const ACTION_MK: &str = "action::mk";
pub const ACTION_RUN: &str = "action::run";
pub const RECORD_MK: &str = "record::mk";

// ── Collections and strings ──
pub const COLLECTION_MK: &str = "collection::mk";
pub const COLLECTION_ADD: &str = "collection::add";
pub const COLLECTION_AT: &str = "collection::at";
pub const STRING_AT: &str = "string::at";
pub const STRING_CONCAT: &str = "string::concat_op";
pub const NUMBER_TO_STRING: &str = "number::to_string";
pub const BOOLEAN_TO_STRING: &str = "boolean::to_string";
pub const BOOLEAN_NOT: &str = "boolean::not_";
pub const NUMBER_ADD: &str = "number::add";
pub const NUMBER_SUBTRACT: &str = "number::subtract";

// ── Pseudo-shims handled by the compiler ──
pub const SHIM_NOOP: &str = "TD_NOOP";
pub const SHIM_ID: &str = "TD_ID";

/// Runtime primitive implementing `op` on operands of the given classes.
///
/// `+` with a string operand is handled separately (it converts the other
/// side first) and `&&`/`||` never reach a primitive.
pub fn binop_primitive(op: BinOp, left: TypeClass, right: TypeClass) -> Option<&'static str> {
    use BinOp::*;
    use TypeClass as C;
    match (left, right) {
        (C::Number, C::Number) => Some(match op {
            Add => "number::add",
            Sub => "number::subtract",
            Mul => "number::multiply",
            Div => "number::divide",
            Mod => "number::mod",
            Lt => "number::lt",
            Le => "number::le",
            Gt => "number::gt",
            Ge => "number::ge",
            Eq => "number::eq",
            Ne => "number::neq",
            BitAnd => "number::bitand",
            BitOr => "number::bitor",
            BitXor => "number::bitxor",
            Shl => "number::lshift",
            Shr => "number::rshift",
            And | Or => return None,
        }),
        (C::String, C::String) => match op {
            Lt => Some("string::lt"),
            Le => Some("string::le"),
            Gt => Some("string::gt"),
            Ge => Some("string::ge"),
            Eq => Some("string::equals"),
            Ne => Some("string::neq"),
            _ => None,
        },
        // Identity comparison of scalars and pointers.
        (l, r) if l == r || l == C::Null || r == C::Null => match op {
            Eq => Some("number::eq"),
            Ne => Some("number::neq"),
            _ => None,
        },
        _ => None,
    }
}
