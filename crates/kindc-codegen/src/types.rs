//! Value classification and target constants.
//!
//! Every source value is one 32-bit word. Value types are stored unboxed;
//! reference types point at a heap object whose first half-word is a
//! reference count (`0xffff` marks static data that is never freed).
//!
//! | Static type               | Class     |
//! |---------------------------|-----------|
//! | number, boolean, enum     | value     |
//! | void, null                | value     |
//! | string                    | reference |
//! | array (`T[]`)             | reference |
//! | class instance            | reference |
//! | function / closure        | reference |
//! | other generics, `any`     | rejected  |

use kindc_types::ast::{Decl, DeclKind, Type};

use crate::error::{CodegenError, CodegenResult};

// ── Classifier ───────────────────────────────────────────────────────────────

/// Whether values of `ty` are heap references subject to reference counting.
pub fn is_ref_type(ty: &Type) -> CodegenResult<bool> {
    match ty {
        Type::Number | Type::Boolean | Type::Enum(_) | Type::Void | Type::Null => Ok(false),
        Type::String | Type::Class(_) | Type::Function { .. } => Ok(true),
        Type::Array(elt) => {
            is_ref_type(elt)?;
            Ok(true)
        }
        Type::Generic { .. } | Type::Any => Err(CodegenError::UnsupportedType(ty.to_string())),
    }
}

/// Reject types outside the supported categories.
pub fn check_type(ty: &Type) -> CodegenResult<()> {
    is_ref_type(ty).map(|_| ())
}

/// Reference-typedness of the value stored for a declaration.
pub fn is_ref_decl(decl: &Decl) -> CodegenResult<bool> {
    match decl.kind {
        DeclKind::This => Ok(true),
        _ => is_ref_type(&decl.ty),
    }
}

/// Coarse operand class used to pick binary-operator primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeClass {
    Number,
    Boolean,
    String,
    Null,
    /// Any other reference (arrays, records, closures).
    Object,
}

impl TypeClass {
    pub fn of(ty: &Type) -> CodegenResult<Self> {
        check_type(ty)?;
        Ok(match ty {
            Type::Number | Type::Enum(_) => TypeClass::Number,
            Type::Boolean => TypeClass::Boolean,
            Type::String => TypeClass::String,
            Type::Null | Type::Void => TypeClass::Null,
            _ => TypeClass::Object,
        })
    }
}

// ── Program header ───────────────────────────────────────────────────────────

/// Opcode in the first header half-word.
pub const HEADER_OPCODE: u16 = 0x4207;

/// Magic placed at the start of every serialized program.
pub const PROGRAM_MAGIC: &str = "708E3B92C615A841C49866C975EE5197";

/// Placeholder line replaced by the source hash after serialization.
pub const SRCHASH_MARKER: &str = "@SRCHASH@";

// ── Template layout ──────────────────────────────────────────────────────────

/// First address of the region reserved for compiled code.
pub const BYTECODE_THRESHOLD: u32 = 0x3C000;

/// Data bytes of the jump-start record the program header replaces.
pub const JMP_START_SIGNATURE: [u8; 16] = [
    0x01, 0x08, 0x01, 0x08, 0x42, 0x42, 0x42, 0x42, 0x01, 0x08, 0x01, 0x08, 0x3E, 0xD8, 0xE9, 0x8D,
];

/// Code buffer limit in half-words.
pub const MAX_CODE_HALFWORDS: usize = 32000;

// ── Frame layout ─────────────────────────────────────────────────────────────

/// Register holding the closure environment of the running procedure.
pub const ENV_REG: &str = "r5";

/// Capture slots addressable with an immediate offset from [`ENV_REG`].
pub const MAX_CAPTURES: usize = 32;

/// Native calls pass arguments in r0..r3 only.
pub const MAX_NATIVE_ARGS: usize = 4;

/// Locals addressable with an immediate stack offset.
pub const MAX_LOCALS: usize = 127;

/// Procedures with at most this many arguments get a lambda entry point.
pub const MAX_LAMBDA_ARGS: usize = 2;

// ── Collections ──────────────────────────────────────────────────────────────

/// `collection::mk` flag for primitive elements.
pub const COLLECTION_PRIM: i32 = 0;
/// `collection::mk` flag for reference elements.
pub const COLLECTION_REF: i32 = 1;
/// `collection::mk` flag for string elements.
pub const COLLECTION_STRING: i32 = 3;

/// Element flag for an array of `elt`.
pub fn collection_flag(elt: &Type) -> CodegenResult<i32> {
    Ok(if elt.is_string() {
        COLLECTION_STRING
    } else if is_ref_type(elt)? {
        COLLECTION_REF
    } else {
        COLLECTION_PRIM
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindc_types::ast::DeclId;

    #[test]
    fn value_types() {
        for ty in [
            Type::Number,
            Type::Boolean,
            Type::Enum("Direction".into()),
            Type::Void,
            Type::Null,
        ] {
            assert_eq!(is_ref_type(&ty), Ok(false), "{ty}");
        }
    }

    #[test]
    fn reference_types() {
        let func = Type::Function {
            params: vec![],
            ret: Box::new(Type::Void),
        };
        for ty in [
            Type::String,
            Type::Array(Box::new(Type::Number)),
            Type::Class(DeclId(3)),
            func,
        ] {
            assert_eq!(is_ref_type(&ty), Ok(true), "{ty}");
        }
    }

    #[test]
    fn generics_are_rejected() {
        let map = Type::Generic {
            name: "Map".into(),
            args: vec![Type::String, Type::Number],
        };
        assert!(matches!(is_ref_type(&map), Err(CodegenError::UnsupportedType(_))));
        assert!(matches!(
            is_ref_type(&Type::Array(Box::new(Type::Any))),
            Err(CodegenError::UnsupportedType(_))
        ));
    }

    #[test]
    fn collection_flags() {
        assert_eq!(collection_flag(&Type::String), Ok(COLLECTION_STRING));
        assert_eq!(collection_flag(&Type::Class(DeclId(0))), Ok(COLLECTION_REF));
        assert_eq!(collection_flag(&Type::Boolean), Ok(COLLECTION_PRIM));
    }

    #[test]
    fn enums_compare_as_numbers() {
        assert_eq!(TypeClass::of(&Type::Enum("E".into())), Ok(TypeClass::Number));
        assert_eq!(TypeClass::of(&Type::Null), Ok(TypeClass::Null));
    }
}
