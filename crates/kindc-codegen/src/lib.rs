//! kindc code generator: typed declaration tree → Thumb assembly → patched
//! firmware image.
//!
//! # Architecture
//!
//! ```text
//!  Program ──▶ usage ──▶ lowering (expr/stmt/call/func) ──▶ IR procedures
//!                                                             │
//!                 backend (stack discipline, native ABI) ◀────┘
//!                    │
//!                    ▼
//!  Binary::serialize ──▶ Assembler ──▶ half-words ──▶ HexTemplate::patch
//! ```
//!
//! ## Value representation
//!
//! Every value is one machine word. Numbers and booleans are immediate;
//! strings, arrays, records, boxes and actions are pointers to
//! reference-counted heap objects (statics carry a `0xffff` count and are
//! never freed). Every reference-typed expression yields an owned
//! reference; the code that consumes it is responsible for dropping it.
//!
//! ## Natives
//!
//! Everything beyond control flow and stack traffic is a call into the
//! firmware runtime, resolved by name against the [`NativeTable`] a
//! [`HexTemplate`] exports. See [`runtime`] for the calling convention.

pub mod backend;
pub mod binary;
pub mod call;
pub mod compiler;
pub mod error;
pub mod expr;
pub mod func;
pub mod hexfile;
pub mod ir;
pub mod runtime;
pub mod sim;
pub mod source_map;
pub mod stack;
pub mod stmt;
pub mod types;
pub mod usage;

pub use binary::{patch_src_hash, Assembled, Assembler, Binary, ExternalLabels};
pub use compiler::{compile_program, CodegenOptions, CompileContext};
pub use error::{CodegenError, CodegenResult};
pub use hexfile::{ExtensionInfo, HexTemplate, TemplateInfo};
pub use runtime::{NativeDescriptor, NativeKind, NativeSpec, NativeTable};
pub use sim::{SimError, Simulator};
pub use source_map::SourceMap;
