//! Source mapping: procedure label → source location.
//!
//! One entry per compiled procedure, so a fault address resolved to a label
//! by the listing can be traced back to the function it came from.

use serde::{Deserialize, Serialize};

use crate::binary::Binary;
use crate::ir::ProcKind;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMap {
    pub entries: Vec<SourceMapEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMapEntry {
    /// Entry label in the assembly listing.
    pub label: String,
    pub name: String,
    pub kind: FuncKind,
    /// Source span (1-based line/column).
    pub span: kindc_types::Span,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FuncKind {
    /// Top-level statements.
    Main,
    Function,
    Lambda,
    Method,
    Constructor,
}

impl From<ProcKind> for FuncKind {
    fn from(kind: ProcKind) -> Self {
        match kind {
            ProcKind::Root => Self::Main,
            ProcKind::Function => Self::Function,
            ProcKind::Lambda => Self::Lambda,
            ProcKind::Method => Self::Method,
            ProcKind::Constructor => Self::Constructor,
        }
    }
}

impl SourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// One entry per procedure of `bin`, in emission order.
    pub fn from_binary(bin: &Binary) -> Self {
        let mut sm = Self::new();
        for p in &bin.procs {
            sm.push(&p.label, &p.name, p.kind.into(), p.span);
        }
        sm
    }

    pub fn push(
        &mut self,
        label: impl Into<String>,
        name: impl Into<String>,
        kind: FuncKind,
        span: kindc_types::Span,
    ) {
        self.entries.push(SourceMapEntry {
            label: label.into(),
            name: name.into(),
            kind,
            span,
        });
    }

    pub fn find_by_label(&self, label: &str) -> Option<&SourceMapEntry> {
        self.entries.iter().find(|e| e.label == label)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(data: &str) -> Option<Self> {
        serde_json::from_str(data).ok()
    }
}
