//! The compilation unit: procedures, cells, literals and the assembled
//! image.
//!
//! A [`Binary`] is rebuilt from scratch on every compiler pass. After the
//! final pass the backend fills in each procedure's text, [`Binary::serialize`]
//! concatenates everything into one assembly source and an [`Assembler`]
//! turns that into half-words.

use std::collections::HashMap;

use kindc_types::ast::DeclId;
use sha2::{Digest, Sha256};

use crate::error::{CodegenError, CodegenResult};
use crate::ir::{Cell, CellId, CellKind, Procedure};
use crate::runtime::NativeTable;
use crate::types::{MAX_LOCALS, PROGRAM_MAGIC, SRCHASH_MARKER};

// ══════════════════════════════════════════════════════════════════════════════
// Assembler interface
// ══════════════════════════════════════════════════════════════════════════════

/// Addresses of symbols defined outside the program.
pub trait ExternalLabels {
    /// Address of `name` relative to the start of the code region.
    fn lookup(&self, name: &str) -> Option<i64>;
}

/// Native primitives resolved from a template.
pub struct NativeLabels<'a> {
    pub natives: &'a NativeTable,
    pub bytecode_start: u32,
}

impl ExternalLabels for NativeLabels<'_> {
    fn lookup(&self, name: &str) -> Option<i64> {
        self.natives.relative_address(name, self.bytecode_start)
    }
}

/// Output of the instruction encoder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assembled {
    pub code: Vec<u16>,
    pub listing: String,
    pub glue: String,
}

/// The target instruction encoder.
pub trait Assembler {
    fn assemble(&mut self, source: &str, externals: &dyn ExternalLabels) -> CodegenResult<Assembled>;
}

// ══════════════════════════════════════════════════════════════════════════════
// Literal pool
// ══════════════════════════════════════════════════════════════════════════════

/// Deduplicated static strings and images.
#[derive(Debug, Default)]
pub struct LiteralPool {
    labels: HashMap<String, String>,
    blocks: Vec<String>,
    next: usize,
}

impl LiteralPool {
    /// Label of the static copy of `s`.
    pub fn string(&mut self, s: &str) -> String {
        let key = format!("s:{s}");
        if let Some(lbl) = self.labels.get(&key) {
            return lbl.clone();
        }
        let lbl = format!("_str{}", self.next);
        self.next += 1;
        let quoted = serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string());
        self.blocks.push(format!(
            "\n.balign 4\n{lbl}meta: .short 0xffff, {}\n{lbl}: .string {quoted}\n",
            s.len()
        ));
        self.labels.insert(key, lbl.clone());
        lbl
    }

    /// Label of the static image described by `text`.
    ///
    /// Each non-blank line is one row; `0 . _` are off pixels and `1 # *`
    /// are on. Whitespace is ignored. An empty literal is a blank 5x5 image.
    pub fn image(&mut self, text: &str) -> CodegenResult<String> {
        let image = encode_image(text)?;
        let key = format!("i:{}x{}:{:?}", image.width, image.height, image.pixels);
        if let Some(lbl) = self.labels.get(&key) {
            return Ok(lbl.clone());
        }
        let lbl = format!("_img{}", self.next);
        self.next += 1;
        let mut bytes = image.pixels.clone();
        while bytes.len() % 4 != 0 {
            bytes.push(42);
        }
        let byte_list = bytes
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.blocks.push(format!(
            "\n.balign 4\n{lbl}: .short 0xffff\n        .short {}, {}\n        .byte {byte_list}\n",
            image.width, image.height
        ));
        self.labels.insert(key, lbl.clone());
        Ok(lbl)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn text(&self) -> String {
        self.blocks.concat()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub width: usize,
    pub height: usize,
    /// Row-major, one byte per pixel.
    pub pixels: Vec<u8>,
}

pub fn encode_image(text: &str) -> CodegenResult<Image> {
    let blank = "0 0 0 0 0\n0 0 0 0 0\n0 0 0 0 0\n0 0 0 0 0\n0 0 0 0 0\n";
    let text = if text.is_empty() { blank } else { text };

    let mut pixels = Vec::new();
    let (mut x, mut width, mut height) = (0usize, 0usize, 0usize);
    for c in text.chars().chain(std::iter::once('\n')) {
        match c {
            '0' | '.' | '_' => {
                pixels.push(0);
                x += 1;
            }
            '1' | '#' | '*' => {
                pixels.push(1);
                x += 1;
            }
            ' ' | '\t' | '\r' => {}
            '\n' => {
                if x > 0 {
                    if width == 0 {
                        width = x;
                    } else if x != width {
                        return Err(CodegenError::UnsupportedSyntax(format!(
                            "lines in image literal have to have the same width (got {width} and then {x} pixels)"
                        )));
                    }
                    x = 0;
                    height += 1;
                }
            }
            other => {
                return Err(CodegenError::UnsupportedSyntax(format!(
                    "only 0 . _ (off) and 1 # * (on) are allowed in image literals, found {other:?}"
                )))
            }
        }
    }
    Ok(Image {
        width,
        height,
        pixels,
    })
}

// ══════════════════════════════════════════════════════════════════════════════
// Binary
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct Binary {
    pub procs: Vec<Procedure>,
    cells: Vec<Cell>,
    globals: Vec<CellId>,
    global_index: HashMap<DeclId, CellId>,
    proc_cells: HashMap<(usize, DeclId), CellId>,
    proc_index: HashMap<DeclId, usize>,
    pub literals: LiteralPool,
    /// Assembled code, in half-words.
    pub buf: Vec<u16>,
    pub listing: String,
    pub glue: String,
}

impl Binary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_proc(&mut self, proc: Procedure) -> usize {
        let idx = self.procs.len();
        if let Some(decl) = proc.decl {
            self.proc_index.insert(decl, idx);
        }
        self.procs.push(proc);
        idx
    }

    pub fn proc(&self, idx: usize) -> &Procedure {
        &self.procs[idx]
    }

    pub fn proc_mut(&mut self, idx: usize) -> &mut Procedure {
        &mut self.procs[idx]
    }

    /// Procedure compiled from function `decl`, if any.
    pub fn proc_for(&self, decl: DeclId) -> Option<&Procedure> {
        self.proc_index.get(&decl).map(|&i| &self.procs[i])
    }

    pub fn cell(&self, id: CellId) -> &Cell {
        &self.cells[id.index()]
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn num_globals(&self) -> usize {
        self.globals.len()
    }

    pub fn global_cell(&self, decl: DeclId) -> Option<CellId> {
        self.global_index.get(&decl).copied()
    }

    pub fn add_global(&mut self, decl: DeclId, name: &str, is_ref: bool) -> CellId {
        if let Some(id) = self.global_cell(decl) {
            return id;
        }
        let id = CellId(self.cells.len() as u32);
        self.cells.push(Cell {
            id,
            decl,
            name: name.to_string(),
            kind: CellKind::Global,
            index: self.globals.len(),
            is_ref,
            boxed: false,
        });
        self.globals.push(id);
        self.global_index.insert(decl, id);
        id
    }

    /// Cell of `decl` in procedure `proc`, if it has one.
    pub fn find_cell(&self, proc: usize, decl: DeclId) -> Option<CellId> {
        self.proc_cells.get(&(proc, decl)).copied()
    }

    /// Add a local, argument or captured cell to procedure `proc`.
    pub fn add_cell(
        &mut self,
        proc: usize,
        decl: DeclId,
        name: &str,
        kind: CellKind,
        is_ref: bool,
        boxed: bool,
    ) -> CodegenResult<CellId> {
        if let Some(id) = self.find_cell(proc, decl) {
            return Ok(id);
        }
        let id = CellId(self.cells.len() as u32);
        let p = &mut self.procs[proc];
        let list = match kind {
            CellKind::Local => &mut p.locals,
            CellKind::Argument => &mut p.args,
            CellKind::Captured => &mut p.captured,
            CellKind::Global => {
                return Err(CodegenError::InternalInvariant(format!(
                    "global {name} added as a procedure cell"
                )))
            }
        };
        if kind == CellKind::Local && list.len() >= MAX_LOCALS {
            return Err(CodegenError::LimitExceeded(format!(
                "too many local variables in {} (at most {MAX_LOCALS})",
                p.name
            )));
        }
        let index = list.len();
        list.push(id);
        self.cells.push(Cell {
            id,
            decl,
            name: name.to_string(),
            kind,
            index,
            is_ref,
            boxed,
        });
        self.proc_cells.insert((proc, decl), id);
        Ok(id)
    }

    /// Full assembly source with the source hash still unpatched.
    pub fn serialize(&self, template_hash: &str) -> String {
        let mut src = format!(
            "; start\n    .hex {PROGRAM_MAGIC} ; magic number\n    .hex {template_hash} ; hex template hash\n    .hex 0000000000000000 ; {SRCHASH_MARKER}\n    .space 16 ; reserved\n"
        );
        for p in &self.procs {
            src.push('\n');
            src.push_str(&p.text);
            src.push('\n');
        }
        src.push_str("_js_end:\n");
        src.push_str(&self.literals.text());
        src.push_str("_program_end:\n");
        src
    }

    /// Run the encoder and keep its output.
    pub fn assemble(
        &mut self,
        assembler: &mut dyn Assembler,
        natives: &NativeTable,
        bytecode_start: u32,
        source: &str,
    ) -> CodegenResult<()> {
        let labels = NativeLabels {
            natives,
            bytecode_start,
        };
        let out = assembler.assemble(source, &labels)?;
        self.buf = out.code;
        self.listing = out.listing;
        self.glue = out.glue;
        Ok(())
    }
}

/// Replace the source-hash placeholder line with the first 8 bytes of the
/// SHA-256 of the whole source.
pub fn patch_src_hash(src: &str) -> String {
    let digest = Sha256::digest(src.as_bytes());
    let hash = hex::encode_upper(&digest[..8]);
    src.lines()
        .map(|line| {
            if line.contains(SRCHASH_MARKER) {
                format!("    .hex {hash} ; program hash")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
        + "\n"
}
