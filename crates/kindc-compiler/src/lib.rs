//! kindc compiler: orchestrates the full compilation pipeline.
//!
//! ```text
//! Program → lowering → backend → assembly source → Assembler → HexTemplate::patch → .hex
//! ```
//!
//! The instruction encoder is supplied by the caller through the
//! [`Assembler`] trait; everything else runs here.

pub mod options;

use kindc_codegen::{compile_program, patch_src_hash, CodegenError, CodegenResult, ExtensionInfo, TemplateInfo};
use kindc_types::ast::Program;
use kindc_types::{CompileError, CompileErrors};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

pub use kindc_codegen::{Assembled, Assembler, ExternalLabels, HexTemplate, SourceMap};
pub use options::CompileOptions;

/// Everything a successful compilation produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileOutput {
    /// Intel-hex records, ready to flash.
    pub hex: Vec<String>,
    /// Assembly source as fed to the encoder.
    pub source: String,
    pub listing: String,
    pub glue: String,
    pub source_map: SourceMap,
    /// Code size in half-words.
    pub code_size: usize,
    pub globals: usize,
}

/// Structured result of a compilation, suitable for JSON hand-off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileResult {
    pub success: bool,
    pub output: Option<CompileOutput>,
    pub errors: CompileErrors,
}

impl CompileResult {
    fn failed(errors: CompileErrors) -> Self {
        Self {
            success: false,
            output: None,
            errors,
        }
    }
}

/// Load a template and an optional extension from their JSON descriptions.
pub fn load_template(template_json: &str, extension_json: Option<&str>) -> CodegenResult<HexTemplate> {
    let template = TemplateInfo::from_json(template_json)?;
    let extension = match extension_json {
        Some(json) => ExtensionInfo::from_json(json)?,
        None => ExtensionInfo::default(),
    };
    HexTemplate::load(&template, &extension)
}

/// Compile `program` against `template`.
pub fn compile(
    program: &Program,
    template: &HexTemplate,
    assembler: &mut dyn Assembler,
    options: &CompileOptions,
) -> CompileResult {
    info!(
        file = %options.file_name,
        decls = program.decls.len(),
        short_form = options.short_form,
        "compiling"
    );
    let natives = template.natives();

    let mut bin = match compile_program(program, natives, &options.codegen()) {
        Ok(bin) => bin,
        Err(faults) => return CompileResult::failed(collect(faults)),
    };

    let source = patch_src_hash(&bin.serialize(&template.hash_hex()));
    let fault = |err: CodegenError| -> CompileResult {
        CompileResult::failed(collect(vec![err.at(&options.file_name, program.span)]))
    };
    if let Err(err) = bin.assemble(assembler, natives, template.bytecode_start(), &source) {
        return fault(err);
    }
    let globals = bin.num_globals();
    let hex = match template.patch(&bin.buf, globals, options.short_form) {
        Ok(hex) => hex,
        Err(err) => return fault(err),
    };

    info!(
        procs = bin.procs.len(),
        code_size = bin.buf.len(),
        literals = bin.literals.len(),
        globals,
        "compiled"
    );
    let source_map = SourceMap::from_binary(&bin);
    CompileResult {
        success: true,
        output: Some(CompileOutput {
            hex,
            source,
            listing: std::mem::take(&mut bin.listing),
            glue: std::mem::take(&mut bin.glue),
            source_map,
            code_size: bin.buf.len(),
            globals,
        }),
        errors: CompileErrors::empty(),
    }
}

/// Compile and return only the hex records.
pub fn compile_to_hex(
    program: &Program,
    template: &HexTemplate,
    assembler: &mut dyn Assembler,
    options: &CompileOptions,
) -> Result<Vec<String>, CompileErrors> {
    let result = compile(program, template, assembler, options);
    match result.output {
        Some(out) => Ok(out.hex),
        None => Err(result.errors),
    }
}

fn collect(faults: Vec<CompileError>) -> CompileErrors {
    let errors: CompileErrors = faults.into_iter().collect();
    if errors.has_internal() {
        error!(total = errors.total_errors, "internal compiler fault");
    }
    if errors.total_errors > errors.errors.len() {
        warn!(
            total = errors.total_errors,
            kept = errors.errors.len(),
            "dropping faults beyond the report limit"
        );
    }
    errors
}
