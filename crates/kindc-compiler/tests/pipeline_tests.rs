//! End-to-end pipeline tests: declaration tree → assembly → encoder → hex.
//!
//! Tests validate:
//! - A valid program yields a patched image, a listing and a source map
//! - The short form holds the code records only
//! - Lowering, native resolution and encoder faults surface as structured errors
//! - Fault reports are capped, with the total still counted
//! - Results serialize to JSON and back
//! - Templates and extensions load from their JSON descriptions
//! - Compilation is deterministic across 100 runs

use std::collections::HashSet;

use kindc_codegen::hexfile::{encode_record, Record, RECORD_DATA, RECORD_EXTENDED_LINEAR};
use kindc_codegen::source_map::FuncKind;
use kindc_codegen::types::JMP_START_SIGNATURE;
use kindc_codegen::{CodegenError, CodegenResult, ExtensionInfo, NativeKind, NativeSpec, TemplateInfo};
use kindc_compiler::{
    compile, compile_to_hex, load_template, Assembled, Assembler, CompileOptions, CompileResult,
    ExternalLabels, HexTemplate,
};
use kindc_types::ast::{BinOp, Expr, Program, Stmt, Type};
use kindc_types::{ErrorCode, ProgramBuilder, MAX_ERRORS};

// ══════════════════════════════════════════════════════════════════════════════
// Fixtures
// ══════════════════════════════════════════════════════════════════════════════

/// Stands in for the instruction encoder: one half-word per instruction,
/// derived from its text. Calls must target a label or an external.
#[derive(Default)]
struct FakeAssembler {
    runs: usize,
}

impl Assembler for FakeAssembler {
    fn assemble(&mut self, source: &str, externals: &dyn ExternalLabels) -> CodegenResult<Assembled> {
        self.runs += 1;
        let labels: HashSet<&str> = source
            .lines()
            .filter_map(|l| l.trim().strip_suffix(':'))
            .collect();

        let mut out = Assembled::default();
        for raw in source.lines() {
            let line = raw.split(';').next().unwrap_or_default().trim();
            if line.is_empty() || line.ends_with(':') || line.starts_with('.') || line.starts_with('@') {
                continue;
            }
            if let Some(target) = line.strip_prefix("bl ") {
                let target = target.trim();
                if !labels.contains(target) && externals.lookup(target).is_none() {
                    return Err(CodegenError::Assembly(format!("unknown label {target}")));
                }
            }
            let word = line
                .bytes()
                .fold(0u16, |acc, b| acc.wrapping_mul(31).wrapping_add(u16::from(b)));
            out.listing
                .push_str(&format!("{:05x} {word:04x} {line}\n", 2 * out.code.len()));
            out.code.push(word);
        }
        Ok(out)
    }
}

struct BrokenAssembler;

impl Assembler for BrokenAssembler {
    fn assemble(&mut self, _: &str, _: &dyn ExternalLabels) -> CodegenResult<Assembled> {
        Err(CodegenError::Assembly("encoder crashed".into()))
    }
}

const NATIVES: &[(&str, NativeKind, u8)] = &[
    ("bitvm::incr", NativeKind::Function, 1),
    ("bitvm::decr", NativeKind::Procedure, 1),
    ("number::add", NativeKind::Function, 2),
    ("basic::showNumber", NativeKind::Procedure, 1),
];

fn data(addr: u16, bytes: &[u8]) -> String {
    let mut all = vec![bytes.len() as u8, (addr >> 8) as u8, addr as u8, RECORD_DATA];
    all.extend_from_slice(bytes);
    encode_record(&all)
}

fn template_info(natives: &[(&str, NativeKind, u8)]) -> TemplateInfo {
    let mut table: Vec<u8> = (0..natives.len() as u32)
        .flat_map(|i| (0x3_0001 + 0x100 * i).to_le_bytes())
        .collect();
    table.resize(16, 0);
    TemplateInfo {
        hex: vec![
            encode_record(&[0x02, 0x00, 0x00, RECORD_EXTENDED_LINEAR, 0x00, 0x03]),
            data(0xBFD0, &JMP_START_SIGNATURE),
            data(0xBFE0, &table),
            data(0xBFF0, &[0; 16]),
            data(0xC000, &[0xFF; 16]),
            ":00000001FF".to_string(),
        ],
        functions: natives
            .iter()
            .map(|&(name, kind, args)| NativeSpec {
                name: name.to_string(),
                kind,
                args,
            })
            .collect(),
        enums: Default::default(),
    }
}

fn template() -> HexTemplate {
    HexTemplate::load(&template_info(NATIVES), &ExtensionInfo::default()).unwrap()
}

/// function add(a, b) { return a + b; } showNumber(add(2, 3));
fn sample() -> Program {
    let mut b = ProgramBuilder::new();
    let show = b.native("showNumber", &[("v", Type::Number)], Type::Void, "basic::showNumber");
    let add = b.begin_function("add", &[("a", Type::Number), ("b", Type::Number)], Type::Number);
    let (pa, pb) = (b.param(add, 0), b.param(add, 1));
    let sum = Expr::binary(BinOp::Add, b.ident(pa), b.ident(pb));
    b.end_function(vec![Stmt::ret(Some(sum))]);
    let call = b.call_decl(add, vec![Expr::number(2), Expr::number(3)]);
    let body = vec![Stmt::func(add), Stmt::expr(b.call_decl(show, vec![call]))];
    b.finish(body)
}

fn run(program: &Program, options: &CompileOptions) -> CompileResult {
    compile(program, &template(), &mut FakeAssembler::default(), options)
}

// ══════════════════════════════════════════════════════════════════════════════
// Success
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn sample_compiles_to_a_patched_image() {
    let info = template_info(NATIVES);
    let mut asm = FakeAssembler::default();
    let result = compile(&sample(), &template(), &mut asm, &CompileOptions::default());
    assert!(result.success, "{:?}", result.errors);
    assert!(!result.errors.has_errors());
    assert_eq!(asm.runs, 1);

    let out = result.output.unwrap();
    assert!(out.code_size > 0);
    assert_eq!(out.globals, 0);
    assert_eq!(out.hex.len(), info.hex.len() + out.code_size.div_ceil(8));
    assert_eq!(out.hex[0], info.hex[0]);
    assert_ne!(out.hex[1], info.hex[1]);
    assert_eq!(out.hex.last(), info.hex.last());
    assert!(out.source.contains("; program hash"));
    assert!(out.listing.lines().count() == out.code_size);

    let kinds: Vec<_> = out.source_map.entries.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![FuncKind::Main, FuncKind::Function]);
    assert_eq!(out.source_map.entries[1].name, "add");
}

#[test]
fn short_form_holds_code_only() {
    let options = CompileOptions {
        short_form: true,
        ..Default::default()
    };
    let hex = compile_to_hex(&sample(), &template(), &mut FakeAssembler::default(), &options).unwrap();
    for (i, line) in hex.iter().enumerate() {
        let rec = Record::parse(line).unwrap();
        assert_eq!(rec.kind, RECORD_DATA);
        assert_eq!(u32::from(rec.addr), 0xC000 + 16 * i as u32);
    }
}

#[test]
fn compilation_is_deterministic() {
    let program = sample();
    let options = CompileOptions::default();
    let reference = run(&program, &options);
    assert!(reference.success);
    for _ in 0..100 {
        assert_eq!(run(&program, &options), reference);
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Faults
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn lowering_faults_are_structured() {
    let program = ProgramBuilder::new().finish(vec![Stmt::unsupported("ForOfStatement")]);
    let options = CompileOptions {
        file_name: "game.ts".into(),
        ..Default::default()
    };
    let result = run(&program, &options);
    assert!(!result.success);
    assert!(result.output.is_none());
    assert_eq!(result.errors.total_errors, 1);
    let err = &result.errors.errors[0];
    assert_eq!(err.code, ErrorCode::UNSUPPORTED_SYNTAX);
    assert_eq!(err.file, "game.ts");
    assert_eq!(err.node.as_deref(), Some("ForOfStatement"));
}

#[test]
fn natives_missing_from_the_template_are_unresolved() {
    let small = HexTemplate::load(&template_info(&NATIVES[..2]), &ExtensionInfo::default()).unwrap();
    let result = compile(
        &sample(),
        &small,
        &mut FakeAssembler::default(),
        &CompileOptions::default(),
    );
    assert!(!result.success);
    assert!(result
        .errors
        .errors
        .iter()
        .all(|e| e.code == ErrorCode::UNRESOLVED_NATIVE));
}

#[test]
fn encoder_faults_are_reported() {
    let result = compile(&sample(), &template(), &mut BrokenAssembler, &CompileOptions::default());
    assert!(!result.success);
    assert_eq!(result.errors.errors[0].code, ErrorCode::ASSEMBLY_FAILED);
    assert!(result.errors.errors[0].message.contains("encoder crashed"));
}

#[test]
fn fault_reports_are_capped() {
    let body = (0..MAX_ERRORS + 5)
        .map(|_| Stmt::unsupported("WithStatement"))
        .collect();
    let result = run(&ProgramBuilder::new().finish(body), &CompileOptions::default());
    assert_eq!(result.errors.errors.len(), MAX_ERRORS);
    assert_eq!(result.errors.total_errors, MAX_ERRORS + 5);
}

// ══════════════════════════════════════════════════════════════════════════════
// JSON
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn results_round_trip_through_json() {
    let ok = run(&sample(), &CompileOptions::default());
    let json = serde_json::to_string(&ok).unwrap();
    assert!(json.contains("\"success\":true"));
    let back: CompileResult = serde_json::from_str(&json).unwrap();
    assert_eq!(back, ok);

    let bad = run(
        &ProgramBuilder::new().finish(vec![Stmt::unsupported("WithStatement")]),
        &CompileOptions::default(),
    );
    let json = serde_json::to_string(&bad).unwrap();
    assert!(json.contains("\"output\":null"));
    assert!(json.contains("\"total_errors\":1"));
}

#[test]
fn templates_load_from_json() {
    // Four table words; the extension supplies the last native.
    let mut info = template_info(NATIVES);
    info.functions.pop();
    info.enums.insert("Button.A".into(), 1);
    let template_json = serde_json::to_string(&info).unwrap();
    let extension_json = r#"{
        "functions": [{ "name": "basic::showNumber", "type": "P", "args": 1 }],
        "sha": "0123456789abcdef0123"
    }"#;

    let t = load_template(&template_json, Some(extension_json)).unwrap();
    assert_eq!(t.natives().get("basic::showNumber").unwrap().value, 0x3_0300);
    assert_eq!(t.natives().get("Button.A").unwrap().value, 1);
    assert_eq!(t.hash_hex(), "0123456789ABCDEF");

    let plain = load_template(&template_json, None).unwrap();
    assert!(plain.natives().get("basic::showNumber").is_none());
    assert_ne!(plain.hash_hex(), t.hash_hex());

    assert!(matches!(
        load_template("{", None),
        Err(CodegenError::InvalidTemplate(_))
    ));
}
