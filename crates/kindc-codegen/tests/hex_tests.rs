//! Intel-hex template tests.
//!
//! Tests validate:
//! - Every emitted record carries a checksum that zeroes its byte sum
//! - Code records hold the code half-words in order, at consecutive addresses
//! - Patching leaves the template itself untouched and is repeatable
//! - Native resolution is deterministic across loads

use std::collections::BTreeMap;

use kindc_codegen::hexfile::{checksum, encode_record, Record, RECORD_DATA, RECORD_EXTENDED_LINEAR};
use kindc_codegen::types::JMP_START_SIGNATURE;
use kindc_codegen::{ExtensionInfo, HexTemplate, NativeKind, NativeSpec, TemplateInfo};
use proptest::prelude::*;

// ══════════════════════════════════════════════════════════════════════════════
// Helpers
// ══════════════════════════════════════════════════════════════════════════════

fn data(addr: u16, bytes: &[u8]) -> String {
    let mut all = vec![bytes.len() as u8, (addr >> 8) as u8, addr as u8, RECORD_DATA];
    all.extend_from_slice(bytes);
    encode_record(&all)
}

fn table(words: &[u32]) -> Vec<u8> {
    let mut out: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    out.resize(16, 0);
    out
}

fn template_info() -> TemplateInfo {
    TemplateInfo {
        hex: vec![
            encode_record(&[0x02, 0x00, 0x00, RECORD_EXTENDED_LINEAR, 0x00, 0x03]),
            data(0xBFD0, &JMP_START_SIGNATURE),
            data(0xBFE0, &table(&[0x31001, 0x31201, 0x32001])),
            data(0xBFF0, &[0x77; 16]),
            data(0xC000, &[0xFF; 16]),
            data(0xC010, &[0xFF; 16]),
            ":00000001FF".to_string(),
        ],
        functions: vec![
            NativeSpec {
                name: "basic::showNumber".into(),
                kind: NativeKind::Procedure,
                args: 1,
            },
            NativeSpec {
                name: "basic::pause".into(),
                kind: NativeKind::Procedure,
                args: 1,
            },
            NativeSpec {
                name: "input::buttonIsPressed".into(),
                kind: NativeKind::Function,
                args: 1,
            },
        ],
        enums: BTreeMap::from([("Button.B".to_string(), 2)]),
    }
}

fn load() -> HexTemplate {
    HexTemplate::load(&template_info(), &ExtensionInfo::default()).unwrap()
}

fn line_bytes(line: &str) -> Vec<u8> {
    hex::decode(line.trim_start_matches(':')).unwrap()
}

/// Data bytes of the code records, in order, with their absolute addresses.
/// Short-form output carries no leading address record, so resolution
/// starts from the upper half of the bytecode start.
fn code_records(t: &HexTemplate, lines: &[String]) -> Vec<(u32, Vec<u8>)> {
    let mut upper = t.bytecode_start() >> 16;
    let mut out = Vec::new();
    for line in lines {
        let rec = Record::parse(line).unwrap();
        match rec.kind {
            RECORD_EXTENDED_LINEAR => {
                upper = u32::from(u16::from_be_bytes([rec.data[0], rec.data[1]]));
            }
            RECORD_DATA => out.push(((upper << 16) | u32::from(rec.addr), rec.data)),
            _ => {}
        }
    }
    out
}

// ══════════════════════════════════════════════════════════════════════════════
// Records
// ══════════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn checksum_zeroes_the_byte_sum(bytes in prop::collection::vec(any::<u8>(), 1..40)) {
        let sum = bytes.iter().fold(checksum(&bytes), |acc, &b| acc.wrapping_add(b));
        prop_assert_eq!(sum, 0);
    }

    #[test]
    fn encoded_records_parse(
        addr in any::<u16>(),
        payload in prop::collection::vec(any::<u8>(), 0..17),
    ) {
        let mut bytes = vec![payload.len() as u8, (addr >> 8) as u8, addr as u8, RECORD_DATA];
        bytes.extend_from_slice(&payload);
        let line = encode_record(&bytes);
        prop_assert!(line.starts_with(':'));
        prop_assert_eq!(line.to_uppercase(), line.clone());
        let rec = Record::parse(&line).unwrap();
        prop_assert_eq!(rec.addr, addr);
        prop_assert_eq!(rec.kind, RECORD_DATA);
        prop_assert_eq!(rec.data, payload);
    }

    #[test]
    fn code_lands_in_order(code in prop::collection::vec(any::<u16>(), 0..400)) {
        let t = load();
        let lines = t.patch(&code, 0, true).unwrap();
        for line in &lines {
            let sum = line_bytes(line).iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
            prop_assert_eq!(sum, 0, "bad checksum in {}", line);
        }

        let records = code_records(&t, &lines);
        prop_assert_eq!(records.len(), code.len().div_ceil(8));
        let mut image = Vec::new();
        for (i, (addr, bytes)) in records.iter().enumerate() {
            prop_assert_eq!(*addr, t.bytecode_start() + 16 * i as u32);
            image.extend_from_slice(bytes);
        }
        let expected: Vec<u8> = code.iter().flat_map(|w| w.to_le_bytes()).collect();
        prop_assert_eq!(&image[..expected.len()], &expected[..]);
        prop_assert!(image[expected.len()..].iter().all(|&b| b == 0));
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Patching
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn patching_keeps_the_template() {
    let info = template_info();
    let t = load();
    let code: Vec<u16> = (0..20).collect();
    let first = t.patch(&code, 3, false).unwrap();
    let second = t.patch(&code, 3, false).unwrap();
    assert_eq!(first, second);

    // Everything before the jump-start and after the code region is verbatim.
    assert_eq!(first[0], info.hex[0]);
    assert_eq!(first[2], info.hex[2]);
    assert_eq!(&first[first.len() - 3..], &info.hex[4..]);
    // The jump-start record now holds the header.
    let header = Record::parse(&first[1]).unwrap();
    assert_eq!(&header.data[..4], &[0x07, 0x42, 3, 0]);

    // A different program patches the same template.
    let other = t.patch(&[1, 2, 3], 0, false).unwrap();
    assert_eq!(other[0], first[0]);
    assert_ne!(other[1], first[1]);
}

#[test]
fn code_after_64k_gets_an_address_record() {
    let t = load();
    // 0x3C000 + 16 * 0x400 = 0x40000
    let code = vec![0xBEEF; 8 * 0x401];
    let lines = t.patch(&code, 0, true).unwrap();
    let uppers: Vec<_> = lines
        .iter()
        .map(|l| Record::parse(l).unwrap())
        .filter(|r| r.kind == RECORD_EXTENDED_LINEAR)
        .collect();
    assert_eq!(uppers.len(), 1);
    assert_eq!(uppers[0].data, vec![0x00, 0x04]);
    let records = code_records(&t, &lines);
    assert_eq!(records.last().unwrap().0, 0x40000);
}

// ══════════════════════════════════════════════════════════════════════════════
// Resolution
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn resolution_is_deterministic() {
    let reference = load();
    for _ in 0..100 {
        assert_eq!(load(), reference);
    }
    let natives = reference.natives();
    assert_eq!(natives.get("basic::showNumber").unwrap().value, 0x31000);
    assert_eq!(natives.get("basic::pause").unwrap().value, 0x31200);
    assert_eq!(natives.get("input::buttonIsPressed").unwrap().arity, 1);
    assert_eq!(natives.get("Button.B").unwrap().value, 2);
}

#[test]
fn template_hash_tracks_the_records() {
    let a = load();
    let mut info = template_info();
    info.hex[5] = data(0xC010, &[0xEE; 16]);
    let b = HexTemplate::load(&info, &ExtensionInfo::default()).unwrap();
    assert_ne!(a.hash_hex(), b.hash_hex());
    assert_eq!(a.hash_hex().len(), 16);
}
