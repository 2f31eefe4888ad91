//! Firmware template: native resolution and code patching.
//!
//! A template is an Intel-hex record stream of a firmware image built with
//! a placeholder region for compiled code. Loading it finds three things:
//!
//! - the **jump-start** record, identified by its data bytes, which the
//!   program header overwrites;
//! - the **bytecode start**, the first 16-byte boundary at or above
//!   [`BYTECODE_THRESHOLD`];
//! - the **function table**, one little-endian word per native, in the
//!   records right after the jump-start.
//!
//! Patching writes the header and the code records and keeps everything
//! else of the template verbatim.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{CodegenError, CodegenResult};
use crate::runtime::{NativeDescriptor, NativeSpec, NativeTable};
use crate::types::{BYTECODE_THRESHOLD, HEADER_OPCODE, JMP_START_SIGNATURE, MAX_CODE_HALFWORDS};

// ══════════════════════════════════════════════════════════════════════════════
// Inputs
// ══════════════════════════════════════════════════════════════════════════════

/// The pre-built firmware image and the natives it exports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateInfo {
    pub hex: Vec<String>,
    #[serde(default)]
    pub functions: Vec<NativeSpec>,
    #[serde(default)]
    pub enums: BTreeMap<String, i32>,
}

/// Natives contributed by an extension, appended to the template table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtensionInfo {
    #[serde(default)]
    pub functions: Vec<NativeSpec>,
    #[serde(default)]
    pub enums: BTreeMap<String, i32>,
    /// Identity of the extension build; also the template hash.
    #[serde(default)]
    pub sha: String,
}

impl TemplateInfo {
    pub fn from_json(json: &str) -> CodegenResult<Self> {
        serde_json::from_str(json).map_err(|e| CodegenError::InvalidTemplate(e.to_string()))
    }
}

impl ExtensionInfo {
    pub fn from_json(json: &str) -> CodegenResult<Self> {
        serde_json::from_str(json).map_err(|e| CodegenError::InvalidTemplate(e.to_string()))
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Records
// ══════════════════════════════════════════════════════════════════════════════

pub const RECORD_DATA: u8 = 0x00;
pub const RECORD_EXTENDED_LINEAR: u8 = 0x04;

/// One decoded `:LLAAAATT<data>CC` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub addr: u16,
    pub kind: u8,
    pub data: Vec<u8>,
}

impl Record {
    pub fn parse(line: &str) -> CodegenResult<Self> {
        let body = line
            .trim()
            .strip_prefix(':')
            .ok_or_else(|| CodegenError::InvalidTemplate(format!("not a hex record: {line}")))?;
        let bytes = hex::decode(body)
            .map_err(|e| CodegenError::InvalidTemplate(format!("bad record {line}: {e}")))?;
        if bytes.len() < 5 || bytes.len() != bytes[0] as usize + 5 {
            return Err(CodegenError::InvalidTemplate(format!(
                "record length does not match its data: {line}"
            )));
        }
        Ok(Self {
            addr: u16::from_be_bytes([bytes[1], bytes[2]]),
            kind: bytes[3],
            data: bytes[4..bytes.len() - 1].to_vec(),
        })
    }
}

/// Two's complement of the byte sum.
pub fn checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    sum.wrapping_neg()
}

/// Encode `bytes` (length, address, type and data) as a record line.
pub fn encode_record(bytes: &[u8]) -> String {
    let mut all = bytes.to_vec();
    all.push(checksum(bytes));
    format!(":{}", hex::encode_upper(all))
}

fn data_record(addr: u32, halfwords: &[u16]) -> String {
    let mut bytes = vec![0x10, (addr >> 8) as u8, addr as u8, RECORD_DATA];
    for i in 0..8 {
        let w = halfwords.get(i).copied().unwrap_or(0);
        bytes.extend_from_slice(&w.to_le_bytes());
    }
    encode_record(&bytes)
}

fn upper_record(upper: u32) -> String {
    encode_record(&[0x02, 0x00, 0x00, RECORD_EXTENDED_LINEAR, (upper >> 8) as u8, upper as u8])
}

// ══════════════════════════════════════════════════════════════════════════════
// Template
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct HexTemplate {
    records: Vec<String>,
    natives: NativeTable,
    jmp_start_addr: u32,
    jmp_start_idx: usize,
    bytecode_start_addr: u32,
    bytecode_start_idx: usize,
    hash: [u8; 8],
}

impl HexTemplate {
    pub fn load(template: &TemplateInfo, extension: &ExtensionInfo) -> CodegenResult<Self> {
        let mut records = template.hex.clone();

        let mut upper = 0u32;
        let mut last: Option<(usize, u32)> = None;
        let mut bytecode_start = None;
        let mut jmp_start = None;
        for i in 0..records.len() {
            let rec = Record::parse(&records[i])?;
            if rec.kind == RECORD_EXTENDED_LINEAR && rec.data.len() == 2 {
                upper = u32::from(u16::from_be_bytes([rec.data[0], rec.data[1]]));
            }
            if rec.kind != RECORD_DATA {
                continue;
            }
            let addr = (upper << 16) | u32::from(rec.addr);
            if bytecode_start.is_none() && addr >= BYTECODE_THRESHOLD {
                let (last_idx, last_addr) = last.ok_or_else(|| {
                    CodegenError::InvalidTemplate(format!(
                        "no data record before the code region at {addr:#x}"
                    ))
                })?;
                records[last_idx] = pad_record(&records[last_idx])?;
                if last_addr & 0xf != 0 {
                    return Err(CodegenError::InvalidTemplate(format!(
                        "record before the code region is not 16-byte aligned: {last_addr:#x}"
                    )));
                }
                bytecode_start = Some((last_addr + 16, last_idx + 1));
            }
            last = Some((i, addr));
            if rec.data == JMP_START_SIGNATURE {
                jmp_start = Some((addr, i));
            }
        }

        let (jmp_start_addr, jmp_start_idx) = jmp_start
            .ok_or_else(|| CodegenError::MissingTemplateMarker("no jump-start record".into()))?;
        let (bytecode_start_addr, bytecode_start_idx) = bytecode_start
            .ok_or_else(|| CodegenError::MissingTemplateMarker("no code region".into()))?;
        if jmp_start_idx >= bytecode_start_idx {
            return Err(CodegenError::InvalidTemplate(
                "jump-start record lies inside the code region".into(),
            ));
        }

        let natives = resolve_natives(&records, jmp_start_idx, template, extension)?;
        let hash = template_hash(template, extension)?;
        debug!(
            natives = natives.len(),
            bytecode_start = bytecode_start_addr,
            jmp_start = jmp_start_addr,
            "template loaded"
        );

        Ok(Self {
            records,
            natives,
            jmp_start_addr,
            jmp_start_idx,
            bytecode_start_addr,
            bytecode_start_idx,
            hash,
        })
    }

    pub fn natives(&self) -> &NativeTable {
        &self.natives
    }

    pub fn bytecode_start(&self) -> u32 {
        self.bytecode_start_addr
    }

    /// The 16 hex digits identifying this template in program headers.
    pub fn hash_hex(&self) -> String {
        hex::encode_upper(self.hash)
    }

    /// Splice `code` into the template.
    ///
    /// The short form holds only the code records, for previews.
    pub fn patch(&self, code: &[u16], globals: usize, short_form: bool) -> CodegenResult<Vec<String>> {
        if code.len() >= MAX_CODE_HALFWORDS {
            return Err(CodegenError::TemplateOverflow(format!(
                "{} half-words of code; the limit is {MAX_CODE_HALFWORDS}",
                code.len()
            )));
        }
        let globals = u16::try_from(globals)
            .map_err(|_| CodegenError::LimitExceeded(format!("{globals} globals")))?;

        let mut out = Vec::new();
        if !short_form {
            let bcs = self.bytecode_start_addr;
            let mut header = vec![HEADER_OPCODE, globals, bcs as u16, (bcs >> 16) as u16];
            header.extend(self.hash.chunks(2).map(|p| u16::from_le_bytes([p[0], p[1]])));
            out.extend_from_slice(&self.records[..self.bytecode_start_idx]);
            out[self.jmp_start_idx] = data_record(self.jmp_start_addr, &header);
        }

        let mut addr = self.bytecode_start_addr;
        let mut upper = (addr - 16) >> 16;
        for chunk in code.chunks(8) {
            if addr >> 16 != upper {
                upper = addr >> 16;
                out.push(upper_record(upper));
            }
            out.push(data_record(addr, chunk));
            addr += 16;
        }

        if !short_form {
            out.extend_from_slice(&self.records[self.bytecode_start_idx..]);
        }
        Ok(out)
    }
}

/// Extend a short data record to 16 bytes with zeros.
fn pad_record(line: &str) -> CodegenResult<String> {
    let rec = Record::parse(line)?;
    if rec.data.len() == 16 {
        return Ok(line.to_string());
    }
    let mut bytes = vec![0x10, (rec.addr >> 8) as u8, rec.addr as u8, rec.kind];
    bytes.extend_from_slice(&rec.data);
    bytes.resize(20, 0);
    Ok(encode_record(&bytes))
}

/// Read one address per native from the records after the jump-start.
fn resolve_natives(
    records: &[String],
    jmp_start_idx: usize,
    template: &TemplateInfo,
    extension: &ExtensionInfo,
) -> CodegenResult<NativeTable> {
    let mut table = NativeTable::new();
    for (name, &value) in extension.enums.iter().chain(template.enums.iter()) {
        table.insert_enum(name, value);
    }

    let mut pending = template.functions.iter().chain(extension.functions.iter());
    let mut next = pending.next();
    for line in &records[jmp_start_idx + 1..] {
        let rec = Record::parse(line)?;
        if rec.kind != RECORD_DATA || rec.data.len() != 16 {
            continue;
        }
        for word in rec.data.chunks(4) {
            let Some(spec) = next else {
                return Ok(table);
            };
            let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]) & !1;
            if value == 0 {
                return Err(CodegenError::UnresolvedNative(format!(
                    "{} has no address in the template",
                    spec.name
                )));
            }
            table.insert(NativeDescriptor {
                name: spec.name.clone(),
                kind: spec.kind,
                arity: spec.args,
                value,
            });
            next = pending.next();
        }
    }
    match next {
        None => Ok(table),
        Some(spec) => Err(CodegenError::InvalidTemplate(format!(
            "function table ends before {}",
            spec.name
        ))),
    }
}

fn template_hash(template: &TemplateInfo, extension: &ExtensionInfo) -> CodegenResult<[u8; 8]> {
    let mut out = [0u8; 8];
    if extension.sha.is_empty() {
        let mut hasher = Sha256::new();
        for line in &template.hex {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        out.copy_from_slice(&hasher.finalize()[..8]);
    } else {
        let mut digits: String = extension.sha.chars().take(16).collect();
        while digits.len() < 16 {
            digits.push('0');
        }
        hex::decode_to_slice(&digits, &mut out)
            .map_err(|e| CodegenError::InvalidTemplate(format!("bad extension sha: {e}")))?;
    }
    Ok(out)
}
