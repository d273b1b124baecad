//! Manifest loading, validation and content-addressed artifact generation.
//!
//! A manifest document has two top-level keys, `header` and `body`, and is
//! stored as JSON or YAML, optionally gzip-compressed with a `.gz` suffix.
//!
//! The header checksum covers the decompressed file bytes with every
//! occurrence of the declared tag text blanked out. [`ManifestParser::generate`]
//! serialises the document with an empty checksum, hashes those bytes and
//! then serialises it again with the tag in place.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::error::{VexecError, VexecResult};
use crate::integrity::{IntegrityService, sha256_hex};
use crate::manifest::{Instruction, InstructionKind, Manifest, ManifestHeader};
use crate::types::Checksum;
use crate::utils::{gunzip, gzip, write_atomic};

/// Recognised manifest file extensions (after stripping `.gz`).
pub const MANIFEST_EXTENSIONS: [&str; 3] = ["json", "yaml", "yml"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentFormat {
    Json,
    Yaml,
}

pub struct ManifestParser;

impl ManifestParser {
    /// Load and validate the manifest at `path`.
    pub async fn parse(path: &Path) -> VexecResult<Manifest> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(VexecError::NotFound(path.to_path_buf()));
        }

        let (format, compressed) = Self::detect_format(path)?;
        let mut raw = tokio::fs::read(path).await?;
        if compressed {
            raw = gunzip(&raw)
                .map_err(|e| VexecError::InvalidFormat(format!("gzip decode failed: {e}")))?;
        }

        let document = Self::decode(&raw, format)?;
        let manifest = Self::from_document(document)?;
        if let Some(declared) = &manifest.header.checksum {
            IntegrityService::verify_checksum(declared, &blank_checksum(&raw, declared.as_str()))?;
        }

        debug!(
            "Parsed manifest {} ({} instructions, checksum={})",
            path.display(),
            manifest.body.len(),
            manifest.header.checksum.is_some()
        );
        Ok(manifest)
    }

    /// Build a manifest from an already decoded document. The checksum is
    /// not verified here since it covers the raw bytes.
    pub fn from_document(document: Value) -> VexecResult<Manifest> {
        let Value::Object(root) = document else {
            return Err(VexecError::InvalidFormat(
                "document root must be a key-value object".to_string(),
            ));
        };

        let header = Self::read_header(root.get("header"))?;

        let body = match root.get("body") {
            None | Some(Value::Null) => return Err(VexecError::NoInstructions),
            Some(Value::Array(items)) if items.is_empty() => {
                return Err(VexecError::NoInstructions);
            }
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(index, item)| {
                    serde_json::from_value::<Instruction>(item.clone()).map_err(|e| {
                        VexecError::InvalidFormat(format!("instruction {index}: {e}"))
                    })
                })
                .collect::<VexecResult<Vec<_>>>()?,
            Some(_) => {
                return Err(VexecError::InvalidFormat("`body` must be a list".to_string()));
            }
        };

        Ok(Manifest::new(header, body))
    }

    /// Write `instructions` as a content-addressed artifact under
    /// `output_dir`, using a default header.
    pub async fn generate(output_dir: &Path, instructions: &[Instruction]) -> VexecResult<PathBuf> {
        Self::generate_with_header(output_dir, ManifestHeader::default(), instructions).await
    }

    /// Write a content-addressed artifact with the given header.
    ///
    /// Any checksum already present in `header` is replaced.
    pub async fn generate_with_header(
        output_dir: &Path,
        mut header: ManifestHeader,
        instructions: &[Instruction],
    ) -> VexecResult<PathBuf> {
        if instructions.is_empty() {
            return Err(VexecError::NoInstructions);
        }

        header.checksum = Some(Checksum::new(""));
        let mut signed = Manifest::new(header, instructions.to_vec());
        let checksum = IntegrityService::checksum_tag(&Self::render(&signed)?);

        signed.header.checksum = Some(checksum.clone());
        let mut content = Self::render(&signed)?;

        let compressed = signed.header.is_compressed();
        if compressed {
            content = gzip(&content)?;
        }

        let file_name = if compressed {
            format!("{}.json.gz", sha256_hex(&content))
        } else {
            format!("{}.json", sha256_hex(&content))
        };
        let path = output_dir.join(file_name);
        write_atomic(&path, &content).await?;

        info!(
            "Generated manifest {} ({} instructions, {})",
            path.display(),
            instructions.len(),
            checksum
        );
        Ok(path)
    }

    /// Pretty JSON with a trailing newline, as persisted.
    fn render(manifest: &Manifest) -> VexecResult<Vec<u8>> {
        let mut content = serde_json::to_vec_pretty(&manifest.to_document()?)?;
        content.push(b'\n');
        Ok(content)
    }

    fn read_header(value: Option<&Value>) -> VexecResult<ManifestHeader> {
        let mut header = ManifestHeader::default();
        let fields: &Map<String, Value> = match value {
            None | Some(Value::Null) => return Ok(header),
            Some(Value::Object(fields)) => fields,
            Some(_) => {
                return Err(VexecError::InvalidFormat("`header` must be a key-value object".to_string()));
            }
        };

        for (key, value) in fields {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                Value::Null => continue,
                _ => {
                    return Err(VexecError::InvalidFormat(format!(
                        "header field `{key}` must be a scalar"
                    )));
                }
            };
            if !header.apply(key, text) {
                debug!("Ignoring unknown header field `{}`", key);
            }
        }

        Ok(header)
    }

    fn detect_format(path: &Path) -> VexecResult<(DocumentFormat, bool)> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();

        let (stem, compressed) = match name.strip_suffix(".gz") {
            Some(stem) => (stem, true),
            None => (name.as_str(), false),
        };

        let extension = Path::new(stem)
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();

        let format = match extension.as_str() {
            "json" => DocumentFormat::Json,
            "yaml" | "yml" => DocumentFormat::Yaml,
            other => {
                return Err(VexecError::UnsupportedFormat(format!(
                    "`.{}` (expected one of {})",
                    other,
                    MANIFEST_EXTENSIONS.join(", ")
                )));
            }
        };

        Ok((format, compressed))
    }

    fn decode(raw: &[u8], format: DocumentFormat) -> VexecResult<Value> {
        match format {
            DocumentFormat::Json => serde_json::from_slice(raw)
                .map_err(|e| VexecError::InvalidFormat(format!("JSON decode failed: {e}"))),
            DocumentFormat::Yaml => serde_yaml::from_slice(raw)
                .map_err(|e| VexecError::InvalidFormat(format!("YAML decode failed: {e}"))),
        }
    }
}

/// `raw` with every occurrence of the declared checksum text removed.
fn blank_checksum(raw: &[u8], declared: &str) -> Vec<u8> {
    let needle = declared.as_bytes();
    if needle.is_empty() {
        return raw.to_vec();
    }

    let mut blanked = Vec::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(pos) = rest.windows(needle.len()).position(|window| window == needle) {
        blanked.extend_from_slice(&rest[..pos]);
        rest = &rest[pos + needle.len()..];
    }
    blanked.extend_from_slice(rest);
    blanked
}

/// Demonstration body emitted by `vexec generate` when no source manifest
/// is given. Every instruction runs without network access.
pub fn sample_instructions() -> Vec<Instruction> {
    vec![
        Instruction::new(InstructionKind::Store)
            .with_field("address", "0x0010")
            .with_field("value", json!(42)),
        Instruction::new(InstructionKind::Load)
            .with_field("address", "0x0010")
            .with_field("register", "r0"),
        Instruction::new(InstructionKind::Move)
            .with_field("src", "r0")
            .with_field("dst", "r1"),
        Instruction::new(InstructionKind::Nop),
    ]
}
