// Utility functions and helpers

use std::io::{Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;

use crate::integrity::sha256_hex;

/// Length of the truncated fingerprint printed in log lines.
pub const FINGERPRINT_LEN: usize = 16;

/// Deep-merge `overlay` into `base`; overlay wins on conflicts.
pub fn merge_json_objects(
    base: serde_json::Value,
    overlay: serde_json::Value,
) -> serde_json::Value {
    match (base, overlay) {
        (serde_json::Value::Object(mut base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if let Some(base_value) = base_map.get_mut(&key) {
                    *base_value = merge_json_objects(base_value.take(), value);
                } else {
                    base_map.insert(key, value);
                }
            }
            serde_json::Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Truncated SHA-256 of the JSON encoding of `value`.
pub fn fingerprint<T: Serialize + ?Sized>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let mut digest = sha256_hex(&bytes);
    digest.truncate(FINGERPRINT_LEN);
    digest
}

/// Keep the last `max_chars` characters of `text`, trimmed.
pub fn tail_summary(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed.to_string();
    }
    let tail: String = trimmed.chars().skip(count - max_chars).collect();
    format!("...{tail}")
}

pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0x1f, 0x8b])
}

pub fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

pub fn gunzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Write `bytes` to `path` via a sibling temp file and a rename, so readers
/// never observe a partially written file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_json_objects() {
        let base = json!({"env": {"PATH": "/bin", "LANG": "C"}, "rc": {"max_threads": 4}});
        let overlay = json!({"env": {"LANG": "C.UTF-8"}, "rc": {"security_level": "high"}});
        let merged = merge_json_objects(base, overlay);

        assert_eq!(merged["env"]["PATH"], "/bin");
        assert_eq!(merged["env"]["LANG"], "C.UTF-8");
        assert_eq!(merged["rc"]["max_threads"], 4);
        assert_eq!(merged["rc"]["security_level"], "high");
    }

    #[test]
    fn test_fingerprint_is_stable_and_truncated() {
        let a = fingerprint(&json!({"k": 1}));
        let b = fingerprint(&json!({"k": 1}));
        let c = fingerprint(&json!({"k": 2}));
        assert_eq!(a.len(), FINGERPRINT_LEN);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_tail_summary() {
        assert_eq!(tail_summary("  short \n", 10), "short");
        assert_eq!(tail_summary("0123456789", 4), "...6789");
    }

    #[test]
    fn test_gzip_round_trip() {
        let packed = gzip(b"register snapshot").unwrap();
        assert!(is_gzip(&packed));
        assert!(!is_gzip(b"{}"));
        assert_eq!(gunzip(&packed).unwrap(), b"register snapshot");
    }

    #[tokio::test]
    async fn test_write_atomic_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.json");
        write_atomic(&path, b"{}").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{}");

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
