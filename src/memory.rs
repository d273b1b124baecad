//! Virtual register and memory store owned by one execution unit.
//!
//! Registers and addressable memory are separate maps of JSON values. Reads
//! of unset registers or addresses yield `0`. Every operation takes the
//! store's exclusive lock.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::VexecResult;
use crate::utils::{gunzip, gzip, is_gzip, write_atomic};

/// Result of loading a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// Number of memory cells now present.
    Loaded(usize),
    /// The snapshot could not be used; existing state is unchanged.
    Warning(String),
}

#[derive(Debug, Default)]
struct StoreState {
    registers: HashMap<String, Value>,
    memory: BTreeMap<String, Value>,
}

#[derive(Debug, Default)]
pub struct RegisterStore {
    state: Mutex<StoreState>,
    compress: bool,
}

fn zero() -> Value {
    Value::from(0)
}

impl RegisterStore {
    pub fn new(compress: bool) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            compress,
        }
    }

    /// Replace the memory map with the snapshot at `path`.
    ///
    /// Gzip snapshots are detected by their magic bytes. Any failure leaves
    /// the current state untouched and is reported as a warning.
    pub async fn load(&self, path: &Path) -> LoadOutcome {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) => return Self::warn(path, format!("read failed: {e}")),
        };

        let raw = if is_gzip(&raw) {
            match gunzip(&raw) {
                Ok(raw) => raw,
                Err(e) => return Self::warn(path, format!("decompression failed: {e}")),
            }
        } else {
            raw
        };

        let memory: BTreeMap<String, Value> = match serde_json::from_slice(&raw) {
            Ok(memory) => memory,
            Err(e) => return Self::warn(path, format!("decode failed: {e}")),
        };

        let mut state = self.state.lock().await;
        state.memory = memory;
        debug!("Loaded {} memory cells from {}", state.memory.len(), path.display());
        LoadOutcome::Loaded(state.memory.len())
    }

    fn warn(path: &Path, reason: String) -> LoadOutcome {
        warn!("Ignoring memory snapshot {}: {}", path.display(), reason);
        LoadOutcome::Warning(reason)
    }

    /// Persist the memory map to `path` atomically, holding the lock for the
    /// whole write.
    pub async fn save(&self, path: &Path) -> VexecResult<()> {
        let state = self.state.lock().await;
        let mut bytes = serde_json::to_vec(&state.memory)?;
        if self.compress {
            bytes = gzip(&bytes)?;
        }
        write_atomic(path, &bytes).await?;
        debug!("Saved {} memory cells to {}", state.memory.len(), path.display());
        Ok(())
    }

    /// Copy `src` into `dst`; an unset source copies `0`.
    pub async fn move_register(&self, src: &str, dst: &str) -> Value {
        let mut state = self.state.lock().await;
        let value = state.registers.get(src).cloned().unwrap_or_else(zero);
        state.registers.insert(dst.to_string(), value.clone());
        value
    }

    /// Copy memory at `address` into `register`; an unset address copies `0`.
    pub async fn load_addr(&self, address: &str, register: &str) -> Value {
        let mut state = self.state.lock().await;
        let value = state.memory.get(address).cloned().unwrap_or_else(zero);
        state.registers.insert(register.to_string(), value.clone());
        value
    }

    pub async fn set_register(&self, register: &str, value: Value) {
        self.state
            .lock()
            .await
            .registers
            .insert(register.to_string(), value);
    }

    pub async fn register(&self, register: &str) -> Value {
        self.state
            .lock()
            .await
            .registers
            .get(register)
            .cloned()
            .unwrap_or_else(zero)
    }

    pub async fn write_memory(&self, address: &str, value: Value) {
        self.state
            .lock()
            .await
            .memory
            .insert(address.to_string(), value);
    }

    pub async fn read_memory(&self, address: &str) -> Value {
        self.state
            .lock()
            .await
            .memory
            .get(address)
            .cloned()
            .unwrap_or_else(zero)
    }

    pub async fn memory_len(&self) -> usize {
        self.state.lock().await.memory.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_unset_values_default_to_zero() {
        let store = RegisterStore::new(false);
        assert_eq!(store.register("r9").await, json!(0));
        assert_eq!(store.read_memory("0xffff").await, json!(0));

        assert_eq!(store.load_addr("0x0001", "r0").await, json!(0));
        assert_eq!(store.register("r0").await, json!(0));
    }

    #[tokio::test]
    async fn test_move_and_load_addr() {
        let store = RegisterStore::new(false);
        store.write_memory("0x0010", json!({"answer": 42})).await;

        store.load_addr("0x0010", "r0").await;
        assert_eq!(store.register("r0").await, json!({"answer": 42}));

        store.move_register("r0", "r1").await;
        assert_eq!(store.register("r1").await, json!({"answer": 42}));

        store.move_register("unset", "r1").await;
        assert_eq!(store.register("r1").await, json!(0));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();

        for compress in [false, true] {
            let path = dir.path().join(format!("snap-{compress}.json"));
            let store = RegisterStore::new(compress);
            store.write_memory("a", json!(1)).await;
            store.write_memory("b", json!("two")).await;
            store.save(&path).await.unwrap();

            let raw = std::fs::read(&path).unwrap();
            assert_eq!(is_gzip(&raw), compress);

            let restored = RegisterStore::new(false);
            assert_eq!(restored.load(&path).await, LoadOutcome::Loaded(2));
            assert_eq!(restored.read_memory("b").await, json!("two"));
        }
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.json");
        std::fs::write(&path, b"not json at all").unwrap();

        let store = RegisterStore::new(false);
        store.write_memory("kept", json!(7)).await;

        assert!(matches!(store.load(&path).await, LoadOutcome::Warning(_)));
        assert_eq!(store.read_memory("kept").await, json!(7));

        let missing = dir.path().join("missing.json");
        assert!(matches!(store.load(&missing).await, LoadOutcome::Warning(_)));
        assert_eq!(store.memory_len().await, 1);
    }
}
