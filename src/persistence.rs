// =============================================================================
// Persistence Store — atomic per-strategy config and state files on disk.
// =============================================================================
//
// Layout under `data_dir` (default "data/strategies"):
//   config/<id>.json   strategy configuration documents
//   state/<id>.json    strategy runtime state snapshots
//
// Every write goes through a temp file + rename so a crash between the two
// steps leaves the previous version intact (Testable Property: atomic state
// write).

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{error, warn};

use crate::strategy_config::StrategyConfig;

pub struct PersistenceStore {
    config_dir: PathBuf,
    state_dir: PathBuf,
    /// Serializes writes so two concurrent saves can't interleave
    /// tmp-write and rename.
    write_lock: Mutex<()>,
}

impl PersistenceStore {
    pub fn new(data_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let data_dir = data_dir.as_ref();
        let config_dir = data_dir.join("config");
        let state_dir = data_dir.join("state");
        std::fs::create_dir_all(&config_dir)?;
        std::fs::create_dir_all(&state_dir)?;
        Ok(Self {
            config_dir,
            state_dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn save_config(&self, config: &StrategyConfig) -> anyhow::Result<()> {
        let path = self.config_dir.join(format!("{}.json", config.id));
        self.write_atomic(&path, config)
    }

    pub fn load_config(&self, id: &str) -> Option<StrategyConfig> {
        let path = self.config_dir.join(format!("{id}.json"));
        self.read_json(&path)
    }

    /// Scan `config/*.json`, skipping files that fail to parse (logged, not
    /// fatal — a single corrupt config must not take down the others).
    pub fn list_configs(&self) -> Vec<StrategyConfig> {
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&self.config_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "failed to list strategy config directory");
                return out;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_json::<StrategyConfig>(&path) {
                Some(cfg) => out.push(cfg),
                None => warn!(path = %path.display(), "skipping unparseable strategy config"),
            }
        }
        out
    }

    /// Persist an arbitrary JSON state document for `id`, stamping
    /// `_last_updated` the way the reference persistence layer does.
    pub fn save_state(&self, id: &str, mut state: Value) -> anyhow::Result<()> {
        if let Value::Object(map) = &mut state {
            map.insert(
                "_last_updated".to_string(),
                Value::String(chrono::Utc::now().to_rfc3339()),
            );
        }
        let path = self.state_dir.join(format!("{id}.json"));
        self.write_atomic(&path, &state)
    }

    pub fn load_state(&self, id: &str) -> Option<Value> {
        let path = self.state_dir.join(format!("{id}.json"));
        self.read_json(&path)
    }

    pub fn delete_config(&self, id: &str) -> anyhow::Result<()> {
        let path = self.config_dir.join(format!("{id}.json"));
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn delete_state(&self, id: &str) -> anyhow::Result<()> {
        let path = self.state_dir.join(format!("{id}.json"));
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    fn write_atomic<T: serde::Serialize>(&self, path: &Path, value: &T) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock();
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(value)?;
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Option<T> {
        let body = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&body) {
            Ok(value) => Some(value),
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to parse persisted json");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_config(id: &str) -> StrategyConfig {
        StrategyConfig {
            id: id.to_string(),
            name: "test".into(),
            enabled: true,
            instrument_id: "SPX.CBOE".into(),
            strategy_type: "OrbLongCall".into(),
            order_size: 1,
            parameters: Default::default(),
        }
    }

    #[test]
    fn save_and_load_config_roundtrips() {
        let dir = tempdir();
        let store = PersistenceStore::new(&dir).unwrap();
        store.save_config(&sample_config("abc")).unwrap();
        let loaded = store.load_config("abc").unwrap();
        assert_eq!(loaded.id, "abc");
        assert_eq!(loaded.strategy_type, "OrbLongCall");
    }

    #[test]
    fn load_config_missing_id_returns_none() {
        let dir = tempdir();
        let store = PersistenceStore::new(&dir).unwrap();
        assert!(store.load_config("nope").is_none());
    }

    #[test]
    fn list_configs_skips_unparseable_files() {
        let dir = tempdir();
        let store = PersistenceStore::new(&dir).unwrap();
        store.save_config(&sample_config("good")).unwrap();
        std::fs::write(dir.join("config").join("bad.json"), "{not json").unwrap();
        let configs = store.list_configs();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].id, "good");
    }

    #[test]
    fn save_state_stamps_last_updated() {
        let dir = tempdir();
        let store = PersistenceStore::new(&dir).unwrap();
        store.save_state("abc", json!({"active_trade_id": "t-1"})).unwrap();
        let state = store.load_state("abc").unwrap();
        assert!(state.get("_last_updated").is_some());
        assert_eq!(state.get("active_trade_id").unwrap(), "t-1");
    }

    /// Simulates a crash between the temp write and the rename: a stale
    /// `.tmp` file must never be mistaken for the real state file.
    #[test]
    fn interrupted_write_leaves_previous_state_untouched() {
        let dir = tempdir();
        let store = PersistenceStore::new(&dir).unwrap();
        store.save_state("abc", json!({"version": 1})).unwrap();

        let path = dir.join("state").join("abc.json");
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string(&json!({"version": 2})).unwrap()).unwrap();

        let state = store.load_state("abc").unwrap();
        assert_eq!(state.get("version").unwrap(), 1);
    }

    fn tempdir() -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "persistence-test-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        path
    }
}
