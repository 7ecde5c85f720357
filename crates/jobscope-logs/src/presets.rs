//! Filter catalogue, active chain and persisted presets

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::FilterError;
use crate::filter::{
    ChainMatch, ChainMode, FilterChain, FilterKind, FilterSpec, FilterStats, FilterType,
    StreamFilter,
};

/// File name of the preset catalogue inside the config directory
pub const PRESETS_FILE: &str = "filter_presets.json";

/// Current on-disk schema version of the preset catalogue
pub const PRESETS_SCHEMA_VERSION: u32 = 1;

/// A named, persisted set of filter definitions
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterPreset {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    pub filters: Vec<FilterSpec>,
    #[serde(default)]
    pub mode: ChainMode,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub use_count: u64,
    #[serde(default)]
    pub built_in: bool,
}

#[derive(Serialize, Deserialize)]
struct PresetDocument {
    version: u32,
    presets: Vec<FilterPreset>,
}

/// Accepts the versioned document and the older bare array
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredPresets {
    Versioned(PresetDocument),
    Legacy(Vec<FilterPreset>),
}

#[derive(Default)]
struct ManagerState {
    filters: HashMap<String, Arc<StreamFilter>>,
    chains: HashMap<String, Arc<FilterChain>>,
    active_chain: Option<Arc<FilterChain>>,
    presets: Vec<FilterPreset>,
}

/// Owns filters, chains and presets for one console instance
pub struct FilterManager {
    state: RwLock<ManagerState>,

    /// Preset file; `None` keeps presets in memory only
    presets_path: Option<PathBuf>,

    /// Serialises writes of the preset file
    persist_lock: Mutex<()>,
}

impl FilterManager {
    /// Manager persisting presets under `config_dir`
    ///
    /// Built-in presets are installed when no preset file exists yet. A file
    /// that cannot be read is moved aside to `*.json.bak` before the built-ins
    /// replace it.
    pub fn new(config_dir: impl AsRef<Path>) -> Result<Self, FilterError> {
        let path = config_dir.as_ref().join(PRESETS_FILE);
        let (presets, install) = match load_presets(&path)? {
            StoredState::Missing => (builtin_presets(), true),
            StoredState::Loaded(presets) => (presets, false),
            StoredState::Unreadable => {
                let backup = path.with_extension("json.bak");
                fs::rename(&path, &backup).map_err(|e| FilterError::Persist {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
                warn!(backup = %backup.display(), "moved unreadable preset file aside");
                (builtin_presets(), true)
            }
        };

        let manager = Self::with_presets(presets, Some(path));
        if install {
            info!("installing built-in filter presets");
            manager.persist()?;
        }
        Ok(manager)
    }

    /// Manager without persistence, seeded with the built-in presets
    pub fn in_memory() -> Self {
        Self::with_presets(builtin_presets(), None)
    }

    fn with_presets(presets: Vec<FilterPreset>, presets_path: Option<PathBuf>) -> Self {
        Self {
            state: RwLock::new(ManagerState {
                presets,
                ..Default::default()
            }),
            presets_path,
            persist_lock: Mutex::new(()),
        }
    }

    // ------------------------------------------------------------------
    // Filters
    // ------------------------------------------------------------------

    /// Compile and register a filter
    pub fn create_filter(&self, spec: FilterSpec) -> Result<Arc<StreamFilter>, FilterError> {
        let filter = Arc::new(StreamFilter::new(spec)?);
        self.state
            .write()
            .filters
            .insert(filter.id().to_string(), Arc::clone(&filter));
        Ok(filter)
    }

    pub fn filter(&self, id: &str) -> Option<Arc<StreamFilter>> {
        self.state.read().filters.get(id).cloned()
    }

    pub fn filters(&self) -> Vec<Arc<StreamFilter>> {
        self.state.read().filters.values().cloned().collect()
    }

    /// Drop a filter from the catalogue; chains already using it keep it
    pub fn remove_filter(&self, id: &str) -> Result<(), FilterError> {
        self.state
            .write()
            .filters
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| FilterError::UnknownFilter(id.to_string()))
    }

    pub fn set_filter_enabled(&self, id: &str, enabled: bool) -> Result<(), FilterError> {
        let filter = self
            .filter(id)
            .ok_or_else(|| FilterError::UnknownFilter(id.to_string()))?;
        filter.set_enabled(enabled);
        Ok(())
    }

    pub fn filter_stats(&self) -> Vec<FilterStats> {
        let mut stats: Vec<_> = self.filters().iter().map(|f| f.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    // ------------------------------------------------------------------
    // Chains
    // ------------------------------------------------------------------

    /// Build a chain from registered filters, in the given order
    pub fn create_chain(
        &self,
        name: &str,
        filter_ids: &[&str],
        mode: ChainMode,
    ) -> Result<Arc<FilterChain>, FilterError> {
        let mut state = self.state.write();
        let filters = filter_ids
            .iter()
            .map(|id| {
                state
                    .filters
                    .get(*id)
                    .cloned()
                    .ok_or_else(|| FilterError::UnknownFilter(id.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let chain = Arc::new(FilterChain::new(name, mode, filters));
        state
            .chains
            .insert(chain.id().to_string(), Arc::clone(&chain));
        Ok(chain)
    }

    /// Make `chain_id` the single active chain
    pub fn activate_chain(&self, chain_id: &str) -> Result<(), FilterError> {
        let mut state = self.state.write();
        let chain = state
            .chains
            .get(chain_id)
            .cloned()
            .ok_or_else(|| FilterError::UnknownChain(chain_id.to_string()))?;
        Self::set_active_locked(&mut state, chain);
        Ok(())
    }

    /// Stop filtering; every line passes
    pub fn deactivate(&self) {
        if let Some(previous) = self.state.write().active_chain.take() {
            previous.set_active(false);
        }
    }

    pub fn active_chain(&self) -> Option<Arc<FilterChain>> {
        self.state.read().active_chain.clone()
    }

    fn set_active_locked(state: &mut ManagerState, chain: Arc<FilterChain>) {
        if let Some(previous) = state.active_chain.take() {
            previous.set_active(false);
        }
        chain.set_active(true);
        debug!(chain = chain.name(), filters = chain.len(), "activated filter chain");
        state.active_chain = Some(chain);
    }

    /// Single-filter chain built from typed text, activated immediately
    pub fn quick_filter(
        &self,
        pattern: &str,
        filter_type: FilterType,
    ) -> Result<Arc<FilterChain>, FilterError> {
        let kind = FilterKind::from_pattern(pattern, filter_type)?;
        let filter = self.create_filter(FilterSpec::new(pattern, kind))?;

        let chain = Arc::new(FilterChain::new(
            format!("quick: {pattern}"),
            ChainMode::All,
            vec![filter],
        ));

        let mut state = self.state.write();
        state
            .chains
            .insert(chain.id().to_string(), Arc::clone(&chain));
        Self::set_active_locked(&mut state, Arc::clone(&chain));
        Ok(chain)
    }

    /// Run a line through the active chain; passes when none is active
    pub fn apply_active_filters(&self, line: &str) -> ChainMatch {
        match self.active_chain() {
            Some(chain) => chain.apply(line),
            None => ChainMatch::pass(),
        }
    }

    // ------------------------------------------------------------------
    // Presets
    // ------------------------------------------------------------------

    /// Snapshot the active chain as a new preset and persist the catalogue
    pub fn save_preset(
        &self,
        name: &str,
        description: &str,
        category: &str,
        tags: Vec<String>,
    ) -> Result<FilterPreset, FilterError> {
        let chain = self.active_chain().ok_or(FilterError::NoActiveChain)?;

        let preset = FilterPreset {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            category: category.to_string(),
            filters: chain.filters().iter().map(|f| f.spec()).collect(),
            mode: chain.mode(),
            tags,
            created_at: Utc::now(),
            last_used: None,
            use_count: 0,
            built_in: false,
        };

        self.state.write().presets.push(preset.clone());
        self.persist()?;
        info!(preset = name, "saved filter preset");
        Ok(preset)
    }

    /// Rebuild a preset's filters with fresh ids and statistics and activate them
    pub fn load_preset(&self, preset_id: &str) -> Result<Arc<FilterChain>, FilterError> {
        let preset = self
            .preset(preset_id)
            .ok_or_else(|| FilterError::UnknownPreset(preset_id.to_string()))?;

        let filters = preset
            .filters
            .iter()
            .map(|spec| StreamFilter::new(spec.fresh_copy()).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        let chain = Arc::new(FilterChain::new(preset.name.clone(), preset.mode, filters));

        {
            let mut state = self.state.write();
            for filter in chain.filters() {
                state
                    .filters
                    .insert(filter.id().to_string(), Arc::clone(filter));
            }
            state
                .chains
                .insert(chain.id().to_string(), Arc::clone(&chain));
            Self::set_active_locked(&mut state, Arc::clone(&chain));

            if let Some(stored) = state.presets.iter_mut().find(|p| p.id == preset_id) {
                stored.last_used = Some(Utc::now());
                stored.use_count += 1;
            }
        }

        self.persist()?;
        Ok(chain)
    }

    pub fn delete_preset(&self, preset_id: &str) -> Result<(), FilterError> {
        {
            let mut state = self.state.write();
            let before = state.presets.len();
            state.presets.retain(|p| p.id != preset_id);
            if state.presets.len() == before {
                return Err(FilterError::UnknownPreset(preset_id.to_string()));
            }
        }
        self.persist()
    }

    pub fn preset(&self, preset_id: &str) -> Option<FilterPreset> {
        self.state
            .read()
            .presets
            .iter()
            .find(|p| p.id == preset_id)
            .cloned()
    }

    /// Case-insensitive lookup by name
    pub fn preset_by_name(&self, name: &str) -> Option<FilterPreset> {
        self.state
            .read()
            .presets
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn presets(&self) -> Vec<FilterPreset> {
        self.state.read().presets.clone()
    }

    pub fn presets_by_category(&self) -> BTreeMap<String, Vec<FilterPreset>> {
        let mut grouped: BTreeMap<String, Vec<FilterPreset>> = BTreeMap::new();
        for preset in self.presets() {
            grouped.entry(preset.category.clone()).or_default().push(preset);
        }
        grouped
    }

    /// Write the whole catalogue; no-op for in-memory managers
    fn persist(&self) -> Result<(), FilterError> {
        let Some(path) = &self.presets_path else {
            return Ok(());
        };

        // Snapshot under the lock: files are written in snapshot order
        let _guard = self.persist_lock.lock();
        let document = PresetDocument {
            version: PRESETS_SCHEMA_VERSION,
            presets: self.presets(),
        };
        let persist_err = |message: String| FilterError::Persist {
            path: path.clone(),
            message,
        };

        let content =
            serde_json::to_string_pretty(&document).map_err(|e| persist_err(e.to_string()))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| persist_err(e.to_string()))?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|e| persist_err(e.to_string()))?;
        fs::rename(&tmp, path).map_err(|e| persist_err(e.to_string()))?;

        debug!(path = %path.display(), count = document.presets.len(), "persisted presets");
        Ok(())
    }
}

enum StoredState {
    Missing,
    Loaded(Vec<FilterPreset>),
    Unreadable,
}

/// Read stored presets; only a missing file counts as a first run
fn load_presets(path: &Path) -> Result<StoredState, FilterError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(StoredState::Missing),
        Err(e) => {
            return Err(FilterError::Persist {
                path: path.to_path_buf(),
                message: e.to_string(),
            });
        }
    };

    Ok(match serde_json::from_str::<StoredPresets>(&content) {
        Ok(StoredPresets::Versioned(doc)) => {
            if doc.version > PRESETS_SCHEMA_VERSION {
                warn!(
                    version = doc.version,
                    "preset file is newer than this build, reading anyway"
                );
            }
            StoredState::Loaded(doc.presets)
        }
        Ok(StoredPresets::Legacy(presets)) => StoredState::Loaded(presets),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable preset file");
            StoredState::Unreadable
        }
    })
}

fn builtin(
    id: &str,
    name: &str,
    description: &str,
    category: &str,
    filters: Vec<FilterSpec>,
    mode: ChainMode,
    tags: &[&str],
) -> FilterPreset {
    FilterPreset {
        id: format!("builtin-{id}"),
        name: name.to_string(),
        description: description.to_string(),
        category: category.to_string(),
        filters,
        mode,
        tags: tags.iter().map(|t| t.to_string()).collect(),
        created_at: Utc::now(),
        last_used: None,
        use_count: 0,
        built_in: true,
    }
}

/// Presets installed on first run
pub fn builtin_presets() -> Vec<FilterPreset> {
    vec![
        builtin(
            "errors-only",
            "Errors Only",
            "Error and fatal lines",
            "severity",
            vec![FilterSpec::log_level(["ERROR", "FATAL"])],
            ChainMode::All,
            &["errors"],
        ),
        builtin(
            "warnings-and-errors",
            "Warnings and Errors",
            "Warning, error and fatal lines",
            "severity",
            vec![FilterSpec::log_level(["WARN", "ERROR", "FATAL"])],
            ChainMode::All,
            &["errors", "warnings"],
        ),
        builtin(
            "performance",
            "Performance",
            "Timing, throughput and timeout messages",
            "diagnostics",
            vec![
                FilterSpec::regex(r"(?i)\b(slow|timeout|timed out|latency|throughput|elapsed)\b"),
                FilterSpec::regex(r"(?i)\b\d+(\.\d+)?\s?(ms|s|sec|seconds)\b"),
            ],
            ChainMode::Any,
            &["performance", "timing"],
        ),
        builtin(
            "memory-issues",
            "Memory Issues",
            "Out-of-memory kills, allocation failures and segfaults",
            "diagnostics",
            vec![FilterSpec::regex(
                r"(?i)(out of memory|oom[-_ ]?kill|memory limit|exceeded memory|bad_alloc|cannot allocate|segmentation fault|killed process)",
            )],
            ChainMode::Any,
            &["memory", "oom"],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_quick_filter_activates() {
        let manager = FilterManager::in_memory();
        let chain = manager.quick_filter("error", FilterType::Keyword).unwrap();
        assert!(chain.is_active());
        assert_eq!(chain.len(), 1);
        assert!(manager.apply_active_filters("an ERROR").matched);
        assert!(!manager.apply_active_filters("all fine").matched);

        let second = manager.quick_filter("warn", FilterType::Keyword).unwrap();
        assert!(!chain.is_active());
        assert_eq!(manager.active_chain().unwrap().id(), second.id());
    }

    #[test]
    fn test_no_active_chain_passes() {
        let manager = FilterManager::in_memory();
        assert!(manager.apply_active_filters("anything").matched);
        manager.quick_filter("x", FilterType::Keyword).unwrap();
        manager.deactivate();
        assert!(manager.apply_active_filters("y").matched);
    }

    #[test]
    fn test_quick_filter_invalid_regex() {
        let manager = FilterManager::in_memory();
        assert!(manager.quick_filter("(", FilterType::Regex).is_err());
        assert!(manager.active_chain().is_none());
    }

    #[test]
    fn test_create_chain_and_toggle() {
        let manager = FilterManager::in_memory();
        let a = manager.create_filter(FilterSpec::keyword("error")).unwrap();
        let b = manager.create_filter(FilterSpec::keyword("db")).unwrap();
        let chain = manager
            .create_chain("pair", &[a.id(), b.id()], ChainMode::Any)
            .unwrap();
        manager.activate_chain(chain.id()).unwrap();
        assert!(manager.apply_active_filters("db only").matched);

        manager.set_filter_enabled(b.id(), false).unwrap();
        assert!(!manager.apply_active_filters("db only").matched);

        assert!(matches!(
            manager.create_chain("bad", &["missing"], ChainMode::All),
            Err(FilterError::UnknownFilter(_))
        ));
        assert!(manager.activate_chain("missing").is_err());
    }

    #[test]
    fn test_builtins_installed_and_persisted() {
        let dir = TempDir::new().unwrap();
        let manager = FilterManager::new(dir.path()).unwrap();
        let names: Vec<_> = manager.presets().into_iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            vec!["Errors Only", "Warnings and Errors", "Performance", "Memory Issues"]
        );

        let raw = fs::read_to_string(dir.path().join(PRESETS_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["version"], PRESETS_SCHEMA_VERSION);
        assert_eq!(json["presets"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_builtins_compile() {
        let manager = FilterManager::in_memory();
        for preset in manager.presets() {
            manager.load_preset(&preset.id).unwrap();
        }
        let errors = manager.preset_by_name("errors only").unwrap();
        manager.load_preset(&errors.id).unwrap();
        assert!(manager.apply_active_filters("[ERROR] boom").matched);
        assert!(!manager.apply_active_filters("[INFO] ok").matched);
    }

    #[test]
    fn test_save_and_reload_preset() {
        let dir = TempDir::new().unwrap();
        let manager = FilterManager::new(dir.path()).unwrap();

        assert!(matches!(
            manager.save_preset("none", "", "", vec![]),
            Err(FilterError::NoActiveChain)
        ));

        let chain = manager.quick_filter("cuda", FilterType::Keyword).unwrap();
        chain.apply("cuda init");
        let saved = manager
            .save_preset("GPU", "gpu lines", "hardware", vec!["gpu".into()])
            .unwrap();
        assert_eq!(saved.filters.len(), 1);
        assert_eq!(saved.filters[0].id, chain.filters()[0].id());

        // A new manager sees the saved preset
        let reopened = FilterManager::new(dir.path()).unwrap();
        assert_eq!(reopened.presets().len(), 5);
        let loaded = reopened.load_preset(&saved.id).unwrap();

        let filter = &loaded.filters()[0];
        assert_ne!(filter.id(), saved.filters[0].id);
        assert_eq!(filter.stats().processed, 0);
        assert!(loaded.is_active());

        let used = reopened.preset(&saved.id).unwrap();
        assert_eq!(used.use_count, 1);
        assert!(used.last_used.is_some());

        let by_cat = reopened.presets_by_category();
        assert_eq!(by_cat["hardware"].len(), 1);
        assert_eq!(by_cat["severity"].len(), 2);
    }

    #[test]
    fn test_delete_preset() {
        let manager = FilterManager::in_memory();
        manager.delete_preset("builtin-performance").unwrap();
        assert_eq!(manager.presets().len(), 3);
        assert!(matches!(
            manager.delete_preset("builtin-performance"),
            Err(FilterError::UnknownPreset(_))
        ));
        assert!(manager.load_preset("nope").is_err());
    }

    #[test]
    fn test_legacy_array_is_accepted() {
        let dir = TempDir::new().unwrap();
        let legacy = vec![builtin(
            "x",
            "Legacy",
            "",
            "old",
            vec![FilterSpec::keyword("x")],
            ChainMode::All,
            &[],
        )];
        fs::write(
            dir.path().join(PRESETS_FILE),
            serde_json::to_string(&legacy).unwrap(),
        )
        .unwrap();

        let manager = FilterManager::new(dir.path()).unwrap();
        let presets = manager.presets();
        assert_eq!(presets.len(), 1);
        assert_eq!(presets[0].name, "Legacy");
    }

    #[test]
    fn test_corrupt_file_is_kept_aside() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(PRESETS_FILE), "{not json").unwrap();
        let manager = FilterManager::new(dir.path()).unwrap();
        assert_eq!(manager.presets().len(), 4);

        let backup = dir.path().join("filter_presets.json.bak");
        assert_eq!(fs::read_to_string(backup).unwrap(), "{not json");
    }

    #[test]
    fn test_newer_schema_file_is_not_overwritten() {
        let dir = TempDir::new().unwrap();
        let newer = r#"{"version": 2, "presets": [{
            "id": "p1", "name": "My GPU preset", "created_at": "2026-01-01T00:00:00Z",
            "filters": [{"id": "f1", "name": "gpu", "type": "json_path", "path": "$.gpu"}]
        }]}"#;
        fs::write(dir.path().join(PRESETS_FILE), newer).unwrap();

        let manager = FilterManager::new(dir.path()).unwrap();
        assert!(manager.preset_by_name("My GPU preset").is_none());
        assert_eq!(manager.presets().len(), 4);

        let backup = fs::read_to_string(dir.path().join("filter_presets.json.bak")).unwrap();
        assert!(backup.contains("My GPU preset"));
    }

    #[test]
    fn test_emptied_catalogue_stays_empty() {
        let dir = TempDir::new().unwrap();
        let manager = FilterManager::new(dir.path()).unwrap();
        for preset in manager.presets() {
            manager.delete_preset(&preset.id).unwrap();
        }

        let reopened = FilterManager::new(dir.path()).unwrap();
        assert!(reopened.presets().is_empty());
    }

    #[test]
    fn test_persist_writes_latest_catalogue() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(FilterManager::new(dir.path()).unwrap());
        manager.quick_filter("cuda", FilterType::Keyword).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    manager.save_preset(&format!("p{i}"), "", "mine", vec![]).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let reopened = FilterManager::new(dir.path()).unwrap();
        assert_eq!(reopened.presets().len(), 12);
    }
}
