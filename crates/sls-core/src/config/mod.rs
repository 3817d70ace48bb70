//! Layered key-value configuration.
//!
//! Settings are `(section, key) -> string` lookups over three TOML layers,
//! searched in order:
//!
//! 1. **local**: the only writable layer (`sls.local-config`)
//! 2. **user**: legacy settings written by older releases (`sls.user-config`)
//! 3. **base**: shipped defaults, read-only
//!
//! Dotted section names map to nested tables, so `helpers.minidump` lives
//! under `[helpers.minidump]`. Scalars of any TOML type are returned as
//! strings; booleans read back as `on`/`off`.
//!
//! On startup [`ConfigStore::migrate`] promotes legacy keys from the user
//! layer into the local layer and re-reads the view.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

/// Shipped defaults.
pub const DEFAULT_BASE_CONFIG: &str = "/usr/lib/steamos-log-submitter/base.toml";

/// Writable layer used when the base layer does not name one.
pub const DEFAULT_LOCAL_CONFIG: &str = "/etc/steamos-log-submitter/local.toml";

/// Keys promoted from the user layer into the local layer on startup.
pub const MIGRATED_KEYS: &[(&str, &str)] = &[
    ("sls", "enable"),
    ("steam", "account_id"),
    ("steam", "account_name"),
    ("steam", "deck_serial"),
    ("helpers.devcoredump", "enable"),
    ("helpers.gpu", "enable"),
    ("helpers.journal", "enable"),
    ("helpers.kdump", "enable"),
    ("helpers.minidump", "enable"),
    ("helpers.sysinfo", "enable"),
    ("helpers.sysreport", "enable"),
    ("helpers.trace", "enable"),
];

/// Configuration shared between the daemon and its helpers.
pub type SharedConfig = Arc<Mutex<ConfigStore>>;

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading or writing a layer.
    #[error("failed to access configuration file {}: {source}", path.display())]
    Io {
        /// Layer path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The local layer has no path to be written to.
    #[error("no writable configuration layer")]
    ReadOnly,

    /// A value failed validation.
    #[error("invalid value for {section}.{key}: {value:?}")]
    InvalidValue {
        /// Section name.
        section: String,
        /// Key name.
        key: String,
        /// Offending value.
        value: String,
    },
}

/// One TOML file in the lookup chain.
#[derive(Debug, Default, Clone)]
struct Layer {
    path: Option<PathBuf>,
    table: toml::Table,
}

impl Layer {
    fn load(path: Option<PathBuf>) -> Self {
        let table = path.as_deref().map_or_else(toml::Table::new, read_table);
        Self { path, table }
    }

    fn section(&self, section: &str) -> Option<&toml::Table> {
        let mut table = &self.table;
        for part in section.split('.') {
            table = table.get(part)?.as_table()?;
        }
        Some(table)
    }

    fn section_mut(&mut self, section: &str) -> &mut toml::Table {
        let mut table = &mut self.table;
        for part in section.split('.') {
            let entry = table
                .entry(part.to_string())
                .or_insert_with(|| toml::Value::Table(toml::Table::new()));
            if !entry.is_table() {
                *entry = toml::Value::Table(toml::Table::new());
            }
            table = match entry {
                toml::Value::Table(t) => t,
                _ => unreachable!("entry was just made a table"),
            };
        }
        table
    }

    fn get(&self, section: &str, key: &str) -> Option<String> {
        self.section(section)?.get(key).and_then(value_to_string)
    }

    fn contains(&self, section: &str, key: &str) -> bool {
        self.section(section).is_some_and(|t| t.contains_key(key))
    }

    fn remove(&mut self, section: &str, key: &str) -> Option<toml::Value> {
        self.section_mut(section).remove(key)
    }

    fn save(&self) -> Result<(), ConfigError> {
        let path = self.path.as_deref().ok_or(ConfigError::ReadOnly)?;
        let content = toml::to_string_pretty(&self.table)?;
        atomic_write(path, content.as_bytes()).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn read_table(path: &Path) -> toml::Table {
    match std::fs::read_to_string(path) {
        Ok(content) => match content.parse::<toml::Table>() {
            Ok(table) => table,
            Err(e) => {
                warn!(path = %path.display(), "ignoring malformed configuration layer: {e}");
                toml::Table::new()
            },
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => toml::Table::new(),
        Err(e) => {
            warn!(path = %path.display(), "failed to read configuration layer: {e}");
            toml::Table::new()
        },
    }
}

fn value_to_string(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(if *b { "on" } else { "off" }.to_string()),
        toml::Value::Datetime(d) => Some(d.to_string()),
        toml::Value::Array(items) => {
            let parts: Option<Vec<String>> = items.iter().map(value_to_string).collect();
            parts.map(|p| p.join(","))
        },
        toml::Value::Table(_) => None,
    }
}

/// Parses the boolean spellings accepted in configuration files.
#[must_use]
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Some(true),
        "off" | "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

/// Writes `bytes` to `path` via a temp file in the same directory.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// The layered configuration view.
#[derive(Debug, Default, Clone)]
pub struct ConfigStore {
    base: Layer,
    user: Layer,
    local: Layer,
}

impl ConfigStore {
    /// Loads the base layer and the layers it points at.
    ///
    /// The local layer defaults to [`DEFAULT_LOCAL_CONFIG`]; the user layer
    /// is only consulted if `sls.user-config` is set.
    #[must_use]
    pub fn load(base_path: &Path) -> Self {
        let base = Layer::load(Some(base_path.to_path_buf()));
        let local_path = base
            .get("sls", "local-config")
            .map_or_else(|| PathBuf::from(DEFAULT_LOCAL_CONFIG), PathBuf::from);
        let user_path = base.get("sls", "user-config").map(PathBuf::from);
        Self::from_paths(Some(base_path), user_path.as_deref(), Some(&local_path))
    }

    /// Loads explicit layer paths. Missing files are empty layers.
    #[must_use]
    pub fn from_paths(base: Option<&Path>, user: Option<&Path>, local: Option<&Path>) -> Self {
        Self {
            base: Layer::load(base.map(Path::to_path_buf)),
            user: Layer::load(user.map(Path::to_path_buf)),
            local: Layer::load(local.map(Path::to_path_buf)),
        }
    }

    /// Wraps the store for sharing.
    #[must_use]
    pub fn into_shared(self) -> SharedConfig {
        Arc::new(Mutex::new(self))
    }

    /// Re-reads every layer from disk.
    pub fn reload(&mut self) {
        self.base = Layer::load(self.base.path.take());
        self.user = Layer::load(self.user.path.take());
        self.local = Layer::load(self.local.path.take());
    }

    /// Looks `section.key` up through local, user and base.
    #[must_use]
    pub fn get(&self, section: &str, key: &str) -> Option<String> {
        self.local
            .get(section, key)
            .or_else(|| self.user.get(section, key))
            .or_else(|| self.base.get(section, key))
    }

    /// Boolean lookup with a default for absent or unparseable values.
    #[must_use]
    pub fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        match self.get(section, key) {
            Some(value) => parse_bool(&value).unwrap_or_else(|| {
                warn!(section, key, value, "not a boolean, using default");
                default
            }),
            None => default,
        }
    }

    /// Parses `section.key` as `T`. Absent keys are `Ok(None)`.
    pub fn get_parsed<T: FromStr>(&self, section: &str, key: &str) -> Result<Option<T>, ConfigError> {
        let Some(value) = self.get(section, key) else {
            return Ok(None);
        };
        value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                section: section.to_string(),
                key: key.to_string(),
                value,
            })
    }

    /// Unsigned integer lookup; unparseable values read as absent.
    #[must_use]
    pub fn get_u64(&self, section: &str, key: &str) -> Option<u64> {
        self.get_parsed(section, key).unwrap_or_else(|e| {
            warn!("{e}");
            None
        })
    }

    /// Floating-point lookup; unparseable values read as absent.
    #[must_use]
    pub fn get_f64(&self, section: &str, key: &str) -> Option<f64> {
        self.get_parsed(section, key).unwrap_or_else(|e| {
            warn!("{e}");
            None
        })
    }

    /// Writes `section.key` into the local layer (in memory).
    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.local
            .section_mut(section)
            .insert(key.to_string(), toml::Value::String(value.into()));
    }

    /// Writes a boolean as `on`/`off`.
    pub fn set_bool(&mut self, section: &str, key: &str, value: bool) {
        self.set(section, key, if value { "on" } else { "off" });
    }

    /// Removes `section.key` from the local layer (in memory).
    pub fn remove(&mut self, section: &str, key: &str) {
        self.local.remove(section, key);
    }

    /// Persists the local layer.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.local.save()
    }

    /// Promotes `keys` that exist only in the user layer into the local one.
    ///
    /// Returns `true` if anything moved. The local layer is written before
    /// the user layer so an interruption leaves the key in both places
    /// rather than neither.
    pub fn migrate(&mut self, keys: &[(&str, &str)]) -> Result<bool, ConfigError> {
        let mut moved = Vec::new();
        for (section, key) in keys {
            if self.local.contains(section, key) || !self.user.contains(section, key) {
                continue;
            }
            if let Some(value) = self.user.remove(section, key) {
                self.local
                    .section_mut(section)
                    .insert((*key).to_string(), value);
                moved.push(format!("{section}.{key}"));
            }
        }
        if moved.is_empty() {
            return Ok(false);
        }

        self.local.save()?;
        if self.user.path.is_some() {
            self.user.save()?;
        }
        info!(keys = ?moved, "migrated legacy configuration keys");
        self.reload();
        Ok(true)
    }
}

/// A handle on one section of a [`SharedConfig`].
#[derive(Debug, Clone)]
pub struct ConfigSection {
    store: SharedConfig,
    section: String,
}

impl ConfigSection {
    /// Scopes `store` to `section`.
    #[must_use]
    pub fn new(store: SharedConfig, section: impl Into<String>) -> Self {
        Self {
            store,
            section: section.into(),
        }
    }

    /// Section name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.section
    }

    /// String lookup.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.store
            .lock()
            .expect("config lock poisoned")
            .get(&self.section, key)
    }

    /// Boolean lookup with default.
    #[must_use]
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.store
            .lock()
            .expect("config lock poisoned")
            .get_bool(&self.section, key, default)
    }

    /// Unsigned integer lookup.
    #[must_use]
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.store
            .lock()
            .expect("config lock poisoned")
            .get_u64(&self.section, key)
    }

    /// Floating-point lookup.
    #[must_use]
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.store
            .lock()
            .expect("config lock poisoned")
            .get_f64(&self.section, key)
    }

    /// Comma-separated list lookup; blanks are dropped.
    #[must_use]
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Sets a value in the local layer and persists it.
    pub fn set(&self, key: &str, value: impl Into<String>) -> Result<(), ConfigError> {
        let mut store = self.store.lock().expect("config lock poisoned");
        store.set(&self.section, key, value);
        debug!(section = %self.section, key, "configuration updated");
        store.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn lookup_order_is_local_user_base() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.toml");
        let user = dir.path().join("user.toml");
        let local = dir.path().join("local.toml");
        write(&base, "[sls]\nenable = \"off\"\nbase = \"/b\"\n[logging]\nlevel = \"INFO\"\n");
        write(&user, "[sls]\nenable = \"on\"\nbase = \"/u\"\n");
        write(&local, "[sls]\nbase = \"/l\"\n");

        let store = ConfigStore::from_paths(Some(&base), Some(&user), Some(&local));
        assert_eq!(store.get("sls", "base").as_deref(), Some("/l"));
        assert_eq!(store.get("sls", "enable").as_deref(), Some("on"));
        assert_eq!(store.get("logging", "level").as_deref(), Some("INFO"));
        assert_eq!(store.get("logging", "path"), None);
    }

    #[test]
    fn dotted_sections_and_scalar_types() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.toml");
        write(
            &base,
            "[helpers.minidump]\nenable = true\ninterval = 3600\n[helpers.journal]\nunits = [\"a.service\", \"b.service\"]\n",
        );

        let store = ConfigStore::from_paths(Some(&base), None, None);
        assert_eq!(store.get("helpers.minidump", "enable").as_deref(), Some("on"));
        assert!(store.get_bool("helpers.minidump", "enable", false));
        assert_eq!(store.get_u64("helpers.minidump", "interval"), Some(3600));
        assert_eq!(
            store.get("helpers.journal", "units").as_deref(),
            Some("a.service,b.service")
        );
    }

    #[test]
    fn set_save_reload_round_trips_over_base() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.toml");
        let local = dir.path().join("local.toml");
        write(&base, "[sls]\nenable = \"off\"\n");

        let mut store = ConfigStore::from_paths(Some(&base), None, Some(&local));
        store.set("sls", "enable", "on");
        store.set("helpers.gpu", "dsn", "https://k@host/1");
        store.save().unwrap();

        let reloaded = ConfigStore::from_paths(Some(&base), None, Some(&local));
        assert_eq!(reloaded.get("sls", "enable").as_deref(), Some("on"));
        assert_eq!(
            reloaded.get("helpers.gpu", "dsn").as_deref(),
            Some("https://k@host/1")
        );
    }

    #[test]
    fn save_without_local_path_is_read_only() {
        let store = ConfigStore::from_paths(None, None, None);
        assert!(matches!(store.save(), Err(ConfigError::ReadOnly)));
    }

    #[test]
    fn migrate_moves_user_keys_into_local() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join("user.toml");
        let local = dir.path().join("local.toml");
        write(
            &user,
            "[steam]\naccount_id = \"42\"\naccount_name = \"gaben\"\n",
        );
        write(&local, "[steam]\naccount_name = \"local\"\n");

        let mut store = ConfigStore::from_paths(None, Some(&user), Some(&local));
        assert!(store.migrate(MIGRATED_KEYS).unwrap());

        assert_eq!(store.get("steam", "account_id").as_deref(), Some("42"));
        assert_eq!(store.get("steam", "account_name").as_deref(), Some("local"));

        let user_after = std::fs::read_to_string(&user).unwrap();
        assert!(!user_after.contains("account_id"));
        assert!(user_after.contains("gaben"));
        let local_after = std::fs::read_to_string(&local).unwrap();
        assert!(local_after.contains("account_id"));

        assert!(!store.migrate(MIGRATED_KEYS).unwrap());
    }

    #[test]
    fn malformed_layer_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.toml");
        write(&base, "[sls\nenable = ");
        let store = ConfigStore::from_paths(Some(&base), None, None);
        assert_eq!(store.get("sls", "enable"), None);
        assert!(!store.get_bool("sls", "enable", false));
    }

    #[test]
    fn section_handle_persists_writes() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local.toml");
        let shared = ConfigStore::from_paths(None, None, Some(&local)).into_shared();
        let section = ConfigSection::new(shared, "helpers.journal");

        section.set("units", "a.service, b.service,,").unwrap();
        assert_eq!(section.get_list("units"), vec!["a.service", "b.service"]);
        assert!(std::fs::read_to_string(&local).unwrap().contains("[helpers.journal]"));
    }

    #[test]
    fn unparseable_numbers_are_invalid_values() {
        let mut store = ConfigStore::from_paths(None, None, None);
        store.set("sls", "interval", "soon");
        store.set("sls", "ratio", "0.5");

        let err = store.get_parsed::<u64>("sls", "interval").unwrap_err();
        assert!(matches!(
            &err,
            ConfigError::InvalidValue { section, key, value }
                if section == "sls" && key == "interval" && value == "soon"
        ));
        assert_eq!(err.to_string(), "invalid value for sls.interval: \"soon\"");
        assert_eq!(store.get_u64("sls", "interval"), None);
        assert_eq!(store.get_f64("sls", "ratio"), Some(0.5));
        assert!(store.get_parsed::<u64>("sls", "missing").unwrap().is_none());
    }

    #[test]
    fn parse_bool_spellings() {
        for on in ["on", "ON", "true", "yes", "1"] {
            assert_eq!(parse_bool(on), Some(true));
        }
        for off in ["off", "False", "no", "0"] {
            assert_eq!(parse_bool(off), Some(false));
        }
        assert_eq!(parse_bool("maybe"), None);
    }
}
