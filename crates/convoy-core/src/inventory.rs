//! Static TOML inventory
//!
//! ```toml
//! concurrency = 20
//!
//! [transports.ssh]
//! user = "deploy"
//! run-as = "root"
//!
//! [[targets]]
//! uri = "web1.example.com"
//! name = "web1"
//! features = ["puppet-agent"]
//! config = { port = 2222 }
//!
//! [[groups]]
//! name = "web"
//! targets = ["web1"]
//! ```
//!
//! A target's `config` table overrides its transport's defaults key by
//! key. Names that are not in the inventory are parsed as target URIs and
//! get the defaults of their transport.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use convoy_api::{Inventory, Target, TransportKind, TransportOptions, ValidationError};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::CoreError;

const ENV_VAR: &str = "CONVOY_INVENTORY";
const FILE_NAME: &str = "inventory.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct InventoryFile {
    #[serde(default)]
    concurrency: Option<usize>,
    #[serde(default)]
    transports: BTreeMap<String, toml::Table>,
    #[serde(default)]
    targets: Vec<TargetEntry>,
    #[serde(default)]
    groups: Vec<GroupEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetEntry {
    uri: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    features: Vec<String>,
    #[serde(default)]
    config: toml::Table,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct GroupEntry {
    name: String,
    targets: Vec<String>,
}

/// Inventory loaded once from a TOML file; read-only afterwards
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    concurrency: Option<usize>,
    defaults: BTreeMap<TransportKind, Map<String, Value>>,
    targets: Vec<Target>,
    groups: BTreeMap<String, Vec<String>>,
}

impl StaticInventory {
    /// Parse an inventory from TOML text
    ///
    /// # Errors
    /// Returns `CoreError` if the text is not a valid inventory or a target
    /// has invalid options.
    pub fn from_toml_str(content: &str) -> Result<Self, CoreError> {
        Self::parse(content, "<string>")
    }

    /// Load an inventory file
    ///
    /// # Errors
    /// Returns `CoreError` if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| CoreError::InventoryRead {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        debug!(path = %path.display(), "loaded inventory");
        Self::parse(&content, &path.display().to_string())
    }

    /// Load from `explicit`, `$CONVOY_INVENTORY`, `./inventory.toml` or
    /// the user config dir, in that order
    ///
    /// Falls back to an empty inventory when none of them exists, so bare
    /// URIs still resolve.
    ///
    /// # Errors
    /// Returns `CoreError` if a file is found but cannot be loaded. An
    /// explicit path or `$CONVOY_INVENTORY` must exist.
    pub fn load_default(explicit: Option<&Path>) -> Result<Self, CoreError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Ok(path) = std::env::var(ENV_VAR) {
            return Self::load(Path::new(&path));
        }

        let candidates = [
            Some(PathBuf::from(FILE_NAME)),
            dirs::config_dir().map(|p| p.join("convoy").join(FILE_NAME)),
        ];
        for path in candidates.into_iter().flatten() {
            if path.exists() {
                return Self::load(&path);
            }
        }

        warn!("no inventory file found, only target URIs will resolve");
        Ok(Self::default())
    }

    fn parse(content: &str, origin: &str) -> Result<Self, CoreError> {
        let file: InventoryFile = toml::from_str(content).map_err(|e| CoreError::InventoryParse {
            path: origin.to_string(),
            reason: e.to_string(),
        })?;

        let mut defaults = BTreeMap::new();
        for (name, table) in file.transports {
            let kind: TransportKind = name.parse()?;
            defaults.insert(kind, table_to_map(&table, origin)?);
        }

        let mut inventory = Self {
            concurrency: file.concurrency,
            defaults,
            targets: Vec::with_capacity(file.targets.len()),
            groups: file
                .groups
                .into_iter()
                .map(|g| (g.name, g.targets))
                .collect(),
        };

        for entry in file.targets {
            let overrides = table_to_map(&entry.config, origin)?;
            let mut target = inventory.resolve_uri(&entry.uri, &overrides)?;
            if let Some(name) = entry.name {
                target = target.with_name(name);
            }
            target = target.with_features(entry.features);
            inventory.targets.push(target);
        }
        Ok(inventory)
    }

    /// Parse `uri` and merge transport defaults with `overrides`
    fn resolve_uri(&self, uri: &str, overrides: &Map<String, Value>) -> Result<Target, ValidationError> {
        let target = Target::parse(uri)?;
        let mut config = self.defaults.get(&target.transport).cloned().unwrap_or_default();
        for (key, value) in overrides {
            config.insert(key.clone(), value.clone());
        }
        let options = TransportOptions::from_value(Value::Object(config))?;
        Ok(target.with_options(options))
    }

    /// Worker pool size requested by the inventory
    #[must_use]
    pub fn concurrency(&self) -> Option<usize> {
        self.concurrency
    }

    /// Every target, in file order
    #[must_use]
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    fn expand(&self, entry: &str, depth: usize, out: &mut Vec<Target>) -> Result<(), ValidationError> {
        if entry == "all" {
            out.extend(self.targets.iter().cloned());
            return Ok(());
        }
        if let Some(target) = self.get_target(entry) {
            out.push(target);
            return Ok(());
        }
        if let Some(members) = self.groups.get(entry) {
            // groups may nest, but not forever
            if depth > 16 {
                return Err(ValidationError::InvalidOption {
                    option: "groups".to_string(),
                    reason: format!("group '{entry}' nests too deeply"),
                });
            }
            for member in members {
                self.expand(member, depth + 1, out)?;
            }
            return Ok(());
        }
        out.push(self.resolve_uri(entry, &Map::new())?);
        Ok(())
    }
}

impl Inventory for StaticInventory {
    fn get_target(&self, name: &str) -> Option<Target> {
        self.targets
            .iter()
            .find(|t| t.name == name)
            .or_else(|| self.targets.iter().find(|t| t.uri == name))
            .cloned()
    }

    fn get_targets(&self, pattern: &str) -> Result<Vec<Target>, ValidationError> {
        let mut expanded = Vec::new();
        for entry in pattern.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            self.expand(entry, 0, &mut expanded)?;
        }

        let mut targets: Vec<Target> = Vec::with_capacity(expanded.len());
        for target in expanded {
            if !targets.iter().any(|t| t.name == target.name) {
                targets.push(target);
            }
        }
        Ok(targets)
    }
}

fn table_to_map(table: &toml::Table, origin: &str) -> Result<Map<String, Value>, CoreError> {
    match serde_json::to_value(table) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Ok(Map::new()),
        Err(e) => Err(CoreError::InventoryParse {
            path: origin.to_string(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVENTORY: &str = r#"
concurrency = 4

[transports.ssh]
user = "deploy"
run-as = "root"
connect-timeout = 30

[[targets]]
uri = "web1.example.com"
name = "web1"
features = ["puppet-agent"]
config = { port = 2222, run-as = "app" }

[[targets]]
uri = "ssh://db1.example.com"

[[targets]]
uri = "docker://cache"
name = "cache"

[[groups]]
name = "web"
targets = ["web1"]

[[groups]]
name = "backend"
targets = ["web", "cache"]
"#;

    #[test]
    fn test_defaults_and_overrides() {
        let inventory = StaticInventory::from_toml_str(INVENTORY).unwrap();
        assert_eq!(inventory.concurrency(), Some(4));

        let web1 = inventory.get_target("web1").unwrap();
        assert_eq!(web1.transport, TransportKind::Ssh);
        assert_eq!(web1.user(), Some("deploy"));
        assert_eq!(web1.port(), Some(2222));
        assert_eq!(web1.options.run_as.as_deref(), Some("app"));
        assert_eq!(web1.options.connect_timeout, 30);
        assert!(web1.features.contains("puppet-agent"));

        // ssh defaults do not leak into other transports
        let cache = inventory.get_target("cache").unwrap();
        assert_eq!(cache.options.run_as, None);
        assert_eq!(cache.options.connect_timeout, 10);
    }

    #[test]
    fn test_lookup_by_uri() {
        let inventory = StaticInventory::from_toml_str(INVENTORY).unwrap();
        let db1 = inventory.get_target("ssh://db1.example.com").unwrap();
        assert_eq!(db1.host(), Some("db1.example.com"));
        assert_eq!(db1.user(), Some("deploy"));
    }

    #[test]
    fn test_patterns() {
        let inventory = StaticInventory::from_toml_str(INVENTORY).unwrap();

        let names = |pattern: &str| -> Vec<String> {
            inventory
                .get_targets(pattern)
                .unwrap()
                .into_iter()
                .map(|t| t.name)
                .collect()
        };
        assert_eq!(names("backend"), vec!["web1", "cache"]);
        assert_eq!(names("cache, web1, cache"), vec!["cache", "web1"]);
        assert_eq!(names("all").len(), 3);

        // unknown names are URIs with transport defaults applied
        let extra = inventory.get_targets("app9").unwrap();
        assert_eq!(extra[0].user(), Some("deploy"));
        let local = inventory.get_targets("localhost").unwrap();
        assert_eq!(local[0].transport, TransportKind::Local);
    }

    #[test]
    fn test_errors() {
        let err = StaticInventory::from_toml_str("[transports.telnet]\nuser = \"x\"\n").unwrap_err();
        assert!(matches!(
            err,
            CoreError::Validation(ValidationError::UnknownTransport(_))
        ));

        let err = StaticInventory::from_toml_str("[[targets]]\nuri = \"web1\"\nconfig = { password = { _plugin = \"vault\" } }\n")
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Validation(ValidationError::UnresolvedConfig { .. })
        ));

        let err = StaticInventory::from_toml_str("targets = 3").unwrap_err();
        assert!(matches!(err, CoreError::InventoryParse { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.toml");
        std::fs::write(&path, INVENTORY).unwrap();

        let inventory = StaticInventory::load_default(Some(&path)).unwrap();
        assert_eq!(inventory.targets().len(), 3);

        let err = StaticInventory::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, CoreError::InventoryRead { .. }));
    }
}
