//! Cluster configuration: the shared TOML file every unit inherits and the
//! per-unit override files, validated together and published retained for
//! units to pick up at job start.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

use vessel_unit::config::from_layers;
use vessel_unit::pubsub::Transport;
use vessel_unit::topic::{unit_config_topic, CONFIG_SHARED};

// ---------------------------------------------------------------------------
// Layers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    pub shared: toml::Value,
    /// Override layer per unit name, from `<unit>.toml` in the units dir.
    pub units: BTreeMap<String, toml::Value>,
}

fn empty() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

fn read_toml(path: &Path) -> Result<toml::Value> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse config: {}", path.display()))
}

/// Read the shared file and every `*.toml` in `units_dir`. Either may be
/// missing, in which case it contributes nothing.
pub fn load(shared: &Path, units_dir: &Path) -> Result<ClusterConfig> {
    let shared = if shared.exists() {
        read_toml(shared)?
    } else {
        empty()
    };

    let mut units = BTreeMap::new();
    if units_dir.is_dir() {
        let entries = std::fs::read_dir(units_dir)
            .with_context(|| format!("failed to list {}", units_dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let Some(unit) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            units.insert(unit.to_string(), read_toml(&path)?);
        }
    }
    Ok(ClusterConfig { shared, units })
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl ClusterConfig {
    /// Validate the effective config of every unit named in `units` (plus
    /// every unit with an override file). Reports every unit that fails,
    /// not just the first.
    pub fn validate<'a, I>(&self, units: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut names: Vec<&str> = units.into_iter().collect();
        names.extend(self.units.keys().map(String::as_str));
        names.sort_unstable();
        names.dedup();

        let mut errors: Vec<String> = Vec::new();
        if let Err(e) = from_layers([self.shared.clone()]) {
            errors.push(format!("shared config: {e:#}"));
        }
        for unit in names {
            let layers = [self.shared.clone(), self.units.get(unit).cloned().unwrap_or_else(empty)];
            if let Err(e) = from_layers(layers) {
                errors.push(format!("unit '{unit}': {e:#}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    /// Retained shared layer on `_cluster/config/$broadcast` and one
    /// override per unit on `_cluster/config/<unit>`.
    pub async fn publish(&self, transport: &dyn Transport) -> Result<()> {
        transport
            .publish_retained(CONFIG_SHARED, &toml::to_string(&self.shared)?)
            .await?;
        for (unit, layer) in &self.units {
            transport
                .publish_retained(&unit_config_topic(unit), &toml::to_string(layer)?)
                .await?;
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
