//! The cluster inventory: which units exist and which of them are active.
//! `$broadcast` reaches only active units.
//!
//! ```toml
//! [[units]]
//! name = "unit1"
//!
//! [[units]]
//! name = "unit2"
//! active = false
//! ```

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::path::Path;

use vessel_unit::cluster::Inventory;
use vessel_unit::pubsub::Transport;
use vessel_unit::topic::{BROADCAST, CLUSTER, INVENTORY};

pub fn parse(contents: &str) -> Result<Inventory> {
    let inventory: Inventory = toml::from_str(contents).context("failed to parse inventory")?;
    validate(&inventory)?;
    Ok(inventory)
}

/// A missing file is an empty inventory.
pub fn load(path: &Path) -> Result<Inventory> {
    if !path.exists() {
        return Ok(Inventory::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read inventory: {}", path.display()))?;
    parse(&contents).with_context(|| path.display().to_string())
}

fn validate(inventory: &Inventory) -> Result<()> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for (i, u) in inventory.units.iter().enumerate() {
        let name = u.name.trim();
        if name.is_empty() {
            errors.push(format!("units[{i}]: name is empty"));
        } else if name.contains(['/', '+', '#']) || name == BROADCAST || name == CLUSTER {
            errors.push(format!("unit '{name}': not usable as a topic level"));
        } else if !seen.insert(name) {
            errors.push(format!("unit '{name}': listed twice"));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        bail!("invalid inventory:\n  - {}", errors.join("\n  - "));
    }
}

pub async fn publish(transport: &dyn Transport, inventory: &Inventory) -> Result<()> {
    transport
        .publish_retained(INVENTORY, &serde_json::to_string(inventory)?)
        .await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
