//! Optional TOML overlay for copy options.
//!
//! Sections apply from the most generic to the most specific, with the
//! caller's own options winning over everything from the file:
//! `[copy]`, `[copy-<to|from>]`, `["copy:<ks>.<table>"]`,
//! `["copy-<dir>:<ks>.<table>"]`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context as _, Result};
use ringcopy::options::Direction;
use serde::Deserialize;

/// Raw file shape: every top-level table is a section of scalar values.
#[derive(Debug, Default, Deserialize)]
#[serde(transparent)]
struct RawConfig {
    sections: BTreeMap<String, BTreeMap<String, toml::Value>>,
}

/// Parsed overlay file: section name to key/value map.
#[derive(Debug, Default)]
pub struct OverlayConfig {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl OverlayConfig {
    /// Load an overlay from a TOML file.
    ///
    /// Returns the empty overlay if the file does not exist, so a run
    /// works without any configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let raw: RawConfig =
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let sections = raw
            .sections
            .into_iter()
            .map(|(name, entries)| {
                let map = entries
                    .into_iter()
                    .map(|(key, v)| (key, toml_to_string(&v)))
                    .collect();
                (name, map)
            })
            .collect();
        Ok(Self { sections })
    }

    /// Merge the applicable sections for one run, most specific last,
    /// then the caller's options on top.
    #[must_use]
    pub fn merge(
        &self,
        direction: Direction,
        keyspace: &str,
        table: &str,
        caller: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let dir = direction.as_str();
        let section_names = [
            "copy".to_owned(),
            format!("copy-{dir}"),
            format!("copy:{keyspace}.{table}"),
            format!("copy-{dir}:{keyspace}.{table}"),
        ];
        let mut merged = BTreeMap::new();
        for name in &section_names {
            if let Some(section) = self.sections.get(name) {
                tracing::debug!(section = %name, options = ?section, "reading overlay options");
                merged.extend(section.clone());
            }
        }
        merged.extend(caller.clone());
        merged
    }
}

fn toml_to_string(v: &toml::Value) -> String {
    match v {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
