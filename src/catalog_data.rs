//! Built-in frequency-group catalog, with an optional on-disk override.
//!
//! The core treats the catalog as an opaque name→entries resolver; this
//! module owns the actual data, which is the kind of static lookup table
//! that belongs in the binary, not the library.

use scanner_core::{FrequencyEntry, FrequencyGroupCatalog, Modulation};
use std::collections::HashMap;
use std::path::Path;

pub struct BuiltinCatalog {
    groups: HashMap<String, Vec<FrequencyEntry>>,
}

impl BuiltinCatalog {
    /// Built-in groups plus whatever `catalog.json` in `base_dir` adds or
    /// overrides. A malformed or missing override file is not fatal; the
    /// built-in table is still usable.
    pub fn load(base_dir: &Path) -> Self {
        let mut groups = default_groups();

        let override_path = base_dir.join("catalog.json");
        match std::fs::read_to_string(&override_path) {
            Ok(contents) => match serde_json::from_str::<HashMap<String, Vec<FrequencyEntry>>>(&contents) {
                Ok(overrides) => {
                    for (name, entries) in overrides {
                        groups.insert(name, entries);
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, path = %override_path.display(), "ignoring malformed catalog override");
                }
            },
            Err(_) => {}
        }

        BuiltinCatalog { groups }
    }
}

impl FrequencyGroupCatalog for BuiltinCatalog {
    fn resolve(&self, name: &str) -> Option<Vec<FrequencyEntry>> {
        self.groups.get(name).cloned()
    }
}

fn entry(freq_mhz: f64, mode: Modulation, label: &str) -> FrequencyEntry {
    FrequencyEntry::new(freq_mhz, mode, Some(label.to_string()))
        .expect("built-in catalog entries are always in range")
}

fn default_groups() -> HashMap<String, Vec<FrequencyEntry>> {
    let mut groups = HashMap::new();

    groups.insert(
        "noaa-weather".to_string(),
        vec![
            entry(162.400, Modulation::Nfm, "WX1"),
            entry(162.425, Modulation::Nfm, "WX2"),
            entry(162.450, Modulation::Nfm, "WX3"),
            entry(162.475, Modulation::Nfm, "WX4"),
            entry(162.500, Modulation::Nfm, "WX5"),
            entry(162.525, Modulation::Nfm, "WX6"),
            entry(162.550, Modulation::Nfm, "WX7"),
        ],
    );

    groups.insert(
        "ham-2m-calling".to_string(),
        vec![
            entry(146.520, Modulation::Nfm, "2m_Simplex"),
            entry(144.200, Modulation::Usb, "2m_SSB_Calling"),
        ],
    );

    groups.insert(
        "frs-gmrs".to_string(),
        vec![
            entry(462.5625, Modulation::Nfm, "GMRS1"),
            entry(462.5875, Modulation::Nfm, "GMRS2"),
            entry(462.6125, Modulation::Nfm, "GMRS3"),
            entry(467.5625, Modulation::Nfm, "FRS8"),
        ],
    );

    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_group() {
        let catalog = BuiltinCatalog { groups: default_groups() };
        let entries = catalog.resolve("noaa-weather").unwrap();
        assert_eq!(entries.len(), 7);
    }

    #[test]
    fn unknown_group_resolves_to_none() {
        let catalog = BuiltinCatalog { groups: default_groups() };
        assert!(catalog.resolve("does-not-exist").is_none());
    }
}
