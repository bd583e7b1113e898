//! Preset scenario table
//!
//! Presets name a set of clock floors/ceilings that a model can ask for by
//! id. They are read from a JSON document:
//!
//! ```json
//! { "external_presets": [
//!     { "PresetId": 3, "PresetName": "camera",
//!       "PresetVars": { "NPU_FREQ": 800000, "MIF_FREQ": 2000000, "DD_KPI_MODE": 1 },
//!       "PresetType": 1, "PresetPriority": 50 } ] }
//! ```
//!
//! A var of 0 (or absent) means "leave this domain alone" and is stored as -1.

use crate::error::{AccelError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Stored value of an unset preset var
pub const PRESET_VAR_NOT_USED: i32 = -1;

const USER_ID_MIN: i32 = 0x0000_0001;
const USER_ID_MAX: i32 = 0x0000_FFFF;
const LOCAL_ID_MIN: i32 = 0x0001_0000;
const LOCAL_ID_STEP: i32 = 0x0001_0000;
const LOCAL_ID_MAX: i32 = 0x7FFF_0000;
const PRIORITY_MIN: u32 = 1;
const PRIORITY_MAX: u32 = 100;

/// Lookup of preset scenarios by id
pub trait PresetSource: Send + Sync + std::fmt::Debug {
    /// Scenario for `id`, if known
    fn lookup(&self, id: i32) -> Option<PresetScenario>;
}

/// Clock targets of one preset
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct PresetScenario {
    pub id: i32,
    pub name: String,
    pub npu_freq: i32,
    pub dnc_freq: i32,
    pub dsp_freq: i32,
    pub mif_freq: i32,
    pub int_freq: i32,
    pub cpu_lit_freq: i32,
    pub cpu_mid_freq: i32,
    pub cpu_big_freq: i32,
    pub mo_scenario: i32,
    pub cpu_affinity: i32,
    /// 1 forces blocking boost
    pub dd_kpi_mode: i32,
    /// 1..=100
    pub priority: u32,
    /// 1 open/close, 2 execute only, 0 per-var scenario
    pub preset_type: u32,
}

impl PresetScenario {
    /// Scenario with every var unset
    pub fn unset() -> Self {
        Self {
            id: 0,
            name: String::new(),
            npu_freq: PRESET_VAR_NOT_USED,
            dnc_freq: PRESET_VAR_NOT_USED,
            dsp_freq: PRESET_VAR_NOT_USED,
            mif_freq: PRESET_VAR_NOT_USED,
            int_freq: PRESET_VAR_NOT_USED,
            cpu_lit_freq: PRESET_VAR_NOT_USED,
            cpu_mid_freq: PRESET_VAR_NOT_USED,
            cpu_big_freq: PRESET_VAR_NOT_USED,
            mo_scenario: PRESET_VAR_NOT_USED,
            cpu_affinity: PRESET_VAR_NOT_USED,
            dd_kpi_mode: PRESET_VAR_NOT_USED,
            priority: PRIORITY_MIN,
            preset_type: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PresetDocument {
    #[serde(default)]
    external_presets: Vec<PresetEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PresetEntry {
    preset_id: i32,
    #[serde(default)]
    preset_name: String,
    #[serde(default, rename = "name")]
    alt_name: String,
    #[serde(default)]
    preset_vars: PresetVars,
    #[serde(default)]
    preset_type: u32,
    #[serde(default)]
    preset_priority: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
struct PresetVars {
    npu_freq: i32,
    dnc_freq: i32,
    dsp_freq: i32,
    mif_freq: i32,
    int_freq: i32,
    cpu_lit_freq: i32,
    cpu_mid_freq: i32,
    cpu_big_freq: i32,
    mo_scenario: i32,
    cpu_affinity: i32,
    dd_kpi_mode: i32,
}

const fn var(value: i32) -> i32 {
    if value == 0 {
        PRESET_VAR_NOT_USED
    } else {
        value
    }
}

/// Preset scenarios keyed by id
#[derive(Debug, Clone, Default)]
pub struct PresetTable {
    by_id: BTreeMap<i32, PresetScenario>,
    next_local_id: i32,
}

impl PresetTable {
    /// Table with no presets
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load a preset file; a missing file gives an empty table
    ///
    /// # Errors
    ///
    /// Returns an I/O error for an unreadable file, [`AccelError::Json`] for
    /// malformed JSON and [`AccelError::Preset`] for a priority outside 1..=100.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let table = Self::parse(&text)?;
                info!("Loaded {} presets from {}", table.len(), path.display());
                Ok(table)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No preset file at {}", path.display());
                Ok(Self::empty())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parse a preset document
    ///
    /// # Errors
    ///
    /// See [`PresetTable::load`].
    pub fn parse(text: &str) -> Result<Self> {
        let doc: PresetDocument = serde_json::from_str(text)?;
        let mut table = Self::empty();
        for entry in doc.external_presets {
            let scenario = table.scenario_from(entry)?;
            table.insert(scenario);
        }
        Ok(table)
    }

    fn local_id(&mut self) -> i32 {
        self.next_local_id = if self.next_local_id < LOCAL_ID_MIN
            || self.next_local_id >= LOCAL_ID_MAX
        {
            LOCAL_ID_MIN
        } else {
            self.next_local_id + LOCAL_ID_STEP
        };
        self.next_local_id
    }

    fn scenario_from(&mut self, entry: PresetEntry) -> Result<PresetScenario> {
        let id = if (USER_ID_MIN..=USER_ID_MAX).contains(&entry.preset_id) {
            entry.preset_id
        } else {
            let local = self.local_id();
            warn!("user preset id ({}) is not available, using {local:#x}", entry.preset_id);
            local
        };

        if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&entry.preset_priority) {
            return Err(AccelError::preset(format!(
                "preset {id}: priority {} outside {PRIORITY_MIN}..={PRIORITY_MAX}",
                entry.preset_priority
            )));
        }

        let name = if !entry.preset_name.is_empty() {
            entry.preset_name
        } else if !entry.alt_name.is_empty() {
            entry.alt_name
        } else {
            format!("preset_{id}")
        };

        let v = entry.preset_vars;
        Ok(PresetScenario {
            id,
            name,
            npu_freq: var(v.npu_freq),
            dnc_freq: var(v.dnc_freq),
            dsp_freq: var(v.dsp_freq),
            mif_freq: var(v.mif_freq),
            int_freq: var(v.int_freq),
            cpu_lit_freq: var(v.cpu_lit_freq),
            cpu_mid_freq: var(v.cpu_mid_freq),
            cpu_big_freq: var(v.cpu_big_freq),
            mo_scenario: var(v.mo_scenario),
            cpu_affinity: var(v.cpu_affinity),
            dd_kpi_mode: var(v.dd_kpi_mode),
            priority: entry.preset_priority,
            preset_type: entry.preset_type,
        })
    }

    /// Add a scenario; a duplicate id or name is logged and the first kept
    pub fn insert(&mut self, scenario: PresetScenario) {
        if self.by_id.contains_key(&scenario.id) {
            warn!("preset id ({}) is already in the preset table", scenario.id);
            return;
        }
        if !scenario.name.is_empty() && self.by_name(&scenario.name).is_some() {
            warn!("preset name ({}) is already in the preset table", scenario.name);
        }
        self.by_id.insert(scenario.id, scenario);
    }

    /// Scenario named `name`
    pub fn by_name(&self, name: &str) -> Option<&PresetScenario> {
        self.by_id.values().find(|s| s.name == name)
    }

    /// Scenarios in id order
    pub fn iter(&self) -> impl Iterator<Item = &PresetScenario> {
        self.by_id.values()
    }

    /// Number of scenarios
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// True when no scenario is loaded
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl PresetSource for PresetTable {
    fn lookup(&self, id: i32) -> Option<PresetScenario> {
        if id <= 0 {
            return None;
        }
        self.by_id.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DOC: &str = r#"{
        "external_presets": [
            { "PresetId": 3, "PresetName": "camera",
              "PresetVars": { "NPU_FREQ": 800000, "MIF_FREQ": 2000000, "DD_KPI_MODE": 1 },
              "PresetType": 1, "PresetPriority": 50 },
            { "PresetId": 7, "name": "voice",
              "PresetVars": { "CPU_MID_FREQ": 1500000 }, "PresetPriority": 10 }
        ]
    }"#;

    #[test]
    fn parses_vars_and_names() {
        let table = PresetTable::parse(DOC).unwrap();
        assert_eq!(table.len(), 2);

        let camera = table.lookup(3).unwrap();
        assert_eq!(camera.name, "camera");
        assert_eq!(camera.npu_freq, 800_000);
        assert_eq!(camera.dnc_freq, PRESET_VAR_NOT_USED);
        assert_eq!(camera.dd_kpi_mode, 1);

        let voice = table.lookup(7).unwrap();
        assert_eq!(voice.name, "voice");
        assert_eq!(voice.cpu_mid_freq, 1_500_000);
    }

    #[test]
    fn lookup_ignores_non_positive_ids() {
        let table = PresetTable::parse(DOC).unwrap();
        assert!(table.lookup(0).is_none());
        assert!(table.lookup(-3).is_none());
        assert!(table.lookup(99).is_none());
    }

    #[test]
    fn priority_out_of_range_fails() {
        let doc = r#"{"external_presets":[{"PresetId":1,"PresetPriority":101}]}"#;
        assert!(matches!(PresetTable::parse(doc), Err(AccelError::Preset { .. })));
        let doc = r#"{"external_presets":[{"PresetId":1}]}"#;
        assert!(PresetTable::parse(doc).is_err());
    }

    #[test]
    fn duplicate_id_keeps_first() {
        let doc = r#"{"external_presets":[
            {"PresetId":2,"PresetName":"a","PresetPriority":1},
            {"PresetId":2,"PresetName":"b","PresetPriority":1}]}"#;
        let table = PresetTable::parse(doc).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup(2).unwrap().name, "a");
    }

    #[test]
    fn out_of_range_id_gets_local_id() {
        let doc = r#"{"external_presets":[{"PresetId":70000,"PresetPriority":1}]}"#;
        let table = PresetTable::parse(doc).unwrap();
        let scenario = table.iter().next().unwrap();
        assert_eq!(scenario.id, LOCAL_ID_MIN);
        assert_eq!(scenario.name, format!("preset_{LOCAL_ID_MIN}"));
    }

    #[test]
    fn load_reads_file_and_tolerates_absence() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DOC.as_bytes()).unwrap();
        assert_eq!(PresetTable::load(file.path()).unwrap().len(), 2);

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("none.json");
        assert!(PresetTable::load(&missing).unwrap().is_empty());
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(PresetTable::parse("{"), Err(AccelError::Json { .. })));
    }
}
