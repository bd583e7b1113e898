//! Performance mode, priority and clock requests
//!
//! A model is opened with a [`ModePreference`]; it maps to a driver
//! [`PerfMode`] and, together with a preset scenario or the SoC frequency
//! table, to the S_PARAM list sent at open, close and around each execute.

use crate::error::{AccelError, Result};
use crate::preset::{PresetScenario, PresetSource};
use tracing::{debug, warn};
use vs4l_abi::param::{
    perf_mode, target, SocFrequencies, BOUND_NA, DSP_BOOST_FREQ, REQ_PRIORITY_DEFAULT,
    REQ_PRIORITY_MAX,
};
use vs4l_abi::wire::vs4l_param;

/// Caller-side performance preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModePreference {
    /// Baseline clocks
    #[default]
    Normal,
    /// Boost while the model is open
    Boost,
    /// Boost only while a request executes
    BoostOnExecute,
    /// Deprecated, behaves as normal
    Benchmark,
    /// Deprecated, behaves as normal
    Reserved,
    /// Deprecated, behaves as normal
    BoostAux,
    /// Boost with blocking DVFS
    BoostBlocking,
}

impl ModePreference {
    /// Map the operator list's pref mode (0 normal, 1 boost, 2 boost on
    /// execute, 3 boost blocking). Anything else falls back to boost on
    /// execute with a warning.
    pub fn from_pref_mode(pref_mode: u32) -> Self {
        match pref_mode {
            0 => Self::Normal,
            1 => Self::Boost,
            2 => Self::BoostOnExecute,
            3 => Self::BoostBlocking,
            other => {
                warn!("Invalid perf_mode value:{other}, using boost on execute");
                Self::BoostOnExecute
            }
        }
    }

    /// Driver perf mode for this preference
    pub const fn perf_mode(self) -> PerfMode {
        match self {
            Self::Normal | Self::Benchmark | Self::Reserved | Self::BoostAux => PerfMode::None,
            Self::Boost => PerfMode::NpuBoost,
            Self::BoostOnExecute => PerfMode::NpuBoostOnExecute,
            Self::BoostBlocking => PerfMode::NpuBoostBlocking,
        }
    }
}

/// Value of the `PERF_MODE` prefer target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PerfMode {
    /// Baseline
    #[default]
    None,
    /// Boost on execute
    NpuBoostOnExecute,
    /// Boost
    NpuBoost,
    /// Blocking boost
    NpuBoostBlocking,
}

impl PerfMode {
    /// Wire value
    pub const fn raw(self) -> u32 {
        match self {
            Self::None => perf_mode::NONE,
            Self::NpuBoostOnExecute => perf_mode::NPU_BOOST_ON_EXECUTE,
            Self::NpuBoost => perf_mode::NPU_BOOST,
            Self::NpuBoostBlocking => perf_mode::NPU_BOOST_BLOCKING,
        }
    }
}

/// Resolved performance request for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerfOption {
    /// Driver perf mode
    pub mode: PerfMode,
    /// Request priority, below 256
    pub priority: u32,
    /// Target time per frame in microseconds, 0 for none
    pub latency: u32,
    /// Bound core or `BOUND_NA`
    pub bound: u32,
    /// Preset scenario id, 0 or negative for none
    pub preset_id: i32,
}

impl PerfOption {
    /// Build an option, rejecting priority >= 256
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::InvalidArgument`] for an out-of-range priority.
    pub fn new(
        preference: ModePreference,
        priority: u32,
        latency: u32,
        bound: u32,
        preset_id: i32,
    ) -> Result<Self> {
        if priority >= REQ_PRIORITY_MAX {
            return Err(AccelError::invalid_argument(format!(
                "invalid priority({priority})"
            )));
        }
        debug!(
            "mode:{preference:?}, priority:{priority}, latency:{latency}, bound:{bound:#x}, preset_id:{preset_id}"
        );
        Ok(Self {
            mode: preference.perf_mode(),
            priority,
            latency,
            bound,
            preset_id,
        })
    }

    /// Option used to drop back to baseline clocks
    pub fn baseline() -> Self {
        Self {
            mode: PerfMode::None,
            priority: REQ_PRIORITY_DEFAULT,
            latency: 0,
            bound: BOUND_NA,
            preset_id: 0,
        }
    }
}

fn param(target: u32, offset: u32) -> vs4l_param {
    vs4l_param {
        target,
        offset,
        ..vs4l_param::default()
    }
}

#[allow(clippy::cast_sign_loss)]
fn push_pair(params: &mut Vec<vs4l_param>, freq: i32, first: u32, second: u32) {
    if freq > 0 {
        params.push(param(first, freq as u32));
        params.push(param(second, freq as u32));
    }
}

fn preset_params(params: &mut Vec<vs4l_param>, mode: PerfMode, preset: &PresetScenario) {
    debug!(
        "Preset {}: CPU(lit):{} CPU(mid):{} CPU(big):{} NPU:{} DNC:{} DSP:{} MIF:{} INT:{} KPI:{}",
        preset.id,
        preset.cpu_lit_freq,
        preset.cpu_mid_freq,
        preset.cpu_big_freq,
        preset.npu_freq,
        preset.dnc_freq,
        preset.dsp_freq,
        preset.mif_freq,
        preset.int_freq,
        preset.dd_kpi_mode
    );

    let mode = if preset.dd_kpi_mode == 1 {
        PerfMode::NpuBoostBlocking
    } else {
        mode
    };
    params.push(param(target::PERF_MODE, mode.raw()));

    push_pair(params, preset.npu_freq, target::QOS_NPU_MAX, target::QOS_NPU);
    push_pair(params, preset.dnc_freq, target::QOS_DNC, target::QOS_DNC_MAX);
    push_pair(params, preset.dsp_freq, target::QOS_DSP, target::QOS_DSP_MAX);
    push_pair(params, preset.cpu_lit_freq, target::QOS_CL0, target::QOS_CL0_MAX);
    push_pair(params, preset.cpu_mid_freq, target::QOS_CL1, target::QOS_CL1_MAX);
    push_pair(params, preset.cpu_big_freq, target::QOS_CL2, target::QOS_CL2_MAX);
    push_pair(params, preset.mif_freq, target::QOS_MIF, target::QOS_MIF_MAX);
    push_pair(params, preset.int_freq, target::QOS_INT, target::QOS_INT_MAX);
}

/// S_PARAM list applied at model open and close
///
/// Latency goes first when set. Boost-on-execute sends nothing else here;
/// its clocks are raised per request by [`execution_params`].
pub fn open_close_params(
    option: &PerfOption,
    presets: &dyn PresetSource,
    max_freq: &SocFrequencies,
) -> Vec<vs4l_param> {
    let mut params = Vec::new();

    if option.latency != 0 {
        params.push(param(target::TPF, option.latency));
    }

    match option.mode {
        PerfMode::NpuBoostOnExecute => {}
        PerfMode::None => params.push(param(target::PERF_MODE, option.mode.raw())),
        mode => {
            let preset = if option.preset_id > 0 {
                let found = presets.lookup(option.preset_id);
                if found.is_none() {
                    debug!("preset {} not found", option.preset_id);
                }
                found
            } else {
                None
            };

            match preset {
                Some(preset) => preset_params(&mut params, mode, &preset),
                None => {
                    params.push(param(target::PERF_MODE, mode.raw()));
                    params.push(param(target::QOS_CL1, max_freq.cl1_max));
                    params.push(param(target::QOS_DSP, DSP_BOOST_FREQ));
                }
            }
        }
    }

    params
}

/// S_PARAM list sent around one execute of a boost-on-execute session
///
/// # Errors
///
/// Returns [`AccelError::InvalidArgument`] for modes other than none and
/// boost on execute.
pub fn execution_params(mode: PerfMode, tuned_freq: &SocFrequencies) -> Result<Vec<vs4l_param>> {
    let cl1 = match mode {
        PerfMode::None => 0,
        PerfMode::NpuBoostOnExecute => tuned_freq.cl1_max,
        other => {
            return Err(AccelError::invalid_argument(format!(
                "mode {other:?} is not an execution boost"
            )));
        }
    };
    Ok(vec![
        param(target::PERF_MODE, mode.raw()),
        param(target::QOS_CL1, cl1),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preset::PresetTable;
    use vs4l_abi::param::EXYNOS9925;

    fn option(pref: ModePreference, latency: u32, preset_id: i32) -> PerfOption {
        PerfOption::new(pref, 0, latency, BOUND_NA, preset_id).unwrap()
    }

    fn targets(params: &[vs4l_param]) -> Vec<(u32, u32)> {
        params.iter().map(|p| (p.target, p.offset)).collect()
    }

    #[test]
    fn pref_mode_mapping() {
        assert_eq!(ModePreference::from_pref_mode(0), ModePreference::Normal);
        assert_eq!(ModePreference::from_pref_mode(3), ModePreference::BoostBlocking);
        assert_eq!(ModePreference::from_pref_mode(9), ModePreference::BoostOnExecute);
        assert_eq!(ModePreference::Benchmark.perf_mode(), PerfMode::None);
        assert_eq!(ModePreference::Boost.perf_mode().raw(), perf_mode::NPU_BOOST);
    }

    #[test]
    fn priority_bound_is_exclusive() {
        assert!(PerfOption::new(ModePreference::Normal, 255, 0, BOUND_NA, 0).is_ok());
        assert!(PerfOption::new(ModePreference::Normal, 256, 0, BOUND_NA, 0).is_err());
    }

    #[test]
    fn normal_mode_sends_perf_mode_only() {
        let params = open_close_params(
            &option(ModePreference::Normal, 0, 0),
            &PresetTable::empty(),
            &EXYNOS9925,
        );
        assert_eq!(targets(&params), vec![(target::PERF_MODE, 0)]);
    }

    #[test]
    fn boost_without_preset_uses_frequency_table() {
        let params = open_close_params(
            &option(ModePreference::Boost, 1000, 0),
            &PresetTable::empty(),
            &EXYNOS9925,
        );
        assert_eq!(
            targets(&params),
            vec![
                (target::TPF, 1000),
                (target::PERF_MODE, perf_mode::NPU_BOOST),
                (target::QOS_CL1, 2_304_000),
                (target::QOS_DSP, 1_066_000),
            ]
        );
    }

    #[test]
    fn boost_on_execute_sends_latency_only() {
        let params = open_close_params(
            &option(ModePreference::BoostOnExecute, 0, 0),
            &PresetTable::empty(),
            &EXYNOS9925,
        );
        assert!(params.is_empty());
    }

    #[test]
    fn preset_emits_pairs_for_set_domains() {
        let mut table = PresetTable::empty();
        table.insert(PresetScenario {
            id: 3,
            name: "camera".into(),
            npu_freq: 800_000,
            mif_freq: 2_000_000,
            dd_kpi_mode: 1,
            ..PresetScenario::unset()
        });
        let params = open_close_params(&option(ModePreference::Boost, 0, 3), &table, &EXYNOS9925);
        assert_eq!(
            targets(&params),
            vec![
                (target::PERF_MODE, perf_mode::NPU_BOOST_BLOCKING),
                (target::QOS_NPU_MAX, 800_000),
                (target::QOS_NPU, 800_000),
                (target::QOS_MIF, 2_000_000),
                (target::QOS_MIF_MAX, 2_000_000),
            ]
        );
    }

    #[test]
    fn execution_boost_values() {
        let on = execution_params(PerfMode::NpuBoostOnExecute, &EXYNOS9925).unwrap();
        assert_eq!(
            targets(&on),
            vec![(target::PERF_MODE, 1), (target::QOS_CL1, 2_304_000)]
        );
        let off = execution_params(PerfMode::None, &EXYNOS9925).unwrap();
        assert_eq!(targets(&off), vec![(target::PERF_MODE, 0), (target::QOS_CL1, 0)]);
        assert!(execution_params(PerfMode::NpuBoost, &EXYNOS9925).is_err());
    }
}
