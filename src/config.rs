//! Server configuration file: `serverSettings` hyperparameters plus the
//! top-level `knobs`/`loopKnobs` arrays that define the tunable space
//! (spec §6). Loaded once at startup; any error here is fatal.

use std::path::Path;

use serde::Deserialize;

use crate::bakeoff::BakeoffParams;
use crate::errors::ConfigError;
use crate::knob::{loop_knob_id, Knob, KnobSet, OptLevel, Scale};
use crate::stopper::StatisticalStopper;
use crate::surrogate::GbtParams;
use crate::tuner::TunerParams;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(rename = "bakeoff-switch-rate")]
    pub bakeoff_switch_rate: u32,
    #[serde(rename = "bakeoff-max-switches")]
    pub bakeoff_max_switches: u32,
    #[serde(rename = "bakeoff-min-samples")]
    pub bakeoff_min_samples: usize,
    #[serde(rename = "bakeoff-confidence")]
    pub bakeoff_confidence: u32,
    #[serde(rename = "perf-sample-period")]
    pub perf_sample_period: u64,
    #[serde(rename = "callfreq-discount")]
    pub callfreq_discount: f64,
    #[serde(rename = "pbtuner-learn-iters")]
    pub pbtuner_learn_iters: usize,
    #[serde(rename = "pbtuner-batch-size")]
    pub pbtuner_batch_size: usize,
    #[serde(rename = "pbtuner-surrogate-batch-size")]
    pub pbtuner_surrogate_batch_size: usize,
    #[serde(rename = "pbtuner-min-prior")]
    pub pbtuner_min_prior: usize,
    #[serde(rename = "pbtuner-heldout-ratio")]
    pub pbtuner_heldout_ratio: f64,
    #[serde(rename = "pbtuner-explore-ratio")]
    pub pbtuner_explore_ratio: f64,
    #[serde(rename = "pbtuner-surrogate-explore-ratio")]
    pub pbtuner_surrogate_explore_ratio: f64,
    #[serde(rename = "pbtuner-energy-level")]
    pub pbtuner_energy_level: f64,
    #[serde(rename = "ts-max-dupes-row")]
    pub ts_max_dupes_row: u32,
    pub seed: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let bakeoff = BakeoffParams::default();
        let tuner = TunerParams::default();
        ServerSettings {
            bakeoff_switch_rate: bakeoff.switch_rate,
            bakeoff_max_switches: bakeoff.max_switches,
            bakeoff_min_samples: bakeoff.min_samples,
            bakeoff_confidence: 95,
            perf_sample_period: bakeoff.sampling_period,
            callfreq_discount: crate::profiler::DEFAULT_DECAY,
            pbtuner_learn_iters: tuner.gbt.learn_iters,
            pbtuner_batch_size: tuner.total_batch_sz,
            pbtuner_surrogate_batch_size: tuner.search_sz,
            pbtuner_min_prior: tuner.min_prior,
            pbtuner_heldout_ratio: 0.2,
            pbtuner_explore_ratio: tuner.explore_ratio,
            pbtuner_surrogate_explore_ratio: tuner.explore_ratio,
            pbtuner_energy_level: tuner.perturb_energy,
            ts_max_dupes_row: 10,
            seed: 0,
        }
    }
}

/// Raw wire shape of one knob spec, before it's resolved into a [`Knob`].
#[derive(Debug, Clone, Deserialize)]
pub struct KnobSpec {
    pub kind: String,
    pub name: String,
    pub default: Option<serde_json::Value>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub scale: Option<String>,
}

fn parse_scale(raw: Option<&str>) -> Result<Scale, ConfigError> {
    Ok(match raw.unwrap_or("none") {
        "none" => Scale::None,
        "1/2" => Scale::Half,
        "1/100" => Scale::Hundredth,
        "log" => Scale::Log,
        other => return Err(ConfigError::InvalidKnobScale(other.to_string())),
    })
}

impl KnobSpec {
    fn resolve(&self) -> Result<Knob, ConfigError> {
        match self.kind.as_str() {
            "flag" => {
                let value = match &self.default {
                    None | Some(serde_json::Value::Null) => None,
                    Some(v) => Some(v.as_bool().ok_or_else(|| ConfigError::OutOfRange {
                        field: "default",
                        range: "true or false",
                        value: v.to_string(),
                    })?),
                };
                Ok(Knob::Flag(value))
            }
            "optlvl" => {
                let value = match &self.default {
                    None | Some(serde_json::Value::Null) => None,
                    Some(v) => {
                        let idx = v.as_i64().ok_or_else(|| ConfigError::OutOfRange {
                            field: "default",
                            range: "0..=3",
                            value: v.to_string(),
                        })?;
                        Some(OptLevel::from_index(idx))
                    }
                };
                Ok(Knob::OptLvl(value))
            }
            "int" => {
                let min = self.min.ok_or(ConfigError::MissingKey("min"))?;
                let max = self.max.ok_or(ConfigError::MissingKey("max"))?;
                if min > max {
                    return Err(ConfigError::OutOfRange {
                        field: "min",
                        range: "<= max",
                        value: min.to_string(),
                    });
                }
                let scale = parse_scale(self.scale.as_deref())?;
                let value = match &self.default {
                    None | Some(serde_json::Value::Null) => None,
                    Some(v) => {
                        let raw = v.as_i64().ok_or_else(|| ConfigError::OutOfRange {
                            field: "default",
                            range: "min..=max",
                            value: v.to_string(),
                        })?;
                        if raw < min || raw > max {
                            return Err(ConfigError::OutOfRange {
                                field: "default",
                                range: "min..=max",
                                value: raw.to_string(),
                            });
                        }
                        Some(raw)
                    }
                };
                Ok(Knob::Int { value, min, max, scale })
            }
            other => Err(ConfigError::InvalidKnobKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(rename = "serverSettings")]
    pub server_settings: ServerSettings,
    #[serde(default)]
    pub knobs: Vec<KnobSpec>,
    #[serde(default, rename = "loopKnobs")]
    pub loop_knobs: Vec<KnobSpec>,
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Builds the base `KnobSet` shared by every `CodeVersion` in a group:
    /// one entry per top-level knob, plus `loop_count` copies of each
    /// per-loop knob template expanded to `loop{i}-{name}` ids.
    pub fn base_knobs(&self, loop_count: u32) -> Result<KnobSet, ConfigError> {
        let mut set = KnobSet::new(loop_count);
        for spec in &self.knobs {
            set.insert(spec.name.clone(), spec.resolve()?);
        }
        for spec in &self.loop_knobs {
            let knob = spec.resolve()?;
            for i in 0..loop_count {
                set.insert(loop_knob_id(i, &spec.name), knob.clone());
            }
        }
        Ok(set)
    }

    pub fn bakeoff_params(&self) -> Result<BakeoffParams, ConfigError> {
        let s = &self.server_settings;
        let confidence = match s.bakeoff_confidence {
            95 => 0.95,
            99 => 0.99,
            other => {
                return Err(ConfigError::OutOfRange {
                    field: "bakeoff-confidence",
                    range: "95 or 99",
                    value: other.to_string(),
                })
            }
        };
        Ok(BakeoffParams {
            switch_rate: s.bakeoff_switch_rate,
            max_switches: s.bakeoff_max_switches,
            min_samples: s.bakeoff_min_samples,
            confidence,
            // overridden by `--halo-forcemerge`; the config file itself
            // carries no force-merge key.
            force_merge: false,
            sampling_period: s.perf_sample_period,
        })
    }

    pub fn tuner_params(&self) -> TunerParams {
        let s = &self.server_settings;
        TunerParams {
            min_prior: s.pbtuner_min_prior,
            search_sz: s.pbtuner_surrogate_batch_size,
            explore_ratio: s.pbtuner_explore_ratio,
            exploit_batch_sz: s.pbtuner_batch_size,
            total_batch_sz: s.pbtuner_batch_size,
            perturb_energy: s.pbtuner_energy_level,
            gbt: GbtParams {
                learn_iters: s.pbtuner_learn_iters,
                ..GbtParams::default()
            },
        }
    }

    pub fn stopper(&self) -> StatisticalStopper {
        StatisticalStopper::default()
    }

    pub fn max_dupes_in_row(&self) -> u32 {
        self.server_settings.ts_max_dupes_row
    }

    pub fn callfreq_discount(&self) -> f64 {
        self.server_settings.callfreq_discount
    }

    pub fn perf_sample_period(&self) -> u64 {
        self.server_settings.perf_sample_period
    }

    pub fn seed(&self) -> u64 {
        self.server_settings.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "serverSettings": {
                "bakeoff-switch-rate": 20,
                "bakeoff-max-switches": 6,
                "bakeoff-min-samples": 2,
                "bakeoff-confidence": 95,
                "perf-sample-period": 1000000,
                "callfreq-discount": 0.75,
                "pbtuner-learn-iters": 50,
                "pbtuner-batch-size": 10,
                "pbtuner-surrogate-batch-size": 200,
                "pbtuner-min-prior": 4,
                "pbtuner-heldout-ratio": 0.2,
                "pbtuner-explore-ratio": 0.3,
                "pbtuner-surrogate-explore-ratio": 0.3,
                "pbtuner-energy-level": 50.0,
                "ts-max-dupes-row": 10,
                "seed": 42
            },
            "knobs": [
                {"kind": "optlvl", "name": "opt-level", "default": 2, "min": null, "max": null, "scale": null},
                {"kind": "int", "name": "inline-threshold", "default": 225, "min": 0, "max": 1000, "scale": "none"}
            ],
            "loopKnobs": [
                {"kind": "flag", "name": "vectorize", "default": null, "min": null, "max": null, "scale": null}
            ]
        }"#
    }

    #[test]
    fn parses_full_config_and_builds_base_knobs() {
        let cfg: ServerConfig = serde_json::from_str(sample_json()).unwrap();
        let base = cfg.base_knobs(3).unwrap();
        assert!(base.contains("opt-level"));
        assert!(base.contains("inline-threshold"));
        assert!(base.contains("loop0-vectorize"));
        assert!(base.contains("loop2-vectorize"));
        assert!(!base.contains("loop3-vectorize"));
    }

    #[test]
    fn bakeoff_params_reflects_confidence_and_rate() {
        let cfg: ServerConfig = serde_json::from_str(sample_json()).unwrap();
        let params = cfg.bakeoff_params().unwrap();
        assert_eq!(params.confidence, 0.95);
        assert_eq!(params.switch_rate, 20);
        assert_eq!(params.sampling_period, 1_000_000);
    }

    #[test]
    fn invalid_confidence_is_rejected() {
        let mut cfg: ServerConfig = serde_json::from_str(sample_json()).unwrap();
        cfg.server_settings.bakeoff_confidence = 90;
        assert!(matches!(cfg.bakeoff_params(), Err(ConfigError::OutOfRange { .. })));
    }

    #[test]
    fn unknown_knob_kind_is_rejected() {
        let mut cfg: ServerConfig = serde_json::from_str(sample_json()).unwrap();
        cfg.knobs.push(KnobSpec {
            kind: "bogus".into(),
            name: "x".into(),
            default: None,
            min: None,
            max: None,
            scale: None,
        });
        assert!(matches!(cfg.base_knobs(0), Err(ConfigError::InvalidKnobKind(_))));
    }

    #[test]
    fn out_of_range_default_is_rejected() {
        let mut cfg: ServerConfig = serde_json::from_str(sample_json()).unwrap();
        cfg.knobs.push(KnobSpec {
            kind: "int".into(),
            name: "bad".into(),
            default: Some(serde_json::json!(5000)),
            min: Some(0),
            max: Some(100),
            scale: Some("none".into()),
        });
        assert!(matches!(cfg.base_knobs(0), Err(ConfigError::OutOfRange { .. })));
    }
}
