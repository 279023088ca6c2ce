// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fxcorr contributors

//! The declarative instrument descriptor.
//!
//! A TOML document with `[fengine]`, `[xengine]`, `[beamN]`, `[hosts]`
//! and optional `[timing]` / `[metadata]` sections. Per-input keys
//! (`input_<n>_name`, `input_<n>_destination`, `eq_poly_<name>`) and
//! per-beam weights (`weight_<label>`) are free-form within their
//! sections and captured through a flattened value map.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::StreamAddress;
use crate::eq::Eq;
use crate::error::Error as CoreError;

/// Names the config document when no `--config` flag is passed.
pub const CONFIG_ENV_VAR: &str = "FXCORR_CONFIG";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for CoreError {
    fn from(e: ConfigError) -> Self {
        CoreError::config("config", e)
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// The full instrument descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentConfig {
    pub fengine: FengineSection,
    pub xengine: XengineSection,
    pub hosts: HostsSection,
    #[serde(default)]
    pub timing: TimingSection,
    #[serde(default)]
    pub metadata: MetadataSection,
    /// `[beamN]` sections, collected by prefix scan, ordered by
    /// stream index.
    #[serde(skip)]
    pub beams: Vec<BeamSection>,
}

impl InstrumentConfig {
    /// Load from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load from the file named by `FXCORR_CONFIG`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV_VAR)
            .map_err(|_| invalid(format!("{CONFIG_ENV_VAR} is not set and no --config given")))?;
        Self::from_file(path)
    }

    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = toml::from_str(content)?;

        let mut beams = Vec::new();
        for (key, value) in &table {
            match key.strip_prefix("beam") {
                Some(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) => {}
                _ => continue,
            }
            let mut beam: BeamSection = value
                .clone()
                .try_into()
                .map_err(|e| invalid(format!("[{key}]: {e}")))?;
            beam.section = key.clone();
            beams.push(beam);
        }
        beams.sort_by_key(|b| b.stream_index);

        let mut config: InstrumentConfig = toml::Value::Table(table).try_into()?;
        config.beams = beams;
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants that do not need the hardware.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let f = &self.fengine;
        if f.n_chans == 0 || !f.n_chans.is_power_of_two() {
            return Err(invalid(format!(
                "fengine.n_chans must be a power of two, got {}",
                f.n_chans
            )));
        }
        if f.sample_rate_hz <= 0.0 {
            return Err(invalid("fengine.sample_rate_hz must be positive"));
        }
        if f.f_per_fpga == 0 {
            return Err(invalid("fengine.f_per_fpga must be at least 1"));
        }
        f.output_destination()?;

        let x = &self.xengine;
        if x.x_per_fpga == 0 {
            return Err(invalid("xengine.x_per_fpga must be at least 1"));
        }
        if x.xeng_accumulation_len == 0 || !x.xeng_accumulation_len.is_power_of_two() {
            return Err(invalid(format!(
                "xengine.xeng_accumulation_len must be a power of two, got {}",
                x.xeng_accumulation_len
            )));
        }
        if x.output_products.is_empty() {
            return Err(invalid("xengine.output_products must name a stream"));
        }
        x.output_destination()?;

        if self.hosts.fhosts.is_empty() {
            return Err(invalid("hosts.fhosts must list at least one host"));
        }
        if self.hosts.xhosts.is_empty() {
            return Err(invalid("hosts.xhosts must list at least one host"));
        }

        let inputs = f.inputs()?;
        let expected = self.hosts.fhosts.len() * f.f_per_fpga;
        if inputs.len() != expected {
            return Err(invalid(format!(
                "fengine input count {} does not match hosts.fhosts x f_per_fpga = {}",
                inputs.len(),
                expected
            )));
        }
        let mut names: Vec<&str> = inputs.iter().map(|i| i.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != inputs.len() {
            return Err(invalid("fengine input names must be unique"));
        }

        let mut seen_indices = Vec::new();
        for beam in &self.beams {
            if seen_indices.contains(&beam.stream_index) {
                return Err(invalid(format!(
                    "[{}]: duplicate stream_index {}",
                    beam.section, beam.stream_index
                )));
            }
            seen_indices.push(beam.stream_index);
            if beam.output_products.is_empty() {
                return Err(invalid(format!(
                    "[{}]: output_products must name a stream",
                    beam.section
                )));
            }
            beam.destination()?;
            let weights = beam.weights()?;
            for label in weights.keys() {
                if !inputs.iter().any(|i| &i.name == label) {
                    return Err(invalid(format!(
                        "[{}]: weight given for unknown input '{label}'",
                        beam.section
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One digitiser input as declared in `[fengine]`.
#[derive(Debug, Clone)]
pub struct InputSpec {
    pub number: usize,
    pub name: String,
    pub destination: StreamAddress,
    pub eq: Eq,
}

/// `[fengine]`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FengineSection {
    pub n_chans: usize,
    pub sample_rate_hz: f64,
    pub f_per_fpga: usize,
    pub default_eq_poly: Vec<f64>,
    /// Output multicast base; the compiler widens the range to one group
    /// per X-engine.
    pub destination_mcast_ips: String,
    #[serde(default = "default_fft_shift")]
    pub fft_shift: u32,
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

fn default_fft_shift() -> u32 {
    0x7fff
}

impl FengineSection {
    pub fn output_destination(&self) -> Result<StreamAddress, ConfigError> {
        StreamAddress::parse(&self.destination_mcast_ips).map_err(|e| {
            invalid(format!("fengine.destination_mcast_ips: {e}"))
        })
    }

    fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    /// The digitiser input list, ordered by input number.
    pub fn inputs(&self) -> Result<Vec<InputSpec>, ConfigError> {
        let mut out = Vec::new();
        for number in 0.. {
            let name = match self.extra_str(&format!("input_{number}_name")) {
                Some(n) => n.to_string(),
                None => break,
            };
            let dest_key = format!("input_{number}_destination");
            let dest = self
                .extra_str(&dest_key)
                .ok_or_else(|| invalid(format!("fengine.{dest_key} is missing")))?;
            let destination = StreamAddress::parse(dest)
                .map_err(|e| invalid(format!("fengine.{dest_key}: {e}")))?;
            let eq = match self.extra.get(&format!("eq_poly_{name}")) {
                Some(value) => Eq::from_poly(&poly_from_value(value, &name)?),
                None => Eq::from_poly(&self.default_eq_poly),
            };
            out.push(InputSpec {
                number,
                name,
                destination,
                eq,
            });
        }
        if out.is_empty() {
            return Err(invalid("fengine declares no inputs (input_0_name missing)"));
        }
        Ok(out)
    }
}

fn poly_from_value(value: &toml::Value, name: &str) -> Result<Vec<f64>, ConfigError> {
    let bad = || invalid(format!("fengine.eq_poly_{name} must be a number or number list"));
    match value {
        toml::Value::Integer(v) => Ok(vec![*v as f64]),
        toml::Value::Float(v) => Ok(vec![*v]),
        toml::Value::Array(items) => items
            .iter()
            .map(|v| match v {
                toml::Value::Integer(i) => Ok(*i as f64),
                toml::Value::Float(f) => Ok(*f),
                _ => Err(bad()),
            })
            .collect(),
        _ => Err(bad()),
    }
}

/// `[xengine]`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct XengineSection {
    pub x_per_fpga: usize,
    pub xeng_accumulation_len: u64,
    /// Initial QDR accumulation length.
    #[serde(default = "default_accumulation_len")]
    pub accumulation_len: u64,
    pub output_products: Vec<String>,
    pub output_destination_ip: String,
    pub output_destination_port: u16,
}

fn default_accumulation_len() -> u64 {
    816
}

impl XengineSection {
    pub fn output_destination(&self) -> Result<StreamAddress, ConfigError> {
        StreamAddress::parse(&format!(
            "{}:{}",
            self.output_destination_ip, self.output_destination_port
        ))
        .map_err(|e| invalid(format!("xengine.output_destination_ip: {e}")))
    }
}

/// A `[beamN]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BeamSection {
    #[serde(skip)]
    pub section: String,
    pub stream_index: usize,
    pub center_freq: f64,
    pub bandwidth: f64,
    pub beng_outbits: u32,
    pub quant_gain: f64,
    pub output_products: Vec<String>,
    pub output_destination_ip: String,
    pub output_destination_port: u16,
    /// Old-style combined weights: `"label:weight,label:weight"`.
    #[serde(default)]
    pub source_weights: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

impl BeamSection {
    pub fn name(&self) -> &str {
        &self.output_products[0]
    }

    pub fn destination(&self) -> Result<StreamAddress, ConfigError> {
        let addr = StreamAddress::parse(&format!(
            "{}:{}",
            self.output_destination_ip, self.output_destination_port
        ))
        .map_err(|e| invalid(format!("[{}].output_destination_ip: {e}", self.section)))?;
        if addr.range() != 1 {
            return Err(invalid(format!(
                "[{}]: beam destination must be a single base address",
                self.section
            )));
        }
        Ok(addr)
    }

    /// Input label to weight, from either weight style.
    pub fn weights(&self) -> Result<BTreeMap<String, f64>, ConfigError> {
        let mut out = BTreeMap::new();
        if let Some(combined) = &self.source_weights {
            for part in combined.split(',') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                let (label, weight) = part.split_once(':').ok_or_else(|| {
                    invalid(format!(
                        "[{}].source_weights: expected label:weight, got '{part}'",
                        self.section
                    ))
                })?;
                let weight: f64 = weight.trim().parse().map_err(|_| {
                    invalid(format!(
                        "[{}].source_weights: '{weight}' is not a number",
                        self.section
                    ))
                })?;
                out.insert(label.trim().to_string(), weight);
            }
        } else {
            for (key, value) in &self.extra {
                let label = match key.strip_prefix("weight_") {
                    Some(l) => l,
                    None => continue,
                };
                let weight = match value {
                    toml::Value::Integer(v) => *v as f64,
                    toml::Value::Float(v) => *v,
                    _ => {
                        return Err(invalid(format!(
                            "[{}].{key} must be a number",
                            self.section
                        )))
                    }
                };
                out.insert(label.to_string(), weight);
            }
        }
        if out.is_empty() {
            return Err(invalid(format!(
                "[{}] declares no input weights",
                self.section
            )));
        }
        Ok(out)
    }
}

/// `[hosts]`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostsSection {
    /// Ordered F-host list.
    pub fhosts: Vec<String>,
    /// Ordered X-host list; B-engines co-host here.
    pub xhosts: Vec<String>,
    /// Transport selector: `sim` is built in, anything else must be
    /// supplied through the library API.
    #[serde(default = "default_transport")]
    pub transport: String,
}

fn default_transport() -> String {
    "sim".to_string()
}

/// `[timing]`. Both jitter spellings are accepted; everything lands in
/// the model as seconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimingSection {
    pub min_load_lead: f64,
    pub time_jitter_allowed: Option<f64>,
    pub time_jitter_allowed_ms: Option<f64>,
    pub time_offset_allowed: Option<f64>,
    pub time_offset_allowed_ms: Option<f64>,
}

impl Default for TimingSection {
    fn default() -> Self {
        TimingSection {
            min_load_lead: 2.0,
            time_jitter_allowed: None,
            time_jitter_allowed_ms: None,
            time_offset_allowed: None,
            time_offset_allowed_ms: None,
        }
    }
}

impl TimingSection {
    pub fn jitter_allowed(&self) -> f64 {
        self.time_jitter_allowed
            .or(self.time_jitter_allowed_ms.map(|ms| ms / 1000.0))
            .unwrap_or(0.5)
    }

    pub fn offset_allowed(&self) -> f64 {
        self.time_offset_allowed
            .or(self.time_offset_allowed_ms.map(|ms| ms / 1000.0))
            .unwrap_or(5.0)
    }
}

/// `[metadata]`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetadataSection {
    /// Periodic metadata cadence in seconds; 0 disables.
    pub cadence_secs: u64,
}

impl Default for MetadataSection {
    fn default() -> Self {
        MetadataSection { cadence_secs: 5 }
    }
}

#[cfg(test)]
pub(crate) fn example_toml() -> String {
    r#"
[fengine]
n_chans = 16
sample_rate_hz = 1712000000.0
f_per_fpga = 2
default_eq_poly = [300.0]
destination_mcast_ips = "239.2.0.64:7148"
fft_shift = 32767
input_0_name = "ant0x"
input_0_destination = "239.0.0.10+1:7148"
input_1_name = "ant0y"
input_1_destination = "239.0.0.12+1:7148"
input_2_name = "ant1x"
input_2_destination = "239.0.0.14+1:7148"
input_3_name = "ant1y"
input_3_destination = "239.0.0.16+1:7148"
eq_poly_ant0x = [300.0]
eq_poly_ant0y = [300.0]

[xengine]
x_per_fpga = 2
xeng_accumulation_len = 256
accumulation_len = 816
output_products = ["baseline-correlation-products"]
output_destination_ip = "239.9.3.1"
output_destination_port = 7148

[beam0]
stream_index = 0
center_freq = 428000000.0
bandwidth = 856000000.0
beng_outbits = 8
quant_gain = 0.5
output_products = ["tied-array-channelised-voltage-0x"]
output_destination_ip = "239.9.4.1"
output_destination_port = 7148
weight_ant0x = 1.0
weight_ant1x = 1.0

[hosts]
fhosts = ["fhost00", "fhost01"]
xhosts = ["xhost00", "xhost01"]
transport = "sim"

[timing]
min_load_lead = 0.3
time_jitter_allowed_ms = 500.0

[metadata]
cadence_secs = 5
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_example() {
        let cfg = InstrumentConfig::from_toml(&example_toml()).expect("parse");
        assert_eq!(cfg.fengine.n_chans, 16);
        assert_eq!(cfg.hosts.fhosts.len(), 2);
        assert_eq!(cfg.beams.len(), 1);
        assert_eq!(cfg.beams[0].name(), "tied-array-channelised-voltage-0x");
    }

    #[test]
    fn test_inputs_ordered_and_bound() {
        let cfg = InstrumentConfig::from_toml(&example_toml()).expect("parse");
        let inputs = cfg.fengine.inputs().expect("inputs");
        assert_eq!(inputs.len(), 4);
        assert_eq!(inputs[0].name, "ant0x");
        assert_eq!(inputs[3].number, 3);
        assert_eq!(inputs[1].destination.range(), 2);
    }

    #[test]
    fn test_default_eq_poly_applies() {
        let cfg = InstrumentConfig::from_toml(&example_toml()).expect("parse");
        let inputs = cfg.fengine.inputs().expect("inputs");
        // ant1x has no eq_poly key, so the default applies
        let ant1x = inputs.iter().find(|i| i.name == "ant1x").expect("input");
        assert_eq!(ant1x.eq, Eq::from_poly(&[300.0]));
    }

    #[test]
    fn test_input_count_mismatch_rejected() {
        let doc = example_toml().replace("f_per_fpga = 2", "f_per_fpga = 3");
        let err = InstrumentConfig::from_toml(&doc).unwrap_err();
        assert!(err.to_string().contains("f_per_fpga"));
    }

    #[test]
    fn test_missing_destination_rejected() {
        let doc = example_toml().replace("input_2_destination = \"239.0.0.14+1:7148\"", "");
        let err = InstrumentConfig::from_toml(&doc).unwrap_err();
        assert!(err.to_string().contains("input_2_destination"));
    }

    #[test]
    fn test_beam_weights_new_style() {
        let cfg = InstrumentConfig::from_toml(&example_toml()).expect("parse");
        let weights = cfg.beams[0].weights().expect("weights");
        assert_eq!(weights.len(), 2);
        assert_eq!(weights["ant0x"], 1.0);
    }

    #[test]
    fn test_beam_weights_old_style() {
        let doc = example_toml()
            .replace("weight_ant0x = 1.0\nweight_ant1x = 1.0", "source_weights = \"ant0x:1.0,ant1x:0.5\"");
        let cfg = InstrumentConfig::from_toml(&doc).expect("parse");
        let weights = cfg.beams[0].weights().expect("weights");
        assert_eq!(weights["ant1x"], 0.5);
    }

    #[test]
    fn test_beam_weight_for_unknown_input_rejected() {
        let doc = example_toml().replace("weight_ant1x = 1.0", "weight_ant9z = 1.0");
        let err = InstrumentConfig::from_toml(&doc).unwrap_err();
        assert!(err.to_string().contains("ant9z"));
    }

    #[test]
    fn test_jitter_units_converted() {
        let cfg = InstrumentConfig::from_toml(&example_toml()).expect("parse");
        assert!((cfg.timing.jitter_allowed() - 0.5).abs() < 1e-9);
        assert!((cfg.timing.offset_allowed() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_n_chans_must_be_power_of_two() {
        let doc = example_toml().replace("n_chans = 16", "n_chans = 15");
        let err = InstrumentConfig::from_toml(&doc).unwrap_err();
        assert!(err.to_string().contains("n_chans"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("instrument.toml");
        std::fs::write(&path, example_toml()).expect("write");
        let cfg = InstrumentConfig::from_file(&path).expect("load");
        assert_eq!(cfg.xengine.x_per_fpga, 2);
    }
}
