// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fxcorr contributors

//! Per-input delay and phase models.
//!
//! A delay update is five values: delay (seconds), delay rate
//! (seconds/second), phase (radians), phase rate (radians/second) and the
//! sample count at which the board applies them. The wire form is the ICD
//! string `"delay,delayrate:phase,phaserate"`, one per input.

use std::f64::consts::PI;
use std::fmt;

use crate::error::{Error, Result};

/// Fractional-sample register granularity: 31 fraction bits.
const FRAC_BITS: u32 = 31;
const FRAC_SCALE: f64 = (1u64 << FRAC_BITS) as f64;

/// A delay model in engineering units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayModel {
    /// Delay in seconds.
    pub delay: f64,
    /// Delay rate in seconds per second.
    pub delay_rate: f64,
    /// Phase offset in radians.
    pub phase: f64,
    /// Phase rate in radians per second.
    pub phase_rate: f64,
    /// Sample count at which to load; -1 means already applied,
    /// read-back only.
    pub load_mcnt: i64,
}

impl DelayModel {
    pub fn zero() -> Self {
        DelayModel {
            delay: 0.0,
            delay_rate: 0.0,
            phase: 0.0,
            phase_rate: 0.0,
            load_mcnt: -1,
        }
    }

    /// Parse one ICD coefficient string: `"delay,delayrate:phase,phaserate"`.
    pub fn parse_icd(s: &str) -> Result<Self> {
        let bad = |reason: &str| {
            Error::config(
                "delays",
                format!("'{s}' is not a delay coefficient set: {reason}"),
            )
        };
        let (delay_part, phase_part) = s
            .split_once(':')
            .ok_or_else(|| bad("expected delay,rate:phase,rate"))?;
        let parse_pair = |part: &str| -> Result<(f64, f64)> {
            let (a, b) = part
                .split_once(',')
                .ok_or_else(|| bad("expected two comma-separated values"))?;
            let a: f64 = a.trim().parse().map_err(|_| bad("not a number"))?;
            let b: f64 = b.trim().parse().map_err(|_| bad("not a number"))?;
            Ok((a, b))
        };
        let (delay, delay_rate) = parse_pair(delay_part)?;
        let (phase, phase_rate) = parse_pair(phase_part)?;
        Ok(DelayModel {
            delay,
            delay_rate,
            phase,
            phase_rate,
            load_mcnt: -1,
        })
    }

    /// Parse a full list of ICD strings, one per input, in input order.
    pub fn parse_icd_list(strings: &[String]) -> Result<Vec<Self>> {
        strings.iter().map(|s| DelayModel::parse_icd(s)).collect()
    }

    /// Convert to board units for a given sample rate. The delay rate is
    /// clamped so that the fractional-sample step never exceeds one
    /// sample per sample.
    pub fn to_board(&self, sample_rate_hz: f64) -> BoardDelay {
        let delay_samples = (self.delay * sample_rate_hz).max(0.0);
        let rate_samples = self.delay_rate.clamp(-1.0, 1.0);
        BoardDelay {
            whole_samples: delay_samples.floor() as u64,
            frac_samples: ((delay_samples.fract()) * FRAC_SCALE).floor() as u64,
            delay_rate: rate_samples,
            phase_units: self.phase / PI,
            phase_rate_units: self.phase_rate / (PI * sample_rate_hz),
            load_mcnt: self.load_mcnt,
        }
    }
}

impl fmt::Display for DelayModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{}:{},{}",
            self.delay, self.delay_rate, self.phase, self.phase_rate
        )
    }
}

/// A delay model quantised into register units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoardDelay {
    pub whole_samples: u64,
    /// Fractional samples scaled by 2^31.
    pub frac_samples: u64,
    /// Samples per sample, clamped to [-1, 1].
    pub delay_rate: f64,
    /// Phase as a fraction of pi.
    pub phase_units: f64,
    /// Phase rate as a fraction of pi per sample.
    pub phase_rate_units: f64,
    pub load_mcnt: i64,
}

impl BoardDelay {
    /// Rebuild from register words read back from a board.
    pub fn from_words(
        whole: u64,
        frac: u64,
        rate: u64,
        phase: u64,
        phase_rate: u64,
        load_mcnt: i64,
    ) -> Self {
        BoardDelay {
            whole_samples: whole,
            frac_samples: frac,
            delay_rate: (rate as i64) as f64 / FRAC_SCALE,
            phase_units: (phase as i64) as f64 / (1u64 << 28) as f64,
            phase_rate_units: (phase_rate as i64) as f64 / FRAC_SCALE,
            load_mcnt,
        }
    }

    /// The delay in samples this register load actually represents.
    pub fn delay_samples(&self) -> f64 {
        self.whole_samples as f64 + self.frac_samples as f64 / FRAC_SCALE
    }

    /// Back to engineering units, as read from the registers.
    pub fn to_model(&self, sample_rate_hz: f64) -> DelayModel {
        DelayModel {
            delay: self.delay_samples() / sample_rate_hz,
            delay_rate: self.delay_rate,
            phase: self.phase_units * PI,
            phase_rate: self.phase_rate_units * PI * sample_rate_hz,
            load_mcnt: self.load_mcnt,
        }
    }

    /// Signed fixed-point word for the delay rate (2^31 scale).
    pub fn rate_word(&self) -> u64 {
        ((self.delay_rate * FRAC_SCALE) as i64) as u64
    }

    /// Signed fixed-point word for the phase offset (2^28 scale on a
    /// fraction of pi).
    pub fn phase_word(&self) -> u64 {
        ((self.phase_units * (1u64 << 28) as f64) as i64) as u64
    }

    pub fn phase_rate_word(&self) -> u64 {
        ((self.phase_rate_units * FRAC_SCALE) as i64) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_icd() {
        let d = DelayModel::parse_icd("1e-9,2e-12:0.5,0.01").expect("parse");
        assert_eq!(d.delay, 1e-9);
        assert_eq!(d.delay_rate, 2e-12);
        assert_eq!(d.phase, 0.5);
        assert_eq!(d.phase_rate, 0.01);
        assert_eq!(d.load_mcnt, -1);
    }

    #[test]
    fn test_parse_icd_zero_form() {
        let d = DelayModel::parse_icd("0,0:0,0").expect("parse");
        assert_eq!(d, DelayModel::zero());
    }

    #[test]
    fn test_parse_icd_rejects_malformed() {
        for s in ["0,0", "0:0", "a,b:c,d", ""] {
            assert!(DelayModel::parse_icd(s).is_err(), "for input {s}");
        }
    }

    #[test]
    fn test_board_quantisation_bounds() {
        let sample_rate = 1_712_000_000.0;
        let d = DelayModel {
            delay: 2.35e-9,
            delay_rate: 0.0,
            phase: 0.0,
            phase_rate: 0.0,
            load_mcnt: -1,
        };
        let b = d.to_board(sample_rate);
        let requested = d.delay * sample_rate;
        let applied = b.delay_samples();
        assert!(applied <= requested);
        assert!(requested - applied < 1.0);
    }

    #[test]
    fn test_delay_rate_clamped() {
        let d = DelayModel {
            delay: 0.0,
            delay_rate: 3.5,
            phase: 0.0,
            phase_rate: 0.0,
            load_mcnt: -1,
        };
        let b = d.to_board(1e9);
        assert_eq!(b.delay_rate, 1.0);
    }

    #[test]
    fn test_phase_units() {
        let sample_rate = 1e9;
        let d = DelayModel {
            delay: 0.0,
            delay_rate: 0.0,
            phase: PI / 2.0,
            phase_rate: PI,
            load_mcnt: -1,
        };
        let b = d.to_board(sample_rate);
        assert!((b.phase_units - 0.5).abs() < 1e-12);
        assert!((b.phase_rate_units - 1.0 / sample_rate).abs() < 1e-18);
    }

    #[test]
    fn test_round_trip_through_board_units() {
        let sample_rate = 1_712_000_000.0;
        let d = DelayModel {
            delay: 5.0e-9,
            delay_rate: 1e-12,
            phase: 0.25,
            phase_rate: 0.125,
            load_mcnt: 42,
        };
        let back = d.to_board(sample_rate).to_model(sample_rate);
        assert!((back.delay - d.delay).abs() * sample_rate < 1.0);
        assert!((back.phase - d.phase).abs() < 1e-9);
        assert_eq!(back.load_mcnt, 42);
    }
}
