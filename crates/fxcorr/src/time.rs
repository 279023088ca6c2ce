// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fxcorr contributors

//! Unix-time to board sample-count conversion.
//!
//! Every board counts ADC samples from the synchronisation epoch, the
//! Unix time at which all counters were zero. Timed operations (delay
//! loads, VACC starts) are expressed as a future sample count so that
//! many boards act on the same sample.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// Current wall-clock time as Unix seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// The instrument time model.
///
/// The epoch is settable at runtime (`digitiser-synch-epoch`); everything
/// else is fixed at construction from the configuration.
#[derive(Debug)]
pub struct TimeModel {
    /// f64 bits; NaN bits mean "not yet set".
    epoch_bits: AtomicU64,
    sample_rate_hz: f64,
    min_load_lead: f64,
    jitter_allowed: f64,
    offset_allowed: f64,
}

impl TimeModel {
    pub fn new(
        sample_rate_hz: f64,
        min_load_lead: f64,
        jitter_allowed: f64,
        offset_allowed: f64,
    ) -> Self {
        TimeModel {
            epoch_bits: AtomicU64::new(f64::NAN.to_bits()),
            sample_rate_hz,
            min_load_lead,
            jitter_allowed,
            offset_allowed,
        }
    }

    pub fn sample_rate_hz(&self) -> f64 {
        self.sample_rate_hz
    }

    pub fn min_load_lead(&self) -> f64 {
        self.min_load_lead
    }

    pub fn jitter_allowed(&self) -> f64 {
        self.jitter_allowed
    }

    pub fn offset_allowed(&self) -> f64 {
        self.offset_allowed
    }

    /// The synchronisation epoch, if one has been set.
    pub fn epoch(&self) -> Option<f64> {
        let bits = self.epoch_bits.load(Ordering::Acquire);
        let val = f64::from_bits(bits);
        if val.is_nan() {
            None
        } else {
            Some(val)
        }
    }

    /// Set the synchronisation epoch. Once set the epoch is monotone:
    /// re-setting to the same value is accepted, moving it backwards is
    /// not.
    pub fn set_epoch(&self, epoch: f64) -> Result<()> {
        if !epoch.is_finite() || epoch < 0.0 {
            return Err(Error::config(
                "synchronisation_epoch",
                format!("epoch {epoch} is not a valid Unix time"),
            ));
        }
        if let Some(current) = self.epoch() {
            if epoch < current {
                return Err(Error::config(
                    "synchronisation_epoch",
                    format!("epoch may not move backwards ({current} -> {epoch})"),
                ));
            }
        }
        self.epoch_bits.store(epoch.to_bits(), Ordering::Release);
        Ok(())
    }

    fn epoch_required(&self) -> Result<f64> {
        self.epoch().ok_or_else(|| {
            Error::config("synchronisation_epoch", "synchronisation epoch is not set")
        })
    }

    /// Board sample count at Unix time `t`.
    pub fn mcnt_from_time(&self, t: f64) -> Result<u64> {
        let epoch = self.epoch_required()?;
        if t < epoch {
            return Err(Error::config(
                "synchronisation_epoch",
                format!("time {t} precedes the epoch {epoch}"),
            ));
        }
        Ok(((t - epoch) * self.sample_rate_hz).floor() as u64)
    }

    /// Unix time at board sample count `mcnt`.
    pub fn time_from_mcnt(&self, mcnt: u64) -> Result<f64> {
        let epoch = self.epoch_required()?;
        Ok(epoch + mcnt as f64 / self.sample_rate_hz)
    }

    /// Validate a requested load time against the minimum lead and
    /// convert it to a sample count.
    pub fn load_mcnt(&self, t_load: f64) -> Result<u64> {
        let now = unix_now();
        if t_load < now + self.min_load_lead {
            return Err(Error::LoadTooSoon {
                requested: t_load,
                lead: self.min_load_lead,
                now,
            });
        }
        self.mcnt_from_time(t_load)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> TimeModel {
        TimeModel::new(1_712_000_000.0, 2.0, 0.5, 5.0)
    }

    #[test]
    fn test_epoch_unset() {
        let tm = model();
        assert!(tm.epoch().is_none());
        assert!(tm.mcnt_from_time(100.0).is_err());
    }

    #[test]
    fn test_mcnt_round_trip() {
        let tm = model();
        tm.set_epoch(0.0).expect("set epoch");
        let mcnt = tm.mcnt_from_time(100.0).expect("mcnt");
        assert_eq!(mcnt, 171_200_000_000);
        let t = tm.time_from_mcnt(mcnt).expect("time");
        assert!((t - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_epoch_monotone() {
        let tm = model();
        tm.set_epoch(1000.0).expect("set");
        tm.set_epoch(1000.0).expect("idempotent re-set");
        tm.set_epoch(2000.0).expect("forwards");
        let err = tm.set_epoch(1500.0).unwrap_err();
        assert_eq!(err.kind_token(), "config_error");
        assert_eq!(tm.epoch(), Some(2000.0));
    }

    #[test]
    fn test_load_lead_boundary() {
        let tm = model();
        tm.set_epoch(0.0).expect("set");
        let now = unix_now();
        let err = tm.load_mcnt(now + tm.min_load_lead() - 0.5).unwrap_err();
        assert_eq!(err.kind_token(), "load_too_soon");
        tm.load_mcnt(now + tm.min_load_lead() + 0.5)
            .expect("enough lead");
    }

    #[test]
    fn test_time_before_epoch_rejected() {
        let tm = model();
        tm.set_epoch(500.0).expect("set");
        assert!(tm.mcnt_from_time(499.0).is_err());
    }
}
