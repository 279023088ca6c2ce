// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fxcorr contributors

//! Instrument error kinds.
//!
//! Internally everything is `Result`-shaped; at the control-protocol
//! boundary each variant collapses to its wire token (the second field of
//! a `fail` reply).

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the instrument can surface.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed address '{given}': {reason}")]
    BadAddress { given: String, reason: String },

    #[error("address group {0} runs past the end of the IPv4 space")]
    AddressOverflow(String),

    #[error("configuration error in '{field}': {reason}")]
    Config { field: String, reason: String },

    #[error("unknown input '{0}'")]
    InputUnknown(String),

    #[error("unknown stream '{0}'")]
    StreamUnknown(String),

    #[error("instrument already created")]
    AlreadyCreated,

    #[error("instrument not initialised")]
    NotInitialised,

    #[error("instrument already initialised")]
    AlreadyInitialised,

    #[error("load time {requested:.3} is within the minimum lead of {lead:.3}s (now {now:.3})")]
    LoadTooSoon { requested: f64, lead: f64, now: f64 },

    #[error("computed wait of {0:.3}s is negative; the time model has drifted")]
    WaitNegative(f64),

    #[error("vacc reset did not take on {0}")]
    VaccResetFailed(String),

    #[error("vacc load time diverges across hosts")]
    VaccLoadtimeDivergence {
        /// Per-host (lsw, msw) readings, leader first.
        readings: Vec<(String, u64, u64)>,
    },

    #[error("vacc arm count did not advance on {0}")]
    VaccArmMissed(String),

    #[error("vacc load did not trigger on {0}")]
    VaccDidNotTrigger(String),

    #[error("vacc steady-state check failed")]
    VaccCheckFailed {
        /// Per-engine (host, engine offset, errors, count).
        detail: Vec<(String, usize, u64, u64)>,
    },

    #[error("operation timed out on {0}")]
    Timeout(String),

    #[error("hosts did not acknowledge: {0:?}")]
    PartialCommit(Vec<String>),

    #[error("delay commit incomplete, hosts did not acknowledge: {0:?}")]
    DelayPartialCommit(Vec<String>),

    #[error("transport error on {host}: {reason}")]
    BoardTransport { host: String, reason: String },

    #[error("equaliser rollback failed on {host}: {reason}")]
    EqRevert { host: String, reason: String },

    #[error("not supported by this bitstream: register '{0}' absent")]
    Unsupported(String),
}

impl Error {
    /// Shorthand for a transport failure on a named host.
    pub fn transport(host: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::BoardTransport {
            host: host.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for a configuration error naming the offending field.
    pub fn config(field: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Config {
            field: field.into(),
            reason: reason.to_string(),
        }
    }

    /// The wire token for this error kind, as seen in a `fail` reply.
    pub fn kind_token(&self) -> &'static str {
        match self {
            Error::BadAddress { .. } => "bad_address",
            Error::AddressOverflow(_) => "address_overflow",
            Error::Config { .. } => "config_error",
            Error::InputUnknown(_) => "input_unknown",
            Error::StreamUnknown(_) => "stream_unknown",
            Error::AlreadyCreated => "already_created",
            Error::NotInitialised => "not_initialised",
            Error::AlreadyInitialised => "already_initialised",
            Error::LoadTooSoon { .. } => "load_too_soon",
            Error::WaitNegative(_) => "wait_negative",
            Error::VaccResetFailed(_) => "vacc_reset_failed",
            Error::VaccLoadtimeDivergence { .. } => "vacc_loadtime_divergence",
            Error::VaccArmMissed(_) => "vacc_arm_missed",
            Error::VaccDidNotTrigger(_) => "vacc_did_not_trigger",
            Error::VaccCheckFailed { .. } => "vacc_check_failed",
            Error::Timeout(_) => "timeout",
            Error::PartialCommit(_) => "partial_commit",
            Error::DelayPartialCommit(_) => "delay_partial_commit",
            Error::BoardTransport { .. } => "board_transport",
            Error::EqRevert { .. } => "eq_revert",
            Error::Unsupported(_) => "unsupported",
        }
    }
}
