// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fxcorr contributors

//! The correlator control server.
//!
//! A line-oriented request/reply surface over TCP: operators (or the
//! telescope control system) drive instrument lifecycle, routing, gains,
//! delays and accumulator synchronisation through the verbs in
//! [`verbs`], backed by the `fxcorr` model.

pub mod protocol;
pub mod server;
pub mod verbs;

pub use server::{ControlServer, ServerState};
