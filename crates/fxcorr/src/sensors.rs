// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fxcorr contributors

//! The sensor manager.
//!
//! A registry of hierarchical, dot-named sensors, per-host executor
//! lanes so one slow board cannot delay another's checks, and composite
//! device-status rollups. Values are copy-on-set: readers atomically
//! take a snapshot, writers swap a new one in.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tracing::debug;

use crate::error::{Error, Result};
use crate::time::unix_now;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorStatus {
    Nominal,
    Warn,
    Error,
    Failure,
    Unknown,
}

impl fmt::Display for SensorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SensorStatus::Nominal => "nominal",
            SensorStatus::Warn => "warn",
            SensorStatus::Error => "error",
            SensorStatus::Failure => "failure",
            SensorStatus::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Boolean,
    Integer,
    Float,
    String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SensorValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for SensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorValue::Bool(v) => write!(f, "{v}"),
            SensorValue::Int(v) => write!(f, "{v}"),
            SensorValue::Float(v) => write!(f, "{v}"),
            SensorValue::Str(v) => write!(f, "{v}"),
        }
    }
}

/// Whether a change, or the lack of one, is pathological for a metric.
/// A packet counter warns if NOT changed; an error counter errors if
/// changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeRule {
    Changed,
    NotChanged,
}

/// What a reader sees: one immutable sample.
#[derive(Debug, Clone)]
pub struct SensorSnapshot {
    pub value: SensorValue,
    pub status: SensorStatus,
    pub updated: f64,
}

pub struct Sensor {
    name: String,
    kind: SensorKind,
    description: String,
    cell: ArcSwap<SensorSnapshot>,
    /// Prior-sample slot for the change detectors.
    prior: Mutex<Option<SensorValue>>,
}

impl Sensor {
    fn new(name: String, kind: SensorKind, description: String) -> Arc<Self> {
        let initial = SensorSnapshot {
            value: match kind {
                SensorKind::Boolean => SensorValue::Bool(false),
                SensorKind::Integer => SensorValue::Int(0),
                SensorKind::Float => SensorValue::Float(0.0),
                SensorKind::String => SensorValue::Str(String::new()),
            },
            status: SensorStatus::Unknown,
            updated: 0.0,
        };
        Arc::new(Sensor {
            name,
            kind,
            description,
            cell: ArcSwap::from_pointee(initial),
            prior: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn snapshot(&self) -> Arc<SensorSnapshot> {
        self.cell.load_full()
    }

    fn store(&self, value: SensorValue, status: SensorStatus) {
        self.cell.store(Arc::new(SensorSnapshot {
            value,
            status,
            updated: unix_now(),
        }));
    }

    /// Set with an explicit status.
    pub fn set(&self, value: SensorValue, status: SensorStatus) {
        *self.prior.lock() = Some(value.clone());
        self.store(value, status);
    }

    /// Set, classifying against the previous sample: `errif`/`warnif`
    /// say whether a change or a lack of change is pathological.
    pub fn set_with_rules(
        &self,
        value: SensorValue,
        errif: Option<ChangeRule>,
        warnif: Option<ChangeRule>,
    ) {
        let mut prior = self.prior.lock();
        let changed = match prior.as_ref() {
            Some(p) => *p != value,
            None => false,
        };
        let matched = |rule: &Option<ChangeRule>| match rule {
            Some(ChangeRule::Changed) => changed,
            Some(ChangeRule::NotChanged) => prior.is_some() && !changed,
            None => false,
        };
        let status = if matched(&errif) {
            SensorStatus::Error
        } else if matched(&warnif) {
            SensorStatus::Warn
        } else {
            SensorStatus::Nominal
        };
        *prior = Some(value.clone());
        drop(prior);
        self.store(value, status);
    }

    /// Mark failed with the kind's sentinel value.
    pub fn set_failure(&self) {
        let sentinel = match self.kind {
            SensorKind::Boolean => SensorValue::Bool(false),
            SensorKind::Integer => SensorValue::Int(-1),
            SensorKind::Float => SensorValue::Float(-1.0),
            SensorKind::String => SensorValue::Str("unknown".to_string()),
        };
        self.store(sentinel, SensorStatus::Failure);
    }
}

/// Sensor registry plus the executor lanes the periodic checks run on.
pub struct SensorManager {
    registry: DashMap<String, Arc<Sensor>>,
    cadence_ms: AtomicU64,
    host_lanes: DashMap<String, Arc<Semaphore>>,
    general_lane: Arc<Semaphore>,
    shutdown: Notify,
}

impl SensorManager {
    pub fn new(cadence: Duration) -> Arc<Self> {
        Arc::new(SensorManager {
            registry: DashMap::new(),
            cadence_ms: AtomicU64::new(cadence.as_millis() as u64),
            host_lanes: DashMap::new(),
            general_lane: Arc::new(Semaphore::new(8)),
            shutdown: Notify::new(),
        })
    }

    pub fn cadence(&self) -> Duration {
        Duration::from_millis(self.cadence_ms.load(Ordering::Acquire))
    }

    pub fn set_cadence(&self, cadence: Duration) {
        self.cadence_ms
            .store(cadence.as_millis() as u64, Ordering::Release);
    }

    /// Get or create a sensor.
    pub fn register(
        &self,
        name: impl Into<String>,
        kind: SensorKind,
        description: impl Into<String>,
    ) -> Arc<Sensor> {
        let name = name.into();
        self.registry
            .entry(name.clone())
            .or_insert_with(|| Sensor::new(name, kind, description.into()))
            .value()
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Sensor>> {
        self.registry.get(name).map(|s| s.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Every sensor under a dotted prefix.
    pub fn under(&self, prefix: &str) -> Vec<Arc<Sensor>> {
        let want = format!("{prefix}.");
        self.registry
            .iter()
            .filter(|e| e.key().starts_with(&want))
            .map(|e| e.value().clone())
            .collect()
    }

    /// Run a blocking board read on the named host's lane. One lane per
    /// host: a slow board only delays its own checks.
    pub async fn submit_host<R, F>(&self, host: &str, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> Result<R> + Send + 'static,
    {
        let lane = self
            .host_lanes
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .value()
            .clone();
        let permit = lane
            .acquire_owned()
            .await
            .map_err(|_| Error::transport(host, "host executor closed"))?;
        let host_name = host.to_string();
        tokio::task::spawn_blocking(move || {
            let out = f();
            drop(permit);
            out
        })
        .await
        .map_err(|e| Error::transport(&host_name, e))?
    }

    /// Run a blocking read on the shared general lane.
    pub async fn submit_general<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> Result<R> + Send + 'static,
    {
        let permit = self
            .general_lane
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::transport("general", "executor closed"))?;
        tokio::task::spawn_blocking(move || {
            let out = f();
            drop(permit);
            out
        })
        .await
        .map_err(|e| Error::transport("general", e))?
    }

    /// Combine the children of a dotted scope: error if any child is in
    /// error (or failed), else warn if any warns, else nominal.
    pub fn rollup(&self, scope: &str) -> SensorStatus {
        let mut out = SensorStatus::Nominal;
        for sensor in self.under(scope) {
            if sensor.name().ends_with(".device-status") {
                continue;
            }
            match sensor.snapshot().status {
                SensorStatus::Error | SensorStatus::Failure => return SensorStatus::Error,
                SensorStatus::Warn => out = SensorStatus::Warn,
                _ => {}
            }
        }
        out
    }

    /// Recompute and publish `scope.device-status`.
    pub fn update_device_status(&self, scope: &str) -> SensorStatus {
        let status = self.rollup(scope);
        let sensor = self.register(
            format!("{scope}.device-status"),
            SensorKind::Boolean,
            format!("rolled-up health of {scope}"),
        );
        sensor.set(SensorValue::Bool(status == SensorStatus::Nominal), status);
        debug!(scope, %status, "device status rolled up");
        status
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    pub async fn wait_shutdown(&self) {
        self.shutdown.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<SensorManager> {
        SensorManager::new(Duration::from_secs(10))
    }

    #[test]
    fn test_change_rules_packet_counter() {
        let m = manager();
        let s = m.register("host00.feng.rx.cnt", SensorKind::Integer, "rx packets");
        // first sample has no prior: nominal
        s.set_with_rules(SensorValue::Int(100), None, Some(ChangeRule::NotChanged));
        assert_eq!(s.snapshot().status, SensorStatus::Nominal);
        // counter moved: still nominal
        s.set_with_rules(SensorValue::Int(200), None, Some(ChangeRule::NotChanged));
        assert_eq!(s.snapshot().status, SensorStatus::Nominal);
        // counter stalled: warn
        s.set_with_rules(SensorValue::Int(200), None, Some(ChangeRule::NotChanged));
        assert_eq!(s.snapshot().status, SensorStatus::Warn);
    }

    #[test]
    fn test_change_rules_error_counter() {
        let m = manager();
        let s = m.register("host00.feng.rx.err_cnt", SensorKind::Integer, "rx errors");
        s.set_with_rules(SensorValue::Int(0), Some(ChangeRule::Changed), None);
        assert_eq!(s.snapshot().status, SensorStatus::Nominal);
        s.set_with_rules(SensorValue::Int(0), Some(ChangeRule::Changed), None);
        assert_eq!(s.snapshot().status, SensorStatus::Nominal);
        s.set_with_rules(SensorValue::Int(3), Some(ChangeRule::Changed), None);
        assert_eq!(s.snapshot().status, SensorStatus::Error);
    }

    #[test]
    fn test_failure_sentinels() {
        let m = manager();
        let s = m.register("host00.xeng.lru", SensorKind::Boolean, "lru okay");
        s.set_failure();
        let snap = s.snapshot();
        assert_eq!(snap.status, SensorStatus::Failure);
        assert_eq!(snap.value, SensorValue::Bool(false));
    }

    #[test]
    fn test_rollup_precedence() {
        let m = manager();
        m.register("host00.xeng.vacc.errors0", SensorKind::Integer, "")
            .set(SensorValue::Int(0), SensorStatus::Nominal);
        m.register("host00.xeng.vacc.count0", SensorKind::Integer, "")
            .set(SensorValue::Int(5), SensorStatus::Warn);
        assert_eq!(m.update_device_status("host00.xeng.vacc"), SensorStatus::Warn);

        m.get("host00.xeng.vacc.errors0")
            .expect("sensor")
            .set(SensorValue::Int(7), SensorStatus::Error);
        assert_eq!(m.update_device_status("host00.xeng.vacc"), SensorStatus::Error);
        // the rollup cascades upwards through the host scope
        assert_eq!(m.update_device_status("host00"), SensorStatus::Error);
    }

    #[test]
    fn test_rollup_ignores_existing_device_status() {
        let m = manager();
        m.register("host00.feng.ok", SensorKind::Boolean, "")
            .set(SensorValue::Bool(true), SensorStatus::Nominal);
        m.update_device_status("host00");
        // re-rolling must not feed on the device-status sensor itself
        assert_eq!(m.update_device_status("host00"), SensorStatus::Nominal);
    }

    #[tokio::test]
    async fn test_host_lanes_serialise_per_host() {
        let m = manager();
        let t0 = std::time::Instant::now();
        let a = m.submit_host("host00", || {
            std::thread::sleep(Duration::from_millis(100));
            Ok(())
        });
        let b = m.submit_host("host01", || {
            std::thread::sleep(Duration::from_millis(100));
            Ok(())
        });
        let (ra, rb) = tokio::join!(a, b);
        ra.expect("a");
        rb.expect("b");
        // different hosts run concurrently
        assert!(t0.elapsed() < Duration::from_millis(190));
    }
}
