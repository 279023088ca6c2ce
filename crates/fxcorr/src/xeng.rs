// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fxcorr contributors

//! X-engine operations.
//!
//! Bring-up, accumulation-length control, baseline ordering and the
//! vector-accumulator synchronisation protocol. VACC sync is the one
//! place the coordinator has to fight the hardware: the accumulators run
//! on free counters and arming is staged at software speed, so every
//! step is verified before the next.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::fanout::fanout;
use crate::instrument::{Fengine, Geometry};
use crate::meta::{items, MetaHeap};
use crate::stream::DataStream;
use crate::time::{unix_now, TimeModel};
use crate::transport::Host;

const VACC_FANOUT_TIMEOUT: Duration = Duration::from_secs(10);

/// Settle margin added after the computed fire time.
const VACC_SETTLE: f64 = 0.2;

/// One engine's VACC counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaccEngineStatus {
    pub arm_count: u64,
    pub load_count: u64,
    pub errors: u64,
    pub count: u64,
}

pub struct XengineOperations {
    hosts: Vec<Arc<Host>>,
    fengines: Arc<Vec<Arc<Fengine>>>,
    stream: Arc<DataStream>,
    fstream: Arc<DataStream>,
    time: Arc<TimeModel>,
    geometry: Geometry,
    acc_len: AtomicU64,
    monitor_enabled: AtomicBool,
}

impl XengineOperations {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hosts: Vec<Arc<Host>>,
        fengines: Arc<Vec<Arc<Fengine>>>,
        stream: Arc<DataStream>,
        fstream: Arc<DataStream>,
        time: Arc<TimeModel>,
        geometry: Geometry,
        initial_acc_len: u64,
    ) -> Arc<Self> {
        Arc::new(XengineOperations {
            hosts,
            fengines,
            stream,
            fstream,
            time,
            geometry,
            acc_len: AtomicU64::new(initial_acc_len),
            monitor_enabled: AtomicBool::new(false),
        })
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    pub fn stream(&self) -> &Arc<DataStream> {
        &self.stream
    }

    fn x_per_fpga(&self) -> usize {
        self.geometry.x_per_fpga
    }

    /// Post-program bring-up: known control state, routing, accumulation
    /// length, clean status.
    pub async fn initialise(&self) -> Result<()> {
        self.tx_disable().await?;
        self.gbe_reset(true).await?;
        self.clear_status().await?;
        self.write_stream_destination().await?;
        fanout(&self.hosts, Duration::from_secs(5), |h| {
            h.write("control", &[("gbe_debug_rst", 1)])?;
            h.write("control", &[("gbe_debug_rst", 0)])
        })
        .await
        .into_ok_map()?;
        self.gbe_reset(false).await?;
        self.set_acc_len(None, false).await?;
        self.clear_status().await?;
        Ok(())
    }

    async fn gbe_reset(&self, state: bool) -> Result<()> {
        let v = state as u64;
        fanout(&self.hosts, Duration::from_secs(5), move |h| {
            h.write("control", &[("gbe_rst", v)])
        })
        .await
        .into_ok_map()?;
        Ok(())
    }

    pub async fn clear_status(&self) -> Result<()> {
        fanout(&self.hosts, VACC_FANOUT_TIMEOUT, |h| {
            h.write("control", &[("status_clr", 1)])?;
            h.write("control", &[("status_clr", 0)])
        })
        .await
        .into_ok_map()?;
        Ok(())
    }

    /// Write the cross-product stream destination to the hosts.
    pub async fn write_stream_destination(&self) -> Result<()> {
        let dest = self.stream.destination();
        let ip = u32::from(dest.base()) as u64;
        let port = dest.port() as u64;
        fanout(&self.hosts, VACC_FANOUT_TIMEOUT, move |h| {
            h.write("gbe_iptx", &[("reg", ip)])?;
            h.write("gbe_porttx", &[("reg", port)])
        })
        .await
        .into_ok_map()?;
        info!(stream = %self.stream.name(), destination = %dest,
              "wrote X-engine stream destination");
        Ok(())
    }

    pub async fn tx_enable(&self) -> Result<()> {
        fanout(&self.hosts, Duration::from_secs(5), |h| {
            h.write("control", &[("gbe_txen", 1)])
        })
        .await
        .into_ok_map()?;
        self.stream.set_tx_enabled(true);
        info!("X-engine output enabled");
        Ok(())
    }

    pub async fn tx_disable(&self) -> Result<()> {
        fanout(&self.hosts, Duration::from_secs(5), |h| {
            h.write("control", &[("gbe_txen", 0)])
        })
        .await
        .into_ok_map()?;
        self.stream.set_tx_enabled(false);
        info!("X-engine output disabled");
        Ok(())
    }

    /// Subscribe each X-engine to its slice of the F output: the i-th
    /// engine takes `base + i`.
    pub async fn subscribe_to_multicast(&self) -> Result<()> {
        let fdest = self.fstream.destination();
        if !fdest.is_multicast() {
            info!(base = %fdest, "F > X is unicast, no subscriptions needed");
            return Ok(());
        }
        let base = u32::from(fdest.base());
        let mut engine = 0u32;
        for host in &self.hosts {
            let iface = host
                .gbe_interfaces()
                .first()
                .cloned()
                .unwrap_or_else(|| "gbe0".to_string());
            let groups: Vec<std::net::Ipv4Addr> = (0..self.x_per_fpga())
                .map(|i| std::net::Ipv4Addr::from(base + engine + i as u32))
                .collect();
            engine += self.x_per_fpga() as u32;
            let host_name = host.name().to_string();
            let host = host.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                for group in groups {
                    host.transport().subscribe_multicast(&iface, group)?;
                }
                Ok(())
            })
            .await
            .map_err(|e| Error::transport(&host_name, e))??;
        }
        info!(base = %fdest, "subscribed X-engines to the F output groups");
        Ok(())
    }

    /// Read all VACC counters, per host, per engine.
    pub async fn vacc_status(&self) -> Result<BTreeMap<String, Vec<VaccEngineStatus>>> {
        let x_per_fpga = self.x_per_fpga();
        let map = fanout(&self.hosts, VACC_FANOUT_TIMEOUT, move |h| {
            let mut statuses = Vec::with_capacity(x_per_fpga);
            for i in 0..x_per_fpga {
                let regs = h.read(&format!("vacc_status{i}"))?;
                let get = |f: &str| {
                    regs.get(f).copied().ok_or_else(|| {
                        Error::transport(h.name(), format!("vacc_status{i} missing field {f}"))
                    })
                };
                statuses.push(VaccEngineStatus {
                    arm_count: get("armcount")?,
                    load_count: get("loadcount")?,
                    errors: get("errors")?,
                    count: get("count")?,
                });
            }
            Ok(statuses)
        })
        .await
        .into_ok_map()?;
        Ok(map.into_iter().collect())
    }

    /// Reset any accumulator whose arm and load counts indicate a stale
    /// arming, and verify the reset took.
    async fn vacc_check_reset(&self) -> Result<()> {
        let status = self.vacc_status().await?;
        let stale: Vec<&String> = status
            .iter()
            .filter(|(_, engines)| engines.iter().any(|e| e.arm_count != e.load_count))
            .map(|(h, _)| h)
            .collect();
        if stale.is_empty() {
            return Ok(());
        }
        for host in &stale {
            info!(host = %host, "vacc needs resetting");
        }
        fanout(&self.hosts, VACC_FANOUT_TIMEOUT, |h| {
            h.write("vacc_ctrl", &[("rst", 1)])?;
            h.write("vacc_ctrl", &[("rst", 0)])
        })
        .await
        .into_ok_map()?;

        let status = self.vacc_status().await?;
        for (host, engines) in &status {
            if engines
                .iter()
                .any(|e| e.arm_count != 0 || e.load_count != 0)
            {
                error!(host = %host, "resetting vaccs failed");
                return Err(Error::VaccResetFailed(host.clone()));
            }
        }
        Ok(())
    }

    /// Accumulator natural-period exponent: loading anywhere but a
    /// multiple of 2^q truncates the first integration.
    fn quantisation_bits(&self) -> u32 {
        (self.geometry.n_chans as f64).log2() as u32
            + 1
            + (self.geometry.xeng_acc_len as f64).log2() as u32
    }

    /// Bring every accumulator onto the same integration boundary.
    /// Returns the Unix time of the load.
    pub async fn vacc_sync(&self, vacc_load_time: Option<f64>) -> Result<f64> {
        let lead = self.time.min_load_lead();
        let t_load = match vacc_load_time {
            Some(t) => t,
            None => {
                let t = unix_now() + 2.0 * lead;
                info!(
                    "vacc sync time not specified, syncing in {:.2}s",
                    2.0 * lead
                );
                t
            }
        };
        let now = unix_now();
        if t_load < now + lead {
            return Err(Error::LoadTooSoon {
                requested: t_load,
                lead,
                now,
            });
        }
        info!(in_secs = t_load - now, "syncing X-engine vaccs");

        self.vacc_check_reset().await?;

        // quantise the load mcnt up to the next accumulator period
        let q = self.quantisation_bits();
        let ldmcnt = quantised_load_mcnt(self.time.mcnt_from_time(t_load)?, q);
        if self.time.time_from_mcnt(ldmcnt)? < unix_now() {
            warn!("the board timestamp has probably wrapped");
        }

        info!(ldmcnt, "applying vacc load time");
        let lsw = ldmcnt & 0xffff_ffff;
        let msw = ldmcnt >> 32;
        fanout(&self.hosts, VACC_FANOUT_TIMEOUT, move |h| {
            h.write("vacc_time_lsw", &[("lsw", lsw)])?;
            h.write("vacc_time_msw", &[("msw", msw)])
        })
        .await
        .into_ok_map()?;

        // every board must hold the leader's load time
        let words = fanout(&self.hosts, VACC_FANOUT_TIMEOUT, |h| {
            let lsw = h.read_field("vacc_time_lsw", "lsw")?;
            let msw = h.read_field("vacc_time_msw", "msw")?;
            Ok((lsw, msw))
        })
        .await
        .into_ok_map()?;
        let leader = self.hosts[0].name();
        let (lsw0, msw0) = words[leader];
        if words.values().any(|&(l, m)| l != lsw0 || m != msw0) {
            let mut readings: Vec<(String, u64, u64)> = self
                .hosts
                .iter()
                .map(|h| {
                    let (l, m) = words[h.name()];
                    (h.name().to_string(), l, m)
                })
                .collect();
            readings.sort_by_key(|(h, _, _)| (h.as_str() != leader, h.clone()));
            error!("hosts do not hold matching vacc load words");
            return Err(Error::VaccLoadtimeDivergence { readings });
        }
        debug!(loadtime = (msw0 << 32) | lsw0, "x-engines hold the vacc load time");

        // leader's counters before arming
        let status = self.vacc_status().await?;
        let arm_count0 = status[leader][0].arm_count;
        let load_count0 = status[leader][0].load_count;
        info!(arm_count0, load_count0, "before arming");

        fanout(&self.hosts, VACC_FANOUT_TIMEOUT, |h| {
            h.write("vacc_ctrl", &[("arm", 1)])?;
            h.write("vacc_ctrl", &[("arm", 0)])
        })
        .await
        .into_ok_map()?;

        let status = self.vacc_status().await?;
        for (host, engines) in &status {
            if engines.iter().any(|e| e.arm_count != arm_count0 + 1) {
                error!(host = %host, "arm count did not advance on all hosts");
                return Err(Error::VaccArmMissed(host.clone()));
            }
        }
        info!("done arming");

        // wait for the load to fire
        let t_fire = self.time.time_from_mcnt(ldmcnt)?;
        let wait = t_fire - unix_now() + VACC_SETTLE;
        if wait <= 0.0 {
            error!(
                wait,
                epoch = ?self.time.epoch(),
                ldmcnt,
                "negative wait computed, time model has drifted"
            );
            return Err(Error::WaitNegative(wait));
        }
        info!(wait, "waiting for arm to trigger");
        tokio::time::sleep(Duration::from_secs_f64(wait)).await;

        let status = self.vacc_status().await?;
        for (host, engines) in &status {
            if engines.iter().any(|e| e.load_count != load_count0 + 1) {
                error!(host = %host, "vacc did not trigger");
                return Err(Error::VaccDidNotTrigger(host.clone()));
            }
        }
        info!("all vaccs triggered correctly");

        // let one accumulation flush to populate the parity bits, clear
        // status, then observe one clean integration
        let acc_time = self.get_acc_time();
        info!(acc_time, "waiting for an accumulation to flush");
        tokio::time::sleep(Duration::from_secs_f64(acc_time + VACC_SETTLE)).await;
        self.clear_status().await?;
        tokio::time::sleep(Duration::from_secs_f64(acc_time + VACC_SETTLE)).await;

        let status = self.vacc_status().await?;
        let mut detail = Vec::new();
        for (host, engines) in &status {
            for (i, e) in engines.iter().enumerate() {
                if e.errors > 0 || e.count == 0 {
                    detail.push((host.clone(), i, e.errors, e.count));
                }
            }
        }
        if !detail.is_empty() {
            error!(?detail, "vacc steady-state check failed");
            return Err(Error::VaccCheckFailed { detail });
        }
        info!("accumulations rolling in without error");
        Ok(t_fire)
    }

    // --- accumulation length ---

    pub fn get_acc_len(&self) -> u64 {
        self.acc_len.load(Ordering::Acquire)
    }

    /// The integration time the current accumulation length gives.
    pub fn get_acc_time(&self) -> f64 {
        (self.geometry.xeng_acc_len * self.get_acc_len()) as f64
            * (self.geometry.n_chans as f64)
            * 2.0
            / self.geometry.sample_rate_hz
    }

    /// Set the accumulation length from a requested dump time in seconds.
    pub async fn set_acc_time(&self, acc_time_s: f64, resync: bool) -> Result<f64> {
        if acc_time_s <= 0.0 {
            return Err(Error::config(
                "accumulation-length",
                format!("dump time {acc_time_s} must be positive"),
            ));
        }
        let acc_len = ((self.geometry.sample_rate_hz * acc_time_s)
            / ((self.geometry.xeng_acc_len * 2) as f64 * self.geometry.n_chans as f64))
            .round()
            .max(1.0) as u64;
        self.set_acc_len(Some(acc_len), resync).await?;
        Ok(self.get_acc_time())
    }

    /// Rewrite the accumulation length on every board.
    pub async fn set_acc_len(&self, acc_len: Option<u64>, resync: bool) -> Result<()> {
        let was_monitoring = self.monitor_enabled.swap(false, Ordering::AcqRel);
        if let Some(len) = acc_len {
            self.acc_len.store(len, Ordering::Release);
        }
        let len = self.get_acc_len() as u32;
        fanout(&self.hosts, VACC_FANOUT_TIMEOUT, move |h| {
            h.bulk_write("acc_len", len)
        })
        .await
        .into_ok_map()?;
        info!(
            acc_len = len,
            acc_time = self.get_acc_time(),
            "set VACC accumulation length system-wide"
        );
        if resync {
            self.vacc_sync(None).await?;
        }
        if was_monitoring {
            self.monitor_enabled.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// The acc len currently programmed into the leader board.
    pub async fn read_acc_len(&self) -> Result<u64> {
        let leader = vec![self.hosts[0].clone()];
        let map = fanout(&leader, Duration::from_secs(5), |h| {
            h.read_field("acc_len", "reg")
        })
        .await
        .into_ok_map()?;
        Ok(map[self.hosts[0].name()])
    }

    // --- baseline ordering ---

    /// The order of baseline products leaving a CASPER X-engine: the
    /// antenna-pair triangle, each pair expanded to its four
    /// polarisation products.
    pub fn baseline_order(&self) -> Vec<(String, String)> {
        let labels: Vec<String> = self.fengines.iter().map(|f| f.label()).collect();
        let n_ants = labels.len() / 2;
        let mut out = Vec::with_capacity(baseline_triangle(n_ants).len() * 4);
        for (a, b) in baseline_triangle(n_ants) {
            out.push((labels[a * 2].clone(), labels[b * 2].clone()));
            out.push((labels[a * 2 + 1].clone(), labels[b * 2 + 1].clone()));
            out.push((labels[a * 2].clone(), labels[b * 2 + 1].clone()));
            out.push((labels[a * 2 + 1].clone(), labels[b * 2].clone()));
        }
        out
    }

    /// Metadata heap for the cross-product stream.
    pub fn build_metadata(&self) -> MetaHeap {
        let bls = self.baseline_order();
        let mut heap = MetaHeap::new();
        heap.push_f64(items::ADC_SAMPLE_RATE, self.geometry.sample_rate_hz);
        heap.push_u64(items::N_BLS, bls.len() as u64);
        heap.push_u64(items::N_CHANS, self.geometry.n_chans as u64);
        heap.push_u64(items::N_ANTS, (self.fengines.len() / 2) as u64);
        heap.push_u64(items::N_XENGS, self.geometry.num_xengines as u64);
        let ordering: Vec<String> = bls.iter().map(|(a, b)| format!("{a}:{b}")).collect();
        heap.push_str(items::BLS_ORDERING, ordering.join(","));
        heap.push_f64(items::CENTER_FREQ, self.geometry.sample_rate_hz / 4.0);
        heap.push_f64(items::BANDWIDTH, self.geometry.sample_rate_hz / 2.0);
        heap.push_u64(items::N_ACCS, self.get_acc_len());
        heap.push_f64(items::INT_TIME, self.get_acc_time());
        heap.push_u64(items::XENG_ACC_LEN, self.geometry.xeng_acc_len);
        heap.push_u64(items::X_PER_FPGA, self.geometry.x_per_fpga as u64);
        let dest = self.stream.destination();
        heap.push_u64(items::RX_UDP_PORT, dest.port() as u64);
        heap.push_str(items::RX_UDP_IP, dest.base().to_string());
        heap
    }

    // --- periodic VACC monitor ---

    pub fn monitor_enabled(&self) -> bool {
        self.monitor_enabled.load(Ordering::Acquire)
    }

    pub fn stop_vacc_monitor(&self) {
        self.monitor_enabled.store(false, Ordering::Release);
    }

    /// Start the background VACC watchdog: sample status and reorder
    /// counters on a cadence, force a resync when errors increment,
    /// counts stall, or reorder counters move.
    pub fn start_vacc_monitor(self: &Arc<Self>, check_interval: Duration) -> Result<()> {
        if check_interval.as_secs_f64() < self.get_acc_time() {
            return Err(Error::config(
                "vacc_check_interval",
                "a check interval smaller than the accumulation time makes no sense",
            ));
        }
        self.monitor_enabled.store(true, Ordering::Release);
        let ops = self.clone();
        tokio::spawn(async move {
            let mut last: Option<MonitorSample> = None;
            loop {
                tokio::time::sleep(check_interval).await;
                if !ops.monitor_enabled() {
                    break;
                }
                let sample = match ops.monitor_sample().await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(error = %e, "vacc monitor sample failed");
                        continue;
                    }
                };
                if let Some(prev) = &last {
                    if let Some(reason) = monitor_compare(prev, &sample) {
                        error!(reason, "vacc monitor forcing a resync");
                        if let Err(e) = ops.vacc_sync(None).await {
                            error!(error = %e, "forced vacc sync failed");
                        }
                        last = None;
                        continue;
                    }
                }
                last = Some(sample);
            }
            debug!("vacc monitor stopped");
        });
        Ok(())
    }

    async fn monitor_sample(&self) -> Result<MonitorSample> {
        let vacc = self.vacc_status().await?;
        let x_per_fpga = self.x_per_fpga();
        let reorder = fanout(&self.hosts, Duration::from_secs(5), move |h| {
            let mut out = Vec::with_capacity(x_per_fpga);
            for i in 0..x_per_fpga {
                out.push(h.read_field(&format!("reorderr_timeout{i}"), "reg")?);
            }
            Ok(out)
        })
        .await
        .into_ok_map()?;
        Ok(MonitorSample {
            vacc,
            reorder: reorder.into_iter().collect(),
        })
    }
}

/// Round a sample count up to the next multiple of the accumulator
/// period. A count already on a multiple still advances by a full
/// period: loading in the current period would truncate its first
/// integration.
fn quantised_load_mcnt(mcnt: u64, q: u32) -> u64 {
    ((mcnt >> q) + 1) << q
}

/// The antenna-pair ordering of a CASPER X-engine's output.
fn baseline_triangle(n_ants: usize) -> Vec<(usize, usize)> {
    let mut order1: Vec<(usize, usize)> = Vec::new();
    let mut order2: Vec<(usize, usize)> = Vec::new();
    for ctr1 in 0..n_ants {
        for ctr2 in (0..=n_ants / 2).rev() {
            let temp = (ctr1 as i64 - ctr2 as i64).rem_euclid(n_ants.max(1) as i64) as usize;
            if ctr1 >= temp {
                order1.push((temp, ctr1));
            } else {
                order2.push((ctr1, temp));
            }
        }
    }
    order2.retain(|pair| !order1.contains(pair));
    order1.extend(order2);
    order1
}

struct MonitorSample {
    vacc: BTreeMap<String, Vec<VaccEngineStatus>>,
    reorder: BTreeMap<String, Vec<u64>>,
}

/// `Some(reason)` when the two samples indicate a broken accumulator.
fn monitor_compare(prev: &MonitorSample, cur: &MonitorSample) -> Option<&'static str> {
    for (host, engines) in &cur.vacc {
        let old = prev.vacc.get(host)?;
        for (e_new, e_old) in engines.iter().zip(old) {
            if e_new.errors > e_old.errors || e_old.errors != 0 {
                return Some("vacc errors incrementing");
            }
            if e_new.count == e_old.count {
                return Some("vacc count not incrementing");
            }
        }
    }
    for (host, regs) in &cur.reorder {
        let old = prev.reorder.get(host)?;
        if regs != old {
            return Some("reorder timeout counters moved");
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_mcnt_quantisation_rounds_up() {
        // n_chans 4096, xeng_acc_len 256: q = 12 + 1 + 8
        let q = 21;
        let period = 1u64 << q;
        let raw = 5 * period + 12345;
        let ld = quantised_load_mcnt(raw, q);
        assert_eq!(ld % period, 0);
        assert!(ld >= raw);
        assert_eq!(ld, 6 * period);
    }

    #[test]
    fn test_load_mcnt_on_boundary_still_advances() {
        let q = 21;
        let period = 1u64 << q;
        let aligned = 7 * period;
        assert_eq!(quantised_load_mcnt(aligned, q), 8 * period);
    }

    #[test]
    fn test_baseline_triangle_two_antennas() {
        let order = baseline_triangle(2);
        assert_eq!(order, vec![(0, 0), (0, 1), (1, 1)]);
    }

    #[test]
    fn test_baseline_triangle_covers_all_pairs() {
        let n = 4;
        let order = baseline_triangle(n);
        for a in 0..n {
            for b in a..n {
                assert!(
                    order.contains(&(a, b)) || order.contains(&(b, a)),
                    "pair ({a},{b}) missing"
                );
            }
        }
    }

    #[test]
    fn test_monitor_compare_detects_stall() {
        let mk = |errors, count| {
            let mut vacc = BTreeMap::new();
            vacc.insert(
                "xhost00".to_string(),
                vec![VaccEngineStatus {
                    arm_count: 1,
                    load_count: 1,
                    errors,
                    count,
                }],
            );
            let mut reorder = BTreeMap::new();
            reorder.insert("xhost00".to_string(), vec![0]);
            MonitorSample { vacc, reorder }
        };
        assert!(monitor_compare(&mk(0, 5), &mk(0, 9)).is_none());
        assert_eq!(
            monitor_compare(&mk(0, 5), &mk(0, 5)),
            Some("vacc count not incrementing")
        );
        assert_eq!(
            monitor_compare(&mk(0, 5), &mk(2, 9)),
            Some("vacc errors incrementing")
        );
    }

    #[test]
    fn test_monitor_compare_detects_reorder_movement() {
        let mk = |reo: u64, count: u64| {
            let mut vacc = BTreeMap::new();
            vacc.insert(
                "xhost00".to_string(),
                vec![VaccEngineStatus {
                    arm_count: 1,
                    load_count: 1,
                    errors: 0,
                    count,
                }],
            );
            let mut reorder = BTreeMap::new();
            reorder.insert("xhost00".to_string(), vec![reo]);
            MonitorSample { vacc, reorder }
        };
        assert_eq!(
            monitor_compare(&mk(0, 1), &mk(3, 2)),
            Some("reorder timeout counters moved")
        );
    }
}
