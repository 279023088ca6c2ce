// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fxcorr contributors

//! F-engine operations.
//!
//! Everything the coordinator does to the channeliser tier: post-program
//! bring-up, the delay/equaliser update pipeline, the receive-timestamp
//! audit, fft-shift control and voltage snapshots.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::delay::{BoardDelay, DelayModel};
use crate::eq::{Eq, Gain};
use crate::error::{Error, Result};
use crate::fanout::fanout;
use crate::instrument::{Fengine, Geometry};
use crate::meta::{items, MetaHeap};
use crate::stream::DataStream;
use crate::time::{unix_now, TimeModel};
use crate::transport::Host;

/// Delay loads race the board's own load time; late writes are silent
/// failures, so the fan-out deadline is tight.
const DELAY_FANOUT_TIMEOUT: Duration = Duration::from_millis(500);

const TX_ENABLE_RETRIES: u32 = 5;

pub struct FengineOperations {
    hosts: Vec<Arc<Host>>,
    fengines: Arc<Vec<Arc<Fengine>>>,
    stream: Arc<DataStream>,
    time: Arc<TimeModel>,
    geometry: Geometry,
    fft_shift: AtomicU64,
}

impl FengineOperations {
    pub fn new(
        hosts: Vec<Arc<Host>>,
        fengines: Arc<Vec<Arc<Fengine>>>,
        stream: Arc<DataStream>,
        time: Arc<TimeModel>,
        geometry: Geometry,
    ) -> Arc<Self> {
        let fft_shift = AtomicU64::new(geometry.fft_shift as u64);
        Arc::new(FengineOperations {
            hosts,
            fengines,
            stream,
            time,
            geometry,
            fft_shift,
        })
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    pub fn fengines(&self) -> &[Arc<Fengine>] {
        &self.fengines
    }

    pub fn stream(&self) -> &Arc<DataStream> {
        &self.stream
    }

    /// Find an F-engine by its current input label.
    pub fn get_fengine(&self, input_name: &str) -> Result<Arc<Fengine>> {
        self.fengines
            .iter()
            .find(|f| f.label() == input_name)
            .cloned()
            .ok_or_else(|| Error::InputUnknown(input_name.to_string()))
    }

    /// Current input labels, in input-number order.
    pub fn input_labels(&self) -> Vec<String> {
        self.fengines.iter().map(|f| f.label()).collect()
    }

    /// Post-program bring-up.
    pub async fn initialise(&self) -> Result<()> {
        let num_x = self.geometry.num_xengines as u64;
        let f_per_x = (self.geometry.n_chans as u64) / num_x.max(1);

        // independent-x bitstreams carry an x_setup register
        if self.hosts.iter().all(|h| h.has_register("x_setup")) {
            info!("found independent-x F-engines, writing x_setup");
            fanout(&self.hosts, Duration::from_secs(10), move |h| {
                h.write(
                    "x_setup",
                    &[("f_per_x", f_per_x), ("ip_per_x", 1), ("num_x", num_x)],
                )
            })
            .await
            .into_ok_map()?;
        } else {
            info!("found fixed-x F-engines");
        }

        // corner turner control, where the bitstream has it
        if self.hosts.iter().all(|h| h.has_register("ct_control0")) {
            let num_x_hosts = (self.geometry.num_xengines / self.geometry.x_per_fpga).max(1) as u64;
            let chans = self.geometry.n_chans as u64;
            fanout(&self.hosts, Duration::from_secs(10), move |h| {
                h.write("ct_control0", &[("reg", chans / num_x.max(1))])?;
                h.write("ct_control1", &[("reg", num_x)])?;
                h.write("ct_control2", &[("reg", chans / num_x_hosts)])?;
                h.write("ct_control3", &[("reg", num_x_hosts)])
            })
            .await
            .into_ok_map()?;
        } else {
            warn!("no corner turner control registers found on the F-hosts");
        }

        // board ids and the output port
        let port = self.stream.destination().port() as u64;
        let ids: Arc<HashMap<String, u64>> = Arc::new(
            self.hosts
                .iter()
                .enumerate()
                .map(|(i, h)| (h.name().to_string(), i as u64))
                .collect(),
        );
        let ids_for_op = ids.clone();
        fanout(&self.hosts, Duration::from_secs(10), move |h| {
            let id = *ids_for_op.get(h.name()).unwrap_or(&0);
            h.write("board_id", &[("reg", id)])?;
            h.write("tx_metadata", &[("board_id", id), ("porttx", port)])
        })
        .await
        .into_ok_map()?;

        self.write_stream_destination().await?;
        self.commit_all_eq().await?;
        self.set_fft_shift(None).await?;
        Ok(())
    }

    /// Write the F output stream base address to every host.
    pub async fn write_stream_destination(&self) -> Result<()> {
        let ip = u32::from(self.stream.destination().base()) as u64;
        fanout(&self.hosts, Duration::from_secs(5), move |h| {
            h.write("iptx_base", &[("reg", ip)])
        })
        .await
        .into_ok_map()?;
        info!(
            stream = %self.stream.name(),
            destination = %self.stream.destination(),
            "wrote F-engine stream destination"
        );
        Ok(())
    }

    /// Enable channelised-voltage output, with bounded retries.
    pub async fn tx_enable(&self) -> Result<()> {
        if self.stream.tx_enabled() {
            warn!("F-engine stream already running, ignoring tx_enable");
            return Ok(());
        }
        let mut attempt = 0;
        loop {
            attempt += 1;
            let res = fanout(&self.hosts, Duration::from_secs(5), |h| {
                h.write("control", &[("gbe_txen", 1)])
            })
            .await;
            if res.all_ok() {
                self.stream.set_tx_enabled(true);
                info!("F-engine output enabled");
                return Ok(());
            }
            if attempt >= TX_ENABLE_RETRIES {
                return res.into_ok_map().map(|_| ());
            }
            warn!(
                attempt,
                "failed to start F-engine output, retrying"
            );
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// The public stop path refuses: stopping the F stream breaks the
    /// instrument downstream.
    pub fn tx_disable(&self) {
        warn!("stopping the F-engine stream would break the correlator, ignoring");
    }

    pub async fn force_tx_disable(&self) -> Result<()> {
        fanout(&self.hosts, Duration::from_secs(5), |h| {
            h.write("control", &[("gbe_txen", 0)])
        })
        .await
        .into_ok_map()?;
        self.stream.set_tx_enabled(false);
        info!("F-engine output disabled");
        Ok(())
    }

    /// Subscribe every F-host to its inputs' digitiser groups. Done one
    /// host at a time to ease the load on the switch.
    pub async fn subscribe_multicast(&self) -> Result<()> {
        for host in &self.hosts {
            let groups: Vec<_> = self
                .fengines
                .iter()
                .filter(|f| f.host.name() == host.name())
                .flat_map(|f| f.source().enumerate().collect::<Vec<_>>())
                .collect();
            let iface = host
                .gbe_interfaces()
                .first()
                .cloned()
                .unwrap_or_else(|| "gbe0".to_string());
            let host_name = host.name().to_string();
            let host = host.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                for group in groups {
                    if group.is_multicast() {
                        host.transport().subscribe_multicast(&iface, group)?;
                    }
                }
                Ok(())
            })
            .await
            .map_err(|e| Error::transport(&host_name, e))??;
        }
        info!("subscribed F-engine inputs to their digitiser groups");
        Ok(())
    }

    // --- delays ---

    /// Set the delay model for a single input. Returns the quantised
    /// values the board read back.
    pub async fn delay_set(
        &self,
        input_name: &str,
        t_load: Option<f64>,
        model: DelayModel,
    ) -> Result<DelayModel> {
        let feng = self.get_fengine(input_name)?;
        let t_load = t_load.unwrap_or_else(|| unix_now() + 2.0 * self.time.min_load_lead());
        let load_mcnt = self.time.load_mcnt(t_load)? as i64;

        let mut model = model;
        model.load_mcnt = load_mcnt;
        let board = model.to_board(self.geometry.sample_rate_hz);
        let offset = feng.offset;
        let host = feng.host.clone();
        let readback = tokio::task::spawn_blocking(move || {
            write_delay_registers(&host, offset, &board)
        })
        .await
        .map_err(|e| Error::transport(feng.host.name(), e))??;

        let applied = readback.to_model(self.geometry.sample_rate_hz);
        feng.store_delay(applied);
        debug!(input = input_name, mcnt = load_mcnt, "delay model staged");
        Ok(applied)
    }

    /// Set delays for every input at one load time, in parallel. The
    /// models are given in input-number order.
    pub async fn delay_set_all(
        &self,
        t_load: f64,
        models: Vec<DelayModel>,
    ) -> Result<Vec<DelayModel>> {
        if models.len() != self.fengines.len() {
            return Err(Error::config(
                "delays",
                format!(
                    "have {} inputs, received {} coefficient sets",
                    self.fengines.len(),
                    models.len()
                ),
            ));
        }
        let load_mcnt = if t_load > 0.0 {
            self.time.load_mcnt(t_load)? as i64
        } else {
            -1
        };

        // one write plan per host
        let mut plan: HashMap<String, Vec<(usize, BoardDelay)>> = HashMap::new();
        for (feng, model) in self.fengines.iter().zip(&models) {
            let mut model = *model;
            model.load_mcnt = load_mcnt;
            plan.entry(feng.host.name().to_string())
                .or_default()
                .push((feng.offset, model.to_board(self.geometry.sample_rate_hz)));
        }
        let plan = Arc::new(plan);

        let plan_for_op = plan.clone();
        let res = fanout(&self.hosts, DELAY_FANOUT_TIMEOUT, move |h| {
            let mut out = Vec::new();
            if let Some(entries) = plan_for_op.get(h.name()) {
                for (offset, board) in entries {
                    out.push((*offset, write_delay_registers(h, *offset, board)?));
                }
            }
            Ok(out)
        })
        .await;

        let failed = res.failed_hosts();
        if !failed.is_empty() {
            return Err(Error::DelayPartialCommit(failed));
        }
        let per_host = res.into_ok_map()?;

        let mut applied = vec![DelayModel::zero(); self.fengines.len()];
        for feng in self.fengines.iter() {
            if let Some(entries) = per_host.get(feng.host.name()) {
                if let Some((_, board)) = entries.iter().find(|(o, _)| *o == feng.offset) {
                    let model = board.to_model(self.geometry.sample_rate_hz);
                    feng.store_delay(model);
                    applied[feng.number] = model;
                }
            }
        }
        Ok(applied)
    }

    // --- equalisers ---

    /// The stored equaliser for one input, or for all inputs.
    pub fn eq_get(&self, input_name: Option<&str>) -> Result<BTreeMap<String, Eq>> {
        let mut out = BTreeMap::new();
        match input_name {
            Some(name) => {
                let feng = self.get_fengine(name)?;
                out.insert(feng.label(), feng.eq_spec());
            }
            None => {
                for feng in self.fengines.iter() {
                    out.insert(feng.label(), feng.eq_spec());
                }
            }
        }
        Ok(out)
    }

    /// Set the equaliser for one input, or for all. The in-memory value
    /// only changes once the board write has succeeded, so a failed set
    /// leaves the previous equaliser in force.
    pub async fn eq_set(&self, input_name: Option<&str>, eq: Eq) -> Result<()> {
        let gains = Arc::new(eq.normalise(self.geometry.n_chans)?);
        let targets: Vec<Arc<Fengine>> = match input_name {
            Some(name) => vec![self.get_fengine(name)?],
            None => self.fengines.iter().cloned().collect(),
        };

        let mut first_err: Option<Error> = None;
        for feng in targets {
            let host = feng.host.clone();
            let offset = feng.offset;
            let words: Vec<u32> = gains.iter().map(Gain::to_word).collect();
            let prior: Vec<u32> = feng.eq_gains().iter().map(Gain::to_word).collect();
            let result = tokio::task::spawn_blocking(move || {
                commit_eq(&host, offset, &words, &prior)
            })
            .await
            .map_err(|e| Error::transport(feng.host.name(), e))?;
            match result {
                Ok(()) => feng.store_eq(eq.clone(), gains.as_ref().clone()),
                Err(e) => {
                    warn!(input = %feng.label(), error = %e, "equaliser write failed, value reverted");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Push every input's stored equaliser to the hardware.
    pub async fn commit_all_eq(&self) -> Result<()> {
        for feng in self.fengines.iter() {
            let host = feng.host.clone();
            let offset = feng.offset;
            let words: Vec<u32> = feng.eq_gains().iter().map(Gain::to_word).collect();
            let prior = words.clone();
            tokio::task::spawn_blocking(move || commit_eq(&host, offset, &words, &prior))
                .await
                .map_err(|e| Error::transport(feng.host.name(), e))??;
        }
        info!("committed equalisers on all inputs");
        Ok(())
    }

    // --- rx timestamp audit ---

    /// Read every F-host's local sample count and audit it against the
    /// time model. Returns overall health plus the per-host counts and
    /// their Unix representations.
    pub async fn get_rx_timestamps(
        &self,
    ) -> Result<(bool, BTreeMap<String, u64>, BTreeMap<String, f64>)> {
        let start = unix_now();
        let counts = fanout(&self.hosts, Duration::from_secs(5), |h| {
            h.transport().get_local_time()
        })
        .await
        .into_ok_map()?;
        let read_time = unix_now();
        let elapsed = read_time - start;

        let mut mcnts = BTreeMap::new();
        let mut times = BTreeMap::new();
        let mut okay = true;

        for host in &self.hosts {
            let mcnt = counts[host.name()];
            let t = self.time.time_from_mcnt(mcnt)?;
            mcnts.insert(host.name().to_string(), mcnt);
            times.insert(host.name().to_string(), t);

            if mcnt & 0xfff != 0 {
                warn!(host = host.name(), mcnt, "low 12 timestamp bits are not zero");
                okay = false;
            }
            if t > read_time + self.time.jitter_allowed() {
                warn!(host = host.name(), board_time = t, "board time is in the future");
                okay = false;
            }
            if (read_time - t).abs() > self.time.offset_allowed() {
                warn!(
                    host = host.name(),
                    board_time = t,
                    wall_time = read_time,
                    "board time is too far from wall time"
                );
                okay = false;
            }
        }

        let spread = times.values().cloned().fold(f64::MIN, f64::max)
            - times.values().cloned().fold(f64::MAX, f64::min);
        if spread > self.time.jitter_allowed() + elapsed {
            warn!(spread, elapsed, "F-engine timestamps are too far apart");
            okay = false;
        }
        Ok((okay, mcnts, times))
    }

    // --- fft shift ---

    /// Write the FFT shift schedule to every F-host. `None` re-commits
    /// the cached schedule.
    pub async fn set_fft_shift(&self, shift: Option<u32>) -> Result<u32> {
        let shift = shift.unwrap_or(self.fft_shift.load(Ordering::Acquire) as u32);
        fanout(&self.hosts, Duration::from_secs(10), move |h| {
            h.write("fft_shift", &[("shift", shift as u64)])
        })
        .await
        .into_ok_map()?;
        self.fft_shift.store(shift as u64, Ordering::Release);
        info!(shift, "set FFT shift on all F-engine boards");
        Ok(shift)
    }

    /// Read the FFT shift from the boards, correcting the cache if the
    /// hardware disagrees.
    pub async fn get_fft_shift(&self) -> Result<u32> {
        let reads = fanout(&self.hosts, Duration::from_secs(10), |h| {
            h.read_field("fft_shift", "shift")
        })
        .await
        .into_ok_map()?;
        let hw = reads[self.hosts[0].name()] as u32;
        if hw as u64 != self.fft_shift.load(Ordering::Acquire) {
            warn!(hw, "FFT shift read from F-hosts disagrees with stored value, correcting");
            self.fft_shift.store(hw as u64, Ordering::Release);
        }
        Ok(hw)
    }

    // --- snapshots ---

    /// The quantised spectrum for one input.
    pub async fn quantiser_snapshot(&self, input_name: &str) -> Result<Vec<Gain>> {
        let feng = self.get_fengine(input_name)?;
        let host = feng.host.clone();
        let snap = format!("snap_quant{}", feng.offset);
        let data = tokio::task::spawn_blocking(move || -> Result<_> {
            host.transport().snapshot_arm(&snap, 0, false)?;
            host.transport().snapshot_read(&snap)
        })
        .await
        .map_err(|e| Error::transport(feng.host.name(), e))??;
        let real = data.get("real").cloned().unwrap_or_default();
        let imag = data.get("imag").cloned().unwrap_or_default();
        Ok(real
            .into_iter()
            .zip(imag)
            .map(|(re, im)| Gain {
                re: re as f64,
                im: im as f64,
            })
            .collect())
    }

    /// Raw voltage buffers, for one input or all of them. With a capture
    /// time, the trigger sample count is quantised down to a 2^12
    /// boundary and the call waits for it to pass.
    pub async fn adc_snapshot(
        &self,
        input_name: Option<&str>,
        unix_time: Option<f64>,
    ) -> Result<BTreeMap<String, AdcSnapshot>> {
        if let Some(t) = unix_time {
            let now = unix_now();
            if t < now {
                return Err(Error::LoadTooSoon {
                    requested: t,
                    lead: 0.0,
                    now,
                });
            }
            let mcnt = self.time.mcnt_from_time(t)?;
            let _trigger = (mcnt >> 12) << 12;
            tokio::time::sleep(Duration::from_secs_f64(t - now)).await;
        }

        let targets: Vec<Arc<Fengine>> = match input_name {
            Some(name) => vec![self.get_fengine(name)?],
            None => self.fengines.iter().cloned().collect(),
        };
        let mut out = BTreeMap::new();
        for feng in targets {
            let host = feng.host.clone();
            let snap = format!("snap_adc{}", feng.offset);
            let data = tokio::task::spawn_blocking(move || -> Result<_> {
                host.transport().snapshot_arm(&snap, 0, false)?;
                host.transport().snapshot_read(&snap)
            })
            .await
            .map_err(|e| Error::transport(feng.host.name(), e))??;
            let timestamp = data
                .get("timestamp")
                .and_then(|v| v.first().copied())
                .unwrap_or(0);
            let samples = data
                .get("real")
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|v| v as i64)
                .collect();
            out.insert(
                feng.label(),
                AdcSnapshot {
                    timestamp_mcnt: timestamp,
                    data: samples,
                },
            );
        }
        Ok(out)
    }

    /// Metadata heap for the channelised-voltage stream.
    pub fn build_metadata(&self) -> MetaHeap {
        let mut heap = MetaHeap::new();
        heap.push_f64(items::ADC_SAMPLE_RATE, self.geometry.sample_rate_hz);
        heap.push_u64(items::N_CHANS, self.geometry.n_chans as u64);
        heap.push_u64(items::F_PER_FPGA, self.geometry.f_per_fpga as u64);
        heap.push_u64(items::FFT_SHIFT, self.fft_shift.load(Ordering::Acquire));
        heap.push_str(items::INPUT_LABELS, self.input_labels().join(","));
        let dest = self.stream.destination();
        heap.push_u64(items::RX_UDP_PORT, dest.port() as u64);
        heap.push_str(items::RX_UDP_IP, dest.base().to_string());
        heap
    }
}

/// One ADC voltage capture.
#[derive(Debug, Clone)]
pub struct AdcSnapshot {
    pub timestamp_mcnt: u64,
    pub data: Vec<i64>,
}

fn reg_field(fields: &crate::transport::RegisterFields, host: &Host, name: &str) -> Result<u64> {
    fields
        .get(name)
        .copied()
        .ok_or_else(|| Error::transport(host.name(), format!("missing field {name}")))
}

/// Write one input's delay registers and read back what the board holds.
fn write_delay_registers(host: &Host, offset: usize, board: &BoardDelay) -> Result<BoardDelay> {
    host.write(
        &format!("delay{offset}"),
        &[
            ("whole", board.whole_samples),
            ("frac", board.frac_samples),
        ],
    )?;
    host.write(&format!("delay_rate{offset}"), &[("rate", board.rate_word())])?;
    host.write(
        &format!("phase{offset}"),
        &[
            ("offset", board.phase_word()),
            ("rate", board.phase_rate_word()),
        ],
    )?;
    if board.load_mcnt >= 0 {
        let mcnt = board.load_mcnt as u64;
        host.write(
            &format!("delay{offset}_load"),
            &[("lsw", mcnt & 0xffff_ffff), ("msw", mcnt >> 32)],
        )?;
    }

    let d = host.read(&format!("delay{offset}"))?;
    let r = host.read(&format!("delay_rate{offset}"))?;
    let p = host.read(&format!("phase{offset}"))?;
    Ok(BoardDelay::from_words(
        reg_field(&d, host, "whole")?,
        reg_field(&d, host, "frac")?,
        reg_field(&r, host, "rate")?,
        reg_field(&p, host, "offset")?,
        reg_field(&p, host, "rate")?,
        board.load_mcnt,
    ))
}

/// Write an equaliser bram then pulse the update register. A failed
/// pulse restores the previous table; a restore that also fails leaves
/// hardware state unknown and is its own error kind.
fn commit_eq(host: &Host, offset: usize, words: &[u32], prior: &[u32]) -> Result<()> {
    let bram = format!("eq{offset}");
    let ctrl = format!("eq{offset}_ctrl");
    host.write_block(&bram, words)?;
    if let Err(pulse_err) = host.write(&ctrl, &[("update", 1)]) {
        if host.write_block(&bram, prior).is_err() {
            return Err(Error::EqRevert {
                host: host.name().to_string(),
                reason: pulse_err.to_string(),
            });
        }
        return Err(pulse_err);
    }
    host.write(&ctrl, &[("update", 0)])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_register_round_trip_values() {
        use crate::time::TimeModel;
        use crate::transport::sim::SimTransport;
        use crate::transport::HostGeometry;

        let time = Arc::new(TimeModel::new(1e9, 0.1, 0.5, 5.0));
        let geometry = HostGeometry {
            engines_per_host: 2,
            n_chans: 16,
            n_beams: 0,
        };
        let host = Host::new("fhost00", SimTransport::new_fhost("fhost00", &geometry, time));

        let model = DelayModel {
            delay: 3.2e-9,
            delay_rate: 1e-12,
            phase: 0.5,
            phase_rate: 0.0,
            load_mcnt: 1 << 20,
        };
        let board = model.to_board(1e9);
        let readback = write_delay_registers(&host, 1, &board).expect("write");
        let requested_samples = model.delay * 1e9;
        assert!(readback.delay_samples() <= requested_samples);
        assert!(requested_samples - readback.delay_samples() < 1.0);
        assert_eq!(readback.load_mcnt, 1 << 20);
    }
}
