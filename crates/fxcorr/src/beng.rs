// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fxcorr contributors

//! B-engine operations: tied-array beams.
//!
//! Each beam lives on every X-host (B-engines co-host with X-engines)
//! and carries per-input weights, a quantiser gain and a passband.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::fanout::fanout;
use crate::instrument::Geometry;
use crate::meta::{items, MetaHeap};
use crate::stream::DataStream;
use crate::transport::Host;

/// Fixed-point scale for weights and gains on the boards (16.16).
const WEIGHT_SCALE: f64 = 65536.0;

/// One weighted input feeding a beam.
#[derive(Debug, Clone, Copy)]
pub struct BeamSource {
    pub weight: f64,
    /// Stable index into the beam's weight table, from the sorted
    /// source-name ordering.
    pub index: usize,
}

/// A frequency-domain tied-array beam.
pub struct Beam {
    pub index: usize,
    stream: Arc<DataStream>,
    passband: RwLock<(f64, f64)>,
    quant_gain: RwLock<f64>,
    pub outbits: u32,
    pub chans_per_partition: usize,
    sources: RwLock<BTreeMap<String, BeamSource>>,
}

impl Beam {
    pub fn new(
        index: usize,
        stream: Arc<DataStream>,
        bandwidth: f64,
        center_freq: f64,
        quant_gain: f64,
        outbits: u32,
        chans_per_partition: usize,
        weights: BTreeMap<String, f64>,
    ) -> Arc<Self> {
        // sorted source names give stable table indices
        let sources = weights
            .into_iter()
            .enumerate()
            .map(|(i, (label, weight))| (label, BeamSource { weight, index: i }))
            .collect();
        Arc::new(Beam {
            index,
            stream,
            passband: RwLock::new((bandwidth, center_freq)),
            quant_gain: RwLock::new(quant_gain),
            outbits,
            chans_per_partition,
            sources: RwLock::new(sources),
        })
    }

    pub fn name(&self) -> String {
        self.stream.name()
    }

    pub fn stream(&self) -> &Arc<DataStream> {
        &self.stream
    }

    pub fn passband(&self) -> (f64, f64) {
        *self.passband.read()
    }

    pub fn quant_gain(&self) -> f64 {
        *self.quant_gain.read()
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.read().keys().cloned().collect()
    }

    pub fn source(&self, input_name: &str) -> Result<BeamSource> {
        self.sources
            .read()
            .get(input_name)
            .copied()
            .ok_or_else(|| Error::InputUnknown(input_name.to_string()))
    }

    /// The weight table in index order, as board words.
    fn weight_words(&self) -> Vec<u32> {
        let sources = self.sources.read();
        let mut table = vec![0u32; sources.len()];
        for src in sources.values() {
            table[src.index] = (src.weight * WEIGHT_SCALE) as u32;
        }
        table
    }
}

pub struct BengineOperations {
    hosts: Vec<Arc<Host>>,
    beams: Vec<Arc<Beam>>,
    geometry: Geometry,
}

impl BengineOperations {
    pub fn new(hosts: Vec<Arc<Host>>, beams: Vec<Arc<Beam>>, geometry: Geometry) -> Arc<Self> {
        Arc::new(BengineOperations {
            hosts,
            beams,
            geometry,
        })
    }

    pub fn beams(&self) -> &[Arc<Beam>] {
        &self.beams
    }

    pub fn get_beam(&self, name: &str) -> Result<Arc<Beam>> {
        self.beams
            .iter()
            .find(|b| b.name() == name)
            .cloned()
            .ok_or_else(|| Error::StreamUnknown(name.to_string()))
    }

    /// Post-program bring-up: destination, weights and quantiser gain
    /// for every beam.
    pub async fn initialise(&self) -> Result<()> {
        for beam in &self.beams {
            self.write_beam_destination(beam).await?;
            self.write_weights(beam).await?;
            self.write_quant_gain(beam).await?;
            info!(beam = %beam.name(), index = beam.index, "beam initialised");
        }
        Ok(())
    }

    /// Write a beam's destination base to the per-beam registers.
    pub async fn write_beam_destination(&self, beam: &Arc<Beam>) -> Result<()> {
        let dest = beam.stream().destination();
        let ip = u32::from(dest.base()) as u64;
        let port = dest.port() as u64;
        let index = beam.index;
        fanout(&self.hosts, Duration::from_secs(5), move |h| {
            h.write(&format!("bf{index}_ip"), &[("reg", ip)])?;
            h.write(&format!("bf{index}_port"), &[("reg", port)])
        })
        .await
        .into_ok_map()?;
        Ok(())
    }

    async fn write_weights(&self, beam: &Arc<Beam>) -> Result<()> {
        let words = Arc::new(beam.weight_words());
        let index = beam.index;
        let words_for_op = words.clone();
        fanout(&self.hosts, Duration::from_secs(60), move |h| {
            h.write_block(&format!("bf{index}_weights"), &words_for_op)
        })
        .await
        .into_ok_map()?;
        Ok(())
    }

    async fn write_quant_gain(&self, beam: &Arc<Beam>) -> Result<()> {
        let gain_word = (beam.quant_gain() * WEIGHT_SCALE) as u64;
        let index = beam.index;
        fanout(&self.hosts, Duration::from_secs(60), move |h| {
            h.write(&format!("bf{index}_gain"), &[("gain", gain_word)])
        })
        .await
        .into_ok_map()?;
        Ok(())
    }

    /// Set one input's weight on a beam. Skips the hardware when the
    /// stored value already matches. Returns the weight in force.
    pub async fn set_beam_weights(
        &self,
        beam_name: &str,
        input_name: &str,
        new_weight: f64,
    ) -> Result<f64> {
        let beam = self.get_beam(beam_name)?;
        let current = beam.source(input_name)?;
        if (new_weight - current.weight).abs() < f64::EPSILON {
            info!(beam = beam_name, input = input_name, weight = new_weight,
                  "weight already set");
            return Ok(new_weight);
        }
        {
            let mut sources = beam.sources.write();
            if let Some(src) = sources.get_mut(input_name) {
                src.weight = new_weight;
            }
        }
        self.write_weights(&beam).await?;
        info!(beam = beam_name, input = input_name, weight = new_weight, "beam weight set");
        Ok(new_weight)
    }

    /// Read one input's weight back from the boards, verifying the fleet
    /// agrees, and refresh the cache.
    pub async fn get_beam_weights(&self, beam_name: &str, input_name: &str) -> Result<f64> {
        let beam = self.get_beam(beam_name)?;
        let source = beam.source(input_name)?;
        let index = beam.index;
        let offset = source.index * 4;
        let reads = fanout(&self.hosts, Duration::from_secs(5), move |h| {
            let bytes = h
                .transport()
                .memory_read(&format!("bf{index}_weights"), offset, 4)?;
            if bytes.len() < 4 {
                return Err(Error::transport(h.name(), "short weight read"));
            }
            Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        })
        .await
        .into_ok_map()?;

        let reference = reads[self.hosts[0].name()];
        for (host, word) in &reads {
            if *word != reference {
                return Err(Error::transport(
                    host,
                    format!("beam {beam_name} weights differ across hosts"),
                ));
            }
        }
        let weight = reference as f64 / WEIGHT_SCALE;
        {
            let mut sources = beam.sources.write();
            if let Some(src) = sources.get_mut(input_name) {
                src.weight = weight;
            }
        }
        Ok(weight)
    }

    /// Set a beam's quantiser gain. Returns the gain actually applied
    /// (the fixed-point grid snaps it).
    pub async fn set_beam_quant_gains(&self, beam_name: &str, new_gain: f64) -> Result<f64> {
        let beam = self.get_beam(beam_name)?;
        if (new_gain - beam.quant_gain()).abs() < f64::EPSILON {
            info!(beam = beam_name, gain = new_gain, "quantiser gain already set");
            return Ok(new_gain);
        }
        let snapped = ((new_gain * WEIGHT_SCALE) as u64) as f64 / WEIGHT_SCALE;
        *beam.quant_gain.write() = snapped;
        self.write_quant_gain(&beam).await?;
        info!(
            beam = beam_name,
            requested = new_gain,
            applied = snapped,
            "beam quantiser gain set"
        );
        Ok(snapped)
    }

    /// Read a beam's quantiser gain from the boards, verifying the
    /// fleet agrees.
    pub async fn get_beam_quant_gains(&self, beam_name: &str) -> Result<f64> {
        let beam = self.get_beam(beam_name)?;
        let index = beam.index;
        let reads = fanout(&self.hosts, Duration::from_secs(5), move |h| {
            h.read_field(&format!("bf{index}_gain"), "gain")
        })
        .await
        .into_ok_map()?;
        let reference = reads[self.hosts[0].name()];
        for (host, word) in &reads {
            if *word != reference {
                return Err(Error::transport(
                    host,
                    format!("beam {beam_name} quantiser gains differ across hosts"),
                ));
            }
        }
        let hw = reference as f64 / WEIGHT_SCALE;
        if (hw - beam.quant_gain()).abs() > f64::EPSILON {
            warn!(
                beam = beam_name,
                stored = beam.quant_gain(),
                hw,
                "quantiser gain cache disagrees with hardware"
            );
            *beam.quant_gain.write() = hw;
        }
        Ok(hw)
    }

    /// Set the beam passband; bandwidth and centre frequency snap to the
    /// partition grid. Returns what was applied.
    pub async fn set_beam_passband(
        &self,
        beam_name: &str,
        bandwidth: f64,
        center_freq: f64,
    ) -> Result<(f64, f64)> {
        let beam = self.get_beam(beam_name)?;
        let band = self.geometry.sample_rate_hz / 2.0;
        let partition_bw =
            band / (self.geometry.n_chans as f64) * beam.chans_per_partition as f64;

        let bw = (bandwidth / partition_bw).round().max(1.0) * partition_bw;
        let bw = bw.min(band);
        let cf = (center_freq / partition_bw).round() * partition_bw;
        let cf = cf.clamp(bw / 2.0, band - bw / 2.0);

        let chan_bw = band / self.geometry.n_chans as f64;
        let start_chan = ((cf - bw / 2.0) / chan_bw).round() as u64;
        let n_chans = (bw / chan_bw).round() as u64;
        let index = beam.index;
        fanout(&self.hosts, Duration::from_secs(5), move |h| {
            h.write(
                &format!("bf{index}_passband"),
                &[("start_chan", start_chan), ("n_chans", n_chans)],
            )
        })
        .await
        .into_ok_map()?;

        *beam.passband.write() = (bw, cf);
        info!(beam = beam_name, bandwidth = bw, center_freq = cf, "beam passband set");
        Ok((bw, cf))
    }

    pub fn get_beam_passband(&self, beam_name: &str) -> Result<(f64, f64)> {
        Ok(self.get_beam(beam_name)?.passband())
    }

    pub async fn tx_enable(&self, beam_name: &str) -> Result<()> {
        let beam = self.get_beam(beam_name)?;
        let index = beam.index;
        fanout(&self.hosts, Duration::from_secs(5), move |h| {
            h.write(&format!("bf{index}_config"), &[("txen", 1)])
        })
        .await
        .into_ok_map()?;
        beam.stream().set_tx_enabled(true);
        info!(beam = beam_name, "beam output enabled");
        Ok(())
    }

    pub async fn tx_disable(&self, beam_name: &str) -> Result<()> {
        let beam = self.get_beam(beam_name)?;
        let index = beam.index;
        fanout(&self.hosts, Duration::from_secs(5), move |h| {
            h.write(&format!("bf{index}_config"), &[("txen", 0)])
        })
        .await
        .into_ok_map()?;
        beam.stream().set_tx_enabled(false);
        info!(beam = beam_name, "beam output disabled");
        Ok(())
    }

    /// Metadata heap for one beam stream.
    pub fn build_metadata(&self, beam: &Arc<Beam>) -> MetaHeap {
        let (bw, cf) = beam.passband();
        let mut heap = MetaHeap::new();
        heap.push_f64(items::ADC_SAMPLE_RATE, self.geometry.sample_rate_hz);
        heap.push_u64(items::N_CHANS, self.geometry.n_chans as u64);
        heap.push_f64(items::BANDWIDTH, bw);
        heap.push_f64(items::CENTER_FREQ, cf);
        heap.push_f64(items::BEAM_QUANT_GAIN, beam.quant_gain());
        let weights: Vec<String> = {
            let sources = beam.sources.read();
            sources
                .iter()
                .map(|(label, s)| format!("{label}:{}", s.weight))
                .collect()
        };
        heap.push_str(items::BEAM_WEIGHTS, weights.join(","));
        let dest = beam.stream().destination();
        heap.push_u64(items::RX_UDP_PORT, dest.port() as u64);
        heap.push_str(items::RX_UDP_IP, dest.base().to_string());
        heap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::StreamAddress;
    use crate::stream::{DataStream, StreamCategory};

    fn beam() -> Arc<Beam> {
        let stream = DataStream::new(
            "tied-array-channelised-voltage-0x",
            StreamCategory::BeamformerFrequencyDomain,
            StreamAddress::parse("239.9.4.1+3:7148").expect("addr"),
        );
        let mut weights = BTreeMap::new();
        weights.insert("ant1x".to_string(), 0.5);
        weights.insert("ant0x".to_string(), 1.0);
        Beam::new(0, stream, 856e6, 428e6, 0.5, 8, 4, weights)
    }

    #[test]
    fn test_source_indices_follow_sorted_names() {
        let b = beam();
        // BTreeMap ordering: ant0x before ant1x
        assert_eq!(b.source("ant0x").expect("src").index, 0);
        assert_eq!(b.source("ant1x").expect("src").index, 1);
        let err = b.source("ant9q").unwrap_err();
        assert_eq!(err.kind_token(), "input_unknown");
    }

    #[test]
    fn test_weight_words_ordering() {
        let b = beam();
        let words = b.weight_words();
        assert_eq!(words[0], 65536);
        assert_eq!(words[1], 32768);
    }
}
