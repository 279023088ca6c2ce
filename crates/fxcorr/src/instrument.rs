// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fxcorr contributors

//! The instrument model: hosts, engines, inputs, streams, and the
//! compiler that builds them from the declarative descriptor.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{info, warn};

use crate::address::StreamAddress;
use crate::beng::{Beam, BengineOperations};
use crate::config::InstrumentConfig;
use crate::delay::DelayModel;
use crate::eq::{Eq, Gain};
use crate::error::{Error, Result};
use crate::fanout::fanout;
use crate::feng::FengineOperations;
use crate::meta::{items, MetaHeap, MetaTransmitter};
use crate::sensors::{ChangeRule, SensorKind, SensorManager, SensorStatus, SensorValue};
use crate::stream::{DataStream, StreamCategory, StreamRegistry};
use crate::time::TimeModel;
use crate::transport::{Host, HostGeometry, HostRole, TransportFactory};
use crate::xeng::XengineOperations;

/// The F output stream's canonical name.
pub const FENGINE_STREAM_NAME: &str = "antenna-channelised-voltage";

/// Fixed instrument geometry shared by the operation facades.
#[derive(Debug, Clone)]
pub struct Geometry {
    pub n_chans: usize,
    pub f_per_fpga: usize,
    pub x_per_fpga: usize,
    pub xeng_acc_len: u64,
    pub sample_rate_hz: f64,
    pub num_xengines: usize,
    pub fft_shift: u32,
}

/// One F-engine: an input bound to a host at an on-host offset. The
/// mutable cells (label, equaliser, delay) are swapped whole so readers
/// never see a torn value.
pub struct Fengine {
    pub number: usize,
    pub offset: usize,
    pub host: Arc<Host>,
    source: StreamAddress,
    label: ArcSwap<String>,
    eq_spec: ArcSwap<Eq>,
    eq_gains: ArcSwap<Vec<Gain>>,
    delay: ArcSwap<DelayModel>,
}

impl Fengine {
    fn new(
        number: usize,
        offset: usize,
        host: Arc<Host>,
        source: StreamAddress,
        label: String,
        eq_spec: Eq,
        eq_gains: Vec<Gain>,
    ) -> Arc<Self> {
        Arc::new(Fengine {
            number,
            offset,
            host,
            source,
            label: ArcSwap::from_pointee(label),
            eq_spec: ArcSwap::from_pointee(eq_spec),
            eq_gains: ArcSwap::from_pointee(eq_gains),
            delay: ArcSwap::from_pointee(DelayModel::zero()),
        })
    }

    pub fn label(&self) -> String {
        self.label.load().as_ref().clone()
    }

    pub fn set_label(&self, label: String) {
        self.label.store(Arc::new(label));
    }

    pub fn source(&self) -> &StreamAddress {
        &self.source
    }

    pub fn eq_spec(&self) -> Eq {
        self.eq_spec.load().as_ref().clone()
    }

    pub fn eq_gains(&self) -> Arc<Vec<Gain>> {
        self.eq_gains.load_full()
    }

    pub fn store_eq(&self, spec: Eq, gains: Vec<Gain>) {
        self.eq_spec.store(Arc::new(spec));
        self.eq_gains.store(Arc::new(gains));
    }

    pub fn delay(&self) -> DelayModel {
        **self.delay.load()
    }

    pub fn store_delay(&self, model: DelayModel) {
        self.delay.store(Arc::new(model));
    }
}

/// The assembled instrument.
pub struct Instrument {
    name: String,
    geometry: Geometry,
    time: Arc<TimeModel>,
    fhosts: Vec<Arc<Host>>,
    xhosts: Vec<Arc<Host>>,
    pub fops: Arc<FengineOperations>,
    pub xops: Arc<XengineOperations>,
    pub bops: Arc<BengineOperations>,
    streams: Arc<StreamRegistry>,
    meta: Arc<MetaTransmitter>,
    sensors: Arc<SensorManager>,
    initialised: AtomicBool,
}

impl Instrument {
    /// Compile the configuration into a live model: resolve inputs,
    /// engines and hosts, assign offsets and destination groups, and
    /// validate the counts.
    pub fn create(
        name: impl Into<String>,
        config: &InstrumentConfig,
        factory: &dyn TransportFactory,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        let geometry = Geometry {
            n_chans: config.fengine.n_chans,
            f_per_fpga: config.fengine.f_per_fpga,
            x_per_fpga: config.xengine.x_per_fpga,
            xeng_acc_len: config.xengine.xeng_accumulation_len,
            sample_rate_hz: config.fengine.sample_rate_hz,
            num_xengines: config.hosts.xhosts.len() * config.xengine.x_per_fpga,
            fft_shift: config.fengine.fft_shift,
        };
        let time = Arc::new(TimeModel::new(
            geometry.sample_rate_hz,
            config.timing.min_load_lead,
            config.timing.jitter_allowed(),
            config.timing.offset_allowed(),
        ));

        let fgeom = HostGeometry {
            engines_per_host: geometry.f_per_fpga,
            n_chans: geometry.n_chans,
            n_beams: 0,
        };
        let xgeom = HostGeometry {
            engines_per_host: geometry.x_per_fpga,
            n_chans: geometry.n_chans,
            n_beams: config.beams.len(),
        };
        let fhosts: Vec<Arc<Host>> = config
            .hosts
            .fhosts
            .iter()
            .map(|h| {
                factory
                    .connect(h, HostRole::Fengine, &fgeom, time.clone())
                    .map(|t| Arc::new(Host::new(h, t)))
            })
            .collect::<Result<_>>()?;
        let xhosts: Vec<Arc<Host>> = config
            .hosts
            .xhosts
            .iter()
            .map(|h| {
                factory
                    .connect(h, HostRole::Xengine, &xgeom, time.clone())
                    .map(|t| Arc::new(Host::new(h, t)))
            })
            .collect::<Result<_>>()?;

        // inputs, ordered by input number, bound to their F-engines
        let inputs = config.fengine.inputs()?;
        let range0 = inputs[0].destination.range();
        for input in &inputs {
            if input.destination.range() != range0 {
                return Err(Error::config(
                    format!("fengine.input_{}_destination", input.number),
                    format!(
                        "all F-engines must receive from {range0} streams, this input has {}",
                        input.destination.range()
                    ),
                ));
            }
        }
        let mut fengines = Vec::with_capacity(inputs.len());
        for spec in &inputs {
            let host_index = spec.number / geometry.f_per_fpga;
            let offset = spec.number % geometry.f_per_fpga;
            let host = fhosts.get(host_index).ok_or_else(|| {
                Error::config(
                    format!("fengine.input_{}_name", spec.number),
                    "input number runs past the F-host list",
                )
            })?;
            let gains = spec.eq.normalise(geometry.n_chans)?;
            fengines.push(Fengine::new(
                spec.number,
                offset,
                host.clone(),
                spec.destination.clone(),
                spec.name.clone(),
                spec.eq.clone(),
                gains,
            ));
        }
        if fengines.len() != fhosts.len() * geometry.f_per_fpga {
            return Err(Error::config(
                "fengine.f_per_fpga",
                format!(
                    "{} inputs but {} F-engine slots",
                    fengines.len(),
                    fhosts.len() * geometry.f_per_fpga
                ),
            ));
        }
        let fengines = Arc::new(fengines);

        let streams = Arc::new(StreamRegistry::new());
        for spec in &inputs {
            streams.add(DataStream::new(
                &spec.name,
                StreamCategory::DigitiserAdcSamples,
                spec.destination.clone(),
            ))?;
        }

        // the F output stream spreads over one group per X-engine
        let fout_base = config.fengine.output_destination()?;
        if fout_base.range() != 1 {
            return Err(Error::config(
                "fengine.destination_mcast_ips",
                "the F-engine output address must be a single starting base address",
            ));
        }
        let fout = fout_base.with_range(geometry.num_xengines as u32)?;
        let fstream = DataStream::new(FENGINE_STREAM_NAME, StreamCategory::FengineChannelised, fout);
        fstream.set_sources(inputs.iter().map(|i| i.destination.clone()).collect());
        streams.add(fstream.clone())?;

        let xstream = DataStream::new(
            &config.xengine.output_products[0],
            StreamCategory::XengineCrossProducts,
            config.xengine.output_destination()?,
        );
        xstream.set_sources(vec![fstream.destination()]);
        streams.add(xstream.clone())?;

        // beams: a range-1 base widened over every B-engine in the fleet
        let num_bengs = geometry.num_xengines;
        let chans_per_partition = geometry.n_chans / num_bengs.max(1);
        let mut beams = Vec::with_capacity(config.beams.len());
        for section in &config.beams {
            let base = section.destination()?;
            let dest = base.with_range(num_bengs as u32)?;
            let stream = DataStream::new(
                section.name(),
                StreamCategory::BeamformerFrequencyDomain,
                dest,
            );
            stream.set_sources(vec![fstream.destination()]);
            streams.add(stream.clone())?;
            beams.push(Beam::new(
                section.stream_index,
                stream,
                section.bandwidth,
                section.center_freq,
                section.quant_gain,
                section.beng_outbits,
                chans_per_partition,
                section.weights()?,
            ));
        }

        let meta = Arc::new(MetaTransmitter::new()?);
        let sensors = SensorManager::new(Duration::from_secs(10));

        let fops = FengineOperations::new(
            fhosts.clone(),
            fengines.clone(),
            fstream.clone(),
            time.clone(),
            geometry.clone(),
        );
        let xops = XengineOperations::new(
            xhosts.clone(),
            fengines.clone(),
            xstream,
            fstream,
            time.clone(),
            geometry.clone(),
            config.xengine.accumulation_len,
        );
        let bops = BengineOperations::new(xhosts.clone(), beams, geometry.clone());

        info!(
            instrument = %name,
            inputs = fengines.len(),
            fhosts = fhosts.len(),
            xhosts = xhosts.len(),
            xengines = geometry.num_xengines,
            beams = bops.beams().len(),
            "instrument model compiled"
        );

        Ok(Arc::new(Instrument {
            name,
            geometry,
            time,
            fhosts,
            xhosts,
            fops,
            xops,
            bops,
            streams,
            meta,
            sensors,
            initialised: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn time(&self) -> &Arc<TimeModel> {
        &self.time
    }

    pub fn streams(&self) -> &Arc<StreamRegistry> {
        &self.streams
    }

    pub fn sensors(&self) -> &Arc<SensorManager> {
        &self.sensors
    }

    pub fn initialised(&self) -> bool {
        self.initialised.load(Ordering::Acquire)
    }

    pub fn require_initialised(&self) -> Result<()> {
        if self.initialised() {
            Ok(())
        } else {
            Err(Error::NotInitialised)
        }
    }

    fn all_hosts(&self) -> Vec<Arc<Host>> {
        self.fhosts
            .iter()
            .chain(self.xhosts.iter())
            .cloned()
            .collect()
    }

    /// Program the boards (optionally), commit equalisers, shift
    /// schedules and routing, then sync the vector accumulators.
    pub async fn initialise(
        &self,
        program: bool,
        require_epoch: bool,
        monitor_vacc: bool,
    ) -> Result<()> {
        if self.initialised() {
            return Err(Error::AlreadyInitialised);
        }
        if require_epoch && self.time.epoch().is_none() {
            return Err(Error::config(
                "synchronisation_epoch",
                "the synchronisation epoch must be set before initialise",
            ));
        }

        let all = self.all_hosts();
        if program {
            info!("programming all hosts");
            fanout(&all, Duration::from_secs(60), |h| h.transport().program())
                .await
                .into_ok_map()?;
        }
        fanout(&all, Duration::from_secs(30), |h| h.refresh_capabilities())
            .await
            .into_ok_map()?;

        self.fops.initialise().await?;
        self.xops.initialise().await?;
        self.bops.initialise().await?;

        self.fops.subscribe_multicast().await?;
        self.xops.subscribe_to_multicast().await?;

        // the accumulators need data flowing before they can sync
        self.fops.tx_enable().await?;
        self.xops.vacc_sync(None).await?;

        if monitor_vacc {
            let interval = Duration::from_secs_f64(30.0_f64.max(self.xops.get_acc_time() + 1.0));
            self.xops.start_vacc_monitor(interval)?;
        }

        self.initialised.store(true, Ordering::Release);
        info!(instrument = %self.name, "initialised");
        Ok(())
    }

    // --- epoch ---

    pub fn set_synch_epoch(&self, epoch: f64) -> Result<()> {
        self.time.set_epoch(epoch)
    }

    pub fn synch_epoch(&self) -> Option<f64> {
        self.time.epoch()
    }

    // --- input labels ---

    pub fn input_labels(&self) -> Vec<String> {
        self.fops.input_labels()
    }

    /// Replace every input label. The new set must be unique and
    /// preserve the input count; nothing changes on a bad set.
    pub fn set_input_labels(&self, labels: &[String]) -> Result<Vec<String>> {
        let fengines = self.fops.fengines();
        if labels.len() != fengines.len() {
            return Err(Error::config(
                "input-labels",
                format!("expected {} labels, got {}", fengines.len(), labels.len()),
            ));
        }
        let unique: HashSet<&String> = labels.iter().collect();
        if unique.len() != labels.len() {
            return Err(Error::config("input-labels", "labels must be unique"));
        }

        let old: Vec<String> = fengines.iter().map(|f| f.label()).collect();
        for label in labels {
            if !old.contains(label) && self.streams.contains(label) {
                return Err(Error::config(
                    "input-labels",
                    format!("'{label}' is already the name of another stream"),
                ));
            }
        }

        // two-phase re-key so swapped labels never collide
        for (i, feng) in fengines.iter().enumerate() {
            if old[i] != labels[i] {
                self.streams.rename(&old[i], &format!("\u{0}relabel{i}"))?;
                feng.set_label(labels[i].clone());
            }
        }
        for (i, _) in fengines.iter().enumerate() {
            if old[i] != labels[i] {
                self.streams
                    .rename(&format!("\u{0}relabel{i}"), &labels[i])?;
            }
        }
        info!(?labels, "input labels updated");
        Ok(self.input_labels())
    }

    // --- stream surface ---

    /// Point a stream at a new destination, push it to the hardware and
    /// re-issue the stream's metadata.
    pub async fn stream_set_destination(&self, stream_name: &str, address: &str) -> Result<()> {
        let addr = StreamAddress::parse(address)?;
        let stream = self.streams.get(stream_name)?;

        // a bare ip:port keeps the stream's engine-spread range
        let current_range = stream.destination().range();
        let addr = if addr.range() == 1 && current_range > 1 {
            addr.with_range(current_range)?
        } else {
            addr
        };

        match stream.category() {
            StreamCategory::DigitiserAdcSamples => {
                return Err(Error::config(
                    "capture-destination",
                    "digitiser stream destinations are fixed upstream of the instrument",
                ));
            }
            StreamCategory::FengineChannelised => {
                stream.set_destination(addr);
                self.fops.write_stream_destination().await?;
            }
            StreamCategory::XengineCrossProducts => {
                stream.set_destination(addr);
                self.xops.write_stream_destination().await?;
            }
            StreamCategory::BeamformerFrequencyDomain | StreamCategory::BeamformerTimeDomain => {
                stream.set_destination(addr);
                let beam = self.bops.get_beam(stream_name)?;
                self.bops.write_beam_destination(&beam).await?;
            }
        }
        self.issue_metadata(Some(stream_name)).await?;
        Ok(())
    }

    pub async fn stream_tx_enable(&self, stream_name: &str) -> Result<()> {
        let stream = self.streams.get(stream_name)?;
        self.issue_metadata(Some(stream_name)).await?;
        match stream.category() {
            StreamCategory::DigitiserAdcSamples => Err(Error::Unsupported(format!(
                "stream {stream_name} is not transmitted by this instrument"
            ))),
            StreamCategory::FengineChannelised => self.fops.tx_enable().await,
            StreamCategory::XengineCrossProducts => self.xops.tx_enable().await,
            StreamCategory::BeamformerFrequencyDomain | StreamCategory::BeamformerTimeDomain => {
                self.bops.tx_enable(stream_name).await
            }
        }
    }

    pub async fn stream_tx_disable(&self, stream_name: &str) -> Result<()> {
        let stream = self.streams.get(stream_name)?;
        match stream.category() {
            StreamCategory::DigitiserAdcSamples => Err(Error::Unsupported(format!(
                "stream {stream_name} is not transmitted by this instrument"
            ))),
            StreamCategory::FengineChannelised => {
                // refused: everything downstream depends on it
                self.fops.tx_disable();
                Ok(())
            }
            StreamCategory::XengineCrossProducts => self.xops.tx_disable().await,
            StreamCategory::BeamformerFrequencyDomain | StreamCategory::BeamformerTimeDomain => {
                self.bops.tx_disable(stream_name).await
            }
        }
    }

    pub fn stream_tx_status(&self, stream_name: &str) -> Result<bool> {
        Ok(self.streams.get(stream_name)?.tx_enabled())
    }

    /// Emit metadata for one stream, or for all of them. Returns the
    /// number of heap datagrams sent.
    pub async fn issue_metadata(&self, stream_name: Option<&str>) -> Result<usize> {
        let targets = match stream_name {
            Some(name) => vec![self.streams.get(name)?],
            None => self.streams.all(),
        };
        let mut sent = 0;
        for stream in targets {
            let heap = match stream.category() {
                StreamCategory::DigitiserAdcSamples => {
                    let mut heap = MetaHeap::new();
                    heap.push_f64(items::ADC_SAMPLE_RATE, self.geometry.sample_rate_hz);
                    heap.push_str(items::INPUT_LABELS, stream.name());
                    heap
                }
                StreamCategory::FengineChannelised => self.fops.build_metadata(),
                StreamCategory::XengineCrossProducts => self.xops.build_metadata(),
                StreamCategory::BeamformerFrequencyDomain
                | StreamCategory::BeamformerTimeDomain => {
                    let beam = self.bops.get_beam(&stream.name())?;
                    self.bops.build_metadata(&beam)
                }
            };
            let meta = self.meta.clone();
            let dest = stream.destination();
            let name = stream.name();
            match tokio::task::spawn_blocking(move || meta.transmit(&heap, &dest))
                .await
                .map_err(|e| Error::transport("meta-tx", e))?
            {
                Ok(n) => sent += n,
                // transient: the periodic cadence re-sends
                Err(e) => warn!(stream = %name, error = %e, "metadata send failed"),
            }
        }
        Ok(sent)
    }

    /// The instrument's fixed passband centre. Whatever centre frequency
    /// is requested, the digitised band is what it is.
    pub fn frequency_select(&self, stream_name: &str, _requested_hz: f64) -> Result<f64> {
        self.streams.get(stream_name)?;
        Ok(self.geometry.sample_rate_hz / 4.0)
    }

    // --- sensors ---

    /// Start the periodic health checks: one task per host plus a
    /// general synchronisation audit. Each task re-arms itself after a
    /// run completes, so late starts accumulate no backlog.
    pub fn start_sensors(self: &Arc<Self>) {
        for host in &self.fhosts {
            tokio::spawn(run_fhost_checks(self.clone(), host.clone()));
        }
        for host in &self.xhosts {
            tokio::spawn(run_xhost_checks(self.clone(), host.clone()));
        }
        tokio::spawn(run_sync_audit(self.clone()));
        info!("sensor checks started");
    }

    pub fn stop_sensors(&self) {
        self.sensors.shutdown();
    }
}

struct FhostSample {
    okay: bool,
    spead_cnt: u64,
    spead_err: u64,
    reorder_timeout: u64,
    rx_cnt: u64,
    tx_cnt: u64,
    tx_err: u64,
    rx_bad: u64,
}

async fn run_fhost_checks(instr: Arc<Instrument>, host: Arc<Host>) {
    let m = instr.sensors.clone();
    let scope = host.name().to_string();
    let fscope = format!("{scope}.feng");
    let sensors = [
        m.register(format!("{fscope}.lru"), SensorKind::Boolean, "host reachable and healthy"),
        m.register(format!("{fscope}.spead.cnt"), SensorKind::Integer, "spead packets received"),
        m.register(format!("{fscope}.spead.err_cnt"), SensorKind::Integer, "spead errors"),
        m.register(format!("{fscope}.reorder.timeout_err_cnt"), SensorKind::Integer, "reorder timeouts"),
        m.register(format!("{fscope}.network.rx_cnt"), SensorKind::Integer, "raw rx packets"),
        m.register(format!("{fscope}.network.tx_cnt"), SensorKind::Integer, "raw tx packets"),
        m.register(format!("{fscope}.network.tx_err_cnt"), SensorKind::Integer, "tx errors"),
        m.register(format!("{fscope}.network.rx_bad_cnt"), SensorKind::Integer, "bad rx packets"),
    ];

    loop {
        let h = host.clone();
        let sample = m
            .submit_host(&scope, move || -> Result<FhostSample> {
                Ok(FhostSample {
                    okay: h.transport().host_okay(),
                    spead_cnt: h.read_field("spead_status", "cnt")?,
                    spead_err: h.read_field("spead_status", "err_cnt")?,
                    reorder_timeout: h.read_field("reorder_status", "timeout_err_cnt")?,
                    rx_cnt: h.read_field("gbe0_rxctr", "reg")?,
                    tx_cnt: h.read_field("gbe0_txctr", "reg")?,
                    tx_err: h.read_field("gbe0_txerrctr", "reg")?,
                    rx_bad: h.read_field("gbe0_rxbadctr", "reg")?,
                })
            })
            .await;

        match sample {
            Ok(s) => {
                sensors[0].set(
                    SensorValue::Bool(s.okay),
                    if s.okay {
                        SensorStatus::Nominal
                    } else {
                        SensorStatus::Error
                    },
                );
                sensors[1].set_with_rules(
                    SensorValue::Int(s.spead_cnt as i64),
                    None,
                    Some(ChangeRule::NotChanged),
                );
                sensors[2].set_with_rules(
                    SensorValue::Int(s.spead_err as i64),
                    Some(ChangeRule::Changed),
                    None,
                );
                sensors[3].set_with_rules(
                    SensorValue::Int(s.reorder_timeout as i64),
                    Some(ChangeRule::Changed),
                    None,
                );
                sensors[4].set_with_rules(
                    SensorValue::Int(s.rx_cnt as i64),
                    None,
                    Some(ChangeRule::NotChanged),
                );
                sensors[5].set_with_rules(
                    SensorValue::Int(s.tx_cnt as i64),
                    None,
                    Some(ChangeRule::NotChanged),
                );
                sensors[6].set_with_rules(
                    SensorValue::Int(s.tx_err as i64),
                    Some(ChangeRule::Changed),
                    None,
                );
                sensors[7].set_with_rules(
                    SensorValue::Int(s.rx_bad as i64),
                    Some(ChangeRule::Changed),
                    None,
                );
            }
            Err(e) => {
                warn!(host = %scope, error = %e, "F-host sensor read failed");
                for sensor in &sensors {
                    sensor.set_failure();
                }
            }
        }
        m.update_device_status(&fscope);
        m.update_device_status(&scope);

        tokio::select! {
            _ = tokio::time::sleep(m.cadence()) => {}
            _ = m.wait_shutdown() => break,
        }
    }
}

async fn run_xhost_checks(instr: Arc<Instrument>, host: Arc<Host>) {
    let m = instr.sensors.clone();
    let scope = host.name().to_string();
    let xscope = format!("{scope}.xeng");
    let vscope = format!("{xscope}.vacc");
    let x_per_fpga = instr.geometry.x_per_fpga;

    let lru = m.register(format!("{xscope}.lru"), SensorKind::Boolean, "host reachable and healthy");
    let mut vacc_err = Vec::new();
    let mut vacc_cnt = Vec::new();
    for i in 0..x_per_fpga {
        vacc_err.push(m.register(
            format!("{vscope}.errors{i}"),
            SensorKind::Integer,
            "vacc error count",
        ));
        vacc_cnt.push(m.register(
            format!("{vscope}.count{i}"),
            SensorKind::Integer,
            "vacc accumulation count",
        ));
    }

    loop {
        let h = host.clone();
        let sample = m
            .submit_host(&scope, move || -> Result<(bool, Vec<(u64, u64)>)> {
                let okay = h.transport().host_okay();
                let mut engines = Vec::with_capacity(x_per_fpga);
                for i in 0..x_per_fpga {
                    let regs = h.read(&format!("vacc_status{i}"))?;
                    let errors = regs.get("errors").copied().unwrap_or(0);
                    let count = regs.get("count").copied().unwrap_or(0);
                    engines.push((errors, count));
                }
                Ok((okay, engines))
            })
            .await;

        match sample {
            Ok((okay, engines)) => {
                lru.set(
                    SensorValue::Bool(okay),
                    if okay {
                        SensorStatus::Nominal
                    } else {
                        SensorStatus::Error
                    },
                );
                for (i, (errors, count)) in engines.iter().enumerate() {
                    vacc_err[i].set(
                        SensorValue::Int(*errors as i64),
                        if *errors > 0 {
                            SensorStatus::Error
                        } else {
                            SensorStatus::Nominal
                        },
                    );
                    vacc_cnt[i].set_with_rules(
                        SensorValue::Int(*count as i64),
                        None,
                        Some(ChangeRule::NotChanged),
                    );
                }
            }
            Err(e) => {
                warn!(host = %scope, error = %e, "X-host sensor read failed");
                lru.set_failure();
                for sensor in vacc_err.iter().chain(&vacc_cnt) {
                    sensor.set_failure();
                }
            }
        }
        m.update_device_status(&vscope);
        m.update_device_status(&xscope);
        m.update_device_status(&scope);

        tokio::select! {
            _ = tokio::time::sleep(m.cadence()) => {}
            _ = m.wait_shutdown() => break,
        }
    }
}

async fn run_sync_audit(instr: Arc<Instrument>) {
    let m = instr.sensors.clone();
    let sensor = m.register(
        "feng.synchronised",
        SensorKind::Boolean,
        "F-engine timestamps agree with the time model",
    );
    loop {
        match instr.fops.get_rx_timestamps().await {
            Ok((okay, _, _)) => sensor.set(
                SensorValue::Bool(okay),
                if okay {
                    SensorStatus::Nominal
                } else {
                    SensorStatus::Error
                },
            ),
            Err(e) => {
                warn!(error = %e, "rx timestamp audit failed");
                sensor.set_failure();
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(m.cadence()) => {}
            _ = m.wait_shutdown() => break,
        }
    }
}
