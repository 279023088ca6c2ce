// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fxcorr contributors

//! Verb handlers.
//!
//! Each request verb maps onto one instrument operation. Domain errors
//! collapse to their wire kind in a `fail` reply; malformed requests get
//! an `invalid` reply without touching the instrument.

use std::sync::Arc;

use fxcorr::delay::DelayModel;
use fxcorr::eq::Eq;
use fxcorr::error::Error;
use fxcorr::instrument::Instrument;

use crate::protocol::{render_inform, Reply};
use crate::server::ServerState;

type VerbResult = Result<Reply, Reply>;

pub async fn dispatch(
    state: &Arc<ServerState>,
    verb: &str,
    args: &[String],
    informs: &mut Vec<String>,
) -> Reply {
    // ping answers even while a long verb is in flight
    if verb == "ping" {
        return Reply::ok();
    }
    let _serialised = state.dispatch_lock().lock().await;
    let result = match verb {
        "create" => create(state, args).await,
        "initialise" => initialise(state, args).await,
        "digitiser-synch-epoch" => synch_epoch(state, args),
        "capture-destination" => capture_destination(state, args).await,
        "capture-list" => capture_list(state, args, informs),
        "capture-start" => capture_start(state, args).await,
        "capture-stop" => capture_stop(state, args).await,
        "capture-status" => capture_status(state, args),
        "capture-meta" => capture_meta(state, args).await,
        "input-labels" => input_labels(state, args),
        "gain" => gain(state, args).await,
        "gain-all" => gain_all(state, args).await,
        "delay" => delay(state, args).await,
        "delays" => delays(state, args).await,
        "accumulation-length" => accumulation_length(state, args).await,
        "vacc-sync" => vacc_sync(state, args).await,
        "fft-shift" => fft_shift(state, args).await,
        "frequency-select" => frequency_select(state, args),
        "quantiser-snapshot" => quantiser_snapshot(state, args, informs).await,
        "adc-snapshot" => adc_snapshot(state, args, informs).await,
        "transient-buffer-trigger" => transient_buffer(state, informs).await,
        "beam-weights" => beam_weights(state, args).await,
        "beam-quant-gains" => beam_quant_gains(state, args).await,
        "beam-passband" => beam_passband(state, args).await,
        "metadata-cadence" => metadata_cadence(state, args),
        _ => Err(Reply::fail("unknown_verb", format!("unknown verb '{verb}'"))),
    };
    match result {
        Ok(reply) | Err(reply) => reply,
    }
}

// --- argument helpers ---

fn need<'a>(args: &'a [String], idx: usize, name: &str) -> Result<&'a str, Reply> {
    args.get(idx)
        .map(|s| s.as_str())
        .ok_or_else(|| Reply::Invalid(format!("missing argument '{name}'")))
}

fn need_f64(args: &[String], idx: usize, name: &str) -> Result<f64, Reply> {
    need(args, idx, name)?
        .parse()
        .map_err(|_| Reply::Invalid(format!("argument '{name}' is not a number")))
}

fn opt_f64(args: &[String], idx: usize, name: &str) -> Result<Option<f64>, Reply> {
    match args.get(idx) {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|_| Reply::Invalid(format!("argument '{name}' is not a number"))),
    }
}

fn opt_bool(args: &[String], idx: usize, default: bool) -> Result<bool, Reply> {
    match args.get(idx).map(|s| s.as_str()) {
        None => Ok(default),
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("no") => Ok(false),
        Some(other) => Err(Reply::Invalid(format!("'{other}' is not a boolean"))),
    }
}

fn instrument(state: &ServerState) -> Result<Arc<Instrument>, Reply> {
    state
        .instrument()
        .ok_or_else(|| Reply::from(Error::NotInitialised))
}

fn eq_tokens(eq: &Eq) -> Vec<String> {
    match eq {
        Eq::Scalar(g) => vec![g.to_string()],
        Eq::Vector(v) => v.iter().map(|g| g.to_string()).collect(),
        Eq::Polynomial(c) => c.iter().map(|v| v.to_string()).collect(),
    }
}

// --- lifecycle ---

async fn create(state: &Arc<ServerState>, args: &[String]) -> VerbResult {
    if state.created() {
        return Err(Reply::from(Error::AlreadyCreated));
    }
    let config = state.load_config(args.first().map(|s| s.as_str()))?;
    let name = args
        .get(1)
        .cloned()
        .unwrap_or_else(|| "fxcorr".to_string());
    let factory = state.factory_for(&config)?;
    let instr = Instrument::create(name, &config, factory.as_ref()).map_err(Reply::from)?;
    state.set_instrument(instr, config.metadata.cadence_secs);
    Ok(Reply::ok())
}

async fn initialise(state: &Arc<ServerState>, args: &[String]) -> VerbResult {
    let instr = instrument(state)?;
    let program = opt_bool(args, 0, true)?;
    // qdr calibration is the transport's business; accepted for
    // interface compatibility
    let _qdr_cal = opt_bool(args, 1, true)?;
    let require_epoch = opt_bool(args, 2, true)?;
    let monitor_vacc = opt_bool(args, 3, true)?;
    instr
        .initialise(program, require_epoch, monitor_vacc)
        .await
        .map_err(Reply::from)?;
    instr.start_sensors();
    state.start_metadata_task();
    Ok(Reply::ok())
}

fn synch_epoch(state: &Arc<ServerState>, args: &[String]) -> VerbResult {
    let instr = instrument(state)?;
    if let Some(epoch) = opt_f64(args, 0, "epoch")? {
        if epoch >= 0.0 {
            instr.set_synch_epoch(epoch).map_err(Reply::from)?;
        }
    }
    let current = instr.synch_epoch().unwrap_or(-1.0);
    Ok(Reply::ok_with(vec![format!("{current}")]))
}

// --- capture surface ---

async fn capture_destination(state: &Arc<ServerState>, args: &[String]) -> VerbResult {
    let instr = instrument(state)?;
    let stream = need(args, 0, "stream")?;
    if let Some(address) = args.get(1) {
        instr
            .stream_set_destination(stream, address)
            .await
            .map_err(Reply::from)?;
    }
    let current = instr.streams().get(stream).map_err(Reply::from)?;
    Ok(Reply::ok_with(vec![
        stream.to_string(),
        current.destination().to_string(),
    ]))
}

fn capture_list(
    state: &Arc<ServerState>,
    args: &[String],
    informs: &mut Vec<String>,
) -> VerbResult {
    let instr = instrument(state)?;
    let names = match args.first() {
        Some(name) => {
            instr.streams().get(name).map_err(Reply::from)?;
            vec![name.clone()]
        }
        None => instr.streams().names(),
    };
    for name in &names {
        let stream = instr.streams().get(name).map_err(Reply::from)?;
        informs.push(render_inform(
            name,
            &[stream.destination().to_string()],
        ));
    }
    Ok(Reply::ok_with(vec![names.len().to_string()]))
}

async fn capture_start(state: &Arc<ServerState>, args: &[String]) -> VerbResult {
    let instr = instrument(state)?;
    let stream = need(args, 0, "stream")?;
    instr.stream_tx_enable(stream).await.map_err(Reply::from)?;
    Ok(Reply::ok_with(vec![stream.to_string()]))
}

async fn capture_stop(state: &Arc<ServerState>, args: &[String]) -> VerbResult {
    let instr = instrument(state)?;
    let stream = need(args, 0, "stream")?;
    instr.stream_tx_disable(stream).await.map_err(Reply::from)?;
    Ok(Reply::ok_with(vec![stream.to_string()]))
}

fn capture_status(state: &Arc<ServerState>, args: &[String]) -> VerbResult {
    let instr = instrument(state)?;
    let stream = need(args, 0, "stream")?;
    let enabled = instr.stream_tx_status(stream).map_err(Reply::from)?;
    let flag = if enabled { "1" } else { "0" };
    Ok(Reply::ok_with(vec![stream.to_string(), flag.to_string()]))
}

async fn capture_meta(state: &Arc<ServerState>, args: &[String]) -> VerbResult {
    let instr = instrument(state)?;
    let stream = need(args, 0, "stream")?;
    let sent = instr
        .issue_metadata(Some(stream))
        .await
        .map_err(Reply::from)?;
    Ok(Reply::ok_with(vec![stream.to_string(), sent.to_string()]))
}

// --- inputs ---

fn input_labels(state: &Arc<ServerState>, args: &[String]) -> VerbResult {
    let instr = instrument(state)?;
    if args.is_empty() {
        return Ok(Reply::ok_with(instr.input_labels()));
    }
    let labels = instr.set_input_labels(args).map_err(Reply::from)?;
    Ok(Reply::ok_with(labels))
}

async fn gain(state: &Arc<ServerState>, args: &[String]) -> VerbResult {
    let instr = instrument(state)?;
    let input = need(args, 0, "input")?.to_string();
    if args.len() > 1 {
        let eq = Eq::from_args(&args[1..], instr.geometry().n_chans).map_err(Reply::from)?;
        instr.fops.eq_set(Some(&input), eq).await.map_err(Reply::from)?;
    }
    let eqs = instr.fops.eq_get(Some(&input)).map_err(Reply::from)?;
    let eq = eqs
        .get(&input)
        .ok_or_else(|| Reply::from(Error::InputUnknown(input.clone())))?;
    Ok(Reply::ok_with(eq_tokens(eq)))
}

async fn gain_all(state: &Arc<ServerState>, args: &[String]) -> VerbResult {
    let instr = instrument(state)?;
    if !args.is_empty() {
        let eq = Eq::from_args(args, instr.geometry().n_chans).map_err(Reply::from)?;
        instr.fops.eq_set(None, eq).await.map_err(Reply::from)?;
    }
    let eqs = instr.fops.eq_get(None).map_err(Reply::from)?;
    let first = eqs
        .values()
        .next()
        .ok_or_else(|| Reply::Invalid("instrument has no inputs".into()))?;
    Ok(Reply::ok_with(eq_tokens(first)))
}

// --- delays ---

async fn delay(state: &Arc<ServerState>, args: &[String]) -> VerbResult {
    let instr = instrument(state)?;
    let input = need(args, 0, "input")?.to_string();
    if args.len() == 1 {
        let feng = instr.fops.get_fengine(&input).map_err(Reply::from)?;
        return Ok(Reply::ok_with(vec![feng.delay().to_string()]));
    }
    let t_load = need_f64(args, 1, "loadtime")?;
    let coeffs = need(args, 2, "coefficients")?;
    let model = DelayModel::parse_icd(coeffs).map_err(Reply::from)?;
    let applied = instr
        .fops
        .delay_set(&input, Some(t_load), model)
        .await
        .map_err(Reply::from)?;
    Ok(Reply::ok_with(vec![applied.to_string()]))
}

async fn delays(state: &Arc<ServerState>, args: &[String]) -> VerbResult {
    let instr = instrument(state)?;
    let t_load = need_f64(args, 0, "loadtime")?;
    let models = DelayModel::parse_icd_list(&args[1..]).map_err(Reply::from)?;
    let applied = instr
        .fops
        .delay_set_all(t_load, models)
        .await
        .map_err(Reply::from)?;
    Ok(Reply::ok_with(
        applied.iter().map(|d| d.to_string()).collect(),
    ))
}

// --- accumulation ---

async fn accumulation_length(state: &Arc<ServerState>, args: &[String]) -> VerbResult {
    let instr = instrument(state)?;
    if let Some(acc_time) = opt_f64(args, 0, "seconds")? {
        if acc_time >= 0.0 {
            instr
                .xops
                .set_acc_time(acc_time, true)
                .await
                .map_err(Reply::from)?;
        }
    }
    Ok(Reply::ok_with(vec![format!("{}", instr.xops.get_acc_time())]))
}

async fn vacc_sync(state: &Arc<ServerState>, args: &[String]) -> VerbResult {
    let instr = instrument(state)?;
    let t_load = opt_f64(args, 0, "loadtime")?;
    let loaded_at = instr.xops.vacc_sync(t_load).await.map_err(Reply::from)?;
    Ok(Reply::ok_with(vec![format!("{loaded_at}")]))
}

async fn fft_shift(state: &Arc<ServerState>, args: &[String]) -> VerbResult {
    let instr = instrument(state)?;
    let current = match args.first() {
        Some(raw) => {
            let shift: i64 = raw
                .parse()
                .map_err(|_| Reply::Invalid("shift is not an integer".into()))?;
            if shift < 0 {
                instr.fops.get_fft_shift().await.map_err(Reply::from)?
            } else {
                instr
                    .fops
                    .set_fft_shift(Some(shift as u32))
                    .await
                    .map_err(Reply::from)?
            }
        }
        None => instr.fops.get_fft_shift().await.map_err(Reply::from)?,
    };
    Ok(Reply::ok_with(vec![current.to_string()]))
}

fn frequency_select(state: &Arc<ServerState>, args: &[String]) -> VerbResult {
    let instr = instrument(state)?;
    let stream = need(args, 0, "stream")?;
    let requested = need_f64(args, 1, "freq_hz")?;
    let selected = instr
        .frequency_select(stream, requested)
        .map_err(Reply::from)?;
    Ok(Reply::ok_with(vec![format!("{selected}")]))
}

// --- snapshots ---

async fn quantiser_snapshot(
    state: &Arc<ServerState>,
    args: &[String],
    informs: &mut Vec<String>,
) -> VerbResult {
    let instr = instrument(state)?;
    let input = need(args, 0, "input")?;
    let spectrum = instr
        .fops
        .quantiser_snapshot(input)
        .await
        .map_err(Reply::from)?;
    let values: Vec<String> = spectrum.iter().map(|g| g.to_string()).collect();
    informs.push(render_inform(input, &values));
    Ok(Reply::ok())
}

async fn adc_snapshot(
    state: &Arc<ServerState>,
    args: &[String],
    informs: &mut Vec<String>,
) -> VerbResult {
    let instr = instrument(state)?;
    let input = need(args, 0, "input")?.to_string();
    let capture_time = opt_f64(args, 1, "time")?.filter(|t| *t >= 0.0);
    let snaps = instr
        .fops
        .adc_snapshot(Some(&input), capture_time)
        .await
        .map_err(Reply::from)?;
    let snap = snaps
        .get(&input)
        .ok_or_else(|| Reply::from(Error::InputUnknown(input.clone())))?;
    let values: Vec<String> = snap.data.iter().map(|v| v.to_string()).collect();
    informs.push(render_inform(&input, &values));
    Ok(Reply::ok_with(vec![snap.timestamp_mcnt.to_string()]))
}

async fn transient_buffer(state: &Arc<ServerState>, informs: &mut Vec<String>) -> VerbResult {
    let instr = instrument(state)?;
    let snaps = instr
        .fops
        .adc_snapshot(None, None)
        .await
        .map_err(Reply::from)?;
    let mut timestamp = 0;
    for (input, snap) in &snaps {
        let values: Vec<String> = snap.data.iter().map(|v| v.to_string()).collect();
        informs.push(render_inform(input, &values));
        timestamp = snap.timestamp_mcnt;
    }
    Ok(Reply::ok_with(vec![timestamp.to_string()]))
}

// --- beams ---

async fn beam_weights(state: &Arc<ServerState>, args: &[String]) -> VerbResult {
    let instr = instrument(state)?;
    let beam = need(args, 0, "beam")?;
    let input = need(args, 1, "input")?;
    if let Some(weight) = opt_f64(args, 2, "weight")? {
        instr
            .bops
            .set_beam_weights(beam, input, weight)
            .await
            .map_err(Reply::from)?;
    }
    let current = instr
        .bops
        .get_beam_weights(beam, input)
        .await
        .map_err(Reply::from)?;
    Ok(Reply::ok_with(vec![format!("{current}")]))
}

async fn beam_quant_gains(state: &Arc<ServerState>, args: &[String]) -> VerbResult {
    let instr = instrument(state)?;
    let beam = need(args, 0, "beam")?;
    if let Some(gain) = opt_f64(args, 1, "gain")? {
        instr
            .bops
            .set_beam_quant_gains(beam, gain)
            .await
            .map_err(Reply::from)?;
    }
    let current = instr
        .bops
        .get_beam_quant_gains(beam)
        .await
        .map_err(Reply::from)?;
    Ok(Reply::ok_with(vec![format!("{current}")]))
}

async fn beam_passband(state: &Arc<ServerState>, args: &[String]) -> VerbResult {
    let instr = instrument(state)?;
    let beam = need(args, 0, "beam")?;
    let (bw, cf) = match (opt_f64(args, 1, "bandwidth")?, opt_f64(args, 2, "center_freq")?) {
        (Some(bw), Some(cf)) if bw > 0.0 && cf > 0.0 => instr
            .bops
            .set_beam_passband(beam, bw, cf)
            .await
            .map_err(Reply::from)?,
        _ => instr.bops.get_beam_passband(beam).map_err(Reply::from)?,
    };
    Ok(Reply::ok_with(vec![
        beam.to_string(),
        format!("{bw}"),
        format!("{cf}"),
    ]))
}

// --- metadata cadence ---

fn metadata_cadence(state: &Arc<ServerState>, args: &[String]) -> VerbResult {
    if let Some(raw) = args.first() {
        let secs: u64 = raw
            .parse()
            .map_err(|_| Reply::Invalid("cadence is not an integer".into()))?;
        state.set_meta_cadence(secs);
    }
    Ok(Reply::ok_with(vec![state.meta_cadence().to_string()]))
}
