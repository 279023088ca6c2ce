// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fxcorr contributors

//! Wire-level tests: a control server over the simulator transport,
//! driven through a real TCP connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;

use fxcorr::time::unix_now;
use fxcorr::transport::sim::SimFactory;
use fxcorr::transport::TransportFactory;
use fxcorr_server::{ControlServer, ServerState};

const CONFIG: &str = r#"
[fengine]
n_chans = 16
sample_rate_hz = 1712000000.0
f_per_fpga = 2
default_eq_poly = [300.0]
destination_mcast_ips = "239.2.0.64:7148"
input_0_name = "ant0x"
input_0_destination = "239.0.0.10+1:7148"
input_1_name = "ant0y"
input_1_destination = "239.0.0.12+1:7148"
input_2_name = "ant1x"
input_2_destination = "239.0.0.14+1:7148"
input_3_name = "ant1y"
input_3_destination = "239.0.0.16+1:7148"

[xengine]
x_per_fpga = 2
xeng_accumulation_len = 256
accumulation_len = 816
output_products = ["baseline-correlation-products"]
output_destination_ip = "127.0.0.9"
output_destination_port = 7148

[beam0]
stream_index = 0
center_freq = 428000000.0
bandwidth = 856000000.0
beng_outbits = 8
quant_gain = 0.5
output_products = ["tied-array-channelised-voltage-0x"]
output_destination_ip = "127.0.0.11"
output_destination_port = 7148
weight_ant0x = 1.0
weight_ant1x = 1.0

[hosts]
fhosts = ["fhost00", "fhost01"]
xhosts = ["xhost00", "xhost01"]
transport = "sim"

[timing]
min_load_lead = 0.3

[metadata]
cadence_secs = 0
"#;

struct TestServer {
    _dir: tempfile::TempDir,
    factory: Arc<SimFactory>,
    state: Arc<ServerState>,
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestServer {
    async fn start() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_path = dir.path().join("instrument.toml");
        std::fs::write(&config_path, CONFIG).expect("write config");

        let factory = SimFactory::new();
        let state = ServerState::new(
            Some(config_path),
            Some(factory.clone() as std::sync::Arc<dyn TransportFactory>),
        );
        let server = ControlServer::bind("127.0.0.1:0", state.clone())
            .await
            .expect("bind");
        let addr = server.local_addr().expect("addr");
        tokio::spawn(server.run());

        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, writer) = stream.into_split();
        TestServer {
            _dir: dir,
            factory,
            state,
            reader: BufReader::new(read_half),
            writer,
        }
    }

    /// Send one request; return (informs, reply fields after `!verb`).
    async fn request(&mut self, line: &str) -> (Vec<String>, Vec<String>) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("send");
        let mut informs = Vec::new();
        loop {
            let mut reply = String::new();
            let n = tokio::time::timeout(
                Duration::from_secs(30),
                self.reader.read_line(&mut reply),
            )
            .await
            .expect("reply timeout")
            .expect("read");
            assert!(n > 0, "connection closed waiting for a reply to {line}");
            let reply = reply.trim_end().to_string();
            if reply.starts_with('#') {
                informs.push(reply);
                continue;
            }
            assert!(reply.starts_with('!'), "unexpected line {reply}");
            let fields: Vec<String> = reply
                .split_ascii_whitespace()
                .skip(1)
                .map(|s| s.to_string())
                .collect();
            return (informs, fields);
        }
    }

    async fn create(&mut self) {
        let (_, reply) = self.request("?create").await;
        assert_eq!(reply[0], "ok", "create failed: {reply:?}");
    }

    async fn set_epoch(&mut self) {
        let line = format!("?digitiser-synch-epoch {}", unix_now() - 10.0);
        let (_, reply) = self.request(&line).await;
        assert_eq!(reply[0], "ok");
    }

    async fn initialise(&mut self) {
        self.create().await;
        self.set_epoch().await;
        let (_, reply) = self.request("?initialise 1 1 1 0").await;
        assert_eq!(reply[0], "ok", "initialise failed: {reply:?}");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ping_and_unknown_verb() {
    let mut ts = TestServer::start().await;
    let (_, reply) = ts.request("?ping").await;
    assert_eq!(reply, vec!["ok"]);
    let (_, reply) = ts.request("?no-such-verb 1 2").await;
    assert_eq!(reply[0], "fail");
    assert_eq!(reply[1], "unknown_verb");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_create_is_one_shot() {
    let mut ts = TestServer::start().await;
    // verbs before create are refused
    let (_, reply) = ts.request("?input-labels").await;
    assert_eq!(reply[0], "fail");
    assert_eq!(reply[1], "not_initialised");

    ts.create().await;
    let (_, reply) = ts.request("?create").await;
    assert_eq!(reply[0], "fail");
    assert_eq!(reply[1], "already_created");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_input_labels_round_trip_and_rejection() {
    let mut ts = TestServer::start().await;
    ts.create().await;

    let (_, reply) = ts.request("?input-labels").await;
    assert_eq!(reply, vec!["ok", "ant0x", "ant0y", "ant1x", "ant1y"]);

    let (_, reply) = ts.request("?input-labels a b c d").await;
    assert_eq!(reply, vec!["ok", "a", "b", "c", "d"]);

    let (_, reply) = ts.request("?input-labels a a b c").await;
    assert_eq!(reply[0], "fail");
    assert_eq!(reply[1], "config_error");

    // labels unchanged by the rejected set
    let (_, reply) = ts.request("?input-labels").await;
    assert_eq!(reply, vec!["ok", "a", "b", "c", "d"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_gain_revert_on_transport_failure() {
    let mut ts = TestServer::start().await;
    ts.create().await;

    let (_, reply) = ts.request("?gain ant0x").await;
    assert_eq!(reply, vec!["ok", "300"]);

    // the write to ant0x's equaliser bram fails on the board
    let sim = ts.factory.transport("fhost00").expect("sim");
    sim.fail_writes_to("eq0");
    let (_, reply) = ts.request("?gain ant0x 100").await;
    assert_eq!(reply[0], "fail");
    assert_eq!(reply[1], "board_transport");

    // the prior value is still in force
    let (_, reply) = ts.request("?gain ant0x").await;
    assert_eq!(reply, vec!["ok", "300"]);

    sim.clear_write_failures();
    let (_, reply) = ts.request("?gain ant0x 100").await;
    assert_eq!(reply, vec!["ok", "100"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_gain_all_and_unknown_input() {
    let mut ts = TestServer::start().await;
    ts.create().await;

    let (_, reply) = ts.request("?gain-all 150").await;
    assert_eq!(reply, vec!["ok", "150"]);

    let (_, reply) = ts.request("?gain nosuchinput").await;
    assert_eq!(reply[0], "fail");
    assert_eq!(reply[1], "input_unknown");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delays_partial_commit_names_dead_host() {
    let mut ts = TestServer::start().await;
    ts.create().await;
    ts.set_epoch().await;

    ts.factory
        .transport("fhost01")
        .expect("sim")
        .set_offline(true);

    let t_load = unix_now() + 1.0;
    let line = format!("?delays {t_load} 0,0:0,0 0,0:0,0 0,0:0,0 0,0:0,0");
    let (_, reply) = ts.request(&line).await;
    assert_eq!(reply[0], "fail");
    assert_eq!(reply[1], "delay_partial_commit");
    assert!(
        reply[2].contains("fhost01"),
        "expected the dead host in {reply:?}"
    );

    // the healthy host took its registers
    let sim = ts.factory.transport("fhost00").expect("sim");
    assert!(sim.register_value("delay0_load", "lsw").expect("reg") > 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delays_load_too_soon() {
    let mut ts = TestServer::start().await;
    ts.create().await;
    ts.set_epoch().await;

    let t_load = unix_now() + 0.05;
    let line = format!("?delays {t_load} 0,0:0,0 0,0:0,0 0,0:0,0 0,0:0,0");
    let (_, reply) = ts.request(&line).await;
    assert_eq!(reply[0], "fail");
    assert_eq!(reply[1], "load_too_soon");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_delay_readback_quantisation() {
    let mut ts = TestServer::start().await;
    ts.create().await;
    ts.set_epoch().await;

    let t_load = unix_now() + 1.0;
    let (_, reply) = ts.request(&format!("?delay ant1x {t_load} 2.5e-9,0:0.1,0")).await;
    assert_eq!(reply[0], "ok");
    // readback delay is quantised at or below the request, within one sample
    let icd = &reply[1];
    let delay_s: f64 = icd.split(',').next().expect("field").parse().expect("num");
    let requested_samples = 2.5e-9 * 1_712_000_000.0;
    let applied_samples = delay_s * 1_712_000_000.0;
    assert!(applied_samples <= requested_samples + 1e-9);
    assert!(requested_samples - applied_samples < 1.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_capture_surface_and_metadata() {
    let mut ts = TestServer::start().await;
    ts.create().await;

    // destination round-trip
    let (_, reply) = ts
        .request("?capture-destination baseline-correlation-products 127.0.0.3:7148")
        .await;
    assert_eq!(
        reply,
        vec!["ok", "baseline-correlation-products", "127.0.0.3:7148"]
    );
    let (_, reply) = ts
        .request("?capture-destination baseline-correlation-products")
        .await;
    assert_eq!(reply[2], "127.0.0.3:7148");

    // one heap per destination IP in the group range
    let (_, reply) = ts.request("?capture-meta baseline-correlation-products").await;
    assert_eq!(reply, vec!["ok", "baseline-correlation-products", "1"]);

    let (informs, reply) = ts.request("?capture-list").await;
    assert_eq!(reply[0], "ok");
    assert!(informs.iter().any(|l| l.contains("antenna-channelised-voltage")));
    assert!(informs.iter().any(|l| l.contains("tied-array-channelised-voltage-0x")));

    let (_, reply) = ts.request("?capture-status baseline-correlation-products").await;
    assert_eq!(reply, vec!["ok", "baseline-correlation-products", "0"]);
    let (_, reply) = ts.request("?capture-start baseline-correlation-products").await;
    assert_eq!(reply[0], "ok");
    let (_, reply) = ts.request("?capture-status baseline-correlation-products").await;
    assert_eq!(reply[2], "1");
    let (_, reply) = ts.request("?capture-stop baseline-correlation-products").await;
    assert_eq!(reply[0], "ok");

    let (_, reply) = ts.request("?capture-destination no-such-stream 127.0.0.1:7000").await;
    assert_eq!(reply[1], "stream_unknown");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_initialise_and_vacc_lifecycle() {
    let mut ts = TestServer::start().await;
    ts.initialise().await;

    // a second initialise is refused
    let (_, reply) = ts.request("?initialise").await;
    assert_eq!(reply[0], "fail");
    assert_eq!(reply[1], "already_initialised");

    // both X-hosts loaded once during initialise; a forced resync loads again
    let (_, reply) = ts.request("?vacc-sync").await;
    assert_eq!(reply[0], "ok", "vacc-sync failed: {reply:?}");
    for host in ["xhost00", "xhost01"] {
        let sim = ts.factory.transport(host).expect("sim");
        let lsw = sim.register_value("vacc_time_lsw", "lsw").expect("lsw");
        assert!(lsw > 0);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_accumulation_length_round_trip() {
    let mut ts = TestServer::start().await;
    ts.initialise().await;

    let (_, reply) = ts.request("?accumulation-length 0.01").await;
    assert_eq!(reply[0], "ok", "accumulation-length failed: {reply:?}");
    let acc_time: f64 = reply[1].parse().expect("number");
    // within one accumulator step of the request
    let step = (256.0 * 16.0 * 2.0) / 1_712_000_000.0;
    assert!((acc_time - 0.01).abs() <= step);

    let (_, reply) = ts.request("?accumulation-length").await;
    let read_back: f64 = reply[1].parse().expect("number");
    assert!((read_back - acc_time).abs() < 1e-12);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_vacc_sync_rejects_short_lead() {
    let mut ts = TestServer::start().await;
    ts.create().await;
    ts.set_epoch().await;
    let t_load = unix_now() + 0.05;
    let (_, reply) = ts.request(&format!("?vacc-sync {t_load}")).await;
    assert_eq!(reply[0], "fail");
    assert_eq!(reply[1], "load_too_soon");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fft_shift_and_frequency_select() {
    let mut ts = TestServer::start().await;
    ts.create().await;

    let (_, reply) = ts.request("?fft-shift 1023").await;
    assert_eq!(reply, vec!["ok", "1023"]);
    let (_, reply) = ts.request("?fft-shift").await;
    assert_eq!(reply, vec!["ok", "1023"]);

    let (_, reply) = ts
        .request("?frequency-select baseline-correlation-products 856000000")
        .await;
    assert_eq!(reply[0], "ok");
    let selected: f64 = reply[1].parse().expect("number");
    assert!((selected - 428_000_000.0).abs() < 1.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_beam_surface() {
    let mut ts = TestServer::start().await;
    ts.create().await;

    let (_, reply) = ts
        .request("?beam-weights tied-array-channelised-voltage-0x ant0x 0.25")
        .await;
    assert_eq!(reply[0], "ok", "beam-weights failed: {reply:?}");
    let weight: f64 = reply[1].parse().expect("number");
    assert!((weight - 0.25).abs() < 1e-4);

    let (_, reply) = ts
        .request("?beam-quant-gains tied-array-channelised-voltage-0x 0.75")
        .await;
    assert_eq!(reply[0], "ok");
    let gain: f64 = reply[1].parse().expect("number");
    assert!((gain - 0.75).abs() < 1e-4);

    let (_, reply) = ts
        .request("?beam-passband tied-array-channelised-voltage-0x 428000000 214000000")
        .await;
    assert_eq!(reply[0], "ok");
    let bw: f64 = reply[2].parse().expect("number");
    assert!(bw > 0.0);

    let (_, reply) = ts.request("?beam-weights no-such-beam ant0x 1").await;
    assert_eq!(reply[1], "stream_unknown");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_snapshots() {
    let mut ts = TestServer::start().await;
    ts.create().await;
    ts.set_epoch().await;

    let (informs, reply) = ts.request("?quantiser-snapshot ant0y").await;
    assert_eq!(reply[0], "ok");
    assert_eq!(informs.len(), 1);
    assert!(informs[0].starts_with("#ant0y"));

    let (informs, reply) = ts.request("?adc-snapshot ant0y").await;
    assert_eq!(reply[0], "ok");
    assert_eq!(informs.len(), 1);

    let (informs, reply) = ts.request("?transient-buffer-trigger").await;
    assert_eq!(reply[0], "ok");
    assert_eq!(informs.len(), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sensor_rollup_flags_bad_vacc() {
    let mut ts = TestServer::start().await;
    ts.create().await;
    ts.set_epoch().await;

    // shorten the polling cadence before initialise spawns the checks
    let instr = ts.state.instrument().expect("instrument");
    instr.sensors().set_cadence(Duration::from_millis(100));

    let (_, reply) = ts.request("?initialise 1 1 1 0").await;
    assert_eq!(reply[0], "ok", "initialise failed: {reply:?}");

    ts.factory
        .transport("xhost01")
        .expect("sim")
        .set_vacc_errors(3);

    // within one polling cycle the rollups go red
    tokio::time::sleep(Duration::from_millis(600)).await;
    let sensors = instr.sensors();
    let vacc = sensors
        .get("xhost01.xeng.vacc.device-status")
        .expect("vacc rollup");
    assert_eq!(
        vacc.snapshot().status,
        fxcorr::sensors::SensorStatus::Error
    );
    let host = sensors.get("xhost01.device-status").expect("host rollup");
    assert_eq!(
        host.snapshot().status,
        fxcorr::sensors::SensorStatus::Error
    );
    let healthy = sensors.get("xhost00.device-status").expect("host rollup");
    assert_eq!(
        healthy.snapshot().status,
        fxcorr::sensors::SensorStatus::Nominal
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_epoch_monotone_over_the_wire() {
    let mut ts = TestServer::start().await;
    ts.create().await;

    let (_, reply) = ts.request("?digitiser-synch-epoch 5000").await;
    assert_eq!(reply, vec!["ok", "5000"]);
    // idempotent re-set
    let (_, reply) = ts.request("?digitiser-synch-epoch 5000").await;
    assert_eq!(reply, vec!["ok", "5000"]);
    // backwards is refused
    let (_, reply) = ts.request("?digitiser-synch-epoch 4000").await;
    assert_eq!(reply[0], "fail");
    assert_eq!(reply[1], "config_error");
    // read-back
    let (_, reply) = ts.request("?digitiser-synch-epoch").await;
    assert_eq!(reply, vec!["ok", "5000"]);
}
