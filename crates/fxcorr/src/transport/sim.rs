// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fxcorr contributors

//! An in-process board simulator.
//!
//! Stands in for real F/X hosts behind the [`BoardTransport`] trait: a
//! register file, bram store, VACC arm/load emulation driven by the time
//! model, free-running packet counters, and fault injection for tests.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    BoardTransport, HostGeometry, HostRole, RegisterFields, SystemInformation, TransportFactory,
};
use crate::error::{Error, Result};
use crate::time::{unix_now, TimeModel};

#[derive(Debug, Default, Clone)]
struct VaccState {
    arm_count: u64,
    load_count: u64,
    armed: bool,
    armed_mcnt: u64,
    loaded: bool,
    reads_since_load: u64,
}

#[derive(Default)]
struct SimState {
    programmed: bool,
    registers: HashMap<String, RegisterFields>,
    brams: HashMap<String, Vec<u32>>,
    vacc: Vec<VaccState>,
    write_failures: HashSet<String>,
    vacc_errors: u64,
    subscriptions: Vec<(String, Ipv4Addr)>,
    armed_snapshots: HashSet<String>,
}

/// One simulated board.
pub struct SimTransport {
    name: String,
    role: HostRole,
    geometry: HostGeometry,
    time: Arc<TimeModel>,
    offline: AtomicBool,
    state: Mutex<SimState>,
}

impl SimTransport {
    pub fn new_fhost(name: &str, geometry: &HostGeometry, time: Arc<TimeModel>) -> Arc<Self> {
        let t = SimTransport {
            name: name.to_string(),
            role: HostRole::Fengine,
            geometry: geometry.clone(),
            time,
            offline: AtomicBool::new(false),
            state: Mutex::new(SimState::default()),
        };
        t.seed();
        Arc::new(t)
    }

    pub fn new_xhost(name: &str, geometry: &HostGeometry, time: Arc<TimeModel>) -> Arc<Self> {
        let t = SimTransport {
            name: name.to_string(),
            role: HostRole::Xengine,
            geometry: geometry.clone(),
            time,
            offline: AtomicBool::new(false),
            state: Mutex::new(SimState::default()),
        };
        t.seed();
        Arc::new(t)
    }

    fn seed(&self) {
        let mut st = self.state.lock();
        let mut reg = |name: &str, fields: &[(&str, u64)]| {
            st.registers.insert(
                name.to_string(),
                fields.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            );
        };

        reg(
            "control",
            &[
                ("gbe_txen", 0),
                ("gbe_rst", 1),
                ("gbe_debug_rst", 0),
                ("status_clr", 0),
                ("sys_rst", 0),
                ("auto_rst_enable", 0),
            ],
        );
        reg("board_id", &[("reg", 0)]);
        reg("spead_status", &[("cnt", 0), ("err_cnt", 0)]);
        reg(
            "reorder_status",
            &[("timeout_err_cnt", 0), ("recv_err_cnt", 0), ("disc_err_cnt", 0)],
        );
        reg("gbe0_txctr", &[("reg", 0)]);
        reg("gbe0_rxctr", &[("reg", 0)]);
        reg("gbe0_txerrctr", &[("reg", 0)]);
        reg("gbe0_rxbadctr", &[("reg", 0)]);

        match self.role {
            HostRole::Fengine => {
                reg("iptx_base", &[("reg", 0)]);
                reg("tx_metadata", &[("board_id", 0), ("porttx", 0)]);
                reg("fft_shift", &[("shift", 0)]);
                reg(
                    "x_setup",
                    &[("f_per_x", 0), ("ip_per_x", 0), ("num_x", 0)],
                );
                for i in 0..6 {
                    reg(&format!("ct_control{i}"), &[("reg", 0)]);
                }
                for i in 0..self.geometry.engines_per_host {
                    reg(
                        &format!("delay{i}"),
                        &[("whole", 0), ("frac", 0)],
                    );
                    reg(&format!("delay_rate{i}"), &[("rate", 0)]);
                    reg(&format!("phase{i}"), &[("offset", 0), ("rate", 0)]);
                    reg(
                        &format!("delay{i}_load"),
                        &[("lsw", 0), ("msw", 0)],
                    );
                    reg(&format!("tl_cd{i}_status"), &[("load_count", 0)]);
                    reg(&format!("eq{i}_ctrl"), &[("update", 0)]);
                }
            }
            HostRole::Xengine => {
                reg("gbe_iptx", &[("reg", 0)]);
                reg("gbe_porttx", &[("reg", 0)]);
                reg("acc_len", &[("reg", 0)]);
                reg("vacc_time_lsw", &[("lsw", 0)]);
                reg("vacc_time_msw", &[("msw", 0)]);
                reg("vacc_ctrl", &[("arm", 0), ("rst", 0)]);
                for i in 0..self.geometry.engines_per_host {
                    reg(
                        &format!("vacc_status{i}"),
                        &[("armcount", 0), ("loadcount", 0), ("errors", 0), ("count", 0)],
                    );
                    reg(&format!("reorderr_timeout{i}"), &[("reg", 0)]);
                }
                for b in 0..self.geometry.n_beams {
                    reg(&format!("bf{b}_config"), &[("txen", 0)]);
                    reg(&format!("bf{b}_ip"), &[("reg", 0)]);
                    reg(&format!("bf{b}_port"), &[("reg", 0)]);
                    reg(&format!("bf{b}_gain"), &[("gain", 0)]);
                    reg(&format!("bf{b}_passband"), &[("start_chan", 0), ("n_chans", 0)]);
                }
                st.vacc = vec![VaccState::default(); self.geometry.engines_per_host];
            }
        }
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::Acquire) {
            Err(Error::transport(&self.name, "host unreachable"))
        } else {
            Ok(())
        }
    }

    /// Advance VACC state machines: an armed accumulator fires once its
    /// load mcnt passes.
    fn step_vacc(&self, st: &mut SimState) {
        let now = unix_now();
        let lsw = st
            .registers
            .get("vacc_time_lsw")
            .and_then(|r| r.get("lsw").copied())
            .unwrap_or(0);
        let msw = st
            .registers
            .get("vacc_time_msw")
            .and_then(|r| r.get("msw").copied())
            .unwrap_or(0);
        let load_mcnt = (msw << 32) | lsw;
        for v in st.vacc.iter_mut() {
            if v.armed {
                v.armed_mcnt = load_mcnt;
                if let Ok(t) = self.time.time_from_mcnt(v.armed_mcnt) {
                    if now >= t {
                        v.load_count += 1;
                        v.armed = false;
                        v.loaded = true;
                        v.reads_since_load = 0;
                    }
                }
            }
            if v.loaded {
                v.reads_since_load += 1;
            }
        }
    }

    // --- fault injection and inspection, for tests ---

    /// Any write to this register or bram fails until cleared.
    pub fn fail_writes_to(&self, name: &str) {
        self.state.lock().write_failures.insert(name.to_string());
    }

    pub fn clear_write_failures(&self) {
        self.state.lock().write_failures.clear();
    }

    /// Take the whole host off the network.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    /// Force the VACC error counters to a value.
    pub fn set_vacc_errors(&self, errors: u64) {
        self.state.lock().vacc_errors = errors;
    }

    pub fn subscriptions(&self) -> Vec<(String, Ipv4Addr)> {
        self.state.lock().subscriptions.clone()
    }

    pub fn bram(&self, name: &str) -> Option<Vec<u32>> {
        self.state.lock().brams.get(name).cloned()
    }

    pub fn register_value(&self, register: &str, field: &str) -> Option<u64> {
        self.state
            .lock()
            .registers
            .get(register)
            .and_then(|r| r.get(field).copied())
    }
}

impl BoardTransport for SimTransport {
    fn register_read(&self, name: &str) -> Result<RegisterFields> {
        self.check_online()?;
        let mut st = self.state.lock();

        if name.starts_with("vacc_status") {
            self.step_vacc(&mut st);
            let idx: usize = name["vacc_status".len()..]
                .parse()
                .map_err(|_| Error::transport(&self.name, format!("no register {name}")))?;
            let v = st
                .vacc
                .get(idx)
                .ok_or_else(|| Error::transport(&self.name, format!("no register {name}")))?
                .clone();
            return Ok(super::fields(&[
                ("armcount", v.arm_count),
                ("loadcount", v.load_count),
                ("errors", st.vacc_errors),
                ("count", v.reads_since_load),
            ]));
        }

        // free-running packet counters tick on every observation
        if name.ends_with("ctr") && !name.contains("err") && !name.contains("bad") {
            if let Some(r) = st.registers.get_mut(name) {
                if let Some(v) = r.get_mut("reg") {
                    *v = v.wrapping_add(4096);
                }
            }
        }
        if name == "spead_status" {
            if let Some(r) = st.registers.get_mut(name) {
                if let Some(v) = r.get_mut("cnt") {
                    *v = v.wrapping_add(512);
                }
            }
        }

        st.registers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::transport(&self.name, format!("no register {name}")))
    }

    fn register_write(&self, name: &str, fields: &RegisterFields) -> Result<()> {
        self.check_online()?;
        let mut st = self.state.lock();
        if st.write_failures.contains(name) {
            return Err(Error::transport(
                &self.name,
                format!("write to {name} refused"),
            ));
        }
        if !st.registers.contains_key(name) {
            return Err(Error::transport(&self.name, format!("no register {name}")));
        }

        if name == "vacc_ctrl" {
            if fields.get("rst").copied().unwrap_or(0) != 0 {
                for v in st.vacc.iter_mut() {
                    *v = VaccState::default();
                }
            }
            if fields.get("arm").copied().unwrap_or(0) != 0 {
                for v in st.vacc.iter_mut() {
                    v.arm_count += 1;
                    v.armed = true;
                    v.loaded = false;
                }
            }
        }

        if let Some(reg) = st.registers.get_mut(name) {
            for (k, v) in fields {
                reg.insert(k.clone(), *v);
            }
        }
        Ok(())
    }

    fn register_bulk_write(&self, name: &str, value: u32) -> Result<()> {
        self.register_write(name, &super::fields(&[("reg", value as u64)]))
    }

    fn memory_read(&self, name: &str, offset: usize, n_bytes: usize) -> Result<Vec<u8>> {
        self.check_online()?;
        let st = self.state.lock();
        let words = st
            .brams
            .get(name)
            .ok_or_else(|| Error::transport(&self.name, format!("no memory {name}")))?;
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
        let end = (offset + n_bytes).min(bytes.len());
        if offset >= bytes.len() {
            return Ok(Vec::new());
        }
        Ok(bytes[offset..end].to_vec())
    }

    fn memory_write(&self, name: &str, words: &[u32]) -> Result<()> {
        self.check_online()?;
        let mut st = self.state.lock();
        if st.write_failures.contains(name) {
            return Err(Error::transport(
                &self.name,
                format!("write to {name} refused"),
            ));
        }
        st.brams.insert(name.to_string(), words.to_vec());
        Ok(())
    }

    fn snapshot_arm(&self, name: &str, _offset: i64, _man_valid: bool) -> Result<()> {
        self.check_online()?;
        self.state.lock().armed_snapshots.insert(name.to_string());
        Ok(())
    }

    fn snapshot_read(&self, name: &str) -> Result<HashMap<String, Vec<u64>>> {
        self.check_online()?;
        let mut st = self.state.lock();
        if !st.armed_snapshots.remove(name) {
            return Err(Error::transport(
                &self.name,
                format!("snapshot {name} was not armed"),
            ));
        }
        drop(st);
        let mut out = HashMap::new();
        let n = if name.starts_with("snap_quant") {
            self.geometry.n_chans
        } else {
            1024
        };
        // deterministic ramp; enough for audits and round-trips
        out.insert("real".to_string(), (0..n as u64).collect());
        out.insert("imag".to_string(), (0..n as u64).rev().collect());
        let now_mcnt = self
            .time
            .mcnt_from_time(unix_now())
            .unwrap_or(0);
        out.insert("timestamp".to_string(), vec![now_mcnt & !0xfff]);
        Ok(out)
    }

    fn program(&self) -> Result<()> {
        self.check_online()?;
        self.state.lock().programmed = true;
        Ok(())
    }

    fn deprogram(&self) -> Result<()> {
        self.check_online()?;
        self.state.lock().programmed = false;
        Ok(())
    }

    fn get_system_information(&self) -> Result<SystemInformation> {
        self.check_online()?;
        let st = self.state.lock();
        let registers: BTreeSet<String> = st.registers.keys().cloned().collect();
        Ok(SystemInformation {
            registers,
            gbe_interfaces: vec!["gbe0".to_string()],
        })
    }

    fn host_okay(&self) -> bool {
        !self.offline.load(Ordering::Acquire)
    }

    fn get_local_time(&self) -> Result<u64> {
        self.check_online()?;
        let mcnt = self
            .time
            .mcnt_from_time(unix_now())
            .unwrap_or(0);
        // hardware timestamps carry zeroed low bits
        Ok(mcnt & !0xfff)
    }

    fn subscribe_multicast(&self, interface: &str, group: Ipv4Addr) -> Result<()> {
        self.check_online()?;
        self.state
            .lock()
            .subscriptions
            .push((interface.to_string(), group));
        Ok(())
    }
}

/// Builds and remembers simulator transports, so tests can reach into a
/// host after the instrument is up.
#[derive(Default)]
pub struct SimFactory {
    made: Mutex<HashMap<String, Arc<SimTransport>>>,
}

impl SimFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(SimFactory::default())
    }

    pub fn transport(&self, host: &str) -> Option<Arc<SimTransport>> {
        self.made.lock().get(host).cloned()
    }
}

impl TransportFactory for SimFactory {
    fn connect(
        &self,
        host: &str,
        role: HostRole,
        geometry: &HostGeometry,
        time: Arc<TimeModel>,
    ) -> Result<Arc<dyn BoardTransport>> {
        let sim = match role {
            HostRole::Fengine => SimTransport::new_fhost(host, geometry, time),
            HostRole::Xengine => SimTransport::new_xhost(host, geometry, time),
        };
        self.made.lock().insert(host.to_string(), sim.clone());
        Ok(sim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xhost() -> (Arc<SimTransport>, Arc<TimeModel>) {
        let time = Arc::new(TimeModel::new(1e6, 0.1, 0.5, 5.0));
        time.set_epoch(0.0).expect("epoch");
        let geometry = HostGeometry {
            engines_per_host: 2,
            n_chans: 16,
            n_beams: 1,
        };
        (SimTransport::new_xhost("xhost00", &geometry, time.clone()), time)
    }

    #[test]
    fn test_vacc_arm_and_trigger() {
        let (sim, time) = xhost();
        let load_mcnt = time.mcnt_from_time(unix_now()).expect("mcnt") + 1000;
        sim.register_write(
            "vacc_time_lsw",
            &super::super::fields(&[("lsw", load_mcnt & 0xffff_ffff)]),
        )
        .expect("lsw");
        sim.register_write(
            "vacc_time_msw",
            &super::super::fields(&[("msw", load_mcnt >> 32)]),
        )
        .expect("msw");
        sim.register_write("vacc_ctrl", &super::super::fields(&[("arm", 1)]))
            .expect("arm");

        let st = sim.register_read("vacc_status0").expect("status");
        assert_eq!(st["armcount"], 1);
        // 1000 samples at 1 MHz is 1 ms; wait it out
        std::thread::sleep(std::time::Duration::from_millis(5));
        let st = sim.register_read("vacc_status0").expect("status");
        assert_eq!(st["loadcount"], 1);
        assert!(st["count"] >= 1);
    }

    #[test]
    fn test_write_failure_injection() {
        let (sim, _) = xhost();
        sim.fail_writes_to("gbe_iptx");
        let err = sim
            .register_write("gbe_iptx", &super::super::fields(&[("reg", 1)]))
            .unwrap_err();
        assert_eq!(err.kind_token(), "board_transport");
        sim.clear_write_failures();
        sim.register_write("gbe_iptx", &super::super::fields(&[("reg", 1)]))
            .expect("write after clear");
    }

    #[test]
    fn test_offline_host() {
        let (sim, _) = xhost();
        sim.set_offline(true);
        assert!(!sim.host_okay());
        assert!(sim.register_read("control").is_err());
    }

    #[test]
    fn test_counters_tick() {
        let (sim, _) = xhost();
        let a = sim.register_read("gbe0_rxctr").expect("read")["reg"];
        let b = sim.register_read("gbe0_rxctr").expect("read")["reg"];
        assert!(b > a);
        let e0 = sim.register_read("gbe0_txerrctr").expect("read")["reg"];
        let e1 = sim.register_read("gbe0_txerrctr").expect("read")["reg"];
        assert_eq!(e0, e1);
    }

    #[test]
    fn test_snapshot_requires_arm() {
        let (sim, _) = xhost();
        assert!(sim.snapshot_read("snap_adc0").is_err());
        sim.snapshot_arm("snap_adc0", 0, false).expect("arm");
        let data = sim.snapshot_read("snap_adc0").expect("read");
        assert_eq!(data["real"].len(), 1024);
    }
}
