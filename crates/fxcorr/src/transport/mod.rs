// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fxcorr contributors

//! The per-board transport capability set.
//!
//! The control plane never talks to board hardware directly; it consumes
//! this trait. A real deployment plugs in a KATCP-backed implementation
//! through [`TransportFactory`]; tests and bench setups use the
//! in-process [`sim::SimTransport`].

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::time::TimeModel;

pub mod sim;

/// Field name to value map for one named register.
pub type RegisterFields = HashMap<String, u64>;

/// Build a field map from a literal slice.
pub fn fields(pairs: &[(&str, u64)]) -> RegisterFields {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

/// Firmware-level information reported by a programmed board.
#[derive(Debug, Clone)]
pub struct SystemInformation {
    /// Names of every register in the running bitstream.
    pub registers: BTreeSet<String>,
    /// Network interface names (one per gbe core).
    pub gbe_interfaces: Vec<String>,
}

/// Register read/write, block memory, snapshot capture and lifecycle
/// control for one board. Implementations block; callers run them on the
/// blocking pool via the fan-out engine or a sensor executor.
pub trait BoardTransport: Send + Sync {
    fn register_read(&self, name: &str) -> Result<RegisterFields>;
    fn register_write(&self, name: &str, fields: &RegisterFields) -> Result<()>;
    /// Write a single full-width word to a register.
    fn register_bulk_write(&self, name: &str, value: u32) -> Result<()>;

    fn memory_read(&self, name: &str, offset: usize, n_bytes: usize) -> Result<Vec<u8>>;
    /// Write a block of words to a named memory (bram).
    fn memory_write(&self, name: &str, words: &[u32]) -> Result<()>;

    fn snapshot_arm(&self, name: &str, offset: i64, man_valid: bool) -> Result<()>;
    fn snapshot_read(&self, name: &str) -> Result<HashMap<String, Vec<u64>>>;

    fn program(&self) -> Result<()>;
    fn deprogram(&self) -> Result<()>;
    fn get_system_information(&self) -> Result<SystemInformation>;
    fn host_okay(&self) -> bool;
    /// The board's current sample count.
    fn get_local_time(&self) -> Result<u64>;

    fn subscribe_multicast(&self, interface: &str, group: Ipv4Addr) -> Result<()>;
}

/// What a programmed bitstream can do, derived from its register listing.
/// Code paths consult this, not the raw register set.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    registers: BTreeSet<String>,
    gbe_interfaces: Vec<String>,
}

impl Capabilities {
    pub fn from_system_information(info: &SystemInformation) -> Self {
        Capabilities {
            registers: info.registers.clone(),
            gbe_interfaces: info.gbe_interfaces.clone(),
        }
    }

    pub fn has(&self, register: &str) -> bool {
        self.registers.contains(register)
    }

    pub fn gbe_interfaces(&self) -> &[String] {
        &self.gbe_interfaces
    }
}

/// Which engine tier a host belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRole {
    Fengine,
    Xengine,
}

/// Geometry a transport needs to model one board.
#[derive(Debug, Clone)]
pub struct HostGeometry {
    pub engines_per_host: usize,
    pub n_chans: usize,
    pub n_beams: usize,
}

/// Builds transports for the hosts named in the configuration.
pub trait TransportFactory: Send + Sync {
    fn connect(
        &self,
        host: &str,
        role: HostRole,
        geometry: &HostGeometry,
        time: Arc<TimeModel>,
    ) -> Result<Arc<dyn BoardTransport>>;
}

/// A named board plus its transport and detected capabilities.
pub struct Host {
    name: String,
    transport: Arc<dyn BoardTransport>,
    caps: RwLock<Option<Capabilities>>,
}

impl Host {
    pub fn new(name: impl Into<String>, transport: Arc<dyn BoardTransport>) -> Self {
        Host {
            name: name.into(),
            transport,
            caps: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> &Arc<dyn BoardTransport> {
        &self.transport
    }

    /// Re-read the board's system information and recompute the
    /// capability set. Run after programming.
    pub fn refresh_capabilities(&self) -> Result<()> {
        let info = self.transport.get_system_information()?;
        *self.caps.write() = Some(Capabilities::from_system_information(&info));
        Ok(())
    }

    pub fn has_register(&self, register: &str) -> bool {
        self.caps
            .read()
            .as_ref()
            .map(|c| c.has(register))
            .unwrap_or(false)
    }

    /// Fail with `unsupported` when the bitstream lacks a register.
    pub fn require_register(&self, register: &str) -> Result<()> {
        if self.has_register(register) {
            Ok(())
        } else {
            Err(Error::Unsupported(register.to_string()))
        }
    }

    pub fn gbe_interfaces(&self) -> Vec<String> {
        self.caps
            .read()
            .as_ref()
            .map(|c| c.gbe_interfaces().to_vec())
            .unwrap_or_default()
    }

    pub fn read(&self, register: &str) -> Result<RegisterFields> {
        self.transport.register_read(register)
    }

    /// Read one named field of a register.
    pub fn read_field(&self, register: &str, field: &str) -> Result<u64> {
        let regs = self.transport.register_read(register)?;
        regs.get(field).copied().ok_or_else(|| {
            Error::transport(&self.name, format!("register {register} has no field {field}"))
        })
    }

    pub fn write(&self, register: &str, pairs: &[(&str, u64)]) -> Result<()> {
        self.transport.register_write(register, &fields(pairs))
    }

    pub fn bulk_write(&self, register: &str, value: u32) -> Result<()> {
        self.transport.register_bulk_write(register, value)
    }

    pub fn write_block(&self, name: &str, words: &[u32]) -> Result<()> {
        self.transport.memory_write(name, words)
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_detection() {
        let time = Arc::new(TimeModel::new(1e9, 2.0, 0.5, 5.0));
        let geometry = HostGeometry {
            engines_per_host: 2,
            n_chans: 16,
            n_beams: 0,
        };
        let sim = sim::SimTransport::new_fhost("fhost00", &geometry, time);
        let host = Host::new("fhost00", sim);

        assert!(!host.has_register("fft_shift"));
        host.refresh_capabilities().expect("refresh");
        assert!(host.has_register("fft_shift"));
        assert!(host.require_register("no_such_register").is_err());
    }

    #[test]
    fn test_require_register_kind() {
        let time = Arc::new(TimeModel::new(1e9, 2.0, 0.5, 5.0));
        let geometry = HostGeometry {
            engines_per_host: 1,
            n_chans: 16,
            n_beams: 0,
        };
        let sim = sim::SimTransport::new_xhost("xhost00", &geometry, time);
        let host = Host::new("xhost00", sim);
        host.refresh_capabilities().expect("refresh");
        let err = host.require_register("x_setup").unwrap_err();
        assert_eq!(err.kind_token(), "unsupported");
    }
}
