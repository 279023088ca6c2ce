// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fxcorr contributors

//! Named data streams leaving the instrument.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::address::StreamAddress;
use crate::error::{Error, Result};

/// What kind of data a stream carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCategory {
    DigitiserAdcSamples,
    FengineChannelised,
    XengineCrossProducts,
    BeamformerFrequencyDomain,
    BeamformerTimeDomain,
}

impl fmt::Display for StreamCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamCategory::DigitiserAdcSamples => "digitiser-adc-samples",
            StreamCategory::FengineChannelised => "antenna-channelised-voltage",
            StreamCategory::XengineCrossProducts => "baseline-correlation-products",
            StreamCategory::BeamformerFrequencyDomain => "tied-array-channelised-voltage",
            StreamCategory::BeamformerTimeDomain => "tied-array-voltage",
        };
        write!(f, "{s}")
    }
}

/// One named, typed flow of data with a mutable destination.
pub struct DataStream {
    name: RwLock<String>,
    category: StreamCategory,
    sources: RwLock<Vec<StreamAddress>>,
    destination: RwLock<StreamAddress>,
    tx_enabled: AtomicBool,
}

impl DataStream {
    pub fn new(
        name: impl Into<String>,
        category: StreamCategory,
        destination: StreamAddress,
    ) -> Arc<Self> {
        Arc::new(DataStream {
            name: RwLock::new(name.into()),
            category,
            sources: RwLock::new(Vec::new()),
            destination: RwLock::new(destination),
            tx_enabled: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn category(&self) -> StreamCategory {
        self.category
    }

    pub fn destination(&self) -> StreamAddress {
        self.destination.read().clone()
    }

    pub fn set_destination(&self, destination: StreamAddress) {
        *self.destination.write() = destination;
    }

    pub fn sources(&self) -> Vec<StreamAddress> {
        self.sources.read().clone()
    }

    pub fn set_sources(&self, sources: Vec<StreamAddress>) {
        *self.sources.write() = sources;
    }

    pub fn tx_enabled(&self) -> bool {
        self.tx_enabled.load(Ordering::Acquire)
    }

    pub fn set_tx_enabled(&self, enabled: bool) {
        self.tx_enabled.store(enabled, Ordering::Release);
    }

    fn rename(&self, name: String) {
        *self.name.write() = name;
    }
}

impl fmt::Debug for DataStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DataStream({} [{}] -> {})",
            self.name(),
            self.category,
            self.destination()
        )
    }
}

/// All streams the instrument exposes, keyed by name.
#[derive(Default)]
pub struct StreamRegistry {
    streams: RwLock<BTreeMap<String, Arc<DataStream>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        StreamRegistry::default()
    }

    pub fn add(&self, stream: Arc<DataStream>) -> Result<()> {
        let name = stream.name();
        let mut streams = self.streams.write();
        if streams.contains_key(&name) {
            return Err(Error::config(
                "streams",
                format!("stream '{name}' registered twice"),
            ));
        }
        streams.insert(name, stream);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<DataStream>> {
        self.streams
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::StreamUnknown(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.streams.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.streams.read().keys().cloned().collect()
    }

    pub fn all(&self) -> Vec<Arc<DataStream>> {
        self.streams.read().values().cloned().collect()
    }

    /// Re-key a stream under a new name (input relabelling).
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let mut streams = self.streams.write();
        let stream = streams
            .remove(old)
            .ok_or_else(|| Error::StreamUnknown(old.to_string()))?;
        stream.rename(new.to_string());
        streams.insert(new.to_string(), stream);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> StreamAddress {
        StreamAddress::parse(s).expect("address")
    }

    #[test]
    fn test_registry_lookup() {
        let reg = StreamRegistry::new();
        reg.add(DataStream::new(
            "baseline-correlation-products",
            StreamCategory::XengineCrossProducts,
            addr("239.9.3.1:7148"),
        ))
        .expect("add");
        assert!(reg.contains("baseline-correlation-products"));
        let err = reg.get("no-such-stream").unwrap_err();
        assert_eq!(err.kind_token(), "stream_unknown");
    }

    #[test]
    fn test_duplicate_rejected() {
        let reg = StreamRegistry::new();
        let make = || {
            DataStream::new(
                "ant0x",
                StreamCategory::DigitiserAdcSamples,
                addr("239.0.0.10+1:7148"),
            )
        };
        reg.add(make()).expect("add");
        assert!(reg.add(make()).is_err());
    }

    #[test]
    fn test_destination_mutation() {
        let stream = DataStream::new(
            "antenna-channelised-voltage",
            StreamCategory::FengineChannelised,
            addr("239.2.0.64+7:7148"),
        );
        stream.set_destination(addr("239.2.1.64+7:7148"));
        assert_eq!(stream.destination().to_string(), "239.2.1.64+7:7148");
    }

    #[test]
    fn test_rename_rekeys() {
        let reg = StreamRegistry::new();
        reg.add(DataStream::new(
            "ant0x",
            StreamCategory::DigitiserAdcSamples,
            addr("239.0.0.10+1:7148"),
        ))
        .expect("add");
        reg.rename("ant0x", "m000h").expect("rename");
        assert!(!reg.contains("ant0x"));
        assert_eq!(reg.get("m000h").expect("get").name(), "m000h");
    }
}
