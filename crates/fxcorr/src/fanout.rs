// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fxcorr contributors

//! The parallel fan-out engine.
//!
//! Every cross-host action in the instrument reduces to one call of
//! [`fanout`]: run an operation against many boards concurrently with a
//! timeout, collect a per-host result map, surface partial failure.
//!
//! Workers run on the blocking pool, one per host. A worker that misses
//! the deadline keeps running to completion; its result is discarded and
//! the host is reported with a `timeout` entry distinguishable from an
//! operation-raised error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::transport::Host;

/// Why one host's slot in the result map is not a result.
#[derive(Debug)]
pub enum FanoutError {
    /// The host did not complete within the deadline.
    Timeout,
    /// The operation itself failed on this host.
    Op(Error),
}

/// Per-host outcome of one fan-out.
pub struct FanoutResult<R> {
    results: HashMap<String, std::result::Result<R, FanoutError>>,
}

impl<R> FanoutResult<R> {
    pub fn get(&self, host: &str) -> Option<&std::result::Result<R, FanoutError>> {
        self.results.get(host)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &std::result::Result<R, FanoutError>)> {
        self.results.iter()
    }

    /// Hosts that timed out or failed.
    pub fn failed_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .results
            .iter()
            .filter(|(_, r)| r.is_err())
            .map(|(h, _)| h.clone())
            .collect();
        hosts.sort();
        hosts
    }

    pub fn all_ok(&self) -> bool {
        self.results.values().all(|r| r.is_ok())
    }

    /// Collapse to a host-to-value map, failing on the first bad host.
    /// Timeouts become [`Error::Timeout`] naming the host.
    pub fn into_ok_map(self) -> Result<HashMap<String, R>> {
        let mut out = HashMap::with_capacity(self.results.len());
        for (host, result) in self.results {
            match result {
                Ok(v) => {
                    out.insert(host, v);
                }
                Err(FanoutError::Timeout) => return Err(Error::Timeout(host)),
                Err(FanoutError::Op(e)) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Collapse to a host-to-value map, or report every host that did
    /// not acknowledge as a partial commit.
    pub fn into_complete_map(self) -> Result<HashMap<String, R>> {
        let failed = self.failed_hosts();
        if !failed.is_empty() {
            return Err(Error::PartialCommit(failed));
        }
        self.into_ok_map()
    }
}

/// Apply `op` to every host concurrently, waiting at most `timeout`.
pub async fn fanout<R, F>(hosts: &[Arc<Host>], timeout: Duration, op: F) -> FanoutResult<R>
where
    R: Send + 'static,
    F: Fn(&Host) -> Result<R> + Send + Sync + 'static,
{
    let op = Arc::new(op);
    let deadline = Instant::now() + timeout;

    let handles: Vec<(String, tokio::task::JoinHandle<Result<R>>)> = hosts
        .iter()
        .map(|host| {
            let host = host.clone();
            let op = op.clone();
            (
                host.name().to_string(),
                tokio::task::spawn_blocking(move || op(&host)),
            )
        })
        .collect();

    let mut results = HashMap::with_capacity(handles.len());
    for (name, handle) in handles {
        let entry = match tokio::time::timeout_at(deadline, handle).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(FanoutError::Op(e)),
            Ok(Err(join_err)) => Err(FanoutError::Op(Error::transport(&name, join_err))),
            // dropping the handle detaches the worker; it runs on
            Err(_) => Err(FanoutError::Timeout),
        };
        results.insert(name, entry);
    }
    FanoutResult { results }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TimeModel;
    use crate::transport::sim::SimTransport;
    use crate::transport::HostGeometry;

    fn hosts(n: usize) -> Vec<Arc<Host>> {
        let time = Arc::new(TimeModel::new(1e6, 0.1, 0.5, 5.0));
        let geometry = HostGeometry {
            engines_per_host: 1,
            n_chans: 16,
            n_beams: 0,
        };
        (0..n)
            .map(|i| {
                let name = format!("xhost{i:02}");
                Arc::new(Host::new(
                    &name,
                    SimTransport::new_xhost(&name, &geometry, time.clone()),
                ))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_all_hosts_complete() {
        let hs = hosts(4);
        let res = fanout(&hs, Duration::from_secs(5), |h| {
            h.read("control").map(|r| r.len())
        })
        .await;
        assert!(res.all_ok());
        assert_eq!(res.into_ok_map().expect("map").len(), 4);
    }

    #[tokio::test]
    async fn test_failure_does_not_cancel_others() {
        let hs = hosts(3);
        let res = fanout(&hs, Duration::from_secs(5), |h| {
            if h.name() == "xhost01" {
                Err(Error::transport(h.name(), "injected"))
            } else {
                Ok(h.name().to_string())
            }
        })
        .await;
        assert_eq!(res.failed_hosts(), vec!["xhost01".to_string()]);
        assert!(matches!(
            res.get("xhost01"),
            Some(Err(FanoutError::Op(_)))
        ));
        assert!(matches!(res.get("xhost00"), Some(Ok(_))));
        assert!(matches!(res.get("xhost02"), Some(Ok(_))));
    }

    #[tokio::test]
    async fn test_timeout_distinguishable_from_op_error() {
        let hs = hosts(2);
        let res = fanout(&hs, Duration::from_millis(50), |h| {
            if h.name() == "xhost00" {
                std::thread::sleep(Duration::from_millis(400));
            }
            Ok(())
        })
        .await;
        assert!(matches!(res.get("xhost00"), Some(Err(FanoutError::Timeout))));
        assert!(matches!(res.get("xhost01"), Some(Ok(()))));
    }

    #[tokio::test]
    async fn test_into_ok_map_surfaces_timeout_kind() {
        let hs = hosts(1);
        let res = fanout(&hs, Duration::from_millis(20), |_| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        })
        .await;
        let err = res.into_ok_map().unwrap_err();
        assert_eq!(err.kind_token(), "timeout");
    }

    #[tokio::test]
    async fn test_into_complete_map_names_all_failures() {
        let hs = hosts(3);
        let res = fanout(&hs, Duration::from_secs(5), |h| {
            if h.name() == "xhost02" {
                Err(Error::transport(h.name(), "injected"))
            } else {
                Ok(())
            }
        })
        .await;
        let err = res.into_complete_map().unwrap_err();
        match err {
            Error::PartialCommit(hosts) => assert_eq!(hosts, vec!["xhost02".to_string()]),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
