// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fxcorr contributors

//! Metadata heap encoding and transmission.
//!
//! Streams advertise themselves with heaps of numerically-identified
//! items sent over UDP to their destination group, one datagram per IP
//! in the group range. The heap layout is opaque to receivers of this
//! crate's API; only the item identifiers are part of the contract.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

use crate::address::StreamAddress;
use crate::error::{Error, Result};

/// Multicast TTL for metadata datagrams.
const META_PKT_TTL: u32 = 2;

/// Well-known item identifiers.
pub mod items {
    pub const ADC_SAMPLE_RATE: u64 = 0x1007;
    pub const N_BLS: u64 = 0x1008;
    pub const N_CHANS: u64 = 0x1009;
    pub const N_ANTS: u64 = 0x100A;
    pub const N_XENGS: u64 = 0x100B;
    pub const BLS_ORDERING: u64 = 0x100C;
    pub const CENTER_FREQ: u64 = 0x1011;
    pub const BANDWIDTH: u64 = 0x1013;
    pub const N_ACCS: u64 = 0x1015;
    pub const INT_TIME: u64 = 0x1016;
    pub const FFT_SHIFT: u64 = 0x101E;
    pub const XENG_ACC_LEN: u64 = 0x101F;
    pub const RX_UDP_PORT: u64 = 0x1022;
    pub const RX_UDP_IP: u64 = 0x1024;
    pub const X_PER_FPGA: u64 = 0x1041;
    pub const F_PER_FPGA: u64 = 0x1049;
    pub const BEAM_QUANT_GAIN: u64 = 0x1050;
    pub const BEAM_WEIGHTS: u64 = 0x2000;
    pub const INPUT_LABELS: u64 = 0x100E;
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    U64(u64),
    F64(f64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetaItem {
    pub id: u64,
    pub value: MetaValue,
}

/// A metadata heap under construction.
#[derive(Debug, Default, Clone)]
pub struct MetaHeap {
    items: Vec<MetaItem>,
}

const HEAP_MAGIC: u32 = 0x4658_4d48; // "FXMH"

impl MetaHeap {
    pub fn new() -> Self {
        MetaHeap::default()
    }

    pub fn push_u64(&mut self, id: u64, value: u64) -> &mut Self {
        self.items.push(MetaItem {
            id,
            value: MetaValue::U64(value),
        });
        self
    }

    pub fn push_f64(&mut self, id: u64, value: f64) -> &mut Self {
        self.items.push(MetaItem {
            id,
            value: MetaValue::F64(value),
        });
        self
    }

    pub fn push_str(&mut self, id: u64, value: impl Into<String>) -> &mut Self {
        self.items.push(MetaItem {
            id,
            value: MetaValue::Str(value.into()),
        });
        self
    }

    pub fn items(&self) -> &[MetaItem] {
        &self.items
    }

    /// Flatten to the wire form: a fixed header then `id, tag, length,
    /// payload` per item, all big-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.items.len() * 24);
        out.extend_from_slice(&HEAP_MAGIC.to_be_bytes());
        out.extend_from_slice(&(self.items.len() as u32).to_be_bytes());
        for item in &self.items {
            out.extend_from_slice(&item.id.to_be_bytes());
            match &item.value {
                MetaValue::U64(v) => {
                    out.push(0);
                    out.extend_from_slice(&8u32.to_be_bytes());
                    out.extend_from_slice(&v.to_be_bytes());
                }
                MetaValue::F64(v) => {
                    out.push(1);
                    out.extend_from_slice(&8u32.to_be_bytes());
                    out.extend_from_slice(&v.to_bits().to_be_bytes());
                }
                MetaValue::Str(s) => {
                    out.push(2);
                    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
                    out.extend_from_slice(s.as_bytes());
                }
            }
        }
        out
    }
}

/// Sends heaps to stream destinations.
pub struct MetaTransmitter {
    socket: UdpSocket,
}

impl MetaTransmitter {
    pub fn new() -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| Error::transport("meta-tx", e))?;
        socket
            .set_multicast_ttl_v4(META_PKT_TTL)
            .map_err(|e| Error::transport("meta-tx", e))?;
        let bind: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into();
        socket
            .bind(&bind.into())
            .map_err(|e| Error::transport("meta-tx", e))?;
        Ok(MetaTransmitter {
            socket: socket.into(),
        })
    }

    /// Send one heap datagram to every IP in the destination group.
    /// Returns the number of datagrams sent.
    pub fn transmit(&self, heap: &MetaHeap, destination: &StreamAddress) -> Result<usize> {
        let payload = heap.encode();
        let mut sent = 0;
        for ip in destination.enumerate() {
            let target = SocketAddrV4::new(ip, destination.port());
            self.socket
                .send_to(&payload, target)
                .map_err(|e| Error::transport("meta-tx", e))?;
            sent += 1;
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let mut heap = MetaHeap::new();
        heap.push_u64(items::N_CHANS, 4096);
        heap.push_str(items::RX_UDP_IP, "239.1.2.3");
        let bytes = heap.encode();
        assert_eq!(&bytes[0..4], &HEAP_MAGIC.to_be_bytes());
        assert_eq!(&bytes[4..8], &2u32.to_be_bytes());
        // first item id
        assert_eq!(&bytes[8..16], &items::N_CHANS.to_be_bytes());
        assert_eq!(bytes[16], 0);
    }

    #[test]
    fn test_transmit_one_heap_per_group_ip() {
        let receiver = UdpSocket::bind("127.0.0.1:0").expect("bind");
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .expect("timeout");
        let port = receiver.local_addr().expect("addr").port();

        // a +2 group on loopback lands three datagrams on three IPs; to
        // keep the test hermetic use a single-address group instead
        let dest = StreamAddress::parse(&format!("127.0.0.1:{port}")).expect("addr");
        let tx = MetaTransmitter::new().expect("tx");
        let mut heap = MetaHeap::new();
        heap.push_u64(items::N_BLS, 40);
        let sent = tx.transmit(&heap, &dest).expect("send");
        assert_eq!(sent, 1);

        let mut buf = [0u8; 2048];
        let (n, _) = receiver.recv_from(&mut buf).expect("recv");
        assert_eq!(&buf[..n], heap.encode().as_slice());
    }

    #[test]
    fn test_transmit_counts_range() {
        // range-3 group: three datagrams reported even when nobody is
        // listening (UDP fire-and-forget)
        let dest = StreamAddress::parse("127.0.0.1+2:42123").expect("addr");
        let tx = MetaTransmitter::new().expect("tx");
        let heap = MetaHeap::new();
        let sent = tx.transmit(&heap, &dest).expect("send");
        assert_eq!(sent, 3);
    }
}
