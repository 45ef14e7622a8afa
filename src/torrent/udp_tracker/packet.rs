//! UDP tracker wire format (BEP 15)
//!
//! All integers are big-endian. Requests are built into a caller buffer so
//! the dispatcher can reuse one datagram buffer for every send.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{Buf, BufMut};

use crate::error::{EngineError, ProtocolErrorKind, Result};

/// Magic constant for UDP tracker protocol
pub const UDP_PROTOCOL_ID: u64 = 0x41727101980;

pub const ACTION_CONNECT: u32 = 0;
pub const ACTION_ANNOUNCE: u32 = 1;
pub const ACTION_ERROR: u32 = 3;

/// Connect request size
pub const CONNECT_REQUEST_LEN: usize = 16;

/// Announce request size
pub const ANNOUNCE_REQUEST_LEN: usize = 98;

/// Announce event as sent on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UdpAnnounceEvent {
    #[default]
    None,
    Completed,
    Started,
    Stopped,
}

impl UdpAnnounceEvent {
    fn to_udp_id(self) -> u32 {
        match self {
            UdpAnnounceEvent::None => 0,
            UdpAnnounceEvent::Completed => 1,
            UdpAnnounceEvent::Started => 2,
            UdpAnnounceEvent::Stopped => 3,
        }
    }
}

/// Fields of one announce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceParams {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: UdpAnnounceEvent,
    pub key: u32,
    /// -1 lets the tracker choose
    pub num_want: i32,
    pub port: u16,
}

impl AnnounceParams {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20], port: u16) -> Self {
        Self {
            info_hash,
            peer_id,
            downloaded: 0,
            left: 0,
            uploaded: 0,
            event: UdpAnnounceEvent::None,
            key: rand::random(),
            num_want: -1,
            port,
        }
    }
}

/// Successful announce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceReply {
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    pub peers: Vec<SocketAddr>,
}

/// A decoded tracker datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpTrackerReply {
    Connect {
        transaction_id: u32,
        connection_id: u64,
    },
    Announce {
        transaction_id: u32,
        reply: AnnounceReply,
    },
    Error {
        transaction_id: u32,
        message: String,
    },
}

impl UdpTrackerReply {
    pub fn transaction_id(&self) -> u32 {
        match self {
            UdpTrackerReply::Connect { transaction_id, .. }
            | UdpTrackerReply::Announce { transaction_id, .. }
            | UdpTrackerReply::Error { transaction_id, .. } => *transaction_id,
        }
    }
}

fn tracker_error(message: impl Into<String>) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::UdpTracker, message)
}

/// Write a connect request; None if `buf` is too small
pub fn encode_connect(transaction_id: u32, mut buf: &mut [u8]) -> Option<usize> {
    if buf.len() < CONNECT_REQUEST_LEN {
        return None;
    }
    buf.put_u64(UDP_PROTOCOL_ID);
    buf.put_u32(ACTION_CONNECT);
    buf.put_u32(transaction_id);
    Some(CONNECT_REQUEST_LEN)
}

/// Write an announce request; None if `buf` is too small
pub fn encode_announce(
    connection_id: u64,
    transaction_id: u32,
    params: &AnnounceParams,
    mut buf: &mut [u8],
) -> Option<usize> {
    if buf.len() < ANNOUNCE_REQUEST_LEN {
        return None;
    }
    buf.put_u64(connection_id);
    buf.put_u32(ACTION_ANNOUNCE);
    buf.put_u32(transaction_id);
    buf.put_slice(&params.info_hash);
    buf.put_slice(&params.peer_id);
    buf.put_u64(params.downloaded);
    buf.put_u64(params.left);
    buf.put_u64(params.uploaded);
    buf.put_u32(params.event.to_udp_id());
    buf.put_u32(0); // IP address (0 = default)
    buf.put_u32(params.key);
    buf.put_i32(params.num_want);
    buf.put_u16(params.port);
    Some(ANNOUNCE_REQUEST_LEN)
}

/// Decode a tracker reply
pub fn parse_reply(mut data: &[u8]) -> Result<UdpTrackerReply> {
    if data.len() < 8 {
        return Err(tracker_error(format!(
            "UDP tracker reply too short ({} bytes)",
            data.len()
        )));
    }
    let action = data.get_u32();
    let transaction_id = data.get_u32();

    match action {
        ACTION_CONNECT => {
            if data.len() < 8 {
                return Err(tracker_error("UDP connect reply too short"));
            }
            Ok(UdpTrackerReply::Connect {
                transaction_id,
                connection_id: data.get_u64(),
            })
        }
        ACTION_ANNOUNCE => {
            if data.len() < 12 {
                return Err(tracker_error("UDP announce reply too short"));
            }
            let interval = data.get_u32();
            let leechers = data.get_u32();
            let seeders = data.get_u32();
            let peers = data
                .chunks_exact(6)
                .map(|c| {
                    SocketAddr::V4(SocketAddrV4::new(
                        Ipv4Addr::new(c[0], c[1], c[2], c[3]),
                        u16::from_be_bytes([c[4], c[5]]),
                    ))
                })
                .collect();
            Ok(UdpTrackerReply::Announce {
                transaction_id,
                reply: AnnounceReply {
                    interval,
                    leechers,
                    seeders,
                    peers,
                },
            })
        }
        ACTION_ERROR => Ok(UdpTrackerReply::Error {
            transaction_id,
            message: String::from_utf8_lossy(data).into_owned(),
        }),
        other => Err(tracker_error(format!(
            "Unknown UDP tracker action: {}",
            other
        ))),
    }
}
