//! KRPC messages (BEP 5)

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

use super::node::{encode_compact_nodes, parse_compact_nodes, DhtNode, NodeId};
use crate::error::{EngineError, ProtocolErrorKind, Result};
use crate::torrent::bencode::BencodeValue;

pub type TransactionId = Vec<u8>;

/// KRPC error code for a bad announce token
pub const ERROR_PROTOCOL: i64 = 203;

fn krpc_error(message: impl Into<String>) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::Krpc, message)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtQuery {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: [u8; 20],
    },
    AnnouncePeer {
        info_hash: [u8; 20],
        port: u16,
        token: Vec<u8>,
        implied_port: bool,
    },
}

impl DhtQuery {
    pub fn method(&self) -> &'static str {
        match self {
            DhtQuery::Ping => "ping",
            DhtQuery::FindNode { .. } => "find_node",
            DhtQuery::GetPeers { .. } => "get_peers",
            DhtQuery::AnnouncePeer { .. } => "announce_peer",
        }
    }
}

/// Reply body. One shape covers every query type: fields a reply does not
/// carry stay empty.
#[derive(Debug, Clone, Default)]
pub struct DhtResponse {
    pub id: Option<NodeId>,
    pub nodes: Vec<DhtNode>,
    pub peers: Vec<SocketAddr>,
    pub token: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub enum DhtMessageBody {
    Query(DhtQuery),
    Response(DhtResponse),
    Error { code: i64, message: String },
}

#[derive(Debug, Clone)]
pub struct DhtMessage {
    pub transaction_id: TransactionId,
    /// Sender's node id ("a.id" or "r.id")
    pub sender_id: Option<NodeId>,
    pub body: DhtMessageBody,
}

impl DhtMessage {
    pub fn query(transaction_id: TransactionId, our_id: NodeId, query: DhtQuery) -> Self {
        Self {
            transaction_id,
            sender_id: Some(our_id),
            body: DhtMessageBody::Query(query),
        }
    }

    pub fn response(transaction_id: TransactionId, our_id: NodeId, response: DhtResponse) -> Self {
        Self {
            transaction_id,
            sender_id: Some(our_id),
            body: DhtMessageBody::Response(DhtResponse {
                id: Some(our_id),
                ..response
            }),
        }
    }

    pub fn error(transaction_id: TransactionId, code: i64, message: impl Into<String>) -> Self {
        Self {
            transaction_id,
            sender_id: None,
            body: DhtMessageBody::Error {
                code,
                message: message.into(),
            },
        }
    }

    pub fn is_query(&self) -> bool {
        matches!(self.body, DhtMessageBody::Query(_))
    }

    pub fn parse(data: &[u8], now: Instant) -> Result<Self> {
        let value = BencodeValue::decode(data)?;
        if !value.is_dict() {
            return Err(krpc_error("expected dict"));
        }

        let transaction_id = value
            .get("t")
            .and_then(|v| v.as_bytes())
            .map(<[u8]>::to_vec)
            .ok_or_else(|| krpc_error("missing transaction id"))?;

        let msg_type = value
            .get("y")
            .and_then(|v| v.as_string())
            .ok_or_else(|| krpc_error("missing message type"))?;

        match msg_type {
            "q" => Self::parse_query(transaction_id, &value),
            "r" => Self::parse_response(transaction_id, &value, now),
            "e" => Self::parse_error(transaction_id, &value),
            _ => Err(krpc_error(format!("unknown message type: {}", msg_type))),
        }
    }

    fn parse_query(transaction_id: TransactionId, dict: &BencodeValue) -> Result<Self> {
        let query_name = dict
            .get("q")
            .and_then(|v| v.as_string())
            .ok_or_else(|| krpc_error("missing query name"))?;

        let args = dict
            .get("a")
            .filter(|v| v.is_dict())
            .ok_or_else(|| krpc_error("missing query args"))?;

        let sender_id = args
            .get("id")
            .and_then(|v| v.as_bytes())
            .map(NodeId::from_bytes)
            .transpose()?
            .ok_or_else(|| krpc_error("missing id in query"))?;

        let info_hash = || {
            args.get("info_hash")
                .and_then(|v| v.as_bytes())
                .and_then(|b| <[u8; 20]>::try_from(b).ok())
                .ok_or_else(|| krpc_error("missing info_hash"))
        };

        let query = match query_name {
            "ping" => DhtQuery::Ping,
            "find_node" => {
                let target = args
                    .get("target")
                    .and_then(|v| v.as_bytes())
                    .ok_or_else(|| krpc_error("missing target"))?;
                DhtQuery::FindNode {
                    target: NodeId::from_bytes(target)?,
                }
            }
            "get_peers" => DhtQuery::GetPeers {
                info_hash: info_hash()?,
            },
            "announce_peer" => {
                let port = args
                    .get("port")
                    .and_then(|v| v.as_uint())
                    .and_then(|p| u16::try_from(p).ok())
                    .ok_or_else(|| krpc_error("missing port"))?;
                let token = args
                    .get("token")
                    .and_then(|v| v.as_bytes())
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| krpc_error("missing token"))?;
                let implied_port = args
                    .get("implied_port")
                    .and_then(|v| v.as_int())
                    .is_some_and(|v| v == 1);
                DhtQuery::AnnouncePeer {
                    info_hash: info_hash()?,
                    port,
                    token,
                    implied_port,
                }
            }
            _ => return Err(krpc_error(format!("unknown query: {}", query_name))),
        };

        Ok(Self {
            transaction_id,
            sender_id: Some(sender_id),
            body: DhtMessageBody::Query(query),
        })
    }

    fn parse_response(
        transaction_id: TransactionId,
        dict: &BencodeValue,
        now: Instant,
    ) -> Result<Self> {
        let resp = dict
            .get("r")
            .filter(|v| v.is_dict())
            .ok_or_else(|| krpc_error("missing response dict"))?;

        let id = resp
            .get("id")
            .and_then(|v| v.as_bytes())
            .map(NodeId::from_bytes)
            .transpose()?
            .ok_or_else(|| krpc_error("missing id in response"))?;

        let nodes = resp
            .get("nodes")
            .and_then(|v| v.as_bytes())
            .map(|data| parse_compact_nodes(data, now))
            .unwrap_or_default();

        let peers = resp
            .get("values")
            .and_then(|v| v.as_list())
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_bytes())
                    .filter(|b| b.len() == 6)
                    .map(|b| {
                        let ip = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
                        SocketAddr::new(IpAddr::V4(ip), u16::from_be_bytes([b[4], b[5]]))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let token = resp
            .get("token")
            .and_then(|v| v.as_bytes())
            .map(<[u8]>::to_vec);

        Ok(Self {
            transaction_id,
            sender_id: Some(id),
            body: DhtMessageBody::Response(DhtResponse {
                id: Some(id),
                nodes,
                peers,
                token,
            }),
        })
    }

    fn parse_error(transaction_id: TransactionId, dict: &BencodeValue) -> Result<Self> {
        let error = dict
            .get("e")
            .and_then(|v| v.as_list())
            .ok_or_else(|| krpc_error("missing error list"))?;

        let code = error.first().and_then(|v| v.as_int()).unwrap_or(0);
        let message = error
            .get(1)
            .and_then(|v| v.as_string())
            .unwrap_or("unknown error")
            .to_string();

        Ok(Self::error(transaction_id, code, message))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dict = BencodeValue::new_dict().with("t", self.transaction_id.as_slice());

        match &self.body {
            DhtMessageBody::Query(query) => {
                let mut args = BencodeValue::new_dict();
                if let Some(id) = &self.sender_id {
                    args.insert("id", id.as_bytes().as_slice());
                }
                match query {
                    DhtQuery::Ping => {}
                    DhtQuery::FindNode { target } => {
                        args.insert("target", target.as_bytes().as_slice());
                    }
                    DhtQuery::GetPeers { info_hash } => {
                        args.insert("info_hash", info_hash.as_slice());
                    }
                    DhtQuery::AnnouncePeer {
                        info_hash,
                        port,
                        token,
                        implied_port,
                    } => {
                        args.insert("info_hash", info_hash.as_slice());
                        args.insert("port", *port as u64);
                        args.insert("token", token.as_slice());
                        if *implied_port {
                            args.insert("implied_port", 1u64);
                        }
                    }
                }
                dict.insert("y", "q");
                dict.insert("q", query.method());
                dict.insert("a", args);
            }
            DhtMessageBody::Response(response) => {
                let mut resp = BencodeValue::new_dict();
                if let Some(id) = response.id.or(self.sender_id) {
                    resp.insert("id", id.as_bytes().as_slice());
                }
                if !response.nodes.is_empty() {
                    resp.insert("nodes", encode_compact_nodes(&response.nodes));
                }
                if !response.peers.is_empty() {
                    let values: Vec<BencodeValue> = response
                        .peers
                        .iter()
                        .filter_map(|addr| match addr {
                            SocketAddr::V4(v4) => {
                                let mut data = v4.ip().octets().to_vec();
                                data.extend_from_slice(&v4.port().to_be_bytes());
                                Some(BencodeValue::from(data))
                            }
                            SocketAddr::V6(_) => None,
                        })
                        .collect();
                    resp.insert("values", values);
                }
                if let Some(token) = &response.token {
                    resp.insert("token", token.as_slice());
                }
                dict.insert("y", "r");
                dict.insert("r", resp);
            }
            DhtMessageBody::Error { code, message } => {
                dict.insert("y", "e");
                dict.insert(
                    "e",
                    vec![BencodeValue::from(*code), BencodeValue::from(message.as_str())],
                );
            }
        }

        dict.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ping_query() {
        let data = b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:aa1:y1:qe";
        let msg = DhtMessage::parse(data, Instant::now()).unwrap();
        assert_eq!(msg.transaction_id, b"aa");
        assert_eq!(msg.sender_id.unwrap().0, *b"abcdefghij0123456789");
        assert!(matches!(msg.body, DhtMessageBody::Query(DhtQuery::Ping)));
    }

    #[test]
    fn test_encode_matches_bep5_ping() {
        let msg = DhtMessage::query(b"aa".to_vec(), NodeId(*b"abcdefghij0123456789"), DhtQuery::Ping);
        assert_eq!(
            msg.encode(),
            b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:aa1:y1:qe".to_vec()
        );
    }

    #[test]
    fn test_get_peers_response() {
        let now = Instant::now();
        let node = DhtNode::new(NodeId([3u8; 20]), "10.0.0.3:6881".parse().unwrap(), now);
        let msg = DhtMessage::response(
            b"xy".to_vec(),
            NodeId([1u8; 20]),
            DhtResponse {
                nodes: vec![node],
                peers: vec!["10.0.0.9:51413".parse().unwrap()],
                token: Some(b"tok".to_vec()),
                ..Default::default()
            },
        );
        let parsed = DhtMessage::parse(&msg.encode(), now).unwrap();
        let DhtMessageBody::Response(resp) = parsed.body else {
            panic!("expected a response");
        };
        assert_eq!(resp.id, Some(NodeId([1u8; 20])));
        assert_eq!(resp.nodes.len(), 1);
        assert_eq!(resp.peers, vec!["10.0.0.9:51413".parse().unwrap()]);
        assert_eq!(resp.token.as_deref(), Some(b"tok".as_slice()));
    }

    #[test]
    fn test_parse_error_message() {
        let data = b"d1:eli201e23:A Generic Error Ocurrede1:t2:aa1:y1:ee";
        let msg = DhtMessage::parse(data, Instant::now()).unwrap();
        let DhtMessageBody::Error { code, message } = msg.body else {
            panic!("expected an error");
        };
        assert_eq!(code, 201);
        assert_eq!(message, "A Generic Error Ocurred");
    }

    #[test]
    fn test_rejects_malformed() {
        let now = Instant::now();
        assert!(DhtMessage::parse(b"le", now).is_err());
        assert!(DhtMessage::parse(b"d1:t2:aa1:y1:xe", now).is_err());
        // find_node without target
        assert!(DhtMessage::parse(
            b"d1:ad2:id20:abcdefghij0123456789e1:q9:find_node1:t2:aa1:y1:qe",
            now
        )
        .is_err());
    }
}
