//! DHT Interaction Tests
//!
//! Drive the shared-socket DHT/UDP tracker task over an in-memory socket.


use std::net::SocketAddr;
use std::time::Instant;

use bytes::BufMut;
use tandem_dl::group::context::DownloadContext;
use tandem_dl::torrent::dht::{self, DhtInteractionTask, DhtMessage, DhtMessageBody, DhtQuery};
use tandem_dl::torrent::udp_tracker::packet::{
    AnnounceParams, ANNOUNCE_REQUEST_LEN, CONNECT_REQUEST_LEN,
};
use tandem_dl::torrent::udp_tracker::{UdpTrackerError, UdpTrackerRequest, UdpTrackerRequestHandle};
use tandem_dl::torrent::NodeId;
use tandem_dl::{DownloadEngine, Execute, HaltReason, RequestGroup, TaskStatus};
use tempfile::TempDir;
use test_helpers::{init_tracing, test_config, DatagramHandle, MockDatagramSocket};

const TRACKER: &str = "127.0.0.1:6969";
const PEER_NODE: &str = "127.0.0.1:7001";

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// Engine with one active torrent group, so the DHT has a reason to run
fn engine_with_torrent(dir: &TempDir) -> DownloadEngine {
    let mut engine = DownloadEngine::new(test_config(dir.path())).unwrap();
    let ctx = DownloadContext::for_metadata([7u8; 20], Some("sample".into()));
    engine.add_group(RequestGroup::new(ctx.into_handle())).unwrap();
    engine.turn();
    assert_eq!(engine.context().groups().num_active(), 1);
    engine
}

fn start_dht(engine: &mut DownloadEngine) -> (DhtInteractionTask, DatagramHandle) {
    let (socket, net) = MockDatagramSocket::new();
    let task = dht::setup_with_connection(engine.context_mut(), Box::new(socket)).unwrap();
    (task, net)
}

fn announce_request() -> UdpTrackerRequestHandle {
    UdpTrackerRequest::new(addr(TRACKER), AnnounceParams::new([7u8; 20], [1u8; 20], 6881))
        .into_handle()
}

fn sent_to(sent: &[(Vec<u8>, SocketAddr)], to: &str) -> Vec<Vec<u8>> {
    sent.iter()
        .filter(|(_, a)| *a == addr(to))
        .map(|(d, _)| d.clone())
        .collect()
}

fn transaction_id(request: &[u8]) -> u32 {
    u32::from_be_bytes([request[12], request[13], request[14], request[15]])
}

#[test]
fn test_shared_socket_routes_both_protocols() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut engine = engine_with_torrent(&dir);
    let (mut task, net) = start_dht(&mut engine);

    let request = announce_request();
    task.udp_tracker().borrow_mut().add_request(request.clone());

    // Turn 1: the announce needs a connection id first
    let status = task.execute(engine.context_mut()).unwrap();
    assert_eq!(status, TaskStatus::Continue);
    let connects = sent_to(&net.take_sent(), TRACKER);
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0].len(), CONNECT_REQUEST_LEN);

    // Turn 2: a tracker connect reply and a DHT ping arrive together
    let connection_id = 0x0102_0304_0506_0708u64;
    let mut reply = Vec::new();
    reply.put_u32(0);
    reply.put_u32(transaction_id(&connects[0]));
    reply.put_u64(connection_id);
    net.deliver(reply, addr(TRACKER));
    let ping = DhtMessage::query(b"pg".to_vec(), NodeId::generate(), DhtQuery::Ping);
    net.deliver(ping.encode(), addr(PEER_NODE));

    task.execute(engine.context_mut()).unwrap();
    let sent = net.take_sent();

    let answers = sent_to(&sent, PEER_NODE);
    assert_eq!(answers.len(), 1);
    let answer = DhtMessage::parse(&answers[0], Instant::now()).unwrap();
    assert_eq!(answer.transaction_id, b"pg".to_vec());
    assert!(matches!(answer.body, DhtMessageBody::Response(_)));

    let announces = sent_to(&sent, TRACKER);
    assert_eq!(announces.len(), 1);
    assert_eq!(announces[0].len(), ANNOUNCE_REQUEST_LEN);
    assert_eq!(&announces[0][..8], &connection_id.to_be_bytes());
    assert_eq!(&announces[0][8..12], &1u32.to_be_bytes());

    // Turn 3: the announce reply completes the request
    let mut reply = Vec::new();
    reply.put_u32(1);
    reply.put_u32(transaction_id(&announces[0]));
    reply.put_u32(1800);
    reply.put_u32(2);
    reply.put_u32(5);
    reply.put_slice(&[10, 0, 0, 1, 0x1A, 0xE1]);
    net.deliver(reply, addr(TRACKER));

    task.execute(engine.context_mut()).unwrap();
    let outcome = request.borrow().outcome.clone().unwrap().unwrap();
    assert_eq!(outcome.interval, 1800);
    assert_eq!(outcome.seeders, 5);
    assert_eq!(outcome.peers, vec![addr("10.0.0.1:6881")]);
}

#[test]
fn test_finishes_without_downloads() {
    let dir = TempDir::new().unwrap();
    let mut engine = DownloadEngine::new(test_config(dir.path())).unwrap();
    let (mut task, _net) = start_dht(&mut engine);

    let status = task.execute(engine.context_mut()).unwrap();
    assert_eq!(status, TaskStatus::Finished);
}

#[test]
fn test_cooperative_halt_waits_for_watchers() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine_with_torrent(&dir);
    let (mut task, _net) = start_dht(&mut engine);

    let request = announce_request();
    task.udp_tracker().borrow_mut().add_request(request.clone());
    engine.request_halt(HaltReason::ShutdownSignal);

    let status = task.execute(engine.context_mut()).unwrap();
    assert_eq!(status, TaskStatus::Continue);

    task.udp_tracker().borrow_mut().decrease_watchers();
    let status = task.execute(engine.context_mut()).unwrap();
    assert_eq!(status, TaskStatus::Finished);
}

#[test]
fn test_force_halt_fails_outstanding_announces() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine_with_torrent(&dir);
    let (mut task, net) = start_dht(&mut engine);

    let request = announce_request();
    task.udp_tracker().borrow_mut().add_request(request.clone());
    task.execute(engine.context_mut()).unwrap();
    assert_eq!(sent_to(&net.take_sent(), TRACKER).len(), 1);

    engine.request_force_halt(HaltReason::ShutdownSignal);
    let status = task.execute(engine.context_mut()).unwrap();
    assert_eq!(status, TaskStatus::Finished);
    assert_eq!(
        request.borrow().outcome,
        Some(Err(UdpTrackerError::Shutdown))
    );
}

#[test]
fn test_send_failure_fails_announce() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine_with_torrent(&dir);
    let (mut task, net) = start_dht(&mut engine);
    net.set_fail_sends(true);

    let request = announce_request();
    task.udp_tracker().borrow_mut().add_request(request.clone());
    task.execute(engine.context_mut()).unwrap();

    assert_eq!(
        request.borrow().outcome,
        Some(Err(UdpTrackerError::Network))
    );
    assert!(!task.udp_tracker().borrow().has_pending());
}

#[test]
fn test_malformed_datagrams_are_dropped() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine_with_torrent(&dir);
    let (mut task, net) = start_dht(&mut engine);

    net.deliver(b"d1:q4:pinge".to_vec(), addr(PEER_NODE));
    net.deliver(vec![0, 0, 0, 1], addr(TRACKER));

    let status = task.execute(engine.context_mut()).unwrap();
    assert_eq!(status, TaskStatus::Continue);
    assert!(net.take_sent().is_empty());
}

#[test]
fn test_empty_datagram_ends_the_drain() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine_with_torrent(&dir);
    let (mut task, net) = start_dht(&mut engine);

    net.deliver(Vec::new(), addr(PEER_NODE));
    let ping = DhtMessage::query(b"pg".to_vec(), NodeId::generate(), DhtQuery::Ping);
    net.deliver(ping.encode(), addr(PEER_NODE));

    // The ping behind the empty read waits for the next turn
    task.execute(engine.context_mut()).unwrap();
    assert!(net.take_sent().is_empty());

    task.execute(engine.context_mut()).unwrap();
    let answers = sent_to(&net.take_sent(), PEER_NODE);
    assert_eq!(answers.len(), 1);
    let answer = DhtMessage::parse(&answers[0], Instant::now()).unwrap();
    assert_eq!(answer.transaction_id, b"pg".to_vec());
}
