//! DHT (BEP 5)
//!
//! A single-threaded DHT node: routing table, KRPC codec, outgoing
//! dispatcher, incoming receiver and background maintenance. The
//! [`DhtInteractionTask`] drives all of it and shares its socket with the
//! UDP tracker client.

pub mod connection;
pub mod dispatcher;
pub mod interaction;
pub mod message;
pub mod node;
pub mod receiver;
pub mod routing;
pub mod task_queue;
pub mod tracker;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tracing::info;

pub use connection::{DhtConnection, UdpDhtConnection};
pub use dispatcher::DhtMessageDispatcher;
pub use interaction::{classify_datagram, DatagramKind, DhtInteractionTask};
pub use message::{DhtMessage, DhtMessageBody, DhtQuery, DhtResponse};
pub use node::{DhtNode, NodeId};
pub use receiver::{DhtMessageReceiver, PeerAnnounceStorage};
pub use routing::RoutingTable;
pub use task_queue::{BootstrapTask, BucketRefreshTask, DhtTask, DhtTaskQueue};
pub use tracker::{DhtCallback, DhtMessageTracker};

use crate::engine::EngineContext;
use crate::error::Result;
use crate::torrent::udp_tracker::UdpTrackerClient;

/// Bind the configured DHT port and build the interaction task
pub fn setup(cx: &mut EngineContext) -> Result<DhtInteractionTask> {
    let connection = UdpDhtConnection::bind(cx.config().torrent.dht_listen_port)?;
    if let Some(addr) = connection.local_addr() {
        info!("DHT listening on {}", addr);
    }
    setup_with_connection(cx, Box::new(connection))
}

/// Build the interaction task over an existing transport
pub fn setup_with_connection(
    cx: &mut EngineContext,
    mut connection: Box<dyn DhtConnection>,
) -> Result<DhtInteractionTask> {
    let now = cx.now();
    let config = cx.config().torrent.clone();

    let our_id = NodeId::generate();
    let routing = Rc::new(RefCell::new(RoutingTable::new(our_id, now)));
    let tracker = Rc::new(RefCell::new(DhtMessageTracker::new()));
    let dispatcher = Rc::new(RefCell::new(DhtMessageDispatcher::new(
        our_id,
        tracker.clone(),
        Duration::from_secs(config.dht_message_timeout_secs),
    )));
    let receiver = DhtMessageReceiver::new(routing.clone(), tracker, dispatcher.clone(), now);

    let mut task_queue = DhtTaskQueue::new(routing, dispatcher.clone());
    task_queue.add_task(DhtTask::Bootstrap(BootstrapTask::new(
        config.dht_bootstrap_nodes.clone(),
    )));
    task_queue.add_task(DhtTask::BucketRefresh(BucketRefreshTask::new(
        Duration::from_secs(config.dht_bucket_refresh_secs),
        now,
    )));

    let udp_tracker = Rc::new(RefCell::new(UdpTrackerClient::from_config(&config)));
    cx.udp_tracker = Some(udp_tracker.clone());

    let cuid = cx.new_cuid();
    connection.register(cx.reactor_mut(), cuid)?;
    info!("DHT node {} ready", our_id);

    Ok(DhtInteractionTask::new(
        cuid,
        connection,
        receiver,
        dispatcher,
        task_queue,
        udp_tracker,
    ))
}
