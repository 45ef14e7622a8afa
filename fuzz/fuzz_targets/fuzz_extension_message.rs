#![no_main]
use std::cell::RefCell;
use std::rc::Rc;

use libfuzzer_sys::fuzz_target;
use tandem_dl::group::context::DownloadContext;
use tandem_dl::torrent::{DefaultExtensionMessageFactory, ExtensionRegistry, Peer, PeerStorage};

fuzz_target!(|data: &[u8]| {
    // create_message() should return Ok or Err for any payload, never panic
    let peer = Peer::new("127.0.0.1:6881".parse().unwrap()).into_handle();
    let ctx = DownloadContext::for_metadata([0u8; 20], None).into_handle();
    let factory = DefaultExtensionMessageFactory::new(
        peer,
        ctx,
        Rc::new(ExtensionRegistry::with_defaults()),
        Rc::new(RefCell::new(PeerStorage::new())),
    );
    let _ = factory.create_message(data);
});
