#![no_main]
use libfuzzer_sys::fuzz_target;
use tandem_dl::torrent::udp_tracker::packet::parse_reply;

fuzz_target!(|data: &[u8]| {
    // parse_reply() should never panic on arbitrary datagrams
    let _ = parse_reply(data);
});
