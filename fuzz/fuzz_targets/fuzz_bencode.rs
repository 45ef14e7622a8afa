#![no_main]
use libfuzzer_sys::fuzz_target;
use tandem_dl::torrent::BencodeValue;

fuzz_target!(|data: &[u8]| {
    // decode() should never panic on arbitrary input, and whatever it
    // accepts must re-encode to the same bytes
    if let Ok(value) = BencodeValue::decode(data) {
        assert_eq!(value.encode(), data);
    }
    let _ = BencodeValue::decode_prefix(data);
});
