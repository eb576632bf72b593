#![no_main]
#![forbid(unsafe_code)]
use libfuzzer_sys::fuzz_target;
use replybus::headers;
use replybus::{Envelope, Payload};

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes as a group container; malformed input must error, not panic
    let envelope = Envelope::new(Payload::Bytes(data.to_vec()))
        .with_header(headers::CORRELATION_ID, "fuzz")
        .with_header(headers::REPLY_GROUP, true);
    let _ = replybus::chunker::unpack(&envelope);

    if let Ok(range) = std::str::from_utf8(data.get(..8).unwrap_or(data)) {
        let ranged = envelope.with_header(headers::REPLY_INDEX, range);
        let _ = replybus::chunker::unpack(&ranged);
    }
});
