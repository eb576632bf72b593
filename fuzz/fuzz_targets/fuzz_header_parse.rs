#![no_main]
#![forbid(unsafe_code)]
use libfuzzer_sys::fuzz_target;
use replybus::headers::{ReplyIndex, TotalReplies};

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = TotalReplies::parse(s);
        if let Some(index) = ReplyIndex::parse(s) {
            assert!(index.span() >= 1);
        }
    }
});
