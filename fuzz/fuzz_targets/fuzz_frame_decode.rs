//! Fuzz target: the length-prefixed frame decoder.
//!
//! Arbitrary byte streams, in arbitrary chunkings, must never cause panics
//! or unbounded allocation. Framing errors are expected and fine.

#![no_main]

use libfuzzer_sys::fuzz_target;

use gaovm_proto::FrameDecoder;

fuzz_target!(|data: &[u8]| {
    // Feed the same bytes in two chunkings; both must behave identically
    // up to the first framing error.
    let mut whole = FrameDecoder::new();
    whole.push(data);
    while let Ok(Some(_)) = whole.next_frame() {}

    let mut split = FrameDecoder::new();
    for chunk in data.chunks(3) {
        split.push(chunk);
        while let Ok(Some(_)) = split.next_frame() {}
    }
});
