#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use signal_protocol::codec::decode_frame;
use signal_protocol::envelope::Envelope;

fuzz_target!(|data: &[u8]| {
    let mut buf = BytesMut::from(data);

    // Frame and envelope decoding must only ever return Err on bad input.
    while let Ok(Some(payload)) = decode_frame(&mut buf) {
        let _ = Envelope::decode(&payload);
    }
});
