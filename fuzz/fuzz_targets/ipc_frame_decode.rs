//! Fuzz harness for operator frame decoding.
//!
//! Feeds arbitrary bytes to `decode_request`, which must never panic, must
//! never report consuming more bytes than it was given, and must refuse
//! oversized length prefixes before looking at the body.

#![no_main]
use adnode_core::ipc::{
    FRAME_HEADER_LEN, IpcError, MAX_FRAME_SIZE, decode_request, frame_message, parse_frame_length,
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    match decode_request(data) {
        Ok(Some((request, consumed))) => {
            assert!(consumed <= data.len());
            assert!(consumed >= FRAME_HEADER_LEN);

            // A decoded request re-encodes to a frame that decodes to itself.
            let body = serde_json::to_vec(&request).unwrap();
            let framed = frame_message(&body).unwrap();
            let (again, used) = decode_request(&framed).unwrap().unwrap();
            assert_eq!(again, request);
            assert_eq!(used, framed.len());
        },
        Ok(None) => {
            if let Some(len) = parse_frame_length(data) {
                assert!(data.len() < FRAME_HEADER_LEN + len);
            }
        },
        Err(IpcError::FrameTooLarge(len)) => assert!(len > MAX_FRAME_SIZE),
        Err(_) => {},
    }
});
