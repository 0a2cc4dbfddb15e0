mod api;

pub use api::{EchoRequest, EchoResponse, MAX_ECHO_DELAY_MS, StatsResponse};
