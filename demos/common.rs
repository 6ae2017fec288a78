#![allow(dead_code)]

use rand::prelude::*;
use rand_xoshiro::Xoshiro128StarStar;
use std::sync::Once;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ucrc::{Class, MIN_WLENGTH};

pub const VID: u16 = 4;
pub const PID: u16 = 5;

pub const CLASS: Class = Class::vendor_specific(22, 4);
pub const NAME: &str = "ucrc-demo";
pub const DEVICE_ID: [u8; 8] = [0xde, 0xad, 0xbe, 0xef, 0x00, 0x01, 0x02, 0x03];
pub const SYSTEM_VERSION: &str = "1.0.0-demo";

/// Request type answered by the device with the payload.
pub const ECHO: u16 = 1;
/// Request type answered by the device with the reversed payload.
pub const REVERSE: u16 = 2;

pub const SEED: u64 = 12523;
pub const TEST_REQUESTS: usize = 1_000;

pub fn init_log() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        tracing_subscriber::registry().with(fmt::layer()).with(EnvFilter::from_default_env()).init();
        tracing_log::LogTracer::init().unwrap();
    });
}

pub struct TestData {
    rng: Xoshiro128StarStar,
}

impl TestData {
    pub fn new(seed: u64) -> Self {
        Self { rng: Xoshiro128StarStar::seed_from_u64(seed) }
    }

    /// Generates a request type and a payload fitting a single data stage.
    pub fn generate(&mut self) -> (u16, Vec<u8>) {
        let request_type = if self.rng.random_bool(0.5) { ECHO } else { REVERSE };
        let len = self.rng.random_range(0..=MIN_WLENGTH);
        let mut data = vec![0; len];
        self.rng.fill_bytes(&mut data);
        (request_type, data)
    }
}

/// Expected reply of the device to a request.
pub fn expected_reply(request_type: u16, payload: &[u8]) -> Vec<u8> {
    let mut reply = payload.to_vec();
    if request_type == REVERSE {
        reply.reverse();
    }
    reply
}
