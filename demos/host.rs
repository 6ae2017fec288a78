//! Host-side example.

use std::{
    io::ErrorKind,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::time::sleep;

use ucrc::{host::UcrcClient, ResultCode};

mod common;
use common::*;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_log();

    let hnd = rusb::open_device_with_vid_pid(VID, PID).expect("device not found");
    println!("Using device: {:?}", hnd.device());
    let client = UcrcClient::new(Arc::new(hnd));

    let device_id = client.device_id().await.expect("cannot get device id");
    println!("Device id: {device_id}");
    let version = client.system_version().await.expect("cannot get system version");
    println!("System version: {version}");
    assert_eq!(version, SYSTEM_VERSION, "version mismatch");

    let mut testdata = TestData::new(SEED);
    let start = Instant::now();
    let mut total = 0;

    println!("Sending requests...");
    for i in 0..TEST_REQUESTS {
        let (request_type, payload) = testdata.generate();

        let reply = loop {
            match client.request(request_type, &payload).await {
                Ok(reply) => break reply,
                Err(err) if err.kind() == ErrorKind::ResourceBusy => sleep(Duration::from_millis(10)).await,
                Err(err) => panic!("request {i} failed: {err}"),
            }
        };

        assert_eq!(reply.result, ResultCode::NONE, "request {i} failed on device");
        assert_eq!(reply.data, expected_reply(request_type, &payload), "reply mismatch");
        total += payload.len() + reply.data.len();
    }

    let elapsed = start.elapsed().as_secs_f32();
    println!(
        "Completed {TEST_REQUESTS} requests with {total} bytes in {elapsed:.1} s: {:.1} requests/s",
        TEST_REQUESTS as f32 / elapsed
    );
    println!("Host done");
}
