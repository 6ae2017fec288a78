//! Device-side example.

use std::time::Duration;
use tokio::time::sleep;
use usb_gadget::{default_udc, Config, Gadget, Id, Strings};

use ucrc::{device::UcrcFunction, ChannelConfig, Class, ControlRequest, ResultCode, UsbControlRequestChannel};

mod common;
use common::*;

const DEVICE_CLASS: Class = Class::vendor_specific(0xff, 0);

fn handle(mut req: ControlRequest) {
    let reply = match req.request_type() {
        ECHO | REVERSE => expected_reply(req.request_type(), req.request_data()),
        other => {
            println!("Unknown request type {other}");
            req.set_result(ResultCode::NOT_SUPPORTED);
            return;
        }
    };
    req.free_request_data();

    match req.alloc_reply_data(reply.len()) {
        Ok(buf) => {
            buf.copy_from_slice(&reply);
            req.set_result(ResultCode::NONE);
        }
        Err(_) => req.set_result(ResultCode::NO_MEMORY),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_log();

    usb_gadget::remove_all().expect("cannot remove all USB gadgets");
    sleep(Duration::from_secs(1)).await;

    println!("Creating UCRC function...");
    let (mut function, hnd) = UcrcFunction::new(CLASS, NAME);

    println!("Creating control request channel...");
    let config = ChannelConfig::default()
        .with_pool_size(8)
        .with_buffers(4, 64)
        .with_device_id(DEVICE_ID)
        .with_system_version(SYSTEM_VERSION)
        .with_request_timeout(Duration::from_secs(30));
    let channel = UsbControlRequestChannel::new(config, handle, function.driver()).expect("cannot create channel");

    println!("Registering gadget...");
    let udc = default_udc().expect("cannot get UDC");
    let gadget = Gadget::new(DEVICE_CLASS.into(), Id::new(VID, PID), Strings::new("ucrc", "demo", "0"))
        .with_config(Config::new("config").with_function(hnd));
    let reg = gadget.bind(&udc).expect("cannot bind to UDC");
    assert!(reg.is_attached());

    println!("Serving requests...");
    tokio::select! {
        res = function.wait() => println!("Function terminated: {res:?}"),
        () = async {
            loop {
                sleep(Duration::from_secs(10)).await;
                let reaped = channel.reap_expired();
                println!("Pool usage: {:?}, released {reaped} expired requests", channel.stats());
            }
        } => (),
    }

    drop(channel);
    reg.remove().expect("cannot remove gadget");
    println!("Device done");
}
