//! USB control request library
//!
//! Multiplexes asynchronous control requests of arbitrary size over the small, synchronous
//! data stage of USB vendor-specific setup transfers.
//!
//! The device side is a [`UsbControlRequestChannel`]: a fixed pool of request and buffer slots
//! driven by five service requests issued by the host:
//!
//! * `INIT` opens a request and reserves storage for its payload,
//! * `CHECK` polls the state of a request,
//! * `SEND` transfers the payload to the device,
//! * `RECV` fetches the reply and releases the request,
//! * `RESET` is reserved for aborting a request.
//!
//! Requests are executed off the interrupt path by a [`ControlRequestHandler`].

mod channel;
mod config;
mod pool;
mod queue;
mod reply;
mod request;
mod usb;
mod vendor;

#[cfg(feature = "device")]
pub mod device;

#[cfg(feature = "host")]
pub mod host;

pub use channel::{PoolStats, UsbControlRequestChannel};
pub use config::ChannelConfig;
pub use queue::{SystemTaskQueue, Task, TaskQueue};
pub use reply::{ServiceReply, Status};
pub use request::{ControlRequest, ControlRequestHandler, RequestId, ResultCode, State, INVALID_REQUEST_ID};
pub use usb::{Direction, SetupRequest, UsbDriver, VendorRequestCallback};

/// Service request: open a new request.
pub const SERVICE_INIT: u8 = 0x01;
/// Service request: query the state of a request.
pub const SERVICE_CHECK: u8 = 0x02;
/// Service request: send request payload to the device.
pub const SERVICE_SEND: u8 = 0x03;
/// Service request: receive the reply from the device.
pub const SERVICE_RECV: u8 = 0x04;
/// Service request: abort a request.
pub const SERVICE_RESET: u8 = 0x05;

/// Request identifier of a raw vendor request (ASCII `'P'`).
pub const RAW_VENDOR_REQUEST: u8 = 0x50;

/// Raw vendor query returning the device identifier as hex string.
pub const CTRL_REQUEST_DEVICE_ID: u16 = 20;
/// Raw vendor query returning the firmware version string.
pub const CTRL_REQUEST_SYSTEM_VERSION: u16 = 30;

/// Minimum length of the data stage of a service request.
///
/// This is also the largest payload or reply moved by a single `SEND` or `RECV`.
pub const MIN_WLENGTH: usize = 64;

/// Maximum length of the device identifier in bytes.
pub const DEVICE_ID_SIZE: usize = 16;

/// Whether the request identifier falls into the range reserved for service requests.
pub(crate) const fn is_service_request(request: u8) -> bool {
    matches!(request, 0x01..=0x0f)
}

/// USB interface class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Class {
    /// Class code.
    pub class: u8,
    /// Subclass code.
    pub sub_class: u8,
    /// Protocol code.
    pub protocol: u8,
}

impl Class {
    /// Vendor specific class code.
    pub const VENDOR_SPECIFIC: u8 = 0xff;

    /// Creates a new USB device or interface class.
    pub const fn new(class: u8, sub_class: u8, protocol: u8) -> Self {
        Self { class, sub_class, protocol }
    }

    /// Creates a new USB device or interface class with vendor-specific class code.
    pub const fn vendor_specific(sub_class: u8, protocol: u8) -> Self {
        Self::new(Self::VENDOR_SPECIFIC, sub_class, protocol)
    }
}

#[cfg(feature = "device")]
impl From<Class> for usb_gadget::Class {
    fn from(Class { class, sub_class, protocol }: Class) -> Self {
        usb_gadget::Class { class, sub_class, protocol }
    }
}
