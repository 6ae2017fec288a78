//! Boundary to the USB peripheral driver.

use std::{fmt, sync::Arc};

/// Direction of the data stage of a setup transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host to device.
    Out,
    /// Device to host.
    In,
}

/// Vendor-specific setup request as delivered by the USB driver.
///
/// For device-to-host requests `data` is the buffer to fill with up to `length` bytes and
/// `length` may be lowered to report how many bytes were actually written.
/// For host-to-device requests `data` holds the `length` bytes received from the host.
pub struct SetupRequest<'a> {
    /// Data stage direction.
    pub direction: Direction,
    /// Request identifier (`bRequest`).
    pub request: u8,
    /// Request value (`wValue`).
    pub value: u16,
    /// Request index (`wIndex`).
    pub index: u16,
    /// Length of the data stage (`wLength`).
    pub length: u16,
    /// Data stage buffer, if the driver provided one.
    pub data: Option<&'a mut [u8]>,
}

impl fmt::Debug for SetupRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SetupRequest")
            .field("direction", &self.direction)
            .field("request", &self.request)
            .field("value", &self.value)
            .field("index", &self.index)
            .field("length", &self.length)
            .field("data", &self.data.as_ref().map(|data| data.len()))
            .finish()
    }
}

impl<'a> SetupRequest<'a> {
    /// Creates a setup request without a data stage buffer.
    pub fn new(direction: Direction, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self { direction, request, value, index, length, data: None }
    }

    /// Attaches the data stage buffer.
    pub fn with_data(mut self, data: &'a mut [u8]) -> Self {
        self.data = Some(data);
        self
    }

    /// The first `length` bytes of the data stage, if the buffer holds that many.
    pub(crate) fn data(&self) -> Option<&[u8]> {
        let len = usize::from(self.length);
        self.data.as_deref().and_then(|data| data.get(..len))
    }

    /// Writable data stage, limited to `length` bytes.
    pub(crate) fn data_mut(&mut self) -> Option<&mut [u8]> {
        let len = usize::from(self.length);
        self.data.as_deref_mut().map(|data| {
            let n = len.min(data.len());
            &mut data[..n]
        })
    }
}

/// Handles vendor-specific setup requests.
pub trait VendorRequestCallback: Send + Sync {
    /// Processes a setup request.
    ///
    /// Called from interrupt context; must neither block nor allocate.
    /// Returns 0 if the request has been handled and 1 otherwise, in which case
    /// the driver stalls the control transfer.
    fn vendor_request(&self, req: &mut SetupRequest<'_>) -> u8;
}

/// USB peripheral driver delivering vendor-specific setup requests.
pub trait UsbDriver: Send + Sync {
    /// Registers or, when `None`, unregisters the vendor request callback.
    fn set_vendor_request_callback(&self, callback: Option<Arc<dyn VendorRequestCallback>>);
}
