//! Host-side USB control request client.
//!
//! To issue requests, use [`rusb`] to open the target device and then pass it to [`UcrcClient::new`].
//!
//! Some errors returned from this module have an inner error type of [`rusb::Error`].
//!

use rusb::{request_type, DeviceHandle, Direction, Recipient, RequestType, UsbContext};
use std::{
    fmt,
    io::{Error, ErrorKind, Result},
    sync::Arc,
    time::Duration,
};
use tokio::{task::spawn_blocking, time::sleep};

use crate::{
    RequestId, ResultCode, ServiceReply, Status, CTRL_REQUEST_DEVICE_ID, CTRL_REQUEST_SYSTEM_VERSION, MIN_WLENGTH,
    RAW_VENDOR_REQUEST, SERVICE_CHECK, SERVICE_INIT, SERVICE_RECV, SERVICE_SEND,
};

const IN_REQUEST: u8 = request_type(Direction::In, RequestType::Vendor, Recipient::Device);
const OUT_REQUEST: u8 = request_type(Direction::Out, RequestType::Vendor, Recipient::Device);

const TIMEOUT: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub(crate) fn to_io_err(error: rusb::Error) -> Error {
    let kind = match error {
        rusb::Error::Io => ErrorKind::ConnectionAborted,
        rusb::Error::InvalidParam => ErrorKind::InvalidInput,
        rusb::Error::Access => ErrorKind::PermissionDenied,
        rusb::Error::NoDevice => ErrorKind::NotFound,
        rusb::Error::NotFound => ErrorKind::NotFound,
        rusb::Error::Busy => ErrorKind::AddrInUse,
        rusb::Error::Timeout => ErrorKind::TimedOut,
        rusb::Error::Overflow => ErrorKind::OutOfMemory,
        rusb::Error::Pipe => ErrorKind::BrokenPipe,
        rusb::Error::Interrupted => ErrorKind::Interrupted,
        rusb::Error::NoMem => ErrorKind::OutOfMemory,
        rusb::Error::NotSupported => ErrorKind::Unsupported,
        rusb::Error::BadDescriptor => ErrorKind::InvalidInput,
        rusb::Error::Other => ErrorKind::Other,
    };

    Error::new(kind, error)
}

/// Number of times the payload of a request is sent before giving up.
const MAX_SEND_ATTEMPTS: usize = 10;

/// Next step of the host within the request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Device is busy with the request.
    Poll,
    /// Device waits for the payload.
    Send,
    /// Reply is ready.
    Receive,
}

/// Derives the next step from the latest INIT or CHECK reply.
///
/// A request that is ready but reports no reply size is still waiting for its payload,
/// also after a SEND whose data stage the device did not accept.
fn next_step(reply: &ServiceReply, payload_len: usize) -> Step {
    match (reply.status(), reply.size()) {
        (_, Some(_)) => Step::Receive,
        (Status::Ok, None) if payload_len > 0 => Step::Send,
        _ => Step::Poll,
    }
}

fn status_err(status: Status) -> Error {
    let kind = match status {
        Status::Busy => ErrorKind::ResourceBusy,
        Status::MemoryError => ErrorKind::OutOfMemory,
        Status::NotSupported => ErrorKind::Unsupported,
        Status::NotFound => ErrorKind::NotFound,
        Status::Ok | Status::Pending | Status::Error => ErrorKind::Other,
    };
    Error::new(kind, format!("device replied with status {status:?}"))
}

/// Reply to a completed control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Result reported by the device-side handler.
    pub result: ResultCode,
    /// Reply payload.
    pub data: Vec<u8>,
}

/// Client issuing control requests to a device.
pub struct UcrcClient<C: UsbContext> {
    hnd: Arc<DeviceHandle<C>>,
}

impl<C: UsbContext> fmt::Debug for UcrcClient<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let dev = self.hnd.device();
        f.debug_tuple("UcrcClient").field(&format_args!("{}-{}", dev.bus_number(), dev.address())).finish()
    }
}

impl<C: UsbContext + 'static> UcrcClient<C> {
    /// Creates a client for the opened device.
    pub fn new(hnd: Arc<DeviceHandle<C>>) -> Self {
        Self { hnd }
    }

    async fn read_control(&self, request: u8, value: u16, index: u16, length: usize) -> Result<Vec<u8>> {
        let hnd = self.hnd.clone();
        spawn_blocking(move || {
            let mut buf = vec![0; length];
            let n = hnd.read_control(IN_REQUEST, request, value, index, &mut buf, TIMEOUT)?;
            buf.truncate(n);
            Ok(buf)
        })
        .await?
        .map_err(to_io_err)
    }

    async fn write_control(&self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<()> {
        let hnd = self.hnd.clone();
        let data = data.to_vec();
        spawn_blocking(move || hnd.write_control(OUT_REQUEST, request, value, index, &data, TIMEOUT))
            .await?
            .map_err(to_io_err)?;
        Ok(())
    }

    async fn service_request(&self, request: u8, value: u16, index: u16) -> Result<ServiceReply> {
        let data = self.read_control(request, value, index, MIN_WLENGTH).await?;
        ServiceReply::decode(&data)
    }

    /// Opens a request of the given type with a payload of `size` bytes.
    ///
    /// Returns the reply carrying the request id on success.
    pub async fn init(&self, request_type: u16, size: u16) -> Result<ServiceReply> {
        tracing::debug!("opening request of type {request_type} with {size} bytes payload");
        self.service_request(SERVICE_INIT, size, request_type).await
    }

    /// Queries the state of a request.
    pub async fn check(&self, id: RequestId) -> Result<ServiceReply> {
        self.service_request(SERVICE_CHECK, 0, id).await
    }

    /// Sends the payload of a request.
    pub async fn send(&self, id: RequestId, data: &[u8]) -> Result<()> {
        if data.len() > MIN_WLENGTH {
            return Err(Error::new(ErrorKind::Unsupported, "payload too large"));
        }
        self.write_control(SERVICE_SEND, 0, id, data).await
    }

    /// Receives the reply of a request, releasing it on the device.
    pub async fn recv(&self, id: RequestId, max_size: usize) -> Result<Vec<u8>> {
        self.read_control(SERVICE_RECV, 0, id, max_size.min(MIN_WLENGTH)).await
    }

    /// Polls the request until the device reports it actionable.
    async fn wait(&self, id: RequestId) -> Result<ServiceReply> {
        loop {
            let reply = self.check(id).await?;
            match reply.status() {
                Status::Ok => return Ok(reply),
                Status::Pending => sleep(POLL_INTERVAL).await,
                other => return Err(status_err(other)),
            }
        }
    }

    /// Executes a complete request: opens it, sends the payload, waits for
    /// the device to process it and receives the reply.
    ///
    /// Returns an error of kind [`ErrorKind::ResourceBusy`] if the device has no free
    /// request slot; the caller should retry later.
    /// A payload the device keeps refusing fails with [`ErrorKind::TimedOut`].
    pub async fn request(&self, request_type: u16, payload: &[u8]) -> Result<Reply> {
        let size = u16::try_from(payload.len()).map_err(|_| Error::new(ErrorKind::InvalidInput, "payload too large"))?;
        let opened = self.init(request_type, size).await?;
        let id = match (opened.status(), opened.id()) {
            (Status::Ok | Status::Pending, Some(id)) => id,
            (status, _) => return Err(status_err(status)),
        };

        let mut sends = 0;
        let mut reply = opened;
        let done = loop {
            match next_step(&reply, payload.len()) {
                Step::Poll => sleep(POLL_INTERVAL).await,
                Step::Send if sends < MAX_SEND_ATTEMPTS => {
                    if sends > 0 {
                        tracing::debug!("payload of request {id} not accepted, sending again");
                        sleep(POLL_INTERVAL).await;
                    }
                    self.send(id, payload).await?;
                    sends += 1;
                }
                Step::Send => {
                    return Err(Error::new(ErrorKind::TimedOut, format!("payload of request {id} not accepted")))
                }
                Step::Receive => break reply,
            }
            reply = self.wait(id).await?;
        };

        let size = done.size().unwrap_or_default() as usize;
        let data = self.recv(id, size).await?;
        if data.len() != size {
            return Err(Error::new(ErrorKind::InvalidData, "reply size mismatch"));
        }

        Ok(Reply { result: done.result().unwrap_or_default(), data })
    }

    /// Reads the device identifier.
    pub async fn device_id(&self) -> Result<String> {
        let data = self.read_control(RAW_VENDOR_REQUEST, 0, CTRL_REQUEST_DEVICE_ID, MIN_WLENGTH).await?;
        String::from_utf8(data).map_err(|err| Error::new(ErrorKind::InvalidData, err))
    }

    /// Reads the system version string.
    pub async fn system_version(&self) -> Result<String> {
        let mut data = self.read_control(RAW_VENDOR_REQUEST, 0, CTRL_REQUEST_SYSTEM_VERSION, MIN_WLENGTH).await?;
        if data.last() == Some(&0) {
            data.pop();
        }
        String::from_utf8(data).map_err(|err| Error::new(ErrorKind::InvalidData, err))
    }
}
