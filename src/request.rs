//! Control requests and their handler.

use bytes::{Bytes, BytesMut};
use std::{
    fmt,
    io::{Error, ErrorKind, Result},
    sync::Arc,
};
use tokio::time::Instant;

use crate::channel::ChannelCore;

/// Request handle assigned by the device.
pub type RequestId = u16;

/// Request id that never refers to a request.
pub const INVALID_REQUEST_ID: RequestId = 0;

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Waiting for a payload buffer to be allocated.
    Allocating,
    /// Waiting for the host to send the payload.
    Receiving,
    /// Being processed by the handler.
    Pending,
    /// Reply is ready to be received by the host.
    Done,
}

/// Outcome of a request as reported by the handler.
///
/// Zero means success, negative values are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResultCode(pub i32);

impl ResultCode {
    /// No error.
    pub const NONE: Self = Self(0);
    /// Unknown error.
    pub const UNKNOWN: Self = Self(-100);
    /// Operation not supported.
    pub const NOT_SUPPORTED: Self = Self(-120);
    /// Operation was aborted.
    pub const ABORTED: Self = Self(-150);
    /// Entity not found.
    pub const NOT_FOUND: Self = Self(-170);
    /// Data too large.
    pub const TOO_LARGE: Self = Self(-190);
    /// Memory allocation failed.
    pub const NO_MEMORY: Self = Self(-260);
    /// Invalid argument.
    pub const INVALID_ARGUMENT: Self = Self(-270);

    /// Wire value.
    pub const fn code(self) -> i32 {
        self.0
    }

    /// Whether this reports success.
    pub const fn is_ok(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            Self::NONE => "none",
            Self::UNKNOWN => "unknown error",
            Self::NOT_SUPPORTED => "not supported",
            Self::ABORTED => "aborted",
            Self::NOT_FOUND => "not found",
            Self::TOO_LARGE => "too large",
            Self::NO_MEMORY => "out of memory",
            Self::INVALID_ARGUMENT => "invalid argument",
            _ => return write!(f, "error {}", self.0),
        };
        f.write_str(name)
    }
}

impl From<ResultCode> for i32 {
    fn from(result: ResultCode) -> Self {
        result.0
    }
}

/// Backing storage of a request payload or reply.
#[derive(Debug, Default)]
pub(crate) enum Storage {
    #[default]
    None,
    /// Buffer taken from the pre-allocated pool.
    Pool { index: usize, buf: BytesMut },
    /// Individually allocated buffer.
    Heap(BytesMut),
}

impl Storage {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::None => &[],
            Self::Pool { buf, .. } | Self::Heap(buf) => buf,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Self::None => &mut [],
            Self::Pool { buf, .. } | Self::Heap(buf) => buf,
        }
    }
}

/// Allocates a zeroed buffer without aborting on allocation failure.
pub(crate) fn try_alloc(size: usize) -> Result<BytesMut> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(size).map_err(|_| Error::new(ErrorKind::OutOfMemory, "buffer allocation failed"))?;
    buf.resize(size, 0);
    Ok(BytesMut::from(Bytes::from(buf)))
}

/// Request record.
///
/// Lives in its pool slot while the interrupt path may access it and is moved
/// out of the slot for as long as the background worker or handler owns it.
#[derive(Debug)]
pub(crate) struct RequestData {
    pub id: RequestId,
    pub request_type: u16,
    pub request_size: usize,
    pub request: Storage,
    pub reply_size: usize,
    pub reply: Storage,
    pub result: ResultCode,
    pub created_at: Instant,
}

impl RequestData {
    pub fn new(id: RequestId, request_type: u16, request_size: usize, created_at: Instant) -> Self {
        Self {
            id,
            request_type,
            request_size,
            request: Storage::None,
            reply_size: 0,
            reply: Storage::None,
            result: ResultCode::NONE,
            created_at,
        }
    }

    pub fn request_data(&self) -> &[u8] {
        let data = self.request.as_slice();
        &data[..self.request_size.min(data.len())]
    }

    pub fn request_data_mut(&mut self) -> &mut [u8] {
        let size = self.request_size;
        let data = self.request.as_mut_slice();
        let n = size.min(data.len());
        &mut data[..n]
    }

    pub fn reply_data(&self) -> &[u8] {
        let data = self.reply.as_slice();
        &data[..self.reply_size.min(data.len())]
    }
}

/// Processes control requests.
///
/// Called on the background worker, never from interrupt context.
pub trait ControlRequestHandler: Send + Sync + 'static {
    /// Processes a request whose payload has been received completely.
    ///
    /// The handler takes ownership of the request and must eventually complete it by
    /// calling [`ControlRequest::set_result`], either directly or from another task.
    /// Long-running work should be moved off the worker, since it executes tasks one at a time.
    fn process_request(&self, req: ControlRequest);
}

impl<F> ControlRequestHandler for F
where
    F: Fn(ControlRequest) + Send + Sync + 'static,
{
    fn process_request(&self, req: ControlRequest) {
        self(req)
    }
}

/// A control request handed to the [`ControlRequestHandler`].
///
/// Dropping the request without calling [`set_result`](Self::set_result)
/// completes it with [`ResultCode::ABORTED`].
pub struct ControlRequest {
    core: Arc<ChannelCore>,
    slot: usize,
    data: Option<RequestData>,
}

impl fmt::Debug for ControlRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ControlRequest")
            .field("id", &self.id())
            .field("type", &self.request_type())
            .field("request_size", &self.request_size())
            .field("reply_size", &self.data().reply_size)
            .finish()
    }
}

impl ControlRequest {
    pub(crate) fn new(core: Arc<ChannelCore>, slot: usize, data: RequestData) -> Self {
        Self { core, slot, data: Some(data) }
    }

    fn data(&self) -> &RequestData {
        // Taken only by `set_result` and `drop`, both of which consume the request.
        self.data.as_ref().expect("request already completed")
    }

    fn data_mut(&mut self) -> &mut RequestData {
        self.data.as_mut().expect("request already completed")
    }

    /// Request id.
    pub fn id(&self) -> RequestId {
        self.data().id
    }

    /// Request type provided by the host.
    pub fn request_type(&self) -> u16 {
        self.data().request_type
    }

    /// Payload size declared by the host.
    pub fn request_size(&self) -> usize {
        self.data().request_size
    }

    /// Payload.
    ///
    /// Empty after [`free_request_data`](Self::free_request_data).
    pub fn request_data(&self) -> &[u8] {
        self.data().request_data()
    }

    /// Time the host opened the request.
    pub fn created_at(&self) -> Instant {
        self.data().created_at
    }

    /// Releases the payload storage early.
    pub fn free_request_data(&mut self) {
        let storage = std::mem::take(&mut self.data_mut().request);
        self.core.release_storage(storage);
    }

    /// Allocates storage for a reply of `size` bytes, replacing any previous reply.
    ///
    /// A pool buffer is used when the reply fits one and a buffer is free,
    /// otherwise the storage is allocated individually.
    pub fn alloc_reply_data(&mut self, size: usize) -> Result<&mut [u8]> {
        self.free_reply_data();

        let storage = if size == 0 {
            Storage::None
        } else {
            match self.core.acquire_buffer(size) {
                Some(storage) => storage,
                None => Storage::Heap(try_alloc(size)?),
            }
        };

        let data = self.data_mut();
        data.reply = storage;
        data.reply_size = size;
        let reply = data.reply.as_mut_slice();
        reply[..size].fill(0);
        Ok(&mut reply[..size])
    }

    /// Reply data allocated by [`alloc_reply_data`](Self::alloc_reply_data).
    pub fn reply_data(&self) -> &[u8] {
        self.data().reply_data()
    }

    /// Mutable reply data allocated by [`alloc_reply_data`](Self::alloc_reply_data).
    pub fn reply_data_mut(&mut self) -> &mut [u8] {
        let data = self.data_mut();
        let size = data.reply_size;
        let reply = data.reply.as_mut_slice();
        let n = size.min(reply.len());
        &mut reply[..n]
    }

    /// Releases the reply storage.
    pub fn free_reply_data(&mut self) {
        let data = self.data_mut();
        data.reply_size = 0;
        let storage = std::mem::take(&mut data.reply);
        self.core.release_storage(storage);
    }

    /// Completes the request with the given result.
    ///
    /// The request becomes ready for the host to receive its reply.
    pub fn set_result(mut self, result: ResultCode) {
        if let Some(mut data) = self.data.take() {
            data.result = result;
            self.core.complete(self.slot, data, State::Pending, State::Done);
        }
    }
}

impl Drop for ControlRequest {
    fn drop(&mut self) {
        if let Some(mut data) = self.data.take() {
            tracing::warn!("request {} dropped without result", data.id);
            data.result = ResultCode::ABORTED;
            self.core.complete(self.slot, data, State::Pending, State::Done);
        }
    }
}
