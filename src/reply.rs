//! Service reply encoding.

use bytes::{Buf, BufMut};
use std::io::{Error, ErrorKind, Result};

use crate::{request::ResultCode, RequestId, SetupRequest, INVALID_REQUEST_ID};

const FLAG_STATUS: u32 = 0x01;
const FLAG_ID: u32 = 0x02;
const FLAG_SIZE: u32 = 0x04;
const FLAG_RESULT: u32 = 0x08;

/// Status code of a service reply.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Operation succeeded or the request is ready for the next step.
    Ok = 0,
    /// Operation failed.
    Error = 1,
    /// The request is being processed.
    Pending = 2,
    /// No resources available, retry later.
    Busy = 3,
    /// Memory allocation failed.
    MemoryError = 4,
    /// Operation is not supported.
    NotSupported = 5,
    /// No active request with the given id.
    NotFound = 6,
}

impl Status {
    /// Converts a wire status code.
    pub const fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0 => Self::Ok,
            1 => Self::Error,
            2 => Self::Pending,
            3 => Self::Busy,
            4 => Self::MemoryError,
            5 => Self::NotSupported,
            6 => Self::NotFound,
            _ => return None,
        })
    }

    /// Wire status code.
    pub const fn code(self) -> u16 {
        self as u16
    }
}

/// Reply to a service request.
///
/// The status is always present. The request id, payload size and result code
/// are optional and only take space on the wire when set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceReply {
    flags: u32,
    status: Status,
    id: RequestId,
    size: u32,
    result: ResultCode,
}

impl Default for ServiceReply {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceReply {
    /// Creates a reply with status [`Status::Ok`] and no optional fields.
    pub const fn new() -> Self {
        Self { flags: FLAG_STATUS, status: Status::Ok, id: INVALID_REQUEST_ID, size: 0, result: ResultCode::NONE }
    }

    /// Sets the status.
    pub const fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// Sets the request id.
    pub const fn with_id(mut self, id: RequestId) -> Self {
        self.id = id;
        self.flags |= FLAG_ID;
        self
    }

    /// Sets the payload size.
    pub const fn with_size(mut self, size: u32) -> Self {
        self.size = size;
        self.flags |= FLAG_SIZE;
        self
    }

    /// Sets the result code.
    pub const fn with_result(mut self, result: ResultCode) -> Self {
        self.result = result;
        self.flags |= FLAG_RESULT;
        self
    }

    /// Status.
    pub const fn status(&self) -> Status {
        self.status
    }

    /// Request id, if present.
    pub const fn id(&self) -> Option<RequestId> {
        if self.flags & FLAG_ID != 0 {
            Some(self.id)
        } else {
            None
        }
    }

    /// Payload size, if present.
    pub const fn size(&self) -> Option<u32> {
        if self.flags & FLAG_SIZE != 0 {
            Some(self.size)
        } else {
            None
        }
    }

    /// Result code, if present.
    pub const fn result(&self) -> Option<ResultCode> {
        if self.flags & FLAG_RESULT != 0 {
            Some(self.result)
        } else {
            None
        }
    }

    /// Number of bytes the encoded reply occupies.
    pub const fn encoded_len(&self) -> usize {
        let mut len = 4 + 2;
        if self.flags & FLAG_ID != 0 {
            len += 2;
        }
        if self.flags & FLAG_SIZE != 0 {
            len += 4;
        }
        if self.flags & FLAG_RESULT != 0 {
            len += 4;
        }
        len
    }

    /// Encodes the reply into `buf`.
    ///
    /// Returns the number of bytes written or `None` if `buf` is too small.
    pub fn encode_into(&self, buf: &mut [u8]) -> Option<usize> {
        let len = self.encoded_len();
        if buf.len() < len {
            return None;
        }

        let mut w = &mut buf[..len];
        w.put_u32_le(self.flags);
        w.put_u16_le(self.status.code());
        if self.flags & FLAG_ID != 0 {
            w.put_u16_le(self.id);
        }
        if self.flags & FLAG_SIZE != 0 {
            w.put_u32_le(self.size);
        }
        if self.flags & FLAG_RESULT != 0 {
            w.put_i32_le(self.result.code());
        }

        Some(len)
    }

    /// Encodes the reply into the data stage of a setup request.
    ///
    /// Returns `false` if the request has no data stage buffer or it is too small,
    /// in which case the transfer must be rejected.
    pub fn encode(&self, req: &mut SetupRequest<'_>) -> bool {
        match req.data_mut() {
            Some(data) => self.encode_into(data).is_some(),
            None => false,
        }
    }

    /// Decodes a reply.
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        fn truncated() -> Error {
            Error::new(ErrorKind::InvalidData, "service reply truncated")
        }

        if data.remaining() < 6 {
            return Err(truncated());
        }
        let flags = data.get_u32_le();
        let code = data.get_u16_le();
        let status = Status::from_code(code)
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, format!("unknown status code {code}")))?;

        let mut reply = Self::new().with_status(status);
        if flags & FLAG_ID != 0 {
            if data.remaining() < 2 {
                return Err(truncated());
            }
            reply = reply.with_id(data.get_u16_le());
        }
        if flags & FLAG_SIZE != 0 {
            if data.remaining() < 4 {
                return Err(truncated());
            }
            reply = reply.with_size(data.get_u32_le());
        }
        if flags & FLAG_RESULT != 0 {
            if data.remaining() < 4 {
                return Err(truncated());
            }
            reply = reply.with_result(ResultCode(data.get_i32_le()));
        }

        Ok(reply)
    }
}
