//! Channel configuration.

use std::{
    io::{Error, ErrorKind, Result},
    time::Duration,
};

use crate::{request::RequestId, DEVICE_ID_SIZE};

/// Configuration of a [`UsbControlRequestChannel`](crate::UsbControlRequestChannel).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Maximum number of concurrently active requests.
    pub pool_size: usize,
    /// Number of pre-allocated payload buffers.
    pub buffer_count: usize,
    /// Size of each pre-allocated payload buffer.
    pub buffer_size: usize,
    /// Maximum number of queued deferred tasks.
    pub queue_depth: usize,
    /// Age after which requests waiting on the host are released.
    ///
    /// The age counts from the `INIT` that opened the request, so a request whose handler
    /// ran longer than the timeout may be released as soon as it is done.
    /// Disabled by default, so that an abandoned request holds its slot
    /// until the host receives its reply.
    pub request_timeout: Option<Duration>,
    /// Device identifier reported by the raw device id query.
    pub device_id: Vec<u8>,
    /// Version string reported by the raw system version query.
    pub system_version: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            buffer_count: 2,
            buffer_size: 64,
            queue_depth: 8,
            request_timeout: None,
            device_id: Vec::new(),
            system_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ChannelConfig {
    /// Sets the maximum number of concurrently active requests.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Sets the number and size of pre-allocated payload buffers.
    pub fn with_buffers(mut self, buffer_count: usize, buffer_size: usize) -> Self {
        self.buffer_count = buffer_count;
        self.buffer_size = buffer_size;
        self
    }

    /// Sets the maximum number of queued deferred tasks.
    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth;
        self
    }

    /// Enables releasing of requests waiting on the host once `timeout` has passed since their `INIT`.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Sets the device identifier.
    pub fn with_device_id(mut self, device_id: impl Into<Vec<u8>>) -> Self {
        self.device_id = device_id.into();
        self
    }

    /// Sets the system version string.
    pub fn with_system_version(mut self, version: impl AsRef<str>) -> Self {
        self.system_version = version.as_ref().to_string();
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.pool_size == 0 || self.pool_size >= usize::from(RequestId::MAX) {
            return Err(Error::new(ErrorKind::InvalidInput, "request pool size out of range"));
        }
        if self.queue_depth == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "task queue depth must not be zero"));
        }
        if self.device_id.len() > DEVICE_ID_SIZE {
            return Err(Error::new(ErrorKind::InvalidInput, "device id too long"));
        }
        Ok(())
    }
}
