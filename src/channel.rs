//! Control request channel over USB vendor setup requests.

use std::{
    fmt,
    io::Result,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::{task::JoinSet, time::Instant};

use crate::{
    is_service_request,
    pool::Pools,
    queue::{SystemTaskQueue, Task, TaskQueue},
    reply::{ServiceReply, Status},
    request::{ControlRequestHandler, RequestData, State, Storage},
    vendor::process_vendor_request,
    ChannelConfig, Direction, SetupRequest, UsbDriver, VendorRequestCallback, MIN_WLENGTH, RAW_VENDOR_REQUEST,
    SERVICE_CHECK, SERVICE_INIT, SERVICE_RECV, SERVICE_RESET, SERVICE_SEND,
};

/// Usage of the request and buffer pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of request slots.
    pub capacity: usize,
    /// Number of active requests.
    pub active: usize,
    /// Number of free request slots.
    pub free: usize,
    /// Number of free pre-allocated buffers.
    pub free_buffers: usize,
}

/// State shared between interrupt context and the background worker.
pub(crate) struct ChannelCore {
    config: ChannelConfig,
    /// Critical section standing in for masked interrupts.
    /// Held only for constant-time bookkeeping, never across allocation or handler code.
    pools: Mutex<Pools>,
    queue: Box<dyn TaskQueue>,
    handler: Arc<dyn ControlRequestHandler>,
}

/// Whether the data stage of a service request has the expected minimum length.
fn has_min_data_stage(req: &SetupRequest<'_>) -> bool {
    usize::from(req.length) >= MIN_WLENGTH && req.data.as_ref().is_some_and(|data| data.len() >= MIN_WLENGTH)
}

impl ChannelCore {
    fn pools(&self) -> MutexGuard<'_, Pools> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn handler(&self) -> Arc<dyn ControlRequestHandler> {
        self.handler.clone()
    }

    /// Takes a pool buffer if `size` fits into one.
    pub(crate) fn acquire_buffer(&self, size: usize) -> Option<Storage> {
        let mut pools = self.pools();
        if size > pools.buffer_size() {
            return None;
        }
        pools.acquire_buffer()
    }

    /// Returns pool buffers to the pool and frees other storage outside of the critical section.
    pub(crate) fn release_storage(&self, storage: Storage) {
        let heap = match storage {
            Storage::None => None,
            Storage::Heap(buf) => Some(buf),
            pooled => self.pools().release_storage(pooled),
        };
        drop(heap);
    }

    /// Moves a request record held by the worker back into its slot.
    ///
    /// The slot must be in state `from`; it transitions to state `to`.
    pub(crate) fn complete(&self, slot: usize, data: RequestData, from: State, to: State) {
        let mut pools = self.pools();
        let s = pools.slot_mut(slot);
        if s.id != data.id || s.state != from || s.data.is_some() {
            tracing::warn!("request {} is no longer held by the worker", data.id);
            let RequestData { request, reply, .. } = data;
            let request = pools.release_storage(request);
            let reply = pools.release_storage(reply);
            drop(pools);
            drop((request, reply));
            return;
        }

        tracing::debug!("request {} changed state from {from:?} to {to:?}", data.id);
        s.state = to;
        s.data = Some(data);
    }

    fn stats(&self) -> PoolStats {
        let pools = self.pools();
        PoolStats {
            capacity: pools.capacity(),
            active: pools.active_count(),
            free: pools.free_count(),
            free_buffers: pools.free_buffer_count(),
        }
    }

    /// Releases the next expired request, if expiry is enabled.
    ///
    /// The returned record must be dropped after the critical section has been left.
    fn reap_next(&self, pools: &mut Pools) -> Option<RequestData> {
        let timeout = self.config.request_timeout?;
        pools.reap_next(Instant::now(), timeout)
    }

    /// Entry point for every vendor-specific setup request.
    fn vendor_request(self: &Arc<Self>, req: &mut SetupRequest<'_>) -> u8 {
        #[cfg(feature = "trace-packets")]
        tracing::trace!("setup request: {req:?}");

        let ok = if is_service_request(req.request) {
            self.process_service_request(req)
        } else if req.request == RAW_VENDOR_REQUEST {
            process_vendor_request(&self.config, req)
        } else {
            tracing::debug!("unknown vendor request {:#x}", req.request);
            false
        };

        if ok {
            0
        } else {
            1
        }
    }

    fn process_service_request(self: &Arc<Self>, req: &mut SetupRequest<'_>) -> bool {
        let expected = if req.request == SERVICE_SEND { Direction::Out } else { Direction::In };
        if req.direction != expected {
            tracing::debug!("service request {:#x} with wrong direction {:?}", req.request, req.direction);
            return false;
        }

        match req.request {
            SERVICE_INIT => self.init(req),
            SERVICE_CHECK => self.check(req),
            SERVICE_SEND => self.send(req),
            SERVICE_RECV => self.recv(req),
            SERVICE_RESET => self.reset(req),
            other => {
                tracing::debug!("unknown service request {other:#x}");
                false
            }
        }
    }

    fn init(self: &Arc<Self>, req: &mut SetupRequest<'_>) -> bool {
        if !has_min_data_stage(req) {
            return false;
        }
        let request_size = usize::from(req.value);
        let request_type = req.index;

        let (reply, reaped) = {
            let mut pools = self.pools();
            self.open(&mut pools, request_type, request_size)
        };
        drop(reaped);

        if let Some(id) = reply.id() {
            tracing::debug!("opened request {id} of type {request_type} with {request_size} bytes payload");
        }
        reply.encode(req)
    }

    /// Opens a request, releasing an expired one if the pool is exhausted.
    ///
    /// Returns the reply and the record of a released request, which must be dropped
    /// after the critical section has been left.
    fn open(
        self: &Arc<Self>, pools: &mut Pools, request_type: u16, request_size: usize,
    ) -> (ServiceReply, Option<RequestData>) {
        let busy = ServiceReply::new().with_status(Status::Busy);

        let mut reaped = None;
        let slot = match pools.acquire_request() {
            Some(slot) => slot,
            None => {
                reaped = self.reap_next(pools);
                match reaped.as_ref().and_then(|_| pools.acquire_request()) {
                    Some(slot) => slot,
                    None => {
                        tracing::debug!("request pool exhausted");
                        return (busy, reaped);
                    }
                }
            }
        };

        let id = pools.next_id();
        let mut data = RequestData::new(id, request_type, request_size, Instant::now());

        let (state, status, data) = if request_size == 0 {
            match self.queue.enqueue(Task::process_request(self.clone(), slot, data)) {
                Ok(()) => (State::Pending, Status::Ok, None),
                Err(_) => {
                    pools.unacquire(slot);
                    return (busy, reaped);
                }
            }
        } else {
            let buf = if request_size <= pools.buffer_size() { pools.acquire_buffer() } else { None };
            match buf {
                Some(buf) => {
                    data.request = buf;
                    (State::Receiving, Status::Ok, Some(data))
                }
                None => match self.queue.enqueue(Task::alloc_request_buffer(self.clone(), slot, data)) {
                    Ok(()) => (State::Allocating, Status::Pending, None),
                    Err(_) => {
                        pools.unacquire(slot);
                        return (busy, reaped);
                    }
                },
            }
        };

        pools.activate(slot, id, state, data);
        (ServiceReply::new().with_status(status).with_id(id), reaped)
    }

    fn check(&self, req: &mut SetupRequest<'_>) -> bool {
        if !has_min_data_stage(req) {
            return false;
        }
        let id = req.index;

        let pools = self.pools();
        let reply = match pools.find(id) {
            None => ServiceReply::new().with_status(Status::NotFound),
            Some(slot) => {
                let s = pools.slot(slot);
                match (s.state, &s.data) {
                    (State::Allocating | State::Pending, _) => ServiceReply::new().with_status(Status::Pending),
                    (State::Receiving, _) => ServiceReply::new().with_status(Status::Ok),
                    (State::Done, Some(data)) => ServiceReply::new()
                        .with_status(Status::Ok)
                        .with_size(data.reply_size as u32)
                        .with_result(data.result),
                    (State::Done, None) => ServiceReply::new().with_status(Status::Ok),
                }
            }
        };
        drop(pools);

        reply.encode(req)
    }

    fn send(self: &Arc<Self>, req: &mut SetupRequest<'_>) -> bool {
        let id = req.index;
        let len = usize::from(req.length);
        // TODO: accept payloads above MIN_WLENGTH by handing the payload buffer to the driver
        // for a multi-packet data stage.
        if len > MIN_WLENGTH {
            return false;
        }
        let Some(src) = req.data() else { return false };

        let mut pools = self.pools();
        let Some(slot) = pools.find(id) else { return false };
        let s = pools.slot_mut(slot);
        if s.state != State::Receiving {
            return false;
        }
        let Some(data) = s.data.as_mut() else { return false };
        if data.request.is_none() || data.request_size != len {
            return false;
        }
        data.request_data_mut().copy_from_slice(src);

        let Some(data) = s.data.take() else { return false };
        match self.queue.enqueue(Task::process_request(self.clone(), slot, data)) {
            Ok(()) => {
                s.state = State::Pending;
                drop(pools);
                tracing::debug!("received {len} bytes payload for request {id}");
                true
            }
            Err(task) => {
                s.data = Some(task.into_data());
                false
            }
        }
    }

    fn recv(&self, req: &mut SetupRequest<'_>) -> bool {
        let id = req.index;
        let len = usize::from(req.length);
        if len > MIN_WLENGTH {
            return false;
        }

        let mut pools = self.pools();
        let Some(slot) = pools.find(id) else { return false };
        let s = pools.slot(slot);
        if s.state != State::Done {
            return false;
        }
        let Some(data) = s.data.as_ref() else { return false };
        let reply = data.reply_data();
        if reply.len() > len {
            return false;
        }
        let Some(dst) = req.data_mut() else { return false };
        if dst.len() < reply.len() {
            return false;
        }
        dst[..reply.len()].copy_from_slice(reply);
        // Bounded by `len`, which came from a `u16`.
        req.length = reply.len() as u16;

        let released = pools.release(slot);
        drop(pools);
        drop(released);

        tracing::debug!("sent reply of request {id} and released it");
        true
    }

    fn reset(&self, req: &mut SetupRequest<'_>) -> bool {
        if !has_min_data_stage(req) {
            return false;
        }
        tracing::debug!("reset of request {} is not supported", req.index);
        false
    }
}

/// Registered with the USB driver as vendor request callback.
struct Callback(Arc<ChannelCore>);

impl VendorRequestCallback for Callback {
    fn vendor_request(&self, req: &mut SetupRequest<'_>) -> u8 {
        self.0.vendor_request(req)
    }
}

/// Device-side USB control request channel.
///
/// Owns the request and buffer pools, serves the service requests issued by the host
/// and hands complete requests to a [`ControlRequestHandler`].
pub struct UsbControlRequestChannel {
    core: Arc<ChannelCore>,
    driver: Arc<dyn UsbDriver>,
    tasks: JoinSet<()>,
}

impl fmt::Debug for UsbControlRequestChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UsbControlRequestChannel").field("stats", &self.stats()).finish()
    }
}

impl UsbControlRequestChannel {
    /// Creates a channel and registers it as vendor request callback with the USB driver.
    ///
    /// Deferred work runs on a [`SystemTaskQueue`] worker.
    /// Must be called from within a Tokio runtime.
    ///
    /// Fails without registering the callback if the configuration is invalid
    /// or the pools cannot be allocated.
    pub fn new(
        config: ChannelConfig, handler: impl ControlRequestHandler, driver: Arc<dyn UsbDriver>,
    ) -> Result<Self> {
        config.validate()?;
        let mut tasks = JoinSet::new();
        let queue = SystemTaskQueue::new(config.queue_depth, &mut tasks);
        Self::build(config, handler, queue, driver, tasks)
    }

    /// Creates a channel executing deferred work on the provided task queue.
    pub fn with_task_queue(
        config: ChannelConfig, handler: impl ControlRequestHandler, queue: impl TaskQueue + 'static,
        driver: Arc<dyn UsbDriver>,
    ) -> Result<Self> {
        config.validate()?;
        Self::build(config, handler, queue, driver, JoinSet::new())
    }

    fn build(
        config: ChannelConfig, handler: impl ControlRequestHandler, queue: impl TaskQueue + 'static,
        driver: Arc<dyn UsbDriver>, tasks: JoinSet<()>,
    ) -> Result<Self> {
        let pools = match Pools::new(config.pool_size, config.buffer_count, config.buffer_size) {
            Ok(pools) => pools,
            Err(err) => {
                tracing::error!("unable to initialize the USB control request channel: {err}");
                return Err(err);
            }
        };

        let core = Arc::new(ChannelCore {
            config,
            pools: Mutex::new(pools),
            queue: Box::new(queue),
            handler: Arc::new(handler),
        });
        driver.set_vendor_request_callback(Some(Arc::new(Callback(core.clone()))));
        tracing::debug!("USB control request channel registered");

        Ok(Self { core, driver, tasks })
    }

    /// Processes a vendor-specific setup request.
    ///
    /// This is the function invoked through the registered callback.
    /// Returns 0 if the request has been handled and 1 if the transfer must be stalled.
    pub fn vendor_request(&self, req: &mut SetupRequest<'_>) -> u8 {
        self.core.vendor_request(req)
    }

    /// Usage of the request and buffer pools.
    pub fn stats(&self) -> PoolStats {
        self.core.stats()
    }

    /// Releases requests that waited on the host for longer than the configured timeout.
    ///
    /// Returns the number of released requests.
    pub fn reap_expired(&self) -> usize {
        let mut reaped = 0;
        loop {
            let released = {
                let mut pools = self.core.pools();
                self.core.reap_next(&mut pools)
            };
            match released {
                Some(data) => {
                    drop(data);
                    reaped += 1;
                }
                None => break reaped,
            }
        }
    }

    /// Configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.core.config
    }
}

impl Drop for UsbControlRequestChannel {
    fn drop(&mut self) {
        self.driver.set_vendor_request_callback(None);
        self.tasks.abort_all();
        tracing::debug!("USB control request channel unregistered");
    }
}
