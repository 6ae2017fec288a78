#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, Once},
    time::Duration,
};
use tokio::time::{sleep, timeout};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ucrc::{
    Direction, RequestId, ServiceReply, SetupRequest, Status, Task, TaskQueue, UsbDriver, VendorRequestCallback,
    MIN_WLENGTH, SERVICE_CHECK, SERVICE_INIT, SERVICE_RECV, SERVICE_RESET, SERVICE_SEND,
};

pub fn init_log() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        tracing_subscriber::registry().with(fmt::layer()).with(EnvFilter::from_default_env()).init();
        tracing_log::LogTracer::init().unwrap();
    });
}

/// USB driver delivering setup requests issued by the test.
#[derive(Default)]
pub struct MockDriver {
    callback: Mutex<Option<Arc<dyn VendorRequestCallback>>>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_registered(&self) -> bool {
        self.callback.lock().unwrap().is_some()
    }

    /// Delivers a setup request like the USB interrupt would.
    pub fn setup(&self, req: &mut SetupRequest<'_>) -> u8 {
        let callback = self.callback.lock().unwrap().clone();
        match callback {
            Some(callback) => callback.vendor_request(req),
            None => 1,
        }
    }

    /// Issues a device-to-host service request with a full data stage and decodes the reply.
    pub fn service(&self, request: u8, value: u16, index: u16) -> Option<ServiceReply> {
        let mut buf = [0; MIN_WLENGTH];
        let mut req = SetupRequest::new(Direction::In, request, value, index, MIN_WLENGTH as u16).with_data(&mut buf);
        if self.setup(&mut req) != 0 {
            return None;
        }
        Some(ServiceReply::decode(&buf).expect("malformed service reply"))
    }

    pub fn init(&self, size: u16, request_type: u16) -> Option<ServiceReply> {
        self.service(SERVICE_INIT, size, request_type)
    }

    pub fn check(&self, id: RequestId) -> Option<ServiceReply> {
        self.service(SERVICE_CHECK, 0, id)
    }

    pub fn reset(&self, id: RequestId) -> bool {
        self.service(SERVICE_RESET, 0, id).is_some()
    }

    pub fn send(&self, id: RequestId, data: &[u8]) -> bool {
        let mut buf = data.to_vec();
        let mut req = SetupRequest::new(Direction::Out, SERVICE_SEND, 0, id, data.len() as u16).with_data(&mut buf);
        self.setup(&mut req) == 0
    }

    pub fn recv(&self, id: RequestId, max_size: u16) -> Option<Vec<u8>> {
        let mut buf = [0; MIN_WLENGTH];
        let mut req = SetupRequest::new(Direction::In, SERVICE_RECV, 0, id, max_size).with_data(&mut buf);
        if self.setup(&mut req) != 0 {
            return None;
        }
        let n = usize::from(req.length);
        Some(buf[..n].to_vec())
    }

    /// Opens a request and returns its id, asserting the expected status.
    pub fn open(&self, size: u16, status: Status) -> RequestId {
        let reply = self.init(size, 0).expect("INIT rejected");
        assert_eq!(reply.status(), status, "unexpected INIT status");
        let id = reply.id().expect("INIT reply without id");
        assert_ne!(id, ucrc::INVALID_REQUEST_ID);
        id
    }

    /// Polls until the request is ready for the host's next step.
    pub async fn wait_ready(&self, id: RequestId) -> ServiceReply {
        timeout(Duration::from_secs(5), async {
            loop {
                let reply = self.check(id).expect("CHECK rejected");
                match reply.status() {
                    Status::Ok => return reply,
                    Status::Pending => sleep(Duration::from_millis(1)).await,
                    other => panic!("unexpected CHECK status {other:?}"),
                }
            }
        })
        .await
        .expect("request did not become ready")
    }

    /// Polls until the request is done and returns the CHECK reply carrying size and result.
    pub async fn wait_done(&self, id: RequestId) -> ServiceReply {
        timeout(Duration::from_secs(5), async {
            loop {
                let reply = self.wait_ready(id).await;
                if reply.size().is_some() {
                    return reply;
                }
                sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("request did not complete")
    }
}

impl UsbDriver for MockDriver {
    fn set_vendor_request_callback(&self, callback: Option<Arc<dyn VendorRequestCallback>>) {
        *self.callback.lock().unwrap() = callback;
    }
}

/// Task queue run explicitly by the test.
#[derive(Default)]
pub struct ManualQueue {
    tasks: Mutex<VecDeque<Task>>,
    capacity: Option<usize>,
}

impl ManualQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self { tasks: Mutex::default(), capacity: Some(capacity) })
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Runs all queued tasks, returning how many ran.
    pub fn run_all(&self) -> usize {
        let mut n = 0;
        loop {
            let task = self.tasks.lock().unwrap().pop_front();
            let Some(task) = task else { break n };
            task.run();
            n += 1;
        }
    }
}

impl TaskQueue for ManualQueue {
    fn enqueue(&self, task: Task) -> Result<(), Task> {
        let mut tasks = self.tasks.lock().unwrap();
        if self.capacity.is_some_and(|capacity| tasks.len() >= capacity) {
            return Err(task);
        }
        tasks.push_back(task);
        Ok(())
    }
}
