//! Device-side USB gadget driver.
//!
//! Delivers the vendor-specific setup requests arriving on the control endpoint of a
//! USB gadget function to the registered [`VendorRequestCallback`], for example a
//! [`UsbControlRequestChannel`](crate::UsbControlRequestChannel).

use std::{
    fmt,
    io::{Error, ErrorKind, Result},
    sync::{Arc, Mutex, PoisonError},
};
use tokio::task::JoinSet;
use usb_gadget::function::{
    custom::{Custom, Event, Interface},
    Handle,
};

use crate::{Class, Direction, SetupRequest, UsbDriver, VendorRequestCallback, MIN_WLENGTH};

const REQUEST_TYPE_MASK: u8 = 0x60;
const REQUEST_TYPE_VENDOR: u8 = 0x40;

/// Vendor request callback registered with a [`UcrcFunction`].
#[derive(Default)]
struct GadgetDriver {
    callback: Mutex<Option<Arc<dyn VendorRequestCallback>>>,
}

impl GadgetDriver {
    fn dispatch(&self, req: &mut SetupRequest<'_>) -> bool {
        let callback = self.callback.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match callback {
            Some(callback) => callback.vendor_request(req) == 0,
            None => {
                tracing::debug!("no vendor request callback registered");
                false
            }
        }
    }
}

impl UsbDriver for GadgetDriver {
    fn set_vendor_request_callback(&self, callback: Option<Arc<dyn VendorRequestCallback>>) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = callback;
    }
}

/// USB control request device-side function.
///
/// The function has no endpoints besides the control endpoint.
pub struct UcrcFunction {
    class: Class,
    name: String,
    task: JoinSet<Result<()>>,
    driver: Arc<GadgetDriver>,
}

impl fmt::Debug for UcrcFunction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UcrcFunction").field("class", &self.class).field("name", &self.name).finish()
    }
}

impl UcrcFunction {
    /// Creates a new USB control request function with the specified interface class
    /// and interface name.
    pub fn new(class: Class, name: impl AsRef<str>) -> (Self, Handle) {
        let name = name.as_ref();

        let (ep0, handle) = Custom::builder().with_interface(Interface::new(class.into(), name)).build();
        let driver = Arc::new(GadgetDriver::default());

        let mut task = JoinSet::new();
        task.spawn(Self::task(ep0, driver.clone()));

        (Self { class, name: name.to_string(), task, driver }, handle)
    }

    /// USB driver to register a [`UsbControlRequestChannel`](crate::UsbControlRequestChannel) with.
    pub fn driver(&self) -> Arc<dyn UsbDriver> {
        self.driver.clone()
    }

    /// Waits until the function has been unbound or has failed.
    pub async fn wait(&mut self) -> Result<()> {
        match self.task.join_next().await {
            Some(Ok(res)) => res,
            Some(Err(err)) => Err(err.into()),
            None => Err(Error::new(ErrorKind::BrokenPipe, "the USB function has terminated")),
        }
    }

    async fn task(mut ep0: Custom, driver: Arc<GadgetDriver>) -> Result<()> {
        ep0.status().bound().await?;
        tracing::debug!("function bound");

        loop {
            let status = ep0.status();

            let event_task = async {
                ep0.wait_event().await?;
                match ep0.event()? {
                    Event::Enable => tracing::debug!("function enabled"),
                    Event::Disable => tracing::debug!("function disabled"),
                    Event::SetupHostToDevice(req) => {
                        let ctrl_req = req.ctrl_req();
                        let (request_type, request, value, index, length) =
                            (ctrl_req.request_type, ctrl_req.request, ctrl_req.value, ctrl_req.index, ctrl_req.length);
                        #[cfg(feature = "trace-packets")]
                        tracing::trace!("incoming control request: {ctrl_req:?}");

                        if request_type & REQUEST_TYPE_MASK != REQUEST_TYPE_VENDOR
                            || usize::from(length) > MIN_WLENGTH
                        {
                            tracing::debug!("stalling control request {request:#x}");
                            req.halt()?;
                        } else {
                            let mut data = req.recv_all()?;
                            let mut setup =
                                SetupRequest::new(Direction::Out, request, value, index, length).with_data(&mut data);
                            if !driver.dispatch(&mut setup) {
                                tracing::warn!("control request {request:#x} rejected after its data stage");
                            }
                        }
                    }
                    Event::SetupDeviceToHost(req) => {
                        let ctrl_req = req.ctrl_req();
                        let (request_type, request, value, index, length) =
                            (ctrl_req.request_type, ctrl_req.request, ctrl_req.value, ctrl_req.index, ctrl_req.length);
                        #[cfg(feature = "trace-packets")]
                        tracing::trace!("outgoing control request: {ctrl_req:?}");

                        let mut buf = [0; MIN_WLENGTH];
                        let sent = if request_type & REQUEST_TYPE_MASK != REQUEST_TYPE_VENDOR {
                            None
                        } else {
                            let mut setup = SetupRequest::new(Direction::In, request, value, index, length);
                            if usize::from(length) <= MIN_WLENGTH {
                                setup = setup.with_data(&mut buf);
                            }
                            driver.dispatch(&mut setup).then(|| usize::from(setup.length).min(MIN_WLENGTH))
                        };

                        match sent {
                            Some(n) => {
                                if let Err(err) = req.send(&buf[..n]) {
                                    tracing::warn!("control reply send error: {err}");
                                }
                            }
                            None => {
                                tracing::debug!("stalling control request {request:#x}");
                                req.halt()?;
                            }
                        }
                    }
                    _ => (),
                }

                Ok::<_, Error>(())
            };

            tokio::select! {
                () = status.unbound() => {
                    tracing::debug!("function unbound");
                    break;
                }
                res = event_task => res?,
            }
        }

        Ok(())
    }
}
