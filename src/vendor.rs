//! Raw vendor requests.
//!
//! Stateless queries answered directly from the setup request,
//! without going through the request pool.

use crate::{ChannelConfig, Direction, SetupRequest, CTRL_REQUEST_DEVICE_ID, CTRL_REQUEST_SYSTEM_VERSION};

/// Processes a raw vendor request, `index` selecting the query.
pub(crate) fn process_vendor_request(config: &ChannelConfig, req: &mut SetupRequest<'_>) -> bool {
    if req.direction != Direction::In {
        tracing::debug!("unknown host-to-device vendor request {}", req.index);
        return false;
    }
    if req.length == 0 {
        return false;
    }
    let index = req.index;
    let Some(data) = req.data_mut() else { return false };

    let n = match index {
        CTRL_REQUEST_DEVICE_ID => {
            let id = &config.device_id;
            let n = id.len() * 2;
            if data.len() < n {
                return false;
            }
            if let Err(err) = hex::encode_to_slice(id, &mut data[..n]) {
                tracing::warn!("cannot encode device id: {err}");
                return false;
            }
            n
        }
        CTRL_REQUEST_SYSTEM_VERSION => {
            // Sent with trailing NUL.
            let version = config.system_version.as_bytes();
            let n = version.len() + 1;
            if data.len() < n {
                return false;
            }
            data[..version.len()].copy_from_slice(version);
            data[version.len()] = 0;
            n
        }
        other => {
            tracing::debug!("unknown vendor request {other}");
            return false;
        }
    };

    // Bounded by `length`, which is a `u16`.
    req.length = n as u16;
    true
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::RAW_VENDOR_REQUEST;

    fn config() -> ChannelConfig {
        ChannelConfig::default().with_device_id([0xe0u8, 0x0f, 0xce, 0x68]).with_system_version("1.2.3")
    }

    #[test]
    fn device_id_as_hex() {
        let mut buf = [0; 64];
        let mut req =
            SetupRequest::new(Direction::In, RAW_VENDOR_REQUEST, 0, CTRL_REQUEST_DEVICE_ID, 64).with_data(&mut buf);
        assert!(process_vendor_request(&config(), &mut req));
        assert_eq!(req.length, 8);
        assert_eq!(&buf[..8], b"e00fce68");
    }

    #[test]
    fn device_id_fills_offered_buffer_exactly() {
        let config = config().with_device_id([0xabu8; 16]);
        let mut buf = [0xff; 64];
        let mut req =
            SetupRequest::new(Direction::In, RAW_VENDOR_REQUEST, 0, CTRL_REQUEST_DEVICE_ID, 32).with_data(&mut buf);
        assert!(process_vendor_request(&config, &mut req));
        assert_eq!(req.length, 32);
        assert_eq!(&buf[..32], "ab".repeat(16).as_bytes());
        assert_eq!(buf[32], 0xff);

        let mut buf = [0; 64];
        let mut req = SetupRequest::new(Direction::In, RAW_VENDOR_REQUEST, 0, CTRL_REQUEST_DEVICE_ID, 64)
            .with_data(&mut buf);
        assert!(process_vendor_request(&self::config().with_device_id(Vec::<u8>::new()), &mut req));
        assert_eq!(req.length, 0);
    }

    #[test]
    fn device_id_length_checked() {
        let mut buf = [0; 64];
        let mut req =
            SetupRequest::new(Direction::In, RAW_VENDOR_REQUEST, 0, CTRL_REQUEST_DEVICE_ID, 7).with_data(&mut buf);
        assert!(!process_vendor_request(&config(), &mut req));
    }

    #[test]
    fn system_version_with_nul() {
        let mut buf = [0xff; 64];
        let mut req = SetupRequest::new(Direction::In, RAW_VENDOR_REQUEST, 0, CTRL_REQUEST_SYSTEM_VERSION, 64)
            .with_data(&mut buf);
        assert!(process_vendor_request(&config(), &mut req));
        assert_eq!(req.length, 6);
        assert_eq!(&buf[..6], b"1.2.3\0");

        let mut buf = [0; 64];
        let mut req = SetupRequest::new(Direction::In, RAW_VENDOR_REQUEST, 0, CTRL_REQUEST_SYSTEM_VERSION, 5)
            .with_data(&mut buf);
        assert!(!process_vendor_request(&config(), &mut req));
    }

    #[test]
    fn rejects_unknown_and_host_to_device() {
        let mut buf = [0; 64];
        let mut req = SetupRequest::new(Direction::In, RAW_VENDOR_REQUEST, 0, 99, 64).with_data(&mut buf);
        assert!(!process_vendor_request(&config(), &mut req));

        let mut buf = [0; 64];
        let mut req =
            SetupRequest::new(Direction::Out, RAW_VENDOR_REQUEST, 0, CTRL_REQUEST_DEVICE_ID, 64).with_data(&mut buf);
        assert!(!process_vendor_request(&config(), &mut req));

        let mut req = SetupRequest::new(Direction::In, RAW_VENDOR_REQUEST, 0, CTRL_REQUEST_DEVICE_ID, 64);
        assert!(!process_vendor_request(&config(), &mut req));
    }
}
