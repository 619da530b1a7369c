//! Per-device binding to a remote authenticator's FIDO GATT service.
//!
//! `Link` is the only type in this crate that touches the system bus
//! connection directly (through [`crate::gatt`]). Framer and Reassembler
//! are generic over anything implementing [`LinkIo`], so tests can drive
//! them with [`MockLink`] instead of a real adapter.

use std::sync::Arc;

use async_trait::async_trait;
use dbus::arg::OwnedFd;
use dbus::channel::MatchingReceiver;
use dbus::message::MatchRule;
use dbus::nonblock::SyncConnection;
use dbus::Path;
use std::os::unix::io::FromRawFd;
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use zeroize::Zeroize;

use crate::constants::{iface, uuids, CTAPBLE_MAX_FRAME_LEN, SERVICE_REVISION_FIDO2};
use crate::error::{BleTransportError, Result};
use crate::gatt;

/// The five object paths that make up an open Link, per spec §3.
#[derive(Debug, Clone)]
pub struct DevicePaths {
    pub dev: Path<'static>,
    pub service: Path<'static>,
    pub status: Path<'static>,
    pub control_point: Path<'static>,
    pub control_point_length: Path<'static>,
    pub service_revision: Path<'static>,
}

/// Byte-pipe capability Framer/Reassembler need. `Link` implements this
/// against real BlueZ GATT characteristics; [`MockLink`] implements it
/// in memory for tests.
#[async_trait]
pub trait LinkIo: Send {
    fn controlpoint_size(&self) -> u16;
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;
    /// `timeout_ms < 0` waits indefinitely, `0` polls, `> 0` is a wall-clock bound.
    async fn read(&mut self, buf: &mut [u8], timeout_ms: i64) -> Result<usize>;
}

/// The two ways BlueZ can deliver Status characteristic notifications.
enum NotifySource {
    /// File-descriptor acquired via `AcquireNotify`; one GATT notification
    /// arrives as one datagram-sized read.
    Fd(UnixStream),
    /// `StartNotify` + `PropertiesChanged` signal subscription, for
    /// daemons that don't support `AcquireNotify`.
    Signal(mpsc::UnboundedReceiver<Vec<u8>>),
}

pub struct Link {
    connection: Arc<SyncConnection>,
    paths: Option<DevicePaths>,
    controlpoint_size: u16,
    notify: Option<NotifySource>,
    scratch: Vec<u8>,
}

impl Link {
    /// Discovers and binds to the FIDO GATT service on `device_path`.
    ///
    /// `device_path` must begin with [`crate::constants::BLE_DEVICE_PREFIX`].
    pub async fn open(device_path: &str) -> Result<Self> {
        let bus_path = device_path
            .strip_prefix(crate::constants::BLE_DEVICE_PREFIX)
            .ok_or_else(|| {
                BleTransportError::InvalidArgument(format!(
                    "device path {device_path} does not start with {}",
                    crate::constants::BLE_DEVICE_PREFIX
                ))
            })?;
        let dev_path: Path<'static> = Path::new(bus_path.to_string())
            .map_err(|e| BleTransportError::InvalidArgument(format!("invalid object path: {e}")))?;

        let connection = gatt::system_bus().await?;

        Self::check_usable(&connection, &dev_path).await?;

        let service = Self::find_service(&connection, &dev_path).await?;
        let (status, control_point, control_point_length, service_revision) =
            Self::find_characteristics(&connection, &service).await?;

        let cp_len_bytes = gatt::read_value(&connection, &control_point_length).await?;
        if cp_len_bytes.len() < 2 {
            return Err(BleTransportError::DiscoveryFailed {
                path: control_point_length.to_string(),
                reason: format!("Control Point Length value too short ({} bytes)", cp_len_bytes.len()),
            });
        }
        let controlpoint_size =
            ((cp_len_bytes[0] as u16) << 8 | cp_len_bytes[1] as u16).min(CTAPBLE_MAX_FRAME_LEN as u16);

        let revision_bytes = gatt::read_value(&connection, &service_revision).await?;
        let revision = *revision_bytes
            .first()
            .ok_or_else(|| BleTransportError::DiscoveryFailed {
                path: service_revision.to_string(),
                reason: "Service Revision value empty".into(),
            })?;
        if revision & SERVICE_REVISION_FIDO2 == 0 {
            return Err(BleTransportError::RevisionUnsupported(revision));
        }
        gatt::write_value(&connection, &service_revision, &[SERVICE_REVISION_FIDO2]).await?;

        let notify = Self::bind_notify(&connection, &status).await?;

        log::info!(
            "opened BLE link to {dev_path} (controlpoint_size={controlpoint_size}, service={service})"
        );

        Ok(Self {
            connection,
            paths: Some(DevicePaths {
                dev: dev_path,
                service,
                status,
                control_point,
                control_point_length,
                service_revision,
            }),
            controlpoint_size,
            notify: Some(notify),
            scratch: vec![0u8; controlpoint_size as usize],
        })
    }

    async fn check_usable(connection: &SyncConnection, dev_path: &Path<'static>) -> Result<()> {
        let props = gatt::get_all(connection, dev_path, iface::DEVICE1).await?;
        let connected = gatt::prop_bool(&props, "Connected");
        let paired = gatt::prop_bool(&props, "Paired");
        let resolved = gatt::prop_bool(&props, "ServicesResolved");
        let advertises_fido = gatt::prop_uuids(&props)
            .iter()
            .any(|u| u == uuids::FIDO_SERVICE_UUID);

        if connected && paired && resolved && advertises_fido {
            Ok(())
        } else {
            Err(BleTransportError::UnusableDevice {
                path: dev_path.to_string(),
                reason: format!(
                    "connected={connected} paired={paired} services_resolved={resolved} fido_service={advertises_fido}"
                ),
            })
        }
    }

    async fn find_service(connection: &SyncConnection, dev_path: &Path<'static>) -> Result<Path<'static>> {
        let objects = gatt::managed_objects(connection).await?;
        let dev_path_str = dev_path.to_string();
        for (path, interfaces) in &objects {
            let Some(props) = interfaces.get(iface::GATT_SERVICE1) else { continue };
            let device_matches = gatt::prop_str(props, "Device")
                .map(|d| d == dev_path_str)
                .unwrap_or(false);
            let uuid_matches = gatt::prop_str(props, "UUID")
                .map(|u| u.eq_ignore_ascii_case(uuids::FIDO_SERVICE_UUID))
                .unwrap_or(false);
            if device_matches && uuid_matches {
                return Ok(path.clone());
            }
        }
        Err(BleTransportError::DiscoveryFailed {
            path: dev_path.to_string(),
            reason: "no GattService1 advertising the FIDO service UUID".into(),
        })
    }

    async fn find_characteristics(
        connection: &SyncConnection, service: &Path<'static>,
    ) -> Result<(Path<'static>, Path<'static>, Path<'static>, Path<'static>)> {
        let objects = gatt::managed_objects(connection).await?;
        let service_str = service.to_string();
        let mut status = None;
        let mut control_point = None;
        let mut control_point_length = None;
        let mut service_revision = None;

        for (path, interfaces) in &objects {
            let Some(props) = interfaces.get(iface::GATT_CHARACTERISTIC1) else { continue };
            let belongs = gatt::prop_str(props, "Service")
                .map(|s| s == service_str)
                .unwrap_or(false);
            if !belongs {
                continue;
            }
            match gatt::prop_str(props, "UUID").map(|u| u.to_ascii_lowercase()) {
                Some(u) if u == uuids::FIDO_STATUS_UUID => status = Some(path.clone()),
                Some(u) if u == uuids::FIDO_CONTROL_POINT_UUID => control_point = Some(path.clone()),
                Some(u) if u == uuids::FIDO_CONTROL_POINT_LENGTH_UUID => {
                    control_point_length = Some(path.clone())
                }
                Some(u) if u == uuids::FIDO_SERVICE_REVISION_UUID => service_revision = Some(path.clone()),
                _ => {}
            }
        }

        match (status, control_point, control_point_length, service_revision) {
            (Some(s), Some(c), Some(l), Some(r)) => Ok((s, c, l, r)),
            _ => Err(BleTransportError::DiscoveryFailed {
                path: service.to_string(),
                reason: "missing one or more of status/control_point/control_point_length/service_revision".into(),
            }),
        }
    }

    async fn bind_notify(connection: &SyncConnection, status: &Path<'static>) -> Result<NotifySource> {
        match gatt::acquire_notify(connection, status).await {
            Ok((fd, _mtu)) => {
                let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd.into_fd()) };
                std_stream
                    .set_nonblocking(true)
                    .map_err(|e| BleTransportError::IoError(e.to_string()))?;
                let stream = UnixStream::from_std(std_stream)
                    .map_err(|e| BleTransportError::IoError(e.to_string()))?;
                Ok(NotifySource::Fd(stream))
            }
            Err(e) => {
                log::debug!("AcquireNotify unavailable ({e}), falling back to StartNotify + signal subscription");
                gatt::start_notify(connection, status).await?;
                let (tx, rx) = mpsc::unbounded_channel();
                let rule = MatchRule::new_signal(iface::PROPERTIES, "PropertiesChanged").with_path(status.clone());
                connection
                    .add_match_no_cb(&rule.match_str())
                    .await
                    .map_err(BleTransportError::from)?;
                connection.start_receive(
                    rule,
                    Box::new(move |msg, _| {
                        if let Some(bytes) = parse_properties_changed_value(&msg) {
                            let _ = tx.send(bytes);
                        }
                        true
                    }),
                );
                Ok(NotifySource::Signal(rx))
            }
        }
    }

    /// Releases the notification channel, paths, and scratch buffer.
    /// Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(NotifySource::Signal(_)) = &self.notify {
            if let Some(paths) = &self.paths {
                let _ = gatt::stop_notify(&self.connection, &paths.status).await;
            }
        }
        self.notify = None;
        self.paths = None;
        self.scratch.zeroize();
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.scratch.zeroize();
    }
}

#[async_trait]
impl LinkIo for Link {
    fn controlpoint_size(&self) -> u16 {
        self.controlpoint_size
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let paths = self
            .paths
            .as_ref()
            .ok_or_else(|| BleTransportError::InternalError("link is closed".into()))?;
        if bytes.len() > self.controlpoint_size as usize {
            return Err(BleTransportError::InvalidArgument(format!(
                "write of {} bytes exceeds controlpoint_size {}",
                bytes.len(),
                self.controlpoint_size
            )));
        }
        gatt::write_value(&self.connection, &paths.control_point, bytes).await
    }

    async fn read(&mut self, buf: &mut [u8], timeout_ms: i64) -> Result<usize> {
        let notify = self
            .notify
            .as_mut()
            .ok_or_else(|| BleTransportError::InternalError("link is closed".into()))?;

        match notify {
            NotifySource::Fd(stream) => read_fd(stream, buf, timeout_ms).await,
            NotifySource::Signal(rx) => read_signal(rx, buf, timeout_ms).await,
        }
    }
}

async fn read_fd(stream: &mut UnixStream, buf: &mut [u8], timeout_ms: i64) -> Result<usize> {
    let fut = stream.read(buf);
    let result = if timeout_ms < 0 {
        fut.await.map_err(|e| BleTransportError::IoError(e.to_string()))
    } else {
        match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms.max(0) as u64), fut).await {
            Ok(r) => r.map_err(|e| BleTransportError::IoError(e.to_string())),
            Err(_) => return Err(BleTransportError::Timeout(timeout_ms)),
        }
    };
    result
}

async fn read_signal(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>, buf: &mut [u8], timeout_ms: i64) -> Result<usize> {
    let next = async {
        loop {
            match rx.recv().await {
                Some(bytes) if !bytes.is_empty() => return Some(bytes),
                Some(_) => continue,
                None => return None,
            }
        }
    };
    let received = if timeout_ms < 0 {
        next.await
    } else {
        match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms.max(0) as u64), next).await {
            Ok(v) => v,
            Err(_) => return Err(BleTransportError::Timeout(timeout_ms)),
        }
    };
    match received {
        Some(bytes) => {
            let n = bytes.len().min(buf.len());
            buf[..n].copy_from_slice(&bytes[..n]);
            Ok(n)
        }
        None => Err(BleTransportError::IoError("notification channel closed".into())),
    }
}

/// Pulls the `Value` bytes out of a `PropertiesChanged(interface, changed, invalidated)` signal.
fn parse_properties_changed_value(msg: &dbus::Message) -> Option<Vec<u8>> {
    use dbus::arg::{PropMap, RefArg};
    let (interface, changed, _invalidated): (String, PropMap, Vec<String>) = msg.read3().ok()?;
    if interface != iface::GATT_CHARACTERISTIC1 {
        return None;
    }
    let variant = changed.get("Value")?;
    let iter = variant.0.as_iter()?;
    Some(iter.filter_map(|item| item.as_u64().map(|b| b as u8)).collect())
}

/// In-memory [`LinkIo`] for driving Framer/Reassembler without a real adapter.
#[cfg(test)]
pub(crate) struct MockLink {
    pub controlpoint_size: u16,
    pub written: Vec<Vec<u8>>,
    pub to_read: std::collections::VecDeque<Vec<u8>>,
}

#[cfg(test)]
#[async_trait]
impl LinkIo for MockLink {
    fn controlpoint_size(&self) -> u16 {
        self.controlpoint_size
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.controlpoint_size as usize {
            return Err(BleTransportError::InvalidArgument("frame exceeds MTU".into()));
        }
        self.written.push(bytes.to_vec());
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], _timeout_ms: i64) -> Result<usize> {
        let frame = self
            .to_read
            .pop_front()
            .ok_or_else(|| BleTransportError::Timeout(0))?;
        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame[..n]);
        Ok(n)
    }
}
