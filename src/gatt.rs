//! Thin wrappers over the `org.bluez` D-Bus surface this crate needs.
//!
//! Nothing above this module touches `dbus` types directly except the
//! `SyncConnection` handle itself, which `Link` keeps alive for its
//! lifetime. Every BlueZ method call funnels through here so the
//! object-path and property-bag parsing lives in one place.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dbus::arg::{OwnedFd, PropMap, RefArg, Variant};
use dbus::nonblock::stdintf::org_freedesktop_dbus::{ObjectManager, Properties};
use dbus::nonblock::{Proxy, SyncConnection};
use dbus::Path;

use crate::constants::iface;
use crate::error::{BleTransportError, Result};

/// Default per-call timeout for BlueZ method calls. A button-press
/// interaction (e.g. user presence) happens above this layer, in the
/// Reassembler's read loop, which has its own caller-supplied timeout.
pub(crate) const DBUS_CALL_TIMEOUT: Duration = Duration::from_secs(25);

pub(crate) type ManagedObjects = HashMap<Path<'static>, HashMap<String, PropMap>>;

/// Opens a connection to the system bus and spawns its I/O driver task.
///
/// Mirrors `sd_bus_default_system` in the original C transport: one
/// connection per `Link`/`Enumerator` call, handed to `tokio::spawn` so
/// the connection keeps pumping while we `.await` method calls on it.
pub(crate) async fn system_bus() -> Result<Arc<SyncConnection>> {
    let (resource, connection) = dbus_tokio::connection::new_system_sync()
        .map_err(|e| BleTransportError::IoError(format!("failed to connect to system bus: {e}")))?;
    tokio::spawn(async move {
        let err = resource.await;
        log::error!("D-Bus system connection lost: {err}");
    });
    Ok(connection)
}

fn proxy<'a>(connection: &'a SyncConnection, path: &'a Path<'static>) -> Proxy<'a, &'a SyncConnection> {
    Proxy::new(iface::BLUEZ_SERVICE_NAME, path.clone(), DBUS_CALL_TIMEOUT, connection)
}

/// `org.freedesktop.DBus.Properties.GetAll` for the given interface.
pub(crate) async fn get_all(
    connection: &SyncConnection, path: &Path<'static>, interface: &str,
) -> Result<PropMap> {
    let p = proxy(connection, path);
    Ok(Properties::get_all(&p, interface).await?)
}

/// `org.freedesktop.DBus.ObjectManager.GetManagedObjects` on `org.bluez`.
pub(crate) async fn managed_objects(connection: &SyncConnection) -> Result<ManagedObjects> {
    let p = Proxy::new(iface::BLUEZ_SERVICE_NAME, "/", DBUS_CALL_TIMEOUT, connection);
    Ok(ObjectManager::get_managed_objects(&p).await?)
}

/// `GattCharacteristic1.ReadValue({})`.
pub(crate) async fn read_value(connection: &SyncConnection, path: &Path<'static>) -> Result<Vec<u8>> {
    let p = proxy(connection, path);
    let options = PropMap::new();
    let (value,): (Vec<u8>,) = p
        .method_call(iface::GATT_CHARACTERISTIC1, "ReadValue", (options,))
        .await?;
    Ok(value)
}

/// `GattCharacteristic1.WriteValue(value, {})`.
pub(crate) async fn write_value(
    connection: &SyncConnection, path: &Path<'static>, value: &[u8],
) -> Result<()> {
    let p = proxy(connection, path);
    let options = PropMap::new();
    let (): () = p
        .method_call(iface::GATT_CHARACTERISTIC1, "WriteValue", (value, options))
        .await?;
    Ok(())
}

/// `GattCharacteristic1.AcquireNotify({})`. Returns the notification pipe fd
/// and the negotiated MTU.
pub(crate) async fn acquire_notify(
    connection: &SyncConnection, path: &Path<'static>,
) -> Result<(OwnedFd, u16)> {
    let p = proxy(connection, path);
    let options = PropMap::new();
    let (fd, mtu): (OwnedFd, u16) = p
        .method_call(iface::GATT_CHARACTERISTIC1, "AcquireNotify", (options,))
        .await?;
    Ok((fd, mtu))
}

/// `GattCharacteristic1.StartNotify()`, used on platforms/configurations
/// that can't acquire a notification fd and instead rely on
/// `PropertiesChanged` signals carrying the `Value` property.
pub(crate) async fn start_notify(connection: &SyncConnection, path: &Path<'static>) -> Result<()> {
    let p = proxy(connection, path);
    let (): () = p.method_call(iface::GATT_CHARACTERISTIC1, "StartNotify", ()).await?;
    Ok(())
}

pub(crate) async fn stop_notify(connection: &SyncConnection, path: &Path<'static>) -> Result<()> {
    let p = proxy(connection, path);
    let result: std::result::Result<(), dbus::Error> =
        p.method_call(iface::GATT_CHARACTERISTIC1, "StopNotify", ()).await;
    if let Err(e) = &result {
        log::trace!("StopNotify({path}) -> {e}");
    }
    Ok(())
}

pub(crate) async fn start_discovery(connection: &SyncConnection, adapter_path: &Path<'static>) -> Result<()> {
    let p = proxy(connection, adapter_path);
    let (): () = p.method_call(iface::ADAPTER1, "StartDiscovery", ()).await?;
    Ok(())
}

pub(crate) async fn stop_discovery(connection: &SyncConnection, adapter_path: &Path<'static>) -> Result<()> {
    let p = proxy(connection, adapter_path);
    let result: std::result::Result<(), dbus::Error> =
        p.method_call(iface::ADAPTER1, "StopDiscovery", ()).await;
    if let Err(e) = &result {
        log::trace!("StopDiscovery({adapter_path}) -> {e}");
    }
    Ok(())
}

/// Extracts a string property from a `GetAll` property bag.
pub(crate) fn prop_str<'a>(props: &'a PropMap, key: &str) -> Option<&'a str> {
    props.get(key).and_then(|v| v.as_str())
}

pub(crate) fn prop_bool(props: &PropMap, key: &str) -> bool {
    dbus::arg::prop_cast::<bool>(props, key).copied().unwrap_or(false)
}

/// Extracts the `UUIDs` array property, lowercased for case-insensitive comparison.
pub(crate) fn prop_uuids(props: &PropMap) -> Vec<String> {
    match props.get("UUIDs") {
        Some(Variant(v)) => match v.as_iter() {
            Some(iter) => iter
                .filter_map(|item| item.as_str().map(|s| s.to_ascii_lowercase()))
                .collect(),
            None => Vec::new(),
        },
        None => Vec::new(),
    }
}
