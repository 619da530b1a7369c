//! Discovers candidate BLE authenticators reachable through BlueZ.
//!
//! Ported from `fido_ble_manifest`/`ble_fido_is_useable_device` in
//! `original_source/src/ble_linux.c`. The retrieved C source enumerates
//! only already-connected devices; spec.md §4.2 additionally asks for an
//! active pre-scan (profile registration + `StartDiscovery`) on platforms
//! that need it, which this module adds behind [`EnumeratorConfig`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dbus::channel::MatchingReceiver;
use dbus::message::MatchRule;
use dbus::nonblock::{Proxy, SyncConnection};
use dbus::Path;
use dbus_crossroads::Crossroads;

use crate::constants::{iface, uuids, BLE_DEVICE_PREFIX};
use crate::error::{BleTransportError, Result};
use crate::gatt;

/// One discoverable authenticator, per spec.md §4.2's contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub path: String,
    pub manufacturer: String,
    pub product: String,
}

/// Tunables for the pre-scan step. Defaults match spec.md's Open Question
/// resolution: a fixed ~3 second wait, pre-scan enabled.
#[derive(Debug, Clone)]
pub struct EnumeratorConfig {
    pub scan_duration: Duration,
    /// Skip profile registration and `StartDiscovery` entirely and only
    /// enumerate already-connected devices, for platforms where discovery
    /// is driven externally (spec.md §4.2, final sentence).
    pub skip_prescan: bool,
}

impl Default for EnumeratorConfig {
    fn default() -> Self {
        Self { scan_duration: Duration::from_secs(3), skip_prescan: false }
    }
}

const PROFILE_OBJECT_PATH: &str = "/org/fido2_ble_transport/profile0";

/// RAII guard for the process-wide GATT client profile registration.
/// Dropping it fires `UnregisterApplication`; since `Drop` can't `.await`,
/// the unregister call is best-effort and logged rather than propagated.
pub struct ProfileRegistration {
    connection: Arc<SyncConnection>,
    adapter_objects: Vec<Path<'static>>,
}

impl ProfileRegistration {
    async fn register(connection: &Arc<SyncConnection>, adapters: &[Path<'static>]) -> Result<Self> {
        let mut cr = Crossroads::new();
        let iface_token = cr.register(iface::GATT_PROFILE1, |b: &mut dbus_crossroads::IfaceBuilder<()>| {
            b.method("Release", (), (), |_, _, _: ()| Ok(()));
        });
        cr.insert(PROFILE_OBJECT_PATH, &[iface_token], ());
        let cr = Arc::new(Mutex::new(cr));
        connection.start_receive(
            MatchRule::new_method_call(),
            Box::new(move |msg, conn| {
                if let Ok(mut cr) = cr.lock() {
                    let _ = cr.handle_message(msg, conn);
                }
                true
            }),
        );

        let mut options = dbus::arg::PropMap::new();
        options.insert(
            "UUIDs".to_string(),
            dbus::arg::Variant(Box::new(vec![uuids::FIDO_SERVICE_UUID.to_string()]) as Box<dyn dbus::arg::RefArg>),
        );
        let path = Path::new(PROFILE_OBJECT_PATH.to_string())
            .map_err(|e| BleTransportError::InternalError(format!("invalid profile object path: {e}")))?;

        for adapter in adapters {
            let p = Proxy::new(iface::BLUEZ_SERVICE_NAME, adapter.clone(), gatt::DBUS_CALL_TIMEOUT, &**connection);
            let call: std::result::Result<(), dbus::Error> = p
                .method_call(iface::GATT_MANAGER1, "RegisterApplication", (path.clone(), options.clone()))
                .await;
            if let Err(e) = call {
                log::debug!("RegisterApplication on {adapter} failed: {e}");
            }
        }

        Ok(Self { connection: Arc::clone(connection), adapter_objects: adapters.to_vec() })
    }
}

impl Drop for ProfileRegistration {
    fn drop(&mut self) {
        let connection = Arc::clone(&self.connection);
        let adapters = self.adapter_objects.clone();
        tokio::spawn(async move {
            let path = match Path::new(PROFILE_OBJECT_PATH.to_string()) {
                Ok(p) => p,
                Err(_) => return,
            };
            for adapter in adapters {
                let p = Proxy::new(iface::BLUEZ_SERVICE_NAME, adapter.clone(), gatt::DBUS_CALL_TIMEOUT, &*connection);
                let result: std::result::Result<(), dbus::Error> =
                    p.method_call(iface::GATT_MANAGER1, "UnregisterApplication", (path.clone(),)).await;
                if let Err(e) = result {
                    log::trace!("UnregisterApplication on {adapter} failed: {e}");
                }
            }
        });
    }
}

pub struct Enumerator {
    config: EnumeratorConfig,
}

impl Enumerator {
    pub fn new(config: EnumeratorConfig) -> Self {
        Self { config }
    }

    /// Produces up to `capacity` candidate devices. `capacity == 0` returns
    /// the empty list without any side effects (no bus connection opened).
    pub async fn manifest(&self, capacity: usize) -> Result<Vec<DeviceDescriptor>> {
        if capacity == 0 {
            return Ok(Vec::new());
        }

        let connection = gatt::system_bus().await?;

        let _profile = if self.config.skip_prescan {
            None
        } else {
            let adapters = adapter_paths(&connection).await?;
            let registration = ProfileRegistration::register(&connection, &adapters).await.ok();
            for adapter in &adapters {
                if let Err(e) = gatt::start_discovery(&connection, adapter).await {
                    log::debug!("StartDiscovery on {adapter} failed: {e}");
                }
            }
            tokio::time::sleep(self.config.scan_duration).await;
            registration
        };

        let result = self.scan_connected(&connection, capacity).await;

        if !self.config.skip_prescan {
            if let Ok(adapters) = adapter_paths(&connection).await {
                for adapter in &adapters {
                    let _ = gatt::stop_discovery(&connection, adapter).await;
                }
            }
        }

        result
    }

    async fn scan_connected(&self, connection: &SyncConnection, capacity: usize) -> Result<Vec<DeviceDescriptor>> {
        let objects = gatt::managed_objects(connection).await?;
        let mut out = Vec::new();

        for (path, interfaces) in &objects {
            if out.len() >= capacity {
                break;
            }
            let Some(props) = interfaces.get(iface::DEVICE1) else { continue };
            if is_useable_device(props) {
                let name = gatt::prop_str(props, "Name").unwrap_or("FIDO2 BLE Authenticator");
                out.push(DeviceDescriptor {
                    path: format!("{BLE_DEVICE_PREFIX}{path}"),
                    manufacturer: "BLE".to_string(),
                    product: name.to_string(),
                });
            }
        }

        Ok(out)
    }
}

fn is_useable_device(props: &dbus::arg::PropMap) -> bool {
    gatt::prop_bool(props, "Connected")
        && gatt::prop_bool(props, "Paired")
        && gatt::prop_bool(props, "ServicesResolved")
        && gatt::prop_uuids(props).iter().any(|u| u == uuids::FIDO_SERVICE_UUID)
}

async fn adapter_paths(connection: &SyncConnection) -> Result<Vec<Path<'static>>> {
    let objects = gatt::managed_objects(connection).await?;
    Ok(objects
        .into_iter()
        .filter(|(_, interfaces)| interfaces.contains_key(iface::ADAPTER1))
        .map(|(path, _)| path)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn useable_device_requires_all_four_flags() {
        let mut props = dbus::arg::PropMap::new();
        props.insert("Connected".into(), dbus::arg::Variant(Box::new(true) as Box<dyn dbus::arg::RefArg>));
        props.insert("Paired".into(), dbus::arg::Variant(Box::new(true) as Box<dyn dbus::arg::RefArg>));
        props.insert("ServicesResolved".into(), dbus::arg::Variant(Box::new(true) as Box<dyn dbus::arg::RefArg>));
        assert!(!is_useable_device(&props));

        props.insert(
            "UUIDs".into(),
            dbus::arg::Variant(Box::new(vec![uuids::FIDO_SERVICE_UUID.to_string()]) as Box<dyn dbus::arg::RefArg>),
        );
        assert!(is_useable_device(&props));
    }

    #[tokio::test]
    async fn zero_capacity_returns_empty_without_side_effects() {
        let enumerator = Enumerator::new(EnumeratorConfig::default());
        let out = enumerator.manifest(0).await.unwrap();
        assert!(out.is_empty());
    }
}
