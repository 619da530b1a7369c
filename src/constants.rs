//! CTAP-BLE wire constants and the BlueZ GATT surface this crate binds to.

/// CTAP-BLE command bytes (high bit set on every initialization frame).
pub const CTAPBLE_PING: u8 = 0x81;
pub const CTAPBLE_KEEPALIVE: u8 = 0x82;
pub const CTAPBLE_MSG: u8 = 0x83;
pub const CTAPBLE_CANCEL: u8 = 0xBE;
pub const CTAPBLE_ERROR: u8 = 0xBF;

/// Largest frame BlueZ / the GATT transport will ever hand us, regardless of
/// what the Control Point Length characteristic reports.
pub const CTAPBLE_MAX_FRAME_LEN: usize = 512;

pub const CTAPBLE_INIT_HEADER_LEN: usize = 3;
pub const CTAPBLE_CONT_HEADER_LEN: usize = 1;

/// Continuation sequence numbers wrap modulo 0x80 (high bit reserved to mark
/// an initialization frame).
pub const SEQ_MASK: u8 = 0x7f;

/// Service Revision bitmap bit selecting FIDO2.
pub const SERVICE_REVISION_FIDO2: u8 = 0x20;

pub mod uuids {
    //! GATT UUIDs advertised by a FIDO2 BLE authenticator (case-insensitive
    //! on the wire; comparisons in this crate lowercase both sides).
    pub const FIDO_SERVICE_UUID: &str = "0000fffd-0000-1000-8000-00805f9b34fb";
    pub const FIDO_STATUS_UUID: &str = "f1d0fff2-deaa-ecee-b42f-c9ba7ed623bb";
    pub const FIDO_CONTROL_POINT_UUID: &str = "f1d0fff1-deaa-ecee-b42f-c9ba7ed623bb";
    pub const FIDO_CONTROL_POINT_LENGTH_UUID: &str = "f1d0fff3-deaa-ecee-b42f-c9ba7ed623bb";
    pub const FIDO_SERVICE_REVISION_UUID: &str = "f1d0fff4-deaa-ecee-b42f-c9ba7ed623bb";
}

pub mod iface {
    //! org.bluez interfaces and the generic freedesktop interfaces this
    //! crate calls methods on.
    pub const BLUEZ_SERVICE_NAME: &str = "org.bluez";
    pub const DEVICE1: &str = "org.bluez.Device1";
    pub const GATT_SERVICE1: &str = "org.bluez.GattService1";
    pub const GATT_CHARACTERISTIC1: &str = "org.bluez.GattCharacteristic1";
    pub const GATT_PROFILE1: &str = "org.bluez.GattProfile1";
    pub const ADAPTER1: &str = "org.bluez.Adapter1";
    pub const GATT_MANAGER1: &str = "org.bluez.GattManager1";
    pub const PROPERTIES: &str = "org.freedesktop.DBus.Properties";
    pub const OBJECT_MANAGER: &str = "org.freedesktop.DBus.ObjectManager";
}

/// Prefix used to tag device paths belonging to this transport, so callers
/// holding paths from multiple transports (USB-HID, NFC, BLE) can route
/// correctly without probing each one.
pub const BLE_DEVICE_PREFIX: &str = "ble:";
