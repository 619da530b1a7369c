//! CTAP-BLE framing and GATT link binding for FIDO2 authenticators
//! reachable over BlueZ.
//!
//! This crate covers the transport core only: frame fragmentation and
//! reassembly, BlueZ/D-Bus discovery and binding, and a façade that routes
//! logical CTAP commands to them. It does not interpret CBOR payloads, own
//! FIDO device state, or drive platform pairing UI.

pub mod constants;
pub mod enumerator;
pub mod error;
pub mod framer;
pub mod gatt;
pub mod link;
pub mod reassembler;
pub mod transport;

pub use enumerator::{DeviceDescriptor, Enumerator, EnumeratorConfig, ProfileRegistration};
pub use error::{BleTransportError, Result};
pub use link::{Link, LinkIo};
pub use transport::{CtapCommand, InitResponse, Transport};
