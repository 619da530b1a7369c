//! Smoke-test CLI: enumerates FIDO2 BLE authenticators currently paired
//! and connected, and prints their manifest entries.

use fido2_ble_transport::{Enumerator, EnumeratorConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let skip_prescan = std::env::args().any(|a| a == "--skip-prescan");
    let enumerator = Enumerator::new(EnumeratorConfig { skip_prescan, ..Default::default() });

    match enumerator.manifest(16).await {
        Ok(devices) if devices.is_empty() => {
            println!("no FIDO2 BLE authenticators found");
        }
        Ok(devices) => {
            for d in devices {
                println!("{}\t{}\t{}", d.path, d.manufacturer, d.product);
            }
        }
        Err(e) => {
            log::error!("enumeration failed: {e}");
            std::process::exit(1);
        }
    }
}
