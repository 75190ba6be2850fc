//! FieldNode firmware — ESP-IDF entry point.
//!
//! Builds the composition root over the real hardware adapters and runs
//! the cooperative main loop. All domain logic lives in the library;
//! this file only wires and paces it.

#![deny(unused_must_use)]

use anyhow::{Context, Result};
use log::{info, warn};

use fieldnode::bus::i2c::EspI2cEngine;
use fieldnode::bus::onewire::PinOneWire;
use fieldnode::config::packets::WifiConfig;
use fieldnode::config::store::{self, NvsStore};
use fieldnode::hal;
use fieldnode::net::EspMqttLink;
use fieldnode::runtime::{Node, LOOP_PERIOD_MS};

const CONTROLLER_ID: &str = match option_env!("FIELDNODE_CONTROLLER_ID") {
    Some(id) => id,
    None => "automation",
};
const BROKER_URL: &str = match option_env!("FIELDNODE_BROKER_URL") {
    Some(url) => url,
    None => "mqtt://automation.local:1883",
};

fn main() -> Result<()> {
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init().context("logger init")?;

    info!(
        "fieldnode v{} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIMESTAMP")
    );

    let store = NvsStore::new().map_err(|e| anyhow::anyhow!("NVS init failed: {e}"))?;

    // Network bring-up is a black box to the core: read credentials
    // straight from the store and hand the session to the driver.
    if let Ok(wifi) = store::load_blob::<WifiConfig>(&store, store::NS_WIFI) {
        if let Err(e) = wifi_connect(&wifi) {
            // The node still boots: safety does not depend on the
            // controller, and the messaging client will keep retrying.
            warn!("wifi: bring-up failed ({e}), continuing offline");
        }
    } else {
        warn!("wifi: no stored credentials, continuing offline");
    }

    let node_id = device_id();
    let link = EspMqttLink::new(BROKER_URL, &node_id);

    let mut node = Node::new(
        link,
        store,
        EspI2cEngine::new(),
        PinOneWire::new(),
        CONTROLLER_ID,
        &node_id,
    );
    node.boot(hal::now_ms());

    loop {
        node.run_iteration(hal::now_ms());
        if node.reboot_requested() {
            info!("rebooting on operator command");
            hal::restart();
        }
        hal::delay_ms(LOOP_PERIOD_MS);
    }
}

/// Stable per-chip identifier derived from the base MAC.
fn device_id() -> String {
    let mut mac = [0u8; 6];
    // SAFETY: esp_base_mac_addr_get writes exactly six bytes.
    unsafe {
        esp_idf_svc::sys::esp_base_mac_addr_get(mac.as_mut_ptr());
    }
    format!(
        "node-{:02x}{:02x}{:02x}",
        mac[3], mac[4], mac[5]
    )
}

/// Station-mode connect with the stored credentials. Blocking with a
/// bounded wait; the caller tolerates failure.
fn wifi_connect(cfg: &WifiConfig) -> Result<()> {
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::hal::modem::Modem;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use esp_idf_svc::wifi::{BlockingWifi, ClientConfiguration, Configuration, EspWifi};

    let (Some(ssid), Some(password)) = (&cfg.ssid, &cfg.password) else {
        anyhow::bail!("credentials incomplete");
    };

    let modem = unsafe { Modem::new() };
    let sysloop = EspSystemEventLoop::take().context("event loop")?;
    let nvs = EspDefaultNvsPartition::take().context("nvs partition")?;

    let mut wifi = BlockingWifi::wrap(
        EspWifi::new(modem, sysloop.clone(), Some(nvs)).context("wifi driver")?,
        sysloop,
    )
    .context("blocking wifi")?;

    let mut client = ClientConfiguration::default();
    client
        .ssid
        .push_str(ssid)
        .map_err(|()| anyhow::anyhow!("ssid too long"))?;
    client
        .password
        .push_str(password)
        .map_err(|()| anyhow::anyhow!("password too long"))?;
    wifi.set_configuration(&Configuration::Client(client))
        .context("wifi config")?;

    wifi.start().context("wifi start")?;
    wifi.connect().context("wifi connect")?;
    wifi.wait_netif_up().context("netif up")?;
    info!("wifi: connected to '{}'", ssid);

    // Leak the driver: the session must outlive main's stack frame and
    // the node never tears WiFi down outside a reboot.
    core::mem::forget(wifi);
    Ok(())
}
