//! Direct BLE transport to a classic-protocol Muse headset.
//!
//! [`MuseClient::connect`] scans for the first headset whose name matches the
//! configured prefix, subscribes its EEG, accelerometer, optical, telemetry
//! and control characteristics, sends the start-up command sequence and
//! spawns a session task that turns notifications into [`TransportEvent`]s.
//!
//! The session task also supervises the link: when the adapter reports the
//! peripheral gone (or the notification stream ends) it emits
//! [`TransportEvent::LinkLost`], retries up to
//! [`MuseClientConfig::max_reconnect_attempts`] times, and either emits
//! [`TransportEvent::Reconnected`] or gives up with
//! [`TransportEvent::Disconnected`].

use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error::ConnectionError;
use crate::parse::{parse_accelerometer, parse_eeg, parse_ppg, parse_telemetry};
use crate::protocol::{
    decode_response, encode_command, ACCELEROMETER_CHARACTERISTIC, CONTROL_CHARACTERISTIC,
    EEG_CHARACTERISTICS, PPG_CHARACTERISTICS, PRESET_EEG_PPG, TELEMETRY_CHARACTERISTIC,
};
use crate::types::TransportEvent;

// ── MuseDevice ───────────────────────────────────────────────────────────────

/// A headset found by [`MuseClient::scan_all`].
#[derive(Clone, Debug)]
pub struct MuseDevice {
    /// Advertised name, e.g. `"Muse-AB12"`.
    pub name: String,
    /// Platform identifier: a UUID on macOS / Windows, a MAC on Linux.
    pub id: String,
    pub(crate) peripheral: Peripheral,
    pub(crate) adapter: Adapter,
}

// ── MuseClientConfig ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MuseClientConfig {
    /// Subscribe the optical channels and use the EEG + PPG preset.
    pub enable_ppg: bool,
    /// Scan duration before giving up. Default: 15 s.
    pub scan_timeout_secs: u64,
    /// Match devices whose advertised name starts with this. Default `"Muse"`.
    pub name_prefix: String,
    /// Hard cap on `connect()` + service discovery.
    pub connect_timeout: Duration,
    /// Re-establishment attempts after an unexpected drop.
    pub max_reconnect_attempts: u32,
    /// Pause before each attempt; the headset usually re-advertises within
    /// a second or two.
    pub reconnect_delay: Duration,
}

impl Default for MuseClientConfig {
    fn default() -> Self {
        Self {
            enable_ppg: true,
            scan_timeout_secs: 15,
            name_prefix: "Muse".into(),
            connect_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

// ── MuseClient ───────────────────────────────────────────────────────────────

pub struct MuseClient {
    config: MuseClientConfig,
}

impl MuseClient {
    pub fn new(config: MuseClientConfig) -> Self {
        Self { config }
    }

    /// Scan for the full timeout and return every matching headset.
    pub async fn scan_all(&self) -> Result<Vec<MuseDevice>, ConnectionError> {
        let adapter = first_adapter().await?;
        info!("scan_all: scanning for {} s …", self.config.scan_timeout_secs);
        adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(Duration::from_secs(self.config.scan_timeout_secs)).await;
        adapter.stop_scan().await.ok();

        let mut found = vec![];
        for p in adapter.peripherals().await? {
            if let Ok(Some(props)) = p.properties().await {
                if let Some(name) = props.local_name {
                    if name.starts_with(&self.config.name_prefix) {
                        let id = p.id().to_string();
                        info!("scan_all: found {name}  id={id}");
                        found.push(MuseDevice { name, id, peripheral: p, adapter: adapter.clone() });
                    }
                }
            }
        }
        info!("scan_all: {} device(s) found", found.len());
        Ok(found)
    }

    /// Connect to a device returned by [`MuseClient::scan_all`].
    pub async fn connect_to(
        &self,
        device: MuseDevice,
    ) -> Result<(mpsc::Receiver<TransportEvent>, MuseHandle), ConnectionError> {
        self.start_session(device.peripheral, device.name, device.adapter).await
    }

    /// Scan for the first matching headset and connect to it.
    pub async fn connect(&self) -> Result<(mpsc::Receiver<TransportEvent>, MuseHandle), ConnectionError> {
        let adapter = first_adapter().await?;
        info!(
            "Scanning for Muse devices (timeout: {} s) …",
            self.config.scan_timeout_secs
        );
        adapter.start_scan(ScanFilter::default()).await?;
        let found = self.find_first(&adapter).await;
        adapter.stop_scan().await.ok();
        let peripheral = found?;

        let props = peripheral.properties().await?.unwrap_or_default();
        let name = props.local_name.unwrap_or_else(|| "Unknown".into());
        info!("Found device: {name}");
        self.start_session(peripheral, name, adapter).await
    }

    async fn start_session(
        &self,
        peripheral: Peripheral,
        device_name: String,
        adapter: Adapter,
    ) -> Result<(mpsc::Receiver<TransportEvent>, MuseHandle), ConnectionError> {
        let control_char = open_link(&peripheral, &self.config).await?;
        info!("{device_name}: link up, streaming started");

        let (tx, rx) = mpsc::channel::<TransportEvent>(256);
        let _ = tx.send(TransportEvent::Connected(device_name.clone())).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = Session {
            peripheral: peripheral.clone(),
            adapter,
            config: self.config.clone(),
            tx,
            shutdown: shutdown_rx,
        };
        tokio::spawn(session.run());

        Ok((
            rx,
            MuseHandle {
                peripheral,
                control_char,
                shutdown: shutdown_tx,
                name: device_name,
            },
        ))
    }

    /// Poll until the first matching peripheral appears or the scan times out.
    async fn find_first(&self, adapter: &Adapter) -> Result<Peripheral, ConnectionError> {
        let prefix = self.config.name_prefix.as_str();
        let timeout = Duration::from_secs(self.config.scan_timeout_secs);
        let search = async {
            loop {
                for p in adapter.peripherals().await.unwrap_or_default() {
                    if let Ok(Some(props)) = p.properties().await {
                        if props.local_name.as_deref().is_some_and(|n| n.starts_with(prefix)) {
                            return p;
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        };
        tokio::time::timeout(timeout, search).await.map_err(|_| {
            ConnectionError::DeviceNotFound(format!(
                "no device named {prefix}* after {} s",
                timeout.as_secs()
            ))
        })
    }
}

async fn first_adapter() -> Result<Adapter, ConnectionError> {
    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or(ConnectionError::AdapterUnavailable)?;
    wait_powered_on(&adapter).await;
    Ok(adapter)
}

/// CoreBluetooth starts in "unknown"; scanning before `PoweredOn` is a
/// silent no-op.
#[cfg(target_os = "macos")]
async fn wait_powered_on(adapter: &Adapter) {
    use btleplug::api::CentralState;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        match adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => break,
            Ok(state) if tokio::time::Instant::now() >= deadline => {
                warn!("macOS: adapter still {state:?} after 3 s, proceeding anyway");
                break;
            }
            Ok(state) => debug!("macOS: adapter state = {state:?}, waiting…"),
            Err(e) => {
                warn!("macOS: adapter_state() error: {e}");
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[cfg(not(target_os = "macos"))]
async fn wait_powered_on(_adapter: &Adapter) {}

/// Connect, discover, subscribe and start streaming. Used both for the first
/// connection and for every reconnect attempt. Returns the control
/// characteristic.
async fn open_link(
    peripheral: &Peripheral,
    config: &MuseClientConfig,
) -> Result<Characteristic, ConnectionError> {
    // BlueZ's Device1.Connect can block forever when the stack is wedged.
    tokio::time::timeout(config.connect_timeout, peripheral.connect())
        .await
        .map_err(|_| ConnectionError::Timeout {
            step: "BLE connect",
            after: config.connect_timeout,
        })??;

    // BlueZ reports the connection before the GATT cache is populated.
    #[cfg(target_os = "linux")]
    tokio::time::sleep(Duration::from_millis(600)).await;

    tokio::time::timeout(config.connect_timeout, peripheral.discover_services())
        .await
        .map_err(|_| ConnectionError::Timeout {
            step: "service discovery",
            after: config.connect_timeout,
        })??;

    let chars = peripheral.characteristics();
    let find = |uuid: Uuid| {
        chars
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned()
            .ok_or(ConnectionError::MissingCharacteristic(uuid))
    };

    let control = find(CONTROL_CHARACTERISTIC)?;
    for uuid in [CONTROL_CHARACTERISTIC, TELEMETRY_CHARACTERISTIC, ACCELEROMETER_CHARACTERISTIC] {
        peripheral.subscribe(&find(uuid)?).await?;
    }
    for &uuid in &EEG_CHARACTERISTICS {
        peripheral.subscribe(&find(uuid)?).await?;
    }
    if config.enable_ppg {
        for &uuid in &PPG_CHARACTERISTICS {
            match find(uuid) {
                Ok(c) => peripheral.subscribe(&c).await?,
                // Muse 1 has no optical sensor.
                Err(e) => warn!("PPG unavailable: {e}"),
            }
        }
    }

    let preset = if config.enable_ppg { PRESET_EEG_PPG } else { "p21" };
    for cmd in ["h", "s", preset, "d"] {
        write_command(peripheral, &control, cmd).await?;
    }
    Ok(control)
}

async fn write_command(
    peripheral: &Peripheral,
    control: &Characteristic,
    cmd: &str,
) -> Result<(), ConnectionError> {
    peripheral
        .write(control, &encode_command(cmd), WriteType::WithoutResponse)
        .await?;
    Ok(())
}

/// Signals `lost_tx` for every event `is_ours` accepts. Returns when the
/// event stream ends or the session drops its receiver.
async fn forward_link_loss<S, F>(mut events: S, is_ours: F, lost_tx: mpsc::Sender<()>)
where
    S: futures::Stream<Item = CentralEvent> + Unpin,
    F: Fn(&CentralEvent) -> bool,
{
    loop {
        tokio::select! {
            _ = lost_tx.closed() => break,
            event = events.next() => match event {
                Some(event) if is_ours(&event) => {
                    if lost_tx.send(()).await.is_err() {
                        break;
                    }
                }
                Some(_) => {}
                None => break,
            },
        }
    }
}

/// Map one notification to an event. `None` for control fragments and
/// characteristics we don't consume.
pub fn decode_notification(uuid: Uuid, data: &[u8]) -> Option<TransportEvent> {
    let event = |r: Result<TransportEvent, _>| Some(r.unwrap_or_else(TransportEvent::Malformed));

    if uuid == CONTROL_CHARACTERISTIC {
        debug!("control fragment: {:?}", decode_response(data));
        return None;
    }
    if uuid == TELEMETRY_CHARACTERISTIC {
        return event(parse_telemetry(data).map(TransportEvent::Telemetry));
    }
    if uuid == ACCELEROMETER_CHARACTERISTIC {
        return event(parse_accelerometer(data).map(TransportEvent::Accelerometer));
    }
    if let Some(electrode) = EEG_CHARACTERISTICS.iter().position(|&u| u == uuid) {
        return event(parse_eeg(data, electrode).map(TransportEvent::Eeg));
    }
    if let Some(channel) = PPG_CHARACTERISTICS.iter().position(|&u| u == uuid) {
        return event(parse_ppg(data, channel).map(TransportEvent::Ppg));
    }
    debug!("unhandled notification from {uuid}");
    None
}

// ── Session task ─────────────────────────────────────────────────────────────

struct Session {
    peripheral: Peripheral,
    adapter: Adapter,
    config: MuseClientConfig,
    tx: mpsc::Sender<TransportEvent>,
    shutdown: watch::Receiver<bool>,
}

enum PumpEnd {
    LinkLost,
    Shutdown,
}

impl Session {
    async fn run(mut self) {
        let (lost_tx, mut lost_rx) = mpsc::channel::<()>(4);
        self.spawn_disconnect_watcher(lost_tx);

        loop {
            match self.pump(&mut lost_rx).await {
                PumpEnd::Shutdown => break,
                PumpEnd::LinkLost => {
                    info!("link lost, attempting to re-establish");
                    let _ = self.tx.send(TransportEvent::LinkLost).await;
                    if !self.reconnect().await {
                        break;
                    }
                    while lost_rx.try_recv().is_ok() {}
                    let _ = self.tx.send(TransportEvent::Reconnected).await;
                }
            }
        }
        let _ = self.tx.send(TransportEvent::Disconnected).await;
        info!("BLE session ended");
    }

    /// The adapter's `DeviceDisconnected` usually fires well before the
    /// notification stream notices.
    fn spawn_disconnect_watcher(&self, lost_tx: mpsc::Sender<()>) {
        let adapter = self.adapter.clone();
        let peripheral_id = self.peripheral.id();
        tokio::spawn(async move {
            let events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("disconnect watcher: could not subscribe to adapter events: {e}");
                    return;
                }
            };
            forward_link_loss(
                events,
                |event| matches!(event, CentralEvent::DeviceDisconnected(id) if *id == peripheral_id),
                lost_tx,
            )
            .await;
        });
    }

    async fn pump(&mut self, lost_rx: &mut mpsc::Receiver<()>) -> PumpEnd {
        let mut notifications = match self.peripheral.notifications().await {
            Ok(n) => n,
            Err(e) => {
                warn!("could not open notification stream: {e}");
                return PumpEnd::LinkLost;
            }
        };
        let mut count: u64 = 0;
        loop {
            tokio::select! {
                // Only ever set to `true`; a dropped handle ends the session too.
                _ = self.shutdown.changed() => return PumpEnd::Shutdown,
                Some(()) = lost_rx.recv() => return PumpEnd::LinkLost,
                notif = notifications.next() => {
                    let Some(notif) = notif else {
                        return PumpEnd::LinkLost;
                    };
                    count += 1;
                    if count <= 5 || count % 500 == 0 {
                        debug!("notif #{count} uuid={} len={}", notif.uuid, notif.value.len());
                    }
                    if let Some(event) = decode_notification(notif.uuid, &notif.value) {
                        if self.tx.send(event).await.is_err() {
                            return PumpEnd::Shutdown;
                        }
                    }
                }
            }
        }
    }

    /// `true` once the link is back up.
    async fn reconnect(&mut self) -> bool {
        for attempt in 1..=self.config.max_reconnect_attempts {
            let _ = self.tx.send(TransportEvent::Reconnecting(attempt)).await;
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = self.shutdown.changed() => return false,
            }
            match open_link(&self.peripheral, &self.config).await {
                Ok(_) => {
                    info!("reconnected on attempt {attempt}");
                    return true;
                }
                Err(e) => warn!("reconnect attempt {attempt} failed: {e}"),
            }
        }
        warn!(
            "giving up after {} reconnect attempts",
            self.config.max_reconnect_attempts
        );
        false
    }
}

// ── MuseHandle ───────────────────────────────────────────────────────────────

/// Control handle for a live BLE session. Dropping it ends the session.
pub struct MuseHandle {
    peripheral: Peripheral,
    control_char: Characteristic,
    shutdown: watch::Sender<bool>,
    name: String,
}

impl MuseHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a raw command string (e.g. `"h"`, `"d"`, `"v1"`).
    pub async fn send_command(&self, cmd: &str) -> Result<(), ConnectionError> {
        write_command(&self.peripheral, &self.control_char, cmd).await
    }

    pub async fn pause(&self) -> Result<(), ConnectionError> {
        self.send_command("h").await
    }

    pub async fn resume(&self) -> Result<(), ConnectionError> {
        self.send_command("d").await
    }

    pub async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    /// Stop supervision first so the drop isn't mistaken for a link loss,
    /// then close the link.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        let _ = self.shutdown.send(true);
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PacketDecodeError;

    #[tokio::test]
    async fn link_loss_forwarder_exits_when_session_ends() {
        let (lost_tx, lost_rx) = mpsc::channel::<()>(1);
        let task = tokio::spawn(forward_link_loss(
            futures::stream::pending::<CentralEvent>(),
            |_| true,
            lost_tx,
        ));
        drop(lost_rx);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("forwarder still parked")
            .unwrap();
    }

    #[test]
    fn eeg_notification_maps_to_electrode() {
        let mut data = vec![0, 1];
        data.extend([0x80, 0x08, 0x00].repeat(6));
        match decode_notification(EEG_CHARACTERISTICS[3], &data) {
            Some(TransportEvent::Eeg(r)) => {
                assert_eq!(r.electrode, 3);
                assert_eq!(r.samples.len(), 12);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn truncated_notification_is_malformed_not_dropped_silently() {
        match decode_notification(ACCELEROMETER_CHARACTERISTIC, &[0; 4]) {
            Some(TransportEvent::Malformed(PacketDecodeError::Truncated { kind, .. })) => {
                assert_eq!(kind, "accelerometer")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn control_and_unknown_produce_nothing() {
        assert!(decode_notification(CONTROL_CHARACTERISTIC, &[2, b'o', b'k']).is_none());
        assert!(decode_notification(Uuid::nil(), &[1, 2, 3]).is_none());
    }

    #[test]
    fn ppg_channel_index() {
        let data = [0, 1, 0, 0, 1, 0, 0, 2];
        match decode_notification(PPG_CHARACTERISTICS[1], &data) {
            Some(TransportEvent::Ppg(r)) => assert_eq!(r.ppg_channel, 1),
            other => panic!("unexpected {other:?}"),
        }
    }
}
