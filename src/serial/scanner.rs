//! Port discovery: enumeration, classification, exclude patterns and an
//! optional change-watch loop.

use std::fmt::Display;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serialport::SerialPortType;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::serial::manager::SessionManager;

/// Smallest allowed watch interval.
const MIN_WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// What kind of device backs a port name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortType {
    /// The backend gave no usable classification.
    Unspecified,
    /// A USB CDC/serial converter.
    Usb,
    /// An on-board UART.
    Native,
    /// A Bluetooth SPP port.
    Bluetooth,
    /// A pseudo-terminal or other software port.
    Virtual,
}

impl Display for PortType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PortType::Unspecified => "Unknown",
            PortType::Usb => "USB",
            PortType::Native => "Native",
            PortType::Bluetooth => "Bluetooth",
            PortType::Virtual => "Virtual",
        };
        write!(f, "{name}")
    }
}

/// A snapshot of one detected port. Never a live handle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    /// Platform-native name, e.g. `COM3` or `/dev/ttyUSB0`.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Synthesized hardware id, e.g. `USB\VID_0403&PID_6001`.
    pub hardware_id: String,
    /// USB manufacturer string, when known.
    pub manufacturer: String,
    /// USB product string, when known.
    pub product: String,
    /// USB serial number, when known.
    pub serial_number: String,
    /// USB vendor id as four hex digits, when known.
    pub vid: String,
    /// USB product id as four hex digits, when known.
    pub pid: String,
    /// Device classification.
    pub port_type: PortType,
    /// Whether a session currently holds this port.
    pub is_open: bool,
    /// Client id of the session holding the port, when open.
    pub locked_by: String,
}

impl Default for PortType {
    fn default() -> Self {
        PortType::Unspecified
    }
}

/// Called with (added, removed, current) whenever the watch loop observes a
/// change in the set of port names.
pub type PortChangeCallback = Box<dyn Fn(&[PortInfo], &[PortInfo], &[PortInfo]) + Send + Sync>;

/// Discovers and classifies serial ports.
///
/// Holds a manager reference so every snapshot can be annotated with
/// `is_open`/`locked_by` from the live session table.
pub struct Scanner {
    exclude_patterns: Vec<Regex>,
    cached: RwLock<Vec<PortInfo>>,
    manager: Arc<SessionManager>,
}

impl Scanner {
    /// A scanner dropping any port whose name matches one of the patterns.
    pub fn new(exclude_patterns: &[String], manager: Arc<SessionManager>) -> Result<Self, Error> {
        let exclude_patterns = exclude_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    Error::InvalidConfig(format!("bad exclude pattern `{pattern}`: {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            exclude_patterns,
            cached: RwLock::new(Vec::new()),
            manager,
        })
    }

    /// Enumerate currently present ports, sorted by name.
    ///
    /// The result is also retained; see [`Scanner::get_cached`].
    pub fn scan(&self) -> Result<Vec<PortInfo>, Error> {
        let detected = serialport::available_ports()
            .map_err(|e| Error::Internal(format!("failed to scan ports: {e}")))?;

        let result: Vec<PortInfo> = detected
            .into_iter()
            .filter(|port| !self.is_excluded(&port.port_name))
            .map(|port| self.describe(port))
            .sorted_by(|a, b| a.name.cmp(&b.name))
            .collect();

        *self.cached.write().expect("lock poisoned") = result.clone();

        Ok(result)
    }

    /// A copy of the last scan result.
    pub fn get_cached(&self) -> Vec<PortInfo> {
        self.cached.read().expect("lock poisoned").clone()
    }

    /// Re-scan and return the named port.
    pub fn get_port(&self, name: &str) -> Result<PortInfo, Error> {
        self.scan()?
            .into_iter()
            .find(|port| port.name == name)
            .ok_or_else(|| Error::PortNotFound(name.to_string()))
    }

    fn is_excluded(&self, name: &str) -> bool {
        self.exclude_patterns
            .iter()
            .any(|pattern| pattern.is_match(name))
    }

    fn describe(&self, port: serialport::SerialPortInfo) -> PortInfo {
        let mut info = PortInfo {
            name: port.port_name.clone(),
            ..Default::default()
        };

        let mut is_usb = false;
        let mut driver_says_bluetooth = false;

        match port.port_type {
            SerialPortType::UsbPort(usb) => {
                is_usb = true;
                info.vid = format!("{:04X}", usb.vid);
                info.pid = format!("{:04X}", usb.pid);
                info.manufacturer = usb.manufacturer.unwrap_or_default();
                info.product = usb.product.unwrap_or_default();
                info.serial_number = usb.serial_number.unwrap_or_default();
            }
            SerialPortType::BluetoothPort => driver_says_bluetooth = true,
            SerialPortType::PciPort | SerialPortType::Unknown => {}
        }

        info.port_type = classify_for(std::env::consts::OS, &info.name, is_usb, driver_says_bluetooth);

        if !info.vid.is_empty() && !info.pid.is_empty() {
            info.hardware_id = format!("USB\\VID_{}&PID_{}", info.vid, info.pid);
        }

        info.description = if !info.product.is_empty() {
            info.product.clone()
        } else if is_usb {
            "USB Serial Device".to_string()
        } else {
            "Serial Port".to_string()
        };

        if let Some(session) = self.manager.get_session(&info.name) {
            info.is_open = true;
            info.locked_by = session.client_id().to_string();
        }

        info
    }

    /// Watch for port changes, firing `callback` only when the name set
    /// actually changed. The interval is clamped to at least one second.
    /// Stopping via the returned handle is idempotent.
    pub fn watch(
        self: &Arc<Self>,
        interval: Duration,
        callback: PortChangeCallback,
    ) -> WatchHandle {
        let scanner = Arc::clone(self);
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let interval = interval.max(MIN_WATCH_INTERVAL);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let mut known: Vec<PortInfo> = Vec::new();

            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let snapshot = {
                    let scanner = Arc::clone(&scanner);
                    tokio::task::spawn_blocking(move || scanner.scan()).await
                };

                let current = match snapshot {
                    Ok(Ok(ports)) => ports,
                    Ok(Err(e)) => {
                        warn!(%e, "Port scan failed, will retry");
                        continue;
                    }
                    Err(e) => {
                        warn!(%e, "Scan task failed, stopping watch");
                        break;
                    }
                };

                let added: Vec<PortInfo> = current
                    .iter()
                    .filter(|port| !known.iter().any(|k| k.name == port.name))
                    .cloned()
                    .collect();
                let removed: Vec<PortInfo> = known
                    .iter()
                    .filter(|port| !current.iter().any(|c| c.name == port.name))
                    .cloned()
                    .collect();

                if !added.is_empty() || !removed.is_empty() {
                    debug!(added = added.len(), removed = removed.len(), "Port set changed");
                    callback(&added, &removed, &current);
                }

                known = current;
            }
        });

        WatchHandle { token, _task: task }
    }
}

/// Controls a running watch loop. Dropping the handle stops the loop.
pub struct WatchHandle {
    token: CancellationToken,
    _task: JoinHandle<()>,
}

impl WatchHandle {
    /// Ask the loop to stop. Safe to call more than once.
    pub fn stop(&self) {
        self.token.cancel();
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Classify a port name the way the given OS would.
///
/// The driver's own USB/Bluetooth flags always win; name patterns fill in the
/// rest, mirroring how each platform labels Bluetooth and pseudo terminals.
fn classify_for(os: &str, name: &str, is_usb: bool, driver_says_bluetooth: bool) -> PortType {
    if is_usb {
        return PortType::Usb;
    }
    if driver_says_bluetooth {
        return PortType::Bluetooth;
    }

    let lowered = name.to_lowercase();
    let bluetooth = match os {
        "windows" => lowered.contains("bluetooth") || lowered.contains("bth"),
        "linux" => name.starts_with("/dev/rfcomm"),
        "macos" => name.contains("Bluetooth"),
        _ => false,
    };
    if bluetooth {
        return PortType::Bluetooth;
    }

    if os == "linux" && (name.starts_with("/dev/pts/") || name.starts_with("/dev/pty")) {
        return PortType::Virtual;
    }

    PortType::Native
}
