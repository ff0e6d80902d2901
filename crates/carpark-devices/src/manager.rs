//! Station device manager.
//!
//! The `StationManager` builds one driver task per enabled device and
//! funnels every device event into a single channel.
//!
//! ```text
//! ┌──────────┐       ┌─────────────────┐
//! │ Antenna  │──────►│                 │
//! │ Task     │       │  Event Channel  │
//! └──────────┘       │  (mpsc)         │
//!                    │                 │──────► Station controller
//! ┌──────────┐       │                 │
//! │ KSM      │──────►│                 │
//! │ Task     │       └─────────────────┘
//! └──────────┘               ▲
//!                            │
//! ┌──────────┐               │
//! │ LCSC     │───────────────┘
//! │ Task     │
//! └──────────┘
//! ```
//!
//! # Examples
//!
//! ```no_run
//! use carpark_core::StationConfig;
//! use carpark_devices::manager::StationManager;
//!
//! #[tokio::main]
//! async fn main() -> carpark_core::Result<()> {
//!     let config = StationConfig::load("station.toml".as_ref())?;
//!     let mut manager = StationManager::new(config);
//!     manager.open_serial_ports()?;
//!
//!     let mut station = manager.start()?;
//!     if let Some(antenna) = station.antenna() {
//!         antenna.start_scanning();
//!     }
//!     while let Some(event) = station.recv().await {
//!         println!("{event}");
//!     }
//!     station.shutdown().await
//! }
//! ```

use crate::antenna::AntennaHandle;
use crate::events::DeviceEvent;
use crate::ksm::KsmHandle;
use crate::lcsc::LcscHandle;
use crate::transport::Transport;
use carpark_core::{DeviceKind, Error, Result, StationConfig};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[cfg(feature = "serial")]
use crate::transport::open_serial;

/// Capacity of the shared event channel.
const EVENT_CHANNEL_SIZE: usize = 100;

type BoxedLine = Box<dyn Transport>;

/// Running station devices and their merged event stream.
pub struct StationHandle {
    antenna: Option<AntennaHandle>,
    ksm: Option<KsmHandle>,
    lcsc: Option<LcscHandle>,
    event_rx: mpsc::Receiver<DeviceEvent>,
}

impl StationHandle {
    /// Next event from any device.
    ///
    /// Returns `None` once every device task has stopped.
    pub async fn recv(&mut self) -> Option<DeviceEvent> {
        self.event_rx.recv().await
    }

    pub fn antenna(&self) -> Option<&AntennaHandle> {
        self.antenna.as_ref()
    }

    pub fn ksm(&self) -> Option<&KsmHandle> {
        self.ksm.as_ref()
    }

    pub fn lcsc(&self) -> Option<&LcscHandle> {
        self.lcsc.as_ref()
    }

    /// Stop every device task and wait for all of them.
    ///
    /// Task errors are logged and counted but do not fail the shutdown.
    pub async fn shutdown(self) -> Result<()> {
        let mut results = Vec::with_capacity(3);
        if let Some(antenna) = self.antenna {
            results.push((DeviceKind::Antenna, antenna.shutdown().await));
        }
        if let Some(ksm) = self.ksm {
            results.push((DeviceKind::Ksm, ksm.shutdown().await));
        }
        if let Some(lcsc) = self.lcsc {
            results.push((DeviceKind::Lcsc, lcsc.shutdown().await));
        }

        let mut error_count = 0;
        for (device, result) in results {
            if let Err(e) = result {
                warn!(%device, error = %e, "Device task ended with error");
                error_count += 1;
            }
        }
        info!(error_count, "Station stopped");
        Ok(())
    }
}

/// Builds the station's device tasks.
///
/// Every enabled device needs a line: either registered explicitly (any
/// [`Transport`], e.g. a duplex stream in tests) or opened from its serial
/// settings with `open_serial_ports()`.
pub struct StationManager {
    config: StationConfig,
    antenna: Option<BoxedLine>,
    ksm: Option<BoxedLine>,
    lcsc: Option<BoxedLine>,
    event_tx: mpsc::Sender<DeviceEvent>,
    event_rx: mpsc::Receiver<DeviceEvent>,
}

impl StationManager {
    pub fn new(config: StationConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        Self {
            config,
            antenna: None,
            ksm: None,
            lcsc: None,
            event_tx,
            event_rx,
        }
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    pub fn register_antenna(&mut self, line: impl Transport) {
        self.antenna = Some(Box::new(line));
    }

    pub fn register_ksm(&mut self, line: impl Transport) {
        self.ksm = Some(Box::new(line));
    }

    pub fn register_lcsc(&mut self, line: impl Transport) {
        self.lcsc = Some(Box::new(line));
    }

    /// Open the serial port of every enabled device that has no line yet.
    ///
    /// # Errors
    /// The first port that fails to open.
    #[cfg(feature = "serial")]
    pub fn open_serial_ports(&mut self) -> Result<()> {
        if self.config.antenna.enabled && self.antenna.is_none() {
            self.antenna = Some(Box::new(open_serial(&self.config.antenna.serial)?));
        }
        if self.config.ksm.enabled && self.ksm.is_none() {
            self.ksm = Some(Box::new(open_serial(&self.config.ksm.serial)?));
        }
        if self.config.lcsc.enabled && self.lcsc.is_none() {
            self.lcsc = Some(Box::new(open_serial(&self.config.lcsc.serial)?));
        }
        Ok(())
    }

    /// Spawn a driver task for every enabled device.
    ///
    /// # Errors
    /// `Config` if an enabled device has no line or the LCSC login key is
    /// invalid.
    pub fn start(self) -> Result<StationHandle> {
        let Self {
            config,
            antenna,
            ksm,
            lcsc,
            event_tx,
            event_rx,
        } = self;

        let antenna = take_line(DeviceKind::Antenna, config.antenna.enabled, antenna)?
            .map(|line| AntennaHandle::spawn(&config.antenna, line, event_tx.clone()));
        let ksm = take_line(DeviceKind::Ksm, config.ksm.enabled, ksm)?
            .map(|line| KsmHandle::spawn(&config.ksm, line, event_tx.clone()));
        let lcsc = take_line(DeviceKind::Lcsc, config.lcsc.enabled, lcsc)?
            .map(|line| LcscHandle::spawn(&config.lcsc, line, event_tx.clone()))
            .transpose()?;

        info!(
            antenna = antenna.is_some(),
            ksm = ksm.is_some(),
            lcsc = lcsc.is_some(),
            "Station started"
        );
        Ok(StationHandle {
            antenna,
            ksm,
            lcsc,
            event_rx,
        })
    }
}

fn take_line(device: DeviceKind, enabled: bool, line: Option<BoxedLine>) -> Result<Option<BoxedLine>> {
    match (enabled, line) {
        (true, Some(line)) => Ok(Some(line)),
        (true, None) => Err(Error::Config(format!("{device} is enabled but has no line"))),
        (false, Some(_)) => {
            debug!(%device, "Ignoring line of disabled device");
            Ok(None)
        }
        (false, None) => Ok(None),
    }
}
