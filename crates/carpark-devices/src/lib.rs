//! Serial device drivers for the car park station controller.
//!
//! Each peripheral (IU antenna, KSM card reader, LCSC payment reader) runs
//! in its own task. Commands go into a per-device [`CommandQueue`] and results
//! come back as [`DeviceEvent`]s on a shared channel.
//!
//! # Layers
//!
//! - [`engine::ProtocolEngine`] is the sans-IO core: it takes bytes, write
//!   results and clock ticks and returns the bytes to write and the events
//!   to emit. It owns the [`state_machine`] and the timeout [`supervisor`].
//! - [`engine::DeviceProtocol`] is implemented once per device and holds
//!   what differs between them: encoding, response correlation, polling and
//!   session state.
//! - [`driver`] runs an engine over a [`Transport`].
//! - [`manager::StationManager`] starts the enabled devices from a
//!   `StationConfig`.
//!
//! # Example
//!
//! ```no_run
//! use carpark_core::KsmConfig;
//! use carpark_devices::KsmHandle;
//! use tokio::sync::mpsc;
//!
//! # async fn example(line: tokio::io::DuplexStream) -> carpark_core::Result<()> {
//! let (tx, mut rx) = mpsc::channel(16);
//! let ksm = KsmHandle::spawn(&KsmConfig::default(), line, tx);
//! ksm.init();
//! ksm.detect_card();
//!
//! while let Some(event) = rx.recv().await {
//!     println!("{event}");
//! }
//! ksm.shutdown().await
//! # }
//! ```

pub mod antenna;
pub mod driver;
pub mod engine;
pub mod events;
pub mod ksm;
pub mod lcsc;
pub mod manager;
pub mod queue;
pub mod state_machine;
pub mod supervisor;
pub mod transport;

pub use antenna::{AntennaHandle, AntennaProtocol, AntennaSession};
pub use driver::DeviceHandle;
pub use engine::{Action, DeviceProtocol, Outcome, ProtocolEngine, WriteOutcome};
pub use events::DeviceEvent;
pub use ksm::{KsmHandle, KsmProtocol, KsmSession};
pub use lcsc::{LcscHandle, LcscProtocol, LcscSession};
pub use manager::{StationHandle, StationManager};
pub use queue::CommandQueue;
pub use state_machine::{ProtocolEvent, ProtocolState, ProtocolStateMachine};
pub use transport::Transport;

#[cfg(feature = "serial")]
pub use transport::open_serial;
