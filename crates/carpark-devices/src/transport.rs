//! Serial line adapter.
//!
//! Any `AsyncRead + AsyncWrite` stream can carry a device protocol. Real
//! stations use [`open_serial`]; tests use `tokio::io::duplex`.

use tokio::io::{AsyncRead, AsyncWrite};

#[cfg(feature = "serial")]
use carpark_core::{Error, Parity, Result, SerialSettings};
#[cfg(feature = "serial")]
use tracing::info;

/// Byte stream a device driver runs over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Open a serial line with the configured parameters.
///
/// # Errors
/// `Config` for unsupported character sizes or stop bits, `Io` if the port
/// cannot be opened.
#[cfg(feature = "serial")]
pub fn open_serial(settings: &SerialSettings) -> Result<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    let data_bits = match settings.data_bits {
        7 => tokio_serial::DataBits::Seven,
        8 => tokio_serial::DataBits::Eight,
        other => return Err(Error::Config(format!("unsupported data bits {other}"))),
    };
    let stop_bits = match settings.stop_bits {
        1 => tokio_serial::StopBits::One,
        2 => tokio_serial::StopBits::Two,
        other => return Err(Error::Config(format!("unsupported stop bits {other}"))),
    };
    let parity = match settings.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    };

    let stream = tokio_serial::new(&settings.port, settings.baud_rate)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(parity)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| Error::Io(std::io::Error::other(format!("{}: {e}", settings.port))))?;

    info!(
        port = %settings.port,
        baud = settings.baud_rate,
        "Serial port opened"
    );
    Ok(stream)
}
