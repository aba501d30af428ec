use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Error;
use crate::serial::settings::PortSettings;

/// Read timeout applied when the settings keep the driver default.
///
/// The system library would otherwise return immediately on an empty line,
/// turning the continuous read loop into a spin.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// The capability set every port backend provides.
///
/// Reads and writes are blocking; a read is bounded by the configured read
/// timeout and yields `Ok(0)` when the timeout expired with nothing to read.
/// This is the only seam that touches the underlying serial library.
pub trait PortDriver: Send {
    /// Apply new line settings to the open handle.
    fn set_mode(&mut self, settings: &PortSettings) -> Result<(), Error>;

    /// Change the read timeout on the open handle.
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), Error>;

    /// Blocking write. Returns the number of bytes the driver accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize, Error>;

    /// Blocking read bounded by the configured timeout.
    ///
    /// `Ok(0)` means the timeout expired with no data; it is not an error.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    /// Discard bytes received but not yet read.
    fn reset_input_buffer(&mut self) -> Result<(), Error>;

    /// Discard bytes written but not yet transmitted.
    fn reset_output_buffer(&mut self) -> Result<(), Error>;

    /// Release the OS handle.
    ///
    /// Dropping the driver also closes it; this exists so close errors can be
    /// reported to the caller.
    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Opens [`PortDriver`]s by platform port name.
pub trait PortOpener: Send + Sync {
    /// Open the named port with the given settings already applied.
    fn open(&self, name: &str, settings: &PortSettings) -> Result<Box<dyn PortDriver>, Error>;
}

/// Opener backed by the system serial library.
#[derive(Debug, Default)]
pub struct SystemOpener;

impl PortOpener for SystemOpener {
    fn open(&self, name: &str, settings: &PortSettings) -> Result<Box<dyn PortDriver>, Error> {
        let port = serialport::new(name, settings.baud_rate)
            .data_bits(settings.data_bits.into())
            .stop_bits(settings.stop_bits.try_into()?)
            .parity(settings.parity.try_into()?)
            .flow_control(settings.flow_control.into())
            .timeout(settings.read_timeout().unwrap_or(DEFAULT_READ_TIMEOUT))
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => Error::PortNotFound(name.into()),
                _ => Error::Io(format!("failed to open {name}: {e}")),
            })?;

        Ok(Box::new(SystemPort { port }))
    }
}

struct SystemPort {
    port: Box<dyn serialport::SerialPort>,
}

fn driver_error(e: serialport::Error) -> Error {
    Error::Io(e.to_string())
}

impl PortDriver for SystemPort {
    fn set_mode(&mut self, settings: &PortSettings) -> Result<(), Error> {
        self.port
            .set_baud_rate(settings.baud_rate)
            .map_err(driver_error)?;
        self.port
            .set_data_bits(settings.data_bits.into())
            .map_err(driver_error)?;
        self.port
            .set_stop_bits(settings.stop_bits.try_into()?)
            .map_err(driver_error)?;
        self.port
            .set_parity(settings.parity.try_into()?)
            .map_err(driver_error)?;
        self.port
            .set_flow_control(settings.flow_control.into())
            .map_err(driver_error)?;

        Ok(())
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.port.set_timeout(timeout).map_err(driver_error)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.port.write(data).map_err(|e| Error::Io(e.to_string()))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(Error::Io(e.to_string())),
        }
    }

    fn reset_input_buffer(&mut self) -> Result<(), Error> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(driver_error)
    }

    fn reset_output_buffer(&mut self) -> Result<(), Error> {
        self.port
            .clear(serialport::ClearBuffer::Output)
            .map_err(driver_error)
    }
}
