//! An in-memory loopback driver, useful to exercise sessions without actual
//! serial ports. Everything written to a port comes back on its read side.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::serial::driver::{PortDriver, PortOpener};
use crate::serial::settings::PortSettings;

/// Read timeout used when the settings keep the driver default.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// How often a blocked read re-checks the line.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

type Line = Arc<Mutex<VecDeque<u8>>>;

/// Opens loopback ports. Any name is accepted; the same name maps to the same
/// line, so a re-opened port observes bytes left over from an earlier session.
#[derive(Debug, Default)]
pub struct LoopbackOpener {
    lines: Mutex<HashMap<String, Line>>,
}

impl LoopbackOpener {
    /// A fresh opener with no lines.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PortOpener for LoopbackOpener {
    fn open(&self, name: &str, settings: &PortSettings) -> Result<Box<dyn PortDriver>, Error> {
        settings.validate()?;

        let line = self
            .lines
            .lock()
            .expect("lock poisoned")
            .entry(name.to_string())
            .or_default()
            .clone();

        Ok(Box::new(LoopbackPort {
            line,
            read_timeout: settings.read_timeout().unwrap_or(DEFAULT_READ_TIMEOUT),
        }))
    }
}

/// A port whose writes become its own subsequent reads.
pub struct LoopbackPort {
    line: Line,
    read_timeout: Duration,
}

impl PortDriver for LoopbackPort {
    fn set_mode(&mut self, settings: &PortSettings) -> Result<(), Error> {
        // The loopback has no line discipline; accept anything valid.
        settings.validate()
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.read_timeout = timeout;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.line.lock().expect("lock poisoned").extend(data);
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let deadline = Instant::now() + self.read_timeout;

        loop {
            {
                let mut line = self.line.lock().expect("lock poisoned");
                if !line.is_empty() {
                    let n = buf.len().min(line.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = line.pop_front().expect("len checked");
                    }
                    return Ok(n);
                }
            }

            if Instant::now() >= deadline {
                // Timeout with no data.
                return Ok(0);
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn reset_input_buffer(&mut self) -> Result<(), Error> {
        // Bytes in the line are already on the wire; the loopback has no
        // driver-side buffer to discard.
        Ok(())
    }

    fn reset_output_buffer(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn settings() -> PortSettings {
        PortSettings {
            read_timeout_ms: 10,
            ..Default::default()
        }
    }

    #[test]
    fn loopback() {
        let opener = LoopbackOpener::new();
        let mut port = opener.open("loop0", &settings()).unwrap();

        assert_eq!(port.write(b"hi").unwrap(), 2);

        let mut buf = [0u8; 16];
        let n = port.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");
    }

    #[test]
    fn empty_read_times_out_with_zero() {
        let opener = LoopbackOpener::new();
        let mut port = opener.open("loop0", &settings()).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(port.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn same_name_shares_the_line() {
        let opener = LoopbackOpener::new();
        let mut a = opener.open("loop0", &settings()).unwrap();
        let mut b = opener.open("loop0", &settings()).unwrap();

        a.write(b"x").unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(b.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'x');
    }

    #[test]
    fn buffer_resets_leave_the_line_intact() {
        let opener = LoopbackOpener::new();
        let mut port = opener.open("loop0", &settings()).unwrap();

        port.write(b"kept").unwrap();
        port.reset_input_buffer().unwrap();
        port.reset_output_buffer().unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(port.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"kept");
    }
}
