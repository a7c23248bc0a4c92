mod sim;

pub use sim::SimulatedTransport;

use anyhow::Result;
use core::time::Duration;
use log::debug;
use serialport::{self, ClearBuffer, DataBits, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use thiserror::Error;

/// Longest accepted device path.
pub const DEVICE_NAME_CAPACITY: usize = 256;

/// Per-call read timeout of the port itself; the overall response deadline
/// lives in the protocol layer.
pub const READ_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum PortError {
    #[error("{port_name:?} busy")]
    PortBusy { port_name: String },
    #[error("device name longer than {DEVICE_NAME_CAPACITY} bytes")]
    NameTooLong,
}

#[cfg(target_os = "linux")]
fn is_port_open(port_name: &str) -> bool {
    glob::glob("/proc/[0-9]*/fd/*")
        .unwrap()
        .filter_map(Result::ok)
        .filter_map(|path| std::fs::read_link(path).ok())
        .any(|link| link.to_str() == Some(port_name))
}

// TODO: implement proper check for macos/windows
#[cfg(not(target_os = "linux"))]
fn is_port_open(_port_name: &str) -> bool {
    false
}

/// Byte-oriented duplex channel. `read` is bounded by the port's own
/// timeout and returns 0 when nothing arrived.
pub trait Transport: Send {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn purge(&mut self) -> io::Result<()>;
}

impl std::fmt::Debug for dyn Transport + Send {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Transport")
    }
}

struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl Transport for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn purge(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::All).map_err(io::Error::from)
    }
}

pub fn open_port(
    port_name: &str,
    baudrate: u32,
    force: bool,
) -> Result<Box<dyn Transport + Send>> {
    if port_name.len() > DEVICE_NAME_CAPACITY {
        return Err(PortError::NameTooLong.into());
    }

    if !force && is_port_open(port_name) {
        return Err(PortError::PortBusy {
            port_name: port_name.to_string(),
        }
        .into());
    }

    let port = serialport::new(port_name, baudrate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .timeout(READ_TIMEOUT)
        .open_native()?;

    debug!("open_port OK: {} @ {} baud, 8N1", port_name, baudrate);
    Ok(Box::new(SerialTransport {
        port: Box::new(port),
    }))
}
