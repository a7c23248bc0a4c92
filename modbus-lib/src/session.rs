use anyhow::Result;
use log::debug;
use thiserror::Error;

use crate::port::{self, Transport};
use crate::protocol;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,
}

/// One logical connection to a slave device. Starts closed; `connect`
/// opens the port and every read/write demands the open state. Closing is
/// idempotent and always releases the transport.
pub struct Session {
    device: String,
    baudrate: u32,
    slave: u8,
    transport: Option<Box<dyn Transport + Send>>,
}

impl Session {
    pub fn new(device: &str, baudrate: u32, slave: u8) -> Self {
        Self {
            device: device.to_string(),
            baudrate,
            slave,
            transport: None,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn baudrate(&self) -> u32 {
        self.baudrate
    }

    pub fn slave(&self) -> u8 {
        self.slave
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Open the serial device this session was created for.
    pub fn connect(&mut self, force: bool) -> Result<()> {
        self.disconnect();
        self.transport = Some(port::open_port(&self.device, self.baudrate, force)?);
        debug!("connect {} slave {}", self.device, self.slave);
        Ok(())
    }

    /// Open over an externally built transport, e.g. a simulated one.
    pub fn connect_with(&mut self, transport: Box<dyn Transport + Send>) {
        self.disconnect();
        self.transport = Some(transport);
        debug!("connect {} slave {} (injected transport)", self.device, self.slave);
    }

    pub fn disconnect(&mut self) {
        if self.transport.take().is_some() {
            debug!("disconnect {}", self.device);
        }
    }

    fn transport(&mut self) -> Result<&mut (dyn Transport + Send + 'static)> {
        self.transport
            .as_deref_mut()
            .ok_or_else(|| SessionError::NotConnected.into())
    }

    pub fn read_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        let slave = self.slave;
        let port = self.transport()?;
        protocol::read_holding_registers(port, slave, address, count)
    }

    pub fn read_register(&mut self, address: u16) -> Result<u16> {
        Ok(self.read_registers(address, 1)?[0])
    }

    pub fn write_register(&mut self, address: u16, value: u16) -> Result<()> {
        let slave = self.slave;
        let port = self.transport()?;
        protocol::write_single_register(port, slave, address, value)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}
