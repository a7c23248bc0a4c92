use std::collections::{BTreeMap, VecDeque};
use std::io;

use log::debug;
use num_traits::FromPrimitive;

use super::Transport;
use crate::protocol::{crc16, FunctionCode, EXCEPTION_FLAG, MAX_READ_COUNT, REQUEST_LEN};

const ILLEGAL_FUNCTION: u8 = 0x01;
const ILLEGAL_DATA_ADDRESS: u8 = 0x02;
const ILLEGAL_DATA_VALUE: u8 = 0x03;

/// In-memory Modbus slave behind the `Transport` interface. Frames written
/// to it are answered from a register map; replies are drained by `read`.
/// Selected by configuration in place of a real port, so the protocol and
/// session layers run unchanged against it.
pub struct SimulatedTransport {
    slave: u8,
    registers: BTreeMap<u16, u16>,
    pending: VecDeque<u8>,
}

impl SimulatedTransport {
    pub fn new(slave: u8) -> Self {
        Self {
            slave,
            registers: BTreeMap::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn with_registers(slave: u8, registers: impl IntoIterator<Item = (u16, u16)>) -> Self {
        Self {
            slave,
            registers: registers.into_iter().collect(),
            pending: VecDeque::new(),
        }
    }

    pub fn set_register(&mut self, address: u16, value: u16) {
        self.registers.insert(address, value);
    }

    pub fn register(&self, address: u16) -> Option<u16> {
        self.registers.get(&address).copied()
    }

    fn enqueue(&mut self, mut frame: Vec<u8>) {
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        debug!("sim send {:02X?}", &frame);
        self.pending.extend(frame);
    }

    fn exception(&mut self, function: u8, code: u8) {
        self.enqueue(vec![self.slave, function | EXCEPTION_FLAG, code]);
    }

    /// A real bus stays silent for frames meant for someone else or
    /// mangled in transit, so those are dropped without a reply.
    fn handle_frame(&mut self, frame: &[u8]) {
        if frame.len() != REQUEST_LEN || frame[0] != self.slave {
            return;
        }

        let crc = u16::from_le_bytes([frame[6], frame[7]]);
        if crc != crc16(&frame[..6]) {
            debug!("sim drop: bad request crc");
            return;
        }

        let address = u16::from_be_bytes([frame[2], frame[3]]);
        let operand = u16::from_be_bytes([frame[4], frame[5]]);

        match FunctionCode::from_u8(frame[1]) {
            Some(FunctionCode::ReadHoldingRegisters) => self.read_registers(address, operand),
            Some(FunctionCode::WriteSingleRegister) => {
                self.registers.insert(address, operand);
                self.enqueue(frame[..6].to_vec());
            }
            None => self.exception(frame[1], ILLEGAL_FUNCTION),
        }
    }

    fn read_registers(&mut self, address: u16, count: u16) {
        let function = FunctionCode::ReadHoldingRegisters as u8;

        if count == 0 || count > MAX_READ_COUNT {
            self.exception(function, ILLEGAL_DATA_VALUE);
            return;
        }

        let mut reply = vec![self.slave, function, (2 * count) as u8];
        for offset in 0..count {
            let value = address
                .checked_add(offset)
                .and_then(|a| self.registers.get(&a).copied());
            match value {
                Some(value) => reply.extend_from_slice(&value.to_be_bytes()),
                None => {
                    self.exception(function, ILLEGAL_DATA_ADDRESS);
                    return;
                }
            }
        }
        self.enqueue(reply);
    }
}

impl Transport for SimulatedTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        debug!("sim recv {:02X?}", buf);
        self.handle_frame(buf);
        Ok(buf.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn purge(&mut self) -> io::Result<()> {
        self.pending.clear();
        Ok(())
    }
}
