mod rtu;

pub use rtu::{
    crc16, decode_read_response, decode_write_echo, encode_read_request, encode_write_request,
    read_holding_registers, read_response, write_single_register,
};

use core::time::Duration;
use num_derive::{FromPrimitive, ToPrimitive};
use thiserror::Error;

/// Receive buffer capacity; responses longer than this are not collected.
pub const RESPONSE_CAPACITY: usize = 256;

/// Request frames for both supported functions are 8 bytes, as is the
/// write echo: slave, function, two big-endian u16 fields, CRC.
pub const REQUEST_LEN: usize = 8;
pub const WRITE_ECHO_LEN: usize = 8;

/// Bytes of a read response that are not register data: slave, function,
/// byte count, and the trailing CRC.
pub const READ_RESPONSE_OVERHEAD: usize = 5;

/// Most registers a single 0x03 response frame can carry.
pub const MAX_READ_COUNT: u16 = 0x7D;

/// Overall deadline for one response, and the pause between empty reads.
/// Serial reads are not guaranteed to return a full frame in one call, so
/// the reader polls against the deadline.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Quiet period between sending a request and polling for the reply.
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Set on the echoed function code when a slave reports an exception.
pub const EXCEPTION_FLAG: u8 = 0x80;

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum FunctionCode {
    ReadHoldingRegisters = 0x03,
    WriteSingleRegister = 0x06,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("register count {0} not in 1..={MAX_READ_COUNT}")]
    InvalidCount(u16),
    #[error("short write ({written} of {expected} bytes)")]
    ShortWrite { written: usize, expected: usize },
    #[error("response deadline expired with {got} of {expected} bytes")]
    IncompleteResponse { got: usize, expected: usize },
    #[error("response too short to parse ({len} bytes)")]
    ShortResponse { len: usize },
    #[error(
        "unexpected response echo (expected slave {expected_slave:02X} \
         function {expected_function:02X}, got {slave:02X} {function:02X})"
    )]
    UnexpectedEcho {
        expected_slave: u8,
        expected_function: u8,
        slave: u8,
        function: u8,
    },
    #[error("unexpected byte count {got} (expected {expected})")]
    UnexpectedByteCount { expected: u8, got: u8 },
    #[error("response CRC {got:04X} does not match computed {expected:04X}")]
    CrcMismatch { expected: u16, got: u16 },
    #[error(
        "write echo carries register {address:04X} = {value} \
         (sent {expected_address:04X} = {expected_value})"
    )]
    WriteEchoMismatch {
        expected_address: u16,
        expected_value: u16,
        address: u16,
        value: u16,
    },
}
