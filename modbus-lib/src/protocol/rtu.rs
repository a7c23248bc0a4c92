use super::{
    FunctionCode, ProtocolError, MAX_READ_COUNT, POLL_INTERVAL, READ_RESPONSE_OVERHEAD,
    REQUEST_LEN, RESPONSE_CAPACITY, RESPONSE_TIMEOUT, SETTLE_DELAY, WRITE_ECHO_LEN,
};
use crate::port::Transport;

use anyhow::Result;
use core::time::Duration;
use log::debug;
use std::thread;
use std::time::Instant;

/// Modbus RTU CRC16: init 0xFFFF, reflected polynomial 0xA001, one
/// XOR-and-shift round per input bit.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;

    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn encode_request(
    buffer: &mut [u8],
    slave: u8,
    function: FunctionCode,
    address: u16,
    operand: u16,
) -> usize {
    assert!(buffer.len() >= REQUEST_LEN);

    buffer[0] = slave;
    buffer[1] = function as u8;
    buffer[2..4].copy_from_slice(&address.to_be_bytes());
    buffer[4..6].copy_from_slice(&operand.to_be_bytes());

    let crc = crc16(&buffer[0..6]);
    buffer[6..8].copy_from_slice(&crc.to_le_bytes());
    REQUEST_LEN
}

// Protocol fields go out big-endian; the CRC alone is appended low byte
// first.
pub fn encode_read_request(buffer: &mut [u8], slave: u8, address: u16, count: u16) -> usize {
    encode_request(buffer, slave, FunctionCode::ReadHoldingRegisters, address, count)
}

pub fn encode_write_request(buffer: &mut [u8], slave: u8, address: u16, value: u16) -> usize {
    encode_request(buffer, slave, FunctionCode::WriteSingleRegister, address, value)
}

pub fn decode_read_response(frame: &[u8], slave: u8, count: u16) -> Result<Vec<u16>> {
    if frame.len() < READ_RESPONSE_OVERHEAD {
        return Err(ProtocolError::ShortResponse { len: frame.len() }.into());
    }

    let function = FunctionCode::ReadHoldingRegisters as u8;
    if frame[0] != slave || frame[1] != function {
        // Covers wrong-device echoes and exception responses (function
        // with the 0x80 flag), which are not decoded further.
        return Err(ProtocolError::UnexpectedEcho {
            expected_slave: slave,
            expected_function: function,
            slave: frame[0],
            function: frame[1],
        }
        .into());
    }

    let byte_count = frame[2];
    if usize::from(byte_count) != 2 * usize::from(count) {
        return Err(ProtocolError::UnexpectedByteCount {
            expected: (2 * count) as u8,
            got: byte_count,
        }
        .into());
    }

    let data_end = 3 + usize::from(byte_count);
    if frame.len() < data_end + 2 {
        return Err(ProtocolError::ShortResponse { len: frame.len() }.into());
    }

    let got = u16::from_le_bytes([frame[data_end], frame[data_end + 1]]);
    let expected = crc16(&frame[..data_end]);
    if got != expected {
        return Err(ProtocolError::CrcMismatch { expected, got }.into());
    }

    Ok(frame[3..data_end]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

// A Write Single Register reply echoes the request.
pub fn decode_write_echo(frame: &[u8], slave: u8, address: u16, value: u16) -> Result<()> {
    if frame.len() < WRITE_ECHO_LEN {
        return Err(ProtocolError::ShortResponse { len: frame.len() }.into());
    }

    let function = FunctionCode::WriteSingleRegister as u8;
    if frame[0] != slave || frame[1] != function {
        return Err(ProtocolError::UnexpectedEcho {
            expected_slave: slave,
            expected_function: function,
            slave: frame[0],
            function: frame[1],
        }
        .into());
    }

    let got = u16::from_le_bytes([frame[6], frame[7]]);
    let expected = crc16(&frame[..6]);
    if got != expected {
        return Err(ProtocolError::CrcMismatch { expected, got }.into());
    }

    let echo_address = u16::from_be_bytes([frame[2], frame[3]]);
    let echo_value = u16::from_be_bytes([frame[4], frame[5]]);
    if echo_address != address || echo_value != value {
        return Err(ProtocolError::WriteEchoMismatch {
            expected_address: address,
            expected_value: value,
            address: echo_address,
            value: echo_value,
        }
        .into());
    }

    Ok(())
}

/// Accumulate response bytes until at least `min_len` arrived or the
/// deadline expired, sleeping between empty reads.
pub fn read_response(
    port: &mut dyn Transport,
    min_len: usize,
    overall_timeout: Duration,
) -> Result<Vec<u8>> {
    let mut response = vec![0u8; RESPONSE_CAPACITY];
    let mut total = 0;
    let start = Instant::now();

    while total < RESPONSE_CAPACITY && start.elapsed() < overall_timeout {
        let read = port.read(&mut response[total..])?;
        if read == 0 {
            thread::sleep(POLL_INTERVAL);
            continue;
        }
        total += read;
        if total >= min_len {
            break;
        }
    }

    if total < min_len {
        return Err(ProtocolError::IncompleteResponse {
            got: total,
            expected: min_len,
        }
        .into());
    }

    response.truncate(total);
    Ok(response)
}

fn send_request(port: &mut dyn Transport, frame: &[u8]) -> Result<()> {
    port.purge()?;
    debug!("send {:02X?}", frame);

    let written = port.write(frame)?;
    if written != frame.len() {
        return Err(ProtocolError::ShortWrite {
            written,
            expected: frame.len(),
        }
        .into());
    }

    // Give the slave a quiet period to turn the line around.
    thread::sleep(SETTLE_DELAY);
    Ok(())
}

pub fn read_holding_registers(
    port: &mut dyn Transport,
    slave: u8,
    address: u16,
    count: u16,
) -> Result<Vec<u16>> {
    if count == 0 || count > MAX_READ_COUNT {
        return Err(ProtocolError::InvalidCount(count).into());
    }

    let mut buffer = [0u8; REQUEST_LEN];
    let len = encode_read_request(&mut buffer, slave, address, count);

    debug!("read {} {:04X} {}", slave, address, count);
    send_request(port, &buffer[0..len])?;

    let min_len = READ_RESPONSE_OVERHEAD + 2 * usize::from(count);
    let response = read_response(port, min_len, RESPONSE_TIMEOUT)?;
    debug!("recv {:02X?}", &response);

    decode_read_response(&response, slave, count)
}

pub fn write_single_register(
    port: &mut dyn Transport,
    slave: u8,
    address: u16,
    value: u16,
) -> Result<()> {
    let mut buffer = [0u8; REQUEST_LEN];
    let len = encode_write_request(&mut buffer, slave, address, value);

    debug!("write {} {:04X} {}", slave, address, value);
    send_request(port, &buffer[0..len])?;

    let response = read_response(port, WRITE_ECHO_LEN, RESPONSE_TIMEOUT)?;
    debug!("recv {:02X?}", &response);

    decode_write_echo(&response, slave, address, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crc::{Crc, CRC_16_MODBUS};
    use std::io;

    struct SilentTransport;

    impl Transport for SilentTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn purge(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Hands out a canned response a few bytes per read call, the way a
    /// serial port does mid-frame.
    struct DribbleTransport {
        frame: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl Transport for DribbleTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.chunk.min(self.frame.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.frame[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }

        fn purge(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn crc_reference_vectors() {
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
        assert_eq!(crc16(&[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]), 0x8776);
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }

    #[test]
    fn crc_matches_crc_crate() {
        let reference = Crc::<u16>::new(&CRC_16_MODBUS);
        for frame in [
            &[0x01, 0x03, 0x00, 0x00, 0x00, 0x01][..],
            &[0x01, 0x06, 0x00, 0x10, 0x12, 0x34][..],
            &[0x02, 0x03, 0x02, 0x04, 0xD2][..],
            &[][..],
        ] {
            assert_eq!(crc16(frame), reference.checksum(frame));
        }
    }

    #[test]
    fn encode_read() {
        let reference: [u8; 8] = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A];
        let mut check: [u8; 8] = [0; 8];

        assert_eq!(encode_read_request(&mut check, 1, 0, 1), check.len());
        assert_eq!(reference, check);
    }

    #[test]
    fn encode_write() {
        let reference: [u8; 8] = [0x01, 0x06, 0x00, 0x10, 0x12, 0x34, 0x85, 0x78];
        let mut check: [u8; 8] = [0; 8];

        assert_eq!(encode_write_request(&mut check, 1, 0x0010, 0x1234), check.len());
        assert_eq!(reference, check);
    }

    #[test]
    fn encode_is_deterministic() {
        let mut first: [u8; 8] = [0; 8];
        let mut second: [u8; 8] = [0xFF; 8];

        encode_read_request(&mut first, 7, 0x0100, 4);
        encode_read_request(&mut second, 7, 0x0100, 4);
        assert_eq!(first, second);
    }

    #[test]
    fn decode_read_single() {
        let reference: [u8; 7] = [0x01, 0x03, 0x02, 0x00, 0xFA, 0x38, 0x07];

        assert_eq!(decode_read_response(&reference, 1, 1).unwrap(), vec![250]);
    }

    #[test]
    fn decode_read_multi() {
        let mut frame = vec![0x01, 0x03, 0x06, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());

        assert_eq!(
            decode_read_response(&frame, 1, 3).unwrap(),
            vec![0x0102, 0x0304, 0x0506]
        );
    }

    #[test]
    fn decode_short_response() {
        let frame: [u8; 7] = [0x01, 0x03, 0x02, 0x00, 0xFA, 0x38, 0x07];
        let err = decode_read_response(&frame[..4], 1, 1).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::ShortResponse { len: 4 })
        ));
    }

    #[test]
    fn decode_address_mismatch() {
        let frame: [u8; 7] = [0x02, 0x03, 0x02, 0x04, 0xD2, 0x7E, 0xD9];
        let err = decode_read_response(&frame, 1, 1).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::UnexpectedEcho { slave: 2, .. })
        ));
    }

    #[test]
    fn decode_exception_echo() {
        let mut frame = vec![0x01, 0x83, 0x02];
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());

        let err = decode_read_response(&frame, 1, 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::UnexpectedEcho { function: 0x83, .. })
        ));
    }

    #[test]
    fn decode_byte_count_mismatch() {
        let mut frame = vec![0x01, 0x03, 0x04, 0x00, 0xFA, 0x00, 0xFB];
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());

        let err = decode_read_response(&frame, 1, 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::UnexpectedByteCount { expected: 2, got: 4 })
        ));
    }

    #[test]
    fn decode_crc_mismatch() {
        let frame: [u8; 7] = [0x01, 0x03, 0x02, 0x00, 0xFA, 0x38, 0x06];
        let err = decode_read_response(&frame, 1, 1).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn decode_write_echo_roundtrip() {
        let mut frame: [u8; 8] = [0; 8];
        encode_write_request(&mut frame, 1, 0x0010, 0x1234);

        decode_write_echo(&frame, 1, 0x0010, 0x1234).unwrap();

        let err = decode_write_echo(&frame, 1, 0x0010, 0x1235).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::WriteEchoMismatch { value: 0x1234, .. })
        ));
    }

    #[test]
    fn reader_meets_deadline() {
        let mut port = SilentTransport;
        let deadline = Duration::from_millis(100);

        let start = Instant::now();
        let err = read_response(&mut port, 7, deadline).unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::IncompleteResponse { got: 0, expected: 7 })
        ));
        assert!(elapsed >= deadline);
        assert!(elapsed < deadline + 10 * POLL_INTERVAL);
    }

    #[test]
    fn reader_accumulates_partial_frames() {
        let mut port = DribbleTransport {
            frame: vec![0x01, 0x03, 0x02, 0x00, 0xFA, 0x38, 0x07],
            pos: 0,
            chunk: 3,
        };

        let response = read_response(&mut port, 7, Duration::from_millis(100)).unwrap();
        assert_eq!(response, vec![0x01, 0x03, 0x02, 0x00, 0xFA, 0x38, 0x07]);
    }

    #[test]
    fn read_rejects_bad_count() {
        let mut port = SilentTransport;

        for count in [0, MAX_READ_COUNT + 1] {
            let err = read_holding_registers(&mut port, 1, 0, count).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<ProtocolError>(),
                Some(ProtocolError::InvalidCount(_))
            ));
        }
    }

    #[test]
    fn read_transaction_over_dribbling_port() {
        let mut response = vec![0x01, 0x03, 0x02, 0x00, 0xFA];
        let crc = crc16(&response);
        response.extend_from_slice(&crc.to_le_bytes());

        let mut port = DribbleTransport {
            frame: response,
            pos: 0,
            chunk: 2,
        };

        assert_eq!(read_holding_registers(&mut port, 1, 0, 1).unwrap(), vec![250]);
    }
}
