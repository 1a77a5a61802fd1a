// SLCAN (Lawicel) serial CAN adapter
//
// Line protocol, every command ends with '\r':
//   C            close channel
//   S<n>         select bitrate (0 = 10k ... 8 = 1M)
//   O            open channel
//   t<iii><l><dd...>  standard frame, hex encoded
// The adapter answers '\r' on success and BEL (0x07) on error.

use serialport::{self, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, info};

use super::{BusError, BusTransport, CanFrame};

/// Default serial configuration for USB-SLCAN dongles
pub const DEFAULT_BAUDRATE: u32 = 115_200;
pub const DEFAULT_BITRATE: u32 = 500_000;
const SERIAL_TIMEOUT_MS: u64 = 10;

const CR: u8 = b'\r';
const BELL: u8 = 0x07;

/// Bitrates accepted by the `S` command, indexed by their code
const BITRATES: [u32; 9] = [
    10_000, 20_000, 50_000, 100_000, 125_000, 250_000, 500_000, 800_000, 1_000_000,
];

/// SLCAN adapter on a serial port
pub struct SlcanBus {
    port: Box<dyn SerialPort>,
    rx_buf: Vec<u8>,
}

impl SlcanBus {
    /// Open the port and bring the CAN channel up at `bitrate`
    pub fn open(port_name: &str, baudrate: u32, bitrate: u32) -> Result<Self, BusError> {
        let code = bitrate_code(bitrate)
            .ok_or_else(|| BusError::Rejected(format!("unsupported bitrate {}", bitrate)))?;

        info!(
            "Opening SLCAN adapter on {} ({} baud, {} bit/s)",
            port_name, baudrate, bitrate
        );
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(SERIAL_TIMEOUT_MS))
            .open()?;

        let mut bus = Self {
            port,
            rx_buf: Vec::with_capacity(256),
        };

        // Close first in case the adapter was left open
        bus.send_line(b"C")?;
        bus.send_line(format!("S{}", code).as_bytes())?;
        bus.send_line(b"O")?;
        Ok(bus)
    }

    fn send_line(&mut self, line: &[u8]) -> Result<(), BusError> {
        self.port.write_all(line)?;
        self.port.write_all(&[CR])?;
        self.port.flush()?;
        Ok(())
    }

    /// Pull whatever the adapter has buffered without waiting
    fn fill_rx_buf(&mut self) -> Result<(), BusError> {
        let pending = self.port.bytes_to_read()? as usize;
        if pending == 0 {
            return Ok(());
        }
        let mut chunk = vec![0u8; pending];
        let read = self.port.read(&mut chunk)?;
        self.rx_buf.extend_from_slice(&chunk[..read]);
        Ok(())
    }
}

impl BusTransport for SlcanBus {
    fn transmit(&mut self, frame: &CanFrame) -> Result<(), BusError> {
        let line = encode_frame(frame);
        debug!("SLCAN tx {}", String::from_utf8_lossy(&line));
        self.send_line(&line)
    }

    fn try_receive(&mut self) -> Result<Option<CanFrame>, BusError> {
        self.fill_rx_buf()?;

        // Consume complete lines until one holds a data frame
        while let Some(end) = self.rx_buf.iter().position(|&b| b == CR || b == BELL) {
            let line: Vec<u8> = self.rx_buf.drain(..=end).collect();
            if line[end] == BELL {
                return Err(BusError::Rejected("adapter answered BEL".to_string()));
            }
            let body = &line[..end];
            match body.first() {
                Some(b't') => return parse_frame(body).map(Some),
                // 'z' / 'Z' acknowledge our own transmissions, empty line acks commands
                _ => continue,
            }
        }
        Ok(None)
    }
}

/// Map a bitrate to its `S` command code
fn bitrate_code(bitrate: u32) -> Option<usize> {
    BITRATES.iter().position(|&b| b == bitrate)
}

/// Encode a frame as `t<iii><l><dd...>` (without the trailing '\r')
fn encode_frame(frame: &CanFrame) -> Vec<u8> {
    let mut line = format!("t{:03X}{:X}", frame.id & 0x7FF, frame.len);
    for byte in frame.payload() {
        line.push_str(&format!("{:02X}", byte));
    }
    line.into_bytes()
}

/// Parse a `t<iii><l><dd...>` line (without the trailing '\r')
fn parse_frame(line: &[u8]) -> Result<CanFrame, BusError> {
    // Fields are sliced by byte offset
    if !line.is_ascii() {
        return Err(BusError::Malformed("non-ascii line".to_string()));
    }
    let text = std::str::from_utf8(line)
        .map_err(|_| BusError::Malformed("non-ascii line".to_string()))?;
    if text.len() < 5 {
        return Err(BusError::Malformed(format!("line too short: {:?}", text)));
    }

    let id = u16::from_str_radix(&text[1..4], 16)
        .map_err(|_| BusError::Malformed(format!("bad id in {:?}", text)))?;
    let len = usize::from_str_radix(&text[4..5], 16)
        .map_err(|_| BusError::Malformed(format!("bad length in {:?}", text)))?;
    if len > 8 || text.len() < 5 + 2 * len {
        return Err(BusError::Malformed(format!("bad payload in {:?}", text)));
    }

    let mut payload = [0u8; 8];
    for (i, byte) in payload.iter_mut().enumerate().take(len) {
        let start = 5 + 2 * i;
        *byte = u8::from_str_radix(&text[start..start + 2], 16)
            .map_err(|_| BusError::Malformed(format!("bad data in {:?}", text)))?;
    }

    Ok(CanFrame::new(id, &payload[..len]))
}
