// CAN bus abstraction for the drive chain
//
// Provides:
// - A fixed-size CAN frame type
// - The transport trait every bus adapter implements
// - A shared handle so motor nodes and the dispatch loop use one adapter

pub mod slcan;

use parking_lot::Mutex;
use std::sync::Arc;

pub use slcan::SlcanBus;

/// CANopen function codes used by the platform
pub const COB_NMT: u16 = 0x000;
pub const COB_SYNC: u16 = 0x080;
pub const COB_HEARTBEAT: u16 = 0x700;

/// One classic CAN frame with an 11-bit identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CanFrame {
    pub id: u16,
    pub len: u8,
    pub data: [u8; 8],
}

impl CanFrame {
    /// Build a frame, truncating the payload to 8 bytes
    pub fn new(id: u16, payload: &[u8]) -> Self {
        let len = payload.len().min(8);
        let mut data = [0u8; 8];
        data[..len].copy_from_slice(&payload[..len]);
        Self {
            id,
            len: len as u8,
            data,
        }
    }

    /// Valid part of the payload
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// Error types for bus communication
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Adapter rejected command: {0}")]
    Rejected(String),
}

/// A CAN adapter: send one frame, poll one frame without blocking
pub trait BusTransport: Send {
    fn transmit(&mut self, frame: &CanFrame) -> Result<(), BusError>;

    /// Returns `Ok(None)` when nothing is pending
    fn try_receive(&mut self) -> Result<Option<CanFrame>, BusError>;
}

/// Transport handle shared by the coordinator and every node
pub type SharedBus = Arc<Mutex<dyn BusTransport>>;

/// Wrap an adapter into a shared handle
pub fn shared<B: BusTransport + 'static>(bus: B) -> SharedBus {
    Arc::new(Mutex::new(bus))
}
