use crate::config::AddressType;
use crate::error::Result;
use async_trait::async_trait;
use std::fmt;

/// The two telemetry characteristics read each round, in round order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Block {
    /// AC output and DC bus values (characteristic 0x2A03)
    Inverter,
    /// PV input values (characteristic 0x2A11)
    Pv,
}

impl Block {
    pub const ROUND: [Self; 2] = [Self::Inverter, Self::Pv];

    /// GATT service UUID containing the characteristic
    pub const fn service_uuid(self) -> &'static str {
        match self {
            Self::Inverter => "00001810-0000-1000-8000-00805f9b34fb",
            Self::Pv => "00001811-0000-1000-8000-00805f9b34fb",
        }
    }

    /// GATT characteristic UUID
    pub const fn characteristic_uuid(self) -> &'static str {
        match self {
            Self::Inverter => "00002a03-0000-1000-8000-00805f9b34fb",
            Self::Pv => "00002a11-0000-1000-8000-00805f9b34fb",
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inverter => f.write_str("A03"),
            Self::Pv => f.write_str("A11"),
        }
    }
}

/// Backend that talks to the inverter's GATT server.
///
/// Implementations do not enforce timeouts; the caller bounds every call.
#[async_trait]
pub trait GattTransport: Send {
    /// Establish a connection and resolve both characteristics
    async fn connect(&mut self, address_type: AddressType) -> Result<()>;

    /// Drop the connection; must be safe to call when already disconnected
    async fn disconnect(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Read one raw block
    async fn read_block(&mut self, block: Block) -> Result<Vec<u8>>;

    /// Human readable connection label, e.g. "Bluetooth hci0"
    fn describe(&self) -> String;
}
