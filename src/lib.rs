mod device; pub use device::{Device, Statistics, StatisticsSnapshot};
mod ports; pub use ports::PortTable;
mod ring; pub use ring::{RingProtocol, RxBufferControl, TxRingState, TxStatus};
mod rx; pub use rx::{RxEngine, RxState};
mod tx; pub use tx::TxEngine;
mod error; pub use error::{Error, Unsupported};
pub mod adapter;
pub mod config; pub use config::{DeviceConfig, MappingConfig, RxMode, WakeMode};
pub mod packet; pub use packet::{FrameTemplate, RawPacketHeader, RxFrame};
pub mod registers; pub use registers::{MappedRegisters, RegisterInterface};
pub mod shmem; pub use shmem::{MmapRegion, SharedMemory};
pub mod utils;

#[cfg(test)]
mod testing;
