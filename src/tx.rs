use std::sync::{Arc, Mutex, PoisonError};

use crate::packet::{self, MAX_PAYLOAD_SIZE, RAW_HEADER_SIZE};
use crate::ring::TxStatus;
use crate::shmem::{self, TX_SLOTS};
use crate::{Device, RawPacketHeader, RegisterInterface, SharedMemory, Unsupported};

/// Hands frames over to the TX ring
///
/// There is no queue, a full ring is reported as [`crate::Error::Busy`] and left to the caller.
pub struct TxEngine<R, M> {
    device: Arc<Device<R, M>>,
    // status read, slot write and push form one sequence
    sequence: Mutex<()>,
}
impl<R: RegisterInterface, M: SharedMemory> TxEngine<R, M> {
    pub fn new(device: Arc<Device<R, M>>) -> Self {
        Self { device, sequence: Mutex::new(()) }
    }

    pub fn device(&self) -> &Arc<Device<R, M>> {
        &self.device
    }

    /// Send an Ethernet frame carrying UDP over IPv4, returning the payload bytes sent
    #[tracing::instrument(skip_all, level = tracing::Level::TRACE, ret)]
    pub fn send(&self, frame: &[u8]) -> Result<usize, crate::Error> {
        let composed = match packet::compose(frame) {
            Ok(composed) => composed,
            Err(reason) => {
                tracing::debug!(%reason, "dropped TX frame");
                self.device.statistics().record_tx_dropped();
                return Err(reason.into());
            },
        };
        self.transmit(&composed.header, composed.payload)
    }

    /// Send a datagram described by a hardware header
    pub fn send_raw(&self, header: &RawPacketHeader, payload: &[u8]) -> Result<usize, crate::Error> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            self.device.statistics().record_tx_dropped();
            return Err(Unsupported::Oversized { payload_len: payload.len() }.into());
        }
        if header.payload_size != payload.len() as u64 {
            self.device.statistics().record_tx_dropped();
            return Err(Unsupported::Malformed { reason: "header size does not match the payload" }.into());
        }
        self.transmit(header, payload)
    }

    fn transmit(&self, header: &RawPacketHeader, payload: &[u8]) -> Result<usize, crate::Error> {
        let _sequence = self.sequence.lock().unwrap_or_else(PoisonError::into_inner);
        let state = self.device.read();

        let head = match state.ring.tx_status()? {
            TxStatus::Full => {
                tracing::debug!("TX ring is full");
                self.device.statistics().record_tx_busy();
                return Err(crate::Error::Busy);
            },
            // five bits wide
            TxStatus::Ready { head } => head % TX_SLOTS,
        };

        let memory = self.device.memory();
        let offset = shmem::tx_slot_offset(head);
        memory.write_at(offset, &header.to_bytes())?;
        memory.write_at(offset + RAW_HEADER_SIZE, payload)?;
        memory.sync_for_device(offset, RAW_HEADER_SIZE + payload.len());

        if let Err(error) = state.ring.tx_push_pulse() {
            tracing::error!(head, %error, "unable to push TX slot");
        }

        self.device.statistics().record_tx(payload.len());
        Ok(payload.len())
    }
}

impl<R, M> std::fmt::Debug for TxEngine<R, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxEngine").finish_non_exhaustive()
    }
}
