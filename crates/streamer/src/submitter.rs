//! Type-specific request submission
//!
//! The transfer type is resolved once, when the run starts, into a
//! [`Submitter`]. Every arm, submit and byte-accounting decision afterwards
//! goes through it instead of re-checking the endpoint type.

use crate::config::{RunConfig, TransferType};
use crate::error::TransportError;
use crate::slot::{IsoPacket, SlotState, TransferSlot};
use crate::transport::{Completion, TransferSession};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submitter {
    Bulk {
        endpoint: u8,
        length: usize,
        timeout: Duration,
    },
    Interrupt {
        endpoint: u8,
        length: usize,
        timeout: Duration,
    },
    Isochronous {
        endpoint: u8,
        packets: usize,
        packet_size: usize,
        timeout: Duration,
    },
}

impl Submitter {
    pub fn for_config(config: &RunConfig) -> Self {
        let endpoint = config.endpoint;
        let timeout = config.transfer_timeout;
        match config.transfer_type {
            TransferType::Bulk => Submitter::Bulk {
                endpoint,
                length: config.request_bytes(),
                timeout,
            },
            TransferType::Interrupt => Submitter::Interrupt {
                endpoint,
                length: config.request_bytes(),
                timeout,
            },
            TransferType::Isochronous => Submitter::Isochronous {
                endpoint,
                packets: config.request_size,
                packet_size: config.packet_size,
                timeout,
            },
        }
    }

    pub fn transfer_type(&self) -> TransferType {
        match self {
            Submitter::Bulk { .. } => TransferType::Bulk,
            Submitter::Interrupt { .. } => TransferType::Interrupt,
            Submitter::Isochronous { .. } => TransferType::Isochronous,
        }
    }

    /// Packet descriptors each transport handle must be able to hold
    pub fn iso_packets(&self) -> usize {
        match self {
            Submitter::Isochronous { packets, .. } => *packets,
            _ => 0,
        }
    }

    /// Size of one request in bytes
    pub fn request_length(&self) -> usize {
        match self {
            Submitter::Bulk { length, .. } | Submitter::Interrupt { length, .. } => *length,
            Submitter::Isochronous {
                packets,
                packet_size,
                ..
            } => packets * packet_size,
        }
    }

    /// Fill the slot's descriptor for the next submission
    ///
    /// For isochronous requests the per-packet length table is rebuilt every
    /// time, since the previous completion may have left actual lengths in it.
    pub fn arm<H>(&self, slot: &mut TransferSlot<H>) {
        let transfer_type = self.transfer_type();
        let length = self.request_length();
        let descriptor = slot.descriptor_mut();

        descriptor.transfer_type = transfer_type;
        descriptor.length = length;

        match self {
            Submitter::Bulk {
                endpoint, timeout, ..
            }
            | Submitter::Interrupt {
                endpoint, timeout, ..
            } => {
                descriptor.endpoint = *endpoint;
                descriptor.timeout = *timeout;
                descriptor.iso_packets.clear();
            }
            Submitter::Isochronous {
                endpoint,
                packets,
                packet_size,
                timeout,
            } => {
                descriptor.endpoint = *endpoint;
                descriptor.timeout = *timeout;
                descriptor.iso_packets.clear();
                descriptor.iso_packets.resize(
                    *packets,
                    IsoPacket {
                        length: *packet_size,
                    },
                );
            }
        }
    }

    /// Arm the slot and hand it to the transport
    ///
    /// On rejection the slot stays `Idle` and must not be counted as in flight.
    pub fn submit<S: TransferSession>(
        &self,
        session: &mut S,
        slot: &mut TransferSlot<S::Handle>,
    ) -> Result<(), TransportError> {
        self.arm(slot);
        match session.submit(slot) {
            Ok(()) => {
                slot.state = SlotState::Submitted;
                Ok(())
            }
            Err(e) => {
                slot.state = SlotState::Idle;
                Err(e)
            }
        }
    }

    /// Bytes a successful completion contributes to the throughput window
    ///
    /// Isochronous requests count the actual length of each successful packet
    /// only. Bulk and interrupt requests count the full requested size.
    pub fn transferred_bytes(&self, completion: &Completion) -> u64 {
        match self {
            Submitter::Isochronous { .. } => completion
                .packets
                .iter()
                .filter(|packet| packet.status.is_success())
                .map(|packet| packet.actual_length as u64)
                .sum(),
            Submitter::Bulk { length, .. } | Submitter::Interrupt { length, .. } => *length as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::{SlotId, SlotPool};
    use crate::transport::{PacketOutcome, TransferStatus};

    fn iso_config() -> RunConfig {
        RunConfig::new(0x83, TransferType::Isochronous, 1024).with_request_size(3)
    }

    #[test]
    fn test_for_config_selects_variant() {
        let bulk = Submitter::for_config(&RunConfig::new(0x81, TransferType::Bulk, 512));
        assert_eq!(bulk.transfer_type(), TransferType::Bulk);
        assert_eq!(bulk.request_length(), 16 * 512);
        assert_eq!(bulk.iso_packets(), 0);

        let interrupt = Submitter::for_config(&RunConfig::new(0x82, TransferType::Interrupt, 64));
        assert_eq!(interrupt.transfer_type(), TransferType::Interrupt);

        let iso = Submitter::for_config(&iso_config());
        assert_eq!(iso.transfer_type(), TransferType::Isochronous);
        assert_eq!(iso.iso_packets(), 3);
        assert_eq!(iso.request_length(), 3 * 1024);
    }

    #[test]
    fn test_arm_bulk_descriptor() {
        let submitter = Submitter::for_config(&RunConfig::new(0x81, TransferType::Bulk, 512));
        let mut pool = SlotPool::allocate(1, submitter.request_length(), |_| Ok(())).unwrap();
        let slot = pool.get_mut(SlotId(0)).unwrap();

        submitter.arm(slot);
        let descriptor = slot.descriptor();
        assert_eq!(descriptor.endpoint, 0x81);
        assert_eq!(descriptor.transfer_type, TransferType::Bulk);
        assert_eq!(descriptor.length, 8192);
        assert_eq!(descriptor.timeout, Duration::from_secs(5));
        assert!(descriptor.iso_packets.is_empty());
    }

    #[test]
    fn test_arm_reapplies_iso_packet_lengths() {
        let submitter = Submitter::for_config(&iso_config());
        let mut pool = SlotPool::allocate(1, submitter.request_length(), |_| Ok(())).unwrap();
        let slot = pool.get_mut(SlotId(0)).unwrap();

        submitter.arm(slot);
        // Simulate a transport overwriting the table after a short completion
        slot.descriptor_mut().iso_packets[1].length = 17;
        slot.descriptor_mut().iso_packets.pop();

        submitter.arm(slot);
        assert_eq!(
            slot.descriptor().iso_packets,
            vec![IsoPacket { length: 1024 }; 3]
        );
    }

    #[test]
    fn test_iso_partial_success_accounting() {
        let submitter = Submitter::for_config(&iso_config());
        let completion = Completion::isochronous(
            SlotId(0),
            TransferStatus::Completed,
            vec![
                PacketOutcome {
                    status: TransferStatus::Completed,
                    actual_length: 100,
                },
                PacketOutcome {
                    status: TransferStatus::Completed,
                    actual_length: 50,
                },
                PacketOutcome {
                    status: TransferStatus::Error,
                    actual_length: 1024,
                },
            ],
        );
        assert_eq!(submitter.transferred_bytes(&completion), 150);
    }

    #[test]
    fn test_bulk_counts_requested_size() {
        let submitter = Submitter::for_config(&RunConfig::new(0x81, TransferType::Bulk, 512));
        // A short completion still counts the full request
        let completion = Completion::new(SlotId(0), TransferStatus::Completed, 100);
        assert_eq!(submitter.transferred_bytes(&completion), 16 * 512);
    }
}
