#![cfg_attr(not(test), no_std)]

pub mod access;
pub mod control;
pub mod network;
pub mod segmented;
pub mod upper;

use crate::network::NetworkPDU;
use crate::segmented::SegmentedPDU;
use mesh_common::{address::Address, Seq};

/// Maximum payload a single network PDU buffer can hold.
pub const NETWORK_PDU_PAYLOAD_MAX: usize = 29;

/// Maximum upper-transport access payload, TransMIC included.
pub const ACCESS_PAYLOAD_MAX: usize = 380;

/// Maximum segmented control payload.
pub const CONTROL_PAYLOAD_MAX: usize = 256;

/// Upper bound on segments per reassembled or outbound message.
pub const SEGMENTS_MAX: usize = 32;

/// The PDU shapes exchanged with the lower transport: a raw network
/// carrier or a logical segmented message. Inbound, these arrive owned
/// by the lower transport and are handed back once the upper layers are
/// done; outbound, ownership moves to the lower transport on emission
/// and returns with the sent-notification.
#[derive(Clone, Debug)]
pub enum CarrierPDU {
    Network(NetworkPDU),
    Segmented(SegmentedPDU),
}

impl CarrierPDU {
    /// Destination carried in the network header.
    pub fn dst(&self) -> Address {
        match self {
            CarrierPDU::Network(pdu) => pdu.dst(),
            CarrierPDU::Segmented(pdu) => pdu.header().dst(),
        }
    }

    /// Sequence number carried in the network header. Outbound carriers
    /// always hold the reserved sequence number of their upper PDU,
    /// which makes it usable as a correlation key.
    pub fn seq(&self) -> Option<Seq> {
        match self {
            CarrierPDU::Network(pdu) => pdu.seq(),
            CarrierPDU::Segmented(pdu) => Some(pdu.header().seq()),
        }
    }
}

impl From<NetworkPDU> for CarrierPDU {
    fn from(pdu: NetworkPDU) -> Self {
        CarrierPDU::Network(pdu)
    }
}

impl From<SegmentedPDU> for CarrierPDU {
    fn from(pdu: SegmentedPDU) -> Self {
        CarrierPDU::Segmented(pdu)
    }
}
