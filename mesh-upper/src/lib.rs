#![cfg_attr(not(test), no_std)]

//! Upper transport layer: application-level confidentiality and
//! integrity for access payloads, and multiplexing of access and
//! control messages between the lower transport and the access layer.

#[macro_use]
mod fmt;

pub mod candidates;
pub mod ccm;
pub mod keys;
pub mod pool;
pub mod sequence;
pub mod vaddr;

mod inbound;
mod outbound;
mod upper;

pub use upper::{Segmentation, UpperTransport};

use mesh_common::{address::Address, IvIndex, IvUpdateFlag, Ivi, ParseError};
use mesh_pdu::access::AccessPDU;
use mesh_pdu::control::ControlPDU;
use mesh_pdu::upper::UpperPDU;
use mesh_pdu::CarrierPDU;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UpperError {
    InvalidState,
    InsufficientSpace,
    UnknownAppKey,
    UnknownNetKey,
    InvalidLength,
    InvalidPDU,
    Parse(ParseError),
}

impl From<mesh_common::InsufficientBuffer> for UpperError {
    fn from(_: mesh_common::InsufficientBuffer) -> Self {
        Self::InsufficientSpace
    }
}

impl From<ParseError> for UpperError {
    fn from(inner: ParseError) -> Self {
        Self::Parse(inner)
    }
}

/// Outcome reported to the access and control handlers.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportStatus {
    Success,
    SendFailed,
}

/// Everything the upper transport asks of its surroundings: the lower
/// transport below and the access/control handlers above.
///
/// The lower transport keeps ownership of inbound carriers
/// conceptually; they are handed back through [`release_pdu`]
/// (`Self::release_pdu`) once the upper layers are done with them.
/// Outbound carriers move to the lower transport via [`send_pdu`]
/// (`Self::send_pdu`) and come back through
/// [`UpperTransport::pdu_sent`].
pub trait UpperTransportContext {
    /// Reserve a transmission slot ahead of reserving a sequence number.
    fn reserve_slot(&mut self);

    /// Per-destination backpressure from the lower transport.
    fn can_send_to_dest(&mut self, dst: Address) -> bool;

    /// Submit a carrier for transmission.
    fn send_pdu(&mut self, pdu: CarrierPDU);

    /// Return an inbound carrier after the upper layers processed it.
    fn release_pdu(&mut self, pdu: CarrierPDU);

    /// A decrypted access message; valid only during the call. The
    /// pipeline stays blocked until
    /// [`UpperTransport::message_processed_by_higher_layer`] is invoked.
    fn access_message_received(&mut self, pdu: &AccessPDU);

    /// An accepted outbound access PDU has completed, successfully or
    /// not; ownership returns to the originator.
    fn access_pdu_sent(&mut self, status: TransportStatus, pdu: UpperPDU);

    /// A control message; valid only during the call, with the same
    /// release protocol as access messages.
    fn control_message_received(&mut self, pdu: &ControlPDU);

    /// An accepted outbound control PDU has completed.
    fn control_pdu_sent(&mut self, status: TransportStatus, pdu: UpperPDU);
}

/// Current IV index together with the update flag, answering both
/// "which IV index was this PDU received under" and "which IV index do
/// we transmit under".
#[derive(Copy, Clone, Default, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IvIndexState {
    iv_index: IvIndex,
    iv_update_flag: IvUpdateFlag,
}

impl IvIndexState {
    pub fn new(iv_index: IvIndex, iv_update_flag: IvUpdateFlag) -> Self {
        Self {
            iv_index,
            iv_update_flag,
        }
    }

    pub fn accepted_iv_index(&self, ivi: Ivi) -> IvIndex {
        self.iv_index.accepted_iv_index(ivi)
    }

    pub fn transmission_iv_index(&self) -> IvIndex {
        self.iv_index.transmission_iv_index(self.iv_update_flag)
    }
}
