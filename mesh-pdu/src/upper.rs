use crate::control::ControlOpcode;
use crate::network::{NetworkHeader, NetworkPDU};
use crate::{CarrierPDU, SEGMENTS_MAX};
use mesh_common::crypto::application::Aid;
use mesh_common::crypto::network::Nid;
use mesh_common::mic::SzMic;
use mesh_common::{
    address::{Address, UnicastAddress},
    AppKeyIndex, Ctl, Ivi, NetKeyIndex, Seq, Ttl,
};
use heapless::Vec;

/// An outbound upper-transport PDU, owned by the caller between setup
/// and submission, and returned with the sent-notification.
///
/// An unsegmented control PDU is a fully packed network PDU waiting
/// only for its sequence number; the other variants hold plaintext in a
/// segment list until encryption or emission.
#[derive(Debug)]
pub enum UpperPDU {
    UnsegmentedControl(NetworkPDU),
    SegmentedControl(UpperControlPDU),
    UnsegmentedAccess(UpperAccessPDU),
    SegmentedAccess(UpperAccessPDU),
}

impl UpperPDU {
    pub fn dst(&self) -> Address {
        match self {
            UpperPDU::UnsegmentedControl(pdu) => pdu.dst(),
            UpperPDU::SegmentedControl(pdu) => pdu.dst(),
            UpperPDU::UnsegmentedAccess(pdu) => pdu.dst(),
            UpperPDU::SegmentedAccess(pdu) => pdu.dst(),
        }
    }

    /// The reserved sequence number, if one has been assigned.
    pub fn seq(&self) -> Option<Seq> {
        match self {
            UpperPDU::UnsegmentedControl(pdu) => pdu.seq(),
            UpperPDU::SegmentedControl(pdu) => pdu.seq(),
            UpperPDU::UnsegmentedAccess(pdu) => pdu.seq(),
            UpperPDU::SegmentedAccess(pdu) => pdu.seq(),
        }
    }
}

/// Plaintext state of an outbound access PDU prior to encryption.
#[derive(Debug)]
pub struct UpperAccessPDU {
    ivi: Ivi,
    nid: Nid,
    ttl: Ttl,
    seq: Option<Seq>,
    src: UnicastAddress,
    dst: Address,
    netkey_index: NetKeyIndex,
    appkey_index: AppKeyIndex,
    akf_aid: Option<Aid>,
    szmic: SzMic,
    len: u16,
    segments: Vec<NetworkPDU, SEGMENTS_MAX>,
    lower_pdu: Option<CarrierPDU>,
}

impl UpperAccessPDU {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ivi: Ivi,
        nid: Nid,
        ttl: Ttl,
        src: UnicastAddress,
        dst: Address,
        netkey_index: NetKeyIndex,
        appkey_index: AppKeyIndex,
        akf_aid: Option<Aid>,
        szmic: SzMic,
    ) -> Self {
        Self {
            ivi,
            nid,
            ttl,
            seq: None,
            src,
            dst,
            netkey_index,
            appkey_index,
            akf_aid,
            szmic,
            len: 0,
            segments: Vec::new(),
            lower_pdu: None,
        }
    }

    pub fn ivi(&self) -> Ivi {
        self.ivi
    }

    pub fn nid(&self) -> Nid {
        self.nid
    }

    pub fn ttl(&self) -> Ttl {
        self.ttl
    }

    pub fn src(&self) -> UnicastAddress {
        self.src
    }

    pub fn dst(&self) -> Address {
        self.dst
    }

    /// Destination rewrite from pseudo-address to on-the-wire hash when
    /// sending to a virtual destination.
    pub fn set_dst(&mut self, dst: Address) {
        self.dst = dst;
    }

    pub fn netkey_index(&self) -> NetKeyIndex {
        self.netkey_index
    }

    pub fn appkey_index(&self) -> AppKeyIndex {
        self.appkey_index
    }

    pub fn akf_aid(&self) -> Option<Aid> {
        self.akf_aid
    }

    pub fn akf_aid_octet(&self) -> u8 {
        match self.akf_aid {
            Some(aid) => aid.akf_aid(),
            None => 0,
        }
    }

    pub fn szmic(&self) -> SzMic {
        self.szmic
    }

    pub fn seq(&self) -> Option<Seq> {
        self.seq
    }

    /// Reserving a sequence number commits it to this PDU; it is never
    /// renumbered, even if the send later fails.
    pub fn reserve_seq(&mut self, seq: Seq) {
        self.seq = Some(seq);
    }

    /// Plaintext length, TransMIC not included.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set_len(&mut self, len: u16) {
        self.len = len;
    }

    pub fn segments(&self) -> &[NetworkPDU] {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut Vec<NetworkPDU, SEGMENTS_MAX> {
        &mut self.segments
    }

    pub fn take_segments(&mut self) -> Vec<NetworkPDU, SEGMENTS_MAX> {
        core::mem::take(&mut self.segments)
    }

    /// Copy the scattered plaintext into `buf`, in list order.
    pub fn flatten_into(&self, buf: &mut [u8]) -> usize {
        let mut offset = 0;
        for segment in &self.segments {
            let data = segment.data();
            buf[offset..offset + data.len()].copy_from_slice(data);
            offset += data.len();
        }
        offset
    }

    pub fn lower_pdu(&self) -> Option<&CarrierPDU> {
        self.lower_pdu.as_ref()
    }

    pub fn lower_pdu_mut(&mut self) -> Option<&mut CarrierPDU> {
        self.lower_pdu.as_mut()
    }

    pub fn set_lower_pdu(&mut self, carrier: CarrierPDU) {
        self.lower_pdu = Some(carrier);
    }

    pub fn take_lower_pdu(&mut self) -> Option<CarrierPDU> {
        self.lower_pdu.take()
    }

    pub fn has_lower_pdu(&self) -> bool {
        self.lower_pdu.is_some()
    }

    /// The network header for this PDU's carriers, using the reserved
    /// sequence number and the current (possibly rewritten) destination.
    pub fn network_header(&self) -> NetworkHeader {
        NetworkHeader::new(
            self.ivi,
            self.nid,
            Ctl::Access,
            self.ttl,
            self.seq.unwrap_or_default(),
            self.src,
            self.dst,
        )
    }
}

/// Plaintext state of an outbound segmented control PDU.
#[derive(Debug)]
pub struct UpperControlPDU {
    ivi: Ivi,
    nid: Nid,
    ttl: Ttl,
    seq: Option<Seq>,
    src: UnicastAddress,
    dst: Address,
    netkey_index: NetKeyIndex,
    opcode: ControlOpcode,
    len: u16,
    segments: Vec<NetworkPDU, SEGMENTS_MAX>,
    lower_pdu: Option<CarrierPDU>,
}

impl UpperControlPDU {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ivi: Ivi,
        nid: Nid,
        ttl: Ttl,
        src: UnicastAddress,
        dst: Address,
        netkey_index: NetKeyIndex,
        opcode: ControlOpcode,
    ) -> Self {
        Self {
            ivi,
            nid,
            ttl,
            seq: None,
            src,
            dst,
            netkey_index,
            opcode,
            len: 0,
            segments: Vec::new(),
            lower_pdu: None,
        }
    }

    pub fn opcode(&self) -> ControlOpcode {
        self.opcode
    }

    pub fn ttl(&self) -> Ttl {
        self.ttl
    }

    pub fn src(&self) -> UnicastAddress {
        self.src
    }

    pub fn dst(&self) -> Address {
        self.dst
    }

    pub fn netkey_index(&self) -> NetKeyIndex {
        self.netkey_index
    }

    pub fn seq(&self) -> Option<Seq> {
        self.seq
    }

    pub fn reserve_seq(&mut self, seq: Seq) {
        self.seq = Some(seq);
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set_len(&mut self, len: u16) {
        self.len = len;
    }

    pub fn segments(&self) -> &[NetworkPDU] {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut Vec<NetworkPDU, SEGMENTS_MAX> {
        &mut self.segments
    }

    pub fn take_segments(&mut self) -> Vec<NetworkPDU, SEGMENTS_MAX> {
        core::mem::take(&mut self.segments)
    }

    pub fn lower_pdu(&self) -> Option<&CarrierPDU> {
        self.lower_pdu.as_ref()
    }

    pub fn set_lower_pdu(&mut self, carrier: CarrierPDU) {
        self.lower_pdu = Some(carrier);
    }

    pub fn take_lower_pdu(&mut self) -> Option<CarrierPDU> {
        self.lower_pdu.take()
    }

    pub fn network_header(&self) -> NetworkHeader {
        NetworkHeader::new(
            self.ivi,
            self.nid,
            Ctl::Control,
            self.ttl,
            self.seq.unwrap_or_default(),
            self.src,
            self.dst,
        )
    }
}
