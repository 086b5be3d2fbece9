use crate::NETWORK_PDU_PAYLOAD_MAX;
use mesh_common::crypto::network::Nid;
use mesh_common::{
    address::{Address, UnicastAddress},
    Ctl, InsufficientBuffer, Ivi, NetKeyIndex, ParseError, Seq, Ttl,
};
use heapless::Vec;

/// The fixed 9-octet cleartext network header, big-endian throughout:
/// `IVI|NID, CTL|TTL, SEQ[3], SRC[2], DST[2]`.
#[derive(Copy, Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NetworkHeader {
    ivi: Ivi,
    nid: Nid,
    ctl: Ctl,
    ttl: Ttl,
    seq: Seq,
    src: UnicastAddress,
    dst: Address,
}

impl Default for NetworkHeader {
    fn default() -> Self {
        Self {
            ivi: Ivi::Zero,
            nid: Nid::new(0),
            ctl: Ctl::Access,
            ttl: Ttl::new(0),
            seq: Seq::new(0),
            src: UnicastAddress::default(),
            dst: Address::Unassigned,
        }
    }
}

impl NetworkHeader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ivi: Ivi,
        nid: Nid,
        ctl: Ctl,
        ttl: Ttl,
        seq: Seq,
        src: UnicastAddress,
        dst: Address,
    ) -> Self {
        Self {
            ivi,
            nid,
            ctl,
            ttl,
            seq,
            src,
            dst,
        }
    }

    pub fn parse(data: &[u8; 9]) -> Result<Self, ParseError> {
        let ivi = Ivi::parse((data[0] & 0b10000000) >> 7)?;
        let nid = Nid::parse(data[0] & 0b01111111)?;
        let ctl = Ctl::parse((data[1] & 0b10000000) >> 7)?;
        let ttl = Ttl::parse(data[1] & 0b01111111)?;
        let seq = Seq::parse(u32::from_be_bytes([0, data[2], data[3], data[4]]))?;
        let src = UnicastAddress::parse([data[5], data[6]])?;
        let dst = Address::parse([data[7], data[8]]);
        Ok(Self {
            ivi,
            nid,
            ctl,
            ttl,
            seq,
            src,
            dst,
        })
    }

    pub fn emit(&self) -> [u8; 9] {
        let mut data = [0; 9];
        data[0] = (u8::from(self.ivi) << 7) | (u8::from(self.nid) & 0b01111111);
        data[1] = (u8::from(self.ctl) << 7) | (self.ttl.value() & 0b01111111);
        let seq = self.seq.to_be_bytes();
        data[2] = seq[1];
        data[3] = seq[2];
        data[4] = seq[3];
        let src = self.src.as_bytes();
        data[5] = src[0];
        data[6] = src[1];
        let dst = self.dst.as_bytes();
        data[7] = dst[0];
        data[8] = dst[1];
        data
    }

    pub fn ivi(&self) -> Ivi {
        self.ivi
    }

    pub fn nid(&self) -> Nid {
        self.nid
    }

    pub fn ctl(&self) -> Ctl {
        self.ctl
    }

    pub fn ttl(&self) -> Ttl {
        self.ttl
    }

    pub fn seq(&self) -> Seq {
        self.seq
    }

    pub fn set_seq(&mut self, seq: Seq) {
        self.seq = seq;
    }

    pub fn src(&self) -> UnicastAddress {
        self.src
    }

    pub fn dst(&self) -> Address {
        self.dst
    }

    pub fn set_dst(&mut self, dst: Address) {
        self.dst = dst;
    }
}

/// A single network PDU buffer.
///
/// Carries a full wire image (header plus lower-transport PDU) when it
/// travels to or from the network layer, and doubles as a raw payload
/// accumulator while it sits in a segment list of an upper or segmented
/// PDU.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NetworkPDU {
    netkey_index: NetKeyIndex,
    data: Vec<u8, NETWORK_PDU_PAYLOAD_MAX>,
}

impl NetworkPDU {
    pub fn new(netkey_index: NetKeyIndex) -> Self {
        Self {
            netkey_index,
            data: Vec::new(),
        }
    }

    pub fn from_parts(
        netkey_index: NetKeyIndex,
        header: NetworkHeader,
        lower_transport_pdu: &[u8],
    ) -> Result<Self, InsufficientBuffer> {
        let mut data = Vec::new();
        data.extend_from_slice(&header.emit())?;
        data.extend_from_slice(lower_transport_pdu)?;
        Ok(Self { netkey_index, data })
    }

    pub fn netkey_index(&self) -> NetKeyIndex {
        self.netkey_index
    }

    pub fn set_netkey_index(&mut self, netkey_index: NetKeyIndex) {
        self.netkey_index = netkey_index;
    }

    pub fn header(&self) -> Result<NetworkHeader, ParseError> {
        if self.data.len() < 9 {
            return Err(ParseError::InvalidLength);
        }
        let header: &[u8; 9] = self.data[0..9]
            .try_into()
            .map_err(|_| ParseError::InvalidLength)?;
        NetworkHeader::parse(header)
    }

    pub fn set_header(&mut self, header: NetworkHeader) -> Result<(), InsufficientBuffer> {
        if self.data.len() < 9 {
            self.data.resize(9, 0)?;
        }
        self.data[0..9].copy_from_slice(&header.emit());
        Ok(())
    }

    /// Patch the sequence number of an already packed PDU in place.
    pub fn set_seq(&mut self, seq: Seq) -> Result<(), ParseError> {
        if self.data.len() < 9 {
            return Err(ParseError::InvalidLength);
        }
        let bytes = seq.to_be_bytes();
        self.data[2] = bytes[1];
        self.data[3] = bytes[2];
        self.data[4] = bytes[3];
        Ok(())
    }

    pub fn seq(&self) -> Option<Seq> {
        self.header().ok().map(|header| header.seq())
    }

    pub fn dst(&self) -> Address {
        match self.header() {
            Ok(header) => header.dst(),
            Err(_) => Address::Unassigned,
        }
    }

    /// Everything after the network header.
    pub fn lower_transport_pdu(&self) -> &[u8] {
        if self.data.len() < 9 {
            &[]
        } else {
            &self.data[9..]
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity_remaining(&self) -> usize {
        NETWORK_PDU_PAYLOAD_MAX - self.data.len()
    }

    pub fn append(&mut self, payload: &[u8]) -> Result<(), InsufficientBuffer> {
        self.data
            .extend_from_slice(payload)
            .map_err(|_| InsufficientBuffer)
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}
