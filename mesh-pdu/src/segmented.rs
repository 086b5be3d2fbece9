use crate::control::ControlOpcode;
use crate::network::{NetworkHeader, NetworkPDU};
use crate::SEGMENTS_MAX;
use mesh_common::crypto::application::Aid;
use mesh_common::mic::SzMic;
use mesh_common::{Ctl, InsufficientBuffer, NetKeyIndex};
use heapless::Vec;

/// Content-specific metadata of a segmented message.
#[derive(Copy, Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SegmentedMeta {
    Access { akf_aid: Option<Aid>, szmic: SzMic },
    Control { opcode: ControlOpcode },
}

impl SegmentedMeta {
    pub fn ctl(&self) -> Ctl {
        match self {
            SegmentedMeta::Access { .. } => Ctl::Access,
            SegmentedMeta::Control { .. } => Ctl::Control,
        }
    }
}

/// A logical segmented PDU: an ordered collection of network-PDU
/// segments plus the metadata they share.
///
/// Segment order is defined by the SEG_O field inside each segment's
/// lower-transport header, not by list position.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SegmentedPDU {
    header: NetworkHeader,
    netkey_index: NetKeyIndex,
    meta: SegmentedMeta,
    len: u16,
    segments: Vec<NetworkPDU, SEGMENTS_MAX>,
}

impl SegmentedPDU {
    pub fn new(header: NetworkHeader, netkey_index: NetKeyIndex, meta: SegmentedMeta) -> Self {
        Self {
            header,
            netkey_index,
            meta,
            len: 0,
            segments: Vec::new(),
        }
    }

    pub fn header(&self) -> &NetworkHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut NetworkHeader {
        &mut self.header
    }

    pub fn netkey_index(&self) -> NetKeyIndex {
        self.netkey_index
    }

    pub fn set_netkey_index(&mut self, netkey_index: NetKeyIndex) {
        self.netkey_index = netkey_index;
    }

    pub fn meta(&self) -> &SegmentedMeta {
        &self.meta
    }

    pub fn set_meta(&mut self, meta: SegmentedMeta) {
        self.meta = meta;
    }

    pub fn ctl(&self) -> Ctl {
        self.meta.ctl()
    }

    /// Total reassembled length, TransMIC included for access content.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set_len(&mut self, len: u16) {
        self.len = len;
    }

    pub fn add_segment(&mut self, segment: NetworkPDU) -> Result<(), InsufficientBuffer> {
        self.segments.push(segment).map_err(|_| InsufficientBuffer)
    }

    pub fn segments(&self) -> &[NetworkPDU] {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut Vec<NetworkPDU, SEGMENTS_MAX> {
        &mut self.segments
    }

    /// Move the segment list out, leaving this PDU without segments.
    pub fn take_segments(&mut self) -> Vec<NetworkPDU, SEGMENTS_MAX> {
        core::mem::take(&mut self.segments)
    }

    /// Reassemble the segments into `buf`, placing each segment's data
    /// at `SEG_O * segment_len`. The segment length is 8 for control
    /// and 12 for access content.
    pub fn flatten(&self, buf: &mut [u8]) -> usize {
        let seg_len = self.ctl().segment_len();
        for segment in &self.segments {
            let lower = segment.lower_transport_pdu();
            if lower.len() < 4 {
                continue;
            }
            let seg_o = ((u16::from_be_bytes([lower[2], lower[3]]) >> 5) & 0x001F) as usize;
            let data = &lower[4..];
            let n = data.len().min(seg_len);
            let offset = seg_o * seg_len;
            if offset + n <= buf.len() {
                buf[offset..offset + n].copy_from_slice(&data[..n]);
            }
        }
        self.len()
    }
}

/// Move buffers from `free_segments` into `out_segments`, filling each
/// to capacity with `payload` before taking the next. The caller
/// guarantees `free_segments` holds enough capacity.
pub fn store_payload(
    payload: &[u8],
    free_segments: &mut Vec<NetworkPDU, SEGMENTS_MAX>,
    out_segments: &mut Vec<NetworkPDU, SEGMENTS_MAX>,
) -> Result<(), InsufficientBuffer> {
    let mut offset = 0;
    while offset < payload.len() {
        let mut segment = free_segments.pop().ok_or(InsufficientBuffer)?;
        let n = segment.capacity_remaining().min(payload.len() - offset);
        segment.append(&payload[offset..offset + n])?;
        offset += n;
        out_segments.push(segment).map_err(|_| InsufficientBuffer)?;
    }
    Ok(())
}
