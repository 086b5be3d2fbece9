use mesh_pdu::network::{NetworkHeader, NetworkPDU};
use mesh_pdu::segmented::{SegmentedMeta, SegmentedPDU};
use mesh_pdu::{NETWORK_PDU_PAYLOAD_MAX, SEGMENTS_MAX};
use mesh_common::mic::SzMic;
use mesh_common::NetKeyIndex;
use heapless::Vec;

/// Fixed freelist pools for network-PDU buffers and segmented-PDU
/// shells. Exhaustion is recoverable: allocation returns `None` and the
/// scheduler defers until sent-completions refill the pools.
pub struct Pools<const NP: usize = 16, const SP: usize = 4> {
    network: Vec<NetworkPDU, NP>,
    segmented: Vec<SegmentedPDU, SP>,
}

fn blank_segmented() -> SegmentedPDU {
    SegmentedPDU::new(
        NetworkHeader::default(),
        NetKeyIndex::new(0),
        SegmentedMeta::Access {
            akf_aid: None,
            szmic: SzMic::Bit32,
        },
    )
}

impl<const NP: usize, const SP: usize> Default for Pools<NP, SP> {
    fn default() -> Self {
        let mut network = Vec::new();
        for _ in 0..NP {
            network.push(NetworkPDU::new(NetKeyIndex::new(0))).ok();
        }
        let mut segmented = Vec::new();
        for _ in 0..SP {
            segmented.push(blank_segmented()).ok();
        }
        Self { network, segmented }
    }
}

impl<const NP: usize, const SP: usize> Pools<NP, SP> {
    pub fn get_network(&mut self) -> Option<NetworkPDU> {
        self.network.pop()
    }

    pub fn free_network(&mut self, mut pdu: NetworkPDU) {
        pdu.clear();
        self.network.push(pdu).ok();
    }

    pub fn get_segmented(&mut self) -> Option<SegmentedPDU> {
        self.segmented.pop()
    }

    /// Return a segmented shell, recovering any segments still attached.
    pub fn free_segmented(&mut self, mut pdu: SegmentedPDU) {
        for segment in pdu.take_segments() {
            self.free_network(segment);
        }
        pdu.set_len(0);
        self.segmented.push(pdu).ok();
    }

    pub fn network_available(&self) -> usize {
        self.network.len()
    }

    pub fn segmented_available(&self) -> usize {
        self.segmented.len()
    }

    /// Grow `segments` until it can store `payload_len` bytes. Partial
    /// allocations are kept on failure, so a deferred caller resumes
    /// where it left off.
    pub fn allocate_segments(
        &mut self,
        segments: &mut Vec<NetworkPDU, SEGMENTS_MAX>,
        payload_len: usize,
    ) -> bool {
        let mut storage = segments.len() * NETWORK_PDU_PAYLOAD_MAX;
        while storage < payload_len {
            let Some(pdu) = self.get_network() else {
                return false;
            };
            if segments.push(pdu).is_err() {
                return false;
            }
            storage += NETWORK_PDU_PAYLOAD_MAX;
        }
        true
    }
}
