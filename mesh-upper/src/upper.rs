use crate::candidates::{Candidate, CandidateIterator};
use crate::ccm::{CcmEngine, SoftwareCcm};
use crate::keys::Keys;
use crate::pool::Pools;
use crate::sequence::Sequence;
use crate::vaddr::VirtualAddresses;
use crate::{IvIndexState, TransportStatus, UpperError, UpperTransportContext};
use mesh_common::address::{Address, UnicastAddress};
use mesh_common::mic::SzMic;
use mesh_common::{AppKeyIndex, NetKeyIndex, Seq, Ttl};
use mesh_pdu::access::AccessPDU;
use mesh_pdu::control::{ControlOpcode, ControlPDU};
use mesh_pdu::network::{NetworkHeader, NetworkPDU};
use mesh_pdu::segmented::store_payload;
use mesh_pdu::upper::{UpperAccessPDU, UpperControlPDU, UpperPDU};
use mesh_pdu::{CarrierPDU, ACCESS_PAYLOAD_MAX, CONTROL_PAYLOAD_MAX, SEGMENTS_MAX};
use heapless::{Deque, Vec};

pub(crate) const INCOMING_QUEUE_DEPTH: usize = 8;
pub(crate) const OUTGOING_QUEUE_DEPTH: usize = 8;
pub(crate) const ACTIVE_QUEUE_DEPTH: usize = 8;

/// Unsegmented transport PDUs leave at most 11 octets of payload after
/// the leading opcode or AKF|AID octet (and, for access, the TransMIC).
const UNSEGMENTED_PAYLOAD_MAX: usize = 11;

/// Whether a PDU travels as a single network PDU or as a segmented
/// message.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Segmentation {
    Unsegmented,
    Segmented,
}

pub(crate) enum Step {
    Init,
    Digest,
    Crypt,
}

pub(crate) struct DecryptState {
    pub(crate) carrier: CarrierPDU,
    pub(crate) candidates: CandidateIterator,
    pub(crate) candidate: Option<Candidate>,
    pub(crate) step: Step,
}

pub(crate) struct EncryptState {
    pub(crate) upper: UpperPDU,
    pub(crate) label_slot: Option<usize>,
    pub(crate) step: Step,
}

/// The shared-engine guard. Anything other than `Idle` blocks both
/// pipelines: a CCM operation is in flight, or delivered plaintext
/// still occupies its singleton buffer.
#[derive(Default)]
pub(crate) enum CryptoState {
    #[default]
    Idle,
    Decrypt(DecryptState),
    Encrypt(EncryptState),
    AwaitingAccessRelease {
        carrier: CarrierPDU,
    },
    AwaitingControlRelease,
}

pub(crate) enum Origin {
    Access,
    Control,
}

pub(crate) struct ActiveEntry {
    pub(crate) seq: Seq,
    pub(crate) origin: Origin,
    pub(crate) upper: Option<UpperPDU>,
}

/// The upper transport core: queues, pools, key material and the
/// cooperative scheduler serializing everything over one CCM engine.
///
/// All entry points run on a single event loop. Progress on an
/// asynchronous engine is made by calling [`run`](Self::run) again once
/// the engine signals completion.
pub struct UpperTransport<E: CcmEngine = SoftwareCcm> {
    pub(crate) engine: E,
    pub(crate) keys: Keys,
    pub(crate) virtual_addresses: VirtualAddresses,
    pub(crate) iv_state: IvIndexState,
    pub(crate) sequence: Sequence,
    pub(crate) pools: Pools,
    pub(crate) incoming: Deque<CarrierPDU, INCOMING_QUEUE_DEPTH>,
    pub(crate) outgoing: Deque<UpperPDU, OUTGOING_QUEUE_DEPTH>,
    pub(crate) active: Vec<Option<ActiveEntry>, ACTIVE_QUEUE_DEPTH>,
    pub(crate) crypto: CryptoState,
    pub(crate) incoming_encrypted: AccessPDU,
    pub(crate) incoming_decrypted: AccessPDU,
    pub(crate) incoming_control: Option<ControlPDU>,
    pub(crate) crypto_buffer: [u8; ACCESS_PAYLOAD_MAX],
}

impl UpperTransport<SoftwareCcm> {
    pub fn new() -> Self {
        Self::with_engine(SoftwareCcm::new())
    }
}

impl Default for UpperTransport<SoftwareCcm> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: CcmEngine> UpperTransport<E> {
    pub fn with_engine(engine: E) -> Self {
        let mut active: Vec<Option<ActiveEntry>, ACTIVE_QUEUE_DEPTH> = Vec::new();
        while active.push(None).is_ok() {}
        Self {
            engine,
            keys: Default::default(),
            virtual_addresses: Default::default(),
            iv_state: Default::default(),
            sequence: Default::default(),
            pools: Default::default(),
            incoming: Deque::new(),
            outgoing: Deque::new(),
            active,
            crypto: CryptoState::Idle,
            incoming_encrypted: AccessPDU::default(),
            incoming_decrypted: AccessPDU::default(),
            incoming_control: None,
            crypto_buffer: [0; ACCESS_PAYLOAD_MAX],
        }
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn keys_mut(&mut self) -> &mut Keys {
        &mut self.keys
    }

    pub fn virtual_addresses(&self) -> &VirtualAddresses {
        &self.virtual_addresses
    }

    pub fn virtual_addresses_mut(&mut self) -> &mut VirtualAddresses {
        &mut self.virtual_addresses
    }

    pub fn set_iv_index(&mut self, iv_state: IvIndexState) {
        self.iv_state = iv_state;
    }

    pub fn set_sequence(&mut self, sequence: Sequence) {
        self.sequence = sequence;
    }

    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub(crate) fn crypto_busy(&self) -> bool {
        !matches!(self.crypto, CryptoState::Idle)
    }

    /// The scheduler. Drains whatever the engine has completed, then
    /// one pass over the incoming queue, then the outgoing queue,
    /// stopping wherever the single-crypto invariant, backpressure or
    /// pool exhaustion demands.
    pub fn run<C: UpperTransportContext>(&mut self, ctx: &mut C) {
        self.pump_crypto(ctx);

        while !self.crypto_busy() {
            let Some(pdu) = self.incoming.pop_front() else {
                break;
            };
            self.process_incoming(pdu, ctx);
            self.pump_crypto(ctx);
        }

        self.run_outgoing(ctx);
    }

    pub(crate) fn pump_crypto<C: UpperTransportContext>(&mut self, ctx: &mut C) {
        loop {
            match core::mem::take(&mut self.crypto) {
                CryptoState::Idle => return,
                state @ (CryptoState::AwaitingAccessRelease { .. }
                | CryptoState::AwaitingControlRelease) => {
                    self.crypto = state;
                    return;
                }
                CryptoState::Decrypt(state) => match self.engine.poll_complete() {
                    None => {
                        self.crypto = CryptoState::Decrypt(state);
                        return;
                    }
                    Some(completion) => self.advance_decrypt(state, completion, ctx),
                },
                CryptoState::Encrypt(state) => match self.engine.poll_complete() {
                    None => {
                        self.crypto = CryptoState::Encrypt(state);
                        return;
                    }
                    Some(completion) => self.advance_encrypt(state, completion, ctx),
                },
            }
        }
    }

    /// Inbound entry point: queue a carrier received from the lower
    /// transport. Returns the carrier if the queue is full.
    pub fn pdu_received<C: UpperTransportContext>(
        &mut self,
        pdu: CarrierPDU,
        ctx: &mut C,
    ) -> Result<(), CarrierPDU> {
        self.incoming.push_back(pdu)?;
        self.run(ctx);
        Ok(())
    }

    /// Submit an outbound access PDU built by
    /// [`setup_access_pdu`](Self::setup_access_pdu). Returned unchanged
    /// if it is not an access variant or the queue is full.
    pub fn send_access_pdu<C: UpperTransportContext>(
        &mut self,
        pdu: UpperPDU,
        ctx: &mut C,
    ) -> Result<(), UpperPDU> {
        match &pdu {
            UpperPDU::UnsegmentedAccess(inner) | UpperPDU::SegmentedAccess(inner) => {
                debug_assert!(inner.lower_pdu().is_none());
            }
            _ => return Err(pdu),
        }
        self.outgoing.push_back(pdu)?;
        self.run(ctx);
        Ok(())
    }

    /// Submit an outbound control PDU built by
    /// [`setup_control_pdu`](Self::setup_control_pdu).
    pub fn send_control_pdu<C: UpperTransportContext>(
        &mut self,
        pdu: UpperPDU,
        ctx: &mut C,
    ) -> Result<(), UpperPDU> {
        match &pdu {
            UpperPDU::UnsegmentedControl(network) => {
                debug_assert!(network.len() >= 10);
            }
            UpperPDU::SegmentedControl(_) => {}
            _ => return Err(pdu),
        }
        self.outgoing.push_back(pdu)?;
        self.run(ctx);
        Ok(())
    }

    /// Release the message most recently delivered to the access or
    /// control handler, unblocking the pipelines.
    pub fn message_processed_by_higher_layer<C: UpperTransportContext>(&mut self, ctx: &mut C) {
        match core::mem::take(&mut self.crypto) {
            CryptoState::AwaitingAccessRelease { carrier } => {
                ctx.release_pdu(carrier);
            }
            CryptoState::AwaitingControlRelease => {
                self.incoming_control = None;
            }
            other => {
                warn!("release without a delivery in progress");
                self.crypto = other;
                return;
            }
        }
        self.run(ctx);
    }

    /// Build an outbound control PDU. Unsegmented payloads are limited
    /// to 11 octets, segmented ones to 256.
    #[allow(clippy::too_many_arguments)]
    pub fn setup_control_pdu(
        &mut self,
        netkey_index: NetKeyIndex,
        ttl: Ttl,
        src: UnicastAddress,
        dst: Address,
        opcode: ControlOpcode,
        data: &[u8],
        segmentation: Segmentation,
    ) -> Result<UpperPDU, UpperError> {
        let network_key = self
            .keys
            .network_key(netkey_index)
            .ok_or(UpperError::UnknownNetKey)?;
        let nid = network_key.nid();
        let ivi = self.iv_state.transmission_iv_index().ivi();

        match segmentation {
            Segmentation::Unsegmented => {
                if data.len() > UNSEGMENTED_PAYLOAD_MAX {
                    return Err(UpperError::InvalidLength);
                }
                let header = NetworkHeader::new(
                    ivi,
                    nid,
                    mesh_common::Ctl::Control,
                    ttl,
                    Seq::new(0),
                    src,
                    dst,
                );
                let mut lower: Vec<u8, 12> = Vec::new();
                lower.push(opcode as u8).map_err(|_| UpperError::InsufficientSpace)?;
                lower
                    .extend_from_slice(data)
                    .map_err(|_| UpperError::InsufficientSpace)?;
                let network = NetworkPDU::from_parts(netkey_index, header, &lower)?;
                Ok(UpperPDU::UnsegmentedControl(network))
            }
            Segmentation::Segmented => {
                if data.len() > CONTROL_PAYLOAD_MAX {
                    return Err(UpperError::InvalidLength);
                }
                let mut pdu =
                    UpperControlPDU::new(ivi, nid, ttl, src, dst, netkey_index, opcode);
                self.store_upper_payload(data, pdu.segments_mut())?;
                pdu.set_len(data.len() as u16);
                Ok(UpperPDU::SegmentedControl(pdu))
            }
        }
    }

    /// Build an outbound access PDU. `szmic` selects the TransMIC
    /// length; unsegmented access PDUs always carry the 4-octet MIC and
    /// at most 11 octets of payload.
    #[allow(clippy::too_many_arguments)]
    pub fn setup_access_pdu(
        &mut self,
        netkey_index: NetKeyIndex,
        appkey_index: AppKeyIndex,
        ttl: Ttl,
        src: UnicastAddress,
        dst: Address,
        szmic: SzMic,
        data: &[u8],
        segmentation: Segmentation,
    ) -> Result<UpperPDU, UpperError> {
        let key = self.keys.get(appkey_index).ok_or(UpperError::UnknownAppKey)?;
        let akf_aid = key.aid();

        let network_key = self
            .keys
            .network_key(netkey_index)
            .ok_or(UpperError::UnknownNetKey)?;
        let nid = network_key.nid();
        let ivi = self.iv_state.transmission_iv_index().ivi();

        match segmentation {
            Segmentation::Unsegmented => {
                if data.len() > UNSEGMENTED_PAYLOAD_MAX || szmic != SzMic::Bit32 {
                    return Err(UpperError::InvalidLength);
                }
            }
            Segmentation::Segmented => {
                if data.len() + szmic.size() > ACCESS_PAYLOAD_MAX {
                    return Err(UpperError::InvalidLength);
                }
            }
        }

        let mut pdu = UpperAccessPDU::new(
            ivi,
            nid,
            ttl,
            src,
            dst,
            netkey_index,
            appkey_index,
            akf_aid,
            szmic,
        );
        self.store_upper_payload(data, pdu.segments_mut())?;
        pdu.set_len(data.len() as u16);

        Ok(match segmentation {
            Segmentation::Unsegmented => UpperPDU::UnsegmentedAccess(pdu),
            Segmentation::Segmented => UpperPDU::SegmentedAccess(pdu),
        })
    }

    fn store_upper_payload(
        &mut self,
        data: &[u8],
        out_segments: &mut Vec<NetworkPDU, SEGMENTS_MAX>,
    ) -> Result<(), UpperError> {
        let mut free = Vec::new();
        if !self.pools.allocate_segments(&mut free, data.len()) {
            for segment in free {
                self.pools.free_network(segment);
            }
            return Err(UpperError::InsufficientSpace);
        }
        store_payload(data, &mut free, out_segments)?;
        for segment in free {
            self.pools.free_network(segment);
        }
        Ok(())
    }

    /// Return an upper PDU's buffers to the pools once the originator
    /// is finished with it.
    pub fn pdu_free(&mut self, pdu: UpperPDU) {
        match pdu {
            UpperPDU::UnsegmentedControl(_) => {}
            UpperPDU::SegmentedControl(mut control) => {
                for segment in control.take_segments() {
                    self.pools.free_network(segment);
                }
                if let Some(carrier) = control.take_lower_pdu() {
                    self.carrier_free(carrier);
                }
            }
            UpperPDU::UnsegmentedAccess(mut access) | UpperPDU::SegmentedAccess(mut access) => {
                for segment in access.take_segments() {
                    self.pools.free_network(segment);
                }
                if let Some(carrier) = access.take_lower_pdu() {
                    self.carrier_free(carrier);
                }
            }
        }
    }

    pub(crate) fn carrier_free(&mut self, carrier: CarrierPDU) {
        match carrier {
            CarrierPDU::Network(network) => self.pools.free_network(network),
            CarrierPDU::Segmented(segmented) => self.pools.free_segmented(segmented),
        }
    }

    /// Drop all queued work and any in-flight crypto. Outbound PDUs are
    /// dismantled back into the pools; borrowed inbound carriers,
    /// including one held by an interrupted decrypt or an undelivered
    /// message, go back to the lower transport.
    pub fn reset<C: UpperTransportContext>(&mut self, ctx: &mut C) {
        match core::mem::take(&mut self.crypto) {
            CryptoState::Idle | CryptoState::AwaitingControlRelease => {}
            CryptoState::Decrypt(state) => ctx.release_pdu(state.carrier),
            CryptoState::AwaitingAccessRelease { carrier } => ctx.release_pdu(carrier),
            CryptoState::Encrypt(state) => self.pdu_free(state.upper),
        }
        self.incoming_control = None;
        while let Some(pdu) = self.incoming.pop_front() {
            ctx.release_pdu(pdu);
        }
        while let Some(pdu) = self.outgoing.pop_front() {
            self.pdu_free(pdu);
        }
        for index in 0..self.active.len() {
            if let Some(entry) = self.active[index].take() {
                if let Some(upper) = entry.upper {
                    self.pdu_free(upper);
                }
            }
        }
    }

    /// Log the current queue occupancy.
    pub fn dump(&self) {
        info!("incoming queue: {}", self.incoming.len());
        info!("outgoing queue: {}", self.outgoing.len());
        info!(
            "active sends: {}",
            self.active.iter().filter(|entry| entry.is_some()).count()
        );
        info!("network pool: {}", self.pools.network_available());
    }

    pub(crate) fn push_active(&mut self, seq: Seq, origin: Origin, upper: Option<UpperPDU>) {
        if let Some(slot) = self.active.iter_mut().find(|slot| slot.is_none()) {
            slot.replace(ActiveEntry { seq, origin, upper });
        } else {
            // run_outgoing gates on a free slot, so this cannot happen
            error!("active queue overflow");
        }
    }

    pub(crate) fn take_active(&mut self, seq: Seq) -> Option<ActiveEntry> {
        for slot in self.active.iter_mut() {
            if matches!(slot, Some(entry) if entry.seq == seq) {
                return slot.take();
            }
        }
        None
    }

    pub(crate) fn active_full(&self) -> bool {
        self.active.iter().all(|slot| slot.is_some())
    }

    /// Completion from the lower transport: the carrier emitted for an
    /// outbound upper PDU has been sent (or failed). Buffers return to
    /// the pools and the originator gets its PDU back.
    pub fn pdu_sent<C: UpperTransportContext>(
        &mut self,
        carrier: CarrierPDU,
        status: TransportStatus,
        ctx: &mut C,
    ) {
        let Some(seq) = carrier.seq() else {
            warn!("sent carrier without sequence number");
            self.carrier_free(carrier);
            return;
        };
        let Some(entry) = self.take_active(seq) else {
            warn!("sent carrier matches no active send: {}", seq.value());
            self.carrier_free(carrier);
            return;
        };

        let upper = match carrier {
            CarrierPDU::Network(network) => match entry.upper {
                // an unsegmented control PDU travels as itself
                None => Some(UpperPDU::UnsegmentedControl(network)),
                Some(upper) => {
                    self.pools.free_network(network);
                    Some(upper)
                }
            },
            CarrierPDU::Segmented(segmented) => {
                self.pools.free_segmented(segmented);
                entry.upper
            }
        };

        let Some(upper) = upper else {
            error!("active send without an upper pdu");
            return;
        };

        match entry.origin {
            Origin::Access => ctx.access_pdu_sent(status, upper),
            Origin::Control => ctx.control_pdu_sent(status, upper),
        }

        self.run(ctx);
    }
}
