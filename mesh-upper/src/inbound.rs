use crate::candidates::CandidateIterator;
use crate::ccm::{CcmCompletion, CcmEngine};
use crate::upper::{CryptoState, DecryptState, Step, UpperTransport};
use crate::UpperTransportContext;
use mesh_common::address::Address;
use mesh_common::crypto::application::Aid;
use mesh_common::crypto::nonce::{ApplicationNonce, DeviceNonce};
use mesh_common::mic::SzMic;
use mesh_common::Ctl;
use mesh_pdu::control::{ControlOpcode, ControlPDU};
use mesh_pdu::network::{NetworkHeader, NetworkPDU};
use mesh_pdu::segmented::{SegmentedMeta, SegmentedPDU};
use mesh_pdu::{CarrierPDU, ACCESS_PAYLOAD_MAX, CONTROL_PAYLOAD_MAX};

impl<E: CcmEngine> UpperTransport<E> {
    /// Classify one inbound carrier and either hand a control message
    /// straight up or start the access-decrypt machinery.
    pub(crate) fn process_incoming<C: UpperTransportContext>(
        &mut self,
        pdu: CarrierPDU,
        ctx: &mut C,
    ) {
        match pdu {
            CarrierPDU::Network(network) => {
                let header = match network.header() {
                    Ok(header) => header,
                    Err(_) => {
                        warn!("inbound network pdu too short");
                        ctx.release_pdu(CarrierPDU::Network(network));
                        return;
                    }
                };
                match header.ctl() {
                    Ctl::Control => self.receive_unsegmented_control(network, header, ctx),
                    Ctl::Access => self.receive_unsegmented_access(network, header, ctx),
                }
            }
            CarrierPDU::Segmented(segmented) => match segmented.ctl() {
                Ctl::Control => self.receive_segmented_control(segmented, ctx),
                Ctl::Access => self.receive_segmented_access(segmented, ctx),
            },
        }
    }

    fn receive_unsegmented_control<C: UpperTransportContext>(
        &mut self,
        network: NetworkPDU,
        header: NetworkHeader,
        ctx: &mut C,
    ) {
        let lower = network.lower_transport_pdu();
        let control = lower.split_first().and_then(|(octet, parameters)| {
            let opcode = ControlOpcode::parse(octet & 0x7F).ok()?;
            ControlPDU::new(header, network.netkey_index(), opcode, parameters).ok()
        });

        let Some(control) = control else {
            warn!("malformed unsegmented control pdu");
            ctx.release_pdu(CarrierPDU::Network(network));
            return;
        };

        // control carriers are done with once the payload is copied out
        ctx.release_pdu(CarrierPDU::Network(network));
        self.deliver_control(control, ctx);
    }

    fn receive_segmented_control<C: UpperTransportContext>(
        &mut self,
        segmented: SegmentedPDU,
        ctx: &mut C,
    ) {
        let SegmentedMeta::Control { opcode } = *segmented.meta() else {
            error!("segmented control pdu with access metadata");
            ctx.release_pdu(CarrierPDU::Segmented(segmented));
            return;
        };
        let len = segmented.len();
        if len > CONTROL_PAYLOAD_MAX {
            warn!("oversized segmented control pdu: {}", len);
            ctx.release_pdu(CarrierPDU::Segmented(segmented));
            return;
        }

        let mut buffer = [0; CONTROL_PAYLOAD_MAX];
        segmented.flatten(&mut buffer);

        let control = ControlPDU::new(
            *segmented.header(),
            segmented.netkey_index(),
            opcode,
            &buffer[..len],
        );
        let Ok(control) = control else {
            warn!("malformed segmented control pdu");
            ctx.release_pdu(CarrierPDU::Segmented(segmented));
            return;
        };

        ctx.release_pdu(CarrierPDU::Segmented(segmented));
        self.deliver_control(control, ctx);
    }

    fn deliver_control<C: UpperTransportContext>(&mut self, control: ControlPDU, ctx: &mut C) {
        self.incoming_control = Some(control);
        if let Some(control) = &self.incoming_control {
            ctx.control_message_received(control);
        }
        // the singleton stays occupied until the handler releases it
        self.crypto = CryptoState::AwaitingControlRelease;
    }

    fn receive_unsegmented_access<C: UpperTransportContext>(
        &mut self,
        network: NetworkPDU,
        header: NetworkHeader,
        ctx: &mut C,
    ) {
        let lower = network.lower_transport_pdu();
        // one AKF|AID octet, then ciphertext and the fixed 4-octet MIC
        if lower.len() < 1 + SzMic::Bit32.size() + 1 {
            warn!("undersized unsegmented access pdu");
            ctx.release_pdu(CarrierPDU::Network(network));
            return;
        }
        let akf_aid = Aid::parse(lower[0]).unwrap_or_default();

        let encrypted = &mut self.incoming_encrypted;
        if encrypted.set_payload(&lower[1..]).is_err() {
            warn!("oversized unsegmented access pdu");
            ctx.release_pdu(CarrierPDU::Network(network));
            return;
        }
        encrypted.set_header(header);
        encrypted.set_netkey_index(network.netkey_index());
        encrypted.set_akf_aid(akf_aid);
        encrypted.set_szmic(SzMic::Bit32);

        self.begin_access_decrypt(CarrierPDU::Network(network), ctx);
    }

    fn receive_segmented_access<C: UpperTransportContext>(
        &mut self,
        segmented: SegmentedPDU,
        ctx: &mut C,
    ) {
        let SegmentedMeta::Access { akf_aid, szmic } = *segmented.meta() else {
            error!("segmented access pdu with control metadata");
            ctx.release_pdu(CarrierPDU::Segmented(segmented));
            return;
        };
        let len = segmented.len();
        if len <= szmic.size() || len > ACCESS_PAYLOAD_MAX {
            warn!("bad segmented access pdu length: {}", len);
            ctx.release_pdu(CarrierPDU::Segmented(segmented));
            return;
        }

        let mut buffer = [0; ACCESS_PAYLOAD_MAX];
        segmented.flatten(&mut buffer);

        let encrypted = &mut self.incoming_encrypted;
        if encrypted.set_payload(&buffer[..len]).is_err() {
            ctx.release_pdu(CarrierPDU::Segmented(segmented));
            return;
        }
        encrypted.set_header(*segmented.header());
        encrypted.set_netkey_index(segmented.netkey_index());
        encrypted.set_akf_aid(akf_aid);
        encrypted.set_szmic(szmic);

        self.begin_access_decrypt(CarrierPDU::Segmented(segmented), ctx);
    }

    /// Set up the candidate enumeration for the assembled ciphertext
    /// and kick off the first decryption attempt.
    fn begin_access_decrypt<C: UpperTransportContext>(&mut self, carrier: CarrierPDU, ctx: &mut C) {
        let dst = self.incoming_encrypted.header().dst();
        let netkey_index = self.incoming_encrypted.netkey_index();
        let aid = self.incoming_encrypted.akf_aid();

        let candidates = CandidateIterator::new(dst, netkey_index, aid, &self.keys);
        let state = DecryptState {
            carrier,
            candidates,
            candidate: None,
            step: Step::Init,
        };
        self.start_next_candidate(state, ctx);
    }

    /// One iteration of the validate loop: pick the next `(key, label)`
    /// pair and submit the CCM init. With no candidates left the PDU is
    /// abandoned and its carrier released.
    pub(crate) fn start_next_candidate<C: UpperTransportContext>(
        &mut self,
        mut state: DecryptState,
        ctx: &mut C,
    ) {
        if !state
            .candidates
            .has_more(&self.keys, &self.virtual_addresses)
        {
            debug!("no transport key authenticates the pdu");
            self.crypto = CryptoState::Idle;
            ctx.release_pdu(state.carrier);
            return;
        }
        let candidate = state.candidates.next(&self.keys, &self.virtual_addresses);
        let key = candidate.and_then(|candidate| self.keys.transport_key_at(candidate.key_slot));
        let Some((candidate, key)) = candidate.zip(key) else {
            self.crypto = CryptoState::Idle;
            ctx.release_pdu(state.carrier);
            return;
        };
        let key_bytes = *key.key();
        let akf = key.akf();

        let header = *self.incoming_encrypted.header();
        let szmic = self.incoming_encrypted.szmic();
        let iv_index = self.iv_state.accepted_iv_index(header.ivi());
        let nonce = if akf {
            *ApplicationNonce::new(szmic, header.seq(), header.src(), header.dst(), iv_index)
        } else {
            *DeviceNonce::new(szmic, header.seq(), header.src(), header.dst(), iv_index)
        };

        let mic_len = szmic.size();
        let crypt_len = self.incoming_encrypted.len() - mic_len;
        let aad_len = if candidate.label_slot.is_some() { 16 } else { 0 };

        self.engine
            .init(&key_bytes, &nonce, crypt_len, aad_len, mic_len);
        state.candidate = Some(candidate);
        state.step = Step::Init;
        self.crypto = CryptoState::Decrypt(state);
    }

    pub(crate) fn advance_decrypt<C: UpperTransportContext>(
        &mut self,
        mut state: DecryptState,
        completion: CcmCompletion,
        ctx: &mut C,
    ) {
        match (&state.step, completion) {
            (Step::Init, CcmCompletion::Init) => {
                let label = state
                    .candidate
                    .and_then(|candidate| candidate.label_slot)
                    .and_then(|slot| self.virtual_addresses.entry_at(slot))
                    .map(|entry| {
                        let mut uuid = [0; 16];
                        uuid.copy_from_slice(entry.label_uuid().label_uuid());
                        uuid
                    });
                if let Some(label) = label {
                    self.engine.digest(&label);
                    state.step = Step::Digest;
                } else {
                    self.submit_decrypt();
                    state.step = Step::Crypt;
                }
                self.crypto = CryptoState::Decrypt(state);
            }
            (Step::Digest, CcmCompletion::Digest) => {
                self.submit_decrypt();
                state.step = Step::Crypt;
                self.crypto = CryptoState::Decrypt(state);
            }
            (Step::Crypt, CcmCompletion::Decrypt { mic_ok }) => {
                if mic_ok {
                    self.finish_decrypt(state, ctx);
                } else if self.incoming_encrypted.akf_aid().is_some() {
                    // any number of application keys may share the AID
                    debug!("transmic mismatch, trying next candidate");
                    self.start_next_candidate(state, ctx);
                } else {
                    // the device key is unique, nothing left to try
                    debug!("transmic mismatch under device key");
                    self.crypto = CryptoState::Idle;
                    ctx.release_pdu(state.carrier);
                }
            }
            _ => {
                error!("unexpected ccm completion while decrypting");
                self.crypto = CryptoState::Idle;
                ctx.release_pdu(state.carrier);
            }
        }
    }

    /// Fresh ciphertext copy for this attempt, decrypted in place.
    fn submit_decrypt(&mut self) {
        let mic_len = self.incoming_encrypted.szmic().size();
        let total = self.incoming_encrypted.len();
        let crypt_len = total - mic_len;

        self.incoming_decrypted = self.incoming_encrypted.clone();
        self.engine.decrypt(
            &mut self.incoming_decrypted.payload_mut()[..crypt_len],
            &self.incoming_encrypted.payload()[crypt_len..total],
        );
    }

    /// TransMIC verified: strip it, rewrite a virtual destination to
    /// the matched label's pseudo-destination, record the key, and hand
    /// the plaintext up.
    fn finish_decrypt<C: UpperTransportContext>(&mut self, state: DecryptState, ctx: &mut C) {
        let mic_len = self.incoming_decrypted.szmic().size();
        let crypt_len = self.incoming_decrypted.len() - mic_len;
        self.incoming_decrypted.set_payload_len(crypt_len).ok();

        if let Some(candidate) = state.candidate {
            if let Some(slot) = candidate.label_slot {
                if let Some(entry) = self.virtual_addresses.entry_at(slot) {
                    let pseudo_dst = entry.pseudo_dst();
                    self.incoming_decrypted
                        .header_mut()
                        .set_dst(Address::Virtual(pseudo_dst));
                }
            }
            if let Some(key) = self.keys.transport_key_at(candidate.key_slot) {
                self.incoming_decrypted.set_appkey_index(key.appkey_index());
            }
        }

        ctx.access_message_received(&self.incoming_decrypted);
        self.crypto = CryptoState::AwaitingAccessRelease {
            carrier: state.carrier,
        };
    }
}
