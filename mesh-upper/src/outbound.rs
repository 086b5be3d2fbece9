use crate::ccm::{CcmCompletion, CcmEngine};
use crate::upper::{CryptoState, EncryptState, Origin, Step, UpperTransport};
use crate::{TransportStatus, UpperTransportContext};
use mesh_common::address::Address;
use mesh_common::crypto::nonce::{ApplicationNonce, DeviceNonce};
use mesh_pdu::network::NetworkPDU;
use mesh_pdu::segmented::{store_payload, SegmentedMeta};
use mesh_pdu::upper::{UpperControlPDU, UpperPDU};
use mesh_pdu::CarrierPDU;

impl<E: CcmEngine> UpperTransport<E> {
    /// Outbound half of the scheduler: take PDUs off the outgoing
    /// queue while the engine is free, the destination accepts traffic
    /// and the pools hold enough carriers. A PDU that cannot proceed
    /// goes back to the head of the queue.
    pub(crate) fn run_outgoing<C: UpperTransportContext>(&mut self, ctx: &mut C) {
        while !self.crypto_busy() {
            if self.active_full() {
                break;
            }
            let Some(pdu) = self.outgoing.pop_front() else {
                break;
            };
            if !ctx.can_send_to_dest(pdu.dst()) {
                self.outgoing.push_front(pdu).ok();
                break;
            }

            match pdu {
                UpperPDU::UnsegmentedControl(network) => {
                    self.send_unsegmented_control(network, ctx);
                }
                UpperPDU::SegmentedControl(mut control) => {
                    if control.lower_pdu().is_none() {
                        match self.pools.get_segmented() {
                            Some(shell) => control.set_lower_pdu(shell.into()),
                            None => {
                                self.outgoing
                                    .push_front(UpperPDU::SegmentedControl(control))
                                    .ok();
                                break;
                            }
                        }
                    }
                    self.send_segmented_control(control, ctx);
                }
                UpperPDU::SegmentedAccess(mut access) => {
                    if access.lower_pdu().is_none() {
                        match self.pools.get_segmented() {
                            Some(shell) => access.set_lower_pdu(shell.into()),
                            None => {
                                self.outgoing
                                    .push_front(UpperPDU::SegmentedAccess(access))
                                    .ok();
                                break;
                            }
                        }
                    }
                    let total = access.len() + access.szmic().size();
                    let allocated = match access.lower_pdu_mut() {
                        Some(CarrierPDU::Segmented(shell)) => {
                            self.pools.allocate_segments(shell.segments_mut(), total)
                        }
                        _ => false,
                    };
                    if !allocated {
                        self.outgoing
                            .push_front(UpperPDU::SegmentedAccess(access))
                            .ok();
                        break;
                    }
                    self.send_access(UpperPDU::SegmentedAccess(access), ctx);
                }
                UpperPDU::UnsegmentedAccess(mut access) => {
                    if access.lower_pdu().is_none() {
                        match self.pools.get_network() {
                            Some(network) => access.set_lower_pdu(network.into()),
                            None => {
                                self.outgoing
                                    .push_front(UpperPDU::UnsegmentedAccess(access))
                                    .ok();
                                break;
                            }
                        }
                    }
                    self.send_access(UpperPDU::UnsegmentedAccess(access), ctx);
                }
            }

            self.pump_crypto(ctx);
        }
    }

    fn send_unsegmented_control<C: UpperTransportContext>(
        &mut self,
        mut network: NetworkPDU,
        ctx: &mut C,
    ) {
        ctx.reserve_slot();
        let seq = self.sequence.next();
        if network.set_seq(seq).is_err() {
            error!("unsegmented control pdu without a packed header");
            self.pools.free_network(network);
            return;
        }
        self.push_active(seq, Origin::Control, None);
        ctx.send_pdu(CarrierPDU::Network(network));
    }

    fn send_segmented_control<C: UpperTransportContext>(
        &mut self,
        mut control: UpperControlPDU,
        ctx: &mut C,
    ) {
        ctx.reserve_slot();
        let seq = self.sequence.next();
        control.reserve_seq(seq);

        let Some(CarrierPDU::Segmented(mut shell)) = control.take_lower_pdu() else {
            error!("segmented control pdu without a segmented carrier");
            ctx.control_pdu_sent(
                TransportStatus::SendFailed,
                UpperPDU::SegmentedControl(control),
            );
            return;
        };

        // lend the payload segments to the carrier for this send
        *shell.segments_mut() = control.take_segments();
        debug_assert!(control.segments().is_empty());

        shell.set_meta(SegmentedMeta::Control {
            opcode: control.opcode(),
        });
        shell.set_netkey_index(control.netkey_index());
        shell.set_len(control.len() as u16);
        *shell.header_mut() = control.network_header();

        self.push_active(
            seq,
            Origin::Control,
            Some(UpperPDU::SegmentedControl(control)),
        );
        ctx.send_pdu(CarrierPDU::Segmented(shell));
    }

    /// Key and virtual-address resolution, sequence reservation, and
    /// the CCM encrypt submission for an outbound access PDU.
    fn send_access<C: UpperTransportContext>(&mut self, mut pdu: UpperPDU, ctx: &mut C) {
        let access = match &mut pdu {
            UpperPDU::UnsegmentedAccess(access) | UpperPDU::SegmentedAccess(access) => access,
            _ => return,
        };

        // a virtual destination is addressed by pseudo-address; the
        // wire carries the 16-bit hash and the label becomes AAD
        let mut label_slot = None;
        if let Address::Virtual(pseudo_dst) = access.dst() {
            match self.virtual_addresses.slot_for_pseudo_dst(pseudo_dst) {
                Some(slot) => {
                    label_slot = Some(slot);
                    if let Some(entry) = self.virtual_addresses.entry_at(slot) {
                        access.set_dst(Address::Virtual(entry.hash()));
                    }
                }
                None => {
                    warn!(
                        "no virtual address registered for pseudo dst {}",
                        pseudo_dst.value()
                    );
                    ctx.access_pdu_sent(TransportStatus::SendFailed, pdu);
                    return;
                }
            }
        }

        let Some(key) = self
            .keys
            .outgoing_key(access.netkey_index(), access.appkey_index())
        else {
            warn!("app key {} not found, drop message", access.appkey_index().value());
            ctx.access_pdu_sent(TransportStatus::SendFailed, pdu);
            return;
        };
        let key_bytes = *key.key();

        ctx.reserve_slot();

        // the reserved sequence number is also what encrypts the payload
        let seq = self.sequence.next();
        access.reserve_seq(seq);

        let len = access.len();
        let copied = access.flatten_into(&mut self.crypto_buffer);
        debug_assert_eq!(copied, len);

        let szmic = access.szmic();
        let iv_index = self.iv_state.accepted_iv_index(access.ivi());
        let nonce = if access.appkey_index().is_device() {
            *DeviceNonce::new(szmic, seq, access.src(), access.dst(), iv_index)
        } else {
            *ApplicationNonce::new(szmic, seq, access.src(), access.dst(), iv_index)
        };

        let aad_len = if label_slot.is_some() { 16 } else { 0 };
        self.engine
            .init(&key_bytes, &nonce, len, aad_len, szmic.size());
        self.crypto = CryptoState::Encrypt(EncryptState {
            upper: pdu,
            label_slot,
            step: Step::Init,
        });
    }

    pub(crate) fn advance_encrypt<C: UpperTransportContext>(
        &mut self,
        mut state: EncryptState,
        completion: CcmCompletion,
        ctx: &mut C,
    ) {
        let (len, mic_len) = match &state.upper {
            UpperPDU::UnsegmentedAccess(access) | UpperPDU::SegmentedAccess(access) => {
                (access.len(), access.szmic().size())
            }
            _ => {
                error!("encrypting a non-access pdu");
                return;
            }
        };

        match (&state.step, completion) {
            (Step::Init, CcmCompletion::Init) => {
                let label = state
                    .label_slot
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
                    self.engine.encrypt(&mut self.crypto_buffer[..len]);
                    state.step = Step::Crypt;
                }
                self.crypto = CryptoState::Encrypt(state);
            }
            (Step::Digest, CcmCompletion::Digest) => {
                self.engine.encrypt(&mut self.crypto_buffer[..len]);
                state.step = Step::Crypt;
                self.crypto = CryptoState::Encrypt(state);
            }
            (Step::Crypt, CcmCompletion::Encrypt) => {
                // the ciphertext grows by the authentication tag
                self.engine
                    .authentication_value(&mut self.crypto_buffer[len..len + mic_len]);
                self.crypto = CryptoState::Idle;
                self.emit_access(state.upper, ctx);
            }
            _ => {
                error!("unexpected ccm completion while encrypting");
                self.crypto = CryptoState::Idle;
                ctx.access_pdu_sent(TransportStatus::SendFailed, state.upper);
            }
        }
    }

    /// Ciphertext and TransMIC are ready in the crypto buffer; pack
    /// them into the carrier and hand it to the lower transport.
    fn emit_access<C: UpperTransportContext>(&mut self, pdu: UpperPDU, ctx: &mut C) {
        match pdu {
            UpperPDU::UnsegmentedAccess(mut access) => {
                let total = access.len() + access.szmic().size();
                let Some(CarrierPDU::Network(mut network)) = access.take_lower_pdu() else {
                    error!("unsegmented access pdu without a network carrier");
                    ctx.access_pdu_sent(
                        TransportStatus::SendFailed,
                        UpperPDU::UnsegmentedAccess(access),
                    );
                    return;
                };

                network.clear();
                let packed = network
                    .set_header(access.network_header())
                    .and_then(|_| network.append(&[access.akf_aid_octet()]))
                    .and_then(|_| network.append(&self.crypto_buffer[..total]));
                if packed.is_err() {
                    error!("unsegmented access pdu exceeds a network pdu");
                    self.pools.free_network(network);
                    ctx.access_pdu_sent(
                        TransportStatus::SendFailed,
                        UpperPDU::UnsegmentedAccess(access),
                    );
                    return;
                }
                network.set_netkey_index(access.netkey_index());

                let seq = access.seq().unwrap_or_default();
                self.push_active(
                    seq,
                    Origin::Access,
                    Some(UpperPDU::UnsegmentedAccess(access)),
                );
                ctx.send_pdu(CarrierPDU::Network(network));
            }
            UpperPDU::SegmentedAccess(mut access) => {
                let total = access.len() + access.szmic().size();
                let Some(CarrierPDU::Segmented(mut shell)) = access.take_lower_pdu() else {
                    error!("segmented access pdu without a segmented carrier");
                    ctx.access_pdu_sent(
                        TransportStatus::SendFailed,
                        UpperPDU::SegmentedAccess(access),
                    );
                    return;
                };

                let mut free_segments = shell.take_segments();
                let stored = store_payload(
                    &self.crypto_buffer[..total],
                    &mut free_segments,
                    shell.segments_mut(),
                );
                for leftover in free_segments {
                    self.pools.free_network(leftover);
                }
                if stored.is_err() {
                    error!("segmented access pdu lost its carrier segments");
                    self.pools.free_segmented(shell);
                    ctx.access_pdu_sent(
                        TransportStatus::SendFailed,
                        UpperPDU::SegmentedAccess(access),
                    );
                    return;
                }

                shell.set_meta(SegmentedMeta::Access {
                    akf_aid: access.akf_aid(),
                    szmic: access.szmic(),
                });
                shell.set_netkey_index(access.netkey_index());
                shell.set_len(total as u16);
                *shell.header_mut() = access.network_header();

                let seq = access.seq().unwrap_or_default();
                self.push_active(seq, Origin::Access, Some(UpperPDU::SegmentedAccess(access)));
                ctx.send_pdu(CarrierPDU::Segmented(shell));
            }
            other => {
                error!("emitting a non-access pdu");
                ctx.access_pdu_sent(TransportStatus::SendFailed, other);
            }
        }
    }
}
