use crate::UpperError;
use mesh_common::crypto::application::{Aid, ApplicationKey};
use mesh_common::crypto::device::DeviceKey;
use mesh_common::crypto::network::NetworkKey;
use mesh_common::{AppKeyIndex, NetKeyIndex};
use heapless::Vec;

/// Key-refresh state of a subnet. Affects outgoing key selection only.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KeyRefreshPhase {
    Normal,
    FirstPhase,
    SecondPhase,
}

#[derive(Copy, Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Subnet {
    netkey_index: NetKeyIndex,
    key_refresh: KeyRefreshPhase,
}

impl Subnet {
    pub fn netkey_index(&self) -> NetKeyIndex {
        self.netkey_index
    }

    pub fn key_refresh(&self) -> KeyRefreshPhase {
        self.key_refresh
    }
}

/// A decryption/encryption key as the transport layer sees it: an
/// application key bound to a subnet, or the single device key.
#[derive(Copy, Clone, Debug)]
pub struct TransportKey {
    netkey_index: NetKeyIndex,
    appkey_index: AppKeyIndex,
    aid: Option<Aid>,
    key: [u8; 16],
    old_key: bool,
}

impl TransportKey {
    pub fn netkey_index(&self) -> NetKeyIndex {
        self.netkey_index
    }

    pub fn appkey_index(&self) -> AppKeyIndex {
        self.appkey_index
    }

    /// AKF as it will appear on the wire: set for application keys,
    /// clear for the device key.
    pub fn akf(&self) -> bool {
        self.aid.is_some()
    }

    pub fn aid(&self) -> Option<Aid> {
        self.aid
    }

    pub fn akf_aid_octet(&self) -> u8 {
        match self.aid {
            Some(aid) => aid.akf_aid(),
            None => 0,
        }
    }

    pub fn key(&self) -> &[u8; 16] {
        &self.key
    }

    pub fn is_old(&self) -> bool {
        self.old_key
    }
}

/// The transport-layer key store: application keys (old/new pairs
/// during key refresh), the device key, network keys (for their NID)
/// and per-subnet refresh state.
pub struct Keys<const N: usize = 8, const M: usize = 4> {
    transport: Vec<Option<TransportKey>, N>,
    network: Vec<Option<(NetKeyIndex, NetworkKey)>, M>,
    subnets: Vec<Option<Subnet>, M>,
}

impl<const N: usize, const M: usize> Default for Keys<N, M> {
    fn default() -> Self {
        let mut transport = Vec::new();
        transport.resize(N, None).ok();
        let mut network = Vec::new();
        network.resize(M, None).ok();
        let mut subnets = Vec::new();
        subnets.resize(M, None).ok();
        Self {
            transport,
            network,
            subnets,
        }
    }
}

impl<const N: usize, const M: usize> Keys<N, M> {
    pub fn set_device_key(&mut self, device_key: DeviceKey) -> Result<(), UpperError> {
        let entry = TransportKey {
            netkey_index: NetKeyIndex::new(0),
            appkey_index: AppKeyIndex::DEVICE,
            aid: None,
            key: *device_key,
            old_key: false,
        };
        if let Some(slot) = self
            .transport
            .iter_mut()
            .find(|slot| matches!(slot, Some(key) if key.appkey_index().is_device()))
        {
            slot.replace(entry);
            return Ok(());
        }
        self.store_transport(entry)
    }

    pub fn add_application_key(
        &mut self,
        appkey_index: AppKeyIndex,
        netkey_index: NetKeyIndex,
        application_key: ApplicationKey,
        old_key: bool,
    ) -> Result<(), UpperError> {
        if appkey_index.is_device() {
            return Err(UpperError::InvalidState);
        }
        self.store_transport(TransportKey {
            netkey_index,
            appkey_index,
            aid: Some(application_key.aid()),
            key: *application_key,
            old_key,
        })
    }

    fn store_transport(&mut self, key: TransportKey) -> Result<(), UpperError> {
        if let Some(slot) = self.transport.iter_mut().find(|slot| slot.is_none()) {
            slot.replace(key);
            Ok(())
        } else {
            Err(UpperError::InsufficientSpace)
        }
    }

    pub fn add_network_key(
        &mut self,
        netkey_index: NetKeyIndex,
        network_key: NetworkKey,
    ) -> Result<(), UpperError> {
        if let Some(slot) = self.network.iter_mut().find(|slot| slot.is_none()) {
            slot.replace((netkey_index, network_key));
        } else {
            return Err(UpperError::InsufficientSpace);
        }
        if self.subnet(netkey_index).is_none() {
            if let Some(slot) = self.subnets.iter_mut().find(|slot| slot.is_none()) {
                slot.replace(Subnet {
                    netkey_index,
                    key_refresh: KeyRefreshPhase::Normal,
                });
            } else {
                return Err(UpperError::InsufficientSpace);
            }
        }
        Ok(())
    }

    pub fn network_key(&self, netkey_index: NetKeyIndex) -> Option<&NetworkKey> {
        self.network.iter().find_map(|slot| match slot {
            Some((index, key)) if *index == netkey_index => Some(key),
            _ => None,
        })
    }

    pub fn subnet(&self, netkey_index: NetKeyIndex) -> Option<&Subnet> {
        self.subnets.iter().find_map(|slot| match slot {
            Some(subnet) if subnet.netkey_index() == netkey_index => Some(subnet),
            _ => None,
        })
    }

    pub fn set_key_refresh(
        &mut self,
        netkey_index: NetKeyIndex,
        phase: KeyRefreshPhase,
    ) -> Result<(), UpperError> {
        for slot in self.subnets.iter_mut() {
            if let Some(subnet) = slot {
                if subnet.netkey_index == netkey_index {
                    subnet.key_refresh = phase;
                    return Ok(());
                }
            }
        }
        Err(UpperError::UnknownNetKey)
    }

    /// Look a key up by its index; during key refresh the non-old key
    /// wins. The reserved device index returns the device key.
    pub fn get(&self, appkey_index: AppKeyIndex) -> Option<&TransportKey> {
        let mut fallback = None;
        for slot in self.transport.iter() {
            if let Some(key) = slot {
                if key.appkey_index == appkey_index {
                    if !key.old_key {
                        return Some(key);
                    }
                    fallback = Some(key);
                }
            }
        }
        fallback
    }

    pub fn transport_key_at(&self, slot: usize) -> Option<&TransportKey> {
        self.transport.get(slot)?.as_ref()
    }

    /// Index of the next key slot at or after `from` usable to decrypt
    /// a PDU carrying the given AKF/AID under the given subnet. An AKF
    /// of zero (no AID) selects the device key, which is not bound to a
    /// subnet.
    pub fn next_match(
        &self,
        from: usize,
        netkey_index: NetKeyIndex,
        aid: Option<Aid>,
    ) -> Option<usize> {
        for slot in from..self.transport.len() {
            if let Some(key) = &self.transport[slot] {
                let matches = match aid {
                    Some(aid) => {
                        key.aid == Some(aid) && key.netkey_index == netkey_index
                    }
                    None => !key.akf(),
                };
                if matches {
                    return Some(slot);
                }
            }
        }
        None
    }

    /// The key to encrypt an outgoing access PDU under, honoring the
    /// subnet's key-refresh phase. The device key is fixed.
    pub fn outgoing_key(
        &self,
        netkey_index: NetKeyIndex,
        appkey_index: AppKeyIndex,
    ) -> Option<&TransportKey> {
        if appkey_index.is_device() {
            return self.get(appkey_index);
        }

        let phase = self.subnet(netkey_index)?.key_refresh();

        let mut old_key = None;
        let mut new_key = None;
        for slot in self.transport.iter() {
            if let Some(key) = slot {
                if key.netkey_index != netkey_index || key.appkey_index != appkey_index {
                    continue;
                }
                if key.old_key {
                    old_key = Some(key);
                } else {
                    new_key = Some(key);
                }
            }
        }

        select_refresh_key(old_key, new_key, phase)
    }
}

/// Key-refresh decision table: with no old key the sole current key is
/// used; the new key takes over in the second phase, otherwise the old
/// key stays in effect.
fn select_refresh_key<'k>(
    old_key: Option<&'k TransportKey>,
    new_key: Option<&'k TransportKey>,
    phase: KeyRefreshPhase,
) -> Option<&'k TransportKey> {
    match (old_key, new_key, phase) {
        (None, new_key, _) => new_key,
        (_, Some(new_key), KeyRefreshPhase::SecondPhase) => Some(new_key),
        (old_key, _, _) => old_key,
    }
}
