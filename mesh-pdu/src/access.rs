use crate::network::NetworkHeader;
use crate::ACCESS_PAYLOAD_MAX;
use mesh_common::crypto::application::Aid;
use mesh_common::mic::SzMic;
use mesh_common::{AppKeyIndex, InsufficientBuffer, NetKeyIndex};
use heapless::Vec;

/// A single-buffer access PDU, holding either ciphertext (TransMIC
/// still attached) or, after verification, the decrypted payload.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AccessPDU {
    header: NetworkHeader,
    netkey_index: NetKeyIndex,
    appkey_index: AppKeyIndex,
    akf_aid: Option<Aid>,
    szmic: SzMic,
    payload: Vec<u8, ACCESS_PAYLOAD_MAX>,
}

impl Default for AccessPDU {
    fn default() -> Self {
        Self {
            header: NetworkHeader::default(),
            netkey_index: NetKeyIndex::new(0),
            appkey_index: AppKeyIndex::new(0),
            akf_aid: None,
            szmic: SzMic::Bit32,
            payload: Vec::new(),
        }
    }
}

impl AccessPDU {
    pub fn header(&self) -> &NetworkHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut NetworkHeader {
        &mut self.header
    }

    pub fn set_header(&mut self, header: NetworkHeader) {
        self.header = header;
    }

    pub fn netkey_index(&self) -> NetKeyIndex {
        self.netkey_index
    }

    pub fn set_netkey_index(&mut self, netkey_index: NetKeyIndex) {
        self.netkey_index = netkey_index;
    }

    /// The key the payload was decrypted (or will be encrypted) under;
    /// meaningful only once a TransMIC has verified.
    pub fn appkey_index(&self) -> AppKeyIndex {
        self.appkey_index
    }

    pub fn set_appkey_index(&mut self, appkey_index: AppKeyIndex) {
        self.appkey_index = appkey_index;
    }

    pub fn akf_aid(&self) -> Option<Aid> {
        self.akf_aid
    }

    pub fn set_akf_aid(&mut self, akf_aid: Option<Aid>) {
        self.akf_aid = akf_aid;
    }

    pub fn szmic(&self) -> SzMic {
        self.szmic
    }

    pub fn set_szmic(&mut self, szmic: SzMic) {
        self.szmic = szmic;
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    pub fn set_payload(&mut self, payload: &[u8]) -> Result<(), InsufficientBuffer> {
        self.payload.clear();
        self.payload
            .extend_from_slice(payload)
            .map_err(|_| InsufficientBuffer)
    }

    pub fn set_payload_len(&mut self, len: usize) -> Result<(), InsufficientBuffer> {
        if len > ACCESS_PAYLOAD_MAX {
            return Err(InsufficientBuffer);
        }
        if len <= self.payload.len() {
            self.payload.truncate(len);
        } else {
            self.payload.resize(len, 0).map_err(|_| InsufficientBuffer)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
