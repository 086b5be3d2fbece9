use crate::crypto;
use cmac::crypto_mac::InvalidKeyLength;
use core::ops::Deref;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Network key identifier carried in the first network PDU octet.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Debug, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Nid(u8);

impl Nid {
    pub fn new(nid: u8) -> Self {
        Self(nid)
    }

    pub fn parse(nid: u8) -> Result<Nid, crate::ParseError> {
        Ok(Self::new(nid))
    }
}

impl From<Nid> for u8 {
    fn from(nid: Nid) -> Self {
        nid.0
    }
}

impl From<u8> for Nid {
    fn from(val: u8) -> Self {
        Self(val)
    }
}

/// A network key with its derived NID.
///
/// The upper transport only consumes the NID (for the IVI|NID octet of
/// outbound headers); encryption and privacy keys stay with the network
/// layer.
#[derive(Copy, Clone, Debug, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NetworkKey {
    network_key: [u8; 16],
    nid: Nid,
}

impl NetworkKey {
    pub fn new(network_key: [u8; 16]) -> Result<Self, InvalidKeyLength> {
        let (nid, _encryption_key, _privacy_key) = crypto::k2(&network_key, &[0x00])?;
        Ok(Self {
            network_key,
            nid: Nid::new(nid),
        })
    }

    pub fn nid(&self) -> Nid {
        self.nid
    }
}

impl Deref for NetworkKey {
    type Target = [u8; 16];

    fn deref(&self) -> &Self::Target {
        &self.network_key
    }
}

#[cfg(feature = "defmt")]
impl ::defmt::Format for NetworkKey {
    fn format(&self, fmt: ::defmt::Formatter) {
        ::defmt::write!(fmt, "NetworkKey(nid: {})", self.nid)
    }
}
