use crate::{crypto, InsufficientBuffer, ParseError};
use cmac::crypto_mac::InvalidKeyLength;
use core::ops::Deref;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use heapless::Vec;

/// Application key identifier: the 6 low bits of the first upper-transport
/// access octet, valid only when the AKF bit is set.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Debug, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Aid(u8);

impl Aid {
    pub fn parse(akf_aid: u8) -> Result<Option<Self>, ParseError> {
        let akf = akf_aid & 0b01000000 != 0;
        if akf {
            let aid = akf_aid & 0b00111111;
            Ok(Some(Self(aid)))
        } else {
            Ok(None)
        }
    }

    pub fn emit<const N: usize>(&self, xmit: &mut Vec<u8, N>) -> Result<(), InsufficientBuffer> {
        let akf_aid = 0b01000000 | self.0 & 0b00111111;
        xmit.push(akf_aid)?;
        Ok(())
    }

    /// The first upper-transport octet for this AID, AKF bit included.
    pub fn akf_aid(&self) -> u8 {
        0b01000000 | (self.0 & 0b00111111)
    }
}

impl From<Aid> for u8 {
    fn from(aid: Aid) -> Self {
        aid.0
    }
}

impl From<u8> for Aid {
    fn from(val: u8) -> Self {
        Self(val)
    }
}

/// An application key with its derived AID.
#[derive(Copy, Clone, Debug, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ApplicationKey {
    application_key: [u8; 16],
    aid: Aid,
}

impl ApplicationKey {
    pub fn new(application_key: [u8; 16]) -> Result<Self, InvalidKeyLength> {
        let aid = crypto::k4(&application_key)?.into();

        Ok(Self {
            application_key,
            aid,
        })
    }

    pub fn aid(&self) -> Aid {
        self.aid
    }
}

impl Deref for ApplicationKey {
    type Target = [u8; 16];

    fn deref(&self) -> &Self::Target {
        &self.application_key
    }
}

#[cfg(feature = "defmt")]
impl ::defmt::Format for ApplicationKey {
    fn format(&self, fmt: ::defmt::Formatter) {
        ::defmt::write!(fmt, "ApplicationKey({})", self.aid)
    }
}

#[cfg(test)]
mod tests {
    use super::{Aid, ApplicationKey};

    #[test]
    fn aid_parse() {
        assert_eq!(Some(Aid(0x23)), Aid::parse(0x63).unwrap());
        assert_eq!(None, Aid::parse(0x23).unwrap());
        assert_eq!(0x63, Aid(0x23).akf_aid());
    }

    #[test]
    fn aid_derivation() {
        // 8.1.6 k4 function
        let key = [
            0x32, 0x16, 0xd1, 0x50, 0x98, 0x84, 0xb5, 0x33, 0x24, 0x85, 0x41, 0x79, 0x2b, 0x87,
            0x7f, 0x98,
        ];
        let app_key = ApplicationKey::new(key).unwrap();
        assert_eq!(Aid(0x38), app_key.aid());
    }
}
