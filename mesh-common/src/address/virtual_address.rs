use crate::address::{Address, InvalidAddress};
use crate::{crypto, ParseError};
use cmac::crypto_mac::InvalidKeyLength;
use core::convert::TryInto;

/// A virtual address: the 16-bit hash shared by possibly several label UUIDs.
#[derive(Copy, Clone, Hash, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VirtualAddress(u16);

impl VirtualAddress {
    pub fn new(addr: u16) -> Result<Self, InvalidAddress> {
        if Self::is_virtual_address(&addr.to_be_bytes()) {
            Ok(Self(addr))
        } else {
            Err(InvalidAddress)
        }
    }

    /// Create a virtual address.
    ///
    /// # Safety
    /// The bit-pattern is not verified to be a valid virtual-address.
    pub unsafe fn new_unchecked(addr: u16) -> Self {
        Self(addr)
    }

    pub fn as_bytes(&self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    pub fn value(&self) -> u16 {
        self.0
    }

    pub fn is_virtual_address(data: &[u8; 2]) -> bool {
        data[0] & 0b11000000 == 0b10000000
    }

    pub fn parse(data: [u8; 2]) -> Result<Self, InvalidAddress> {
        if Self::is_virtual_address(&data) {
            Ok(VirtualAddress(u16::from_be_bytes(data)))
        } else {
            Err(InvalidAddress)
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for VirtualAddress {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{=u16:04x}", self.0)
    }
}

impl From<VirtualAddress> for Address {
    fn from(addr: VirtualAddress) -> Self {
        Self::Virtual(addr)
    }
}

/// A 16-octet label UUID, together with the virtual address it hashes to.
///
/// Several distinct labels may collide on the same virtual address; the
/// label itself is used as additional authenticated data when encrypting
/// to a virtual destination, which is what disambiguates them.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LabelUuid {
    uuid: [u8; 16],
    address: VirtualAddress,
}

impl LabelUuid {
    pub fn parse(uuid: &[u8]) -> Result<Self, ParseError> {
        if uuid.len() != 16 {
            Err(ParseError::InvalidLength)
        } else {
            Ok(
                Self::new(uuid.try_into().map_err(|_| ParseError::InvalidLength)?)
                    .map_err(|_| ParseError::InvalidLength)?,
            )
        }
    }

    pub fn new(uuid: [u8; 16]) -> Result<Self, InvalidKeyLength> {
        Ok(Self {
            uuid,
            address: Self::virtual_address_of(uuid)?,
        })
    }

    pub fn label_uuid(&self) -> &[u8] {
        &self.uuid
    }

    pub fn virtual_address(&self) -> VirtualAddress {
        self.address
    }

    pub fn virtual_address_of(uuid: [u8; 16]) -> Result<VirtualAddress, InvalidKeyLength> {
        let salt = crypto::s1(b"vtad")?;
        let hash = crypto::aes_cmac(&salt.into_bytes(), &uuid)?;
        let hash = &mut hash.into_bytes()[14..=15];
        hash[0] = (0b00111111 & hash[0]) | 0b10000000;
        let hash = u16::from_be_bytes([hash[0], hash[1]]);
        Ok(VirtualAddress(hash))
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for LabelUuid {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "label for {}", self.address)
    }
}
