pub mod group_address;
pub mod unicast_address;
pub mod virtual_address;

pub use group_address::GroupAddress;
pub use unicast_address::UnicastAddress;
pub use virtual_address::{LabelUuid, VirtualAddress};

use crate::ParseError;

/// Indicates an invalid address.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InvalidAddress;

impl From<InvalidAddress> for ParseError {
    fn from(_: InvalidAddress) -> Self {
        ParseError::InvalidValue
    }
}

/// Any destination address a transport PDU may carry.
///
/// A virtual address is the 16-bit hash of one or more label UUIDs; the
/// hash alone does not identify the label, so received virtual
/// destinations stay ambiguous until a label UUID authenticates the
/// payload.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Address {
    Unassigned,
    Unicast(UnicastAddress),
    Virtual(VirtualAddress),
    Group(GroupAddress),
}

impl Address {
    /// Convert an address to its big-endian 2-byte representation.
    pub fn as_bytes(&self) -> [u8; 2] {
        match self {
            Address::Unassigned => [0, 0],
            Address::Unicast(inner) => inner.as_bytes(),
            Address::Virtual(inner) => inner.as_bytes(),
            Address::Group(inner) => inner.as_bytes(),
        }
    }

    pub fn value(&self) -> u16 {
        u16::from_be_bytes(self.as_bytes())
    }

    /// Parse a big-endian 2-byte array into a mesh address.
    pub fn parse(data: [u8; 2]) -> Self {
        let val = u16::from_be_bytes(data);
        if val == 0 {
            Self::Unassigned
        } else if UnicastAddress::is_unicast_address(&data) {
            // Safety: already performed the check.
            unsafe { Self::Unicast(UnicastAddress::new_unchecked(val)) }
        } else if GroupAddress::is_group_address(&data) {
            // Safety: already performed the check.
            unsafe { Self::Group(GroupAddress::new_unchecked(data)) }
        } else {
            // Safety: all previous checks cover all other cases.
            unsafe { Self::Virtual(VirtualAddress::new_unchecked(val)) }
        }
    }

    pub fn is_unicast(&self) -> bool {
        matches!(self, Self::Unicast(_))
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, Self::Virtual(_))
    }
}
