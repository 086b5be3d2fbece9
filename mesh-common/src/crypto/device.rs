use core::ops::Deref;

/// The per-peer static device key, addressed by the reserved device
/// key index rather than an AID.
#[derive(Copy, Clone, Debug, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceKey([u8; 16]);

impl DeviceKey {
    pub fn new(device_key: [u8; 16]) -> Self {
        Self(device_key)
    }
}

impl Deref for DeviceKey {
    type Target = [u8; 16];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(feature = "defmt")]
impl ::defmt::Format for DeviceKey {
    fn format(&self, fmt: ::defmt::Formatter) {
        ::defmt::write!(fmt, "DeviceKey(..)")
    }
}
