use crate::UpperError;
use mesh_common::address::{LabelUuid, VirtualAddress};
use heapless::Vec;

/// A registered label UUID: the label itself, the 16-bit hash it
/// shares with possibly other labels, and the stable pseudo-destination
/// under which upper layers address it.
#[derive(Copy, Clone, Debug)]
pub struct VirtualAddressEntry {
    label_uuid: LabelUuid,
    pseudo_dst: VirtualAddress,
}

impl VirtualAddressEntry {
    pub fn label_uuid(&self) -> &LabelUuid {
        &self.label_uuid
    }

    /// On-the-wire 16-bit hash.
    pub fn hash(&self) -> VirtualAddress {
        self.label_uuid.virtual_address()
    }

    pub fn pseudo_dst(&self) -> VirtualAddress {
        self.pseudo_dst
    }
}

/// Registry of label UUIDs known to this node.
pub struct VirtualAddresses<const N: usize = 8> {
    entries: Vec<Option<VirtualAddressEntry>, N>,
}

impl<const N: usize> Default for VirtualAddresses<N> {
    fn default() -> Self {
        let mut entries = Vec::new();
        entries.resize(N, None).ok();
        Self { entries }
    }
}

impl<const N: usize> VirtualAddresses<N> {
    /// Register a label UUID, assigning it a pseudo-destination that
    /// stays stable for the lifetime of the registration.
    pub fn add(&mut self, label_uuid: LabelUuid) -> Result<VirtualAddress, UpperError> {
        for (index, slot) in self.entries.iter_mut().enumerate() {
            if slot.is_none() {
                // Safety: 0x8000..=0x803F keeps the virtual bit-pattern.
                let pseudo_dst = unsafe { VirtualAddress::new_unchecked(0x8000 | index as u16) };
                slot.replace(VirtualAddressEntry {
                    label_uuid,
                    pseudo_dst,
                });
                return Ok(pseudo_dst);
            }
        }
        Err(UpperError::InsufficientSpace)
    }

    pub fn remove(&mut self, pseudo_dst: VirtualAddress) {
        for slot in self.entries.iter_mut() {
            if matches!(slot, Some(entry) if entry.pseudo_dst == pseudo_dst) {
                slot.take();
            }
        }
    }

    pub fn entry_at(&self, slot: usize) -> Option<&VirtualAddressEntry> {
        self.entries.get(slot)?.as_ref()
    }

    pub fn slot_for_pseudo_dst(&self, pseudo_dst: VirtualAddress) -> Option<usize> {
        self.entries.iter().position(
            |slot| matches!(slot, Some(entry) if entry.pseudo_dst == pseudo_dst),
        )
    }

    pub fn for_pseudo_dst(&self, pseudo_dst: VirtualAddress) -> Option<&VirtualAddressEntry> {
        self.entries.iter().find_map(|slot| match slot {
            Some(entry) if entry.pseudo_dst == pseudo_dst => Some(entry),
            _ => None,
        })
    }

    /// Index of the next entry at or after `from` whose label hashes to
    /// the given virtual address.
    pub fn next_label(&self, from: usize, hash: VirtualAddress) -> Option<usize> {
        for slot in from..self.entries.len() {
            if matches!(&self.entries[slot], Some(entry) if entry.hash() == hash) {
                return Some(slot);
            }
        }
        None
    }
}
