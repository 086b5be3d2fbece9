use crate::keys::Keys;
use crate::vaddr::VirtualAddresses;
use mesh_common::address::{Address, VirtualAddress};
use mesh_common::crypto::application::Aid;
use mesh_common::NetKeyIndex;

/// One decryption attempt: a key slot, and the label-UUID slot to use
/// as additional authenticated data when the destination is virtual.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Candidate {
    pub key_slot: usize,
    pub label_slot: Option<usize>,
}

/// Lazy enumeration of the `(key, label UUID)` pairs to try against a
/// received access PDU.
///
/// For a non-virtual destination this walks the matching keys once.
/// For a virtual destination it walks the cartesian product, keys in
/// the outer loop, the labels registered for the 16-bit hash in the
/// inner loop. A plain value with index cursors; the key store and
/// registry are passed in at each step.
pub struct CandidateIterator {
    dst: Address,
    netkey_index: NetKeyIndex,
    aid: Option<Aid>,
    key_cursor: usize,
    current_key: Option<usize>,
    label_cursor: usize,
}

impl CandidateIterator {
    pub fn new<const N: usize, const M: usize>(
        dst: Address,
        netkey_index: NetKeyIndex,
        aid: Option<Aid>,
        keys: &Keys<N, M>,
    ) -> Self {
        let mut it = Self {
            dst,
            netkey_index,
            aid,
            key_cursor: 0,
            current_key: None,
            label_cursor: 0,
        };
        if it.hash().is_some() {
            // cartesian mode holds one key while the labels cycle
            if let Some(slot) = keys.next_match(0, netkey_index, aid) {
                it.current_key = Some(slot);
                it.key_cursor = slot + 1;
            }
        }
        it
    }

    fn hash(&self) -> Option<VirtualAddress> {
        match self.dst {
            Address::Virtual(hash) => Some(hash),
            _ => None,
        }
    }

    /// Whether another pair remains. Advances the key cursor past
    /// exhausted label runs, but consumes nothing.
    pub fn has_more<const N: usize, const M: usize, const V: usize>(
        &mut self,
        keys: &Keys<N, M>,
        vaddrs: &VirtualAddresses<V>,
    ) -> bool {
        match self.hash() {
            None => keys
                .next_match(self.key_cursor, self.netkey_index, self.aid)
                .is_some(),
            Some(hash) => loop {
                if self.current_key.is_some()
                    && vaddrs.next_label(self.label_cursor, hash).is_some()
                {
                    return true;
                }
                match keys.next_match(self.key_cursor, self.netkey_index, self.aid) {
                    None => return false,
                    Some(slot) => {
                        self.current_key = Some(slot);
                        self.key_cursor = slot + 1;
                        self.label_cursor = 0;
                    }
                }
            },
        }
    }

    /// Consume and return the next pair.
    pub fn next<const N: usize, const M: usize, const V: usize>(
        &mut self,
        keys: &Keys<N, M>,
        vaddrs: &VirtualAddresses<V>,
    ) -> Option<Candidate> {
        match self.hash() {
            None => {
                let slot = keys.next_match(self.key_cursor, self.netkey_index, self.aid)?;
                self.key_cursor = slot + 1;
                Some(Candidate {
                    key_slot: slot,
                    label_slot: None,
                })
            }
            Some(hash) => {
                let label = vaddrs.next_label(self.label_cursor, hash)?;
                self.label_cursor = label + 1;
                Some(Candidate {
                    key_slot: self.current_key?,
                    label_slot: Some(label),
                })
            }
        }
    }
}
