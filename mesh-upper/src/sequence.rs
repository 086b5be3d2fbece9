use mesh_common::Seq;
use core::sync::atomic::{AtomicU32, Ordering};

/// Monotone sequence-number source. A number handed out by
/// [`next`](Self::next) is reserved for good; there is no way to return
/// one.
pub struct Sequence {
    seq: AtomicU32,
}

impl Sequence {
    pub fn new(initial_seq: Seq) -> Self {
        Self {
            seq: AtomicU32::new(initial_seq.value()),
        }
    }

    pub fn next(&self) -> Seq {
        Seq::new(self.seq.fetch_add(1, Ordering::Relaxed))
    }

    pub fn current(&self) -> u32 {
        self.seq.load(Ordering::Relaxed)
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new(Seq::new(0))
    }
}

#[cfg(test)]
mod tests {
    use super::Sequence;
    use mesh_common::Seq;

    #[test]
    fn monotone() {
        let sequence = Sequence::new(Seq::new(40));
        assert_eq!(40, sequence.next().value());
        assert_eq!(41, sequence.next().value());
        assert_eq!(42, sequence.next().value());
        assert_eq!(43, sequence.current());
    }
}
