use crate::AmlError;
use bit_field::BitField;
use core::fmt;
use log::{error, warn};

const OWNER_ID_WORDS: usize = 128;

/// Identifies the creator of a set of namespace nodes (a loaded table, or a single invocation of a control
/// method), so that everything it created can be freed collectively. Zero is reserved to mean "no owner".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerId(u16);

impl OwnerId {
    pub const NONE: OwnerId = OwnerId(0);
    pub const MAX: u16 = (OWNER_ID_WORDS * 32 - 1) as u16;

    pub fn as_u16(self) -> u16 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(value: u16) -> OwnerId {
        OwnerId(value)
    }
}

impl fmt::Debug for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerId({})", self.0)
    }
}

/// A pool of 4095 owner ids, tracked as a bitmap of 128 32-bit words. Allocation scans from a rotating cursor
/// so that recently released ids are not immediately handed out again.
pub struct OwnerIdAllocator {
    bitmap: [u32; OWNER_ID_WORDS],
    last_word: usize,
    last_bit: usize,
}

impl OwnerIdAllocator {
    pub fn new() -> OwnerIdAllocator {
        let mut bitmap = [0u32; OWNER_ID_WORDS];
        // The final bit would encode id 4096, which does not fit the 12-bit id space
        bitmap[OWNER_ID_WORDS - 1].set_bit(31, true);
        OwnerIdAllocator { bitmap, last_word: 0, last_bit: 0 }
    }

    pub fn allocate(&mut self) -> Result<OwnerId, AmlError> {
        /*
         * Scan every word once, starting from the cursor. The first word is visited twice: once from the cursor
         * bit to its end, and once more at the end of the wrap from bit 0, so bits before the cursor are not
         * missed.
         */
        let mut word = self.last_word;
        let mut first_bit = self.last_bit;

        for _ in 0..=OWNER_ID_WORDS {
            let bits = self.bitmap[word];
            if bits != u32::MAX {
                for bit in first_bit..32 {
                    if !bits.get_bit(bit) {
                        self.bitmap[word].set_bit(bit, true);
                        self.last_word = word;
                        self.last_bit = bit + 1;
                        if self.last_bit == 32 {
                            self.last_bit = 0;
                            self.last_word = (word + 1) % OWNER_ID_WORDS;
                        }

                        return Ok(OwnerId((word * 32 + bit + 1) as u16));
                    }
                }
            }

            word = (word + 1) % OWNER_ID_WORDS;
            first_bit = 0;
        }

        error!("All {} owner ids are in use. Either ids are being leaked, or AML is recursing too deeply", OwnerId::MAX);
        Err(AmlError::OwnerIdExhausted)
    }

    pub fn release(&mut self, id: OwnerId) -> Result<(), AmlError> {
        if id.0 == 0 || id.0 > OwnerId::MAX {
            warn!("Attempted to release invalid owner id {}", id.0);
            return Err(AmlError::OwnerIdNotAllocated(id.0));
        }

        let index = (id.0 - 1) as usize;
        let (word, bit) = (index / 32, index % 32);
        if !self.bitmap[word].get_bit(bit) {
            warn!("Attempted to release owner id {} which is not allocated", id.0);
            return Err(AmlError::OwnerIdNotAllocated(id.0));
        }

        self.bitmap[word].set_bit(bit, false);
        Ok(())
    }

    pub fn is_allocated(&self, id: OwnerId) -> bool {
        if id.0 == 0 || id.0 > OwnerId::MAX {
            return false;
        }
        let index = (id.0 - 1) as usize;
        self.bitmap[index / 32].get_bit(index % 32)
    }

    pub fn num_allocated(&self) -> usize {
        // Don't count the reserved top bit
        self.bitmap.iter().map(|word| word.count_ones() as usize).sum::<usize>() - 1
    }
}

impl Default for OwnerIdAllocator {
    fn default() -> Self {
        OwnerIdAllocator::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn ids_start_at_one() {
        let mut allocator = OwnerIdAllocator::new();
        assert_eq!(allocator.allocate(), Ok(OwnerId(1)));
        assert_eq!(allocator.allocate(), Ok(OwnerId(2)));
        assert_eq!(allocator.num_allocated(), 2);
    }

    #[test]
    fn cursor_rotates_past_released_ids() {
        let mut allocator = OwnerIdAllocator::new();
        let first = allocator.allocate().unwrap();
        let second = allocator.allocate().unwrap();
        allocator.release(first).unwrap();

        // The freed id is behind the cursor, so the next allocation moves on
        assert_eq!(allocator.allocate(), Ok(OwnerId(3)));
        assert!(allocator.is_allocated(second));
        assert!(!allocator.is_allocated(first));
    }

    #[test]
    fn exhaustion_and_reuse() {
        let mut allocator = OwnerIdAllocator::new();
        for i in 1..=OwnerId::MAX {
            assert_eq!(allocator.allocate(), Ok(OwnerId(i)));
        }
        assert_eq!(allocator.allocate(), Err(AmlError::OwnerIdExhausted));

        allocator.release(OwnerId(17)).unwrap();
        assert_eq!(allocator.allocate(), Ok(OwnerId(17)));
        assert_eq!(allocator.allocate(), Err(AmlError::OwnerIdExhausted));
    }

    #[test]
    fn double_release_is_reported() {
        let mut allocator = OwnerIdAllocator::new();
        let id = allocator.allocate().unwrap();
        assert_eq!(allocator.release(id), Ok(()));
        assert_eq!(allocator.release(id), Err(AmlError::OwnerIdNotAllocated(id.as_u16())));
        assert_eq!(allocator.release(OwnerId::NONE), Err(AmlError::OwnerIdNotAllocated(0)));
    }

    #[test]
    fn random_sequences_never_hand_out_live_ids() {
        // Simple xorshift so the sequence is reproducible
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        let mut allocator = OwnerIdAllocator::new();
        let mut live = BTreeSet::new();
        let mut ordered = std::vec::Vec::new();

        for _ in 0..20_000 {
            let roll = next();
            if roll % 3 != 0 || live.is_empty() {
                match allocator.allocate() {
                    Ok(id) => {
                        assert!(live.insert(id), "owner id {:?} handed out twice", id);
                        ordered.push(id);
                    }
                    Err(err) => {
                        assert_eq!(err, AmlError::OwnerIdExhausted);
                        assert_eq!(live.len(), OwnerId::MAX as usize);
                    }
                }
            } else {
                let victim = ordered.swap_remove((next() as usize) % ordered.len());
                assert!(live.remove(&victim));
                allocator.release(victim).unwrap();
            }
            assert_eq!(allocator.num_allocated(), live.len());
        }
    }
}
