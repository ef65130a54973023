//! Provides `PrioBitmap`, a one-word bit array recording which priority
//! levels have a non-empty run queue.
use core::fmt;

/// The maximum number of priority levels supported by [`PrioBitmap`].
pub const PRIO_BITMAP_MAX_LEN: usize = 32;

/// A bit array over priority levels. Bit `i` is set iff level `i` has at least
/// one runnable thread. The lowest set bit is the most urgent level.
///
/// All methods panic when the given bit position is out of range.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct PrioBitmap(u32);

impl PrioBitmap {
    pub const fn new() -> Self {
        Self(0)
    }

    /// Get the bit at the specified position.
    #[inline]
    pub fn get(&self, i: usize) -> bool {
        assert!(i < PRIO_BITMAP_MAX_LEN);
        self.0 & (1 << i) != 0
    }

    /// Clear the bit at the specified position.
    #[inline]
    pub fn clear(&mut self, i: usize) {
        assert!(i < PRIO_BITMAP_MAX_LEN);
        self.0 &= !(1 << i);
    }

    /// Set the bit at the specified position.
    #[inline]
    pub fn set(&mut self, i: usize) {
        assert!(i < PRIO_BITMAP_MAX_LEN);
        self.0 |= 1 << i;
    }

    /// Get the position of the first set bit.
    #[inline]
    pub fn find_set(&self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    /// Return `true` if some bit below position `end` is set.
    #[inline]
    pub fn any_below(&self, end: usize) -> bool {
        let mask = if end >= PRIO_BITMAP_MAX_LEN {
            u32::MAX
        } else {
            (1u32 << end) - 1
        };
        self.0 & mask != 0
    }
}

impl fmt::Debug for PrioBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set()
            .entries((0..PRIO_BITMAP_MAX_LEN).filter(|&i| self.get(i)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeSet;

    struct BTreePrioBitmap(BTreeSet<usize>);

    impl BTreePrioBitmap {
        fn new() -> Self {
            Self(BTreeSet::new())
        }

        fn enum_set_bits(&self) -> Vec<usize> {
            self.0.iter().cloned().collect()
        }

        fn clear(&mut self, i: usize) {
            self.0.remove(&i);
        }

        fn set(&mut self, i: usize) {
            self.0.insert(i);
        }

        fn find_set(&self) -> Option<usize> {
            self.0.iter().next().cloned()
        }

        fn any_below(&self, end: usize) -> bool {
            self.0.range(..end).next().is_some()
        }
    }

    /// A modifying operation on `PrioBitmap`.
    #[derive(Debug)]
    enum Cmd {
        Insert(usize),
        Remove(usize),
    }

    /// Map random bytes to operations on `PrioBitmap`.
    fn interpret(bytecode: &[u8], bitmap_len: usize) -> impl Iterator<Item = Cmd> + '_ {
        let mut i = 0;
        let mut known_set_bits = Vec::new();
        std::iter::from_fn(move || {
            if bitmap_len == 0 {
                None
            } else if let Some(instr) = bytecode.get(i..i + 5) {
                i += 5;

                let value = u32::from_le_bytes([instr[1], instr[2], instr[3], instr[4]]) as usize;

                if instr[0] % 2 == 0 || known_set_bits.is_empty() {
                    let bit = value % bitmap_len;
                    known_set_bits.push(bit);
                    Some(Cmd::Insert(bit))
                } else {
                    let i = value % known_set_bits.len();
                    let bit = known_set_bits.swap_remove(i);
                    Some(Cmd::Remove(bit))
                }
            } else {
                None
            }
        })
    }

    fn enum_set_bits(bitmap: &PrioBitmap, bitmap_len: usize) -> Vec<usize> {
        (0..bitmap_len).filter(|&i| bitmap.get(i)).collect()
    }

    fn test_inner(bytecode: Vec<u8>, size: usize) {
        let mut subject = PrioBitmap::new();
        let mut reference = BTreePrioBitmap::new();

        log::info!("size = {size}");

        for cmd in interpret(&bytecode, size) {
            log::trace!("    {cmd:?}");
            match cmd {
                Cmd::Insert(bit) => {
                    subject.set(bit);
                    reference.set(bit);
                }
                Cmd::Remove(bit) => {
                    // `interpret` may insert the same bit twice, but the
                    // bitmap (like the set) only records it once
                    if !reference.0.contains(&bit) {
                        continue;
                    }
                    subject.clear(bit);
                    reference.clear(bit);
                }
            }

            assert_eq!(subject.find_set(), reference.find_set());
            for end in [0, 1, size / 2, size, PRIO_BITMAP_MAX_LEN] {
                assert_eq!(subject.any_below(end), reference.any_below(end));
            }
        }

        assert_eq!(subject.find_set(), reference.find_set());
        assert_eq!(enum_set_bits(&subject, size), reference.enum_set_bits());
    }

    macro_rules! gen_test {
        ($(#[$m:meta])* mod $name:ident, $size:literal) => {
            $(#[$m])*
            mod $name {
                use super::*;

                #[quickcheck]
                fn test(bytecode: Vec<u8>) {
                    test_inner(bytecode, $size);
                }
            }
        };
    }

    gen_test!(mod size_0, 0);
    gen_test!(mod size_1, 1);
    gen_test!(mod size_8, 8);
    gen_test!(mod size_32, 32);

    #[test]
    fn debug_lists_levels() {
        let mut b = PrioBitmap::new();
        b.set(3);
        b.set(0);
        assert_eq!(format!("{b:?}"), "{0, 3}");
    }
}
