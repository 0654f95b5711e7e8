/// A set of host registers (or allocator slots) as a bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegSet(u32);

impl RegSet {
    pub const EMPTY: RegSet = RegSet(0);

    /// The set {0, 1, .., n-1}.
    pub const fn first_n(n: u8) -> RegSet {
        RegSet(((1u64 << n) - 1) as u32)
    }

    #[inline]
    pub const fn set(self, reg: u8) -> Self {
        RegSet(self.0 | (1 << reg))
    }

    #[inline]
    pub const fn clear(self, reg: u8) -> Self {
        RegSet(self.0 & !(1 << reg))
    }

    #[inline]
    pub const fn contains(self, reg: u8) -> bool {
        self.0 & (1 << reg) != 0
    }

    #[inline]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Lowest-numbered member, if any.
    #[inline]
    pub const fn first(self) -> Option<u8> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as u8)
        }
    }

    #[inline]
    pub const fn intersect(self, other: RegSet) -> RegSet {
        RegSet(self.0 & other.0)
    }

    #[inline]
    pub const fn subtract(self, other: RegSet) -> RegSet {
        RegSet(self.0 & !other.0)
    }

    /// Iterate members from lowest to highest.
    pub fn iter(self) -> impl Iterator<Item = u8> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                None
            } else {
                let r = bits.trailing_zeros() as u8;
                bits &= bits - 1;
                Some(r)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_clear_contains() {
        let s = RegSet::EMPTY.set(3).set(9);
        assert!(s.contains(3));
        assert!(s.contains(9));
        assert!(!s.contains(4));
        assert_eq!(s.count(), 2);
        let c = s.clear(3);
        assert!(!c.contains(3));
        assert_eq!(c.count(), 1);
    }

    #[test]
    fn first_is_lowest() {
        assert_eq!(RegSet::EMPTY.first(), None);
        assert_eq!(RegSet::EMPTY.set(7).set(2).first(), Some(2));
    }

    #[test]
    fn iter_orders_members() {
        let s = RegSet::EMPTY.set(10).set(0).set(6);
        let v: Vec<u8> = s.iter().collect();
        assert_eq!(v, [0, 6, 10]);
    }

    #[test]
    fn subtract_and_intersect() {
        let a = RegSet::EMPTY.set(1).set(2).set(3);
        let b = RegSet::EMPTY.set(2);
        assert_eq!(a.subtract(b), RegSet::EMPTY.set(1).set(3));
        assert_eq!(a.intersect(b), b);
    }
}
