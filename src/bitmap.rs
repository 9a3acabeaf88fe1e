/// Fixed-size bit vector keyed by leak id.
///
/// Bitmaps of different sizes interoperate: binary operations cover the
/// overlapping byte range, and `union_excluding` falls back to a plain OR for
/// overlap bytes beyond the exclusion set's range.
#[derive(Clone, Debug)]
pub struct LeakBitmap {
    bits: usize,
    bytes: Vec<u8>,
}

fn size_in_bytes(bits: usize) -> usize {
    1 + (bits >> 3)
}

impl LeakBitmap {
    pub fn new(bits: usize) -> LeakBitmap {
        LeakBitmap {
            bits,
            bytes: vec![0u8; size_in_bytes(bits)],
        }
    }

    pub fn len(&self) -> usize {
        self.bits
    }

    /// Out-of-range ids are silently ignored.
    pub fn add(&mut self, n: usize) {
        if n >= self.bits {
            return;
        }
        self.bytes[n >> 3] |= 1 << (n & 7);
    }

    pub fn remove(&mut self, n: usize) {
        if n >= self.bits {
            return;
        }
        self.bytes[n >> 3] &= !(1 << (n & 7));
    }

    pub fn contains(&self, n: usize) -> bool {
        if n >= self.bits {
            return false;
        }
        self.bytes[n >> 3] & (1 << (n & 7)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }

    /// OR `other` into `self` over the overlapping byte range.
    pub fn union(&mut self, other: &LeakBitmap) {
        let n = size_in_bytes(self.bits.min(other.bits));
        for i in 0..n {
            self.bytes[i] |= other.bytes[i];
        }
    }

    /// OR `src & !excl` into `self` for bytes within `excl`'s range; bytes of
    /// the overlap past `excl`'s end are ORed unmasked.
    pub fn union_excluding(&mut self, src: &LeakBitmap, excl: &LeakBitmap) {
        let min_bits = self.bits.min(src.bits);
        let n = size_in_bytes(min_bits);
        let ne = size_in_bytes(min_bits.min(excl.bits));
        for i in 0..ne {
            self.bytes[i] |= src.bytes[i] & !excl.bytes[i];
        }
        for i in ne..n {
            self.bytes[i] |= src.bytes[i];
        }
    }

    /// True iff every bit of `other` (within the overlap) is set in `self`.
    pub fn contains_all(&self, other: &LeakBitmap) -> bool {
        let n = size_in_bytes(self.bits.min(other.bits));
        for i in 0..n {
            if self.bytes[i] & other.bytes[i] != other.bytes[i] {
                return false;
            }
        }
        true
    }

    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.bits).filter(|n| self.contains(*n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove_contains() {
        let mut s = LeakBitmap::new(16);
        assert!(s.is_empty());
        s.add(0);
        s.add(9);
        assert!(s.contains(0));
        assert!(s.contains(9));
        assert!(!s.contains(1));
        assert!(!s.is_empty());
        s.remove(9);
        assert!(!s.contains(9));
        // out of range is a no-op
        s.add(16);
        assert!(!s.contains(16));
    }

    #[test]
    fn test_union() {
        let mut a = LeakBitmap::new(16);
        let mut b = LeakBitmap::new(16);
        a.add(1);
        b.add(2);
        b.add(15);
        a.union(&b);
        assert!(a.contains(1));
        assert!(a.contains(2));
        assert!(a.contains(15));
    }

    #[test]
    fn test_union_excluding() {
        let mut dst = LeakBitmap::new(32);
        let mut src = LeakBitmap::new(32);
        let mut excl = LeakBitmap::new(32);
        dst.add(0);
        src.add(1);
        src.add(2);
        src.add(20);
        excl.add(2);
        let before = dst.clone();
        dst.union_excluding(&src, &excl);
        for k in 0..32 {
            let want = before.contains(k) || (src.contains(k) && !excl.contains(k));
            assert_eq!(dst.contains(k), want, "bit {}", k);
        }
        assert!(dst.contains(0));
        assert!(dst.contains(1));
        assert!(!dst.contains(2));
        assert!(dst.contains(20));
    }

    #[test]
    fn test_union_excluding_tail() {
        // exclusion set shorter than src: bits past its byte range are ORed
        // through unmasked
        let mut dst = LeakBitmap::new(32);
        let mut src = LeakBitmap::new(32);
        let excl_short = {
            let mut e = LeakBitmap::new(4);
            e.add(1);
            e
        };
        src.add(1);
        src.add(20);
        dst.union_excluding(&src, &excl_short);
        assert!(!dst.contains(1));
        assert!(dst.contains(20));
    }

    #[test]
    fn test_contains_all() {
        let mut a = LeakBitmap::new(16);
        let mut b = LeakBitmap::new(16);
        a.add(3);
        a.add(7);
        b.add(3);
        assert!(a.contains_all(&b));
        b.add(8);
        assert!(!a.contains_all(&b));
        a.add(8);
        assert!(a.contains_all(&b));
        // empty set is contained in anything
        let empty = LeakBitmap::new(16);
        assert!(a.contains_all(&empty));
        assert!(empty.contains_all(&empty));
    }

    #[test]
    fn test_iter_set() {
        let mut s = LeakBitmap::new(12);
        s.add(0);
        s.add(5);
        s.add(11);
        let set: Vec<usize> = s.iter_set().collect();
        assert_eq!(set, vec![0, 5, 11]);
    }
}
