//! Tags, selectors and pattern classes.
//!
//! A posted receive matches an incoming message when
//! `incoming_tag & selector == posted_tag & selector` and, if the receive
//! names a source, the sender is that source.

use std::fmt;

/// Application-defined message tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Tag(pub u64);

/// Bitmask applied to tags during comparison.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Selector(pub u64);

impl Selector {
    /// Every tag bit is significant.
    pub const ALL: Selector = Selector(u64::MAX);
    /// No tag bit is significant (any tag).
    pub const ANY: Selector = Selector(0);

    /// Apply the selector to a tag.
    #[inline]
    pub fn mask(self, tag: Tag) -> u64 {
        tag.0 & self.0
    }

    /// True if every bit of `other` is also set in `self`.
    #[inline]
    pub fn covers(self, other: Selector) -> bool {
        other.0 & !self.0 == 0
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Selector({:#x})", self.0)
    }
}

/// Identity of a sending endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

/// The shape of a posted receive's predicate: whether it constrains the
/// source, and which tag bits it compares.
///
/// Hash configs are learned per pattern class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatternClass {
    pub src_present: bool,
    pub selector: Selector,
}

impl PatternClass {
    /// Exact tag, exact source.
    pub const TAG_SRC: PatternClass = PatternClass::new(true, Selector::ALL);
    /// Exact tag, any source.
    pub const TAG_ANYSRC: PatternClass = PatternClass::new(false, Selector::ALL);
    /// Any tag, exact source.
    pub const ANYTAG_SRC: PatternClass = PatternClass::new(true, Selector::ANY);

    pub const fn new(src_present: bool, selector: Selector) -> Self {
        Self {
            src_present,
            selector,
        }
    }

    /// Pattern class of a posted receive.
    #[inline]
    pub fn of(selector: Selector, source: Option<PeerId>) -> Self {
        Self::new(source.is_some(), selector)
    }

    /// A class with no significant tag bits and no source constraint
    /// would hash every entry into one bucket. It is never hashed.
    #[inline]
    pub fn is_hashable(&self) -> bool {
        self.src_present || self.selector.0 != 0
    }

    /// True if a receive of this class pins down every bit that a hash
    /// under `other` reads, so the bucket under `other` can be computed
    /// from the receive alone.
    #[inline]
    pub fn covers(&self, other: &PatternClass) -> bool {
        self.selector.covers(other.selector) && (self.src_present || !other.src_present)
    }

    /// Bucket index under this class for a tag and optional sender.
    #[inline]
    pub fn bucket(&self, tag: Tag, peer: Option<PeerId>, num_buckets: usize) -> usize {
        let src = if self.src_present { peer } else { None };
        bucket_index(self.selector.mask(tag), src, num_buckets)
    }
}

/// Mix a masked tag and optional source into a bucket index.
#[inline]
pub fn bucket_index(masked_tag: u64, src: Option<PeerId>, num_buckets: usize) -> usize {
    let mut h = masked_tag ^ src.map_or(0, |p| p.0.rotate_left(29) ^ 0x5bd1_e995);
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    (h % num_buckets as u64) as usize
}

/// Matching predicate between a posted receive and an incoming message.
#[inline]
pub fn tag_matches(
    posted_tag: Tag,
    selector: Selector,
    source: Option<PeerId>,
    incoming_tag: Tag,
    sender: PeerId,
) -> bool {
    (posted_tag.0 ^ incoming_tag.0) & selector.0 == 0 && source.is_none_or(|s| s == sender)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicate() {
        let me = PeerId(1);
        assert!(tag_matches(Tag(0xab), Selector::ALL, None, Tag(0xab), me));
        assert!(!tag_matches(Tag(0xab), Selector::ALL, None, Tag(0xac), me));
        assert!(tag_matches(Tag(0xa0), Selector(0xf0), None, Tag(0xaf), me));
        assert!(tag_matches(Tag(0), Selector::ANY, None, Tag(12345), me));
        assert!(!tag_matches(Tag(0xab), Selector::ALL, Some(PeerId(2)), Tag(0xab), me));
        assert!(tag_matches(Tag(0xab), Selector::ALL, Some(me), Tag(0xab), me));
    }

    #[test]
    fn test_hashable() {
        assert!(PatternClass::TAG_SRC.is_hashable());
        assert!(PatternClass::ANYTAG_SRC.is_hashable());
        assert!(!PatternClass::new(false, Selector::ANY).is_hashable());
    }

    #[test]
    fn test_covers() {
        let exact = PatternClass::TAG_SRC;
        assert!(exact.covers(&PatternClass::TAG_ANYSRC));
        assert!(exact.covers(&PatternClass::ANYTAG_SRC));
        assert!(!PatternClass::TAG_ANYSRC.covers(&PatternClass::TAG_SRC));
        let low = PatternClass::new(false, Selector(0xff));
        assert!(!low.covers(&PatternClass::TAG_ANYSRC));
        assert!(PatternClass::TAG_ANYSRC.covers(&low));
    }

    #[test]
    fn test_bucket_depends_only_on_masked_bits() {
        let class = PatternClass::new(false, Selector(0xff00));
        let a = class.bucket(Tag(0x1234), Some(PeerId(9)), 128);
        let b = class.bucket(Tag(0x12ff), Some(PeerId(3)), 128);
        assert_eq!(a, b);
        assert!(a < 128);
    }
}
