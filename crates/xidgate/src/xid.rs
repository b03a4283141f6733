use core::cmp::Ordering;
use core::fmt;

/// Identifies a cluster node in ownership and grant bookkeeping.
pub type NodeId = u32;

/// A cluster-wide transaction identifier.
///
/// Transaction ids are 32-bit counters that wrap around. Because the space is
/// circular, "older" and "newer" are only meaningful for ids less than `2^31`
/// apart, so this type deliberately does **not** implement [`Ord`]. Use
/// [`TransactionId::precedes`], [`TransactionId::follows`] or
/// [`TransactionId::circular_cmp`] instead of `<`.
///
/// The raw value `0` is reserved as [`TransactionId::INVALID`] and is never
/// handed out by a sequencer. [`TransactionId::next`] skips it on wraparound.
///
/// # Example
///
/// ```
/// use xidgate::TransactionId;
///
/// let last = TransactionId::from_raw(u32::MAX);
/// let wrapped = last.next();
///
/// assert_eq!(wrapped, TransactionId::FIRST);
/// assert!(last.precedes(wrapped));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
#[repr(transparent)]
pub struct TransactionId(u32);

impl TransactionId {
    /// The reserved "no transaction" sentinel.
    pub const INVALID: Self = Self(0);

    /// The first valid id, and the successor of `u32::MAX`.
    pub const FIRST: Self = Self(1);

    /// Number of bytes a serialized id occupies on the wire.
    pub const SIZE: usize = core::mem::size_of::<u32>();

    /// Wraps a raw value. No validation is performed; `0` yields
    /// [`TransactionId::INVALID`].
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw `u32` value.
    pub const fn to_raw(self) -> u32 {
        self.0
    }

    /// Returns `true` unless this is the invalid sentinel.
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Returns the successor of this id, skipping the invalid sentinel.
    #[must_use]
    pub const fn next(self) -> Self {
        match self.0.wrapping_add(1) {
            0 => Self::FIRST,
            raw => Self(raw),
        }
    }

    /// Advances by `n` steps, skipping the invalid sentinel whenever the
    /// counter wraps.
    #[must_use]
    pub fn advance(self, n: u32) -> Self {
        let raw = self.0.wrapping_add(n);
        // Crossing (or landing on) zero consumes one extra step for the
        // sentinel we never hand out.
        if (self.0 != 0 && raw < self.0) || raw == 0 {
            Self(raw.wrapping_add(1))
        } else {
            Self(raw)
        }
    }

    /// Signed circular distance from `anchor` to `self`.
    ///
    /// Positive when `self` is newer than `anchor`. The result is a valid
    /// sort key for any set of ids that all lie within `2^31` of `anchor`.
    pub const fn offset_from(self, anchor: Self) -> i32 {
        self.0.wrapping_sub(anchor.0) as i32
    }

    /// Returns `true` if `self` is strictly older than `other`.
    pub const fn precedes(self, other: Self) -> bool {
        self.offset_from(other) < 0
    }

    /// Returns `true` if `self` is strictly newer than `other`.
    pub const fn follows(self, other: Self) -> bool {
        self.offset_from(other) > 0
    }

    /// Circular comparison of two ids.
    pub const fn circular_cmp(self, other: Self) -> Ordering {
        match self.offset_from(other) {
            d if d < 0 => Ordering::Less,
            0 => Ordering::Equal,
            _ => Ordering::Greater,
        }
    }

    /// The newer of two ids under circular comparison.
    #[must_use]
    pub const fn newest(self, other: Self) -> Self {
        if other.follows(self) { other } else { self }
    }

    /// The older of two ids under circular comparison.
    #[must_use]
    pub const fn oldest(self, other: Self) -> Self {
        if other.precedes(self) { other } else { self }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xid:{}", self.0)
    }
}

impl From<u32> for TransactionId {
    fn from(raw: u32) -> Self {
        Self::from_raw(raw)
    }
}

impl From<TransactionId> for u32 {
    fn from(xid: TransactionId) -> Self {
        xid.to_raw()
    }
}

/// Sorts `ids` oldest-first under circular ordering.
///
/// The oldest element is used as the anchor, so the result is only
/// meaningful when all ids fit in a `2^31` window, which holds for any set of
/// ids that are simultaneously in flight.
pub fn sort_circular(ids: &mut [TransactionId]) {
    let Some(anchor) = ids.iter().copied().reduce(TransactionId::oldest) else {
        return;
    };
    ids.sort_unstable_by_key(|id| id.offset_from(anchor));
}
