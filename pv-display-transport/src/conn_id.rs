/// Multiplexes several IVC rings across the same `(domain, port)` pair.
///
/// Mirrors the original's `conn_id` parameter threaded through every
/// connect/listen call, with `CONNECTIONID_ANY` re-expressed as [`ConnId::ANY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl ConnId {
    /// Matches any connection id on the same `(domain, port)` pair.
    pub const ANY: ConnId = ConnId(u64::MAX);

    pub fn is_any(self) -> bool {
        self == Self::ANY
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::ANY
    }
}

impl From<u64> for ConnId {
    fn from(v: u64) -> Self {
        ConnId(v)
    }
}
