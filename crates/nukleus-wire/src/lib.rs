//! Frame types exchanged on the accept and connect sides of a nukleus.
//!
//! A nukleus never sees bytes on the wire directly: the surrounding event-loop
//! owns the actual codec and hands this crate already-decoded frames, tagged by
//! message kind. Only frame *field* semantics are modeled here.

use core::fmt;

use smol_str::SmolStr;

/// Bit layout of the 64-bit authorization word.
pub const REALM_MASK: u64 = 0xFFFF_0000_0000_0000;
pub const SCOPE_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;
pub const MAX_REALMS: u32 = 16;
pub const MAX_SCOPES_PER_REALM: u32 = 48;

/// `GRANT_VALIDATION` signal identifier (see [`SignalFrame`]).
pub const GRANT_VALIDATION: u32 = 1;

/// A 64-bit authorization word.
///
/// Bits 48..63 hold at most one realm bit; bits 0..47 hold scope bits,
/// meaningful only relative to whichever realm bit is set. `0` means
/// unauthenticated / pass-through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Authorization(pub u64);

impl Authorization {
    pub const NONE: Self = Self(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn realm_bits(self) -> u64 {
        self.0 & REALM_MASK
    }

    pub fn scope_bits(self) -> u64 {
        self.0 & SCOPE_MASK
    }

    /// Index (0..16) of the single realm bit set, if any.
    pub fn realm_index(self) -> Option<u32> {
        let realm = self.realm_bits();
        if realm == 0 {
            return None;
        }
        let bit = (realm >> 48).trailing_zeros();
        Some(bit)
    }

    pub fn is_valid(self) -> bool {
        self.realm_bits().count_ones() <= 1
    }

    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl fmt::Display for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl From<u64> for Authorization {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Authorization> for u64 {
    fn from(auth: Authorization) -> Self {
        auth.0
    }
}

/// Identifies a pre-configured downstream target; resolved per-stream by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteId(pub u64);

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "route#{:x}", self.0)
    }
}

/// Identifies one half-stream on a route. Parity (`id & 1`) distinguishes
/// the initial (odd) half from the reply (even) half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn is_initial(self) -> bool {
        self.0 & 1 == 1
    }

    pub fn is_reply(self) -> bool {
        !self.is_initial()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{:x}", self.0)
    }
}

/// Opaque correlation key grouping related streams (e.g. a browser session)
/// so sibling streams can share a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AffinityId(pub u64);

/// Per-half stream-identity triple carried on most frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamRef {
    pub route_id: RouteId,
    pub stream_id: StreamId,
}

impl fmt::Display for StreamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.route_id, self.stream_id)
    }
}

/// Opaque application trace-id, forwarded verbatim across a pair.
pub type Trace = u64;

/// A single HTTP-ish header, as carried in a BEGIN or SIGNAL extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: SmolStr,
    pub value: SmolStr,
}

impl Header {
    pub fn new(name: impl Into<SmolStr>, value: impl Into<SmolStr>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// HTTP BEGIN/SIGNAL extension: a flat header list.
///
/// The core only ever reads `:path` and `authorization` off of a BEGIN
/// extension, and only ever writes `:status` (on a synthesized 401) or
/// `:method`/`content-type` (on a challenge SIGNAL).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpExtension {
    pub headers: Vec<Header>,
}

impl HttpExtension {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: impl Into<SmolStr>, value: impl Into<SmolStr>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|h| h.name == name).map(|h| h.value.as_str())
    }
}

/// Capability bitfield advertised on BEGIN and updated by WINDOW.
///
/// The only bit defined at this layer is `CHALLENGE` (bit 0): whether the
/// peer is willing to receive an in-band re-authentication SIGNAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(pub u8);

impl Capabilities {
    pub const CHALLENGE: u8 = 0b0000_0001;

    pub fn can_challenge(self) -> bool {
        self.0 & Self::CHALLENGE != 0
    }
}

#[derive(Debug, Clone)]
pub struct BeginFrame {
    pub stream: StreamRef,
    pub trace: Trace,
    pub authorization: Authorization,
    pub affinity: AffinityId,
    pub extension: HttpExtension,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone)]
pub struct DataFrame {
    pub stream: StreamRef,
    pub trace: Trace,
    pub padding: u16,
    pub authorization: Authorization,
    pub group_id: u32,
    pub payload: Vec<u8>,
    pub extension: HttpExtension,
}

#[derive(Debug, Clone)]
pub struct EndFrame {
    pub stream: StreamRef,
    pub trace: Trace,
    pub authorization: Authorization,
    pub extension: HttpExtension,
}

#[derive(Debug, Clone)]
pub struct AbortFrame {
    pub stream: StreamRef,
    pub trace: Trace,
    pub authorization: Authorization,
}

#[derive(Debug, Clone)]
pub struct WindowFrame {
    pub stream: StreamRef,
    pub credit: u32,
    pub padding: u16,
    pub group_id: u32,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone)]
pub struct ResetFrame {
    pub stream: StreamRef,
}

#[derive(Debug, Clone)]
pub struct SignalFrame {
    pub stream: StreamRef,
    pub signal_id: u32,
    pub trace: Trace,
    pub extension: HttpExtension,
}

/// The frame kinds a nukleus exchanges with the router, as a tagged enum
/// rather than a byte-level wire encoding (the codec itself is out of scope).
#[derive(Debug, Clone)]
pub enum Frame {
    Begin(BeginFrame),
    Data(DataFrame),
    End(EndFrame),
    Abort(AbortFrame),
    Window(WindowFrame),
    Reset(ResetFrame),
    Signal(SignalFrame),
}

impl Frame {
    pub fn stream(&self) -> StreamRef {
        match self {
            Frame::Begin(f) => f.stream,
            Frame::Data(f) => f.stream,
            Frame::End(f) => f.stream,
            Frame::Abort(f) => f.stream,
            Frame::Window(f) => f.stream,
            Frame::Reset(f) => f.stream,
            Frame::Signal(f) => f.stream,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_realm_index_round_trips() {
        for bit in 0..MAX_REALMS {
            let auth = Authorization::new(1u64 << (48 + bit));
            assert_eq!(auth.realm_index(), Some(bit));
            assert!(auth.is_valid());
        }
    }

    #[test]
    fn authorization_rejects_multiple_realm_bits() {
        let auth = Authorization::new((1u64 << 48) | (1u64 << 49));
        assert!(!auth.is_valid());
    }

    #[test]
    fn authorization_contains_is_subset_check() {
        let full = Authorization::new((1u64 << 48) | 0b11);
        let subset = Authorization::new((1u64 << 48) | 0b01);
        let disjoint = Authorization::new((1u64 << 48) | 0b100);
        assert!(full.contains(subset));
        assert!(!subset.contains(full));
        assert!(!full.contains(disjoint));
    }

    #[test]
    fn capabilities_challenge_bit() {
        assert!(Capabilities(1).can_challenge());
        assert!(!Capabilities(0).can_challenge());
    }
}
