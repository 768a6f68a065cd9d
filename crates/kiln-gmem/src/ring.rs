//! Append-only command rings.

use crate::packet::Packet;

/// Which ring a stream of packets belongs to. The orchestrator fixes the
/// cross-ring execution order; [`Packet::CallRing`](crate::packet::Packet)
/// splices one ring into another at execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RingKind {
    /// Top-level per-frame ring; calls the others.
    Frame,
    /// Recorded draws, replayed once per pass or tile.
    Draw,
    /// Per-tile restore and clear blits.
    TileSetup,
    /// Per-tile resolve blits.
    TileStore,
    /// Post-pass state restoration.
    Epilogue,
}

/// An append-only packet stream. Submission freezes the ring; a frozen
/// ring is read-only and appending to it is a programming error.
#[derive(Debug, Clone, PartialEq)]
pub struct CmdRing {
    kind: RingKind,
    packets: Vec<Packet>,
    frozen: bool,
}

impl CmdRing {
    pub const fn new(kind: RingKind) -> Self {
        Self {
            kind,
            packets: Vec::new(),
            frozen: false,
        }
    }

    pub fn kind(&self) -> RingKind {
        self.kind
    }

    pub fn emit(&mut self, packet: Packet) {
        assert!(!self.frozen, "emit into frozen ring");
        self.packets.push(packet);
    }

    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}

impl<'a> IntoIterator for &'a CmdRing {
    type Item = &'a Packet;
    type IntoIter = std::slice::Iter<'a, Packet>;

    fn into_iter(self) -> Self::IntoIter {
        self.packets.iter()
    }
}
