//! Draw-state group batching.
//!
//! Hardware state is programmed through named groups, each a small dword
//! payload tagged with the passes it applies to. Recording accumulates
//! dirty groups and flushes them as a single combined packet per draw;
//! the per-tile replay then re-executes that packet once per tile, with
//! the hardware filtering entries by the active pass.
//!
//! Payloads that outlive one draw (pipeline state) live in a
//! [`FragmentArena`] and are shared by handle; one-shot payloads are
//! consumed by the flush that emits them.

use std::sync::Arc;

use crate::packet::{DrawStateEntry, Packet};
use crate::ring::CmdRing;
use kiln_core::alloc::{SlotKey, SlotMap};

bitflags::bitflags! {
    /// Render passes a state-group entry participates in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PassMask: u8 {
        /// Visibility pre-pass.
        const BINNING = 1 << 0;
        /// Per-tile on-chip rendering.
        const GMEM = 1 << 1;
        /// Direct-to-memory rendering.
        const SYSMEM = 1 << 2;
    }
}

/// Hardware state-group slots, in emission order. Program state precedes
/// everything derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum StateGroupId {
    ProgramConfig,
    Program,
    ProgramBinning,
    VertexInput,
    VertexBuffers,
    Viewport,
    Scissor,
    Rasterizer,
    Blend,
    DepthStencil,
    Constants,
    Textures,
    StreamOut,
    InputAttachments,
    Lrz,
    DepthPlane,
}

impl StateGroupId {
    pub const COUNT: usize = 16;

    pub const ALL: [StateGroupId; Self::COUNT] = [
        StateGroupId::ProgramConfig,
        StateGroupId::Program,
        StateGroupId::ProgramBinning,
        StateGroupId::VertexInput,
        StateGroupId::VertexBuffers,
        StateGroupId::Viewport,
        StateGroupId::Scissor,
        StateGroupId::Rasterizer,
        StateGroupId::Blend,
        StateGroupId::DepthStencil,
        StateGroupId::Constants,
        StateGroupId::Textures,
        StateGroupId::StreamOut,
        StateGroupId::InputAttachments,
        StateGroupId::Lrz,
        StateGroupId::DepthPlane,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// The combined packet holds at most this many entries.
pub const MAX_DRAW_STATE_ENTRIES: usize = 32;

static_assertions::const_assert!(StateGroupId::COUNT <= MAX_DRAW_STATE_ENTRIES);

/// Handle to a cached state fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentHandle(SlotKey);

struct FragmentEntry {
    payload: Arc<[u32]>,
    refs: u32,
}

/// Refcounted storage for reusable state fragments.
///
/// Callers hold one reference per owner (a pipeline object, a pending
/// cache slot); `release` drops one and frees the payload at zero. A
/// handle used after its last release panics via the generation check.
pub struct FragmentArena {
    slots: SlotMap<FragmentEntry>,
}

impl FragmentArena {
    pub const fn new() -> Self {
        Self {
            slots: SlotMap::new(),
        }
    }

    pub fn insert(&mut self, payload: Vec<u32>) -> FragmentHandle {
        FragmentHandle(self.slots.insert(FragmentEntry {
            payload: payload.into(),
            refs: 1,
        }))
    }

    pub fn retain(&mut self, handle: FragmentHandle) {
        self.slots.get_mut(handle.0).refs += 1;
    }

    pub fn release(&mut self, handle: FragmentHandle) {
        let entry = self.slots.get_mut(handle.0);
        entry.refs -= 1;
        if entry.refs == 0 {
            self.slots.remove(handle.0);
        }
    }

    pub fn payload(&self, handle: FragmentHandle) -> Arc<[u32]> {
        self.slots.get(handle.0).payload.clone()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[cfg(test)]
    fn refs(&self, handle: FragmentHandle) -> u32 {
        self.slots.get(handle.0).refs
    }
}

impl Default for FragmentArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Packs a plain-data value into fragment dwords.
pub fn pack_words<T: bytemuck::NoUninit>(value: &T) -> Vec<u32> {
    let bytes = bytemuck::bytes_of(value);
    debug_assert_eq!(bytes.len() % 4, 0);
    bytemuck::cast_slice(bytes).to_vec()
}

enum PendingPayload {
    Cached(FragmentHandle),
    OneShot(Arc<[u32]>),
}

struct PendingGroup {
    enable: PassMask,
    payload: PendingPayload,
}

/// Accumulates dirty state groups between draws.
pub struct StateGroupCache {
    pending: [Option<PendingGroup>; StateGroupId::COUNT],
}

impl StateGroupCache {
    pub const fn new() -> Self {
        Self {
            pending: [const { None }; StateGroupId::COUNT],
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.iter().filter(|p| p.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.iter().all(|p| p.is_none())
    }

    fn set(
        &mut self,
        arena: &mut FragmentArena,
        group: StateGroupId,
        pending: PendingGroup,
    ) {
        // Last write between two draws wins; drop the replaced payload's
        // reference.
        if let Some(PendingGroup {
            payload: PendingPayload::Cached(old),
            ..
        }) = self.pending[group.index()].replace(pending)
        {
            arena.release(old);
        }
    }

    /// Marks a cached fragment dirty for the next draw. The cache takes
    /// its own reference; the caller keeps ownership of `handle`.
    pub fn add(
        &mut self,
        arena: &mut FragmentArena,
        group: StateGroupId,
        enable: PassMask,
        handle: FragmentHandle,
    ) {
        arena.retain(handle);
        self.set(
            arena,
            group,
            PendingGroup {
                enable,
                payload: PendingPayload::Cached(handle),
            },
        );
    }

    /// Marks a one-shot payload dirty for the next draw. An empty payload
    /// emits an explicit disable entry for the group.
    pub fn take(
        &mut self,
        arena: &mut FragmentArena,
        group: StateGroupId,
        enable: PassMask,
        payload: Vec<u32>,
    ) {
        self.set(
            arena,
            group,
            PendingGroup {
                enable,
                payload: PendingPayload::OneShot(payload.into()),
            },
        );
    }

    /// Emits every pending group as one combined packet, in
    /// [`StateGroupId`] order, and drops the pending references.
    ///
    /// Nothing pending emits nothing: re-executing the previous combined
    /// packet per tile is exactly what the replay already does.
    pub fn flush(&mut self, arena: &mut FragmentArena, ring: &mut CmdRing) {
        let mut entries = Vec::new();
        for group in StateGroupId::ALL {
            let Some(pending) = self.pending[group.index()].take() else {
                continue;
            };
            let payload = match pending.payload {
                PendingPayload::Cached(handle) => {
                    let payload = arena.payload(handle);
                    arena.release(handle);
                    payload
                }
                PendingPayload::OneShot(payload) => payload,
            };
            entries.push(DrawStateEntry {
                group,
                enable: pending.enable,
                payload,
            });
        }
        if entries.is_empty() {
            return;
        }
        assert!(
            entries.len() <= MAX_DRAW_STATE_ENTRIES,
            "too many draw state entries in one flush"
        );
        ring.emit(Packet::SetDrawState(entries));
    }

    /// One packet disabling every group, for hardware init and render
    /// mode switches.
    pub fn disable_all(ring: &mut CmdRing) {
        let entries = StateGroupId::ALL
            .iter()
            .map(|&group| DrawStateEntry {
                group,
                enable: PassMask::all(),
                payload: Vec::new().into(),
            })
            .collect();
        ring.emit(Packet::SetDrawState(entries));
    }
}

impl Default for StateGroupCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RingKind;

    fn entries(ring: &CmdRing, at: usize) -> &[DrawStateEntry] {
        match &ring.packets()[at] {
            Packet::SetDrawState(entries) => entries,
            other => panic!("expected SetDrawState, got {other:?}"),
        }
    }

    #[test]
    fn test_flush_emits_in_group_order() {
        let mut arena = FragmentArena::new();
        let mut cache = StateGroupCache::new();
        let mut ring = CmdRing::new(RingKind::Draw);

        cache.take(
            &mut arena,
            StateGroupId::Textures,
            PassMask::all(),
            vec![1],
        );
        cache.take(&mut arena, StateGroupId::Program, PassMask::all(), vec![2]);
        cache.flush(&mut arena, &mut ring);

        let entries = entries(&ring, 0);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].group, StateGroupId::Program);
        assert_eq!(entries[1].group, StateGroupId::Textures);
    }

    #[test]
    fn test_cached_fragment_refcounting() {
        let mut arena = FragmentArena::new();
        let mut cache = StateGroupCache::new();
        let mut ring = CmdRing::new(RingKind::Draw);

        let handle = arena.insert(vec![0xa, 0xb]);
        assert_eq!(arena.refs(handle), 1);

        cache.add(&mut arena, StateGroupId::Program, PassMask::all(), handle);
        assert_eq!(arena.refs(handle), 2);

        cache.flush(&mut arena, &mut ring);
        assert_eq!(arena.refs(handle), 1);
        assert_eq!(entries(&ring, 0)[0].payload.as_ref(), &[0xa, 0xb]);

        // Owner's reference still keeps the payload alive.
        arena.release(handle);
        assert!(arena.is_empty());
    }

    #[test]
    fn test_replacement_releases_old_reference() {
        let mut arena = FragmentArena::new();
        let mut cache = StateGroupCache::new();

        let a = arena.insert(vec![1]);
        let b = arena.insert(vec![2]);
        cache.add(&mut arena, StateGroupId::Blend, PassMask::all(), a);
        cache.add(&mut arena, StateGroupId::Blend, PassMask::all(), b);
        assert_eq!(arena.refs(a), 1);
        assert_eq!(arena.refs(b), 2);

        let mut ring = CmdRing::new(RingKind::Draw);
        cache.flush(&mut arena, &mut ring);
        assert_eq!(entries(&ring, 0)[0].payload.as_ref(), &[2]);
    }

    #[test]
    fn test_empty_payload_is_disable_entry() {
        let mut arena = FragmentArena::new();
        let mut cache = StateGroupCache::new();
        let mut ring = CmdRing::new(RingKind::Draw);

        cache.take(
            &mut arena,
            StateGroupId::StreamOut,
            PassMask::BINNING,
            Vec::new(),
        );
        cache.flush(&mut arena, &mut ring);
        let entries = entries(&ring, 0);
        assert!(entries[0].payload.is_empty());
        assert_eq!(entries[0].enable, PassMask::BINNING);
    }

    #[test]
    fn test_pack_words_builds_a_flushable_payload() {
        #[repr(C)]
        #[derive(Clone, Copy, bytemuck::NoUninit)]
        struct DepthPlaneRegs {
            min_depth: f32,
            max_depth: f32,
            flags: u32,
        }

        let words = pack_words(&DepthPlaneRegs {
            min_depth: 0.0,
            max_depth: 1.0,
            flags: 0x5,
        });
        assert_eq!(words, vec![0, 1.0f32.to_bits(), 0x5]);

        let mut arena = FragmentArena::new();
        let mut cache = StateGroupCache::new();
        let mut ring = CmdRing::new(RingKind::Draw);
        cache.take(&mut arena, StateGroupId::DepthPlane, PassMask::all(), words);
        cache.flush(&mut arena, &mut ring);
        let entries = entries(&ring, 0);
        assert_eq!(entries[0].group, StateGroupId::DepthPlane);
        assert_eq!(entries[0].payload.as_ref(), &[0, 1.0f32.to_bits(), 0x5]);
    }

    #[test]
    fn test_flush_with_nothing_pending_emits_nothing() {
        let mut arena = FragmentArena::new();
        let mut cache = StateGroupCache::new();
        let mut ring = CmdRing::new(RingKind::Draw);
        cache.flush(&mut arena, &mut ring);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_disable_all_covers_every_group() {
        let mut ring = CmdRing::new(RingKind::Frame);
        StateGroupCache::disable_all(&mut ring);
        let entries = entries(&ring, 0);
        assert_eq!(entries.len(), StateGroupId::COUNT);
        assert!(entries.iter().all(|e| e.payload.is_empty()));
    }

    #[test]
    #[should_panic]
    fn test_stale_fragment_handle_panics() {
        let mut arena = FragmentArena::new();
        let handle = arena.insert(vec![1]);
        arena.release(handle);
        let _ = arena.payload(handle);
    }
}
