//! The packet vocabulary.
//!
//! Packets are the unit of everything the generator emits: plain data,
//! comparable, and decoupled from any live GPU object so frozen rings can
//! be inspected, diffed and replayed. The set mirrors the command
//! processor's repertoire at the granularity this layer cares about; raw
//! register writes ride inside draw-state payloads as opaque dwords.

use std::sync::Arc;

use crate::blit::{Blit2dOp, Blit3dOp};
use crate::lrz::LrzControl;
use crate::ring::RingKind;
use crate::state_group::{PassMask, StateGroupId};
use crate::tile::PipeConfig;
use kiln_core::geometry::Rect;

/// Render-module marker values, used by the hardware to route state and
/// by tools to segment a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderMode {
    /// Visibility pre-pass.
    Binning,
    /// Per-tile on-chip pass.
    Gmem,
    /// Direct-to-memory pass.
    Bypass,
    /// Tile resolve (gmem to memory).
    Resolve,
    /// End of visibility consumption for the current tile.
    VisibilityEnd,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BinFlags: u8 {
        const BINNING_PASS = 1 << 0;
        const BUFFERS_IN_SYSMEM = 1 << 1;
        const LRZ_WRITE_DISABLE = 1 << 2;
    }
}

/// Cache and pipeline event writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuEvent {
    CacheInvalidate,
    /// Flush with timestamp; completion is observable.
    CacheFlushTs,
    CcuFlushColor,
    CcuFlushDepth,
    CcuInvalidateColor,
    CcuInvalidateDepth,
    /// Resolve completion timestamp.
    ResolveTs,
    LrzFlush,
}

/// Which visibility stream a packet refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Per-bin draw visibility bits.
    Draw,
    /// Primitive lists.
    Prim,
}

/// One entry of a combined draw-state packet. An empty payload disables
/// the group.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawStateEntry {
    pub group: StateGroupId,
    pub enable: PassMask,
    pub payload: Arc<[u32]>,
}

/// Visibility-stream configuration for a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VscConfig {
    pub bin_width: u32,
    pub bin_height: u32,
    pub bins_x: u32,
    pub bins_y: u32,
    pub pipes: Vec<PipeConfig>,
    pub draw_pitch: u32,
    pub draw_limit: u32,
    pub prim_pitch: u32,
    pub prim_limit: u32,
}

/// Per-tile visibility addressing: where in the streams this tile's
/// pipe starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinData {
    pub pipe: u8,
    pub slot: u8,
    pub draw_offset: u32,
    /// Offset into the per-pipe recorded-size table.
    pub size_offset: u32,
    pub prim_offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawPacket {
    pub vertex_count: u32,
    pub instance_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Marker(RenderMode),
    WindowScissor(Rect<u32>),
    WindowOffset { x: u32, y: u32 },
    BinSize { width: u32, height: u32, flags: BinFlags },
    /// Treat every visibility query as "visible" (no pre-pass ran).
    OverrideVisibility(bool),
    /// Let the hardware skip called rings for bins with no geometry.
    AutoSkipEmptyTiles(bool),
    SetDrawState(Vec<DrawStateEntry>),
    /// Begin a bracket executed only if the named bin saw geometry.
    CondExecStart { pipe: u8, slot: u8 },
    CondExecEnd,
    /// Execute another ring at this point.
    CallRing(RingKind),
    Event(GpuEvent),
    WaitForIdle,
    /// Stall the command processor's own fetch, not the whole pipeline.
    WaitForMe,
    WaitMemWrites,
    /// If the recorded size of `stream` for `pipe` is >= `limit`, write
    /// `value` to the overflow control word.
    CondOverflowWrite {
        pipe: u8,
        stream: StreamKind,
        limit: u32,
        value: u32,
    },
    VscConfig(VscConfig),
    SetBinData(BinData),
    Blit2d(Blit2dOp),
    Blit3d(Blit3dOp),
    Draw(DrawPacket),
    LrzState { enable: PassMask, ctl: LrzControl },
}
