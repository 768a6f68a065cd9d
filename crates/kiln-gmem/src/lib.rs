//! Kiln gmem core
//!
//! Command-stream generation for a tile-based (gmem) renderer. A frame is
//! recorded as logical work (draws, clears, copies) against a [`Batch`],
//! then lowered into ordered packet rings: an optional visibility pre-pass,
//! a per-tile replay of the draw ring bracketed by restore and resolve
//! blits, or a single direct-to-memory pass when tiling is not worthwhile.
//!
//! Packets are plain data ([`packet::Packet`]); nothing here talks to
//! hardware. [`replay`] provides a software interpreter for the generated
//! streams, used for debugging and tests.

pub mod batch;
pub mod blit;
pub mod context;
pub mod dependency;
pub mod format;
pub mod gmem;
pub mod lrz;
pub mod packet;
pub mod replay;
pub mod ring;
pub mod state_group;
pub mod surface;
pub mod tile;
pub mod visibility;

pub use batch::{Batch, BatchId, DrawParams, GmemReason, Rings};
pub use blit::{BlitRequest, Filter, SurfaceRegion};
pub use context::{Context, FrameCommands, SharedState, SubmittedBatch, Submission};
pub use format::{Aspect, Format};
pub use gmem::GmemOptions;
pub use packet::Packet;
pub use state_group::{FragmentHandle, PassMask, StateGroupId};
pub use ring::{CmdRing, RingKind};
pub use surface::{
    Attachment, AttachmentMask, ClearValue, ColorClear, Framebuffer, SampleCount, Surface,
    SurfaceId, SurfaceTable,
};
pub use tile::BinLayout;
