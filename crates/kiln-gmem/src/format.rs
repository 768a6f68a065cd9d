//! Pixel format table and the copy-engine format rewrites.
//!
//! The 2D copy engine is picky: it cannot round-trip SNORM values
//! bit-exactly, does not understand compressed blocks, and addresses
//! combined depth+stencil aspects separately. [`copy_format`] maps a
//! surface format to the format actually programmed into the engine for a
//! given copy; [`Format::copy_compatible`] answers whether two formats can
//! be reinterpreted across a raw copy without a conversion pass.

/// Closed set of surface formats the stream generator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    R8Unorm,
    R8Snorm,
    R8Uint,
    Rg8Unorm,
    Rg8Snorm,
    Rgba8Unorm,
    Rgba8Snorm,
    Bgra8Unorm,
    R16Uint,
    R16Unorm,
    Rg16Unorm,
    Rgba16Float,
    R32Uint,
    R32Float,
    Rg32Uint,
    Rgba32Uint,
    Rgba32Float,
    Rgb10a2Unorm,
    D16Unorm,
    D32Float,
    S8Uint,
    D24UnormS8Uint,
    D32FloatS8Uint,
    Bc1RgbaUnorm,
    Bc3RgbaUnorm,
    Etc2Rgb8Unorm,
    Astc4x4Unorm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatClass {
    Color,
    Depth,
    Stencil,
    DepthStencil,
}

/// Memory layout of a format's channels. Two formats sharing a layout can
/// alias each other's bytes; a layout mismatch means a raw copy would
/// scramble channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
    R8,
    Rg8,
    Rgba8,
    Bgra8,
    R16,
    Rg16,
    Rgba16,
    R32,
    Rg32,
    Rgba32,
    Packed1010102,
    D16,
    D32,
    S8,
    D24S8,
    D32S8,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    /// Bytes per block (per texel for uncompressed formats).
    pub bytes_per_block: u32,
    pub block_width: u32,
    pub block_height: u32,
    pub class: FormatClass,
    pub layout: ChannelLayout,
    pub snorm: bool,
}

impl FormatInfo {
    const fn color(bytes: u32, layout: ChannelLayout) -> Self {
        Self {
            bytes_per_block: bytes,
            block_width: 1,
            block_height: 1,
            class: FormatClass::Color,
            layout,
            snorm: false,
        }
    }

    const fn snorm(bytes: u32, layout: ChannelLayout) -> Self {
        Self {
            snorm: true,
            ..Self::color(bytes, layout)
        }
    }

    const fn block(bytes: u32) -> Self {
        Self {
            bytes_per_block: bytes,
            block_width: 4,
            block_height: 4,
            class: FormatClass::Color,
            layout: ChannelLayout::Block,
            snorm: false,
        }
    }

    const fn depth(bytes: u32, class: FormatClass, layout: ChannelLayout) -> Self {
        Self {
            bytes_per_block: bytes,
            block_width: 1,
            block_height: 1,
            class,
            layout,
            snorm: false,
        }
    }
}

impl Format {
    pub fn info(self) -> FormatInfo {
        use ChannelLayout as L;
        use FormatClass as C;
        match self {
            Format::R8Unorm | Format::R8Uint => FormatInfo::color(1, L::R8),
            Format::R8Snorm => FormatInfo::snorm(1, L::R8),
            Format::Rg8Unorm => FormatInfo::color(2, L::Rg8),
            Format::Rg8Snorm => FormatInfo::snorm(2, L::Rg8),
            Format::Rgba8Unorm => FormatInfo::color(4, L::Rgba8),
            Format::Rgba8Snorm => FormatInfo::snorm(4, L::Rgba8),
            Format::Bgra8Unorm => FormatInfo::color(4, L::Bgra8),
            Format::R16Uint | Format::R16Unorm => FormatInfo::color(2, L::R16),
            Format::Rg16Unorm => FormatInfo::color(4, L::Rg16),
            Format::Rgba16Float => FormatInfo::color(8, L::Rgba16),
            Format::R32Uint | Format::R32Float => FormatInfo::color(4, L::R32),
            Format::Rg32Uint => FormatInfo::color(8, L::Rg32),
            Format::Rgba32Uint | Format::Rgba32Float => FormatInfo::color(16, L::Rgba32),
            Format::Rgb10a2Unorm => FormatInfo::color(4, L::Packed1010102),
            Format::D16Unorm => FormatInfo::depth(2, C::Depth, L::D16),
            Format::D32Float => FormatInfo::depth(4, C::Depth, L::D32),
            Format::S8Uint => FormatInfo::depth(1, C::Stencil, L::S8),
            Format::D24UnormS8Uint => FormatInfo::depth(4, C::DepthStencil, L::D24S8),
            // Depth plane packed as 32F, stencil plane stored separately.
            Format::D32FloatS8Uint => FormatInfo::depth(5, C::DepthStencil, L::D32S8),
            Format::Bc1RgbaUnorm | Format::Etc2Rgb8Unorm => FormatInfo::block(8),
            Format::Bc3RgbaUnorm | Format::Astc4x4Unorm => FormatInfo::block(16),
        }
    }

    pub fn bytes_per_block(self) -> u32 {
        self.info().bytes_per_block
    }

    pub fn is_compressed(self) -> bool {
        self.info().block_width > 1
    }

    pub fn has_depth(self) -> bool {
        matches!(self.info().class, FormatClass::Depth | FormatClass::DepthStencil)
    }

    pub fn has_stencil(self) -> bool {
        matches!(
            self.info().class,
            FormatClass::Stencil | FormatClass::DepthStencil
        )
    }

    pub fn is_snorm(self) -> bool {
        self.info().snorm
    }

    /// Whether a raw copy between the two formats preserves every channel.
    pub fn copy_compatible(self, other: Format) -> bool {
        self.info().layout == other.info().layout
    }

    /// Whether the 2D engine can render (write) this format directly.
    /// Compressed blocks must be rewritten to opaque uint formats first.
    pub fn renderable_2d(self) -> bool {
        !self.is_compressed()
    }

    /// Whether the on-chip clear path handles this format.
    pub fn supports_fast_clear(self) -> bool {
        !self.is_compressed()
    }
}

/// One plane of a combined format, or the whole format when it has a
/// single plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aspect {
    Color,
    Depth,
    Stencil,
    /// Both planes of a combined format. Copies split this into the two
    /// single-plane aspects before reaching the engine.
    DepthStencil,
}

/// The format programmed into the copy engine for a copy touching
/// `format` through `aspect`.
///
/// SNORM formats are copied through their UNORM counterpart: the engine's
/// SNORM path collapses the two encodings of -1.0 and would corrupt a
/// bit-exact copy. Compressed formats are reinterpreted as opaque uint
/// texels sized like one block. Combined depth+stencil formats resolve to
/// the plane named by `aspect`; the packed 24-bit depth plane keeps its
/// native format except for buffer copies of the stencil plane, which
/// address bytes individually.
pub fn copy_format(format: Format, aspect: Aspect, buffer_copy: bool) -> Format {
    if format.is_compressed() {
        return match format.bytes_per_block() {
            8 => Format::Rg32Uint,
            16 => Format::Rgba32Uint,
            _ => unreachable!("unexpected block size"),
        };
    }
    match format {
        Format::R8Snorm => Format::R8Unorm,
        Format::Rg8Snorm => Format::Rg8Unorm,
        Format::Rgba8Snorm => Format::Rgba8Unorm,
        Format::D24UnormS8Uint => match aspect {
            Aspect::Stencil if buffer_copy => Format::R8Unorm,
            _ => Format::D24UnormS8Uint,
        },
        Format::D32FloatS8Uint => match aspect {
            Aspect::Stencil => Format::S8Uint,
            _ => Format::D32Float,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snorm_copies_as_unorm() {
        assert_eq!(
            copy_format(Format::Rgba8Snorm, Aspect::Color, false),
            Format::Rgba8Unorm
        );
        assert_eq!(
            copy_format(Format::R8Snorm, Aspect::Color, true),
            Format::R8Unorm
        );
    }

    #[test]
    fn test_compressed_copies_as_uint_blocks() {
        assert_eq!(
            copy_format(Format::Bc1RgbaUnorm, Aspect::Color, false),
            Format::Rg32Uint
        );
        assert_eq!(
            copy_format(Format::Astc4x4Unorm, Aspect::Color, false),
            Format::Rgba32Uint
        );
    }

    #[test]
    fn test_depth_stencil_plane_split() {
        assert_eq!(
            copy_format(Format::D32FloatS8Uint, Aspect::Depth, false),
            Format::D32Float
        );
        assert_eq!(
            copy_format(Format::D32FloatS8Uint, Aspect::Stencil, false),
            Format::S8Uint
        );
        assert_eq!(
            copy_format(Format::D24UnormS8Uint, Aspect::Stencil, true),
            Format::R8Unorm
        );
        assert_eq!(
            copy_format(Format::D24UnormS8Uint, Aspect::Depth, false),
            Format::D24UnormS8Uint
        );
    }

    #[test]
    fn test_layout_compatibility() {
        assert!(Format::Rgba8Unorm.copy_compatible(Format::Rgba8Snorm));
        assert!(!Format::Rgba8Unorm.copy_compatible(Format::Bgra8Unorm));
        assert!(Format::R32Uint.copy_compatible(Format::R32Float));
    }
}
