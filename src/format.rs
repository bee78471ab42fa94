//! Pixel format tags carried by buffer descriptors.
//!
//! Tags use the numbering of the platform's hardware abstraction layer so
//! that descriptors produced by the allocator can be interpreted without a
//! translation table. Only the YUV 4:2:0 formats have a plane layout; the
//! packed RGB formats are recognised so that they can be locked for plain
//! CPU access.

/// Round `value` up to the next multiple of `align`.
///
/// `align` must be a power of two.
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// [`align_up`] that returns `None` instead of overflowing.
#[inline]
pub const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(sum) => Some(sum & !(align - 1)),
        None => None,
    }
}

/// Pixel formats (color space and memory layout).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum PixelFormat {
    // ========================================================================
    // Packed RGB formats
    // ========================================================================
    /// RGBA 8-bit per channel (32 bits/pixel).
    Rgba8888 = 0x1,
    /// RGBX 8-bit per channel, alpha ignored (32 bits/pixel).
    Rgbx8888 = 0x2,
    /// RGB 8-bit per channel (24 bits/pixel).
    Rgb888 = 0x3,
    /// RGB 5-6-5 (16 bits/pixel).
    Rgb565 = 0x4,
    /// BGRA 8-bit per channel (32 bits/pixel).
    Bgra8888 = 0x5,

    // ========================================================================
    // YUV 4:2:0 formats
    // ========================================================================
    /// YUV 4:2:0 semi-planar, Y plane then interleaved Cr/Cb (NV21).
    YCrCb420Sp = 0x11,
    /// YUV 4:2:0 semi-planar, Y plane then interleaved Cb/Cr (NV12).
    YCbCr420Sp = 0x19,
    /// Flexible YUV 4:2:0. Laid out exactly like [`PixelFormat::YCrCb420Sp`].
    YCbCr420Flexible = 0x23,
    /// YUV 4:2:0 planar, Y plane then Cr plane then Cb plane, with a
    /// 128-byte aligned luma stride.
    Yv12 = 0x3231_5659,
}

impl PixelFormat {
    /// Every format this crate knows about.
    pub const ALL: [PixelFormat; 9] = [
        PixelFormat::Rgba8888,
        PixelFormat::Rgbx8888,
        PixelFormat::Rgb888,
        PixelFormat::Rgb565,
        PixelFormat::Bgra8888,
        PixelFormat::YCrCb420Sp,
        PixelFormat::YCbCr420Sp,
        PixelFormat::YCbCr420Flexible,
        PixelFormat::Yv12,
    ];

    /// Look up a format by its raw tag.
    pub fn from_tag(tag: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|format| format.tag() == tag)
    }

    /// The raw tag stored in descriptors.
    #[inline]
    pub const fn tag(self) -> u32 {
        self as u32
    }

    /// Does this format have separate luma and chroma planes?
    #[inline]
    pub const fn is_planar(self) -> bool {
        matches!(
            self,
            PixelFormat::YCrCb420Sp
                | PixelFormat::YCbCr420Sp
                | PixelFormat::YCbCr420Flexible
                | PixelFormat::Yv12
        )
    }

    /// Bytes per pixel for packed formats, `None` for planar ones.
    pub const fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Rgba8888 | PixelFormat::Rgbx8888 | PixelFormat::Bgra8888 => Some(4),
            PixelFormat::Rgb888 => Some(3),
            PixelFormat::Rgb565 => Some(2),
            _ => None,
        }
    }
}

impl TryFrom<u32> for PixelFormat {
    type Error = crate::error::Error;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        Self::from_tag(tag).ok_or(crate::error::Error::UnsupportedFormat(tag))
    }
}

impl From<PixelFormat> for u32 {
    fn from(format: PixelFormat) -> Self {
        format.tag()
    }
}
