//! YCbCr plane layout resolution.
//!
//! Given a pixel format and frame size, computes where each plane of a
//! multi-planar image starts, how far apart its rows are, and how far apart
//! consecutive chroma samples of one component are.
//!
//! ```text
//!  Semi-planar (NV21 / NV12)            Planar (YV12)
//! ┌──────────────────────────┐        ┌──────────────────────────┐
//! │ Y   ystride × height     │        │ Y   ystride × height     │
//! ├──────────────────────────┤        ├─────────────┬────────────┘
//! │ CrCbCrCb… (or CbCr…)     │        │ Cr cstride × height/2
//! │ ystride × height/2       │        ├─────────────┤
//! └──────────────────────────┘        │ Cb cstride × height/2
//!                                     └─────────────┘
//! ```
//!
//! Byte offsets are part of each format's contract with codecs and display
//! hardware. Swapping the first two chroma offsets of a semi-planar format
//! silently swaps the color channels.

use crate::error::{Error, Result};
use crate::format::{PixelFormat, checked_align_up};

/// Luma stride alignment for the semi-planar formats.
pub const SEMI_PLANAR_STRIDE_ALIGN: usize = 16;

/// Luma stride alignment for YV12.
pub const YV12_LUMA_STRIDE_ALIGN: usize = 128;

/// Chroma stride alignment for YV12.
pub const YV12_CHROMA_STRIDE_ALIGN: usize = 16;

/// Byte offsets of each plane relative to the start of the pixel data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Offset of the luma plane.
    pub y_offset: usize,
    /// Offset of the first Cb sample.
    pub cb_offset: usize,
    /// Offset of the first Cr sample.
    pub cr_offset: usize,
    /// Bytes between luma rows.
    pub y_stride: usize,
    /// Bytes between chroma rows.
    pub c_stride: usize,
    /// Bytes between consecutive samples of one chroma component.
    pub chroma_step: usize,
}

impl PlaneLayout {
    /// Bytes covered by the layout, from the luma plane to the end of the
    /// last chroma row. Saturates at `usize::MAX`.
    pub fn len(&self, height: usize) -> usize {
        self.checked_len(height).unwrap_or(usize::MAX)
    }

    fn checked_len(&self, height: usize) -> Option<usize> {
        let chroma_rows = self.c_stride.checked_mul(height / 2)?;
        match self.chroma_step {
            // Interleaved: one chroma plane, the second component starts
            // one byte in.
            2 => self.cb_offset.min(self.cr_offset).checked_add(chroma_rows),
            _ => self.cb_offset.max(self.cr_offset).checked_add(chroma_rows),
        }
    }

    /// Returns true if the layout covers no bytes.
    pub fn is_empty(&self, height: usize) -> bool {
        self.len(height) == 0
    }
}

/// Compute the plane layout of `format` at `width` × `height`.
///
/// # Errors
///
/// Returns [`Error::UnsupportedFormat`] for packed formats, which have no
/// chroma planes, and [`Error::InvalidHandle`] if the frame is too large to
/// address.
pub fn plane_layout(format: PixelFormat, width: u32, height: u32) -> Result<PlaneLayout> {
    if !format.is_planar() {
        return Err(Error::UnsupportedFormat(format.tag()));
    }
    checked_layout(format, width as usize, height as usize).ok_or_else(|| {
        Error::InvalidHandle(format!(
            "{format:?} frame {width}x{height} exceeds the address space"
        ))
    })
}

fn checked_layout(format: PixelFormat, width: usize, height: usize) -> Option<PlaneLayout> {
    let layout = match format {
        PixelFormat::YCrCb420Sp | PixelFormat::YCbCr420Flexible | PixelFormat::YCbCr420Sp => {
            let y_stride = checked_align_up(width, SEMI_PLANAR_STRIDE_ALIGN)?;
            let chroma = y_stride.checked_mul(height)?;
            let second = chroma.checked_add(1)?;
            let (cb_offset, cr_offset) = if format == PixelFormat::YCbCr420Sp {
                (chroma, second)
            } else {
                (second, chroma)
            };
            PlaneLayout {
                y_offset: 0,
                cb_offset,
                cr_offset,
                y_stride,
                c_stride: y_stride,
                chroma_step: 2,
            }
        }
        PixelFormat::Yv12 => {
            let y_stride = checked_align_up(width, YV12_LUMA_STRIDE_ALIGN)?;
            let c_stride = checked_align_up(y_stride / 2, YV12_CHROMA_STRIDE_ALIGN)?;
            let cr_offset = y_stride.checked_mul(height)?;
            let chroma_plane = c_stride.checked_mul(height / 2)?;
            PlaneLayout {
                y_offset: 0,
                cr_offset,
                cb_offset: cr_offset.checked_add(chroma_plane)?,
                y_stride,
                c_stride,
                chroma_step: 1,
            }
        }
        _ => return None,
    };
    // Every plane must end inside the address space too.
    layout.checked_len(height)?;
    Some(layout)
}

/// Per-plane pointers into a mapped buffer.
///
/// The pointers are only valid while the buffer stays locked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct YcbcrPlanes {
    /// Start of the luma plane.
    pub y: *mut u8,
    /// First Cb sample.
    pub cb: *mut u8,
    /// First Cr sample.
    pub cr: *mut u8,
    /// Bytes between luma rows.
    pub y_stride: usize,
    /// Bytes between chroma rows.
    pub c_stride: usize,
    /// Bytes between consecutive samples of one chroma component.
    pub chroma_step: usize,
}

/// Resolve plane pointers for a buffer whose pixel data starts at `base`.
///
/// This only does address arithmetic; `base` is never dereferenced.
///
/// # Errors
///
/// Returns [`Error::UnsupportedFormat`] if `format` is not a known planar
/// format tag.
pub fn resolve_planes(format: u32, base: *mut u8, width: u32, height: u32) -> Result<YcbcrPlanes> {
    let format = PixelFormat::try_from(format)?;
    let layout = plane_layout(format, width, height)?;

    Ok(YcbcrPlanes {
        y: base.wrapping_add(layout.y_offset),
        cb: base.wrapping_add(layout.cb_offset),
        cr: base.wrapping_add(layout.cr_offset),
        y_stride: layout.y_stride,
        c_stride: layout.c_stride,
        chroma_step: layout.chroma_step,
    })
}
