//! VS4L wire model for the vertex NPU/DSP kernel driver.
//!
//! This crate has **no logic** and **no device access**. It is a pure model
//! of the user/kernel boundary: ioctl request numbers, the `#[repr(C)]`
//! structures those requests carry, the S_PARAM target space, and the DSP
//! firmware parameter records that travel inside ION buffers.
//!
//! Every structure here crosses into the kernel by pointer, so field order
//! and width must match the driver headers exactly.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`ioctl`] | `VS4L_VERTEXIOC_*` request numbers (`_IO`/`_IOW` encoding) |
//! | [`wire`] | `vs4l_graph`, `vs4l_format_list`, `vs4l_container_list`, ... |
//! | [`param`] | S_PARAM targets, perf modes, frequency tables, status codes |
//! | [`dsp`] | OFI v4 load-graph / execute-message records, UCGO header |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod dsp;
pub mod ioctl;
pub mod param;
pub mod wire;

/// Builds a four-character VS4L data format code.
///
/// `df_image(b'N', b'P', b'U', b'0')` is the NPU feature-map format.
pub const fn df_image(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

/// Rounds `value` up to the next multiple of `cell`.
///
/// A cell of 0 or 1 leaves the value untouched.
pub const fn cell_align(value: u32, cell: u32) -> u32 {
    if cell <= 1 {
        value
    } else {
        value.div_ceil(cell) * cell
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn df_image_matches_ascii_packing() {
        assert_eq!(df_image(b'N', b'P', b'U', b'0'), 0x3055_504E);
        assert_eq!(df_image(b'D', b'S', b'P', b'0'), 0x3050_5344);
    }

    #[test]
    fn cell_align_rounds_up() {
        assert_eq!(cell_align(224, 1), 224);
        assert_eq!(cell_align(3, 3), 3);
        assert_eq!(cell_align(4, 3), 6);
        assert_eq!(cell_align(0, 3), 0);
        assert_eq!(cell_align(7, 0), 7);
    }
}
