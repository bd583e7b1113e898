//! `#[repr(C)]` structures passed to the VS4L ioctls.
//!
//! Pointer fields are raw because the kernel dereferences them during the
//! call. Builders in the driver crate own the pointed-to storage and only
//! construct these views for the duration of one syscall.

#![allow(non_camel_case_types)]

use crate::df_image;
use libc::{c_int, c_uint, c_ulong, timeval};

// ── Enumerations ─────────────────────────────────────────────────────────────

/// `vs4l_buffer_type::VS4L_BUFFER_LIST`
pub const VS4L_BUFFER_LIST: u32 = 0;
/// `vs4l_buffer_type::VS4L_BUFFER_ROI`, used for multi-tile buffers.
pub const VS4L_BUFFER_ROI: u32 = 1;
/// `vs4l_buffer_type::VS4L_BUFFER_PYRAMID`
pub const VS4L_BUFFER_PYRAMID: u32 = 2;

/// `vs4l_memory::VS4L_MEMORY_USERPTR`
pub const VS4L_MEMORY_USERPTR: u32 = 1;
/// `vs4l_memory::VS4L_MEMORY_VIRTPTR`
pub const VS4L_MEMORY_VIRTPTR: u32 = 2;
/// `vs4l_memory::VS4L_MEMORY_DMABUF`
pub const VS4L_MEMORY_DMABUF: u32 = 3;

/// Container-list flag bits. Tested as `flags & (1 << bit)`.
pub mod cl_flag {
    /// Driver filled `timestamp`.
    pub const TIMESTAMP: u32 = 0;
    /// Container list was prepared.
    pub const PREPARE: u32 = 8;
    /// Request failed in the driver or firmware.
    pub const INVALID: u32 = 9;
    /// Request completed.
    pub const DONE: u32 = 10;

    /// True when `bit` is set in `flags`.
    pub const fn is_set(flags: u32, bit: u32) -> bool {
        flags & (1 << bit) != 0
    }
}

/// `vs4l_direction::VS4L_DIRECTION_IN`
pub const VS4L_DIRECTION_IN: u32 = 1;
/// `vs4l_direction::VS4L_DIRECTION_OT`
pub const VS4L_DIRECTION_OT: u32 = 2;

/// Hardware selector passed with BOOTUP.
pub mod hwdev {
    /// DNC block.
    pub const DNC: u32 = 0x1;
    /// NPU cores.
    pub const NPU: u32 = 0x2;
    /// DSP cores.
    pub const DSP: u32 = 0x4;
}

/// Feature-map format for NPU inputs.
pub const VS4L_DF_IMAGE_NPU: u32 = df_image(b'N', b'P', b'U', b'0');
/// Feature-map format for DSP inputs.
pub const VS4L_DF_IMAGE_DSP: u32 = df_image(b'D', b'S', b'P', b'0');
/// 8-bit unsigned planar image.
pub const VS4L_DF_IMAGE_U8: u32 = df_image(b'U', b'0', b'0', b'8');

/// Network priority bounds accepted by SCHED_PARAM.
pub const ACC_PRIORITY_MIN_VAL: u32 = 0;
/// Upper priority bound (inclusive).
pub const ACC_PRIORITY_MAX_VAL: u32 = 255;

/// Core 0 boundness.
pub const NPU_BOUND_CORE0: u32 = 0;
/// No core affinity.
pub const NPU_BOUND_UNBOUND: u32 = 0xFFFF_FFFF;

// ── Structures ───────────────────────────────────────────────────────────────

/// Scheduling parameters for SCHED_PARAM.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct vs4l_sched_param {
    /// Request priority, 0..=255.
    pub priority: u32,
    /// Bound core id or [`NPU_BOUND_UNBOUND`].
    pub bound_id: u32,
}

/// One S_PARAM entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct vs4l_param {
    /// Prefer target (see [`crate::param::target`]).
    pub target: u32,
    /// User address, used by DSP kernel names.
    pub addr: c_ulong,
    /// Value for QoS and perf targets.
    pub offset: u32,
    /// Payload size for address-carrying targets.
    pub size: u32,
}

/// S_PARAM argument.
#[repr(C)]
#[derive(Debug)]
pub struct vs4l_param_list {
    /// Number of entries at `params`.
    pub count: u32,
    /// Entry array.
    pub params: *mut vs4l_param,
}

/// Region of interest inside a buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct vs4l_roi {
    /// Column.
    pub x: c_uint,
    /// Row, used as the tile byte offset.
    pub y: c_uint,
    /// Width.
    pub w: c_uint,
    /// Height, used as the tile byte length.
    pub h: c_uint,
}

/// S_CTRL / BOOTUP argument.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct vs4l_ctrl {
    /// Control id.
    pub ctrl: u32,
    /// Control value.
    pub value: u32,
}

/// S_GRAPH argument. `addr` points at a [`drv_usr_share`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct vs4l_graph {
    /// Graph id (unused by this runtime, 0).
    pub id: c_uint,
    /// Graph priority.
    pub priority: c_uint,
    /// Time budget in milliseconds.
    pub time: c_uint,
    /// Graph flags.
    pub flags: c_uint,
    /// Size of the structure at `addr`.
    pub size: c_uint,
    /// User address of the share block.
    pub addr: c_ulong,
}

/// One feature-map format.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct vs4l_format {
    /// Feature-map index within the direction.
    pub target: u32,
    /// Data format code ([`VS4L_DF_IMAGE_NPU`] / [`VS4L_DF_IMAGE_DSP`]).
    pub format: u32,
    /// Plane count.
    pub plane: u32,
    /// Width in elements.
    pub width: u32,
    /// Height in elements.
    pub height: u32,
    /// Row stride.
    pub stride: u32,
    /// Channel stride.
    pub cstride: u32,
    /// Channel count.
    pub channels: u32,
    /// Bits per pixel.
    pub pixel_format: u32,
}

/// S_FORMAT argument.
#[repr(C)]
#[derive(Debug)]
pub struct vs4l_format_list {
    /// [`VS4L_DIRECTION_IN`] or [`VS4L_DIRECTION_OT`].
    pub direction: u32,
    /// Number of entries at `formats`.
    pub count: u32,
    /// Format array.
    pub formats: *mut vs4l_format,
}

/// Buffer address: user pointer or dma-buf fd.
#[repr(C)]
#[derive(Clone, Copy)]
pub union vs4l_buffer_m {
    /// User pointer for [`VS4L_MEMORY_USERPTR`].
    pub userptr: c_ulong,
    /// dma-buf fd for [`VS4L_MEMORY_DMABUF`].
    pub fd: c_int,
}

impl std::fmt::Debug for vs4l_buffer_m {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("vs4l_buffer_m { .. }")
    }
}

/// One buffer inside a container.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct vs4l_buffer {
    /// Tile window.
    pub roi: vs4l_roi,
    /// Address.
    pub m: vs4l_buffer_m,
    /// Mapped user address of the dma-buf.
    pub reserved: c_ulong,
}

/// One feature map worth of buffers.
#[repr(C)]
#[derive(Debug)]
pub struct vs4l_container {
    /// [`VS4L_BUFFER_LIST`] or [`VS4L_BUFFER_ROI`].
    pub r#type: c_uint,
    /// Feature-map index.
    pub target: c_uint,
    /// Memory kind, always [`VS4L_MEMORY_DMABUF`] here.
    pub memory: c_uint,
    /// Reserved words.
    pub reserved: [c_uint; 4],
    /// Number of buffers (tiles).
    pub count: c_uint,
    /// Buffer array.
    pub buffers: *mut vs4l_buffer,
}

/// QBUF / DQBUF / PREPARE / UNPREPARE argument.
#[repr(C)]
#[derive(Debug)]
pub struct vs4l_container_list {
    /// [`VS4L_DIRECTION_IN`] or [`VS4L_DIRECTION_OT`].
    pub direction: c_uint,
    /// Frame id.
    pub id: c_uint,
    /// Slot index.
    pub index: c_uint,
    /// [`cl_flag`] bits.
    pub flags: c_uint,
    /// Driver timestamps.
    pub timestamp: [timeval; 6],
    /// Number of containers.
    pub count: c_uint,
    /// Container array.
    pub containers: *mut vs4l_container,
}

/// Block handed to the driver through `vs4l_graph::addr`.
///
/// The driver writes `id`, which becomes the session's unique id.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct drv_usr_share {
    /// Driver-assigned unique id.
    pub id: c_uint,
    /// dma-buf fd of the model copy.
    pub bin_fd: c_int,
    /// Model size in bytes.
    pub bin_size: c_uint,
    /// Mapped address of the model copy.
    pub bin_mmap: c_ulong,
    /// Id shared by every binary of one unified op.
    pub unified_op_id: u64,
}

/// Profiler tree node.
#[cfg(feature = "profiler")]
#[repr(C)]
#[derive(Debug)]
pub struct vs4l_profiler_node {
    /// Node label.
    pub label: *mut libc::c_char,
    /// Measured duration.
    pub duration: c_uint,
    /// Child array.
    pub child: *mut *mut vs4l_profiler_node,
}

/// PROFILE_ON / PROFILE_OFF argument.
#[cfg(feature = "profiler")]
#[repr(C)]
#[derive(Debug)]
pub struct vs4l_profiler {
    /// Profiling depth.
    pub level: u8,
    /// Root node.
    pub node: *mut vs4l_profiler_node,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn structure_sizes_match_lp64_kernel_layout() {
        assert_eq!(size_of::<vs4l_sched_param>(), 8);
        assert_eq!(size_of::<vs4l_param>(), 24);
        assert_eq!(size_of::<vs4l_param_list>(), 16);
        assert_eq!(size_of::<vs4l_ctrl>(), 8);
        assert_eq!(size_of::<vs4l_graph>(), 32);
        assert_eq!(size_of::<vs4l_format>(), 36);
        assert_eq!(size_of::<vs4l_format_list>(), 16);
        assert_eq!(size_of::<vs4l_buffer>(), 32);
        assert_eq!(size_of::<vs4l_container>(), 40);
        assert_eq!(size_of::<vs4l_container_list>(), 128);
        assert_eq!(size_of::<drv_usr_share>(), 32);
    }

    #[test]
    fn invalid_flag_is_bit_nine() {
        assert!(cl_flag::is_set(1 << 9, cl_flag::INVALID));
        assert!(!cl_flag::is_set(1 << 10, cl_flag::INVALID));
    }
}
