//! VS4L ioctl request numbers.
//!
//! Linux generic encoding: `dir << 30 | size << 16 | type << 8 | nr`, with
//! `_IOW` = dir 1 and `_IO` = dir 0. Magic type is `'V'`.

#![allow(clippy::cast_possible_truncation)]

use crate::wire::{
    vs4l_container_list, vs4l_ctrl, vs4l_format_list, vs4l_graph, vs4l_param_list,
    vs4l_sched_param,
};
use libc::c_ulong;
use std::mem::size_of;

const IOC_NRSHIFT: c_ulong = 0;
const IOC_TYPESHIFT: c_ulong = 8;
const IOC_SIZESHIFT: c_ulong = 16;
const IOC_DIRSHIFT: c_ulong = 30;

const IOC_NONE: c_ulong = 0;
const IOC_WRITE: c_ulong = 1;

/// VS4L ioctl magic.
pub const VS4L_MAGIC: u8 = b'V';

const fn ioc(dir: c_ulong, nr: c_ulong, size: usize) -> c_ulong {
    (dir << IOC_DIRSHIFT)
        | ((size as c_ulong) << IOC_SIZESHIFT)
        | ((VS4L_MAGIC as c_ulong) << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
}

const fn io(nr: c_ulong) -> c_ulong {
    ioc(IOC_NONE, nr, 0)
}

const fn iow<T>(nr: c_ulong) -> c_ulong {
    ioc(IOC_WRITE, nr, size_of::<T>())
}

/// Load a graph (`vs4l_graph`).
pub const VS4L_VERTEXIOC_S_GRAPH: c_ulong = iow::<vs4l_graph>(0);
/// Describe feature maps (`vs4l_format_list`).
pub const VS4L_VERTEXIOC_S_FORMAT: c_ulong = iow::<vs4l_format_list>(1);
/// Performance and DSP kernel parameters (`vs4l_param_list`).
pub const VS4L_VERTEXIOC_S_PARAM: c_ulong = iow::<vs4l_param_list>(2);
/// Generic control (`vs4l_ctrl`).
pub const VS4L_VERTEXIOC_S_CTRL: c_ulong = iow::<vs4l_ctrl>(3);
/// Start streaming.
pub const VS4L_VERTEXIOC_STREAM_ON: c_ulong = io(4);
/// Stop streaming.
pub const VS4L_VERTEXIOC_STREAM_OFF: c_ulong = io(5);
/// Queue a container list.
pub const VS4L_VERTEXIOC_QBUF: c_ulong = iow::<vs4l_container_list>(6);
/// Dequeue a completed container list.
pub const VS4L_VERTEXIOC_DQBUF: c_ulong = iow::<vs4l_container_list>(7);
/// Pre-bind a container list to a slot.
pub const VS4L_VERTEXIOC_PREPARE: c_ulong = iow::<vs4l_container_list>(8);
/// Release a pre-bound container list.
pub const VS4L_VERTEXIOC_UNPREPARE: c_ulong = iow::<vs4l_container_list>(9);
/// Priority and core boundness (`vs4l_sched_param`).
pub const VS4L_VERTEXIOC_SCHED_PARAM: c_ulong = iow::<vs4l_sched_param>(10);
/// Start the NN profiler.
#[cfg(feature = "profiler")]
pub const VS4L_VERTEXIOC_PROFILE_ON: c_ulong = iow::<crate::wire::vs4l_profiler>(11);
/// Stop the NN profiler.
#[cfg(feature = "profiler")]
pub const VS4L_VERTEXIOC_PROFILE_OFF: c_ulong = iow::<crate::wire::vs4l_profiler>(12);
/// Boot the selected hardware block.
pub const VS4L_VERTEXIOC_BOOTUP: c_ulong = io(13);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_requests_carry_no_size() {
        assert_eq!(VS4L_VERTEXIOC_STREAM_ON, 0x5604);
        assert_eq!(VS4L_VERTEXIOC_STREAM_OFF, 0x5605);
        assert_eq!(VS4L_VERTEXIOC_BOOTUP, 0x560D);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn iow_requests_encode_structure_size() {
        assert_eq!(VS4L_VERTEXIOC_S_GRAPH, 0x4020_5600);
        assert_eq!(VS4L_VERTEXIOC_S_FORMAT, 0x4010_5601);
        assert_eq!(VS4L_VERTEXIOC_S_PARAM, 0x4010_5602);
        assert_eq!(VS4L_VERTEXIOC_S_CTRL, 0x4008_5603);
        assert_eq!(VS4L_VERTEXIOC_QBUF, 0x4080_5606);
        assert_eq!(VS4L_VERTEXIOC_DQBUF, 0x4080_5607);
        assert_eq!(VS4L_VERTEXIOC_PREPARE, 0x4080_5608);
        assert_eq!(VS4L_VERTEXIOC_SCHED_PARAM, 0x4008_560A);
    }
}
