//! Bin sessions and their wire payloads
//!
//! A [`BinSession`] is one loaded operator binary: its device fd, the
//! driver-assigned unique id, the request slot ring and the container lists
//! bound to each slot. The free functions here build the S_FORMAT and
//! container payloads from a [`ModelInfo`] and caller memory.

// Shapes and slot indices are u32 on the wire
#![allow(clippy::cast_possible_truncation)]

use crate::backend::{Accelerator, BufferFrame, ContainerFrame, ContainerListFrame, KernelNames};
use crate::error::{AccelError, Result};
use crate::memory::{IonBuffer, Memory};
use crate::model::Shape;
use crate::perf::{ModePreference, PerfMode};
use crate::slot_ring::RequestSlotRing;
use bytes::Bytes;
use std::os::unix::io::RawFd;
use vs4l_abi::cell_align;
use vs4l_abi::param::{BOUND_NA, NO_SHARED_BUFFER};
use vs4l_abi::wire::{
    vs4l_format, vs4l_roi, VS4L_BUFFER_LIST, VS4L_BUFFER_ROI, VS4L_DIRECTION_IN,
    VS4L_DIRECTION_OT, VS4L_MEMORY_DMABUF,
};

/// Bits per pixel reported for outputs and the DSP execute message
const DEFAULT_PIXEL_BITS: u32 = 8;

/// One feature map of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureMap {
    /// Shape
    pub shape: Shape,

    /// Buffer-table index
    pub buffer_index: u32,

    /// Bits per pixel (inputs only)
    pub bpp: u32,
}

/// Everything the link needs to load one operator binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    /// Op id, the session's lookup key
    pub id: u64,

    /// Owning operator list
    pub operator_list_id: u64,

    /// Id shared by the fragments of a unified op
    pub unified_op_id: u64,

    /// Binary name, for logs
    pub name: String,

    /// Bytes handed to S_GRAPH (NCP for the NPU, load-graph info for the DSP)
    pub model: Bytes,

    /// Input feature maps
    pub inputs: Vec<FeatureMap>,

    /// Output feature maps
    pub outputs: Vec<FeatureMap>,

    /// Hardware cell size used to align input formats
    pub cell_align: Shape,

    /// Buffer index of a shared last input, or -1
    pub shared_buffer: i32,

    /// Outputs share one buffer and are not channel aligned
    pub binding_ofm: bool,

    /// Tiles per buffer
    pub tile_size: u32,

    /// DSP kernel names for S_PARAM
    pub kernel_names: Option<KernelNames>,

    /// DSP execute message size; nonzero adds one input container
    pub exec_msg_size: u32,
}

impl ModelInfo {
    /// Model with no feature maps
    pub fn new(id: u64, operator_list_id: u64, model: impl Into<Bytes>) -> Self {
        Self {
            id,
            operator_list_id,
            unified_op_id: id,
            name: String::new(),
            model: model.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            cell_align: Shape::new(1, 1, 1, 1, 1),
            shared_buffer: NO_SHARED_BUFFER,
            binding_ofm: false,
            tile_size: 1,
            kernel_names: None,
            exec_msg_size: 0,
        }
    }
}

/// Per-session scheduling and performance options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Performance preference
    pub preference: ModePreference,

    /// Request priority, below 256
    pub priority: u32,

    /// Target latency in microseconds
    pub latency: u32,

    /// Bound core or `BOUND_NA`
    pub bound_core: u32,

    /// Preset scenario id
    pub preset_id: i32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            preference: ModePreference::Normal,
            priority: 0,
            latency: 0,
            bound_core: BOUND_NA,
            preset_id: 0,
        }
    }
}

/// Buffers for one prepare or execute
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionBuffers {
    /// One per input feature map
    pub inputs: Vec<Memory>,

    /// One per output feature map
    pub outputs: Vec<Memory>,

    /// DSP execute message
    pub exec_info: Option<Memory>,
}

impl ExecutionBuffers {
    /// Fd identifying these buffers in the slot ring
    ///
    /// The first input, or the execute message when there is no input.
    pub fn correlation_fd(&self) -> Option<RawFd> {
        self.inputs
            .first()
            .or(self.exec_info.as_ref())
            .map(Memory::fd)
    }
}

/// Input formats, aligned to the cell except a shared last input
pub fn input_formats(info: &ModelInfo, accelerator: Accelerator) -> Vec<vs4l_format> {
    let cell = info.cell_align;
    let last = info.inputs.len().saturating_sub(1);
    let mut formats: Vec<vs4l_format> = info
        .inputs
        .iter()
        .enumerate()
        .map(|(i, fm)| {
            let s = fm.shape;
            let (width, height, channels) =
                if info.shared_buffer != NO_SHARED_BUFFER && i == last {
                    (s.width, s.height, s.channel)
                } else {
                    (
                        cell_align(s.width, cell.width),
                        cell_align(s.height, cell.height),
                        cell_align(s.channel, cell.channel) * s.number,
                    )
                };
            vs4l_format {
                target: i as u32,
                format: accelerator.data_format(),
                plane: 0,
                width,
                height,
                stride: 0,
                cstride: 0,
                channels,
                pixel_format: fm.bpp,
            }
        })
        .collect();

    if accelerator == Accelerator::Dsp && info.exec_msg_size > 0 {
        formats.push(vs4l_format {
            target: info.inputs.len() as u32,
            format: accelerator.data_format(),
            plane: 0,
            width: info.exec_msg_size,
            height: 1,
            stride: 0,
            cstride: 0,
            channels: 1,
            pixel_format: DEFAULT_PIXEL_BITS,
        });
    }
    formats
}

/// Output formats; channels carry the batch and element size
pub fn output_formats(info: &ModelInfo, accelerator: Accelerator) -> Vec<vs4l_format> {
    let cell = info.cell_align;
    info.outputs
        .iter()
        .enumerate()
        .map(|(i, fm)| {
            let s = fm.shape;
            let channel = if info.binding_ofm {
                s.channel
            } else {
                cell_align(s.channel, cell.channel)
            };
            vs4l_format {
                target: i as u32,
                format: accelerator.data_format(),
                plane: 0,
                width: s.width,
                height: s.height,
                stride: 0,
                cstride: 0,
                channels: channel * s.number * s.type_size,
                pixel_format: DEFAULT_PIXEL_BITS,
            }
        })
        .collect()
}

fn container(target: u32, memory: Memory, tile_size: u32) -> ContainerFrame {
    let (fd, addr, size) = (memory.fd(), memory.addr(), memory.size());
    if tile_size > 1 {
        ContainerFrame {
            buffer_type: VS4L_BUFFER_ROI,
            target,
            memory: VS4L_MEMORY_DMABUF,
            buffers: (0..tile_size)
                .map(|j| BufferFrame {
                    roi: vs4l_roi {
                        x: 0,
                        y: j * size,
                        w: 1,
                        h: size,
                    },
                    fd,
                    addr,
                })
                .collect(),
        }
    } else {
        ContainerFrame {
            buffer_type: VS4L_BUFFER_LIST,
            target,
            memory: VS4L_MEMORY_DMABUF,
            buffers: vec![BufferFrame {
                roi: vs4l_roi::default(),
                fd,
                addr,
            }],
        }
    }
}

/// Input and output container lists for `buffers` in `slot`
///
/// The DSP execute message follows the inputs as one more container.
pub fn container_lists(
    buffers: &ExecutionBuffers,
    frame_id: u32,
    slot: usize,
    tile_size: u32,
) -> (ContainerListFrame, ContainerListFrame) {
    let mut inputs: Vec<ContainerFrame> = buffers
        .inputs
        .iter()
        .enumerate()
        .map(|(i, m)| container(i as u32, *m, tile_size))
        .collect();
    if let Some(exec) = buffers.exec_info {
        inputs.push(container(buffers.inputs.len() as u32, exec, tile_size));
    }

    let outputs = buffers
        .outputs
        .iter()
        .enumerate()
        .map(|(i, m)| container(i as u32, *m, tile_size))
        .collect();

    (
        ContainerListFrame {
            direction: VS4L_DIRECTION_IN,
            id: frame_id,
            index: slot as u32,
            flags: 0,
            containers: inputs,
        },
        ContainerListFrame {
            direction: VS4L_DIRECTION_OT,
            id: frame_id,
            index: slot as u32,
            flags: 0,
            containers: outputs,
        },
    )
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Driver-assigned unique id
    pub unique_id: u32,

    /// Owning operator list
    pub operator_list_id: u64,

    /// Buffers have been prepared
    pub prepared: bool,

    /// Perf mode applied on the device
    pub link_mode: PerfMode,

    /// Bound core applied on the device
    pub bound: u32,

    /// Request priority
    pub priority: u32,

    /// Slots not free
    pub slots_in_use: usize,
}

/// One loaded operator binary
#[derive(Debug)]
pub struct BinSession {
    pub(crate) fd: RawFd,
    pub(crate) unique_id: u32,
    pub(crate) model_id: u64,
    pub(crate) operator_list_id: u64,
    pub(crate) in_count: usize,
    pub(crate) out_count: usize,
    pub(crate) needs_exec_info: bool,
    pub(crate) tile_size: u32,
    pub(crate) bound: u32,
    pub(crate) priority: u32,
    pub(crate) preference: ModePreference,
    pub(crate) link_mode: PerfMode,
    pub(crate) prepared: bool,
    pub(crate) ring: RequestSlotRing,
    pub(crate) in_lists: Vec<Option<ContainerListFrame>>,
    pub(crate) out_lists: Vec<Option<ContainerListFrame>>,
    pub(crate) _binary: IonBuffer,
}

impl BinSession {
    /// Driver-assigned unique id
    pub const fn unique_id(&self) -> u32 {
        self.unique_id
    }

    /// Op id the session was opened for
    pub const fn model_id(&self) -> u64 {
        self.model_id
    }

    /// Whether buffers have been prepared
    pub const fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Perf mode currently applied on the device
    pub const fn link_mode(&self) -> PerfMode {
        self.link_mode
    }

    /// Copy out the observable state
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            unique_id: self.unique_id,
            operator_list_id: self.operator_list_id,
            prepared: self.prepared,
            link_mode: self.link_mode,
            bound: self.bound,
            priority: self.priority,
            slots_in_use: self.ring.in_use(),
        }
    }

    /// Check that `buffers` match the session's feature maps
    pub(crate) fn check_counts(&self, buffers: &ExecutionBuffers) -> Result<()> {
        if buffers.inputs.len() != self.in_count || buffers.outputs.len() != self.out_count {
            return Err(AccelError::invalid_argument(format!(
                "session {:#x} expects {} inputs / {} outputs, got {} / {}",
                self.model_id,
                self.in_count,
                self.out_count,
                buffers.inputs.len(),
                buffers.outputs.len()
            )));
        }
        if self.needs_exec_info != buffers.exec_info.is_some() {
            return Err(AccelError::invalid_argument(format!(
                "session {:#x}: execute message {}",
                self.model_id,
                if self.needs_exec_info { "missing" } else { "unexpected" }
            )));
        }
        Ok(())
    }

    /// Record the container lists for `slot`
    pub(crate) fn store_lists(
        &mut self,
        slot: usize,
        lists: (ContainerListFrame, ContainerListFrame),
    ) {
        if let Some(entry) = self.in_lists.get_mut(slot) {
            *entry = Some(lists.0);
        }
        if let Some(entry) = self.out_lists.get_mut(slot) {
            *entry = Some(lists.1);
        }
    }

    /// Drop the container lists of `slot` unless it stays bound
    pub(crate) fn forget_lists(&mut self, slot: usize) {
        if let Some(entry) = self.in_lists.get_mut(slot) {
            *entry = None;
        }
        if let Some(entry) = self.out_lists.get_mut(slot) {
            *entry = None;
        }
    }
}
