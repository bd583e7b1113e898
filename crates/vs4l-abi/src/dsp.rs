//! DSP firmware records (OFI v4) and the unified CGO container header.
//!
//! These records live inside ION buffers, not ioctl arguments: the load-graph
//! info is the "model" handed to S_GRAPH for a DSP session, and the execute
//! message is queued as an extra input container.
//!
//! ```text
//! load-graph info:  [OfiLoadGraphHeader][OfiParam; n_param + 1]   ([0] = TSGD)
//! execute message:  [OfiExecHeader][OfiParam; n_update_param]
//! unified cgo:      [UnifiedDspCgo][DspMemInfo; numList][load data ...]
//! ```

use bytemuck::{Pod, Zeroable};

/// `fd` placeholder before a buffer is bound.
pub const VALUE_FD_INIT: i32 = -1;
/// `iova` placeholder; the driver fills it from `fd`.
pub const VALUE_IOVA_INIT: u32 = u32::MAX;
/// Param index meaning "not mapped".
pub const MAPPING_INDEX_INVALID: u32 = u32::MAX;
/// UCGO uid meaning "no uid".
pub const UCGO_UID_INVALID: u16 = u16::MAX;
/// Number of TSGD records per load-graph info.
pub const NUM_TSGD: u32 = 1;

/// `UnifiedDspCgo::cgoMagic`.
pub const UCGO_CGO_MAGIC: u32 = 0x0FF1_100F;
/// `DspUcgoHeader::magic`.
pub const UCGO_HEADER_MAGIC: u32 = 0xBEEF_9091;

/// `DspMemType_e`, also used as OFI `param_type`.
pub mod mem_type {
    /// Target graph data, the core of the firmware load.
    pub const DSP_GRAPH_BIN: u16 = 0;
    /// Command-queue binary.
    pub const CMDQ_BIN: u16 = 1;
    /// Kernel binary name.
    pub const KERNEL_BIN_STR: u16 = 2;
    /// Input buffer.
    pub const INPUT: u16 = 3;
    /// Output buffer.
    pub const OUTPUT: u16 = 4;
    /// DSP intermediate buffer.
    pub const TEMP: u16 = 5;
    /// Weight.
    pub const WEIGHT: u16 = 6;
    /// Bias.
    pub const BIAS: u16 = 7;
    /// Scalar argument.
    pub const SCALAR: u16 = 8;
    /// Meaning given only by the load type.
    pub const CUSTOM: u16 = 9;
    /// Unused slot.
    pub const EMPTY: u16 = 0x7000;
}

/// `DspLoadType_e`.
pub mod load_type {
    /// Allocated by the user driver.
    pub const ALLOC: u16 = 0;
    /// Allocated and zeroed.
    pub const ALLOC_ZERO: u16 = 1;
    /// Allocated and loaded from the UCGO payload.
    pub const ALLOC_LOAD: u16 = 2;
    /// Imported from a runtime buffer.
    pub const IMPORT: u16 = 3;
    /// Nothing to allocate.
    pub const BYPASS: u16 = 4;
}

/// `ofi_common_addr_type_e`.
pub mod addr_type {
    /// Virtual address.
    pub const V_ADDR: u8 = 0;
    /// Device virtual address.
    pub const DV_ADDR: u8 = 1;
    /// File descriptor.
    pub const FD: u8 = 2;
}

/// `ofi_common_mem_attr_e`.
pub mod mem_attr {
    /// Cacheable.
    pub const CACHEABLE: u8 = 0;
    /// Non-cacheable.
    pub const NON_CACHEABLE: u8 = 1;
    /// Unknown cacheability.
    pub const UNKNOWN_CACHEABLE: u8 = 2;
}

/// `ofi_common_mem_type_e`.
pub mod ofi_mem {
    /// ION allocator.
    pub const ION: u8 = 0;
    /// Host malloc.
    pub const MALLOC: u8 = 1;
    /// Android ashmem.
    pub const ASHMEM: u8 = 2;
    /// Not allocated.
    pub const NONE: u8 = 9;
}

/// `ofi_v4_mem_t`. The address union is stored as its fd/iova arm.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct OfiMem {
    /// [`addr_type`] value.
    pub addr_type: u8,
    /// [`mem_attr`] value.
    pub mem_attr: u8,
    /// [`ofi_mem`] value.
    pub mem_type: u8,
    /// Allocate during prepare.
    pub is_mandatory: u8,
    /// Size in bytes, 0 when not allocated.
    pub size: u32,
    /// Offset into the buffer.
    pub offset: u32,
    /// Reserved.
    pub reserved: u32,
    /// Shape words (width, height, channel, pixel bits).
    pub param: [u32; 4],
    /// Virtual address.
    pub vaddr: u64,
    /// dma-buf fd.
    pub fd: i32,
    /// Device address, filled by the driver.
    pub iova: u32,
}

/// `ofi_v4_param_t`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct OfiParam {
    /// [`mem_type`] value.
    pub param_type: u32,
    /// Param index (or kernel id).
    pub idx: u32,
    /// Memory description.
    pub mem: OfiMem,
}

/// `ofi_v4_load_graph_info` header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct OfiLoadGraphHeader {
    /// `enn_id << 16 | ucgo_uid`.
    pub global_id: u32,
    /// TSGD records.
    pub n_tsgd: u32,
    /// Params after the TSGD.
    pub n_param: u32,
    /// Kernel binaries.
    pub n_kernel: u32,
}

/// `ofi_v4_execute_msg_info` header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct OfiExecHeader {
    /// Same id as the load-graph info.
    pub global_id: u32,
    /// Params that follow.
    pub n_update_param: u32,
}

/// `DspMemInfo`, packed on disk. All fields are naturally aligned, so
/// `repr(C)` has the same 32-byte layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DspMemInfo {
    /// [`mem_type`] value.
    pub mem_type: u16,
    /// [`load_type`] value.
    pub load_type: u16,
    /// Index among records of the same type.
    pub index: u32,
    /// Size in bytes.
    pub size: u32,
    /// Offset in the target buffer.
    pub offset: u32,
    /// Payload offset from the end of the record list.
    pub data_offset: u32,
    /// Param slot, negative when unmapped.
    pub mapping_index: i32,
    /// Reserved.
    pub reserved: [u8; 8],
}

/// `UnifiedDspCgo` including the embedded `DspUcgoHeader`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct UnifiedDspCgo {
    /// [`UCGO_CGO_MAGIC`].
    pub cgo_magic: u32,
    /// Always 0 for unified containers.
    pub size_flatbuffer: u32,
    /// Unused for unified containers.
    pub size_tsgd: u32,
    /// [`UCGO_HEADER_MAGIC`].
    pub magic: u32,
    /// Distinguishes several UCGOs inside one unified op.
    pub unique_id: u32,
    /// Source revision.
    pub version: [u32; 5],
    /// Total container size.
    pub total_size: u32,
    /// Number of [`DspMemInfo`] records.
    pub num_list: u32,
    /// Reserved.
    pub reserved: [u8; 4],
}

/// Size of one [`OfiParam`].
pub const OFI_PARAM_SIZE: usize = std::mem::size_of::<OfiParam>();
/// Size of [`OfiLoadGraphHeader`].
pub const LOAD_GRAPH_HEADER_SIZE: usize = std::mem::size_of::<OfiLoadGraphHeader>();
/// Size of [`OfiExecHeader`].
pub const EXEC_HEADER_SIZE: usize = std::mem::size_of::<OfiExecHeader>();
/// Size of [`UnifiedDspCgo`].
pub const UCGO_HEADER_SIZE: usize = std::mem::size_of::<UnifiedDspCgo>();
/// Size of [`DspMemInfo`].
pub const MEM_INFO_SIZE: usize = std::mem::size_of::<DspMemInfo>();

/// `global_id` for a DSP graph: list id bits 16..32 above the UCGO uid.
#[allow(clippy::cast_possible_truncation)]
pub const fn dsp_global_id(list_id: u64, ucgo_uid: u16) -> u32 {
    ((((list_id >> 16) & 0xFFFF) as u32) << 16) | ucgo_uid as u32
}
