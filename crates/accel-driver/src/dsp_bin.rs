//! DSP operator binaries
//!
//! A DSP operator ships either as a CGO graph (a bare TSGD blob plus the
//! operator's kernel library names) or as a unified CGO container that
//! describes every parameter buffer itself. Both are turned into the same
//! two firmware tables:
//!
//! ```text
//! load-graph info   S_GRAPH payload      [header][TSGD][param 0..n]
//! execute message   extra input buffer   [header][param 0..n], fds per request
//! ```
//!
//! The kind is decided once, from the binary name, and kept as a
//! [`DspBinInfo`] variant for the lifetime of the session.

// Firmware records use u32 sizes and indices
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use crate::backend::KernelNames;
use crate::error::{AccelError, Result};
use crate::memory::IonBuffer;
use crate::model::{Binary, BufferTable, Shape};
use crate::session::{ExecutionBuffers, FeatureMap, ModelInfo};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::ffi::CStr;
use tracing::{debug, info};
use vs4l_abi::dsp::{
    addr_type, dsp_global_id, load_type, mem_attr, mem_type, ofi_mem, DspMemInfo,
    OfiExecHeader, OfiLoadGraphHeader, OfiMem, OfiParam, UnifiedDspCgo, EXEC_HEADER_SIZE,
    LOAD_GRAPH_HEADER_SIZE, MAPPING_INDEX_INVALID, MEM_INFO_SIZE, NUM_TSGD, OFI_PARAM_SIZE,
    UCGO_CGO_MAGIC, UCGO_HEADER_MAGIC, UCGO_HEADER_SIZE, UCGO_UID_INVALID, VALUE_FD_INIT,
    VALUE_IOVA_INIT,
};

/// Name fragment marking a CGO graph binary
const CGO_NAME_MARK: &str = "TSGD";

/// Tensor name fragment of CGO shape-info buffers
const SHAPE_INFO_NAME: &str = "Shape Infos Buffer";

/// True when `binary` is a CGO graph rather than a unified container
pub fn is_cgo_binary(binary: &Binary) -> bool {
    binary.name.contains(CGO_NAME_MARK)
}

/// One firmware param backed by an fd
pub fn fill_param(idx: u32, mem: u8, param_type: u16, size: u32, fd: i32, offset: u32) -> OfiParam {
    OfiParam {
        param_type: u32::from(param_type),
        idx,
        mem: OfiMem {
            addr_type: addr_type::FD,
            mem_attr: mem_attr::UNKNOWN_CACHEABLE,
            mem_type: mem,
            is_mandatory: 1,
            size,
            offset,
            fd,
            iova: VALUE_IOVA_INIT,
            ..OfiMem::default()
        },
    }
}

fn empty_param() -> OfiParam {
    fill_param(MAPPING_INDEX_INVALID, ofi_mem::NONE, mem_type::EMPTY, 0, VALUE_FD_INIT, 0)
}

/// Pack kernel names as `[u32 len; n]` followed by the NUL-terminated names
///
/// `len` counts the NUL. Returns `None` when there are no names.
pub fn parse_kernel_bin<S: AsRef<str>>(names: &[S]) -> Option<KernelNames> {
    if names.is_empty() {
        return None;
    }
    let mut lengths = Vec::with_capacity(names.len() * 4);
    let mut text = Vec::new();
    for name in names {
        let name = name.as_ref().as_bytes();
        lengths.extend_from_slice(&(name.len() as u32 + 1).to_ne_bytes());
        text.extend_from_slice(name);
        text.push(0);
    }
    lengths.extend_from_slice(&text);
    debug!("{} DSP kernel names, {} bytes", names.len(), lengths.len());
    Some(KernelNames {
        table: lengths,
        count: names.len() as u32,
    })
}

/// Load-graph info handed to S_GRAPH
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadGraphInfo {
    /// Header
    pub header: OfiLoadGraphHeader,

    /// `[0]` is the TSGD, then one entry per param
    pub params: Vec<OfiParam>,
}

impl LoadGraphInfo {
    /// Serialized size
    pub fn size(&self) -> usize {
        LOAD_GRAPH_HEADER_SIZE + self.params.len() * OFI_PARAM_SIZE
    }

    /// Firmware byte layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        out.extend_from_slice(bytemuck::bytes_of(&self.header));
        out.extend_from_slice(bytemuck::cast_slice(&self.params));
        out
    }

    /// Decode a serialized table
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::MalformedBinary`] when the param count in the
    /// header does not match the byte length.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let header: OfiLoadGraphHeader = read_record(data, 0)?;
        let count = header.n_param as usize + header.n_tsgd as usize;
        if data.len() != LOAD_GRAPH_HEADER_SIZE + count * OFI_PARAM_SIZE {
            return Err(AccelError::malformed(format!(
                "load-graph info of {} bytes holds {count} params",
                data.len()
            )));
        }
        let params = (0..count)
            .map(|i| read_record(data, LOAD_GRAPH_HEADER_SIZE + i * OFI_PARAM_SIZE))
            .collect::<Result<_>>()?;
        Ok(Self { header, params })
    }
}

/// Execute message queued as the last input of a DSP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecMessage {
    /// Header
    pub header: OfiExecHeader,

    /// Params updated per request
    pub params: Vec<OfiParam>,
}

impl ExecMessage {
    /// Serialized size
    pub fn size(&self) -> usize {
        EXEC_HEADER_SIZE + self.params.len() * OFI_PARAM_SIZE
    }

    /// Firmware byte layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        out.extend_from_slice(bytemuck::bytes_of(&self.header));
        out.extend_from_slice(bytemuck::cast_slice(&self.params));
        out
    }

    /// Copy the message into `buffer`
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::InvalidMemory`] when the buffer size differs.
    pub fn write_into(&self, buffer: &mut IonBuffer) -> Result<()> {
        let bytes = self.to_bytes();
        if buffer.len() != bytes.len() {
            return Err(AccelError::invalid_memory(format!(
                "execute message needs {} bytes, buffer has {}",
                bytes.len(),
                buffer.len()
            )));
        }
        buffer.as_mut_slice().copy_from_slice(&bytes);
        Ok(())
    }

    fn param_mut(&mut self, index: u32) -> Result<&mut OfiParam> {
        let count = self.params.len();
        self.params.get_mut(index as usize).ok_or_else(|| {
            AccelError::malformed(format!("param index {index} beyond {count} params"))
        })
    }
}

fn read_record<T: bytemuck::Pod>(data: &[u8], at: usize) -> Result<T> {
    let end = at + std::mem::size_of::<T>();
    data.get(at..end)
        .map(bytemuck::pod_read_unaligned)
        .ok_or_else(|| AccelError::malformed(format!("record at {at} runs past {} bytes", data.len())))
}

fn payload(data: &[u8], at: usize, len: usize) -> Result<&[u8]> {
    at.checked_add(len)
        .and_then(|end| data.get(at..end))
        .ok_or_else(|| {
            AccelError::malformed(format!("payload {at}+{len} runs past {} bytes", data.len()))
        })
}

/// Parsed DSP binary
#[derive(Debug)]
pub enum DspBinInfo {
    /// Unified CGO container
    Ucgo(UcgoInfo),
    /// CGO graph
    Cgo(CgoInfo),
}

impl DspBinInfo {
    /// Global id shared by the load-graph info and execute message
    pub fn global_id(&self) -> u32 {
        match self {
            Self::Ucgo(u) => u.global_id,
            Self::Cgo(c) => c.global_id,
        }
    }

    /// Whether this is a CGO graph
    pub const fn is_cgo(&self) -> bool {
        matches!(self, Self::Cgo(_))
    }

    /// Load-graph info
    pub fn load_graph(&self) -> &LoadGraphInfo {
        match self {
            Self::Ucgo(u) => &u.load_graph,
            Self::Cgo(c) => &c.load_graph,
        }
    }

    /// Execute message before any buffer is bound
    pub fn exec_template(&self) -> &ExecMessage {
        match self {
            Self::Ucgo(u) => &u.exec,
            Self::Cgo(c) => &c.exec,
        }
    }

    /// Write the DSP tables into `info`
    ///
    /// The load-graph info becomes the S_GRAPH model, the kernel names the
    /// S_PARAM payload and the execute message size an extra input. A
    /// bypassed direction loses its feature maps.
    pub fn apply_to(&self, info: &mut ModelInfo) {
        let (kernel_names, exec_size) = match self {
            Self::Ucgo(u) => {
                if u.bypass_inputs {
                    info!("Remove input for DSP op {:#x}: UCGO input is bypassed", info.id);
                    info.inputs.clear();
                }
                if u.bypass_outputs {
                    info!("Remove output for DSP op {:#x}: UCGO output is bypassed", info.id);
                    info.outputs.clear();
                }
                (u.kernel_names.clone(), u.exec.size())
            }
            Self::Cgo(c) => (c.kernel_names.clone(), c.exec.size()),
        };
        info.model = Bytes::from(self.load_graph().to_bytes());
        info.kernel_names = kernel_names;
        info.exec_msg_size = exec_size as u32;
    }

    /// Bind request buffers into an execute message
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::MalformedBinary`] when a buffer has no param
    /// slot and [`AccelError::InvalidArgument`] when the table misses an
    /// index.
    pub fn update_exec_info(
        &self,
        exec: &mut ExecMessage,
        info: &ModelInfo,
        buffers: &ExecutionBuffers,
        table: &dyn BufferTable,
    ) -> Result<()> {
        match self {
            Self::Ucgo(u) => u.update_exec_info(exec, info, buffers),
            Self::Cgo(c) => c.update_exec_info(exec, table),
        }
    }
}

/// Unified CGO container
#[derive(Debug)]
pub struct UcgoInfo {
    global_id: u32,
    load_graph: LoadGraphInfo,
    exec: ExecMessage,
    kernel_names: Option<KernelNames>,
    input_map: BTreeMap<u32, u32>,
    output_map: BTreeMap<u32, u32>,
    bypass_inputs: bool,
    bypass_outputs: bool,
    _container: IonBuffer,
    _tsgd: IonBuffer,
    _allocations: Vec<IonBuffer>,
}

impl UcgoInfo {
    /// Parse a unified container for the feature maps of `info`
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::MalformedBinary`] for a short or inconsistent
    /// container, a missing TSGD, an import record without a matching
    /// feature map or of the wrong size.
    #[allow(clippy::too_many_lines)]
    pub fn parse(data: &[u8], info: &ModelInfo) -> Result<Self> {
        if data.len() <= UCGO_HEADER_SIZE {
            return Err(AccelError::malformed(format!(
                "UCGO of {} bytes has no records",
                data.len()
            )));
        }
        let header: UnifiedDspCgo = read_record(data, 0)?;
        if header.cgo_magic != UCGO_CGO_MAGIC || header.magic != UCGO_HEADER_MAGIC {
            return Err(AccelError::malformed(format!(
                "UCGO magic {:#x}/{:#x}",
                header.cgo_magic, header.magic
            )));
        }

        let container = IonBuffer::from_bytes("ucgo", data)?;
        let meta = (header.num_list as usize)
            .checked_mul(MEM_INFO_SIZE)
            .and_then(|n| n.checked_add(UCGO_HEADER_SIZE))
            .filter(|&n| n <= data.len())
            .ok_or_else(|| {
                AccelError::malformed(format!("{} records do not fit", header.num_list))
            })?;
        debug!(
            "UCGO unique_id {:#x} total_size {} records {}",
            header.unique_id, header.total_size, header.num_list
        );

        let mut params = Vec::new();
        let mut allocations = Vec::new();
        let mut kernels = Vec::new();
        let mut input_map = BTreeMap::new();
        let mut output_map = BTreeMap::new();
        let mut tsgd: Option<DspMemInfo> = None;
        let (mut bypass_inputs, mut bypass_outputs) = (false, false);

        for i in 0..header.num_list as usize {
            let rec: DspMemInfo = read_record(data, UCGO_HEADER_SIZE + i * MEM_INFO_SIZE)?;
            let data_at = meta + rec.data_offset as usize;
            debug!(
                "record[{i}] mem_type {} load_type {} index {} size {} mapping {}",
                rec.mem_type, rec.load_type, rec.index, rec.size, rec.mapping_index
            );

            if rec.mem_type == mem_type::DSP_GRAPH_BIN || rec.mem_type == mem_type::CMDQ_BIN {
                tsgd = Some(rec);
                continue;
            }

            if rec.mem_type == mem_type::KERNEL_BIN_STR {
                let tail = data.get(data_at..).unwrap_or_default();
                let name = CStr::from_bytes_until_nul(tail)
                    .map_err(|_| AccelError::malformed(format!("kernel name {i} is not terminated")))?;
                kernels.push(name.to_string_lossy().into_owned());
                match tsgd.map(|t| t.mem_type) {
                    Some(mem_type::CMDQ_BIN) => {}
                    Some(_) => continue,
                    None => {
                        return Err(AccelError::malformed(format!(
                            "kernel name {i} precedes the TSGD"
                        )))
                    }
                }
            }

            let mut fd = VALUE_FD_INIT;
            let mut offset = 0;
            let mut mem = ofi_mem::ION;
            match rec.load_type {
                load_type::ALLOC_LOAD => {
                    payload(data, data_at, rec.size as usize)?;
                    fd = container.raw_fd();
                    offset = data_at as u32;
                }
                load_type::ALLOC | load_type::ALLOC_ZERO => {
                    let buffer = IonBuffer::allocate("dsp-param", rec.size as usize)?;
                    fd = buffer.raw_fd();
                    allocations.push(buffer);
                }
                load_type::IMPORT => {
                    let (maps, map) = match rec.mem_type {
                        mem_type::INPUT => (&info.inputs, &mut input_map),
                        mem_type::OUTPUT => (&info.outputs, &mut output_map),
                        other => {
                            return Err(AccelError::malformed(format!(
                                "record {i}: import of mem type {other}"
                            )))
                        }
                    };
                    let fm: &FeatureMap = maps.get(rec.index as usize).ok_or_else(|| {
                        AccelError::malformed(format!(
                            "record {i}: no feature map {} to import",
                            rec.index
                        ))
                    })?;
                    if fm.shape.size() != u64::from(rec.size) {
                        return Err(AccelError::malformed(format!(
                            "record {i}: shape {} does not match size {}",
                            fm.shape, rec.size
                        )));
                    }
                    map.insert(fm.buffer_index, rec.mapping_index as u32);
                }
                load_type::BYPASS => {
                    mem = ofi_mem::NONE;
                    match rec.mem_type {
                        mem_type::INPUT => bypass_inputs = true,
                        mem_type::OUTPUT => bypass_outputs = true,
                        _ => {}
                    }
                }
                other => {
                    return Err(AccelError::malformed(format!("record {i}: load type {other}")));
                }
            }

            params.push(fill_param(
                rec.mapping_index as u32,
                mem,
                rec.mem_type,
                rec.size,
                fd,
                offset,
            ));
        }

        let tsgd_rec = tsgd.ok_or_else(|| AccelError::malformed("no TSGD record in UCGO"))?;
        let tsgd_bytes = payload(data, meta + tsgd_rec.data_offset as usize, tsgd_rec.size as usize)?;
        let tsgd_buffer = IonBuffer::from_bytes("tsgd", tsgd_bytes)?;
        let tsgd_param = fill_param(
            0,
            ofi_mem::ION,
            tsgd_rec.mem_type,
            tsgd_rec.size,
            tsgd_buffer.raw_fd(),
            0,
        );

        let uid = match header.unique_id as u16 {
            UCGO_UID_INVALID => 0,
            uid => uid,
        };
        let global_id = dsp_global_id(info.operator_list_id, uid);
        let kernel_names = parse_kernel_bin(&kernels);
        let load_graph = ucgo_load_graph(global_id, tsgd_param, &params, kernels.len() as u32)?;
        let exec = ucgo_exec_message(global_id, &load_graph, &input_map, &output_map)?;

        Ok(Self {
            global_id,
            load_graph,
            exec,
            kernel_names,
            input_map,
            output_map,
            bypass_inputs,
            bypass_outputs,
            _container: container,
            _tsgd: tsgd_buffer,
            _allocations: allocations,
        })
    }

    /// Param index of input buffer `buffer_index`
    pub fn input_mapping(&self, buffer_index: u32) -> Option<u32> {
        self.input_map.get(&buffer_index).copied()
    }

    /// Param index of output buffer `buffer_index`
    pub fn output_mapping(&self, buffer_index: u32) -> Option<u32> {
        self.output_map.get(&buffer_index).copied()
    }

    fn update_exec_info(
        &self,
        exec: &mut ExecMessage,
        info: &ModelInfo,
        buffers: &ExecutionBuffers,
    ) -> Result<()> {
        for (maps, map, memories) in [
            (&info.inputs, &self.input_map, &buffers.inputs),
            (&info.outputs, &self.output_map, &buffers.outputs),
        ] {
            for (i, (fm, memory)) in maps.iter().zip(memories).enumerate() {
                let mapping = map.get(&fm.buffer_index).copied().ok_or_else(|| {
                    AccelError::malformed(format!(
                        "no param for buffer {} (feature map {i})",
                        fm.buffer_index
                    ))
                })?;
                let param = exec.param_mut(mapping)?;
                param.mem.size = memory.size();
                param.mem.fd = memory.fd();
                debug!("exec param[{mapping}] size {} fd {}", memory.size(), memory.fd());
            }
        }
        Ok(())
    }
}

fn populated(param: &OfiParam) -> bool {
    param.idx != MAPPING_INDEX_INVALID && param.param_type != u32::from(mem_type::KERNEL_BIN_STR)
}

fn ucgo_load_graph(
    global_id: u32,
    tsgd: OfiParam,
    params: &[OfiParam],
    kernel_count: u32,
) -> Result<LoadGraphInfo> {
    let count = params.len();
    let mut table = vec![OfiParam::default(); count + 1];
    table[0] = tsgd;

    let mut next_free = 1;
    for param in params.iter().filter(|p| populated(p)) {
        let slot = param.idx as usize + 1;
        let entry = table.get_mut(slot).ok_or_else(|| {
            AccelError::malformed(format!("mapping index {} beyond {count} params", param.idx))
        })?;
        *entry = *param;
        next_free += 1;
    }
    // Unmapped buffers and kernel names go after the mapped ones
    for param in params.iter().filter(|p| !populated(p)) {
        let entry = table.get_mut(next_free).ok_or_else(|| {
            AccelError::malformed(format!("param table overflow at {next_free}"))
        })?;
        *entry = *param;
        next_free += 1;
    }

    Ok(LoadGraphInfo {
        header: OfiLoadGraphHeader {
            global_id,
            n_tsgd: NUM_TSGD,
            n_param: count as u32,
            n_kernel: kernel_count,
        },
        params: table,
    })
}

fn ucgo_exec_message(
    global_id: u32,
    load: &LoadGraphInfo,
    input_map: &BTreeMap<u32, u32>,
    output_map: &BTreeMap<u32, u32>,
) -> Result<ExecMessage> {
    let params = load.params[1..]
        .iter()
        .map(|p| {
            let mut p = *p;
            p.mem.fd = VALUE_FD_INIT;
            p
        })
        .collect::<Vec<_>>();
    let mut exec = ExecMessage {
        header: OfiExecHeader {
            global_id,
            n_update_param: params.len() as u32,
        },
        params,
    };

    for (map, kind) in [(input_map, mem_type::INPUT), (output_map, mem_type::OUTPUT)] {
        for &mapping in map.values() {
            *exec.param_mut(mapping)? =
                fill_param(mapping, ofi_mem::ION, kind, u32::MAX, VALUE_FD_INIT, 0);
        }
    }
    Ok(exec)
}

/// CGO graph
#[derive(Debug)]
pub struct CgoInfo {
    global_id: u32,
    load_graph: LoadGraphInfo,
    exec: ExecMessage,
    kernel_names: Option<KernelNames>,
    _tsgd: IonBuffer,
}

impl CgoInfo {
    /// Copy the TSGD and lay out `param_count` empty params
    ///
    /// # Errors
    ///
    /// Returns an error for an empty TSGD or if the copy cannot be allocated.
    pub fn new<S: AsRef<str>>(
        tsgd: &[u8],
        lib_names: &[S],
        operator_list_id: u64,
        param_count: usize,
    ) -> Result<Self> {
        let global_id = dsp_global_id(operator_list_id, UCGO_UID_INVALID);
        let tsgd_buffer = IonBuffer::from_bytes("tsgd", tsgd)?;
        debug!("copied TSGD: {} bytes, fd {}", tsgd.len(), tsgd_buffer.raw_fd());

        let mut params = Vec::with_capacity(param_count + 1);
        params.push(fill_param(
            0,
            ofi_mem::ION,
            mem_type::DSP_GRAPH_BIN,
            tsgd.len() as u32,
            tsgd_buffer.raw_fd(),
            0,
        ));
        params.extend(
            (0..param_count)
                .map(|_| fill_param(0, ofi_mem::ION, mem_type::EMPTY, 0, VALUE_FD_INIT, 0)),
        );

        Ok(Self {
            global_id,
            load_graph: LoadGraphInfo {
                header: OfiLoadGraphHeader {
                    global_id,
                    n_tsgd: NUM_TSGD,
                    n_param: param_count as u32,
                    n_kernel: lib_names.len() as u32,
                },
                params,
            },
            exec: ExecMessage {
                header: OfiExecHeader {
                    global_id,
                    n_update_param: param_count as u32,
                },
                params: vec![empty_param(); param_count],
            },
            kernel_names: parse_kernel_bin(lib_names),
            _tsgd: tsgd_buffer,
        })
    }

    /// Params after the TSGD
    pub fn param_count(&self) -> usize {
        self.exec.params.len()
    }

    /// Type and size param `index` after the tensor called `name`
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::MalformedBinary`] when `index` is not a param.
    pub fn update_load_param(&mut self, name: &str, index: u32, shape: Shape) -> Result<()> {
        if index as usize >= self.param_count() {
            return Err(AccelError::malformed(format!(
                "load param index {index} beyond {} params",
                self.param_count()
            )));
        }
        let kind = param_type_for(name);
        debug!("load param {index} ({name}) type {kind} shape {shape}");
        let param = fill_param(index, ofi_mem::ION, kind, shape.size() as u32, VALUE_FD_INIT, 0);
        self.load_graph.params[index as usize + 1] = param;
        self.exec.params[index as usize] = param;
        Ok(())
    }

    fn update_exec_info(&self, exec: &mut ExecMessage, table: &dyn BufferTable) -> Result<()> {
        for i in 0..self.param_count() as u32 {
            let buffer = table.get(i).ok_or_else(|| {
                AccelError::invalid_argument(format!("buffer table has no entry {i}"))
            })?;
            let param = exec.param_mut(i)?;
            param.mem.fd = buffer.fd;
            param.mem.size = buffer.size;
            debug!("cgo exec param[{i}] size {} fd {}", buffer.size, buffer.fd);
        }
        Ok(())
    }
}

/// Param type of a CGO tensor, from its name
pub fn param_type_for(name: &str) -> u16 {
    if name.contains("input_") {
        mem_type::INPUT
    } else if name.contains("output_") {
        mem_type::OUTPUT
    } else if name.contains(SHAPE_INFO_NAME) {
        mem_type::CUSTOM
    } else if name.contains("TEMP") {
        mem_type::TEMP
    } else {
        mem_type::SCALAR
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Memory;
    use crate::model::{BufferRef, VecBufferTable};

    fn fm(buffer_index: u32, width: u32) -> FeatureMap {
        FeatureMap {
            shape: Shape::new(1, 1, 1, width, 1),
            buffer_index,
            bpp: 8,
        }
    }

    fn record(mem: u16, load: u16, index: u32, size: u32, data_offset: u32, mapping: i32) -> DspMemInfo {
        DspMemInfo {
            mem_type: mem,
            load_type: load,
            index,
            size,
            offset: 0,
            data_offset,
            mapping_index: mapping,
            reserved: [0; 8],
        }
    }

    fn container(uid: u32, records: &[DspMemInfo], data: &[u8]) -> Vec<u8> {
        let header = UnifiedDspCgo {
            cgo_magic: UCGO_CGO_MAGIC,
            magic: UCGO_HEADER_MAGIC,
            unique_id: uid,
            num_list: records.len() as u32,
            total_size: (UCGO_HEADER_SIZE + records.len() * MEM_INFO_SIZE + data.len()) as u32,
            ..UnifiedDspCgo::default()
        };
        let mut out = bytemuck::bytes_of(&header).to_vec();
        out.extend_from_slice(bytemuck::cast_slice(records));
        out.extend_from_slice(data);
        out
    }

    /// TSGD at 0..8, weights at 8..24, kernel name at 24
    fn sample() -> (Vec<u8>, ModelInfo) {
        let mut data = vec![0xA5u8; 8];
        data.extend_from_slice(&[7u8; 16]);
        data.extend_from_slice(b"libdsp_kernel.so\0");
        let records = [
            record(mem_type::DSP_GRAPH_BIN, load_type::ALLOC_LOAD, 0, 8, 0, -1),
            record(mem_type::INPUT, load_type::IMPORT, 0, 16, 0, 0),
            record(mem_type::OUTPUT, load_type::IMPORT, 0, 32, 0, 1),
            record(mem_type::WEIGHT, load_type::ALLOC_LOAD, 0, 16, 8, 2),
            record(mem_type::TEMP, load_type::ALLOC_ZERO, 0, 64, 0, -1),
            record(mem_type::KERNEL_BIN_STR, load_type::BYPASS, 0, 17, 24, -1),
        ];
        let mut info = ModelInfo::new(0x0100_0000_0012_0000, 0x0012_0000, Vec::new());
        info.inputs = vec![fm(4, 16)];
        info.outputs = vec![fm(5, 32)];
        (container(3, &records, &data), info)
    }

    #[test]
    fn kernel_names_are_length_prefixed() {
        let names = parse_kernel_bin(&["ab", "xyz"]).unwrap();
        assert_eq!(names.count, 2);
        assert_eq!(&names.table[0..4], &3u32.to_ne_bytes());
        assert_eq!(&names.table[4..8], &4u32.to_ne_bytes());
        assert_eq!(&names.table[8..], b"ab\0xyz\0");
        assert!(parse_kernel_bin::<&str>(&[]).is_none());
    }

    #[test]
    fn ucgo_builds_param_tables() {
        let (bytes, mut info) = sample();
        let ucgo = UcgoInfo::parse(&bytes, &info).unwrap();
        assert_eq!(ucgo.global_id, 0x0012_0003);

        let load = &ucgo.load_graph;
        assert_eq!(load.header.n_param, 4);
        assert_eq!(load.header.n_kernel, 1);
        assert_eq!(load.params[0].param_type, u32::from(mem_type::DSP_GRAPH_BIN));
        assert_eq!(load.params[0].mem.size, 8);
        assert_eq!(load.params[1].param_type, u32::from(mem_type::INPUT));
        assert_eq!(load.params[2].param_type, u32::from(mem_type::OUTPUT));
        assert_eq!(load.params[3].param_type, u32::from(mem_type::WEIGHT));
        let meta = (UCGO_HEADER_SIZE + 6 * MEM_INFO_SIZE) as u32;
        assert_eq!(load.params[3].mem.offset, meta + 8);
        // Unmapped temp goes after the mapped params
        assert_eq!(load.params[4].param_type, u32::from(mem_type::TEMP));
        assert_eq!(load.params[4].idx, MAPPING_INDEX_INVALID);

        assert_eq!(ucgo.input_mapping(4), Some(0));
        assert_eq!(ucgo.output_mapping(5), Some(1));

        let exec = &ucgo.exec;
        assert_eq!(exec.header.n_update_param, 4);
        assert_eq!(exec.params[0].mem.size, u32::MAX);
        assert!(exec.params.iter().all(|p| p.mem.fd == VALUE_FD_INIT));

        let bin = DspBinInfo::Ucgo(ucgo);
        bin.apply_to(&mut info);
        assert_eq!(info.exec_msg_size as usize, EXEC_HEADER_SIZE + 4 * OFI_PARAM_SIZE);
        assert_eq!(info.kernel_names.as_ref().unwrap().count, 1);
        assert_eq!(LoadGraphInfo::from_bytes(&info.model).unwrap(), *bin.load_graph());
    }

    #[test]
    fn ucgo_exec_info_takes_request_fds() {
        let (bytes, info) = sample();
        let bin = DspBinInfo::Ucgo(UcgoInfo::parse(&bytes, &info).unwrap());
        let buffers = ExecutionBuffers {
            inputs: vec![Memory::Ion { fd: 40, addr: 0x1000, size: 16 }],
            outputs: vec![Memory::Ion { fd: 41, addr: 0x2000, size: 32 }],
            exec_info: None,
        };
        let mut exec = bin.exec_template().clone();
        bin.update_exec_info(&mut exec, &info, &buffers, &VecBufferTable::default())
            .unwrap();
        assert_eq!((exec.params[0].mem.fd, exec.params[0].mem.size), (40, 16));
        assert_eq!((exec.params[1].mem.fd, exec.params[1].mem.size), (41, 32));
        assert_eq!(exec.params[2].mem.fd, VALUE_FD_INIT);

        let mut ion = IonBuffer::allocate("exec", exec.size()).unwrap();
        exec.write_into(&mut ion).unwrap();
        assert_eq!(ion.as_slice(), exec.to_bytes().as_slice());
    }

    #[test]
    fn ucgo_without_tsgd_fails() {
        let records = [record(mem_type::TEMP, load_type::ALLOC, 0, 8, 0, 0)];
        let bytes = container(0, &records, &[]);
        let info = ModelInfo::new(1, 0x10_0000, Vec::new());
        assert!(matches!(
            UcgoInfo::parse(&bytes, &info),
            Err(AccelError::MalformedBinary { .. })
        ));
    }

    #[test]
    fn ucgo_import_size_must_match_shape() {
        let records = [
            record(mem_type::CMDQ_BIN, load_type::ALLOC_LOAD, 0, 4, 0, -1),
            record(mem_type::INPUT, load_type::IMPORT, 0, 99, 0, 0),
        ];
        let bytes = container(0, &records, &[1, 2, 3, 4]);
        let mut info = ModelInfo::new(1, 0x10_0000, Vec::new());
        info.inputs = vec![fm(0, 16)];
        assert!(UcgoInfo::parse(&bytes, &info).is_err());
    }

    #[test]
    fn ucgo_kernel_name_before_tsgd_fails() {
        let records = [
            record(mem_type::KERNEL_BIN_STR, load_type::BYPASS, 0, 2, 4, -1),
            record(mem_type::CMDQ_BIN, load_type::ALLOC_LOAD, 0, 4, 0, -1),
        ];
        let bytes = container(0, &records, b"\x01\x02\x03\x04k\0");
        let info = ModelInfo::new(1, 0x10_0000, Vec::new());
        assert!(UcgoInfo::parse(&bytes, &info).is_err());
    }

    #[test]
    fn ucgo_bypass_drops_feature_maps() {
        let records = [
            record(mem_type::CMDQ_BIN, load_type::ALLOC_LOAD, 0, 4, 0, -1),
            record(mem_type::INPUT, load_type::BYPASS, 0, 16, 0, 0),
            record(mem_type::KERNEL_BIN_STR, load_type::BYPASS, 0, 2, 4, -1),
        ];
        let bytes = container(UCGO_UID_INVALID.into(), &records, b"\x01\x02\x03\x04k\0");
        let mut info = ModelInfo::new(1, 0x0034_0000, Vec::new());
        info.inputs = vec![fm(0, 16)];
        info.outputs = vec![fm(1, 16)];
        let bin = DspBinInfo::Ucgo(UcgoInfo::parse(&bytes, &info).unwrap());
        // uid 0xFFFF is sent as 0
        assert_eq!(bin.global_id(), 0x0034_0000);
        // CMDQ keeps the kernel name as a param
        assert_eq!(bin.load_graph().header.n_param, 2);
        assert_eq!(bin.load_graph().params[1].mem.mem_type, ofi_mem::NONE);

        bin.apply_to(&mut info);
        assert!(info.inputs.is_empty());
        assert_eq!(info.outputs.len(), 1);
    }

    #[test]
    fn ucgo_rejects_bad_magic_and_short_data() {
        let (mut bytes, info) = sample();
        assert!(UcgoInfo::parse(&bytes[..UCGO_HEADER_SIZE], &info).is_err());
        bytes[0] ^= 0xFF;
        assert!(UcgoInfo::parse(&bytes, &info).is_err());
    }

    #[test]
    fn cgo_types_params_by_name() {
        assert_eq!(param_type_for("input_0"), mem_type::INPUT);
        assert_eq!(param_type_for("output_1"), mem_type::OUTPUT);
        assert_eq!(param_type_for("Shape Infos Buffer"), mem_type::CUSTOM);
        assert_eq!(param_type_for("TEMP_3"), mem_type::TEMP);
        assert_eq!(param_type_for("alpha"), mem_type::SCALAR);
    }

    #[test]
    fn cgo_lays_out_and_updates_params() {
        let mut cgo = CgoInfo::new(&[1, 2, 3], &["libk.so"], 0x00AB_0000, 3).unwrap();
        assert_eq!(cgo.global_id, 0x00AB_FFFF);
        assert_eq!(cgo.load_graph.params.len(), 4);
        assert_eq!(cgo.load_graph.header.n_kernel, 1);
        assert_eq!(cgo.load_graph.params[2].param_type, u32::from(mem_type::EMPTY));

        cgo.update_load_param("input_0", 0, Shape::new(1, 1, 2, 2, 1)).unwrap();
        cgo.update_load_param("output_0", 2, Shape::new(1, 1, 1, 8, 1)).unwrap();
        assert!(cgo.update_load_param("input_9", 3, Shape::default()).is_err());
        assert_eq!(cgo.load_graph.params[1].param_type, u32::from(mem_type::INPUT));
        assert_eq!(cgo.load_graph.params[1].mem.size, 4);
        assert_eq!(cgo.exec.params[2].param_type, u32::from(mem_type::OUTPUT));

        let table = VecBufferTable::new(vec![
            BufferRef { fd: 10, addr: 0x1000, size: 4 },
            BufferRef { fd: 11, addr: 0x2000, size: 1 },
            BufferRef { fd: 12, addr: 0x3000, size: 8 },
        ]);
        let bin = DspBinInfo::Cgo(cgo);
        let mut exec = bin.exec_template().clone();
        let info = ModelInfo::new(1, 0x00AB_0000, Vec::new());
        bin.update_exec_info(&mut exec, &info, &ExecutionBuffers::default(), &table)
            .unwrap();
        assert_eq!((exec.params[2].mem.fd, exec.params[2].mem.size), (12, 8));

        let short = VecBufferTable::new(vec![BufferRef { fd: 10, addr: 0x1000, size: 4 }]);
        assert!(bin
            .update_exec_info(&mut exec, &info, &ExecutionBuffers::default(), &short)
            .is_err());
    }

    #[test]
    fn cgo_name_detection() {
        use crate::backend::Accelerator;
        assert!(is_cgo_binary(&Binary::new("net_TSGD.bin", Accelerator::Dsp, vec![0u8])));
        assert!(!is_cgo_binary(&Binary::new("net.ucgo", Accelerator::Dsp, vec![0u8])));
    }
}
