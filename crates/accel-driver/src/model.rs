//! Model collaborator types
//!
//! Upstream model-building code hands the drivers an [`OperatorList`]: an
//! arena of operators and tensors that refer to each other by index. At
//! prepare/execute time an [`ExecutableOperatorList`] or [`ExecuteRequest`]
//! supplies the [`BufferTable`] that resolves tensor buffer indices to memory.

use crate::backend::Accelerator;
use crate::error::{AccelError, Result};
use crate::memory::Memory;
use bytes::Bytes;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// NCHW tensor shape with element size
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Shape {
    /// Batch
    pub number: u32,

    /// Channels
    pub channel: u32,

    /// Rows
    pub height: u32,

    /// Columns
    pub width: u32,

    /// Bytes per element
    pub type_size: u32,
}

impl Shape {
    /// Create a shape
    pub const fn new(number: u32, channel: u32, height: u32, width: u32, type_size: u32) -> Self {
        Self {
            number,
            channel,
            height,
            width,
            type_size,
        }
    }

    /// Size in bytes
    pub const fn size(&self) -> u64 {
        self.number as u64
            * self.channel as u64
            * self.height as u64
            * self.width as u64
            * self.type_size as u64
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{}x{}x{} ({}B)",
            self.number, self.channel, self.height, self.width, self.type_size
        )
    }
}

/// Index of a tensor in its list's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorIndex(pub usize);

/// Index of an operator in its list's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperatorIndex(pub usize);

/// One tensor of an operator list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    /// Name from the model; DSP CGO binaries type their params by it
    pub name: String,

    /// Shape
    pub shape: Shape,

    /// Index into the buffer table
    pub buffer_index: u32,

    /// Constant tensors are baked into the binary and never bound
    pub is_const: bool,

    /// Operator writing this tensor
    pub producer: Option<OperatorIndex>,

    /// Operators reading this tensor
    pub consumers: Vec<OperatorIndex>,
}

impl Tensor {
    /// Feature-map tensor
    pub fn feature_map(name: impl Into<String>, shape: Shape, buffer_index: u32) -> Self {
        Self {
            name: name.into(),
            shape,
            buffer_index,
            is_const: false,
            producer: None,
            consumers: Vec::new(),
        }
    }
}

/// Compiled binary of an operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    /// Name; a DSP binary named `*TSGD*` is a CGO graph
    pub name: String,

    /// Hardware this fragment runs on
    pub accelerator: Accelerator,

    /// Payload
    pub data: Bytes,
}

impl Binary {
    /// Create a binary
    pub fn new(name: impl Into<String>, accelerator: Accelerator, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            accelerator,
            data: data.into(),
        }
    }
}

/// Placement of one fragment of a unified operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedBinaryOption {
    /// Fragment's hardware
    pub target: Accelerator,

    /// First fragment of its causal chain
    pub start: bool,

    /// Last fragment of its causal chain
    pub end: bool,

    /// Tensor ids the fragment is connected to
    pub connections: Vec<i32>,
}

/// One compiled operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operator {
    /// Id within the list, at most 255
    pub uid: u64,

    /// Name
    pub name: String,

    /// Hardware the operator was compiled for
    pub accelerator: Accelerator,

    /// Binaries; the first one is loaded
    pub binaries: Vec<Binary>,

    /// Input tensors
    pub inputs: Vec<TensorIndex>,

    /// Output tensors
    pub outputs: Vec<TensorIndex>,

    /// DSP kernel library names
    pub lib_names: Vec<String>,

    /// Outputs are bound to one contiguous buffer
    pub ofm_bound: bool,

    /// Execute on the async worker (DSP only)
    pub async_exec: bool,

    /// Fragment placement for a unified operator
    pub unified_options: Vec<UnifiedBinaryOption>,
}

impl Operator {
    /// Operator with no tensors or binaries
    pub fn new(uid: u64, name: impl Into<String>, accelerator: Accelerator) -> Self {
        Self {
            uid,
            name: name.into(),
            accelerator,
            binaries: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            lib_names: Vec::new(),
            ofm_bound: false,
            async_exec: false,
            unified_options: Vec::new(),
        }
    }

    /// First binary
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::InvalidArgument`] if the operator has none.
    pub fn first_binary(&self) -> Result<&Binary> {
        self.binaries.first().ok_or_else(|| {
            AccelError::invalid_argument(format!("operator {} has no binary", self.name))
        })
    }
}

/// Operators of one subgraph plus list-level preferences
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OperatorList {
    /// List id
    pub id: u64,

    /// Operator arena
    pub operators: Vec<Operator>,

    /// Tensor arena
    pub tensors: Vec<Tensor>,

    /// 0 normal, 1 boost, 2 boost on execute, 3 boost blocking
    pub pref_mode: u32,

    /// Request priority
    pub priority: u32,

    /// Target latency in microseconds
    pub latency: u32,

    /// Bound core, `0xFFFFFFFF` for none
    pub core_affinity: u32,

    /// Tiles per buffer
    pub tile_num: u32,

    /// Preset scenario id
    pub preset_id: i32,
}

impl OperatorList {
    /// Empty list with default preferences
    pub fn new(id: u64) -> Self {
        Self {
            id,
            core_affinity: vs4l_abi::param::BOUND_NA,
            tile_num: 1,
            ..Self::default()
        }
    }

    /// Add a tensor and return its index
    pub fn add_tensor(&mut self, tensor: Tensor) -> TensorIndex {
        self.tensors.push(tensor);
        TensorIndex(self.tensors.len() - 1)
    }

    /// Add an operator, wiring producer/consumer links of its tensors
    pub fn add_operator(&mut self, operator: Operator) -> OperatorIndex {
        let index = OperatorIndex(self.operators.len());
        for t in &operator.inputs {
            if let Some(tensor) = self.tensors.get_mut(t.0) {
                tensor.consumers.push(index);
            }
        }
        for t in &operator.outputs {
            if let Some(tensor) = self.tensors.get_mut(t.0) {
                tensor.producer = Some(index);
            }
        }
        self.operators.push(operator);
        index
    }

    /// Tensor by index
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::InvalidArgument`] for an index outside the arena.
    pub fn tensor(&self, index: TensorIndex) -> Result<&Tensor> {
        self.tensors
            .get(index.0)
            .ok_or_else(|| AccelError::invalid_argument(format!("tensor {} out of range", index.0)))
    }

    /// Number of operators
    pub fn len(&self) -> usize {
        self.operators.len()
    }

    /// True for a list without operators
    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }
}

/// Physical buffer behind a buffer-table index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRef {
    /// dma-buf fd
    pub fd: RawFd,

    /// Mapped address
    pub addr: u64,

    /// Size in bytes
    pub size: u32,
}

impl BufferRef {
    /// As an ION memory handle
    pub const fn memory(&self) -> Memory {
        Memory::Ion {
            fd: self.fd,
            addr: self.addr,
            size: self.size,
        }
    }
}

/// Index → buffer lookup owned by the caller
pub trait BufferTable: Send + Sync + std::fmt::Debug {
    /// Buffer at `index`
    fn get(&self, index: u32) -> Option<BufferRef>;

    /// Number of entries
    fn len(&self) -> usize;

    /// True when empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Buffer table backed by a vector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VecBufferTable {
    buffers: Vec<BufferRef>,
}

impl VecBufferTable {
    /// Table over `buffers`
    pub fn new(buffers: Vec<BufferRef>) -> Self {
        Self { buffers }
    }

    /// Append a buffer, returning its index
    #[allow(clippy::cast_possible_truncation)]
    pub fn push(&mut self, buffer: BufferRef) -> u32 {
        self.buffers.push(buffer);
        (self.buffers.len() - 1) as u32
    }
}

impl BufferTable for VecBufferTable {
    fn get(&self, index: u32) -> Option<BufferRef> {
        self.buffers.get(index as usize).copied()
    }

    fn len(&self) -> usize {
        self.buffers.len()
    }
}

/// Buffers bound to an operator list for prepare
#[derive(Debug, Clone)]
pub struct ExecutableOperatorList {
    /// Executable list id
    pub id: u64,

    /// Operator list it binds
    pub operator_list_id: u64,

    /// Buffers
    pub buffer_table: Arc<dyn BufferTable>,
}

/// One execution of an operator list
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    /// Operator list to run
    pub operator_list_id: u64,

    /// Executable list whose buffers to use
    pub executable_id: u64,

    /// Buffers, used when the executable list was never prepared
    pub buffer_table: Arc<dyn BufferTable>,
}

impl ExecuteRequest {
    /// Request for a prepared executable list
    pub fn for_prepared(list: &ExecutableOperatorList) -> Self {
        Self {
            operator_list_id: list.operator_list_id,
            executable_id: list.id,
            buffer_table: Arc::clone(&list.buffer_table),
        }
    }
}

/// Op id from the list id and the operator uid
///
/// Returns 0 (invalid) when the list id is 0, uses its top byte, or the uid
/// does not fit in 8 bits.
pub const fn generate_op_id(list_id: u64, uid: u64) -> u64 {
    if list_id == 0 || list_id >> 56 != 0 || uid > 0xFF {
        return 0;
    }
    list_id | uid << 56
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_size_is_product() {
        assert_eq!(Shape::new(1, 3, 224, 224, 1).size(), 150_528);
        assert_eq!(Shape::new(2, 1, 1, 10, 4).size(), 80);
        assert_eq!(Shape::default().size(), 0);
    }

    #[test]
    fn op_id_packs_uid_in_top_byte() {
        assert_eq!(generate_op_id(0x1234_0000, 2), 0x0200_0000_1234_0000);
        assert_eq!(generate_op_id(0x1234_0000, 0), 0x1234_0000);
    }

    #[test]
    fn op_id_rejects_bad_inputs() {
        assert_eq!(generate_op_id(0, 1), 0);
        assert_eq!(generate_op_id(0xFF00_0000_0000_0000, 1), 0);
        assert_eq!(generate_op_id(0x10, 256), 0);
    }

    #[test]
    fn add_operator_links_tensors() {
        let mut list = OperatorList::new(0x10_0000);
        let a = list.add_tensor(Tensor::feature_map("in", Shape::new(1, 1, 1, 4, 1), 0));
        let b = list.add_tensor(Tensor::feature_map("out", Shape::new(1, 1, 1, 4, 1), 1));
        let mut op = Operator::new(0, "conv", Accelerator::Npu);
        op.inputs.push(a);
        op.outputs.push(b);
        let idx = list.add_operator(op);

        assert_eq!(list.tensor(a).unwrap().consumers, vec![idx]);
        assert_eq!(list.tensor(b).unwrap().producer, Some(idx));
        assert!(list.tensor(TensorIndex(9)).is_err());
    }

    #[test]
    fn vec_buffer_table_lookup() {
        let mut table = VecBufferTable::default();
        let i = table.push(BufferRef { fd: 7, addr: 0x1000, size: 64 });
        assert_eq!(table.get(i).unwrap().fd, 7);
        assert!(table.get(5).is_none());
        assert_eq!(table.len(), 1);
    }
}
