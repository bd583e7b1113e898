//! Subgraph lifecycle on top of the device link
//!
//! A user driver owns the registry `operator_list_id → sessions` for one
//! accelerator and walks operator lists through
//!
//! ```text
//!   open_subgraph ──▶ prepare_subgraph* ──▶ execute_subgraph* ──▶ close_subgraph
//! ```
//!
//! [`AcceleratorUserDriver`] holds everything the NPU and DSP drivers share;
//! the per-accelerator part (building a [`ModelInfo`] from an operator and
//! binding buffers for a request) is an [`AcceleratorOps`] implementation.
//! [`UnifiedUserDriver`] splits mixed NPU/DSP operators over both.

mod dsp;
mod npu;
mod unified;

pub use dsp::{DspOps, DspUserDriver};
pub use npu::{NpuOps, NpuUserDriver};
pub use unified::UnifiedUserDriver;

use crate::backend::Accelerator;
use crate::error::{AccelError, Result};
use crate::link::DeviceLink;
use crate::memory::{is_valid_ion_buffer, IonBuffer, Memory};
use crate::model::{
    generate_op_id, BufferTable, ExecutableOperatorList, ExecuteRequest, Operator, OperatorList,
    Shape, TensorIndex,
};
use crate::perf::ModePreference;
use crate::session::{ExecutionBuffers, FeatureMap, ModelInfo, SessionOptions};
use crate::worker::{AsyncExecutionWorker, ExecuteJob, JobRunner};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hardware cell both accelerators align input formats to
pub const CELL_ALIGN: Shape = Shape::new(3, 1, 1, 1, 3);

/// Lifecycle of a user driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    /// Created, link not initialized
    Uninitialized,
    /// Accepting subgraphs
    Initialized,
    /// Torn down; `initialize` brings it back
    Shutdowned,
}

/// Subgraph lifecycle shared by every driver
pub trait UserDriver: Send + Sync + fmt::Debug {
    /// Initialize the device link; a no-op when already initialized
    ///
    /// # Errors
    ///
    /// Returns the link's init error.
    fn initialize(&self) -> Result<()>;

    /// Open every operator of `list` and register them under `list_id`
    ///
    /// `unified_id` ties the halves of a unified operator together; 0 means
    /// each op is its own unified id.
    ///
    /// # Errors
    ///
    /// Fails on a registered `list_id` or on any operator that cannot be
    /// loaded. Sessions opened before the failure are closed again.
    fn open_subgraph(&self, list: &OperatorList, list_id: u64, unified_id: u64) -> Result<()>;

    /// Bind the buffers of `executable` to request slots
    ///
    /// # Errors
    ///
    /// Fails on an unknown list, an invalid buffer or a PREPARE error.
    fn prepare_subgraph(&self, executable: &ExecutableOperatorList) -> Result<()>;

    /// Run one request over every operator of the list
    ///
    /// # Errors
    ///
    /// Fails on an unknown list or the first failing operator.
    fn execute_subgraph(&self, request: &ExecuteRequest) -> Result<()>;

    /// Close every session of `list_id` and forget it
    ///
    /// # Errors
    ///
    /// Returns not found for an unknown id without touching the device,
    /// otherwise the first close failure.
    fn close_subgraph(&self, list_id: u64) -> Result<()>;

    /// Close everything and shut the link down; a no-op once shut down
    ///
    /// # Errors
    ///
    /// Close failures are logged, not returned; the signature leaves room
    /// for drivers that can fail here.
    fn deinitialize(&self) -> Result<()>;

    /// Current lifecycle state
    fn status(&self) -> DriverStatus;
}

/// Per-accelerator steps of the lifecycle
pub trait AcceleratorOps: Send + Sync + fmt::Debug + 'static {
    /// Binary state kept for a session's lifetime
    type Binary: Send + Sync + fmt::Debug;

    /// Hardware served
    const ACCELERATOR: Accelerator;

    /// Build the session state of `op`
    ///
    /// # Errors
    ///
    /// Returns an error when the operator cannot be described to the link.
    fn load(
        list: &OperatorList,
        op: &Operator,
        list_id: u64,
        unified_id: u64,
    ) -> Result<OperatorSession<Self::Binary>>;

    /// Resolve the buffers of `session` for one executable list
    ///
    /// # Errors
    ///
    /// Returns an error for a missing or stale buffer.
    fn bind(session: &OperatorSession<Self::Binary>, table: &dyn BufferTable)
        -> Result<ExecutableOperator>;
}

/// Buffers of one session for one executable list
#[derive(Debug)]
pub struct ExecutableOperator {
    /// Request buffers
    pub buffers: ExecutionBuffers,

    /// DSP execute message behind `buffers.exec_info`
    pub exec_message: Option<Arc<IonBuffer>>,
}

impl ExecutableOperator {
    /// Operator without an execute message
    pub const fn new(buffers: ExecutionBuffers) -> Self {
        Self {
            buffers,
            exec_message: None,
        }
    }
}

/// One opened operator
#[derive(Debug)]
pub struct OperatorSession<B> {
    /// What the link was given
    pub info: ModelInfo,

    /// Executes go through the async worker
    pub async_exec: bool,

    /// Accelerator-specific binary state
    pub binary: B,

    executables: Mutex<HashMap<u64, Arc<ExecutableOperator>>>,
}

impl<B> OperatorSession<B> {
    /// Session for `info`
    pub fn new(info: ModelInfo, async_exec: bool, binary: B) -> Self {
        Self {
            info,
            async_exec,
            binary,
            executables: Mutex::new(HashMap::new()),
        }
    }

    /// Op id
    pub const fn model_id(&self) -> u64 {
        self.info.id
    }

    /// Number of executable operators bound so far
    pub fn executable_count(&self) -> usize {
        lock(&self.executables).len()
    }
}

#[derive(Debug)]
struct Subgraph<B> {
    sessions: Vec<OperatorSession<B>>,
    has_async: bool,
}

/// Op id of `op` in list `list_id`
///
/// # Errors
///
/// Returns [`AccelError::InvalidArgument`] when the pair has no valid id.
pub fn operator_id(list_id: u64, uid: u64) -> Result<u64> {
    match generate_op_id(list_id, uid) {
        0 => Err(AccelError::invalid_argument(format!(
            "no op id for list {list_id:#x} uid {uid}"
        ))),
        id => Ok(id),
    }
}

/// Feature maps of the non-constant tensors in `indices`
///
/// # Errors
///
/// Returns [`AccelError::InvalidArgument`] for an index outside the arena.
pub fn feature_maps(list: &OperatorList, indices: &[TensorIndex]) -> Result<Vec<FeatureMap>> {
    let mut maps = Vec::with_capacity(indices.len());
    for &index in indices {
        let tensor = list.tensor(index)?;
        if tensor.is_const {
            continue;
        }
        maps.push(FeatureMap {
            shape: tensor.shape,
            buffer_index: tensor.buffer_index,
            bpp: 8 * tensor.shape.type_size,
        });
    }
    Ok(maps)
}

/// Scheduling options carried by the list
pub fn session_options(list: &OperatorList) -> SessionOptions {
    SessionOptions {
        preference: ModePreference::from_pref_mode(list.pref_mode),
        priority: list.priority,
        latency: list.latency,
        bound_core: list.core_affinity,
        preset_id: list.preset_id,
    }
}

fn resolve(maps: &[FeatureMap], table: &dyn BufferTable, direction: &str) -> Result<Vec<Memory>> {
    maps.iter()
        .map(|fm| {
            let buffer = table.get(fm.buffer_index).ok_or_else(|| {
                AccelError::invalid_argument(format!(
                    "{direction} buffer index {} not in table",
                    fm.buffer_index
                ))
            })?;
            if !is_valid_ion_buffer(buffer.fd, buffer.size, buffer.addr) {
                error!("invalid {direction} ION buffer at index {}", fm.buffer_index);
                return Err(AccelError::invalid_memory(format!(
                    "{direction} buffer {} fd {}",
                    fm.buffer_index, buffer.fd
                )));
            }
            Ok(buffer.memory())
        })
        .collect()
}

/// Look up and check the input and output buffers of `info`
///
/// # Errors
///
/// Returns an error for an index missing from the table or a buffer that
/// fails the ION liveness check.
pub fn resolve_buffers(info: &ModelInfo, table: &dyn BufferTable) -> Result<ExecutionBuffers> {
    Ok(ExecutionBuffers {
        inputs: resolve(&info.inputs, table, "input")?,
        outputs: resolve(&info.outputs, table, "output")?,
        exec_info: None,
    })
}

/// User driver for one accelerator
#[derive(Debug)]
pub struct AcceleratorUserDriver<A: AcceleratorOps> {
    link: Arc<DeviceLink>,
    worker: AsyncExecutionWorker,
    status: Mutex<DriverStatus>,
    registry: Mutex<HashMap<u64, Arc<Subgraph<A::Binary>>>>,
}

impl<A: AcceleratorOps> AcceleratorUserDriver<A> {
    /// Driver over `link`
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::InvalidArgument`] when the link serves another
    /// accelerator.
    pub fn new(link: Arc<DeviceLink>) -> Result<Self> {
        if link.accelerator() != A::ACCELERATOR {
            return Err(AccelError::invalid_argument(format!(
                "{} driver given a {} link",
                A::ACCELERATOR,
                link.accelerator()
            )));
        }
        let runner: Arc<dyn JobRunner> = Arc::clone(&link) as Arc<dyn JobRunner>;
        let worker = AsyncExecutionWorker::new(runner);
        Ok(Self {
            link,
            worker,
            status: Mutex::new(DriverStatus::Uninitialized),
            registry: Mutex::new(HashMap::new()),
        })
    }

    /// Device link
    pub fn link(&self) -> &Arc<DeviceLink> {
        &self.link
    }

    /// Async execution worker
    pub const fn worker(&self) -> &AsyncExecutionWorker {
        &self.worker
    }

    /// Registered operator lists
    pub fn subgraph_count(&self) -> usize {
        lock(&self.registry).len()
    }

    /// Op ids opened for `list_id`
    pub fn model_ids(&self, list_id: u64) -> Option<Vec<u64>> {
        lock(&self.registry)
            .get(&list_id)
            .map(|g| g.sessions.iter().map(OperatorSession::model_id).collect())
    }

    fn ensure_initialized(&self) -> Result<()> {
        match *lock(&self.status) {
            DriverStatus::Initialized => Ok(()),
            other => Err(AccelError::invalid_state(format!(
                "{} user driver is {other:?}",
                A::ACCELERATOR
            ))),
        }
    }

    fn subgraph(&self, list_id: u64) -> Result<Arc<Subgraph<A::Binary>>> {
        lock(&self.registry)
            .get(&list_id)
            .cloned()
            .ok_or_else(|| AccelError::not_found("operator list", list_id))
    }

    fn rollback(&self, sessions: &[OperatorSession<A::Binary>]) {
        for session in sessions.iter().rev() {
            if let Err(e) = self.link.close_model(session.model_id()) {
                error!("rollback close of {:#x} failed: {e}", session.model_id());
            }
        }
    }

    fn close_sessions(&self, list_id: u64, graph: &Subgraph<A::Binary>) -> Result<()> {
        if graph.has_async {
            self.worker.unregister();
        }
        let mut first_error = None;
        for session in &graph.sessions {
            lock(&session.executables).clear();
            if let Err(e) = self.link.close_model(session.model_id()) {
                error!(
                    "{} close of {:#x} in list {list_id:#x} failed: {e}",
                    A::ACCELERATOR,
                    session.model_id()
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn executable(
        session: &OperatorSession<A::Binary>,
        executable_id: u64,
        table: &dyn BufferTable,
    ) -> Result<Arc<ExecutableOperator>> {
        let mut executables = lock(&session.executables);
        if let Some(existing) = executables.get(&executable_id) {
            return Ok(Arc::clone(existing));
        }
        let created = Arc::new(A::bind(session, table)?);
        debug!("executable op {executable_id:#x} created for {:#x}", session.model_id());
        executables.insert(executable_id, Arc::clone(&created));
        Ok(created)
    }

    /// Drop the executable operator bound for `executable_id`
    ///
    /// # Errors
    ///
    /// Returns not found for an unknown list.
    pub fn remove_executable(&self, list_id: u64, executable_id: u64) -> Result<()> {
        let graph = self.subgraph(list_id)?;
        for session in &graph.sessions {
            lock(&session.executables).remove(&executable_id);
        }
        Ok(())
    }
}

impl<A: AcceleratorOps> UserDriver for AcceleratorUserDriver<A> {
    fn initialize(&self) -> Result<()> {
        let mut status = lock(&self.status);
        if *status == DriverStatus::Initialized {
            debug!("{} user driver already initialized", A::ACCELERATOR);
            return Ok(());
        }
        self.link.init(self.link.config().max_request_size)?;
        *status = DriverStatus::Initialized;
        info!("{} user driver initialized", A::ACCELERATOR);
        Ok(())
    }

    fn open_subgraph(&self, list: &OperatorList, list_id: u64, unified_id: u64) -> Result<()> {
        self.ensure_initialized()?;
        if lock(&self.registry).contains_key(&list_id) {
            error!("{} operator list {list_id:#x} is already open", A::ACCELERATOR);
            return Err(AccelError::duplicate("operator list", list_id));
        }

        let options = session_options(list);
        let mut sessions: Vec<OperatorSession<A::Binary>> = Vec::with_capacity(list.len());
        for op in &list.operators {
            let opened = A::load(list, op, list_id, unified_id).and_then(|session| {
                self.link.open_model(&session.info, &options)?;
                Ok(session)
            });
            match opened {
                Ok(session) => {
                    debug!(
                        "{} op {} opened as {:#x}",
                        A::ACCELERATOR,
                        op.name,
                        session.model_id()
                    );
                    sessions.push(session);
                }
                Err(e) => {
                    error!(
                        "{} open of op {} in list {list_id:#x} failed: {e}",
                        A::ACCELERATOR,
                        op.name
                    );
                    self.rollback(&sessions);
                    return Err(e);
                }
            }
        }

        let has_async = sessions.iter().any(|s| s.async_exec);
        let graph = Arc::new(Subgraph { sessions, has_async });
        match lock(&self.registry).entry(list_id) {
            Entry::Occupied(_) => {
                self.rollback(&graph.sessions);
                return Err(AccelError::duplicate("operator list", list_id));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&graph));
            }
        }

        if has_async {
            if let Err(e) = self.worker.register() {
                lock(&self.registry).remove(&list_id);
                self.rollback(&graph.sessions);
                return Err(e);
            }
        }
        info!(
            "{} operator list {list_id:#x} opened: {} ops{}",
            A::ACCELERATOR,
            graph.sessions.len(),
            if has_async { ", async" } else { "" }
        );
        Ok(())
    }

    fn prepare_subgraph(&self, executable: &ExecutableOperatorList) -> Result<()> {
        self.ensure_initialized()?;
        let graph = self.subgraph(executable.operator_list_id)?;
        for session in &graph.sessions {
            if lock(&session.executables).contains_key(&executable.id) {
                return Err(AccelError::duplicate("executable operator", executable.id));
            }
            let bound = Arc::new(A::bind(session, executable.buffer_table.as_ref())?);
            self.link.prepare(session.model_id(), &bound.buffers)?;
            lock(&session.executables).insert(executable.id, bound);
        }
        debug!(
            "{} executable list {:#x} prepared for {:#x}",
            A::ACCELERATOR,
            executable.id,
            executable.operator_list_id
        );
        Ok(())
    }

    fn execute_subgraph(&self, request: &ExecuteRequest) -> Result<()> {
        self.ensure_initialized()?;
        let graph = self.subgraph(request.operator_list_id)?;
        for session in &graph.sessions {
            let bound =
                Self::executable(session, request.executable_id, request.buffer_table.as_ref())?;
            if session.async_exec {
                self.worker.push(ExecuteJob {
                    model_id: session.model_id(),
                    buffers: bound.buffers.clone(),
                    exec_message: bound.exec_message.clone(),
                })?;
            } else {
                self.link.execute(session.model_id(), &bound.buffers)?;
            }
        }
        Ok(())
    }

    fn close_subgraph(&self, list_id: u64) -> Result<()> {
        let graph = lock(&self.registry)
            .remove(&list_id)
            .ok_or_else(|| AccelError::not_found("operator list", list_id))?;
        self.close_sessions(list_id, &graph)?;
        info!("{} operator list {list_id:#x} closed", A::ACCELERATOR);
        Ok(())
    }

    fn deinitialize(&self) -> Result<()> {
        let mut status = lock(&self.status);
        if *status == DriverStatus::Shutdowned {
            debug!("{} user driver already shut down", A::ACCELERATOR);
            return Ok(());
        }
        let graphs: Vec<(u64, Arc<Subgraph<A::Binary>>)> =
            lock(&self.registry).drain().collect();
        for (list_id, graph) in &graphs {
            if let Err(e) = self.close_sessions(*list_id, graph) {
                warn!("{} list {list_id:#x} not closed cleanly: {e}", A::ACCELERATOR);
            }
        }
        self.worker.shutdown();
        self.link.shutdown();
        *status = DriverStatus::Shutdowned;
        info!("{} user driver shut down", A::ACCELERATOR);
        Ok(())
    }

    fn status(&self) -> DriverStatus {
        *lock(&self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tensor;

    #[test]
    fn feature_maps_skip_constants() {
        let mut list = OperatorList::new(0x10_0000);
        let a = list.add_tensor(Tensor::feature_map("a", Shape::new(1, 3, 8, 8, 2), 4));
        let mut weights = Tensor::feature_map("w", Shape::new(1, 1, 1, 9, 1), 5);
        weights.is_const = true;
        let w = list.add_tensor(weights);

        let maps = feature_maps(&list, &[a, w]).unwrap();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0].buffer_index, 4);
        assert_eq!(maps[0].bpp, 16);
        assert!(feature_maps(&list, &[TensorIndex(7)]).is_err());
    }

    #[test]
    fn session_options_follow_list() {
        let mut list = OperatorList::new(1 << 16);
        list.pref_mode = 3;
        list.priority = 9;
        list.latency = 500;
        list.preset_id = 4;
        let options = session_options(&list);
        assert_eq!(options.preference, ModePreference::BoostBlocking);
        assert_eq!(options.priority, 9);
        assert_eq!(options.latency, 500);
        assert_eq!(options.bound_core, vs4l_abi::param::BOUND_NA);
        assert_eq!(options.preset_id, 4);
    }

    #[test]
    fn operator_id_rejects_zero() {
        assert!(operator_id(0, 1).is_err());
        assert_eq!(operator_id(0x20_0000, 1).unwrap(), 0x0100_0000_0020_0000);
    }

    #[test]
    fn resolve_rejects_missing_and_stale_buffers() {
        let mut info = ModelInfo::new(1, 1, vec![0u8]);
        info.inputs.push(FeatureMap {
            shape: Shape::new(1, 1, 1, 16, 1),
            buffer_index: 0,
            bpp: 8,
        });
        let empty = crate::model::VecBufferTable::default();
        assert!(matches!(
            resolve_buffers(&info, &empty),
            Err(AccelError::InvalidArgument { .. })
        ));

        let stale = crate::model::VecBufferTable::new(vec![crate::model::BufferRef {
            fd: -1,
            addr: 0x1000,
            size: 16,
        }]);
        assert!(matches!(
            resolve_buffers(&info, &stale),
            Err(AccelError::InvalidMemory { .. })
        ));
    }

    #[test]
    fn resolve_accepts_live_buffers() {
        let buf = IonBuffer::allocate("in", 16).unwrap();
        let mut info = ModelInfo::new(1, 1, vec![0u8]);
        info.inputs.push(FeatureMap {
            shape: Shape::new(1, 1, 1, 16, 1),
            buffer_index: 0,
            bpp: 8,
        });
        let table = crate::model::VecBufferTable::new(vec![crate::model::BufferRef {
            fd: buf.raw_fd(),
            addr: buf.addr(),
            size: 16,
        }]);
        let buffers = resolve_buffers(&info, &table).unwrap();
        assert_eq!(buffers.inputs, vec![buf.memory()]);
        assert!(buffers.outputs.is_empty());
    }
}
