//! Unified operators split over NPU and DSP
//!
//! A unified operator carries one binary per fragment. Opening it builds an
//! NPU list and a DSP list under the same id:
//!
//! ```text
//!   unified op ─┬─ NPU binaries ──▶ NPU list (op's tensors, uid 0, 1, ..)
//!               └─ DSP binaries ──▶ DSP list (no tensors,   uid 0, 1, ..)
//! ```
//!
//! Prepare and execute only reach the NPU half; the DSP fragments work off
//! the shared buffer table.

use super::{DriverStatus, DspUserDriver, NpuUserDriver, UserDriver};
use crate::backend::Accelerator;
use crate::error::{AccelError, Result};
use crate::model::{
    ExecutableOperatorList, ExecuteRequest, Operator, OperatorList, Tensor, TensorIndex,
    UnifiedBinaryOption,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn check_option(op: &Operator, option: &UnifiedBinaryOption) -> Result<()> {
    debug!(
        "unified option of {}: {} start {} end {} connections {:?}",
        op.name, option.target, option.start, option.end, option.connections
    );
    match option.target {
        Accelerator::Npu if !(option.start && option.end) => Err(AccelError::malformed(format!(
            "{}: NPU fragment must start and end its chain (start {}, end {})",
            op.name, option.start, option.end
        ))),
        Accelerator::Npu if option.connections.is_empty() => Err(AccelError::malformed(
            format!("{}: NPU fragment has no tensor connections", op.name),
        )),
        Accelerator::Dsp if !option.connections.is_empty() => Err(AccelError::malformed(format!(
            "{}: DSP fragment must not connect tensors ({})",
            op.name,
            option.connections.len()
        ))),
        _ => Ok(()),
    }
}

/// Check the structure of a unified list
///
/// # Errors
///
/// Returns [`AccelError::InvalidArgument`] unless there is exactly one
/// operator, and [`AccelError::MalformedBinary`] for an operator without
/// unified options or with a fragment that breaks the NPU/DSP rules.
pub fn validate(list: &OperatorList) -> Result<()> {
    if list.len() != 1 {
        return Err(AccelError::invalid_argument(format!(
            "{} ops in a unified list, exactly one is required",
            list.len()
        )));
    }
    for op in &list.operators {
        if op.unified_options.is_empty() {
            return Err(AccelError::malformed(format!(
                "{} carries no unified options",
                op.name
            )));
        }
        for option in &op.unified_options {
            check_option(op, option)?;
        }
    }
    Ok(())
}

fn with_preferences(source: &OperatorList, id: u64) -> OperatorList {
    OperatorList {
        id,
        operators: Vec::new(),
        tensors: Vec::new(),
        pref_mode: source.pref_mode,
        priority: source.priority,
        latency: source.latency,
        core_affinity: source.core_affinity,
        tile_num: source.tile_num,
        preset_id: source.preset_id,
    }
}

fn copy_tensors(
    source: &OperatorList,
    target: &mut OperatorList,
    indices: &[TensorIndex],
) -> Result<Vec<TensorIndex>> {
    indices
        .iter()
        .map(|&index| {
            let tensor = source.tensor(index)?;
            Ok(target.add_tensor(Tensor {
                producer: None,
                consumers: Vec::new(),
                ..tensor.clone()
            }))
        })
        .collect()
}

/// Split a validated unified list into its NPU and DSP lists, both `id`
///
/// # Errors
///
/// Returns an error for a tensor index outside the arena.
pub fn split(list: &OperatorList, id: u64) -> Result<(OperatorList, OperatorList)> {
    let mut npu = with_preferences(list, id);
    let mut dsp = with_preferences(list, id);

    for unified in &list.operators {
        let mut npu_uid = 0;
        let mut dsp_uid = 0;
        for binary in &unified.binaries {
            let (uid, target) = match binary.accelerator {
                Accelerator::Npu => (&mut npu_uid, &mut npu),
                Accelerator::Dsp => (&mut dsp_uid, &mut dsp),
            };
            let mut op = Operator::new(*uid, binary.name.clone(), binary.accelerator);
            *uid += 1;
            op.binaries.push(binary.clone());
            op.ofm_bound = unified.ofm_bound;
            op.lib_names.clone_from(&unified.lib_names);
            if binary.accelerator == Accelerator::Npu {
                op.inputs = copy_tensors(list, target, &unified.inputs)?;
                op.outputs = copy_tensors(list, target, &unified.outputs)?;
            }
            target.add_operator(op);
        }
    }
    debug!("unified list {id:#x}: {} NPU ops, {} DSP ops", npu.len(), dsp.len());
    Ok((npu, dsp))
}

/// Driver for operators split over both accelerators
#[derive(Debug)]
pub struct UnifiedUserDriver {
    npu: Arc<NpuUserDriver>,
    dsp: Arc<DspUserDriver>,
    status: Mutex<DriverStatus>,
}

impl UnifiedUserDriver {
    /// Unified driver over the two accelerator drivers
    pub fn new(npu: Arc<NpuUserDriver>, dsp: Arc<DspUserDriver>) -> Self {
        Self {
            npu,
            dsp,
            status: Mutex::new(DriverStatus::Uninitialized),
        }
    }

    /// NPU half
    pub fn npu(&self) -> &Arc<NpuUserDriver> {
        &self.npu
    }

    /// DSP half
    pub fn dsp(&self) -> &Arc<DspUserDriver> {
        &self.dsp
    }

    fn ensure_initialized(&self) -> Result<()> {
        match *lock(&self.status) {
            DriverStatus::Initialized => Ok(()),
            other => Err(AccelError::invalid_state(format!("unified user driver is {other:?}"))),
        }
    }
}

impl UserDriver for UnifiedUserDriver {
    fn initialize(&self) -> Result<()> {
        let mut status = lock(&self.status);
        if *status == DriverStatus::Initialized {
            debug!("unified user driver already initialized");
            return Ok(());
        }
        self.dsp.initialize()?;
        self.npu.initialize()?;
        *status = DriverStatus::Initialized;
        info!("unified user driver initialized");
        Ok(())
    }

    /// Both halves are opened under `list_id`, which is also their unified
    /// id; the caller's `unified_id` is not used.
    fn open_subgraph(&self, list: &OperatorList, list_id: u64, _unified_id: u64) -> Result<()> {
        self.ensure_initialized()?;
        validate(list)?;
        let (npu_list, dsp_list) = split(list, list_id)?;

        self.dsp.open_subgraph(&dsp_list, list_id, list_id)?;
        if let Err(e) = self.npu.open_subgraph(&npu_list, list_id, list_id) {
            error!("unified list {list_id:#x}: NPU half failed, closing DSP half");
            if let Err(close) = self.dsp.close_subgraph(list_id) {
                error!("unified list {list_id:#x}: DSP rollback failed: {close}");
            }
            return Err(e);
        }
        info!("unified list {list_id:#x} opened");
        Ok(())
    }

    fn prepare_subgraph(&self, executable: &ExecutableOperatorList) -> Result<()> {
        self.ensure_initialized()?;
        self.npu.prepare_subgraph(executable)
    }

    fn execute_subgraph(&self, request: &ExecuteRequest) -> Result<()> {
        self.ensure_initialized()?;
        self.npu.execute_subgraph(request)
    }

    fn close_subgraph(&self, list_id: u64) -> Result<()> {
        self.ensure_initialized()?;
        let dsp = self.dsp.close_subgraph(list_id);
        let npu = self.npu.close_subgraph(list_id);
        if let Err(e) = &dsp {
            error!("unified list {list_id:#x}: DSP close failed: {e}");
        }
        if let Err(e) = &npu {
            error!("unified list {list_id:#x}: NPU close failed: {e}");
        }
        dsp.and(npu)
    }

    fn deinitialize(&self) -> Result<()> {
        let mut status = lock(&self.status);
        if *status == DriverStatus::Shutdowned {
            debug!("unified user driver already shut down");
            return Ok(());
        }
        self.dsp.deinitialize()?;
        self.npu.deinitialize()?;
        *status = DriverStatus::Shutdowned;
        info!("unified user driver shut down");
        Ok(())
    }

    fn status(&self) -> DriverStatus {
        *lock(&self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Binary, Shape};

    fn option(target: Accelerator, start: bool, end: bool, connections: &[i32]) -> UnifiedBinaryOption {
        UnifiedBinaryOption {
            target,
            start,
            end,
            connections: connections.to_vec(),
        }
    }

    fn unified_list() -> OperatorList {
        let mut list = OperatorList::new(0x0007_0000);
        list.pref_mode = 1;
        list.priority = 5;
        let i = list.add_tensor(Tensor::feature_map("in", Shape::new(1, 3, 8, 8, 1), 0));
        let o = list.add_tensor(Tensor::feature_map("out", Shape::new(1, 1, 1, 10, 1), 1));
        let mut op = Operator::new(0, "unified", Accelerator::Npu);
        op.binaries.push(Binary::new("npu.ncp", Accelerator::Npu, vec![1u8]));
        op.binaries.push(Binary::new("dsp.ucgo", Accelerator::Dsp, vec![2u8]));
        op.binaries.push(Binary::new("npu2.ncp", Accelerator::Npu, vec![3u8]));
        op.inputs.push(i);
        op.outputs.push(o);
        op.lib_names = vec!["libk".into()];
        op.unified_options = vec![
            option(Accelerator::Npu, true, true, &[0, 1]),
            option(Accelerator::Dsp, true, false, &[]),
        ];
        list.add_operator(op);
        list
    }

    #[test]
    fn valid_list_passes() {
        assert!(validate(&unified_list()).is_ok());
    }

    #[test]
    fn npu_fragment_must_start_and_end() {
        let mut list = unified_list();
        list.operators[0].unified_options[0] = option(Accelerator::Npu, true, false, &[0]);
        assert!(matches!(validate(&list), Err(AccelError::MalformedBinary { .. })));

        list.operators[0].unified_options[0] = option(Accelerator::Npu, true, true, &[]);
        assert!(matches!(validate(&list), Err(AccelError::MalformedBinary { .. })));
    }

    #[test]
    fn dsp_fragment_must_not_connect() {
        let mut list = unified_list();
        list.operators[0].unified_options[1] = option(Accelerator::Dsp, true, true, &[3]);
        assert!(matches!(validate(&list), Err(AccelError::MalformedBinary { .. })));
    }

    #[test]
    fn op_count_other_than_one_and_missing_options_fail() {
        let empty = OperatorList::new(0x0007_0000);
        assert!(matches!(validate(&empty), Err(AccelError::InvalidArgument { .. })));

        let mut list = unified_list();
        let extra = list.operators[0].clone();
        list.add_operator(extra);
        assert!(matches!(validate(&list), Err(AccelError::InvalidArgument { .. })));

        let mut list = unified_list();
        list.operators[0].unified_options.clear();
        assert!(matches!(validate(&list), Err(AccelError::MalformedBinary { .. })));
    }

    #[test]
    fn split_partitions_binaries() {
        let list = unified_list();
        let (npu, dsp) = split(&list, list.id).unwrap();

        assert_eq!(npu.id, list.id);
        assert_eq!(dsp.id, list.id);
        assert_eq!(npu.len(), 2);
        assert_eq!(dsp.len(), 1);
        assert_eq!(npu.operators[0].uid, 0);
        assert_eq!(npu.operators[1].uid, 1);
        assert_eq!(npu.operators[1].name, "npu2.ncp");
        assert_eq!(dsp.operators[0].uid, 0);
        assert!(dsp.operators[0].inputs.is_empty());
        assert!(dsp.tensors.is_empty());
        assert_eq!(dsp.operators[0].lib_names, vec!["libk".to_string()]);

        // Each NPU op gets its own tensor copies, linked to it only
        assert_eq!(npu.tensors.len(), 4);
        let first_in = npu.operators[0].inputs[0];
        assert_eq!(npu.tensor(first_in).unwrap().consumers.len(), 1);
        assert_eq!(npu.pref_mode, 1);
        assert_eq!(dsp.priority, 5);
    }
}
