//! DSP operators
//!
//! Inputs of a CGO graph are ordered by name: `input_*` tensors first (these
//! are the only feature maps queued to the driver), everything else from the
//! back. Every tensor types one load param through its buffer index.

use super::{
    feature_maps, operator_id, resolve_buffers, AcceleratorOps, AcceleratorUserDriver,
    ExecutableOperator, OperatorSession, CELL_ALIGN,
};
use crate::backend::Accelerator;
use crate::dsp_bin::{is_cgo_binary, CgoInfo, DspBinInfo, UcgoInfo};
use crate::error::{AccelError, Result};
use crate::memory::IonBuffer;
use crate::model::{BufferTable, Operator, OperatorList};
use crate::session::{FeatureMap, ModelInfo};
use std::sync::Arc;
use tracing::{debug, info};
use vs4l_abi::param::NO_SHARED_BUFFER;

/// DSP user driver
pub type DspUserDriver = AcceleratorUserDriver<DspOps>;

/// DSP steps of the lifecycle
#[derive(Debug)]
pub struct DspOps;

const CGO_INPUT_MARK: &str = "input_";

fn load_cgo(list: &OperatorList, op: &Operator, info: &mut ModelInfo) -> Result<CgoInfo> {
    let binary = op.first_binary()?;
    let param_count = op.inputs.len() + op.outputs.len();
    let mut cgo = CgoInfo::new(&binary.data, &op.lib_names, info.operator_list_id, param_count)?;

    let mut front = Vec::new();
    let mut back = Vec::new();
    for &index in &op.inputs {
        let tensor = list.tensor(index)?;
        let fm = FeatureMap {
            shape: tensor.shape,
            buffer_index: tensor.buffer_index,
            bpp: 8 * tensor.shape.type_size,
        };
        cgo.update_load_param(&tensor.name, fm.buffer_index, fm.shape)?;
        if tensor.name.contains(CGO_INPUT_MARK) {
            front.push(fm);
        } else {
            back.push(fm);
        }
    }
    debug!("CGO op {}: {} inputs, {} side buffers", op.name, front.len(), back.len());
    info.inputs = front;

    for &index in &op.outputs {
        let tensor = list.tensor(index)?;
        if tensor.is_const {
            continue;
        }
        cgo.update_load_param(&tensor.name, tensor.buffer_index, tensor.shape)?;
    }
    info.outputs = feature_maps(list, &op.outputs)?;
    Ok(cgo)
}

impl AcceleratorOps for DspOps {
    type Binary = DspBinInfo;

    const ACCELERATOR: Accelerator = Accelerator::Dsp;

    fn load(
        list: &OperatorList,
        op: &Operator,
        list_id: u64,
        unified_id: u64,
    ) -> Result<OperatorSession<DspBinInfo>> {
        let binary = op.first_binary()?;
        let id = operator_id(list_id, op.uid)?;

        let mut info = ModelInfo::new(id, list_id, binary.data.clone());
        info.name.clone_from(&binary.name);
        info.unified_op_id = if unified_id > 0 { unified_id } else { id };
        info.cell_align = CELL_ALIGN;
        info.shared_buffer = NO_SHARED_BUFFER;
        info.binding_ofm = false;
        info.tile_size = 1;

        let bin_info = if is_cgo_binary(binary) {
            DspBinInfo::Cgo(load_cgo(list, op, &mut info)?)
        } else {
            info.inputs = feature_maps(list, &op.inputs)?;
            info.outputs = feature_maps(list, &op.outputs)?;
            DspBinInfo::Ucgo(UcgoInfo::parse(&binary.data, &info)?)
        };
        bin_info.apply_to(&mut info);

        info!(
            "DSP op {:#x} ({}): {}, global id {:#x}, {} in, {} out{}",
            id,
            info.name,
            if bin_info.is_cgo() { "CGO" } else { "UCGO" },
            bin_info.global_id(),
            info.inputs.len(),
            info.outputs.len(),
            if op.async_exec { ", async" } else { "" }
        );
        Ok(OperatorSession::new(info, op.async_exec, bin_info))
    }

    fn bind(
        session: &OperatorSession<DspBinInfo>,
        table: &dyn BufferTable,
    ) -> Result<ExecutableOperator> {
        let mut buffers = resolve_buffers(&session.info, table)?;
        let mut exec = session.binary.exec_template().clone();
        session
            .binary
            .update_exec_info(&mut exec, &session.info, &buffers, table)?;

        let mut message = IonBuffer::allocate("dsp_exec_info", exec.size())?;
        exec.write_into(&mut message)?;
        buffers.exec_info = Some(message.memory());
        Ok(ExecutableOperator {
            buffers,
            exec_message: Some(Arc::new(message)),
        })
    }
}

impl DspUserDriver {
    /// Driver-assigned unique id of the first session of `list_id`
    ///
    /// # Errors
    ///
    /// Returns not found for an unknown or empty list.
    pub fn get_dsp_session_id(&self, list_id: u64) -> Result<u32> {
        let first = self
            .model_ids(list_id)
            .and_then(|ids| ids.first().copied())
            .ok_or_else(|| AccelError::not_found("operator list", list_id))?;
        self.link().get_dsp_session_id(first)
    }
}
