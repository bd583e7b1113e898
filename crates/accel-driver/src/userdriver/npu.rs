//! NPU operators

use super::{
    feature_maps, operator_id, resolve_buffers, AcceleratorOps, AcceleratorUserDriver,
    ExecutableOperator, OperatorSession, CELL_ALIGN,
};
use crate::backend::Accelerator;
use crate::error::{AccelError, Result};
use crate::model::{BufferTable, Operator, OperatorList, Shape};
use crate::session::{FeatureMap, ModelInfo};
use tracing::debug;
use vs4l_abi::param::NO_SHARED_BUFFER;

/// NPU user driver
pub type NpuUserDriver = AcceleratorUserDriver<NpuOps>;

/// NPU steps of the lifecycle
#[derive(Debug)]
pub struct NpuOps;

/// Outputs bound to one buffer collapse into a single byte row
fn bound_output(outputs: &[FeatureMap]) -> Result<FeatureMap> {
    let first = outputs
        .first()
        .ok_or_else(|| AccelError::invalid_argument("ofm-bound operator without outputs"))?;
    let total: u64 = outputs.iter().map(|fm| fm.shape.size()).sum();
    let width = u32::try_from(total).map_err(|_| {
        AccelError::invalid_argument(format!("bound output of {total} bytes is too large"))
    })?;
    Ok(FeatureMap {
        shape: Shape::new(1, 1, 1, width, 1),
        buffer_index: first.buffer_index,
        bpp: first.bpp,
    })
}

impl AcceleratorOps for NpuOps {
    type Binary = ();

    const ACCELERATOR: Accelerator = Accelerator::Npu;

    fn load(
        list: &OperatorList,
        op: &Operator,
        list_id: u64,
        unified_id: u64,
    ) -> Result<OperatorSession<()>> {
        let binary = op.first_binary()?;
        let id = operator_id(list_id, op.uid)?;

        let inputs = feature_maps(list, &op.inputs)?;
        let mut outputs = feature_maps(list, &op.outputs)?;
        if inputs.is_empty() || outputs.is_empty() {
            return Err(AccelError::invalid_argument(format!(
                "NPU op {} needs feature maps, has {} in / {} out",
                op.name,
                inputs.len(),
                outputs.len()
            )));
        }
        if op.ofm_bound {
            outputs = vec![bound_output(&outputs)?];
        }

        let mut info = ModelInfo::new(id, list_id, binary.data.clone());
        info.name.clone_from(&binary.name);
        info.unified_op_id = if unified_id > 0 { unified_id } else { id };
        info.inputs = inputs;
        info.outputs = outputs;
        info.cell_align = CELL_ALIGN;
        info.shared_buffer = NO_SHARED_BUFFER;
        info.binding_ofm = op.ofm_bound;
        info.tile_size = list.tile_num.max(1);
        debug!(
            "NPU op {:#x} ({}): {} in, {} out, {} bytes",
            id,
            info.name,
            info.inputs.len(),
            info.outputs.len(),
            info.model.len()
        );
        Ok(OperatorSession::new(info, false, ()))
    }

    fn bind(session: &OperatorSession<()>, table: &dyn BufferTable) -> Result<ExecutableOperator> {
        resolve_buffers(&session.info, table).map(ExecutableOperator::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Binary, Tensor};

    fn list_with(ofm_bound: bool) -> (OperatorList, Operator) {
        let mut list = OperatorList::new(0x30_0000);
        list.tile_num = 0;
        let i = list.add_tensor(Tensor::feature_map("in", Shape::new(1, 3, 224, 224, 1), 0));
        let a = list.add_tensor(Tensor::feature_map("a", Shape::new(1, 1, 1, 10, 4), 1));
        let b = list.add_tensor(Tensor::feature_map("b", Shape::new(1, 1, 2, 3, 1), 2));
        let mut op = Operator::new(1, "ncp", Accelerator::Npu);
        op.binaries.push(Binary::new("model.ncp", Accelerator::Npu, vec![1u8, 2, 3]));
        op.inputs.push(i);
        op.outputs.extend([a, b]);
        op.ofm_bound = ofm_bound;
        (list, op)
    }

    #[test]
    fn load_describes_feature_maps() {
        let (list, op) = list_with(false);
        let session = NpuOps::load(&list, &op, list.id, 0).unwrap();
        let info = &session.info;
        assert_eq!(info.id, 0x0100_0000_0030_0000);
        assert_eq!(info.unified_op_id, info.id);
        assert_eq!(info.inputs.len(), 1);
        assert_eq!(info.inputs[0].bpp, 8);
        assert_eq!(info.outputs.len(), 2);
        assert_eq!(info.cell_align, CELL_ALIGN);
        assert_eq!(info.tile_size, 1);
        assert!(!session.async_exec);
    }

    #[test]
    fn bound_outputs_collapse() {
        let (list, op) = list_with(true);
        let session = NpuOps::load(&list, &op, list.id, 77).unwrap();
        let info = &session.info;
        assert_eq!(info.unified_op_id, 77);
        assert!(info.binding_ofm);
        assert_eq!(info.outputs.len(), 1);
        assert_eq!(info.outputs[0].shape, Shape::new(1, 1, 1, 46, 1));
        assert_eq!(info.outputs[0].buffer_index, 1);
    }

    #[test]
    fn missing_outputs_or_binary_fail() {
        let (list, mut op) = list_with(false);
        op.outputs.clear();
        assert!(NpuOps::load(&list, &op, list.id, 0).is_err());

        let (list, mut op) = list_with(false);
        op.binaries.clear();
        assert!(NpuOps::load(&list, &op, list.id, 0).is_err());

        let (list, op) = list_with(false);
        assert!(NpuOps::load(&list, &op, 0, 0).is_err());
    }
}
