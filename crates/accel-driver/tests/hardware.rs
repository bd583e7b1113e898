//! Tests against a real vertex device
//!
//! Run on a board with `cargo test -- --ignored`. `ACCEL_DEVICE` overrides
//! the device node.

use accel_driver::{
    Accelerator, Binary, DeviceLink, KernelDevice, LinkConfig, NpuUserDriver, Operator,
    OperatorList, Shape, Tensor, UserDriver, Vs4lDevice,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "debug".into()))
        .with_test_writer()
        .try_init();
}

#[test]
#[ignore] // Requires hardware
fn kernel_device_opens_and_closes() {
    init_logging();
    let config = LinkConfig::from_env();
    let device = KernelDevice::new(&config.device_path);
    let fd = device.open().expect("vertex device should open");
    device.close(fd).expect("vertex fd should close");
}

#[test]
#[ignore] // Requires hardware
fn link_initializes_on_both_accelerators() {
    init_logging();
    for accel in [Accelerator::Npu, Accelerator::Dsp] {
        let link = DeviceLink::kernel(accel, LinkConfig::from_env()).expect("link");
        link.init(link.config().max_request_size).expect("init");
        assert_eq!(link.session_count(), 0);
        link.shutdown();
    }
}

#[test]
#[ignore] // Requires hardware and an NCP binary in ACCEL_TEST_NCP
fn npu_subgraph_round_trip() {
    init_logging();
    let Ok(path) = std::env::var("ACCEL_TEST_NCP") else {
        return;
    };
    let ncp = std::fs::read(&path).expect("NCP binary");

    let link = Arc::new(DeviceLink::kernel(Accelerator::Npu, LinkConfig::from_env()).expect("link"));
    let npu = NpuUserDriver::new(link).expect("driver");
    npu.initialize().expect("initialize");

    let mut list = OperatorList::new(0x0001_0000);
    let input = list.add_tensor(Tensor::feature_map("in", Shape::new(1, 3, 224, 224, 1), 0));
    let output = list.add_tensor(Tensor::feature_map("out", Shape::new(1, 1, 1, 1000, 1), 1));
    let mut op = Operator::new(0, "ncp", Accelerator::Npu);
    op.binaries.push(Binary::new(path, Accelerator::Npu, ncp));
    op.inputs.push(input);
    op.outputs.push(output);
    list.add_operator(op);

    npu.open_subgraph(&list, list.id, 0).expect("open");
    npu.close_subgraph(list.id).expect("close");
    npu.deinitialize().expect("deinitialize");
}
