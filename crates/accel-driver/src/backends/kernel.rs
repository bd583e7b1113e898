//! Kernel vertex device backend
//!
//! Marshals owned [`Vs4lRequest`] payloads into the `#[repr(C)]` views the
//! driver expects and issues the ioctl. The views borrow the payload for the
//! duration of the syscall only.

// ioctl arguments cross the user/kernel boundary as C integers
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]

use crate::backend::{
    ContainerListFrame, DeviceResult, DeviceType, DriverFault, Vs4lDevice, Vs4lRequest,
};
use libc::{c_int, c_ulong, c_void, timeval};
use std::fs::OpenOptions;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use vs4l_abi::param::target;
use vs4l_abi::wire::{
    drv_usr_share, vs4l_buffer, vs4l_buffer_m, vs4l_container, vs4l_container_list,
    vs4l_format_list, vs4l_graph, vs4l_param, vs4l_param_list,
};

/// Vertex device node (`/dev/vertex10` on production boards)
#[derive(Debug, Clone)]
pub struct KernelDevice {
    path: PathBuf,
}

impl KernelDevice {
    /// Create a backend for `path`. Nothing is opened until a session starts.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Device node
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn check(ret: c_int) -> DeviceResult<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(DriverFault::new(ret, last_errno()))
    }
}

const ZERO_TIME: timeval = timeval {
    tv_sec: 0,
    tv_usec: 0,
};

/// Issue `cmd` with `arg`.
///
/// # Safety
///
/// `arg` must be null or point at the structure `cmd` encodes, with every
/// pointer inside it valid for the duration of the call.
unsafe fn raw_ioctl(fd: RawFd, cmd: c_ulong, arg: *mut c_void) -> DeviceResult<()> {
    // SAFETY: guaranteed by the caller; fd is a session fd from open().
    check(unsafe { libc::ioctl(fd, cmd as _, arg) })
}

fn container_list_ioctl(
    fd: RawFd,
    cmd: c_ulong,
    frame: &mut ContainerListFrame,
) -> DeviceResult<()> {
    let mut buffers: Vec<Vec<vs4l_buffer>> = frame
        .containers
        .iter()
        .map(|c| {
            c.buffers
                .iter()
                .map(|b| vs4l_buffer {
                    roi: b.roi,
                    m: vs4l_buffer_m { fd: b.fd },
                    reserved: b.addr as c_ulong,
                })
                .collect()
        })
        .collect();

    let mut containers: Vec<vs4l_container> = frame
        .containers
        .iter()
        .zip(buffers.iter_mut())
        .map(|(c, bufs)| vs4l_container {
            r#type: c.buffer_type,
            target: c.target,
            memory: c.memory,
            reserved: [0; 4],
            count: bufs.len() as u32,
            buffers: bufs.as_mut_ptr(),
        })
        .collect();

    let mut list = vs4l_container_list {
        direction: frame.direction,
        id: frame.id,
        index: frame.index,
        flags: frame.flags,
        timestamp: [ZERO_TIME; 6],
        count: containers.len() as u32,
        containers: containers.as_mut_ptr(),
    };

    // SAFETY: `list` points into `containers` and `buffers`, both alive
    // until this function returns; layouts match the driver headers.
    let result = unsafe { raw_ioctl(fd, cmd, (&raw mut list).cast()) };

    frame.index = list.index;
    frame.id = list.id;
    frame.flags = list.flags;
    result
}

impl Vs4lDevice for KernelDevice {
    fn open(&self) -> DeviceResult<RawFd> {
        let file = OpenOptions::new()
            .read(true)
            .open(&self.path)
            .map_err(|e| DriverFault::new(-1, e.raw_os_error().unwrap_or(0)))?;
        let fd = file.into_raw_fd();
        debug!("Opened {} as fd {fd}", self.path.display());
        Ok(fd)
    }

    fn close(&self, fd: RawFd) -> DeviceResult<()> {
        debug!("Closing fd {fd}");
        // SAFETY: fd came from open() and is closed exactly once by the
        // session that owns it.
        check(unsafe { libc::close(fd) })
    }

    fn ioctl(&self, fd: RawFd, request: &mut Vs4lRequest) -> DeviceResult<()> {
        let cmd = request.command();
        trace!("ioctl {} ({cmd:#x}) on fd {fd}", request.name());

        match request {
            Vs4lRequest::Bootup(ctrl) => {
                // SAFETY: ctrl is a live vs4l_ctrl.
                unsafe { raw_ioctl(fd, cmd, (&raw mut *ctrl).cast()) }
            }
            Vs4lRequest::SetGraph(frame) => {
                let mut share: drv_usr_share = frame.share;
                let mut graph = vs4l_graph {
                    priority: frame.priority,
                    size: std::mem::size_of::<drv_usr_share>() as u32,
                    addr: (&raw mut share) as c_ulong,
                    ..vs4l_graph::default()
                };
                // SAFETY: graph.addr points at `share`, alive for the call.
                let result = unsafe { raw_ioctl(fd, cmd, (&raw mut graph).cast()) };
                frame.share = share;
                result
            }
            Vs4lRequest::SetFormat(list) => {
                let mut arg = vs4l_format_list {
                    direction: list.direction,
                    count: list.formats.len() as u32,
                    formats: list.formats.as_mut_ptr(),
                };
                // SAFETY: formats points into `list`, alive for the call.
                unsafe { raw_ioctl(fd, cmd, (&raw mut arg).cast()) }
            }
            Vs4lRequest::SetParam(params) => {
                let mut arg = vs4l_param_list {
                    count: params.len() as u32,
                    params: params.as_mut_ptr(),
                };
                // SAFETY: params points into the owned vector.
                unsafe { raw_ioctl(fd, cmd, (&raw mut arg).cast()) }
            }
            Vs4lRequest::SetKernel(names) => {
                let mut param = vs4l_param {
                    target: target::DSP_KERNEL,
                    addr: names.table.as_ptr() as c_ulong,
                    offset: names.count,
                    size: names.table.len() as u32,
                };
                let mut arg = vs4l_param_list {
                    count: 1,
                    params: &raw mut param,
                };
                // SAFETY: param.addr points at the name table, which the
                // driver copies during the call.
                unsafe { raw_ioctl(fd, cmd, (&raw mut arg).cast()) }
            }
            Vs4lRequest::SchedParam(sched) => {
                // SAFETY: sched is a live vs4l_sched_param.
                unsafe { raw_ioctl(fd, cmd, (&raw mut *sched).cast()) }
            }
            Vs4lRequest::StreamOn | Vs4lRequest::StreamOff => {
                // SAFETY: _IO requests take no argument.
                unsafe { raw_ioctl(fd, cmd, std::ptr::null_mut()) }
            }
            Vs4lRequest::Prepare(frame) | Vs4lRequest::Qbuf(frame) | Vs4lRequest::Dqbuf(frame) => {
                container_list_ioctl(fd, cmd, frame)
            }
        }
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Kernel
    }
}
