//! Device link: the only path to the vertex driver
//!
//! One [`DeviceLink`] serves one accelerator. It opens a device session per
//! operator binary, walks it through BOOTUP → S_GRAPH → S_FORMAT →
//! S_PARAM/SCHED_PARAM → STREAM_ON, queues and dequeues container lists and
//! tears sessions down again. Every device call runs under the link's
//! [`Watchdog`].
//!
//! ```text
//!   open_model ──▶ BinSession{fd, unique_id, ring}
//!   prepare    ──▶ PREPARE in/out, slot bound to first input fd
//!   execute    ──▶ [boost] QBUF in, QBUF out, one dequeue cycle [unboost]
//!   close_model──▶ baseline S_PARAM, STREAM_OFF, close(fd)
//! ```

// Slot counts and buffer sizes are u32 on the wire
#![allow(clippy::cast_possible_truncation)]

use crate::backend::{
    Accelerator, ContainerListFrame, DeviceResult, DriverFault, FormatList, GraphFrame,
    Vs4lDevice, Vs4lRequest,
};
use crate::backends::KernelDevice;
use crate::config::LinkConfig;
use crate::error::{AccelError, Result};
use crate::memory::{is_valid_ion_buffer, validate_memory_set, IonBuffer, Memory};
use crate::perf::{execution_params, open_close_params, ModePreference, PerfMode, PerfOption};
use crate::preset::{PresetSource, PresetTable};
use crate::session::{
    container_lists, input_formats, output_formats, BinSession, ExecutionBuffers, ModelInfo,
    SessionOptions, SessionSnapshot,
};
use crate::slot_ring::{Released, RequestSlotRing, SlotState};
use crate::watchdog::Watchdog;
use libc::c_ulong;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};
use vs4l_abi::param::BOUND_NA;
use vs4l_abi::wire::{
    cl_flag, drv_usr_share, vs4l_ctrl, vs4l_sched_param, VS4L_DIRECTION_IN, VS4L_DIRECTION_OT,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Created, not initialized
    Unknown,
    /// Accepting sessions
    Initialized,
    /// Shut down; `init` may be called again
    Shutdown,
}

/// Outcome of one dequeue cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// A live request finished
    Finished {
        /// Its frame id
        frame_id: u32,
        /// Neither direction carried the INVALID flag
        succeeded: bool,
    },
    /// The request's caller had timed out; its slot is free again
    Deleted,
    /// The driver reported a slot that carried nothing
    Empty,
}

/// Link to one accelerator behind the vertex device
#[derive(Debug)]
pub struct DeviceLink {
    accelerator: Accelerator,
    device: Arc<dyn Vs4lDevice>,
    config: LinkConfig,
    presets: Arc<dyn PresetSource>,
    watchdog: Watchdog,
    state: Mutex<LinkState>,
    capacity: AtomicUsize,
    sram_full: AtomicBool,
    frame_id: AtomicU32,
    sessions: Mutex<HashMap<u64, Arc<Mutex<BinSession>>>>,
}

impl DeviceLink {
    /// Create a link over `device`
    pub fn new(
        accelerator: Accelerator,
        device: Arc<dyn Vs4lDevice>,
        config: LinkConfig,
        presets: Arc<dyn PresetSource>,
    ) -> Self {
        let watchdog = Watchdog::new(config.timer_timeout, config.timer_interval);
        let capacity = config.max_request_size;
        Self {
            accelerator,
            device,
            config,
            presets,
            watchdog,
            state: Mutex::new(LinkState::Unknown),
            capacity: AtomicUsize::new(capacity),
            sram_full: AtomicBool::new(false),
            frame_id: AtomicU32::new(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Link over the kernel device named in `config`, with its preset file
    ///
    /// # Errors
    ///
    /// Returns an error if the preset file exists but cannot be parsed.
    pub fn kernel(accelerator: Accelerator, config: LinkConfig) -> Result<Self> {
        let presets = PresetTable::load(&config.preset_file)?;
        let device = KernelDevice::new(&config.device_path);
        Ok(Self::new(
            accelerator,
            Arc::new(device),
            config,
            Arc::new(presets),
        ))
    }

    /// Accelerator served by this link
    pub const fn accelerator(&self) -> Accelerator {
        self.accelerator
    }

    /// Configuration the link was created with
    pub const fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> LinkState {
        *lock(&self.state)
    }

    /// True once an open failed for lack of firmware SRAM
    pub fn is_sram_full(&self) -> bool {
        self.sram_full.load(Ordering::Acquire)
    }

    /// Number of open sessions
    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Start accepting sessions with `max_request_size` slots each
    ///
    /// A second call while initialized changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::InvalidArgument`] for a zero ring size.
    pub fn init(&self, max_request_size: usize) -> Result<()> {
        if max_request_size == 0 {
            return Err(AccelError::invalid_argument("max_request_size must be positive"));
        }
        let mut state = lock(&self.state);
        if *state == LinkState::Initialized {
            debug!("{} link already initialized", self.accelerator);
            return Ok(());
        }
        self.capacity.store(max_request_size, Ordering::Release);
        self.sram_full.store(false, Ordering::Release);
        lock(&self.sessions).clear();
        *state = LinkState::Initialized;
        info!(
            "{} link initialized: {} slots per session, device {}",
            self.accelerator,
            max_request_size,
            self.config.device_path.display()
        );
        Ok(())
    }

    /// Close every session and stop accepting new ones
    ///
    /// Close failures are logged and do not stop the remaining closes.
    pub fn shutdown(&self) {
        {
            let mut state = lock(&self.state);
            if *state != LinkState::Initialized {
                debug!("{} link not initialized, nothing to shut down", self.accelerator);
                return;
            }
            *state = LinkState::Shutdown;
        }

        let ids: Vec<u64> = lock(&self.sessions).keys().copied().collect();
        for id in ids {
            if let Err(e) = self.close_model(id) {
                error!("{} session {id:#x} close failed during shutdown: {e}", self.accelerator);
            }
        }
        info!("{} link shut down", self.accelerator);
    }

    fn ensure_initialized(&self) -> Result<()> {
        match self.state() {
            LinkState::Initialized => Ok(()),
            other => Err(AccelError::invalid_state(format!(
                "{} link is {other:?}",
                self.accelerator
            ))),
        }
    }

    fn session(&self, model_id: u64) -> Result<Arc<Mutex<BinSession>>> {
        lock(&self.sessions)
            .get(&model_id)
            .cloned()
            .ok_or_else(|| AccelError::not_found("session", model_id))
    }

    // ── Device calls ────────────────────────────────────────────────────────

    fn call(&self, fd: RawFd, request: Vs4lRequest) -> Result<(Vs4lRequest, DeviceResult<()>)> {
        let name = request.name();
        let device = Arc::clone(&self.device);
        debug!("[IOCTL] {name}, fd {fd}");
        self.watchdog.supervise(name, move || {
            let mut request = request;
            let result = device.ioctl(fd, &mut request);
            (request, result)
        })
    }

    fn call_checked(&self, fd: RawFd, request: Vs4lRequest) -> Result<Vs4lRequest> {
        let name = request.name();
        let (request, result) = self.call(fd, request)?;
        result.map_err(|fault| {
            error!("{name} failed on fd {fd}: ret {:#x}, errno {}", fault.ret, fault.errno);
            AccelError::ioctl(name, fault)
        })?;
        Ok(request)
    }

    /// S_PARAM or SCHED_PARAM where EMERGENCY_RECOVERY means "keep the old
    /// setting"
    fn call_skippable(&self, fd: RawFd, request: Vs4lRequest) -> Result<()> {
        let name = request.name();
        match self.call(fd, request)?.1 {
            Ok(()) => Ok(()),
            Err(fault) if fault.is_emergency_recovery() => {
                warn!("EMERGENCY_RECOVERY on {name}, setting not applied, skip");
                Ok(())
            }
            Err(fault) => Err(AccelError::ioctl(name, fault)),
        }
    }

    fn open_device(&self) -> Result<RawFd> {
        let device = Arc::clone(&self.device);
        self.watchdog
            .supervise("OPEN", move || device.open())?
            .map_err(|fault| AccelError::DeviceOpen {
                path: self.config.device_path.clone(),
                errno: fault.errno,
            })
    }

    fn close_device(&self, fd: RawFd) -> Result<()> {
        let device = Arc::clone(&self.device);
        self.watchdog
            .supervise("CLOSE", move || device.close(fd))?
            .map_err(|fault| AccelError::ioctl("CLOSE", fault))
    }

    fn load_fault(&self, request: &'static str, fault: DriverFault) -> AccelError {
        if fault.is_emergency_recovery() {
            error!("EMERGENCY_RECOVERY during {request}");
            AccelError::EmergencyRecovery { request }
        } else if fault.is_sram_full() {
            error!("{} SRAM is full (errno {:#x})", self.accelerator, fault.errno);
            self.sram_full.store(true, Ordering::Release);
            AccelError::SramFull
        } else {
            AccelError::ioctl(request, fault)
        }
    }

    // ── Open ────────────────────────────────────────────────────────────────

    /// Load `info` onto the accelerator and start streaming
    ///
    /// Returns the driver-assigned unique id of the new session.
    ///
    /// # Errors
    ///
    /// Fails on an uninitialized link, a sticky SRAM-full condition, a
    /// priority of 256 or more, a duplicate model id, or any failed step of
    /// the load sequence. The device fd is closed before a failure returns.
    pub fn open_model(&self, info: &ModelInfo, options: &SessionOptions) -> Result<u32> {
        self.ensure_initialized()?;
        if self.is_sram_full() {
            error!("{} SRAM is full, refusing to open {}", self.accelerator, info.name);
            return Err(AccelError::SramFull);
        }
        let perf = PerfOption::new(
            options.preference,
            options.priority,
            options.latency,
            options.bound_core,
            options.preset_id,
        )?;
        if lock(&self.sessions).contains_key(&info.id) {
            return Err(AccelError::duplicate("session", info.id));
        }

        let binary = IonBuffer::from_bytes("bin", &info.model)?;
        let fd = self.open_device()?;
        debug!(
            "Opening {} model {:#x} ({}) on fd {fd}, {} bytes",
            self.accelerator,
            info.id,
            info.name,
            binary.len()
        );

        let unique_id = match self.load(fd, info, perf.priority, &binary) {
            Ok(id) => id,
            Err(e) => {
                if let Err(close) = self.close_device(fd) {
                    error!("close of fd {fd} after failed open: {close}");
                }
                return Err(e);
            }
        };

        let capacity = self.capacity.load(Ordering::Acquire);
        let session = BinSession {
            fd,
            unique_id,
            model_id: info.id,
            operator_list_id: info.operator_list_id,
            in_count: info.inputs.len(),
            out_count: info.outputs.len(),
            needs_exec_info: self.accelerator == Accelerator::Dsp && info.exec_msg_size > 0,
            tile_size: info.tile_size.max(1),
            bound: BOUND_NA,
            priority: perf.priority,
            preference: options.preference,
            link_mode: PerfMode::None,
            prepared: false,
            ring: RequestSlotRing::new(capacity),
            in_lists: vec![None; capacity],
            out_lists: vec![None; capacity],
            _binary: binary,
        };
        let session = Arc::new(Mutex::new(session));

        match self.apply_performance(fd, &perf) {
            Ok(()) => lock(&session).link_mode = perf.mode,
            Err(e) => error!("performance not applied to {:#x}: {e}", info.id),
        }
        match self.call_skippable(
            fd,
            Vs4lRequest::SchedParam(vs4l_sched_param {
                priority: perf.priority,
                bound_id: perf.bound,
            }),
        ) {
            Ok(()) => lock(&session).bound = perf.bound,
            Err(e) => error!("boundness not applied to {:#x}: {e}", info.id),
        }

        if let Err(e) = self.call_checked(fd, Vs4lRequest::StreamOn) {
            if let Err(close) = self.close_device(fd) {
                error!("close of fd {fd} after failed STREAM_ON: {close}");
            }
            return Err(e);
        }

        if let std::collections::hash_map::Entry::Vacant(slot) =
            lock(&self.sessions).entry(info.id)
        {
            slot.insert(session);
        } else {
            warn!("model {:#x} was opened concurrently, closing fd {fd}", info.id);
            if let Err(close) = self.close_device(fd) {
                error!("close of fd {fd}: {close}");
            }
            return Err(AccelError::duplicate("session", info.id));
        }
        info!(
            "{} model {:#x} opened: fd {fd}, unique id {unique_id}",
            self.accelerator, info.id
        );
        Ok(unique_id)
    }

    fn load(&self, fd: RawFd, info: &ModelInfo, priority: u32, binary: &IonBuffer) -> Result<u32> {
        self.call_checked(
            fd,
            Vs4lRequest::Bootup(vs4l_ctrl {
                ctrl: 0,
                value: self.accelerator.hwdev(),
            }),
        )?;

        if self.accelerator == Accelerator::Dsp {
            if let Some(names) = &info.kernel_names {
                debug!("DSP kernel names: {}", names.count);
                if let (_, Err(fault)) = self.call(fd, Vs4lRequest::SetKernel(names.clone()))? {
                    return Err(self.load_fault("S_PARAM", fault));
                }
            }
        }

        let graph = GraphFrame {
            priority,
            share: drv_usr_share {
                id: 0,
                bin_fd: binary.raw_fd(),
                bin_size: binary.len() as u32,
                bin_mmap: binary.addr() as c_ulong,
                unified_op_id: info.unified_op_id,
            },
        };
        let unique_id = match self.call(fd, Vs4lRequest::SetGraph(graph))? {
            (Vs4lRequest::SetGraph(frame), Ok(())) => frame.share.id,
            (_, Err(fault)) => return Err(self.load_fault("S_GRAPH", fault)),
            (other, Ok(())) => {
                return Err(AccelError::invalid_state(format!(
                    "S_GRAPH came back as {}",
                    other.name()
                )));
            }
        };

        self.call_checked(
            fd,
            Vs4lRequest::SetFormat(FormatList {
                direction: VS4L_DIRECTION_IN,
                formats: input_formats(info, self.accelerator),
            }),
        )?;
        self.call_checked(
            fd,
            Vs4lRequest::SetFormat(FormatList {
                direction: VS4L_DIRECTION_OT,
                formats: output_formats(info, self.accelerator),
            }),
        )?;
        Ok(unique_id)
    }

    // ── Performance ─────────────────────────────────────────────────────────

    fn apply_performance(&self, fd: RawFd, perf: &PerfOption) -> Result<()> {
        let params = open_close_params(perf, self.presets.as_ref(), &self.config.max_freq);
        if params.is_empty() {
            debug!("no performance params for {:?}", perf.mode);
            return Ok(());
        }
        self.call_skippable(fd, Vs4lRequest::SetParam(params))
    }

    /// Re-apply performance mode, priority and boundness to an open session
    ///
    /// # Errors
    ///
    /// Returns the S_PARAM or SCHED_PARAM failure; EMERGENCY_RECOVERY is
    /// logged and skipped.
    pub fn set_performance(&self, model_id: u64, options: &SessionOptions) -> Result<()> {
        let session = self.session(model_id)?;
        let perf = PerfOption::new(
            options.preference,
            options.priority,
            options.latency,
            options.bound_core,
            options.preset_id,
        )?;
        let fd = lock(&session).fd;

        self.apply_performance(fd, &perf)?;
        self.call_skippable(
            fd,
            Vs4lRequest::SchedParam(vs4l_sched_param {
                priority: perf.priority,
                bound_id: perf.bound,
            }),
        )?;

        let mut s = lock(&session);
        s.link_mode = perf.mode;
        s.preference = options.preference;
        s.priority = perf.priority;
        s.bound = perf.bound;
        Ok(())
    }

    // ── Buffers ─────────────────────────────────────────────────────────────

    fn validate_buffers(buffers: &ExecutionBuffers) -> Result<()> {
        let all: Vec<Memory> = buffers
            .inputs
            .iter()
            .chain(&buffers.outputs)
            .chain(buffers.exec_info.iter())
            .copied()
            .collect();
        validate_memory_set(&all)?;
        for (i, mem) in all.iter().enumerate() {
            if let Memory::Ion { fd, addr, size } = *mem {
                if !is_valid_ion_buffer(fd, size, addr) {
                    return Err(AccelError::invalid_memory(format!(
                        "memory[{i}] fd {fd} failed the liveness check"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Pre-bind `buffers` to a slot of the session
    ///
    /// # Errors
    ///
    /// Fails on a count mismatch, an invalid or stale memory handle, a
    /// buffer set that is already prepared, a full ring or a PREPARE error.
    /// No ioctl is issued when validation fails.
    pub fn prepare(&self, model_id: u64, buffers: &ExecutionBuffers) -> Result<()> {
        let session = self.session(model_id)?;
        lock(&session).check_counts(buffers)?;
        Self::validate_buffers(buffers)?;
        let key = buffers
            .correlation_fd()
            .ok_or_else(|| AccelError::invalid_argument("nothing to prepare"))?;

        let (fd, slot, (input, output)) = {
            let mut s = lock(&session);
            if s.ring.resolve(key).is_some() {
                return Err(AccelError::invalid_argument(format!(
                    "buffers with fd {key} are already prepared"
                )));
            }
            let slot = s.ring.bind(key)?;
            let lists = container_lists(buffers, 0, slot, 1);
            s.store_lists(slot, lists.clone());
            (s.fd, slot, lists)
        };

        let prepared = self
            .call_checked(fd, Vs4lRequest::Prepare(input))
            .and_then(|_| self.call_checked(fd, Vs4lRequest::Prepare(output)));
        let mut s = lock(&session);
        match prepared {
            Ok(_) => {
                s.prepared = true;
                debug!("session {model_id:#x}: fd {key} prepared in slot {slot}");
                Ok(())
            }
            Err(e) => {
                s.ring.release(slot);
                s.forget_lists(slot);
                Err(e)
            }
        }
    }

    // ── Execute ─────────────────────────────────────────────────────────────

    fn execution_boost(&self, fd: RawFd, mode: PerfMode) -> Result<()> {
        let params = execution_params(mode, &self.config.tuned_freq)?;
        self.call_skippable(fd, Vs4lRequest::SetParam(params))
    }

    /// Run one request and attempt one dequeue cycle
    ///
    /// Prepared sessions route to the slot bound to `buffers`; others take a
    /// free slot and build tiled containers on the fly.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::BufferFull`] when no slot is available,
    /// [`AccelError::Timeout`] when QBUF exceeds the deadline (the slot is
    /// released by a later dequeue) and [`AccelError::RequestFailed`] when
    /// this request completes with the INVALID flag.
    pub fn execute(&self, model_id: u64, buffers: &ExecutionBuffers) -> Result<()> {
        let session = self.session(model_id)?;
        let (fd, prepared, boost) = {
            let s = lock(&session);
            s.check_counts(buffers)?;
            (
                s.fd,
                s.prepared,
                s.preference == ModePreference::BoostOnExecute,
            )
        };
        if !prepared {
            Self::validate_buffers(buffers)?;
        }

        let frame_id = self.frame_id.fetch_add(1, Ordering::Relaxed);
        let (slot, input, output) = {
            let mut s = lock(&session);
            let capacity = s.ring.capacity();
            if prepared {
                let key = buffers
                    .correlation_fd()
                    .ok_or_else(|| AccelError::invalid_argument("nothing to execute"))?;
                let slot = s
                    .ring
                    .resolve(key)
                    .ok_or(AccelError::BufferFull { capacity })?;
                let (Some(mut input), Some(mut output)) =
                    (s.in_lists[slot].clone(), s.out_lists[slot].clone())
                else {
                    return Err(AccelError::invalid_state(format!(
                        "slot {slot} has no prepared containers"
                    )));
                };
                s.ring.occupy(slot, frame_id)?;
                input.id = frame_id;
                output.id = frame_id;
                (slot, input, output)
            } else {
                let slot = s.ring.allocate(frame_id)?;
                let (input, output) = container_lists(buffers, frame_id, slot, s.tile_size);
                s.store_lists(slot, (input.clone(), output.clone()));
                (slot, input, output)
            }
        };

        // Boost is best-effort and runs before anything is queued
        if boost {
            if let Err(e) = self.execution_boost(fd, PerfMode::NpuBoostOnExecute) {
                warn!("execution boost not applied on {model_id:#x}: {e}");
            }
        }
        let queued = self.queue(fd, input, output);
        if boost {
            if let Err(e) = self.execution_boost(fd, PerfMode::None) {
                warn!("execution boost not reverted on {model_id:#x}: {e}");
            }
        }

        if let Err(e) = queued {
            let mut s = lock(&session);
            // Only a hung QBUF may still complete on the device
            if matches!(e, AccelError::Timeout { request: "QBUF", .. }) {
                s.ring.cancel(slot);
            } else if prepared {
                s.ring.complete(slot);
            } else {
                s.ring.release(slot);
                s.forget_lists(slot);
            }
            return Err(e);
        }

        match self.dequeue_completion(model_id)? {
            Some(Completion::Finished {
                frame_id: done,
                succeeded: false,
            }) if done == frame_id => Err(AccelError::RequestFailed { frame_id }),
            _ => Ok(()),
        }
    }

    fn queue(&self, fd: RawFd, input: ContainerListFrame, output: ContainerListFrame) -> Result<()> {
        self.call_checked(fd, Vs4lRequest::Qbuf(input))?;
        self.call_checked(fd, Vs4lRequest::Qbuf(output))?;
        Ok(())
    }

    /// Dequeue one completion, if any
    ///
    /// `Ok(None)` means nothing was pending.
    ///
    /// # Errors
    ///
    /// Returns the DQBUF failure for anything other than `EWOULDBLOCK` on
    /// the input side.
    pub fn dequeue_completion(&self, model_id: u64) -> Result<Option<Completion>> {
        let session = self.session(model_id)?;
        let fd = lock(&session).fd;

        let request = Vs4lRequest::Dqbuf(ContainerListFrame::dequeue(VS4L_DIRECTION_IN));
        let input = match self.call(fd, request)? {
            (Vs4lRequest::Dqbuf(frame), Ok(())) => frame,
            (_, Err(fault)) if fault.would_block() => {
                debug!("DQBUF on fd {fd}: nothing pending");
                return Ok(None);
            }
            (_, Err(fault)) => return Err(AccelError::ioctl("DQBUF", fault)),
            (other, Ok(())) => {
                return Err(AccelError::invalid_state(format!(
                    "DQBUF came back as {}",
                    other.name()
                )));
            }
        };
        let Vs4lRequest::Dqbuf(output) = self.call_checked(
            fd,
            Vs4lRequest::Dqbuf(ContainerListFrame::dequeue(VS4L_DIRECTION_OT)),
        )?
        else {
            return Err(AccelError::invalid_state("DQBUF came back changed"));
        };

        let invalid = cl_flag::is_set(input.flags, cl_flag::INVALID)
            || cl_flag::is_set(output.flags, cl_flag::INVALID);

        let slot = output.index as usize;
        let mut s = lock(&session);
        let released = s.ring.complete(slot);
        if s.ring.state(slot) == Some(SlotState::Free) {
            s.forget_lists(slot);
        }
        Ok(Some(match released {
            Released::Request { frame_id } => {
                if invalid {
                    error!("frame {frame_id} in slot {slot} completed INVALID");
                }
                Completion::Finished {
                    frame_id,
                    succeeded: !invalid,
                }
            }
            Released::Deleted => {
                warn!("slot {slot}: request was deleted before completion");
                Completion::Deleted
            }
            Released::Empty => {
                warn!("slot {slot}: completion for an empty slot");
                Completion::Empty
            }
        }))
    }

    // ── Close ───────────────────────────────────────────────────────────────

    /// Stream off and close the session opened for `model_id`
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::NotFound`] for an unknown id and the close(2)
    /// failure otherwise. The session is forgotten in either case once it
    /// was found.
    pub fn close_model(&self, model_id: u64) -> Result<()> {
        let session = lock(&self.sessions)
            .remove(&model_id)
            .ok_or_else(|| AccelError::not_found("session", model_id))?;
        let fd = lock(&session).fd;

        if let Err(e) = self.apply_performance(fd, &PerfOption::baseline()) {
            warn!("baseline performance not restored on {model_id:#x}: {e}");
        }
        match self.call(fd, Vs4lRequest::StreamOff) {
            Ok((_, Ok(()))) => {}
            Ok((_, Err(fault))) if fault.is_emergency_recovery() => {
                warn!("EMERGENCY_RECOVERY on STREAM_OFF, skip");
            }
            Ok((_, Err(fault))) => {
                error!("STREAM_OFF failed on fd {fd}: errno {}", fault.errno);
            }
            Err(e) => error!("STREAM_OFF on fd {fd}: {e}"),
        }

        let closed = self.close_device(fd);
        {
            let mut s = lock(&session);
            s.ring.clear();
            s.in_lists.fill(None);
            s.out_lists.fill(None);
            s.prepared = false;
        }
        closed?;
        info!("{} model {model_id:#x} closed", self.accelerator);
        Ok(())
    }

    /// Driver-assigned unique id of a DSP session
    ///
    /// # Errors
    ///
    /// Returns invalid state on an NPU link and not found for an unknown id.
    pub fn get_dsp_session_id(&self, model_id: u64) -> Result<u32> {
        if self.accelerator != Accelerator::Dsp {
            return Err(AccelError::invalid_state("session ids are only exposed for DSP"));
        }
        let session = self.session(model_id)?;
        let unique_id = lock(&session).unique_id;
        Ok(unique_id)
    }

    /// Snapshot of an open session
    ///
    /// # Errors
    ///
    /// Returns not found for an unknown id.
    pub fn session_info(&self, model_id: u64) -> Result<SessionSnapshot> {
        let session = self.session(model_id)?;
        let snapshot = lock(&session).snapshot();
        Ok(snapshot)
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{RecordedCall, SoftwareDevice};
    use crate::model::Shape;
    use crate::session::FeatureMap;
    use std::time::Duration;
    use vs4l_abi::param::{target, EMERGENCY_RECOVERY, ERR_LOAD_SEQ_ALLOC};
    use vs4l_abi::wire::{VS4L_BUFFER_LIST, VS4L_BUFFER_ROI};

    fn link(accel: Accelerator, slots: usize) -> (Arc<SoftwareDevice>, DeviceLink) {
        let dev = Arc::new(SoftwareDevice::new());
        let config = LinkConfig::default()
            .with_timer(Duration::ZERO, Duration::ZERO)
            .with_max_request_size(slots);
        let link = DeviceLink::new(
            accel,
            Arc::clone(&dev) as Arc<dyn Vs4lDevice>,
            config,
            Arc::new(PresetTable::empty()),
        );
        link.init(slots).unwrap();
        (dev, link)
    }

    fn model(id: u64) -> ModelInfo {
        let mut info = ModelInfo::new(id, id, vec![0xAB; 64]);
        info.inputs = vec![FeatureMap {
            shape: Shape::new(1, 3, 4, 4, 1),
            buffer_index: 0,
            bpp: 8,
        }];
        info.outputs = vec![FeatureMap {
            shape: Shape::new(1, 1, 1, 10, 1),
            buffer_index: 1,
            bpp: 8,
        }];
        info
    }

    struct Buffers {
        _ion: Vec<IonBuffer>,
        set: ExecutionBuffers,
    }

    fn buffers() -> Buffers {
        let mut a = IonBuffer::allocate("in", 48).unwrap();
        let mut b = IonBuffer::allocate("out", 10).unwrap();
        a.as_mut_slice()[0] = 1;
        b.as_mut_slice()[0] = 2;
        let set = ExecutionBuffers {
            inputs: vec![a.memory()],
            outputs: vec![b.memory()],
            exec_info: None,
        };
        Buffers { _ion: vec![a, b], set }
    }

    fn names(calls: &[RecordedCall]) -> Vec<&'static str> {
        calls.iter().map(|c| c.request.name()).collect()
    }

    #[test]
    fn open_issues_load_sequence() {
        let (dev, link) = link(Accelerator::Npu, 4);
        let id = link.open_model(&model(1), &SessionOptions::default()).unwrap();
        assert_eq!(id, 1);
        assert_eq!(
            names(&dev.calls()),
            vec!["BOOTUP", "S_GRAPH", "S_FORMAT", "S_FORMAT", "S_PARAM", "SCHED_PARAM", "STREAM_ON"]
        );
        assert_eq!(link.session_count(), 1);
    }

    #[test]
    fn open_before_init_is_rejected() {
        let dev = Arc::new(SoftwareDevice::new());
        let link = DeviceLink::new(
            Accelerator::Npu,
            dev.clone(),
            LinkConfig::default(),
            Arc::new(PresetTable::empty()),
        );
        let err = link.open_model(&model(1), &SessionOptions::default()).unwrap_err();
        assert!(matches!(err, AccelError::InvalidState { .. }));
        assert_eq!(dev.open_fds(), 0);
    }

    #[test]
    fn bad_priority_fails_before_device_open() {
        let (dev, link) = link(Accelerator::Npu, 4);
        let options = SessionOptions {
            priority: 256,
            ..SessionOptions::default()
        };
        assert!(link.open_model(&model(1), &options).is_err());
        assert!(dev.calls().is_empty());
        assert_eq!(dev.open_fds(), 0);
    }

    #[test]
    fn sram_full_is_sticky_until_reinit() {
        let (dev, link) = link(Accelerator::Npu, 4);
        dev.fail_next("S_GRAPH", -1, ERR_LOAD_SEQ_ALLOC);
        assert!(matches!(
            link.open_model(&model(1), &SessionOptions::default()),
            Err(AccelError::SramFull)
        ));
        assert!(link.is_sram_full());
        assert_eq!(dev.open_fds(), 0);
        assert!(matches!(
            link.open_model(&model(2), &SessionOptions::default()),
            Err(AccelError::SramFull)
        ));

        link.init(4).unwrap();
        assert!(link.is_sram_full());
        link.shutdown();
        link.init(4).unwrap();
        assert!(!link.is_sram_full());
        assert!(link.open_model(&model(3), &SessionOptions::default()).is_ok());
    }

    #[test]
    fn failed_stream_on_closes_fd() {
        let (dev, link) = link(Accelerator::Npu, 4);
        dev.fail_next("STREAM_ON", -1, libc::EIO);
        assert!(link.open_model(&model(1), &SessionOptions::default()).is_err());
        assert_eq!(dev.open_fds(), 0);
        assert_eq!(link.session_count(), 0);
    }

    #[test]
    fn boost_failure_does_not_fail_open() {
        let (dev, link) = link(Accelerator::Npu, 4);
        dev.fail_next("S_PARAM", -1, libc::EIO);
        let boost = SessionOptions {
            preference: ModePreference::Boost,
            ..SessionOptions::default()
        };
        link.open_model(&model(1), &boost).unwrap();
        assert_eq!(link.session_info(1).unwrap().link_mode, PerfMode::None);
    }

    #[test]
    #[allow(clippy::cast_possible_wrap)]
    fn dsp_kernel_param_emergency_fails_open() {
        let (dev, link) = link(Accelerator::Dsp, 4);
        let mut info = model(1);
        info.kernel_names = Some(crate::backend::KernelNames {
            table: vec![4, 0, 0, 0, b'k', b'0', b'1', 0],
            count: 1,
        });
        dev.fail_next("S_PARAM", EMERGENCY_RECOVERY as i32, 0);
        assert!(matches!(
            link.open_model(&info, &SessionOptions::default()),
            Err(AccelError::EmergencyRecovery { .. })
        ));
        assert_eq!(dev.open_fds(), 0);
    }

    #[test]
    fn duplicate_model_id_is_rejected_without_ioctl() {
        let (dev, link) = link(Accelerator::Npu, 4);
        link.open_model(&model(1), &SessionOptions::default()).unwrap();
        let before = dev.calls().len();
        assert!(matches!(
            link.open_model(&model(1), &SessionOptions::default()),
            Err(AccelError::Duplicate { .. })
        ));
        assert_eq!(dev.calls().len(), before);
    }

    #[test]
    fn unprepared_execute_completes() {
        let (dev, link) = link(Accelerator::Npu, 4);
        link.open_model(&model(1), &SessionOptions::default()).unwrap();
        let bufs = buffers();
        link.execute(1, &bufs.set).unwrap();
        link.execute(1, &bufs.set).unwrap();
        assert_eq!(dev.count("QBUF"), 4);
        assert_eq!(dev.count("DQBUF"), 4);
    }

    #[test]
    fn ring_exhaustion_reports_buffer_full() {
        let (dev, link) = link(Accelerator::Npu, 2);
        dev.set_auto_complete(false);
        link.open_model(&model(1), &SessionOptions::default()).unwrap();
        let bufs = buffers();
        link.execute(1, &bufs.set).unwrap();
        link.execute(1, &bufs.set).unwrap();
        let qbufs = dev.count("QBUF");
        assert!(matches!(
            link.execute(1, &bufs.set),
            Err(AccelError::BufferFull { capacity: 2 })
        ));
        assert_eq!(dev.count("QBUF"), qbufs);
    }

    #[test]
    fn pending_dequeue_is_not_an_error() {
        let (dev, link) = link(Accelerator::Npu, 2);
        dev.set_auto_complete(false);
        link.open_model(&model(1), &SessionOptions::default()).unwrap();
        assert_eq!(link.dequeue_completion(1).unwrap(), None);

        let bufs = buffers();
        link.execute(1, &bufs.set).unwrap();
        dev.complete_pending(100);
        assert!(matches!(
            link.dequeue_completion(1).unwrap(),
            Some(Completion::Finished { succeeded: true, .. })
        ));
    }

    #[test]
    fn invalid_output_fails_the_request() {
        let (dev, link) = link(Accelerator::Npu, 2);
        dev.set_invalid_outputs(true);
        link.open_model(&model(1), &SessionOptions::default()).unwrap();
        let bufs = buffers();
        assert!(matches!(
            link.execute(1, &bufs.set),
            Err(AccelError::RequestFailed { .. })
        ));
    }

    #[test]
    fn prepared_execute_reuses_bound_slot() {
        let (dev, link) = link(Accelerator::Npu, 4);
        link.open_model(&model(1), &SessionOptions::default()).unwrap();
        let bufs = buffers();
        link.prepare(1, &bufs.set).unwrap();
        assert!(link.session_info(1).unwrap().prepared);
        assert_eq!(dev.count("PREPARE"), 2);

        link.execute(1, &bufs.set).unwrap();
        link.execute(1, &bufs.set).unwrap();
        let qbuf_slots: Vec<u32> = dev
            .calls()
            .iter()
            .filter_map(|c| match &c.request {
                Vs4lRequest::Qbuf(f) => Some(f.index),
                _ => None,
            })
            .collect();
        assert!(qbuf_slots.iter().all(|&s| s == qbuf_slots[0]));

        let other = buffers();
        assert!(matches!(
            link.execute(1, &other.set),
            Err(AccelError::BufferFull { .. })
        ));
    }

    #[test]
    fn stale_ion_handle_fails_prepare_without_ioctl() {
        let (dev, link) = link(Accelerator::Npu, 4);
        link.open_model(&model(1), &SessionOptions::default()).unwrap();
        let mut bufs = buffers();
        let mut foreign = IonBuffer::allocate("foreign", 48).unwrap();
        foreign.as_mut_slice()[0] = 0x77;
        if let Memory::Ion { addr, .. } = &mut bufs.set.inputs[0] {
            *addr = foreign.addr();
        }
        let before = dev.calls().len();
        assert!(matches!(
            link.prepare(1, &bufs.set),
            Err(AccelError::InvalidMemory { .. })
        ));
        assert_eq!(dev.calls().len(), before);
    }

    #[test]
    fn unmapped_ion_address_fails_prepare_without_ioctl() {
        let (dev, link) = link(Accelerator::Npu, 4);
        link.open_model(&model(1), &SessionOptions::default()).unwrap();
        let mut bufs = buffers();
        if let Memory::Ion { addr, .. } = &mut bufs.set.inputs[0] {
            *addr = 0x10;
        }
        let before = dev.calls().len();
        assert!(matches!(
            link.prepare(1, &bufs.set),
            Err(AccelError::InvalidMemory { .. })
        ));
        assert_eq!(dev.calls().len(), before);
    }

    #[test]
    fn tiled_execute_sends_roi_containers() {
        let (dev, link) = link(Accelerator::Npu, 4);
        let mut info = model(1);
        info.tile_size = 2;
        link.open_model(&info, &SessionOptions::default()).unwrap();
        let bufs = buffers();
        link.execute(1, &bufs.set).unwrap();
        let first = dev
            .calls()
            .into_iter()
            .find_map(|c| match c.request {
                Vs4lRequest::Qbuf(f) => Some(f),
                _ => None,
            })
            .unwrap();
        assert_eq!(first.containers[0].buffer_type, VS4L_BUFFER_ROI);
        assert_eq!(first.containers[0].buffers.len(), 2);
        assert_eq!(first.containers[0].buffers[1].roi.y, 48);
    }

    #[test]
    fn prepare_uses_list_containers() {
        let (dev, link) = link(Accelerator::Npu, 4);
        link.open_model(&model(1), &SessionOptions::default()).unwrap();
        let bufs = buffers();
        link.prepare(1, &bufs.set).unwrap();
        let prepared = dev
            .calls()
            .into_iter()
            .find_map(|c| match c.request {
                Vs4lRequest::Prepare(f) => Some(f),
                _ => None,
            })
            .unwrap();
        assert_eq!(prepared.containers[0].buffer_type, VS4L_BUFFER_LIST);
        assert_eq!(prepared.direction, VS4L_DIRECTION_IN);
    }

    #[test]
    fn boost_on_execute_wraps_each_request() {
        let (dev, link) = link(Accelerator::Npu, 4);
        let options = SessionOptions {
            preference: ModePreference::BoostOnExecute,
            ..SessionOptions::default()
        };
        link.open_model(&model(1), &options).unwrap();
        let open_params = dev.count("S_PARAM");
        assert_eq!(open_params, 0);

        let bufs = buffers();
        link.execute(1, &bufs.set).unwrap();
        let params: Vec<Vec<(u32, u32)>> = dev
            .calls()
            .iter()
            .filter_map(|c| match &c.request {
                Vs4lRequest::SetParam(p) => Some(p.iter().map(|p| (p.target, p.offset)).collect()),
                _ => None,
            })
            .collect();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0][0], (target::PERF_MODE, 1));
        assert_eq!(params[1], vec![(target::PERF_MODE, 0), (target::QOS_CL1, 0)]);
    }

    fn timed_link(capacity: usize) -> (Arc<SoftwareDevice>, DeviceLink) {
        let dev = Arc::new(SoftwareDevice::new());
        let config = LinkConfig::default()
            .with_timer(Duration::from_millis(50), Duration::from_millis(10));
        let link = DeviceLink::new(
            Accelerator::Npu,
            dev.clone(),
            config,
            Arc::new(PresetTable::empty()),
        );
        link.init(capacity).unwrap();
        (dev, link)
    }

    fn wait_for(dev: &SoftwareDevice, request: &str, count: usize) {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while dev.count(request) < count {
            assert!(std::time::Instant::now() < deadline, "{request} never reached {count}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn qbuf_timeout_cancels_slot_until_deleted_completion() {
        let (dev, link) = timed_link(1);
        link.open_model(&model(1), &SessionOptions::default()).unwrap();
        let bufs = buffers();

        // Input queues at once, output hangs past the deadline
        dev.delay_next("QBUF", Duration::ZERO);
        dev.delay_next("QBUF", Duration::from_millis(200));
        assert!(matches!(
            link.execute(1, &bufs.set),
            Err(AccelError::Timeout { request: "QBUF", .. })
        ));
        assert_eq!(link.session_info(1).unwrap().slots_in_use, 1);
        assert!(matches!(
            link.execute(1, &bufs.set),
            Err(AccelError::BufferFull { capacity: 1 })
        ));

        wait_for(&dev, "QBUF", 2);
        assert_eq!(link.dequeue_completion(1).unwrap(), Some(Completion::Deleted));
        assert_eq!(link.session_info(1).unwrap().slots_in_use, 0);

        link.execute(1, &bufs.set).unwrap();
        assert_eq!(dev.count("QBUF"), 4);
    }

    #[test]
    fn boost_timeout_leaves_slot_free() {
        let (dev, link) = timed_link(2);
        let options = SessionOptions {
            preference: ModePreference::BoostOnExecute,
            ..SessionOptions::default()
        };
        link.open_model(&model(1), &options).unwrap();
        let bufs = buffers();

        dev.delay("S_PARAM", Duration::from_millis(200));
        for _ in 0..3 {
            link.execute(1, &bufs.set).unwrap();
        }
        assert_eq!(link.session_info(1).unwrap().slots_in_use, 0);
        assert_eq!(dev.count("QBUF"), 6);

        dev.delay("S_PARAM", Duration::ZERO);
        wait_for(&dev, "S_PARAM", 6);
        link.execute(1, &bufs.set).unwrap();
        assert_eq!(link.session_info(1).unwrap().slots_in_use, 0);
    }

    #[test]
    fn close_restores_baseline_and_closes() {
        let (dev, link) = link(Accelerator::Npu, 4);
        link.open_model(&model(1), &SessionOptions::default()).unwrap();
        link.close_model(1).unwrap();
        let calls = names(&dev.calls());
        assert_eq!(&calls[calls.len() - 2..], &["S_PARAM", "STREAM_OFF"]);
        assert_eq!(dev.open_fds(), 0);
        assert!(matches!(link.close_model(1), Err(AccelError::NotFound { .. })));
    }

    #[test]
    fn stream_off_failure_still_closes() {
        let (dev, link) = link(Accelerator::Npu, 4);
        link.open_model(&model(1), &SessionOptions::default()).unwrap();
        dev.fail_next("STREAM_OFF", -1, libc::EIO);
        link.close_model(1).unwrap();
        assert_eq!(dev.open_fds(), 0);
    }

    #[test]
    fn shutdown_closes_everything_and_is_repeatable() {
        let (dev, link) = link(Accelerator::Npu, 4);
        link.open_model(&model(1), &SessionOptions::default()).unwrap();
        link.open_model(&model(2), &SessionOptions::default()).unwrap();
        link.shutdown();
        assert_eq!(dev.open_fds(), 0);
        assert_eq!(link.state(), LinkState::Shutdown);
        link.shutdown();
    }

    #[test]
    fn dsp_session_id_only_on_dsp() {
        let (_, npu) = link(Accelerator::Npu, 4);
        npu.open_model(&model(1), &SessionOptions::default()).unwrap();
        assert!(npu.get_dsp_session_id(1).is_err());

        let (_, dsp) = link(Accelerator::Dsp, 4);
        let unique = dsp.open_model(&model(5), &SessionOptions::default()).unwrap();
        assert_eq!(dsp.get_dsp_session_id(5).unwrap(), unique);
    }

    #[test]
    #[allow(clippy::cast_possible_wrap)]
    fn set_performance_skips_emergency_recovery() {
        let (dev, link) = link(Accelerator::Npu, 4);
        link.open_model(&model(1), &SessionOptions::default()).unwrap();
        let boost = SessionOptions {
            preference: ModePreference::Boost,
            ..SessionOptions::default()
        };
        dev.fail_next("S_PARAM", EMERGENCY_RECOVERY as i32, 0);
        link.set_performance(1, &boost).unwrap();
        dev.fail_next("S_PARAM", -1, libc::EIO);
        assert!(link.set_performance(1, &boost).is_err());
        link.set_performance(1, &boost).unwrap();
        assert_eq!(link.session_info(1).unwrap().link_mode, PerfMode::NpuBoost);
    }
}
