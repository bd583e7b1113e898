// SPDX-License-Identifier: AGPL-3.0-only

//! Software (virtual vertex) backend
//!
//! Implements [`Vs4lDevice`] entirely in process. It behaves like the vertex
//! driver as far as the runtime can observe:
//!
//! 1. **CI without hardware**: S_GRAPH assigns unique ids, QBUF completes
//!    immediately and DQBUF hands completions back in order, returning
//!    `EWOULDBLOCK` when nothing is pending.
//!
//! 2. **Fault injection**: any request can be scripted to fail with a given
//!    return value and errno (SRAM full, emergency recovery, plain EIO), to
//!    hang for a while (watchdog), or to complete with the INVALID flag.
//!
//! 3. **Wire inspection**: every request is recorded with its payload so
//!    tests can assert on exact S_FORMAT, S_PARAM and container contents.

use crate::backend::{DeviceResult, DeviceType, DriverFault, Vs4lDevice, Vs4lRequest};
use std::collections::{HashMap, HashSet, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace};
use vs4l_abi::wire::{cl_flag, VS4L_DIRECTION_IN};

/// First fd handed out by [`SoftwareDevice::open`]
const FIRST_FD: RawFd = 100;

/// One recorded device call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// Session fd
    pub fd: RawFd,
    /// Request as issued (after driver write-back)
    pub request: Vs4lRequest,
}

#[derive(Debug, Clone, Copy)]
struct Completion {
    index: u32,
    id: u32,
    flags: u32,
}

#[derive(Debug, Default)]
struct SessionQueues {
    pending_in: VecDeque<Completion>,
    pending_out: VecDeque<Completion>,
    done_in: VecDeque<Completion>,
    done_out: VecDeque<Completion>,
}

#[derive(Debug)]
struct State {
    next_fd: RawFd,
    next_unique_id: u32,
    open_fds: HashSet<RawFd>,
    queues: HashMap<RawFd, SessionQueues>,
    faults: HashMap<&'static str, VecDeque<DriverFault>>,
    open_faults: VecDeque<DriverFault>,
    delays: HashMap<&'static str, Duration>,
    next_delays: HashMap<&'static str, VecDeque<Duration>>,
    auto_complete: bool,
    invalid_outputs: bool,
    log: Vec<RecordedCall>,
}

/// In-process vertex device
#[derive(Debug)]
pub struct SoftwareDevice {
    state: Mutex<State>,
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareDevice {
    /// Create a device that completes every queued request immediately
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_fd: FIRST_FD,
                next_unique_id: 1,
                open_fds: HashSet::new(),
                queues: HashMap::new(),
                faults: HashMap::new(),
                open_faults: VecDeque::new(),
                delays: HashMap::new(),
                next_delays: HashMap::new(),
                auto_complete: true,
                invalid_outputs: false,
                log: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next request named `request` (e.g. `"S_GRAPH"`)
    pub fn fail_next(&self, request: &'static str, ret: i32, errno: i32) {
        self.state()
            .faults
            .entry(request)
            .or_default()
            .push_back(DriverFault::new(ret, errno));
    }

    /// Fail the next open()
    pub fn fail_next_open(&self, errno: i32) {
        self.state().open_faults.push_back(DriverFault::new(-1, errno));
    }

    /// Sleep for `delay` inside every request named `request`
    pub fn delay(&self, request: &'static str, delay: Duration) {
        self.state().delays.insert(request, delay);
    }

    /// Sleep for `delay` inside the next request named `request` only
    ///
    /// Queued one-shot delays apply in order and take precedence over
    /// [`Self::delay`].
    pub fn delay_next(&self, request: &'static str, delay: Duration) {
        self.state()
            .next_delays
            .entry(request)
            .or_default()
            .push_back(delay);
    }

    /// When false, QBUF leaves requests pending until [`Self::complete_pending`]
    pub fn set_auto_complete(&self, enabled: bool) {
        self.state().auto_complete = enabled;
    }

    /// Mark every output completion with the INVALID flag
    pub fn set_invalid_outputs(&self, enabled: bool) {
        self.state().invalid_outputs = enabled;
    }

    /// Complete everything queued on `fd`
    pub fn complete_pending(&self, fd: RawFd) {
        let mut state = self.state();
        if let Some(q) = state.queues.get_mut(&fd) {
            while let Some(c) = q.pending_in.pop_front() {
                q.done_in.push_back(c);
            }
            while let Some(c) = q.pending_out.pop_front() {
                q.done_out.push_back(c);
            }
        }
    }

    /// Every call so far
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().log.clone()
    }

    /// Number of calls named `request`
    pub fn count(&self, request: &str) -> usize {
        self.state()
            .log
            .iter()
            .filter(|c| c.request.name() == request)
            .count()
    }

    /// Currently open session fds
    pub fn open_fds(&self) -> usize {
        self.state().open_fds.len()
    }

    fn take_fault(state: &mut State, name: &'static str) -> Option<DriverFault> {
        state.faults.get_mut(name).and_then(VecDeque::pop_front)
    }
}

impl Vs4lDevice for SoftwareDevice {
    fn open(&self) -> DeviceResult<RawFd> {
        let mut state = self.state();
        if let Some(fault) = state.open_faults.pop_front() {
            return Err(fault);
        }
        let fd = state.next_fd;
        state.next_fd += 1;
        state.open_fds.insert(fd);
        state.queues.insert(fd, SessionQueues::default());
        debug!("virtual vertex: opened fd {fd}");
        Ok(fd)
    }

    fn close(&self, fd: RawFd) -> DeviceResult<()> {
        let mut state = self.state();
        if let Some(fault) = Self::take_fault(&mut state, "CLOSE") {
            state.open_fds.remove(&fd);
            return Err(fault);
        }
        if !state.open_fds.remove(&fd) {
            return Err(DriverFault::new(-1, libc::EBADF));
        }
        state.queues.remove(&fd);
        debug!("virtual vertex: closed fd {fd}");
        Ok(())
    }

    fn ioctl(&self, fd: RawFd, request: &mut Vs4lRequest) -> DeviceResult<()> {
        let name = request.name();
        let delay = {
            let mut state = self.state();
            match state.next_delays.get_mut(name).and_then(VecDeque::pop_front) {
                Some(delay) => Some(delay),
                None => state.delays.get(name).copied(),
            }
        };
        if let Some(delay) = delay {
            trace!("virtual vertex: {name} sleeping {delay:?}");
            std::thread::sleep(delay);
        }

        let mut state = self.state();
        if !state.open_fds.contains(&fd) {
            return Err(DriverFault::new(-1, libc::EBADF));
        }

        let result = match Self::take_fault(&mut state, name) {
            Some(fault) => Err(fault),
            None => Self::apply(&mut state, fd, request),
        };

        state.log.push(RecordedCall {
            fd,
            request: request.clone(),
        });
        result
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Software
    }
}

impl SoftwareDevice {
    fn apply(state: &mut State, fd: RawFd, request: &mut Vs4lRequest) -> DeviceResult<()> {
        let auto_complete = state.auto_complete;
        let invalid = state.invalid_outputs;
        match request {
            Vs4lRequest::SetGraph(frame) => {
                frame.share.id = state.next_unique_id;
                state.next_unique_id += 1;
            }
            Vs4lRequest::Qbuf(frame) => {
                let q = state.queues.entry(fd).or_default();
                let mut completion = Completion {
                    index: frame.index,
                    id: frame.id,
                    flags: 1 << cl_flag::DONE,
                };
                if frame.direction == VS4L_DIRECTION_IN {
                    if auto_complete {
                        q.done_in.push_back(completion);
                    } else {
                        q.pending_in.push_back(completion);
                    }
                } else {
                    if invalid {
                        completion.flags |= 1 << cl_flag::INVALID;
                    }
                    if auto_complete {
                        q.done_out.push_back(completion);
                    } else {
                        q.pending_out.push_back(completion);
                    }
                }
            }
            Vs4lRequest::Dqbuf(frame) => {
                let q = state.queues.entry(fd).or_default();
                let done = if frame.direction == VS4L_DIRECTION_IN {
                    q.done_in.pop_front()
                } else {
                    q.done_out.pop_front()
                };
                let Some(c) = done else {
                    return Err(DriverFault::new(-1, libc::EWOULDBLOCK));
                };
                frame.index = c.index;
                frame.id = c.id;
                frame.flags = c.flags;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ContainerListFrame;
    use vs4l_abi::wire::VS4L_DIRECTION_OT;

    #[test]
    fn dqbuf_without_completion_would_block() {
        let dev = SoftwareDevice::new();
        let fd = dev.open().unwrap();
        let mut req = Vs4lRequest::Dqbuf(ContainerListFrame::dequeue(VS4L_DIRECTION_IN));
        let fault = dev.ioctl(fd, &mut req).unwrap_err();
        assert!(fault.would_block());
    }

    #[test]
    fn qbuf_round_trips_through_dqbuf() {
        let dev = SoftwareDevice::new();
        let fd = dev.open().unwrap();
        let frame = ContainerListFrame {
            direction: VS4L_DIRECTION_OT,
            id: 9,
            index: 3,
            ..ContainerListFrame::default()
        };
        dev.ioctl(fd, &mut Vs4lRequest::Qbuf(frame)).unwrap();

        let mut req = Vs4lRequest::Dqbuf(ContainerListFrame::dequeue(VS4L_DIRECTION_OT));
        dev.ioctl(fd, &mut req).unwrap();
        let Vs4lRequest::Dqbuf(out) = req else {
            unreachable!()
        };
        assert_eq!((out.index, out.id), (3, 9));
        assert!(cl_flag::is_set(out.flags, cl_flag::DONE));
    }

    #[test]
    fn scripted_fault_fires_once() {
        let dev = SoftwareDevice::new();
        let fd = dev.open().unwrap();
        dev.fail_next("STREAM_ON", -1, libc::EIO);
        assert!(dev.ioctl(fd, &mut Vs4lRequest::StreamOn).is_err());
        assert!(dev.ioctl(fd, &mut Vs4lRequest::StreamOn).is_ok());
        assert_eq!(dev.count("STREAM_ON"), 2);
    }

    #[test]
    fn close_unknown_fd_fails() {
        let dev = SoftwareDevice::new();
        assert_eq!(dev.close(7).unwrap_err().errno, libc::EBADF);
    }
}
