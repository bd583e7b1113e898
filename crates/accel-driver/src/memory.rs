//! Shareable buffers and memory handle validation
//!
//! The vertex driver takes buffers as dma-buf fds plus the caller's mapping
//! address. [`IonBuffer`] produces such a pair from a sealed-size memfd, which
//! the runtime uses for its own allocations: the model copy handed to
//! S_GRAPH and the DSP parameter tables.
//!
//! Caller buffers arrive as [`Memory`] handles and are checked by
//! [`validate_memory_set`] and, for ION handles, by [`is_valid_ion_buffer`]:
//! the fd is mapped again and its first byte compared against the caller's
//! address, which catches a stale fd/address pair before the kernel sees it.

// Buffer sizes and fds are C integers on the wire
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use crate::error::{AccelError, Result};
use rustix::fs::{ftruncate, memfd_create, MemfdFlags};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::ptr::NonNull;
use tracing::{debug, error};

/// Caller buffer handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Memory {
    /// dma-buf fd with its mapped address
    Ion {
        /// dma-buf fd
        fd: RawFd,
        /// Mapped address
        addr: u64,
        /// Size in bytes
        size: u32,
    },
    /// Plain process memory
    UserHeap {
        /// Address
        addr: u64,
        /// Size in bytes
        size: u32,
    },
}

impl Memory {
    /// dma-buf fd, or -1 for heap memory
    pub const fn fd(&self) -> RawFd {
        match self {
            Self::Ion { fd, .. } => *fd,
            Self::UserHeap { .. } => -1,
        }
    }

    /// Mapped address
    pub const fn addr(&self) -> u64 {
        match self {
            Self::Ion { addr, .. } | Self::UserHeap { addr, .. } => *addr,
        }
    }

    /// Size in bytes
    pub const fn size(&self) -> u32 {
        match self {
            Self::Ion { size, .. } | Self::UserHeap { size, .. } => *size,
        }
    }

    const fn is_ion(&self) -> bool {
        matches!(self, Self::Ion { .. })
    }
}

/// Check a set of handles passed to prepare/execute
///
/// An empty set is valid. ION handles need `fd > 0` and a non-null address,
/// heap handles a non-null address. A set mixing kinds is rejected.
///
/// # Errors
///
/// Returns [`AccelError::InvalidMemory`] naming the offending handle.
pub fn validate_memory_set(memories: &[Memory]) -> Result<()> {
    let Some(first) = memories.first() else {
        return Ok(());
    };

    for (i, mem) in memories.iter().enumerate() {
        if mem.is_ion() != first.is_ion() {
            return Err(AccelError::invalid_memory(format!(
                "memory[{i}] kind differs from memory[0]"
            )));
        }
        match *mem {
            Memory::Ion { fd, addr, .. } if fd <= 0 || addr == 0 => {
                error!("memory[{i}] ION fd({fd}) or addr({addr:#x}) invalid");
                return Err(AccelError::invalid_memory(format!(
                    "memory[{i}] ION fd {fd} addr {addr:#x}"
                )));
            }
            Memory::UserHeap { addr: 0, .. } => {
                error!("memory[{i}] heap address is null");
                return Err(AccelError::invalid_memory(format!("memory[{i}] null heap")));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Liveness check for an ION handle
///
/// Maps `fd` and compares its first byte with the byte at `addr`. Returns
/// false for a negative fd, zero size, null address, failed mapping or a
/// mismatch.
pub fn is_valid_ion_buffer(fd: RawFd, size: u32, addr: u64) -> bool {
    if fd < 0 || size == 0 || addr == 0 {
        error!("invalid ION handle: fd({fd}) size({size}) addr({addr:#x})");
        return false;
    }

    // SAFETY: fd >= 0 checked above; the borrow does not outlive this call
    // and the fd is not closed here.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };

    // SAFETY: fresh shared mapping of `size` bytes of a caller fd; the
    // mapping is private to this function and unmapped before returning.
    let mapped = unsafe {
        mmap(
            std::ptr::null_mut(),
            size as usize,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            borrowed,
            0,
        )
    };
    let mapped = match mapped {
        Ok(p) => p,
        Err(e) => {
            error!("ION check mmap failed for fd {fd}: {e}");
            return false;
        }
    };

    // SAFETY: `mapped` is at least one byte long and still mapped.
    let ours = unsafe { *mapped.cast::<u8>() };
    let same = read_own_byte(addr).is_some_and(|theirs| theirs == ours);

    // SAFETY: exact pointer and length returned by mmap above.
    if let Err(e) = unsafe { munmap(mapped, size as usize) } {
        error!("ION check munmap failed: {e}");
    }

    if !same {
        error!("ION fd {fd} does not back address {addr:#x}");
    }
    same
}

/// Read one byte at `addr` of this process without faulting
///
/// Goes through `process_vm_readv` on our own pid, so an unmapped address
/// comes back as `EFAULT` instead of a SIGSEGV.
fn read_own_byte(addr: u64) -> Option<u8> {
    let mut byte = 0u8;
    let local = libc::iovec {
        iov_base: std::ptr::addr_of_mut!(byte).cast(),
        iov_len: 1,
    };
    let remote = libc::iovec {
        iov_base: addr as usize as *mut libc::c_void,
        iov_len: 1,
    };
    // SAFETY: both iovecs describe one byte; the kernel validates `remote`
    // and writes only into `byte`.
    let read = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
    if read == 1 {
        Some(byte)
    } else {
        error!(
            "ION address {addr:#x} is not readable: {}",
            std::io::Error::last_os_error()
        );
        None
    }
}

/// Runtime-owned shareable buffer (memfd mapped `MAP_SHARED`)
///
/// Dropping the buffer unmaps it and closes the fd.
#[derive(Debug)]
pub struct IonBuffer {
    fd: OwnedFd,
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: the mapping is owned exclusively by this value; shared access only
// reads through `&self`, writes need `&mut self`.
unsafe impl Send for IonBuffer {}
// SAFETY: see Send; no interior mutability through `&self`.
unsafe impl Sync for IonBuffer {}

impl IonBuffer {
    /// Allocate a zero-filled buffer of `size` bytes
    ///
    /// # Errors
    ///
    /// Returns an error for a zero size or if memfd/mmap fail.
    pub fn allocate(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(AccelError::invalid_memory(format!("{name}: zero-sized buffer")));
        }

        let fd = memfd_create(name, MemfdFlags::CLOEXEC)
            .map_err(|e| AccelError::invalid_memory(format!("{name}: memfd_create: {e}")))?;
        ftruncate(&fd, size as u64)
            .map_err(|e| AccelError::invalid_memory(format!("{name}: ftruncate: {e}")))?;

        // SAFETY: fd is a fresh memfd of exactly `size` bytes; the mapping is
        // owned by the returned value and unmapped in Drop.
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd.as_fd(),
                0,
            )
        }
        .map_err(|e| AccelError::invalid_memory(format!("{name}: mmap: {e}")))?;

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| AccelError::invalid_memory(format!("{name}: mmap returned null")))?;

        debug!("Allocated {name}: {size} bytes, fd {}", fd.as_raw_fd());
        Ok(Self { fd, ptr, size })
    }

    /// Allocate a buffer holding a copy of `data`
    ///
    /// # Errors
    ///
    /// Same as [`IonBuffer::allocate`].
    pub fn from_bytes(name: &str, data: &[u8]) -> Result<Self> {
        let mut buf = Self::allocate(name, data.len())?;
        buf.as_mut_slice().copy_from_slice(data);
        Ok(buf)
    }

    /// dma-buf style fd
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Mapped address as the driver sees it
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Size in bytes
    pub const fn len(&self) -> usize {
        self.size
    }

    /// Never true; zero-sized buffers are rejected at allocation
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Handle for passing this buffer as caller memory
    pub fn memory(&self) -> Memory {
        Memory::Ion {
            fd: self.raw_fd(),
            addr: self.addr(),
            size: self.size as u32,
        }
    }

    /// Buffer contents
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is a live mapping of `size` bytes owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    /// Mutable buffer contents
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for IonBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr/size are exactly what mmap returned in allocate().
        if let Err(e) = unsafe { munmap(self.ptr.as_ptr().cast(), self.size) } {
            error!("munmap of {} bytes failed: {e}", self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_is_valid() {
        assert!(validate_memory_set(&[]).is_ok());
    }

    #[test]
    fn ion_handle_needs_fd_and_address() {
        let bad_fd = Memory::Ion { fd: 0, addr: 0x1000, size: 4 };
        let bad_addr = Memory::Ion { fd: 5, addr: 0, size: 4 };
        assert!(validate_memory_set(&[bad_fd]).is_err());
        assert!(validate_memory_set(&[bad_addr]).is_err());
        assert!(validate_memory_set(&[Memory::Ion { fd: 5, addr: 0x1000, size: 4 }]).is_ok());
    }

    #[test]
    fn heap_handle_needs_address() {
        assert!(validate_memory_set(&[Memory::UserHeap { addr: 0, size: 4 }]).is_err());
        assert!(validate_memory_set(&[Memory::UserHeap { addr: 0x10, size: 4 }]).is_ok());
    }

    #[test]
    fn mixed_kinds_are_rejected() {
        let set = [
            Memory::Ion { fd: 5, addr: 0x1000, size: 4 },
            Memory::UserHeap { addr: 0x10, size: 4 },
        ];
        assert!(validate_memory_set(&set).is_err());
    }

    #[test]
    fn ion_buffer_passes_its_own_check() {
        let mut buf = IonBuffer::allocate("own", 64).unwrap();
        buf.as_mut_slice()[0] = 0x5A;
        assert!(is_valid_ion_buffer(buf.raw_fd(), 64, buf.addr()));
    }

    #[test]
    fn check_rejects_foreign_address() {
        let mut a = IonBuffer::allocate("a", 16).unwrap();
        let mut b = IonBuffer::allocate("b", 16).unwrap();
        a.as_mut_slice()[0] = 1;
        b.as_mut_slice()[0] = 2;
        assert!(!is_valid_ion_buffer(a.raw_fd(), 16, b.addr()));
    }

    #[test]
    fn unmapped_address_is_invalid_not_a_crash() {
        let buf = IonBuffer::allocate("live", 16).unwrap();
        assert!(!is_valid_ion_buffer(buf.raw_fd(), 16, 0x10));
        assert_eq!(read_own_byte(0x10), None);
    }

    #[test]
    fn check_rejects_bad_arguments() {
        assert!(!is_valid_ion_buffer(-1, 16, 0x1000));
        assert!(!is_valid_ion_buffer(3, 0, 0x1000));
        assert!(!is_valid_ion_buffer(3, 16, 0));
    }

    #[test]
    fn from_bytes_copies_payload() {
        let buf = IonBuffer::from_bytes("copy", b"TSGD").unwrap();
        assert_eq!(buf.as_slice(), b"TSGD");
        assert_eq!(buf.len(), 4);
    }
}
