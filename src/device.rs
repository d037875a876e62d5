//! Device capabilities consumed by [`Storage`](crate::Storage).
//!
//! The storage layer never talks to a device runtime directly. It is
//! handed two capabilities instead: a [`DeviceContext`] answering the
//! current device/stream queries and moving single elements across the
//! host/device boundary, and a [`DeviceAllocator`] providing the device
//! memory itself. Both are injected explicitly so tests can substitute
//! host-backed implementations, see [`test_utils`](crate::test_utils).

use std::ffi::c_void;
use std::sync::Arc;

/// Unique identifier for accelerator devices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceId(usize);

impl DeviceId {
    pub fn new(ordinal: usize) -> Self {
        Self(ordinal)
    }

    pub fn ordinal(&self) -> usize {
        self.0
    }
}

/// Opaque handle to an execution stream, an ordered queue of
/// asynchronous device operations.
///
/// The raw value is whatever the backing runtime uses to identify the
/// stream, e.g. a `CUstream` pointer on cuda devices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(usize);

impl StreamId {
    pub fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> usize {
        self.0
    }
}

/// Status codes surfaced by the device runtime.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("out of device memory when allocating {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("device driver error {code} in {op}")]
    Driver { op: &'static str, code: i32 },

    #[error("device runtime unavailable: {msg}")]
    Unavailable { msg: &'static str },

    #[error("{0}")]
    Msg(String),
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Allocation capability for device memory.
///
/// An allocator carries its own state (pool, arena, bookkeeping) in the
/// implementing type; the same instance is shared by reference across
/// every storage created through it and must support concurrent calls
/// from arbitrary threads.
pub trait DeviceAllocator: Send + Sync {
    /// Allocates `size_in_bytes` bytes of device memory, enqueued on
    /// `stream` for stream-ordered allocators.
    fn malloc(&self, size_in_bytes: usize, stream: StreamId) -> DeviceResult<*mut c_void>;

    /// Releases memory previously returned by `malloc`. Must accept a
    /// null pointer as a no-op.
    fn free(&self, ptr: *mut c_void) -> DeviceResult<()>;
}

/// Runtime queries and element transfers for one accelerator device.
///
/// Stands in for the process-wide "current device / current stream"
/// state of a device runtime; constructors and element accessors take
/// it as an explicit parameter.
pub trait DeviceContext: Send + Sync {
    /// The device new allocations land on.
    fn current_device(&self) -> DeviceResult<DeviceId>;

    /// The device owning an existing memory address.
    fn device_for_ptr(&self, ptr: *const c_void) -> DeviceResult<DeviceId>;

    /// The stream async copies and allocations are tagged with.
    fn current_stream(&self) -> DeviceResult<StreamId>;

    /// The allocator used when the caller does not supply one.
    fn default_allocator(&self) -> Arc<dyn DeviceAllocator>;

    /// Enqueues an asynchronous host-to-device copy on `stream`.
    ///
    /// # Safety
    ///
    /// `src` must be readable for `len` bytes until the stream drained,
    /// `dst` must be device memory writable for `len` bytes.
    unsafe fn copy_to_device(
        &self,
        dst: *mut c_void,
        src: *const c_void,
        len: usize,
        stream: StreamId,
    ) -> DeviceResult<()>;

    /// Enqueues an asynchronous device-to-host copy on `stream`.
    ///
    /// # Safety
    ///
    /// `src` must be device memory readable for `len` bytes, `dst` must
    /// be writable for `len` bytes until the stream drained.
    unsafe fn copy_to_host(
        &self,
        dst: *mut c_void,
        src: *const c_void,
        len: usize,
        stream: StreamId,
    ) -> DeviceResult<()>;

    /// Blocks until every operation queued on `stream` completed.
    fn synchronize(&self, stream: StreamId) -> DeviceResult<()>;
}
