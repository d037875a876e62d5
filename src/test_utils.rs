//! Host backed implementations of the device capabilities.
//!
//! Ordinary host memory stands in for device memory and every stream
//! completes synchronously, which makes the storage layer fully
//! exercisable without an accelerator. Used by the test-suite and the
//! benches, and useful for downstream crates doing the same.

use std::alloc::Layout;
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::{DeviceAllocator, DeviceContext, DeviceError, DeviceId, DeviceResult, StreamId};

// Generous enough for every dtype this crate instantiates.
const HOST_ALIGN: usize = 16;

/// Allocator over the host heap.
///
/// Device allocators release by pointer alone, so the layout of every
/// live allocation is kept on the side.
#[derive(Debug, Default)]
pub struct CpuAllocator {
    live: Mutex<HashMap<usize, Layout>>,
}

impl DeviceAllocator for CpuAllocator {
    fn malloc(&self, size_in_bytes: usize, _stream: StreamId) -> DeviceResult<*mut c_void> {
        let layout = Layout::from_size_align(size_in_bytes.max(1), HOST_ALIGN)
            .map_err(|err| DeviceError::Msg(err.to_string()))?;
        let ptr = unsafe { std::alloc::alloc(layout) };
        if ptr.is_null() {
            return Err(DeviceError::OutOfMemory {
                requested: size_in_bytes,
            });
        }
        self.live.lock().unwrap().insert(ptr as usize, layout);
        Ok(ptr as *mut c_void)
    }

    fn free(&self, ptr: *mut c_void) -> DeviceResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        match self.live.lock().unwrap().remove(&(ptr as usize)) {
            Some(layout) => {
                unsafe { std::alloc::dealloc(ptr as *mut u8, layout) };
                Ok(())
            }
            None => Err(DeviceError::Msg(format!("free of unknown pointer {ptr:?}"))),
        }
    }
}

/// Wraps an allocator and counts calls, so tests can assert that
/// teardown released a buffer exactly once, or not at all.
pub struct CountingAllocator {
    inner: Arc<dyn DeviceAllocator>,
    mallocs: AtomicUsize,
    frees: AtomicUsize,
}

impl CountingAllocator {
    pub fn new(inner: Arc<dyn DeviceAllocator>) -> Self {
        Self {
            inner,
            mallocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
        }
    }

    /// Counting allocator over a fresh [`CpuAllocator`].
    pub fn host() -> Self {
        Self::new(Arc::new(CpuAllocator::default()))
    }

    pub fn mallocs(&self) -> usize {
        self.mallocs.load(Ordering::SeqCst)
    }

    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }
}

impl DeviceAllocator for CountingAllocator {
    fn malloc(&self, size_in_bytes: usize, stream: StreamId) -> DeviceResult<*mut c_void> {
        self.mallocs.fetch_add(1, Ordering::SeqCst);
        self.inner.malloc(size_in_bytes, stream)
    }

    fn free(&self, ptr: *mut c_void) -> DeviceResult<()> {
        self.frees.fetch_add(1, Ordering::SeqCst);
        self.inner.free(ptr)
    }
}

/// Reports every allocation as an out-of-memory condition.
#[derive(Debug, Default)]
pub struct FailingAllocator;

impl DeviceAllocator for FailingAllocator {
    fn malloc(&self, size_in_bytes: usize, _stream: StreamId) -> DeviceResult<*mut c_void> {
        Err(DeviceError::OutOfMemory {
            requested: size_in_bytes,
        })
    }

    fn free(&self, _ptr: *mut c_void) -> DeviceResult<()> {
        Ok(())
    }
}

/// Device context over the host: a single device at ordinal 0 with one
/// stream whose operations complete immediately.
#[derive(Clone)]
pub struct CpuDevice {
    allocator: Arc<CpuAllocator>,
}

impl CpuDevice {
    pub fn new() -> Self {
        Self {
            allocator: Arc::new(CpuAllocator::default()),
        }
    }
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CpuDevice")
    }
}

impl DeviceContext for CpuDevice {
    fn current_device(&self) -> DeviceResult<DeviceId> {
        Ok(DeviceId::new(0))
    }

    fn device_for_ptr(&self, _ptr: *const c_void) -> DeviceResult<DeviceId> {
        Ok(DeviceId::new(0))
    }

    fn current_stream(&self) -> DeviceResult<StreamId> {
        Ok(StreamId::new(0))
    }

    fn default_allocator(&self) -> Arc<dyn DeviceAllocator> {
        self.allocator.clone()
    }

    unsafe fn copy_to_device(
        &self,
        dst: *mut c_void,
        src: *const c_void,
        len: usize,
        _stream: StreamId,
    ) -> DeviceResult<()> {
        std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len);
        Ok(())
    }

    unsafe fn copy_to_host(
        &self,
        dst: *mut c_void,
        src: *const c_void,
        len: usize,
        _stream: StreamId,
    ) -> DeviceResult<()> {
        std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len);
        Ok(())
    }

    fn synchronize(&self, _stream: StreamId) -> DeviceResult<()> {
        Ok(())
    }
}
