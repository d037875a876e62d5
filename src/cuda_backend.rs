//! CUDA implementation of the device capabilities, on top of cudarc.

use std::ffi::c_void;
use std::sync::Arc;

use cudarc::driver::{result, sys, CudaContext, CudaStream, DriverError};

use crate::{
    DeviceAllocator, DeviceContext, DeviceError, DeviceId, DeviceResult, Error, Result, StreamId,
};

impl From<DriverError> for DeviceError {
    fn from(err: DriverError) -> Self {
        DeviceError::Msg(err.to_string())
    }
}

/// Stream-ordered allocator over the driver API.
#[derive(Debug, Default)]
pub struct CudaAllocator;

impl DeviceAllocator for CudaAllocator {
    fn malloc(&self, size_in_bytes: usize, stream: StreamId) -> DeviceResult<*mut c_void> {
        let dptr =
            unsafe { result::malloc_async(stream.as_raw() as sys::CUstream, size_in_bytes) }?;
        Ok(dptr as usize as *mut c_void)
    }

    fn free(&self, ptr: *mut c_void) -> DeviceResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        unsafe { result::free_sync(ptr as usize as sys::CUdeviceptr) }?;
        Ok(())
    }
}

/// One cuda device, pinned to its primary context and default stream.
#[derive(Clone)]
pub struct CudaDevice {
    context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    allocator: Arc<CudaAllocator>,
}

impl std::fmt::Debug for CudaDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CudaDevice({})", self.context.ordinal())
    }
}

impl CudaDevice {
    pub fn new(ordinal: usize) -> Result<Self> {
        let context = CudaContext::new(ordinal).map_err(|err| Error::FatalDevice {
            op: "cuda_init",
            source: err.into(),
        })?;
        let stream = context.default_stream();
        Ok(Self {
            context,
            stream,
            allocator: Arc::new(CudaAllocator),
        })
    }

    pub fn ordinal(&self) -> usize {
        self.context.ordinal()
    }

    pub fn cuda_stream(&self) -> Arc<CudaStream> {
        self.stream.clone()
    }
}

impl DeviceContext for CudaDevice {
    fn current_device(&self) -> DeviceResult<DeviceId> {
        Ok(DeviceId::new(self.context.ordinal()))
    }

    fn device_for_ptr(&self, ptr: *const c_void) -> DeviceResult<DeviceId> {
        let mut ordinal: std::os::raw::c_int = 0;
        let status = unsafe {
            sys::cuPointerGetAttribute(
                &mut ordinal as *mut _ as *mut c_void,
                sys::CUpointer_attribute::CU_POINTER_ATTRIBUTE_DEVICE_ORDINAL,
                ptr as usize as sys::CUdeviceptr,
            )
        };
        if status != sys::CUresult::CUDA_SUCCESS {
            return Err(DeviceError::Msg(format!(
                "cuPointerGetAttribute failed: {status:?}"
            )));
        }
        Ok(DeviceId::new(ordinal as usize))
    }

    fn current_stream(&self) -> DeviceResult<StreamId> {
        Ok(StreamId::new(self.stream.cu_stream() as usize))
    }

    fn default_allocator(&self) -> Arc<dyn DeviceAllocator> {
        self.allocator.clone()
    }

    unsafe fn copy_to_device(
        &self,
        dst: *mut c_void,
        src: *const c_void,
        len: usize,
        stream: StreamId,
    ) -> DeviceResult<()> {
        let src = std::slice::from_raw_parts(src as *const u8, len);
        result::memcpy_htod_async(
            dst as usize as sys::CUdeviceptr,
            src,
            stream.as_raw() as sys::CUstream,
        )?;
        Ok(())
    }

    unsafe fn copy_to_host(
        &self,
        dst: *mut c_void,
        src: *const c_void,
        len: usize,
        stream: StreamId,
    ) -> DeviceResult<()> {
        let dst = std::slice::from_raw_parts_mut(dst as *mut u8, len);
        result::memcpy_dtoh_async(
            dst,
            src as usize as sys::CUdeviceptr,
            stream.as_raw() as sys::CUstream,
        )?;
        Ok(())
    }

    fn synchronize(&self, stream: StreamId) -> DeviceResult<()> {
        unsafe { result::stream::synchronize(stream.as_raw() as sys::CUstream) }?;
        Ok(())
    }
}
