#![allow(dead_code)]
use std::ffi::c_void;
use std::sync::Arc;

use crate::{
    DeviceAllocator, DeviceContext, DeviceId, DeviceResult, Error, Result, StreamId,
};

macro_rules! fail {
    () => {
        unimplemented!("cuda support has not been enabled")
    };
}

#[derive(Debug, Clone)]
pub struct CudaDevice;

impl CudaDevice {
    pub fn new(_ordinal: usize) -> Result<Self> {
        Err(Error::NotCompiledWithCudaSupport)
    }

    pub fn ordinal(&self) -> usize {
        fail!()
    }
}

#[derive(Debug, Default)]
pub struct CudaAllocator;

impl DeviceAllocator for CudaAllocator {
    fn malloc(&self, _size_in_bytes: usize, _stream: StreamId) -> DeviceResult<*mut c_void> {
        fail!()
    }

    fn free(&self, _ptr: *mut c_void) -> DeviceResult<()> {
        fail!()
    }
}

impl DeviceContext for CudaDevice {
    fn current_device(&self) -> DeviceResult<DeviceId> {
        fail!()
    }

    fn device_for_ptr(&self, _ptr: *const c_void) -> DeviceResult<DeviceId> {
        fail!()
    }

    fn current_stream(&self) -> DeviceResult<StreamId> {
        fail!()
    }

    fn default_allocator(&self) -> Arc<dyn DeviceAllocator> {
        fail!()
    }

    unsafe fn copy_to_device(
        &self,
        _dst: *mut c_void,
        _src: *const c_void,
        _len: usize,
        _stream: StreamId,
    ) -> DeviceResult<()> {
        fail!()
    }

    unsafe fn copy_to_host(
        &self,
        _dst: *mut c_void,
        _src: *const c_void,
        _len: usize,
        _stream: StreamId,
    ) -> DeviceResult<()> {
        fail!()
    }

    fn synchronize(&self, _stream: StreamId) -> DeviceResult<()> {
        fail!()
    }
}
