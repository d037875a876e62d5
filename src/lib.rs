//! Reference counted device storage for tensor backends.
//!
//! A [`Storage`] owns a buffer of accelerator memory (or aliases
//! another storage's buffer as a view), tracks its lifetime with a
//! lock-free atomic reference count, and moves single elements across
//! the host/device boundary through the current execution stream.
//!
//! ```rust
//! use candle_storage::test_utils::CpuDevice;
//! use candle_storage::Storage;
//! # fn main() -> candle_storage::Result<()> {
//!
//! let dev = CpuDevice::new();
//! let s = Storage::<f32>::new_with_size3(&dev, 1.0, 2.0, 3.0)?;
//! assert_eq!(s.get(&dev, 1)?, 2.0);
//! s.free()?;
//! # Ok(())}
//! ```
//!
//! The device runtime is consumed through two small capabilities,
//! [`DeviceContext`] and [`DeviceAllocator`], so pooling allocators and
//! host-backed test runtimes plug in without touching the storage
//! logic. The real cuda implementation lives behind the `cuda`
//! feature.

#[cfg(feature = "cuda")]
pub mod cuda_backend;
mod device;
mod dtype;
#[cfg(not(feature = "cuda"))]
pub mod dummy_cuda_backend;
pub mod error;
mod storage;
pub mod test_utils;

pub use device::{
    DeviceAllocator, DeviceContext, DeviceError, DeviceId, DeviceResult, StreamId,
};
pub use dtype::{DType, DTypeParseError, WithDType};
pub use error::{Error, Result};
pub use storage::{Storage, StorageFlags};

#[cfg(feature = "cuda")]
pub use cuda_backend as cuda;

#[cfg(not(feature = "cuda"))]
pub use dummy_cuda_backend as cuda;

pub use cuda::{CudaAllocator, CudaDevice};
