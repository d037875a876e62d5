use crate::{DType, DeviceError};

/// Main library error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{op}: {msg}")]
    InvalidArgument { op: &'static str, msg: String },

    #[error("index {index} out of bounds for storage of size {size}")]
    IndexOutOfRange { index: i64, size: i64 },

    #[error("allocation of {requested} bytes of {dtype:?} storage failed: {source}")]
    AllocationFailure {
        requested: usize,
        dtype: DType,
        #[source]
        source: DeviceError,
    },

    #[error("{op} is not supported for device storage")]
    UnsupportedOperation { op: &'static str },

    /// Device runtime failure while an invariant is mid-flight. Not
    /// recoverable by this crate; the caller is expected to escalate.
    #[error("fatal device error in {op}: {source}")]
    FatalDevice {
        op: &'static str,
        #[source]
        source: DeviceError,
    },

    #[error("the candle-storage crate has not been built with cuda support")]
    NotCompiledWithCudaSupport,
}

pub type Result<T> = std::result::Result<T, Error>;
