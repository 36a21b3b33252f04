use thiserror::Error;

use crate::dtype::DataType;

#[derive(Error, Debug)]
pub enum TensorError {
    #[error("Storage is read-only")]
    ReadOnly,

    #[error("Tensor state is corrupted: {0}")]
    Corrupted(String),

    #[error("Cannot return a dense array: {0}")]
    DynamicShape(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("Invalid sample shape: {0}")]
    InvalidShape(String),

    #[error("Sample dtype {got} does not match tensor dtype {expected}")]
    InvalidDtype { expected: DataType, got: DataType },

    #[error("No tensor found under key '{0}'")]
    NotFound(String),

    #[error("A tensor already exists under key '{0}'")]
    AlreadyExists(String),

    #[error("Index addresses {index} samples but {samples} samples were provided")]
    LengthMismatch { index: usize, samples: usize },

    #[error("Sample index {index} is out of bounds for tensor of length {length}")]
    OutOfBounds { index: i64, length: u64 },

    #[error("Serialized sample is {nbytes} bytes, exceeding the max chunk size of {max}")]
    SampleTooLarge { nbytes: u64, max: u64 },

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("Could not (de)serialize tensor meta")]
    Meta(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TensorError>;
