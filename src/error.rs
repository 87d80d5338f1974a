use std::io;

/// Errors raised while building, running or training a network.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two matrices that must agree in shape don't.
    #[error("shape mismatch in {op}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        op: &'static str,
        expected: (usize, usize),
        got: (usize, usize),
    },

    /// `backward` was called on a layer that never ran `forward`.
    #[error("{0}: backward called before forward")]
    BackwardBeforeForward(&'static str),

    /// Filter, stride and padding don't tile the input.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("dataset is empty")]
    EmptyDataset,

    #[error("MNIST: {0}")]
    Mnist(#[from] MnistError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Problems found while decoding IDX files.
#[derive(Debug, thiserror::Error)]
pub enum MnistError {
    #[error("invalid magic: expected {expected:#010x}, got {got:#010x}")]
    InvalidMagic { expected: u32, got: u32 },

    /// Header dimensions whose product doesn't fit in memory.
    #[error("invalid dimensions: {count} images of {rows}x{cols}")]
    InvalidDims { count: u32, rows: u32, cols: u32 },

    #[error("{images} images but {labels} labels")]
    CountMismatch { images: usize, labels: usize },

    #[error("no file named {0} (or {0}.gz)")]
    MissingFile(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn shape(op: &'static str, expected: (usize, usize), got: (usize, usize)) -> Self {
        Error::ShapeMismatch { op, expected, got }
    }
}

/// Fails with [`Error::ShapeMismatch`] unless both shapes agree.
pub(crate) fn ensure_shape(
    op: &'static str,
    expected: (usize, usize),
    got: (usize, usize),
) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(Error::shape(op, expected, got))
    }
}
