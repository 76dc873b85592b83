#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EfpgaError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("tensor shape mismatch")]
    ShapeMismatch,
    #[error("accelerator timeout")]
    Timeout,
    #[error("unsupported operation")]
    Unsupported,
}
