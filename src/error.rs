use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArgument,
    #[error(
        "failed to change memory limit to {limit}: could not free up enough memory for the new limit{postscript}"
    )]
    OutOfMemory { limit: usize, postscript: String },
}
