use aws_sdk_s3::error::DisplayErrorContext;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum S3Error {
    /// Request failed (network, auth, missing bucket, ...)
    #[error("S3 request failed: {0}")]
    Request(String),

    /// A request could not be built from the given input
    #[error("invalid S3 request: {0}")]
    Build(#[from] aws_sdk_s3::error::BuildError),
}

impl S3Error {
    pub(crate) fn request<E>(err: E) -> Self
    where
        E: std::error::Error,
    {
        S3Error::Request(DisplayErrorContext(err).to_string())
    }
}

pub type Result<T> = std::result::Result<T, S3Error>;
