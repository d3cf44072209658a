use thiserror::Error;

use crate::storage::IdentityId;

#[derive(Error, Debug)]
pub enum FaceGateError {
    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Cascade error: {0}")]
    Cascade(String),

    #[error("Classifier has not been trained")]
    NotTrained,

    #[error("Cannot train on an empty corpus")]
    EmptyCorpus,

    #[error("Invalid sample: {0}")]
    InvalidSample(String),

    #[error("Invalid identity name: {0:?}")]
    InvalidName(String),

    #[error("Unknown identity: {0}")]
    UnknownIdentity(IdentityId),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FaceGateError>;
