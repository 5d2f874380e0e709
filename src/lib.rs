/*!
# geonorm

Geometric normalization and group template-building core for a neuroimaging
pipeline, plus a lead-field-driven synthetic EEG / current-density generator
sharing the same optimization core.

 */

use thiserror::Error;

pub mod dipole;
pub mod generator;
pub mod leadfield;
pub mod matrix;
pub mod optimizer;
pub mod param;
pub mod planesearch;
pub mod points;
pub mod template;
pub mod volume;

#[doc(inline)]
pub use dipole::Dipole;
#[doc(inline)]
pub use matrix::{AffineMatrix, MatrixAnalysis, MultiplySide};
#[doc(inline)]
pub use optimizer::{GlobalOptimize, GoMethod};
#[doc(inline)]
pub use param::{ParameterId, ParameterModel};

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("corrupt file format: {0}")]
    CorruptFormat(String),
    #[error("file I/O failed")]
    Io(#[from] std::io::Error),
    #[error("serialization failed")]
    Bincode(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
