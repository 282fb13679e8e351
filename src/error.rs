//! src/error.rs
//! This module defines the custom error types for the whole engine.
//! By using a centralized error enum, configuration and resource failures are
//! reported as recoverable Results; the binary prints the message and exits
//! non-zero instead of panicking somewhere inside a worker.

use thiserror::Error;

/// The primary error type for all fallible operations in this crate.
#[derive(Error, Debug)]
pub enum KpmError {
    // --- I/O and container errors ---
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse job container '{file}': {message}")]
    ContainerParse { file: String, message: String },

    #[error("Missing required dataset '{0}' in the job container")]
    MissingDataset(String),

    // --- Configuration errors ---
    #[error("Invalid direction string '{0}': only 'x', 'y', 'z' and ',' are allowed")]
    InvalidDirection(String),

    #[error("Direction component {axis} exceeds the lattice dimension {dim}")]
    DirectionOutOfRange { axis: usize, dim: usize },

    #[error("Lattice dimension must be 1, 2 or 3, got {0}")]
    InvalidDimension(usize),

    #[error("Unsupported precision code {0} (0 = single, 1 = double)")]
    UnsupportedPrecision(usize),

    #[error("A magnetic field requires complex amplitudes (IS_COMPLEX = 1)")]
    MagneticFieldNeedsComplex,

    #[error("Hopping amplitudes carry an imaginary part but IS_COMPLEX = 0")]
    ComplexAmplitudeNeedsComplex,

    #[error("Impurity pattern node at offset {offset:?} reaches beyond the ghost width {nghosts}")]
    PatternExceedsGhosts { offset: [i32; 3], nghosts: usize },

    #[error("Number of moments must be even, got {0}")]
    OddMomentCount(usize),

    #[error("Bulk extent {extent} along axis {axis} is not divisible by the tile side {stride}")]
    BulkNotTileable {
        axis: usize,
        extent: usize,
        stride: usize,
    },

    #[error("Global extent {extent} along axis {axis} is not divisible by the thread grid {threads}")]
    ExtentNotDivisible {
        axis: usize,
        extent: usize,
        threads: usize,
    },

    #[error("A hopping reaches {reach} cells along axis {axis} but the ghost width is {nghosts}")]
    HoppingExceedsGhosts {
        axis: usize,
        reach: usize,
        nghosts: usize,
    },

    #[error("Quantity '{name}': {moments} moment counts given for {factors} direction factors")]
    MomentRankMismatch {
        name: String,
        moments: usize,
        factors: usize,
    },

    #[error("Orbital index {orb} is out of range for a model with {norb} orbitals")]
    OrbitalOutOfRange { orb: usize, norb: usize },

    #[error("Quantity '{0}' asks for a moment tensor of rank {1}; only ranks 1..=3 are supported")]
    UnsupportedRank(String, usize),

    #[error("Single-shot quantity '{0}' needs an energy list and a broadening")]
    MissingSingleShotData(String),

    // --- Resource errors ---
    #[error("Cannot allocate {slots} recursion slots of {amplitudes} amplitudes each ({bytes} bytes)")]
    VectorAllocation {
        slots: usize,
        amplitudes: usize,
        bytes: usize,
    },
}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, KpmError>;
