//! Fatal error kinds for the solver (§7). None of these are retryable: a
//! partial walk leaves the particle container inconsistent and the caller
//! must redo the whole force evaluation.

use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum SolverError {
    /// The node pool could not grow further.
    Allocation { requested: usize },
    /// Two distinct real particles could not be separated within the
    /// insertion depth cap because they sit at (near-)identical coordinates.
    DegenerateInsertion {
        particle_a: usize,
        particle_b: usize,
        depth: usize,
    },
    /// Ranks disagree about top-tree shape or exchange sizes.
    ProtocolMismatch(String),
    /// Rejected at `configure()` time.
    Configuration(String),
}

impl fmt::Display for SolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolverError::Allocation { requested } => {
                write!(f, "node pool allocation failed, requested {requested} nodes")
            }
            SolverError::DegenerateInsertion {
                particle_a,
                particle_b,
                depth,
            } => write!(
                f,
                "particles {particle_a} and {particle_b} could not be separated after {depth} splits (identical coordinates?)"
            ),
            SolverError::ProtocolMismatch(msg) => write!(f, "protocol mismatch between ranks: {msg}"),
            SolverError::Configuration(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl Error for SolverError {}

pub type Result<T> = std::result::Result<T, SolverError>;
