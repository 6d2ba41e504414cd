//! Transport abstraction (§4.6): the four collective/point-to-point
//! primitives the parallel walk needs, with an in-process channel backend
//! for tests and the CLI demo and a real MPI backend behind the `mpi`
//! feature.

mod transport;

#[cfg(feature = "local")]
pub mod local;
#[cfg(feature = "mpi")]
pub mod mpi_backend;

pub use transport::Transport;

pub type Rank = i32;
