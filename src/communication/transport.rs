//! The `Transport` trait: the only way the parallel layer talks to other
//! ranks. Every operation is synchronous and must be called by every rank
//! participating in the communicator, in the same order, or the run
//! deadlocks or returns [`crate::error::SolverError::ProtocolMismatch`].

use crate::communication::Rank;
use crate::error::Result;

pub trait Transport {
    fn rank(&self) -> Rank;
    fn size(&self) -> i32;

    fn other_ranks(&self) -> Vec<Rank> {
        (0..self.size()).filter(|&r| r != self.rank()).collect()
    }

    /// Gather a variable-length contribution from every rank into one
    /// buffer on every rank, ordered by sending rank.
    fn all_gather_varcount(&self, contribution: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Exchange fixed-size messages with every other rank: `payload[rank]`
    /// is sent to `rank`, and the returned vector holds what every rank
    /// sent back, indexed the same way.
    fn all_to_all(&self, payload: &[Vec<u8>]) -> Result<Vec<Vec<u8>>>;

    /// Paired point-to-point exchange by explicit send/receive byte
    /// counts: `sends[peer]` is delivered to `peer`, and this call blocks
    /// until `receive_counts[peer]` bytes have arrived from every `peer`.
    fn exchange(&self, sends: &[(Rank, Vec<u8>)], receive_counts: &[(Rank, usize)]) -> Result<Vec<(Rank, Vec<u8>)>>;

    /// Sum a single `f64` across every rank; every rank receives the same
    /// total. Used for the parallel walk's termination vote.
    fn all_reduce_sum(&self, value: f64) -> Result<f64>;
}
