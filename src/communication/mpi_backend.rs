//! The real MPI transport, built on the `mpi` crate's two-sided and
//! collective operations.

use mpi::collective::CommunicatorCollectives;
use mpi::datatype::PartitionMut;
use mpi::point_to_point::Destination;
use mpi::point_to_point::Source;
use mpi::topology::Communicator;
use mpi::Count;

use crate::communication::transport::Transport;
use crate::communication::Rank;
use crate::error::Result;
use crate::error::SolverError;

pub struct MpiTransport<'a> {
    world: &'a mpi::topology::SimpleCommunicator,
}

impl<'a> MpiTransport<'a> {
    pub fn new(world: &'a mpi::topology::SimpleCommunicator) -> Self {
        Self { world }
    }
}

impl<'a> Transport for MpiTransport<'a> {
    fn rank(&self) -> Rank {
        self.world.rank()
    }

    fn size(&self) -> i32 {
        self.world.size()
    }

    fn all_gather_varcount(&self, contribution: &[u8]) -> Result<Vec<Vec<u8>>> {
        let size = self.size() as usize;
        let mut counts_buf = vec![0 as Count; size];
        self.world.all_gather_into(&(contribution.len() as Count), &mut counts_buf[..]);
        let displs: Vec<Count> = counts_buf
            .iter()
            .scan(0, |running, &c| {
                let start = *running;
                *running += c;
                Some(start)
            })
            .collect();
        let total: Count = counts_buf.iter().sum();
        let mut recv_buf = vec![0u8; total as usize];
        {
            let mut partition = PartitionMut::new(&mut recv_buf[..], counts_buf.clone(), &displs[..]);
            self.world.all_gather_varcount_into(contribution, &mut partition);
        }
        let mut result = Vec::with_capacity(size);
        for rank in 0..size {
            let start = displs[rank] as usize;
            let len = counts_buf[rank] as usize;
            result.push(recv_buf[start..start + len].to_vec());
        }
        Ok(result)
    }

    fn all_to_all(&self, payload: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
        if payload.len() != self.size() as usize {
            return Err(SolverError::ProtocolMismatch(format!(
                "all_to_all payload has {} entries, expected {}",
                payload.len(),
                self.size()
            )));
        }
        let my_rank = self.rank();
        let mut result = vec![Vec::new(); payload.len()];
        mpi::request::scope(|scope| {
            let mut requests = Vec::new();
            for (peer, bytes) in payload.iter().enumerate() {
                if peer as i32 == my_rank {
                    result[peer] = bytes.clone();
                    continue;
                }
                let process = self.world.process_at_rank(peer as i32);
                requests.push(process.immediate_send(scope, &bytes[..]));
            }
            for peer in self.other_ranks() {
                let process = self.world.process_at_rank(peer);
                let (bytes, _status) = process.receive_vec::<u8>();
                result[peer as usize] = bytes;
            }
            for request in requests {
                request.wait();
            }
        });
        Ok(result)
    }

    fn exchange(&self, sends: &[(Rank, Vec<u8>)], receive_counts: &[(Rank, usize)]) -> Result<Vec<(Rank, Vec<u8>)>> {
        let mut result = Vec::with_capacity(receive_counts.len());
        mpi::request::scope(|scope| {
            let mut requests = Vec::new();
            for (peer, bytes) in sends {
                let process = self.world.process_at_rank(*peer);
                requests.push(process.immediate_send(scope, &bytes[..]));
            }
            for &(peer, expected_len) in receive_counts {
                let process = self.world.process_at_rank(peer);
                let (bytes, _status) = process.receive_vec::<u8>();
                result.push((peer, bytes, expected_len));
            }
            for request in requests {
                request.wait();
            }
        });
        let mut checked = Vec::with_capacity(result.len());
        for (peer, bytes, expected_len) in result {
            if bytes.len() != expected_len {
                return Err(SolverError::ProtocolMismatch(format!(
                    "expected {expected_len} bytes from rank {peer}, got {}",
                    bytes.len()
                )));
            }
            checked.push((peer, bytes));
        }
        Ok(checked)
    }

    fn all_reduce_sum(&self, value: f64) -> Result<f64> {
        let mut sum = 0.0f64;
        self.world.all_reduce_into(&value, &mut sum, mpi::collective::SystemOperation::sum());
        Ok(sum)
    }
}
