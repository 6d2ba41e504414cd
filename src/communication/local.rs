//! An in-process transport for tests and the CLI demo: every "rank" is an
//! OS thread sharing a [`LocalWorld`], and each collective rendezvouses
//! through a shared slot table guarded by a reused barrier rather than
//! real network messages.

use std::sync::Arc;
use std::sync::Barrier;
use std::sync::Mutex;

use crate::communication::transport::Transport;
use crate::communication::Rank;
use crate::error::Result;
use crate::error::SolverError;

pub struct LocalWorld {
    size: i32,
    barrier: Barrier,
    gather_slots: Mutex<Vec<Option<Vec<u8>>>>,
    matrix_slots: Mutex<Vec<Option<Vec<Vec<u8>>>>>,
    reduce_slots: Mutex<Vec<Option<f64>>>,
}

impl LocalWorld {
    pub fn new(size: i32) -> Arc<Self> {
        assert!(size > 0);
        Arc::new(Self {
            size,
            barrier: Barrier::new(size as usize),
            gather_slots: Mutex::new(vec![None; size as usize]),
            matrix_slots: Mutex::new(vec![None; size as usize]),
            reduce_slots: Mutex::new(vec![None; size as usize]),
        })
    }

    pub fn transport(self: &Arc<Self>, rank: Rank) -> LocalTransport {
        LocalTransport {
            world: Arc::clone(self),
            rank,
        }
    }
}

pub struct LocalTransport {
    world: Arc<LocalWorld>,
    rank: Rank,
}

impl Transport for LocalTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> i32 {
        self.world.size
    }

    fn all_gather_varcount(&self, contribution: &[u8]) -> Result<Vec<Vec<u8>>> {
        {
            let mut slots = self.world.gather_slots.lock().unwrap();
            slots[self.rank as usize] = Some(contribution.to_vec());
        }
        self.world.barrier.wait();
        let result = {
            let slots = self.world.gather_slots.lock().unwrap();
            slots
                .iter()
                .map(|slot| slot.clone().expect("every rank writes before the barrier releases"))
                .collect()
        };
        self.world.barrier.wait();
        Ok(result)
    }

    fn all_to_all(&self, payload: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
        if payload.len() != self.world.size as usize {
            return Err(SolverError::ProtocolMismatch(format!(
                "all_to_all payload has {} entries, expected {}",
                payload.len(),
                self.world.size
            )));
        }
        {
            let mut slots = self.world.matrix_slots.lock().unwrap();
            slots[self.rank as usize] = Some(payload.to_vec());
        }
        self.world.barrier.wait();
        let result = {
            let slots = self.world.matrix_slots.lock().unwrap();
            slots
                .iter()
                .map(|row| {
                    row.as_ref().expect("every rank writes before the barrier releases")[self.rank as usize].clone()
                })
                .collect()
        };
        self.world.barrier.wait();
        Ok(result)
    }

    fn exchange(&self, sends: &[(Rank, Vec<u8>)], receive_counts: &[(Rank, usize)]) -> Result<Vec<(Rank, Vec<u8>)>> {
        let mut outgoing = vec![Vec::new(); self.world.size as usize];
        for (peer, bytes) in sends {
            outgoing[*peer as usize] = bytes.clone();
        }
        let incoming = self.all_to_all(&outgoing)?;
        let mut result = Vec::with_capacity(receive_counts.len());
        for &(peer, expected_len) in receive_counts {
            let bytes = incoming[peer as usize].clone();
            if bytes.len() != expected_len {
                return Err(SolverError::ProtocolMismatch(format!(
                    "expected {expected_len} bytes from rank {peer}, got {}",
                    bytes.len()
                )));
            }
            result.push((peer, bytes));
        }
        Ok(result)
    }

    fn all_reduce_sum(&self, value: f64) -> Result<f64> {
        {
            let mut slots = self.world.reduce_slots.lock().unwrap();
            slots[self.rank as usize] = Some(value);
        }
        self.world.barrier.wait();
        let sum = {
            let slots = self.world.reduce_slots.lock().unwrap();
            slots
                .iter()
                .map(|slot| slot.expect("every rank writes before the barrier releases"))
                .sum()
        };
        self.world.barrier.wait();
        Ok(sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn all_reduce_sum_across_threads() {
        let world = LocalWorld::new(4);
        let handles: Vec<_> = (0..4)
            .map(|rank| {
                let transport = world.transport(rank);
                thread::spawn(move || transport.all_reduce_sum(rank as f64 + 1.0).unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 1.0 + 2.0 + 3.0 + 4.0);
        }
    }

    #[test]
    fn all_gather_varcount_returns_every_rank_contribution_in_order() {
        let world = LocalWorld::new(3);
        let handles: Vec<_> = (0..3)
            .map(|rank| {
                let transport = world.transport(rank);
                thread::spawn(move || transport.all_gather_varcount(&[rank as u8]).unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![vec![0u8], vec![1u8], vec![2u8]]);
        }
    }

    #[test]
    fn exchange_delivers_point_to_point_payloads() {
        let world = LocalWorld::new(2);
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let transport = world.transport(rank);
                thread::spawn(move || {
                    let other = 1 - rank;
                    let sends = vec![(other, vec![rank as u8; 3])];
                    let receive_counts = vec![(other, 3)];
                    transport.exchange(&sends, &receive_counts).unwrap()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0], vec![(1, vec![1u8; 3])]);
        assert_eq!(results[1], vec![(0, vec![0u8; 3])]);
    }
}
