//! The remote-node table (§4.5.3): one row per top-tree leaf, carrying the
//! moments a rank needs from every leaf it does not own. Rows are kept
//! sorted by `(owning_rank, key)` so the table doubles as the staging
//! buffer for an all-gather-varcount exchange, the same layout the
//! communication layer's all-gather primitive expects.

use crate::config::vector_zero;
use crate::config::Vector;
use crate::morton::SfcKey;

#[derive(Debug, Clone, Copy)]
pub struct RemoteNodeRow {
    pub key: SfcKey,
    /// Pool index of the top-tree-leaf node this row backs.
    pub map: usize,
    pub owning_rank: i32,
    pub mass: f64,
    pub center_of_mass: Vector,
}

#[derive(Debug, Clone, Default)]
pub struct RemoteNodeTable {
    rows: Vec<RemoteNodeRow>,
}

impl RemoteNodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Register a top-tree leaf, returning the row index to stash on the
    /// corresponding node (`Node::remote_table_row`).
    pub fn push(&mut self, key: SfcKey, map: usize, owning_rank: i32) -> u32 {
        let index = self.rows.len() as u32;
        self.rows.push(RemoteNodeRow {
            key,
            map,
            owning_rank,
            mass: 0.0,
            center_of_mass: vector_zero(),
        });
        index
    }

    pub fn row(&self, index: u32) -> &RemoteNodeRow {
        &self.rows[index as usize]
    }

    /// Write this rank's own just-aggregated moments into a locally owned
    /// row, ahead of the all-gather.
    pub fn set_moments(&mut self, index: u32, mass: f64, center_of_mass: Vector) {
        let row = &mut self.rows[index as usize];
        row.mass = mass;
        row.center_of_mass = center_of_mass;
    }

    /// Sort rows by `(owning_rank, key)` so contiguous runs correspond to
    /// a single peer, and per-peer send/receive sizing stays a single
    /// linear scan.
    pub fn sort_by_owner_then_key(&mut self) {
        self.rows.sort_by(|a, b| (a.owning_rank, a.key).cmp(&(b.owning_rank, b.key)));
    }

    /// Number of rows owned by each of `num_ranks` ranks, in rank order;
    /// the layout an all-gather-varcount exchange needs to know how many
    /// moments to expect back from each peer.
    pub fn counts_per_rank(&self, num_ranks: usize) -> Vec<i32> {
        let mut counts = vec![0i32; num_ranks];
        for row in &self.rows {
            counts[row.owning_rank as usize] += 1;
        }
        counts
    }

    /// Byte/element displacement of each rank's run within the
    /// rank-sorted table, derived from `counts_per_rank`.
    pub fn displacements(counts: &[i32]) -> Vec<i32> {
        let mut displacements = Vec::with_capacity(counts.len());
        let mut running = 0;
        for &count in counts {
            displacements.push(running);
            running += count;
        }
        displacements
    }

    /// Overwrite the moments of every row owned by `rank`, in key order,
    /// with values received from that rank's all-gather contribution.
    pub fn fill_rank(&mut self, rank: i32, moments: &[(f64, Vector)]) {
        let mut received = moments.iter();
        for row in self.rows.iter_mut().filter(|row| row.owning_rank == rank) {
            if let Some(&(mass, com)) = received.next() {
                row.mass = mass;
                row.center_of_mass = com;
            }
        }
    }

    pub fn rows(&self) -> &[RemoteNodeRow] {
        &self.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::from_fn;

    #[test]
    fn sorting_groups_rows_by_owning_rank() {
        let mut table = RemoteNodeTable::new();
        table.push(SfcKey(30), 0, 1);
        table.push(SfcKey(10), 1, 0);
        table.push(SfcKey(20), 2, 1);
        table.sort_by_owner_then_key();
        let ranks: Vec<i32> = table.rows().iter().map(|r| r.owning_rank).collect();
        assert_eq!(ranks, vec![0, 1, 1]);
    }

    #[test]
    fn counts_and_displacements_agree_with_row_layout() {
        let mut table = RemoteNodeTable::new();
        table.push(SfcKey(1), 0, 0);
        table.push(SfcKey(2), 1, 0);
        table.push(SfcKey(3), 2, 1);
        table.sort_by_owner_then_key();
        let counts = table.counts_per_rank(2);
        assert_eq!(counts, vec![2, 1]);
        let displacements = RemoteNodeTable::displacements(&counts);
        assert_eq!(displacements, vec![0, 2]);
    }

    #[test]
    fn fill_rank_only_touches_rows_for_that_rank() {
        let mut table = RemoteNodeTable::new();
        table.push(SfcKey(1), 0, 0);
        table.push(SfcKey(2), 1, 1);
        table.sort_by_owner_then_key();
        table.fill_rank(1, &[(5.0, from_fn(|_| 1.0))]);
        assert_eq!(table.rows()[0].mass, 0.0);
        assert_eq!(table.rows()[1].mass, 5.0);
    }
}
