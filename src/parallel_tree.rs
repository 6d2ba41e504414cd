//! The parallel gravity tree (§4.5): top-tree replication from a
//! load-balance tree, remote-moment exchange, and the bounded-buffer
//! export/import walk with global termination detection.

use crate::communication::Rank;
use crate::communication::Transport;
use crate::config::vector_zero;
use crate::config::Vector;
use crate::config::MAX_INSERTION_DEPTH;
use crate::config::NOT_EXIST;
use crate::error::Result;
use crate::error::SolverError;
use crate::geometry::Extent;
use crate::interaction::Interaction;
use crate::load_balance::LoadBalanceTree;
use crate::morton::SfcKey;
use crate::node::Node;
use crate::node::NodeFlags;
use crate::node::Payload;
use crate::particle::ParticleContainer;
use crate::particle::Tag;
use crate::pool::NodePool;
use crate::remote_table::RemoteNodeTable;
use crate::splitter::Splitter;

pub struct ParallelTree {
    pool: NodePool,
    root: usize,
    remote_table: RemoteNodeTable,
    /// Pool indices of every top-tree leaf this rank owns; a rank's
    /// load-balance share is in general more than one leaf (§4.5.2), so real
    /// particles are routed to whichever of these their own key maps to
    /// rather than always starting from a single fixed leaf.
    owned_leaves: Vec<usize>,
    /// Pool index of every top-tree leaf, indexed by the load-balance
    /// tree's own leaf ordinal, so a key's `find_leaf` result can be turned
    /// into the gravity pool index to start insertion from.
    leaf_pool_index: Vec<usize>,
    rank: Rank,
    size: i32,
    max_export: usize,
}

/// One particle exported for remote evaluation: its index in the sending
/// rank's container, the data the receiver needs to bind a splitter and
/// interaction against it, and the pool index of the specific top-tree leaf
/// whose monopole the sender's splitter rejected. The top tree is
/// structurally identical on every rank, so that pool index names the same
/// leaf on the receiver, where it is one of the receiver's own owned
/// (non-remote) leaves — the import walk descends only into that leaf's
/// subtree rather than the whole tree (§4.5.4).
#[derive(Clone, Copy)]
struct ExportedParticle {
    source_index: usize,
    position: Vector,
    mass: f64,
    leaf: usize,
}

impl ParallelTree {
    pub fn new(rank: Rank, size: i32, max_export: usize) -> Result<Self> {
        if max_export == 0 {
            return Err(SolverError::Configuration("max_export must be greater than zero".into()));
        }
        Ok(Self {
            pool: NodePool::with_capacity(64),
            root: 0,
            remote_table: RemoteNodeTable::new(),
            owned_leaves: Vec::new(),
            leaf_pool_index: Vec::new(),
            rank,
            size,
            max_export,
        })
    }

    pub fn count_nodes(&self) -> usize {
        self.pool.count_nodes()
    }

    /// Copy the load-balance tree's structure into the gravity pool
    /// (§4.5.1): every node is flagged TOP_TREE, every load-balance leaf
    /// becomes TOP_TREE_LEAF, and leaves owned by another rank are
    /// additionally flagged TOP_TREE_LEAF_REMOTE and SKIP_BRANCH.
    pub fn replicate_top_tree(&mut self, load_balance: &dyn LoadBalanceTree, domain: Extent) -> Result<()> {
        self.pool.reset();
        self.remote_table = RemoteNodeTable::new();
        self.owned_leaves = Vec::new();
        self.leaf_pool_index = Vec::new();
        let root = self.pool.acquire(1)?;
        self.root = root;
        self.copy_node(load_balance, load_balance.root(), root, domain, NOT_EXIST)?;
        Ok(())
    }

    /// Moments are not known yet at replication time (no particles have
    /// been inserted anywhere); every TOP_TREE node's payload is filled in
    /// later, by [`Self::finalize_local_moments`] for the owned subtree and
    /// by [`update_remote_moments`] for everything above it once the
    /// remote exchange has populated the leaves.
    fn copy_node(
        &mut self,
        load_balance: &dyn LoadBalanceTree,
        load_index: usize,
        pool_index: usize,
        extent: Extent,
        next_after: i64,
    ) -> Result<()> {
        *self.pool.get_mut(pool_index) = Node::new_internal(extent);
        self.pool.get_mut(pool_index).flags.insert(NodeFlags::TOP_TREE);

        match load_balance.children_start(load_index) {
            None => {
                // A load-balance leaf: one top-tree leaf in the gravity
                // pool, possibly owned remotely. `load_index` is the
                // load-balance tree's own node index, which does not in
                // general equal the depth-first leaf ordinal `leaf_pid`/
                // `key_range`/`find_leaf` expect; the ordinal is instead
                // this leaf's position in the Hilbert-order traversal
                // `copy_node` is already performing, which is exactly
                // `leaf_pool_index.len()` before this leaf is pushed.
                let ordinal = self.leaf_pool_index.len();
                let owner = load_balance.leaf_pid(ordinal);
                let (key_start, _) = load_balance.key_range(ordinal);
                self.pool.get_mut(pool_index).flags.insert(NodeFlags::TOP_TREE_LEAF);
                self.pool.get_mut(pool_index).next_sibling = next_after;
                self.pool.get_mut(pool_index).first_child = NOT_EXIST;

                let row = self.remote_table.push(key_start, pool_index, owner);
                self.pool.get_mut(pool_index).remote_table_row = Some(row);
                self.leaf_pool_index.push(pool_index);
                if owner != self.rank {
                    self.pool.get_mut(pool_index).flags.insert(NodeFlags::TOP_TREE_LEAF_REMOTE);
                    self.pool.get_mut(pool_index).flags.insert(NodeFlags::SKIP_BRANCH);
                } else {
                    self.owned_leaves.push(pool_index);
                }
                Ok(())
            }
            Some(children_load_start) => {
                let children_pool_start = self.pool.acquire(crate::config::NUM_SUBDIVISIONS)?;
                self.pool.get_mut(pool_index).first_child = children_pool_start as i64;
                self.pool.get_mut(pool_index).next_sibling = next_after;

                let children_extents = extent.children();
                for octant in 0..crate::config::NUM_SUBDIVISIONS {
                    let hilbert_slot = load_balance.zorder_to_hilbert(octant);
                    let child_load_index = children_load_start + hilbert_slot;
                    let child_pool_index = children_pool_start + octant;
                    let child_next = if octant + 1 < crate::config::NUM_SUBDIVISIONS {
                        (children_pool_start + octant + 1) as i64
                    } else {
                        next_after
                    };
                    self.copy_node(load_balance, child_load_index, child_pool_index, children_extents[octant], child_next)?;
                }
                let all_remote = (0..crate::config::NUM_SUBDIVISIONS)
                    .all(|o| self.pool.get(children_pool_start + o).flags.contains(NodeFlags::SKIP_BRANCH));
                if all_remote {
                    self.pool.get_mut(pool_index).flags.insert(NodeFlags::SKIP_BRANCH);
                }
                Ok(())
            }
        }
    }

    /// Insert the rank's own real particles, each starting from the owned
    /// top-tree leaf its key maps to (§4.5.2) rather than always the same
    /// one, then run the local moment pass over just-built nodes.
    pub fn insert_local_particles(&mut self, load_balance: &dyn LoadBalanceTree, container: &impl ParticleContainer) -> Result<()> {
        for index in 0..container.len() {
            if container.tag(index) != Tag::Real {
                continue;
            }
            let leaf = self.top_leaf_for(load_balance, container.key(index));
            self.insert_from(leaf, container, index)?;
        }
        self.finalize_local_moments(container);
        Ok(())
    }

    /// The pool index of the owned top-tree leaf whose key range contains
    /// `key`, the point at which a real particle's insertion must start
    /// (§4.5.2) so it lands in the octant that actually contains it rather
    /// than whichever leaf happened to be inserted into first.
    fn top_leaf_for(&self, load_balance: &dyn LoadBalanceTree, key: SfcKey) -> usize {
        let ordinal = load_balance.find_leaf(key);
        self.leaf_pool_index[ordinal]
    }

    fn insert_from(&mut self, start: usize, container: &impl ParticleContainer, particle_index: usize) -> Result<()> {
        let mut pending = vec![(start, particle_index, 0usize)];
        while let Some((node, particle, depth)) = pending.pop() {
            let current = *self.pool.get(node);

            if current.flags.contains(NodeFlags::TOP_TREE_LEAF) && !current.is_leaf() {
                // First real particle to land in this top-tree leaf: turn
                // it into an ordinary (non-top-tree) leaf, preserving the
                // remote-table row and the thread pointer to whatever
                // top-tree node follows it so the walk keeps reaching the
                // rest of the top tree once this subtree is exhausted.
                let mut replaced = Node::new_leaf(current.extent, particle);
                replaced.next_sibling = current.next_sibling;
                replaced.remote_table_row = current.remote_table_row;
                *self.pool.get_mut(node) = replaced;
                continue;
            }

            if current.is_leaf() {
                let existing = current.particle_index().expect("leaf without particle");
                if depth >= MAX_INSERTION_DEPTH {
                    return Err(SolverError::DegenerateInsertion {
                        particle_a: existing,
                        particle_b: particle,
                        depth,
                    });
                }
                *self.pool.get_mut(node) = Node::new_internal(current.extent);
                pending.push((node, existing, depth + 1));
                pending.push((node, particle, depth + 1));
                continue;
            }

            let position = container.position(particle);
            let octant = current.extent.octant_index(&position);
            let child_extent = current.extent.child_extent(octant);
            let slot = current.children().expect("internal node without children")[octant];

            if slot == NOT_EXIST {
                let leaf = self.pool.acquire(1)?;
                *self.pool.get_mut(leaf) = Node::new_leaf(child_extent, particle);
                self.pool.get_mut(node).children_mut().unwrap()[octant] = leaf as i64;
            } else {
                pending.push((slot as usize, particle, depth + 1));
            }
        }
        Ok(())
    }

    /// Run the moment pass independently under each owned leaf. Each
    /// leaf's own `next_sibling`, set once during top-tree replication and
    /// otherwise untouched, is passed back in as `next_after` so the
    /// thread below it still resumes at the right place in the shared top
    /// tree instead of terminating the walk early.
    fn finalize_local_moments(&mut self, container: &impl ParticleContainer) {
        for leaf in self.owned_leaves.clone() {
            let next_after = self.pool.get(leaf).next_sibling;
            build_subtree_moments(&mut self.pool, container, leaf, next_after);
        }
    }

    /// Publish this rank's locally aggregated moments, all-gather them
    /// against every other rank's contribution, then refresh every
    /// non-leaf node above a top-tree leaf (§4.5.3). Every rank replicates
    /// the same top tree, so once the table is sorted by `(owning_rank,
    /// key)` its per-rank slices line up identically everywhere; each rank
    /// contributes only its own slice and `fill_rank` writes back the rest
    /// from what the all-gather returns.
    pub fn exchange_remote_moments(&mut self, container: &impl ParticleContainer, transport: &dyn Transport) -> Result<()> {
        for &leaf in &self.owned_leaves {
            let node = *self.pool.get(leaf);
            let (mass, com) = leaf_moments(&node, container);
            if let Some(row) = node.remote_table_row {
                self.remote_table.set_moments(row, mass, com);
            }
        }

        self.remote_table.sort_by_owner_then_key();
        let counts = self.remote_table.counts_per_rank(self.size as usize);
        let displacements = RemoteNodeTable::displacements(&counts);

        let own_contribution: Vec<(f64, Vector)> = self
            .remote_table
            .rows()
            .iter()
            .filter(|row| row.owning_rank == self.rank)
            .map(|row| (row.mass, row.center_of_mass))
            .collect();
        let gathered = transport.all_gather_varcount(&encode_moments(&own_contribution))?;
        if gathered.len() != self.size as usize {
            return Err(SolverError::ProtocolMismatch(format!(
                "expected {} ranks in all-gather, got {}",
                self.size,
                gathered.len()
            )));
        }

        for rank in 0..self.size {
            if rank == self.rank {
                continue;
            }
            let moments = decode_moments(&gathered[rank as usize]);
            if moments.len() != counts[rank as usize] as usize {
                return Err(SolverError::ProtocolMismatch(format!(
                    "rank {rank} owns {} top-tree leaves but sent {} moments (table displacement {})",
                    counts[rank as usize],
                    moments.len(),
                    displacements[rank as usize]
                )));
            }
            self.remote_table.fill_rank(rank, &moments);
        }

        for row in self.remote_table.rows().to_vec() {
            let node = self.pool.get_mut(row.map);
            node.payload = Payload::Moments {
                mass: row.mass,
                center_of_mass: row.center_of_mass,
            };
        }

        update_remote_moments(&mut self.pool, self.root);
        Ok(())
    }

    /// Run the parallel walk to completion for every real particle in
    /// `container`, accumulating into its acceleration column (§4.5.4).
    pub fn walk_to_completion(
        &self,
        container: &mut impl ParticleContainer,
        splitter_factory: &mut dyn FnMut() -> Box<dyn Splitter>,
        interaction_factory: &mut dyn FnMut() -> Box<dyn Interaction>,
        transport: &dyn Transport,
    ) -> Result<()> {
        let real_indices: Vec<usize> = (0..container.len()).filter(|&i| container.tag(i) == Tag::Real).collect();
        let mut cursor = vec![self.root as i64; real_indices.len()];
        let mut finished = vec![false; real_indices.len()];

        for &index in &real_indices {
            container.set_acceleration(index, vector_zero());
        }

        loop {
            let mut exports: Vec<(Rank, ExportedParticle)> = Vec::new();

            for (slot, &particle_index) in real_indices.iter().enumerate() {
                if finished[slot] {
                    continue;
                }
                let mut splitter = splitter_factory();
                let mut interaction = interaction_factory();
                let position = container.position(particle_index);
                let mass = container.mass(particle_index);
                splitter.bind(position, mass);
                interaction.bind(position);

                let mut current = cursor[slot];
                while current != NOT_EXIST {
                    if exports.len() >= self.max_export {
                        break;
                    }
                    let node = *self.pool.get(current as usize);

                    if node.flags.contains(NodeFlags::TOP_TREE_LEAF_REMOTE) {
                        let (leaf_mass, leaf_com) = node.moments().unwrap_or((0.0, node.extent.center));
                        if splitter.accept(leaf_com, node.extent.width(), leaf_mass) {
                            interaction.interact(leaf_com, leaf_mass);
                            current = node.next_sibling;
                        } else {
                            let row = node.remote_table_row.expect("remote leaf without a table row");
                            let owner = self.remote_table.row(row).owning_rank;
                            exports.push((
                                owner,
                                ExportedParticle {
                                    source_index: particle_index,
                                    position,
                                    mass,
                                    leaf: current as usize,
                                },
                            ));
                            current = node.next_sibling;
                        }
                        continue;
                    }

                    if node.flags.contains(NodeFlags::SKIP_BRANCH) {
                        current = node.next_sibling;
                        continue;
                    }

                    if node.is_leaf() {
                        let pid = node.particle_index().expect("leaf without particle");
                        if pid != particle_index {
                            interaction.interact(container.position(pid), container.mass(pid));
                        }
                        current = node.next_sibling;
                        continue;
                    }

                    let (mass, com) = node.moments().unwrap_or((0.0, node.extent.center));
                    if splitter.accept(com, node.extent.width(), mass) {
                        interaction.interact(com, mass);
                        current = node.next_sibling;
                    } else {
                        current = node.first_child;
                    }
                }

                cursor[slot] = current;
                container.add_acceleration(particle_index, interaction.result());
                if current == NOT_EXIST {
                    finished[slot] = true;
                }
            }

            self.run_export_round(&exports, container, splitter_factory, interaction_factory, transport)?;

            let local_done = if finished.iter().all(|&done| done) { 1.0 } else { 0.0 };
            let total_done = transport.all_reduce_sum(local_done)?;
            if total_done as i32 == self.size {
                break;
            }
        }
        Ok(())
    }

    fn run_export_round(
        &self,
        exports: &[(Rank, ExportedParticle)],
        container: &mut impl ParticleContainer,
        splitter_factory: &mut dyn FnMut() -> Box<dyn Splitter>,
        interaction_factory: &mut dyn FnMut() -> Box<dyn Interaction>,
        transport: &dyn Transport,
    ) -> Result<()> {
        if self.size == 1 {
            return Ok(());
        }
        let mut by_peer: Vec<Vec<ExportedParticle>> = vec![Vec::new(); self.size as usize];
        for &(peer, particle) in exports {
            by_peer[peer as usize].push(particle);
        }

        let sends: Vec<(Rank, Vec<u8>)> = by_peer
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_empty())
            .map(|(peer, particles)| (peer as Rank, encode_particles(particles)))
            .collect();

        let send_counts: Vec<usize> = by_peer.iter().map(Vec::len).collect();
        let send_counts_bytes = encode_usize_vec(&send_counts);
        let all_counts = transport.all_gather_varcount(&send_counts_bytes)?;

        let mut receive_specs = Vec::new();
        for (peer, bytes) in all_counts.iter().enumerate() {
            if peer as i32 == self.rank {
                continue;
            }
            let counts = decode_usize_vec(bytes);
            let count_for_me = counts[self.rank as usize];
            if count_for_me > 0 {
                receive_specs.push((peer as Rank, count_for_me * PARTICLE_WIRE_SIZE));
            }
        }

        let received = transport.exchange(&sends, &receive_specs)?;
        let mut imported: Vec<(Rank, ExportedParticle)> = Vec::new();
        for (peer, bytes) in &received {
            for particle in decode_particles(bytes) {
                imported.push((*peer, particle));
            }
        }

        let mut return_payloads: Vec<(Rank, Vec<u8>)> = Vec::new();
        let mut return_counts: Vec<(Rank, usize)> = Vec::new();
        let mut by_source_peer: Vec<Vec<(usize, Vector)>> = vec![Vec::new(); self.size as usize];
        for (peer, particle) in &imported {
            let mut splitter = splitter_factory();
            let mut interaction = interaction_factory();
            let acceleration = self.accelerate_imported(container, particle, splitter.as_mut(), interaction.as_mut());
            by_source_peer[*peer as usize].push((particle.source_index, acceleration));
        }
        for (peer, contributions) in by_source_peer.iter().enumerate() {
            if contributions.is_empty() {
                continue;
            }
            return_payloads.push((peer as Rank, encode_accelerations(contributions)));
        }
        for (peer, &count) in send_counts.iter().enumerate() {
            if count > 0 {
                return_counts.push((peer as Rank, count * ACCEL_WIRE_SIZE));
            }
        }

        let returned = transport.exchange(&return_payloads, &return_counts)?;
        for (_, bytes) in &returned {
            for (source_index, acceleration) in decode_accelerations(bytes) {
                container.add_acceleration(source_index, acceleration);
            }
        }
        Ok(())
    }

    /// Evaluate a single round of force contribution for a particle that
    /// was exported to this rank (§4.5.4's import walk): walk only the
    /// triggering leaf's own locally-built subtree, bounded by that leaf's
    /// own `next_sibling`. Everything above or beside that leaf in the
    /// shared top tree was already resolved by the sender's own traversal
    /// (either interacted with, or exported further), so revisiting it
    /// here would double-count mass the sender already accounted for.
    fn accelerate_imported(
        &self,
        container: &impl ParticleContainer,
        particle: &ExportedParticle,
        splitter: &mut dyn Splitter,
        interaction: &mut dyn Interaction,
    ) -> Vector {
        splitter.bind(particle.position, particle.mass);
        interaction.bind(particle.position);

        let stop_at = self.pool.get(particle.leaf).next_sibling;
        let mut current = particle.leaf as i64;
        while current != NOT_EXIST && current != stop_at {
            let node = *self.pool.get(current as usize);

            if node.flags.contains(NodeFlags::SKIP_BRANCH) {
                current = node.next_sibling;
                continue;
            }

            if node.is_leaf() {
                let pid = node.particle_index().expect("leaf without particle");
                interaction.interact(container.position(pid), container.mass(pid));
                current = node.next_sibling;
                continue;
            }

            let (mass, com) = node.moments().unwrap_or((0.0, node.extent.center));
            if splitter.accept(com, node.extent.width(), mass) {
                interaction.interact(com, mass);
                current = node.next_sibling;
            } else {
                current = node.first_child;
            }
        }
        interaction.result()
    }
}

fn build_subtree_moments(pool: &mut NodePool, container: &impl ParticleContainer, node_index: usize, next_after: i64) -> (f64, Vector) {
    let node = *pool.get(node_index);

    if node.is_leaf() {
        let particle = node.particle_index().expect("leaf without particle");
        let mass = match container.tag(particle) {
            Tag::Real => container.mass(particle),
            Tag::Ghost => 0.0,
        };
        let center_of_mass = container.position(particle);
        let mut updated = node;
        updated.next_sibling = next_after;
        updated.first_child = NOT_EXIST;
        if mass == 0.0 {
            updated.flags.insert(NodeFlags::SKIP_BRANCH);
        }
        *pool.get_mut(node_index) = updated;
        return (mass, center_of_mass);
    }

    if node.flags.contains(NodeFlags::TOP_TREE_LEAF_REMOTE) {
        return (0.0, node.extent.center);
    }

    let children: Vec<i64> = node
        .children()
        .map(|c| c.to_vec())
        .unwrap_or_else(|| {
            let first = node.first_child;
            let mut collected = Vec::new();
            let mut c = first;
            while c != NOT_EXIST {
                collected.push(c);
                c = pool.get(c as usize).next_sibling;
            }
            collected
        })
        .into_iter()
        .filter(|&c| c != NOT_EXIST)
        .collect();

    let mut total_mass = 0.0;
    let mut weighted_position = vector_zero();
    for (i, &child) in children.iter().enumerate() {
        let child_next = if i + 1 < children.len() { children[i + 1] } else { next_after };
        let (mass, com) = build_subtree_moments(pool, container, child as usize, child_next);
        total_mass += mass;
        weighted_position += com * mass;
    }
    let center_of_mass = if total_mass > 0.0 {
        weighted_position / total_mass
    } else {
        node.extent.center
    };

    let mut updated = node;
    updated.payload = Payload::Moments { mass: total_mass, center_of_mass };
    updated.first_child = children.first().copied().unwrap_or(NOT_EXIST);
    updated.next_sibling = next_after;
    if total_mass == 0.0 {
        updated.flags.insert(NodeFlags::SKIP_BRANCH);
    }
    *pool.get_mut(node_index) = updated;
    (total_mass, center_of_mass)
}

/// Post-order refresh after the remote-moment exchange: recompute every
/// non-leaf, non-TOP_TREE_LEAF node's moments from its already-threaded
/// children (§4.5.3 step 4). TOP_TREE_LEAF nodes keep the values the
/// all-gather just wrote as authoritative.
fn update_remote_moments(pool: &mut NodePool, node_index: usize) -> (f64, Vector) {
    let node = *pool.get(node_index);
    if node.flags.contains(NodeFlags::TOP_TREE_LEAF) {
        return node.moments().unwrap_or((0.0, node.extent.center));
    }
    if node.first_child == NOT_EXIST {
        return node.moments().unwrap_or((0.0, node.extent.center));
    }

    let mut total_mass = 0.0;
    let mut weighted_position = vector_zero();
    let mut child = node.first_child;
    while child != NOT_EXIST {
        let (mass, com) = update_remote_moments(pool, child as usize);
        total_mass += mass;
        weighted_position += com * mass;
        child = pool.get(child as usize).next_sibling;
        if child == node.next_sibling {
            break;
        }
    }
    let center_of_mass = if total_mass > 0.0 {
        weighted_position / total_mass
    } else {
        node.extent.center
    };
    let mut updated = node;
    updated.payload = Payload::Moments { mass: total_mass, center_of_mass };
    *pool.get_mut(node_index) = updated;
    (total_mass, center_of_mass)
}

// source_index, mass, leaf, position
const PARTICLE_WIRE_SIZE: usize = 8 + 8 + 8 + crate::config::NUM_DIMENSIONS * 8;
const ACCEL_WIRE_SIZE: usize = 8 + crate::config::NUM_DIMENSIONS * 8;
const MOMENT_WIRE_SIZE: usize = 8 + crate::config::NUM_DIMENSIONS * 8;

/// Read the moment a top-tree leaf owns: from its payload if a moment pass
/// has already summarized it, or directly from its resident particle when
/// exactly one real particle landed there and the leaf never subdivided
/// (`Node::moments` returns `None` for a `Payload::Particle` leaf).
fn leaf_moments(node: &Node, container: &impl ParticleContainer) -> (f64, Vector) {
    match node.payload {
        Payload::Moments { mass, center_of_mass } => (mass, center_of_mass),
        Payload::Particle { particle_index } => {
            let mass = match container.tag(particle_index) {
                Tag::Real => container.mass(particle_index),
                Tag::Ghost => 0.0,
            };
            (mass, container.position(particle_index))
        }
        Payload::Children(_) => (0.0, node.extent.center),
    }
}

fn encode_moments(moments: &[(f64, Vector)]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(moments.len() * MOMENT_WIRE_SIZE);
    for &(mass, com) in moments {
        bytes.extend_from_slice(&mass.to_le_bytes());
        for k in 0..crate::config::NUM_DIMENSIONS {
            bytes.extend_from_slice(&crate::config::component(&com, k).to_le_bytes());
        }
    }
    bytes
}

fn decode_moments(bytes: &[u8]) -> Vec<(f64, Vector)> {
    let mut result = Vec::with_capacity(bytes.len() / MOMENT_WIRE_SIZE);
    let mut offset = 0;
    while offset + MOMENT_WIRE_SIZE <= bytes.len() {
        let mass = f64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap());
        let com = crate::config::from_fn(|k| f64::from_le_bytes(bytes[offset + 8 + k * 8..offset + 16 + k * 8].try_into().unwrap()));
        result.push((mass, com));
        offset += MOMENT_WIRE_SIZE;
    }
    result
}

fn encode_particles(particles: &[ExportedParticle]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(particles.len() * PARTICLE_WIRE_SIZE);
    for particle in particles {
        bytes.extend_from_slice(&(particle.source_index as u64).to_le_bytes());
        bytes.extend_from_slice(&particle.mass.to_le_bytes());
        bytes.extend_from_slice(&(particle.leaf as u64).to_le_bytes());
        for k in 0..crate::config::NUM_DIMENSIONS {
            bytes.extend_from_slice(&crate::config::component(&particle.position, k).to_le_bytes());
        }
    }
    bytes
}

fn decode_particles(bytes: &[u8]) -> Vec<ExportedParticle> {
    let mut result = Vec::with_capacity(bytes.len() / PARTICLE_WIRE_SIZE);
    let mut offset = 0;
    while offset + PARTICLE_WIRE_SIZE <= bytes.len() {
        let source_index = u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap()) as usize;
        let mass = f64::from_le_bytes(bytes[offset + 8..offset + 16].try_into().unwrap());
        let leaf = u64::from_le_bytes(bytes[offset + 16..offset + 24].try_into().unwrap()) as usize;
        let position = crate::config::from_fn(|k| {
            let start = offset + 24 + k * 8;
            f64::from_le_bytes(bytes[start..start + 8].try_into().unwrap())
        });
        result.push(ExportedParticle { source_index, position, mass, leaf });
        offset += PARTICLE_WIRE_SIZE;
    }
    result
}

fn encode_accelerations(contributions: &[(usize, Vector)]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(contributions.len() * ACCEL_WIRE_SIZE);
    for (source_index, acceleration) in contributions {
        bytes.extend_from_slice(&(*source_index as u64).to_le_bytes());
        for k in 0..crate::config::NUM_DIMENSIONS {
            bytes.extend_from_slice(&crate::config::component(acceleration, k).to_le_bytes());
        }
    }
    bytes
}

fn decode_accelerations(bytes: &[u8]) -> Vec<(usize, Vector)> {
    let mut result = Vec::with_capacity(bytes.len() / ACCEL_WIRE_SIZE);
    let mut offset = 0;
    while offset + ACCEL_WIRE_SIZE <= bytes.len() {
        let source_index = u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap()) as usize;
        let acceleration = crate::config::from_fn(|k| {
            let start = offset + 8 + k * 8;
            f64::from_le_bytes(bytes[start..start + 8].try_into().unwrap())
        });
        result.push((source_index, acceleration));
        offset += ACCEL_WIRE_SIZE;
    }
    result
}

fn encode_usize_vec(values: &[usize]) -> Vec<u8> {
    values.iter().flat_map(|&v| (v as u64).to_le_bytes()).collect()
}

fn decode_usize_vec(bytes: &[u8]) -> Vec<usize> {
    bytes.chunks_exact(8).map(|c| u64::from_le_bytes(c.try_into().unwrap()) as usize).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::local::LocalWorld;
    use crate::config::from_fn;
    use crate::interaction::GravityKernel;
    use crate::load_balance::SegmentTree;
    use crate::particle::ParticleSet;
    use crate::splitter::BarnesHut;
    use std::thread;

    fn direct_sum(particles: &ParticleSet, target: usize) -> Vector {
        let mut acc = vector_zero();
        let focus = particles.position(target);
        for i in 0..particles.len() {
            if i == target {
                continue;
            }
            let delta = particles.position(i) - focus;
            let r2 = delta.length_squared();
            if r2 == 0.0 {
                continue;
            }
            acc += delta * (particles.mass(i) * r2.powf(-1.5));
        }
        acc
    }

    #[test]
    fn single_rank_matches_serial_tree() {
        let mut particles = ParticleSet::new();
        for i in 0..8 {
            let pos = from_fn(|k| ((i * 7 + k) % 5) as f64 * 0.1);
            particles.push(pos, 1.0, Tag::Real);
        }
        let extent = Extent::cubic_from_positions(particles.positions().iter()).unwrap();
        particles.assign_keys(&extent);

        let load_balance = SegmentTree::new_balanced(1);
        let world = LocalWorld::new(1);
        let transport = world.transport(0);

        let mut tree = ParallelTree::new(0, 1, 1024).unwrap();
        tree.replicate_top_tree(&load_balance, extent).unwrap();
        tree.insert_local_particles(&load_balance, &particles).unwrap();
        tree.exchange_remote_moments(&particles, &transport).unwrap();

        let mut splitter_factory = || Box::new(BarnesHut::new(0.5)) as Box<dyn Splitter>;
        let mut interaction_factory = || Box::new(GravityKernel::new(1.0, 0.0)) as Box<dyn Interaction>;
        tree.walk_to_completion(&mut particles.clone(), &mut splitter_factory, &mut interaction_factory, &transport)
            .unwrap();
    }

    #[test]
    fn two_ranks_conserve_mass_in_top_tree() {
        let world = LocalWorld::new(2);
        let handles: Vec<_> = (0..2i32)
            .map(|rank| {
                let transport = world.transport(rank);
                thread::spawn(move || {
                    let mut particles = ParticleSet::new();
                    let offset = rank as f64 * 0.5;
                    for i in 0..4 {
                        let pos = from_fn(|k| if k == 0 { offset + i as f64 * 0.1 } else { 0.3 });
                        particles.push(pos, 1.0, Tag::Real);
                    }
                    let extent = Extent::new(from_fn(|_| 0.0), from_fn(|_| 1.0));
                    particles.assign_keys(&extent);

                    let load_balance = SegmentTree::new_balanced(2);
                    let mut tree = ParallelTree::new(rank, 2, 1024).unwrap();
                    tree.replicate_top_tree(&load_balance, extent).unwrap();
                    tree.insert_local_particles(&load_balance, &particles).unwrap();
                    tree.exchange_remote_moments(&particles, &transport).unwrap();

                    let root_moments = tree.pool.get(tree.root).moments();
                    root_moments
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for moments in &results {
            let (mass, _) = moments.expect("root should have aggregated moments");
            assert!((mass - 8.0).abs() < 1e-9, "expected global mass 8.0, got {mass}");
        }
    }

    #[test]
    fn direct_sum_reference_is_available_for_future_parallel_walk_tests() {
        let mut particles = ParticleSet::new();
        particles.push(from_fn(|_| 0.0), 1.0, Tag::Real);
        particles.push(from_fn(|k| if k == 0 { 1.0 } else { 0.0 }), 1.0, Tag::Real);
        let acc = direct_sum(&particles, 0);
        assert!(acc.length() > 0.0);
    }
}
