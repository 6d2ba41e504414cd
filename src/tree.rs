//! The serial gravity tree (§4.4): root creation, insertion, the moment
//! pass, and the threaded walk that the parallel layer builds on.

use crate::config::vector_zero;
use crate::config::Vector;
use crate::config::MAX_INSERTION_DEPTH;
use crate::config::NOT_EXIST;
use crate::error::Result;
use crate::error::SolverError;
use crate::geometry::Extent;
use crate::interaction::Interaction;
use crate::node::Node;
use crate::node::NodeFlags;
use crate::node::Payload;
use crate::particle::ParticleContainer;
use crate::particle::Tag;
use crate::pool::NodePool;
use crate::splitter::Splitter;

pub struct GravityTree {
    pool: NodePool,
    root: usize,
}

/// A pending insertion: place `particle` into `node`, at `depth` levels
/// from the root. Leaf collisions subdivide in place and push both
/// particles back on the stack at `depth + 1`.
struct Step {
    node: usize,
    particle: usize,
    depth: usize,
}

impl GravityTree {
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            pool: NodePool::with_capacity(initial_capacity.max(1)),
            root: 0,
        }
    }

    pub fn count_nodes(&self) -> usize {
        self.pool.count_nodes()
    }

    pub fn count_leaves(&self) -> usize {
        self.pool.count_leaves()
    }

    /// Build a fresh tree over every particle in `container`, rewinding and
    /// reusing the node pool's backing storage across calls.
    pub fn build(&mut self, container: &impl ParticleContainer) -> Result<()> {
        self.pool.reset();
        let extent = extent_from_container(container).unwrap_or_else(|| Extent::new(vector_zero(), vector_zero()));
        let root = self.pool.acquire(1)?;
        self.root = root;
        *self.pool.get_mut(root) = Node::new_internal(extent);

        if container.is_empty() {
            self.finalize_moments(container);
            return Ok(());
        }

        for index in 0..container.len() {
            self.insert(container, index)?;
        }
        self.finalize_moments(container);
        Ok(())
    }

    fn insert(&mut self, container: &impl ParticleContainer, particle_index: usize) -> Result<()> {
        let mut pending = vec![Step {
            node: self.root,
            particle: particle_index,
            depth: 0,
        }];

        while let Some(Step { node, particle, depth }) = pending.pop() {
            let current = *self.pool.get(node);

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
                pending.push(Step { node, particle: existing, depth: depth + 1 });
                pending.push(Step { node, particle, depth: depth + 1 });
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
                pending.push(Step { node: slot as usize, particle, depth: depth + 1 });
            }
        }
        Ok(())
    }

    fn finalize_moments(&mut self, container: &impl ParticleContainer) {
        build_moments(&mut self.pool, container, self.root, NOT_EXIST);
    }

    /// Accumulate the force on `focus_particle` by walking the finalized
    /// tree with the given opening criterion and interaction kernel.
    pub fn walk(
        &self,
        container: &impl ParticleContainer,
        splitter: &mut impl Splitter,
        interaction: &mut impl Interaction,
        focus_particle: usize,
    ) -> Vector {
        let focus_position = container.position(focus_particle);
        let focus_mass = container.mass(focus_particle);
        splitter.bind(focus_position, focus_mass);
        interaction.bind(focus_position);

        let mut current = self.root as i64;
        while current != NOT_EXIST {
            let node = *self.pool.get(current as usize);

            if node.flags.contains(NodeFlags::SKIP_BRANCH) {
                current = node.next_sibling;
                continue;
            }

            if node.is_leaf() {
                let particle = node.particle_index().expect("leaf without particle");
                if particle != focus_particle {
                    interaction.interact(container.position(particle), container.mass(particle));
                }
                current = node.next_sibling;
                continue;
            }

            let (mass, center_of_mass) = node.moments().expect("internal node without moments");
            if splitter.accept(center_of_mass, node.extent.width(), mass) {
                interaction.interact(center_of_mass, mass);
                current = node.next_sibling;
            } else {
                current = node.first_child;
            }
        }
        interaction.result()
    }
}

fn extent_from_container(container: &impl ParticleContainer) -> Option<Extent> {
    let positions: Vec<Vector> = (0..container.len()).map(|i| container.position(i)).collect();
    Extent::cubic_from_positions(positions.iter())
}

/// Post-order moment pass, threading `first_child`/`next_sibling` as it
/// returns so the walk never needs a stack. `next_after` is the node to
/// resume at once this subtree is exhausted, supplied by the caller.
fn build_moments(pool: &mut NodePool, container: &impl ParticleContainer, node_index: usize, next_after: i64) -> (f64, Vector) {
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

    let children: Vec<i64> = node
        .children()
        .expect("internal node without children")
        .iter()
        .copied()
        .filter(|&c| c != NOT_EXIST)
        .collect();

    let mut total_mass = 0.0;
    let mut weighted_position = vector_zero();
    for (i, &child) in children.iter().enumerate() {
        let child_next = if i + 1 < children.len() { children[i + 1] } else { next_after };
        let (mass, com) = build_moments(pool, container, child as usize, child_next);
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
