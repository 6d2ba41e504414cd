//! A distributed Barnes-Hut tree gravity solver.
//!
//! The crate does not own a simulation loop, particle storage, or a domain
//! decomposition: callers bring their own [`particle::ParticleContainer`]
//! and an externally computed [`load_balance::LoadBalanceTree`], and drive
//! the solver through [`Solver::configure`], [`Solver::attach`],
//! [`Solver::build`] and [`Solver::walk`].

pub mod communication;
pub mod config;
pub mod config_file;
pub mod error;
pub mod geometry;
pub mod interaction;
pub mod load_balance;
pub mod logging;
pub mod morton;
pub mod node;
pub mod parallel_tree;
pub mod particle;
pub mod pool;
pub mod remote_table;
pub mod splitter;
pub mod tree;

use communication::Transport;
use config_file::SplitKind;
use error::Result;
use error::SolverError;
use geometry::Extent;
use interaction::GravityKernel;
use interaction::Interaction;
use load_balance::LoadBalanceTree;
use parallel_tree::ParallelTree;
use particle::ParticleContainer;
use splitter::AccelerationCriterion;
use splitter::BarnesHut;
use splitter::Splitter;

/// Parameters a caller supplies once, before `attach`/`build`/`walk` (§6).
pub struct SolverConfig {
    pub domain: Extent,
    pub split_kind: SplitKind,
    pub open_angle: f64,
    pub max_export: usize,
    pub softening_length: f64,
    pub gravitational_constant: f64,
}

impl SolverConfig {
    fn splitter_factory(&self, reference_mass: f64) -> Box<dyn FnMut() -> Box<dyn Splitter>> {
        match self.split_kind {
            SplitKind::BarnesHut => {
                let theta = self.open_angle;
                Box::new(move || Box::new(BarnesHut::new(theta)) as Box<dyn Splitter>)
            }
            SplitKind::AccelerationCriterion => {
                let theta = self.open_angle;
                Box::new(move || Box::new(AccelerationCriterion::new(theta, reference_mass)) as Box<dyn Splitter>)
            }
        }
    }

    fn interaction_factory(&self) -> Box<dyn FnMut() -> Box<dyn Interaction>> {
        let g = self.gravitational_constant;
        let softening = self.softening_length;
        Box::new(move || Box::new(GravityKernel::new(g, softening)) as Box<dyn Interaction>)
    }
}

/// The top-level handle a caller drives: a distributed gravity tree bound
/// to one rank's slice of a [`LoadBalanceTree`] (§6).
pub struct Solver<'a> {
    config: SolverConfig,
    rank: i32,
    size: i32,
    load_balance: Option<&'a dyn LoadBalanceTree>,
    tree: ParallelTree,
    reference_mass: f64,
}

impl<'a> Solver<'a> {
    /// `configure` (§6): validate parameters and allocate the parallel
    /// tree's node pool for this rank.
    pub fn configure(config: SolverConfig, rank: i32, size: i32) -> Result<Self> {
        if !(config.open_angle > 0.0 && config.open_angle <= 1.0) {
            return Err(SolverError::Configuration(format!(
                "open_angle must be in (0, 1], got {}",
                config.open_angle
            )));
        }
        if config.max_export == 0 {
            return Err(SolverError::Configuration("max_export must be greater than zero".into()));
        }
        if config.softening_length < 0.0 {
            return Err(SolverError::Configuration("softening_length must be non-negative".into()));
        }
        let tree = ParallelTree::new(rank, size, config.max_export)?;
        Ok(Self {
            config,
            rank,
            size,
            load_balance: None,
            tree,
            reference_mass: 1.0,
        })
    }

    /// `attach` (§6): bind the externally supplied load-balance tree this
    /// rank's top tree will be replicated from.
    pub fn attach(&mut self, load_balance: &'a dyn LoadBalanceTree) {
        self.load_balance = Some(load_balance);
    }

    /// `build` (§6): replicate the top tree, insert this rank's real
    /// particles, and exchange remote moments so every rank's copy of the
    /// top tree carries up-to-date masses and centers of mass.
    pub fn build(&mut self, container: &impl ParticleContainer, transport: &dyn Transport) -> Result<()> {
        let load_balance = self
            .load_balance
            .ok_or_else(|| SolverError::Configuration("attach() must be called before build()".into()))?;

        self.tree = ParallelTree::new(self.rank, self.size, self.config.max_export)?;
        self.tree.replicate_top_tree(load_balance, self.config.domain)?;
        self.tree.insert_local_particles(load_balance, container)?;
        self.reference_mass = mean_real_mass(container);
        self.tree.exchange_remote_moments(container, transport)
    }

    /// `walk` (§6): accumulate gravitational acceleration into every real
    /// particle in `container`, running as many export/import rounds as
    /// needed to drain every rank's work (§4.5.4).
    pub fn walk(&self, container: &mut impl ParticleContainer, transport: &dyn Transport) -> Result<()> {
        let mut splitter_factory = self.config.splitter_factory(self.reference_mass);
        let mut interaction_factory = self.config.interaction_factory();
        self.tree.walk_to_completion(container, splitter_factory.as_mut(), interaction_factory.as_mut(), transport)
    }

    pub fn node_count(&self) -> usize {
        self.tree.count_nodes()
    }
}

fn mean_real_mass(container: &impl ParticleContainer) -> f64 {
    let mut total = 0.0;
    let mut count = 0usize;
    for i in 0..container.len() {
        if container.tag(i) == particle::Tag::Real {
            total += container.mass(i);
            count += 1;
        }
    }
    if count == 0 {
        1.0
    } else {
        total / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use communication::local::LocalWorld;
    use config::from_fn;
    use load_balance::SegmentTree;
    use particle::ParticleSet;
    use particle::Tag;

    #[test]
    fn end_to_end_single_rank_build_and_walk() {
        let mut particles = ParticleSet::new();
        particles.push(from_fn(|_| 0.0), 1.0, Tag::Real);
        particles.push(from_fn(|k| if k == 0 { 1.0 } else { 0.0 }), 1.0, Tag::Real);
        let extent = Extent::new(from_fn(|_| -2.0), from_fn(|_| 2.0));
        particles.assign_keys(&extent);

        let load_balance = SegmentTree::new_balanced(1);
        let world = LocalWorld::new(1);
        let transport = world.transport(0);

        let config = SolverConfig {
            domain: extent,
            split_kind: SplitKind::BarnesHut,
            open_angle: 0.5,
            max_export: 64,
            softening_length: 0.0,
            gravitational_constant: 1.0,
        };
        let mut solver = Solver::configure(config, 0, 1).unwrap();
        solver.attach(&load_balance);
        solver.build(&particles, &transport).unwrap();
        solver.walk(&mut particles, &transport).unwrap();

        assert!(particles.acceleration(0).length() > 0.0);
        assert!(particles.acceleration(1).length() > 0.0);
    }

    #[test]
    fn build_without_attach_is_a_configuration_error() {
        let config = SolverConfig {
            domain: Extent::new(from_fn(|_| 0.0), from_fn(|_| 1.0)),
            split_kind: SplitKind::BarnesHut,
            open_angle: 0.5,
            max_export: 64,
            softening_length: 0.0,
            gravitational_constant: 1.0,
        };
        let mut solver = Solver::configure(config, 0, 1).unwrap();
        let particles = ParticleSet::new();
        let world = LocalWorld::new(1);
        let transport = world.transport(0);
        assert!(solver.build(&particles, &transport).is_err());
    }

    #[test]
    fn configure_rejects_out_of_range_open_angle() {
        let config = SolverConfig {
            domain: Extent::new(from_fn(|_| 0.0), from_fn(|_| 1.0)),
            split_kind: SplitKind::BarnesHut,
            open_angle: 0.0,
            max_export: 64,
            softening_length: 0.0,
            gravitational_constant: 1.0,
        };
        assert!(Solver::configure(config, 0, 1).is_err());
    }
}
