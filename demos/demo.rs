//! A CLI demo: scatter a random particle cloud across `--ranks` in-process
//! threads, build a distributed tree over an externally balanced domain,
//! and run one force evaluation, reporting total mass conservation and
//! elapsed time.
//!
//! With `--ranks 1` this exercises the same code path a single-process
//! caller would use; with `--ranks N > 1` every rank runs on its own OS
//! thread, talking through [`communication::local::LocalWorld`] rather
//! than a real MPI job.

use std::time::Instant;

use clap::Parser;
use rand::Rng;

use barnes_hut_tree::communication::local::LocalWorld;
use barnes_hut_tree::config::from_fn;
use barnes_hut_tree::config::NUM_DIMENSIONS;
use barnes_hut_tree::config_file::CommandLineOptions;
use barnes_hut_tree::config_file::SolverParameters;
use barnes_hut_tree::config_file::SplitKind;
use barnes_hut_tree::geometry::Extent;
use barnes_hut_tree::load_balance::SegmentTree;
use barnes_hut_tree::logging::init_logging;
use barnes_hut_tree::logging::LogParameters;
use barnes_hut_tree::particle::ParticleContainer;
use barnes_hut_tree::particle::ParticleSet;
use barnes_hut_tree::particle::Tag;
use barnes_hut_tree::{Solver, SolverConfig};

#[derive(Parser, Debug)]
#[clap(name = "barnes-hut-tree-demo")]
struct DemoOptions {
    #[clap(flatten)]
    common: CommandLineOptions,

    /// Total number of real particles, split evenly across ranks.
    #[clap(short = 'n', long, default_value_t = 2000)]
    num_particles: usize,

    /// Number of in-process ranks to simulate.
    #[clap(short, long, default_value_t = 1)]
    ranks: i32,

    /// Half-width of the cubic domain particles are scattered in.
    #[clap(long, default_value_t = 10.0)]
    box_half_width: f64,
}

fn default_parameters() -> SolverParameters {
    SolverParameters {
        split_kind: SplitKind::BarnesHut,
        open_angle: 0.5,
        max_export: 4096,
        softening_length: 0.01,
    }
}

fn load_parameters(options: &DemoOptions) -> SolverParameters {
    let mut parameters = match &options.common.parameter_file {
        Some(path) => SolverParameters::from_yaml_file(path).unwrap_or_else(|e| {
            log::warn!("falling back to defaults: {e}");
            default_parameters()
        }),
        None => default_parameters(),
    };
    for o in &options.common.overrides {
        if o.section != "solver" {
            continue;
        }
        apply_override(&mut parameters, &o.key, &o.value);
    }
    parameters
}

fn apply_override(parameters: &mut SolverParameters, key: &str, value: &str) {
    match key {
        "open_angle" => {
            if let Ok(v) = value.parse() {
                parameters.open_angle = v;
            }
        }
        "max_export" => {
            if let Ok(v) = value.parse() {
                parameters.max_export = v;
            }
        }
        "softening_length" => {
            if let Ok(v) = value.parse() {
                parameters.softening_length = v;
            }
        }
        other => log::warn!("ignoring unknown override key 'solver/{other}'"),
    }
}

fn scatter_particles(num_particles: usize, half_width: f64, extent: &Extent) -> ParticleSet {
    let mut rng = rand::thread_rng();
    let mut particles = ParticleSet::new();
    for _ in 0..num_particles {
        let position = from_fn(|_| rng.gen_range(-half_width..half_width));
        let mass = rng.gen_range(0.5..1.5);
        particles.push(position, mass, Tag::Real);
    }
    particles.assign_keys(extent);
    particles
}

fn run_rank(
    rank: i32,
    size: i32,
    parameters: SolverParameters,
    domain: Extent,
    load_balance: SegmentTree,
    num_particles: usize,
    box_half_width: f64,
    transport: barnes_hut_tree::communication::local::LocalTransport,
) -> (f64, f64, usize) {
    let per_rank = num_particles / size as usize;
    let mut particles = scatter_particles(per_rank, box_half_width, &domain);
    let total_mass_before: f64 = (0..particles.len()).map(|i| particles.mass(i)).sum();

    let config = SolverConfig {
        domain,
        split_kind: parameters.split_kind,
        open_angle: parameters.open_angle,
        max_export: parameters.max_export,
        softening_length: parameters.softening_length,
        gravitational_constant: 1.0,
    };
    let mut solver = Solver::configure(config, rank, size).expect("valid configuration");
    solver.attach(&load_balance);
    solver.build(&particles, &transport).expect("build failed");
    solver.walk(&mut particles, &transport).expect("walk failed");

    let mean_accel: f64 =
        (0..particles.len()).map(|i| particles.acceleration(i).length()).sum::<f64>() / particles.len().max(1) as f64;
    (total_mass_before, mean_accel, solver.node_count())
}

fn main() {
    let options = DemoOptions::parse();
    init_logging(
        0,
        &LogParameters {
            verbosity: options.common.verbosity,
            only_main_rank: true,
        },
    );

    let parameters = load_parameters(&options);
    if let Err(e) = parameters.validate() {
        log::error!("{e}");
        std::process::exit(1);
    }

    let domain = Extent::new(from_fn(|_| -options.box_half_width), from_fn(|_| options.box_half_width));
    let world = LocalWorld::new(options.ranks);

    log::info!(
        "running {} particles across {} rank(s) in {} dimensions",
        options.num_particles,
        options.ranks,
        NUM_DIMENSIONS
    );

    let size = options.ranks;
    let num_particles = options.num_particles;
    let box_half_width = options.box_half_width;

    let started = Instant::now();
    let results: Vec<(f64, f64, usize)> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..size)
            .map(|rank| {
                let parameters = parameters.clone();
                let load_balance = SegmentTree::new_balanced(size);
                let transport = world.transport(rank);
                scope.spawn(move || {
                    run_rank(rank, size, parameters, domain, load_balance, num_particles, box_half_width, transport)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("rank thread panicked")).collect()
    });
    let elapsed = started.elapsed();

    let total_mass: f64 = results.iter().map(|(mass, _, _)| mass).sum();
    let mean_accel: f64 = results.iter().map(|(_, accel, _)| accel).sum::<f64>() / results.len() as f64;
    let total_nodes: usize = results.iter().map(|(_, _, nodes)| nodes).sum();

    log::info!("total mass across all ranks: {total_mass:.6}");
    log::info!("mean acceleration magnitude: {mean_accel:.6}");
    log::info!("total nodes allocated across ranks: {total_nodes}");
    log::info!("elapsed: {:.3}s", elapsed.as_secs_f64());
}
