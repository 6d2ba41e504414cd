//! Logger setup (§4.7, ambient): a rank-aware `simplelog` configuration so
//! a distributed run's combined output stays readable. Verbosity is
//! controlled by repeating `-v` on the command line; all non-zero ranks
//! are silenced unless `only_main_rank` is disabled.

use log::LevelFilter;
use simplelog::ColorChoice;
use simplelog::CombinedLogger;
use simplelog::Config as LogConfig;
use simplelog::TermLogger;
use simplelog::TerminalMode;

pub struct LogParameters {
    pub verbosity: u8,
    pub only_main_rank: bool,
}

impl Default for LogParameters {
    fn default() -> Self {
        Self {
            verbosity: 0,
            only_main_rank: true,
        }
    }
}

fn level_for_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Install the global logger. Must be called at most once per process;
/// subsequent calls are a configuration error in the caller, not
/// something this crate can safely degrade from.
pub fn init_logging(rank: i32, params: &LogParameters) {
    let level = if params.only_main_rank && rank != 0 {
        LevelFilter::Warn
    } else {
        level_for_verbosity(params.verbosity)
    };
    let logger = TermLogger::new(level, LogConfig::default(), TerminalMode::Mixed, ColorChoice::Auto);
    CombinedLogger::init(vec![logger]).expect("logger already initialized");
}
