//! Solver configuration (§4.7, ambient): a YAML-backed parameter struct
//! plus the command-line surface used to locate and override it, in the
//! same `key:value` override style the original CLI tooling used.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use serde::Deserialize;

use crate::error::Result;
use crate::error::SolverError;

/// Which opening criterion `configure()` should install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitKind {
    BarnesHut,
    AccelerationCriterion,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SolverParameters {
    pub split_kind: SplitKind,
    pub open_angle: f64,
    pub max_export: usize,
    #[serde(default)]
    pub softening_length: f64,
}

impl SolverParameters {
    pub fn validate(&self) -> Result<()> {
        if !(self.open_angle > 0.0 && self.open_angle <= 1.0) {
            return Err(SolverError::Configuration(format!(
                "open_angle must be in (0, 1], got {}",
                self.open_angle
            )));
        }
        if self.max_export == 0 {
            return Err(SolverError::Configuration("max_export must be greater than zero".into()));
        }
        if self.softening_length < 0.0 {
            return Err(SolverError::Configuration("softening_length must be non-negative".into()));
        }
        Ok(())
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let parameters: SolverParameters =
            serde_yaml::from_str(contents).map_err(|e| SolverError::Configuration(e.to_string()))?;
        parameters.validate()?;
        Ok(parameters)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SolverError::Configuration(format!("reading {}: {e}", path.display())))?;
        Self::from_yaml_str(&contents)
    }
}

/// A single `section/key:value` override applied on top of a parameter
/// file, e.g. `solver/open_angle:0.3`.
#[derive(Debug, Clone)]
pub struct Override {
    pub section: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug)]
pub struct ParseOverrideError(String);

impl fmt::Display for ParseOverrideError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid override '{}', expected 'section/key:value'", self.0)
    }
}

impl std::error::Error for ParseOverrideError {}

impl FromStr for Override {
    type Err = ParseOverrideError;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        let (path, value) = input.split_once(':').ok_or_else(|| ParseOverrideError(input.to_string()))?;
        let (section, key) = path.split_once('/').ok_or_else(|| ParseOverrideError(input.to_string()))?;
        Ok(Override {
            section: section.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

#[derive(Parser, Debug)]
#[clap(name = "barnes-hut-tree")]
pub struct CommandLineOptions {
    /// Increase log verbosity; may be repeated (-v, -vv).
    #[clap(short, long, parse(from_occurrences))]
    pub verbosity: u8,

    /// Path to a YAML parameter file.
    #[clap(short, long)]
    pub parameter_file: Option<PathBuf>,

    /// Override a single parameter: `section/key:value`.
    #[clap(short = 'o', long = "override")]
    pub overrides: Vec<Override>,
}
