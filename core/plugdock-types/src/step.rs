//! The fixed, weighted step sequence of a plugin installation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One step of an installation. Steps always run in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStep {
    Download,
    Validate,
    Extract,
    Dependencies,
    Configure,
    Install,
    Initialize,
}

impl InstallStep {
    /// All steps in execution order.
    pub const ALL: [InstallStep; 7] = [
        InstallStep::Download,
        InstallStep::Validate,
        InstallStep::Extract,
        InstallStep::Dependencies,
        InstallStep::Configure,
        InstallStep::Install,
        InstallStep::Initialize,
    ];

    /// Relative weight of this step. Weights sum to 100.
    pub const fn weight(self) -> u32 {
        match self {
            Self::Download => 20,
            Self::Validate => 10,
            Self::Extract => 10,
            Self::Dependencies => 20,
            Self::Configure => 10,
            Self::Install => 20,
            Self::Initialize => 10,
        }
    }

    /// Position of this step in the sequence.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Sum of the weights of every step before this one.
    pub fn completed_weight_before(self) -> u32 {
        Self::ALL[..self.index()].iter().map(|s| s.weight()).sum()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Validate => "validate",
            Self::Extract => "extract",
            Self::Dependencies => "dependencies",
            Self::Configure => "configure",
            Self::Install => "install",
            Self::Initialize => "initialize",
        }
    }
}

impl fmt::Display for InstallStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
