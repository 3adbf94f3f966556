//! Gate state machine for package and distro builds.
//!
//! Gate rules:
//! - `tested` applies to package builds, `staged` and `passed` to distro builds
//! - every gate needs both a `linux-64` and an `osx-64` signal
//! - flags are set monotonically and never cleared
//!
//! Gates are ordered (`tested < staged < passed`) but nothing here enforces
//! forward-only movement. Each pipeline task names the gate it marks.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GateError;
use crate::schema::{DistroBuildRecord, PackageBuildRecord};

/// An ordered promotion stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    Tested,
    Staged,
    Passed,
}

impl Gate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gate::Tested => "tested",
            Gate::Staged => "staged",
            Gate::Passed => "passed",
        }
    }
}

impl std::fmt::Display for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Gate {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tested" => Ok(Gate::Tested),
            "staged" => Ok(Gate::Staged),
            "passed" => Ok(Gate::Passed),
            other => Err(GateError::InvalidGate {
                gate: other.to_string(),
                record: "any record",
            }),
        }
    }
}

/// Supported build architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    Linux64,
    Osx64,
}

impl Arch {
    pub const ALL: [Arch; 2] = [Arch::Linux64, Arch::Osx64];

    /// Subdirectory name inside a channel, also the package artifact name.
    pub fn subdir(&self) -> &'static str {
        match self {
            Arch::Linux64 => "linux-64",
            Arch::Osx64 => "osx-64",
        }
    }

    /// Parse a package build artifact name (`linux-64` / `osx-64`).
    pub fn from_package_artifact(name: &str) -> Result<Self, GateError> {
        match name {
            "linux-64" => Ok(Arch::Linux64),
            "osx-64" => Ok(Arch::Osx64),
            other => Err(GateError::InvalidArchitecture(other.to_string())),
        }
    }

    /// Parse the platform half of a distro artifact name (`linux` / `osx`).
    pub fn from_platform(platform: &str) -> Result<Self, GateError> {
        match platform {
            "linux" => Ok(Arch::Linux64),
            "osx" => Ok(Arch::Osx64),
            other => Err(GateError::InvalidArchitecture(other.to_string())),
        }
    }
}

/// Split `<distro>-<platform>` on the last dash so distro names may contain dashes.
pub fn parse_distro_artifact(artifact_name: &str) -> Result<(&str, Arch), GateError> {
    let (distro, platform) = artifact_name
        .rsplit_once('-')
        .filter(|(d, p)| !d.is_empty() && !p.is_empty())
        .ok_or_else(|| GateError::MalformedArtifactName(artifact_name.to_string()))?;
    Ok((distro, Arch::from_platform(platform)?))
}

impl PackageBuildRecord {
    /// Record that the artifact for one architecture has been uploaded.
    pub fn mark_architecture(&mut self, artifact_name: &str) -> Result<Arch, GateError> {
        let arch = Arch::from_package_artifact(artifact_name)?;
        self.set_architecture(arch);
        Ok(arch)
    }

    /// Set one architecture flag. Flags only ever go from false to true.
    pub fn set_architecture(&mut self, arch: Arch) {
        match arch {
            Arch::Linux64 => self.linux_64 = true,
            Arch::Osx64 => self.osx_64 = true,
        }
    }

    /// Whether both architectures are present for `gate` (only `tested` is valid).
    pub fn verify_gate(&self, gate: Gate) -> Result<bool, GateError> {
        if gate != Gate::Tested {
            return Err(GateError::InvalidGate {
                gate: gate.to_string(),
                record: "package build",
            });
        }
        Ok(self.linux_64 && self.osx_64)
    }
}

impl DistroBuildRecord {
    fn check_gate(gate: Gate) -> Result<(), GateError> {
        match gate {
            Gate::Staged | Gate::Passed => Ok(()),
            Gate::Tested => Err(GateError::InvalidGate {
                gate: gate.to_string(),
                record: "distro build",
            }),
        }
    }

    /// Set the flag for `gate` named by an artifact `<distro>-<platform>`.
    ///
    /// Validation happens before any flag is touched, so a rejected artifact
    /// leaves the record unchanged.
    pub fn mark_gate(&mut self, gate: Gate, artifact_name: &str) -> Result<Arch, GateError> {
        let arch = self.gate_architecture(gate, artifact_name)?;
        self.set_gate_architecture(gate, arch)?;
        Ok(arch)
    }

    /// Validate an artifact `<distro>-<platform>` for `gate` without touching
    /// any flag, returning the architecture it names.
    pub fn gate_architecture(&self, gate: Gate, artifact_name: &str) -> Result<Arch, GateError> {
        Self::check_gate(gate)?;
        let (distro, arch) = parse_distro_artifact(artifact_name)?;
        if distro != self.distro_name {
            return Err(GateError::DistroMismatch {
                expected: self.distro_name.clone(),
                found: distro.to_string(),
            });
        }
        Ok(arch)
    }

    /// Set one architecture flag of `gate`. Flags only ever go from false to true.
    pub fn set_gate_architecture(&mut self, gate: Gate, arch: Arch) -> Result<(), GateError> {
        Self::check_gate(gate)?;
        let (linux, osx) = if gate == Gate::Staged {
            (&mut self.staged_linux_64, &mut self.staged_osx_64)
        } else {
            (&mut self.passed_linux_64, &mut self.passed_osx_64)
        };
        match arch {
            Arch::Linux64 => *linux = true,
            Arch::Osx64 => *osx = true,
        }
        Ok(())
    }

    /// Whether both architectures are present for `gate`.
    pub fn verify_gate(&self, gate: Gate) -> Result<bool, GateError> {
        Self::check_gate(gate)?;
        Ok(match gate {
            Gate::Staged => self.staged_linux_64 && self.staged_osx_64,
            _ => self.passed_linux_64 && self.passed_osx_64,
        })
    }

    /// Remember which CI run reported this gate.
    pub fn stamp_run(&mut self, gate: Gate, run_id: &str) -> Result<(), GateError> {
        Self::check_gate(gate)?;
        match gate {
            Gate::Staged => self.staged_run_id = run_id.to_string(),
            _ => self.passed_run_id = run_id.to_string(),
        }
        Ok(())
    }

    /// Record the integration PR URL. Fails once a URL is already present.
    pub fn set_pr_url(&mut self, pr_url: &str) -> Result<(), GateError> {
        if !self.pr_url.is_empty() {
            return Err(GateError::PrUrlAlreadySet {
                existing: self.pr_url.clone(),
                requested: pr_url.to_string(),
            });
        }
        self.pr_url = pr_url.to_string();
        Ok(())
    }
}
