//! Target platform selection for classification and linking.

use std::env;
use std::fmt;

use serde::Serialize;

/// Supported architecture families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetArch {
    X86_64,
    Aarch64,
}

impl TargetArch {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "x86_64" | "amd64" => Some(TargetArch::X86_64),
            "aarch64" | "arm64" => Some(TargetArch::Aarch64),
            _ => None,
        }
    }

    /// Architecture of the running process, if it is one we can call into.
    #[must_use]
    pub fn host() -> Option<Self> {
        Self::parse(env::consts::ARCH)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TargetArch::X86_64 => "x86_64",
            TargetArch::Aarch64 => "aarch64",
        }
    }
}

/// Operating systems, as far as they influence the calling convention.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetOs {
    Macos,
    Linux,
    Windows,
    None,
    Other(String),
}

impl TargetOs {
    pub fn parse(token: &str) -> Self {
        match token {
            "darwin" | "macos" | "ios" => TargetOs::Macos,
            "linux" => TargetOs::Linux,
            "windows" | "pc" | "win" => TargetOs::Windows,
            "none" | "unknown" => TargetOs::None,
            other => TargetOs::Other(other.to_string()),
        }
    }

    fn triple_component(&self) -> &str {
        match self {
            TargetOs::Macos => "macos",
            TargetOs::Linux => "linux",
            TargetOs::Windows => "windows",
            TargetOs::None => "none",
            TargetOs::Other(value) => value.as_str(),
        }
    }
}

/// Target triple description.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Target {
    arch: TargetArch,
    os: TargetOs,
    triple: String,
}

impl Target {
    /// The platform of the running process.
    ///
    /// Hosts outside the supported architecture families are reported as
    /// x86_64 so classification stays usable; linking checks
    /// [`Target::is_host`] and refuses such plans.
    #[must_use]
    pub fn host() -> Self {
        let arch = TargetArch::host().unwrap_or(TargetArch::X86_64);
        let os = TargetOs::parse(env::consts::OS);
        Self::from_components(arch, os)
    }

    /// Parse a target triple or shorthand such as `arm64`.
    ///
    /// # Errors
    ///
    /// Returns [`TargetError::Empty`] when the input is blank, and
    /// [`TargetError::UnsupportedArch`] when the architecture prefix is not
    /// recognised.
    pub fn parse(spec: &str) -> Result<Self, TargetError> {
        let trimmed = spec.trim().to_ascii_lowercase();
        if trimmed.is_empty() {
            return Err(TargetError::Empty);
        }

        let mut parts = trimmed.splitn(2, '-');
        let arch_token = parts.next().unwrap_or_default();
        let arch = TargetArch::parse(arch_token)
            .ok_or_else(|| TargetError::UnsupportedArch(arch_token.to_string()))?;

        let Some(rest) = parts.next() else {
            return Ok(Self::from_components(arch, TargetOs::None));
        };
        let mut rest_iter = rest.split('-');
        let vendor = rest_iter.next().unwrap_or_default();
        let os_token = rest_iter.next().unwrap_or("none");
        let os = if vendor == "apple" && os_token == "none" {
            TargetOs::Macos
        } else {
            TargetOs::parse(os_token)
        };
        let triple = match rest_iter.next() {
            Some(env) => format!("{arch_token}-{vendor}-{os_token}-{env}"),
            None => format!("{arch_token}-{vendor}-{os_token}"),
        };
        Ok(Self { arch, os, triple })
    }

    #[must_use]
    pub fn from_components(arch: TargetArch, os: TargetOs) -> Self {
        let vendor = match os {
            TargetOs::Macos => "apple",
            TargetOs::Windows => "pc",
            TargetOs::Linux | TargetOs::None | TargetOs::Other(_) => "unknown",
        };
        let triple = format!("{}-{}-{}", arch.as_str(), vendor, os.triple_component());
        Self { arch, os, triple }
    }

    #[must_use]
    pub fn arch(&self) -> TargetArch {
        self.arch
    }

    #[must_use]
    pub fn os(&self) -> &TargetOs {
        &self.os
    }

    #[must_use]
    pub fn triple(&self) -> &str {
        &self.triple
    }

    /// Whether code for this target can run in the current process.
    #[must_use]
    pub fn is_host(&self) -> bool {
        TargetArch::host() == Some(self.arch) && self.os == TargetOs::parse(env::consts::OS)
    }
}

impl Default for Target {
    fn default() -> Self {
        Self::host()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.triple)
    }
}

/// Errors encountered while parsing a target triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    Empty,
    UnsupportedArch(String),
}

impl fmt::Display for TargetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetError::Empty => write!(f, "target string must not be empty"),
            TargetError::UnsupportedArch(arch) => {
                write!(
                    f,
                    "unsupported architecture '{arch}'; expected one of x86_64, amd64, aarch64, arm64"
                )
            }
        }
    }
}

impl std::error::Error for TargetError {}
