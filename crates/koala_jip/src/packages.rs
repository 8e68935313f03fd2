//! KoalaNLP engine packages and their Maven coordinates.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::registry::{ArtifactIdentity, ExclusionPattern};

pub const PACKAGE_GROUP: &str = "kr.bydelta";
pub const ARTIFACT_PREFIX: &str = "koalanlp-";
pub const ASSEMBLY_CLASSIFIER: &str = "assembly";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown engine package '{0}'")]
pub struct UnknownPackage(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EnginePackage {
    Hnn,
    Kmr,
    Kkma,
    Eunjeon,
    Arirang,
    Rhino,
    Okt,
    Daon,
    Etri,
    Khaiii,
    Utagger,
    Kss,
    Core,
}

impl EnginePackage {
    pub const ALL: [EnginePackage; 13] = [
        EnginePackage::Hnn,
        EnginePackage::Kmr,
        EnginePackage::Kkma,
        EnginePackage::Eunjeon,
        EnginePackage::Arirang,
        EnginePackage::Rhino,
        EnginePackage::Okt,
        EnginePackage::Daon,
        EnginePackage::Etri,
        EnginePackage::Khaiii,
        EnginePackage::Utagger,
        EnginePackage::Kss,
        EnginePackage::Core,
    ];

    pub const fn code(self) -> &'static str {
        match self {
            EnginePackage::Hnn => "hnn",
            EnginePackage::Kmr => "kmr",
            EnginePackage::Kkma => "kkma",
            EnginePackage::Eunjeon => "eunjeon",
            EnginePackage::Arirang => "arirang",
            EnginePackage::Rhino => "rhino",
            EnginePackage::Okt => "okt",
            EnginePackage::Daon => "daon",
            EnginePackage::Etri => "etri",
            EnginePackage::Khaiii => "khaiii",
            EnginePackage::Utagger => "utagger",
            EnginePackage::Kss => "kss",
            EnginePackage::Core => "core",
        }
    }

    /// Packages published as fat jars under the `assembly` classifier.
    pub const fn requires_assembly(self) -> bool {
        matches!(
            self,
            EnginePackage::Hnn
                | EnginePackage::Kkma
                | EnginePackage::Arirang
                | EnginePackage::Rhino
                | EnginePackage::Daon
        )
    }

    pub fn artifact_name(self) -> String {
        format!("{ARTIFACT_PREFIX}{}", self.code())
    }

    pub fn identity(self, version: impl Into<String>) -> ArtifactIdentity {
        let identity = ArtifactIdentity::new(PACKAGE_GROUP, self.artifact_name(), version);
        if self.requires_assembly() {
            identity.with_classifier(ASSEMBLY_CLASSIFIER)
        } else {
            identity
        }
    }
}

impl fmt::Display for EnginePackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code().to_ascii_uppercase())
    }
}

impl FromStr for EnginePackage {
    type Err = UnknownPackage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalised = s.trim().to_ascii_lowercase();
        let code = normalised
            .strip_prefix(ARTIFACT_PREFIX)
            .unwrap_or(&normalised);
        EnginePackage::ALL
            .into_iter()
            .find(|package| package.code() == code)
            .ok_or_else(|| UnknownPackage(s.trim().to_string()))
    }
}

/// Requested version of a package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum VersionSpec {
    #[default]
    Latest,
    Exact(String),
}

impl VersionSpec {
    pub fn as_str(&self) -> &str {
        match self {
            VersionSpec::Latest => "LATEST",
            VersionSpec::Exact(version) => version,
        }
    }
}

impl From<&str> for VersionSpec {
    fn from(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("latest") {
            VersionSpec::Latest
        } else {
            VersionSpec::Exact(trimmed.to_string())
        }
    }
}

impl From<String> for VersionSpec {
    fn from(value: String) -> Self {
        VersionSpec::from(value.as_str())
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageRequest {
    pub package: EnginePackage,
    pub version: VersionSpec,
}

impl PackageRequest {
    pub fn new(package: EnginePackage, version: impl Into<VersionSpec>) -> Self {
        Self {
            package,
            version: version.into(),
        }
    }

    pub fn latest(package: EnginePackage) -> Self {
        Self::new(package, VersionSpec::Latest)
    }

    /// Coordinate to resolve; `LATEST` is left for version selection.
    pub fn identity(&self) -> ArtifactIdentity {
        self.package.identity(self.version.as_str())
    }
}

/// Exclusions applied to every initialization.
pub fn default_exclusions() -> Vec<ExclusionPattern> {
    vec![ExclusionPattern::new("com.jsuereth", "sbt-pgp")]
}
