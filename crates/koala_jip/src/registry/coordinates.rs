use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Version suffix marking a mutable snapshot build.
pub const SNAPSHOT_SUFFIX: &str = "-SNAPSHOT";

/// Wildcard accepted by exclusion patterns.
pub const WILDCARD: &str = "*";

/// Immutable key of one fetchable artifact.
///
/// Equality and hashing are *exact*: every field takes part. Use
/// [`ArtifactIdentity::same_artifact`] to compare while ignoring the version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactIdentity {
    group: String,
    name: String,
    version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    classifier: Option<String>,
}

impl ArtifactIdentity {
    pub fn new(
        group: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
            version: version.into(),
            classifier: None,
        }
    }

    pub fn with_classifier(mut self, classifier: impl Into<String>) -> Self {
        let classifier = classifier.into();
        self.classifier = (!classifier.is_empty()).then_some(classifier);
        self
    }

    /// Returns a copy pointing at another version of the same artifact.
    pub fn with_version(&self, version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..self.clone()
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn classifier(&self) -> Option<&str> {
        self.classifier.as_deref()
    }

    /// All four fields are equal.
    pub fn exact_equals(&self, other: &Self) -> bool {
        self == other
    }

    /// Group, name and classifier are equal; the version is ignored.
    pub fn same_artifact(&self, other: &Self) -> bool {
        self.group == other.group && self.name == other.name && self.classifier == other.classifier
    }

    /// Rejects coordinates that cannot be used as path segments: empty
    /// fields, separators and `..`.
    pub fn validate(&self) -> Result<(), CoordinateParseError> {
        let fields = [
            ("group", Some(self.group.as_str())),
            ("name", Some(self.name.as_str())),
            ("version", Some(self.version.as_str())),
            ("classifier", self.classifier.as_deref()),
        ];
        for (field, value) in fields {
            if let Some(value) = value {
                if !is_path_safe(value) {
                    return Err(CoordinateParseError::UnsafeComponent {
                        field,
                        value: value.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn is_snapshot(&self) -> bool {
        self.version.ends_with(SNAPSHOT_SUFFIX)
    }

    pub fn group_path(&self) -> String {
        self.group.replace('.', "/")
    }

    /// `group/with/slashes/name/version`
    pub fn version_dir(&self) -> String {
        format!("{}/{}/{}", self.group_path(), self.name, self.version)
    }

    /// `group/with/slashes/name/maven-metadata.xml`
    pub fn metadata_path(&self, file_name: &str) -> String {
        format!("{}/{}/{}", self.group_path(), self.name, file_name)
    }

    /// `group/with/slashes/name/version/maven-metadata.xml`, used for snapshot builds.
    pub fn snapshot_metadata_path(&self, file_name: &str) -> String {
        format!("{}/{}", self.version_dir(), file_name)
    }

    /// Relative path of the manifest. Manifests never carry the classifier.
    pub fn manifest_path(&self, extension: &str) -> String {
        self.relative_path(extension, None, None)
    }

    /// Relative path of the binary, including the classifier when present.
    pub fn jar_path(&self, extension: &str) -> String {
        self.relative_path(extension, self.classifier(), None)
    }

    /// Manifest path as served by a remote repository. Snapshot builds replace
    /// the version inside the file name with the resolved stamp.
    pub fn remote_manifest_path(&self, extension: &str, stamp: Option<&SnapshotStamp>) -> String {
        self.relative_path(extension, None, stamp)
    }

    pub fn remote_jar_path(&self, extension: &str, stamp: Option<&SnapshotStamp>) -> String {
        self.relative_path(extension, self.classifier(), stamp)
    }

    /// File name of the locally cached binary.
    pub fn jar_file_name(&self, extension: &str) -> String {
        self.file_name(extension, self.classifier(), None)
    }

    fn relative_path(
        &self,
        extension: &str,
        classifier: Option<&str>,
        stamp: Option<&SnapshotStamp>,
    ) -> String {
        format!(
            "{}/{}",
            self.version_dir(),
            self.file_name(extension, classifier, stamp)
        )
    }

    fn file_name(
        &self,
        extension: &str,
        classifier: Option<&str>,
        stamp: Option<&SnapshotStamp>,
    ) -> String {
        let version = match stamp {
            Some(stamp) if self.is_snapshot() => stamp.file_version(&self.version),
            _ => self.version.clone(),
        };
        match classifier {
            Some(classifier) => format!("{}-{}-{}.{}", self.name, version, classifier, extension),
            None => format!("{}-{}.{}", self.name, version, extension),
        }
    }
}

impl fmt::Display for ArtifactIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.classifier {
            Some(classifier) => write!(
                f,
                "{}:{}:{}:{}",
                self.group, self.name, self.version, classifier
            ),
            None => write!(f, "{}:{}:{}", self.group, self.name, self.version),
        }
    }
}

fn is_path_safe(value: &str) -> bool {
    !value.is_empty()
        && !value.contains("..")
        && !value.chars().any(|ch| matches!(ch, '/' | '\\' | '\0'))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordinateParseError {
    #[error("expected `group:name:version[:classifier]`, got '{0}'")]
    Identity(String),
    #[error("{field} '{value}' cannot be used in a repository path")]
    UnsafeComponent { field: &'static str, value: String },
    #[error("expected `group:name[:version]`, got '{0}'")]
    Exclusion(String),
}

impl FromStr for ArtifactIdentity {
    type Err = CoordinateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.iter().any(|part| part.is_empty()) {
            return Err(CoordinateParseError::Identity(s.to_string()));
        }
        let identity = match parts.as_slice() {
            [group, name, version] => Self::new(*group, *name, *version),
            [group, name, version, classifier] => {
                Self::new(*group, *name, *version).with_classifier(*classifier)
            }
            _ => return Err(CoordinateParseError::Identity(s.to_string())),
        };
        identity.validate()?;
        Ok(identity)
    }
}

/// Timestamp and build number that name one published snapshot build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotStamp {
    pub timestamp: String,
    pub build_number: u32,
}

impl SnapshotStamp {
    /// `1.0-SNAPSHOT` becomes `1.0-20240101.101010-3`.
    pub fn file_version(&self, version: &str) -> String {
        let base = version.strip_suffix(SNAPSHOT_SUFFIX).unwrap_or(version);
        format!("{}-{}-{}", base, self.timestamp, self.build_number)
    }
}

/// `group:name` pattern removing matching artifacts from a subtree.
///
/// Either component may be `*`. Version and classifier never take part, which
/// mirrors Maven's `<exclusion>` element.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExclusionPattern {
    group: String,
    name: String,
}

impl ExclusionPattern {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }

    /// Builds a pattern excluding every version of `identity`.
    pub fn for_artifact(identity: &ArtifactIdentity) -> Self {
        Self::new(identity.group(), identity.name())
    }

    pub fn matches(&self, identity: &ArtifactIdentity) -> bool {
        component_matches(&self.group, identity.group())
            && component_matches(&self.name, identity.name())
    }
}

fn component_matches(pattern: &str, value: &str) -> bool {
    pattern == WILDCARD || pattern == value
}

impl fmt::Display for ExclusionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.name)
    }
}

impl FromStr for ExclusionPattern {
    type Err = CoordinateParseError;

    /// Accepts `group:name` and `group:name:version`; the version is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        match parts.as_slice() {
            [group, name] | [group, name, _] if !group.is_empty() && !name.is_empty() => {
                Ok(Self::new(*group, *name))
            }
            _ => Err(CoordinateParseError::Exclusion(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn paths_include_classifier_only_for_binaries() {
        let base = ArtifactIdentity::new("kr.bydelta", "koalanlp-kkma", "2.1.4");
        assert_eq!(
            base.jar_path("jar"),
            "kr/bydelta/koalanlp-kkma/2.1.4/koalanlp-kkma-2.1.4.jar"
        );

        let assembly = base.clone().with_classifier("assembly");
        assert_eq!(
            assembly.jar_path("jar"),
            "kr/bydelta/koalanlp-kkma/2.1.4/koalanlp-kkma-2.1.4-assembly.jar"
        );
        assert_eq!(
            assembly.manifest_path("pom"),
            "kr/bydelta/koalanlp-kkma/2.1.4/koalanlp-kkma-2.1.4.pom"
        );
    }

    #[test]
    fn snapshot_stamp_only_changes_the_remote_file_name() {
        let snapshot =
            ArtifactIdentity::new("org.example", "demo", "1.0-SNAPSHOT").with_classifier("assembly");
        let stamp = SnapshotStamp {
            timestamp: "20240101.101010".to_string(),
            build_number: 3,
        };

        assert_eq!(
            snapshot.remote_jar_path("jar", Some(&stamp)),
            "org/example/demo/1.0-SNAPSHOT/demo-1.0-20240101.101010-3-assembly.jar"
        );
        assert_eq!(
            snapshot.remote_manifest_path("pom", Some(&stamp)),
            "org/example/demo/1.0-SNAPSHOT/demo-1.0-20240101.101010-3.pom"
        );
        assert_eq!(
            snapshot.jar_path("jar"),
            "org/example/demo/1.0-SNAPSHOT/demo-1.0-SNAPSHOT-assembly.jar"
        );
    }

    #[test]
    fn stamp_is_ignored_for_release_versions() {
        let release = ArtifactIdentity::new("org.example", "demo", "1.0");
        let stamp = SnapshotStamp {
            timestamp: "20240101.101010".to_string(),
            build_number: 1,
        };
        assert_eq!(
            release.remote_jar_path("jar", Some(&stamp)),
            release.jar_path("jar")
        );
    }

    #[test]
    fn same_artifact_ignores_version_but_not_classifier() {
        let old = ArtifactIdentity::new("g", "n", "1.0");
        let new = ArtifactIdentity::new("g", "n", "1.1");
        let classified = new.clone().with_classifier("assembly");

        assert!(old.same_artifact(&new));
        assert!(!old.exact_equals(&new));
        assert!(!new.same_artifact(&classified));

        let set: HashSet<_> = [old.clone(), new.clone(), old.clone()].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn exclusion_patterns_support_wildcards() {
        let pgp: ExclusionPattern = "com.jsuereth:sbt-pgp:*".parse().expect("pattern");
        assert!(pgp.matches(&ArtifactIdentity::new("com.jsuereth", "sbt-pgp", "1.1.0")));
        assert!(!pgp.matches(&ArtifactIdentity::new("com.jsuereth", "other", "1.1.0")));

        let whole_group = ExclusionPattern::new("org.scala-lang", WILDCARD);
        assert!(whole_group.matches(&ArtifactIdentity::new("org.scala-lang", "scala-library", "2.12.8")));
    }

    #[test]
    fn parse_identity_with_classifier() {
        let identity: ArtifactIdentity = "kr.bydelta:koalanlp-hnn:2.1.4:assembly"
            .parse()
            .expect("identity");
        assert_eq!(identity.classifier(), Some("assembly"));
        assert_eq!(identity.to_string(), "kr.bydelta:koalanlp-hnn:2.1.4:assembly");

        assert!("kr.bydelta:koalanlp-hnn".parse::<ArtifactIdentity>().is_err());
        assert!("a::1.0".parse::<ArtifactIdentity>().is_err());
    }

    #[test]
    fn traversal_components_are_rejected() {
        let escaping = ArtifactIdentity::new("org.example", "evil", "1")
            .with_classifier("x/../../../../escaped");
        assert!(matches!(
            escaping.validate(),
            Err(CoordinateParseError::UnsafeComponent { field: "classifier", .. })
        ));
        assert!(ArtifactIdentity::new("org.example", "..", "1").validate().is_err());
        assert!(ArtifactIdentity::new("org.example", "a", "1\\..\\x").validate().is_err());
        assert!(ArtifactIdentity::new("kr.bydelta", "koalanlp-kkma", "2.1.4").validate().is_ok());

        assert!(matches!(
            "org.example:evil:1:x/../../escaped".parse::<ArtifactIdentity>(),
            Err(CoordinateParseError::UnsafeComponent { .. })
        ));
    }
}
