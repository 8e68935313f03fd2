use quick_xml::de::from_reader;
use serde::Deserialize;
use thiserror::Error;

use super::coordinates::SnapshotStamp;

/// Artifact-level metadata file name published by remote repositories.
pub const METADATA_FILE: &str = "maven-metadata.xml";

/// Metadata file name written by `mvn install` into local repositories.
pub const LOCAL_METADATA_FILE: &str = "maven-metadata-local.xml";

/// Contents of a `maven-metadata.xml` document.
///
/// The same document shape is used at the artifact level (list of versions)
/// and inside a snapshot version directory (timestamp and build number).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MavenMetadata {
    #[serde(rename = "groupId", default)]
    pub group_id: Option<String>,
    #[serde(rename = "artifactId", default)]
    pub artifact_id: Option<String>,
    #[serde(default)]
    pub versioning: Option<Versioning>,
}

impl MavenMetadata {
    pub fn versions(&self) -> &[String] {
        self.versioning
            .as_ref()
            .map(|versioning| versioning.versions.items.as_slice())
            .unwrap_or_default()
    }

    pub fn latest_release(&self) -> Option<&str> {
        self.versioning
            .as_ref()
            .and_then(|versioning| non_blank(versioning.release.as_deref()))
    }

    pub fn latest(&self) -> Option<&str> {
        self.versioning
            .as_ref()
            .and_then(|versioning| non_blank(versioning.latest.as_deref()))
    }

    /// Version picked for a `LATEST` request: release, then latest, then the
    /// last listed version.
    pub fn preferred_version(&self) -> Option<&str> {
        self.latest_release()
            .or_else(|| self.latest())
            .or_else(|| self.versions().last().map(String::as_str))
    }

    /// Timestamp and build number of the newest published snapshot build.
    ///
    /// Returns `None` for `localCopy` snapshots, which keep the plain version in
    /// their file names.
    pub fn snapshot_stamp(&self) -> Option<SnapshotStamp> {
        let snapshot = self.versioning.as_ref()?.snapshot.as_ref()?;
        if snapshot.local_copy.unwrap_or(false) {
            return None;
        }
        let timestamp = non_blank(snapshot.timestamp.as_deref())?.to_string();
        let build_number = snapshot.build_number?;
        Some(SnapshotStamp {
            timestamp,
            build_number,
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Versioning {
    pub latest: Option<String>,
    pub release: Option<String>,
    #[serde(default)]
    pub versions: Versions,
    #[serde(default)]
    pub snapshot: Option<Snapshot>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Versions {
    #[serde(default)]
    #[serde(rename = "version")]
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub timestamp: Option<String>,
    #[serde(rename = "buildNumber")]
    pub build_number: Option<u32>,
    #[serde(rename = "localCopy")]
    pub local_copy: Option<bool>,
}

#[derive(Debug, Error)]
pub enum MetadataParseError {
    #[error("failed to parse maven-metadata.xml: {0}")]
    Xml(#[from] quick_xml::DeError),
}

pub fn parse_metadata(bytes: &[u8]) -> Result<MavenMetadata, MetadataParseError> {
    from_reader(bytes).map_err(MetadataParseError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARTIFACT_LEVEL: &str = r#"
        <metadata>
          <groupId>kr.bydelta</groupId>
          <artifactId>koalanlp-kmr</artifactId>
          <versioning>
            <latest>2.1.5-SNAPSHOT</latest>
            <release>2.1.4</release>
            <versions>
              <version>2.0.0</version>
              <version>2.1.4</version>
              <version>2.1.5-SNAPSHOT</version>
            </versions>
            <lastUpdated>20250101010101</lastUpdated>
          </versioning>
        </metadata>
    "#;

    const SNAPSHOT_LEVEL: &str = r#"
        <metadata modelVersion="1.1.0">
          <groupId>kr.bydelta</groupId>
          <artifactId>koalanlp-kmr</artifactId>
          <version>2.1.5-SNAPSHOT</version>
          <versioning>
            <snapshot>
              <timestamp>20250102.030405</timestamp>
              <buildNumber>7</buildNumber>
            </snapshot>
            <lastUpdated>20250102030405</lastUpdated>
          </versioning>
        </metadata>
    "#;

    #[test]
    fn release_wins_over_latest() {
        let metadata = parse_metadata(ARTIFACT_LEVEL.as_bytes()).expect("metadata parse");
        assert_eq!(metadata.versions().len(), 3);
        assert_eq!(metadata.preferred_version(), Some("2.1.4"));
        assert_eq!(metadata.snapshot_stamp(), None);
    }

    #[test]
    fn falls_back_to_last_listed_version() {
        let xml = r#"
            <metadata>
              <versioning>
                <versions><version>0.9</version><version>1.0</version></versions>
              </versioning>
            </metadata>
        "#;
        let metadata = parse_metadata(xml.as_bytes()).expect("metadata parse");
        assert_eq!(metadata.preferred_version(), Some("1.0"));
    }

    #[test]
    fn reads_snapshot_stamp() {
        let metadata = parse_metadata(SNAPSHOT_LEVEL.as_bytes()).expect("metadata parse");
        let stamp = metadata.snapshot_stamp().expect("stamp");
        assert_eq!(stamp.timestamp, "20250102.030405");
        assert_eq!(stamp.build_number, 7);
    }

    #[test]
    fn local_copy_snapshot_has_no_stamp() {
        let xml = r#"
            <metadata>
              <versioning>
                <snapshot><localCopy>true</localCopy></snapshot>
              </versioning>
            </metadata>
        "#;
        let metadata = parse_metadata(xml.as_bytes()).expect("metadata parse");
        assert_eq!(metadata.snapshot_stamp(), None);
    }
}
