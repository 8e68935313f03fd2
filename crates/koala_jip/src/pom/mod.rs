//! Dependency manifests (`.pom` files).
//!
//! Parsing happens in two steps. [`RawPom::parse`] reads one document as
//! written. [`EffectivePom::inherit`] folds a parent chain into the property
//! and dependency-management context. [`PomDescriptor::build`] then yields the
//! dependencies the resolver should walk.

use std::borrow::Cow;
use std::collections::HashMap;

use roxmltree::{Document, Node};
use thiserror::Error;
use tracing::{debug, warn};

use crate::registry::{ArtifactIdentity, ExclusionPattern};

/// Scopes that never reach the runtime classpath.
const SKIPPED_SCOPES: &[&str] = &["test", "provided", "system", "import"];

/// Dependency types that resolve to a jar file.
const BINARY_TYPES: &[&str] = &["jar", "bundle"];

const MAX_PLACEHOLDER_PASSES: usize = 8;

#[derive(Debug, Error)]
pub enum PomError {
    #[error("malformed manifest: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("manifest has no <project> element")]
    MissingProject,
    #[error("<parent> is missing {0}")]
    IncompleteParent(&'static str),
}

/// A `<repository>` entry declared by a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredRepository {
    pub id: String,
    pub url: String,
}

/// One manifest as written, before inheritance.
#[derive(Debug, Clone, Default)]
pub struct RawPom {
    packaging: Option<String>,
    parent: Option<ParentRef>,
    properties: HashMap<String, String>,
    dependency_management: Vec<RawDependency>,
    dependencies: Vec<RawDependency>,
    repositories: Vec<DeclaredRepository>,
}

#[derive(Debug, Clone)]
struct ParentRef {
    group_id: String,
    artifact_id: String,
    version: String,
}

#[derive(Debug, Clone, Default)]
struct RawDependency {
    group_id: Option<String>,
    artifact_id: Option<String>,
    version: Option<String>,
    scope: Option<String>,
    classifier: Option<String>,
    dep_type: Option<String>,
    optional: bool,
    exclusions: Vec<ExclusionPattern>,
}

impl RawPom {
    pub fn parse(bytes: &[u8]) -> Result<Self, PomError> {
        let text = String::from_utf8_lossy(bytes);
        let text = text.trim_start_matches('\u{feff}');
        let normalized = normalize_xml_entities(text);
        let document = Document::parse(normalized.as_ref())?;
        let project = document
            .descendants()
            .find(|node| node.has_tag_name("project"))
            .ok_or(PomError::MissingProject)?;

        let parent = child(&project, "parent").map(parse_parent).transpose()?;
        let dependency_management = child(&project, "dependencyManagement")
            .map(|node| parse_dependencies(&node))
            .unwrap_or_default();

        Ok(Self {
            packaging: node_text(&project, "packaging"),
            parent,
            properties: parse_properties(&project),
            dependency_management,
            dependencies: parse_dependencies(&project),
            repositories: parse_repositories(&project),
        })
    }

    /// Identity of the `<parent>` manifest, if one is declared.
    pub fn parent(&self) -> Option<ArtifactIdentity> {
        self.parent.as_ref().map(|parent| {
            ArtifactIdentity::new(&parent.group_id, &parent.artifact_id, &parent.version)
        })
    }

    pub fn packaging(&self) -> &str {
        self.packaging.as_deref().unwrap_or("jar")
    }
}

/// Inherited context of a manifest: properties, managed versions and
/// repositories accumulated down its parent chain.
#[derive(Debug, Clone, Default)]
pub struct EffectivePom {
    properties: HashMap<String, String>,
    managed: HashMap<(String, String), ManagedDependency>,
    repositories: Vec<DeclaredRepository>,
}

#[derive(Debug, Clone)]
struct ManagedDependency {
    version: String,
    scope: Option<String>,
    classifier: Option<String>,
    exclusions: Vec<ExclusionPattern>,
}

impl EffectivePom {
    pub fn inherit(owner: &ArtifactIdentity, raw: &RawPom, parent: Option<&EffectivePom>) -> Self {
        let mut properties = parent
            .map(|parent| parent.properties.clone())
            .unwrap_or_default();

        if let Some(parent_ref) = &raw.parent {
            properties.insert("project.parent.groupId".into(), parent_ref.group_id.clone());
            properties.insert(
                "project.parent.artifactId".into(),
                parent_ref.artifact_id.clone(),
            );
            properties.insert("project.parent.version".into(), parent_ref.version.clone());
        }
        properties.extend(raw.properties.clone());
        properties.insert("project.groupId".into(), owner.group().to_string());
        properties.insert("project.artifactId".into(), owner.name().to_string());
        properties.insert("project.version".into(), owner.version().to_string());
        for key in ["groupId", "artifactId", "version"] {
            if let Some(value) = properties.get(&format!("project.{key}")).cloned() {
                properties.insert(format!("pom.{key}"), value);
            }
        }

        let mut managed = parent
            .map(|parent| parent.managed.clone())
            .unwrap_or_default();
        for entry in &raw.dependency_management {
            let (Some(group), Some(artifact)) = (
                resolve_property(entry.group_id.as_deref(), &properties),
                resolve_property(entry.artifact_id.as_deref(), &properties),
            ) else {
                continue;
            };
            if is_import(entry) {
                debug!(
                    owner = %owner,
                    import = %format!("{group}:{artifact}"),
                    "dependencyManagement imports are not expanded"
                );
                continue;
            }
            let Some(version) = resolve_property(entry.version.as_deref(), &properties) else {
                continue;
            };
            managed.insert(
                (group, artifact),
                ManagedDependency {
                    version,
                    scope: entry.scope.clone(),
                    classifier: entry.classifier.clone(),
                    exclusions: entry.exclusions.clone(),
                },
            );
        }

        let mut repositories = parent
            .map(|parent| parent.repositories.clone())
            .unwrap_or_default();
        for repository in &raw.repositories {
            let url = resolve_property(Some(&repository.url), &properties)
                .unwrap_or_else(|| repository.url.clone());
            if !repositories.iter().any(|existing| existing.url == url) {
                repositories.push(DeclaredRepository {
                    id: repository.id.clone(),
                    url,
                });
            }
        }

        Self {
            properties,
            managed,
            repositories,
        }
    }
}

/// A dependency edge: target identity plus the exclusions it declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencySpec {
    pub identity: ArtifactIdentity,
    pub exclusions: Vec<ExclusionPattern>,
}

/// Parsed manifest as consumed by the resolver.
#[derive(Debug, Clone)]
pub struct PomDescriptor {
    pub owner: ArtifactIdentity,
    pub packaging: String,
    pub dependencies: Vec<DependencySpec>,
    pub declared_repositories: Vec<DeclaredRepository>,
}

impl PomDescriptor {
    /// Parses a manifest with no parent context.
    pub fn parse(owner: &ArtifactIdentity, bytes: &[u8]) -> Result<Self, PomError> {
        let raw = RawPom::parse(bytes)?;
        let effective = EffectivePom::inherit(owner, &raw, None);
        Ok(Self::build(owner, &raw, &effective))
    }

    pub fn build(owner: &ArtifactIdentity, raw: &RawPom, effective: &EffectivePom) -> Self {
        let properties = &effective.properties;
        let mut dependencies = Vec::new();

        for dependency in &raw.dependencies {
            let (Some(group), Some(artifact)) = (
                resolve_property(dependency.group_id.as_deref(), properties),
                resolve_property(dependency.artifact_id.as_deref(), properties),
            ) else {
                warn!(owner = %owner, "dependency without groupId/artifactId ignored");
                continue;
            };
            let managed = effective.managed.get(&(group.clone(), artifact.clone()));

            let scope = dependency
                .scope
                .clone()
                .or_else(|| managed.and_then(|managed| managed.scope.clone()));
            if let Some(scope) = scope.as_deref() {
                if SKIPPED_SCOPES.iter().any(|skipped| scope.eq_ignore_ascii_case(skipped)) {
                    continue;
                }
            }
            if dependency.optional {
                continue;
            }
            let dep_type = dependency.dep_type.as_deref().unwrap_or("jar");
            if !BINARY_TYPES.iter().any(|known| dep_type.eq_ignore_ascii_case(known)) {
                debug!(owner = %owner, dependency = %format!("{group}:{artifact}"), dep_type, "non-jar dependency skipped");
                continue;
            }

            let version = resolve_property(dependency.version.as_deref(), properties)
                .or_else(|| managed.map(|managed| managed.version.clone()));
            let Some(version) = version.filter(|version| !version.contains("${")) else {
                warn!(
                    owner = %owner,
                    dependency = %format!("{group}:{artifact}"),
                    "dependency version cannot be determined; skipped"
                );
                continue;
            };
            let version = strip_range(&version);

            let mut identity = ArtifactIdentity::new(group, artifact, version);
            let classifier = resolve_property(dependency.classifier.as_deref(), properties)
                .or_else(|| managed.and_then(|managed| managed.classifier.clone()));
            if let Some(classifier) = classifier {
                identity = identity.with_classifier(classifier);
            }
            if let Err(error) = identity.validate() {
                warn!(owner = %owner, dependency = %identity, %error, "unsafe dependency coordinates; skipped");
                continue;
            }

            let mut exclusions = dependency.exclusions.clone();
            if let Some(managed) = managed {
                for pattern in &managed.exclusions {
                    if !exclusions.contains(pattern) {
                        exclusions.push(pattern.clone());
                    }
                }
            }

            dependencies.push(DependencySpec {
                identity,
                exclusions,
            });
        }

        Self {
            owner: owner.clone(),
            packaging: raw.packaging().to_string(),
            dependencies,
            declared_repositories: effective.repositories.clone(),
        }
    }

    /// Manifests of `pom` packaging publish no binary.
    pub fn has_binary(&self) -> bool {
        !self.packaging.eq_ignore_ascii_case("pom")
    }
}

fn is_import(entry: &RawDependency) -> bool {
    matches!(entry.scope.as_deref(), Some(scope) if scope.eq_ignore_ascii_case("import"))
}

/// `[1.0,2.0)` style ranges pin to their lower bound, `[1.0]` to the version.
fn strip_range(version: &str) -> String {
    let trimmed = version.trim();
    if !(trimmed.starts_with('[') || trimmed.starts_with('(')) {
        return trimmed.to_string();
    }
    let inner = trimmed.trim_matches(|ch| matches!(ch, '[' | ']' | '(' | ')'));
    inner
        .split(',')
        .map(str::trim)
        .find(|bound| !bound.is_empty())
        .unwrap_or(inner)
        .to_string()
}

fn child<'a, 'input>(node: &Node<'a, 'input>, tag: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|child| child.is_element() && child.tag_name().name() == tag)
}

fn children<'a, 'input>(
    node: &Node<'a, 'input>,
    tag: &'static str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children()
        .filter(move |child| child.is_element() && child.tag_name().name() == tag)
}

fn node_text(node: &Node<'_, '_>, tag: &str) -> Option<String> {
    child(node, tag)
        .and_then(|child| child.text())
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

fn parse_parent(node: Node<'_, '_>) -> Result<ParentRef, PomError> {
    Ok(ParentRef {
        group_id: node_text(&node, "groupId").ok_or(PomError::IncompleteParent("groupId"))?,
        artifact_id: node_text(&node, "artifactId")
            .ok_or(PomError::IncompleteParent("artifactId"))?,
        version: node_text(&node, "version").ok_or(PomError::IncompleteParent("version"))?,
    })
}

fn parse_properties(project: &Node<'_, '_>) -> HashMap<String, String> {
    child(project, "properties")
        .map(|props| {
            props
                .children()
                .filter(|child| child.is_element())
                .map(|prop| {
                    let value = prop.text().map(str::trim).unwrap_or_default();
                    (prop.tag_name().name().to_string(), value.to_string())
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_dependencies(container: &Node<'_, '_>) -> Vec<RawDependency> {
    child(container, "dependencies")
        .map(|deps| children(&deps, "dependency").map(parse_dependency).collect())
        .unwrap_or_default()
}

fn parse_dependency(node: Node<'_, '_>) -> RawDependency {
    let exclusions = child(&node, "exclusions")
        .map(|exclusions| {
            children(&exclusions, "exclusion")
                .filter_map(|exclusion| {
                    let group = node_text(&exclusion, "groupId")?;
                    let artifact = node_text(&exclusion, "artifactId")?;
                    Some(ExclusionPattern::new(group, artifact))
                })
                .collect()
        })
        .unwrap_or_default();

    RawDependency {
        group_id: node_text(&node, "groupId"),
        artifact_id: node_text(&node, "artifactId"),
        version: node_text(&node, "version"),
        scope: node_text(&node, "scope"),
        classifier: node_text(&node, "classifier"),
        dep_type: node_text(&node, "type"),
        optional: node_text(&node, "optional")
            .map(|value| value.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
        exclusions,
    }
}

fn parse_repositories(project: &Node<'_, '_>) -> Vec<DeclaredRepository> {
    child(project, "repositories")
        .map(|repos| {
            children(&repos, "repository")
                .filter_map(|repo| {
                    let url = node_text(&repo, "url")?;
                    let id = node_text(&repo, "id").unwrap_or_else(|| url.clone());
                    Some(DeclaredRepository { id, url })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Replaces HTML-only entities that would make the XML parser reject the
/// document.
fn normalize_xml_entities(input: &str) -> Cow<'_, str> {
    if !input.contains('&') {
        return Cow::Borrowed(input);
    }

    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '&' {
            output.push(ch);
            continue;
        }
        let mut entity = String::new();
        while let Some(&next) = chars.peek() {
            entity.push(next);
            chars.next();
            if next == ';' || entity.len() > 32 {
                break;
            }
        }

        match entity.strip_suffix(';') {
            Some(name)
                if ["lt", "gt", "amp", "quot", "apos"]
                    .iter()
                    .any(|known| name.eq_ignore_ascii_case(known))
                    || name.starts_with('#') =>
            {
                output.push('&');
                output.push_str(&entity);
            }
            Some(_) => output.push(' '),
            None => {
                output.push_str("&amp;");
                output.push_str(&entity);
            }
        }
    }

    Cow::Owned(output)
}

fn resolve_property(value: Option<&str>, properties: &HashMap<String, String>) -> Option<String> {
    let mut current = value?.trim().to_string();
    if current.is_empty() {
        return None;
    }

    let mut passes = 0;
    while current.contains("${") {
        passes += 1;
        if passes > MAX_PLACEHOLDER_PASSES {
            return None;
        }
        current = resolve_placeholders(&current, properties)?;
    }
    Some(current)
}

fn resolve_placeholders(raw: &str, properties: &HashMap<String, String>) -> Option<String> {
    let mut result = String::new();
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let suffix = &rest[start + 2..];
        let end = suffix.find('}')?;
        let key = &suffix[..end];
        result.push_str(properties.get(key)?);
        rest = &suffix[end + 1..];
    }
    result.push_str(rest);
    Some(result)
}
