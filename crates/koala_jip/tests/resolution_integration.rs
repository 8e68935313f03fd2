//! Integration tests for the dependency graph walk.

mod support;

use koala_jip::registry::{ArtifactIdentity, ExclusionPattern};
use koala_jip::resolver::Resolver;
use tempfile::tempdir;

use support::{BASE, CountingRemote, context, dep, dep_excluding, id, parent_pom, pom};

fn publish_scenario(remote: &CountingRemote) {
    let (a, b, c, d) = (id("a"), id("b"), id("c"), id("d"));
    remote.publish(&a, &[dep(&b), dep(&c)]);
    remote.publish(&b, &[dep(&d)]);
    remote.publish(&c, &[]);
    remote.publish(&d, &[]);
}

fn names<'a>(identities: impl Iterator<Item = &'a ArtifactIdentity>) -> Vec<String> {
    identities.map(|identity| identity.name().to_string()).collect()
}

// =============================================================================
// Graph walk
// =============================================================================

#[tokio::test]
async fn scenario_downloads_each_artifact_once() {
    let temp = tempdir().expect("temp");
    let remote = CountingRemote::new();
    publish_scenario(&remote);

    let mut context = context(temp.path(), remote.clone());
    let resolution = Resolver::new(&mut context, Vec::new())
        .resolve(&[id("a")])
        .await;

    assert_eq!(names(resolution.identities()), vec!["a", "b", "c", "d"]);
    assert!(resolution.warnings.is_empty());
    assert_eq!(context.index.len(), 4);
    for name in ["a", "b", "c", "d"] {
        assert!(context.index.is_installed(&id(name)));
    }
    // The walk fetches manifests only; jars are left to the download pool.
    assert_eq!(remote.request_count(".jar"), 0);
}

#[tokio::test]
async fn request_exclusion_prunes_subtree_without_lookup() {
    let temp = tempdir().expect("temp");
    let remote = CountingRemote::new();
    publish_scenario(&remote);

    let mut context = context(temp.path(), remote.clone());
    let resolution = Resolver::new(&mut context, vec![ExclusionPattern::for_artifact(&id("d"))])
        .resolve(&[id("a")])
        .await;

    assert_eq!(names(resolution.identities()), vec!["a", "b", "c"]);
    assert_eq!(resolution.excluded, vec![id("d")]);
    assert_eq!(remote.manifest_requests(&id("d")), 0);
    assert!(!context.index.is_installed(&id("d")));
}

#[tokio::test]
async fn declared_exclusion_propagates_down_the_subtree() {
    let temp = tempdir().expect("temp");
    let remote = CountingRemote::new();
    let (a, b, c, e) = (id("a"), id("b"), id("c"), id("e"));
    remote.publish(&a, &[dep_excluding(&b, &["org.example:c"])]);
    remote.publish(&b, &[dep(&e)]);
    remote.publish(&e, &[dep(&c)]);
    remote.publish(&c, &[]);

    let mut context = context(temp.path(), remote.clone());
    let resolution = Resolver::new(&mut context, Vec::new())
        .resolve(&[a])
        .await;

    assert_eq!(names(resolution.identities()), vec!["a", "b", "e"]);
    assert_eq!(remote.manifest_requests(&c), 0);
}

#[tokio::test]
async fn wildcard_exclusion_matches_any_name() {
    let temp = tempdir().expect("temp");
    let remote = CountingRemote::new();
    let a = id("a");
    let logging = ArtifactIdentity::new("org.slf4j", "slf4j-api", "1.7.30");
    let binding = ArtifactIdentity::new("org.slf4j", "slf4j-simple", "1.7.30");
    remote.publish(&a, &[dep(&logging), dep(&binding), dep(&id("b"))]);
    remote.publish(&id("b"), &[]);

    let mut context = context(temp.path(), remote.clone());
    let resolution = Resolver::new(&mut context, vec!["org.slf4j:*".parse().expect("pattern")])
        .resolve(&[a])
        .await;

    assert_eq!(names(resolution.identities()), vec!["a", "b"]);
    assert_eq!(resolution.excluded.len(), 2);
}

#[tokio::test]
async fn missing_manifest_drops_only_that_subtree() {
    let temp = tempdir().expect("temp");
    let remote = CountingRemote::new();
    let (a, b, c) = (id("a"), id("b"), id("c"));
    remote.publish(&a, &[dep(&b), dep(&c)]);
    remote.publish(&c, &[]);

    let mut context = context(temp.path(), remote);
    let resolution = Resolver::new(&mut context, Vec::new())
        .resolve(&[a])
        .await;

    assert_eq!(names(resolution.identities()), vec!["a", "c"]);
    assert_eq!(resolution.warnings.len(), 1);
    assert!(!context.index.is_installed(&b));
}

#[tokio::test]
async fn manifest_declared_repository_serves_later_lookups() {
    const MIRROR: &str = "https://mirror.example.net/releases/";
    let temp = tempdir().expect("temp");
    let remote = CountingRemote::new();
    let (a, b) = (id("a"), id("b"));
    remote.put(
        &a.manifest_path("pom"),
        format!(
            "<project>\n  <groupId>org.example</groupId>\n  <artifactId>a</artifactId>\n  <version>1.0</version>\n\
             <repositories><repository><id>mirror</id><url>{MIRROR}</url></repository></repositories>\n\
             <dependencies><dependency><groupId>org.example</groupId><artifactId>b</artifactId><version>1.0</version></dependency></dependencies>\n\
             </project>\n"
        ),
    );
    remote.put_jar(&a);
    remote.put_at(MIRROR, &b.manifest_path("pom"), pom(&b, None, &[]));
    remote.put_at(MIRROR, &b.jar_path("jar"), b"jar:b".to_vec());

    let mut context = context(temp.path(), remote.clone());
    let resolution = Resolver::new(&mut context, Vec::new())
        .resolve(&[a.clone()])
        .await;

    assert_eq!(names(resolution.identities()), vec!["a", "b"]);
    assert!(resolution.warnings.is_empty());
    let b_entry = resolution
        .downloads
        .iter()
        .find(|entry| entry.identity == b)
        .expect("b queued");
    let served_by = b_entry.repository().expect("remote origin");
    assert!(served_by.location_key().starts_with(MIRROR), "{served_by}");

    let requests = remote.requests();
    let a_parsed = requests
        .iter()
        .position(|url| url == &format!("{BASE}{}", a.manifest_path("pom")))
        .expect("a requested");
    let first_mirror = requests
        .iter()
        .position(|url| url.starts_with(MIRROR))
        .expect("mirror consulted");
    assert!(a_parsed < first_mirror);
    // The configured repository is still asked first.
    assert_eq!(remote.manifest_requests(&b), 2);
}

// =============================================================================
// Installed index interaction
// =============================================================================

#[tokio::test]
async fn second_run_with_persisted_index_downloads_nothing() {
    let temp = tempdir().expect("temp");
    let remote = CountingRemote::new();
    publish_scenario(&remote);

    let mut first = context(temp.path(), remote.clone());
    let resolution = Resolver::new(&mut first, Vec::new())
        .resolve(&[id("a")])
        .await;
    assert_eq!(resolution.downloads.len(), 4);
    assert!(first.index.persist().expect("persist"));

    let requests_after_first = remote.requests().len();
    let mut second = context(temp.path(), remote.clone());
    assert_eq!(second.index.len(), 4);
    let resolution = Resolver::new(&mut second, Vec::new())
        .resolve(&[id("a")])
        .await;
    assert!(resolution.downloads.is_empty());
    // Installed members are walked through their cached manifests only.
    assert_eq!(names(resolution.installed.iter()), vec!["a", "b", "c", "d"]);
    assert_eq!(resolution.skipped_installed.len(), 4);
    assert_eq!(remote.requests().len(), requests_after_first);
}

#[tokio::test]
async fn installed_version_skips_other_versions() {
    let temp = tempdir().expect("temp");
    let remote = CountingRemote::new();
    let newer = id("a").with_version("1.1");
    remote.publish(&newer, &[]);

    let mut context = context(temp.path(), remote.clone());
    context.index.record_installed(id("a"));
    let resolution = Resolver::new(&mut context, Vec::new())
        .resolve(&[newer.clone()])
        .await;

    assert!(resolution.downloads.is_empty());
    assert_eq!(resolution.skipped_installed, vec![newer.clone()]);
    assert_eq!(resolution.installed, vec![id("a")]);
    assert_eq!(remote.manifest_requests(&newer), 0);
}

#[tokio::test]
async fn classifier_distinguishes_installed_artifacts() {
    let temp = tempdir().expect("temp");
    let remote = CountingRemote::new();
    let assembly = id("a").with_classifier("assembly");
    remote.publish(&assembly, &[]);

    let mut context = context(temp.path(), remote);
    context.index.record_installed(id("a"));
    let resolution = Resolver::new(&mut context, Vec::new())
        .resolve(&[assembly.clone()])
        .await;

    assert_eq!(resolution.identities().collect::<Vec<_>>(), vec![&assembly]);
}

// =============================================================================
// Caching and ordering
// =============================================================================

#[tokio::test]
async fn manifests_are_requested_at_most_once_per_run() {
    let temp = tempdir().expect("temp");
    let remote = CountingRemote::new();
    let (a, b, c, d, parent) = (id("a"), id("b"), id("c"), id("d"), id("parent"));
    remote.put(&parent.manifest_path("pom"), parent_pom(&parent));
    remote.put(&b.manifest_path("pom"), pom(&b, Some(&parent), &[dep(&d)]));
    remote.put(&c.manifest_path("pom"), pom(&c, Some(&parent), &[dep(&d)]));
    remote.put_jar(&b);
    remote.put_jar(&c);
    remote.publish(&a, &[dep(&b), dep(&c)]);
    remote.publish(&d, &[]);

    let mut context = context(temp.path(), remote.clone());
    let resolution = Resolver::new(&mut context, Vec::new())
        .resolve(&[a.clone()])
        .await;

    assert_eq!(names(resolution.identities()), vec!["a", "b", "c", "d"]);
    for identity in [&a, &b, &c, &d, &parent] {
        assert_eq!(remote.manifest_requests(identity), 1, "{identity}");
    }
    assert!(!context.index.is_installed(&parent));
    assert_eq!(context.cache.stats().manifests_stored, 5);
}

#[tokio::test]
async fn identical_runs_produce_identical_order() {
    let mut orders = Vec::new();
    for _ in 0..2 {
        let temp = tempdir().expect("temp");
        let remote = CountingRemote::new();
        publish_scenario(&remote);
        remote.publish(&id("e"), &[dep(&id("b"))]);

        let mut context = context(temp.path(), remote);
        let resolution = Resolver::new(&mut context, Vec::new())
            .resolve(&[id("e"), id("a")])
            .await;
        orders.push(names(resolution.identities()));
    }
    assert_eq!(orders[0], orders[1]);
    assert_eq!(orders[0], vec!["e", "a", "b", "c", "d"]);
}
