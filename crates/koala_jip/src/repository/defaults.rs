use once_cell::sync::OnceCell;
use serde::Deserialize;

use super::config::RepositoryConfig;

static EMBEDDED_REPOSITORIES: OnceCell<Vec<RepositoryConfig>> = OnceCell::new();
const EMBEDDED_TOML: &str = include_str!(concat!(
    env!("OUT_DIR"),
    "/embedded_default_repositories.toml"
));

#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddedFormat {
    Wrapper { repositories: Vec<RepositoryConfig> },
    Direct(Vec<RepositoryConfig>),
}

/// Default repository chain, embedded at build time.
pub(crate) fn embedded_default_repositories() -> &'static [RepositoryConfig] {
    EMBEDDED_REPOSITORIES.get_or_init(|| match parse_embedded(EMBEDDED_TOML) {
        Ok(repositories) if !repositories.is_empty() => repositories,
        Ok(_) => fallback_repositories(),
        Err(error) => {
            tracing::warn!(%error, "embedded repository list is invalid; using built-in list");
            fallback_repositories()
        }
    })
}

fn parse_embedded(raw: &str) -> Result<Vec<RepositoryConfig>, toml::de::Error> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }

    let parsed: EmbeddedFormat = toml::from_str(raw)?;
    Ok(match parsed {
        EmbeddedFormat::Wrapper { repositories } => repositories,
        EmbeddedFormat::Direct(items) => items,
    })
}

fn fallback_repositories() -> Vec<RepositoryConfig> {
    vec![
        RepositoryConfig::local("local-maven", "~/.m2/repository", 0),
        RepositoryConfig::local("local-ivy2", "~/.ivy2/cache", 1),
        RepositoryConfig::remote(
            "sonatype",
            "https://oss.sonatype.org/content/repositories/public/",
            2,
        ),
        RepositoryConfig::remote("jcenter", "https://jcenter.bintray.com/", 3),
        RepositoryConfig::remote("jitpack.io", "https://jitpack.io/", 4),
        RepositoryConfig::remote("central1", "https://repo1.maven.org/maven2/", 5),
        RepositoryConfig::remote("central2", "https://repo.maven.apache.org/maven2/", 6),
    ]
}
