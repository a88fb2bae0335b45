//! Candidate URL resolution for article seeds
//!
//! A resolver turns an [`ArticleSeed`] into an ordered list of candidate URLs.
//! [`ResolverRegistry`] picks the resolver for a seed by publisher, either
//! named on the seed or found through the DOI-prefix table, and falls back to
//! its default resolver.

use async_trait::async_trait;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use url::Url;

use crate::config::ResolverConfig;
use crate::models::ArticleSeed;

/// Produces candidate URLs for an article, best first
#[async_trait]
pub trait ArticleResolver: Send + Sync {
    async fn resolve(&self, seed: &ArticleSeed) -> Vec<String>;
}

pub type SharedResolver = Arc<dyn ArticleResolver>;

fn placeholder_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([a-z_]+)\}").expect("Invalid regex pattern"))
}

/// Expands URL templates such as `https://doi.org/{doi}`
///
/// A template is skipped when any of its placeholders has no value on the
/// seed, or when the expansion is not a valid http(s) URL.
#[derive(Debug, Clone)]
pub struct TemplateResolver {
    templates: Vec<String>,
}

impl TemplateResolver {
    pub fn new<I, S>(templates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            templates: templates.into_iter().map(Into::into).collect(),
        }
    }

    pub fn templates(&self) -> &[String] {
        &self.templates
    }

    /// Expand one template, `None` if a placeholder is missing
    pub fn expand(template: &str, seed: &ArticleSeed) -> Option<String> {
        let mut missing = false;
        let expanded = placeholder_pattern().replace_all(template, |caps: &regex::Captures<'_>| {
            match seed.field(&caps[1]).map(str::trim).filter(|v| !v.is_empty()) {
                Some(value) => value.to_string(),
                None => {
                    missing = true;
                    String::new()
                }
            }
        });

        if missing {
            return None;
        }

        let parsed = Url::parse(&expanded).ok()?;
        matches!(parsed.scheme(), "http" | "https").then(|| parsed.to_string())
    }

    fn candidates(&self, seed: &ArticleSeed) -> Vec<String> {
        let mut seen = HashSet::new();
        self.templates
            .iter()
            .filter_map(|t| Self::expand(t, seed))
            .filter(|url| seen.insert(url.clone()))
            .collect()
    }
}

#[async_trait]
impl ArticleResolver for TemplateResolver {
    async fn resolve(&self, seed: &ArticleSeed) -> Vec<String> {
        self.candidates(seed)
    }
}

/// Publisher-keyed resolver lookup
pub struct ResolverRegistry {
    publishers: HashMap<String, SharedResolver>,
    doi_prefixes: HashMap<String, String>,
    default: SharedResolver,
}

impl ResolverRegistry {
    pub fn new(default: SharedResolver) -> Self {
        Self {
            publishers: HashMap::new(),
            doi_prefixes: HashMap::new(),
            default,
        }
    }

    /// Registry with one template resolver per configured publisher
    pub fn from_config(config: &ResolverConfig) -> Self {
        let mut registry = Self::new(Arc::new(TemplateResolver::new(
            config.default_templates.iter().cloned(),
        )));

        for rule in &config.publishers {
            registry = registry.with_publisher(
                &rule.name,
                Arc::new(TemplateResolver::new(rule.templates.iter().cloned())),
            );
            for prefix in &rule.doi_prefixes {
                registry = registry.with_doi_prefix(prefix, &rule.name);
            }
        }

        registry
    }

    pub fn with_publisher(mut self, name: &str, resolver: SharedResolver) -> Self {
        self.publishers.insert(name.to_ascii_lowercase(), resolver);
        self
    }

    pub fn with_doi_prefix(mut self, prefix: &str, publisher: &str) -> Self {
        self.doi_prefixes
            .insert(prefix.trim().to_ascii_lowercase(), publisher.to_ascii_lowercase());
        self
    }

    /// Publisher key for a seed: explicit name first, then DOI prefix
    pub fn publisher_for(&self, seed: &ArticleSeed) -> Option<String> {
        if let Some(name) = seed.publisher.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            return Some(name.to_ascii_lowercase());
        }

        let doi = seed.doi.as_deref()?.trim().to_ascii_lowercase();
        let registrant = doi.split('/').next()?;
        self.doi_prefixes.get(registrant).cloned()
    }

    fn resolver_for(&self, seed: &ArticleSeed) -> Option<&SharedResolver> {
        self.publisher_for(seed)
            .and_then(|name| self.publishers.get(&name))
    }
}

#[async_trait]
impl ArticleResolver for ResolverRegistry {
    async fn resolve(&self, seed: &ArticleSeed) -> Vec<String> {
        if let Some(resolver) = self.resolver_for(seed) {
            let urls = resolver.resolve(seed).await;
            if !urls.is_empty() {
                return urls;
            }
            tracing::debug!(
                identifier = %seed.identifier,
                "Publisher resolver produced no candidates, using default"
            );
        }
        self.default.resolve(seed).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PublisherRule;

    fn seed_with_doi(doi: &str) -> ArticleSeed {
        ArticleSeed::from_identifier(doi)
    }

    #[test]
    fn test_expand_template() {
        let seed = seed_with_doi("10.1371/journal.pone.0000001");
        assert_eq!(
            TemplateResolver::expand("https://doi.org/{doi}", &seed).as_deref(),
            Some("https://doi.org/10.1371/journal.pone.0000001")
        );
        assert_eq!(TemplateResolver::expand("https://x.org/{pmcid}", &seed), None);
        assert_eq!(TemplateResolver::expand("ftp://x.org/{doi}", &seed), None);
    }

    #[tokio::test]
    async fn test_template_resolver_skips_and_dedups() {
        let resolver = TemplateResolver::new([
            "https://x.org/{doi}",
            "https://pmc.example/{pmcid}",
            "https://x.org/{doi}",
            "https://x.org/{identifier}/pdf",
        ]);
        let urls = resolver.resolve(&seed_with_doi("10.1/abc")).await;
        assert_eq!(urls, vec!["https://x.org/10.1/abc", "https://x.org/10.1/abc/pdf"]);
    }

    #[tokio::test]
    async fn test_registry_selects_publisher() {
        let config = ResolverConfig {
            default_templates: vec!["https://doi.org/{doi}".into()],
            publishers: vec![PublisherRule {
                name: "PLOS".into(),
                doi_prefixes: vec!["10.1371".into()],
                templates: vec!["https://journals.plos.org/plosone/article/file?id={doi}&type=printable".into()],
            }],
        };
        let registry = ResolverRegistry::from_config(&config);

        let plos = registry.resolve(&seed_with_doi("10.1371/journal.pone.1")).await;
        assert_eq!(plos.len(), 1);
        assert!(plos[0].starts_with("https://journals.plos.org/"));

        let other = registry.resolve(&seed_with_doi("10.1038/nature1")).await;
        assert_eq!(other, vec!["https://doi.org/10.1038/nature1"]);

        let mut named = seed_with_doi("10.9999/x");
        named.publisher = Some("plos".into());
        assert_eq!(registry.publisher_for(&named).as_deref(), Some("plos"));
    }

    #[tokio::test]
    async fn test_registry_empty_resolution() {
        let registry = ResolverRegistry::from_config(&ResolverConfig::default());
        let seed = ArticleSeed::from_identifier("internal-7");
        assert!(registry.resolve(&seed).await.is_empty());
    }
}
