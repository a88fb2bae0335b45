//! Seed file loading
//!
//! Two formats are accepted: JSON lines of [`ArticleSeed`] objects, or one bare
//! identifier per line (DOIs, PMIDs and PMCIDs are detected). Blank lines and
//! `#` comments are ignored in both.

use anyhow::{Context, Result};
use std::path::Path;
use std::str::FromStr;

use crate::models::ArticleSeed;

/// Seed file format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeedFormat {
    /// JSON lines when the first record starts with `{`, otherwise lines
    #[default]
    Auto,
    JsonLines,
    Lines,
}

impl FromStr for SeedFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "jsonl" | "json" => Ok(Self::JsonLines),
            "lines" | "txt" => Ok(Self::Lines),
            other => Err(format!("unknown seed format: {other}")),
        }
    }
}

/// Parse seeds from text
pub fn parse_seeds(content: &str, format: SeedFormat) -> Result<Vec<ArticleSeed>> {
    let records: Vec<(usize, &str)> = content
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .collect();

    let format = match format {
        SeedFormat::Auto => match records.first() {
            Some((_, line)) if line.starts_with('{') => SeedFormat::JsonLines,
            _ => SeedFormat::Lines,
        },
        other => other,
    };

    records
        .into_iter()
        .map(|(line_no, line)| match format {
            SeedFormat::JsonLines => {
                let seed: ArticleSeed = serde_json::from_str(line)
                    .with_context(|| format!("Invalid seed on line {line_no}"))?;
                if seed.identifier.trim().is_empty() {
                    anyhow::bail!("Seed on line {line_no} has an empty identifier");
                }
                Ok(seed)
            }
            _ => Ok(ArticleSeed::from_identifier(line)),
        })
        .collect()
}

/// Load seeds from a file
pub fn load_seeds(path: &Path, format: SeedFormat) -> Result<Vec<ArticleSeed>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read seed file: {}", path.display()))?;
    parse_seeds(&content, format)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lines() {
        let seeds = parse_seeds(
            "# header\n10.1371/journal.pone.1\n\n  12345  \nPMC99\n",
            SeedFormat::Auto,
        )
        .unwrap();

        assert_eq!(seeds.len(), 3);
        assert!(seeds[0].doi.is_some());
        assert_eq!(seeds[1].pmid.as_deref(), Some("12345"));
        assert_eq!(seeds[2].pmcid.as_deref(), Some("PMC99"));
    }

    #[test]
    fn test_parse_json_lines() {
        let seeds = parse_seeds(
            r#"{"identifier":"a","doi":"10.1/a","publisher":"plos"}
{"identifier":"b","extra":{"journal":"x"}}"#,
            SeedFormat::Auto,
        )
        .unwrap();

        assert_eq!(seeds[0].publisher.as_deref(), Some("plos"));
        assert_eq!(seeds[1].field("journal"), Some("x"));
    }

    #[test]
    fn test_parse_json_lines_reports_line() {
        let err = parse_seeds("{\"identifier\":\"a\"}\n{bad", SeedFormat::JsonLines).unwrap_err();
        assert!(err.to_string().contains("line 2"));
        assert!(parse_seeds("{\"identifier\":\"\"}", SeedFormat::JsonLines).is_err());
    }
}
