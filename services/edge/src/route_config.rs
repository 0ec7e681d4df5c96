//! Route file loading.
//!
//! The route file is a JSON array; order is significant because the last
//! matching entry wins:
//!
//! ```json
//! [
//!   { "pattern": "example.com", "port": 3000 },
//!   { "pattern": "example.com/blog", "port": 3010 },
//!   { "pattern": "www.example.com", "redirect": "example.com" }
//! ]
//! ```

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::proxy::RouteEntry;

/// One entry as written in the route file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteRecord {
    pub pattern: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub redirect: Option<String>,
}

impl RouteRecord {
    fn into_entry(self, index: usize) -> Result<RouteEntry> {
        if self.pattern.trim().is_empty() {
            bail!("route #{index}: pattern must not be empty");
        }

        match (self.port, self.redirect) {
            (Some(port), None) => Ok(RouteEntry::backend(&self.pattern, port)),
            (None, Some(location)) if !location.is_empty() => {
                Ok(RouteEntry::redirect(&self.pattern, &location))
            }
            (None, Some(_)) => bail!("route #{index} ({}): redirect must not be empty", self.pattern),
            (Some(_), Some(_)) => bail!(
                "route #{index} ({}): exactly one of 'port' or 'redirect' is allowed",
                self.pattern
            ),
            (None, None) => bail!(
                "route #{index} ({}): one of 'port' or 'redirect' is required",
                self.pattern
            ),
        }
    }
}

/// Parse route file contents into table-ordered entries.
pub fn parse_routes(content: &str) -> Result<Vec<RouteEntry>> {
    let records: Vec<RouteRecord> =
        serde_json::from_str(content).context("Failed to parse route file")?;

    records
        .into_iter()
        .enumerate()
        .map(|(index, record)| record.into_entry(index))
        .collect()
}

/// Read and parse the route file at `path`.
pub fn load_routes(path: &Path) -> Result<Vec<RouteEntry>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read route file: {}", path.display()))?;

    let entries =
        parse_routes(&content).with_context(|| format!("Invalid route file: {}", path.display()))?;

    info!(
        path = %path.display(),
        route_count = entries.len(),
        "Loaded routes"
    );

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::RouteTarget;

    #[test]
    fn test_parse_routes_in_order() {
        let entries = parse_routes(
            r#"[
                { "pattern": "Example.com", "port": 3000 },
                { "pattern": "example.com/blog", "port": 3010 },
                { "pattern": "www.example.com", "redirect": "example.com" }
            ]"#,
        )
        .unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], RouteEntry::backend("example.com", 3000));
        assert_eq!(entries[1].pattern, "example.com/blog");
        assert_eq!(
            entries[2].target,
            RouteTarget::Redirect {
                location: "example.com".to_string()
            }
        );
    }

    #[test]
    fn test_parse_routes_rejects_both_targets() {
        let err = parse_routes(r#"[{ "pattern": "a.com", "port": 1, "redirect": "b.com" }]"#)
            .unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn test_parse_routes_rejects_missing_target() {
        let err = parse_routes(r#"[{ "pattern": "a.com" }]"#).unwrap_err();
        assert!(err.to_string().contains("is required"));
    }

    #[test]
    fn test_parse_routes_rejects_empty_pattern() {
        let err = parse_routes(r#"[{ "pattern": " ", "port": 80 }]"#).unwrap_err();
        assert!(err.to_string().contains("must not be empty"));
    }

    #[test]
    fn test_parse_routes_rejects_bad_json() {
        assert!(parse_routes("{ not json").is_err());
        assert!(parse_routes(r#"[{ "pattern": "a.com", "port": 70000 }]"#).is_err());
        assert!(parse_routes(r#"[{ "pattern": "a.com", "port": 1, "weight": 2 }]"#).is_err());
    }

    #[test]
    fn test_parse_empty_list() {
        assert!(parse_routes("[]").unwrap().is_empty());
    }

    #[test]
    fn test_load_routes_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.json");
        fs::write(&path, r#"[{ "pattern": "a.com", "port": 8080 }]"#).unwrap();

        let entries = load_routes(&path).unwrap();
        assert_eq!(entries, vec![RouteEntry::backend("a.com", 8080)]);
    }

    #[test]
    fn test_load_routes_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_routes(&dir.path().join("absent.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read route file"));
    }
}
