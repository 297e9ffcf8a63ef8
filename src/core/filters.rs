//! Named request/response filters.
//!
//! Filters are defined once in configuration and referenced by name from
//! routes, in order. Header names and values are parsed at table build time
//! so the hot path only copies pre-validated values.
use eyre::{Result, WrapErr};
use http::{HeaderMap, HeaderName, HeaderValue};

use crate::config::models::FilterConfig;

/// A filter with its header mutations pre-parsed.
#[derive(Debug)]
pub struct CompiledFilter {
    name: String,
    request_add: Vec<(HeaderName, HeaderValue)>,
    request_remove: Vec<HeaderName>,
    response_add: Vec<(HeaderName, HeaderValue)>,
    response_remove: Vec<HeaderName>,
    strip_prefix: Option<String>,
}

fn parse_pairs(pairs: &std::collections::HashMap<String, String>) -> Result<Vec<(HeaderName, HeaderValue)>> {
    pairs
        .iter()
        .map(|(name, value)| {
            let name = HeaderName::from_bytes(name.as_bytes())
                .wrap_err_with(|| format!("invalid header name '{name}'"))?;
            let value = HeaderValue::from_str(value)
                .wrap_err_with(|| format!("invalid header value for '{name:?}'"))?;
            Ok((name, value))
        })
        .collect()
}

fn parse_names(names: &[String]) -> Result<Vec<HeaderName>> {
    names
        .iter()
        .map(|name| {
            HeaderName::from_bytes(name.as_bytes())
                .wrap_err_with(|| format!("invalid header name '{name}'"))
        })
        .collect()
}

impl CompiledFilter {
    /// Compile a filter definition, validating every header name/value.
    pub fn compile(name: &str, config: &FilterConfig) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            request_add: parse_pairs(&config.request_headers.add)
                .wrap_err_with(|| format!("filter '{name}' request headers"))?,
            request_remove: parse_names(&config.request_headers.remove)
                .wrap_err_with(|| format!("filter '{name}' request headers"))?,
            response_add: parse_pairs(&config.response_headers.add)
                .wrap_err_with(|| format!("filter '{name}' response headers"))?,
            response_remove: parse_names(&config.response_headers.remove)
                .wrap_err_with(|| format!("filter '{name}' response headers"))?,
            strip_prefix: config.strip_prefix.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mutate outbound request headers.
    pub fn apply_request(&self, headers: &mut HeaderMap) {
        for name in &self.request_remove {
            headers.remove(name);
        }
        for (name, value) in &self.request_add {
            headers.insert(name.clone(), value.clone());
        }
    }

    /// Mutate relayed response headers.
    pub fn apply_response(&self, headers: &mut HeaderMap) {
        for name in &self.response_remove {
            headers.remove(name);
        }
        for (name, value) in &self.response_add {
            headers.insert(name.clone(), value.clone());
        }
    }

    /// Rewrite the forwarded path if a prefix strip is configured.
    /// Stripping the whole path yields "/".
    pub fn rewrite_path(&self, path: &str) -> Option<String> {
        let prefix = self.strip_prefix.as_deref()?;
        let stripped = path.strip_prefix(prefix)?;
        if stripped.is_empty() {
            Some("/".to_string())
        } else if stripped.starts_with('/') {
            Some(stripped.to_string())
        } else {
            // Prefix ended mid-segment; leave the path alone.
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::models::HeaderActions;

    fn filter_with(
        add: &[(&str, &str)],
        remove: &[&str],
        strip_prefix: Option<&str>,
    ) -> CompiledFilter {
        let config = FilterConfig {
            request_headers: HeaderActions {
                add: add
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                remove: remove.iter().map(|s| s.to_string()).collect(),
            },
            response_headers: HeaderActions::default(),
            strip_prefix: strip_prefix.map(String::from),
        };
        CompiledFilter::compile("test", &config).expect("filter compiles")
    }

    #[test]
    fn test_request_header_add_and_remove() {
        let filter = filter_with(&[("x-gateway", "ladle")], &["x-internal-debug"], None);

        let mut headers = HeaderMap::new();
        headers.insert("x-internal-debug", HeaderValue::from_static("1"));

        filter.apply_request(&mut headers);
        assert_eq!(headers.get("x-gateway").unwrap(), "ladle");
        assert!(headers.get("x-internal-debug").is_none());
    }

    #[test]
    fn test_strip_prefix() {
        let filter = filter_with(&[], &[], Some("/api/v1"));
        assert_eq!(
            filter.rewrite_path("/api/v1/recipes/42").as_deref(),
            Some("/recipes/42")
        );
        assert_eq!(filter.rewrite_path("/api/v1").as_deref(), Some("/"));
        // Prefix that would split a segment is not applied
        assert_eq!(filter.rewrite_path("/api/v10/recipes"), None);
        assert_eq!(filter.rewrite_path("/other"), None);
    }

    #[test]
    fn test_invalid_header_name_rejected() {
        let mut add = HashMap::new();
        add.insert("bad header name".to_string(), "x".to_string());
        let config = FilterConfig {
            request_headers: HeaderActions {
                add,
                remove: Vec::new(),
            },
            response_headers: HeaderActions::default(),
            strip_prefix: None,
        };
        assert!(CompiledFilter::compile("broken", &config).is_err());
    }
}
