//! Route table compilation and matching.
//!
//! Patterns from configuration are compiled into a `matchit` radix tree,
//! which gives the required precedence for free: static segments beat
//! single-segment wildcards, which beat trailing catch-alls. The compiled
//! table is immutable; reloads build a fresh table and swap it atomically
//! through [`RouterHandle`], so concurrent matches never observe a
//! partially-built table.
use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use eyre::{Result, WrapErr, eyre};
use http::Method;

use crate::{
    config::models::{GatewayConfig, RateLimitConfig},
    core::{
        error::{DispatchError, DispatchResult},
        filters::CompiledFilter,
    },
};

/// A fully resolved route: pattern plus everything the dispatcher needs
/// without touching configuration again.
#[derive(Debug)]
pub struct Route {
    pub id: String,
    pub pattern: String,
    pub service: String,
    pub methods: Option<Vec<Method>>,
    pub filters: Vec<Arc<CompiledFilter>>,
    pub rate_limit: Option<RateLimitConfig>,
    pub timeout: Duration,
}

/// Immutable compiled route table.
pub struct RouteTable {
    matcher: matchit::Router<usize>,
    routes: Vec<Arc<Route>>,
}

/// Translate a configured pattern into matchit syntax.
///
/// `*` becomes a positional parameter (named by depth, so identical shapes
/// across routes never collide) and a trailing `**` becomes a catch-all.
/// Returns the translated pattern plus, for `**` routes, the bare prefix
/// that the catch-all alone would not cover.
fn translate_pattern(pattern: &str) -> (String, Option<String>) {
    let segments: Vec<&str> = pattern[1..].split('/').collect();
    let mut translated = String::new();
    let mut bare_prefix = None;

    for (i, segment) in segments.iter().enumerate() {
        let is_last = i == segments.len() - 1;
        match *segment {
            "**" if is_last => {
                bare_prefix = Some(if translated.is_empty() {
                    "/".to_string()
                } else {
                    translated.clone()
                });
                translated.push_str("/{*rest}");
            }
            "*" => {
                translated.push_str(&format!("/{{w{i}}}"));
            }
            s => {
                translated.push('/');
                translated.push_str(s);
            }
        }
    }

    (translated, bare_prefix)
}

impl RouteTable {
    /// Compile the route table from configuration.
    ///
    /// Filters are resolved and parsed here; per-route timeouts fall back to
    /// the dispatch-wide default. Conflicting patterns are a hard error.
    pub fn build(config: &GatewayConfig) -> Result<Self> {
        let default_timeout = config
            .dispatch
            .default_timeout_duration()
            .map_err(|e| eyre!(e))?;

        let mut matcher = matchit::Router::new();
        let mut routes = Vec::with_capacity(config.routes.len());

        for definition in &config.routes {
            let methods = definition
                .methods
                .as_ref()
                .map(|names| {
                    names
                        .iter()
                        .map(|name| {
                            name.parse::<Method>().wrap_err_with(|| {
                                format!("invalid method '{name}' on route '{}'", definition.id)
                            })
                        })
                        .collect::<Result<Vec<_>>>()
                })
                .transpose()?;

            let filters = definition
                .filters
                .iter()
                .map(|name| {
                    let filter_config = config.filters.get(name).ok_or_else(|| {
                        eyre!("route '{}' references unknown filter '{name}'", definition.id)
                    })?;
                    Ok(Arc::new(CompiledFilter::compile(name, filter_config)?))
                })
                .collect::<Result<Vec<_>>>()?;

            let timeout = definition
                .timeout_duration()
                .map_err(|e| eyre!(e))?
                .unwrap_or(default_timeout);

            let index = routes.len();
            routes.push(Arc::new(Route {
                id: definition.id.clone(),
                pattern: definition.pattern.clone(),
                service: definition.service.clone(),
                methods,
                filters,
                rate_limit: definition.rate_limit,
                timeout,
            }));

            let (translated, bare_prefix) = translate_pattern(&definition.pattern);
            matcher.insert(&translated, index).wrap_err_with(|| {
                format!(
                    "route '{}' pattern '{}' conflicts with an existing route",
                    definition.id, definition.pattern
                )
            })?;

            // A trailing `**` also matches its bare prefix. An explicit route
            // on that exact path wins, so an insert conflict here is fine.
            if let Some(prefix) = bare_prefix {
                let _ = matcher.insert(&prefix, index);
            }
        }

        Ok(Self { matcher, routes })
    }

    /// Match a request path and method against the table.
    pub fn matches(&self, path: &str, method: &Method) -> DispatchResult<Arc<Route>> {
        let not_found = || DispatchError::RouteNotFound {
            path: path.to_string(),
        };

        let matched = self.matcher.at(path).map_err(|_| not_found())?;
        let route = &self.routes[*matched.value];

        if let Some(allowed) = &route.methods {
            if !allowed.contains(method) {
                return Err(not_found());
            }
        }

        Ok(route.clone())
    }

    /// All routes in definition order (status endpoint / logging).
    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }
}

/// Shared handle over the current route table. Cheap to clone, lock-free to
/// read; reloads replace the table wholesale.
pub struct RouterHandle {
    table: ArcSwap<RouteTable>,
}

impl RouterHandle {
    pub fn new(table: RouteTable) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
        }
    }

    /// Atomically replace the route table.
    pub fn swap(&self, table: RouteTable) {
        self.table.store(Arc::new(table));
    }

    /// Match against the current table.
    pub fn matches(&self, path: &str, method: &Method) -> DispatchResult<Arc<Route>> {
        self.table.load().matches(path, method)
    }

    /// Snapshot of the current table.
    pub fn snapshot(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }
}
