//! Maps an inbound (method, path) to the endpoint whose flow should handle it.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use percent_encoding::percent_decode_str;
use tokio::sync::RwLock;
use tracing::debug;

use crate::catalog::{CatalogResult, Endpoint, EndpointStore, HttpMethod};

/// Canonical form of a path: a leading `/`, no empty segments, no trailing
/// `/` and percent-decoded segments. Case is kept.
pub fn normalize_path(path: &str) -> Result<String, String> {
    let segments = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| {
            percent_decode_str(s)
                .decode_utf8()
                .map(|s| s.into_owned())
                .map_err(|_| format!("path {path:?} is not valid UTF-8 once decoded"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if segments.iter().any(|s| s.contains('/')) {
        return Err(format!("path {path:?} contains an encoded '/'"));
    }
    Ok(format!("/{}", segments.join("/")))
}

/// Name of a template segment (`{id}` or `:id`)
fn template_param(segment: &str) -> Option<&str> {
    segment
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .or_else(|| segment.strip_prefix(':'))
        .filter(|name| !name.is_empty())
}

pub fn is_template(path: &str) -> bool {
    path.split('/').any(|s| template_param(s).is_some())
}

/// Newest first
fn recency(a: &Endpoint, b: &Endpoint) -> Ordering {
    (a.created_at, a.id).cmp(&(b.created_at, b.id))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEndpoint {
    pub endpoint: Endpoint,
    /// Values bound by template segments
    pub path_params: HashMap<String, String>,
}

fn match_template(template: &str, path: &str) -> Option<(usize, HashMap<String, String>)> {
    let template: Vec<_> = template.split('/').filter(|s| !s.is_empty()).collect();
    let path: Vec<_> = path.split('/').filter(|s| !s.is_empty()).collect();
    if template.len() != path.len() {
        return None;
    }

    let mut literals = 0;
    let mut params = HashMap::new();
    for (expected, actual) in template.iter().zip(path) {
        match template_param(expected) {
            Some(name) => {
                params.insert(name.to_string(), actual.to_string());
            }
            None if *expected == actual => literals += 1,
            None => return None,
        }
    }
    Some((literals, params))
}

/// Exact path matches win; otherwise the template with the most literal
/// segments. Remaining ties go to the most recently created endpoint.
pub fn resolve(endpoints: &[Endpoint], method: HttpMethod, path: &str) -> Option<ResolvedEndpoint> {
    let path = normalize_path(path).ok()?;
    let candidates = endpoints.iter().filter(|e| e.method == method);

    if let Some(endpoint) = candidates
        .clone()
        .filter(|e| !is_template(&e.path) && e.path == path)
        .max_by(|a, b| recency(a, b))
    {
        return Some(ResolvedEndpoint {
            endpoint: endpoint.clone(),
            path_params: HashMap::new(),
        });
    }

    candidates
        .filter(|e| is_template(&e.path))
        .filter_map(|e| match_template(&e.path, &path).map(|(literals, params)| (e, literals, params)))
        .max_by(|(a, a_literals, _), (b, b_literals, _)| {
            a_literals.cmp(b_literals).then_with(|| recency(a, b))
        })
        .map(|(endpoint, _, path_params)| ResolvedEndpoint {
            endpoint: endpoint.clone(),
            path_params,
        })
}

/// Endpoint lookup over a cached copy of the endpoint list, refreshed lazily
/// after every admin change
pub struct EndpointResolver {
    endpoints: Arc<dyn EndpointStore>,
    cache: RwLock<Option<Arc<Vec<Endpoint>>>>,
}

impl EndpointResolver {
    pub fn new(endpoints: Arc<dyn EndpointStore>) -> Self {
        Self {
            endpoints,
            cache: RwLock::new(None),
        }
    }

    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    async fn snapshot(&self) -> CatalogResult<Arc<Vec<Endpoint>>> {
        if let Some(endpoints) = self.cache.read().await.as_ref() {
            return Ok(endpoints.clone());
        }

        let mut cache = self.cache.write().await;
        if let Some(endpoints) = cache.as_ref() {
            return Ok(endpoints.clone());
        }
        let endpoints = Arc::new(self.endpoints.list().await?);
        debug!("Loaded {} endpoint(s) into the resolver cache", endpoints.len());
        *cache = Some(endpoints.clone());
        Ok(endpoints)
    }

    pub async fn resolve(
        &self,
        method: HttpMethod,
        path: &str,
    ) -> CatalogResult<Option<ResolvedEndpoint>> {
        Ok(resolve(&self.snapshot().await?, method, path))
    }
}
