//! Resolving the target cluster of an inbound request

use thiserror::Error;

use crate::request::InboundRequest;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct TargetParseError(pub String);

/// Picks the destination cluster for a request
pub trait ClusterNameParser: Send + Sync {
    fn parse_cluster_name(&self, request: &InboundRequest) -> Result<String, TargetParseError>;
}

impl<F> ClusterNameParser for F
where
    F: Fn(&InboundRequest) -> Result<String, TargetParseError> + Send + Sync,
{
    fn parse_cluster_name(&self, request: &InboundRequest) -> Result<String, TargetParseError> {
        self(request)
    }
}

/// Cluster name is the first path segment: `/<cluster>/...`.
///
/// The path is forwarded unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathPrefixParser;

impl ClusterNameParser for PathPrefixParser {
    fn parse_cluster_name(&self, request: &InboundRequest) -> Result<String, TargetParseError> {
        let path = request.path();
        let segment = path
            .trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or_default();

        if segment.is_empty() {
            return Err(TargetParseError(format!("no cluster in path {}", path)));
        }
        if !is_valid_cluster_name(segment) {
            return Err(TargetParseError(format!("invalid cluster name {:?}", segment)));
        }
        Ok(segment.to_string())
    }
}

// DNS-1123 subdomain
fn is_valid_cluster_name(name: &str) -> bool {
    name.len() <= 253
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.')
        && !name.starts_with(['-', '.'])
        && !name.ends_with(['-', '.'])
}
