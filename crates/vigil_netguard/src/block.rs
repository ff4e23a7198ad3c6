//! Process-wide deny lists: IP literals, endpoint globs, request patterns.
//!
//! Glob syntax: `*` matches any run of characters, `?` matches exactly one.
//! Endpoint and pattern rules are evaluated in insertion order; the first
//! match wins. All reads take a shared lock and see a consistent snapshot.

use chrono::Utc;
use globset::{GlobBuilder, GlobMatcher};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use vigil_protocol::{EndpointBlock, IpBlock, PatternBlock, PatternType};

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("invalid glob pattern '{0}'")]
    InvalidPattern(String),
}

/// A request shape the pattern rules evaluate against.
#[derive(Debug, Clone, Default)]
pub struct RequestShape<'a> {
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a [(String, String)],
}

/// Everything currently blocked, by kind.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BlockSnapshot {
    pub ips: Vec<IpBlock>,
    pub endpoints: Vec<EndpointBlock>,
    pub patterns: Vec<PatternBlock>,
}

struct CompiledEndpoint {
    entry: EndpointBlock,
    matcher: GlobMatcher,
}

struct CompiledPattern {
    entry: PatternBlock,
    matcher: GlobMatcher,
}

#[derive(Default)]
struct BlockState {
    ips: HashMap<String, IpBlock>,
    endpoints: Vec<CompiledEndpoint>,
    patterns: Vec<CompiledPattern>,
}

/// Admin-configured, process-wide block registry.
#[derive(Default)]
pub struct BlockRegistry {
    state: RwLock<BlockState>,
}

fn compile_glob(pattern: &str, case_insensitive: bool) -> Result<GlobMatcher, BlockError> {
    GlobBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .literal_separator(false)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|_| BlockError::InvalidPattern(pattern.to_string()))
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // IP blocks
    // ------------------------------------------------------------------

    pub fn block_ip(&self, ip: &str, reason: &str, actor: &str) {
        let entry = IpBlock {
            ip: ip.to_string(),
            reason: reason.to_string(),
            created_by: actor.to_string(),
            created_at: Utc::now(),
        };
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.ips.insert(ip.to_string(), entry);
        tracing::info!("IP blocked: {} - {}", ip, reason);
    }

    pub fn unblock_ip(&self, ip: &str) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let removed = state.ips.remove(ip).is_some();
        if removed {
            tracing::info!("IP unblocked: {}", ip);
        }
        removed
    }

    pub fn is_ip_blocked(&self, ip: &str) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.ips.contains_key(ip)
    }

    // ------------------------------------------------------------------
    // Endpoint blocks
    // ------------------------------------------------------------------

    /// Block paths matching `pattern` for `method` (`ALL` matches any verb).
    pub fn block_endpoint(
        &self,
        pattern: &str,
        method: &str,
        reason: &str,
        actor: &str,
    ) -> Result<(), BlockError> {
        let matcher = compile_glob(pattern, false)?;
        let entry = EndpointBlock {
            pattern: pattern.to_string(),
            method: method.to_ascii_uppercase(),
            reason: reason.to_string(),
            created_by: actor.to_string(),
            created_at: Utc::now(),
        };
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.endpoints.push(CompiledEndpoint { entry, matcher });
        tracing::info!("Endpoint blocked: {} {} - {}", method, pattern, reason);
        Ok(())
    }

    pub fn unblock_endpoint(&self, pattern: &str) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let before = state.endpoints.len();
        state.endpoints.retain(|c| c.entry.pattern != pattern);
        before != state.endpoints.len()
    }

    /// First matching endpoint rule, in insertion order.
    pub fn is_endpoint_blocked(&self, path: &str, method: &str) -> Option<EndpointBlock> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let method = method.to_ascii_uppercase();
        state
            .endpoints
            .iter()
            .find(|c| {
                (c.entry.method == "ALL" || c.entry.method == method)
                    && c.matcher.is_match(path)
            })
            .map(|c| c.entry.clone())
    }

    // ------------------------------------------------------------------
    // Pattern blocks
    // ------------------------------------------------------------------

    /// Block requests whose selected component matches `pattern`. Returns the
    /// rule id.
    pub fn block_pattern(
        &self,
        pattern_type: PatternType,
        pattern: &str,
        reason: &str,
        actor: &str,
    ) -> Result<String, BlockError> {
        // Paths match case-sensitively; everything else is normalised.
        let case_insensitive = !matches!(pattern_type, PatternType::Path);
        let matcher = compile_glob(pattern, case_insensitive)?;
        let entry = PatternBlock {
            id: uuid::Uuid::new_v4().to_string(),
            pattern_type,
            pattern: pattern.to_string(),
            reason: reason.to_string(),
            created_by: actor.to_string(),
            created_at: Utc::now(),
        };
        let id = entry.id.clone();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.patterns.push(CompiledPattern { entry, matcher });
        tracing::info!(
            "Pattern blocked: {} '{}' - {}",
            pattern_type.as_str(),
            pattern,
            reason
        );
        Ok(id)
    }

    pub fn unblock_pattern(&self, id: &str) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let before = state.patterns.len();
        state.patterns.retain(|c| c.entry.id != id);
        before != state.patterns.len()
    }

    /// First matching pattern rule, in insertion order. A header rule
    /// matches when any header value matches.
    pub fn matches_any_pattern(&self, request: &RequestShape<'_>) -> Option<PatternBlock> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .patterns
            .iter()
            .find(|c| Self::pattern_matches(c, request))
            .map(|c| c.entry.clone())
    }

    fn pattern_matches(rule: &CompiledPattern, request: &RequestShape<'_>) -> bool {
        match rule.entry.pattern_type {
            PatternType::UserAgent => request
                .headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("user-agent"))
                .map(|(_, value)| rule.matcher.is_match(value))
                .unwrap_or(false),
            PatternType::Header => request
                .headers
                .iter()
                .any(|(_, value)| rule.matcher.is_match(value)),
            PatternType::Path => rule.matcher.is_match(request.path),
            PatternType::Query => request
                .query
                .map(|q| rule.matcher.is_match(q))
                .unwrap_or(false),
        }
    }

    /// All three block kinds together.
    pub fn get_all_blocks(&self) -> BlockSnapshot {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        BlockSnapshot {
            ips: state.ips.values().cloned().collect(),
            endpoints: state.endpoints.iter().map(|c| c.entry.clone()).collect(),
            patterns: state.patterns.iter().map(|c| c.entry.clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn ip_block_membership() {
        let registry = BlockRegistry::new();
        assert!(!registry.is_ip_blocked("1.2.3.4"));
        registry.block_ip("1.2.3.4", "abuse", "admin");
        assert!(registry.is_ip_blocked("1.2.3.4"));
        assert!(registry.unblock_ip("1.2.3.4"));
        assert!(!registry.unblock_ip("1.2.3.4"));
    }

    #[test]
    fn endpoint_glob_and_method_filter() {
        let registry = BlockRegistry::new();
        registry
            .block_endpoint("/admin/*", "ALL", "locked down", "admin")
            .unwrap();
        registry
            .block_endpoint("/api/export", "POST", "write freeze", "admin")
            .unwrap();

        assert!(registry.is_endpoint_blocked("/admin/users", "GET").is_some());
        assert!(registry.is_endpoint_blocked("/admin/", "DELETE").is_some());
        assert!(registry.is_endpoint_blocked("/api/export", "post").is_some());
        assert!(registry.is_endpoint_blocked("/api/export", "GET").is_none());
        assert!(registry.is_endpoint_blocked("/api/jobs", "GET").is_none());
    }

    #[test]
    fn question_mark_matches_one_char() {
        let registry = BlockRegistry::new();
        registry
            .block_endpoint("/v?/status", "ALL", "", "admin")
            .unwrap();
        assert!(registry.is_endpoint_blocked("/v1/status", "GET").is_some());
        assert!(registry.is_endpoint_blocked("/v12/status", "GET").is_none());
    }

    #[test]
    fn invalid_glob_is_rejected() {
        let registry = BlockRegistry::new();
        assert!(registry
            .block_endpoint("/api/[", "ALL", "", "admin")
            .is_err());
    }

    #[test]
    fn pattern_rules_cover_all_components() {
        let registry = BlockRegistry::new();
        registry
            .block_pattern(PatternType::UserAgent, "*sqlmap*", "scanner", "admin")
            .unwrap();
        registry
            .block_pattern(PatternType::Header, "*evil-token*", "", "admin")
            .unwrap();
        registry
            .block_pattern(PatternType::Query, "*union*select*", "", "admin")
            .unwrap();

        let ua = headers(&[("User-Agent", "sqlmap/1.7")]);
        assert!(registry
            .matches_any_pattern(&RequestShape {
                path: "/",
                query: None,
                headers: &ua,
            })
            .is_some());

        // Header rules match across all header values.
        let hdr = headers(&[("X-Custom", "bearer EVIL-TOKEN-1")]);
        assert!(registry
            .matches_any_pattern(&RequestShape {
                path: "/",
                query: None,
                headers: &hdr,
            })
            .is_some());

        let empty = headers(&[]);
        assert!(registry
            .matches_any_pattern(&RequestShape {
                path: "/search",
                query: Some("q=1 UNION SELECT password"),
                headers: &empty,
            })
            .is_some());
        assert!(registry
            .matches_any_pattern(&RequestShape {
                path: "/search",
                query: Some("q=benign"),
                headers: &empty,
            })
            .is_none());
    }

    #[test]
    fn first_match_wins_in_insertion_order() {
        let registry = BlockRegistry::new();
        registry
            .block_endpoint("/api/*", "ALL", "first", "admin")
            .unwrap();
        registry
            .block_endpoint("/api/jobs", "ALL", "second", "admin")
            .unwrap();
        let hit = registry.is_endpoint_blocked("/api/jobs", "GET").unwrap();
        assert_eq!(hit.reason, "first");
    }

    #[test]
    fn snapshot_reports_all_kinds() {
        let registry = BlockRegistry::new();
        registry.block_ip("9.9.9.9", "", "admin");
        registry.block_endpoint("/x", "ALL", "", "admin").unwrap();
        registry
            .block_pattern(PatternType::Path, "/y*", "", "admin")
            .unwrap();
        let all = registry.get_all_blocks();
        assert_eq!(all.ips.len(), 1);
        assert_eq!(all.endpoints.len(), 1);
        assert_eq!(all.patterns.len(), 1);
    }
}
