//! Canonical domain types used across all crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Canonical Enums (used across all crates)
// ============================================================================

/// A class of security assessment the engine can run.
///
/// Closed enumeration: every capability has at most one registered executor
/// at a time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ExposureDiscovery,
    DarkwebIntelligence,
    EmailAudit,
    InfrastructureTesting,
    Investigation,
    NetworkSecurity,
}

impl Capability {
    /// Every capability, in canonical order.
    pub const ALL: [Capability; 6] = [
        Capability::ExposureDiscovery,
        Capability::DarkwebIntelligence,
        Capability::EmailAudit,
        Capability::InfrastructureTesting,
        Capability::Investigation,
        Capability::NetworkSecurity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ExposureDiscovery => "exposure_discovery",
            Capability::DarkwebIntelligence => "darkweb_intelligence",
            Capability::EmailAudit => "email_audit",
            Capability::InfrastructureTesting => "infrastructure_testing",
            Capability::Investigation => "investigation",
            Capability::NetworkSecurity => "network_security",
        }
    }

    /// Posture category this capability scores into.
    pub fn category(&self) -> &'static str {
        match self {
            Capability::ExposureDiscovery => "exposure",
            Capability::DarkwebIntelligence => "dark_web",
            Capability::EmailAudit => "email_security",
            Capability::InfrastructureTesting => "infrastructure",
            Capability::Investigation => "exposure",
            Capability::NetworkSecurity => "network",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exposure_discovery" => Ok(Capability::ExposureDiscovery),
            "darkweb_intelligence" => Ok(Capability::DarkwebIntelligence),
            "email_audit" => Ok(Capability::EmailAudit),
            "infrastructure_testing" => Ok(Capability::InfrastructureTesting),
            "investigation" => Ok(Capability::Investigation),
            "network_security" => Ok(Capability::NetworkSecurity),
            _ => Err(format!("unknown capability: '{}'", s)),
        }
    }
}

/// Job lifecycle state.
///
/// Transitions are monotonic: `pending -> queued -> running -> terminal`,
/// with `cancelled` reachable from any non-terminal state. No edge leaves a
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal lifecycle edge.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            JobStatus::Pending => matches!(next, JobStatus::Queued | JobStatus::Cancelled),
            JobStatus::Queued => matches!(next, JobStatus::Running | JobStatus::Cancelled),
            JobStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("unknown job status: '{}'", s)),
        }
    }
}

/// Dispatch priority. Higher values dispatch first within a capability.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Background = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl JobPriority {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn from_i64(value: i64) -> Result<Self, String> {
        match value {
            0 => Ok(JobPriority::Background),
            1 => Ok(JobPriority::Low),
            2 => Ok(JobPriority::Normal),
            3 => Ok(JobPriority::High),
            4 => Ok(JobPriority::Critical),
            _ => Err(format!("unknown job priority: {}", value)),
        }
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Normal
    }
}

/// Finding severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Posture weight used when computing a tenant's score.
    pub fn posture_weight(&self) -> f64 {
        match self {
            Severity::Info => 0.25,
            Severity::Low => 1.5,
            Severity::Medium => 4.0,
            Severity::High => 8.0,
            Severity::Critical => 15.0,
        }
    }

    /// Points awarded when a finding of this severity is remediated.
    pub fn remediation_points(&self) -> i64 {
        match self {
            Severity::Critical => 25,
            Severity::High => 12,
            Severity::Medium => 6,
            Severity::Low => 3,
            Severity::Info => 2,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("unknown severity: '{}'", s)),
        }
    }
}

/// Finding workflow state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingStatus {
    Active,
    Resolved,
    FalsePositive,
    AcceptedRisk,
}

impl FindingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingStatus::Active => "active",
            FindingStatus::Resolved => "resolved",
            FindingStatus::FalsePositive => "false_positive",
            FindingStatus::AcceptedRisk => "accepted_risk",
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, FindingStatus::Active)
    }
}

impl fmt::Display for FindingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FindingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(FindingStatus::Active),
            "resolved" => Ok(FindingStatus::Resolved),
            "false_positive" => Ok(FindingStatus::FalsePositive),
            "accepted_risk" => Ok(FindingStatus::AcceptedRisk),
            _ => Err(format!("unknown finding status: '{}'", s)),
        }
    }
}

/// Positive indicator classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorType {
    StrongEmailConfig,
    NoVulnerabilities,
    ImprovementTrend,
    SustainedGoodPractices,
    Remediated,
}

impl IndicatorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorType::StrongEmailConfig => "strong_email_config",
            IndicatorType::NoVulnerabilities => "no_vulnerabilities",
            IndicatorType::ImprovementTrend => "improvement_trend",
            IndicatorType::SustainedGoodPractices => "sustained_good_practices",
            IndicatorType::Remediated => "remediated",
        }
    }
}

impl fmt::Display for IndicatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IndicatorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strong_email_config" => Ok(IndicatorType::StrongEmailConfig),
            "no_vulnerabilities" => Ok(IndicatorType::NoVulnerabilities),
            "improvement_trend" => Ok(IndicatorType::ImprovementTrend),
            "sustained_good_practices" => Ok(IndicatorType::SustainedGoodPractices),
            "remediated" => Ok(IndicatorType::Remediated),
            _ => Err(format!("unknown indicator type: '{}'", s)),
        }
    }
}

/// Tunnel detection confidence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
    Confirmed,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
            Confidence::Confirmed => "confirmed",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Confidence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Confidence::Low),
            "medium" => Ok(Confidence::Medium),
            "high" => Ok(Confidence::High),
            "confirmed" => Ok(Confidence::Confirmed),
            _ => Err(format!("unknown confidence: '{}'", s)),
        }
    }
}

// ============================================================================
// Jobs
// ============================================================================

/// One line of a job's execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub ts: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

impl ExecutionLogEntry {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            level: "info".to_string(),
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            level: "error".to_string(),
            message: message.into(),
        }
    }
}

/// A single execution of a capability against a target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub tenant_id: String,
    pub capability: Capability,
    pub target: String,
    pub status: JobStatus,
    pub priority: JobPriority,
    /// Completion percentage in `[0, 100]`. 100 iff succeeded.
    pub progress: u8,
    pub config: Value,
    pub metadata: Value,
    pub error: Option<String>,
    pub execution_logs: Vec<ExecutionLogEntry>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a fresh `pending` job with a generated id.
    pub fn new(
        tenant_id: impl Into<String>,
        capability: Capability,
        target: impl Into<String>,
        config: Value,
        priority: JobPriority,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            capability,
            target: target.into(),
            status: JobStatus::Pending,
            priority,
            progress: 0,
            config,
            metadata: Value::Object(serde_json::Map::new()),
            error: None,
            execution_logs: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

// ============================================================================
// Findings & Positive Indicators
// ============================================================================

/// A durable observation produced by an executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub tenant_id: String,
    pub capability: Capability,
    pub severity: Severity,
    pub status: FindingStatus,
    pub title: String,
    pub description: String,
    pub evidence: Value,
    pub affected_assets: Vec<String>,
    pub recommendations: Vec<String>,
    pub risk_score: f64,
    pub target: String,
    pub discovered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

/// A durable record of good posture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositiveIndicator {
    pub id: String,
    pub tenant_id: String,
    pub indicator_type: IndicatorType,
    pub category: String,
    pub points_awarded: i64,
    pub description: String,
    pub evidence: Value,
    pub target: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Scheduled Searches & Company Profiles
// ============================================================================

/// A cron-triggered definition that materialises into jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledSearch {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub description: Option<String>,
    pub capabilities: Vec<Capability>,
    pub target: String,
    pub config: Value,
    /// Five-field POSIX cron expression.
    pub cron_expression: String,
    /// IANA timezone name the cron expression is evaluated in.
    pub timezone: String,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub run_count: i64,
    pub created_at: DateTime<Utc>,
}

/// Per-capability automation settings inside an [`AutomationConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityAutomation {
    pub enabled: bool,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub config: Option<Value>,
}

/// Automation schedule shared by all capabilities of a profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationSchedule {
    pub cron: String,
    pub timezone: String,
}

/// A tenant's automation preferences, stored on the company profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    pub enabled: bool,
    pub schedule: AutomationSchedule,
    #[serde(default)]
    pub capabilities: HashMap<Capability, CapabilityAutomation>,
}

/// A tenant's company profile. At most one per tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyProfile {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub primary_domain: Option<String>,
    pub additional_domains: Vec<String>,
    pub timezone: String,
    pub automation_config: Option<AutomationConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Network gatekeeping
// ============================================================================

/// Pattern block target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    UserAgent,
    Header,
    Path,
    Query,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::UserAgent => "user_agent",
            PatternType::Header => "header",
            PatternType::Path => "path",
            PatternType::Query => "query",
        }
    }
}

impl FromStr for PatternType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_agent" => Ok(PatternType::UserAgent),
            "header" => Ok(PatternType::Header),
            "path" => Ok(PatternType::Path),
            "query" => Ok(PatternType::Query),
            _ => Err(format!("unknown pattern type: '{}'", s)),
        }
    }
}

/// An IP deny-list entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpBlock {
    pub ip: String,
    pub reason: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// An endpoint-glob deny-list entry. Method `ALL` matches any verb.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointBlock {
    pub pattern: String,
    pub method: String,
    pub reason: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// A request-pattern deny-list entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternBlock {
    pub id: String,
    pub pattern_type: PatternType,
    pub pattern: String,
    pub reason: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Result of a rate-limit check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub current: usize,
    pub limit: usize,
    pub retry_after: Option<u64>,
    pub reason: Option<String>,
}

/// A tunnel-suspicion verdict over a source IP's recent traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelVerdict {
    pub detection_id: String,
    pub tunnel_type: String,
    pub confidence: Confidence,
    pub risk_score: f64,
    pub indicators: Vec<String>,
    pub source_ip: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub request_count: u64,
}

/// One persisted request/response record in the network audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkLogEntry {
    pub id: String,
    pub request_id: String,
    /// None for unauthenticated traffic.
    pub tenant_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub ip: String,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub status: u16,
    pub response_time_ms: f64,
    pub request_headers: HashMap<String, String>,
    pub response_headers: HashMap<String, String>,
    pub request_body: Option<String>,
    pub response_body: Option<String>,
    pub body_truncated: bool,
    pub tunnel_detection: Option<TunnelVerdict>,
}

// ============================================================================
// Activity log
// ============================================================================

/// One per-user action trail entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: String,
    pub tenant_id: String,
    pub action: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_roundtrip() {
        for cap in Capability::ALL {
            assert_eq!(cap.as_str().parse::<Capability>().unwrap(), cap);
        }
        assert!("web_recon".parse::<Capability>().is_err());
    }

    #[test]
    fn job_status_lifecycle_edges() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Queued));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Succeeded.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Queued));
        assert!(!Pending.can_transition_to(Running));
    }

    #[test]
    fn priority_ordering() {
        assert!(JobPriority::Critical > JobPriority::High);
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
        assert!(JobPriority::Low > JobPriority::Background);
        assert_eq!(JobPriority::from_i64(4).unwrap(), JobPriority::Critical);
        assert!(JobPriority::from_i64(9).is_err());
    }

    #[test]
    fn severity_serde_is_lowercase() {
        assert_eq!(
            serde_json::to_string(&Severity::Critical).unwrap(),
            "\"critical\""
        );
        assert_eq!(
            serde_json::to_string(&FindingStatus::FalsePositive).unwrap(),
            "\"false_positive\""
        );
    }
}
