//! Positive scoring: deterministic conversion of scan output and posture
//! deltas into positive indicators.

use serde_json::{json, Value};
use std::collections::HashMap;
use vigil_protocol::{
    Capability, Finding, IndicatorType, PositiveIndicator, RawFinding, Severity,
};
use vigil_store::FindingStore;

/// Points for a clean scan.
pub const POINTS_NO_VULNERABILITIES: i64 = 5;
/// Points for SPF + DKIM + DMARC all passing.
pub const POINTS_STRONG_EMAIL_CONFIG: i64 = 10;
/// Points per 10% of relative score improvement.
pub const POINTS_IMPROVEMENT_STEP: i64 = 3;

/// Indicators derived from one scan's output. Deterministic: same inputs,
/// same indicators (ids aside).
pub fn analyze_scan(
    tenant_id: &str,
    capability: Capability,
    target: &str,
    findings: &[RawFinding],
    scan_results: Option<&Value>,
) -> Vec<PositiveIndicator> {
    let mut indicators = Vec::new();

    if findings.is_empty() {
        indicators.push(FindingStore::new_indicator(
            tenant_id,
            IndicatorType::NoVulnerabilities,
            capability.category(),
            POINTS_NO_VULNERABILITIES,
            format!("No vulnerabilities found by {}", capability),
            json!({
                "capability": capability.as_str(),
                "findings_count": 0,
            }),
            Some(target.to_string()),
        ));
    }

    if capability == Capability::EmailAudit {
        if let Some(results) = scan_results {
            if email_config_is_strong(results) {
                indicators.push(FindingStore::new_indicator(
                    tenant_id,
                    IndicatorType::StrongEmailConfig,
                    "email_security",
                    POINTS_STRONG_EMAIL_CONFIG,
                    "Email security configuration is strong: SPF, DKIM and DMARC all pass"
                        .to_string(),
                    json!({
                        "spf": true,
                        "dkim": true,
                        "dmarc": true,
                    }),
                    Some(target.to_string()),
                ));
            }
        }
    }

    indicators
}

/// Executors report either `{"spf": {"status": "pass"}}` or the flat
/// `{"spf_valid": true}` form; both count.
fn email_config_is_strong(results: &Value) -> bool {
    ["spf", "dkim", "dmarc"].iter().all(|mechanism| {
        let status_pass = results
            .get(mechanism)
            .and_then(|m| m.get("status"))
            .and_then(|s| s.as_str())
            .map(|s| s == "pass")
            .unwrap_or(false);
        let valid_flag = results
            .get(format!("{}_valid", mechanism).as_str())
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        status_pass || valid_flag
    })
}

/// Posture score over the tenant's active findings: 100 minus severity
/// weights, clamped to `[0, 100]`.
pub fn posture_score(active_by_severity: &HashMap<Severity, i64>) -> f64 {
    let burden: f64 = active_by_severity
        .iter()
        .map(|(severity, count)| severity.posture_weight() * *count as f64)
        .sum();
    (100.0 - burden.min(100.0)).max(0.0)
}

/// Improvement-trend indicator when the score rose by at least 10%
/// relative to the previous one: 3 points per full 10% step.
pub fn improvement_trend(
    tenant_id: &str,
    current: f64,
    previous: Option<f64>,
) -> Option<PositiveIndicator> {
    let previous = previous?;
    if previous <= 0.0 || current <= previous {
        return None;
    }
    let increase = current - previous;
    let percent = increase / previous * 100.0;
    let points = (percent / 10.0).floor() as i64 * POINTS_IMPROVEMENT_STEP;
    if points == 0 {
        return None;
    }

    Some(FindingStore::new_indicator(
        tenant_id,
        IndicatorType::ImprovementTrend,
        "general",
        points,
        format!(
            "Security score improved by {:.1} points ({:.1}%)",
            increase, percent
        ),
        json!({
            "previous_score": previous,
            "current_score": current,
            "increase": increase,
            "percentage_increase": percent,
        }),
        None,
    ))
}

/// Remediation indicator for a finding closed as resolved.
pub fn remediated_indicator(finding: &Finding) -> PositiveIndicator {
    FindingStore::new_indicator(
        &finding.tenant_id,
        IndicatorType::Remediated,
        finding.capability.category(),
        finding.severity.remediation_points(),
        format!("Resolved {} finding: {}", finding.severity, finding.title),
        json!({
            "finding_id": finding.id,
            "severity": finding.severity.as_str(),
            "capability": finding.capability.as_str(),
        }),
        Some(finding.target.clone()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(severity: Severity) -> RawFinding {
        RawFinding {
            severity,
            title: "x".into(),
            description: String::new(),
            evidence: json!({}),
            affected_assets: vec![],
            recommendations: vec![],
            risk_score: 50.0,
        }
    }

    #[test]
    fn clean_scan_awards_no_vulnerabilities() {
        let indicators = analyze_scan("t1", Capability::ExposureDiscovery, "example.com", &[], None);
        assert_eq!(indicators.len(), 1);
        assert_eq!(indicators[0].indicator_type, IndicatorType::NoVulnerabilities);
        assert_eq!(indicators[0].points_awarded, 5);
        assert_eq!(indicators[0].category, "exposure");
    }

    #[test]
    fn findings_suppress_no_vulnerabilities() {
        let findings = vec![raw(Severity::Low)];
        let indicators =
            analyze_scan("t1", Capability::ExposureDiscovery, "example.com", &findings, None);
        assert!(indicators.is_empty());
    }

    #[test]
    fn strong_email_config_needs_all_three() {
        let pass = json!({
            "spf": {"status": "pass"},
            "dkim": {"status": "pass"},
            "dmarc": {"status": "pass"},
        });
        let indicators = analyze_scan(
            "t1",
            Capability::EmailAudit,
            "example.com",
            &[raw(Severity::Info)],
            Some(&pass),
        );
        assert_eq!(indicators.len(), 1);
        assert_eq!(indicators[0].indicator_type, IndicatorType::StrongEmailConfig);
        assert_eq!(indicators[0].points_awarded, 10);

        // Flat boolean form counts too.
        let flat = json!({
            "spf_valid": true,
            "dkim_valid": true,
            "dmarc_valid": true,
        });
        let indicators = analyze_scan(
            "t1",
            Capability::EmailAudit,
            "example.com",
            &[raw(Severity::Info)],
            Some(&flat),
        );
        assert_eq!(indicators.len(), 1);
        assert_eq!(indicators[0].indicator_type, IndicatorType::StrongEmailConfig);

        let partial = json!({
            "spf": {"status": "pass"},
            "dkim": {"status": "fail"},
            "dmarc": {"status": "pass"},
        });
        let none = analyze_scan(
            "t1",
            Capability::EmailAudit,
            "example.com",
            &[raw(Severity::Info)],
            Some(&partial),
        );
        assert!(none.is_empty());

        // Only email audits consult scan results.
        let other = analyze_scan(
            "t1",
            Capability::NetworkSecurity,
            "example.com",
            &[raw(Severity::Info)],
            Some(&pass),
        );
        assert!(other.is_empty());
    }

    #[test]
    fn improvement_trend_thresholds() {
        assert!(improvement_trend("t", 50.0, None).is_none());
        assert!(improvement_trend("t", 50.0, Some(50.0)).is_none());
        assert!(improvement_trend("t", 40.0, Some(50.0)).is_none());
        // 8% up: below the relative threshold.
        assert!(improvement_trend("t", 54.0, Some(50.0)).is_none());

        // Exactly 10% up: one full step.
        let indicator = improvement_trend("t", 55.0, Some(50.0)).unwrap();
        assert_eq!(indicator.points_awarded, 3);

        // 30% up: 3 steps of 3 points.
        let indicator = improvement_trend("t", 65.0, Some(50.0)).unwrap();
        assert_eq!(indicator.points_awarded, 9);
        assert_eq!(indicator.indicator_type, IndicatorType::ImprovementTrend);
    }

    #[test]
    fn remediation_points_follow_severity() {
        let finding = Finding {
            id: "f-1".into(),
            tenant_id: "t1".into(),
            capability: Capability::InfrastructureTesting,
            severity: Severity::Critical,
            status: vigil_protocol::FindingStatus::Resolved,
            title: "Open database".into(),
            description: String::new(),
            evidence: json!({}),
            affected_assets: vec![],
            recommendations: vec![],
            risk_score: 90.0,
            target: "db.example.com".into(),
            discovered_at: chrono::Utc::now(),
            resolved_at: Some(chrono::Utc::now()),
            resolved_by: Some("analyst".into()),
        };
        let indicator = remediated_indicator(&finding);
        assert_eq!(indicator.points_awarded, 25);
        assert_eq!(indicator.category, "infrastructure");
        assert_eq!(indicator.indicator_type, IndicatorType::Remediated);
    }

    #[test]
    fn posture_score_bounds() {
        let mut counts = HashMap::new();
        assert_eq!(posture_score(&counts), 100.0);

        counts.insert(Severity::Critical, 2);
        counts.insert(Severity::Medium, 5);
        // 2*15 + 5*4 = 50 burden.
        assert_eq!(posture_score(&counts), 50.0);

        counts.insert(Severity::Critical, 100);
        assert_eq!(posture_score(&counts), 0.0);
    }
}
