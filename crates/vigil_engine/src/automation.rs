//! Company automation sync: translate a tenant's automation preferences
//! into managed scheduled searches.
//!
//! For every enabled capability the sync maintains exactly one search named
//! `auto-<capability>`. Capabilities switched off keep their search, marked
//! disabled, so run history survives. Replaying the same profile is a no-op.

use crate::EngineError;
use serde_json::{json, Value};
use vigil_protocol::{Capability, CompanyProfile};
use vigil_store::{NewScheduledSearch, Store};

/// What a sync pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub disabled: usize,
    pub unchanged: usize,
}

/// The managed-search name for a capability.
pub fn managed_search_name(capability: Capability) -> String {
    format!("auto-{}", capability.as_str())
}

/// Reconcile the tenant's managed searches against the profile. Idempotent
/// and safe to replay.
pub async fn sync_company_automation(
    store: &Store,
    profile: &CompanyProfile,
) -> Result<SyncReport, EngineError> {
    let searches = store.scheduled_searches();
    let mut report = SyncReport::default();
    let automation = profile.automation_config.as_ref();

    for capability in Capability::ALL {
        let name = managed_search_name(capability);
        let existing = searches.find_by_name(&profile.tenant_id, &name).await?;

        let capability_automation =
            automation.and_then(|config| config.capabilities.get(&capability));
        let wanted = automation.map(|config| config.enabled).unwrap_or(false)
            && capability_automation.map(|c| c.enabled).unwrap_or(false);

        if !wanted {
            if let Some(search) = existing {
                if search.enabled {
                    searches.set_enabled(&search.id, false).await?;
                    report.disabled += 1;
                    tracing::info!(
                        "Automation sync disabled '{}' for tenant {}",
                        name,
                        profile.tenant_id
                    );
                } else {
                    report.unchanged += 1;
                }
            }
            continue;
        }

        // wanted implies automation is present.
        let Some(automation) = automation else { continue };
        let capability_automation = capability_automation.cloned().unwrap_or_default();

        let target = capability_automation
            .targets
            .first()
            .cloned()
            .or_else(|| profile.primary_domain.clone());
        let Some(target) = target else {
            tracing::warn!(
                "Automation for {} has no target and the profile has no primary domain; skipping",
                capability
            );
            continue;
        };

        let mut config = capability_automation
            .config
            .clone()
            .unwrap_or_else(|| json!({}));
        if !capability_automation.keywords.is_empty() {
            if let Value::Object(map) = &mut config {
                map.insert(
                    "keywords".to_string(),
                    json!(capability_automation.keywords),
                );
            }
        }

        let desired = NewScheduledSearch {
            tenant_id: profile.tenant_id.clone(),
            name: name.clone(),
            description: Some(format!("Managed automation for {}", capability)),
            capabilities: vec![capability],
            target,
            config,
            cron_expression: automation.schedule.cron.clone(),
            timezone: automation.schedule.timezone.clone(),
            enabled: true,
        };

        match existing {
            None => {
                searches.create(&desired).await?;
                report.created += 1;
                tracing::info!(
                    "Automation sync created '{}' for tenant {}",
                    name,
                    profile.tenant_id
                );
            }
            Some(search) => {
                let unchanged = search.enabled
                    && search.target == desired.target
                    && search.cron_expression == desired.cron_expression
                    && search.timezone == desired.timezone
                    && search.config == desired.config
                    && search.capabilities == desired.capabilities;
                if unchanged {
                    report.unchanged += 1;
                } else {
                    searches.update_definition(&search.id, &desired).await?;
                    report.updated += 1;
                    tracing::info!(
                        "Automation sync updated '{}' for tenant {}",
                        name,
                        profile.tenant_id
                    );
                }
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use vigil_protocol::{AutomationConfig, AutomationSchedule, CapabilityAutomation};
    use vigil_store::Scope;

    fn profile_with(capabilities: HashMap<Capability, CapabilityAutomation>) -> CompanyProfile {
        CompanyProfile {
            id: "p1".to_string(),
            tenant_id: "t1".to_string(),
            name: "Acme".to_string(),
            primary_domain: Some("acme.example".to_string()),
            additional_domains: vec![],
            timezone: "UTC".to_string(),
            automation_config: Some(AutomationConfig {
                enabled: true,
                schedule: AutomationSchedule {
                    cron: "0 3 * * *".to_string(),
                    timezone: "UTC".to_string(),
                },
                capabilities,
            }),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn enabled_capability() -> CapabilityAutomation {
        CapabilityAutomation {
            enabled: true,
            targets: vec![],
            keywords: vec![],
            config: None,
        }
    }

    #[tokio::test]
    async fn sync_creates_one_search_per_enabled_capability() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut capabilities = HashMap::new();
        capabilities.insert(Capability::EmailAudit, enabled_capability());
        capabilities.insert(Capability::ExposureDiscovery, enabled_capability());
        let profile = profile_with(capabilities);

        let report = sync_company_automation(&store, &profile).await.unwrap();
        assert_eq!(report.created, 2);

        let search = store
            .scheduled_searches()
            .find_by_name("t1", "auto-email_audit")
            .await
            .unwrap()
            .unwrap();
        assert!(search.enabled);
        assert_eq!(search.target, "acme.example");
        assert_eq!(search.capabilities, vec![Capability::EmailAudit]);
    }

    #[tokio::test]
    async fn replay_is_a_no_op() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut capabilities = HashMap::new();
        capabilities.insert(Capability::EmailAudit, enabled_capability());
        let profile = profile_with(capabilities);

        let first = sync_company_automation(&store, &profile).await.unwrap();
        assert_eq!(first.created, 1);
        let second = sync_company_automation(&store, &profile).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.disabled, 0);

        let all = store
            .scheduled_searches()
            .list(&Scope::tenant("t1"), 100, 0)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn disabling_a_capability_disables_not_deletes() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut capabilities = HashMap::new();
        capabilities.insert(Capability::EmailAudit, enabled_capability());
        let profile = profile_with(capabilities.clone());
        sync_company_automation(&store, &profile).await.unwrap();

        capabilities.insert(
            Capability::EmailAudit,
            CapabilityAutomation {
                enabled: false,
                ..Default::default()
            },
        );
        let profile = profile_with(capabilities);
        let report = sync_company_automation(&store, &profile).await.unwrap();
        assert_eq!(report.disabled, 1);

        let search = store
            .scheduled_searches()
            .find_by_name("t1", "auto-email_audit")
            .await
            .unwrap()
            .unwrap();
        assert!(!search.enabled);
    }

    #[tokio::test]
    async fn per_capability_target_overrides_primary_domain() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut capabilities = HashMap::new();
        capabilities.insert(
            Capability::DarkwebIntelligence,
            CapabilityAutomation {
                enabled: true,
                targets: vec!["acme brand".to_string()],
                keywords: vec!["acme".to_string(), "acme-corp".to_string()],
                config: Some(json!({"crawl_limit": 5})),
            },
        );
        let profile = profile_with(capabilities);
        sync_company_automation(&store, &profile).await.unwrap();

        let search = store
            .scheduled_searches()
            .find_by_name("t1", "auto-darkweb_intelligence")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(search.target, "acme brand");
        assert_eq!(search.config["crawl_limit"], 5);
        assert_eq!(search.config["keywords"][0], "acme");
    }
}
