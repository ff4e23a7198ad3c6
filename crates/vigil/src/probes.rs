//! Built-in probe executors.
//!
//! The real collectors (crawlers, DNS probes, browser capture) live outside
//! the control plane and register over its executor contract. The daemon
//! ships lightweight probes so every capability is dispatchable out of the
//! box: they validate the target, honour cancellation, report progress, and
//! return scan metadata without touching the network.

use serde_json::json;
use vigil_protocol::{executor_fn, Capability, ExecError, ExecOutcome, ExecutorFn};

/// A no-network probe executor for a capability.
pub fn probe_executor(capability: Capability) -> ExecutorFn {
    executor_fn(move |req| async move {
        req.cancel.throw_if_cancelled()?;
        req.progress.report(5, "validating target");

        let target = req.target.trim().to_string();
        if target.is_empty() {
            return Err(ExecError::fatal("empty target"));
        }
        match capability {
            Capability::EmailAudit | Capability::ExposureDiscovery => {
                if !looks_like_domain(&target) {
                    return Err(ExecError::fatal(format!(
                        "'{}' is not a domain",
                        target
                    )));
                }
            }
            _ => {}
        }

        req.progress.report(50, "probing");
        req.cancel.throw_if_cancelled()?;
        req.progress.report(95, "collecting results");

        let mut outcome = ExecOutcome::empty();
        outcome.metadata = json!({
            "probe": true,
            "capability": capability.as_str(),
            "target": target,
        });
        Ok(outcome)
    })
}

fn looks_like_domain(target: &str) -> bool {
    !target.contains(char::is_whitespace)
        && target.contains('.')
        && target
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vigil_protocol::{CancelSignal, ExecRequest, ProgressSink};

    fn request(target: &str) -> ExecRequest {
        ExecRequest {
            tenant_id: "t1".to_string(),
            target: target.to_string(),
            config: json!({}),
            progress: ProgressSink::noop(),
            cancel: CancelSignal::new(),
        }
    }

    #[tokio::test]
    async fn probe_accepts_domains_and_rejects_junk() {
        let probe = probe_executor(Capability::EmailAudit);
        let outcome = probe(request("example.com")).await.unwrap();
        assert_eq!(outcome.metadata["probe"], true);
        assert!(outcome.findings.is_empty());

        let err = probe(request("not a domain")).await.unwrap_err();
        assert_eq!(err.kind, vigil_protocol::ExecErrorKind::Fatal);
    }

    #[tokio::test]
    async fn probe_observes_cancellation() {
        let probe = probe_executor(Capability::Investigation);
        let req = request("anything");
        req.cancel.cancel();
        let err = probe(req).await.unwrap_err();
        assert_eq!(err.kind, vigil_protocol::ExecErrorKind::Cancelled);
    }
}
