//! Network gatekeeping for the Vigil control plane.
//!
//! Composes the process-wide block registry, sliding-window rate limiter and
//! tunnel detector into an inline pipeline every external request traverses,
//! feeding the bounded network audit log.

pub mod block;
pub mod gatekeeper;
pub mod ratelimit;
pub mod sanitize;
pub mod tunnel;

pub use block::{BlockError, BlockRegistry, BlockSnapshot, RequestShape};
pub use gatekeeper::{GateConfig, GateDecision, GateRequest, GateResponse, Gatekeeper};
pub use ratelimit::RateLimiter;
pub use sanitize::{is_sensitive_header, sanitize_headers, truncate_body, REDACTED};
pub use tunnel::{DetectorStats, RequestSample, TunnelDetector, DEFAULT_BUFFER_SIZE};
