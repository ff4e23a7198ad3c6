//! Stateful tunnel detection over a bounded window of recent requests.
//!
//! The detector keeps per-source arrival tracks plus a ring of recent request
//! features, and scores a small set of heuristics:
//!
//! - beaconing: near-constant inter-arrival times from one source
//! - entropy: high-entropy bodies with meaningful size
//! - oversized headers, unusual HTTP methods, rare user agents
//!
//! Confidence thresholding happens at the caller; the detector reports every
//! verdict that clears its minimum risk. State is process-wide, not
//! tenant-scoped.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use vigil_protocol::{Confidence, Confidence::*, TunnelVerdict};

/// Ring capacity: how many recent requests inform detection.
pub const DEFAULT_BUFFER_SIZE: usize = 10_000;

/// Arrivals needed before beaconing is considered.
const BEACON_MIN_COUNT: usize = 8;
/// Coefficient of variation below which inter-arrival is "near constant".
const BEACON_CV_THRESHOLD: f64 = 0.1;
/// Tighter variation that upgrades the verdict.
const BEACON_CV_CONFIRMED: f64 = 0.05;
/// Beacon intervals outside this band are ignored (seconds).
const BEACON_MIN_INTERVAL_SECS: f64 = 0.5;
const BEACON_MAX_INTERVAL_SECS: f64 = 600.0;
/// Shannon entropy (bits/byte) above which a body looks encoded/encrypted.
const ENTROPY_THRESHOLD: f64 = 4.5;
/// Bodies smaller than this are never entropy-flagged.
const ENTROPY_MIN_BODY_BYTES: usize = 512;
/// Combined header bytes above this are suspicious.
const OVERSIZED_HEADER_BYTES: usize = 8 * 1024;
/// Verdicts below this risk are suppressed.
const MIN_REPORTED_RISK: f64 = 20.0;

/// One analysed request.
#[derive(Debug, Clone)]
pub struct RequestSample {
    pub timestamp: DateTime<Utc>,
    pub source_ip: String,
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
    pub header_bytes: usize,
    pub user_agent: Option<String>,
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct DetectorStats {
    pub requests_analyzed: u64,
    pub tunnels_detected: u64,
    pub beacons_detected: u64,
    pub alerts_generated: u64,
}

struct SourceTrack {
    detection_id: String,
    arrivals: VecDeque<DateTime<Utc>>,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    request_count: u64,
}

struct RingSlot {
    source_ip: String,
    user_agent: Option<String>,
}

struct DetectorState {
    ring: VecDeque<RingSlot>,
    sources: HashMap<String, SourceTrack>,
    ua_counts: HashMap<String, usize>,
    stats: DetectorStats,
}

/// Process-wide tunnel detector.
pub struct TunnelDetector {
    state: Mutex<DetectorState>,
    buffer_size: usize,
}

impl TunnelDetector {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            state: Mutex::new(DetectorState {
                ring: VecDeque::new(),
                sources: HashMap::new(),
                ua_counts: HashMap::new(),
                stats: DetectorStats::default(),
            }),
            buffer_size: buffer_size.max(16),
        }
    }

    pub fn stats(&self) -> DetectorStats {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).stats
    }

    /// Feed one request; returns a verdict when heuristics cross threshold.
    pub fn analyze(&self, sample: &RequestSample) -> Option<TunnelVerdict> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.stats.requests_analyzed += 1;

        state.admit(sample, self.buffer_size);

        let mut indicators = Vec::new();
        let mut risk = 0.0f64;
        let mut tunnel_type = "anomalous_http";
        let mut beacon_confirmed = false;

        // Beaconing: near-constant inter-arrival time from this source.
        if let Some((mean, cv, count)) = state.beacon_profile(&sample.source_ip) {
            if cv < BEACON_CV_THRESHOLD
                && (BEACON_MIN_INTERVAL_SECS..=BEACON_MAX_INTERVAL_SECS).contains(&mean)
            {
                indicators.push(format!(
                    "beaconing: {} requests at ~{:.1}s intervals (cv {:.3})",
                    count, mean, cv
                ));
                risk += 40.0;
                tunnel_type = "beacon";
                state.stats.beacons_detected += 1;
                if count >= 20 && cv < BEACON_CV_CONFIRMED {
                    beacon_confirmed = true;
                    risk += 25.0;
                }
            }
        }

        // Entropy: encoded or encrypted payloads in sizeable bodies.
        if sample.body.len() >= ENTROPY_MIN_BODY_BYTES {
            let entropy = shannon_entropy(&sample.body);
            if entropy > ENTROPY_THRESHOLD {
                indicators.push(format!(
                    "high body entropy: {:.2} bits/byte over {} bytes",
                    entropy,
                    sample.body.len()
                ));
                risk += 25.0;
                if tunnel_type != "beacon" {
                    tunnel_type = "data_exfiltration";
                }
            }
        }

        if sample.header_bytes > OVERSIZED_HEADER_BYTES {
            indicators.push(format!("oversized headers: {} bytes", sample.header_bytes));
            risk += 15.0;
        }

        if !matches!(
            sample.method.to_ascii_uppercase().as_str(),
            "GET" | "POST" | "PUT" | "DELETE" | "HEAD" | "OPTIONS" | "PATCH"
        ) {
            indicators.push(format!("unusual method: {}", sample.method));
            risk += 10.0;
        }

        match &sample.user_agent {
            None => {
                indicators.push("missing user agent".to_string());
                risk += 10.0;
            }
            Some(ua) => {
                let seen = state.ua_counts.get(ua).copied().unwrap_or(0);
                if seen <= 1 {
                    indicators.push(format!("rare user agent: '{}'", truncate(ua, 64)));
                    risk += 10.0;
                }
            }
        }

        if indicators.is_empty() || risk < MIN_REPORTED_RISK {
            return None;
        }

        let risk = risk.min(100.0);
        let confidence = if beacon_confirmed || risk >= 85.0 {
            Confirmed
        } else if risk >= 65.0 {
            High
        } else if risk >= 40.0 {
            Medium
        } else {
            Low
        };

        let track = state.sources.get(&sample.source_ip)?;
        let verdict = TunnelVerdict {
            detection_id: track.detection_id.clone(),
            tunnel_type: tunnel_type.to_string(),
            confidence,
            risk_score: risk,
            indicators,
            source_ip: sample.source_ip.clone(),
            first_seen: track.first_seen,
            last_seen: track.last_seen,
            request_count: track.request_count,
        };
        state.stats.tunnels_detected += 1;
        Some(verdict)
    }

    /// Count an emitted alert (caller-side thresholding passed).
    pub fn record_alert(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.stats.alerts_generated += 1;
    }
}

impl Default for TunnelDetector {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl DetectorState {
    fn admit(&mut self, sample: &RequestSample, buffer_size: usize) {
        // Ring eviction keeps per-UA counts in step with the window.
        if self.ring.len() == buffer_size {
            if let Some(evicted) = self.ring.pop_front() {
                if let Some(ua) = evicted.user_agent {
                    if let Some(count) = self.ua_counts.get_mut(&ua) {
                        *count -= 1;
                        if *count == 0 {
                            self.ua_counts.remove(&ua);
                        }
                    }
                }
                if let Some(track) = self.sources.get_mut(&evicted.source_ip) {
                    track.arrivals.pop_front();
                    if track.arrivals.is_empty() {
                        self.sources.remove(&evicted.source_ip);
                    }
                }
            }
        }

        self.ring.push_back(RingSlot {
            source_ip: sample.source_ip.clone(),
            user_agent: sample.user_agent.clone(),
        });
        if let Some(ua) = &sample.user_agent {
            *self.ua_counts.entry(ua.clone()).or_insert(0) += 1;
        }

        let track = self
            .sources
            .entry(sample.source_ip.clone())
            .or_insert_with(|| SourceTrack {
                detection_id: uuid::Uuid::new_v4().to_string(),
                arrivals: VecDeque::new(),
                first_seen: sample.timestamp,
                last_seen: sample.timestamp,
                request_count: 0,
            });
        track.arrivals.push_back(sample.timestamp);
        track.last_seen = sample.timestamp;
        track.request_count += 1;
    }

    /// `(mean interval secs, coefficient of variation, arrival count)` for a
    /// source, when enough arrivals exist.
    fn beacon_profile(&self, source_ip: &str) -> Option<(f64, f64, usize)> {
        let track = self.sources.get(source_ip)?;
        if track.arrivals.len() < BEACON_MIN_COUNT {
            return None;
        }
        let intervals: Vec<f64> = track
            .arrivals
            .iter()
            .zip(track.arrivals.iter().skip(1))
            .map(|(a, b)| (*b - *a).num_milliseconds() as f64 / 1000.0)
            .collect();
        let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
        if mean <= 0.0 {
            return None;
        }
        let variance = intervals
            .iter()
            .map(|x| (x - mean).powi(2))
            .sum::<f64>()
            / intervals.len() as f64;
        let cv = variance.sqrt() / mean;
        Some((mean, cv, track.arrivals.len()))
    }
}

/// Shannon entropy in bits per byte.
fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut counts = [0usize; 256];
    for byte in data {
        counts[*byte as usize] += 1;
    }
    let len = data.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
