// src/metrics.rs
// Standalone process-wide metrics with a Prometheus text exposition
// endpoint. Counters that can fail carry an outcome label of either
// "success" or "fail (<reason>)".

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::routing::get;
use axum::Router;
use log::{error, info};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

pub static METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// Our Prometheus namespace.
const NS: &str = "tokenizer";

/// Rolling window over which the request rate is computed.
const RATE_WINDOW: Duration = Duration::from_secs(1);

pub const OUTCOME_SUCCESS: &str = "success";

/// Turns an error into an outcome label value, e.g. "foo crashed" becomes
/// "fail (foo crashed)".
pub fn fail_because(err: &dyn fmt::Display) -> String {
    format!("fail ({err})")
}

pub struct Metrics {
    /// Wallets and addresses the address aggregator is currently waiting to
    /// flush.
    num_wallets: AtomicU64,
    num_addrs: AtomicU64,
    /// HTTP responses of the Web receiver, labelled by code and body.
    web_responses: Mutex<BTreeMap<(u16, String), u64>>,
    /// (Un)successfully tokenized blobs, labelled by outcome.
    tokenized: Mutex<BTreeMap<String, u64>>,
    /// (Un)successfully forwarded tokens, labelled by outcome.
    forwarded: Mutex<BTreeMap<String, u64>>,
    /// Timestamps of recent Web requests, pruned to the rate window.
    request_times: Mutex<VecDeque<Instant>>,
}

impl Metrics {
    fn new() -> Self {
        Self {
            num_wallets: AtomicU64::new(0),
            num_addrs: AtomicU64::new(0),
            web_responses: Mutex::new(BTreeMap::new()),
            tokenized: Mutex::new(BTreeMap::new()),
            forwarded: Mutex::new(BTreeMap::new()),
            request_times: Mutex::new(VecDeque::new()),
        }
    }

    /// Records one incoming Web request for rate tracking.
    pub fn record_request(&self) {
        let now = Instant::now();
        let mut times = self.request_times.lock();
        times.push_back(now);
        while let Some(&front) = times.front() {
            if now.duration_since(front) > RATE_WINDOW {
                times.pop_front();
            } else {
                break;
            }
        }
    }

    /// Requests seen within the rate window.
    pub fn request_rate(&self) -> u64 {
        let now = Instant::now();
        self.request_times
            .lock()
            .iter()
            .filter(|&&t| now.duration_since(t) <= RATE_WINDOW)
            .count() as u64
    }

    pub fn set_pending(&self, wallets: u64, addrs: u64) {
        self.num_wallets.store(wallets, Ordering::Relaxed);
        self.num_addrs.store(addrs, Ordering::Relaxed);
    }

    pub fn count_web_response(&self, code: u16, body: &str) {
        *self
            .web_responses
            .lock()
            .entry((code, body.to_string()))
            .or_insert(0) += 1;
    }

    pub fn count_tokenized(&self, outcome: &str) {
        *self.tokenized.lock().entry(outcome.to_string()).or_insert(0) += 1;
    }

    pub fn count_forwarded(&self, outcome: &str) {
        *self.forwarded.lock().entry(outcome.to_string()).or_insert(0) += 1;
    }

    /// Renders all metrics in the Prometheus text format.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        out.push_str(&format!(
            "# HELP {NS}_num_wallets Wallets the address aggregator currently stores\n\
             # TYPE {NS}_num_wallets gauge\n\
             {NS}_num_wallets {}\n",
            self.num_wallets.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "# HELP {NS}_num_addrs Addresses the address aggregator currently stores\n\
             # TYPE {NS}_num_addrs gauge\n\
             {NS}_num_addrs {}\n",
            self.num_addrs.load(Ordering::Relaxed)
        ));

        out.push_str(&format!(
            "# HELP {NS}_web_responses HTTP responses of the Web receiver\n\
             # TYPE {NS}_web_responses counter\n"
        ));
        for ((code, body), count) in self.web_responses.lock().iter() {
            out.push_str(&format!(
                "{NS}_web_responses{{code=\"{code}\",body=\"{}\"}} {count}\n",
                escape_label(body)
            ));
        }

        out.push_str(&format!(
            "# HELP {NS}_num_tokenized (Un)successfully tokenized blobs\n\
             # TYPE {NS}_num_tokenized counter\n"
        ));
        for (outcome, count) in self.tokenized.lock().iter() {
            out.push_str(&format!(
                "{NS}_num_tokenized{{outcome=\"{}\"}} {count}\n",
                escape_label(outcome)
            ));
        }

        out.push_str(&format!(
            "# HELP {NS}_num_forwarded (Un)successfully forwarded tokens\n\
             # TYPE {NS}_num_forwarded counter\n"
        ));
        for (outcome, count) in self.forwarded.lock().iter() {
            out.push_str(&format!(
                "{NS}_num_forwarded{{outcome=\"{}\"}} {count}\n",
                escape_label(outcome)
            ));
        }

        out
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Periodically logs the request rate. Only meant for debugging; the log
/// stays quiet while no requests arrive.
pub fn spawn_rate_logger() {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let rate = METRICS.request_rate();
            if rate > 0 {
                info!("Submit requests per second: {rate}");
            }
        }
    });
}

/// Starts an HTTP server that exposes the metrics at /metrics. Access to
/// this port is expected to be restricted by the deployment; the pipeline's
/// public port is a different one.
pub fn spawn_exporter(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new().route("/metrics", get(|| async { METRICS.export_prometheus() }));
    info!("Exposing Prometheus metrics at {addr}.");
    tokio::spawn(async move {
        if let Err(e) = axum_server::bind(addr).serve(app.into_make_service()).await {
            error!("Metrics server failed: {e}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_labels() {
        assert_eq!(fail_because(&"broker gone"), "fail (broker gone)");
    }

    #[test]
    fn export_contains_counters() {
        let m = Metrics::new();
        m.count_web_response(400, "wallet ID has bad format");
        m.count_web_response(400, "wallet ID has bad format");
        m.count_forwarded(OUTCOME_SUCCESS);
        m.set_pending(3, 7);

        let text = m.export_prometheus();
        assert!(text.contains("tokenizer_num_wallets 3"));
        assert!(text.contains("tokenizer_num_addrs 7"));
        assert!(text
            .contains("tokenizer_web_responses{code=\"400\",body=\"wallet ID has bad format\"} 2"));
        assert!(text.contains("tokenizer_num_forwarded{outcome=\"success\"} 1"));
    }

    #[test]
    fn labels_are_escaped() {
        assert_eq!(escape_label("a\"b\\c"), "a\\\"b\\\\c");
    }

    #[test]
    fn request_rate_counts_recent_requests() {
        let m = Metrics::new();
        assert_eq!(m.request_rate(), 0);
        m.record_request();
        m.record_request();
        assert_eq!(m.request_rate(), 2);
    }
}
