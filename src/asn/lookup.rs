//! Address-to-ASN resolution.
//!
//! The offline [AsnRangeIndex] is preferred. The online resolver is network bound: it is rate
//! limited across workers, retries transient failures with exponential backoff, and stops as
//! soon as the batch [CancelToken] fires. Any failure resolves to "unknown ASN" upstream.
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::index::{parse_asn, AsnRangeIndex};
use super::Asn;
use crate::error::{Error, Result};

pub const RIPESTAT_URL: &str = "https://stat.ripe.net/data/network-info/data.json";

/// Sleep granularity while waiting, so cancellation is noticed promptly.
const CANCEL_POLL: Duration = Duration::from_millis(50);

pub trait AsnResolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` means the resolver knows the address has no ASN.
    fn resolve(&self, ip: IpAddr) -> Result<Option<Asn>>;
}

impl AsnResolver for AsnRangeIndex {
    fn name(&self) -> &'static str {
        "range-index"
    }

    fn resolve(&self, ip: IpAddr) -> Result<Option<Asn>> {
        Ok(self.lookup(ip))
    }
}

/// Shared cancellation flag with an optional hard deadline.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { flag: Arc::default(), deadline: Some(Instant::now() + timeout) }
    }

    #[cfg(test)]
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Sleeps for `duration` unless cancelled first. Returns false when cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let wake = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= wake {
                return true;
            }
            std::thread::sleep((wake - now).min(CANCEL_POLL));
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub base_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            base_delay: Duration::from_millis(500),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based): base, 2*base, 4*base, ...
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// Enforces a minimum spacing between requests, shared by every worker.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self { interval, next_slot: Mutex::new(Instant::now()) }
    }

    /// Waits for this caller's slot. Returns false when cancelled while waiting.
    pub fn acquire(&self, cancel: &CancelToken) -> bool {
        let wait = {
            let mut next_slot = self.next_slot.lock();
            let now = Instant::now();
            let slot = (*next_slot).max(now);
            *next_slot = slot + self.interval;
            slot - now
        };
        cancel.sleep(wait)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryError {
    /// Worth retrying: timeouts, connection failures, 429, 5xx.
    Transient(String),
    Permanent(String),
}

/// One raw question to a lookup service.
pub trait AsnSource: Send + Sync {
    fn query(&self, ip: IpAddr, timeout: Duration) -> std::result::Result<Option<Asn>, QueryError>;
}

/// RIPEstat `network-info`: `{"data": {"asns": ["3320"], "prefix": "..."}}`.
pub struct RipeStat {
    agent: ureq::Agent,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct NetworkInfo {
    data: NetworkInfoData,
}

#[derive(Debug, Deserialize)]
struct NetworkInfoData {
    #[serde(default)]
    asns: Vec<String>,
}

impl RipeStat {
    pub fn new(base_url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .user_agent(concat!("cellsniff/", env!("CARGO_PKG_VERSION")))
            .build();
        Self { agent, base_url: base_url.into() }
    }
}

impl Default for RipeStat {
    fn default() -> Self {
        Self::new(RIPESTAT_URL)
    }
}

impl AsnSource for RipeStat {
    fn query(&self, ip: IpAddr, timeout: Duration) -> std::result::Result<Option<Asn>, QueryError> {
        let response = self.agent
            .get(&self.base_url)
            .query("resource", &ip.to_string())
            .timeout(timeout)
            .call();

        let body = match response {
            Ok(resp) => resp.into_string().map_err(|e| QueryError::Transient(e.to_string()))?,
            Err(ureq::Error::Status(code, _)) if code == 429 || code >= 500 => {
                return Err(QueryError::Transient(format!("HTTP {code}")));
            }
            Err(ureq::Error::Status(code, _)) => {
                return Err(QueryError::Permanent(format!("HTTP {code}")));
            }
            Err(e) => return Err(QueryError::Transient(e.to_string())),
        };

        parse_network_info(&body)
    }
}

fn parse_network_info(body: &str) -> std::result::Result<Option<Asn>, QueryError> {
    let info: NetworkInfo = serde_json::from_str(body)
        .map_err(|e| QueryError::Permanent(format!("unexpected response: {e}")))?;
    Ok(info.data.asns.iter().find_map(|asn| parse_asn(asn)))
}

/// Lookup-service resolver with retry, backoff, rate limiting and cancellation.
pub struct OnlineResolver<S = RipeStat> {
    source: S,
    policy: RetryPolicy,
    limiter: RateLimiter,
    cancel: CancelToken,
}

impl<S: AsnSource> OnlineResolver<S> {
    pub fn new(source: S, policy: RetryPolicy, min_interval: Duration, cancel: CancelToken) -> Self {
        Self { source, policy, limiter: RateLimiter::new(min_interval), cancel }
    }

    fn failure(ip: IpAddr, reason: impl Into<String>) -> Error {
        Error::AsnLookup { ip, reason: reason.into() }
    }
}

impl<S: AsnSource> AsnResolver for OnlineResolver<S> {
    fn name(&self) -> &'static str {
        "online"
    }

    fn resolve(&self, ip: IpAddr) -> Result<Option<Asn>> {
        let mut last_error = String::from("no attempts made");

        for attempt in 0..self.policy.attempts {
            if attempt > 0 && !self.cancel.sleep(self.policy.backoff(attempt)) {
                return Err(Self::failure(ip, "cancelled"));
            }
            if !self.limiter.acquire(&self.cancel) {
                return Err(Self::failure(ip, "cancelled"));
            }

            let timeout = match self.cancel.remaining() {
                Some(remaining) => remaining.min(self.policy.request_timeout),
                None => self.policy.request_timeout,
            };
            match self.source.query(ip, timeout) {
                Ok(asn) => return Ok(asn),
                Err(QueryError::Permanent(reason)) => return Err(Self::failure(ip, reason)),
                Err(QueryError::Transient(reason)) => {
                    log::debug!("ASN lookup for {ip} failed (attempt {}): {reason}", attempt + 1);
                    last_error = reason;
                }
            }
        }

        Err(Self::failure(ip, format!("gave up after {} attempts: {last_error}", self.policy.attempts)))
    }
}

/// Result of asking a [ResolverChain].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub asn: Option<Asn>,
    /// Resolver that produced `asn`.
    pub resolver: Option<&'static str>,
    /// Last soft failure seen on the way, if any.
    pub failure: Option<String>,
}

/// Resolvers asked in order until one knows the address.
#[derive(Default)]
pub struct ResolverChain {
    resolvers: Vec<Box<dyn AsnResolver>>,
}

impl ResolverChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, resolver: impl AsnResolver + 'static) -> Self {
        self.resolvers.push(Box::new(resolver));
        self
    }

    pub fn resolve(&self, ip: IpAddr) -> Resolution {
        let mut resolution = Resolution::default();

        for resolver in &self.resolvers {
            match resolver.resolve(ip) {
                Ok(Some(asn)) => {
                    resolution.asn = Some(asn);
                    resolution.resolver = Some(resolver.name());
                    return resolution;
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("{e}");
                    resolution.failure = Some(e.to_string());
                }
            }
        }

        resolution
    }
}
