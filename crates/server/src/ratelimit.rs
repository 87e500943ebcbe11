//! Client address resolution and optional per-IP request limiting.
//!
//! [`client_ip_middleware`] runs on every route. It works out where the
//! request came from, stores the answer as a [`ClientIp`] extension for the
//! handlers (the address recorded on node check-in), and applies the limiter
//! when it is enabled.
//!
//! Forwarding headers (`X-Forwarded-For`, then `X-Real-IP`) are honored only
//! when the direct peer matches `trusted_proxies`. `["*"]` trusts every peer.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use fleet_core::config::RateLimitConfig;
use governor::{
    DefaultKeyedRateLimiter, Quota, RateLimiter,
    clock::{Clock, DefaultClock},
};
use ipnet::IpNet;
use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroU32,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

/// Address the request came from, after trusted-proxy resolution.
///
/// `None` when the server runs without connect info and no trusted header
/// was present (for example under `tower::ServiceExt::oneshot`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientIp(pub Option<String>);

/// Which peers may speak for someone else.
#[derive(Clone, Debug)]
enum ProxyTrust {
    Nobody,
    Everybody,
    Networks(Vec<IpNet>),
}

impl ProxyTrust {
    fn parse(entries: &[String]) -> Self {
        match entries {
            [] => Self::Nobody,
            [only] if only == "*" => Self::Everybody,
            _ => Self::Networks(
                entries
                    .iter()
                    .filter_map(|entry| {
                        let parsed = entry
                            .parse::<IpNet>()
                            .or_else(|_| entry.parse::<IpAddr>().map(IpNet::from));
                        if parsed.is_err() {
                            tracing::warn!(entry = %entry, "Ignoring unparsable trusted_proxies entry");
                        }
                        parsed.ok()
                    })
                    .collect(),
            ),
        }
    }

    fn trusts(&self, peer: Option<IpAddr>) -> bool {
        match (self, peer) {
            (Self::Everybody, _) => true,
            (Self::Nobody, _) | (_, None) => false,
            (Self::Networks(nets), Some(ip)) => nets.iter().any(|net| net.contains(&ip)),
        }
    }
}

/// The limiter itself, allocated only when limiting is enabled.
struct Limiter {
    buckets: DefaultKeyedRateLimiter<String>,
    seen: DashMap<String, Instant>,
    max_entries: usize,
    idle_ttl: Duration,
    full_warned: AtomicBool,
}

/// Proxy trust and limiter state shared by every request.
#[derive(Clone)]
pub struct RateLimitState {
    trust: Arc<ProxyTrust>,
    no_peer_warned: Arc<AtomicBool>,
    limiter: Option<Arc<Limiter>>,
}

impl RateLimitState {
    pub fn new(config: &RateLimitConfig) -> Self {
        let limiter = config.enabled.then(|| {
            let rate = NonZeroU32::new(config.ip_requests_per_minute).unwrap_or(NonZeroU32::MIN);
            let burst = NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN);
            Arc::new(Limiter {
                buckets: RateLimiter::dashmap(Quota::per_minute(rate).allow_burst(burst)),
                seen: DashMap::new(),
                max_entries: config.max_entries as usize,
                idle_ttl: Duration::from_secs(config.entry_ttl_secs),
                full_warned: AtomicBool::new(false),
            })
        });

        Self {
            trust: Arc::new(ProxyTrust::parse(&config.trusted_proxies)),
            no_peer_warned: Arc::new(AtomicBool::new(false)),
            limiter,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    /// Count one request against `key`.
    pub fn check_ip(&self, key: &str) -> Result<(), RateLimitError> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };

        if !limiter.seen.contains_key(key) && limiter.seen.len() >= limiter.max_entries {
            if !limiter.full_warned.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    max_entries = limiter.max_entries,
                    "Rate limiter is full, rejecting unseen addresses"
                );
            }
            return Err(RateLimitError {
                retry_after_secs: 60,
                reason: RateLimitReason::AtCapacity,
            });
        }
        limiter.seen.insert(key.to_string(), Instant::now());

        limiter
            .buckets
            .check_key(&key.to_string())
            .map_err(|not_until| {
                let wait = not_until.wait_time_from(DefaultClock::default().now());
                RateLimitError {
                    retry_after_secs: wait.as_secs() + 1,
                    reason: RateLimitReason::RateLimited,
                }
            })
    }

    /// Forget addresses idle longer than `entry_ttl_secs`. Returns how many went.
    pub fn cleanup(&self) -> usize {
        let Some(limiter) = &self.limiter else {
            return 0;
        };

        let before = limiter.seen.len();
        let now = Instant::now();
        limiter
            .seen
            .retain(|_, last| now.duration_since(*last) <= limiter.idle_ttl);
        let evicted = before.saturating_sub(limiter.seen.len());

        if evicted > 0 {
            // Buckets that have refilled are indistinguishable from new ones.
            limiter.buckets.retain_recent();
            limiter.buckets.shrink_to_fit();
            limiter.full_warned.store(false, Ordering::Relaxed);
        }
        evicted
    }

    /// Number of addresses currently tracked.
    pub fn entry_count(&self) -> usize {
        self.limiter.as_ref().map_or(0, |limiter| limiter.seen.len())
    }

    /// Resolve the client address of a request.
    pub fn client_ip(&self, req: &Request<Body>) -> Option<String> {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        if self.trust.trusts(peer)
            && let Some(forwarded) = forwarded_for(req)
        {
            return Some(forwarded);
        }

        if peer.is_none() && !self.no_peer_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                "No peer address on requests; serve with \
                 into_make_service_with_connect_info::<SocketAddr>() to record node addresses"
            );
        }
        peer.map(|ip| ip.to_string())
    }
}

/// First non-empty forwarding header value.
fn forwarded_for(req: &Request<Body>) -> Option<String> {
    let header = |name: &str| req.headers().get(name).and_then(|v| v.to_str().ok());

    header("x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .or_else(|| header("x-real-ip"))
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitReason {
    RateLimited,
    AtCapacity,
}

/// A rejected request; renders as 429 with `Retry-After`.
#[derive(Debug)]
pub struct RateLimitError {
    pub retry_after_secs: u64,
    pub reason: RateLimitReason,
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        crate::metrics::RATE_LIMITED.inc();
        let (code, message) = match self.reason {
            RateLimitReason::RateLimited => (
                "rate_limit_exceeded",
                format!("Too many requests, retry in {}s", self.retry_after_secs),
            ),
            RateLimitReason::AtCapacity => (
                "rate_limiter_at_capacity",
                "Too many distinct clients, retry later".to_string(),
            ),
        };

        (
            StatusCode::TOO_MANY_REQUESTS,
            [("Retry-After", self.retry_after_secs.to_string())],
            axum::Json(serde_json::json!({
                "code": code,
                "message": message,
                "retry_after": self.retry_after_secs,
            })),
        )
            .into_response()
    }
}

/// Attach [`ClientIp`] to the request and enforce the limit when enabled.
pub async fn client_ip_middleware(
    State(rate_limit): State<RateLimitState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let ip = rate_limit.client_ip(&req);

    if let Err(e) = rate_limit.check_ip(ip.as_deref().unwrap_or("unknown")) {
        return e.into_response();
    }

    req.extensions_mut().insert(ClientIp(ip));
    next.run(req).await
}

/// Periodically forget idle addresses.
pub fn spawn_cleanup_task(
    state: RateLimitState,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let evicted = state.cleanup();
            if evicted > 0 {
                tracing::debug!(evicted, remaining = state.entry_count(), "Rate limiter cleanup");
            }
        }
    })
}
