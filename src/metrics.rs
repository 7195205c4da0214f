use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Global metrics for credential negotiation
pub struct Metrics {
    pub registry: Registry,

    // Negotiation metrics
    pub negotiations_total: CounterVec,
    pub negotiation_duration_seconds: HistogramVec,
    pub negotiations_joined_total: Counter,

    // Store metrics
    pub store_hits_total: Counter,
    pub store_misses_total: Counter,
    pub credentials_cached: Gauge,

    // Token endpoint metrics
    pub token_requests_total: CounterVec,

    // Fallback metrics
    pub interceptions_total: Counter,
    pub fallback_logins_total: CounterVec,
    pub cookies_propagated_total: Counter,

    // Authenticated client metrics
    pub request_retries_total: CounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        // Negotiation metrics
        let negotiations_total = CounterVec::new(
            Opts::new(
                "portal_auth_negotiations_total",
                "Credential negotiations by final outcome",
            ),
            &["outcome"],
        )?;

        let negotiation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "portal_auth_negotiation_duration_seconds",
                "Credential negotiation duration in seconds",
            )
            .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0]),
            &["outcome"],
        )?;

        let negotiations_joined_total = Counter::new(
            "portal_auth_negotiations_joined_total",
            "Resolve calls that attached to an in-flight negotiation",
        )?;

        // Store metrics
        let store_hits_total = Counter::new(
            "portal_auth_store_hits_total",
            "Credential store lookups that found a credential",
        )?;

        let store_misses_total = Counter::new(
            "portal_auth_store_misses_total",
            "Credential store lookups that found nothing",
        )?;

        let credentials_cached = Gauge::new(
            "portal_auth_credentials_cached",
            "Current number of credentials in the store",
        )?;

        // Token endpoint metrics
        let token_requests_total = CounterVec::new(
            Opts::new(
                "portal_auth_token_requests_total",
                "Token endpoint calls by grant type and status",
            ),
            &["grant_type", "status"],
        )?;

        // Fallback metrics
        let interceptions_total = Counter::new(
            "portal_auth_interceptions_total",
            "Responses identified as coming from an intermediary",
        )?;

        let fallback_logins_total = CounterVec::new(
            Opts::new(
                "portal_auth_fallback_logins_total",
                "Web-view fallback logins by outcome",
            ),
            &["outcome"],
        )?;

        let cookies_propagated_total = Counter::new(
            "portal_auth_cookies_propagated_total",
            "Cookies copied from web-view sessions into the HTTP client",
        )?;

        let request_retries_total = CounterVec::new(
            Opts::new(
                "portal_auth_request_retries_total",
                "Protected requests retried after a challenge",
            ),
            &["trigger"],
        )?;

        // Register all metrics
        registry.register(Box::new(negotiations_total.clone()))?;
        registry.register(Box::new(negotiation_duration_seconds.clone()))?;
        registry.register(Box::new(negotiations_joined_total.clone()))?;
        registry.register(Box::new(store_hits_total.clone()))?;
        registry.register(Box::new(store_misses_total.clone()))?;
        registry.register(Box::new(credentials_cached.clone()))?;
        registry.register(Box::new(token_requests_total.clone()))?;
        registry.register(Box::new(interceptions_total.clone()))?;
        registry.register(Box::new(fallback_logins_total.clone()))?;
        registry.register(Box::new(cookies_propagated_total.clone()))?;
        registry.register(Box::new(request_retries_total.clone()))?;

        Ok(Self {
            registry,
            negotiations_total,
            negotiation_duration_seconds,
            negotiations_joined_total,
            store_hits_total,
            store_misses_total,
            credentials_cached,
            token_requests_total,
            interceptions_total,
            fallback_logins_total,
            cookies_propagated_total,
            request_retries_total,
        })
    }

    /// Prometheus text exposition of every metric.
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<Arc<Metrics>> =
    once_cell::sync::Lazy::new(|| Arc::new(Metrics::default()));
