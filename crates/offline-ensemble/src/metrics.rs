//! Prometheus counters for cache lookups, generation routes and
//! initialization outcomes. Recording before `init_metrics` is a no-op.
use lazy_static::lazy_static;
use prometheus::core::Collector;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Registry, TextEncoder};
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static CACHE_LOOKUPS: OnceLock<IntCounterVec> = OnceLock::new();
static GENERATE_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static INITIALIZE_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static GENERATE_SECONDS: OnceLock<Histogram> = OnceLock::new();

fn install<M>(cell: &OnceLock<M>, build: impl FnOnce() -> prometheus::Result<M>) -> prometheus::Result<()>
where
    M: Collector + Clone + 'static,
{
    if cell.get().is_some() {
        return Ok(());
    }
    let metric = build()?;
    if cell.set(metric.clone()).is_ok() {
        REGISTRY.register(Box::new(metric)).ok();
    }
    Ok(())
}

pub fn init_metrics() -> prometheus::Result<()> {
    install(&CACHE_LOOKUPS, || {
        IntCounterVec::new(
            prometheus::opts!("ensemble_cache_lookups_total", "Cache lookups by cache and outcome"),
            &["cache", "outcome"],
        )
    })?;
    install(&GENERATE_TOTAL, || {
        IntCounterVec::new(
            prometheus::opts!("ensemble_generate_total", "Generate calls by answer route"),
            &["route"],
        )
    })?;
    install(&INITIALIZE_TOTAL, || {
        IntCounterVec::new(
            prometheus::opts!("ensemble_initialize_total", "Initialize calls by outcome"),
            &["outcome"],
        )
    })?;
    install(&GENERATE_SECONDS, || {
        Histogram::with_opts(HistogramOpts::new(
            "ensemble_generate_seconds",
            "Wall time of generate calls",
        ))
    })?;
    Ok(())
}

pub fn record_cache_lookup(cache: &str, outcome: &str) {
    if let Some(counter) = CACHE_LOOKUPS.get() {
        counter.with_label_values(&[cache, outcome]).inc();
    }
}

pub fn record_generate(route: &str) {
    if let Some(counter) = GENERATE_TOTAL.get() {
        counter.with_label_values(&[route]).inc();
    }
}

pub fn observe_generate_seconds(seconds: f64) {
    if let Some(histogram) = GENERATE_SECONDS.get() {
        histogram.observe(seconds);
    }
}

pub fn record_initialize(outcome: &str) {
    if let Some(counter) = INITIALIZE_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Text exposition of every registered metric.
pub fn gather() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
