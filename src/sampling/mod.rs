//! Sampling engine
//!
//! Every new trace traverses the sampler chain once, at the start of
//! its first local span: the global rate sampler, then the ordered rule
//! list, then the agent-feedback priority sampler. The verdict lands on
//! the trace handle as a priority tier plus a decision-maker tag that
//! propagates downstream.
//!
//! # Module Structure
//!
//! * `rate` - probability sampling and the token-bucket limiter
//! * `rules` - glob-matched sampling rules
//! * `priority` - agent-feedback rates per (service, env)
//! * `dynamic` - runtime-updatable config cells

/// Runtime-updatable configuration cells
pub mod dynamic;

/// Agent-feedback priority sampler
pub mod priority;

/// Probability sampling and token-bucket limiting
pub mod rate;

/// Glob-matched sampling rules
pub mod rules;

use std::sync::Arc;

use crate::sampling::dynamic::DynamicConfig;
use crate::sampling::priority::PrioritySampler;
use crate::sampling::rate::{sample_by_rate, RateLimiter};
use crate::sampling::rules::{RuleKind, SamplingRule};
use crate::trace::config::Config;
use crate::trace::span::{Span, SpanState};
use crate::trace::{
    KEY_AGENT_RATE, KEY_LIMIT_RATE, KEY_RULE_RATE, KEY_SAMPLE_RATE, KEY_SPAN_SAMPLING_MECHANISM,
    KEY_SPAN_SAMPLING_MPS, KEY_SPAN_SAMPLING_RULE_RATE,
};

/// Sampling priority tiers.
pub const USER_REJECT: f64 = -1.0;
pub const AUTO_REJECT: f64 = 0.0;
pub const AUTO_KEEP: f64 = 1.0;
pub const USER_KEEP: f64 = 2.0;

/// Decision-maker mechanisms, carried as `_dd.p.dm` = `-<n>`.
pub const MECHANISM_DEFAULT: u32 = 0;
pub const MECHANISM_AGENT_RATE: u32 = 1;
pub const MECHANISM_RULE: u32 = 3;
pub const MECHANISM_MANUAL: u32 = 4;
pub const MECHANISM_SINGLE_SPAN: u32 = 8;

/// The trace-level verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingDecision {
    None,
    Drop,
    Keep,
}

/// The full decision pipeline, run once per undecided trace.
pub(crate) struct SamplerChain {
    rate_cell: Arc<DynamicConfig<Option<f64>>>,
    rules: Vec<SamplingRule>,
    span_rules: Vec<SamplingRule>,
    limiter: RateLimiter,
    pub priority: Arc<PrioritySampler>,
    env: String,
}

impl SamplerChain {
    pub fn new(cfg: &Config, rate_cell: Arc<DynamicConfig<Option<f64>>>) -> SamplerChain {
        let (rules, span_rules): (Vec<_>, Vec<_>) = cfg
            .sampling_rules
            .iter()
            .cloned()
            .partition(|r| r.kind == RuleKind::Trace);
        SamplerChain {
            rate_cell,
            rules,
            span_rules,
            limiter: RateLimiter::new(cfg.rate_limit),
            priority: Arc::new(PrioritySampler::new()),
            env: cfg.env.clone().unwrap_or_default(),
        }
    }

    /// Decide the fate of the trace this span starts. Skipped entirely
    /// when an inherited or manual verdict already exists.
    pub fn sample(&self, span: &Span) {
        let ctx = span.context();
        let trace = ctx.trace();
        if trace.decision() != SamplingDecision::None || trace.sampling_priority().is_some() {
            return;
        }
        let id = span.trace_id().lower;

        if let Some(rate) = self.rate_cell.get() {
            if !sample_by_rate(id, rate) {
                trace.set_dropped();
                return;
            }
            if rate < 1.0 {
                span.set_tag(KEY_SAMPLE_RATE, rate);
            }
        }

        let matched = span.with_state(|s| {
            self.rules
                .iter()
                .position(|r| r.matches(&s.service, &s.operation, &s.resource, &s.meta, &s.metrics))
        });
        if let Some(idx) = matched {
            let rule = &self.rules[idx];
            span.set_tag(KEY_RULE_RATE, rule.sample_rate);
            if !sample_by_rate(id, rule.sample_rate) {
                trace.set_sampling_priority(USER_REJECT, None);
                return;
            }
            let limiter = rule.limiter().unwrap_or(&self.limiter);
            let (allowed, effective_rate) = limiter.allow_one();
            span.set_tag(KEY_LIMIT_RATE, effective_rate);
            if allowed {
                trace.set_sampling_priority(USER_KEEP, Some(MECHANISM_RULE));
            } else {
                trace.set_sampling_priority(USER_REJECT, None);
            }
            return;
        }

        let service = span.service();
        let (keep, rate) = self.priority.sample(id, &service, &self.env);
        span.set_tag(KEY_AGENT_RATE, rate);
        if keep {
            trace.set_sampling_priority(AUTO_KEEP, Some(MECHANISM_AGENT_RATE));
        } else {
            trace.set_sampling_priority(AUTO_REJECT, None);
        }
    }

    /// Single-span sampling for spans of dropped traces: the first
    /// matching span rule can rescue the span on its own. Runs at
    /// finish, with the span's write guard held by the caller.
    pub fn apply_span_sampling(&self, span_id: u64, state: &mut SpanState) {
        if state.metrics.contains_key(KEY_SPAN_SAMPLING_MECHANISM) {
            return;
        }
        let rule = self.span_rules.iter().find(|r| {
            r.matches(
                &state.service,
                &state.operation,
                &state.resource,
                &state.meta,
                &state.metrics,
            )
        });
        let rule = match rule {
            Some(r) => r,
            None => return,
        };
        if !sample_by_rate(span_id, rule.sample_rate) {
            return;
        }
        if let Some(limiter) = rule.limiter() {
            if !limiter.allow_one().0 {
                return;
            }
        }
        state.metrics.insert(
            KEY_SPAN_SAMPLING_MECHANISM.to_string(),
            MECHANISM_SINGLE_SPAN as f64,
        );
        state
            .metrics
            .insert(KEY_SPAN_SAMPLING_RULE_RATE.to_string(), rule.sample_rate);
        if let Some(mps) = rule.max_per_second {
            state
                .metrics
                .insert(KEY_SPAN_SAMPLING_MPS.to_string(), mps);
        }
    }
}
