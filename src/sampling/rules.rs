//! Rule-based sampling
//!
//! Rules are matched in configured order against a span's service,
//! operation name, resource, and tags; the first match wins. Patterns
//! are globs where `*` matches any run of characters and `?` matches a
//! single character, compared case-insensitively.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use derive_more::{Display, Error};
use regex::Regex;
use serde::de::{Deserializer, Error as DeError};
use serde::Deserialize;
use serde_derive::Deserialize as DeriveDeserialize;

use crate::sampling::rate::RateLimiter;

#[derive(Debug, Display, Error)]
pub enum RuleError {
    #[display(fmt = "invalid sampling rule JSON: {}", _0)]
    Json(#[error(not(source))] String),
    #[display(fmt = "sample rate {} outside [0,1]", _0)]
    RateOutOfRange(#[error(not(source))] f64),
}

type Result<T> = std::result::Result<T, RuleError>;

/// Whether a rule applies to whole traces or to individual spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Trace,
    Span,
}

/// A compiled glob pattern.
#[derive(Clone)]
pub struct Pattern {
    glob: String,
    regex: Regex,
}

impl Pattern {
    pub fn new(glob: &str) -> Pattern {
        let mut expr = String::with_capacity(glob.len() + 8);
        expr.push_str("(?i)^");
        for c in glob.chars() {
            match c {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                c => expr.push_str(&regex::escape(&c.to_string())),
            }
        }
        expr.push('$');
        // The expression is escaped character by character; compilation
        // cannot fail on user input.
        let regex = Regex::new(&expr).unwrap_or_else(|_| Regex::new("(?i)^$").unwrap());
        Pattern {
            glob: glob.to_string(),
            regex,
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }

    pub fn glob(&self) -> &str {
        &self.glob
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern({:?})", self.glob)
    }
}

/// One ordered sampling rule.
#[derive(Debug, Clone)]
pub struct SamplingRule {
    pub service: Option<Pattern>,
    pub name: Option<Pattern>,
    pub resource: Option<Pattern>,
    pub tags: HashMap<String, Pattern>,
    pub sample_rate: f64,
    pub max_per_second: Option<f64>,
    pub kind: RuleKind,
    limiter: Option<Arc<RateLimiter>>,
}

impl SamplingRule {
    pub fn trace(sample_rate: f64) -> SamplingRule {
        SamplingRule {
            service: None,
            name: None,
            resource: None,
            tags: HashMap::new(),
            sample_rate,
            max_per_second: None,
            kind: RuleKind::Trace,
            limiter: None,
        }
    }

    pub fn with_service(mut self, glob: &str) -> SamplingRule {
        self.service = Some(Pattern::new(glob));
        self
    }

    pub fn with_name(mut self, glob: &str) -> SamplingRule {
        self.name = Some(Pattern::new(glob));
        self
    }

    pub fn with_resource(mut self, glob: &str) -> SamplingRule {
        self.resource = Some(Pattern::new(glob));
        self
    }

    pub fn with_tag(mut self, key: &str, glob: &str) -> SamplingRule {
        self.tags.insert(key.to_string(), Pattern::new(glob));
        self
    }

    pub fn with_max_per_second(mut self, max: f64) -> SamplingRule {
        self.max_per_second = Some(max);
        self.limiter = Some(Arc::new(RateLimiter::new(max)));
        self
    }

    pub fn span_kind(mut self) -> SamplingRule {
        self.kind = RuleKind::Span;
        self
    }

    /// The per-rule limiter, if this rule caps throughput.
    pub fn limiter(&self) -> Option<&RateLimiter> {
        self.limiter.as_deref()
    }

    pub fn matches(
        &self,
        service: &str,
        name: &str,
        resource: &str,
        meta: &HashMap<String, String>,
        metrics: &HashMap<String, f64>,
    ) -> bool {
        if let Some(p) = &self.service {
            if !p.matches(service) {
                return false;
            }
        }
        if let Some(p) = &self.name {
            if !p.matches(name) {
                return false;
            }
        }
        if let Some(p) = &self.resource {
            if !p.matches(resource) {
                return false;
            }
        }
        for (key, pattern) in &self.tags {
            let matched = match meta.get(key) {
                Some(v) => pattern.matches(v),
                None => match metrics.get(key) {
                    // Metric values only match patterns that describe
                    // integers; a glob over "200" should not match 200.5.
                    Some(v) if v.fract() == 0.0 => pattern.matches(&format!("{}", *v as i64)),
                    _ => false,
                },
            };
            if !matched {
                return false;
            }
        }
        true
    }

    /// Parse the DD_TRACE_SAMPLING_RULES JSON document.
    pub fn parse_json(raw: &str) -> Result<Vec<SamplingRule>> {
        let raw_rules: Vec<RawRule> =
            serde_json::from_str(raw).map_err(|e| RuleError::Json(e.to_string()))?;
        raw_rules.into_iter().map(SamplingRule::try_from_raw).collect()
    }

    fn try_from_raw(raw: RawRule) -> Result<SamplingRule> {
        if !(0.0..=1.0).contains(&raw.sample_rate) {
            return Err(RuleError::RateOutOfRange(raw.sample_rate));
        }
        let mut rule = SamplingRule::trace(raw.sample_rate);
        if let Some(glob) = raw.service.as_deref() {
            rule = rule.with_service(glob);
        }
        if let Some(glob) = raw.name.as_deref() {
            rule = rule.with_name(glob);
        }
        if let Some(glob) = raw.resource.as_deref() {
            rule = rule.with_resource(glob);
        }
        if let Some(tags) = raw.tags {
            for (k, glob) in tags {
                rule = rule.with_tag(&k, &glob);
            }
        }
        if let Some(max) = raw.max_per_second {
            rule = rule.with_max_per_second(max);
        }
        if raw.kind.as_deref() == Some("span") {
            rule = rule.span_kind();
        }
        Ok(rule)
    }
}

impl<'de> Deserialize<'de> for SamplingRule {
    fn deserialize<D>(deserializer: D) -> std::result::Result<SamplingRule, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawRule::deserialize(deserializer)?;
        SamplingRule::try_from_raw(raw).map_err(|e| D::Error::custom(e.to_string()))
    }
}

#[derive(DeriveDeserialize)]
struct RawRule {
    service: Option<String>,
    name: Option<String>,
    resource: Option<String>,
    tags: Option<HashMap<String, String>>,
    #[serde(default = "default_rate")]
    sample_rate: f64,
    max_per_second: Option<f64>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

fn default_rate() -> f64 {
    1.0
}
