//! Remote configuration application
//!
//! An external collaborator delivers `APM_TRACING` JSON blobs. Known
//! fields route into their dynamic-config cells; a field absent from an
//! update resets its cell to the startup value. Every path is answered
//! with an apply state.

use std::sync::Arc;

use serde_derive::Deserialize;

use crate::sampling::dynamic::DynamicConfig;

pub const PRODUCT_APM_TRACING: &str = "APM_TRACING";

/// Outcome reported back to the remote-config collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyState {
    Acknowledged,
    Error(String),
}

/// A header-to-tag mapping rule delivered by remote config.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HeaderTag {
    pub header: String,
    #[serde(rename = "tag_name")]
    pub tag_name: String,
}

#[derive(Deserialize, Default)]
struct LibConfig {
    #[serde(rename = "tracing_sampling_rate")]
    sampling_rate: Option<f64>,
    #[serde(rename = "tracing_header_tags")]
    header_tags: Option<Vec<HeaderTag>>,
}

#[derive(Deserialize)]
struct ApmTracingPayload {
    lib_config: Option<LibConfig>,
}

pub struct RemoteConfigHandler {
    sample_rate: Arc<DynamicConfig<Option<f64>>>,
    header_tags: Arc<DynamicConfig<Vec<HeaderTag>>>,
}

impl RemoteConfigHandler {
    pub(crate) fn new(
        sample_rate: Arc<DynamicConfig<Option<f64>>>,
        header_tags: Arc<DynamicConfig<Vec<HeaderTag>>>,
    ) -> RemoteConfigHandler {
        RemoteConfigHandler {
            sample_rate,
            header_tags,
        }
    }

    /// Apply one configuration update for `path`.
    pub fn handle_update(&self, path: &str, raw: &[u8]) -> ApplyState {
        let payload: ApmTracingPayload = match serde_json::from_slice(raw) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("rejecting remote config update for {}: {}", path, e);
                return ApplyState::Error(e.to_string());
            }
        };
        let lib = payload.lib_config.unwrap_or_default();

        if let Some(rate) = lib.sampling_rate {
            if !(0.0..=1.0).contains(&rate) {
                let msg = format!("tracing_sampling_rate {} outside [0,1]", rate);
                log::warn!("rejecting remote config update for {}: {}", path, msg);
                return ApplyState::Error(msg);
            }
        }

        self.sample_rate.handle_rc(lib.sampling_rate.map(Some));
        self.header_tags.handle_rc(lib.header_tags);
        log::debug!("applied remote config update for {}", path);
        ApplyState::Acknowledged
    }

    /// The product configuration was removed; everything reverts.
    pub fn handle_remove(&self, path: &str) -> ApplyState {
        self.sample_rate.handle_rc(None);
        self.header_tags.handle_rc(None);
        log::debug!("reverted remote config for {}", path);
        ApplyState::Acknowledged
    }
}
