//! Outbound delivery: hosted push API and Telegram bot API.

mod http;
pub mod onesignal;
pub mod telegram;
pub mod template;

use thiserror::Error;

pub use http::{HttpMethod, HttpResponse, HttpSender, OutboundRequest, ReqwestSender};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("{0} credentials are not configured")]
    NotConfigured(&'static str),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("upstream returned status {status}")]
    Upstream {
        status: u16,
        body: serde_json::Value,
    },

    #[error("failed to decode upstream response: {0}")]
    Decode(String),

    #[error("{0}")]
    BadRequest(String),
}

impl NotifyError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotConfigured(_) => "notifications_not_configured",
            Self::Http(_) | Self::Decode(_) => "http_failed",
            Self::Upstream { .. } => "upstream_error",
            Self::BadRequest(_) => "bad_params",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::Upstream { status, body } => {
                Some(serde_json::json!({ "status": status, "body": body }))
            }
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }
}
