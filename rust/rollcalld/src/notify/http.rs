use std::time::Duration;

use reqwest::blocking::Client;
use tracing::debug;

use super::NotifyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }
}

/// A fully built request. Builders produce these so they can be tested
/// without a network.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub method: HttpMethod,
    pub url: String,
    pub authorization: Option<String>,
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    /// Parsed JSON body, or the raw text as a JSON string when it is not JSON.
    pub body: serde_json::Value,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub trait HttpSender {
    fn send(&self, req: &OutboundRequest) -> Result<HttpResponse, NotifyError>;
}

pub struct ReqwestSender {
    client: Client,
}

impl ReqwestSender {
    pub fn new(timeout: Duration) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .build()
            .map_err(|e| NotifyError::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpSender for ReqwestSender {
    fn send(&self, req: &OutboundRequest) -> Result<HttpResponse, NotifyError> {
        let mut builder = match req.method {
            HttpMethod::Get => self.client.get(&req.url),
            HttpMethod::Post => self.client.post(&req.url),
            HttpMethod::Delete => self.client.delete(&req.url),
        };
        if let Some(auth) = req.authorization.as_deref() {
            builder = builder.header(reqwest::header::AUTHORIZATION, auth);
        }
        if let Some(body) = req.body.as_ref() {
            builder = builder.json(body);
        }

        let resp = builder.send().map_err(|e| {
            if e.is_timeout() {
                NotifyError::Http("request timed out".to_string())
            } else if e.is_connect() {
                NotifyError::Http("connection failed".to_string())
            } else {
                NotifyError::Http(e.without_url().to_string())
            }
        })?;
        let status = resp.status().as_u16();
        let text = resp.text().map_err(|e| NotifyError::Decode(e.to_string()))?;
        debug!(method = req.method.as_str(), status, "upstream responded");

        let body = if text.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
        };
        Ok(HttpResponse { status, body })
    }
}
