use serde_json::json;

use super::{HttpMethod, HttpResponse, HttpSender, NotifyError, OutboundRequest};
use crate::config::Config;

pub const MAX_MESSAGE_LEN: usize = 4096;

pub fn build_send_message(
    cfg: &Config,
    chat_id: &str,
    text: &str,
) -> Result<OutboundRequest, NotifyError> {
    let Some(token) = cfg.telegram_bot_token.as_deref() else {
        return Err(NotifyError::NotConfigured("telegram"));
    };
    let chat_id = chat_id.trim();
    if chat_id.is_empty() {
        return Err(NotifyError::BadRequest("chatId must not be empty".into()));
    }
    let text = text.trim();
    if text.is_empty() {
        return Err(NotifyError::BadRequest("text must not be empty".into()));
    }
    if text.chars().count() > MAX_MESSAGE_LEN {
        return Err(NotifyError::BadRequest(format!(
            "text must be at most {} characters",
            MAX_MESSAGE_LEN
        )));
    }

    Ok(OutboundRequest {
        method: HttpMethod::Post,
        url: format!("{}/bot{}/sendMessage", cfg.telegram_api_url, token),
        authorization: None,
        body: Some(json!({ "chat_id": chat_id, "text": text })),
    })
}

/// The bot API reports failures in the body as `ok: false`, sometimes with 200.
pub fn send_message(
    sender: &dyn HttpSender,
    cfg: &Config,
    chat_id: &str,
    text: &str,
) -> Result<HttpResponse, NotifyError> {
    let req = build_send_message(cfg, chat_id, text)?;
    let resp = sender.send(&req)?;
    let accepted = resp.body.get("ok").and_then(|v| v.as_bool()).unwrap_or(false);
    if !resp.is_success() || !accepted {
        return Err(NotifyError::Upstream {
            status: resp.status,
            body: resp.body,
        });
    }
    Ok(resp)
}
