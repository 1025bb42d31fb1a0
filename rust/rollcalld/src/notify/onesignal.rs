use reqwest::Url;
use serde_json::{json, Value};

use super::{HttpMethod, HttpResponse, HttpSender, NotifyError, OutboundRequest};
use crate::config::Config;

pub const MAX_LIST_LIMIT: i64 = 50;

#[derive(Debug, Clone, PartialEq)]
pub enum PushAction {
    Send { notification: Value },
    List { limit: i64, offset: i64 },
    Cancel { notification_id: String },
}

impl PushAction {
    pub fn parse(params: &Value) -> Result<Self, NotifyError> {
        let action = params
            .get("action")
            .and_then(|v| v.as_str())
            .ok_or_else(|| NotifyError::BadRequest("missing action".into()))?;
        match action {
            "send" => {
                let notification = params
                    .get("notification")
                    .filter(|v| v.is_object())
                    .cloned()
                    .ok_or_else(|| {
                        NotifyError::BadRequest("notification must be an object".into())
                    })?;
                Ok(Self::Send { notification })
            }
            "list" => {
                let limit = params
                    .get("limit")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(MAX_LIST_LIMIT)
                    .clamp(1, MAX_LIST_LIMIT);
                let offset = params
                    .get("offset")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0)
                    .max(0);
                Ok(Self::List { limit, offset })
            }
            "cancel" => {
                let notification_id = params
                    .get("notificationId")
                    .and_then(|v| v.as_str())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| NotifyError::BadRequest("missing notificationId".into()))?;
                if !notification_id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-')
                {
                    return Err(NotifyError::BadRequest("invalid notificationId".into()));
                }
                Ok(Self::Cancel { notification_id })
            }
            other => Err(NotifyError::BadRequest(format!(
                "action must be one of: send, list, cancel (got {})",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Send { .. } => "send",
            Self::List { .. } => "list",
            Self::Cancel { .. } => "cancel",
        }
    }
}

pub fn build_request(cfg: &Config, action: &PushAction) -> Result<OutboundRequest, NotifyError> {
    let (Some(app_id), Some(key)) = (
        cfg.onesignal_app_id.as_deref(),
        cfg.onesignal_api_key.as_deref(),
    ) else {
        return Err(NotifyError::NotConfigured("push"));
    };
    let authorization = Some(format!("Basic {}", key));

    let req = match action {
        PushAction::Send { notification } => {
            let mut body = notification.clone();
            if let Some(obj) = body.as_object_mut() {
                obj.insert("app_id".into(), Value::String(app_id.to_string()));
            }
            OutboundRequest {
                method: HttpMethod::Post,
                url: notifications_url(cfg, None, &[])?,
                authorization,
                body: Some(body),
            }
        }
        PushAction::List { limit, offset } => OutboundRequest {
            method: HttpMethod::Get,
            url: notifications_url(
                cfg,
                None,
                &[
                    ("app_id", app_id.to_string()),
                    ("limit", limit.to_string()),
                    ("offset", offset.to_string()),
                ],
            )?,
            authorization,
            body: None,
        },
        PushAction::Cancel { notification_id } => OutboundRequest {
            method: HttpMethod::Delete,
            url: notifications_url(
                cfg,
                Some(notification_id.as_str()),
                &[("app_id", app_id.to_string())],
            )?,
            authorization,
            body: None,
        },
    };
    Ok(req)
}

/// `{base}/notifications[/{id}]` with percent-encoded segment and query.
fn notifications_url(
    cfg: &Config,
    id: Option<&str>,
    query: &[(&str, String)],
) -> Result<String, NotifyError> {
    let invalid = |e: String| NotifyError::Http(format!("invalid push API URL: {}", e));
    let mut url = Url::parse(&format!("{}/notifications", cfg.onesignal_api_url))
        .map_err(|e| invalid(e.to_string()))?;
    if let Some(id) = id {
        url.path_segments_mut()
            .map_err(|_| invalid("base cannot carry a path".to_string()))?
            .push(id);
    }
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in query {
            pairs.append_pair(k, v);
        }
    }
    Ok(url.into())
}

/// Push body addressed to specific devices.
pub fn player_notification(player_id: &str, heading: &str, message: &str) -> Value {
    json!({
        "include_player_ids": [player_id],
        "headings": { "en": heading },
        "contents": { "en": message },
    })
}

pub fn dispatch(
    sender: &dyn HttpSender,
    cfg: &Config,
    action: &PushAction,
) -> Result<HttpResponse, NotifyError> {
    let req = build_request(cfg, action)?;
    let resp = sender.send(&req)?;
    if !resp.is_success() {
        return Err(NotifyError::Upstream {
            status: resp.status,
            body: resp.body,
        });
    }
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::time::Duration;

    fn cfg(configured: bool) -> Config {
        Config {
            super_admins: HashSet::new(),
            onesignal_app_id: configured.then(|| "app-1".to_string()),
            onesignal_api_key: configured.then(|| "key-1".to_string()),
            onesignal_api_url: "http://push.test/api/v1".into(),
            telegram_bot_token: None,
            telegram_api_url: "http://tg.test".into(),
            http_timeout: Duration::from_secs(1),
        }
    }

    struct Canned {
        status: u16,
        seen: RefCell<Vec<OutboundRequest>>,
    }

    impl HttpSender for Canned {
        fn send(&self, req: &OutboundRequest) -> Result<HttpResponse, NotifyError> {
            self.seen.borrow_mut().push(req.clone());
            Ok(HttpResponse {
                status: self.status,
                body: json!({ "id": "n-1" }),
            })
        }
    }

    #[test]
    fn actions_map_to_three_endpoints() {
        let c = cfg(true);
        let send = build_request(
            &c,
            &PushAction::parse(&json!({ "action": "send", "notification": { "contents": { "en": "hi" } } }))
                .expect("send"),
        )
        .expect("build");
        assert_eq!(send.method, HttpMethod::Post);
        assert_eq!(send.url, "http://push.test/api/v1/notifications");
        assert_eq!(send.authorization.as_deref(), Some("Basic key-1"));
        assert_eq!(send.body.as_ref().and_then(|b| b.get("app_id")), Some(&json!("app-1")));

        let list = build_request(
            &c,
            &PushAction::parse(&json!({ "action": "list", "limit": 500, "offset": -3 })).expect("list"),
        )
        .expect("build");
        assert_eq!(list.method, HttpMethod::Get);
        assert_eq!(
            list.url,
            "http://push.test/api/v1/notifications?app_id=app-1&limit=50&offset=0"
        );
        assert!(list.body.is_none());

        let cancel = build_request(
            &c,
            &PushAction::parse(&json!({ "action": "cancel", "notificationId": "abc-123" }))
                .expect("cancel"),
        )
        .expect("build");
        assert_eq!(cancel.method, HttpMethod::Delete);
        assert_eq!(
            cancel.url,
            "http://push.test/api/v1/notifications/abc-123?app_id=app-1"
        );
    }

    #[test]
    fn bad_actions_are_rejected_before_any_request() {
        for params in [
            json!({}),
            json!({ "action": "broadcast" }),
            json!({ "action": "send", "notification": "hi" }),
            json!({ "action": "cancel" }),
            json!({ "action": "cancel", "notificationId": "../apps" }),
        ] {
            let e = PushAction::parse(&params).expect_err("should reject");
            assert_eq!(e.code(), "bad_params", "{params}");
        }
    }

    #[test]
    fn query_values_are_percent_encoded() {
        let mut c = cfg(true);
        c.onesignal_app_id = Some("app 1&x=y".to_string());
        let list = build_request(&c, &PushAction::List { limit: 5, offset: 10 }).expect("build");
        assert_eq!(
            list.url,
            "http://push.test/api/v1/notifications?app_id=app+1%26x%3Dy&limit=5&offset=10"
        );
        let cancel = build_request(
            &c,
            &PushAction::Cancel {
                notification_id: "abc-123".to_string(),
            },
        )
        .expect("build");
        assert_eq!(
            cancel.url,
            "http://push.test/api/v1/notifications/abc-123?app_id=app+1%26x%3Dy"
        );
    }

    #[test]
    fn missing_credentials_are_reported() {
        let e = build_request(&cfg(false), &PushAction::List { limit: 1, offset: 0 })
            .expect_err("unconfigured");
        assert_eq!(e.code(), "notifications_not_configured");
    }

    #[test]
    fn non_success_status_becomes_upstream_error() {
        let sender = Canned {
            status: 400,
            seen: RefCell::new(Vec::new()),
        };
        let e = dispatch(&sender, &cfg(true), &PushAction::List { limit: 5, offset: 0 })
            .expect_err("400");
        assert_eq!(e.status(), Some(400));
        assert_eq!(e.details().expect("details")["body"]["id"], "n-1");
        assert_eq!(sender.seen.borrow().len(), 1);
    }
}
