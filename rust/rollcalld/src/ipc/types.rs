use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::auth::Session;
use crate::config::Config;
use crate::notify::HttpSender;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub session: Option<Session>,
    pub config: Config,
    pub sender: Box<dyn HttpSender>,
}

impl AppState {
    pub fn new(config: Config, sender: Box<dyn HttpSender>) -> Self {
        Self {
            workspace: None,
            db: None,
            session: None,
            config,
            sender,
        }
    }
}
