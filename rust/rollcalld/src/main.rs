mod auth;
mod backup;
mod config;
mod db;
mod import;
mod ipc;
mod notify;
mod report;

use serde_json::json;
use std::io::{self, BufRead, Write};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

fn init_logging() {
    // stdout carries the IPC stream, so logs go to stderr.
    let filter = EnvFilter::try_from_env("ROLLCALLD_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();
}

fn main() {
    init_logging();

    let config = config::Config::load();
    let sender = match notify::ReqwestSender::new(config.http_timeout) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to build HTTP client: {e}");
            std::process::exit(1);
        }
    };
    let mut state = ipc::AppState::new(config, Box::new(sender));
    info!(version = env!("CARGO_PKG_VERSION"), "rollcalld ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                error!("stdin read failed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            // Without a parsed id the reply cannot be correlated.
            Err(e) => json!({
                "ok": false,
                "error": { "code": "bad_json", "message": e.to_string() },
            }),
        };
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    info!("stdin closed; exiting");
}
