use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::backup;
use crate::db;
use crate::ipc::handlers::session;
use crate::ipc::helpers::{authorize, required_str, respond, HandlerErr, SUPER_ADMIN};
use crate::ipc::types::{AppState, Request};

fn backup_failed(e: anyhow::Error) -> HandlerErr {
    HandlerErr::new("backup_failed", format!("{e:#}"))
}

fn workspace_path(state: &AppState) -> Result<PathBuf, HandlerErr> {
    state
        .workspace
        .clone()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

/// Reopens the workspace after a failed import. The session is kept.
fn reopen(state: &mut AppState, workspace: &Path) -> Result<(), HandlerErr> {
    match db::open_db(workspace) {
        Ok(conn) => {
            state.db = Some(conn);
            Ok(())
        }
        Err(e) => {
            warn!("failed to reopen workspace after import: {e:#}");
            state.workspace = None;
            state.session = None;
            Err(HandlerErr::new("db_open_failed", format!("{e:#}")))
        }
    }
}

fn export_bundle(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    authorize(state, SUPER_ADMIN)?;
    let workspace = workspace_path(state)?;
    let out_path = PathBuf::from(required_str(params, "outPath")?);

    let summary = backup::export_workspace_bundle(&workspace, &out_path).map_err(backup_failed)?;
    info!(path = %out_path.display(), bytes = summary.db_bytes, "workspace bundle exported");
    Ok(json!({
        "ok": true,
        "path": out_path.to_string_lossy(),
        "bundleFormat": summary.bundle_format,
        "dbSha256": summary.db_sha256,
    }))
}

fn import_bundle(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    authorize(state, SUPER_ADMIN)?;
    let workspace = workspace_path(state)?;
    let in_path = PathBuf::from(required_str(params, "inPath")?);

    // The open connection must be closed before its file is replaced.
    state.db = None;
    let summary = match backup::import_workspace_bundle(&in_path, &workspace) {
        Ok(s) => s,
        Err(e) => {
            reopen(state, &workspace)?;
            return Err(backup_failed(e));
        }
    };
    match db::open_db(&workspace) {
        Ok(conn) => {
            state.db = Some(conn);
            if let Some(aside) = summary.previous.as_deref() {
                if let Err(e) = std::fs::remove_file(aside) {
                    warn!("failed to remove replaced database {}: {e}", aside.display());
                }
            }
        }
        Err(e) => {
            warn!("imported database failed to open: {e:#}");
            if let Some(aside) = summary.previous.as_deref() {
                if let Err(re) = backup::restore_previous(&workspace, aside) {
                    state.workspace = None;
                    state.session = None;
                    return Err(backup_failed(re));
                }
            }
            reopen(state, &workspace)?;
            return Err(backup_failed(e.context("imported database could not be opened")));
        }
    }

    // Sessions come from the imported data; the caller may need to sign in again.
    state.session = None;
    session::restore(state);
    info!(path = %in_path.display(), "workspace bundle imported");
    Ok(json!({
        "ok": true,
        "bundleFormat": summary.bundle_format,
        "exportedAt": summary.exported_at,
        "session": session::session_json(state.session.as_ref()),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "backup.exportWorkspaceBundle" => export_bundle(state, &req.params),
        "backup.importWorkspaceBundle" => import_bundle(state, &req.params),
        _ => return None,
    };
    Some(respond(req, result))
}
