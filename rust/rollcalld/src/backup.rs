use anyhow::{anyhow, Context};
use rusqlite::{Connection, OpenFlags};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::db::{db_path, DB_FILE_NAME};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/rollcall.sqlite3";
pub const BUNDLE_FORMAT: &str = "rollcall-workspace-v1";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub db_sha256: String,
    pub db_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format: String,
    pub exported_at: Option<String>,
    /// The replaced database, moved aside. The caller removes it once the
    /// new one opens, or puts it back with `restore_previous`.
    pub previous: Option<PathBuf>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Zips the workspace database with a manifest carrying its checksum.
/// The caller must make sure no write transaction is open.
pub fn export_workspace_bundle(workspace: &Path, out_path: &Path) -> anyhow::Result<ExportSummary> {
    let src = db_path(workspace);
    if !src.is_file() {
        return Err(anyhow!("workspace database not found: {}", src.display()));
    }
    let db_bytes = std::fs::read(&src)
        .with_context(|| format!("failed to read database {}", src.display()))?;
    let checksum = sha256_hex(&db_bytes);

    if let Some(parent) = out_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let out_file = File::create(out_path)
        .with_context(|| format!("failed to create output file {}", out_path.display()))?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = json!({
        "format": BUNDLE_FORMAT,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        "dbEntry": DB_ENTRY,
        "dbSha256": checksum,
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    zip.write_all(&db_bytes)
        .context("failed to write database entry")?;
    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT.to_string(),
        db_sha256: checksum,
        db_bytes: db_bytes.len() as u64,
    })
}

/// Replaces the workspace database with the one in the bundle.
/// Nothing is touched unless the format and checksum both match.
pub fn import_workspace_bundle(in_path: &Path, workspace: &Path) -> anyhow::Result<ImportSummary> {
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.display()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
    let format = manifest
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if format != BUNDLE_FORMAT {
        return Err(anyhow!("unsupported bundle format: {}", format));
    }
    let expected = manifest
        .get("dbSha256")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("manifest.json missing dbSha256"))?
        .to_ascii_lowercase();

    let mut db_bytes = Vec::new();
    archive
        .by_name(DB_ENTRY)
        .with_context(|| format!("bundle missing {}", DB_ENTRY))?
        .read_to_end(&mut db_bytes)
        .context("failed to extract database entry")?;
    let actual = sha256_hex(&db_bytes);
    if actual != expected {
        return Err(anyhow!(
            "database checksum mismatch: expected {} got {}",
            expected,
            actual
        ));
    }

    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.display()))?;
    let dst = db_path(workspace);
    let tmp = workspace.join(format!("{}.importing", DB_FILE_NAME));
    std::fs::write(&tmp, &db_bytes)
        .with_context(|| format!("failed to write temp database {}", tmp.display()))?;
    if let Err(e) = verify_database(&tmp) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }

    // Keep the live database until the caller has reopened the new one.
    let previous = if dst.is_file() {
        let aside = workspace.join(format!("{}.previous", DB_FILE_NAME));
        std::fs::rename(&dst, &aside)
            .with_context(|| format!("failed to move {} aside", dst.display()))?;
        Some(aside)
    } else {
        None
    };
    if let Err(e) = std::fs::rename(&tmp, &dst) {
        let _ = std::fs::remove_file(&tmp);
        if let Some(aside) = previous.as_deref() {
            restore_previous(workspace, aside)?;
        }
        return Err(anyhow!(e).context(format!(
            "failed to move extracted database to {}",
            dst.display()
        )));
    }

    Ok(ImportSummary {
        bundle_format: BUNDLE_FORMAT.to_string(),
        exported_at: manifest
            .get("exportedAt")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        previous,
    })
}

/// The extracted file must be a readable, intact SQLite database.
fn verify_database(path: &Path) -> anyhow::Result<()> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .context("bundle database cannot be opened")?;
    conn.query_row("SELECT count(*) FROM sqlite_master", [], |r| r.get::<_, i64>(0))
        .context("bundle database is not a SQLite database")?;
    let check: String = conn
        .query_row("PRAGMA integrity_check", [], |r| r.get(0))
        .context("bundle database integrity check failed")?;
    if check != "ok" {
        return Err(anyhow!("bundle database integrity check failed: {}", check));
    }
    Ok(())
}

/// Puts the database that was live before an import back in place.
pub fn restore_previous(workspace: &Path, previous: &Path) -> anyhow::Result<()> {
    let dst = db_path(workspace);
    std::fs::rename(previous, &dst)
        .with_context(|| format!("failed to restore previous database to {}", dst.display()))
}
