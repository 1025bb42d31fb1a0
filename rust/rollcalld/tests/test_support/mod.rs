#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

pub const SUPER_EMAIL: &str = "owner@rollcall.test";
pub const SUPER_PASSWORD: &str = "owner-pass";

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub struct Sidecar {
    pub child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Starts the daemon with the test super-admin configured and no
/// notification credentials unless `env` supplies them.
pub fn spawn_sidecar_with_env(env: &[(&str, &str)]) -> Sidecar {
    let exe = env!("CARGO_BIN_EXE_rollcalld");
    let mut cmd = Command::new(exe);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .env("ROLLCALLD_SUPER_ADMINS", SUPER_EMAIL)
        .env("ROLLCALLD_HTTP_TIMEOUT_SECS", "5")
        .env_remove("ONESIGNAL_APP_ID")
        .env_remove("ONESIGNAL_API_KEY")
        .env_remove("TELEGRAM_BOT_TOKEN");
    // The fake upstream lives on loopback; keep outbound calls off any proxy.
    for proxy in ["HTTP_PROXY", "http_proxy", "HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"] {
        cmd.env_remove(proxy);
    }
    for (k, v) in env {
        cmd.env(k, v);
    }
    let mut child = cmd.spawn().expect("spawn rollcalld");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    Sidecar {
        child,
        stdin,
        reader: BufReader::new(stdout),
        next_id: 0,
    }
}

pub fn spawn_sidecar() -> Sidecar {
    spawn_sidecar_with_env(&[])
}

impl Sidecar {
    pub fn send_raw(&mut self, line: &str) -> Value {
        writeln!(self.stdin, "{}", line).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut out = String::new();
        self.reader.read_line(&mut out).expect("read response line");
        assert!(!out.trim().is_empty(), "empty response for {}", line);
        serde_json::from_str(out.trim()).expect("parse response json")
    }

    pub fn request(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({ "id": id, "method": method, "params": params });
        let value = self.send_raw(&payload.to_string());
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    pub fn request_ok(&mut self, method: &str, params: Value) -> Value {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or(Value::Null)
    }

    /// Returns the error code; fails the test if the call succeeded.
    pub fn request_err(&mut self, method: &str, params: Value) -> String {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value
            .pointer("/error/code")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    }

    pub fn select_workspace(&mut self, path: &Path) -> Value {
        self.request_ok("workspace.select", json!({ "path": path.to_string_lossy() }))
    }

    pub fn sign_in(&mut self, email: &str, password: &str) -> Value {
        self.request_ok(
            "session.signIn",
            json!({ "email": email, "password": password }),
        )
    }

    /// Creates the configured super-admin account (first call only) and signs in.
    pub fn sign_in_super_admin(&mut self) {
        let _ = self.request(
            "users.bootstrapSuperAdmin",
            json!({ "email": SUPER_EMAIL, "password": SUPER_PASSWORD }),
        );
        self.sign_in(SUPER_EMAIL, SUPER_PASSWORD);
    }
}

pub fn str_field(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing string {} in {}", key, v))
        .to_string()
}

pub struct SchoolFixture {
    pub school_id: String,
    pub admin_email: String,
    pub admin_password: String,
}

/// Creates a school while signed in as super-admin.
pub fn create_school(s: &mut Sidecar, name: &str, admin_email: &str, expires_at: Option<&str>) -> SchoolFixture {
    let created = s.request_ok(
        "schools.create",
        json!({
            "name": name,
            "adminEmail": admin_email,
            "adminPassword": "admin-pass",
            "expiresAt": expires_at,
        }),
    );
    SchoolFixture {
        school_id: str_field(&created, "schoolId"),
        admin_email: admin_email.to_string(),
        admin_password: "admin-pass".to_string(),
    }
}

pub fn create_class(s: &mut Sidecar, school_id: &str, name: &str) -> String {
    let created = s.request_ok(
        "classes.create",
        json!({ "schoolId": school_id, "name": name }),
    );
    str_field(&created, "classId")
}

pub fn create_student(s: &mut Sidecar, class_id: &str, first: &str, last: &str, extra: Value) -> String {
    let mut params = json!({ "classId": class_id, "firstName": first, "lastName": last });
    if let (Some(obj), Some(more)) = (params.as_object_mut(), extra.as_object()) {
        for (k, v) in more {
            obj.insert(k.clone(), v.clone());
        }
    }
    let created = s.request_ok("students.create", params);
    str_field(&created, "studentId")
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub body: String,
}

impl Recorded {
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap_or(Value::Null)
    }
}

/// Loopback HTTP server answering every request through `respond`.
pub struct FakeHttp {
    pub base: String,
    pub requests: Arc<Mutex<Vec<Recorded>>>,
}

impl FakeHttp {
    pub fn start(respond: fn(&Recorded) -> (u16, Value)) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake http");
        let base = format!("http://{}", listener.local_addr().expect("local addr"));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                serve_one(stream, respond, &seen);
            }
        });
        Self { base, requests }
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.requests.lock().expect("lock").clone()
    }
}

// Records the request before answering so callers never race the log.
fn serve_one(
    stream: TcpStream,
    respond: fn(&Recorded) -> (u16, Value),
    seen: &Mutex<Vec<Recorded>>,
) -> Option<()> {
    let mut reader = BufReader::new(stream.try_clone().ok()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).ok()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut content_length = 0usize;
    let mut authorization = None;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).ok()?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            match name.trim().to_ascii_lowercase().as_str() {
                "content-length" => content_length = value.trim().parse().unwrap_or(0),
                "authorization" => authorization = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).ok()?;

    let rec = Recorded {
        method,
        path,
        authorization,
        body: String::from_utf8_lossy(&body).to_string(),
    };
    let (status, payload) = respond(&rec);
    let payload = payload.to_string();
    seen.lock().ok()?.push(rec);
    let mut stream = stream;
    let _ = write!(
        stream,
        "HTTP/1.1 {} Fake\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        payload.len(),
        payload
    );
    let _ = stream.flush();
    Some(())
}
