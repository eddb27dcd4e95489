//! # Fetcher: Remote Log Retrieval
//!
//! Locates the active log file on the game server's file host and returns its
//! full text. The fetcher never touches cursor state; a failed fetch simply
//! leaves the stream where it was for the next cycle.
//!
//! ## Discovery
//!
//! Candidate directories are tried in order. In each, a configured fixed file
//! name wins; otherwise the newest name (names embed timestamps, so the
//! lexicographically greatest) with the highest-priority extension is picked.
//! Names containing `crash` are never picked.
//!
//! ## Transport
//!
//! [`RemoteConnector`] and [`RemoteSession`] are the seam between discovery
//! and the wire. [`FtpConnector`] speaks FTP over explicit TLS by default and
//! only drops to plaintext when `allow_insecure_fallback` is set for the
//! stream. The protocol client is blocking, so each attempt runs on the
//! blocking pool.
//!
//! ## Retry
//!
//! Transient failures (timeouts, connection errors) are retried up to
//! `fetch.max_attempts` times, sleeping `base_delay * attempt` in between.
//! Authentication, TLS and not-found failures are returned immediately.

use crate::config::{FetchConfig, StreamConfig};
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;
use suppaftp::native_tls::TlsConnector;
use suppaftp::types::FtpError;
use suppaftp::{FtpStream, NativeTlsConnector, NativeTlsFtpStream, Status};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("authentication failed: {0}")]
    AuthFailure(String),
    #[error("log file not found: {0}")]
    NotFound(String),
    #[error("network timeout: {0}")]
    NetworkTimeout(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("tls error: {0}")]
    Tls(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::NetworkTimeout(_) | FetchError::Network(_))
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::AuthFailure(_) => "auth",
            FetchError::NotFound(_) => "not_found",
            FetchError::NetworkTimeout(_) => "timeout",
            FetchError::Network(_) => "network",
            FetchError::Tls(_) => "tls",
        }
    }
}

/// Full text of the active log file and where it was found.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedLog {
    pub remote_path: String,
    pub text: String,
}

/// An open, authenticated session on the file host.
pub trait RemoteSession: Send {
    /// File names in `dir` (`""` is the login directory).
    fn list(&mut self, dir: &str) -> Result<Vec<String>, FetchError>;
    fn retrieve(&mut self, path: &str) -> Result<Vec<u8>, FetchError>;
    fn close(self: Box<Self>);
}

pub trait RemoteConnector: Send + Sync {
    fn connect(
        &self,
        stream: &StreamConfig,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, FetchError>;
}

// ── Discovery ───────────────────────────────────────────────────

fn basename(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Choose the log file among a directory listing.
pub fn pick_log_file<'a>(
    names: &'a [String],
    file_name: Option<&str>,
    extensions: &[String],
) -> Option<&'a str> {
    if let Some(fixed) = file_name {
        return names
            .iter()
            .map(|n| basename(n))
            .find(|n| *n == fixed);
    }
    for ext in extensions {
        let ext = ext.to_ascii_lowercase();
        let newest = names
            .iter()
            .map(|n| basename(n))
            .filter(|n| {
                let lower = n.to_ascii_lowercase();
                lower.ends_with(&ext) && !lower.contains("crash")
            })
            .max();
        if newest.is_some() {
            return newest;
        }
    }
    None
}

fn join_path(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

fn locate_and_read(
    session: &mut dyn RemoteSession,
    stream: &StreamConfig,
) -> Result<FetchedLog, FetchError> {
    for dir in &stream.directories {
        let names = match session.list(dir) {
            Ok(names) => names,
            Err(FetchError::NotFound(_)) => {
                debug!(stream = %stream.name, dir = %dir, "directory not present");
                continue;
            }
            Err(e) => return Err(e),
        };
        if let Some(name) = pick_log_file(&names, stream.file_name.as_deref(), &stream.extensions)
        {
            let remote_path = join_path(dir, name);
            let bytes = session.retrieve(&remote_path)?;
            return Ok(FetchedLog {
                remote_path,
                text: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
    }
    Err(FetchError::NotFound(format!(
        "no matching log in [{}]",
        stream.directories.join(", ")
    )))
}

fn fetch_once(
    connector: &dyn RemoteConnector,
    stream: &StreamConfig,
    timeout: Duration,
) -> Result<FetchedLog, FetchError> {
    let mut session = connector.connect(stream, timeout)?;
    let result = locate_and_read(session.as_mut(), stream);
    session.close();
    result
}

/// Retrying front end over a [`RemoteConnector`].
#[derive(Clone)]
pub struct Fetcher {
    connector: Arc<dyn RemoteConnector>,
    policy: FetchConfig,
}

impl Fetcher {
    pub fn new(connector: Arc<dyn RemoteConnector>, policy: FetchConfig) -> Self {
        Fetcher { connector, policy }
    }

    pub async fn fetch(&self, stream: &StreamConfig) -> Result<FetchedLog, FetchError> {
        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let connector = Arc::clone(&self.connector);
            let config = stream.clone();
            let timeout = self.policy.connect_timeout();
            let result =
                tokio::task::spawn_blocking(move || fetch_once(connector.as_ref(), &config, timeout))
                    .await
                    .map_err(|e| FetchError::Network(format!("fetch task failed: {}", e)))?;

            match result {
                Ok(log) => return Ok(log),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.policy.base_delay() * attempt;
                    warn!(
                        stream = %stream.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ── FTP transport ───────────────────────────────────────────────

fn map_ftp_error(e: FtpError) -> FetchError {
    match e {
        FtpError::ConnectionError(io)
            if matches!(
                io.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ) =>
        {
            FetchError::NetworkTimeout(io.to_string())
        }
        FtpError::ConnectionError(io) => FetchError::Network(io.to_string()),
        FtpError::SecureError(msg) => FetchError::Tls(msg),
        FtpError::UnexpectedResponse(resp) => match resp.status {
            Status::NotLoggedIn => FetchError::AuthFailure(format!("{:?}", resp.status)),
            Status::FileUnavailable => FetchError::NotFound(format!("{:?}", resp.status)),
            other => FetchError::Network(format!("unexpected response {:?}", other)),
        },
        other => FetchError::Network(other.to_string()),
    }
}

enum FtpSession {
    Plain(FtpStream),
    Secure(NativeTlsFtpStream),
}

impl RemoteSession for FtpSession {
    fn list(&mut self, dir: &str) -> Result<Vec<String>, FetchError> {
        let path = if dir.is_empty() { None } else { Some(dir) };
        match self {
            FtpSession::Plain(s) => s.nlst(path),
            FtpSession::Secure(s) => s.nlst(path),
        }
        .map_err(map_ftp_error)
    }

    fn retrieve(&mut self, path: &str) -> Result<Vec<u8>, FetchError> {
        match self {
            FtpSession::Plain(s) => s.retr_as_buffer(path),
            FtpSession::Secure(s) => s.retr_as_buffer(path),
        }
        .map(|cursor| cursor.into_inner())
        .map_err(map_ftp_error)
    }

    fn close(self: Box<Self>) {
        let result = match *self {
            FtpSession::Plain(mut s) => s.quit(),
            FtpSession::Secure(mut s) => s.quit(),
        };
        if let Err(e) = result {
            debug!(error = %e, "ftp quit failed");
        }
    }
}

/// FTP / FTPS connector backed by `suppaftp`.
pub struct FtpConnector;

impl FtpConnector {
    fn resolve(stream: &StreamConfig) -> Result<std::net::SocketAddr, FetchError> {
        (stream.host.as_str(), stream.port)
            .to_socket_addrs()
            .map_err(|e| FetchError::Network(format!("cannot resolve {}: {}", stream.host, e)))?
            .next()
            .ok_or_else(|| FetchError::Network(format!("no address for {}", stream.host)))
    }

    fn connect_plain(
        stream: &StreamConfig,
        password: &str,
        timeout: Duration,
    ) -> Result<FtpSession, FetchError> {
        let addr = Self::resolve(stream)?;
        let mut ftp = FtpStream::connect_timeout(addr, timeout).map_err(map_ftp_error)?;
        ftp.get_ref()
            .set_read_timeout(Some(timeout))
            .map_err(|e| FetchError::Network(e.to_string()))?;
        ftp.login(stream.username.as_str(), password).map_err(map_ftp_error)?;
        Ok(FtpSession::Plain(ftp))
    }

    fn connect_secure(
        stream: &StreamConfig,
        password: &str,
        timeout: Duration,
    ) -> Result<FtpSession, FetchError> {
        let addr = Self::resolve(stream)?;
        let plain = NativeTlsFtpStream::connect_timeout(addr, timeout).map_err(map_ftp_error)?;
        plain
            .get_ref()
            .set_read_timeout(Some(timeout))
            .map_err(|e| FetchError::Network(e.to_string()))?;
        let tls = TlsConnector::new().map_err(|e| FetchError::Tls(e.to_string()))?;
        let mut ftp = plain
            .into_secure(NativeTlsConnector::from(tls), &stream.host)
            .map_err(map_ftp_error)?;
        ftp.login(stream.username.as_str(), password).map_err(map_ftp_error)?;
        Ok(FtpSession::Secure(ftp))
    }
}

impl RemoteConnector for FtpConnector {
    fn connect(
        &self,
        stream: &StreamConfig,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, FetchError> {
        let password = stream
            .password()
            .map_err(|e| FetchError::AuthFailure(e.to_string()))?;

        if !stream.use_tls {
            return Ok(Box::new(Self::connect_plain(stream, &password, timeout)?));
        }
        match Self::connect_secure(stream, &password, timeout) {
            Ok(session) => Ok(Box::new(session)),
            Err(FetchError::Tls(reason)) if stream.allow_insecure_fallback => {
                warn!(
                    stream = %stream.name,
                    reason = %reason,
                    "TLS negotiation failed, falling back to plaintext FTP"
                );
                Ok(Box::new(Self::connect_plain(stream, &password, timeout)?))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn exts() -> Vec<String> {
        vec![".ADM".to_string(), ".RPT".to_string()]
    }

    fn stream() -> StreamConfig {
        StreamConfig {
            name: "test".into(),
            host: "localhost".into(),
            port: 21,
            username: "u".into(),
            password_env: "UNUSED".into(),
            directories: vec!["missing".into(), "profile".into()],
            file_name: None,
            extensions: exts(),
            use_tls: true,
            allow_insecure_fallback: false,
            backfill: false,
        }
    }

    #[test]
    fn picks_newest_adm_over_rpt() {
        let listing = names(&[
            "DayZServer_2024_01_01.RPT",
            "DayZServer_2024_01_01.ADM",
            "DayZServer_2024_01_03.ADM",
            "DayZServer_2024_01_02.ADM",
        ]);
        assert_eq!(
            pick_log_file(&listing, None, &exts()),
            Some("DayZServer_2024_01_03.ADM")
        );
    }

    #[test]
    fn falls_back_to_rpt_and_skips_crash_files() {
        let listing = names(&["crash_2024.RPT", "server_2024.rpt", "notes.txt"]);
        assert_eq!(pick_log_file(&listing, None, &exts()), Some("server_2024.rpt"));
        let only_crash = names(&["crash_2024.ADM"]);
        assert_eq!(pick_log_file(&only_crash, None, &exts()), None);
    }

    #[test]
    fn fixed_name_wins_and_full_paths_are_trimmed() {
        let listing = names(&["profile/a.ADM", "profile/console.log"]);
        assert_eq!(
            pick_log_file(&listing, Some("console.log"), &exts()),
            Some("console.log")
        );
        assert_eq!(pick_log_file(&listing, None, &exts()), Some("a.ADM"));
    }

    #[test]
    fn join_handles_root_dir() {
        assert_eq!(join_path("", "a.ADM"), "a.ADM");
        assert_eq!(join_path("dayzxb/profile/", "a.ADM"), "dayzxb/profile/a.ADM");
    }

    #[test]
    fn ftp_error_mapping() {
        let timeout = FtpError::ConnectionError(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "slow",
        ));
        assert!(matches!(map_ftp_error(timeout), FetchError::NetworkTimeout(_)));
        let tls = FtpError::SecureError("handshake".into());
        assert_eq!(map_ftp_error(tls), FetchError::Tls("handshake".into()));
    }

    /// Minimal control channel: greets, asks for a password, then rejects it.
    fn rejecting_ftp_server() -> (u16, std::thread::JoinHandle<Vec<String>>) {
        use std::io::{BufRead, BufReader, Write};
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(sock.try_clone().unwrap());
            let mut seen = Vec::new();
            sock.write_all(b"220 ready\r\n").unwrap();
            for reply in ["331 password required\r\n", "530 login incorrect\r\n"] {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                seen.push(line.trim_end().to_string());
                sock.write_all(reply.as_bytes()).unwrap();
            }
            seen
        });
        (port, handle)
    }

    #[test]
    fn plain_login_rejection_is_an_auth_failure() {
        let (port, server) = rejecting_ftp_server();
        std::env::set_var("KILLFEED_TEST_FTP_PASSWORD", "hunter2");
        let mut cfg = stream();
        cfg.host = "127.0.0.1".into();
        cfg.port = port;
        cfg.username = "survivor".into();
        cfg.password_env = "KILLFEED_TEST_FTP_PASSWORD".into();
        cfg.use_tls = false;

        match FtpConnector.connect(&cfg, Duration::from_secs(5)) {
            Err(FetchError::AuthFailure(_)) => {}
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("login should have been rejected"),
        }
        let seen = server.join().unwrap();
        assert_eq!(seen, vec!["USER survivor", "PASS hunter2"]);
    }

    struct ScriptedSession {
        dirs: HashMap<String, Vec<String>>,
    }

    impl RemoteSession for ScriptedSession {
        fn list(&mut self, dir: &str) -> Result<Vec<String>, FetchError> {
            self.dirs
                .get(dir)
                .cloned()
                .ok_or_else(|| FetchError::NotFound(dir.to_string()))
        }

        fn retrieve(&mut self, path: &str) -> Result<Vec<u8>, FetchError> {
            Ok(format!("contents of {}\n", path).into_bytes())
        }

        fn close(self: Box<Self>) {}
    }

    struct FlakyConnector {
        failures_left: AtomicU32,
        error: FetchError,
        calls: AtomicU32,
        dirs: Mutex<HashMap<String, Vec<String>>>,
    }

    impl RemoteConnector for FlakyConnector {
        fn connect(
            &self,
            _stream: &StreamConfig,
            _timeout: Duration,
        ) -> Result<Box<dyn RemoteSession>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            Ok(Box::new(ScriptedSession {
                dirs: self.dirs.lock().unwrap().clone(),
            }))
        }
    }

    fn flaky(failures: u32, error: FetchError) -> Arc<FlakyConnector> {
        let mut dirs = HashMap::new();
        dirs.insert("profile".to_string(), names(&["x.ADM"]));
        Arc::new(FlakyConnector {
            failures_left: AtomicU32::new(failures),
            error,
            calls: AtomicU32::new(0),
            dirs: Mutex::new(dirs),
        })
    }

    fn fast_policy(max_attempts: u32) -> FetchConfig {
        FetchConfig {
            max_attempts,
            base_delay_ms: 1,
            connect_timeout_secs: 1,
        }
    }

    #[tokio::test]
    async fn discovery_skips_missing_directories() {
        let connector = flaky(0, FetchError::Network("unused".into()));
        let fetcher = Fetcher::new(connector, fast_policy(3));
        let log = fetcher.fetch(&stream()).await.unwrap();
        assert_eq!(log.remote_path, "profile/x.ADM");
        assert_eq!(log.text, "contents of profile/x.ADM\n");
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let connector = flaky(2, FetchError::NetworkTimeout("slow".into()));
        let fetcher = Fetcher::new(connector.clone(), fast_policy(3));
        assert!(fetcher.fetch(&stream()).await.is_ok());
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let connector = flaky(10, FetchError::Network("reset".into()));
        let fetcher = Fetcher::new(connector.clone(), fast_policy(3));
        assert!(matches!(
            fetcher.fetch(&stream()).await,
            Err(FetchError::Network(_))
        ));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let connector = flaky(10, FetchError::AuthFailure("530".into()));
        let fetcher = Fetcher::new(connector.clone(), fast_policy(3));
        assert!(matches!(
            fetcher.fetch(&stream()).await,
            Err(FetchError::AuthFailure(_))
        ));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn nothing_found_anywhere() {
        let connector = flaky(0, FetchError::Network("unused".into()));
        connector.dirs.lock().unwrap().clear();
        let fetcher = Fetcher::new(connector, fast_policy(1));
        assert!(matches!(
            fetcher.fetch(&stream()).await,
            Err(FetchError::NotFound(_))
        ));
    }
}
