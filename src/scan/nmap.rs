use crate::model::{RunStats, ScanReport};
use crate::options::ScanOptions;
use crate::parser;
use crate::scanner::Scanner;
use crate::types::ScanRequest;
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub const NMAP_PATH_ENV: &str = "NSCAN_NMAP_PATH";
const DEFAULT_EXECUTABLE: &str = "nmap";
const MAX_STDERR_LOG_LEN: usize = 2000;
const VERSION_TIMEOUT: Duration = Duration::from_secs(10);
const KILL_GRACE: Duration = Duration::from_millis(250);
const READ_CHUNK: usize = 8192;

static VERSION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)nmap version (\S+)").expect("version pattern is valid")
});

/// Locate the scanner executable: explicit path, then `NSCAN_NMAP_PATH`, then `PATH`
pub fn resolve_executable(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        log::debug!("[scan::nmap] resolve_executable: source=explicit path={}", path.display());
        if !path.is_file() {
            eyre::bail!("Scanner executable not found: {}", path.display());
        }
        return Ok(path.to_path_buf());
    }

    if let Some(path) = std::env::var_os(NMAP_PATH_ENV).filter(|p| !p.is_empty()) {
        let path = PathBuf::from(path);
        log::debug!("[scan::nmap] resolve_executable: source=env path={}", path.display());
        if !path.is_file() {
            eyre::bail!("Scanner executable from {} not found: {}", NMAP_PATH_ENV, path.display());
        }
        return Ok(path);
    }

    let search_path = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&search_path)
        .map(|dir| dir.join(DEFAULT_EXECUTABLE))
        .find(|candidate| candidate.is_file())
        .inspect(|path| log::debug!("[scan::nmap] resolve_executable: source=PATH path={}", path.display()))
        .ok_or_else(|| eyre::eyre!("Could not find '{}' on PATH; install it or pass --nmap-path", DEFAULT_EXECUTABLE))
}

pub struct NmapScanner {
    executable: PathBuf,
    timeout: Option<Duration>,
}

impl NmapScanner {
    pub fn new(executable: PathBuf, timeout: Option<Duration>) -> Self {
        log::debug!("[scan::nmap] new: executable={} timeout={:?}", executable.display(), timeout);
        Self { executable, timeout }
    }

    /// Resolve the executable the usual way and build a scanner around it
    pub fn locate(explicit: Option<&Path>, timeout: Option<Duration>) -> Result<Self> {
        Ok(Self::new(resolve_executable(explicit)?, timeout))
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Ask the executable for its version number. Bounded by the scan
    /// timeout when that is shorter.
    pub async fn version(&self) -> Result<String> {
        let limit = self.timeout.map_or(VERSION_TIMEOUT, |t| t.min(VERSION_TIMEOUT));
        let mut command = Command::new(&self.executable);
        command.arg("--version").stdin(Stdio::null()).kill_on_drop(true);

        let output = tokio::time::timeout(limit, command.output())
            .await
            .map_err(|_| eyre::eyre!("{} --version did not finish within {}s",
                self.executable.display(), limit.as_secs_f64()))?
            .wrap_err_with(|| format!("Failed to execute {}", self.executable.display()))?;

        if !output.status.success() {
            eyre::bail!("{} --version exited with {}", self.executable.display(), output.status);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_version(&stdout)
            .ok_or_else(|| eyre::eyre!("Could not find version in output: {}", stdout.trim()))
    }

    async fn execute(&self, args: &[String]) -> Result<Execution> {
        log::debug!("[scan::nmap] execute: executable={} args={}", self.executable.display(), args.join(" "));

        let command_start = Instant::now();
        let mut child = Command::new(&self.executable)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .wrap_err_with(|| format!("Failed to execute {}", self.executable.display()))?;

        let stdout = PipeReader::spawn(child.stdout.take().ok_or_else(|| eyre::eyre!("Scanner stdout was not captured"))?);
        let stderr = PipeReader::spawn(child.stderr.take().ok_or_else(|| eyre::eyre!("Scanner stderr was not captured"))?);

        let status = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    log::error!("[scan::nmap] command_timed_out: limit={}s", limit.as_secs_f64());
                    if let Err(e) = child.kill().await {
                        log::warn!("[scan::nmap] kill_failed: error={}", e);
                    }
                    // Keep whatever the scanner wrote before it was stopped
                    let stdout = stdout.collect(Some(KILL_GRACE)).await?;
                    let stderr = stderr.collect(Some(KILL_GRACE)).await?;
                    if !stderr.is_empty() {
                        log::warn!("[scan::nmap] command_stderr: {}",
                            truncate(String::from_utf8_lossy(&stderr).trim(), MAX_STDERR_LOG_LEN));
                    }
                    return Ok(Execution::TimedOut { limit, stdout });
                }
            },
            None => child.wait().await,
        }
        .wrap_err("Failed to wait for scanner process")?;

        let stdout = stdout.collect(None).await?;
        let stderr = stderr.collect(None).await?;
        let command_duration = command_start.elapsed();
        let stderr = String::from_utf8_lossy(&stderr);

        if !status.success() {
            log::error!("[scan::nmap] command_unsuccessful: duration={}ms status={} stderr={}",
                command_duration.as_millis(), status, truncate(stderr.trim(), MAX_STDERR_LOG_LEN));
            eyre::bail!("Scanner exited with {}: {}", status, stderr.trim());
        }
        if !stderr.trim().is_empty() {
            log::warn!("[scan::nmap] command_stderr: {}", truncate(stderr.trim(), MAX_STDERR_LOG_LEN));
        }

        log::trace!("[scan::nmap] command_completed: duration={}ms status={} output_len={}",
            command_duration.as_millis(), status, stdout.len());

        let xml = String::from_utf8(stdout).wrap_err("Invalid UTF-8 in scanner output")?;
        Ok(Execution::Finished(xml))
    }

    /// Parse what a timed-out scan managed to write. Hosts completed before the
    /// deadline are kept and the report is marked incomplete.
    fn salvage(limit: Duration, stdout: &[u8]) -> Result<ScanReport> {
        let timed_out = || eyre::eyre!("Scanner did not finish within {}s", limit.as_secs_f64());

        let xml = String::from_utf8_lossy(stdout);
        if !xml.contains("<nmaprun") {
            return Err(timed_out());
        }
        match parser::parse_report(&xml) {
            Ok(mut report) => {
                report.stats.exit = RunStats::INCOMPLETE.to_string();
                log::warn!("[scan::nmap] partial_report_salvaged: limit={}s hosts={}",
                    limit.as_secs_f64(), report.hosts.len());
                Ok(report)
            }
            Err(e) => {
                log::debug!("[scan::nmap] partial_report_unusable: error={:#}", e);
                Err(timed_out())
            }
        }
    }
}

enum Execution {
    Finished(String),
    TimedOut { limit: Duration, stdout: Vec<u8> },
}

/// Drains a child pipe in the background so partial output survives a kill
struct PipeReader {
    buffer: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<std::io::Result<()>>,
}

impl PipeReader {
    fn spawn<R: AsyncRead + Unpin + Send + 'static>(mut pipe: R) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let handle = tokio::spawn(async move {
            let mut chunk = [0u8; READ_CHUNK];
            loop {
                let read = pipe.read(&mut chunk).await?;
                if read == 0 {
                    return Ok(());
                }
                sink.lock().await.extend_from_slice(&chunk[..read]);
            }
        });
        Self { buffer, handle }
    }

    /// Wait for end of stream, or at most `grace` before giving up on it
    async fn collect(self, grace: Option<Duration>) -> Result<Vec<u8>> {
        let mut handle = self.handle;
        match grace {
            None => handle.await
                .wrap_err("Output reader task failed")?
                .wrap_err("Failed to read scanner output")?,
            Some(limit) => {
                // A grandchild may still hold the pipe open after the kill
                if tokio::time::timeout(limit, &mut handle).await.is_err() {
                    handle.abort();
                }
            }
        }
        let mut buffer = self.buffer.lock().await;
        Ok(std::mem::take(&mut *buffer))
    }
}

#[async_trait]
impl Scanner for NmapScanner {
    fn name(&self) -> &'static str {
        "nmap"
    }

    fn command_line(&self, request: &ScanRequest) -> Result<Vec<String>> {
        let input_list = ScanOptions::needs_input_list(&request.scope).then(|| PathBuf::from("<input-list>"));
        let mut line = vec![self.executable.display().to_string()];
        line.extend(request.options.to_args(&request.scope, input_list.as_deref())?);
        Ok(line)
    }

    async fn scan(&self, request: &ScanRequest) -> Result<ScanReport> {
        log::debug!("[scan::nmap] scan: targets={} hosts={}",
            request.scope.display_name(), request.scope.host_count());

        if request.options.requires_root() && !nix::unistd::geteuid().is_root() {
            log::warn!("[scan::nmap] not_root: requested scan type or OS detection usually needs root privileges");
        }

        let input_list = if ScanOptions::needs_input_list(&request.scope) {
            let mut file = tempfile::Builder::new()
                .prefix("nscan-targets-")
                .suffix(".txt")
                .tempfile()
                .wrap_err("Failed to create input-list file")?;
            request.scope.write_to(file.as_file_mut())?;
            log::debug!("[scan::nmap] input_list: path={} targets={}", file.path().display(), request.scope.len());
            Some(file)
        } else {
            None
        };

        // The input-list file lives until the scanner has exited
        let args = request.options.to_args(&request.scope, input_list.as_ref().map(|f| f.path()));
        let result = match args {
            Ok(args) => self.execute(&args).await,
            Err(e) => Err(e),
        };
        drop(input_list);

        let context = || format!("Failed to scan {}", request.scope.display_name());
        let report = match result.wrap_err_with(context)? {
            Execution::Finished(xml) => parser::parse_report(&xml)?,
            Execution::TimedOut { limit, stdout } => Self::salvage(limit, &stdout).wrap_err_with(context)?,
        };
        if !report.stats.is_complete() {
            log::warn!("[scan::nmap] incomplete_report: hosts={}", report.hosts.len());
        }
        Ok(report)
    }
}

fn parse_version(output: &str) -> Option<String> {
    VERSION_LINE.captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use crate::target::TargetScope;
    use crate::types::ScanStatus;

    const FAKE_REPORT: &str = r#"<?xml version="1.0"?>
<!DOCTYPE nmaprun>
<nmaprun scanner="nmap" args="nmap -oX - 127.0.0.1" start="1700000000" version="7.94" xmloutputversion="1.05">
<host><status state="up" reason="localhost-response"/><address addr="127.0.0.1" addrtype="ipv4"/>
<ports><port protocol="tcp" portid="22"><state state="open" reason="syn-ack"/><service name="ssh"/></port></ports>
</host>
<runstats><finished time="1700000001" elapsed="0.10" exit="success"/><hosts up="1" down="0" total="1"/></runstats>
</nmaprun>"#;

    #[cfg(unix)]
    fn fake_scanner(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-nmap");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn request(targets: &[&str]) -> ScanRequest {
        ScanRequest::new(TargetScope::parse_many(targets).unwrap(), ScanOptions::new())
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("Nmap version 7.94 ( https://nmap.org )\nPlatform: x86_64").as_deref(), Some("7.94"));
        assert_eq!(parse_version("something else"), None);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("ab", 3), "ab");
        assert_eq!(truncate("ééé", 2), "éé");
    }

    #[test]
    fn test_resolve_explicit_missing() {
        let err = resolve_executable(Some(Path::new("/nonexistent/nmap"))).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/nmap"));
    }

    #[test]
    fn test_command_line() {
        let scanner = NmapScanner::new(PathBuf::from("/usr/bin/nmap"), None);
        let line = scanner.command_line(&request(&["10.0.0.1", "10.0.0.2"])).unwrap();
        assert_eq!(line, vec!["/usr/bin/nmap", "-oX", "-", "10.0.0.1", "10.0.0.2"]);

        let many: Vec<String> = (1..=100).map(|i| format!("10.0.2.{}", i)).collect();
        let big = ScanRequest::new(TargetScope::parse_many(&many).unwrap(), ScanOptions::new());
        let line = scanner.command_line(&big).unwrap();
        assert_eq!(&line[3..], ["-iL", "<input-list>"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scan_parses_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_scanner(dir.path(), &format!("cat <<'EOF'\n{}\nEOF", FAKE_REPORT));
        let scanner = NmapScanner::new(exe, Some(Duration::from_secs(10)));

        let report = scanner.scan(&request(&["127.0.0.1"])).await.unwrap();
        assert_eq!(report.hosts.len(), 1);
        assert_eq!(report.open_port_count(), 1);
        assert!(report.stats.is_complete());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scan_passes_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let args_file = dir.path().join("args.txt");
        let body = format!("echo \"$@\" > {}\ncat <<'EOF'\n{}\nEOF", args_file.display(), FAKE_REPORT);
        let scanner = NmapScanner::new(fake_scanner(dir.path(), &body), None);

        scanner.scan(&request(&["127.0.0.1", "localhost"])).await.unwrap();
        let recorded = std::fs::read_to_string(&args_file).unwrap();
        assert_eq!(recorded.trim(), "-oX - 127.0.0.1 localhost");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scan_uses_input_list_for_large_scopes() {
        let dir = tempfile::tempdir().unwrap();
        let copy = dir.path().join("targets-copy.txt");
        // The list file is removed after the run, so keep a copy of it
        let body = format!("cp \"$4\" {}\ncat <<'EOF'\n{}\nEOF", copy.display(), FAKE_REPORT);
        let scanner = NmapScanner::new(fake_scanner(dir.path(), &body), None);

        let many: Vec<String> = (1..=70).map(|i| format!("10.0.3.{}", i)).collect();
        let big = ScanRequest::new(TargetScope::parse_many(&many).unwrap(), ScanOptions::new());
        scanner.scan(&big).await.unwrap();

        let listed = TargetScope::from_file(&copy).unwrap();
        assert_eq!(listed.len(), 70);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scan_reports_failure_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_scanner(dir.path(), "echo 'Failed to resolve \"nowhere\"' >&2\nexit 1");
        let scanner = NmapScanner::new(exe, None);

        let err = scanner.scan(&request(&["nowhere"])).await.unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("Failed to scan nowhere"));
        assert!(message.contains("Failed to resolve"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scan_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_scanner(dir.path(), "sleep 5");
        let scanner = NmapScanner::new(exe, Some(Duration::from_millis(100)));

        let started = Instant::now();
        let err = scanner.scan(&request(&["10.0.0.1"])).await.unwrap_err();
        assert!(format!("{:#}", err).contains("did not finish"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scan_timeout_keeps_finished_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let partial = FAKE_REPORT.split("<runstats>").next().unwrap();
        let exe = fake_scanner(dir.path(), &format!("cat <<'EOF'\n{}\nEOF\nexec sleep 5", partial));
        let scanner = NmapScanner::new(exe, Some(Duration::from_millis(500)));

        let started = Instant::now();
        let report = scanner.scan(&request(&["127.0.0.1"])).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(report.hosts.len(), 1);
        assert_eq!(report.open_port_count(), 1);
        assert!(!report.stats.is_complete());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scan_rejects_invalid_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_scanner(dir.path(), "printf '\\377\\376'");
        let scanner = NmapScanner::new(exe, None);

        let err = scanner.scan(&request(&["10.0.0.1"])).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid UTF-8"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scan_rejects_non_xml_output() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_scanner(dir.path(), "echo 'Starting Nmap 7.94'");
        let scanner = NmapScanner::new(exe, None);

        assert!(scanner.scan(&request(&["10.0.0.1"])).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_version() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_scanner(dir.path(), "echo 'Nmap version 7.95 ( https://nmap.org )'");
        let scanner = NmapScanner::new(exe, None);

        assert_eq!(scanner.version().await.unwrap(), "7.95");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_version_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_scanner(dir.path(), "exec sleep 5");
        let scanner = NmapScanner::new(exe, Some(Duration::from_millis(200)));

        let started = Instant::now();
        let err = scanner.version().await.unwrap_err();
        assert!(err.to_string().contains("did not finish"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_from_env() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_scanner(dir.path(), "exit 0");
        let missing = dir.path().join("missing-nmap");

        // Only this test touches NSCAN_NMAP_PATH
        unsafe { std::env::set_var(NMAP_PATH_ENV, &exe) };
        assert_eq!(resolve_executable(None).unwrap(), exe);

        let other = tempfile::tempdir().unwrap();
        let explicit = fake_scanner(other.path(), "exit 0");
        assert_eq!(resolve_executable(Some(&explicit)).unwrap(), explicit);

        unsafe { std::env::set_var(NMAP_PATH_ENV, &missing) };
        let err = resolve_executable(None).unwrap_err();
        assert!(err.to_string().contains(NMAP_PATH_ENV));
        assert!(err.to_string().contains("missing-nmap"));

        unsafe { std::env::remove_var(NMAP_PATH_ENV) };
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_records_into_session() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_scanner(dir.path(), &format!("cat <<'EOF'\n{}\nEOF", FAKE_REPORT));
        let scanner = NmapScanner::new(exe, None);
        let mut session = Session::new(None);

        scanner.run(&request(&["127.0.0.1"]), &mut session).await.unwrap();
        let record = session.latest().unwrap();
        assert_eq!(record.status, ScanStatus::Complete);
        assert_eq!(session.hosts().len(), 1);
    }
}
