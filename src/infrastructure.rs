use anyhow::{Context, Result, anyhow, bail};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use std::{
    env,
    ffi::OsStr,
    fs,
    io::{self, Read, Write},
    path::{Component, Path, PathBuf},
    process::{Command, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering as AtomicOrdering},
    },
    time::Duration,
};
use tempfile::NamedTempFile;

use crate::test_support;

#[derive(Clone)]
pub struct Ctx {
    pub http: Client,
    /// The user's profile directory, resolved once at startup.
    pub profile_home: PathBuf,
    pub cache_root: PathBuf,
    /// Base for relative input paths (`$GITHUB_WORKSPACE` or the cwd).
    pub workspace: PathBuf,
    pub os: String,
    pub arch: String,
    pub stderr_is_tty: bool,
    pub quiet: bool,
    pub verbose: u8,
    pub no_progress: bool,
    pub offline: bool,
    pub retries: u8,
    pub timeout: u64,
    pub json: bool,
    pub github_actions: bool,
    pub github_path: Option<PathBuf>,
    pub github_output: Option<PathBuf>,
    pub json_emitted: Arc<AtomicBool>,
}

pub fn info<S: AsRef<str>>(ctx: &Ctx, msg: S) {
    if !ctx.quiet && !ctx.json {
        println!("{}", msg.as_ref());
    }
}

pub fn warn<S: AsRef<str>>(ctx: &Ctx, msg: S) {
    if ctx.quiet || ctx.json {
        return;
    }
    if ctx.github_actions {
        eprintln!("::warning::{}", msg.as_ref());
    } else {
        eprintln!("warning: {}", msg.as_ref());
    }
}

pub fn debug<S: AsRef<str>>(ctx: &Ctx, msg: S) {
    if ctx.quiet || ctx.json || ctx.verbose == 0 {
        return;
    }
    if ctx.github_actions {
        eprintln!("::debug::{}", msg.as_ref());
    } else {
        eprintln!("debug: {}", msg.as_ref());
    }
}

pub fn error<S: AsRef<str>>(msg: S) {
    eprintln!("error: {}", msg.as_ref());
}

/// Marks the job step as failed. Under Actions this becomes an error annotation.
pub fn report_failure<S: AsRef<str>>(ctx: &Ctx, msg: S) {
    if ctx.github_actions {
        eprintln!("::error::{}", msg.as_ref());
    } else {
        error(msg);
    }
}

pub fn start_group<S: AsRef<str>>(ctx: &Ctx, title: S) {
    if ctx.github_actions && !ctx.quiet && !ctx.json {
        println!("::group::{}", title.as_ref());
    } else {
        info(ctx, title);
    }
}

pub fn end_group(ctx: &Ctx) {
    if ctx.github_actions && !ctx.quiet && !ctx.json {
        println!("::endgroup::");
    }
}

/// Directories published for later subprocess launches.
///
/// Append-only and order-sensitive; a directory already present is not added twice.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchPath {
    dirs: Vec<PathBuf>,
}

impl SearchPath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, dir: &Path) -> bool {
        if self.dirs.iter().any(|d| d == dir) {
            return false;
        }
        self.dirs.push(dir.to_path_buf());
        true
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// `base` followed by every published directory, in publication order.
    pub fn join_onto(&self, base: &str) -> Result<std::ffi::OsString> {
        let mut all: Vec<PathBuf> = env::split_paths(base)
            .filter(|p| !p.as_os_str().is_empty())
            .collect();
        all.extend(self.dirs.iter().cloned());
        env::join_paths(all).context("join PATH entries")
    }
}

/// Publishes `dir` for the current process and, under Actions, for later steps.
pub fn add_path(ctx: &Ctx, search_path: &mut SearchPath, dir: &Path) -> Result<()> {
    if !search_path.append(dir) {
        return Ok(());
    }
    debug(ctx, format!("Adding {} to PATH", dir.display()));
    if let Some(file) = &ctx.github_path {
        append_line(file, &dir.display().to_string())
            .with_context(|| format!("append to GITHUB_PATH {}", file.display()))?;
    }
    Ok(())
}

pub fn set_output(ctx: &Ctx, name: &str, value: &str) -> Result<()> {
    debug(ctx, format!("output {name}={value}"));
    match &ctx.github_output {
        Some(file) => append_line(file, &format!("{name}={value}"))
            .with_context(|| format!("append to GITHUB_OUTPUT {}", file.display())),
        None => {
            info(ctx, format!("{name}: {value}"));
            Ok(())
        }
    }
}

fn append_line(file: &Path, line: &str) -> io::Result<()> {
    let mut f = fs::OpenOptions::new().create(true).append(true).open(file)?;
    write_all_checked(&mut f, format!("{line}\n").as_bytes())
}

pub fn write_all_checked(writer: &mut dyn Write, bytes: &[u8]) -> io::Result<()> {
    if test_support::force_write_error() {
        return Err(io::Error::other("forced write error"));
    }
    writer.write_all(bytes)
}

/// Resolves `path` against the workspace and normalizes `.`/`..` components.
pub fn to_absolute_path(ctx: &Ctx, path: &str) -> Option<PathBuf> {
    if path.is_empty() {
        return None;
    }
    let raw = Path::new(path);
    let joined = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        ctx.workspace.join(raw)
    };
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Some(normalized)
}

/// Creates the parent of a file path, or the directory itself.
pub fn create_parents_if_needed(path: &Path, is_file: bool) -> Result<()> {
    let dir = if is_file {
        match path.parent() {
            Some(parent) => parent,
            None => return Ok(()),
        }
    } else {
        path
    };
    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))
}

pub fn home_dir() -> Option<PathBuf> {
    if let Some(result) = test_support::home_dir_override() {
        return result;
    }
    dirs::home_dir()
}

pub fn data_local_dir() -> Option<PathBuf> {
    if let Some(result) = test_support::data_local_dir_override() {
        return result;
    }
    dirs::data_local_dir()
}

pub fn get_env_var(key: &str) -> Option<String> {
    if let Some(result) = test_support::env_var_override(key) {
        return result;
    }
    env::var(key).ok()
}

pub fn progress_allowed(ctx: &Ctx) -> bool {
    !ctx.no_progress && !ctx.quiet && !ctx.json && ctx.stderr_is_tty
}

pub fn emit_json(ctx: &Ctx, value: serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    ctx.json_emitted.store(true, AtomicOrdering::Relaxed);
    Ok(())
}

pub fn print_json_error(command: &str, err: &anyhow::Error) {
    let payload = serde_json::json!({
        "command": command,
        "ok": false,
        "error": err.to_string(),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).unwrap_or_else(|_| "{}".into())
    );
}

pub fn run_output<S: AsRef<OsStr>>(program: S, args: &[S]) -> Result<std::process::Output> {
    {
        let program_str = program.as_ref().to_string_lossy().to_string();
        let args_vec = args
            .iter()
            .map(|s| s.as_ref().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        if let Some(out) = test_support::take_run_output(&program_str, &args_vec) {
            return Ok(out);
        }
    }

    Command::new(&program)
        .args(args.iter().map(|s| s.as_ref()))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("failed to run {:?}", program.as_ref()))
}

/// Runs `program` with inherited stdio, returning its exit code.
pub fn run_streaming(
    program: &Path,
    args: &[String],
    cwd: &Path,
    path_env: &OsStr,
) -> Result<i32> {
    let program_str = program.to_string_lossy().to_string();
    test_support::record_command(&program_str, args, cwd, path_env);
    if let Some(out) = test_support::take_run_output(&program_str, args) {
        return Ok(out.status.code().unwrap_or(1));
    }

    let status = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .env("PATH", path_env)
        .status()
        .with_context(|| format!("failed to run {}", program.display()))?;
    Ok(status.code().unwrap_or(1))
}

pub fn sleep_for(duration: Duration) {
    if test_support::record_sleep(duration) {
        return;
    }
    std::thread::sleep(duration);
}

pub fn which_or_none(bin: &str) -> Option<PathBuf> {
    if let Some(result) = test_support::which_override(bin) {
        return result;
    }
    which::which(bin).ok()
}

pub trait HttpResponse: Read {
    fn content_length(&self) -> Option<u64>;
}

pub enum MockAttempt {
    Handled(Option<Box<dyn HttpResponse>>),
    Skipped,
}

pub fn mock_http_attempt(
    url: &str,
    headers: &[(&str, String)],
    last_err: &mut Option<anyhow::Error>,
) -> MockAttempt {
    if !test_support::http_mocking_enabled() {
        return MockAttempt::Skipped;
    }
    test_support::record_http_request(url, headers);
    match test_support::next_http_response(url) {
        Some(Ok(r)) => MockAttempt::Handled(Some(r)),
        Some(Err(err)) => {
            *last_err = Some(err);
            MockAttempt::Handled(None)
        }
        None => {
            *last_err = Some(anyhow!("no test response for {url}"));
            MockAttempt::Handled(None)
        }
    }
}

struct ReqwestResponse {
    inner: reqwest::blocking::Response,
}

impl Read for ReqwestResponse {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl HttpResponse for ReqwestResponse {
    fn content_length(&self) -> Option<u64> {
        self.inner.content_length()
    }
}

fn handle_reqwest_response(
    resp: Result<reqwest::blocking::Response, reqwest::Error>,
    last_err: &mut Option<anyhow::Error>,
) -> Option<Box<dyn HttpResponse>> {
    match resp {
        Ok(r) => match r.error_for_status() {
            Ok(r) => Some(Box::new(ReqwestResponse { inner: r })),
            Err(err) => {
                *last_err = Some(err.into());
                None
            }
        },
        Err(err) => {
            *last_err = Some(err.into());
            None
        }
    }
}

fn http_get_inner(
    ctx: &Ctx,
    url: &str,
    headers: &[(&str, String)],
    timeout: Option<Duration>,
) -> Result<Box<dyn HttpResponse>> {
    if ctx.offline {
        bail!("offline mode enabled");
    }
    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 0..=ctx.retries {
        match mock_http_attempt(url, headers, &mut last_err) {
            MockAttempt::Handled(Some(resp)) => return Ok(resp),
            MockAttempt::Handled(None) => {}
            MockAttempt::Skipped => {
                let mut request = ctx.http.get(url);
                for (name, value) in headers {
                    request = request.header(*name, value);
                }
                if let Some(timeout) = timeout {
                    request = request.timeout(timeout);
                }
                if let Some(resp) = handle_reqwest_response(request.send(), &mut last_err) {
                    return Ok(resp);
                }
            }
        }
        if attempt < ctx.retries {
            sleep_for(retry_backoff(attempt));
        }
    }
    Err(anyhow!(
        "request failed after {} attempt(s): {}",
        u32::from(ctx.retries) + 1,
        last_err.unwrap_or_else(|| anyhow!("unknown error"))
    ))
}

const MAX_BACKOFF_MS: u64 = 30_000;

/// 250 ms doubled per attempt, capped at 30 s.
pub fn retry_backoff(attempt: u8) -> Duration {
    let factor = 2u64.checked_pow(attempt.into()).unwrap_or(u64::MAX);
    Duration::from_millis(250u64.saturating_mul(factor).min(MAX_BACKOFF_MS))
}

pub fn http_get(ctx: &Ctx, url: &str, headers: &[(&str, String)]) -> Result<Box<dyn HttpResponse>> {
    http_get_inner(ctx, url, headers, None)
}

pub fn http_get_no_timeout(ctx: &Ctx, url: &str) -> Result<Box<dyn HttpResponse>> {
    let long_timeout = ctx.timeout.saturating_mul(10).max(600);
    http_get_inner(ctx, url, &[], Some(Duration::from_secs(long_timeout)))
}

pub fn http_get_json<T: DeserializeOwned>(
    ctx: &Ctx,
    url: &str,
    headers: &[(&str, String)],
) -> Result<T> {
    let mut resp = http_get(ctx, url, headers)?;
    let mut buf = Vec::new();
    resp.read_to_end(&mut buf)?;
    serde_json::from_slice(&buf).with_context(|| format!("parse response from {url}"))
}

pub fn download_to_temp(ctx: &Ctx, url: &str) -> Result<NamedTempFile> {
    let mut resp = http_get_no_timeout(ctx, url)?;
    let mut tmp = NamedTempFile::new()?;
    let total = resp.content_length();
    let downloaded = match (progress_allowed(ctx), total) {
        (true, Some(total)) => {
            let pb =
                ProgressBar::with_draw_target(Some(total), ProgressDrawTarget::stderr_with_hz(10));
            let style = ProgressStyle::with_template(
                "[{bar:40.cyan/blue}] {percent:>3}% {bytes}/{total_bytes} {msg}",
            )?
            .progress_chars("=>-");
            pb.set_style(style);
            pb.set_message(format!("Downloading {url}"));
            let mut buf = [0u8; 1024 * 64];
            let mut downloaded = 0u64;
            loop {
                let n = resp.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                tmp.write_all(&buf[..n])?;
                downloaded += n as u64;
                pb.set_position(downloaded);
            }
            pb.finish_with_message("Downloaded");
            downloaded
        }
        (true, None) => {
            let pb = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr_with_hz(10));
            pb.set_style(
                ProgressStyle::with_template("{spinner} {msg}")?
                    .tick_strings(&["-", "\\", "|", "/"]),
            );
            pb.set_message(format!("Downloading {url}"));
            pb.enable_steady_tick(Duration::from_millis(80));
            let downloaded = io::copy(&mut resp, &mut tmp)?;
            pb.finish_with_message("Downloaded");
            downloaded
        }
        (false, _) => io::copy(&mut resp, &mut tmp)?,
    };

    if let Some(total) = total {
        if downloaded < total {
            bail!("download incomplete for {url}: expected {total} bytes, got {downloaded}");
        }
    }
    tmp.flush()?;
    Ok(tmp)
}

pub fn ensure_clean_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).with_context(|| format!("remove {}", dir.display()))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    Ok(())
}

#[cfg(test)]
mod unit_tests {
    use super::*;
    use crate::test_support::{MockResponse, base_ctx, reset_guard, set_http_plan, sleep_calls};
    use tempfile::tempdir;

    #[test]
    fn search_path_appends_once_in_order() {
        let mut sp = SearchPath::new();
        assert!(sp.append(Path::new("/a")));
        assert!(sp.append(Path::new("/b")));
        assert!(!sp.append(Path::new("/a")));
        assert_eq!(sp.dirs(), &[PathBuf::from("/a"), PathBuf::from("/b")]);
        let joined = sp.join_onto("/usr/bin").unwrap();
        assert_eq!(joined, std::ffi::OsString::from("/usr/bin:/a:/b"));
    }

    #[test]
    fn absolute_path_resolution() {
        let dir = tempdir().unwrap();
        let mut ctx = base_ctx(dir.path().join("home"), dir.path().join("cache"));
        ctx.workspace = PathBuf::from("/work/repo");
        assert_eq!(to_absolute_path(&ctx, ""), None);
        assert_eq!(
            to_absolute_path(&ctx, "flows/../flow.yaml"),
            Some(PathBuf::from("/work/repo/flow.yaml"))
        );
        assert_eq!(
            to_absolute_path(&ctx, "/tmp/./x"),
            Some(PathBuf::from("/tmp/x"))
        );
    }

    #[test]
    fn create_parents_for_file_and_dir() {
        let dir = tempdir().unwrap();
        let report = dir.path().join("out").join("report.xml");
        create_parents_if_needed(&report, true).unwrap();
        assert!(dir.path().join("out").is_dir());
        assert!(!report.exists());
        let shots = dir.path().join("shots");
        create_parents_if_needed(&shots, false).unwrap();
        assert!(shots.is_dir());
    }

    #[test]
    fn http_get_retries_with_backoff() {
        let _guard = reset_guard();
        let dir = tempdir().unwrap();
        let mut ctx = base_ctx(dir.path().join("home"), dir.path().join("cache"));
        ctx.retries = 2;
        let url = "https://example.com/flaky";
        set_http_plan(
            url,
            vec![
                Err("boom".into()),
                Err("boom".into()),
                Ok(MockResponse::new(b"ok".to_vec(), Some(2))),
            ],
        );
        let mut resp = http_get(&ctx, url, &[]).unwrap();
        let mut body = String::new();
        resp.read_to_string(&mut body).unwrap();
        assert_eq!(body, "ok");
        assert_eq!(
            sleep_calls(),
            vec![Duration::from_millis(250), Duration::from_millis(500)]
        );
    }

    #[test]
    fn backoff_is_capped_for_many_retries() {
        assert_eq!(retry_backoff(0), Duration::from_millis(250));
        assert_eq!(retry_backoff(7), Duration::from_millis(30_000));
        assert_eq!(retry_backoff(64), Duration::from_millis(30_000));
        assert_eq!(retry_backoff(u8::MAX), Duration::from_millis(30_000));

        let _guard = reset_guard();
        let dir = tempdir().unwrap();
        let mut ctx = base_ctx(dir.path().join("home"), dir.path().join("cache"));
        ctx.retries = 70;
        let url = "https://example.com/down";
        set_http_plan(url, vec![]);
        let err = http_get(&ctx, url, &[]).err().unwrap();
        assert!(err.to_string().contains("after 71 attempt(s)"));
        let sleeps = sleep_calls();
        assert_eq!(sleeps.len(), 70);
        assert_eq!(sleeps[69], Duration::from_millis(30_000));

        ctx.retries = u8::MAX;
        set_http_plan(url, vec![]);
        let err = http_get(&ctx, url, &[]).err().unwrap();
        assert!(err.to_string().contains("after 256 attempt(s)"));
    }

    #[test]
    fn download_rejects_truncated_body() {
        let _guard = reset_guard();
        let dir = tempdir().unwrap();
        let ctx = base_ctx(dir.path().join("home"), dir.path().join("cache"));
        let url = "https://example.com/short";
        set_http_plan(url, vec![Ok(MockResponse::new(vec![1, 2], Some(5)))]);
        let err = download_to_temp(&ctx, url).unwrap_err();
        assert!(err.to_string().contains("download incomplete"));
    }

    #[test]
    fn offline_refuses_requests() {
        let _guard = reset_guard();
        let dir = tempdir().unwrap();
        let mut ctx = base_ctx(dir.path().join("home"), dir.path().join("cache"));
        ctx.offline = true;
        let err = http_get(&ctx, "https://example.com", &[]).err().unwrap();
        assert!(err.to_string().contains("offline"));
    }

    #[test]
    fn github_path_and_output_files() {
        let _guard = reset_guard();
        let dir = tempdir().unwrap();
        let mut ctx = base_ctx(dir.path().join("home"), dir.path().join("cache"));
        let path_file = dir.path().join("gh_path");
        let output_file = dir.path().join("gh_output");
        ctx.github_path = Some(path_file.clone());
        ctx.github_output = Some(output_file.clone());
        let mut sp = SearchPath::new();
        add_path(&ctx, &mut sp, Path::new("/opt/maestro/bin")).unwrap();
        add_path(&ctx, &mut sp, Path::new("/opt/maestro/bin")).unwrap();
        set_output(&ctx, "report", "/tmp/report.xml").unwrap();
        assert_eq!(fs::read_to_string(&path_file).unwrap(), "/opt/maestro/bin\n");
        assert_eq!(
            fs::read_to_string(&output_file).unwrap(),
            "report=/tmp/report.xml\n"
        );
    }
}
