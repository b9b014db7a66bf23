use crate::infrastructure::{Ctx, HttpResponse};
use anyhow::Result;
use reqwest::blocking::Client;
use std::collections::{HashMap, VecDeque};
use std::ffi::OsStr;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct CommandKey {
    program: String,
    args: Vec<String>,
}

/// A streamed subprocess launch, as seen by the runner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub path_env: String,
}

#[derive(Default)]
pub struct Hooks {
    run_output: HashMap<CommandKey, VecDeque<Output>>,
    commands: Vec<RecordedCommand>,
    which: HashMap<String, Option<PathBuf>>,
    http: HashMap<String, VecDeque<Result<MockResponse, String>>>,
    http_requests: Vec<String>,
    http_headers: Vec<Vec<(String, String)>>,
    http_mocking_enabled: bool,
    home_dir: Option<Option<PathBuf>>,
    data_local_dir: Option<Option<PathBuf>>,
    env_vars: HashMap<String, Option<String>>,
    write_error: bool,
    sleep: Vec<Duration>,
}

static HOOKS: OnceLock<Mutex<Hooks>> = OnceLock::new();
static HOOKS_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn hooks() -> MutexGuard<'static, Hooks> {
    HOOKS
        .get_or_init(|| Mutex::new(Hooks::default()))
        .lock()
        .unwrap_or_else(|err| err.into_inner())
}

fn command_key(program: &str, args: &[String]) -> CommandKey {
    CommandKey {
        program: program.to_string(),
        args: args.to_vec(),
    }
}

pub fn reset_hooks() {
    *hooks() = Hooks::default();
}

/// Serializes tests that touch the process-global hooks and clears them.
pub fn reset_guard() -> MutexGuard<'static, ()> {
    let lock = HOOKS_LOCK.get_or_init(|| Mutex::new(()));
    let guard = lock.lock().unwrap_or_else(|err| err.into_inner());
    reset_hooks();
    guard
}

pub fn set_run_output(program: &str, args: &[&str], output: Output) {
    let args_vec = args.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    hooks()
        .run_output
        .entry(command_key(program, &args_vec))
        .or_default()
        .push_back(output);
}

pub fn take_run_output(program: &str, args: &[String]) -> Option<Output> {
    let key = command_key(program, args);
    hooks().run_output.get_mut(&key).and_then(|q| q.pop_front())
}

pub fn record_command(program: &str, args: &[String], cwd: &Path, path_env: &OsStr) {
    hooks().commands.push(RecordedCommand {
        program: program.to_string(),
        args: args.to_vec(),
        cwd: cwd.to_path_buf(),
        path_env: path_env.to_string_lossy().to_string(),
    });
}

pub fn recorded_commands() -> Vec<RecordedCommand> {
    hooks().commands.clone()
}

pub fn set_which(bin: &str, path: Option<PathBuf>) {
    hooks().which.insert(bin.to_string(), path);
}

pub fn which_override(bin: &str) -> Option<Option<PathBuf>> {
    hooks().which.get(bin).cloned()
}

pub fn set_http_plan(url: &str, plan: Vec<Result<MockResponse, String>>) {
    let mut hooks = hooks();
    hooks.http_mocking_enabled = true;
    hooks.http.insert(url.to_string(), plan.into());
}

/// Routes every request through the hooks, so unplanned URLs fail instead of
/// reaching the network.
pub fn enable_http_mocking() {
    hooks().http_mocking_enabled = true;
}

pub fn http_mocking_enabled() -> bool {
    hooks().http_mocking_enabled
}

pub fn record_http_request(url: &str, headers: &[(&str, String)]) {
    let mut hooks = hooks();
    hooks.http_requests.push(url.to_string());
    hooks.http_headers.push(
        headers
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect(),
    );
}

pub fn http_requests() -> Vec<String> {
    hooks().http_requests.clone()
}

/// Headers sent with each recorded request, in request order.
pub fn http_request_headers() -> Vec<Vec<(String, String)>> {
    hooks().http_headers.clone()
}

pub fn next_http_response(url: &str) -> Option<Result<Box<dyn HttpResponse>>> {
    let mut hooks = hooks();
    let plan = hooks.http.get_mut(url)?;
    let next = plan
        .pop_front()
        .unwrap_or_else(|| Err("no test response left".into()));
    Some(
        next.map(|resp| Box::new(resp) as Box<dyn HttpResponse>)
            .map_err(anyhow::Error::msg),
    )
}

pub fn set_home_dir(path: Option<PathBuf>) {
    hooks().home_dir = Some(path);
}

pub fn home_dir_override() -> Option<Option<PathBuf>> {
    hooks().home_dir.clone()
}

pub fn set_data_local_dir(path: Option<PathBuf>) {
    hooks().data_local_dir = Some(path);
}

pub fn data_local_dir_override() -> Option<Option<PathBuf>> {
    hooks().data_local_dir.clone()
}

pub fn set_env_var(key: &str, value: Option<String>) {
    hooks().env_vars.insert(key.to_string(), value);
}

pub fn env_var_override(key: &str) -> Option<Option<String>> {
    hooks().env_vars.get(key).cloned()
}

/// Swallows backoff sleeps while HTTP is mocked; real runs sleep.
pub fn record_sleep(duration: Duration) -> bool {
    let mut hooks = hooks();
    if !hooks.http_mocking_enabled {
        return false;
    }
    hooks.sleep.push(duration);
    true
}

pub fn sleep_calls() -> Vec<Duration> {
    hooks().sleep.clone()
}

pub fn set_write_error(enabled: bool) {
    hooks().write_error = enabled;
}

pub fn force_write_error() -> bool {
    hooks().write_error
}

pub struct MockResponse {
    cursor: Cursor<Vec<u8>>,
    len: Option<u64>,
}

impl MockResponse {
    pub fn new(bytes: Vec<u8>, len: Option<u64>) -> Self {
        Self {
            cursor: Cursor::new(bytes),
            len,
        }
    }

    pub fn body(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        let len = bytes.len() as u64;
        Self::new(bytes, Some(len))
    }
}

impl Read for MockResponse {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl HttpResponse for MockResponse {
    fn content_length(&self) -> Option<u64> {
        self.len
    }
}

pub fn output_with_status(code: i32, stdout: &[u8], stderr: &[u8]) -> Output {
    Output {
        status: exit_status(code),
        stdout: stdout.to_vec(),
        stderr: stderr.to_vec(),
    }
}

#[cfg(unix)]
fn exit_status(code: i32) -> std::process::ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    std::process::ExitStatus::from_raw(code << 8)
}

#[cfg(windows)]
fn exit_status(code: i32) -> std::process::ExitStatus {
    use std::os::windows::process::ExitStatusExt;
    std::process::ExitStatus::from_raw(code as u32)
}

pub fn base_ctx(profile_home: PathBuf, cache_root: PathBuf) -> Ctx {
    let http = Client::builder()
        .timeout(Duration::from_secs(1))
        .build()
        .expect("build http client");
    Ctx {
        http,
        workspace: profile_home.clone(),
        profile_home,
        cache_root,
        os: "linux".to_string(),
        arch: "x86_64".to_string(),
        stderr_is_tty: false,
        quiet: true,
        verbose: 0,
        no_progress: true,
        offline: false,
        retries: 0,
        timeout: 1,
        json: false,
        github_actions: false,
        github_path: None,
        github_output: None,
        json_emitted: Arc::new(std::sync::atomic::AtomicBool::new(false)),
    }
}
