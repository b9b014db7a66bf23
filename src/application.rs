use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand};
use reqwest::{Certificate, blocking::Client};
use std::process::ExitCode;
use std::{
    env, fs, io,
    io::IsTerminal,
    path::PathBuf,
    sync::{Arc, atomic::Ordering as AtomicOrdering},
    time::Duration,
};

use crate::cache::InstallationCache;
use crate::domain::{InstallError, Platform, RunError, ToolKind, VersionRequest, VersionSpec};
use crate::infrastructure::{
    Ctx, SearchPath, data_local_dir, debug, emit_json, get_env_var, home_dir, info,
    print_json_error, report_failure, warn,
};
use crate::installer::{Installed, install};
use crate::locator::locate;
use crate::resolver::resolve;
use crate::runner::{TestInputs, TestOutcome, run_tests, split_env_lines};
use crate::tools::spec_for;

/// maestro-setup: provision Maestro (and idb_companion on macOS) in CI and run flows.
#[derive(Parser, Debug)]
#[command(name = "maestro-setup")]
#[command(disable_version_flag = true)]
#[command(
    about = "Install, cache and run Maestro inside CI jobs",
    long_about = None
)]
pub struct Cli {
    /// Print JSON instead of plain text
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase verbosity (-v, -vv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Disable progress indicators
    #[arg(long, global = true)]
    pub no_progress: bool,

    /// Disable network access (existing installs only)
    #[arg(long, global = true)]
    pub offline: bool,

    /// Network timeout in seconds
    #[arg(long, default_value_t = 60, global = true)]
    pub timeout: u64,

    /// Retry failed network requests this many times
    #[arg(long, default_value_t = 2, global = true)]
    pub retries: u8,

    /// Root of the installation cache
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Maestro version to install (`latest` or empty for any)
    #[arg(long = "version", env = "INPUT_VERSION", default_value = "", global = true)]
    pub tool_version: String,

    /// Flow file or directory to run
    #[arg(long, env = "INPUT_FLOW", default_value = "", global = true)]
    pub flow: String,

    /// Environment passed to the flow as KEY=VALUE (repeatable, or one per line)
    #[arg(long = "env", env = "INPUT_ENV", global = true)]
    pub env: Vec<String>,

    /// JUnit report path
    #[arg(long, env = "INPUT_REPORT", default_value = "report.xml", global = true)]
    pub report: String,

    /// Directory screenshots are written to (default: current directory)
    #[arg(long, env = "INPUT_SCREENSHOTS-DIR", default_value = "", global = true)]
    pub screenshots_dir: String,

    #[command(subcommand)]
    pub cmd: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Check the platform, install the tools and run the flow (default)
    Run,
    /// Install the tools without running a flow
    Setup,
    /// Run the flow with an already installed Maestro
    Test,
    /// Print the cache root, tool homes and cached versions
    Paths,
    /// Print version details
    Version,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

impl Cli {
    pub fn test_inputs(&self) -> TestInputs {
        TestInputs {
            flow: self.flow.clone(),
            env: self.env.iter().flat_map(|v| split_env_lines(v)).collect(),
            report: self.report.clone(),
            screenshots_dir: self.screenshots_dir.clone(),
        }
    }
}

pub fn main_entry() -> ExitCode {
    main_with(Cli::parse())
}

pub fn main_with(cli: Cli) -> ExitCode {
    let ctx = match make_ctx(&cli) {
        Ok(ctx) => ctx,
        Err(err) => {
            if cli.json {
                print_json_error("init", &err);
            } else {
                crate::infrastructure::error(format!("{err:#}"));
            }
            return ExitCode::from(map_error_to_exit_code(&err));
        }
    };
    debug(
        &ctx,
        format!(
            "os={} arch={} cache={} home={} timeout={}s retries={} offline={}",
            ctx.os,
            ctx.arch,
            ctx.cache_root.display(),
            ctx.profile_home.display(),
            ctx.timeout,
            ctx.retries,
            ctx.offline
        ),
    );
    if ctx.offline {
        warn(&ctx, "Offline mode enabled; only existing installs can be used.");
    }

    match run(&cli, &ctx) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if cli.json && !ctx.json_emitted.load(AtomicOrdering::Relaxed) {
                print_json_error(command_name(&cli), &err);
            }
            if !cli.json {
                report_failure(&ctx, format!("{err:#}"));
            }
            ExitCode::from(map_error_to_exit_code(&err))
        }
    }
}

fn command_name(cli: &Cli) -> &'static str {
    match cli.cmd.as_ref().unwrap_or(&Commands::Run) {
        Commands::Run => "run",
        Commands::Setup => "setup",
        Commands::Test => "test",
        Commands::Paths => "paths",
        Commands::Version => "version",
        Commands::Completions { .. } => "completions",
    }
}

pub fn run(cli: &Cli, ctx: &Ctx) -> Result<()> {
    let cache = InstallationCache::new(&ctx.cache_root);
    let mut search_path = SearchPath::new();
    match cli.cmd.clone().unwrap_or(Commands::Run) {
        Commands::Run => {
            let platform = check_platform(ctx)?;
            let installed = setup(ctx, &cache, platform, &cli.tool_version, &mut search_path)?;
            let maestro = maestro_executable(&installed)?;
            let outcome = run_tests(ctx, &maestro, &cli.test_inputs(), &search_path)?;
            if outcome.is_none() {
                info(ctx, "No flow given; skipping tests.");
            }
            if cli.json {
                emit_json(ctx, run_json("run", &installed, outcome.as_ref()))?;
            }
        }
        Commands::Setup => {
            let platform = check_platform(ctx)?;
            let installed = setup(ctx, &cache, platform, &cli.tool_version, &mut search_path)?;
            if cli.json {
                emit_json(ctx, run_json("setup", &installed, None))?;
            } else {
                for item in &installed {
                    info(ctx, format!("{}: {}", item.tool, item.executable.display()));
                }
            }
        }
        Commands::Test => {
            let inputs = cli.test_inputs();
            if inputs.flow.trim().is_empty() {
                return Err(
                    RunError::Input("a flow is required (--flow or INPUT_FLOW)".into()).into(),
                );
            }
            let found = locate(ctx, &cache, spec_for(ToolKind::Maestro), &VersionRequest::Any);
            let installation = found.installation();
            if !installation.found {
                bail!("maestro is not installed; run `maestro-setup setup` first");
            }
            search_path.append(&installation.directory);
            let maestro = spec_for(ToolKind::Maestro).executable_in(&installation.directory);
            let outcome = run_tests(ctx, &maestro, &inputs, &search_path)?;
            if cli.json {
                emit_json(ctx, run_json("test", &[], outcome.as_ref()))?;
            }
        }
        Commands::Paths => run_paths(ctx, &cache, cli.json)?,
        Commands::Version => run_version(ctx, cli.json)?,
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "maestro-setup", &mut io::stdout());
        }
    }
    Ok(())
}

pub fn make_ctx(cli: &Cli) -> Result<Ctx> {
    let mut http_builder = Client::builder()
        .user_agent(concat!("maestro-setup/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(cli.timeout));
    if let Some(cert_path) = non_empty_env("SSL_CERT_FILE") {
        let pem =
            fs::read(&cert_path).with_context(|| format!("read SSL_CERT_FILE {}", cert_path))?;
        let cert = Certificate::from_pem(&pem)
            .with_context(|| format!("parse SSL_CERT_FILE {}", cert_path))?;
        http_builder = http_builder.add_root_certificate(cert);
    }
    let http = http_builder.build()?;

    let profile_home = home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
    let cache_root = cli
        .cache_dir
        .clone()
        .or_else(|| {
            non_empty_env("RUNNER_TOOL_CACHE").map(|d| PathBuf::from(d).join("maestro-setup"))
        })
        .unwrap_or_else(|| {
            data_local_dir()
                .unwrap_or_else(|| profile_home.join(".local").join("share"))
                .join("maestro-setup")
                .join("tools")
        });
    let workspace = non_empty_env("GITHUB_WORKSPACE")
        .map(PathBuf::from)
        .or_else(|| env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let github_actions = non_empty_env("GITHUB_ACTIONS").as_deref() == Some("true");
    let runner_debug = non_empty_env("RUNNER_DEBUG").as_deref() == Some("1");
    let verbose = if runner_debug { cli.verbose.max(1) } else { cli.verbose };

    Ok(Ctx {
        http,
        profile_home,
        cache_root,
        workspace,
        os: env::consts::OS.to_string(),
        arch: env::consts::ARCH.to_string(),
        stderr_is_tty: io::stderr().is_terminal(),
        quiet: cli.quiet,
        verbose,
        no_progress: cli.no_progress,
        offline: cli.offline,
        retries: cli.retries,
        timeout: cli.timeout,
        json: cli.json,
        github_actions,
        github_path: non_empty_env("GITHUB_PATH").map(PathBuf::from),
        github_output: non_empty_env("GITHUB_OUTPUT").map(PathBuf::from),
        json_emitted: Arc::new(std::sync::atomic::AtomicBool::new(false)),
    })
}

fn non_empty_env(key: &str) -> Option<String> {
    get_env_var(key).filter(|v| !v.is_empty())
}

pub fn check_platform(ctx: &Ctx) -> Result<Platform> {
    Platform::from_os(&ctx.os)
        .ok_or_else(|| InstallError::PlatformUnsupported(ctx.os.clone()).into())
}

/// Installs every tool the platform needs, in order. Only Maestro honors `version`.
pub fn setup(
    ctx: &Ctx,
    cache: &InstallationCache,
    platform: Platform,
    version: &str,
    search_path: &mut SearchPath,
) -> Result<Vec<Installed>> {
    // a malformed pin fails before any tool is touched
    if let spec @ VersionSpec::Exact(_) = VersionSpec::parse(version) {
        resolve(ctx, ToolKind::Maestro, &spec)?;
    }
    let mut installed = Vec::new();
    for kind in platform.tools() {
        let token = match kind {
            ToolKind::Maestro => version,
            ToolKind::IdbCompanion => "",
        };
        let item = install(ctx, cache, kind, token, search_path)
            .with_context(|| format!("install {kind}"))?;
        debug(ctx, format!("{kind} exec: {}", item.executable.display()));
        installed.push(item);
    }
    Ok(installed)
}

fn maestro_executable(installed: &[Installed]) -> Result<PathBuf> {
    installed
        .iter()
        .find(|i| i.tool == ToolKind::Maestro.as_str())
        .map(|i| i.executable.clone())
        .ok_or_else(|| anyhow!("maestro was not installed"))
}

fn run_json(
    command: &str,
    installed: &[Installed],
    outcome: Option<&TestOutcome>,
) -> serde_json::Value {
    let test = outcome.map(|o| {
        serde_json::json!({
            "report": o.report.as_ref().map(|p| p.display().to_string()),
            "screenshots_dir": o.screenshots_dir.display().to_string(),
            "exit_code": o.exit_code,
        })
    });
    serde_json::json!({
        "command": command,
        "ok": true,
        "tools": installed,
        "test": test,
    })
}

pub fn run_paths(ctx: &Ctx, cache: &InstallationCache, json: bool) -> Result<()> {
    let mut tools = Vec::new();
    for kind in ToolKind::all() {
        let spec = spec_for(kind);
        let mut versions = cache
            .entries(spec.cache_name())?
            .into_iter()
            .map(|e| e.version.to_string())
            .collect::<Vec<_>>();
        versions.sort();
        tools.push((kind, spec.home(ctx), versions));
    }
    if json {
        let payload = serde_json::json!({
            "cache_root": cache.root().display().to_string(),
            "tools": tools
                .iter()
                .map(|(kind, home, versions)| serde_json::json!({
                    "tool": kind.as_str(),
                    "home": home.display().to_string(),
                    "cached": versions,
                }))
                .collect::<Vec<_>>(),
        });
        emit_json(ctx, payload)?;
    } else {
        info(ctx, format!("cache root: {}", cache.root().display()));
        for (kind, home, versions) in &tools {
            let cached = if versions.is_empty() {
                "-".to_string()
            } else {
                versions.join(", ")
            };
            info(ctx, format!("{kind}: home={} cached={cached}", home.display()));
        }
    }
    Ok(())
}

pub fn run_version(ctx: &Ctx, json: bool) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    let git = option_env!("MAESTRO_SETUP_GIT_HASH").unwrap_or("unknown");
    let date = option_env!("MAESTRO_SETUP_BUILD_DATE").unwrap_or("unknown");
    let payload = serde_json::json!({
        "version": version,
        "git": git,
        "build_date": date,
    });
    if json {
        emit_json(ctx, payload)?;
    } else {
        info(ctx, format!("maestro-setup {}", version));
        info(ctx, format!("commit: {git}"));
        info(ctx, format!("build date: {date}"));
    }
    Ok(())
}

pub fn map_error_to_exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<InstallError>() {
            return match e {
                InstallError::InvalidVersion(_) => 2,
                InstallError::PlatformUnsupported(_) => 3,
                InstallError::MetadataFetch { .. } | InstallError::Download { .. } => 4,
                InstallError::Archive { .. } | InstallError::Filesystem { .. } => 5,
            };
        }
        if let Some(e) = cause.downcast_ref::<RunError>() {
            return match e {
                RunError::Input(_) => 2,
                RunError::TestsFailed(_) => 6,
            };
        }
    }
    1
}
