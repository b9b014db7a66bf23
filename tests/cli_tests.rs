use clap::Parser;
use maestro_setup::test_support::{
    base_ctx, enable_http_mocking, http_requests, reset_guard, set_data_local_dir, set_env_var,
    set_home_dir, set_which,
};
use maestro_setup::*;
use std::path::PathBuf;
use std::process::ExitCode;
use tempfile::tempdir;

/// Pins every environment variable `make_ctx` consults.
fn clean_env() {
    for key in [
        "SSL_CERT_FILE",
        "RUNNER_TOOL_CACHE",
        "GITHUB_WORKSPACE",
        "GITHUB_ACTIONS",
        "RUNNER_DEBUG",
        "GITHUB_PATH",
        "GITHUB_OUTPUT",
    ] {
        set_env_var(key, None);
    }
}

#[test]
fn defaults_and_inputs() {
    let cli = Cli::try_parse_from(["maestro-setup", "--report", "out/r.xml"]).unwrap();
    assert!(cli.cmd.is_none());
    assert_eq!(cli.timeout, 60);
    assert_eq!(cli.retries, 2);
    assert_eq!(cli.report, "out/r.xml");

    let cli = Cli::try_parse_from([
        "maestro-setup",
        "setup",
        "--version",
        "1.30.0",
        "--env",
        "A=1\nB=2",
        "--env",
        "C=3",
    ])
    .unwrap();
    assert!(matches!(cli.cmd, Some(Commands::Setup)));
    assert_eq!(cli.tool_version, "1.30.0");
    assert_eq!(cli.test_inputs().env, vec!["A=1", "B=2", "C=3"]);
}

#[test]
fn completions_parse() {
    let cli = Cli::try_parse_from(["maestro-setup", "completions", "bash"]).unwrap();
    assert!(matches!(cli.cmd, Some(Commands::Completions { .. })));
}

#[test]
fn exit_codes_follow_error_kind() {
    let cases: Vec<(anyhow::Error, u8)> = vec![
        (InstallError::InvalidVersion("x".into()).into(), 2),
        (InstallError::PlatformUnsupported("windows".into()).into(), 3),
        (
            InstallError::MetadataFetch {
                tool: ToolKind::Maestro,
                reason: "503".into(),
            }
            .into(),
            4,
        ),
        (
            InstallError::Download {
                url: "u".into(),
                reason: "r".into(),
            }
            .into(),
            4,
        ),
        (
            InstallError::Archive {
                archive: "a".into(),
                reason: "r".into(),
            }
            .into(),
            5,
        ),
        (
            InstallError::Filesystem {
                path: PathBuf::from("/x"),
                reason: "r".into(),
            }
            .into(),
            5,
        ),
        (RunError::Input("missing".into()).into(), 2),
        (RunError::TestsFailed(3).into(), 6),
        (anyhow::anyhow!("anything else"), 1),
    ];
    for (err, code) in cases {
        assert_eq!(map_error_to_exit_code(&err), code, "{err}");
    }

    let wrapped = anyhow::Error::from(InstallError::Download {
        url: "u".into(),
        reason: "r".into(),
    })
    .context("install maestro");
    assert_eq!(map_error_to_exit_code(&wrapped), 4);
}

#[test]
fn make_ctx_reads_ci_environment() {
    let _guard = reset_guard();
    clean_env();
    let dir = tempdir().unwrap();
    set_home_dir(Some(dir.path().join("home")));
    set_env_var("RUNNER_TOOL_CACHE", Some(dir.path().join("tc").display().to_string()));
    set_env_var("GITHUB_WORKSPACE", Some("/work/repo".into()));
    set_env_var("GITHUB_ACTIONS", Some("true".into()));
    set_env_var("RUNNER_DEBUG", Some("1".into()));
    set_env_var("GITHUB_PATH", Some("/tmp/gh_path".into()));
    set_env_var("GITHUB_OUTPUT", Some(String::new()));

    let cli = Cli::try_parse_from(["maestro-setup"]).unwrap();
    let ctx = make_ctx(&cli).unwrap();
    assert_eq!(ctx.profile_home, dir.path().join("home"));
    assert_eq!(ctx.cache_root, dir.path().join("tc/maestro-setup"));
    assert_eq!(ctx.workspace, PathBuf::from("/work/repo"));
    assert!(ctx.github_actions);
    assert_eq!(ctx.verbose, 1);
    assert_eq!(ctx.github_path, Some(PathBuf::from("/tmp/gh_path")));
    assert_eq!(ctx.github_output, None);
}

#[test]
fn make_ctx_cache_dir_precedence() {
    let _guard = reset_guard();
    clean_env();
    let dir = tempdir().unwrap();
    set_home_dir(Some(dir.path().join("home")));
    set_data_local_dir(Some(dir.path().join("data")));

    let cli = Cli::try_parse_from(["maestro-setup"]).unwrap();
    let ctx = make_ctx(&cli).unwrap();
    assert_eq!(ctx.cache_root, dir.path().join("data/maestro-setup/tools"));
    assert!(!ctx.github_actions);

    set_env_var("RUNNER_TOOL_CACHE", Some(dir.path().join("tc").display().to_string()));
    let cli = Cli::try_parse_from(["maestro-setup", "--cache-dir", "/opt/cache"]).unwrap();
    let ctx = make_ctx(&cli).unwrap();
    assert_eq!(ctx.cache_root, PathBuf::from("/opt/cache"));
}

#[test]
fn make_ctx_rejects_bad_cert_file() {
    let _guard = reset_guard();
    clean_env();
    let dir = tempdir().unwrap();
    set_home_dir(Some(dir.path().join("home")));
    set_env_var(
        "SSL_CERT_FILE",
        Some(dir.path().join("missing.pem").display().to_string()),
    );
    let cli = Cli::try_parse_from(["maestro-setup"]).unwrap();
    let err = make_ctx(&cli).err().unwrap();
    assert!(err.to_string().contains("SSL_CERT_FILE"));
}

#[test]
fn main_with_version_and_paths() {
    let _guard = reset_guard();
    clean_env();
    let dir = tempdir().unwrap();
    set_home_dir(Some(dir.path().join("home")));
    let cache = dir.path().join("cache").display().to_string();

    let cli = Cli::try_parse_from(["maestro-setup", "--quiet", "version"]).unwrap();
    assert_eq!(main_with(cli), ExitCode::SUCCESS);

    let cli =
        Cli::try_parse_from(["maestro-setup", "--json", "--cache-dir", &cache, "paths"]).unwrap();
    assert_eq!(main_with(cli), ExitCode::SUCCESS);
}

#[test]
fn main_with_offline_setup_on_bare_host_fails_with_network_code() {
    let _guard = reset_guard();
    clean_env();
    enable_http_mocking();
    set_which("maestro", None);
    set_which("idb_companion", None);
    let dir = tempdir().unwrap();
    set_home_dir(Some(dir.path().join("home")));
    let cache = dir.path().join("cache").display().to_string();

    let cli = Cli::try_parse_from([
        "maestro-setup",
        "--quiet",
        "--offline",
        "--cache-dir",
        &cache,
        "--version",
        "",
        "setup",
    ])
    .unwrap();
    assert_eq!(main_with(cli), ExitCode::from(4));
}

#[test]
fn main_with_invalid_version_exits_2() {
    let _guard = reset_guard();
    clean_env();
    enable_http_mocking();
    set_which("maestro", None);
    set_which("idb_companion", None);
    let dir = tempdir().unwrap();
    set_home_dir(Some(dir.path().join("home")));
    let cache = dir.path().join("cache").display().to_string();

    let cli = Cli::try_parse_from([
        "maestro-setup",
        "--quiet",
        "--cache-dir",
        &cache,
        "--version",
        "not-a-version",
        "setup",
    ])
    .unwrap();
    assert_eq!(main_with(cli), ExitCode::from(2));
    assert!(http_requests().is_empty());
}

#[test]
fn unsupported_platform_aborts_before_any_install() {
    let _guard = reset_guard();
    enable_http_mocking();
    set_which("maestro", None);
    set_which("idb_companion", None);
    let dir = tempdir().unwrap();
    let mut ctx = base_ctx(dir.path().join("home"), dir.path().join("cache"));
    ctx.os = "windows".to_string();

    for args in [["maestro-setup", "setup"], ["maestro-setup", "run"]] {
        let cli = Cli::try_parse_from(args).unwrap();
        let err = run(&cli, &ctx).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InstallError>(),
            Some(InstallError::PlatformUnsupported(os)) if os == "windows"
        ));
        assert_eq!(map_error_to_exit_code(&err), 3);
    }
    assert!(http_requests().is_empty());
    assert!(!ctx.cache_root.exists());
    assert!(!ctx.profile_home.join(".maestro").exists());
    assert!(!ctx.profile_home.join(".idb").exists());
}

#[test]
fn invalid_pin_on_macos_fails_before_idb_companion() {
    let _guard = reset_guard();
    enable_http_mocking();
    set_which("maestro", None);
    set_which("idb_companion", None);
    let dir = tempdir().unwrap();
    let ctx = base_ctx(dir.path().join("home"), dir.path().join("cache"));
    let cache = InstallationCache::new(&ctx.cache_root);
    let mut search_path = SearchPath::new();

    let err = setup(&ctx, &cache, Platform::MacOs, "nightly", &mut search_path).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<InstallError>(),
        Some(InstallError::InvalidVersion(token)) if token == "nightly"
    ));
    assert_eq!(map_error_to_exit_code(&err), 2);
    assert!(http_requests().is_empty());
    assert!(!ctx.profile_home.join(".idb").exists());
    assert!(search_path.dirs().is_empty());
}

#[test]
fn test_command_requires_flow() {
    let _guard = reset_guard();
    clean_env();
    let dir = tempdir().unwrap();
    set_home_dir(Some(dir.path().join("home")));
    let cache = dir.path().join("cache").display().to_string();
    let cli = Cli::try_parse_from([
        "maestro-setup",
        "--quiet",
        "--cache-dir",
        &cache,
        "--flow",
        "",
        "test",
    ])
    .unwrap();
    assert_eq!(main_with(cli), ExitCode::from(2));
}
