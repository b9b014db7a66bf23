#![forbid(unsafe_code)]

pub mod application;
pub mod cache;
pub mod domain;
pub mod fetcher;
pub mod infrastructure;
pub mod installer;
pub mod locator;
pub mod resolver;
pub mod runner;
pub mod test_support;
pub mod tools;

pub use application::{
    Cli, Commands, check_platform, main_entry, main_with, make_ctx, map_error_to_exit_code, run,
    run_paths, run_version, setup,
};
pub use cache::InstallationCache;
pub use domain::{
    ArchiveFormat, CacheEntry, InstallError, Installation, LocateStrategy, Platform,
    ReleaseChannel, ResolvedVersion, RunError, SearchOutcome, ToolKind, Version, VersionRequest,
    VersionSpec,
};
pub use infrastructure::{
    Ctx, HttpResponse, SearchPath, add_path, create_parents_if_needed, data_local_dir, debug,
    download_to_temp, emit_json, end_group, ensure_clean_dir, error, get_env_var, home_dir,
    http_get, http_get_json, http_get_no_timeout, info, print_json_error, progress_allowed,
    report_failure, run_output, run_streaming, set_output, sleep_for, start_group,
    to_absolute_path, warn, which_or_none, write_all_checked,
};
pub use installer::{Installed, install};
pub use locator::{installed_version_from_output, locate};
pub use resolver::resolve;
pub use runner::{TestInputs, TestOutcome, run_tests};
