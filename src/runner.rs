use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::{
    Ctx, RunError, SearchPath, create_parents_if_needed, get_env_var, info, run_streaming,
    set_output, to_absolute_path,
};

/// Raw inputs for a test run, as they arrive from flags or the CI environment.
#[derive(Clone, Debug, Default)]
pub struct TestInputs {
    pub flow: String,
    /// `KEY=VALUE` lines forwarded as `-e` arguments.
    pub env: Vec<String>,
    pub report: String,
    pub screenshots_dir: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestOutcome {
    pub report: Option<PathBuf>,
    pub screenshots_dir: PathBuf,
    pub exit_code: i32,
}

/// Splits a multi-line input into non-empty trimmed lines.
pub fn split_env_lines(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn test_args(env: &[String], flow: &Path, report: &Path) -> Vec<String> {
    let mut args = vec!["test".to_string()];
    for var in env {
        args.push("-e".into());
        args.push(var.clone());
    }
    args.push("--format=junit".into());
    args.push(format!("--output={}", report.display()));
    args.push(flow.display().to_string());
    args
}

/// Runs the flow with `maestro` and publishes report locations as outputs.
///
/// Returns `None` when no flow was given.
pub fn run_tests(
    ctx: &Ctx,
    maestro: &Path,
    inputs: &TestInputs,
    search_path: &SearchPath,
) -> Result<Option<TestOutcome>> {
    let Some(flow) = to_absolute_path(ctx, inputs.flow.trim()) else {
        return Ok(None);
    };
    if !flow.exists() {
        return Err(RunError::Input(format!(
            "Flow or directory with path \"{}\" doesn't exist",
            flow.display()
        ))
        .into());
    }

    let report = to_absolute_path(ctx, inputs.report.trim())
        .ok_or_else(|| RunError::Input("Report path can't be empty".into()))?;
    create_parents_if_needed(&report, true)?;

    let screenshots_dir = match to_absolute_path(ctx, inputs.screenshots_dir.trim()) {
        Some(dir) => dir,
        None => std::env::current_dir().unwrap_or_else(|_| ctx.workspace.clone()),
    };
    create_parents_if_needed(&screenshots_dir, false)?;

    let path_env = search_path.join_onto(&get_env_var("PATH").unwrap_or_default())?;
    let args = test_args(&inputs.env, &flow, &report);
    info(ctx, format!("Running {} {}", maestro.display(), args.join(" ")));
    let exit_code = run_streaming(maestro, &args, &screenshots_dir, &path_env)?;

    let report = report.exists().then_some(report);
    if let Some(report) = &report {
        set_output(ctx, "report", &report.display().to_string())?;
    }
    set_output(ctx, "screenshots-dir", &screenshots_dir.display().to_string())?;

    if exit_code != 0 {
        return Err(RunError::TestsFailed(exit_code).into());
    }
    Ok(Some(TestOutcome {
        report,
        screenshots_dir,
        exit_code,
    }))
}
