use regex::Regex;
use std::path::Path;

use crate::cache::InstallationCache;
use crate::tools::ToolSpec;
use crate::{
    Ctx, Installation, ResolvedVersion, SearchOutcome, VersionRequest, debug, run_output,
    which_or_none,
};

/// Picks the installed version out of `--version` output.
///
/// The wrapped tool can print an "update available" notice that names the newer
/// release first, so the last triple is the installed one.
pub fn installed_version_from_output(output: &str) -> Option<ResolvedVersion> {
    let re = Regex::new(r"\d+\.\d+\.\d+").ok()?;
    let last = re.find_iter(output).last()?;
    ResolvedVersion::new(last.as_str())
}

fn introspect(ctx: &Ctx, exe: &Path) -> Option<ResolvedVersion> {
    let args = [std::ffi::OsStr::new("--version")];
    let out = match run_output(exe.as_os_str(), &args) {
        Ok(out) => out,
        Err(err) => {
            debug(ctx, format!("{} --version failed: {err:#}", exe.display()));
            return None;
        }
    };
    if !out.status.success() {
        debug(ctx, format!("{} --version exited with {}", exe.display(), out.status));
        return None;
    }
    installed_version_from_output(&String::from_utf8_lossy(&out.stdout))
}

/// Whether a copy whose introspected version is `found` satisfies `request`.
fn satisfies(request: &VersionRequest, found: Option<&ResolvedVersion>) -> bool {
    match request {
        VersionRequest::Any => true,
        VersionRequest::Exact(want) => found == Some(want),
    }
}

/// Looks for an existing copy of `tool`: cache, then the profile home, then `PATH`.
pub fn locate(
    ctx: &Ctx,
    cache: &InstallationCache,
    tool: &ToolSpec,
    request: &VersionRequest,
) -> SearchOutcome {
    let strategy = tool.strategy;

    if strategy.cache_first {
        let hit = match request {
            VersionRequest::Exact(version) => cache
                .find(tool.cache_name(), version)
                .map(|dir| (dir, version.clone())),
            VersionRequest::Any => cache
                .find_latest(tool.cache_name())
                .map(|entry| (entry.directory, entry.version)),
        };
        if let Some((dir, version)) = hit {
            let bin = tool.bin_dir_in(&dir);
            if tool.executable_in(&bin).is_file() {
                return SearchOutcome::CacheHit(Installation::found(bin, Some(version)));
            }
            debug(ctx, format!("cached {} {version} has no executable", tool.kind));
        }
    }

    if strategy.local_home_check {
        let bin = tool.bin_dir_in(&tool.home(ctx));
        let exe = tool.executable_in(&bin);
        if exe.is_file() {
            let version = introspect(ctx, &exe);
            if version.is_some() && satisfies(request, version.as_ref()) {
                return SearchOutcome::LocalHit(Installation::found(bin, version));
            }
            debug(ctx, format!("{} does not match the request", exe.display()));
        }
    }

    if strategy.system_path_check {
        if let Some(exe) = which_or_none(tool.executable) {
            let version = introspect(ctx, &exe);
            // Being on PATH is enough for a version-agnostic request.
            if satisfies(request, version.as_ref()) {
                let dir = exe
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                return SearchOutcome::SystemHit(Installation::found(dir, version));
            }
        }
    }

    SearchOutcome::Miss
}
