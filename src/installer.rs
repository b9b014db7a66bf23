use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;

use crate::cache::InstallationCache;
use crate::fetcher::fetch;
use crate::locator::locate;
use crate::resolver::resolve;
use crate::tools::{download_url, spec_for};
use crate::{
    Ctx, Installation, ReleaseChannel, ResolvedVersion, SearchOutcome, SearchPath, ToolKind,
    VersionRequest, VersionSpec, add_path, debug, end_group, info, start_group,
};

#[derive(Debug)]
enum State {
    ResolveVersion,
    LocateAny,
    LocateExact(ResolvedVersion),
    Fetch {
        version: ResolvedVersion,
        channel: ReleaseChannel,
    },
    Publish(Installation),
    Done(PathBuf),
}

/// Where an installed tool came from and how to run it.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Installed {
    pub tool: String,
    pub executable: PathBuf,
    pub version: Option<String>,
    /// `cache-hit`, `local-hit`, `system-hit` or `download`.
    pub source: &'static str,
}

/// Makes `tool` available at the version `token` asks for and returns its executable.
///
/// Empty or `latest` accepts any existing copy. A pinned version only accepts a copy
/// whose introspected version matches; otherwise that exact release is downloaded.
pub fn install(
    ctx: &Ctx,
    cache: &InstallationCache,
    kind: ToolKind,
    token: &str,
    search_path: &mut SearchPath,
) -> Result<Installed> {
    start_group(ctx, format!("Installing {kind}"));
    let result = run_states(ctx, cache, kind, token, search_path);
    end_group(ctx);
    result
}

fn run_states(
    ctx: &Ctx,
    cache: &InstallationCache,
    kind: ToolKind,
    token: &str,
    search_path: &mut SearchPath,
) -> Result<Installed> {
    let tool = spec_for(kind);
    let spec = VersionSpec::parse(token);
    let mut source = "download";
    let mut version = None;
    let mut state = State::ResolveVersion;
    loop {
        debug(ctx, format!("{kind}: {state:?}"));
        state = match state {
            State::ResolveVersion => match &spec {
                VersionSpec::Latest => State::LocateAny,
                VersionSpec::Exact(_) => State::LocateExact(resolve(ctx, kind, &spec)?),
            },
            State::LocateAny => match locate(ctx, cache, tool, &VersionRequest::Any) {
                SearchOutcome::Miss => {
                    let latest = resolve(ctx, kind, &VersionSpec::Latest)?;
                    State::Fetch {
                        version: latest,
                        channel: ReleaseChannel::Latest,
                    }
                }
                hit => {
                    source = hit.label();
                    State::Publish(hit.installation())
                }
            },
            State::LocateExact(wanted) => {
                match locate(ctx, cache, tool, &VersionRequest::Exact(wanted.clone())) {
                    SearchOutcome::Miss => State::Fetch {
                        version: wanted.clone(),
                        channel: ReleaseChannel::Pinned(wanted),
                    },
                    hit => {
                        source = hit.label();
                        State::Publish(hit.installation())
                    }
                }
            }
            State::Fetch { version, channel } => {
                let url = download_url(tool, &channel);
                let bin = fetch(ctx, cache, tool, &version, &url, search_path)?;
                info(ctx, format!("{kind} {version} installed"));
                State::Publish(Installation::found(bin, Some(version)))
            }
            State::Publish(installation) => {
                match &installation.version {
                    Some(v) => info(ctx, format!("Using {kind} {v} ({source})")),
                    None => info(ctx, format!("Using {kind} ({source})")),
                }
                add_path(ctx, search_path, &installation.directory)?;
                version = installation.version;
                State::Done(tool.executable_in(&installation.directory))
            }
            State::Done(executable) => {
                return Ok(Installed {
                    tool: kind.as_str().to_string(),
                    executable,
                    version: version.map(|v| v.to_string()),
                    source,
                });
            }
        };
    }
}
