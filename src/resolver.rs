use anyhow::Result;
use regex::Regex;

use crate::tools::{idb, maestro};
use crate::{Ctx, InstallError, ResolvedVersion, ToolKind, VersionSpec, debug};

fn has_version_triple(token: &str) -> bool {
    Regex::new(r"\d+\.\d+\.\d+")
        .map(|re| re.is_match(token))
        .unwrap_or(false)
}

/// Turns a user-supplied specifier into a concrete version.
///
/// Exact tokens are only checked loosely (`v1.2.3` passes) and returned untouched.
/// `Latest` costs one metadata request.
pub fn resolve(ctx: &Ctx, tool: ToolKind, spec: &VersionSpec) -> Result<ResolvedVersion> {
    match spec {
        VersionSpec::Exact(token) => {
            if !has_version_triple(token) {
                return Err(InstallError::InvalidVersion(token.clone()).into());
            }
            ResolvedVersion::new(token.clone())
                .ok_or_else(|| InstallError::InvalidVersion(token.clone()).into())
        }
        VersionSpec::Latest => {
            let latest = match tool {
                ToolKind::Maestro => maestro::maestro_latest(ctx),
                ToolKind::IdbCompanion => idb::idb_latest(ctx),
            }
            .map_err(|err| InstallError::MetadataFetch {
                tool,
                reason: format!("{err:#}"),
            })?;
            debug(ctx, format!("latest {tool} is {latest}"));
            ResolvedVersion::new(latest.clone()).ok_or_else(|| {
                InstallError::MetadataFetch {
                    tool,
                    reason: format!("metadata returned unusable version {latest:?}"),
                }
                .into()
            })
        }
    }
}
