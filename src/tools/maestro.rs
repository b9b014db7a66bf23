use anyhow::Result;
use serde::Deserialize;

use super::ToolSpec;
use crate::{
    ArchiveFormat, Ctx, LocateStrategy, Platform, ResolvedVersion, ToolKind, http_get_json,
};

const VERSION_URL: &str = "https://api.mobile.dev/maestro/version";
const CLIENT_ID: &str = "mobile-dev";
/// Reported to the version endpoint as the client's own version.
const LATEST_KNOWN_VERSION: &str = "1.17.4";

pub static MAESTRO: ToolSpec = ToolSpec {
    kind: ToolKind::Maestro,
    executable: "maestro",
    home_dir: ".maestro",
    bin_subdir: "bin",
    archive_format: ArchiveFormat::Zip,
    wrapper_folder: "maestro",
    strategy: LocateStrategy {
        cache_first: true,
        local_home_check: true,
        system_path_check: true,
    },
    latest_url: "https://github.com/mobile-dev-inc/maestro/releases/latest/download/maestro.zip",
    pinned_url,
};

fn pinned_url(version: &ResolvedVersion) -> String {
    format!("https://github.com/mobile-dev-inc/maestro/releases/download/cli-{version}/maestro.zip")
}

#[derive(Debug, Deserialize)]
struct MaestroVersion {
    major: u64,
    minor: u64,
    patch: u64,
}

/// Asks the mobile.dev API for the newest published CLI version.
pub fn maestro_latest(ctx: &Ctx) -> Result<String> {
    let os = Platform::from_os(&ctx.os)
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| ctx.os.clone());
    let headers = [
        ("User-Agent", CLIENT_ID.to_string()),
        ("X-UUID", uuid::Uuid::new_v4().to_string()),
        ("X-OS", os),
        ("X-VERSION", LATEST_KNOWN_VERSION.to_string()),
    ];
    // A `null` body fails to deserialize into the struct and surfaces as an error.
    let v: MaestroVersion = http_get_json(ctx, VERSION_URL, &headers)?;
    Ok(format!("{}.{}.{}", v.major, v.minor, v.patch))
}
