use anyhow::{Result, anyhow};
use serde::Deserialize;

use super::ToolSpec;
use crate::{ArchiveFormat, Ctx, LocateStrategy, ResolvedVersion, ToolKind, Version, http_get_json};

const TAGS_URL: &str = "https://api.github.com/repos/facebook/idb/tags";

pub static IDB_COMPANION: ToolSpec = ToolSpec {
    kind: ToolKind::IdbCompanion,
    executable: "idb_companion",
    home_dir: ".idb",
    bin_subdir: "bin",
    archive_format: ArchiveFormat::TarGz,
    wrapper_folder: "idb-companion.universal",
    strategy: LocateStrategy {
        cache_first: true,
        local_home_check: true,
        system_path_check: true,
    },
    latest_url: concat!(
        "https://github.com/facebook/idb/releases/latest/download/",
        "idb-companion.universal.tar.gz"
    ),
    pinned_url,
};

fn pinned_url(version: &ResolvedVersion) -> String {
    format!(
        "https://github.com/facebook/idb/releases/download/v{version}/{}",
        "idb-companion.universal.tar.gz"
    )
}

#[derive(Debug, Deserialize)]
struct Tag {
    name: String, // "v1.1.8"
}

/// Newest tag of the idb repository. GitHub lists tags newest first.
pub fn idb_latest(ctx: &Ctx) -> Result<String> {
    let headers = [
        ("User-Agent", "maestro-setup".to_string()),
        ("Accept", "application/vnd.github+json".to_string()),
        ("X-UUID", uuid::Uuid::new_v4().to_string()),
    ];
    let tags: Vec<Tag> = http_get_json(ctx, TAGS_URL, &headers)?;
    let first = tags
        .first()
        .ok_or_else(|| anyhow!("idb repository has no tags"))?;
    Version::parse_loose(&first.name)
        .map(|v| v.to_string())
        .ok_or_else(|| anyhow!("tag {:?} does not carry a version", first.name))
}
