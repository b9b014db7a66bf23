pub mod idb;
pub mod maestro;

use std::path::{Path, PathBuf};

use crate::{ArchiveFormat, Ctx, LocateStrategy, ReleaseChannel, ResolvedVersion, ToolKind};

/// Static description of how a tool is published and laid out on disk.
#[derive(Debug)]
pub struct ToolSpec {
    pub kind: ToolKind,
    /// Executable name, also the key used for the cache and `which`.
    pub executable: &'static str,
    /// Working directory under the profile home, e.g. `.maestro`.
    pub home_dir: &'static str,
    pub bin_subdir: &'static str,
    pub archive_format: ArchiveFormat,
    /// Folder the release archive wraps its payload in.
    pub wrapper_folder: &'static str,
    pub strategy: LocateStrategy,
    latest_url: &'static str,
    pinned_url: fn(&ResolvedVersion) -> String,
}

impl ToolSpec {
    pub fn cache_name(&self) -> &'static str {
        self.kind.as_str()
    }

    pub fn home(&self, ctx: &Ctx) -> PathBuf {
        ctx.profile_home.join(self.home_dir)
    }

    pub fn bin_dir_in(&self, root: &Path) -> PathBuf {
        root.join(self.bin_subdir)
    }

    pub fn executable_in(&self, bin_dir: &Path) -> PathBuf {
        bin_dir.join(self.executable)
    }
}

pub fn spec_for(kind: ToolKind) -> &'static ToolSpec {
    match kind {
        ToolKind::Maestro => &maestro::MAESTRO,
        ToolKind::IdbCompanion => &idb::IDB_COMPANION,
    }
}

pub fn download_url(tool: &ToolSpec, channel: &ReleaseChannel) -> String {
    match channel {
        ReleaseChannel::Latest => tool.latest_url.to_string(),
        ReleaseChannel::Pinned(version) => (tool.pinned_url)(version),
    }
}
