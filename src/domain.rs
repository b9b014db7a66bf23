use clap::ValueEnum;
use regex::Regex;
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq, Hash)]
pub enum ToolKind {
    Maestro,
    #[value(name = "idb-companion")]
    IdbCompanion,
}

impl ToolKind {
    pub fn all() -> Vec<ToolKind> {
        vec![ToolKind::IdbCompanion, ToolKind::Maestro]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Maestro => "maestro",
            ToolKind::IdbCompanion => "idb_companion",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host platforms the installers know how to provision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
}

impl Platform {
    pub fn from_os(os: &str) -> Option<Self> {
        match os {
            "linux" => Some(Platform::Linux),
            "macos" | "darwin" => Some(Platform::MacOs),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::MacOs => "darwin",
        }
    }

    /// Tools installed on this platform, in installation order.
    pub fn tools(&self) -> Vec<ToolKind> {
        match self {
            Platform::MacOs => vec![ToolKind::IdbCompanion, ToolKind::Maestro],
            Platform::Linux => vec![ToolKind::Maestro],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionSpec {
    Latest,
    Exact(String),
}

impl VersionSpec {
    /// Empty and `latest` both mean "whatever is newest".
    pub fn parse(token: &str) -> Self {
        let token = token.trim();
        if token.is_empty() || token == "latest" {
            VersionSpec::Latest
        } else {
            VersionSpec::Exact(token.to_string())
        }
    }

    pub fn is_latest(&self) -> bool {
        matches!(self, VersionSpec::Latest)
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSpec::Latest => f.write_str("latest"),
            VersionSpec::Exact(v) => f.write_str(v),
        }
    }
}

/// A concrete version string, never the literal `latest`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResolvedVersion(String);

impl ResolvedVersion {
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        if value.is_empty() || value == "latest" {
            return None;
        }
        Some(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResolvedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReleaseChannel {
    Latest,
    Pinned(ResolvedVersion),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

/// Which lookups the locator performs for a tool. The order itself is fixed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocateStrategy {
    pub cache_first: bool,
    pub local_home_check: bool,
    pub system_path_check: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionRequest {
    Any,
    Exact(ResolvedVersion),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub name: String,
    pub version: ResolvedVersion,
    pub directory: PathBuf,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Installation {
    pub found: bool,
    pub directory: PathBuf,
    pub version: Option<ResolvedVersion>,
}

impl Installation {
    pub fn found(directory: PathBuf, version: Option<ResolvedVersion>) -> Self {
        Self {
            found: true,
            directory,
            version,
        }
    }

    pub fn missing() -> Self {
        Self::default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchOutcome {
    CacheHit(Installation),
    LocalHit(Installation),
    SystemHit(Installation),
    Miss,
}

impl SearchOutcome {
    pub fn installation(&self) -> Installation {
        match self {
            SearchOutcome::CacheHit(i)
            | SearchOutcome::LocalHit(i)
            | SearchOutcome::SystemHit(i) => i.clone(),
            SearchOutcome::Miss => Installation::missing(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SearchOutcome::CacheHit(_) => "cache-hit",
            SearchOutcome::LocalHit(_) => "local-hit",
            SearchOutcome::SystemHit(_) => "system-hit",
            SearchOutcome::Miss => "miss",
        }
    }
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("invalid version requested: {0:?}")]
    InvalidVersion(String),
    #[error("failed to get latest {tool} version: {reason}")]
    MetadataFetch { tool: ToolKind, reason: String },
    #[error("failed to download {url}: {reason}")]
    Download { url: String, reason: String },
    #[error("failed to extract {archive}: {reason}")]
    Archive { archive: String, reason: String },
    #[error("filesystem error at {path}: {reason}")]
    Filesystem { path: PathBuf, reason: String },
    #[error("platform {0} is not supported")]
    PlatformUnsupported(String),
}

/// Failures of the test-flow step, after the tools are installed.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("{0}")]
    Input(String),
    #[error("Maestro tests failed. Exit code: {0}")]
    TestsFailed(i32),
}

impl InstallError {
    pub(crate) fn filesystem(path: impl Into<PathBuf>, err: impl fmt::Display) -> Self {
        InstallError::Filesystem {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}

/// Numeric triple used to order cached versions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub fn parse_loose(s: &str) -> Option<Self> {
        // Accept: "1.2.3", "v1.2.3", "cli-1.2.3"
        let re = Regex::new(r"(\d+)\.(\d+)\.(\d+)").ok()?;
        let caps = re.captures(s)?;
        let major = caps.get(1)?.as_str().parse().ok()?;
        let minor = caps.get(2)?.as_str().parse().ok()?;
        let patch = caps.get(3)?.as_str().parse().ok()?;
        Some(Self {
            major,
            minor,
            patch,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
