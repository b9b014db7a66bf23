use anyhow::Result;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::cache::{InstallationCache, copy_tree};
use crate::tools::ToolSpec;
use crate::{
    ArchiveFormat, Ctx, InstallError, ResolvedVersion, SearchPath, add_path, debug,
    download_to_temp, ensure_clean_dir, info,
};

/// Downloads `url`, unpacks it into the tool's home and registers the result in the cache.
///
/// Returns the cached directory holding the executable.
pub fn fetch(
    ctx: &Ctx,
    cache: &InstallationCache,
    tool: &ToolSpec,
    version: &ResolvedVersion,
    url: &str,
    search_path: &mut SearchPath,
) -> Result<PathBuf> {
    if ctx.offline {
        return Err(InstallError::Download {
            url: url.to_string(),
            reason: "offline mode enabled".into(),
        }
        .into());
    }
    let work = tool.home(ctx);
    ensure_clean_dir(&work).map_err(|e| InstallError::filesystem(&work, format!("{e:#}")))?;

    info(ctx, format!("Downloading {} {version}", tool.kind));
    let archive = download_to_temp(ctx, url).map_err(|e| InstallError::Download {
        url: url.to_string(),
        reason: format!("{e:#}"),
    })?;

    let staging_parent = work.parent().unwrap_or(&work);
    let extract_dir = tempfile::Builder::new()
        .prefix(".maestro-setup-extract")
        .tempdir_in(staging_parent)
        .map_err(|e| InstallError::filesystem(staging_parent, e))?;
    info(ctx, format!("Extracting {}", tool.kind));
    extract(tool.archive_format, archive.path(), extract_dir.path()).map_err(|e| {
        InstallError::Archive {
            archive: url.to_string(),
            reason: e.to_string(),
        }
    })?;

    let payload = payload_root(extract_dir.path(), tool.wrapper_folder, tool.bin_subdir)?;
    debug(ctx, format!("payload root {}", payload.display()));
    move_contents(&payload, &work)?;
    if !tool.executable_in(&tool.bin_dir_in(&work)).is_file() {
        return Err(InstallError::Archive {
            archive: url.to_string(),
            reason: format!("{} not found in archive", tool.executable),
        }
        .into());
    }

    let entry = cache.insert(tool.cache_name(), version, &work)?;
    debug(ctx, format!("cached {} {version} at {}", tool.kind, entry.display()));
    let bin = tool.bin_dir_in(&entry);
    add_path(ctx, search_path, &bin)?;
    Ok(bin)
}

pub fn extract(format: ArchiveFormat, archive: &Path, dest: &Path) -> io::Result<()> {
    match format {
        ArchiveFormat::Zip => extract_zip(archive, dest),
        ArchiveFormat::TarGz => extract_tar_gz(archive, dest),
    }
}

fn extract_zip(archive: &Path, dest: &Path) -> io::Result<()> {
    let f = fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(f).map_err(io::Error::other)?;
    for i in 0..zip.len() {
        let mut file = zip.by_index(i).map_err(io::Error::other)?;
        let Some(rel) = file.enclosed_name() else {
            return Err(io::Error::other(format!(
                "entry {:?} escapes the archive root",
                file.name()
            )));
        };
        let out = dest.join(rel);
        if file.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut target = fs::File::create(&out)?;
        io::copy(&mut file, &mut target)?;
        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out, fs::Permissions::from_mode(mode & 0o7777))?;
        }
    }
    Ok(())
}

fn extract_tar_gz(archive: &Path, dest: &Path) -> io::Result<()> {
    let f = fs::File::open(archive)?;
    let gz = flate2::read::GzDecoder::new(f);
    let mut ar = tar::Archive::new(gz);
    ar.set_preserve_permissions(true);
    ar.unpack(dest)
}

/// The directory holding the real payload: the tool's known wrapper folder, else a
/// single top-level folder that is not itself the bin folder, else `dir`.
pub fn payload_root(dir: &Path, wrapper: &str, bin_subdir: &str) -> Result<PathBuf> {
    let wrapped = dir.join(wrapper);
    if wrapped.is_dir() {
        return Ok(wrapped);
    }
    let mut children = Vec::new();
    for item in fs::read_dir(dir).map_err(|e| InstallError::filesystem(dir, e))? {
        let item = item.map_err(|e| InstallError::filesystem(dir, e))?;
        children.push(item.path());
    }
    if let [only] = children.as_slice() {
        if only.is_dir() && only.file_name() != Some(OsStr::new(bin_subdir)) {
            return Ok(only.clone());
        }
    }
    Ok(dir.to_path_buf())
}

fn move_contents(from: &Path, to: &Path) -> Result<()> {
    for item in fs::read_dir(from).map_err(|e| InstallError::filesystem(from, e))? {
        let item = item.map_err(|e| InstallError::filesystem(from, e))?;
        let target = to.join(item.file_name());
        if fs::rename(item.path(), &target).is_ok() {
            continue;
        }
        // Different filesystems; fall back to copying.
        if item.path().is_dir() {
            copy_tree(&item.path(), &target)?;
        } else {
            fs::copy(item.path(), &target).map_err(|e| InstallError::filesystem(&target, e))?;
        }
    }
    Ok(())
}
