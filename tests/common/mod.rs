#![allow(dead_code)]

use maestro_setup::Ctx;
use maestro_setup::test_support::{base_ctx, enable_http_mocking, set_which};
use std::io::{Cursor, Write};
use tempfile::TempDir;

pub const MAESTRO_LATEST_URL: &str =
    "https://github.com/mobile-dev-inc/maestro/releases/latest/download/maestro.zip";
pub const MAESTRO_VERSION_URL: &str = "https://api.mobile.dev/maestro/version";
pub const IDB_TAGS_URL: &str = "https://api.github.com/repos/facebook/idb/tags";

pub fn maestro_pinned_url(version: &str) -> String {
    format!(
        "https://github.com/mobile-dev-inc/maestro/releases/download/cli-{version}/maestro.zip"
    )
}

/// A context rooted in a fresh temp dir, with no host tools visible and no real network.
pub fn isolated_ctx() -> (Ctx, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let ctx = base_ctx(dir.path().join("home"), dir.path().join("cache"));
    std::fs::create_dir_all(&ctx.profile_home).unwrap();
    enable_http_mocking();
    set_which("maestro", None);
    set_which("idb_companion", None);
    (ctx, dir)
}

/// A release-shaped Maestro archive: everything under `maestro/`.
pub fn maestro_zip(marker: &str) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let exe = zip::write::SimpleFileOptions::default().unix_permissions(0o755);
    let plain = zip::write::SimpleFileOptions::default().unix_permissions(0o644);
    zip.start_file("maestro/bin/maestro", exe).unwrap();
    zip.write_all(format!("#!/bin/sh\necho {marker}\n").as_bytes())
        .unwrap();
    zip.start_file("maestro/lib/maestro.jar", plain).unwrap();
    zip.write_all(marker.as_bytes()).unwrap();
    zip.finish().unwrap().into_inner()
}

/// A Maestro archive without the wrapper folder: only `bin/maestro` at the top.
pub fn maestro_flat_zip(marker: &str) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let exe = zip::write::SimpleFileOptions::default().unix_permissions(0o755);
    zip.start_file("bin/maestro", exe).unwrap();
    zip.write_all(format!("#!/bin/sh\necho {marker}\n").as_bytes())
        .unwrap();
    zip.finish().unwrap().into_inner()
}

/// A release-shaped idb_companion archive: everything under `idb-companion.universal/`.
pub fn idb_tar_gz() -> Vec<u8> {
    let mut bytes = Vec::new();
    {
        let enc = flate2::write::GzEncoder::new(&mut bytes, flate2::Compression::default());
        let mut tar = tar::Builder::new(enc);
        let body = b"#!/bin/sh\necho 1.1.8\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        tar.append_data(
            &mut header,
            "idb-companion.universal/bin/idb_companion",
            &body[..],
        )
        .unwrap();
        tar.into_inner().unwrap().finish().unwrap();
    }
    bytes
}
