//! Archive extraction and the layout conventions of measurement-platform dumps:
//! `<archive>.tgz` unpacks to a tree ending in `yyyy/mm/dd/` holding `*.pcap.gz` captures.
use chrono::NaiveDate;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};

use crate::analyser::containers::{PacketRecord, SERVICE_SOURCE_PORT};
use crate::analyser::trace::is_gzip;
use crate::error::{Error, Result};

const ARCHIVE_SUFFIXES: [&str; 3] = [".tgz", ".tar.gz", ".tar"];
const CAPTURE_SUFFIXES: [&str; 3] = [".gz", ".pcap", ".pcapng"];

fn has_suffix(path: &Path, suffixes: &[&str]) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy().to_ascii_lowercase()).unwrap_or_default();
    suffixes.iter().any(|suffix| name.ends_with(suffix))
}

pub fn is_archive(path: &Path) -> bool {
    has_suffix(path, &ARCHIVE_SUFFIXES)
}

pub fn is_capture(path: &Path) -> bool {
    has_suffix(path, &CAPTURE_SUFFIXES)
}

/// Archive name without its archive suffix, used as the archive id.
pub fn archive_id(path: &Path) -> String {
    let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    ARCHIVE_SUFFIXES.iter()
        .find_map(|suffix| name.strip_suffix(suffix))
        .map(str::to_string)
        .unwrap_or(name)
}

/// Sorted list of regular files under `dir` accepted by `keep`.
pub fn list_files(dir: &Path, keep: impl Fn(&Path) -> bool) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file() && keep(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Unpacks a (gzipped) tarball into `dest`.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive).map_err(|e| Error::extraction(archive, e))?;
    let input: Box<dyn Read> = if is_gzip(archive) || has_suffix(archive, &[".tgz"]) {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    tar::Archive::new(input)
        .unpack(dest)
        .map_err(|e| Error::extraction(archive, e))
}

/// First directory, in sorted top-down order, whose last three path segments below `base`
/// are all numeric (`yyyy/mm/dd`).
pub fn find_innermost_dir(base: &Path) -> Result<PathBuf> {
    let not_found = |reason: String| Error::InnermostDirNotFound { path: base.to_path_buf(), reason };
    match walk_for_dated_dir(base, base) {
        Ok(Some(dir)) => Ok(dir),
        Ok(None) => Err(not_found("no such directory".to_string())),
        Err(e) => Err(not_found(e.to_string())),
    }
}

fn walk_for_dated_dir(base: &Path, dir: &Path) -> io::Result<Option<PathBuf>> {
    if is_dated(base, dir) {
        return Ok(Some(dir.to_path_buf()));
    }

    let mut children = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            children.push(entry.path());
        }
    }
    children.sort();

    for child in children {
        if let Some(found) = walk_for_dated_dir(base, &child)? {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

fn is_dated(base: &Path, dir: &Path) -> bool {
    let Ok(relative) = dir.strip_prefix(base) else {
        return false;
    };
    let segments: Vec<&str> = relative.components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect();

    segments.len() >= 3
        && segments[segments.len() - 3..]
            .iter()
            .all(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
}

/// Calendar date spelled by the last three segments, when they form a valid date.
pub fn capture_date(dir: &Path) -> Option<NaiveDate> {
    let mut parts = dir.iter().rev().take(3).map(|s| s.to_str().and_then(|s| s.parse::<u32>().ok()));
    let day = parts.next()??;
    let month = parts.next()??;
    let year = parts.next()??;
    NaiveDate::from_ymd_opt(i32::try_from(year).ok()?, month, day)
}

/// Makes a capture readable in `staging`: `.gz` files are decompressed next to it under their
/// inner name, plain captures are used in place.
pub fn stage_capture(capture: &Path, staging: &Path) -> Result<PathBuf> {
    if !is_gzip(capture) {
        return Ok(capture.to_path_buf());
    }

    let inner_name = capture.file_stem().ok_or_else(|| Error::capture(capture, "no file name"))?;
    let target = staging.join(inner_name);
    let file = File::open(capture).map_err(|e| Error::capture(capture, e))?;
    let mut decoder = GzDecoder::new(BufReader::new(file));
    let mut out = File::create(&target).map_err(|e| Error::capture(&target, e))?;

    if let Err(e) = io::copy(&mut decoder, &mut out) {
        let _ = fs::remove_file(&target);
        return Err(Error::capture(capture, format!("decompression failed: {e}")));
    }
    Ok(target)
}

/// The endpoint not using the service port is taken to be the client.
pub fn infer_client(first: &PacketRecord) -> Option<IpAddr> {
    let ip = first.ip()?;
    let tcp = first.tcp.as_ref()?;

    if tcp.src_port != SERVICE_SOURCE_PORT {
        Some(ip.src)
    } else if tcp.dst_port != SERVICE_SOURCE_PORT {
        Some(ip.dst)
    } else {
        None
    }
}

/// Moves a file, falling back to copy-and-delete across filesystems.
/// Claims `dir/name`, or `dir/<qualifier>-name` when that is taken, by creating an empty
/// placeholder. Creation is exclusive, so concurrent workers never share a destination.
pub fn reserve_destination(dir: &Path, name: &str, qualifier: &str) -> io::Result<PathBuf> {
    for candidate in [dir.join(name), dir.join(format!("{qualifier}-{name}"))] {
        match fs::OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(io::ErrorKind::AlreadyExists, format!("{name} already present in {}", dir.display())))
}

/// Moves `from` onto `to`, replacing any placeholder left by [reserve_destination].
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}
