//! File fingerprint primitives: modification times and content digests

use crate::error::{CigateError, CigateResult};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

const READ_CHUNK: usize = 64 * 1024;

/// Modification time in fractional seconds since the epoch.
///
/// `Ok(None)` means the path does not exist.
pub fn mtime_secs(path: &Path) -> CigateResult<Option<f64>> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(CigateError::io(
                format!("reading metadata of {}", path.display()),
                e,
            ))
        }
    };

    let modified = meta
        .modified()
        .map_err(|e| CigateError::io(format!("reading mtime of {}", path.display()), e))?;
    let secs = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(Some(secs))
}

/// MD5 of a file's contents as lowercase hex
pub fn md5_file(path: &Path) -> CigateResult<String> {
    let mut ctx = md5::Context::new();
    stream_file(path, |chunk| ctx.consume(chunk))?;
    Ok(format!("{:x}", ctx.compute()))
}

/// SHA-256 of a file's contents as lowercase hex
pub fn sha256_file(path: &Path) -> CigateResult<String> {
    let mut hasher = Sha256::new();
    stream_file(path, |chunk| hasher.update(chunk))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Feed a file to `sink` in fixed-size chunks.
///
/// Directories fail here: hashing modes reject them.
fn stream_file(path: &Path, mut sink: impl FnMut(&[u8])) -> CigateResult<()> {
    let context = || format!("hashing {}", path.display());
    let mut file = File::open(path).map_err(|e| CigateError::io(context(), e))?;
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf).map_err(|e| CigateError::io(context(), e))?;
        if n == 0 {
            break;
        }
        sink(&buf[..n]);
    }
    Ok(())
}

/// Absolute form of `path` used as the cache key
pub fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Cache key string for `path`
pub fn path_key(path: &Path) -> String {
    absolute(path).to_string_lossy().into_owned()
}

/// Current time in fractional seconds since the epoch
pub fn now_secs() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}
