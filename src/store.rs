//! Keypoint and descriptor caching
//!
//! Features are cached per image so that repeated alignments against the
//! same reference do not recompute them. A cache entry is a pair of files:
//!
//! - `<key>.keypoints`: text, one `x,y,size,angle,response,octave,class_id`
//!   line per keypoint
//! - `<key>.descriptors`: bincode-encoded shape, element type and payload
//!
//! The key embeds the image size and modification time, so replacing an image
//! between runs never picks up stale features.

use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

use crate::error::{AlignError, Result};
use crate::features::{Descriptors, Features, Keypoint};

const DESCRIPTOR_VERSION: u32 = 1;

/// On-disk form of a descriptor matrix: shape, OpenCV element type and the
/// row-major payload.
#[derive(Debug, Serialize, Deserialize)]
struct DescriptorFile {
    version: u32,
    rows: u32,
    cols: u32,
    typ: i32,
    data: Vec<u8>,
}

/// Cache key of one image: file name plus a content fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for `path`, fingerprinted with its size and modification time.
    pub fn for_image(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path)?;
        let mtime = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        Ok(Self(format!("{}.{:x}-{:x}", name, meta.len(), mtime)))
    }

    /// Key of the reference entry for the same image. Reference features may
    /// be mask-filtered, so they never share an entry with query features.
    pub fn as_reference(&self) -> Self {
        Self(format!("{}.ref", self.0))
    }

    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// On-disk locations of one cache entry.
#[derive(Debug, Clone)]
pub struct CachePaths {
    pub keypoints: PathBuf,
    pub descriptors: PathBuf,
}

/// Directory of cached keypoints and descriptors.
#[derive(Debug, Clone)]
pub struct FeatureStore {
    dir: PathBuf,
}

impl FeatureStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn paths(&self, key: &CacheKey) -> CachePaths {
        CachePaths {
            keypoints: self.dir.join(format!("{}.keypoints", key)),
            descriptors: self.dir.join(format!("{}.descriptors", key)),
        }
    }

    /// Both artifacts present is the only hit condition.
    pub fn contains(&self, key: &CacheKey) -> bool {
        let paths = self.paths(key);
        paths.keypoints.is_file() && paths.descriptors.is_file()
    }

    pub fn save(&self, features: &Features, key: &CacheKey) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let paths = self.paths(key);
        // a stale half-entry may have been left read-only by an earlier run
        remove_if_exists(&paths.keypoints)?;
        remove_if_exists(&paths.descriptors)?;
        write_keypoints(&paths.keypoints, features.keypoints())?;
        write_descriptors(&paths.descriptors, features.descriptors())?;
        log::debug!("Cached {} features as {}", features.len(), key);
        Ok(())
    }

    pub fn load(&self, key: &CacheKey) -> Result<Features> {
        let paths = self.paths(key);
        for path in [&paths.keypoints, &paths.descriptors] {
            if !path.is_file() {
                return Err(AlignError::NotFound { path: path.clone() });
            }
        }
        let keypoints = read_keypoints(&paths.keypoints)?;
        let descriptors = read_descriptors(&paths.descriptors)?;
        Features::new(keypoints, descriptors)
    }

    /// Protect an entry that other workers read concurrently.
    pub fn mark_read_only(&self, key: &CacheKey) -> Result<()> {
        let paths = self.paths(key);
        for path in [&paths.keypoints, &paths.descriptors] {
            let mut permissions = fs::metadata(path)?.permissions();
            permissions.set_readonly(true);
            fs::set_permissions(path, permissions)?;
        }
        Ok(())
    }

    /// Delete an entry. Missing files are not an error.
    pub fn remove(&self, key: &CacheKey) -> Result<()> {
        let paths = self.paths(key);
        for path in [&paths.keypoints, &paths.descriptors] {
            remove_if_exists(path)?;
        }
        Ok(())
    }
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn write_keypoints(path: &Path, keypoints: &[Keypoint]) -> Result<()> {
    let mut out = BufWriter::new(fs::File::create(path)?);
    for kp in keypoints {
        writeln!(
            out,
            "{},{},{},{},{},{},{}",
            kp.x, kp.y, kp.size, kp.angle, kp.response, kp.octave, kp.class_id
        )?;
    }
    out.flush()?;
    Ok(())
}

fn read_keypoints(path: &Path) -> Result<Vec<Keypoint>> {
    let content = fs::read_to_string(path)?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            parse_keypoint(line.trim()).ok_or_else(|| {
                AlignError::invalid_data(format!(
                    "{}:{}: malformed keypoint line",
                    path.display(),
                    n + 1
                ))
            })
        })
        .collect()
}

fn parse_keypoint(line: &str) -> Option<Keypoint> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() != 7 {
        return None;
    }
    Some(Keypoint {
        x: fields[0].parse().ok()?,
        y: fields[1].parse().ok()?,
        size: fields[2].parse().ok()?,
        angle: fields[3].parse().ok()?,
        response: fields[4].parse().ok()?,
        octave: fields[5].parse().ok()?,
        class_id: fields[6].parse().ok()?,
    })
}

fn write_descriptors(path: &Path, descriptors: &Descriptors) -> Result<()> {
    let file = DescriptorFile {
        version: DESCRIPTOR_VERSION,
        rows: descriptors.len() as u32,
        cols: descriptors.cols().max(0) as u32,
        typ: descriptors.typ(),
        data: descriptors.as_bytes()?.to_vec(),
    };
    let mut out = BufWriter::new(fs::File::create(path)?);
    bincode::serialize_into(&mut out, &file).map_err(|e| match *e {
        bincode::ErrorKind::Io(io) => AlignError::Io(io),
        other => AlignError::invalid_data(format!("{}: {}", path.display(), other)),
    })?;
    out.flush()?;
    Ok(())
}

fn read_descriptors(path: &Path) -> Result<Descriptors> {
    let bytes = fs::read(path)?;
    let file: DescriptorFile = bincode::deserialize(&bytes).map_err(|e| {
        AlignError::invalid_data(format!("{} is not a descriptor file: {}", path.display(), e))
    })?;
    if file.version != DESCRIPTOR_VERSION {
        return Err(AlignError::invalid_data(format!(
            "{}: unsupported descriptor version {}",
            path.display(),
            file.version
        )));
    }
    Descriptors::from_bytes(file.rows as i32, file.cols as i32, file.typ, &file.data)
}
