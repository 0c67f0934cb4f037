//! The repository `config` file.
//!
//! A stable, line-oriented `key = value` format holding the repository
//! identity and the layout constants everything else derives paths from.
//! Unlike index files, `config` is a compatibility surface: the `version`
//! key signals format changes.

use std::{
    io::{self, Write as _},
    path::Path,
};

use log::debug;
use tempfile::NamedTempFile;

use crate::{repo::fs::sync_dir, Options};

pub const FILE_NAME: &str = "config";
pub const VERSION: u32 = 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    pub version: u32,
    /// Random identity of this repository, assigned at creation.
    pub id: [u8; 32],
    pub segments_per_dir: u32,
    pub max_segment_size: u64,
}

impl Config {
    /// A fresh configuration with a random repository id.
    pub fn generate(opts: &Options) -> Self {
        Self {
            version: VERSION,
            id: rand::random(),
            segments_per_dir: opts.segments_per_dir,
            max_segment_size: opts.max_segment_size,
        }
    }

    /// Parse a `config` file.
    pub fn parse(contents: &str) -> io::Result<Self> {
        let mut version = None;
        let mut id = None;
        let mut segments_per_dir = None;
        let mut max_segment_size = None;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(invalid(format!("malformed config line: {line}")));
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "version" => version = Some(parse_int(key, value)?),
                "id" => {
                    let bytes = hex::decode(value)
                        .map_err(|e| invalid(format!("malformed repository id: {e}")))?;
                    id = Some(
                        bytes
                            .try_into()
                            .map_err(|_| invalid("repository id must be 32 bytes"))?,
                    );
                }
                "segments_per_dir" => segments_per_dir = Some(parse_int(key, value)?),
                "max_segment_size" => max_segment_size = Some(parse_int(key, value)?),
                // Unknown keys may come from a newer version; the
                // `version` check decides whether that is fatal.
                _ => debug!("ignoring unknown config key: {key}"),
            }
        }

        let config = Self {
            version: version.ok_or_else(|| invalid("config is missing the version key"))?,
            id: id.ok_or_else(|| invalid("config is missing the id key"))?,
            segments_per_dir: segments_per_dir
                .ok_or_else(|| invalid("config is missing the segments_per_dir key"))?,
            max_segment_size: max_segment_size
                .ok_or_else(|| invalid("config is missing the max_segment_size key"))?,
        };
        if config.version != VERSION {
            return Err(invalid(format!(
                "unsupported repository version {}",
                config.version
            )));
        }
        if config.segments_per_dir == 0 {
            return Err(invalid("segments_per_dir must be positive"));
        }

        Ok(config)
    }

    /// Load the `config` file under `dir`.
    pub fn load(dir: &Path) -> io::Result<Self> {
        Self::parse(&std::fs::read_to_string(dir.join(FILE_NAME))?)
    }

    /// Write the `config` file under `dir`, atomically.
    pub fn write_atomic(&self, dir: &Path) -> io::Result<()> {
        let mut tmp = NamedTempFile::new_in(dir)?;
        {
            let out = tmp.as_file_mut();
            writeln!(out, "version = {}", self.version)?;
            writeln!(out, "id = {}", hex::encode(self.id))?;
            writeln!(out, "segments_per_dir = {}", self.segments_per_dir)?;
            writeln!(out, "max_segment_size = {}", self.max_segment_size)?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(dir.join(FILE_NAME)).map_err(|e| e.error)?;
        sync_dir(dir)
    }
}

fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> io::Result<T> {
    value
        .parse()
        .map_err(|_| invalid(format!("malformed config value for {key}: {value}")))
}

fn invalid(msg: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
