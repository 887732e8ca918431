//! Log line sources for the polling backend.
//!
//! A [`LogContainer`] remembers its read position in one file and hands out
//! the lines appended since the last poll. Rotation (inode change or
//! truncation) re-opens from the head. Invalid bytes are decoded lossily
//! with a warning, per the filter's encoding policy.

use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{Error, Result};

/// Where to start reading a newly added log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeekTo {
    /// From the beginning.
    #[default]
    Head,
    /// From the current end (only fresh lines).
    Tail,
}

impl SeekTo {
    /// Parse the optional `addlogpath` argument.
    pub fn parse(token: &str) -> Result<SeekTo> {
        match token {
            "head" => Ok(SeekTo::Head),
            "tail" => Ok(SeekTo::Tail),
            other => Err(Error::InvalidArgument(format!(
                "invalid log seek position {:?} (use 'head' or 'tail')",
                other
            ))),
        }
    }
}

#[derive(Debug, Default)]
struct ContainerState {
    pos: u64,
    ino: u64,
    /// Remainder of a line not yet terminated by a newline.
    pending: Vec<u8>,
}

/// One monitored log file.
#[derive(Debug)]
pub struct LogContainer {
    path: PathBuf,
    state: Mutex<ContainerState>,
}

impl LogContainer {
    /// Open a container; the file must exist.
    pub fn open(path: impl Into<PathBuf>, seek: SeekTo) -> Result<LogContainer> {
        let path = path.into();
        let md = std::fs::metadata(&path).map_err(|e| {
            Error::InvalidArgument(format!("have not found any log file for {:?}: {}", path, e))
        })?;
        let pos = match seek {
            SeekTo::Head => 0,
            SeekTo::Tail => md.size(),
        };
        Ok(LogContainer {
            path,
            state: Mutex::new(ContainerState {
                pos,
                ino: md.ino(),
                pending: Vec::new(),
            }),
        })
    }

    /// The monitored path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the lines appended since the last call.
    pub fn read_new_lines(&self) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        let md = std::fs::metadata(&self.path)?;

        // Rotation: a new inode or a shrunken file restarts from the head.
        if md.ino() != state.ino || md.size() < state.pos {
            state.ino = md.ino();
            state.pos = 0;
            state.pending.clear();
        }
        if md.size() == state.pos {
            return Ok(Vec::new());
        }

        let mut file = std::fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(state.pos))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        state.pos += buf.len() as u64;

        let mut data = std::mem::take(&mut state.pending);
        data.extend_from_slice(&buf);

        let mut lines = Vec::new();
        let mut start = 0;
        for (i, byte) in data.iter().enumerate() {
            if *byte == b'\n' {
                lines.push(decode_line(&self.path, &data[start..i]));
                start = i + 1;
            }
        }
        state.pending = data[start..].to_vec();
        Ok(lines)
    }
}

/// Decode one raw line, warning once per line on invalid bytes.
fn decode_line(path: &Path, raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(text) => text.trim_end_matches('\r').to_string(),
        Err(_) => {
            warn!(file = %path.display(), "Invalid byte sequence in log line, decoding lossily");
            String::from_utf8_lossy(raw).trim_end_matches('\r').to_string()
        }
    }
}
