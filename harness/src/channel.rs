//! Bounded, single-writer/single-reader result transfer between processes.
//!
//! The channel is a file with a fixed-size header followed by a payload region
//! of `capacity` bytes:
//!
//! ```text
//! 0..4   magic "HRC1"
//! 4      state (0 = empty, 1 = complete, 2 = overflow)
//! 8..16  payload length (attempted length for overflow), little endian
//! 16..   payload
//! ```
//!
//! The writer stores the payload first and commits the state byte last, so a
//! writer killed mid-write leaves the channel `Empty` and the reader never sees
//! half a report. Ordering between the two sides comes from process lifetime:
//! the supervisor only reads after the worker exited.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const MAGIC: &[u8; 4] = b"HRC1";
const STATE_OFFSET: u64 = 4;
const LENGTH_OFFSET: u64 = 8;
/// Bytes reserved in front of the payload region.
pub const HEADER_LEN: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Empty,
    Complete,
    Overflow,
}

impl ChannelState {
    fn to_byte(self) -> u8 {
        match self {
            ChannelState::Empty => 0,
            ChannelState::Complete => 1,
            ChannelState::Overflow => 2,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ChannelState::Empty),
            1 => Some(ChannelState::Complete),
            2 => Some(ChannelState::Overflow),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("report of {size} bytes exceeds channel capacity of {capacity} bytes")]
    Overflow { size: u64, capacity: u64 },
    #[error("channel {} holds an undrained report", path.display())]
    NotDrained { path: PathBuf },
    #[error("channel {} is empty: nothing was committed", path.display())]
    Empty { path: PathBuf },
    #[error("channel {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("channel capacity must be > 0")]
    ZeroCapacity,
    #[error("encode report: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("decode report from {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("channel io on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ChannelError {
    /// True when the report never made it into the channel in one piece.
    pub fn is_missing_output(&self) -> bool {
        matches!(
            self,
            ChannelError::Overflow { .. } | ChannelError::Empty { .. }
        )
    }
}

#[derive(Debug)]
pub struct ResultChannel {
    path: PathBuf,
    capacity: u64,
    // Supervisor side owns the backing file and removes it on drop.
    #[allow(dead_code)]
    backing: Option<NamedTempFile>,
}

impl ResultChannel {
    /// Allocate a fresh, empty channel in the system temp directory.
    pub fn allocate(capacity: usize) -> Result<Self, ChannelError> {
        Self::allocate_in(&std::env::temp_dir(), capacity)
    }

    pub fn allocate_in(dir: &Path, capacity: usize) -> Result<Self, ChannelError> {
        if capacity == 0 {
            return Err(ChannelError::ZeroCapacity);
        }
        let backing = tempfile::Builder::new()
            .prefix("harness-channel-")
            .suffix(".bin")
            .tempfile_in(dir)
            .map_err(|source| ChannelError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        let path = backing.path().to_path_buf();
        let capacity = capacity as u64;
        backing
            .as_file()
            .set_len(HEADER_LEN + capacity)
            .map_err(|source| io_error(&path, source))?;

        let mut channel = Self {
            path,
            capacity,
            backing: Some(backing),
        };
        channel.write_header(ChannelState::Empty, 0)?;
        debug!(path = %channel.path.display(), capacity, "result channel allocated");
        Ok(channel)
    }

    /// Attach to a channel allocated by another process.
    pub fn open(path: &Path) -> Result<Self, ChannelError> {
        let mut file = File::open(path).map_err(|source| io_error(path, source))?;
        let len = file
            .metadata()
            .map_err(|source| io_error(path, source))?
            .len();
        if len <= HEADER_LEN {
            return Err(ChannelError::Corrupt {
                path: path.to_path_buf(),
                reason: format!("file is {len} bytes, smaller than the header"),
            });
        }
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)
            .map_err(|source| io_error(path, source))?;
        if &magic != MAGIC {
            return Err(ChannelError::Corrupt {
                path: path.to_path_buf(),
                reason: "bad magic".to_string(),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            capacity: len - HEADER_LEN,
            backing: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn state(&self) -> Result<ChannelState, ChannelError> {
        self.read_header().map(|(state, _)| state)
    }

    /// Commit one report. Fails without writing a payload if it does not fit.
    pub fn write<T: Serialize>(&mut self, report: &T) -> Result<(), ChannelError> {
        if self.state()? != ChannelState::Empty {
            return Err(ChannelError::NotDrained {
                path: self.path.clone(),
            });
        }
        let payload = serde_json::to_vec(report).map_err(ChannelError::Encode)?;
        let size = payload.len() as u64;
        if size > self.capacity {
            warn!(size, capacity = self.capacity, "report exceeds channel capacity");
            self.write_header(ChannelState::Overflow, size)?;
            return Err(ChannelError::Overflow {
                size,
                capacity: self.capacity,
            });
        }

        let mut file = self.open_rw()?;
        file.seek(SeekFrom::Start(HEADER_LEN))
            .and_then(|_| file.write_all(&payload))
            .and_then(|_| file.sync_data())
            .map_err(|source| io_error(&self.path, source))?;
        drop(file);

        self.write_header(ChannelState::Complete, size)?;
        debug!(size, "report committed to channel");
        Ok(())
    }

    /// Read the committed report and leave the channel empty.
    pub fn drain<T: DeserializeOwned>(&mut self) -> Result<T, ChannelError> {
        let (state, size) = self.read_header()?;
        match state {
            ChannelState::Empty => {
                return Err(ChannelError::Empty {
                    path: self.path.clone(),
                });
            }
            ChannelState::Overflow => {
                self.reset()?;
                return Err(ChannelError::Overflow {
                    size,
                    capacity: self.capacity,
                });
            }
            ChannelState::Complete => {}
        }
        if size > self.capacity {
            return Err(ChannelError::Corrupt {
                path: self.path.clone(),
                reason: format!("length {size} exceeds capacity {}", self.capacity),
            });
        }

        let mut file = self.open_rw()?;
        let mut payload = vec![0u8; size as usize];
        file.seek(SeekFrom::Start(HEADER_LEN))
            .and_then(|_| file.read_exact(&mut payload))
            .map_err(|source| io_error(&self.path, source))?;
        drop(file);
        self.reset()?;

        serde_json::from_slice(&payload).map_err(|source| ChannelError::Decode {
            path: self.path.clone(),
            source,
        })
    }

    /// Discard whatever the channel holds.
    pub fn reset(&mut self) -> Result<(), ChannelError> {
        self.write_header(ChannelState::Empty, 0)
    }

    fn open_rw(&self) -> Result<File, ChannelError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|source| io_error(&self.path, source))
    }

    fn read_header(&self) -> Result<(ChannelState, u64), ChannelError> {
        let mut file = self.open_rw()?;
        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)
            .map_err(|source| io_error(&self.path, source))?;
        if &header[..4] != MAGIC {
            return Err(ChannelError::Corrupt {
                path: self.path.clone(),
                reason: "bad magic".to_string(),
            });
        }
        let state = ChannelState::from_byte(header[STATE_OFFSET as usize]).ok_or_else(|| {
            ChannelError::Corrupt {
                path: self.path.clone(),
                reason: format!("unknown state {}", header[STATE_OFFSET as usize]),
            }
        })?;
        let mut length = [0u8; 8];
        length.copy_from_slice(&header[LENGTH_OFFSET as usize..]);
        Ok((state, u64::from_le_bytes(length)))
    }

    fn write_header(&mut self, state: ChannelState, length: u64) -> Result<(), ChannelError> {
        let mut header = [0u8; HEADER_LEN as usize];
        header[..4].copy_from_slice(MAGIC);
        header[STATE_OFFSET as usize] = state.to_byte();
        header[LENGTH_OFFSET as usize..].copy_from_slice(&length.to_le_bytes());

        let mut file = self.open_rw()?;
        // Length first, state byte last: the state byte is the commit point.
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.write_all(&header[..STATE_OFFSET as usize]))
            .and_then(|_| file.seek(SeekFrom::Start(LENGTH_OFFSET)))
            .and_then(|_| file.write_all(&header[LENGTH_OFFSET as usize..]))
            .and_then(|_| file.sync_data())
            .and_then(|_| file.seek(SeekFrom::Start(STATE_OFFSET)))
            .and_then(|_| file.write_all(&header[STATE_OFFSET as usize..LENGTH_OFFSET as usize]))
            .and_then(|_| file.sync_data())
            .map_err(|source| io_error(&self.path, source))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ChannelError {
    ChannelError::Io {
        path: path.to_path_buf(),
        source,
    }
}
