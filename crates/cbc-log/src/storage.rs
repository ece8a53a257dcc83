//! Durable storage for delivered events.
//!
//! Only delivered entries are persisted. Pending buffers are rebuilt from
//! peers through backfill after a restart, so a crash never loses anything
//! that was not already safe to show.

use crate::error::{LogError, Result};
use cbc_core::event::{Message, MembershipEvent};
use cbc_core::ids::GroupId;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Everything persisted for one group, in delivery order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoredGroup {
    pub messages: Vec<Message>,
    pub membership: Vec<MembershipEvent>,
}

impl StoredGroup {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.membership.is_empty()
    }
}

/// Append-only persistence of delivery logs.
pub trait LogStorage: Send + Sync {
    fn append_message(&self, message: &Message) -> Result<()>;

    fn append_membership(&self, event: &MembershipEvent) -> Result<()>;

    /// Load both streams of a group. Unknown groups load empty.
    fn load(&self, group: &GroupId) -> Result<StoredGroup>;

    /// Every group with at least one persisted entry.
    fn groups(&self) -> Result<Vec<GroupId>>;

    /// Force buffered writes to stable storage.
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory storage for tests and simulations.
#[derive(Debug, Default)]
pub struct MemoryLogStorage {
    groups: Mutex<HashMap<GroupId, StoredGroup>>,
}

impl MemoryLogStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStorage for MemoryLogStorage {
    fn append_message(&self, message: &Message) -> Result<()> {
        self.groups
            .lock()
            .entry(message.group.clone())
            .or_default()
            .messages
            .push(message.clone());
        Ok(())
    }

    fn append_membership(&self, event: &MembershipEvent) -> Result<()> {
        self.groups
            .lock()
            .entry(event.group.clone())
            .or_default()
            .membership
            .push(event.clone());
        Ok(())
    }

    fn load(&self, group: &GroupId) -> Result<StoredGroup> {
        Ok(self.groups.lock().get(group).cloned().unwrap_or_default())
    }

    fn groups(&self) -> Result<Vec<GroupId>> {
        let mut groups: Vec<GroupId> = self.groups.lock().keys().cloned().collect();
        groups.sort();
        Ok(groups)
    }
}

const CHAT_FILE: &str = "chat.jsonl";
const MEMBERSHIP_FILE: &str = "membership.jsonl";

/// One directory per group holding a JSON-lines file per stream.
///
/// ```text
/// <root>/<encoded group id>/chat.jsonl
/// <root>/<encoded group id>/membership.jsonl
/// ```
#[derive(Debug)]
pub struct FileLogStorage {
    root: PathBuf,
    /// Serializes appends so lines from concurrent writers never interleave.
    write_lock: Mutex<()>,
}

impl FileLogStorage {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "opened log storage");
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn group_dir(&self, group: &GroupId) -> PathBuf {
        self.root.join(encode_component(group.as_str()))
    }

    fn append_line<T: Serialize>(&self, group: &GroupId, file: &str, entry: &T) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let _guard = self.write_lock.lock();
        let dir = self.group_dir(group);
        fs::create_dir_all(&dir)?;
        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(file))?;
        out.write_all(line.as_bytes())?;
        out.flush()?;
        Ok(())
    }

    fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<String> = BufReader::new(file).lines().collect::<std::io::Result<_>>()?;
        let last = lines.len();
        let mut entries = Vec::with_capacity(last);
        for (idx, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(_) if idx + 1 == last => {
                    // a torn final write; everything before it is intact
                    warn!(path = %path.display(), line = idx + 1, "ignoring truncated log entry");
                    break;
                }
                Err(_) => {
                    return Err(LogError::Corrupt {
                        path: path.to_path_buf(),
                        line: idx + 1,
                    })
                }
            }
        }
        Ok(entries)
    }
}

impl LogStorage for FileLogStorage {
    fn append_message(&self, message: &Message) -> Result<()> {
        self.append_line(&message.group, CHAT_FILE, message)
    }

    fn append_membership(&self, event: &MembershipEvent) -> Result<()> {
        self.append_line(&event.group, MEMBERSHIP_FILE, event)
    }

    fn load(&self, group: &GroupId) -> Result<StoredGroup> {
        let dir = self.group_dir(group);
        Ok(StoredGroup {
            messages: Self::read_lines(&dir.join(CHAT_FILE))?,
            membership: Self::read_lines(&dir.join(MEMBERSHIP_FILE))?,
        })
    }

    fn groups(&self) -> Result<Vec<GroupId>> {
        let mut groups = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().and_then(decode_component) {
                Some(id) => groups.push(GroupId::new(id)),
                None => warn!(dir = ?name, "skipping unrecognized directory in log root"),
            }
        }
        groups.sort();
        Ok(groups)
    }
}

/// Escape a group id into a single portable path component.
fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' if raw != "." && raw != ".." => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn decode_component(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
