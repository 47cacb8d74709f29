//! Maildir filename parsing
//!
//! Maildir stores one message per file in three subdirectories:
//! - `new/`: delivered, not yet seen by any client
//! - `cur/`: seen by a client at least once
//! - `tmp/`: delivery in progress
//!
//! Files in `cur/` are named `<unique-key>:2,<flags>` where flags are sorted
//! single characters:
//! - D = Draft
//! - F = Flagged
//! - P = Passed (forwarded)
//! - R = Replied
//! - S = Seen
//! - T = Trashed
//!
//! Only F, R, S and T map onto [`Flag`]; other characters are carried through
//! untouched when flags are rewritten.

use std::path::{Path, PathBuf};

use crate::types::Flag;

/// Separator between the unique key and the info section
pub const INFO_SEPARATOR: &str = ":2,";

/// A parsed maildir message filename
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaildirFilename {
    /// The unique key (before the colon)
    pub key: String,
    /// Raw flag characters from the info section
    pub info: String,
    /// Whether the file lives in `new/`
    pub is_new: bool,
    pub path: PathBuf,
}

impl MaildirFilename {
    /// Flags understood by the store; messages in `new/` are also Recent
    pub fn flags(&self) -> Vec<Flag> {
        let mut flags = parse_flags(&self.info);
        if self.is_new {
            flags.push(Flag::Recent);
        }
        flags
    }

    pub fn has(&self, ch: char) -> bool {
        self.info.contains(ch)
    }

    /// Filename (for `cur/`) with `ch` set or cleared
    pub fn with_flag(&self, ch: char, set: bool) -> String {
        let mut chars: Vec<char> = self.info.chars().filter(|c| *c != ch).collect();
        if set {
            chars.push(ch);
        }
        chars.sort_unstable();
        format!(
            "{}{}{}",
            self.key,
            INFO_SEPARATOR,
            chars.into_iter().collect::<String>()
        )
    }
}

/// Parse a message path into key, flags and location
///
/// `<unique-key>:2,RS` means Replied and Seen.
pub fn parse_filename(path: &Path) -> Option<MaildirFilename> {
    let filename = path.file_name()?.to_str()?;
    let parent_name = path.parent()?.file_name()?.to_str()?;
    if filename.starts_with('.') {
        return None;
    }

    let is_new = parent_name == "new";

    let (key, info) = match filename.find(':') {
        Some(colon_idx) => {
            let (id, rest) = filename.split_at(colon_idx);
            match rest.strip_prefix(INFO_SEPARATOR) {
                Some(flags) => (id.to_string(), flags.to_string()),
                None => (id.to_string(), String::new()),
            }
        }
        None => (filename.to_string(), String::new()),
    };

    Some(MaildirFilename {
        key,
        info,
        is_new,
        path: path.to_path_buf(),
    })
}

/// Map flag characters onto [`Flag`], ignoring the ones we have no use for
pub fn parse_flags(info: &str) -> Vec<Flag> {
    info.chars()
        .filter_map(|ch| match ch {
            'F' => Some(Flag::Flagged),
            'R' => Some(Flag::Answered),
            'S' => Some(Flag::Seen),
            'T' => Some(Flag::Deleted),
            _ => None,
        })
        .collect()
}

/// Convert flags back to sorted maildir characters
pub fn flags_to_string(flags: &[Flag]) -> String {
    let mut chars: Vec<char> = flags
        .iter()
        .filter_map(|flag| match flag {
            Flag::Flagged => Some('F'),
            Flag::Answered => Some('R'),
            Flag::Seen => Some('S'),
            Flag::Deleted => Some('T'),
            // Recent is the new/ directory, not a flag
            Flag::Recent => None,
        })
        .collect();
    chars.sort_unstable();
    chars.dedup();
    chars.into_iter().collect()
}
