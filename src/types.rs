//! Core mailbox types shared by the store and the backends

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Message UID (unique within an open directory, assigned by the backend)
pub type Uid = u32;

/// Directory (folder) name, `/`-separated for nested folders
pub type DirectoryName = String;

/// Message flags understood by the store
///
/// This is a closed set: backends map whatever they store onto these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Flag {
    Seen,
    Recent,
    Answered,
    Deleted,
    Flagged,
}

impl Flag {
    pub fn to_imap_string(&self) -> &'static str {
        match self {
            Flag::Seen => "\\Seen",
            Flag::Recent => "\\Recent",
            Flag::Answered => "\\Answered",
            Flag::Deleted => "\\Deleted",
            Flag::Flagged => "\\Flagged",
        }
    }

    pub fn from_imap_string(s: &str) -> Option<Self> {
        match s {
            "\\Seen" => Some(Flag::Seen),
            "\\Recent" => Some(Flag::Recent),
            "\\Answered" => Some(Flag::Answered),
            "\\Deleted" => Some(Flag::Deleted),
            "\\Flagged" => Some(Flag::Flagged),
            _ => None,
        }
    }
}

/// A directory advertised by a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    pub name: DirectoryName,
    pub attributes: Vec<String>,
}

/// Metadata for the currently open directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryInfo {
    pub name: DirectoryName,
    pub flags: Vec<String>,
    pub read_only: bool,
    /// Total number of messages in the directory
    pub exists: usize,
    /// Messages not seen since the directory was last opened
    pub recent: usize,
    /// Unread messages
    pub unseen: usize,
}

/// A single mailbox address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: Option<String>,
    pub mailbox: String,
    pub host: String,
}

impl Address {
    /// Render as `Name <mailbox@host>`, quoting the name when it is not a plain atom
    pub fn format(&self) -> String {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => {
                if name.chars().all(is_atom_char) {
                    format!("{} <{}@{}>", name, self.mailbox, self.host)
                } else {
                    format!(
                        "\"{}\" <{}@{}>",
                        name.replace('"', "'"),
                        self.mailbox,
                        self.host
                    )
                }
            }
            _ => format!("<{}@{}>", self.mailbox, self.host),
        }
    }
}

fn is_atom_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == ' ' || "!#$%&'*+-/=?^_`{|}~".contains(c)
}

/// Format a list of addresses, separated by commas
pub fn format_addresses(addrs: &[Address]) -> String {
    addrs
        .iter()
        .map(Address::format)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parsed envelope of a message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub date: Option<DateTime<Utc>>,
    pub subject: String,
    pub from: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub message_id: String,
}

/// MIME structure of a message, possibly nested
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyStructure {
    pub mime_type: String,
    pub mime_subtype: String,
    pub params: HashMap<String, String>,
    pub description: Option<String>,
    pub encoding: Option<String>,
    pub parts: Vec<BodyStructure>,
    pub disposition: Option<String>,
    pub disposition_params: HashMap<String, String>,
}

/// Cached per-message information
///
/// Backends may send partially populated records (e.g. a flag update with no
/// envelope); the store merges them into what it already knows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub uid: Uid,
    pub body_structure: Option<BodyStructure>,
    pub envelope: Option<Envelope>,
    pub flags: Vec<Flag>,
    pub internal_date: Option<DateTime<Utc>>,
    /// Size in bytes
    pub size: u32,
}

impl MessageInfo {
    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }
}

/// An entire raw message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullMessage {
    pub uid: Uid,
    pub content: Vec<u8>,
}

/// A decoded MIME part of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBodyPart {
    pub uid: Uid,
    pub content: Vec<u8>,
}

/// Search query evaluated by a backend against the open directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchQuery {
    All,
    /// Matches headers or body
    Text(String),
    From(String),
    To(String),
    Subject(String),
    Body(String),
    Header(String, String),
    Uid(Vec<Uid>),
    Seen,
    Unseen,
    Flagged,
    Unflagged,
    Answered,
    Unanswered,
    Deleted,
    Undeleted,
    And(Box<SearchQuery>, Box<SearchQuery>),
    Or(Box<SearchQuery>, Box<SearchQuery>),
    Not(Box<SearchQuery>),
}
