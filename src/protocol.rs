//! Worker protocol messages
//!
//! Everything exchanged between the interactive side and a backend is a
//! [`WorkerMessage`]: a body (an [`Action`] travelling towards the backend, or an
//! [`Event`] travelling back) plus an identity and an optional causation link.
//!
//! Identity is stamped by the worker channel pair when it accepts the message,
//! never at construction, so identifiers are handed out in the order messages
//! enter the queues. A reply names the request it answers explicitly through
//! `in_response_to`; nothing else (id arithmetic, payload fields, variant) is
//! ever used to correlate.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::AccountConfig;
use crate::error::Error;
use crate::types::*;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique, monotonically increasing message identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u64);

impl MessageId {
    pub(crate) fn next() -> Self {
        Self(NEXT_MESSAGE_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Requests issued by the interactive side
#[derive(Debug)]
pub enum Action {
    Configure(AccountConfig),
    Connect,
    Disconnect,
    ListDirectories,
    OpenDirectory {
        directory: DirectoryName,
    },
    FetchDirectoryContents,
    SearchDirectory {
        criteria: SearchQuery,
    },
    CreateDirectory {
        directory: DirectoryName,
        /// Do not fail when the directory already exists
        quiet: bool,
    },
    FetchMessageHeaders {
        uids: Vec<Uid>,
    },
    FetchFullMessages {
        uids: Vec<Uid>,
    },
    FetchMessageBodyPart {
        uid: Uid,
        /// 1-based MIME part path, e.g. `[2, 1]`
        part: Vec<usize>,
    },
    DeleteMessages {
        uids: Vec<Uid>,
    },
    /// Mark messages as read or unread
    ReadMessages {
        read: bool,
        uids: Vec<Uid>,
    },
    CopyMessages {
        destination: DirectoryName,
        uids: Vec<Uid>,
    },
    AppendMessage {
        destination: DirectoryName,
        flags: Vec<Flag>,
        date: Option<DateTime<Utc>>,
        content: Vec<u8>,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Configure(_) => "Configure",
            Action::Connect => "Connect",
            Action::Disconnect => "Disconnect",
            Action::ListDirectories => "ListDirectories",
            Action::OpenDirectory { .. } => "OpenDirectory",
            Action::FetchDirectoryContents => "FetchDirectoryContents",
            Action::SearchDirectory { .. } => "SearchDirectory",
            Action::CreateDirectory { .. } => "CreateDirectory",
            Action::FetchMessageHeaders { .. } => "FetchMessageHeaders",
            Action::FetchFullMessages { .. } => "FetchFullMessages",
            Action::FetchMessageBodyPart { .. } => "FetchMessageBodyPart",
            Action::DeleteMessages { .. } => "DeleteMessages",
            Action::ReadMessages { .. } => "ReadMessages",
            Action::CopyMessages { .. } => "CopyMessages",
            Action::AppendMessage { .. } => "AppendMessage",
        }
    }
}

/// Data and outcomes produced by a backend
#[derive(Debug)]
pub enum Event {
    Done,
    Error(Error),
    /// The backend has no handler for the action; a capability signal, not a failure
    Unsupported,
    Directory(Directory),
    DirectoryInfo(DirectoryInfo),
    DirectoryContents {
        uids: Vec<Uid>,
    },
    SearchResults {
        uids: Vec<Uid>,
    },
    MessageInfo(MessageInfo),
    FullMessage(FullMessage),
    MessageBodyPart(MessageBodyPart),
    MessagesDeleted {
        uids: Vec<Uid>,
    },
}

impl Event {
    /// Done, Error and Unsupported end the conversation for an action
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Done | Event::Error(_) | Event::Unsupported)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::Done => "Done",
            Event::Error(_) => "Error",
            Event::Unsupported => "Unsupported",
            Event::Directory(_) => "Directory",
            Event::DirectoryInfo(_) => "DirectoryInfo",
            Event::DirectoryContents { .. } => "DirectoryContents",
            Event::SearchResults { .. } => "SearchResults",
            Event::MessageInfo(_) => "MessageInfo",
            Event::FullMessage(_) => "FullMessage",
            Event::MessageBodyPart(_) => "MessageBodyPart",
            Event::MessagesDeleted { .. } => "MessagesDeleted",
        }
    }
}

/// A protocol message as it travels through the worker queues
#[derive(Debug)]
pub struct WorkerMessage<T> {
    id: MessageId,
    in_response_to: Option<MessageId>,
    body: T,
}

impl<T> WorkerMessage<T> {
    /// Assign a fresh identity; only called by the channel pair on acceptance
    pub(crate) fn stamp(body: T, in_response_to: Option<MessageId>) -> Self {
        Self {
            id: MessageId::next(),
            in_response_to,
            body,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// The request this message answers, if any
    pub fn in_response_to(&self) -> Option<MessageId> {
        self.in_response_to
    }

    pub fn body(&self) -> &T {
        &self.body
    }

    pub fn into_body(self) -> T {
        self.body
    }
}

pub type ActionMessage = WorkerMessage<Action>;
pub type EventMessage = WorkerMessage<Event>;
