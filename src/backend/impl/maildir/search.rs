//! Search query evaluation against maildir messages

use mailparse::{MailHeaderMap, ParsedMail};

use super::message::body_text;
use crate::types::*;

/// What a query can see of one message
pub struct Searchable<'a> {
    pub uid: Uid,
    pub flags: Vec<Flag>,
    pub mail: &'a ParsedMail<'a>,
    body: Option<String>,
}

impl<'a> Searchable<'a> {
    pub fn new(uid: Uid, flags: Vec<Flag>, mail: &'a ParsedMail<'a>) -> Self {
        Self {
            uid,
            flags,
            mail,
            body: None,
        }
    }

    fn header_contains(&self, key: &str, needle: &str) -> bool {
        self.mail
            .headers
            .get_all_values(key)
            .iter()
            .any(|value| contains_ignore_case(value, needle))
    }

    fn any_header_contains(&self, needle: &str) -> bool {
        self.mail
            .headers
            .iter()
            .any(|header| contains_ignore_case(&header.get_value(), needle))
    }

    fn body_contains(&mut self, needle: &str) -> bool {
        let mail = self.mail;
        let body = self.body.get_or_insert_with(|| body_text(mail));
        contains_ignore_case(body, needle)
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

pub fn matches_query(message: &mut Searchable, query: &SearchQuery) -> bool {
    match query {
        SearchQuery::All => true,
        SearchQuery::From(s) => message.header_contains("From", s),
        SearchQuery::To(s) => {
            message.header_contains("To", s) || message.header_contains("Cc", s)
        }
        SearchQuery::Subject(s) => message.header_contains("Subject", s),
        SearchQuery::Header(key, s) => message.header_contains(key, s),
        SearchQuery::Body(s) => message.body_contains(s),
        SearchQuery::Text(s) => message.any_header_contains(s) || message.body_contains(s),
        SearchQuery::Uid(uids) => uids.contains(&message.uid),
        SearchQuery::Seen => message.flags.contains(&Flag::Seen),
        SearchQuery::Unseen => !message.flags.contains(&Flag::Seen),
        SearchQuery::Flagged => message.flags.contains(&Flag::Flagged),
        SearchQuery::Unflagged => !message.flags.contains(&Flag::Flagged),
        SearchQuery::Answered => message.flags.contains(&Flag::Answered),
        SearchQuery::Unanswered => !message.flags.contains(&Flag::Answered),
        SearchQuery::Deleted => message.flags.contains(&Flag::Deleted),
        SearchQuery::Undeleted => !message.flags.contains(&Flag::Deleted),
        SearchQuery::And(q1, q2) => matches_query(message, q1) && matches_query(message, q2),
        SearchQuery::Or(q1, q2) => matches_query(message, q1) || matches_query(message, q2),
        SearchQuery::Not(q) => !matches_query(message, q),
    }
}
