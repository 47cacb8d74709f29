//! Message parsing: envelopes, MIME structure and body parts

use chrono::{DateTime, TimeZone, Utc};
use log::debug;
use mailparse::{
    addrparse_header, dateparse, parse_mail, DispositionType, MailAddr, MailHeader, MailHeaderMap,
    ParsedMail, SingleInfo,
};

use super::filename::MaildirFilename;
use crate::error::{Error, Result};
use crate::types::*;

/// Build the full record for a message file
pub fn message_info(
    uid: Uid,
    filename: &MaildirFilename,
    content: &[u8],
    internal_date: Option<DateTime<Utc>>,
) -> Result<MessageInfo> {
    let mail = parse_mail(content)?;
    Ok(MessageInfo {
        uid,
        body_structure: Some(body_structure(&mail)),
        envelope: Some(envelope(&mail.headers)),
        flags: filename.flags(),
        internal_date,
        size: content.len() as u32,
    })
}

pub fn envelope(headers: &[MailHeader]) -> Envelope {
    let date = headers
        .get_first_value("Date")
        .and_then(|value| dateparse(&value).ok())
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single());

    let message_id = headers
        .get_first_value("Message-ID")
        .map(|id| id.trim().trim_start_matches('<').trim_end_matches('>').to_string())
        .unwrap_or_default();

    Envelope {
        date,
        subject: headers.get_first_value("Subject").unwrap_or_default(),
        from: addresses(headers, "From"),
        reply_to: addresses(headers, "Reply-To"),
        to: addresses(headers, "To"),
        cc: addresses(headers, "Cc"),
        bcc: addresses(headers, "Bcc"),
        message_id,
    }
}

fn addresses(headers: &[MailHeader], key: &str) -> Vec<Address> {
    let Some(header) = headers.get_first_header(key) else {
        return Vec::new();
    };
    match addrparse_header(header) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                MailAddr::Single(info) => vec![to_address(info)],
                MailAddr::Group(group) => group.addrs.iter().map(to_address).collect(),
            })
            .collect(),
        Err(e) => {
            debug!("Unparseable {} header: {}", key, e);
            Vec::new()
        }
    }
}

fn to_address(info: &SingleInfo) -> Address {
    let (mailbox, host) = match info.addr.rsplit_once('@') {
        Some((mailbox, host)) => (mailbox.to_string(), host.to_string()),
        None => (info.addr.clone(), String::new()),
    };
    Address {
        name: info.display_name.clone(),
        mailbox,
        host,
    }
}

pub fn body_structure(mail: &ParsedMail) -> BodyStructure {
    let (mime_type, mime_subtype) = match mail.ctype.mimetype.split_once('/') {
        Some((t, s)) => (t.to_string(), s.to_string()),
        None => (mail.ctype.mimetype.clone(), String::new()),
    };

    let (disposition, disposition_params) =
        if mail.headers.get_first_value("Content-Disposition").is_some() {
            let parsed = mail.get_content_disposition();
            let name = match parsed.disposition {
                DispositionType::Inline => "inline".to_string(),
                DispositionType::Attachment => "attachment".to_string(),
                DispositionType::FormData => "form-data".to_string(),
                DispositionType::Extension(ext) => ext,
            };
            (Some(name), parsed.params.into_iter().collect())
        } else {
            (None, Default::default())
        };

    BodyStructure {
        mime_type,
        mime_subtype,
        params: mail
            .ctype
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        description: mail.headers.get_first_value("Content-Description"),
        encoding: mail.headers.get_first_value("Content-Transfer-Encoding"),
        parts: mail.subparts.iter().map(body_structure).collect(),
        disposition,
        disposition_params,
    }
}

/// Walk a 1-based part path
///
/// A single-part message is its own part 1.
fn find_part<'a, 'b>(mail: &'b ParsedMail<'a>, path: &[usize]) -> Result<&'b ParsedMail<'a>> {
    let mut part = mail;
    for &index in path {
        if part.subparts.is_empty() && index == 1 {
            continue;
        }
        part = index
            .checked_sub(1)
            .and_then(|i| part.subparts.get(i))
            .ok_or_else(|| Error::NotFound(format!("body part {:?}", path)))?;
    }
    Ok(part)
}

/// The transfer-decoded content of one part
pub fn body_part(content: &[u8], path: &[usize]) -> Result<Vec<u8>> {
    let mail = parse_mail(content)?;
    Ok(find_part(&mail, path)?.get_body_raw()?)
}

/// Concatenated text of all `text/*` parts, for body searches
pub fn body_text(mail: &ParsedMail) -> String {
    if mail.subparts.is_empty() {
        if mail.ctype.mimetype.starts_with("text/") {
            return mail.get_body().unwrap_or_default();
        }
        return String::new();
    }
    mail.subparts
        .iter()
        .map(body_text)
        .collect::<Vec<_>>()
        .join("\n")
}
