use mailparse::{MailAddr, ParsedMail};

use crate::types::error::Result;
use crate::types::records::HeaderMap;

/// Headers (and optionally the plain-text body) of one fetched message
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    pub header: HeaderMap,
    pub body: Option<String>,
}

impl ParsedMessage {
    pub fn parse(raw: &[u8], with_body: bool) -> Result<Self> {
        let (headers, _) = mailparse::parse_headers(raw)?;
        let mut header = HeaderMap::new();
        for h in &headers {
            header
                .entry(h.get_key().to_lowercase())
                .or_default()
                .push(h.get_value());
        }

        let body = if with_body {
            let mail = mailparse::parse_mail(raw)?;
            text_body(&mail)
        } else {
            None
        };

        Ok(Self { header, body })
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.header
            .get(name)
            .and_then(|values| values.first())
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// The Message-ID header, or an id derived from the date and the
    /// return-path domain. Derived ids can collide.
    pub fn message_id(&self) -> String {
        match self.first("message-id") {
            Some(id) => id.to_string(),
            None => synthesize_message_id(self.first("date"), self.first("return-path")),
        }
    }

    /// Whether the first From address is `owner`.
    pub fn is_from(&self, owner: &str) -> bool {
        let Some(from) = self.first("from") else {
            return false;
        };
        let Ok(addrs) = mailparse::addrparse(from) else {
            return false;
        };
        let first = addrs.iter().find_map(|addr| match addr {
            MailAddr::Single(info) => Some(info.addr.clone()),
            MailAddr::Group(group) => group.addrs.first().map(|info| info.addr.clone()),
        });
        first
            .map(|addr| addr.trim().eq_ignore_ascii_case(owner.trim()))
            .unwrap_or(false)
    }
}

fn synthesize_message_id(date: Option<&str>, return_path: Option<&str>) -> String {
    let timestamp = date
        .and_then(|d| mailparse::dateparse(d).ok())
        .map(|ts| ts.to_string())
        .unwrap_or_else(|| "0".to_string());
    let domain = return_path
        .and_then(|rp| rp.trim_matches(|c| c == '<' || c == '>').rsplit_once('@'))
        .map(|(_, domain)| domain.trim().to_lowercase())
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    format!("<unknown-{}@{}>", timestamp, domain)
}

fn text_body(mail: &ParsedMail) -> Option<String> {
    if let Some(plain) = first_plain_part(mail) {
        return plain.get_body().ok();
    }
    // Single-part messages without a declared text/plain type
    if mail.subparts.is_empty() && mail.ctype.mimetype.starts_with("text/") {
        return mail.get_body().ok();
    }
    None
}

fn first_plain_part<'a>(mail: &'a ParsedMail<'a>) -> Option<&'a ParsedMail<'a>> {
    if mail.ctype.mimetype.eq_ignore_ascii_case("text/plain") {
        return Some(mail);
    }
    mail.subparts.iter().find_map(first_plain_part)
}
