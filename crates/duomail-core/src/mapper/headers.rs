use chrono::{DateTime, TimeZone, Utc};

use crate::gmail::types::MessagePart;

/// A parsed `Name <addr>` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub address: String,
    pub name: Option<String>,
}

pub fn header_value<'a>(payload: Option<&'a MessagePart>, name: &str) -> Option<&'a str> {
    payload.and_then(|p| {
        p.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    })
}

/// Decodes RFC 2047 encoded-words. Text without encoded-words, and words that fail to decode,
/// come back unchanged.
pub fn decode_encoded_words(value: &str) -> String {
    if !value.contains("=?") {
        return value.to_string();
    }

    // mailparse only decodes words inside a header, so wrap the value in a synthetic one.
    let synthetic = format!("X: {value}");
    match mailparse::parse_header(synthetic.as_bytes()) {
        // Gmail hands over header values as UTF-8, so the raw bytes are not Latin-1.
        Ok((header, _)) => header.get_value_utf8().unwrap_or_else(|_| value.to_string()),
        Err(_) => value.to_string(),
    }
}

pub fn parse_mailbox(value: &str) -> Option<Mailbox> {
    split_addresses(value)
        .into_iter()
        .find_map(|entry| parse_entry(&entry))
}

/// Splits an address-list header into unique mailboxes, keeping first-seen order.
pub fn parse_mailbox_list(value: &str) -> Vec<Mailbox> {
    let mut mailboxes: Vec<Mailbox> = Vec::new();
    for entry in split_addresses(value) {
        let Some(mailbox) = parse_entry(&entry) else {
            continue;
        };
        if !mailboxes
            .iter()
            .any(|m| m.address.eq_ignore_ascii_case(&mailbox.address))
        {
            mailboxes.push(mailbox);
        }
    }
    mailboxes
}

fn parse_entry(input: &str) -> Option<Mailbox> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if let (Some(start), Some(end)) = (input.find('<'), input.rfind('>')) {
        if start < end {
            let address = input[start + 1..end].trim();
            if address.is_empty() {
                return None;
            }
            let name_raw = input[..start].trim();
            let name = if name_raw.is_empty() {
                None
            } else {
                Some(decode_encoded_words(&strip_quotes(name_raw)))
            };
            return Some(Mailbox {
                address: address.to_string(),
                name: name.filter(|n| !n.trim().is_empty()),
            });
        }
    }

    let trimmed = input.trim_matches('<').trim_matches('>').trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(Mailbox {
            address: trimmed.to_string(),
            name: None,
        })
    }
}

fn strip_quotes(input: &str) -> String {
    let stripped = input
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(input);
    stripped.replace("\\\"", "\"")
}

fn split_addresses(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_angle = false;
    let mut prev_char: Option<char> = None;

    for ch in input.chars() {
        match ch {
            '"' if prev_char != Some('\\') => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            '<' if !in_quotes => {
                in_angle = true;
                current.push(ch);
            }
            '>' if !in_quotes => {
                in_angle = false;
                current.push(ch);
            }
            ',' if !in_quotes && !in_angle => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
        prev_char = Some(ch);
    }

    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }

    parts
}

/// Parses either an epoch-millis string or an RFC 2822 date. Returns `None` when neither form
/// applies.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.bytes().all(|b| b.is_ascii_digit() || b == b'-') {
        return trimmed
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis);
    }

    if let Ok(parsed) = DateTime::parse_from_rfc2822(strip_trailing_comment(trimmed)) {
        return Some(parsed.with_timezone(&Utc));
    }

    // mailparse tolerates the obsolete forms chrono rejects (two-digit years, named zones).
    mailparse::dateparse(trimmed)
        .ok()
        .and_then(|seconds| Utc.timestamp_opt(seconds, 0).single())
}

fn strip_trailing_comment(value: &str) -> &str {
    match value.rfind(" (") {
        Some(idx) if value.ends_with(')') => value[..idx].trim_end(),
        _ => value,
    }
}
