//! KATCP line codec
//!
//! A message is one line: a type character (`?` request, `!` reply,
//! `#` inform), the message name with an optional `[id]`, then
//! whitespace-separated escaped arguments.

use crate::error::{PollError, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Reply,
    Inform,
}

impl MessageKind {
    fn type_char(self) -> char {
        match self {
            MessageKind::Request => '?',
            MessageKind::Reply => '!',
            MessageKind::Inform => '#',
        }
    }

    fn from_type_char(c: char) -> Option<Self> {
        match c {
            '?' => Some(MessageKind::Request),
            '!' => Some(MessageKind::Reply),
            '#' => Some(MessageKind::Inform),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub name: String,
    pub mid: Option<u32>,
    pub arguments: Vec<String>,
}

impl Message {
    pub fn request(name: &str, arguments: Vec<String>) -> Self {
        Self {
            kind: MessageKind::Request,
            name: name.to_string(),
            mid: None,
            arguments,
        }
    }

    pub fn with_mid(mut self, mid: u32) -> Self {
        self.mid = Some(mid);
        self
    }

    /// Status token of a reply is its first argument
    pub fn reply_ok(&self) -> bool {
        self.kind == MessageKind::Reply && self.arguments.first().map(String::as_str) == Some("ok")
    }

    /// Encode as a wire line, newline included
    pub fn encode(&self) -> String {
        let mut line = String::new();
        line.push(self.kind.type_char());
        line.push_str(&self.name);
        if let Some(mid) = self.mid {
            line.push_str(&format!("[{mid}]"));
        }
        for arg in &self.arguments {
            line.push(' ');
            line.push_str(&escape(arg));
        }
        line.push('\n');
        line
    }

    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut chars = line.chars();
        let kind = chars
            .next()
            .and_then(MessageKind::from_type_char)
            .ok_or_else(|| PollError::protocol("decode", format!("bad message type in {line:?}")))?;

        let mut tokens = chars.as_str().split([' ', '\t']).filter(|t| !t.is_empty());
        let head = tokens
            .next()
            .ok_or_else(|| PollError::protocol("decode", "message without a name"))?;
        let (name, mid) = split_mid(head)?;
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(PollError::protocol("decode", format!("invalid message name {name:?}")));
        }

        let arguments = tokens.map(unescape).collect::<Result<Vec<_>>>()?;
        Ok(Self {
            kind,
            name: name.to_string(),
            mid,
            arguments,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encode().trim_end())
    }
}

fn split_mid(head: &str) -> Result<(&str, Option<u32>)> {
    match head.find('[') {
        None => Ok((head, None)),
        Some(open) => {
            let mid = head[open + 1..]
                .strip_suffix(']')
                .and_then(|m| m.parse::<u32>().ok())
                .ok_or_else(|| PollError::protocol("decode", format!("bad message id in {head:?}")))?;
            Ok((&head[..open], Some(mid)))
        }
    }
}

fn escape(arg: &str) -> String {
    if arg.is_empty() {
        return "\\@".to_string();
    }
    let mut out = String::with_capacity(arg.len());
    for c in arg.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ' ' => out.push_str("\\_"),
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x1b' => out.push_str("\\e"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(raw: &str) -> Result<String> {
    if raw == "\\@" {
        return Ok(String::new());
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let decoded = match chars.next() {
            Some('\\') => '\\',
            Some('_') => ' ',
            Some('0') => '\0',
            Some('n') => '\n',
            Some('r') => '\r',
            Some('e') => '\x1b',
            Some('t') => '\t',
            other => {
                return Err(PollError::protocol(
                    "decode",
                    format!("invalid escape {other:?} in argument {raw:?}"),
                ))
            }
        };
        out.push(decoded);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply_with_status() {
        let msg = Message::parse("!array-list ok 1\n").unwrap();
        assert_eq!(msg.kind, MessageKind::Reply);
        assert_eq!(msg.name, "array-list");
        assert!(msg.reply_ok());
        assert_eq!(msg.arguments, vec!["ok", "1"]);
    }

    #[test]
    fn test_parse_failed_reply() {
        let msg = Message::parse("!array-list fail No\\_arrays").unwrap();
        assert!(!msg.reply_ok());
        assert_eq!(msg.arguments[1], "No arrays");
    }

    #[test]
    fn test_parse_inform_with_message_id() {
        let msg = Message::parse("#sensor-value[7] 1520000000.1 1 fhost00.network.device-status nominal ok").unwrap();
        assert_eq!(msg.kind, MessageKind::Inform);
        assert_eq!(msg.mid, Some(7));
        assert_eq!(msg.arguments.len(), 5);
        assert_eq!(msg.arguments[2], "fhost00.network.device-status");
    }

    #[test]
    fn test_request_with_message_id() {
        let line = Message::request("sensor-value", vec![]).with_mid(12).encode();
        assert_eq!(line, "?sensor-value[12]\n");
        assert_eq!(Message::parse(&line).unwrap().mid, Some(12));
    }

    #[test]
    fn test_escapes_survive_encoding() {
        let msg = Message::request(
            "sensor-value",
            vec!["{'a': 'b c'}".to_string(), String::new(), "back\\slash".to_string()],
        );
        let line = msg.encode();
        assert_eq!(line, "?sensor-value {'a':\\_'b\\_c'} \\@ back\\\\slash\n");
        assert_eq!(Message::parse(&line).unwrap(), msg);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Message::parse("hello world").is_err());
        assert!(Message::parse("?").is_err());
        assert!(Message::parse("#log bad\\q").is_err());
        assert!(Message::parse("!reply[x] ok").is_err());
    }
}
