// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fxcorr contributors

//! The line wire format.
//!
//! Requests are `?verb arg1 arg2 ...\n`, replies `!verb ok|fail|invalid
//! [fields...]\n`, unsolicited notices `#inform ...\n`. Fields are
//! whitespace-separated; spaces inside a field are escaped as `\_`.

/// Escape one field for the wire.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ' ' => out.push_str("\\_"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

/// Undo [`escape`].
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('_') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// A parsed `?verb ...` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub verb: String,
    pub args: Vec<String>,
}

/// Parse one request line. Returns `None` for blank lines and anything
/// that is not a request.
pub fn parse_request(line: &str) -> Option<Request> {
    let line = line.trim();
    let body = line.strip_prefix('?')?;
    let mut parts = body.split_ascii_whitespace();
    let verb = parts.next()?.to_string();
    let args = parts.map(unescape).collect();
    Some(Request { verb, args })
}

/// The reply to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok(Vec<String>),
    Fail { kind: String, message: String },
    Invalid(String),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Ok(Vec::new())
    }

    pub fn ok_with(fields: Vec<String>) -> Self {
        Reply::Ok(fields)
    }

    pub fn fail(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Reply::Fail {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Render with the verb echoed back, ready for the wire.
    pub fn render(&self, verb: &str) -> String {
        match self {
            Reply::Ok(fields) => {
                let mut line = format!("!{verb} ok");
                for field in fields {
                    line.push(' ');
                    line.push_str(&escape(field));
                }
                line
            }
            Reply::Fail { kind, message } => {
                format!("!{verb} fail {kind} {}", escape(message))
            }
            Reply::Invalid(message) => format!("!{verb} invalid {}", escape(message)),
        }
    }
}

impl From<fxcorr::Error> for Reply {
    fn from(e: fxcorr::Error) -> Self {
        Reply::Fail {
            kind: e.kind_token().to_string(),
            message: e.to_string(),
        }
    }
}

/// Render an inform line.
pub fn render_inform(name: &str, fields: &[String]) -> String {
    let mut line = format!("#{}", escape(name));
    for field in fields {
        line.push(' ');
        line.push_str(&escape(field));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_round_trip() {
        for s in ["plain", "two words", "tabs\tand\nnewlines", "back\\slash"] {
            assert_eq!(unescape(&escape(s)), s);
        }
    }

    #[test]
    fn test_parse_request() {
        let req = parse_request("?gain ant0x 300\n").expect("request");
        assert_eq!(req.verb, "gain");
        assert_eq!(req.args, vec!["ant0x".to_string(), "300".to_string()]);
        assert!(parse_request("#inform something").is_none());
        assert!(parse_request("").is_none());
    }

    #[test]
    fn test_parse_unescapes_args() {
        let req = parse_request("?create /tmp/my\\_config.toml").expect("request");
        assert_eq!(req.args[0], "/tmp/my config.toml");
    }

    #[test]
    fn test_reply_render() {
        assert_eq!(Reply::ok().render("ping"), "!ping ok");
        assert_eq!(
            Reply::ok_with(vec!["a".into(), "b c".into()]).render("input-labels"),
            "!input-labels ok a b\\_c"
        );
        assert_eq!(
            Reply::fail("bad_address", "no port").render("capture-destination"),
            "!capture-destination fail bad_address no\\_port"
        );
    }

    #[test]
    fn test_inform_render() {
        assert_eq!(
            render_inform("ant0x", &["239.0.0.10+1:7148".to_string()]),
            "#ant0x 239.0.0.10+1:7148"
        );
    }
}
