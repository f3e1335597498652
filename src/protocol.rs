//! Control protocol framing.
//!
//! This module turns the line-oriented byte stream of Tor's control port into
//! complete replies, and formats the handful of commands the monitor sends.
//!
//! # Reply Grammar
//!
//! Every line is `<3-digit code><separator><text>`:
//!
//! ```text
//!   250-version=0.4.8.12          ◄── '-' mid line, more lines follow
//!   250+ns/all=                   ◄── '+' data line, a block follows
//!   r relay1 AAAA... 9001 0
//!   ..dot-stuffed line            ◄── leading '.' doubled in data blocks
//!   .                             ◄── data block terminator
//!   250 OK                        ◄── ' ' end line, reply complete
//!
//!   650 BW 1024 2048              ◄── 6xx: asynchronous event
//! ```
//!
//! Replies carry no request identifier: a synchronous reply always belongs to
//! the oldest outstanding request. Asynchronous (`6xx`) replies may arrive
//! between any two replies, never inside one.
//!
//! # Malformed Input
//!
//! A line that cannot be classified produces [`Frame::Malformed`]. If it
//! arrives in the middle of a reply the rest of that reply is swallowed up to
//! its end line, so the following reply still lines up with the next request.

use std::collections::HashMap;

/// Status code prefix of asynchronous event replies.
pub const ASYNC_CODE: u16 = 650;

/// How a reply line continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    /// `' '`: final line of the reply.
    End,
    /// `'-'`: more lines follow.
    Mid,
    /// `'+'`: a dot-terminated data block follows.
    Data,
}

/// One logical reply line, with its data block if it had one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    /// Three-digit status code.
    pub code: u16,
    /// Continuation marker.
    pub separator: Separator,
    /// Text after the separator.
    pub text: String,
    /// Unstuffed data block lines for [`Separator::Data`] lines.
    pub data: Vec<String>,
}

impl ReplyLine {
    /// Splits `key=value` text, joining the data block for `+` lines.
    ///
    /// Lines without `=` return the whole text as key with `None` value,
    /// which is how `GETCONF` reports unset options.
    pub fn key_value(&self) -> (String, Option<String>) {
        match self.text.split_once('=') {
            Some((key, value)) => {
                if self.separator == Separator::Data {
                    let mut joined = value.to_string();
                    for (i, line) in self.data.iter().enumerate() {
                        if i > 0 || !joined.is_empty() {
                            joined.push('\n');
                        }
                        joined.push_str(line);
                    }
                    (key.to_string(), Some(joined))
                } else {
                    (key.to_string(), Some(value.to_string()))
                }
            }
            None => (self.text.clone(), None),
        }
    }
}

/// A complete reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Lines in arrival order; the last one has [`Separator::End`].
    pub lines: Vec<ReplyLine>,
}

impl Reply {
    /// Status code of the final line.
    pub fn code(&self) -> u16 {
        self.lines.last().map(|l| l.code).unwrap_or(0)
    }

    /// Returns `true` for `2xx` replies.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.code())
    }

    /// Returns `true` for `6xx` asynchronous replies.
    pub fn is_async(&self) -> bool {
        self.lines.first().map(|l| l.code / 100 == 6).unwrap_or(false)
    }

    /// Text of the final line.
    pub fn message(&self) -> &str {
        self.lines.last().map(|l| l.text.as_str()).unwrap_or("")
    }

    /// `key=value` pairs of every line except a bare trailing `OK`.
    pub fn key_values(&self) -> Vec<(String, Option<String>)> {
        self.lines
            .iter()
            .filter(|l| !(l.separator == Separator::End && l.text == "OK"))
            .map(ReplyLine::key_value)
            .collect()
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code(), self.message())
    }
}

/// Output of [`ReplyAssembler::push_line`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A well-formed reply.
    Reply(Reply),
    /// A reply containing an unclassifiable line.
    Malformed {
        /// Whether the broken reply started as an asynchronous event.
        is_async: bool,
        /// What was wrong.
        reason: String,
    },
}

/// Incremental reply parser.
///
/// Feed it one line at a time (without the trailing CRLF); it yields a
/// [`Frame`] whenever a reply completes.
#[derive(Debug, Default)]
pub struct ReplyAssembler {
    lines: Vec<ReplyLine>,
    data: Option<ReplyLine>,
    poisoned: Option<String>,
    first_code: Option<u16>,
}

impl ReplyAssembler {
    /// Creates an idle assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if no reply is partially assembled.
    pub fn is_idle(&self) -> bool {
        self.lines.is_empty() && self.data.is_none() && self.first_code.is_none()
    }

    /// Consumes one line.
    pub fn push_line(&mut self, raw: &str) -> Option<Frame> {
        let line = raw.strip_suffix('\r').unwrap_or(raw);

        if let Some(mut pending) = self.data.take() {
            if line == "." {
                self.lines.push(pending);
            } else {
                let unstuffed = line.strip_prefix('.').filter(|_| line.starts_with(".."));
                pending.data.push(unstuffed.unwrap_or(line).to_string());
                self.data = Some(pending);
            }
            return None;
        }

        let parsed = match parse_line(line) {
            Ok(parsed) => parsed,
            Err(reason) => {
                if self.is_idle() {
                    return Some(Frame::Malformed {
                        is_async: false,
                        reason,
                    });
                }
                if self.poisoned.is_none() {
                    self.poisoned = Some(reason);
                }
                return None;
            }
        };

        if self.first_code.is_none() {
            self.first_code = Some(parsed.code);
        }

        match parsed.separator {
            Separator::Data => {
                self.data = Some(parsed);
                None
            }
            Separator::Mid => {
                self.lines.push(parsed);
                None
            }
            Separator::End => {
                self.lines.push(parsed);
                Some(self.finish())
            }
        }
    }

    fn finish(&mut self) -> Frame {
        let lines = std::mem::take(&mut self.lines);
        let first_code = self.first_code.take().unwrap_or(0);
        match self.poisoned.take() {
            Some(reason) => Frame::Malformed {
                is_async: first_code / 100 == 6,
                reason,
            },
            None => Frame::Reply(Reply { lines }),
        }
    }
}

fn parse_line(line: &str) -> std::result::Result<ReplyLine, String> {
    let bytes = line.as_bytes();
    if bytes.len() < 4 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return Err(format!("unclassifiable line: {:?}", truncate(line)));
    }
    let code: u16 = line[..3]
        .parse()
        .map_err(|_| format!("bad status code: {:?}", truncate(line)))?;
    let separator = match bytes[3] {
        b' ' => Separator::End,
        b'-' => Separator::Mid,
        b'+' => Separator::Data,
        other => {
            return Err(format!(
                "bad separator {:?} in line {:?}",
                other as char,
                truncate(line)
            ))
        }
    };
    Ok(ReplyLine {
        code,
        separator,
        text: line[4..].to_string(),
        data: Vec::new(),
    })
}

fn truncate(line: &str) -> String {
    line.chars().take(80).collect()
}

/// Quotes a value for use in a command, escaping `\` and `"`.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Splits reply text into positional words and `KEY=VALUE` arguments.
///
/// Values may be quoted strings with backslash escapes, as in
/// `PROTOCOLINFO`'s `COOKIEFILE="/var/run/tor/control.authcookie"`.
pub fn parse_arguments(text: &str) -> (Vec<String>, HashMap<String, String>) {
    let mut positional = Vec::new();
    let mut keyword = HashMap::new();
    let mut chars = text.chars().peekable();

    loop {
        while chars.peek() == Some(&' ') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut token = String::new();
        let mut key: Option<String> = None;
        while let Some(&c) = chars.peek() {
            if c == ' ' {
                break;
            }
            chars.next();
            if c == '=' && key.is_none() {
                key = Some(std::mem::take(&mut token));
                if chars.peek() == Some(&'"') {
                    chars.next();
                    token = read_quoted(&mut chars);
                    break;
                }
                continue;
            }
            token.push(c);
        }

        match key {
            Some(k) => {
                keyword.insert(k, token);
            }
            None => positional.push(token),
        }
    }

    (positional, keyword)
}

fn read_quoted(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut out = String::new();
    while let Some(c) = chars.next() {
        match c {
            '"' => break,
            '\\' => match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => break,
            },
            _ => out.push(c),
        }
    }
    out
}

/// Formats `SETCONF key="value" ...`.
pub fn format_setconf(pairs: &[(&str, &str)]) -> String {
    let mut command = String::from("SETCONF");
    for (key, value) in pairs {
        command.push(' ');
        command.push_str(key);
        command.push('=');
        command.push_str(&quote(value));
    }
    command
}
