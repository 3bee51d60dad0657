//! Named-field parsing of labelled reply lines (`+LABEL: a,b,"c"`).
//!
//! Every command that answers with a labelled line declares a [`Grammar`]:
//! the label plus an ordered list of typed fields. Optional fields may only
//! trail the required ones. Anything that does not fit the grammar exactly
//! is reported as [`ModemError::MalformedResponse`].

use bytes::Bytes;

use super::error::{ModemError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Signed decimal integer.
    Int,
    /// Quoted or bare text; surrounding quotes are stripped.
    Text,
}

#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
    pub optional: bool,
}

impl Field {
    pub const fn int(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Int,
            optional: false,
        }
    }

    pub const fn text(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Text,
            optional: false,
        }
    }

    pub const fn opt(self) -> Self {
        Self {
            optional: true,
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Text(String),
}

/// Grammar of one labelled reply.
#[derive(Debug, Clone, Copy)]
pub struct Grammar {
    pub label: &'static str,
    pub fields: &'static [Field],
}

impl Grammar {
    pub const fn new(label: &'static str, fields: &'static [Field]) -> Self {
        Self { label, fields }
    }

    /// The literal that starts a line of this grammar, e.g. `+QMTPUB: `.
    pub fn prefix(&self) -> String {
        format!("{}: ", self.label)
    }

    /// Parse one line (terminator optional) into a frame.
    pub fn parse(&self, line: &[u8]) -> Result<ResponseFrame> {
        let text = std::str::from_utf8(line)
            .map_err(|_| ModemError::malformed(format!("{} frame is not utf-8", self.label)))?;
        let text = text.trim_end_matches(['\r', '\n']);
        let prefix = self.prefix();
        let body = text.strip_prefix(prefix.as_str()).ok_or_else(|| {
            ModemError::malformed(format!("expected `{}` frame, got `{text}`", self.label))
        })?;

        let tokens = split_fields(body)
            .ok_or_else(|| ModemError::malformed(format!("unbalanced quotes in `{text}`")))?;
        let required = self.fields.iter().filter(|f| !f.optional).count();
        if tokens.len() < required || tokens.len() > self.fields.len() {
            return Err(ModemError::malformed(format!(
                "`{text}` has {} fields, {} expects {required}..={}",
                tokens.len(),
                self.label,
                self.fields.len()
            )));
        }

        let mut values = Vec::with_capacity(tokens.len());
        for (field, token) in self.fields.iter().zip(tokens) {
            let value = match field.kind {
                FieldKind::Int => {
                    let n = token.trim().parse::<i64>().map_err(|_| {
                        ModemError::malformed(format!(
                            "field `{}` of `{text}` is not numeric",
                            field.name
                        ))
                    })?;
                    Value::Int(n)
                }
                FieldKind::Text => Value::Text(unquote(token.trim()).to_string()),
            };
            values.push((field.name, value));
        }
        Ok(ResponseFrame {
            label: self.label,
            values,
        })
    }

    /// Find and parse the first line of this grammar inside a reply block.
    pub fn find_in(&self, block: &[u8]) -> Option<Result<ResponseFrame>> {
        self.find_all_in(block).into_iter().next()
    }

    /// Parse every line of this grammar inside a reply block.
    pub fn find_all_in(&self, block: &[u8]) -> Vec<Result<ResponseFrame>> {
        let prefix = self.prefix();
        block
            .split(|b| *b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .filter(|line| line.starts_with(prefix.as_bytes()))
            .map(|line| self.parse(line))
            .collect()
    }
}

fn unquote(token: &str) -> &str {
    token
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(token)
}

/// Split on commas outside double quotes. `None` on an unterminated quote.
fn split_fields(body: &str) -> Option<Vec<&str>> {
    if body.is_empty() {
        return Some(Vec::new());
    }
    let mut fields = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in body.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                fields.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if quoted {
        return None;
    }
    fields.push(&body[start..]);
    Some(fields)
}

/// A parsed labelled reply. Lives only for the duration of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    label: &'static str,
    values: Vec<(&'static str, Value)>,
}

impl ResponseFrame {
    pub fn label(&self) -> &'static str {
        self.label
    }

    fn value(&self, name: &str) -> Option<&Value> {
        self.values.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn has(&self, name: &str) -> bool {
        self.value(name).is_some()
    }

    pub fn int(&self, name: &str) -> Result<i64> {
        match self.value(name) {
            Some(Value::Int(n)) => Ok(*n),
            Some(Value::Text(_)) => Err(ModemError::malformed(format!(
                "field `{name}` of {} is text",
                self.label
            ))),
            None => Err(ModemError::malformed(format!(
                "field `{name}` missing from {}",
                self.label
            ))),
        }
    }

    pub fn opt_int(&self, name: &str) -> Result<Option<i64>> {
        if self.has(name) {
            self.int(name).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Integer field narrowed to `T`; out-of-range values are malformed.
    pub fn get<T: TryFrom<i64>>(&self, name: &str) -> Result<T> {
        let n = self.int(name)?;
        T::try_from(n).map_err(|_| {
            ModemError::malformed(format!("field `{name}` of {} out of range: {n}", self.label))
        })
    }

    pub fn text(&self, name: &str) -> Result<&str> {
        match self.value(name) {
            Some(Value::Text(s)) => Ok(s),
            Some(Value::Int(_)) => Err(ModemError::malformed(format!(
                "field `{name}` of {} is numeric",
                self.label
            ))),
            None => Err(ModemError::malformed(format!(
                "field `{name}` missing from {}",
                self.label
            ))),
        }
    }

    pub fn opt_text(&self, name: &str) -> Option<&str> {
        match self.value(name) {
            Some(Value::Text(s)) => Some(s),
            _ => None,
        }
    }
}

/// Kind of terminal status line that closes a solicited reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Ok,
    Error,
    CmeError(u16),
}

pub const OK_LINE: &[u8] = b"OK\r\n";
pub const ERROR_LINE: &[u8] = b"ERROR\r\n";
pub const CME_ERROR_PREFIX: &[u8] = b"+CME ERROR: ";

/// Parse a `+CME ERROR: <n>` line.
pub fn parse_cme(line: &[u8]) -> Result<u16> {
    let text = std::str::from_utf8(line).map_err(|_| ModemError::malformed("cme error line"))?;
    text.trim_end()
        .strip_prefix("+CME ERROR: ")
        .and_then(|code| code.trim().parse::<u16>().ok())
        .ok_or_else(|| ModemError::malformed(format!("bad cme error line `{}`", text.trim_end())))
}

/// Solicited reply block returned by the OK/ERROR reader: every byte from
/// the start of the buffer through the terminal line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyBlock {
    pub bytes: Bytes,
}

impl ReplyBlock {
    pub fn frame(&self, grammar: &Grammar) -> Result<ResponseFrame> {
        grammar.find_in(&self.bytes).unwrap_or_else(|| {
            Err(ModemError::malformed(format!(
                "reply has no {} line",
                grammar.label
            )))
        })
    }

    pub fn frames(&self, grammar: &Grammar) -> Result<Vec<ResponseFrame>> {
        grammar.find_all_in(&self.bytes).into_iter().collect()
    }

    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}
