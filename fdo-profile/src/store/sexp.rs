// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Minimal symbolic-expression tree used by the textual profile encoding.
//! Atoms that contain whitespace, parentheses, quotes or are empty are
//! written double-quoted with `\"` and `\\` escapes.

use crate::error::{ProfileError, ProfileResult};
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sexp {
    Atom(String),
    List(Vec<Sexp>),
}

impl Sexp {
    pub fn atom(text: impl Into<String>) -> Self {
        Sexp::Atom(text.into())
    }

    pub fn list(items: Vec<Sexp>) -> Self {
        Sexp::List(items)
    }

    /// A `(key value...)` pair; the standard shape for record fields.
    pub fn field(key: &str, value: Sexp) -> Self {
        Sexp::List(vec![Sexp::atom(key), value])
    }

    pub fn as_atom(&self) -> ProfileResult<&str> {
        match self {
            Sexp::Atom(text) => Ok(text),
            Sexp::List(_) => Err(ProfileError::malformed("expected atom, found list")),
        }
    }

    pub fn as_list(&self) -> ProfileResult<&[Sexp]> {
        match self {
            Sexp::List(items) => Ok(items),
            Sexp::Atom(text) => Err(ProfileError::malformed(format!(
                "expected list, found atom {text:?}"
            ))),
        }
    }

    /// Look up `(name value)` in a list of fields.
    pub fn get(&self, name: &str) -> ProfileResult<Option<&Sexp>> {
        for item in self.as_list()? {
            let pair = item.as_list()?;
            match pair {
                [Sexp::Atom(key), value] if key == name => return Ok(Some(value)),
                _ => {}
            }
        }
        Ok(None)
    }

    /// Like [`Sexp::get`], but the field must exist.
    pub fn expect(&self, name: &str) -> ProfileResult<&Sexp> {
        self.get(name)?
            .ok_or_else(|| ProfileError::malformed(format!("missing field {name:?}")))
    }

    pub fn parse(input: &str) -> ProfileResult<Sexp> {
        let mut parser = Parser {
            bytes: input.as_bytes(),
            pos: 0,
        };
        let value = parser.value()?;
        parser.skip_whitespace();
        if parser.pos != parser.bytes.len() {
            return Err(ProfileError::malformed("trailing input after expression"));
        }
        Ok(value)
    }
}

impl fmt::Display for Sexp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sexp::Atom(text) => {
                if needs_quoting(text) {
                    f.write_str("\"")?;
                    for c in text.chars() {
                        match c {
                            '"' => f.write_str("\\\"")?,
                            '\\' => f.write_str("\\\\")?,
                            _ => write!(f, "{c}")?,
                        }
                    }
                    f.write_str("\"")
                } else {
                    f.write_str(text)
                }
            }
            Sexp::List(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
        }
    }
}

fn needs_quoting(text: &str) -> bool {
    text.is_empty()
        || text
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '(' | ')' | '"' | '\\'))
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn skip_whitespace(&mut self) {
        while let Some(&b) = self.bytes.get(self.pos) {
            if b.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn value(&mut self) -> ProfileResult<Sexp> {
        self.skip_whitespace();
        match self.bytes.get(self.pos) {
            None => Err(ProfileError::malformed("unexpected end of expression")),
            Some(b'(') => {
                self.pos += 1;
                let mut items = Vec::new();
                loop {
                    self.skip_whitespace();
                    match self.bytes.get(self.pos) {
                        None => {
                            return Err(ProfileError::malformed("unterminated list"));
                        }
                        Some(b')') => {
                            self.pos += 1;
                            return Ok(Sexp::List(items));
                        }
                        Some(_) => items.push(self.value()?),
                    }
                }
            }
            Some(b')') => Err(ProfileError::malformed("unbalanced ')'")),
            Some(b'"') => self.quoted_atom(),
            Some(_) => self.bare_atom(),
        }
    }

    fn quoted_atom(&mut self) -> ProfileResult<Sexp> {
        self.pos += 1; // opening quote
        let mut text = Vec::new();
        loop {
            match self.bytes.get(self.pos) {
                None => return Err(ProfileError::malformed("unterminated string")),
                Some(b'"') => {
                    self.pos += 1;
                    let text = String::from_utf8(text)
                        .map_err(|_| ProfileError::malformed("invalid utf-8 in string"))?;
                    return Ok(Sexp::Atom(text));
                }
                Some(b'\\') => {
                    self.pos += 1;
                    match self.bytes.get(self.pos) {
                        Some(&(c @ (b'"' | b'\\'))) => {
                            text.push(c);
                            self.pos += 1;
                        }
                        _ => return Err(ProfileError::malformed("bad escape in string")),
                    }
                }
                Some(&c) => {
                    text.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn bare_atom(&mut self) -> ProfileResult<Sexp> {
        let start = self.pos;
        while let Some(&b) = self.bytes.get(self.pos) {
            if b.is_ascii_whitespace() || matches!(b, b'(' | b')' | b'"') {
                break;
            }
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| ProfileError::malformed("invalid utf-8 in atom"))?;
        Ok(Sexp::Atom(text.to_string()))
    }
}
