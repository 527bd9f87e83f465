//! Restricted parser for the structured literals carried in mapping sensors
//!
//! The `input-labelling` and `hostname-functional-mapping` sensors publish
//! their values as Python-style literals, e.g.
//! `[('ant0_x', 0, 'skarab020709-01', 0), ...]` or
//! `{'skarab020709-01': 'fhost00'}`. This module reads exactly that data
//! grammar (lists, tuples, dicts, strings, numbers, booleans, None) and
//! nothing else: there is no expression evaluation.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Literal>),
    Tuple(Vec<Literal>),
    Dict(Vec<(Literal, Literal)>),
}

impl Literal {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Literal::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Elements of a list or tuple
    pub fn as_seq(&self) -> Option<&[Literal]> {
        match self {
            Literal::List(items) | Literal::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(Literal, Literal)]> {
        match self {
            Literal::Dict(pairs) => Some(pairs),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Literal::None => "None",
            Literal::Bool(_) => "bool",
            Literal::Int(_) => "int",
            Literal::Float(_) => "float",
            Literal::Str(_) => "str",
            Literal::List(_) => "list",
            Literal::Tuple(_) => "tuple",
            Literal::Dict(_) => "dict",
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Str(s) => write!(f, "{s:?}"),
            Literal::Int(i) => write!(f, "{i}"),
            Literal::Float(x) => write!(f, "{x}"),
            other => f.write_str(other.kind()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} at offset {offset}")]
pub struct LiteralError {
    pub offset: usize,
    pub message: String,
}

/// Parse a complete literal; trailing non-whitespace is an error
pub fn parse(input: &str) -> Result<Literal, LiteralError> {
    let mut parser = Parser { src: input, pos: 0 };
    let value = parser.value()?;
    parser.skip_ws();
    if parser.pos != input.len() {
        return Err(parser.error("trailing characters"));
    }
    Ok(value)
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, message: impl Into<String>) -> LiteralError {
        LiteralError {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek().filter(|c| c.is_whitespace()) {
            self.pos += c.len_utf8();
        }
    }

    fn expect(&mut self, wanted: char) -> Result<(), LiteralError> {
        match self.bump() {
            Some(c) if c == wanted => Ok(()),
            Some(c) => Err(self.error(format!("expected {wanted:?}, found {c:?}"))),
            None => Err(self.error(format!("expected {wanted:?}, found end of input"))),
        }
    }

    fn value(&mut self) -> Result<Literal, LiteralError> {
        self.skip_ws();
        match self.peek() {
            None => Err(self.error("unexpected end of input")),
            Some('[') => {
                self.bump();
                let (items, _) = self.items(']')?;
                Ok(Literal::List(items))
            }
            Some('(') => {
                self.bump();
                let (items, trailing_comma) = self.items(')')?;
                // `(x)` is just a parenthesised value, `(x,)` is a 1-tuple
                if items.len() == 1 && !trailing_comma {
                    Ok(items.into_iter().next().unwrap_or(Literal::None))
                } else {
                    Ok(Literal::Tuple(items))
                }
            }
            Some('{') => {
                self.bump();
                self.dict()
            }
            Some('\'') | Some('"') => self.string(),
            Some('u') | Some('b') | Some('U') | Some('B')
                if matches!(self.src[self.pos + 1..].chars().next(), Some('\'') | Some('"')) =>
            {
                self.bump();
                self.string()
            }
            Some(c) if c == '-' || c == '+' || c.is_ascii_digit() || c == '.' => self.number(),
            Some(c) if c.is_ascii_alphabetic() => self.keyword(),
            Some(c) => Err(self.error(format!("unexpected character {c:?}"))),
        }
    }

    /// Comma separated values up to `close`; reports whether a trailing
    /// comma was present
    fn items(&mut self, close: char) -> Result<(Vec<Literal>, bool), LiteralError> {
        let mut items = Vec::new();
        let mut trailing_comma = false;
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.bump();
                return Ok((items, trailing_comma));
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.bump() {
                Some(',') => trailing_comma = true,
                Some(c) if c == close => return Ok((items, false)),
                Some(c) => return Err(self.error(format!("expected ',' or {close:?}, found {c:?}"))),
                None => return Err(self.error(format!("unterminated sequence, expected {close:?}"))),
            }
        }
    }

    fn dict(&mut self) -> Result<Literal, LiteralError> {
        let mut pairs = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some('}') {
                self.bump();
                return Ok(Literal::Dict(pairs));
            }
            let key = self.value()?;
            self.skip_ws();
            self.expect(':')?;
            let value = self.value()?;
            pairs.push((key, value));
            self.skip_ws();
            match self.bump() {
                Some(',') => {}
                Some('}') => return Ok(Literal::Dict(pairs)),
                Some(c) => return Err(self.error(format!("expected ',' or '}}', found {c:?}"))),
                None => return Err(self.error("unterminated dict")),
            }
        }
    }

    fn string(&mut self) -> Result<Literal, LiteralError> {
        let quote = self.bump().ok_or_else(|| self.error("expected string"))?;
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(c) if c == quote => return Ok(Literal::Str(out)),
                Some('\\') => {
                    let escaped = match self.bump() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('0') => '\0',
                        Some(c @ ('\\' | '\'' | '"')) => c,
                        Some(c) => return Err(self.error(format!("unsupported escape \\{c}"))),
                        None => return Err(self.error("unterminated string")),
                    };
                    out.push(escaped);
                }
                Some(c) => out.push(c),
            }
        }
    }

    fn number(&mut self) -> Result<Literal, LiteralError> {
        let start = self.pos;
        if matches!(self.peek(), Some('-') | Some('+')) {
            self.bump();
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '_'))
            || (matches!(self.peek(), Some('-') | Some('+'))
                && matches!(self.src[..self.pos].chars().last(), Some('e') | Some('E')))
        {
            self.bump();
        }
        let text: String = self.src[start..self.pos].chars().filter(|c| *c != '_').collect();
        if let Ok(i) = text.parse::<i64>() {
            return Ok(Literal::Int(i));
        }
        text.parse::<f64>().map(Literal::Float).map_err(|_| LiteralError {
            offset: start,
            message: format!("invalid number {text:?}"),
        })
    }

    fn keyword(&mut self) -> Result<Literal, LiteralError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
            self.bump();
        }
        match &self.src[start..self.pos] {
            "None" => Ok(Literal::None),
            "True" => Ok(Literal::Bool(true)),
            "False" => Ok(Literal::Bool(false)),
            other => Err(LiteralError {
                offset: start,
                message: format!("names are not allowed in literals: {other:?}"),
            }),
        }
    }
}
