//! LDAP-style filter strings: AST and parser.
//!
//! The grammar covers `(attr=value)`, presence `(attr=*)`, substrings
//! `(attr=pre*any*post)`, ordering `(attr>=v)` / `(attr<=v)`, the boolean
//! connectives `(&…)`, `(|…)`, `(!…)`, and the extensible rules
//! `(attr:caseIgnoreMatch:=v)` and `(attr:caseIgnoreSubstringsMatch:=v)`.
//! Assertion values use RFC 4515 backslash-hex escapes (`\2a` for a
//! literal `*`).

pub mod compile;
pub mod decorate;

use crate::error::{Error, FilterError};

/// Maximum nesting depth of a parsed filter.
const MAX_FILTER_DEPTH: usize = 16;

/// A parsed filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality {
        attr: String,
        value: String,
    },
    Present {
        attr: String,
    },
    Ge {
        attr: String,
        value: String,
    },
    Le {
        attr: String,
        value: String,
    },
    Substring {
        attr: String,
        initial: Option<String>,
        any: Vec<String>,
        final_: Option<String>,
    },
    /// Extensible match; the rule is validated during decoration.
    Ext {
        attr: String,
        rule: String,
        value: String,
    },
}

/// Parse a filter string to an AST.
pub fn parse(input: &str) -> Result<Filter, Error> {
    let mut parser = Parser::new(input.trim());
    let filter = parser.parse_filter(0)?;
    if parser.pos < parser.chars.len() {
        return Err(parser.fail("unexpected trailing characters"));
    }
    Ok(filter)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn fail(&self, message: &str) -> Error {
        FilterError::InvalidQuery(format!("{message} at position {}", self.pos)).into()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn expect(&mut self, c: char) -> Result<(), Error> {
        match self.bump() {
            Some(got) if got == c => Ok(()),
            _ => Err(self.fail(&format!("expected '{c}'"))),
        }
    }

    /// `filter := '(' filtercomp ')'`
    fn parse_filter(&mut self, depth: usize) -> Result<Filter, Error> {
        if depth > MAX_FILTER_DEPTH {
            return Err(self.fail("filter nesting too deep"));
        }
        self.expect('(')?;
        let comp = match self.peek() {
            Some('&') => {
                self.bump();
                Filter::And(self.parse_filter_list(depth + 1)?)
            }
            Some('|') => {
                self.bump();
                Filter::Or(self.parse_filter_list(depth + 1)?)
            }
            Some('!') => {
                self.bump();
                Filter::Not(Box::new(self.parse_filter(depth + 1)?))
            }
            Some(_) => self.parse_item()?,
            None => return Err(self.fail("unterminated filter")),
        };
        self.expect(')')?;
        Ok(comp)
    }

    /// One or more sub-filters, up to the enclosing ')'.
    fn parse_filter_list(&mut self, depth: usize) -> Result<Vec<Filter>, Error> {
        let mut list = Vec::new();
        while self.peek() == Some('(') {
            list.push(self.parse_filter(depth)?);
        }
        if list.is_empty() {
            return Err(self.fail("expected at least one sub-filter"));
        }
        Ok(list)
    }

    /// A leaf: simple comparison, presence, substring, or extensible match.
    fn parse_item(&mut self) -> Result<Filter, Error> {
        let attr = self.parse_attr()?;

        match self.peek() {
            Some('~') => Err(self.fail("approximate match is not supported")),
            Some('>') => {
                self.bump();
                self.expect('=')?;
                let value = self.parse_value(false)?.pop().unwrap_or_default();
                Ok(Filter::Ge { attr, value })
            }
            Some('<') => {
                self.bump();
                self.expect('=')?;
                let value = self.parse_value(false)?.pop().unwrap_or_default();
                Ok(Filter::Le { attr, value })
            }
            Some(':') => {
                self.bump();
                let rule = self.parse_rule()?;
                self.expect('=')?;
                let value = self.parse_value(false)?.pop().unwrap_or_default();
                Ok(Filter::Ext { attr, rule, value })
            }
            Some('=') => {
                self.bump();
                let chunks = self.parse_value(true)?;
                Ok(Self::classify_equality(attr, chunks))
            }
            _ => Err(self.fail("expected a comparison operator")),
        }
    }

    fn parse_attr(&mut self) -> Result<String, Error> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, '=' | '<' | '>' | '~' | ':' | '(' | ')') {
                break;
            }
            self.bump();
        }
        if self.pos == start {
            return Err(self.fail("expected an attribute name"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn parse_rule(&mut self) -> Result<String, Error> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == ':' {
                break;
            }
            self.bump();
        }
        let rule: String = self.chars[start..self.pos].iter().collect();
        self.expect(':')?;
        if rule.is_empty() {
            return Err(self.fail("expected a matching rule"));
        }
        Ok(rule)
    }

    /// Scan an assertion value up to the closing ')'.
    ///
    /// When `split_stars` is set, unescaped `*` characters delimit chunks
    /// (for presence and substring classification); otherwise `*` is
    /// literal. Backslash escapes (`\xx`) decode in either mode.
    fn parse_value(&mut self, split_stars: bool) -> Result<Vec<String>, Error> {
        let mut chunks = Vec::new();
        let mut current = String::new();

        loop {
            match self.peek() {
                None => return Err(self.fail("unterminated assertion value")),
                Some(')') => break,
                Some('*') if split_stars => {
                    self.bump();
                    chunks.push(std::mem::take(&mut current));
                }
                Some('\\') => {
                    self.bump();
                    let hi = self.bump().ok_or_else(|| self.fail("truncated escape"))?;
                    let lo = self.bump().ok_or_else(|| self.fail("truncated escape"))?;
                    let byte = u8::from_str_radix(&format!("{hi}{lo}"), 16)
                        .map_err(|_| self.fail("invalid hex escape"))?;
                    current.push(byte as char);
                }
                Some(c) => {
                    self.bump();
                    current.push(c);
                }
            }
        }
        chunks.push(current);
        Ok(chunks)
    }

    /// Classify an `attr=` assertion from its star-separated chunks:
    /// exactly one chunk is an equality, a single bare `*` is a presence
    /// test, anything else is a substring match.
    fn classify_equality(attr: String, chunks: Vec<String>) -> Filter {
        if chunks.len() == 1 {
            let mut chunks = chunks;
            return Filter::Equality {
                attr,
                value: chunks.pop().unwrap(),
            };
        }
        if chunks.len() == 2 && chunks[0].is_empty() && chunks[1].is_empty() {
            return Filter::Present { attr };
        }

        let n = chunks.len();
        let mut initial = None;
        let mut final_ = None;
        let mut any = Vec::new();
        for (i, chunk) in chunks.into_iter().enumerate() {
            if chunk.is_empty() {
                continue;
            }
            if i == 0 {
                initial = Some(chunk);
            } else if i == n - 1 {
                final_ = Some(chunk);
            } else {
                any.push(chunk);
            }
        }
        Filter::Substring {
            attr,
            initial,
            any,
            final_,
        }
    }
}
