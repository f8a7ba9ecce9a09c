//! Script lexer
//!
//! Splits script text into tokens. Every character of the input belongs to
//! exactly one token, so concatenating the token texts reproduces the script.
//!
//! Token classes, tried in this order at every position:
//!
//! ```text
//! \r\n | \r | \n                 newline
//! [ \t\f\v]+ newline?            whitespace
//! ${ ... }$  ~{ ... }~?          embedded expression, optional recorded result
//! $name                          variable reference
//! >>>                            command marker
//! #{ ... }#                      comment
//! ```
//!
//! Anything between two matches is emitted verbatim as literal text.

use std::sync::OnceLock;

use regex::Regex;

/// Marker that starts a command line
pub const COMMAND_MARKER: &str = ">>>";

const TOKEN_PATTERN: &str = concat!(
    r"\r\n?|\n",
    r"|[ \t\f\v]+(?:\r\n?|\n)?",
    r"|\$\{(?s:.)*?\}\$(?:~\{(?s:.)*?\}~)?",
    r"|\$[a-zA-Z_][a-zA-Z0-9_]*",
    r"|>{3}",
    r"|#\{(?s:.)*?\}#",
);

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(TOKEN_PATTERN).expect("token pattern is valid"))
}

/// What a token means to the interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Newline,
    Whitespace,
    Expression,
    Variable,
    CommandMarker,
    Comment,
    Literal,
}

/// A slice of script text with the position of its first character
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token<'a> {
    pub text: &'a str,
    /// 1-based line
    pub line: usize,
    /// 1-based column
    pub column: usize,
}

impl<'a> Token<'a> {
    /// Classify the token by its text
    pub fn kind(&self) -> TokenKind {
        let t = self.text;
        if t == COMMAND_MARKER {
            TokenKind::CommandMarker
        } else if t.ends_with('\n') || t.ends_with('\r') {
            if t.starts_with([' ', '\t', '\x0c', '\x0b']) {
                TokenKind::Whitespace
            } else {
                TokenKind::Newline
            }
        } else if t.starts_with([' ', '\t', '\x0c', '\x0b']) {
            TokenKind::Whitespace
        } else if t.starts_with("${") && t.contains("}$") {
            TokenKind::Expression
        } else if t.len() >= 2
            && t.starts_with('$')
            && t[1..].starts_with(|c: char| c.is_ascii_alphabetic() || c == '_')
        {
            TokenKind::Variable
        } else if t.len() >= 4 && t.starts_with("#{") && t.ends_with("}#") {
            TokenKind::Comment
        } else {
            TokenKind::Literal
        }
    }

    /// Whether this token ends a line
    pub fn ends_line(&self) -> bool {
        self.text.ends_with('\n') || self.text.ends_with('\r')
    }

    /// Split an expression token into its expression and recorded result
    ///
    /// Returns `None` for tokens that are not expression blocks.
    pub fn expression_parts(&self) -> Option<(&'a str, Option<&'a str>)> {
        let body = self.text.strip_prefix("${")?;
        let end = body.find("}$")?;
        let expr = &body[..end];
        let rest = &body[end + 2..];
        let recorded = rest
            .strip_prefix("~{")
            .and_then(|r| r.strip_suffix("}~"));
        Some((expr, recorded))
    }
}

/// Lazy token iterator over one script
pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    /// Next regex match not yet emitted (start, end)
    pending: Option<(usize, usize)>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            pending: None,
            line: 1,
            column: 1,
        }
    }

    fn emit(&mut self, end: usize) -> Token<'a> {
        let text = &self.src[self.pos..end];
        let token = Token {
            text,
            line: self.line,
            column: self.column,
        };
        self.advance_position(text);
        self.pos = end;
        token
    }

    fn advance_position(&mut self, text: &str) {
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\r' => {
                    if chars.peek() == Some(&'\n') {
                        chars.next();
                    }
                    self.line += 1;
                    self.column = 1;
                }
                '\n' => {
                    self.line += 1;
                    self.column = 1;
                }
                _ => self.column += 1,
            }
        }
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        if self.pos >= self.src.len() {
            return None;
        }

        if self.pending.is_none() {
            self.pending = token_regex()
                .find_at(self.src, self.pos)
                .map(|m| (m.start(), m.end()));
        }

        match self.pending {
            // Literal text before the next match
            Some((start, _)) if start > self.pos => Some(self.emit(start)),
            Some((_, end)) => {
                self.pending = None;
                Some(self.emit(end))
            }
            None => Some(self.emit(self.src.len())),
        }
    }
}

/// Tokenize a whole script
pub fn tokenize(src: &str) -> Lexer<'_> {
    Lexer::new(src)
}
