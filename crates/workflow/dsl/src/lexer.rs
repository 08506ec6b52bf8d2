//! Lexer: tokenizes condition expressions
//!
//! Produces a stream of tokens that the parser consumes.
//! Handles keywords (case-insensitive), quoted string literals, numbers,
//! `{{ ... }}` context parameters, comparison operators and brackets.

use crate::errors::{DslError, DslResult};

/// A token produced by the lexer
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    /// The kind of token
    pub kind: TokenKind,
    /// The raw text of the token (unquoted for strings, trimmed for parameters)
    pub text: String,
    /// Line number (1-based)
    pub line: usize,
    /// Column number (1-based)
    pub col: usize,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, line: usize, col: usize) -> Self {
        Self {
            kind,
            text: text.into(),
            line,
            col,
        }
    }
}

/// Token types
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenKind {
    // Keywords
    And,
    Or,
    Not,
    In,
    Contains,
    Null,
    Undefined,

    // Operands
    Identifier,
    StringLiteral,
    NumberLiteral,
    Parameter,

    // Operators
    Eq,
    NotEq,
    EqIgnoreCase,
    Gt,
    Lt,
    Ge,
    Le,

    // Structural
    OpenParen,
    CloseParen,
    OpenBracket,
    CloseBracket,
    Comma,

    // End of input
    Eof,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::And => write!(f, "AND"),
            Self::Or => write!(f, "OR"),
            Self::Not => write!(f, "NOT"),
            Self::In => write!(f, "IN"),
            Self::Contains => write!(f, "CONTAINS"),
            Self::Null => write!(f, "NULL"),
            Self::Undefined => write!(f, "UNDEFINED"),
            Self::Identifier => write!(f, "identifier"),
            Self::StringLiteral => write!(f, "string literal"),
            Self::NumberLiteral => write!(f, "number"),
            Self::Parameter => write!(f, "parameter"),
            Self::Eq => write!(f, "=="),
            Self::NotEq => write!(f, "!="),
            Self::EqIgnoreCase => write!(f, "~="),
            Self::Gt => write!(f, ">"),
            Self::Lt => write!(f, "<"),
            Self::Ge => write!(f, ">="),
            Self::Le => write!(f, "<="),
            Self::OpenParen => write!(f, "("),
            Self::CloseParen => write!(f, ")"),
            Self::OpenBracket => write!(f, "["),
            Self::CloseBracket => write!(f, "]"),
            Self::Comma => write!(f, ","),
            Self::Eof => write!(f, "end of input"),
        }
    }
}

/// Lexer for condition expressions
pub struct Lexer {
    input: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
}

impl Lexer {
    /// Create a new lexer from input text
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    /// Tokenize the entire input
    pub fn tokenize(&mut self) -> DslResult<Vec<Token>> {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace();

            if self.pos >= self.input.len() {
                tokens.push(Token::new(TokenKind::Eof, "", self.line, self.col));
                break;
            }

            let token = self.next_token()?;
            tokens.push(token);
        }

        Ok(tokens)
    }

    fn next_token(&mut self) -> DslResult<Token> {
        let ch = self.input[self.pos];
        let line = self.line;
        let col = self.col;

        let single = |kind: TokenKind, text: &str, lexer: &mut Self| -> DslResult<Token> {
            lexer.advance();
            Ok(Token::new(kind, text, line, col))
        };

        match ch {
            '(' => single(TokenKind::OpenParen, "(", self),
            ')' => single(TokenKind::CloseParen, ")", self),
            '[' => single(TokenKind::OpenBracket, "[", self),
            ']' => single(TokenKind::CloseBracket, "]", self),
            ',' => single(TokenKind::Comma, ",", self),
            '{' if self.peek_at(1) == Some('{') => self.read_parameter(),
            '\'' | '"' => self.read_string_literal(ch),
            '=' | '!' | '~' | '>' | '<' => self.read_operator(),
            '-' if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => self.read_number(),
            c if c.is_ascii_digit() => self.read_number(),
            c if c.is_alphanumeric() || c == '_' => self.read_identifier_or_keyword(),
            _ => Err(DslError::ParseError {
                line,
                col,
                message: format!("Unexpected character: '{}'", ch),
            }),
        }
    }

    fn read_operator(&mut self) -> DslResult<Token> {
        let line = self.line;
        let col = self.col;
        let first = self.input[self.pos];
        let second = self.peek_at(1);

        let (kind, width) = match (first, second) {
            ('=', Some('=')) => (TokenKind::Eq, 2),
            ('!', Some('=')) => (TokenKind::NotEq, 2),
            ('~', Some('=')) => (TokenKind::EqIgnoreCase, 2),
            ('>', Some('=')) | ('=', Some('>')) => (TokenKind::Ge, 2),
            ('<', Some('=')) | ('=', Some('<')) => (TokenKind::Le, 2),
            ('>', _) => (TokenKind::Gt, 1),
            ('<', _) => (TokenKind::Lt, 1),
            _ => {
                return Err(DslError::ParseError {
                    line,
                    col,
                    message: format!("Unknown operator starting with '{}'", first),
                })
            }
        };

        let text: String = self.input[self.pos..self.pos + width].iter().collect();
        for _ in 0..width {
            self.advance();
        }
        Ok(Token::new(kind, text, line, col))
    }

    fn read_string_literal(&mut self, quote: char) -> DslResult<Token> {
        let line = self.line;
        let col = self.col;
        self.advance(); // skip opening quote

        let mut text = String::new();
        while self.pos < self.input.len() && self.input[self.pos] != quote {
            if self.input[self.pos] == '\\' && self.peek_at(1) == Some(quote) {
                self.advance();
                text.push(quote);
            } else {
                text.push(self.input[self.pos]);
            }
            self.advance();
        }

        if self.pos >= self.input.len() {
            return Err(DslError::ParseError {
                line,
                col,
                message: "Unterminated string literal".into(),
            });
        }

        self.advance(); // skip closing quote
        Ok(Token::new(TokenKind::StringLiteral, text, line, col))
    }

    /// `{{ ... }}`; quotes inside the braces may contain `}`
    fn read_parameter(&mut self) -> DslResult<Token> {
        let line = self.line;
        let col = self.col;
        self.advance();
        self.advance();

        let mut text = String::new();
        let mut quote: Option<char> = None;
        loop {
            if self.pos >= self.input.len() {
                return Err(DslError::ParseError {
                    line,
                    col,
                    message: "Unterminated parameter, expected '}}'".into(),
                });
            }
            let ch = self.input[self.pos];
            match quote {
                Some(q) if ch == q => quote = None,
                Some(_) => {}
                None if ch == '\'' || ch == '"' => quote = Some(ch),
                None if ch == '}' && self.peek_at(1) == Some('}') => {
                    self.advance();
                    self.advance();
                    break;
                }
                None => {}
            }
            text.push(ch);
            self.advance();
        }

        Ok(Token::new(TokenKind::Parameter, text.trim(), line, col))
    }

    fn read_number(&mut self) -> DslResult<Token> {
        let line = self.line;
        let col = self.col;
        let mut text = String::new();

        if self.input[self.pos] == '-' {
            text.push('-');
            self.advance();
        }
        while self.pos < self.input.len()
            && (self.input[self.pos].is_ascii_digit() || self.input[self.pos] == '.')
        {
            text.push(self.input[self.pos]);
            self.advance();
        }

        if text.parse::<f64>().is_err() {
            return Err(DslError::ParseError {
                line,
                col,
                message: format!("Invalid number: '{}'", text),
            });
        }

        Ok(Token::new(TokenKind::NumberLiteral, text, line, col))
    }

    fn read_identifier_or_keyword(&mut self) -> DslResult<Token> {
        let line = self.line;
        let col = self.col;
        let mut text = String::new();

        while self.pos < self.input.len() {
            let ch = self.input[self.pos];
            if ch.is_alphanumeric() || ch == '_' || ch == '.' || ch == '-' {
                text.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        let kind = match text.to_ascii_uppercase().as_str() {
            "AND" => TokenKind::And,
            "OR" => TokenKind::Or,
            "NOT" => TokenKind::Not,
            "IN" => TokenKind::In,
            "CONTAINS" => TokenKind::Contains,
            "NULL" => TokenKind::Null,
            "UNDEFINED" => TokenKind::Undefined,
            _ => TokenKind::Identifier,
        };

        Ok(Token::new(kind, text, line, col))
    }

    fn skip_whitespace(&mut self) {
        while self.pos < self.input.len() && self.input[self.pos].is_whitespace() {
            self.advance();
        }
    }

    fn advance(&mut self) {
        if self.pos < self.input.len() {
            if self.input[self.pos] == '\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
            self.pos += 1;
        }
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }
}
