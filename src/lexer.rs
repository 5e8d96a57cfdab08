// File: src/lexer.rs
//
// Tokenizer for Smalt source code.
// Hand-written scanner producing a flat token stream with line/column
// positions for error reporting.

use crate::errors::{SmaltError, SourceLocation};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Bare identifier: `speak`, `Animal`, `aName`
    Identifier(String),
    /// One keyword segment including the colon: `at:`
    Keyword(String),
    /// Binary selector: `+ - * / < > <= >= = ~= ,`
    BinarySelector(String),
    /// Block parameter: `:x`
    BlockParam(String),
    Integer(i64),
    Float(f64),
    Str(String),

    Assign,     // :=
    Caret,      // ^
    Period,     // .
    Pipe,       // |
    Arrow,      // -> (dictionary literals)
    LBracket,   // [
    RBracket,   // ]
    LParen,     // (
    RParen,     // )
    HashParen,  // #(
    HashBrace,  // #{
    RBrace,     // }

    // Reserved words
    Class,
    Extends,
    Classvars,
    SelfTok,
    SuperTok,
    True,
    False,
    NilTok,

    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

impl Token {
    pub fn location(&self) -> SourceLocation {
        SourceLocation::new(self.line, self.column)
    }
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, SmaltError> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    tokens: Vec<Token>,
    source: &'a str,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            tokens: Vec::new(),
            source,
        }
    }

    fn run(mut self) -> Result<Vec<Token>, SmaltError> {
        while let Some(c) = self.peek() {
            let line = self.line;
            let column = self.column;

            match c {
                ' ' | '\t' | '\r' | '\n' => {
                    self.advance();
                }
                '"' => self.skip_comment()?,
                '\'' => {
                    let s = self.read_string()?;
                    self.push(TokenKind::Str(s), line, column);
                }
                '0'..='9' => {
                    let kind = self.read_number();
                    self.push(kind, line, column);
                }
                c if c.is_alphabetic() || c == '_' => {
                    let word = self.read_word();
                    // An identifier directly followed by ':' is a keyword
                    // segment, unless the ':' starts an assignment.
                    if self.peek() == Some(':') && self.peek_at(1) != Some('=') {
                        self.advance();
                        self.push(TokenKind::Keyword(format!("{}:", word)), line, column);
                    } else {
                        self.push(keyword_or_identifier(word), line, column);
                    }
                }
                ':' => {
                    self.advance();
                    match self.peek() {
                        Some('=') => {
                            self.advance();
                            self.push(TokenKind::Assign, line, column);
                        }
                        Some(c) if c.is_alphabetic() || c == '_' => {
                            let word = self.read_word();
                            self.push(TokenKind::BlockParam(word), line, column);
                        }
                        _ => {
                            return Err(self.error("Expected block parameter name after ':'", line, column));
                        }
                    }
                }
                '#' => {
                    self.advance();
                    match self.peek() {
                        Some('(') => {
                            self.advance();
                            self.push(TokenKind::HashParen, line, column);
                        }
                        Some('{') => {
                            self.advance();
                            self.push(TokenKind::HashBrace, line, column);
                        }
                        _ => return Err(self.error("Expected '(' or '{' after '#'", line, column)),
                    }
                }
                '^' => {
                    self.advance();
                    self.push(TokenKind::Caret, line, column);
                }
                '.' => {
                    self.advance();
                    self.push(TokenKind::Period, line, column);
                }
                '|' => {
                    self.advance();
                    self.push(TokenKind::Pipe, line, column);
                }
                '[' => {
                    self.advance();
                    self.push(TokenKind::LBracket, line, column);
                }
                ']' => {
                    self.advance();
                    self.push(TokenKind::RBracket, line, column);
                }
                '(' => {
                    self.advance();
                    self.push(TokenKind::LParen, line, column);
                }
                ')' => {
                    self.advance();
                    self.push(TokenKind::RParen, line, column);
                }
                '}' => {
                    self.advance();
                    self.push(TokenKind::RBrace, line, column);
                }
                '-' => {
                    // `->` is the dictionary pair arrow; `-3` is a negative
                    // literal when nothing on the left can end an operand.
                    if self.peek_at(1) == Some('>') {
                        self.advance();
                        self.advance();
                        self.push(TokenKind::Arrow, line, column);
                    } else if self.peek_at(1).map_or(false, |c| c.is_ascii_digit())
                        && !self.prev_token_ends_operand()
                    {
                        self.advance();
                        let kind = match self.read_number() {
                            TokenKind::Integer(n) => TokenKind::Integer(-n),
                            TokenKind::Float(f) => TokenKind::Float(-f),
                            other => other,
                        };
                        self.push(kind, line, column);
                    } else {
                        self.advance();
                        self.push(TokenKind::BinarySelector("-".to_string()), line, column);
                    }
                }
                '<' | '>' => {
                    self.advance();
                    let mut sel = c.to_string();
                    if self.peek() == Some('=') {
                        self.advance();
                        sel.push('=');
                    }
                    self.push(TokenKind::BinarySelector(sel), line, column);
                }
                '~' => {
                    self.advance();
                    if self.peek() == Some('=') {
                        self.advance();
                        self.push(TokenKind::BinarySelector("~=".to_string()), line, column);
                    } else {
                        return Err(self.error("Expected '=' after '~'", line, column));
                    }
                }
                '+' | '*' | '/' | '=' | ',' => {
                    self.advance();
                    self.push(TokenKind::BinarySelector(c.to_string()), line, column);
                }
                other => {
                    return Err(self.error(&format!("Unexpected character '{}'", other), line, column));
                }
            }
        }

        self.push(TokenKind::Eof, self.line, self.column);
        Ok(self.tokens)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied();
        if let Some(c) = c {
            self.pos += 1;
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        c
    }

    fn push(&mut self, kind: TokenKind, line: usize, column: usize) {
        self.tokens.push(Token { kind, line, column });
    }

    /// True when the previous token could be the end of an operand, which
    /// makes a following `-` a binary selector rather than a sign.
    fn prev_token_ends_operand(&self) -> bool {
        matches!(
            self.tokens.last().map(|t| &t.kind),
            Some(TokenKind::Identifier(_))
                | Some(TokenKind::Integer(_))
                | Some(TokenKind::Float(_))
                | Some(TokenKind::Str(_))
                | Some(TokenKind::RParen)
                | Some(TokenKind::RBracket)
                | Some(TokenKind::RBrace)
                | Some(TokenKind::SelfTok)
                | Some(TokenKind::True)
                | Some(TokenKind::False)
                | Some(TokenKind::NilTok)
        )
    }

    fn skip_comment(&mut self) -> Result<(), SmaltError> {
        let line = self.line;
        let column = self.column;
        self.advance(); // opening quote
        loop {
            match self.advance() {
                Some('"') => return Ok(()),
                Some(_) => continue,
                None => return Err(self.error("Unterminated comment", line, column)),
            }
        }
    }

    fn read_string(&mut self) -> Result<String, SmaltError> {
        let line = self.line;
        let column = self.column;
        self.advance(); // opening quote
        let mut out = String::new();
        loop {
            match self.advance() {
                Some('\'') => {
                    // Doubled quote is an escaped quote.
                    if self.peek() == Some('\'') {
                        self.advance();
                        out.push('\'');
                    } else {
                        return Ok(out);
                    }
                }
                Some(c) => out.push(c),
                None => return Err(self.error("Unterminated string literal", line, column)),
            }
        }
    }

    fn read_number(&mut self) -> TokenKind {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }

        // A dot only continues the number if a digit follows; otherwise it
        // is a statement separator.
        if self.peek() == Some('.') && self.peek_at(1).map_or(false, |c| c.is_ascii_digit()) {
            text.push('.');
            self.advance();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
            TokenKind::Float(text.parse().unwrap_or(0.0))
        } else {
            TokenKind::Integer(text.parse().unwrap_or(0))
        }
    }

    fn read_word(&mut self) -> String {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                word.push(c);
                self.advance();
            } else {
                break;
            }
        }
        word
    }

    fn error(&self, message: &str, line: usize, column: usize) -> SmaltError {
        let source_line =
            self.source.lines().nth(line.saturating_sub(1)).unwrap_or("").to_string();
        SmaltError::parse_error(message.to_string(), SourceLocation::new(line, column))
            .with_source(source_line)
    }
}

fn keyword_or_identifier(word: String) -> TokenKind {
    match word.as_str() {
        "class" => TokenKind::Class,
        "extends" => TokenKind::Extends,
        "classvars" => TokenKind::Classvars,
        "self" => TokenKind::SelfTok,
        "super" => TokenKind::SuperTok,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "nil" => TokenKind::NilTok,
        _ => TokenKind::Identifier(word),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_tokenize_assignment_statement() {
        assert_eq!(
            kinds("x := 10."),
            vec![
                TokenKind::Identifier("x".to_string()),
                TokenKind::Assign,
                TokenKind::Integer(10),
                TokenKind::Period,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_keyword_message() {
        assert_eq!(
            kinds("arr at: 2 put: 'hi'"),
            vec![
                TokenKind::Identifier("arr".to_string()),
                TokenKind::Keyword("at:".to_string()),
                TokenKind::Integer(2),
                TokenKind::Keyword("put:".to_string()),
                TokenKind::Str("hi".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_block_with_params() {
        assert_eq!(
            kinds("[ :x :y | x + y ]"),
            vec![
                TokenKind::LBracket,
                TokenKind::BlockParam("x".to_string()),
                TokenKind::BlockParam("y".to_string()),
                TokenKind::Pipe,
                TokenKind::Identifier("x".to_string()),
                TokenKind::BinarySelector("+".to_string()),
                TokenKind::Identifier("y".to_string()),
                TokenKind::RBracket,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_minus_disambiguation() {
        // Binary subtraction when the left side ends an operand.
        assert_eq!(
            kinds("3 -4"),
            vec![
                TokenKind::Integer(3),
                TokenKind::BinarySelector("-".to_string()),
                TokenKind::Integer(4),
                TokenKind::Eof,
            ]
        );
        // Negative literal after an assignment.
        assert_eq!(
            kinds("x := -4"),
            vec![
                TokenKind::Identifier("x".to_string()),
                TokenKind::Assign,
                TokenKind::Integer(-4),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_float_vs_statement_period() {
        assert_eq!(
            kinds("3.5. 3."),
            vec![
                TokenKind::Float(3.5),
                TokenKind::Period,
                TokenKind::Integer(3),
                TokenKind::Period,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_string_escape_and_comment() {
        assert_eq!(
            kinds("\"note\" 'it''s'"),
            vec![TokenKind::Str("it's".to_string()), TokenKind::Eof]
        );
    }

    #[test]
    fn test_tokenize_dictionary_literal() {
        assert_eq!(
            kinds("#{ 'a' -> 1 }"),
            vec![
                TokenKind::HashBrace,
                TokenKind::Str("a".to_string()),
                TokenKind::Arrow,
                TokenKind::Integer(1),
                TokenKind::RBrace,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_unterminated_string_is_an_error() {
        assert!(tokenize("'oops").is_err());
    }
}
