// lexer.rs - Assembler source scanner (characters → tokens)

use crate::bytecode::{self, Cell, Mnemonic};
use std::fmt;
use thiserror::Error;

/// Longest identifier, label or string the lexer accepts.
pub const MAX_TOKEN_LENGTH: usize = 255;

// ============================================================================
// TOKEN TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Constant,
    Call,
    Branch,
    ZeroBranch,
    Begin,
    While,
    Repeat,
    Again,
    Until,
    For,
    Aft,
    Next,
    If,
    Else,
    Then,
    Define,
    EndDefine,
    Char,
    Variable,
    Location,
    Immediate,
    Hidden,
    Inline,
    Quote,
    Pwd,
    Set,
    Pc,
    Mode,
    Allocate,
    BuiltIn,
}

/// Reserved words in match order. Mnemonics are consulted after these.
pub static KEYWORDS: &[(&str, Keyword)] = &[
    ("constant", Keyword::Constant),
    ("call", Keyword::Call),
    ("branch", Keyword::Branch),
    ("0branch", Keyword::ZeroBranch),
    ("begin", Keyword::Begin),
    ("while", Keyword::While),
    ("repeat", Keyword::Repeat),
    ("again", Keyword::Again),
    ("until", Keyword::Until),
    ("for", Keyword::For),
    ("aft", Keyword::Aft),
    ("next", Keyword::Next),
    ("if", Keyword::If),
    ("else", Keyword::Else),
    ("then", Keyword::Then),
    (":", Keyword::Define),
    (";", Keyword::EndDefine),
    ("[char]", Keyword::Char),
    ("variable", Keyword::Variable),
    ("location", Keyword::Location),
    ("immediate", Keyword::Immediate),
    ("hidden", Keyword::Hidden),
    ("inline", Keyword::Inline),
    ("'", Keyword::Quote),
    (".pwd", Keyword::Pwd),
    (".set", Keyword::Set),
    (".pc", Keyword::Pc),
    (".mode", Keyword::Mode),
    (".allocate", Keyword::Allocate),
    (".built-in", Keyword::BuiltIn),
];

impl Keyword {
    pub fn name(self) -> &'static str {
        KEYWORDS
            .iter()
            .find(|(_, k)| *k == self)
            .map(|(name, _)| *name)
            .unwrap_or("?")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Literal(Cell),
    Identifier(String),
    Label(String),
    Str(String),
    Keyword(Keyword),
    Instruction(&'static Mnemonic),
    Eoi,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

impl Token {
    pub fn new(kind: TokenKind, line: usize) -> Self {
        Token { kind, line }
    }

    pub fn is_keyword(&self, keyword: Keyword) -> bool {
        self.kind == TokenKind::Keyword(keyword)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TokenKind::Literal(n) => write!(f, "{}", *n as i16),
            TokenKind::Identifier(id) => write!(f, "{}", id),
            TokenKind::Label(id) => write!(f, "{}:", id),
            TokenKind::Str(s) => write!(f, "\"{}\"", s),
            TokenKind::Keyword(k) => write!(f, "{}", k.name()),
            TokenKind::Instruction(m) => write!(f, "{}", m.name),
            TokenKind::Eoi => write!(f, "end of input"),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

// ============================================================================
// LEXER
// ============================================================================

pub struct Lexer {
    input: Vec<char>,
    position: usize,
    line: usize,
    in_definition: bool,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Lexer {
            input: input.chars().collect(),
            position: 0,
            line: 1,
            in_definition: false,
        }
    }

    pub fn line(&self) -> usize {
        self.line
    }

    /// Scan the whole input. The trailing `Eoi` is not included.
    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            if token.kind == TokenKind::Eoi {
                return Ok(tokens);
            }
            tokens.push(token);
        }
    }

    /// Pull the next token; `Eoi` is returned for every call past the end.
    pub fn next_token(&mut self) -> Result<Token, LexError> {
        loop {
            self.skip_whitespace();

            let ch = match self.peek() {
                Some(ch) => ch,
                None => return Ok(Token::new(TokenKind::Eoi, self.line)),
            };

            match ch {
                '\\' => self.skip_line_comment(),
                '(' if self.peek_at(1).is_some_and(char::is_whitespace) => {
                    self.skip_paren_comment()?
                }
                '"' => return self.parse_string(),
                c if c.is_ascii_graphic() => return self.parse_word(),
                c => {
                    return Err(LexError::InvalidCharacter {
                        line: self.line,
                        ch: c,
                    })
                }
            }
        }
    }

    fn parse_word(&mut self) -> Result<Token, LexError> {
        let line = self.line;
        let start = self.position;
        while let Some(ch) = self.peek() {
            if !ch.is_ascii_graphic() {
                break;
            }
            self.advance();
        }

        let word: String = self.input[start..self.position].iter().collect();
        if word.len() > MAX_TOKEN_LENGTH {
            return Err(LexError::TokenTooLong {
                line,
                length: word.len(),
            });
        }

        let kind = classify(&word, line)?;
        match kind {
            TokenKind::Keyword(Keyword::Define) => {
                if self.in_definition {
                    return Err(LexError::NestedDefinition { line });
                }
                self.in_definition = true;
            }
            TokenKind::Keyword(Keyword::EndDefine) => {
                if !self.in_definition {
                    return Err(LexError::UnmatchedEndDefinition { line });
                }
                self.in_definition = false;
            }
            _ => {}
        }

        Ok(Token::new(kind, line))
    }

    fn parse_string(&mut self) -> Result<Token, LexError> {
        let line = self.line;
        self.advance(); // consume opening "

        let start = self.position;
        while let Some(ch) = self.peek() {
            if ch == '"' {
                let s: String = self.input[start..self.position].iter().collect();
                self.advance(); // consume closing "
                if s.len() > MAX_TOKEN_LENGTH {
                    return Err(LexError::TokenTooLong {
                        line,
                        length: s.len(),
                    });
                }
                return Ok(Token::new(TokenKind::Str(s), line));
            }
            // strings may span lines but stay printable ASCII
            if !(ch.is_ascii_graphic() || ch.is_ascii_whitespace()) {
                return Err(LexError::InvalidCharacter {
                    line: self.line,
                    ch,
                });
            }
            self.advance();
        }

        Err(LexError::UnterminatedString { line })
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn skip_paren_comment(&mut self) -> Result<(), LexError> {
        let line = self.line;
        self.advance(); // consume (
        loop {
            match self.peek() {
                Some(')') => {
                    self.advance();
                    return Ok(());
                }
                Some(_) => self.advance(),
                None => return Err(LexError::UnterminatedComment { line }),
            }
        }
    }

    fn skip_line_comment(&mut self) {
        while let Some(ch) = self.peek() {
            if ch == '\n' {
                break;
            }
            self.advance();
        }
    }

    fn peek(&self) -> Option<char> {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.input.get(self.position + offset).copied()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.peek() {
            if ch == '\n' {
                self.line += 1;
            }
            self.position += 1;
        }
    }
}

/// Numbers first, then keywords, then mnemonics, then labels.
fn classify(word: &str, line: usize) -> Result<TokenKind, LexError> {
    if let Some(value) = parse_number(word, line)? {
        return Ok(TokenKind::Literal(value));
    }
    if let Some((_, keyword)) = KEYWORDS.iter().find(|(name, _)| *name == word) {
        return Ok(TokenKind::Keyword(*keyword));
    }
    if let Some(m) = bytecode::mnemonic(word) {
        return Ok(TokenKind::Instruction(m));
    }
    if word.len() > 1 {
        if let Some(label) = word.strip_suffix(':') {
            return Ok(TokenKind::Label(label.to_string()));
        }
    }
    Ok(TokenKind::Identifier(word.to_string()))
}

/// `[-][$]digits`. Text that is not made of digits of the selected base is
/// not a number at all; a digit run too large for a cell is an error.
fn parse_number(word: &str, line: usize) -> Result<Option<Cell>, LexError> {
    let (negative, rest) = match word.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, word),
    };
    let (radix, digits) = match rest.strip_prefix('$') {
        Some(digits) => (16, digits),
        None => (10, rest),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return Ok(None);
    }

    let mut value: u32 = 0;
    for c in digits.chars() {
        let digit = c.to_digit(radix).unwrap_or(0);
        value = value * radix + digit;
        if value > u32::from(Cell::MAX) {
            return Err(LexError::MalformedNumber {
                line,
                text: word.to_string(),
            });
        }
    }

    let value = value as Cell;
    Ok(Some(if negative { value.wrapping_neg() } else { value }))
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LexError {
    #[error("line {line}: invalid character {ch:?}")]
    InvalidCharacter { line: usize, ch: char },
    #[error("line {line}: '(' comment terminated by end of input")]
    UnterminatedComment { line: usize },
    #[error("line {line}: string terminated by end of input")]
    UnterminatedString { line: usize },
    #[error("line {line}: token of {length} characters exceeds the limit of 255")]
    TokenTooLong { line: usize, length: usize },
    #[error("line {line}: number '{text}' does not fit in a cell")]
    MalformedNumber { line: usize, text: String },
    #[error("line {line}: nested definitions are not allowed")]
    NestedDefinition { line: usize },
    #[error("line {line}: ';' used outside a word definition")]
    UnmatchedEndDefinition { line: usize },
}

impl LexError {
    pub fn line(&self) -> usize {
        match self {
            LexError::InvalidCharacter { line, .. }
            | LexError::UnterminatedComment { line }
            | LexError::UnterminatedString { line }
            | LexError::TokenTooLong { line, .. }
            | LexError::MalformedNumber { line, .. }
            | LexError::NestedDefinition { line }
            | LexError::UnmatchedEndDefinition { line } => *line,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        Lexer::new(input)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("42 -17 $ff -$10 0"),
            vec![
                TokenKind::Literal(42),
                TokenKind::Literal((-17i16) as u16),
                TokenKind::Literal(0xFF),
                TokenKind::Literal(0xFFF0),
                TokenKind::Literal(0),
            ]
        );
    }

    #[test]
    fn test_number_like_words_stay_identifiers() {
        assert_eq!(
            kinds("$pc 2dup -"),
            vec![
                TokenKind::Identifier("$pc".to_string()),
                TokenKind::Identifier("2dup".to_string()),
                TokenKind::Identifier("-".to_string()),
            ]
        );
    }

    #[test]
    fn test_number_out_of_range() {
        let err = Lexer::new("\n65536").tokenize().unwrap_err();
        assert_eq!(
            err,
            LexError::MalformedNumber {
                line: 2,
                text: "65536".to_string()
            }
        );
    }

    #[test]
    fn test_keywords_mnemonics_and_labels() {
        let tokens = kinds(": sq dup * ; start: 1- ' x");
        assert_eq!(tokens[0], TokenKind::Keyword(Keyword::Define));
        assert_eq!(tokens[1], TokenKind::Identifier("sq".to_string()));
        assert!(matches!(tokens[2], TokenKind::Instruction(m) if m.name == "dup"));
        assert!(matches!(tokens[3], TokenKind::Instruction(m) if m.name == "*"));
        assert_eq!(tokens[4], TokenKind::Keyword(Keyword::EndDefine));
        assert_eq!(tokens[5], TokenKind::Label("start".to_string()));
        assert!(matches!(tokens[6], TokenKind::Instruction(m) if m.name == "1-"));
        assert_eq!(tokens[7], TokenKind::Keyword(Keyword::Quote));
    }

    #[test]
    fn test_comments() {
        assert_eq!(
            kinds("1 ( a comment ) 2 \\ line comment\n3 (x"),
            vec![
                TokenKind::Literal(1),
                TokenKind::Literal(2),
                TokenKind::Literal(3),
                TokenKind::Identifier("(x".to_string()),
            ]
        );
    }

    #[test]
    fn test_line_comment_at_end_of_input() {
        assert_eq!(kinds("7 \\ trailing"), vec![TokenKind::Literal(7)]);
    }

    #[test]
    fn test_unterminated_comment() {
        let err = Lexer::new("( never closed").tokenize().unwrap_err();
        assert_eq!(err, LexError::UnterminatedComment { line: 1 });
    }

    #[test]
    fn test_strings_and_lines() {
        let tokens = Lexer::new("\"hello\nworld\" x").tokenize().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Str("hello\nworld".to_string()));
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[1].line, 2);
    }

    #[test]
    fn test_unterminated_string() {
        let err = Lexer::new("\"open").tokenize().unwrap_err();
        assert_eq!(err, LexError::UnterminatedString { line: 1 });
    }

    #[test]
    fn test_nested_definition_rejected() {
        let err = Lexer::new(": a : b ; ;").tokenize().unwrap_err();
        assert_eq!(err, LexError::NestedDefinition { line: 1 });
        let err = Lexer::new("1 ;").tokenize().unwrap_err();
        assert_eq!(err, LexError::UnmatchedEndDefinition { line: 1 });
    }

    #[test]
    fn test_invalid_character() {
        let err = Lexer::new("1 \u{7} 2").tokenize().unwrap_err();
        assert_eq!(err, LexError::InvalidCharacter { line: 1, ch: '\u{7}' });
    }

    #[test]
    fn test_token_too_long() {
        let long = "x".repeat(MAX_TOKEN_LENGTH + 1);
        let err = Lexer::new(&long).tokenize().unwrap_err();
        assert_eq!(
            err,
            LexError::TokenTooLong {
                line: 1,
                length: MAX_TOKEN_LENGTH + 1
            }
        );
    }

    #[test]
    fn test_eoi_is_sticky() {
        let mut lexer = Lexer::new("1");
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::Literal(1));
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::Eoi);
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::Eoi);
    }
}
