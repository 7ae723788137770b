use h2vm::lexer::{Keyword, LexError, Lexer, TokenKind};
use test_case::test_case;

fn kinds(input: &str) -> Vec<TokenKind> {
    Lexer::new(input)
        .tokenize()
        .unwrap()
        .into_iter()
        .map(|t| t.kind)
        .collect()
}

#[test_case("0", 0 ; "zero")]
#[test_case("65535", 0xFFFF ; "largest decimal")]
#[test_case("$7fff", 0x7FFF ; "hex")]
#[test_case("$FFFF", 0xFFFF ; "upper case hex")]
#[test_case("-1", 0xFFFF ; "negative one wraps")]
#[test_case("-$8000", 0x8000 ; "negative hex")]
fn test_literal_values(input: &str, expected: u16) {
    assert_eq!(kinds(input), vec![TokenKind::Literal(expected)]);
}

#[test_case("for", Keyword::For)]
#[test_case("aft", Keyword::Aft)]
#[test_case("0branch", Keyword::ZeroBranch)]
#[test_case("[char]", Keyword::Char)]
#[test_case(".built-in", Keyword::BuiltIn)]
#[test_case(".set", Keyword::Set)]
#[test_case("'", Keyword::Quote)]
fn test_reserved_words(input: &str, keyword: Keyword) {
    assert_eq!(kinds(input), vec![TokenKind::Keyword(keyword)]);
}

#[test]
fn test_every_mnemonic_is_an_instruction_token() {
    for m in h2vm::bytecode::MNEMONICS {
        let tokens = kinds(m.name);
        assert!(
            matches!(tokens[..], [TokenKind::Instruction(found)] if found.name == m.name),
            "{} lexed as {:?}",
            m.name,
            tokens
        );
    }
}

#[test]
fn test_small_program_token_stream() {
    let source = "\
\\ square a number
: sq ( n -- n*n ) dup * ;
start: 7 sq
";
    let tokens = Lexer::new(source).tokenize().unwrap();
    let lines: Vec<usize> = tokens.iter().map(|t| t.line).collect();
    assert_eq!(lines, vec![2, 2, 2, 2, 2, 3, 3, 3]);
    assert_eq!(tokens[1].kind, TokenKind::Identifier("sq".to_string()));
    assert_eq!(tokens[5].kind, TokenKind::Label("start".to_string()));
    assert_eq!(tokens[6].kind, TokenKind::Literal(7));
}

#[test]
fn test_next_token_repeats_end_of_input() {
    let mut lexer = Lexer::new("1");
    assert_eq!(lexer.next_token().unwrap().kind, TokenKind::Literal(1));
    assert_eq!(lexer.next_token().unwrap().kind, TokenKind::Eoi);
    assert_eq!(lexer.next_token().unwrap().kind, TokenKind::Eoi);
}

#[test]
fn test_token_too_long() {
    let long = "x".repeat(256);
    let err = Lexer::new(&long).tokenize().unwrap_err();
    assert_eq!(err, LexError::TokenTooLong { line: 1, length: 256 });
    assert!(Lexer::new(&"x".repeat(255)).tokenize().is_ok());
}

#[test_case("\"caf\u{e9}\"", '\u{e9}' ; "non ascii in string")]
#[test_case("\"a\u{7}b\"", '\u{7}' ; "control character in string")]
#[test_case("caf\u{e9}", '\u{e9}' ; "non ascii in identifier")]
fn test_invalid_characters(input: &str, ch: char) {
    let err = Lexer::new(input).tokenize().unwrap_err();
    assert_eq!(err, LexError::InvalidCharacter { line: 1, ch });
}

#[test]
fn test_strings_keep_spaces_and_newlines() {
    let tokens = kinds("\"two words\nand a line\"");
    assert_eq!(tokens, vec![TokenKind::Str("two words\nand a line".to_string())]);
}

#[test]
fn test_error_lines() {
    let err = Lexer::new("1\n2\n\"open").tokenize().unwrap_err();
    assert_eq!(err.line(), 3);
    assert_eq!(err.to_string(), "line 3: string terminated by end of input");
}
