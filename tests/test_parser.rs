use h2vm::lexer::TokenKind;
use h2vm::parser::{parse, DefinitionFlags, NodeKind, ParseError, Tree};
use test_case::test_case;

fn top_level(tree: &Tree) -> Vec<NodeKind> {
    let body = tree.child(tree.root(), 0).unwrap();
    body.children.iter().map(|c| tree.node(*c).kind).collect()
}

#[test_case("1 2 +", &[NodeKind::Literal, NodeKind::Literal, NodeKind::Instruction] ; "arithmetic")]
#[test_case("call x branch 3 0branch \"y\"", &[NodeKind::Call, NodeKind::Branch, NodeKind::ZeroBranch] ; "jumps")]
#[test_case("constant c 1 variable v \"s\" location l 0", &[NodeKind::Constant, NodeKind::Variable, NodeKind::Location] ; "bindings")]
#[test_case(".pc 16 .pwd 0 .mode 3 .allocate 4 .built-in", &[NodeKind::Pc, NodeKind::Pwd, NodeKind::Mode, NodeKind::Allocate, NodeKind::BuiltIn] ; "directives")]
#[test_case("top: [char] a ' top word", &[NodeKind::Label, NodeKind::Char, NodeKind::Quote, NodeKind::CallDefinition] ; "labels and quotes")]
#[test_case("for 1 next for 1 aft 2 then 3 next", &[NodeKind::ForNext, NodeKind::ForAftThenNext] ; "loops")]
fn test_statement_kinds(source: &str, expected: &[NodeKind]) {
    let tree = parse(source).unwrap();
    assert_eq!(top_level(&tree), expected);
}

#[test]
fn test_nested_control_structures() {
    let tree = parse(": f begin dup while if 1 else 2 then repeat ;").unwrap();
    let body = tree.child(tree.root(), 0).unwrap();
    let definition = tree.node(body.children[0]);
    assert_eq!(definition.kind, NodeKind::Definition);
    assert_eq!(
        definition.token.as_ref().unwrap().kind,
        TokenKind::Identifier("f".to_string())
    );

    let statements = tree.node(definition.children[0]);
    let begin = tree.node(statements.children[0]);
    assert_eq!(begin.kind, NodeKind::BeginWhileRepeat);
    assert_eq!(begin.children.len(), 2);
    let loop_body = tree.node(begin.children[1]);
    assert_eq!(tree.node(loop_body.children[0]).kind, NodeKind::If);
}

#[test]
fn test_hidden_definition_flags() {
    let tree = parse(": helper ; hidden").unwrap();
    let body = tree.child(tree.root(), 0).unwrap();
    let flags = tree.node(body.children[0]).flags;
    assert!(flags.contains(DefinitionFlags::HIDDEN));
    assert_eq!(flags.bits(), 1);
}

#[test_case("if 1", "'then'" ; "unterminated if")]
#[test_case("begin 1", "'until'" ; "unterminated begin")]
#[test_case("for 1", "'next'" ; "unterminated for")]
#[test_case("constant x y", "literal or string" ; "constant needs a value")]
#[test_case(".mode x", "literal" ; "mode needs a literal")]
#[test_case("1 \"text\"", "end of input" ; "bare string is not a statement")]
#[test_case(": f \"text\" ;", "';'" ; "bare string inside definition")]
fn test_syntax_errors(source: &str, expected: &str) {
    match parse(source).unwrap_err() {
        ParseError::UnexpectedToken { expected: e, .. } => assert_eq!(e, expected),
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_lex_errors_surface_through_parser() {
    let err = parse("1 2\n( open").unwrap_err();
    assert!(matches!(err, ParseError::Lex(_)));
    assert_eq!(err.line(), 2);
}

#[test]
fn test_dump_indents_children() {
    let tree = parse("if 1 then").unwrap();
    let mut out = Vec::new();
    tree.dump(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "Program");
    assert_eq!(lines[1], "  Statements");
    assert_eq!(lines[2], "    If");
    assert_eq!(lines[3], "      Statements");
    assert_eq!(lines[4], "        Literal 1");
}
