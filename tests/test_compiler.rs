use h2vm::bytecode::{disassemble, Cell, ADD, BYE, DUP, EXIT, MUL, OP_CALL, OP_LITERAL};
use h2vm::compiler::{assemble, AssembleError, Assembler, AssemblerConfig, Mode};
use h2vm::image::{ORIGIN, SHADOW_CELL};
use h2vm::machine::{Exit, Options};
use h2vm::symbols::SymbolKind;
use test_case::test_case;

fn config(bits: Cell) -> AssemblerConfig {
    AssemblerConfig::new().with_mode(Mode::from_bits(bits))
}

fn at(origin_offset: u16) -> usize {
    usize::from(ORIGIN + origin_offset)
}

#[test]
fn test_minimal_program_layout() {
    let program = assemble("2 2 +", config(0)).unwrap();
    let image = program.image();
    assert_eq!(&image[at(0)..], &[OP_LITERAL | 2, OP_LITERAL | 2, ADD, BYE]);
    assert_eq!(program.entry(), ORIGIN);
    assert_eq!(&image[SHADOW_CELL..SHADOW_CELL + 4], &image[0..4]);
}

#[test]
fn test_header_chain() {
    let program = assemble(": a ; : b ; : c ; inline", config(1)).unwrap();
    let symbols = program.symbols();
    let image = program.image();

    // each header is: link, packed name, then the body
    let a = usize::from(symbols.lookup("a").unwrap().value);
    let b = usize::from(symbols.lookup("b").unwrap().value);
    let c = usize::from(symbols.lookup("c").unwrap().value);
    assert_eq!(image[a - 2], 0);
    assert_eq!(image[b - 2], ((a - 2) << 1) as Cell);
    assert_eq!(image[c - 2], ((b - 2) << 1) as Cell | 4 << 13);
    assert_eq!(image[c - 1], 1 | Cell::from(b'c') << 8);
}

#[test]
fn test_hidden_word_has_no_header() {
    let program = assemble(": a ; hidden", config(1)).unwrap();
    let a = program.symbols().lookup("a").unwrap();
    assert!(a.hidden);
    assert_eq!(a.value, ORIGIN);
}

#[test]
fn test_string_variable_is_packed() {
    let program = assemble("location msg \"hey\"", config(0)).unwrap();
    let msg = usize::from(program.symbols().lookup("msg").unwrap().value >> 1);
    let image = program.image();
    assert_eq!(image[msg], 3 | Cell::from(b'h') << 8);
    assert_eq!(image[msg + 1], Cell::from(b'e') | Cell::from(b'y') << 8);
}

#[test]
fn test_variable_and_constant_headers() {
    let source = ".built-in constant ten 10 variable v 7";
    let program = assemble(source, config(1)).unwrap();
    let symbols = program.symbols();
    let image = program.image();

    let ten = symbols.lookup("ten").unwrap();
    assert_eq!(ten.kind, SymbolKind::Constant);
    assert_eq!(ten.value, 10);

    let do_var = symbols.lookup("doVar").unwrap().value;
    let v = usize::from(symbols.lookup("v").unwrap().value >> 1);
    assert_eq!(image[v], 7);
    assert_eq!(image[v - 1], OP_CALL | do_var);
}

#[test]
fn test_directives_move_the_cursor() {
    let program = assemble(".allocate 8 1", config(0)).unwrap();
    assert_eq!(program.entry(), ORIGIN + 4);

    let program = assemble(".pc $100 1", config(0)).unwrap();
    assert_eq!(program.entry(), 0x100);
    assert_eq!(program.image().len(), 0x102);
}

#[test]
fn test_set_writes_values() {
    let program = assemble(": w ; location p 0 location q 0 .set p w .set q $pc", config(0)).unwrap();
    let symbols = program.symbols();
    let p = usize::from(symbols.lookup("p").unwrap().value >> 1);
    let q = usize::from(symbols.lookup("q").unwrap().value >> 1);
    let image = program.image();
    assert_eq!(image[p], ORIGIN << 1);
    assert_eq!(image[q], (q as Cell + 1) << 1);
}

#[test]
fn test_pwd_directive_seeds_the_chain() {
    let program = assemble(".pwd 100 : a ;", config(1)).unwrap();
    assert_eq!(program.image()[at(0)], 100);
}

#[test]
fn test_quote_and_char() {
    let program = assemble(": five 5 ; ' five [char] A", config(0)).unwrap();
    let image = program.image();
    assert_eq!(image[at(2)], OP_LITERAL | (ORIGIN << 1));
    assert_eq!(image[at(3)], OP_LITERAL | 65);
}

#[test]
fn test_incremental_assembly() {
    let mut assembler = Assembler::new(config(2));
    assembler.assemble_source(": sq dup * ;").unwrap();
    assert_eq!(assembler.symbols().len(), 1);
    assembler.assemble_source("3 sq").unwrap();
    let program = assembler.finish().unwrap();
    assert_eq!(&program.image()[at(0)..], &[DUP, MUL | EXIT, OP_LITERAL | 3, OP_CALL | ORIGIN, BYE]);

    let mut machine = program.machine().unwrap();
    assert_eq!(machine.run(&mut Options::default()).unwrap(), Exit::Halted(9));

    let (_, symbols) = program.into_parts();
    let mut next = Assembler::with_symbols(config(0), symbols);
    let err = next.assemble_source(": sq ;").unwrap_err();
    assert!(matches!(err, AssembleError::Redefinition { ref name, .. } if name == "sq"));
}

#[test]
fn test_disassembly_of_generated_code() {
    let program = assemble(": sq dup * ; 3 sq", config(2)).unwrap();
    let listing: Vec<String> = program.image()[at(0)..].iter().map(|w| disassemble(*w)).collect();
    assert_eq!(listing, vec!["dup", "alu:um* N->T R->PC d-1 r-1", "$3", "call $10", "bye"]);
}

#[test_case(": a ; : a ;", "Redefinition" ; "redefinition")]
#[test_case("missing", "UndefinedSymbol" ; "undefined word")]
#[test_case("call later : later ;", "UndefinedSymbol" ; "no forward references")]
#[test_case("top: top", "NotCallable" ; "label is not callable")]
#[test_case(": w ; branch w", "BranchToCall" ; "branch to a word")]
#[test_case("branch $2000", "JumpOutOfRange" ; "jump outside program area")]
#[test_case("' nothing", "UndefinedSymbol" ; "quote of undefined name")]
#[test_case("constant c 1 ' c", "NotQuotable" ; "quote of a constant")]
#[test_case("constant s \"x\"", "ConstantNotNumeric" ; "string constant")]
#[test_case("variable v 0", "VariableNeedsDoVar" ; "variable without doVar")]
#[test_case(": x ; immediate", "ModifiersWithoutHeaders" ; "modifier without headers")]
fn test_semantic_errors(source: &str, variant: &str) {
    let err = assemble(source, config(0)).unwrap_err();
    let debug = format!("{:?}", err);
    assert!(debug.starts_with(variant), "{} gave {:?}", source, err);
}

#[test]
fn test_errors_carry_line_and_name() {
    let err = assemble("1 2\n: a ;\n: a ;", config(0)).unwrap_err();
    assert_eq!(err.line(), 3);
    assert_eq!(err.to_string(), "line 3: redefinition of symbol 'a'");

    let err = assemble("\n\nfoo", config(0)).unwrap_err();
    assert_eq!(err.to_string(), "line 3: undefined symbol 'foo'");
}

#[test]
fn test_optimizer_shrinks_code() {
    let source = ": sq dup * ; : quad sq sq ; 3 quad";
    let plain = assemble(source, config(0)).unwrap();
    let optimized = assemble(source, config(2)).unwrap();
    assert!(optimized.image().len() < plain.image().len());
}
