// compiler.rs - Code generator (parse tree → memory image)

use crate::bytecode::{
    encode_literal, is_0branch, is_alu, is_branch, is_call, is_literal, Alu, AluOp, Cell,
    Disassembly, ADD, ADDRESS_MASK, DECREMENT, DROP, DUP, EXIT, FROM_R, LOAD, MAX_PROGRAM,
    MNEMONICS, OP_0BRANCH, OP_BRANCH, OP_CALL, RDROP, R_FETCH, TO_R, BYE,
};
use crate::image::{self, ImageError, CORE_CELLS, ORIGIN, PC_CELL, SHADOW_CELL};
use crate::lexer::{Token, TokenKind};
use crate::logging::LogContext;
use crate::machine::Machine;
use crate::parser::{self, DefinitionFlags, Node, NodeId, NodeKind, ParseError, Tree};
use crate::symbols::{SymbolError, SymbolKind, SymbolTable};
use log::Level;
use std::ops::BitOr;
use std::path::Path;
use thiserror::Error;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Assembler mode register, also writable from source with `.mode`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mode(Cell);

impl Mode {
    /// Emit dictionary headers for words, constants and variables.
    pub const HEADERS: Mode = Mode(1);
    /// Enable the exit rewrites and the `r1-`/`doNext` loop helpers.
    pub const OPTIMIZE: Mode = Mode(2);

    pub fn from_bits(bits: Cell) -> Self {
        Mode(bits)
    }

    pub fn bits(self) -> Cell {
        self.0
    }

    pub fn contains(self, other: Mode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Mode {
    type Output = Mode;

    fn bitor(self, rhs: Mode) -> Mode {
        Mode(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AssemblerConfig {
    pub mode: Mode,
    pub log: LogContext,
}

impl AssemblerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_log(mut self, log: LogContext) -> Self {
        self.log = log;
        self
    }
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum AssembleError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("line {line}: redefinition of symbol '{name}'")]
    Redefinition { line: usize, name: String },
    #[error("line {line}: {source}")]
    Symbol { line: usize, source: SymbolError },
    #[error("line {line}: undefined symbol '{name}'")]
    UndefinedSymbol { line: usize, name: String },
    #[error("line {line}: '{name}' is a {kind}; only words can be called and constants or variables pushed")]
    NotCallable {
        line: usize,
        name: String,
        kind: SymbolKind,
    },
    #[error("line {line}: '{name}' is not a word or a label")]
    NotQuotable { line: usize, name: String },
    #[error("line {line}: cannot branch or 0branch to word '{name}'")]
    BranchToCall { line: usize, name: String },
    #[error("line {line}: jump target {target:#06x} is outside the program area")]
    JumpOutOfRange { line: usize, target: Cell },
    #[error("line {line}: program counter {pc:#06x} overflowed the program area")]
    ProgramOverflow { line: usize, pc: Cell },
    #[error("line {line}: string \"{text}\" is too long ({length} > 255)")]
    StringTooLong {
        line: usize,
        text: String,
        length: usize,
    },
    #[error("line {line}: variable '{name}' used but doVar not defined, use location")]
    VariableNeedsDoVar { line: usize, name: String },
    #[error("line {line}: constant '{name}' needs a numeric value")]
    ConstantNotNumeric { line: usize, name: String },
    #[error("line {line}: built-in words already defined")]
    BuiltInsRedefined { line: usize },
    #[error("line {line}: cannot set immediate, hidden or inline on '{name}' without word headers")]
    ModifiersWithoutHeaders { line: usize, name: String },
    #[error("line {line}: nested definition of '{name}'")]
    NestedDefinition { line: usize, name: String },
    #[error("line {line}: {kind:?} is missing its operand")]
    MissingOperand { line: usize, kind: NodeKind },
}

impl AssembleError {
    pub fn line(&self) -> usize {
        match self {
            AssembleError::Parse(e) => e.line(),
            AssembleError::Redefinition { line, .. }
            | AssembleError::Symbol { line, .. }
            | AssembleError::UndefinedSymbol { line, .. }
            | AssembleError::NotCallable { line, .. }
            | AssembleError::NotQuotable { line, .. }
            | AssembleError::BranchToCall { line, .. }
            | AssembleError::JumpOutOfRange { line, .. }
            | AssembleError::ProgramOverflow { line, .. }
            | AssembleError::StringTooLong { line, .. }
            | AssembleError::VariableNeedsDoVar { line, .. }
            | AssembleError::ConstantNotNumeric { line, .. }
            | AssembleError::BuiltInsRedefined { line }
            | AssembleError::ModifiersWithoutHeaders { line, .. }
            | AssembleError::NestedDefinition { line, .. }
            | AssembleError::MissingOperand { line, .. } => *line,
        }
    }
}

// ============================================================================
// PROGRAM
// ============================================================================

/// A finished image together with the symbols that produced it.
#[derive(Debug, Clone)]
pub struct Program {
    image: Vec<Cell>,
    symbols: SymbolTable,
}

impl Program {
    pub fn image(&self) -> &[Cell] {
        &self.image
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Cell address execution starts at.
    pub fn entry(&self) -> Cell {
        self.image[PC_CELL]
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        image::cells_to_bytes(&self.image)
    }

    pub fn write_file(&self, path: impl AsRef<Path>) -> Result<(), ImageError> {
        image::write_file(path, &self.image)
    }

    pub fn machine(&self) -> Result<Machine, ImageError> {
        Machine::from_cells(&self.image)
    }

    pub fn into_parts(self) -> (Vec<Cell>, SymbolTable) {
        (self.image, self.symbols)
    }
}

// ============================================================================
// ASSEMBLER
// ============================================================================

/// Helpers emitted by `.built-in` after the inline instruction words.
const HELPERS: &[(&str, &[Cell])] = &[
    ("doVar", &[FROM_R]),
    ("doConst", &[FROM_R, LOAD]),
    ("r1-", &[FROM_R, FROM_R, DECREMENT, TO_R, TO_R]),
];

/// Flag bits stored in the top three bits of a header's link word.
const HEADER_BITS: u8 = DefinitionFlags::IMMEDIATE.bits() | DefinitionFlags::INLINE.bits();

/// Single pass code generator. Words before `fence` may already be the
/// target of a resolved jump, so the peephole rewrites never touch them.
pub struct Assembler {
    core: Vec<Cell>,
    /// One past the highest cell written.
    top: usize,
    here: Cell,
    fence: Cell,
    pwd: Cell,
    mode: Mode,
    symbols: SymbolTable,
    built_ins: bool,
    in_definition: bool,
    entry: Option<Cell>,
    explicit_entry: bool,
    line: usize,
    log: LogContext,
}

impl Assembler {
    pub fn new(config: AssemblerConfig) -> Self {
        Self::with_symbols(config, SymbolTable::new())
    }

    /// Start a fresh image with `symbols` already defined.
    pub fn with_symbols(config: AssemblerConfig, symbols: SymbolTable) -> Self {
        let mut core = vec![0; CORE_CELLS];
        core[..usize::from(ORIGIN)].copy_from_slice(&image::default_header());
        Assembler {
            core,
            top: usize::from(ORIGIN),
            here: ORIGIN,
            fence: ORIGIN,
            pwd: 0,
            mode: config.mode,
            symbols,
            built_ins: false,
            in_definition: false,
            entry: None,
            explicit_entry: false,
            line: 1,
            log: config.log,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Current write cursor.
    pub fn pc(&self) -> Cell {
        self.here
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Everything written so far, header included.
    pub fn image(&self) -> &[Cell] {
        &self.core[..self.top]
    }

    pub fn assemble_source(&mut self, source: &str) -> Result<(), AssembleError> {
        let tree = parser::parse(source)?;
        self.log.debug(format_args!("parse tree:\n{}", tree));
        self.assemble_tree(&tree)
    }

    pub fn assemble_tree(&mut self, tree: &Tree) -> Result<(), AssembleError> {
        self.assemble_node(tree, tree.root())
    }

    /// Append the `bye` epilogue, settle the entry point and shadow the
    /// registers.
    pub fn finish(mut self) -> Result<Program, AssembleError> {
        let epilogue = self.here();
        self.generate(BYE)?;
        if !self.explicit_entry {
            self.core[PC_CELL] = self.entry.unwrap_or(epilogue);
        }
        self.core.copy_within(PC_CELL..PC_CELL + 4, SHADOW_CELL);

        if self.log.enabled(Level::Debug) {
            let mut dump = Vec::new();
            if self.symbols.dump(&mut dump).is_ok() {
                self.log
                    .debug(format_args!("symbols:\n{}", String::from_utf8_lossy(&dump)));
            }
        }

        self.core.truncate(self.top);
        Ok(Program {
            image: self.core,
            symbols: self.symbols,
        })
    }

    // ========================================================================
    // TREE WALK
    // ========================================================================

    fn assemble_node(&mut self, tree: &Tree, id: NodeId) -> Result<(), AssembleError> {
        let node = tree.node(id);
        self.line = node.line;
        if !self.in_definition && self.entry.is_none() && emits_code(node.kind) {
            self.entry = Some(self.here);
        }

        match node.kind {
            NodeKind::Program | NodeKind::Statements => {
                for child in &node.children {
                    self.assemble_node(tree, *child)?;
                }
            }
            NodeKind::Label => {
                let name = self.name(node)?;
                let at = self.here();
                self.define(SymbolKind::Label, name, at, false)?;
            }
            NodeKind::Call | NodeKind::Branch | NodeKind::ZeroBranch => self.jump(node)?,
            NodeKind::Constant => self.constant(node)?,
            NodeKind::Variable | NodeKind::Location => self.variable(node)?,
            NodeKind::Literal => match self.operand(node)?.kind {
                TokenKind::Literal(value) => self.literal(value)?,
                _ => return Err(self.missing(node)),
            },
            NodeKind::Instruction => match self.operand(node)?.kind {
                TokenKind::Instruction(m) => self.generate(m.bits)?,
                _ => return Err(self.missing(node)),
            },
            NodeKind::Char => {
                let c = self.name(node)?.chars().next().map(u32::from).unwrap_or(0);
                self.literal(c as Cell)?;
            }
            NodeKind::Quote => {
                let name = self.name(node)?;
                let symbol = self.symbols.lookup(name).ok_or_else(|| {
                    AssembleError::UndefinedSymbol {
                        line: self.line,
                        name: name.to_string(),
                    }
                })?;
                if !matches!(symbol.kind, SymbolKind::Call | SymbolKind::Label) {
                    return Err(AssembleError::NotQuotable {
                        line: self.line,
                        name: name.to_string(),
                    });
                }
                let address = symbol.value << 1;
                self.literal(address)?;
            }
            NodeKind::CallDefinition => self.call_definition(node)?,
            NodeKind::If => {
                let skip = self.hole()?;
                self.assemble_node(tree, node.children[0])?;
                match node.children.get(1) {
                    Some(otherwise) => {
                        let end = self.hole()?;
                        self.fix(skip, OP_0BRANCH | (end + 1))?;
                        self.assemble_node(tree, *otherwise)?;
                        let after = self.here();
                        self.fix(end, OP_BRANCH | after)?;
                    }
                    None => {
                        let after = self.here();
                        self.fix(skip, OP_0BRANCH | after)?;
                    }
                }
            }
            NodeKind::BeginUntil | NodeKind::BeginAgain => {
                let start = self.here();
                self.assemble_node(tree, node.children[0])?;
                let op = if node.kind == NodeKind::BeginAgain {
                    OP_BRANCH
                } else {
                    OP_0BRANCH
                };
                self.generate(op | start)?;
            }
            NodeKind::BeginWhileRepeat => {
                let start = self.here();
                self.assemble_node(tree, node.children[0])?;
                let exit = self.hole()?;
                self.assemble_node(tree, node.children[1])?;
                self.generate(OP_BRANCH | start)?;
                let after = self.here();
                self.fix(exit, OP_0BRANCH | after)?;
            }
            NodeKind::ForNext => {
                self.generate(TO_R)?;
                let top = self.here();
                self.assemble_node(tree, node.children[0])?;
                self.loop_next(top)?;
            }
            NodeKind::ForAftThenNext => {
                self.generate(TO_R)?;
                self.assemble_node(tree, node.children[0])?;
                let skip = self.hole()?;
                let top = self.here();
                self.assemble_node(tree, node.children[1])?;
                let body = self.here();
                self.fix(skip, OP_BRANCH | body)?;
                self.assemble_node(tree, node.children[2])?;
                self.loop_next(top)?;
            }
            NodeKind::Definition => self.definition(tree, node)?,
            NodeKind::Set => self.set(node)?,
            NodeKind::Pwd => {
                let token = self.operand(node)?;
                self.pwd = self.literal_or_symbol(token)?;
            }
            NodeKind::Pc => {
                let token = self.operand(node)?;
                self.here = self.literal_or_symbol(token)?;
                self.fence = self.fence.max(self.here);
            }
            NodeKind::Allocate => {
                let token = self.operand(node)?;
                let bytes = self.literal_or_symbol(token)?;
                self.here = self.here.wrapping_add(bytes >> 1);
                self.fence = self.fence.max(self.here);
            }
            NodeKind::Mode => match self.operand(node)?.kind {
                TokenKind::Literal(bits) => self.mode = Mode::from_bits(bits),
                _ => return Err(self.missing(node)),
            },
            NodeKind::BuiltIn => self.built_ins()?,
        }
        Ok(())
    }

    fn jump(&mut self, node: &Node) -> Result<(), AssembleError> {
        let token = self.operand(node)?;
        let target = match &token.kind {
            TokenKind::Literal(value) => *value,
            _ => {
                let name = self.name(node)?;
                let (kind, value) = self.lookup(name)?;
                if kind == SymbolKind::Call && node.kind != NodeKind::Call {
                    return Err(AssembleError::BranchToCall {
                        line: self.line,
                        name: name.to_string(),
                    });
                }
                value
            }
        };
        if target >= MAX_PROGRAM {
            return Err(AssembleError::JumpOutOfRange {
                line: self.line,
                target,
            });
        }
        let op = match node.kind {
            NodeKind::Call => OP_CALL,
            NodeKind::Branch => OP_BRANCH,
            _ => OP_0BRANCH,
        };
        self.generate(op | target)
    }

    fn call_definition(&mut self, node: &Node) -> Result<(), AssembleError> {
        let name = self.name(node)?;
        match self.lookup(name)? {
            (SymbolKind::Call, address) => self.generate(OP_CALL | (address & ADDRESS_MASK)),
            (SymbolKind::Constant | SymbolKind::Variable, value) => self.literal(value),
            (kind, _) => Err(AssembleError::NotCallable {
                line: self.line,
                name: name.to_string(),
                kind,
            }),
        }
    }

    fn definition(&mut self, tree: &Tree, node: &Node) -> Result<(), AssembleError> {
        let name = self.name(node)?;
        if self.in_definition {
            return Err(AssembleError::NestedDefinition {
                line: self.line,
                name: name.to_string(),
            });
        }
        let headers = self.mode.contains(Mode::HEADERS);
        if !node.flags.is_empty() && !headers {
            return Err(AssembleError::ModifiersWithoutHeaders {
                line: self.line,
                name: name.to_string(),
            });
        }
        let hidden = node.flags.contains(DefinitionFlags::HIDDEN);
        if headers && !hidden {
            self.header(name, node.flags.bits() & HEADER_BITS)?;
        }

        let start = self.here();
        self.define(SymbolKind::Call, name, start, hidden)?;
        self.in_definition = true;
        for child in &node.children {
            self.assemble_node(tree, *child)?;
        }
        self.in_definition = false;
        self.generate(EXIT)
    }

    fn constant(&mut self, node: &Node) -> Result<(), AssembleError> {
        let name = self.name(node)?;
        let value = match node.value.as_ref().map(|t| &t.kind) {
            Some(TokenKind::Literal(value)) => *value,
            _ => {
                return Err(AssembleError::ConstantNotNumeric {
                    line: self.line,
                    name: name.to_string(),
                })
            }
        };
        let hidden = node.flags.contains(DefinitionFlags::HIDDEN);
        if self.mode.contains(Mode::HEADERS) && self.built_ins && !hidden {
            let do_const = self.helper("doConst")?;
            self.header(name, 0)?;
            self.generate(OP_CALL | do_const)?;
            self.data(value)?;
        }
        self.define(SymbolKind::Constant, name, value, hidden)
    }

    /// Variables and locations. The symbol holds the byte address of the
    /// storage cell.
    fn variable(&mut self, node: &Node) -> Result<(), AssembleError> {
        let name = self.name(node)?;
        let hidden = node.flags.contains(DefinitionFlags::HIDDEN);
        if node.kind == NodeKind::Variable && !hidden {
            if !(self.mode.contains(Mode::HEADERS) && self.built_ins) {
                return Err(AssembleError::VariableNeedsDoVar {
                    line: self.line,
                    name: name.to_string(),
                });
            }
            let do_var = self.helper("doVar")?;
            self.header(name, 0)?;
            self.generate(OP_CALL | do_var)?;
        }

        self.here();
        let cell = match node.value.as_ref().map(|t| &t.kind) {
            Some(TokenKind::Literal(value)) => self.data(*value)?,
            Some(TokenKind::Str(text)) => self.pack_string(text)?,
            _ => return Err(self.missing(node)),
        };
        self.define(SymbolKind::Variable, name, cell << 1, hidden)
    }

    /// `.set loc val`. Cell 0 holds a cell address, so a value written
    /// there is taken as a byte address and halved.
    fn set(&mut self, node: &Node) -> Result<(), AssembleError> {
        let location = self.literal_or_symbol(self.operand(node)?)? >> 1;
        let value = match node.value.as_ref().map(|t| &t.kind) {
            Some(TokenKind::Literal(value)) => *value,
            Some(TokenKind::Identifier(name)) | Some(TokenKind::Str(name)) => {
                match self.symbols.lookup(name) {
                    Some(s) if matches!(s.kind, SymbolKind::Call | SymbolKind::Label) => {
                        s.value << 1
                    }
                    Some(s) => s.value,
                    None => match name.as_str() {
                        "$pc" => self.here << 1,
                        "$pwd" => self.pwd,
                        _ => {
                            return Err(AssembleError::UndefinedSymbol {
                                line: self.line,
                                name: name.clone(),
                            })
                        }
                    },
                }
            }
            _ => return Err(self.missing(node)),
        };

        if usize::from(location) == PC_CELL {
            self.explicit_entry = true;
            self.fix(location, value >> 1)
        } else {
            self.fix(location, value)
        }
    }

    fn built_ins(&mut self) -> Result<(), AssembleError> {
        if !self.mode.contains(Mode::HEADERS) {
            return Ok(());
        }
        if self.built_ins {
            return Err(AssembleError::BuiltInsRedefined { line: self.line });
        }
        self.built_ins = true;

        for m in MNEMONICS.iter().filter(|m| m.inline) {
            self.header(m.name, DefinitionFlags::INLINE.bits())?;
            let start = self.here();
            self.define(SymbolKind::Call, m.name, start, false)?;
            self.generate(m.bits)?;
            self.generate(EXIT)?;
        }

        for (name, body) in HELPERS {
            let start = self.here();
            self.define(SymbolKind::Call, name, start, true)?;
            for word in body.iter() {
                self.generate(*word)?;
            }
            self.generate(EXIT)?;
        }

        // doNext ( R: count ret -- R: count-1 ) jumps to the address stored
        // after the call until the count reaches zero, then skips it.
        let start = self.here();
        self.define(SymbolKind::Call, "doNext", start, true)?;
        for word in [FROM_R, FROM_R, DECREMENT, DUP] {
            self.generate(word)?;
        }
        let done = self.hole()?;
        for word in [TO_R, LOAD, TO_R, EXIT] {
            self.generate(word)?;
        }
        let finished = self.here();
        self.fix(done, OP_0BRANCH | finished)?;
        self.generate(DROP)?;
        self.literal(2)?;
        self.generate(ADD)?;
        self.generate(TO_R)?;
        self.generate(EXIT)
    }

    /// Close a `for` loop whose body starts at `top`. The counter on the
    /// return stack is decremented before it is tested.
    fn loop_next(&mut self, top: Cell) -> Result<(), AssembleError> {
        if let Some(do_next) = self.optimized_helper("doNext") {
            self.generate(OP_CALL | do_next)?;
            self.data(top << 1)?;
            return Ok(());
        }

        match self.optimized_helper("r1-") {
            Some(decrement) => self.generate(OP_CALL | decrement)?,
            None => {
                self.generate(FROM_R)?;
                self.generate(DECREMENT)?;
                self.generate(TO_R)?;
            }
        }
        self.generate(R_FETCH)?;
        let exit = self.hole()?;
        self.generate(OP_BRANCH | top)?;
        let after = self.here();
        self.fix(exit, OP_0BRANCH | after)?;
        self.generate(RDROP)
    }

    // ========================================================================
    // EMISSION
    // ========================================================================

    /// Current cursor; nothing before it may be rewritten afterwards.
    fn here(&mut self) -> Cell {
        self.fence = self.fence.max(self.here);
        self.here
    }

    /// Reserve a word to be patched later with `fix`. Holes are listed
    /// once they are fixed.
    fn hole(&mut self) -> Result<Cell, AssembleError> {
        self.here();
        self.emit(0)
    }

    fn fix(&mut self, at: Cell, word: Cell) -> Result<(), AssembleError> {
        self.store(at, word)?;
        self.log.debug(format_args!(
            "{:04x}: {:04x}  {} (fixed)",
            at,
            word,
            Disassembly(word)
        ));
        Ok(())
    }

    /// A word that is never executed or rewritten: links, names, values.
    fn data(&mut self, word: Cell) -> Result<Cell, AssembleError> {
        self.here();
        let at = self.emit(word)?;
        self.here();
        self.log
            .debug(format_args!("{:04x}: {:04x}  data", at, word));
        Ok(at)
    }

    fn store(&mut self, at: Cell, word: Cell) -> Result<(), AssembleError> {
        let index = usize::from(at);
        match self.core.get_mut(index) {
            Some(cell) => *cell = word,
            None => {
                return Err(AssembleError::ProgramOverflow {
                    line: self.line,
                    pc: at,
                })
            }
        }
        self.top = self.top.max(index + 1);
        Ok(())
    }

    fn emit(&mut self, word: Cell) -> Result<Cell, AssembleError> {
        let at = self.here;
        if at >= MAX_PROGRAM {
            return Err(AssembleError::ProgramOverflow {
                line: self.line,
                pc: at,
            });
        }
        self.store(at, word)?;
        self.here += 1;
        Ok(at)
    }

    fn generate(&mut self, word: Cell) -> Result<(), AssembleError> {
        if is_call(word) || is_literal(word) || is_0branch(word) || is_branch(word) {
            self.fence = self.fence.max(self.here);
        }
        if word == EXIT && self.mode.contains(Mode::OPTIMIZE) && self.rewrite_exit() {
            return Ok(());
        }
        let at = self.emit(word)?;
        self.log
            .debug(format_args!("{:04x}: {:04x}  {}", at, word, Disassembly(word)));
        Ok(())
    }

    /// Fold an `exit` into the previous word instead of emitting it.
    fn rewrite_exit(&mut self) -> bool {
        let Some(last) = self.here.checked_sub(1) else {
            return false;
        };
        let previous = self.core[usize::from(last)];
        if last > self.fence && is_alu(previous) && merges_with_exit(previous) {
            self.core[usize::from(last)] = previous | EXIT;
            self.fence = last;
            self.log.debug(format_args!(
                "{:04x}: exit merged [{:04x} -> {:04x}]",
                last,
                previous,
                previous | EXIT
            ));
            true
        } else if self.here > self.fence && is_call(previous) {
            let jump = OP_BRANCH | (previous & ADDRESS_MASK);
            self.core[usize::from(last)] = jump;
            self.fence = self.fence.max(last);
            self.log.debug(format_args!(
                "{:04x}: tail call [{:04x} -> {:04x}]",
                last, previous, jump
            ));
            true
        } else {
            false
        }
    }

    fn literal(&mut self, value: Cell) -> Result<(), AssembleError> {
        for word in encode_literal(value) {
            self.generate(word)?;
        }
        Ok(())
    }

    /// Counted string: `len | s[0] << 8`, then the remaining bytes in
    /// pairs, low byte first.
    fn pack_string(&mut self, text: &str) -> Result<Cell, AssembleError> {
        let bytes = text.as_bytes();
        if bytes.len() > 255 {
            return Err(AssembleError::StringTooLong {
                line: self.line,
                text: text.to_string(),
                length: bytes.len(),
            });
        }
        let first = bytes.first().copied().unwrap_or(0);
        let start = self.data(bytes.len() as Cell | Cell::from(first) << 8)?;
        for pair in bytes.get(1..).unwrap_or_default().chunks(2) {
            let high = pair.get(1).copied().unwrap_or(0);
            self.data(Cell::from(pair[0]) | Cell::from(high) << 8)?;
        }
        Ok(start)
    }

    /// Dictionary header: link to the previous header with the flag bits
    /// on top, then the packed name.
    fn header(&mut self, name: &str, bits: u8) -> Result<(), AssembleError> {
        let link = self.data(self.pwd | Cell::from(bits) << 13)?;
        self.pwd = link << 1;
        self.pack_string(name)?;
        Ok(())
    }

    // ========================================================================
    // SYMBOLS
    // ========================================================================

    fn define(
        &mut self,
        kind: SymbolKind,
        name: &str,
        value: Cell,
        hidden: bool,
    ) -> Result<(), AssembleError> {
        self.symbols
            .add(kind, name, value, hidden)
            .map_err(|e| match e {
                SymbolError::Redefinition(name) => AssembleError::Redefinition {
                    line: self.line,
                    name,
                },
                source => AssembleError::Symbol {
                    line: self.line,
                    source,
                },
            })
    }

    fn lookup(&self, name: &str) -> Result<(SymbolKind, Cell), AssembleError> {
        self.symbols
            .lookup(name)
            .map(|s| (s.kind, s.value))
            .ok_or_else(|| AssembleError::UndefinedSymbol {
                line: self.line,
                name: name.to_string(),
            })
    }

    fn helper(&self, name: &str) -> Result<Cell, AssembleError> {
        self.lookup(name).map(|(_, address)| address)
    }

    /// Address of a built-in helper when optimizing and it exists.
    fn optimized_helper(&self, name: &str) -> Option<Cell> {
        if !self.mode.contains(Mode::OPTIMIZE) {
            return None;
        }
        self.symbols
            .lookup(name)
            .filter(|s| s.kind == SymbolKind::Call)
            .map(|s| s.value)
    }

    fn literal_or_symbol(&self, token: &Token) -> Result<Cell, AssembleError> {
        match &token.kind {
            TokenKind::Literal(value) => Ok(*value),
            TokenKind::Identifier(name) | TokenKind::Str(name) => {
                self.lookup(name).map(|(_, value)| value)
            }
            _ => Err(AssembleError::MissingOperand {
                line: token.line,
                kind: NodeKind::Literal,
            }),
        }
    }

    fn operand<'t>(&self, node: &'t Node) -> Result<&'t Token, AssembleError> {
        node.token.as_ref().ok_or_else(|| self.missing(node))
    }

    fn name<'t>(&self, node: &'t Node) -> Result<&'t str, AssembleError> {
        match &self.operand(node)?.kind {
            TokenKind::Identifier(name) | TokenKind::Str(name) | TokenKind::Label(name) => {
                Ok(name)
            }
            _ => Err(self.missing(node)),
        }
    }

    fn missing(&self, node: &Node) -> AssembleError {
        AssembleError::MissingOperand {
            line: node.line,
            kind: node.kind,
        }
    }
}

/// Statements that emit executable code, as opposed to definitions,
/// storage and directives.
fn emits_code(kind: NodeKind) -> bool {
    matches!(
        kind,
        NodeKind::Literal
            | NodeKind::Instruction
            | NodeKind::CallDefinition
            | NodeKind::Call
            | NodeKind::Branch
            | NodeKind::ZeroBranch
            | NodeKind::If
            | NodeKind::BeginUntil
            | NodeKind::BeginAgain
            | NodeKind::BeginWhileRepeat
            | NodeKind::ForNext
            | NodeKind::ForAftThenNext
            | NodeKind::Char
            | NodeKind::Quote
    )
}

/// An ALU word can absorb a following `exit` only if it leaves the return
/// stack alone.
fn merges_with_exit(word: Cell) -> bool {
    let alu = Alu::decode(word);
    !alu.r_to_pc
        && !alu.t_to_r
        && alu.rdelta == 0
        && !matches!(alu.op(), Some(AluOp::RpStore) | Some(AluOp::Callback))
}

/// Assemble `source` into a finished program.
pub fn assemble(source: &str, config: AssemblerConfig) -> Result<Program, AssembleError> {
    let mut assembler = Assembler::new(config);
    assembler.assemble_source(source)?;
    assembler.finish()
}

// ============================================================================
// TESTS
// ============================================================================
