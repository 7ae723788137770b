// parser.rs - Recursive descent parser (tokens → arena parse tree)

use crate::lexer::{Keyword, LexError, Lexer, Token, TokenKind};
use std::fmt;
use std::io::{self, Write};
use thiserror::Error;

// ============================================================================
// PARSE TREE
// ============================================================================

/// Index of a node inside its `Tree`.
pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Program,
    Statements,
    Label,
    Branch,
    ZeroBranch,
    Call,
    Constant,
    Variable,
    Location,
    Literal,
    Instruction,
    BeginUntil,
    BeginAgain,
    BeginWhileRepeat,
    If,
    ForNext,
    ForAftThenNext,
    Definition,
    Char,
    Quote,
    Pwd,
    Set,
    Pc,
    Mode,
    Allocate,
    BuiltIn,
    CallDefinition,
}

/// Modifier bits of a word definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefinitionFlags(u8);

impl DefinitionFlags {
    pub const HIDDEN: DefinitionFlags = DefinitionFlags(1);
    pub const IMMEDIATE: DefinitionFlags = DefinitionFlags(2);
    pub const INLINE: DefinitionFlags = DefinitionFlags(4);

    pub fn empty() -> Self {
        DefinitionFlags(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: DefinitionFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: DefinitionFlags) {
        self.0 |= other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for DefinitionFlags {
    type Output = DefinitionFlags;

    fn bitor(self, rhs: DefinitionFlags) -> DefinitionFlags {
        DefinitionFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub line: usize,
    pub children: Vec<NodeId>,
    /// The token that names or parameterises the node.
    pub token: Option<Token>,
    /// Second operand of two-token forms (`.set`, bindings).
    pub value: Option<Token>,
    pub flags: DefinitionFlags,
}

impl Node {
    fn new(kind: NodeKind, line: usize) -> Self {
        Node {
            kind,
            line,
            children: Vec::new(),
            token: None,
            value: None,
            flags: DefinitionFlags::empty(),
        }
    }

    fn with_token(kind: NodeKind, token: Token) -> Self {
        let mut node = Node::new(kind, token.line);
        node.token = Some(token);
        node
    }
}

/// Nodes live in one vector and refer to their children by index.
#[derive(Debug, Clone, PartialEq)]
pub struct Tree {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Tree {
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Child `index` of `id`, if present.
    pub fn child(&self, id: NodeId, index: usize) -> Option<&Node> {
        self.nodes[id].children.get(index).map(|c| &self.nodes[*c])
    }

    pub fn dump(&self, out: &mut dyn Write) -> io::Result<()> {
        self.dump_node(out, self.root, 0)
    }

    fn dump_node(&self, out: &mut dyn Write, id: NodeId, depth: usize) -> io::Result<()> {
        let node = &self.nodes[id];
        write!(out, "{:indent$}{:?}", "", node.kind, indent = depth * 2)?;
        if let Some(token) = &node.token {
            write!(out, " {}", token)?;
        }
        if let Some(value) = &node.value {
            write!(out, " {}", value)?;
        }
        if !node.flags.is_empty() {
            write!(out, " flags={}", node.flags.bits())?;
        }
        writeln!(out)?;
        for child in &node.children {
            self.dump_node(out, *child, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut buffer = Vec::new();
        self.dump(&mut buffer).map_err(|_| fmt::Error)?;
        write!(f, "{}", String::from_utf8_lossy(&buffer))
    }
}

// ============================================================================
// PARSER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error("line {line}: syntax error, expected {expected} but got '{found}'")]
    UnexpectedToken {
        line: usize,
        expected: String,
        found: TokenKind,
    },
    #[error("line {line}: {modifier} already set on latest word definition")]
    DuplicateModifier { line: usize, modifier: &'static str },
    #[error("line {line}: expected single character, got identifier '{found}'")]
    NotSingleCharacter { line: usize, found: String },
}

impl ParseError {
    pub fn line(&self) -> usize {
        match self {
            ParseError::Lex(e) => e.line(),
            ParseError::UnexpectedToken { line, .. }
            | ParseError::DuplicateModifier { line, .. }
            | ParseError::NotSingleCharacter { line, .. } => *line,
        }
    }
}

/// What a token allows in operand position.
#[derive(Clone, Copy)]
enum Operand {
    Literal,
    Identifier,
    Str,
}

impl Operand {
    fn matches(self, kind: &TokenKind) -> bool {
        matches!(
            (self, kind),
            (Operand::Literal, TokenKind::Literal(_))
                | (Operand::Identifier, TokenKind::Identifier(_))
                | (Operand::Str, TokenKind::Str(_))
        )
    }
}

pub struct Parser {
    lexer: Lexer,
    lookahead: Option<Token>,
    nodes: Vec<Node>,
}

impl Parser {
    pub fn new(lexer: Lexer) -> Self {
        Parser {
            lexer,
            lookahead: None,
            nodes: Vec::new(),
        }
    }

    /// program := statements EOI
    pub fn parse(mut self) -> Result<Tree, ParseError> {
        let line = self.peek()?.line;
        let body = self.statements()?;
        self.expect_eoi()?;
        let mut program = Node::new(NodeKind::Program, line);
        program.children.push(body);
        let root = self.add(program);
        Ok(Tree {
            nodes: self.nodes,
            root,
        })
    }

    fn add(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn statements(&mut self) -> Result<NodeId, ParseError> {
        let line = self.peek()?.line;
        let mut node = Node::new(NodeKind::Statements, line);
        while let Some(child) = self.statement()? {
            node.children.push(child);
        }
        Ok(self.add(node))
    }

    /// Parse one statement, or return `None` at a token that closes the
    /// enclosing construct.
    fn statement(&mut self) -> Result<Option<NodeId>, ParseError> {
        let leaf = match &self.peek()?.kind {
            TokenKind::Literal(_) => Some(NodeKind::Literal),
            TokenKind::Label(_) => Some(NodeKind::Label),
            TokenKind::Identifier(_) => Some(NodeKind::CallDefinition),
            TokenKind::Instruction(_) => Some(NodeKind::Instruction),
            TokenKind::Keyword(_) => None,
            TokenKind::Str(_) | TokenKind::Eoi => return Ok(None),
        };
        if let Some(kind) = leaf {
            return self.leaf(kind).map(Some);
        }
        let keyword = match self.peek()?.kind {
            TokenKind::Keyword(k) => k,
            _ => return Ok(None),
        };

        let id = match keyword {
            Keyword::Call => self.jump(NodeKind::Call)?,
            Keyword::Branch => self.jump(NodeKind::Branch)?,
            Keyword::ZeroBranch => self.jump(NodeKind::ZeroBranch)?,
            Keyword::Constant => self.binding(NodeKind::Constant)?,
            Keyword::Variable => self.binding(NodeKind::Variable)?,
            Keyword::Location => self.binding(NodeKind::Location)?,
            Keyword::If => self.if_then()?,
            Keyword::Begin => self.begin()?,
            Keyword::For => self.for_next()?,
            Keyword::Define => self.definition()?,
            Keyword::Char => self.char_literal()?,
            Keyword::Quote => {
                self.operand_node(NodeKind::Quote, &[Operand::Identifier, Operand::Str])?
            }
            Keyword::Pwd => {
                self.operand_node(NodeKind::Pwd, &[Operand::Literal, Operand::Identifier])?
            }
            Keyword::Pc => {
                self.operand_node(NodeKind::Pc, &[Operand::Literal, Operand::Identifier])?
            }
            Keyword::Allocate => self.operand_node(
                NodeKind::Allocate,
                &[Operand::Identifier, Operand::Literal],
            )?,
            Keyword::Mode => self.operand_node(NodeKind::Mode, &[Operand::Literal])?,
            Keyword::Set => self.set()?,
            Keyword::BuiltIn => self.leaf(NodeKind::BuiltIn)?,
            _ => return Ok(None),
        };
        Ok(Some(id))
    }

    fn leaf(&mut self, kind: NodeKind) -> Result<NodeId, ParseError> {
        let token = self.advance()?;
        Ok(self.add(Node::with_token(kind, token)))
    }

    /// `kw operand`, the keyword token is discarded.
    fn operand_node(&mut self, kind: NodeKind, allowed: &[Operand]) -> Result<NodeId, ParseError> {
        self.advance()?;
        let token = self.expect_operand(allowed)?;
        Ok(self.add(Node::with_token(kind, token)))
    }

    fn jump(&mut self, kind: NodeKind) -> Result<NodeId, ParseError> {
        self.operand_node(
            kind,
            &[Operand::Literal, Operand::Str, Operand::Identifier],
        )
    }

    /// constant|variable|location name (literal|string) [hidden]
    fn binding(&mut self, kind: NodeKind) -> Result<NodeId, ParseError> {
        self.advance()?;
        let name = self.expect_operand(&[Operand::Identifier])?;
        let value = self.expect_operand(&[Operand::Literal, Operand::Str])?;
        let mut node = Node::with_token(kind, name);
        node.value = Some(value);
        if self.accept(Keyword::Hidden)?.is_some() || kind == NodeKind::Location {
            node.flags.insert(DefinitionFlags::HIDDEN);
        }
        Ok(self.add(node))
    }

    fn if_then(&mut self) -> Result<NodeId, ParseError> {
        let line = self.advance()?.line;
        let mut node = Node::new(NodeKind::If, line);
        node.children.push(self.statements()?);
        if self.accept(Keyword::Else)?.is_some() {
            node.children.push(self.statements()?);
        }
        self.expect(Keyword::Then)?;
        Ok(self.add(node))
    }

    fn begin(&mut self) -> Result<NodeId, ParseError> {
        let line = self.advance()?.line;
        let mut node = Node::new(NodeKind::BeginUntil, line);
        node.children.push(self.statements()?);
        if self.accept(Keyword::Again)?.is_some() {
            node.kind = NodeKind::BeginAgain;
        } else if self.accept(Keyword::While)?.is_some() {
            node.kind = NodeKind::BeginWhileRepeat;
            node.children.push(self.statements()?);
            self.expect(Keyword::Repeat)?;
        } else {
            self.expect(Keyword::Until)?;
        }
        Ok(self.add(node))
    }

    fn for_next(&mut self) -> Result<NodeId, ParseError> {
        let line = self.advance()?.line;
        let mut node = Node::new(NodeKind::ForNext, line);
        node.children.push(self.statements()?);
        if self.accept(Keyword::Aft)?.is_some() {
            node.kind = NodeKind::ForAftThenNext;
            node.children.push(self.statements()?);
            self.expect(Keyword::Then)?;
            node.children.push(self.statements()?);
        }
        self.expect(Keyword::Next)?;
        Ok(self.add(node))
    }

    /// : name statements ; { immediate | hidden | inline }
    fn definition(&mut self) -> Result<NodeId, ParseError> {
        self.advance()?;
        let name = self.expect_operand(&[Operand::Identifier, Operand::Str])?;
        let mut node = Node::with_token(NodeKind::Definition, name);
        node.children.push(self.statements()?);
        self.expect(Keyword::EndDefine)?;

        loop {
            let (flag, modifier) = if let Some(t) = self.accept(Keyword::Immediate)? {
                ((DefinitionFlags::IMMEDIATE, "immediate"), t)
            } else if let Some(t) = self.accept(Keyword::Hidden)? {
                ((DefinitionFlags::HIDDEN, "hidden"), t)
            } else if let Some(t) = self.accept(Keyword::Inline)? {
                ((DefinitionFlags::INLINE, "inline"), t)
            } else {
                break;
            };
            if node.flags.contains(flag.0) {
                return Err(ParseError::DuplicateModifier {
                    line: modifier.line,
                    modifier: flag.1,
                });
            }
            node.flags.insert(flag.0);
        }

        Ok(self.add(node))
    }

    fn char_literal(&mut self) -> Result<NodeId, ParseError> {
        self.advance()?;
        let token = self.expect_operand(&[Operand::Identifier])?;
        if let TokenKind::Identifier(id) = &token.kind {
            if id.chars().count() > 1 {
                return Err(ParseError::NotSingleCharacter {
                    line: token.line,
                    found: id.clone(),
                });
            }
        }
        Ok(self.add(Node::with_token(NodeKind::Char, token)))
    }

    /// .set (identifier|literal) (identifier|string|literal)
    fn set(&mut self) -> Result<NodeId, ParseError> {
        self.advance()?;
        let location = self.expect_operand(&[Operand::Identifier, Operand::Literal])?;
        let value = self.expect_operand(&[Operand::Identifier, Operand::Str, Operand::Literal])?;
        let mut node = Node::with_token(NodeKind::Set, location);
        node.value = Some(value);
        Ok(self.add(node))
    }

    // ========================================================================
    // TOKEN STREAM
    // ========================================================================

    fn peek(&mut self) -> Result<&Token, ParseError> {
        let token = match self.lookahead.take() {
            Some(token) => token,
            None => self.lexer.next_token()?,
        };
        let token: &Token = self.lookahead.insert(token);
        Ok(token)
    }

    fn advance(&mut self) -> Result<Token, ParseError> {
        match self.lookahead.take() {
            Some(token) => Ok(token),
            None => Ok(self.lexer.next_token()?),
        }
    }

    fn accept(&mut self, keyword: Keyword) -> Result<Option<Token>, ParseError> {
        if self.peek()?.is_keyword(keyword) {
            self.advance().map(Some)
        } else {
            Ok(None)
        }
    }

    fn expect(&mut self, keyword: Keyword) -> Result<Token, ParseError> {
        match self.accept(keyword)? {
            Some(token) => Ok(token),
            None => Err(self.unexpected(format!("'{}'", keyword.name()))?),
        }
    }

    fn expect_operand(&mut self, allowed: &[Operand]) -> Result<Token, ParseError> {
        let kind = &self.peek()?.kind;
        if allowed.iter().any(|a| a.matches(kind)) {
            return self.advance();
        }
        let expected: Vec<&str> = allowed
            .iter()
            .map(|a| match a {
                Operand::Literal => "literal",
                Operand::Identifier => "identifier",
                Operand::Str => "string",
            })
            .collect();
        Err(self.unexpected(expected.join(" or "))?)
    }

    fn expect_eoi(&mut self) -> Result<(), ParseError> {
        if self.peek()?.kind == TokenKind::Eoi {
            return Ok(());
        }
        Err(self.unexpected("end of input".to_string())?)
    }

    fn unexpected(&mut self, expected: String) -> Result<ParseError, ParseError> {
        let token = self.peek()?;
        Ok(ParseError::UnexpectedToken {
            line: token.line,
            expected,
            found: token.kind.clone(),
        })
    }
}

/// Lex and parse `source` in one step.
pub fn parse(source: &str) -> Result<Tree, ParseError> {
    Parser::new(Lexer::new(source)).parse()
}

// ============================================================================
// TESTS
// ============================================================================
