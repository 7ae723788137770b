// bytecode.rs - H2 instruction encoding shared by the assembler and the machine

use std::fmt;

/// One 16-bit machine word.
pub type Cell = u16;

// ============================================================================
// INSTRUCTION CLASSES
// ============================================================================

pub const OP_BRANCH: Cell = 0x0000;
pub const OP_0BRANCH: Cell = 0x2000;
pub const OP_CALL: Cell = 0x4000;
pub const OP_ALU: Cell = 0x6000;
pub const OP_LITERAL: Cell = 0x8000;

pub const LITERAL_MASK: Cell = 0x7FFF;
pub const ADDRESS_MASK: Cell = 0x1FFF;

/// Branch and call targets are 13 bits wide, so code must live below this.
pub const MAX_PROGRAM: Cell = 0x2000;

// ALU control bits
pub const T_TO_N: Cell = 0x0080;
pub const T_TO_R: Cell = 0x0040;
pub const N_TO_T: Cell = 0x0020;
pub const R_TO_PC: Cell = 0x0010;

const ALU_OP_SHIFT: u32 = 8;
const RSTACK_SHIFT: u32 = 2;
const DSTACK_SHIFT: u32 = 0;

// 2-bit stack delta field encodings
pub const DELTA_0: Cell = 0;
pub const DELTA_1: Cell = 1;
pub const DELTA_N2: Cell = 2;
pub const DELTA_N1: Cell = 3;

pub const fn code(op: AluOp) -> Cell {
    (op as Cell) << ALU_OP_SHIFT
}

pub const fn dstack(delta: Cell) -> Cell {
    (delta & 3) << DSTACK_SHIFT
}

pub const fn rstack(delta: Cell) -> Cell {
    (delta & 3) << RSTACK_SHIFT
}

/// Decode a 2-bit delta field into a signed step.
pub const fn delta(field: Cell) -> i16 {
    match field & 3 {
        0 => 0,
        1 => 1,
        2 => -2,
        _ => -1,
    }
}

// ============================================================================
// ALU OPERATIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AluOp {
    T = 0,
    N = 1,
    R = 2,
    Load = 3,
    Store = 4,
    UmPlus = 5,
    UmStar = 6,
    And = 7,
    Or = 8,
    Xor = 9,
    Invert = 10,
    Decrement = 11,
    EqualZero = 12,
    Equal = 13,
    ULess = 14,
    Less = 15,
    RShift = 16,
    LShift = 17,
    SpFetch = 18,
    RpFetch = 19,
    SpStore = 20,
    RpStore = 21,
    Save = 22,
    Tx = 23,
    Rx = 24,
    UmSlashMod = 25,
    SlashMod = 26,
    Bye = 27,
    Callback = 28,
    Options = 29,
}

impl AluOp {
    pub fn from_code(code: Cell) -> Option<AluOp> {
        use AluOp::*;
        let op = match code & 0x1F {
            0 => T,
            1 => N,
            2 => R,
            3 => Load,
            4 => Store,
            5 => UmPlus,
            6 => UmStar,
            7 => And,
            8 => Or,
            9 => Xor,
            10 => Invert,
            11 => Decrement,
            12 => EqualZero,
            13 => Equal,
            14 => ULess,
            15 => Less,
            16 => RShift,
            17 => LShift,
            18 => SpFetch,
            19 => RpFetch,
            20 => SpStore,
            21 => RpStore,
            22 => Save,
            23 => Tx,
            24 => Rx,
            25 => UmSlashMod,
            26 => SlashMod,
            27 => Bye,
            28 => Callback,
            29 => Options,
            _ => return None,
        };
        Some(op)
    }

    pub fn name(self) -> &'static str {
        use AluOp::*;
        match self {
            T => "T",
            N => "N",
            R => "R",
            Load => "[T]",
            Store => "N->[T]",
            UmPlus => "um+",
            UmStar => "um*",
            And => "and",
            Or => "or",
            Xor => "xor",
            Invert => "invert",
            Decrement => "1-",
            EqualZero => "0=",
            Equal => "=",
            ULess => "u<",
            Less => "<",
            RShift => "rshift",
            LShift => "lshift",
            SpFetch => "sp@",
            RpFetch => "rp@",
            SpStore => "sp!",
            RpStore => "rp!",
            Save => "save",
            Tx => "tx",
            Rx => "rx",
            UmSlashMod => "um/mod",
            SlashMod => "/mod",
            Bye => "bye",
            Callback => "callback",
            Options => "options",
        }
    }
}

// ============================================================================
// DECODED INSTRUCTIONS
// ============================================================================

/// The decoded fields of an ALU-class word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alu {
    /// Raw 5-bit opcode; not every value names an `AluOp`.
    pub code: Cell,
    pub t_to_n: bool,
    pub t_to_r: bool,
    pub n_to_t: bool,
    pub r_to_pc: bool,
    pub rdelta: i16,
    pub ddelta: i16,
}

impl Alu {
    pub fn decode(word: Cell) -> Alu {
        Alu {
            code: (word >> ALU_OP_SHIFT) & 0x1F,
            t_to_n: word & T_TO_N != 0,
            t_to_r: word & T_TO_R != 0,
            n_to_t: word & N_TO_T != 0,
            r_to_pc: word & R_TO_PC != 0,
            rdelta: delta(word >> RSTACK_SHIFT),
            ddelta: delta(word >> DSTACK_SHIFT),
        }
    }

    pub fn op(&self) -> Option<AluOp> {
        AluOp::from_code(self.code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Literal(Cell),
    Alu(Alu),
    Call(Cell),
    ZeroBranch(Cell),
    Branch(Cell),
}

impl Instruction {
    /// Every 16-bit value decodes to exactly one class.
    pub fn decode(word: Cell) -> Instruction {
        if is_literal(word) {
            Instruction::Literal(word & LITERAL_MASK)
        } else if is_alu(word) {
            Instruction::Alu(Alu::decode(word))
        } else if is_call(word) {
            Instruction::Call(word & ADDRESS_MASK)
        } else if is_0branch(word) {
            Instruction::ZeroBranch(word & ADDRESS_MASK)
        } else {
            Instruction::Branch(word & ADDRESS_MASK)
        }
    }
}

pub fn is_literal(word: Cell) -> bool {
    word & OP_LITERAL != 0
}

pub fn is_alu(word: Cell) -> bool {
    word & 0xE000 == OP_ALU
}

pub fn is_call(word: Cell) -> bool {
    word & 0xE000 == OP_CALL
}

pub fn is_0branch(word: Cell) -> bool {
    word & 0xE000 == OP_0BRANCH
}

pub fn is_branch(word: Cell) -> bool {
    word & 0xE000 == OP_BRANCH
}

/// Encode a literal push. Values with the top bit set cannot fit in the
/// 15-bit immediate, so they are stored inverted and followed by `invert`.
pub fn encode_literal(value: Cell) -> Vec<Cell> {
    if value & OP_LITERAL != 0 {
        vec![OP_LITERAL | !value, INVERT]
    } else {
        vec![OP_LITERAL | value]
    }
}

// ============================================================================
// MNEMONIC TABLE
// ============================================================================

pub const DUP: Cell = OP_ALU | code(AluOp::T) | T_TO_N | dstack(DELTA_1);
pub const OVER: Cell = OP_ALU | code(AluOp::N) | T_TO_N | dstack(DELTA_1);
pub const INVERT: Cell = OP_ALU | code(AluOp::Invert);
pub const UM_PLUS: Cell = OP_ALU | code(AluOp::UmPlus);
pub const ADD: Cell = OP_ALU | code(AluOp::UmPlus) | N_TO_T | dstack(DELTA_N1);
pub const UM_STAR: Cell = OP_ALU | code(AluOp::UmStar);
pub const MUL: Cell = OP_ALU | code(AluOp::UmStar) | N_TO_T | dstack(DELTA_N1);
pub const SWAP: Cell = OP_ALU | code(AluOp::N) | T_TO_N;
pub const NIP: Cell = OP_ALU | code(AluOp::T) | dstack(DELTA_N1);
pub const DROP: Cell = OP_ALU | code(AluOp::N) | dstack(DELTA_N1);
pub const EXIT: Cell = OP_ALU | code(AluOp::T) | R_TO_PC | rstack(DELTA_N1);
pub const TO_R: Cell = OP_ALU | code(AluOp::N) | T_TO_R | dstack(DELTA_N1) | rstack(DELTA_1);
pub const FROM_R: Cell = OP_ALU | code(AluOp::R) | T_TO_N | dstack(DELTA_1) | rstack(DELTA_N1);
pub const R_FETCH: Cell = OP_ALU | code(AluOp::R) | T_TO_N | dstack(DELTA_1);
pub const LOAD: Cell = OP_ALU | code(AluOp::Load);
pub const STORE: Cell = OP_ALU | code(AluOp::Store) | dstack(DELTA_N1);
pub const RSHIFT: Cell = OP_ALU | code(AluOp::RShift) | dstack(DELTA_N1);
pub const LSHIFT: Cell = OP_ALU | code(AluOp::LShift) | dstack(DELTA_N1);
pub const EQUAL: Cell = OP_ALU | code(AluOp::Equal) | dstack(DELTA_N1);
pub const ULESS: Cell = OP_ALU | code(AluOp::ULess) | dstack(DELTA_N1);
pub const LESS: Cell = OP_ALU | code(AluOp::Less) | dstack(DELTA_N1);
pub const AND: Cell = OP_ALU | code(AluOp::And) | dstack(DELTA_N1);
pub const XOR: Cell = OP_ALU | code(AluOp::Xor) | dstack(DELTA_N1);
pub const OR: Cell = OP_ALU | code(AluOp::Or) | dstack(DELTA_N1);
pub const SP_FETCH: Cell = OP_ALU | code(AluOp::SpFetch) | T_TO_N | dstack(DELTA_1);
pub const SP_STORE: Cell = OP_ALU | code(AluOp::SpStore);
pub const DECREMENT: Cell = OP_ALU | code(AluOp::Decrement);
pub const RP_FETCH: Cell = OP_ALU | code(AluOp::RpFetch) | T_TO_N | dstack(DELTA_1);
pub const RP_STORE: Cell = OP_ALU | code(AluOp::RpStore) | dstack(DELTA_N1);
pub const EQUAL_ZERO: Cell = OP_ALU | code(AluOp::EqualZero);
pub const NOP: Cell = OP_ALU | code(AluOp::T);
pub const BYE: Cell = OP_ALU | code(AluOp::Bye);
pub const RX: Cell = OP_ALU | code(AluOp::Rx) | T_TO_N | dstack(DELTA_1);
pub const TX: Cell = OP_ALU | code(AluOp::Tx) | dstack(DELTA_N1);
pub const SAVE: Cell = OP_ALU | code(AluOp::Save) | dstack(DELTA_N1);
pub const UM_SLASH_MOD: Cell = OP_ALU | code(AluOp::UmSlashMod) | T_TO_N;
pub const SLASH_MOD: Cell = OP_ALU | code(AluOp::SlashMod) | T_TO_N;
pub const CALLBACK: Cell = OP_ALU | code(AluOp::Callback);
pub const OPTIONS: Cell = OP_ALU | code(AluOp::Options);
pub const RUP: Cell = OP_ALU | code(AluOp::T) | rstack(DELTA_1);
pub const RDROP: Cell = OP_ALU | code(AluOp::T) | rstack(DELTA_N1);

/// A named instruction. `inline` marks the entries that `.built-in` turns
/// into dictionary words the target Forth may copy inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mnemonic {
    pub name: &'static str,
    pub bits: Cell,
    pub inline: bool,
}

const fn m(name: &'static str, bits: Cell, inline: bool) -> Mnemonic {
    Mnemonic { name, bits, inline }
}

pub static MNEMONICS: &[Mnemonic] = &[
    m("dup", DUP, true),
    m("over", OVER, true),
    m("invert", INVERT, true),
    m("um+", UM_PLUS, true),
    m("+", ADD, true),
    m("um*", UM_STAR, true),
    m("*", MUL, true),
    m("swap", SWAP, true),
    m("nip", NIP, true),
    m("drop", DROP, true),
    m("exit", EXIT, true),
    m(">r", TO_R, true),
    m("r>", FROM_R, true),
    m("r@", R_FETCH, true),
    m("@", LOAD, true),
    m("!", STORE, false),
    m("rshift", RSHIFT, true),
    m("lshift", LSHIFT, true),
    m("=", EQUAL, true),
    m("u<", ULESS, true),
    m("<", LESS, true),
    m("and", AND, true),
    m("xor", XOR, true),
    m("or", OR, true),
    m("sp@", SP_FETCH, true),
    m("sp!", SP_STORE, false),
    m("1-", DECREMENT, true),
    m("rp@", RP_FETCH, true),
    m("rp!", RP_STORE, false),
    m("0=", EQUAL_ZERO, true),
    m("nop", NOP, false),
    m("bye", BYE, true),
    m("rx?", RX, true),
    m("tx!", TX, true),
    m("save", SAVE, true),
    m("um/mod", UM_SLASH_MOD, true),
    m("/mod", SLASH_MOD, true),
    m("callback", CALLBACK, false),
    m("options", OPTIONS, false),
    m("rup", RUP, false),
    m("rdrop", RDROP, true),
];

pub fn mnemonic(name: &str) -> Option<&'static Mnemonic> {
    MNEMONICS.iter().find(|m| m.name == name)
}

/// Reverse lookup by exact bit pattern.
pub fn mnemonic_for(bits: Cell) -> Option<&'static Mnemonic> {
    MNEMONICS.iter().find(|m| m.bits == bits)
}

// ============================================================================
// DISASSEMBLY
// ============================================================================

pub struct Disassembly(pub Cell);

impl fmt::Display for Disassembly {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match Instruction::decode(self.0) {
            Instruction::Literal(v) => write!(f, "${:x}", v),
            Instruction::Call(a) => write!(f, "call ${:x}", a),
            Instruction::ZeroBranch(a) => write!(f, "0branch ${:x}", a),
            Instruction::Branch(a) => write!(f, "branch ${:x}", a),
            Instruction::Alu(alu) => {
                if let Some(m) = mnemonic_for(self.0) {
                    return write!(f, "{}", m.name);
                }
                match alu.op() {
                    Some(op) => write!(f, "alu:{}", op.name())?,
                    None => write!(f, "alu:?{}", alu.code)?,
                }
                if alu.t_to_n {
                    write!(f, " T->N")?;
                }
                if alu.t_to_r {
                    write!(f, " T->R")?;
                }
                if alu.n_to_t {
                    write!(f, " N->T")?;
                }
                if alu.r_to_pc {
                    write!(f, " R->PC")?;
                }
                if alu.ddelta != 0 {
                    write!(f, " d{:+}", alu.ddelta)?;
                }
                if alu.rdelta != 0 {
                    write!(f, " r{:+}", alu.rdelta)?;
                }
                Ok(())
            }
        }
    }
}

pub fn disassemble(word: Cell) -> String {
    Disassembly(word).to_string()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_decoding_is_total() {
        for word in 0..=u16::MAX {
            let classes = [
                is_literal(word),
                is_alu(word),
                is_call(word),
                is_0branch(word),
                is_branch(word),
            ];
            assert_eq!(classes.iter().filter(|c| **c).count(), 1, "word {:04x}", word);
        }
    }

    #[test]
    fn test_delta_table() {
        assert_eq!(delta(DELTA_0), 0);
        assert_eq!(delta(DELTA_1), 1);
        assert_eq!(delta(DELTA_N2), -2);
        assert_eq!(delta(DELTA_N1), -1);
    }

    #[test]
    fn test_known_encodings() {
        assert_eq!(DUP, 0x6081);
        assert_eq!(EXIT, 0x601C);
        assert_eq!(ADD, 0x6523);
        assert_eq!(TO_R, 0x6147);
        assert_eq!(FROM_R, 0x628D);
    }

    #[test]
    fn test_literal_inversion() {
        assert_eq!(encode_literal(5), vec![0x8005]);
        assert_eq!(encode_literal(0x7FFF), vec![0xFFFF]);
        assert_eq!(encode_literal(0xFFFF), vec![0x8000, INVERT]);
        assert_eq!(encode_literal(0x8000), vec![0xFFFF, INVERT]);
    }

    #[test]
    fn test_mnemonic_names_unique() {
        for (i, a) in MNEMONICS.iter().enumerate() {
            for b in &MNEMONICS[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }

    #[test]
    fn test_disassemble() {
        assert_eq!(disassemble(0x8005), "$5");
        assert_eq!(disassemble(OP_CALL | 0x20), "call $20");
        assert_eq!(disassemble(OP_0BRANCH | 0x21), "0branch $21");
        assert_eq!(disassemble(0x0022), "branch $22");
        assert_eq!(disassemble(DUP), "dup");
        assert_eq!(disassemble(DUP | EXIT), "alu:T T->N R->PC d+1 r-1");
        assert_eq!(disassemble(OP_ALU | 0x1F00), "alu:?31");
    }
}
