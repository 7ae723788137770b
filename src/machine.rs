// machine.rs - H2 virtual machine: decode loop, host hooks and stack access

use crate::bytecode::{disassemble, AluOp, Cell, Instruction};
use crate::image::{
    self, ImageError, CELLS_CELL, CORE_CELLS, PC_CELL, RP_CELL, SHADOW_CELL, SP_CELL, THROW_CELL,
    TOS_CELL,
};
use crate::logging::LogContext;
use std::io::{self, Read, Write};
use std::path::Path;
use thiserror::Error;

// Guest-level fault codes left in T when execution is redirected to the
// throw vector.
pub const FAULT_DIVISION_BY_ZERO: Cell = 10;
pub const FAULT_UNSUPPORTED: Cell = 21;
pub const FAULT_IO: Cell = 57;

/// Value `rx` produces once the input is exhausted.
pub const END_OF_INPUT: Cell = 0xFFFF;

// ============================================================================
// RESULT AND ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// `bye` executed; carries T.
    Halted(i16),
    /// The yield predicate asked the loop to stop; `run` resumes from here.
    Yielded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MachineError {
    #[error("bounds fault: pc={pc:#06x} sp={sp:#06x} rp={rp:#06x} exceed {limit:#06x} cells")]
    Bounds {
        pc: Cell,
        sp: Cell,
        rp: Cell,
        limit: usize,
    },
}

impl MachineError {
    pub fn code(&self) -> i16 {
        match self {
            MachineError::Bounds { .. } => -9,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StackError {
    #[error("data stack underflow")]
    Underflow,
    #[error("data stack overflow")]
    Overflow,
}

impl StackError {
    pub fn code(&self) -> i16 {
        match self {
            StackError::Underflow => -4,
            StackError::Overflow => -3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    pub pc: Cell,
    pub tos: Cell,
    pub rp: Cell,
    pub sp: Cell,
}

// ============================================================================
// OPTIONS
// ============================================================================

/// Mode register swapped by the `options` instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmMode(Cell);

impl VmMode {
    /// Log every executed instruction at trace level.
    pub const TRACE: VmMode = VmMode(1);
    /// Set while evaluating host-supplied strings; guests may check it to
    /// suppress prompts.
    pub const QUIET: VmMode = VmMode(2);

    pub fn from_bits(bits: Cell) -> Self {
        VmMode(bits)
    }

    pub fn bits(self) -> Cell {
        self.0
    }

    pub fn contains(self, other: VmMode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for VmMode {
    type Output = VmMode;

    fn bitor(self, rhs: VmMode) -> VmMode {
        VmMode(self.0 | rhs.0)
    }
}

/// Memory access strategy. Every load, store, stack access and
/// instruction fetch made by the decode loop goes through it.
pub trait Mmu {
    fn read(&mut self, core: &[Cell], addr: Cell, mode: VmMode) -> Cell;
    fn write(&mut self, core: &mut [Cell], addr: Cell, value: Cell, mode: VmMode);
}

/// Plain array access. Out-of-range reads give 0 and writes are dropped;
/// the bounds check catches the runaway pointer on the next step.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectMmu;

impl Mmu for DirectMmu {
    fn read(&mut self, core: &[Cell], addr: Cell, _mode: VmMode) -> Cell {
        core.get(usize::from(addr)).copied().unwrap_or(0)
    }

    fn write(&mut self, core: &mut [Cell], addr: Cell, value: Cell, _mode: VmMode) {
        if let Some(cell) = core.get_mut(usize::from(addr)) {
            *cell = value;
        }
    }
}

pub type SaveHook<'a> = Box<dyn FnMut(&[Cell]) -> io::Result<()> + 'a>;
pub type Callback<'a> = Box<dyn FnMut(&mut Machine) -> i16 + 'a>;
pub type YieldPredicate<'a> = Box<dyn FnMut() -> bool + 'a>;

/// Host side of a run: character I/O, optional hooks and the MMU.
pub struct Options<'a> {
    input: Box<dyn Read + 'a>,
    output: Box<dyn Write + 'a>,
    save: Option<SaveHook<'a>>,
    callback: Option<Callback<'a>>,
    should_yield: Option<YieldPredicate<'a>>,
    mmu: Box<dyn Mmu + 'a>,
    mode: VmMode,
    log: LogContext,
}

impl Default for Options<'static> {
    fn default() -> Self {
        Options::new(io::empty(), io::sink())
    }
}

impl<'a> Options<'a> {
    pub fn new(input: impl Read + 'a, output: impl Write + 'a) -> Self {
        Options {
            input: Box::new(input),
            output: Box::new(output),
            save: None,
            callback: None,
            should_yield: None,
            mmu: Box::new(DirectMmu),
            mode: VmMode::default(),
            log: LogContext::default(),
        }
    }

    pub fn stdio() -> Options<'static> {
        Options::new(io::stdin(), io::stdout())
    }

    pub fn with_save(mut self, hook: impl FnMut(&[Cell]) -> io::Result<()> + 'a) -> Self {
        self.save = Some(Box::new(hook));
        self
    }

    pub fn with_callback(mut self, callback: impl FnMut(&mut Machine) -> i16 + 'a) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn with_yield(mut self, predicate: impl FnMut() -> bool + 'a) -> Self {
        self.should_yield = Some(Box::new(predicate));
        self
    }

    pub fn with_mmu(mut self, mmu: impl Mmu + 'a) -> Self {
        self.mmu = Box::new(mmu);
        self
    }

    pub fn with_mode(mut self, mode: VmMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_log(mut self, log: LogContext) -> Self {
        self.log = log;
        self
    }

    /// Current mode register, including changes made by the guest.
    pub fn mode(&self) -> VmMode {
        self.mode
    }
}

// ============================================================================
// MACHINE
// ============================================================================

/// Cloning copies the whole core, registers included.
#[derive(Clone)]
pub struct Machine {
    core: Vec<Cell>,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    /// Zeroed core. It faults immediately until an image is loaded, since
    /// its cell count is zero.
    pub fn new() -> Self {
        Machine {
            core: vec![0; CORE_CELLS],
        }
    }

    pub fn from_image(bytes: &[u8]) -> Result<Self, ImageError> {
        let mut machine = Machine::new();
        machine.load(bytes)?;
        Ok(machine)
    }

    pub fn from_cells(cells: &[Cell]) -> Result<Self, ImageError> {
        let mut machine = Machine::new();
        machine.load_cells(cells)?;
        Ok(machine)
    }

    pub fn load(&mut self, bytes: &[u8]) -> Result<(), ImageError> {
        let cells = image::cells_from_bytes(bytes)?;
        self.load_cells(&cells)
    }

    pub fn load_cells(&mut self, cells: &[Cell]) -> Result<(), ImageError> {
        if cells.len() > CORE_CELLS {
            return Err(ImageError::TooLarge(cells.len() * 2));
        }
        self.core.fill(0);
        self.core[..cells.len()].copy_from_slice(cells);
        Ok(())
    }

    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<(), ImageError> {
        let cells = image::read_file(path)?;
        self.load_cells(&cells)
    }

    /// The live image: as many cells as the image declares.
    pub fn save(&self) -> Vec<u8> {
        image::cells_to_bytes(&self.core[..self.cell_count()])
    }

    pub fn save_file(&self, path: impl AsRef<Path>) -> Result<(), ImageError> {
        image::write_file(path, &self.core[..self.cell_count()])
    }

    pub fn core(&self) -> &[Cell] {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut [Cell] {
        &mut self.core
    }

    fn cell_count(&self) -> usize {
        usize::from(self.core[CELLS_CELL]).min(CORE_CELLS)
    }

    pub fn registers(&self) -> Registers {
        Registers {
            pc: self.core[PC_CELL],
            tos: self.core[TOS_CELL],
            rp: self.core[RP_CELL],
            sp: self.core[SP_CELL],
        }
    }

    fn store_registers(&mut self, regs: Registers) {
        self.core[PC_CELL] = regs.pc;
        self.core[TOS_CELL] = regs.tos;
        self.core[RP_CELL] = regs.rp;
        self.core[SP_CELL] = regs.sp;
    }

    /// Restore the registers from the shadow block.
    pub fn reset(&mut self) {
        self.core
            .copy_within(SHADOW_CELL..SHADOW_CELL + 4, PC_CELL);
    }

    /// Items on the data stack, counting the cached top.
    pub fn depth(&self) -> usize {
        let sp0 = self.core[SHADOW_CELL + SP_CELL];
        usize::from(self.core[SP_CELL].saturating_sub(sp0))
    }

    pub fn push(&mut self, value: Cell) -> Result<(), StackError> {
        let Registers { tos, rp, sp, .. } = self.registers();
        let sp0 = self.core[SHADOW_CELL + SP_CELL];
        if sp < 32 || sp < sp0 {
            return Err(StackError::Underflow);
        }
        if usize::from(sp) > CORE_CELLS - 2 || sp + 1 >= rp {
            return Err(StackError::Overflow);
        }
        let sp = sp + 1;
        self.core[usize::from(sp)] = tos;
        self.core[TOS_CELL] = value;
        self.core[SP_CELL] = sp;
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Cell, StackError> {
        let Registers { tos, rp, sp, .. } = self.registers();
        let sp0 = self.core[SHADOW_CELL + SP_CELL];
        if sp < 32 || sp <= sp0 {
            return Err(StackError::Underflow);
        }
        if usize::from(sp) > CORE_CELLS - 1 || sp > rp {
            return Err(StackError::Overflow);
        }
        self.core[TOS_CELL] = self.core[usize::from(sp)];
        self.core[SP_CELL] = sp - 1;
        Ok(tos)
    }

    /// Run with `input` as the character source, then restore the default
    /// registers so the next evaluation starts fresh.
    pub fn eval(&mut self, input: &str, output: &mut dyn Write) -> Result<Exit, MachineError> {
        let mut options = Options::new(input.as_bytes(), output).with_mode(VmMode::QUIET);
        let result = self.run(&mut options);
        self.reset();
        result
    }

    /// The decode loop. Registers are loaded from and written back to the
    /// header cells, so a yielded run can be resumed by calling `run` again.
    pub fn run(&mut self, options: &mut Options) -> Result<Exit, MachineError> {
        let Registers {
            mut pc,
            tos: mut t,
            mut rp,
            mut sp,
        } = self.registers();
        let limit = self.cell_count();

        let result = 'decode: loop {
            if let Some(should_yield) = options.should_yield.as_mut() {
                if should_yield() {
                    break Ok(Exit::Yielded);
                }
            }

            if usize::from(pc) >= limit || usize::from(sp) >= limit || usize::from(rp) >= limit {
                break Err(MachineError::Bounds { pc, sp, rp, limit });
            }

            let mode = options.mode;
            let instruction = options.mmu.read(&self.core, pc, mode);
            if mode.contains(VmMode::TRACE) {
                options.log.trace(format_args!(
                    "[ {:4x} {:04x} {:4x} {:2x} {:2x} : {} ]",
                    pc,
                    instruction,
                    t,
                    self.core[SHADOW_CELL + RP_CELL].wrapping_sub(rp),
                    sp.wrapping_sub(self.core[SHADOW_CELL + SP_CELL]),
                    disassemble(instruction)
                ));
            }
            pc = pc.wrapping_add(1);

            match Instruction::decode(instruction) {
                Instruction::Literal(value) => {
                    sp = sp.wrapping_add(1);
                    options.mmu.write(&mut self.core, sp, t, mode);
                    t = value;
                }
                Instruction::Branch(target) => pc = target,
                Instruction::ZeroBranch(target) => {
                    if t == 0 {
                        pc = target;
                    }
                    t = options.mmu.read(&self.core, sp, mode);
                    sp = sp.wrapping_sub(1);
                }
                Instruction::Call(target) => {
                    rp = rp.wrapping_sub(1);
                    options.mmu.write(&mut self.core, rp, pc << 1, mode);
                    pc = target;
                }
                Instruction::Alu(alu) => {
                    let mut n = options.mmu.read(&self.core, sp, mode);
                    let mut next = t;
                    if alu.r_to_pc {
                        pc = options.mmu.read(&self.core, rp, mode) >> 1;
                    }

                    match alu.op() {
                        Some(AluOp::T) => next = t,
                        Some(AluOp::N) => next = n,
                        Some(AluOp::R) => next = options.mmu.read(&self.core, rp, mode),
                        Some(AluOp::Load) => {
                            let addr = ((usize::from(t) >> 1) % limit) as Cell;
                            next = options.mmu.read(&self.core, addr, mode);
                        }
                        Some(AluOp::Store) => {
                            let addr = ((usize::from(t) >> 1) % limit) as Cell;
                            options.mmu.write(&mut self.core, addr, n, mode);
                            sp = sp.wrapping_sub(1);
                            next = options.mmu.read(&self.core, sp, mode);
                        }
                        Some(AluOp::UmPlus) => {
                            let d = u32::from(t) + u32::from(n);
                            next = (d >> 16) as Cell;
                            n = d as Cell;
                            options.mmu.write(&mut self.core, sp, n, mode);
                        }
                        Some(AluOp::UmStar) => {
                            let d = u32::from(t) * u32::from(n);
                            next = (d >> 16) as Cell;
                            n = d as Cell;
                            options.mmu.write(&mut self.core, sp, n, mode);
                        }
                        Some(AluOp::And) => next = t & n,
                        Some(AluOp::Or) => next = t | n,
                        Some(AluOp::Xor) => next = t ^ n,
                        Some(AluOp::Invert) => next = !t,
                        Some(AluOp::Decrement) => next = t.wrapping_sub(1),
                        Some(AluOp::EqualZero) => next = flag(t == 0),
                        Some(AluOp::Equal) => next = flag(t == n),
                        Some(AluOp::ULess) => next = flag(n < t),
                        Some(AluOp::Less) => next = flag((n as i16) < (t as i16)),
                        Some(AluOp::RShift) => next = n.checked_shr(u32::from(t)).unwrap_or(0),
                        Some(AluOp::LShift) => next = n.checked_shl(u32::from(t)).unwrap_or(0),
                        Some(AluOp::SpFetch) => next = sp << 1,
                        Some(AluOp::RpFetch) => next = rp << 1,
                        Some(AluOp::SpStore) => sp = t >> 1,
                        Some(AluOp::RpStore) => {
                            rp = t >> 1;
                            next = n;
                        }
                        Some(AluOp::Save) => match options.save.as_mut() {
                            Some(save) => {
                                let start = usize::from(n >> 1).min(CORE_CELLS);
                                let end = ((usize::from(t) + 1) >> 1).clamp(start, CORE_CELLS);
                                next = match save(&self.core[start..end]) {
                                    Ok(()) => 0,
                                    Err(e) => {
                                        options.log.warn(format_args!("save failed: {}", e));
                                        0xFFFF
                                    }
                                };
                            }
                            None => fault(FAULT_UNSUPPORTED, &mut pc, &mut next),
                        },
                        Some(AluOp::Tx) => {
                            let written = options
                                .output
                                .write_all(&[t as u8])
                                .and_then(|_| options.output.flush());
                            match written {
                                Ok(()) => next = n,
                                Err(_) => fault(FAULT_IO, &mut pc, &mut next),
                            }
                        }
                        Some(AluOp::Rx) => {
                            let mut byte = [0u8; 1];
                            next = match options.input.read(&mut byte) {
                                Ok(1) => Cell::from(byte[0]),
                                _ => END_OF_INPUT,
                            };
                        }
                        Some(AluOp::UmSlashMod) => {
                            if t != 0 {
                                sp = sp.wrapping_sub(1);
                                let low = options.mmu.read(&self.core, sp, mode);
                                let d = u32::from(low) | (u32::from(n) << 16);
                                let divisor = u32::from(t);
                                next = (d / divisor) as Cell;
                                t = (d % divisor) as Cell;
                                n = t;
                            } else {
                                fault(FAULT_DIVISION_BY_ZERO, &mut pc, &mut next);
                            }
                        }
                        Some(AluOp::SlashMod) => {
                            if t != 0 {
                                let (dividend, divisor) = (n as i16, t as i16);
                                next = dividend.wrapping_div(divisor) as Cell;
                                t = dividend.wrapping_rem(divisor) as Cell;
                                n = t;
                            } else {
                                fault(FAULT_DIVISION_BY_ZERO, &mut pc, &mut next);
                            }
                        }
                        Some(AluOp::Bye) => break 'decode Ok(Exit::Halted(t as i16)),
                        Some(AluOp::Callback) => match options.callback.as_mut() {
                            Some(callback) => {
                                self.store_registers(Registers { pc, tos: t, rp, sp });
                                let status = callback(self);
                                let regs = self.registers();
                                pc = regs.pc;
                                next = regs.tos;
                                rp = regs.rp;
                                sp = regs.sp;
                                if status != 0 {
                                    fault(status as Cell, &mut pc, &mut next);
                                }
                            }
                            None => fault(FAULT_UNSUPPORTED, &mut pc, &mut next),
                        },
                        Some(AluOp::Options) => {
                            next = options.mode.bits();
                            options.mode = VmMode::from_bits(t);
                        }
                        None => fault(FAULT_UNSUPPORTED, &mut pc, &mut next),
                    }

                    sp = sp.wrapping_add_signed(alu.ddelta);
                    rp = rp.wrapping_add_signed(-alu.rdelta);
                    if alu.t_to_n {
                        options.mmu.write(&mut self.core, sp, t, mode);
                    }
                    if alu.t_to_r {
                        options.mmu.write(&mut self.core, rp, t, mode);
                    }
                    t = if alu.n_to_t { n } else { next };
                }
            }
        };

        self.store_registers(Registers { pc, tos: t, rp, sp });
        result
    }
}

/// Redirect to the throw vector with `code` as the new top of stack.
fn fault(code: Cell, pc: &mut Cell, next: &mut Cell) {
    *pc = THROW_CELL as Cell;
    *next = code;
}

fn flag(condition: bool) -> Cell {
    if condition {
        0xFFFF
    } else {
        0
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::*;
    use crate::image::{default_header, ORIGIN, SP0};

    /// A machine with the default header and `code` at the origin.
    fn machine_with(code: &[Cell]) -> Machine {
        let mut cells = default_header().to_vec();
        cells.extend_from_slice(code);
        Machine::from_cells(&cells).unwrap()
    }

    fn run(machine: &mut Machine) -> Exit {
        machine.run(&mut Options::default()).unwrap()
    }

    #[test]
    fn test_literal_and_add() {
        let mut m = machine_with(&[OP_LITERAL | 2, OP_LITERAL | 3, ADD, BYE]);
        assert_eq!(run(&mut m), Exit::Halted(5));
        assert_eq!(m.depth(), 1);
        assert_eq!(m.pop().unwrap(), 5);
    }

    #[test]
    fn test_um_plus_carry() {
        let mut m = machine_with(&[
            OP_LITERAL | 0x7FFF,
            INVERT, // 0x8000
            DUP,
            UM_PLUS,
            BYE,
        ]);
        run(&mut m);
        assert_eq!(m.pop().unwrap(), 1); // carry
        assert_eq!(m.pop().unwrap(), 0); // low half
    }

    #[test]
    fn test_comparisons_are_all_ones() {
        let mut m = machine_with(&[OP_LITERAL | 1, OP_LITERAL | 2, ULESS, BYE]);
        run(&mut m);
        assert_eq!(m.pop().unwrap(), 0xFFFF);
    }

    #[test]
    fn test_call_and_exit() {
        // origin: call sub; bye; sub: 7 exit
        let sub = ORIGIN + 2;
        let mut m = machine_with(&[OP_CALL | sub, BYE, OP_LITERAL | 7, EXIT]);
        assert_eq!(run(&mut m), Exit::Halted(7));
    }

    #[test]
    fn test_zero_branch_pops() {
        let target = ORIGIN + 4;
        let mut m = machine_with(&[
            OP_LITERAL | 9,
            OP_LITERAL,
            OP_0BRANCH | target,
            OP_LITERAL | 1,
            BYE,
        ]);
        assert_eq!(run(&mut m), Exit::Halted(9));
        assert_eq!(m.depth(), 1);
    }

    #[test]
    fn test_store_and_load() {
        let addr = 0x100 << 1;
        let mut m = machine_with(&[
            OP_LITERAL | 42,
            OP_LITERAL | addr,
            STORE,
            OP_LITERAL | addr,
            LOAD,
            BYE,
        ]);
        assert_eq!(run(&mut m), Exit::Halted(42));
        assert_eq!(m.core()[0x100], 42);
        assert_eq!(m.depth(), 1);
    }

    #[test]
    fn test_division_by_zero_faults_to_throw_vector() {
        let mut m = machine_with(&[OP_LITERAL | 7, OP_LITERAL, SLASH_MOD, BYE]);
        assert_eq!(
            run(&mut m),
            Exit::Halted(FAULT_DIVISION_BY_ZERO as i16)
        );
    }

    #[test]
    fn test_unassigned_opcode_faults() {
        let mut m = machine_with(&[OP_ALU | 0x1F00, BYE]);
        assert_eq!(run(&mut m), Exit::Halted(FAULT_UNSUPPORTED as i16));
    }

    #[test]
    fn test_bounds_fault() {
        // exit with an empty return stack pops past RP0
        let mut m = machine_with(&[EXIT]);
        let err = m.run(&mut Options::default()).unwrap_err();
        assert!(matches!(err, MachineError::Bounds { .. }));
        assert!(err.code() < 0);
    }

    #[test]
    fn test_push_pop_lifo() {
        let mut m = machine_with(&[]);
        for v in 1..=5 {
            m.push(v).unwrap();
        }
        assert_eq!(m.depth(), 5);
        for v in (1..=5).rev() {
            assert_eq!(m.pop().unwrap(), v);
        }
        assert_eq!(m.pop(), Err(StackError::Underflow));
        assert_eq!(m.registers().sp, SP0);
    }

    #[test]
    fn test_reset_restores_shadow() {
        let mut m = machine_with(&[OP_LITERAL | 1, BYE]);
        run(&mut m);
        assert_ne!(m.registers().pc, ORIGIN);
        m.reset();
        assert_eq!(m.registers().pc, ORIGIN);
        assert_eq!(m.depth(), 0);
    }
}
