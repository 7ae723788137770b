// image.rs - Image layout and little-endian persistence

use crate::bytecode::{Cell, BYE};
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

// ============================================================================
// LAYOUT
// ============================================================================

/// Size of core memory in cells.
pub const CORE_CELLS: usize = 0x8000;

/// First cell available to programs; everything below is the header.
pub const ORIGIN: Cell = 16;

/// Initial data stack pointer; the data stack grows upward from here.
pub const SP0: Cell = 0x2200;

/// Initial return stack pointer; the return stack grows downward from here.
pub const RP0: Cell = 0x7FFF;

pub const PC_CELL: usize = 0;
pub const TOS_CELL: usize = 1;
pub const RP_CELL: usize = 2;
pub const SP_CELL: usize = 3;
/// Instruction executed after a guest-level fault sets `pc = 4`.
pub const THROW_CELL: usize = 4;
/// Number of live cells; the machine faults on any pointer at or past it.
pub const CELLS_CELL: usize = 5;
/// Copies of cells 0..3 restored by `Machine::reset`.
pub const SHADOW_CELL: usize = 7;

/// Header of a fresh image: registers at their defaults, a halting throw
/// vector and the shadow copy of the registers.
pub fn default_header() -> [Cell; ORIGIN as usize] {
    let mut header = [0; ORIGIN as usize];
    header[PC_CELL] = ORIGIN;
    header[TOS_CELL] = 0;
    header[RP_CELL] = RP0;
    header[SP_CELL] = SP0;
    header[THROW_CELL] = BYE;
    header[CELLS_CELL] = CORE_CELLS as Cell;
    header.copy_within(0..4, SHADOW_CELL);
    header
}

// ============================================================================
// ENCODING
// ============================================================================

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image of {0} bytes is smaller than the {} byte header", ORIGIN as usize * 2)]
    TooShort(usize),
    #[error("image of {0} bytes is not a whole number of cells")]
    OddLength(usize),
    #[error("image of {0} bytes does not fit in core")]
    TooLarge(usize),
    #[error("image i/o failed: {0}")]
    Io(#[from] io::Error),
}

impl ImageError {
    /// Status code in the host's classic numbering.
    pub fn code(&self) -> i16 {
        match self {
            ImageError::Io(_) => -37,
            _ => -70,
        }
    }
}

/// Decode little-endian bytes into cells, whatever the host byte order.
pub fn cells_from_bytes(bytes: &[u8]) -> Result<Vec<Cell>, ImageError> {
    if bytes.len() < ORIGIN as usize * 2 {
        return Err(ImageError::TooShort(bytes.len()));
    }
    if bytes.len() % 2 != 0 {
        return Err(ImageError::OddLength(bytes.len()));
    }
    if bytes.len() > CORE_CELLS * 2 {
        return Err(ImageError::TooLarge(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| Cell::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

pub fn cells_to_bytes(cells: &[Cell]) -> Vec<u8> {
    cells.iter().flat_map(|c| c.to_le_bytes()).collect()
}

pub fn read_file(path: impl AsRef<Path>) -> Result<Vec<Cell>, ImageError> {
    let bytes = fs::read(path)?;
    cells_from_bytes(&bytes)
}

pub fn write_file(path: impl AsRef<Path>, cells: &[Cell]) -> Result<(), ImageError> {
    fs::write(path, cells_to_bytes(cells))?;
    Ok(())
}
