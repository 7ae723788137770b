// main.rs - h2vm command line: assembler, runner, disassembler and REPL

use clap::{ArgAction, Parser, Subcommand};
use h2vm::bytecode::{Cell, Disassembly};
use h2vm::compiler::{self, AssembleError, AssemblerConfig, Mode};
use h2vm::image::{self, ImageError, ORIGIN};
use h2vm::logging::LogContext;
use h2vm::machine::{Exit, Machine, MachineError, Options, VmMode};
use h2vm::symbols::{SymbolError, SymbolKind, SymbolTable};
use log::{error, info, LevelFilter, SetLoggerError};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use thiserror::Error;

#[derive(Parser, Debug)]
#[command(name = "h2vm", version)]
#[command(about = "Assembler and virtual machine for the H2 16-bit stack CPU")]
struct Cli {
    /// Log more (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Assemble a source file into an image
    Assemble {
        source: PathBuf,

        #[arg(short, long, default_value = "h2.blk")]
        output: PathBuf,

        /// Also write the symbol table to this file
        #[arg(long)]
        symbols: Option<PathBuf>,

        /// Start with the peephole optimizer on
        #[arg(long)]
        optimize: bool,

        /// Start with dictionary headers on
        #[arg(long)]
        headers: bool,
    },
    /// Execute an image until it halts
    Run {
        image: PathBuf,

        /// Log every executed instruction
        #[arg(long)]
        trace: bool,

        /// Where the guest's `save` instruction writes
        #[arg(long = "save-to")]
        save_to: Option<PathBuf>,
    },
    /// List an image word by word
    Disassemble {
        image: PathBuf,

        /// Symbol file written by `assemble --symbols`
        #[arg(long)]
        symbols: Option<PathBuf>,
    },
    /// Evaluate lines of input against an image
    Repl { image: PathBuf },
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Assemble(#[from] AssembleError),
    #[error("{0}")]
    Image(#[from] ImageError),
    #[error("{0}")]
    Machine(#[from] MachineError),
    #[error("{0}")]
    Symbols(#[from] SymbolError),
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Readline(#[from] ReadlineError),
    #[error("cannot install logger: {0}")]
    Logger(#[from] SetLoggerError),
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    match execute(cli.command, level) {
        Ok(status) => process::exit(status),
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }
}

fn execute(command: Command, level: LevelFilter) -> Result<i32, CliError> {
    // tracing needs the logger open at trace level regardless of -v
    let level = match command {
        Command::Run { trace: true, .. } => LevelFilter::Trace,
        _ => level,
    };
    simple_logger::SimpleLogger::new().with_level(level).init()?;
    let log = LogContext::new(level);

    match command {
        Command::Assemble {
            source,
            output,
            symbols,
            optimize,
            headers,
        } => {
            let mut mode = Mode::default();
            if optimize {
                mode = mode | Mode::OPTIMIZE;
            }
            if headers {
                mode = mode | Mode::HEADERS;
            }
            assemble(&source, &output, symbols.as_deref(), mode, log)?;
            Ok(0)
        }
        Command::Run {
            image,
            trace,
            save_to,
        } => run(&image, trace, save_to, log),
        Command::Disassemble { image, symbols } => {
            disassemble(&image, symbols.as_deref())?;
            Ok(0)
        }
        Command::Repl { image } => {
            repl(&image)?;
            Ok(0)
        }
    }
}

fn assemble(
    source: &Path,
    output: &Path,
    symbols: Option<&Path>,
    mode: Mode,
    log: LogContext,
) -> Result<(), CliError> {
    let text = fs::read_to_string(source)?;
    let config = AssemblerConfig::new().with_mode(mode).with_log(log);
    let program = compiler::assemble(&text, config)?;
    program.write_file(output)?;
    info!(
        "wrote {} cells to {}, entry {:#06x}",
        program.image().len(),
        output.display(),
        program.entry()
    );

    if let Some(path) = symbols {
        let mut file = fs::File::create(path)?;
        program.symbols().dump(&mut file)?;
        info!("wrote {} symbols to {}", program.symbols().len(), path.display());
    }
    Ok(())
}

fn run(path: &Path, trace: bool, save_to: Option<PathBuf>, log: LogContext) -> Result<i32, CliError> {
    let mut machine = Machine::new();
    machine.load_file(path)?;

    let mut options = Options::stdio().with_log(log);
    if trace {
        options = options.with_mode(VmMode::TRACE);
    }
    if let Some(target) = save_to {
        options = options.with_save(move |cells: &[Cell]| {
            fs::write(&target, image::cells_to_bytes(cells))
        });
    }

    match machine.run(&mut options)? {
        Exit::Halted(code) => {
            info!("halted with {}", code);
            Ok(i32::from(code))
        }
        Exit::Yielded => Ok(0),
    }
}

fn disassemble(path: &Path, symbols: Option<&Path>) -> Result<(), CliError> {
    let cells = image::read_file(path)?;
    let table = match symbols {
        Some(path) => SymbolTable::parse_dump(&fs::read_to_string(path)?)?,
        None => SymbolTable::new(),
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for (address, word) in cells.iter().enumerate() {
        let address = address as Cell;
        let names: Vec<&str> = table
            .iter()
            .filter(|s| matches!(s.kind, SymbolKind::Call | SymbolKind::Label))
            .filter(|s| s.value == address)
            .map(|s| s.name.as_str())
            .collect();
        if !names.is_empty() {
            writeln!(out, "{}:", names.join(" "))?;
        }
        if address < ORIGIN {
            writeln!(out, "{:04x}: {:04x}", address, word)?;
        } else {
            writeln!(out, "{:04x}: {:04x}  {}", address, word, Disassembly(*word))?;
        }
    }
    Ok(())
}

fn repl(path: &Path) -> Result<(), CliError> {
    let mut machine = Machine::new();
    machine.load_file(path)?;

    println!("h2vm {} - .quit to leave, .save <file> to write the image", env!("CARGO_PKG_VERSION"));

    let mut rl = DefaultEditor::new()?;
    let history_file = dirs::home_dir().map(|mut p| {
        p.push(".h2vm_history");
        p
    });
    if let Some(ref path) = history_file {
        let _ = rl.load_history(path);
    }

    loop {
        match rl.readline("> ") {
            Ok(line) => {
                let input = line.trim_end();
                if input.trim().is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(input);

                if input == ".quit" {
                    break;
                }
                if let Some(target) = input.strip_prefix(".save ") {
                    match machine.save_file(target.trim()) {
                        Ok(()) => println!(" saved"),
                        Err(e) => println!(" {}", e),
                    }
                    continue;
                }

                let mut text = input.to_string();
                text.push('\n');
                let mut stdout = io::stdout();
                match machine.eval(&text, &mut stdout) {
                    Ok(Exit::Halted(0)) | Ok(Exit::Yielded) => println!(" ok"),
                    Ok(Exit::Halted(code)) => println!(" error {}", code),
                    Err(e) => println!(" {}", e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                if let Some(ref path) = history_file {
                    let _ = rl.save_history(path);
                }
                return Err(err.into());
            }
        }
    }

    if let Some(ref path) = history_file {
        let _ = rl.save_history(path);
    }
    Ok(())
}
