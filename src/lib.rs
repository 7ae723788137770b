pub mod bytecode;
pub mod compiler;
pub mod image;
pub mod lexer;
pub mod logging;
pub mod machine;
pub mod parser;
pub mod symbols;
