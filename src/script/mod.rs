//! Test script language: lexer, expressions and interpreter

pub mod context;
pub mod expr;
pub mod interpreter;
pub mod lexer;

pub use context::{Client, ExecutionContext};
pub use interpreter::Interpreter;
