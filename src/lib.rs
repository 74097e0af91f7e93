#[macro_use]
pub mod util;

pub mod codegen;
pub mod emulate;
pub mod event;
pub mod harness;
pub mod memory;
pub mod program;
pub mod witness;
