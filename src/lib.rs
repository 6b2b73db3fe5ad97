//! Dynamic recompiler for the MIPS R4300i, targeting 32-bit x86.
//!
//! Guest code is translated one basic block at a time: [`mips::decode`]
//! classifies each instruction word, [`jit::compiler::BlockCompiler`]
//! drives the per-opcode generators in [`jit::codegen`], and the result
//! is a flat byte buffer plus the bookkeeping needed to enter it at any
//! instruction boundary. Generated code keeps guest registers in host
//! registers through [`jit::regcache`] and falls back to an external
//! interpreter helper for anything without a native generator.

pub mod config;
pub mod cpu;
pub mod jit;
pub mod mips;
