pub mod codebuf;
pub mod codegen;
pub mod compiler;
pub mod dispatch;
pub mod linker;
pub mod memory;
pub mod regcache;
pub mod runtime;
pub mod x86;
