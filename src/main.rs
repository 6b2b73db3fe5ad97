use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use r4300_dynarec::config::JitConfig;
use r4300_dynarec::jit::compiler::BlockCompiler;
use r4300_dynarec::jit::dispatch::DispatchTable;
use r4300_dynarec::jit::runtime::HostMap;
use r4300_dynarec::mips::{decode, BlockWindow};

#[derive(Parser)]
#[command(name = "r4300-dynarec")]
#[command(about = "MIPS R4300i to x86 block translator", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Translate a flat big-endian code image and report per-block stats
    Compile {
        /// Image of raw instruction words
        file: PathBuf,
        /// Guest address the image is mapped at
        #[arg(long, default_value_t = 0x8000_0000, value_parser = parse_addr)]
        base: u32,
        /// Hex-dump the generated code
        #[arg(long)]
        dump: bool,
    },
    /// List the decoded form of each instruction word
    Decode {
        /// Image of raw instruction words
        file: PathBuf,
        /// Guest address the image is mapped at
        #[arg(long, default_value_t = 0x8000_0000, value_parser = parse_addr)]
        base: u32,
    },
}

fn parse_addr(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|e| format!("invalid address {:?}: {}", s, e))
}

fn load_words(path: &PathBuf) -> Result<Vec<u32>, String> {
    let bytes = std::fs::read(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    if bytes.len() % 4 != 0 {
        return Err(format!(
            "{}: image length {} is not a multiple of 4",
            path.display(),
            bytes.len()
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn load_config(path: Option<&PathBuf>) -> Result<JitConfig, String> {
    match path {
        Some(path) => JitConfig::load(path).map_err(|e| e.to_string()),
        None => Ok(JitConfig::default()),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = match load_config(cli.config.as_ref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Compile { file, base, dump } => {
            let words = match load_words(&file) {
                Ok(words) => words,
                Err(e) => {
                    eprintln!("{}", e);
                    return ExitCode::FAILURE;
                }
            };
            if words.is_empty() {
                eprintln!("{}: empty image", file.display());
                return ExitCode::FAILURE;
            }

            let map = HostMap::synthetic();
            let dispatch = DispatchTable::new(&cfg);
            let block = BlockCompiler::new(&cfg, &map, &dispatch, &words, base).compile();

            println!(
                "block {:08x}..{:08x}: {} guest words, {} translated, {} bytes",
                block.start,
                block.end,
                words.len(),
                block.insns.len(),
                block.code.len()
            );
            for insn in &block.insns {
                println!(
                    "  {:08x}  {:<10} at +{:#x}",
                    insn.addr,
                    format!("{:?}", insn.opcode),
                    insn.local_addr
                );
            }
            if dump {
                for (i, chunk) in block.code.chunks(16).enumerate() {
                    print!("{:06x}:", i * 16);
                    for byte in chunk {
                        print!(" {:02x}", byte);
                    }
                    println!();
                }
            }
        }
        Commands::Decode { file, base } => {
            let words = match load_words(&file) {
                Ok(words) => words,
                Err(e) => {
                    eprintln!("{}", e);
                    return ExitCode::FAILURE;
                }
            };
            let window = BlockWindow {
                start: base,
                end: base.wrapping_add((words.len() as u32) * 4),
            };
            for (i, &word) in words.iter().enumerate() {
                let next = words.get(i + 1).copied().unwrap_or(0);
                let addr = base.wrapping_add((i as u32) * 4);
                let insn = decode(word, next, addr, &window, false);
                println!("{:08x}  {:08x}  {:?}", addr, word, insn.opcode);
            }
        }
    }

    ExitCode::SUCCESS
}
