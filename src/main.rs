use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use mvm::config::RuntimeConfig;
use mvm::vm::validator::{self, Validator};
use mvm::vm::{HostHooks, RecordingHost, Value, Vm, disasm, loader};

#[derive(Parser)]
#[command(name = "mvm")]
#[command(about = "M-Token bytecode executor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ProgramInput {
    /// The program file (raw bytes, or hex text with --hex)
    file: PathBuf,

    /// Treat the input file as whitespace-separated hex text
    #[arg(long)]
    hex: bool,
}

#[derive(clap::Args)]
struct Limits {
    /// Load limits from a TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum opcodes executed per run
    #[arg(long)]
    step_limit: Option<u64>,

    /// Gas budget per run (0 disables metering)
    #[arg(long)]
    gas_limit: Option<u64>,

    /// Maximum nested call depth
    #[arg(long)]
    call_depth_limit: Option<usize>,

    /// Data stack bound
    #[arg(long)]
    stack_limit: Option<usize>,
}

impl Limits {
    fn resolve(&self) -> Result<RuntimeConfig, String> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::load(path)?,
            None => RuntimeConfig::default(),
        };
        if let Some(v) = self.step_limit {
            config.step_limit = v;
        }
        if let Some(v) = self.gas_limit {
            config.gas_limit = v;
        }
        if let Some(v) = self.call_depth_limit {
            config.call_depth_limit = v;
        }
        if let Some(v) = self.stack_limit {
            config.stack_limit = v;
        }
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Load, validate, and run a program
    Run {
        #[command(flatten)]
        input: ProgramInput,

        #[command(flatten)]
        limits: Limits,

        /// Skip static validation (runtime checks still apply)
        #[arg(long)]
        no_validate: bool,

        /// Values handed out by IOR, in order (then zeroes)
        #[arg(long, value_delimiter = ',')]
        read: Vec<i64>,
    },
    /// Statically validate a program without running it
    Validate {
        #[command(flatten)]
        input: ProgramInput,

        /// Reject extension opcodes (public ABI boundary)
        #[arg(long)]
        core_only: bool,
    },
    /// Disassemble a program
    Disasm {
        #[command(flatten)]
        input: ProgramInput,
    },
    /// Run a program under the recording host and print the trace
    Simulate {
        #[command(flatten)]
        input: ProgramInput,

        #[command(flatten)]
        limits: Limits,

        /// Emit the result as JSON
        #[arg(long)]
        json: bool,

        /// Maximum trace rows retained
        #[arg(long, default_value = "1024")]
        trace_limit: usize,
    },
}

/// Host used by `run`: writes and traces go to the terminal, reads come
/// from a queue supplied on the command line.
struct StdHost {
    reads: Vec<i64>,
}

impl HostHooks for StdHost {
    fn io_write(&mut self, device: u8, value: Value) {
        println!("iow dev={} value={}", device, value);
    }

    fn io_read(&mut self, device: u8) -> Value {
        let value = if self.reads.is_empty() {
            0
        } else {
            self.reads.remove(0)
        };
        println!("ior dev={} value={}", device, value);
        Value::Int(value)
    }

    fn sleep(&mut self, ms: u32) {
        std::thread::sleep(std::time::Duration::from_millis(ms as u64));
    }

    fn trace(&mut self, level: u32, msg: &str) {
        eprintln!("[trace {}] {}", level, msg);
    }
}

fn load_bytes(input: &ProgramInput) -> Result<Vec<u8>, String> {
    let path: &Path = &input.file;
    if input.hex {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        parse_hex(&text)
    } else {
        std::fs::read(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))
    }
}

fn parse_hex(text: &str) -> Result<Vec<u8>, String> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err("hex input has an odd number of digits".to_string());
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| format!("invalid hex at position {}", i))
        })
        .collect()
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            input,
            limits,
            no_validate,
            read,
        } => {
            let bytes = match load_bytes(&input) {
                Ok(b) => b,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            let config = match limits.resolve() {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            let mut vm = match Vm::with_config(&bytes, StdHost { reads: read }, &config) {
                Ok(vm) => vm,
                Err(e) => {
                    eprintln!("load error: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            if !no_validate
                && let Err(e) = validator::validate(vm.program())
            {
                eprintln!("invalid program: {}", e);
                return ExitCode::FAILURE;
            }

            let outcome = vm.run();
            if outcome.completed {
                match outcome.result {
                    Some(v) => println!("result: {} (steps: {})", v, outcome.steps),
                    None => println!("result: <empty stack> (steps: {})", outcome.steps),
                }
                ExitCode::SUCCESS
            } else {
                eprintln!(
                    "fault: {} at pc {} (steps: {})",
                    vm.fault_string(),
                    outcome.pc,
                    outcome.steps
                );
                ExitCode::FAILURE
            }
        }

        Commands::Validate { input, core_only } => {
            let bytes = match load_bytes(&input) {
                Ok(b) => b,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            let program = match loader::load(&bytes) {
                Ok(p) => p,
                Err(e) => {
                    eprintln!("invalid: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            let validator = if core_only {
                Validator::core_only()
            } else {
                Validator::new()
            };
            match validator.validate(&program) {
                Ok(()) => {
                    println!("ok: {} tokens", program.token_count());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("invalid: {}", e);
                    ExitCode::FAILURE
                }
            }
        }

        Commands::Disasm { input } => {
            let bytes = match load_bytes(&input) {
                Ok(b) => b,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            match loader::load(&bytes) {
                Ok(program) => {
                    print!("{}", disasm::format_program(&program));
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("load error: {}", e);
                    ExitCode::FAILURE
                }
            }
        }

        Commands::Simulate {
            input,
            limits,
            json,
            trace_limit,
        } => {
            let bytes = match load_bytes(&input) {
                Ok(b) => b,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            let config = match limits.resolve() {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            let mut vm = match Vm::with_config(&bytes, RecordingHost::new(), &config) {
                Ok(vm) => vm,
                Err(e) => {
                    eprintln!("load error: {}", e);
                    return ExitCode::FAILURE;
                }
            };

            let result = vm.simulate(trace_limit);
            if json {
                match serde_json::to_string_pretty(&result) {
                    Ok(s) => println!("{}", s),
                    Err(e) => {
                        eprintln!("error: {}", e);
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                println!("{:>6} {:>6} {:<8} {:>4} {:>20}", "step", "pc", "op", "sp", "top");
                for row in &result.trace {
                    println!(
                        "{:>6} {:>6} {:<8} {:>4} {:>20}",
                        row.step,
                        row.pc,
                        row.op,
                        row.sp,
                        row.top.map(|t| t.to_string()).unwrap_or_default()
                    );
                }
                match result.fault {
                    None => println!("completed: result={:?} steps={}", result.result, result.steps),
                    Some(f) => println!("fault: {} at pc {} steps={}", f, result.pc, result.steps),
                }
            }
            if result.completed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
