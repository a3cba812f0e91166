use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::filter::LevelFilter;

use upcall_stub::abi::{ConventionDescriptor, Register, Signature};
use upcall_stub::upcall::{
    CalleeTarget, ExternalEntry, ReceiverHandle, TargetMethod, UpcallHooks,
};
use upcall_stub::{ReturnBuffer, StubBlob, StubOptions, StubRequest};

#[derive(Parser)]
#[command(name = "upcall-stub")]
#[command(about = "Native-to-runtime upcall stub generator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a stub and write its encoded form
    Generate {
        #[command(flatten)]
        stub: StubArgs,

        #[arg(short, long, help = "Output file for the encoded stub")]
        output: Option<PathBuf>,

        #[arg(long, help = "Print the argument shuffle plan")]
        print_shuffle: bool,

        #[arg(long, help = "Print the stub header, frame layout and disassembly")]
        trace: bool,

        #[arg(long, help = "Print a JSON summary of the generated stub")]
        json: bool,

        #[arg(long, help = "Use a return buffer of this many bytes")]
        return_buffer: Option<usize>,

        #[arg(long, default_value_t = upcall_stub::upcall::DEFAULT_CODE_CAPACITY)]
        code_capacity: usize,
    },
    /// Print only the argument shuffle plan
    Plan {
        #[command(flatten)]
        stub: StubArgs,
    },
}

#[derive(Args)]
struct StubArgs {
    #[arg(short, long, help = "Method signature, e.g. (IJD)J or (J)[JD]")]
    signature: String,

    #[arg(long, help = "Native convention descriptor file (default: aapcs64)")]
    native: Option<PathBuf>,

    #[arg(long, help = "Runtime convention descriptor file (default: aarch64-runtime)")]
    runtime: Option<PathBuf>,

    #[arg(long, default_value = "target", help = "Target method name")]
    method: String,

    #[arg(long, value_parser = parse_address, default_value = "0x90000")]
    method_metadata: u64,

    #[arg(long, value_parser = parse_address, default_value = "0x50000")]
    entry: u64,

    #[arg(long, value_parser = parse_address, default_value = "0x70000")]
    receiver: u64,

    #[arg(long, help = "Treat the receiver as a weak global handle")]
    weak: bool,

    #[arg(long, value_parser = parse_address, default_value = "0x10000")]
    on_entry: u64,

    #[arg(long, value_parser = parse_address, default_value = "0x20000")]
    on_exit: u64,

    #[arg(long, value_parser = parse_address, default_value = "0x30000")]
    uncaught_exception: u64,
}

fn main() -> Result<()> {
    // Shuffle plans and stub traces are logged at info.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate {
            stub,
            output,
            print_shuffle,
            trace,
            json,
            return_buffer,
            code_capacity,
        } => {
            let mut request = build_request(&stub)?;
            if let Some(bytes) = return_buffer {
                request = request.with_return_buffer(ReturnBuffer::Explicit(bytes));
            }
            let options = stub_options(print_shuffle, trace, code_capacity);
            let blob = upcall_stub::generate_upcall_stub(&request, &options)
                .with_context(|| format!("Stub generation failed for {}", request.signature))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary(&blob))?);
            }
            if let Some(output) = output {
                let encoded = blob.encode();
                fs::write(&output, &encoded)
                    .with_context(|| format!("Failed to write output to {}", output.display()))?;
                println!(
                    "Generated {} -> {} ({} bytes, frame {} bytes)",
                    blob.name(),
                    output.display(),
                    encoded.len(),
                    blob.frame_size()
                );
            }
        }
        Commands::Plan { stub } => {
            let request = build_request(&stub)?;
            let shuffle = upcall_stub::plan_shuffle(&request)
                .with_context(|| format!("Shuffle planning failed for {}", request.signature))?;
            print!("{shuffle}");
        }
    }

    Ok(())
}

fn stub_options(print_shuffle: bool, trace: bool, code_capacity: usize) -> StubOptions {
    StubOptions {
        print_shuffle_plan: print_shuffle,
        trace_stubs: trace,
        code_capacity,
    }
}

fn build_request(args: &StubArgs) -> Result<StubRequest> {
    let signature = Signature::parse(&args.signature)
        .with_context(|| format!("Bad signature '{}'", args.signature))?;
    let native = match &args.native {
        Some(path) => read_descriptor(path)?,
        None => ConventionDescriptor::aapcs64(),
    };
    let runtime = match &args.runtime {
        Some(path) => read_descriptor(path)?,
        None => ConventionDescriptor::aarch64_runtime(),
    };

    let method = TargetMethod::new(
        args.method.clone(),
        args.method_metadata,
        Arc::new(CalleeTarget::new(args.entry)),
    );
    let receiver = if args.weak {
        ReceiverHandle::weak(args.receiver)
    } else {
        ReceiverHandle::new(args.receiver)
    };
    let hooks = UpcallHooks {
        on_entry: ExternalEntry::native("on_entry", args.on_entry),
        on_exit: ExternalEntry::native("on_exit", args.on_exit),
        handle_uncaught_exception: ExternalEntry::native(
            "handle_uncaught_exception",
            args.uncaught_exception,
        ),
    };

    Ok(StubRequest::aarch64(signature, method, receiver, hooks).with_conventions(native, runtime))
}

fn summary(blob: &StubBlob) -> serde_json::Value {
    let regions: Vec<_> = blob
        .layout()
        .regions()
        .iter()
        .map(|span| {
            serde_json::json!({
                "region": span.region.to_string(),
                "offset": span.offset,
                "size": span.size,
            })
        })
        .collect();
    let phases: Vec<_> = blob
        .phases()
        .iter()
        .map(|mark| serde_json::json!({ "phase": mark.phase.name(), "offset": mark.offset }))
        .collect();
    let moves: Vec<_> = blob.shuffle().moves().iter().map(ToString::to_string).collect();

    serde_json::json!({
        "name": blob.name(),
        "code_size": blob.code().len(),
        "frame_size": blob.frame_size(),
        "frame_data_offset": blob.frame_data_offset(),
        "exception_handler_offset": blob.exception_handler_offset(),
        "out_arg_stack_slots": blob.shuffle().out_arg_stack_slots(),
        "regions": regions,
        "phases": phases,
        "moves": moves,
    })
}

fn parse_address(text: &str) -> Result<u64> {
    let text = text.trim();
    let value = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => text.replace('_', "").parse(),
    };
    value.with_context(|| format!("invalid address '{text}'"))
}

fn read_descriptor(path: &Path) -> Result<ConventionDescriptor> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let default_name = path
        .file_stem()
        .map_or_else(|| path.to_string_lossy(), |stem| stem.to_string_lossy());
    parse_descriptor(&contents, &default_name)
        .with_context(|| format!("Invalid descriptor {}", path.display()))
}

/// Parse a convention descriptor file.
///
/// Format (one setting per line):
/// ```text
/// # Comments start with #
/// name = aapcs64
/// volatile = r0-r18, r30, v0-v7, v16-v31
/// int_args = r0-r7
/// float_args = v0-v7
/// int_returns = r0, r1
/// float_returns = v0-v3
/// stack_alignment = 16
/// shadow_space = 0
/// return_buffer = r10
/// ```
fn parse_descriptor(contents: &str, default_name: &str) -> Result<ConventionDescriptor> {
    let mut name = default_name.to_string();
    let mut settings = Vec::new();

    for (line_num, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            anyhow::anyhow!("line {}: invalid format, expected 'key = value'", line_num + 1)
        })?;
        let (key, value) = (key.trim(), value.trim());
        if key == "name" {
            name = value.to_string();
        } else {
            settings.push((line_num + 1, key, value));
        }
    }

    let mut builder = ConventionDescriptor::builder(name);
    for (line, key, value) in settings {
        builder = match key {
            "volatile" => builder.volatile(parse_register_list(value, line)?),
            "int_args" => builder.int_args(parse_register_list(value, line)?),
            "float_args" => builder.float_args(parse_register_list(value, line)?),
            "int_returns" => builder.int_returns(parse_register_list(value, line)?),
            "float_returns" => builder.float_returns(parse_register_list(value, line)?),
            "stack_alignment" => builder.stack_alignment(parse_bytes(value, line)?),
            "shadow_space" => builder.shadow_space(parse_bytes(value, line)?),
            "return_buffer" => builder.return_buffer_register(
                value
                    .parse()
                    .with_context(|| format!("line {line}: bad return buffer register"))?,
            ),
            _ => anyhow::bail!("line {line}: unknown key '{key}'"),
        };
    }
    Ok(builder.build()?)
}

fn parse_bytes(value: &str, line: usize) -> Result<usize> {
    value
        .parse()
        .with_context(|| format!("line {line}: invalid byte count '{value}'"))
}

/// Comma-separated registers; `r0-r7` expands to r0 through r7 in order.
fn parse_register_list(value: &str, line: usize) -> Result<Vec<Register>> {
    let mut regs = Vec::new();
    for item in value.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        let Some((first, last)) = item.split_once('-') else {
            regs.push(
                item.parse::<Register>()
                    .with_context(|| format!("line {line}: bad register '{item}'"))?,
            );
            continue;
        };
        let first: Register = first
            .parse()
            .with_context(|| format!("line {line}: bad range '{item}'"))?;
        let last: Register = last
            .parse()
            .with_context(|| format!("line {line}: bad range '{item}'"))?;
        if first.kind() != last.kind() || first.index() > last.index() {
            anyhow::bail!("line {line}: invalid register range '{item}'");
        }
        regs.extend((first.index()..=last.index()).map(|index| {
            if first.is_gp() {
                Register::gp(index)
            } else {
                Register::fp(index)
            }
        }));
    }
    Ok(regs)
}
