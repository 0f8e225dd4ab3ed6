//! The `rayquaza` command line collaborator described in spec.md §6: loads a compiled program,
//! drives a [`rayquaza_vm::runner::Runner`] to completion, and writes out the trace/memory/public
//! input artifacts a prover expects.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use rayquaza_vm::hints::NoopHintProcessor;
use rayquaza_vm::program::Program;
use rayquaza_vm::runner::Runner;
use starknet_types_core::felt::Felt;
use thiserror::Error;

/// Runs a compiled Cairo program to completion and emits its trace, memory, and public input.
#[derive(Debug, Parser)]
#[command(name = "rayquaza", about = "A high performance Cairo virtual machine")]
struct Cli {
    /// Path to the compiled program (the Cairo compiler's JSON output).
    program: PathBuf,

    /// Where to write the binary relocated trace, if requested.
    #[arg(long)]
    trace_file: Option<PathBuf>,

    /// Where to write the binary relocated memory, if requested.
    #[arg(long)]
    memory_file: Option<PathBuf>,

    /// Where to write the JSON public input, if requested.
    #[arg(long)]
    air_public_input: Option<PathBuf>,

    /// The builtin layout to run under.
    #[arg(long, default_value = "plain")]
    layout: String,

    /// Run in proof mode: the run is also swept by the secure-run verifier.
    #[arg(long, default_value_t = false)]
    proof_mode: bool,

    /// Accept a program that does not declare every builtin its layout requires.
    #[arg(long, default_value_t = false)]
    allow_missing_builtins: bool,
}

/// An error surfaced directly to the user at the CLI boundary.
#[derive(Debug, Error)]
enum CliError {
    #[error("could not read program file `{path}`: {source}")]
    ReadProgram {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse program file `{path}`: {source}")]
    ParseProgram {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not write output file `{path}`: {source}")]
    WriteOutput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not serialize public input: {0}")]
    SerializePublicInput(#[source] serde_json::Error),
    #[error(transparent)]
    Vm(#[from] rayquaza_vm::error::Error),
}

fn main() -> ExitCode {
    env_logger::init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let program = load_program(&cli.program)?;
    log::info!(
        "loaded program `{}` ({} cells, {} builtins)",
        cli.program.display(),
        program.data.len(),
        program.builtins.len()
    );

    let mut runner = Runner::new(
        program,
        &cli.layout,
        cli.allow_missing_builtins,
        NoopHintProcessor,
    )?;

    runner.run_until_pc(usize::MAX)?;
    log::info!("run finished after {} steps", runner.vm().step_count());

    runner.end_run(cli.proof_mode)?;
    if cli.proof_mode {
        runner.verify_secure_run(true)?;
        log::info!("secure-run verification passed");
    }

    let (relocated_memory, public_input) = runner.finalize(&cli.layout)?;

    if let Some(path) = &cli.trace_file {
        write_trace(path, &runner)?;
        log::info!("wrote trace to `{}`", path.display());
    }

    if let Some(path) = &cli.memory_file {
        write_memory(path, &relocated_memory)?;
        log::info!("wrote memory to `{}`", path.display());
    }

    if let Some(path) = &cli.air_public_input {
        write_public_input(path, &public_input)?;
        log::info!("wrote public input to `{}`", path.display());
    }

    Ok(())
}

fn load_program(path: &PathBuf) -> Result<Program, CliError> {
    let contents = std::fs::read_to_string(path).map_err(|source| CliError::ReadProgram {
        path: path.clone(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| CliError::ParseProgram {
        path: path.clone(),
        source,
    })
}

/// Writes the relocated trace as, for each entry, three little-endian `u64`s `(ap, fp, pc)`
/// (spec.md §6 "Trace output (binary)"). Must run after [`Runner::finalize`], which is what
/// relocates the trace in the first place.
fn write_trace<H>(path: &PathBuf, runner: &Runner<H>) -> Result<(), CliError> {
    let file = File::create(path).map_err(|source| CliError::WriteOutput {
        path: path.clone(),
        source,
    })?;
    let mut writer = BufWriter::new(file);

    let write = |writer: &mut BufWriter<File>, value: &Felt| -> std::io::Result<()> {
        let bytes = value.to_bytes_be();
        let low_bytes: [u8; 8] = bytes[24..32].try_into().expect("exactly 8 bytes");
        writer.write_all(&u64::from_be_bytes(low_bytes).to_le_bytes())
    };

    (|| -> std::io::Result<()> {
        let entries = runner.trace().relocated().expect("trace was just relocated by finalize");
        for entry in entries {
            write(&mut writer, &entry.ap)?;
            write(&mut writer, &entry.fp)?;
            write(&mut writer, &entry.pc)?;
        }
        writer.flush()
    })()
    .map_err(|source| CliError::WriteOutput {
        path: path.clone(),
        source,
    })
}

/// Writes one record per non-null relocated cell: an 8-byte little-endian index followed by a
/// 32-byte little-endian field element. Index `0` is never emitted (spec.md §6 "Memory output
/// (binary)").
fn write_memory(path: &PathBuf, relocated_memory: &[Option<Felt>]) -> Result<(), CliError> {
    let file = File::create(path).map_err(|source| CliError::WriteOutput {
        path: path.clone(),
        source,
    })?;
    let mut writer = BufWriter::new(file);

    (|| -> std::io::Result<()> {
        for (index, value) in relocated_memory.iter().enumerate() {
            if index == 0 {
                continue;
            }
            let Some(value) = value else {
                continue;
            };
            writer.write_all(&(index as u64).to_le_bytes())?;
            let mut be_bytes = value.to_bytes_be();
            be_bytes.reverse();
            writer.write_all(&be_bytes)?;
        }
        writer.flush()
    })()
    .map_err(|source| CliError::WriteOutput {
        path: path.clone(),
        source,
    })
}

fn write_public_input(
    path: &PathBuf,
    public_input: &rayquaza_vm::public_input::PublicInput,
) -> Result<(), CliError> {
    let json =
        serde_json::to_string_pretty(public_input).map_err(CliError::SerializePublicInput)?;
    std::fs::write(path, json).map_err(|source| CliError::WriteOutput {
        path: path.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_memory_skips_index_zero_and_null_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.bin");

        let relocated = vec![None, Some(Felt::from(5u64)), None, Some(Felt::from(7u64))];
        write_memory(&path, &relocated).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        // Two records of 8 (index) + 32 (value) bytes each.
        assert_eq!(bytes.len(), 2 * 40);

        let index0 = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        assert_eq!(index0, 1);
        let index1 = u64::from_le_bytes(bytes[40..48].try_into().unwrap());
        assert_eq!(index1, 3);
    }

    #[test]
    fn write_public_input_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("public_input.json");

        let public_input = rayquaza_vm::public_input::PublicInput {
            layout: "plain".to_owned(),
            rc_min: 0,
            rc_max: 10,
            n_steps: 3,
            memory_segments: Default::default(),
            public_memory: Vec::new(),
        };
        write_public_input(&path, &public_input).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: rayquaza_vm::public_input::PublicInput =
            serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.layout, "plain");
        assert_eq!(parsed.n_steps, 3);
    }

    #[test]
    fn load_program_reports_read_errors_for_missing_files() {
        let missing = PathBuf::from("/nonexistent/path/to/program.json");
        let err = load_program(&missing).unwrap_err();
        assert!(matches!(err, CliError::ReadProgram { .. }));
    }
}
