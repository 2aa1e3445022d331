//! The backend consumes the finalized program. A [`CodegenSink`] turns it
//! into target assembly and supplies the assembler and linker commands; the
//! driver here writes the assembly and runs both subprocesses, reporting
//! each command line.

use std::{path::Path, process::Command};

use itertools::Itertools;

use crate::{compiler::Compiler, middle::ir::Program, report::CResult};

pub mod x86_64_linux_gnu;

pub trait CodegenSink {
    /// Translates the program into assembly text.
    ///
    /// The sink must reserve `.bss` space for every array word, emit every
    /// interned string NUL-terminated in a read-only section, emit one
    /// labeled body per function plus an entry point running the top-level
    /// body, and honor the IR's computed jump indices.
    fn generate_assembly(&self, program: &Program) -> String;

    fn assembler_command(&self, input: &Path, output: &Path) -> Command;

    fn linker_command(&self, input: &Path, output: &Path) -> Command;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    X86_64LinuxGnu,
}

impl Target {
    pub fn sink(self) -> impl CodegenSink {
        match self {
            Target::X86_64LinuxGnu => x86_64_linux_gnu::X86_64LinuxGnu,
        }
    }
}

/// Emits the assembly file, assembles it, and links the executable.
pub fn codegen_program(
    compiler: &Compiler,
    program: &Program,
    target: Target,
) -> CResult<()> {
    let sink = target.sink();

    let assembly = sink.generate_assembly(program);
    let asm_path = &compiler.options.assembly;
    std::fs::write(asm_path, assembly).map_err(|error| {
        compiler.reporter.fatal(format!(
            "cannot write assembly file {}: {error}",
            asm_path.display()
        ))
    })?;

    let object_path = compiler.options.executable.with_extension("o");

    run_command(compiler, sink.assembler_command(asm_path, &object_path))?;
    run_command(
        compiler,
        sink.linker_command(&object_path, &compiler.options.executable),
    )?;

    Ok(())
}

fn run_command(compiler: &Compiler, mut command: Command) -> CResult<()> {
    compiler.reporter.command(format_command(&command));

    let status = command.status().map_err(|error| {
        compiler.reporter.fatal(format!(
            "failed to run `{}`: {error}",
            command.get_program().to_string_lossy()
        ))
    })?;

    if !status.success() {
        return Err(compiler.reporter.fatal(format!(
            "`{}` exited with {status}",
            command.get_program().to_string_lossy()
        )));
    }

    Ok(())
}

fn format_command(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|part| part.to_string_lossy())
        .join(" ")
}
