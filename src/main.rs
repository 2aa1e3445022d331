use std::{
    io::IsTerminal,
    os::unix::process::CommandExt,
    path::PathBuf,
    process::ExitCode,
};

use clap::{CommandFactory, Parser, Subcommand, error::ErrorKind};

use crate::{
    backend::{codegen_program, Target},
    compiler::{Compiler, CompilerOptions, ControlFlowDump},
    debug::generate_control_flow_graph,
};

mod backend;
mod compiler;
mod debug;
mod frontend;
mod middle;
mod report;

#[derive(Debug, Parser)]
#[command(name = "stacky", version, about = "Compiler for the stacky language")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Compile source files into an executable.
    Build(BuildArgs),
    /// Compile, then run the produced executable.
    Run(BuildArgs),
}

#[derive(Debug, clap::Args)]
struct BuildArgs {
    /// Print progress information during compilation.
    #[arg(short, long)]
    verbose: bool,

    /// Type check the program.
    #[arg(short, long)]
    check: bool,

    /// Do not color diagnostics.
    #[arg(short = 'C', long = "no-colors")]
    no_colors: bool,

    /// File name of the produced executable.
    #[arg(short, long, value_name = "path")]
    output: Option<PathBuf>,

    /// Add a directory to the include/import search path.
    #[arg(short = 'I', value_name = "path")]
    include: Vec<PathBuf>,

    /// Print the declared stack effect of every function.
    #[arg(long)]
    dump_effects: bool,

    /// Write a control flow graph of the program.
    #[arg(long)]
    control_flow: bool,

    /// Write a control flow graph of one function.
    #[arg(long, value_name = "function")]
    control_flow_for: Option<String>,

    /// Source files with stacky code.
    source_files: Vec<PathBuf>,

    /// Arguments after `--` are forwarded to the program in run mode.
    #[arg(last = true)]
    arguments: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let (args, run_mode) = match cli.command {
        CliCommand::Build(args) => (args, false),
        CliCommand::Run(args) => (args, true),
    };

    if args.source_files.is_empty() {
        Cli::command()
            .error(ErrorKind::MissingRequiredArgument, "no input files")
            .exit();
    }

    for source_file in &args.source_files {
        if !source_file.is_file() {
            Cli::command()
                .error(
                    ErrorKind::InvalidValue,
                    format!("source file '{}' does not exist", source_file.display()),
                )
                .exit();
        }
    }

    let options = build_options(args, run_mode);
    let compiler = Compiler::new(options);

    let program = match compiler.compile() {
        Ok(program) => program,
        Err(_) => return ExitCode::FAILURE,
    };

    if let Some(dump) = compiler.options.control_flow.clone() {
        let result = generate_control_flow_graph(
            &compiler,
            &program,
            &dump.path,
            dump.function.as_deref(),
        );
        if result.is_err() {
            return ExitCode::FAILURE;
        }
    }

    if codegen_program(&compiler, &program, Target::X86_64LinuxGnu).is_err() {
        return ExitCode::FAILURE;
    }

    if compiler.reporter.compilation_failed() {
        return ExitCode::FAILURE;
    }

    if compiler.options.run_mode {
        let executable = match compiler.options.executable.canonicalize() {
            Ok(path) => path,
            Err(error) => {
                compiler
                    .reporter
                    .error(format!("cannot resolve produced executable: {error}"));
                return ExitCode::FAILURE;
            }
        };

        // On success this never returns.
        let error = std::process::Command::new(&executable)
            .args(&compiler.options.program_arguments)
            .exec();
        compiler
            .reporter
            .error(format!("failed to run {}: {error}", executable.display()));
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn build_options(args: BuildArgs, run_mode: bool) -> CompilerOptions {
    let executable = args.output.unwrap_or_else(|| {
        let source = &args.source_files[0];
        source.with_extension("")
    });

    let mut assembly = executable.clone().into_os_string();
    assembly.push(".asm");
    let assembly = PathBuf::from(assembly);

    // The standard library ships next to the compiler binary.
    let mut include_search_paths = args.include;
    if let Ok(current_exe) = std::env::current_exe() {
        if let Some(directory) = current_exe.parent() {
            include_search_paths.push(directory.join("std"));
        }
    }

    let control_flow = if let Some(function) = args.control_flow_for {
        let mut path = executable.clone().into_os_string();
        path.push(".fun.dot");
        Some(ControlFlowDump {
            path: PathBuf::from(path),
            function: Some(function),
        })
    } else if args.control_flow {
        let mut path = executable.clone().into_os_string();
        path.push(".dot");
        Some(ControlFlowDump {
            path: PathBuf::from(path),
            function: None,
        })
    } else {
        None
    };

    CompilerOptions {
        source_files: args.source_files,
        include_search_paths,
        executable,
        assembly,
        import_extension: ".stacky".to_string(),
        warn_redefinitions: true,
        verbose: args.verbose,
        typecheck: args.check,
        colors: !args.no_colors && std::io::stdout().is_terminal(),
        dump_effects: args.dump_effects,
        control_flow,
        run_mode,
        program_arguments: args.arguments,
    }
}
