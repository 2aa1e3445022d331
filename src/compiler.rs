//! The compiler value threaded through every pass, and the pipeline itself.
//!
//! All global-ish state (options, the compilation-failed flag) lives here
//! instead of in module-level singletons, so tests can instantiate a fresh
//! compiler per case.

use std::path::PathBuf;

use crate::{
    frontend::{
        intern::{extract_strings, intern_str},
        lexer, resolve,
    },
    middle::{
        builder::build_operations,
        definitions::{register_definitions, register_intrinsics},
        ir::{generate_jump_targets, Program, WordKind},
        optimize::optimize,
        type_check::typecheck_program,
    },
    report::{CResult, Fatal, Reporter},
};

#[derive(Debug, Clone)]
pub struct CompilerOptions {
    pub source_files: Vec<PathBuf>,
    pub include_search_paths: Vec<PathBuf>,
    /// Path of the produced executable; the assembly and object files
    /// derive from it.
    pub executable: PathBuf,
    pub assembly: PathBuf,
    /// Appended to `import` paths (`import` names a module, `include` a
    /// file).
    pub import_extension: String,
    pub warn_redefinitions: bool,
    pub verbose: bool,
    /// Run the type checker (`-c`/`--check`).
    pub typecheck: bool,
    pub colors: bool,
    pub dump_effects: bool,
    pub control_flow: Option<ControlFlowDump>,
    /// Compile, then exec the produced executable.
    pub run_mode: bool,
    /// Arguments forwarded to the executable in run mode.
    pub program_arguments: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ControlFlowDump {
    pub path: PathBuf,
    /// `None` dumps the whole program.
    pub function: Option<String>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            source_files: Vec::new(),
            include_search_paths: Vec::new(),
            executable: PathBuf::from("a.out"),
            assembly: PathBuf::from("a.out.asm"),
            import_extension: ".stacky".to_string(),
            warn_redefinitions: true,
            verbose: false,
            typecheck: false,
            colors: false,
            dump_effects: false,
            control_flow: None,
            run_mode: false,
            program_arguments: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct Compiler {
    pub options: CompilerOptions,
    pub reporter: Reporter,
}

impl Compiler {
    pub fn new(options: CompilerOptions) -> Self {
        let reporter = Reporter::new(options.colors, options.verbose);
        Self { options, reporter }
    }

    /// Runs the whole core pipeline: lex, splice includes, intern strings,
    /// register definitions, build IR, typecheck, optimize, index jump
    /// targets. The returned program is ready for the codegen sink.
    pub fn compile(&self) -> CResult<Program> {
        let mut tokens = Vec::new();

        for path in &self.options.source_files {
            let contents = std::fs::read_to_string(path).map_err(|error| {
                self.reporter.fatal(format!(
                    "source file {} cannot be opened: {error}",
                    path.display()
                ))
            })?;

            lexer::lex(
                &self.reporter,
                &contents,
                intern_str(&path.to_string_lossy()),
                &mut tokens,
            )?;
        }

        resolve::resolve_includes(self, &mut tokens)?;

        let mut program = Program::default();
        extract_strings(self, &mut tokens, &mut program.strings)?;

        register_intrinsics(&mut program.words);
        register_definitions(self, &mut tokens, &mut program.words)?;

        build_operations(self, &tokens, &mut program)?;
        if self.reporter.compilation_failed() {
            return Err(Fatal);
        }

        if self.options.dump_effects {
            self.dump_effects(&program);
        }

        if self.options.typecheck {
            typecheck_program(self, &program)?;
        }

        optimize(self, &mut program);
        generate_jump_targets(&mut program);

        Ok(program)
    }

    fn dump_effects(&self, program: &Program) {
        for (name, word) in program.words.iter() {
            let WordKind::Function(function) = &word.kind else {
                continue;
            };
            match &function.effect {
                Some(effect) => println!("{name} : {effect}"),
                None if function.dynamic => println!("{name} : dyn"),
                None => println!("{name} : (no signature)"),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::frontend::Token;

    pub(crate) fn test_compiler() -> Compiler {
        Compiler {
            options: CompilerOptions::default(),
            reporter: Reporter::silent(),
        }
    }

    pub(crate) fn lex_source(source: &str) -> Vec<Token> {
        let reporter = Reporter::silent();
        let mut tokens = Vec::new();
        lexer::lex(&reporter, source, "<test>", &mut tokens).expect("test source lexes");
        tokens
    }

    /// Runs the front half of the pipeline over in-memory source text,
    /// stopping before typechecking and optimization.
    pub(crate) fn build_program(compiler: &Compiler, source: &str) -> CResult<Program> {
        let mut tokens = Vec::new();
        lexer::lex(&compiler.reporter, source, "<test>", &mut tokens)?;
        resolve::resolve_includes(compiler, &mut tokens)?;

        let mut program = Program::default();
        extract_strings(compiler, &mut tokens, &mut program.strings)?;
        register_intrinsics(&mut program.words);
        register_definitions(compiler, &mut tokens, &mut program.words)?;
        build_operations(compiler, &tokens, &mut program)?;

        if compiler.reporter.compilation_failed() {
            return Err(Fatal);
        }
        Ok(program)
    }

    /// Registers definitions only, for registrar tests.
    pub(crate) fn registered_words(
        compiler: &Compiler,
        source: &str,
    ) -> crate::middle::ir::Words {
        let mut tokens = lex_source(source);
        let mut words = crate::middle::ir::Words::default();
        register_intrinsics(&mut words);
        register_definitions(compiler, &mut tokens, &mut words).expect("definitions register");
        words
    }
}
