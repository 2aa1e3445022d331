//! The x86-64 Linux code generator, targeting nasm and ld.
//!
//! The data stack is the machine stack. Function calls keep their return
//! addresses on a separate call stack in `.bss` so a function body can push
//! and pop data freely: the prologue moves the return address over, the
//! epilogue moves it back and `ret`s through the machine stack.
//!
//! Per-instruction labels are emitted only for positions present in the
//! program's jump-target index, plus the epilogue label of every body.

use std::{fmt::Write, path::Path, process::Command};

use indoc::indoc;

use crate::{
    backend::CodegenSink,
    middle::ir::{Intrinsic, OpKind, Operation, Program, SymbolPrefix, WordKind, EMPTY_JUMP},
};

const LABEL_PREFIX: &str = "_stacky_instr_";
const SYMBOL_PREFIX: &str = "_stacky_symbol_";
const STRING_PREFIX: &str = "_stacky_string_";
const FUNCTION_PREFIX: &str = "_stacky_fun_";
const FUNCTION_BODY_PREFIX: &str = "_stacky_funinstr_";

pub struct X86_64LinuxGnu;

impl CodegenSink for X86_64LinuxGnu {
    fn generate_assembly(&self, program: &Program) -> String {
        let mut out = String::new();

        emit_header(&mut out, program);

        for (name, word) in program.words.iter() {
            let WordKind::Function(function) = &word.kind else {
                continue;
            };

            let _ = writeln!(out, ";; fun {name}");
            let _ = writeln!(out, "{FUNCTION_PREFIX}{}:", word.id);
            // Move the return address onto the call stack.
            emit_lines(
                &mut out,
                &[
                    "pop rax",
                    "mov rbx, [_stacky_callptr]",
                    "mov [_stacky_callstack+rbx*8], rax",
                    "add qword [_stacky_callptr], 1",
                ],
            );

            let prefix = format!("{FUNCTION_BODY_PREFIX}{}_", word.id);
            emit_instructions(&mut out, program, &function.body, name, &prefix);

            // Epilogue: restore the return address and return through the
            // machine stack.
            emit_lines(
                &mut out,
                &[
                    "sub qword [_stacky_callptr], 1",
                    "mov rbx, [_stacky_callptr]",
                    "mov rax, [_stacky_callstack+rbx*8]",
                    "push rax",
                    "ret",
                ],
            );
        }

        out.push_str(indoc! {"
            global _start
            _start:
        "});
        emit_lines(&mut out, &["mov [_stacky_args], rsp"]);
        emit_instructions(&mut out, program, &program.main, "", LABEL_PREFIX);
        emit_lines(
            &mut out,
            &[";; exit syscall", "mov rax, 60", "mov rdi, 0", "syscall"],
        );

        out
    }

    fn assembler_command(&self, input: &Path, output: &Path) -> Command {
        let mut command = Command::new("nasm");
        command.arg("-felf64").arg(input).arg("-o").arg(output);
        command
    }

    fn linker_command(&self, input: &Path, output: &Path) -> Command {
        let mut command = Command::new("ld");
        command.arg("-o").arg(output).arg(input);
        command
    }
}

fn emit_lines(out: &mut String, lines: &[&str]) {
    for line in lines {
        let _ = writeln!(out, "\t{line}");
    }
}

fn emit_header(out: &mut String, program: &Program) {
    out.push_str("BITS 64\n");
    out.push_str("segment .bss\n");
    emit_lines(
        out,
        &[
            "_stacky_callstack: resq 1024",
            "_stacky_callptr:   resq 1",
            "_stacky_args:      resq 1",
        ],
    );

    for (_, word) in program.words.iter() {
        if let WordKind::Array { byte_size } = word.kind {
            let _ = writeln!(out, "\t{SYMBOL_PREFIX}{}: resb {byte_size}", word.id);
        }
    }

    out.push_str("segment .rodata\n");
    for (id, bytes) in program.strings.iter_by_id() {
        let _ = write!(out, "{STRING_PREFIX}{id}: db ");
        for byte in bytes {
            let _ = write!(out, "{byte},");
        }
        out.push_str("0\n");
    }

    out.push_str("segment .text\n");
}

fn emit_instructions(
    out: &mut String,
    program: &Program,
    ops: &[Operation],
    function: &str,
    prefix: &str,
) {
    for (i, op) in ops.iter().enumerate() {
        if program.jump_targets.contains(&(function.to_string(), i)) {
            let _ = writeln!(out, "{prefix}{i}:");
        }

        match &op.kind {
            OpKind::Intrinsic(intrinsic) => emit_intrinsic(out, op, *intrinsic),

            OpKind::CallSymbol { word_id, .. } => {
                emit_lines(out, &[";; call symbol"]);
                let _ = writeln!(out, "\tcall {FUNCTION_PREFIX}{word_id}");
            }

            OpKind::PushSymbol { prefix, id } => {
                emit_lines(out, &[";; push symbol"]);
                let symbol_prefix = match prefix {
                    SymbolPrefix::Function => FUNCTION_PREFIX,
                    SymbolPrefix::String => STRING_PREFIX,
                    SymbolPrefix::Symbol => SYMBOL_PREFIX,
                };
                let _ = writeln!(out, "\tpush {symbol_prefix}{id}");
            }

            OpKind::PushInt { value, .. } => {
                emit_lines(out, &[";; push int"]);
                let _ = writeln!(out, "\tmov rax, {value}");
                out.push_str("\tpush rax\n");
            }

            // Casts only exist for the type checker.
            OpKind::Cast(_) => emit_lines(out, &[";; cast"]),

            OpKind::Return => {
                emit_lines(out, &[";; return"]);
                let _ = writeln!(out, "\tjmp {prefix}{}", ops.len());
            }

            OpKind::End => {
                debug_assert_ne!(op.jump, EMPTY_JUMP);
                emit_lines(out, &[";; end"]);
                if i + 1 != op.jump {
                    let _ = writeln!(out, "\tjmp {prefix}{}", op.jump);
                }
            }

            OpKind::If | OpKind::Do => {
                debug_assert_ne!(op.jump, EMPTY_JUMP);
                emit_lines(out, &[";; if | do", "pop rax", "test rax, rax"]);
                let _ = writeln!(out, "\tjz {prefix}{}", op.jump);
            }

            OpKind::Else => {
                debug_assert_ne!(op.jump, EMPTY_JUMP);
                emit_lines(out, &[";; else"]);
                let _ = writeln!(out, "\tjmp {prefix}{}", op.jump);
            }

            OpKind::While => emit_lines(out, &[";; while"]),
        }
    }

    // Epilogue label; `return` and trailing `end`s jump here.
    let _ = writeln!(out, "{prefix}{}:", ops.len());
}

fn emit_intrinsic(out: &mut String, op: &Operation, intrinsic: Intrinsic) {
    match intrinsic {
        Intrinsic::Add => binary(out, "add", &["add rax, rbx"]),
        Intrinsic::BitwiseAnd => binary(out, "bitwise and", &["and rax, rbx"]),
        Intrinsic::BitwiseOr => binary(out, "bitwise or", &["or rax, rbx"]),
        Intrinsic::BitwiseXor => binary(out, "bitwise xor", &["xor rax, rbx"]),
        Intrinsic::LeftShift => binary(out, "left shift", &["mov rcx, rbx", "sal rax, cl"]),
        Intrinsic::Mul => binary(out, "multiply", &["imul rax, rbx"]),
        Intrinsic::RightShift => binary(out, "right shift", &["mov rcx, rbx", "sar rax, cl"]),
        Intrinsic::Subtract => binary(out, "subtract", &["sub rax, rbx"]),
        Intrinsic::Min => binary(out, "min", &["cmp rax, rbx", "cmova rax, rbx"]),
        Intrinsic::Max => binary(out, "max", &["cmp rax, rbx", "cmovb rax, rbx"]),
        Intrinsic::BooleanOr => binary(
            out,
            "or",
            &["xor rcx, rcx", "or rax, rbx", "setne cl", "mov rax, rcx"],
        ),
        Intrinsic::BooleanAnd => binary(
            out,
            "and",
            &["xor rcx, rcx", "and rax, rbx", "setne cl", "mov rax, rcx"],
        ),

        Intrinsic::Div => division(out, "div", &["push rax"]),
        Intrinsic::DivMod => division(out, "divmod", &["push rdx", "push rax"]),
        Intrinsic::Mod => division(out, "mod", &["push rdx"]),

        Intrinsic::Equal => compare(out, "equal", "e"),
        Intrinsic::Greater => compare(out, "greater", "a"),
        Intrinsic::GreaterEq => compare(out, "greater or equal", "nb"),
        Intrinsic::Less => compare(out, "less", "b"),
        Intrinsic::LessEq => compare(out, "less or equal", "be"),
        Intrinsic::NotEqual => compare(out, "not equal", "ne"),

        Intrinsic::BooleanNegate => emit_lines(
            out,
            &[
                ";; negate",
                "pop rbx",
                "xor rax, rax",
                "test rbx, rbx",
                "sete al",
                "push rax",
            ],
        ),

        Intrinsic::Random32 => emit_lines(
            out,
            &[";; random32", "xor rax, rax", "rdrand eax", "push rax"],
        ),
        Intrinsic::Random64 => emit_lines(out, &[";; random64", "rdrand rax", "push rax"]),

        Intrinsic::Top => emit_lines(out, &[";; top", "push rsp"]),
        Intrinsic::Drop => emit_lines(out, &[";; drop", "add rsp, 8"]),
        Intrinsic::TwoDrop => emit_lines(out, &[";; 2drop", "add rsp, 16"]),
        Intrinsic::Dup => emit_lines(out, &[";; dup", "push qword [rsp]"]),
        Intrinsic::TwoDup => emit_lines(
            out,
            &[";; 2dup", "push qword [rsp+8]", "push qword [rsp+8]"],
        ),
        Intrinsic::Over => emit_lines(out, &[";; over", "push qword [rsp+8]"]),
        Intrinsic::TwoOver => emit_lines(
            out,
            &[";; 2over", "push qword [rsp+24]", "push qword [rsp+24]"],
        ),
        Intrinsic::Tuck => emit_lines(
            out,
            &[
                ";; tuck",
                "pop rax",
                "pop rbx",
                "push rax",
                "push rbx",
                "push rax",
            ],
        ),
        Intrinsic::Rot => emit_lines(
            out,
            &[
                ";; rot",
                "movdqu xmm0, [rsp]",
                "mov rcx, [rsp+16]",
                "mov [rsp], rcx",
                "movups [rsp+8], xmm0",
            ],
        ),
        Intrinsic::Swap => emit_lines(
            out,
            &[";; swap", "pop rax", "pop rbx", "push rax", "push rbx"],
        ),
        Intrinsic::TwoSwap => emit_lines(
            out,
            &[
                ";; 2swap",
                "movdqu xmm0, [rsp]",
                "mov rax, [rsp+16]",
                "mov [rsp], rax",
                "mov rax, [rsp+24]",
                "mov [rsp+8], rax",
                "movups [rsp+16], xmm0",
            ],
        ),

        Intrinsic::Load => {
            let bits = access_width(&op.token.text);
            let _ = writeln!(out, "\t;; load{bits}");
            emit_lines(out, &["pop rax", "xor rbx, rbx"]);
            let _ = writeln!(out, "\tmov {}, [rax]", b_register(bits));
            out.push_str("\tpush rbx\n");
        }
        Intrinsic::Store => {
            let bits = access_width(&op.token.text);
            let _ = writeln!(out, "\t;; store{bits}");
            emit_lines(out, &["pop rbx", "pop rax"]);
            let _ = writeln!(out, "\tmov [rax], {}", b_register(bits));
        }

        Intrinsic::Call => emit_lines(out, &[";; stack call", "pop rax", "call rax"]),

        Intrinsic::Argc => emit_lines(
            out,
            &[";; argc", "mov rax, [_stacky_args]", "push qword [rax]"],
        ),
        Intrinsic::Argv => emit_lines(
            out,
            &[";; argv", "mov rax, [_stacky_args]", "add rax, 8", "push rax"],
        ),

        Intrinsic::Syscall => {
            let count = op
                .token
                .text
                .as_bytes()
                .get(7)
                .filter(|b| b.is_ascii_digit())
                .map(|b| (b - b'0') as usize)
                .unwrap_or(0);
            const REGISTERS: [&str; 7] = ["rax", "rdi", "rsi", "rdx", "r10", "r8", "r9"];

            let _ = writeln!(out, "\t;; syscall{count}");
            for register in REGISTERS.iter().take(count + 1) {
                let _ = writeln!(out, "\tpop {register}");
            }
            out.push_str("\tsyscall\n\tpush rax\n");
        }
    }
}

fn binary(out: &mut String, name: &str, implementation: &[&str]) {
    let _ = writeln!(out, "\t;; {name}");
    emit_lines(out, &["pop rbx", "pop rax"]);
    emit_lines(out, implementation);
    out.push_str("\tpush rax\n");
}

fn division(out: &mut String, name: &str, tail: &[&str]) {
    let _ = writeln!(out, "\t;; {name}");
    emit_lines(out, &["xor rdx, rdx", "pop rbx", "pop rax", "div rbx"]);
    emit_lines(out, tail);
}

fn compare(out: &mut String, name: &str, condition: &str) {
    let _ = writeln!(out, "\t;; {name}");
    emit_lines(out, &["xor rax, rax", "pop rbx", "pop rcx", "cmp rcx, rbx"]);
    let _ = writeln!(out, "\tset{condition} al");
    out.push_str("\tpush rax\n");
}

/// `load8` → 8, `store64` → 64.
fn access_width(text: &str) -> u32 {
    text.trim_start_matches(|c: char| c.is_ascii_alphabetic())
        .parse()
        .unwrap_or(64)
}

fn b_register(bits: u32) -> &'static str {
    match bits {
        8 => "bl",
        16 => "bx",
        32 => "ebx",
        _ => "rbx",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compiler::test_support::{build_program, test_compiler},
        middle::{ir::generate_jump_targets, optimize::optimize},
    };

    fn assemble(source: &str) -> String {
        let compiler = test_compiler();
        let mut program = build_program(&compiler, source).unwrap();
        optimize(&compiler, &mut program);
        generate_jump_targets(&mut program);
        X86_64LinuxGnu.generate_assembly(&program)
    }

    #[test]
    fn strings_are_nul_terminated_in_rodata() {
        let out = assemble("\"hi\" drop");
        assert!(out.contains(&format!("{STRING_PREFIX}0: db 104,105,0")));
    }

    #[test]
    fn arrays_reserve_bss_space() {
        let out = assemble("16 buffer []u32 buffer drop");
        let id = {
            let compiler = test_compiler();
            let program = build_program(&compiler, "16 buffer []u32 buffer drop").unwrap();
            program.words.get("buffer").unwrap().id
        };
        assert!(out.contains(&format!("{SYMBOL_PREFIX}{id}: resb 64")));
    }

    #[test]
    fn functions_get_labeled_bodies_and_an_entry_point() {
        let out = assemble("f fun 1 drop end f");
        assert!(out.contains(";; fun f"));
        assert!(out.contains("global _start"));
        assert!(out.contains("call "));
    }

    #[test]
    fn only_referenced_labels_are_emitted() {
        // The condition flows through random64, so the `if` survives.
        let source = "random64 0 > if random64 drop end 2 drop";
        let out = assemble(source);

        let compiler = test_compiler();
        let mut program = build_program(&compiler, source).unwrap();
        optimize(&compiler, &mut program);
        generate_jump_targets(&mut program);

        assert!(!program.jump_targets.is_empty());
        for (function, jump) in &program.jump_targets {
            assert!(function.is_empty());
            assert!(out.contains(&format!("{LABEL_PREFIX}{jump}:")));
        }
        // Position 0 is never a jump target here, so no label for it.
        assert!(!out.contains(&format!("{LABEL_PREFIX}0:")));
    }

    #[test]
    fn conditionals_test_and_jump() {
        let out = assemble("random64 0 > if random64 drop end 2 drop");
        assert!(out.contains("test rax, rax"));
        assert!(out.contains("jz "));
    }

    #[test]
    fn instructions_are_tab_indented_under_labels() {
        let out = assemble("f fun 1 drop end f");
        assert!(out.contains("\tpop rax\n"));
        assert!(out.contains("\tcall "));
    }
}
