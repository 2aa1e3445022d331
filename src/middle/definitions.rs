//! Registration of every named entity before IR construction.
//!
//! Intrinsics are seeded into the word table first so user definitions can
//! shadow them (with a warning). A single forward pass over the tokens then
//! records arrays, constants, and functions; `&fun` keywords are numbered in
//! token order and rewritten so the IR builder can resolve the generated
//! word without re-counting.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;

use crate::{
    compiler::Compiler,
    frontend::{Keyword, Location, Token, TokenKind},
    middle::ir::{Function, Intrinsic, WordKind, Words},
    report::CResult,
};

pub const ANONYMOUS_FUNCTION_PREFIX: &str = "_stacky_anonymous_";

pub fn anonymous_function_name(index: u32) -> String {
    format!("{ANONYMOUS_FUNCTION_PREFIX}{index}")
}

/// Every intrinsic word, including the sized load/store and syscall
/// families which share one tag and are told apart by their spelling.
static INTRINSIC_WORDS: Lazy<BTreeMap<&'static str, Intrinsic>> = Lazy::new(|| {
    BTreeMap::from([
        ("!", Intrinsic::BooleanNegate),
        ("!=", Intrinsic::NotEqual),
        ("*", Intrinsic::Mul),
        ("+", Intrinsic::Add),
        ("-", Intrinsic::Subtract),
        ("2drop", Intrinsic::TwoDrop),
        ("2dup", Intrinsic::TwoDup),
        ("2over", Intrinsic::TwoOver),
        ("2swap", Intrinsic::TwoSwap),
        ("<", Intrinsic::Less),
        ("<<", Intrinsic::LeftShift),
        ("<=", Intrinsic::LessEq),
        ("=", Intrinsic::Equal),
        (">", Intrinsic::Greater),
        (">=", Intrinsic::GreaterEq),
        (">>", Intrinsic::RightShift),
        ("and", Intrinsic::BooleanAnd),
        ("argc", Intrinsic::Argc),
        ("argv", Intrinsic::Argv),
        ("bit-and", Intrinsic::BitwiseAnd),
        ("bit-or", Intrinsic::BitwiseOr),
        ("bit-xor", Intrinsic::BitwiseXor),
        ("call", Intrinsic::Call),
        ("div", Intrinsic::Div),
        ("divmod", Intrinsic::DivMod),
        ("drop", Intrinsic::Drop),
        ("dup", Intrinsic::Dup),
        ("load16", Intrinsic::Load),
        ("load32", Intrinsic::Load),
        ("load64", Intrinsic::Load),
        ("load8", Intrinsic::Load),
        ("max", Intrinsic::Max),
        ("min", Intrinsic::Min),
        ("mod", Intrinsic::Mod),
        ("or", Intrinsic::BooleanOr),
        ("over", Intrinsic::Over),
        ("random32", Intrinsic::Random32),
        ("random64", Intrinsic::Random64),
        ("rot", Intrinsic::Rot),
        ("store16", Intrinsic::Store),
        ("store32", Intrinsic::Store),
        ("store64", Intrinsic::Store),
        ("store8", Intrinsic::Store),
        ("swap", Intrinsic::Swap),
        ("syscall0", Intrinsic::Syscall),
        ("syscall1", Intrinsic::Syscall),
        ("syscall2", Intrinsic::Syscall),
        ("syscall3", Intrinsic::Syscall),
        ("syscall4", Intrinsic::Syscall),
        ("syscall5", Intrinsic::Syscall),
        ("syscall6", Intrinsic::Syscall),
        ("top", Intrinsic::Top),
        ("tuck", Intrinsic::Tuck),
    ])
});

pub fn register_intrinsics(words: &mut Words) {
    for (name, intrinsic) in INTRINSIC_WORDS.iter() {
        words.define(*name, WordKind::Intrinsic(*intrinsic), Location::builtin());
    }
}

pub fn register_definitions(
    compiler: &Compiler,
    tokens: &mut [Token],
    words: &mut Words,
) -> CResult<()> {
    let mut anonymous_count: u32 = 0;

    for i in 0..tokens.len() {
        let Some(keyword) = tokens[i].keyword() else {
            continue;
        };

        match keyword {
            Keyword::Function => {
                if tokens[i].text.starts_with('&') {
                    let name = anonymous_function_name(anonymous_count);
                    words.define(
                        name,
                        WordKind::Function(Function::default()),
                        tokens[i].location,
                    );
                    tokens[i].kind = TokenKind::AnonFunction(anonymous_count);
                    anonymous_count += 1;
                } else {
                    if i == 0 || tokens[i - 1].kind != TokenKind::Word {
                        return Err(compiler.reporter.fatal_at(
                            tokens[i].location,
                            "a function definition must be preceded by its name",
                        ));
                    }

                    let name = tokens[i - 1].text.clone();
                    warn_if_redefined(compiler, words, &tokens[i], &name);
                    words.define(
                        name,
                        WordKind::Function(Function::default()),
                        tokens[i].location,
                    );
                }
            }

            // `N name constant`: the name directly precedes the keyword,
            // the value precedes the name.
            Keyword::Constant => {
                if i < 2 || tokens[i - 1].kind != TokenKind::Word {
                    return Err(compiler.reporter.fatal_at(
                        tokens[i].location,
                        "`constant` must be preceded by a name",
                    ));
                }
                let TokenKind::Integer { value, .. } = tokens[i - 2].kind else {
                    return Err(compiler.reporter.fatal_at(
                        tokens[i].location,
                        "`constant` must be preceded by an integer value",
                    ));
                };

                let name = tokens[i - 1].text.clone();
                warn_if_redefined(compiler, words, &tokens[i], &name);
                words.define(name, WordKind::Integer(value), tokens[i - 1].location);
            }

            // `N name []u8` and friends, N elements of the keyword's width.
            Keyword::Array => {
                if i < 2 || tokens[i - 1].kind != TokenKind::Word {
                    return Err(compiler.reporter.fatal_at(
                        tokens[i].location,
                        format!("`{}` must be preceded by a name", tokens[i].text),
                    ));
                }

                let count = match &tokens[i - 2].kind {
                    TokenKind::Integer { value, .. } => *value,
                    TokenKind::Word => match words.get(&tokens[i - 2].text) {
                        Some(word) => match word.kind {
                            WordKind::Integer(value) => value,
                            _ => {
                                element_count_error(compiler, &tokens[i]);
                                0
                            }
                        },
                        None => {
                            element_count_error(compiler, &tokens[i]);
                            0
                        }
                    },
                    _ => {
                        element_count_error(compiler, &tokens[i]);
                        0
                    }
                };

                // The 4th character of the keyword selects the element
                // width: []byte/[]u8 → 1, []u16 → 2, []u32 → 4,
                // []u64/[]usize → 8.
                let element_bytes = match tokens[i].text.as_bytes().get(3) {
                    Some(b'y') | Some(b'8') => 1,
                    Some(b'1') => 2,
                    Some(b'3') => 4,
                    Some(b's') | Some(b'6') => 8,
                    _ => {
                        return Err(compiler.reporter.compiler_bug_at(
                            tokens[i].location,
                            format!("unrecognized array keyword `{}`", tokens[i].text),
                        ));
                    }
                };

                let name = tokens[i - 1].text.clone();
                warn_if_redefined(compiler, words, &tokens[i], &name);
                words.define(
                    name,
                    WordKind::Array {
                        byte_size: count * element_bytes,
                    },
                    tokens[i - 1].location,
                );
            }

            _ => {}
        }
    }

    Ok(())
}

fn warn_if_redefined(compiler: &Compiler, words: &Words, token: &Token, name: &str) {
    if compiler.options.warn_redefinitions && words.contains(name) {
        compiler
            .reporter
            .warning_at(token.location, format!("`{name}` has already been defined"));
    }
}

fn element_count_error(compiler: &Compiler, token: &Token) {
    compiler.reporter.error_at(
        token.location,
        format!("`{}` must be preceded by an integer", token.text),
    );
}
