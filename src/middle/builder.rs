//! Converts the token stream into operation lists.
//!
//! The builder scans backwards: when it sees an `end` it walks back to the
//! matching opener (`if`, `while`, `fun`, `&fun`), and if the opener starts
//! a function it recursively builds that function's body from the enclosed
//! span, consuming the preceding name word. Because the scan runs backwards
//! the collected body is reversed before crossreferencing.

use std::collections::BTreeSet;

use crate::{
    compiler::Compiler,
    frontend::{escape, intern::intern_str, Keyword, Token, TokenKind},
    middle::{
        crossref::crossreference,
        definitions::anonymous_function_name,
        ir::{OpKind, Operation, Program, SymbolPrefix, WordKind, Words},
        ty::{StackEffect, Type, TypeKind},
    },
    report::CResult,
};

/// Builds the top-level body and, through the backwards scan, every function
/// body it encounters.
pub fn build_operations(
    compiler: &Compiler,
    tokens: &[Token],
    program: &mut Program,
) -> CResult<()> {
    let mut body = Vec::new();
    let mut i = tokens.len() as isize - 1;

    while i >= 0 {
        let token = &tokens[i as usize];
        match token.kind {
            // Definition operands were consumed by the registrar; skip the
            // keyword, the count/value token, and the name token.
            TokenKind::Keyword(Keyword::Array | Keyword::Constant) => i -= 2,

            TokenKind::Keyword(Keyword::End) => {
                i = process_end(
                    compiler,
                    tokens,
                    i as usize,
                    &mut body,
                    &mut program.words,
                    &mut program.undefined_words,
                    false,
                )?;
            }

            _ => translate_operation(
                compiler,
                token,
                &mut body,
                &program.words,
                &mut program.undefined_words,
            )?,
        }
        i -= 1;
    }

    body.reverse();
    crossreference(compiler, &mut body)?;
    program.main = body;
    Ok(())
}

/// Builds one function body from the span between its `fun` and `end`.
fn build_function(
    compiler: &Compiler,
    span: &[Token],
    name: &str,
    words: &mut Words,
    undefined: &mut BTreeSet<String>,
) -> CResult<()> {
    let mut body = Vec::new();
    let mut effect: Option<StackEffect> = None;
    let mut dynamic = false;
    let mut i = span.len() as isize - 1;

    while i >= 0 {
        let token = &span[i as usize];
        match token.kind {
            // Functions do not introduce a scope; a definition inside one
            // would silently be global, which is rejected instead.
            TokenKind::Keyword(Keyword::Array | Keyword::Constant) => {
                compiler.reporter.error_at(
                    token.location,
                    "definitions of arrays or constants are not allowed inside function bodies",
                );
            }

            TokenKind::Keyword(Keyword::Dynamic) => {
                dynamic = true;
                if i != 0 {
                    return Err(compiler
                        .reporter
                        .fatal_at(token.location, "`dyn` must directly follow the `fun` keyword"));
                }
            }

            TokenKind::Keyword(Keyword::StackEffectDefinition) => {
                effect = Some(parse_stack_effect(compiler, &span[..i as usize])?);
                i = 0;
            }

            TokenKind::Keyword(Keyword::End) => {
                i = process_end(compiler, span, i as usize, &mut body, words, undefined, true)?;
            }

            _ => translate_operation(compiler, token, &mut body, words, undefined)?,
        }
        i -= 1;
    }

    body.reverse();

    let function_name = intern_str(name);
    for op in &mut body {
        op.location = op.location.with_function(function_name);
    }

    crossreference(compiler, &mut body)?;

    match words.get_mut(name).map(|word| &mut word.kind) {
        Some(WordKind::Function(function)) => {
            function.body = body;
            function.effect = effect;
            function.dynamic = dynamic;
        }
        _ => {
            return Err(compiler
                .reporter
                .compiler_bug(format!("function `{name}` was never registered")));
        }
    }

    Ok(())
}

/// Handles an `end` during a backwards scan: finds the matching opener,
/// recurses into function bodies, and returns the index the scan should
/// continue from.
fn process_end(
    compiler: &Compiler,
    tokens: &[Token],
    end_index: usize,
    body: &mut Vec<Operation>,
    words: &mut Words,
    undefined: &mut BTreeSet<String>,
    in_function: bool,
) -> CResult<isize> {
    let block_start = find_block_start(compiler, tokens, end_index)?;
    let opener = &tokens[block_start];

    match opener.kind {
        TokenKind::Keyword(Keyword::Function) => {
            if block_start == 0 || tokens[block_start - 1].kind != TokenKind::Word {
                return Err(compiler
                    .reporter
                    .fatal_at(opener.location, "a function definition must be preceded by its name"));
            }

            if in_function {
                compiler.reporter.error_at(
                    opener.location,
                    "function definitions are not allowed inside function bodies",
                );
            }

            let name = tokens[block_start - 1].text.clone();
            build_function(
                compiler,
                &tokens[block_start + 1..end_index],
                &name,
                words,
                undefined,
            )?;

            // Skip the function name word as well.
            Ok(block_start as isize - 1)
        }

        TokenKind::AnonFunction(index) => {
            let name = anonymous_function_name(index);
            let Some(word) = words.get(&name) else {
                return Err(compiler
                    .reporter
                    .compiler_bug_at(opener.location, "anonymous function was never registered"));
            };

            let mut op = Operation::new(
                OpKind::PushSymbol {
                    prefix: SymbolPrefix::Function,
                    id: word.id,
                },
                opener.clone(),
            );
            op.location = opener.location;
            body.push(op);

            build_function(
                compiler,
                &tokens[block_start + 1..end_index],
                &name,
                words,
                undefined,
            )?;

            Ok(block_start as isize)
        }

        _ => {
            body.push(Operation::new(OpKind::End, tokens[end_index].clone()));
            Ok(end_index as isize)
        }
    }
}

/// Walks backwards from an `end` to its opener, counting nested `end`s
/// against `fun`/`&fun`/`if`/`while` openers.
fn find_block_start(compiler: &Compiler, tokens: &[Token], end_index: usize) -> CResult<usize> {
    let mut depth = 1u32;
    let mut j = end_index;

    while j > 0 {
        j -= 1;
        match tokens[j].kind {
            TokenKind::Keyword(Keyword::End) => depth += 1,
            TokenKind::Keyword(Keyword::Function | Keyword::If | Keyword::While)
            | TokenKind::AnonFunction(_) => {
                depth -= 1;
                if depth == 0 {
                    return Ok(j);
                }
            }
            _ => {}
        }
    }

    Err(compiler
        .reporter
        .fatal_at(tokens[end_index].location, "unexpected `end`"))
}

/// Stack effect declaration: the tokens before an `is`, split by `--` into
/// inputs and outputs.
fn parse_stack_effect(compiler: &Compiler, tokens: &[Token]) -> CResult<StackEffect> {
    let mut effect = StackEffect::default();
    let mut divider_seen = false;

    for token in tokens {
        match token.kind {
            TokenKind::Keyword(Keyword::Typename) => {
                let Some(ty) = Type::from_typename(token) else {
                    return Err(compiler
                        .reporter
                        .compiler_bug_at(token.location, "unparsable typename token"));
                };
                if divider_seen {
                    effect.output.push(ty);
                } else {
                    effect.input.push(ty);
                }
            }
            TokenKind::Keyword(Keyword::StackEffectDivider) => {
                if divider_seen {
                    return Err(compiler
                        .reporter
                        .fatal_at(token.location, "a stack effect may contain only one `--`"));
                }
                divider_seen = true;
            }
            TokenKind::Keyword(Keyword::StackEffectDefinition) => {
                return Err(compiler
                    .reporter
                    .fatal_at(token.location, "nested stack effect definitions are not allowed"));
            }
            TokenKind::Keyword(Keyword::Dynamic) => {
                return Err(compiler.reporter.fatal_at(
                    token.location,
                    "a function cannot both declare a stack effect and be `dyn`",
                ));
            }
            TokenKind::Integer { .. } => {
                return Err(compiler.reporter.fatal_at(
                    token.location,
                    "type variables in stack effect declarations are not implemented",
                ));
            }
            _ => {
                return Err(compiler.reporter.fatal_at(
                    token.location,
                    "only type names may appear in a stack effect declaration",
                ));
            }
        }
    }

    Ok(effect)
}

/// Translates one non-structural token into an operation.
fn translate_operation(
    compiler: &Compiler,
    token: &Token,
    body: &mut Vec<Operation>,
    words: &Words,
    undefined: &mut BTreeSet<String>,
) -> CResult<()> {
    match &token.kind {
        TokenKind::AddressOf => {
            let name = &token.text[1..];
            match words.get(name) {
                Some(word) => body.push(Operation::new(
                    OpKind::PushSymbol {
                        prefix: SymbolPrefix::Function,
                        id: word.id,
                    },
                    token.clone(),
                )),
                None => report_undefined(compiler, token, name, undefined),
            }
        }

        TokenKind::Char => {
            let value = decode_char_literal(compiler, token)?;
            body.push(Operation::new(
                OpKind::PushInt {
                    value,
                    ty: TypeKind::Int,
                },
                token.clone(),
            ));
        }

        TokenKind::Integer { value, .. } => {
            body.push(Operation::new(
                OpKind::PushInt {
                    value: *value,
                    ty: TypeKind::Int,
                },
                token.clone(),
            ));
        }

        TokenKind::Str { id } => {
            let Some(id) = id else {
                return Err(compiler
                    .reporter
                    .compiler_bug_at(token.location, "string literal was never interned"));
            };
            body.push(Operation::new(
                OpKind::PushSymbol {
                    prefix: SymbolPrefix::String,
                    id: *id,
                },
                token.clone(),
            ));
        }

        TokenKind::Word => match words.get(&token.text) {
            None => report_undefined(compiler, token, &token.text, undefined),
            Some(word) => match &word.kind {
                WordKind::Intrinsic(intrinsic) => {
                    body.push(Operation::new(OpKind::Intrinsic(*intrinsic), token.clone()));
                }
                WordKind::Integer(value) => {
                    body.push(Operation::new(
                        OpKind::PushInt {
                            value: *value,
                            ty: TypeKind::Int,
                        },
                        token.clone(),
                    ));
                }
                WordKind::Array { .. } => {
                    body.push(Operation::new(
                        OpKind::PushSymbol {
                            prefix: SymbolPrefix::Symbol,
                            id: word.id,
                        },
                        token.clone(),
                    ));
                }
                WordKind::Function(_) => {
                    body.push(Operation::new(
                        OpKind::CallSymbol {
                            name: token.text.clone(),
                            word_id: word.id,
                        },
                        token.clone(),
                    ));
                }
            },
        },

        TokenKind::Keyword(keyword) => match keyword {
            Keyword::If => body.push(Operation::new(OpKind::If, token.clone())),
            Keyword::Else => body.push(Operation::new(OpKind::Else, token.clone())),
            Keyword::While => body.push(Operation::new(OpKind::While, token.clone())),
            Keyword::Do => body.push(Operation::new(OpKind::Do, token.clone())),
            Keyword::Return => body.push(Operation::new(OpKind::Return, token.clone())),

            Keyword::Bool => {
                body.push(Operation::new(
                    OpKind::PushInt {
                        value: u64::from(token.text.starts_with('t')),
                        ty: TypeKind::Bool,
                    },
                    token.clone(),
                ));
            }

            Keyword::Typename => {
                let Some(ty) = Type::from_typename(token) else {
                    return Err(compiler
                        .reporter
                        .compiler_bug_at(token.location, "unparsable typename token"));
                };
                body.push(Operation::new(OpKind::Cast(ty.kind), token.clone()));
            }

            Keyword::Dynamic => {
                compiler.reporter.error_at(
                    token.location,
                    "`dyn` is only allowed inside a function definition",
                );
            }

            Keyword::StackEffectDefinition | Keyword::StackEffectDivider => {
                compiler.reporter.error_at(
                    token.location,
                    "stack effect declarations are only allowed inside a function definition",
                );
            }

            Keyword::Function => {
                return Err(compiler
                    .reporter
                    .fatal_at(token.location, "expected `end` to close this `fun`"));
            }

            Keyword::Include | Keyword::Import => {
                return Err(compiler.reporter.compiler_bug_at(
                    token.location,
                    "includes should have been resolved before IR construction",
                ));
            }

            Keyword::End | Keyword::Array | Keyword::Constant => {
                return Err(compiler.reporter.compiler_bug_at(
                    token.location,
                    "structural keyword reached literal translation",
                ));
            }
        },

        TokenKind::AnonFunction(_) => {
            return Err(compiler
                .reporter
                .fatal_at(token.location, "expected `end` to close this `&fun`"));
        }
    }

    Ok(())
}

/// Packs the decoded bytes of a char literal little-endian into a u64.
fn decode_char_literal(compiler: &Compiler, token: &Token) -> CResult<u64> {
    let payload = &token.text[1..token.text.len() - 1];
    let mut value: u64 = 0;
    let mut offset = 0u32;
    let mut overflowed = false;

    escape::decode(&compiler.reporter, token.location, payload, &mut |byte| {
        if offset >= 8 {
            overflowed = true;
            return false;
        }
        value |= (byte as u64) << (8 * offset);
        offset += 1;
        true
    })?;

    if overflowed {
        compiler.reporter.error_at(
            token.location,
            "character literals cannot be longer than 8 bytes on this platform",
        );
    }

    Ok(value)
}

fn report_undefined(
    compiler: &Compiler,
    token: &Token,
    name: &str,
    undefined: &mut BTreeSet<String>,
) {
    if undefined.insert(name.to_string()) {
        compiler
            .reporter
            .error_at(token.location, format!("word `{name}` has not been defined"));
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::compiler::test_support::{build_program, test_compiler};

    #[test]
    fn literals_translate_to_pushes() {
        let compiler = test_compiler();
        let program = build_program(&compiler, "42 true 'A' \"hi\" drop").unwrap();

        let kinds: Vec<_> = program.main.iter().map(|op| op.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                OpKind::PushInt {
                    value: 42,
                    ty: TypeKind::Int
                },
                OpKind::PushInt {
                    value: 1,
                    ty: TypeKind::Bool
                },
                OpKind::PushInt {
                    value: 0x41,
                    ty: TypeKind::Int
                },
                OpKind::PushSymbol {
                    prefix: SymbolPrefix::String,
                    id: 0
                },
                OpKind::Intrinsic(crate::middle::ir::Intrinsic::Drop),
            ],
        );
    }

    #[test]
    fn char_literals_pack_little_endian() {
        let compiler = test_compiler();
        let program = build_program(&compiler, "'ab' drop").unwrap();
        match program.main[0].kind {
            OpKind::PushInt { value, .. } => {
                assert_eq!(value, (b'a' as u64) | ((b'b' as u64) << 8));
            }
            ref other => panic!("expected push, got {other:?}"),
        }
    }

    #[test]
    fn overlong_char_literal_is_an_error() {
        let compiler = test_compiler();
        let result = build_program(&compiler, "'abcdefghi' drop");
        assert!(result.is_err());
        assert!(compiler
            .reporter
            .messages()
            .iter()
            .any(|m| m.contains("longer than 8 bytes")));
    }

    #[test]
    fn function_bodies_are_split_out_of_main() {
        let compiler = test_compiler();
        let program = build_program(&compiler, "add-two fun 2 + end 5 add-two drop").unwrap();

        let function = program.function("add-two").unwrap();
        assert_eq!(function.body.len(), 2);
        assert!(matches!(
            function.body[1].kind,
            OpKind::Intrinsic(crate::middle::ir::Intrinsic::Add)
        ));
        // Function ops carry the enclosing function's name.
        assert_eq!(function.body[0].location.function, Some("add-two"));

        let kinds: Vec<_> = program.main.iter().map(|op| op.kind.clone()).collect();
        assert_eq!(kinds.len(), 3);
        assert!(matches!(kinds[1], OpKind::CallSymbol { ref name, .. } if name == "add-two"));
    }

    #[test]
    fn stack_effect_declaration_is_recorded() {
        let compiler = test_compiler();
        let program = build_program(&compiler, "plus fun u64 u64 -- u64 is + end").unwrap();

        let effect = program.function("plus").unwrap().effect.as_ref().unwrap();
        assert_eq!(effect.to_string(), "u64 u64 -- u64");
    }

    #[test]
    fn dyn_marks_a_function_dynamic() {
        let compiler = test_compiler();
        let program = build_program(&compiler, "poly fun dyn dup end").unwrap();
        assert!(program.function("poly").unwrap().dynamic);
    }

    #[test]
    fn dyn_with_stack_effect_is_fatal() {
        let compiler = test_compiler();
        assert!(build_program(&compiler, "bad fun dyn u64 -- u64 is dup end").is_err());
    }

    #[test]
    fn anonymous_function_pushes_its_symbol() {
        let compiler = test_compiler();
        let program = build_program(&compiler, "&fun 1 drop end drop").unwrap();

        assert!(matches!(
            program.main[0].kind,
            OpKind::PushSymbol {
                prefix: SymbolPrefix::Function,
                ..
            }
        ));
        let anonymous = program
            .function(&anonymous_function_name(0))
            .expect("anonymous function registered");
        assert_eq!(anonymous.body.len(), 2);
    }

    #[test]
    fn address_of_resolves_to_function_id() {
        let compiler = test_compiler();
        let program = build_program(&compiler, "callee fun 1 drop end &callee drop").unwrap();

        let id = program.words.get("callee").unwrap().id;
        assert!(matches!(
            program.main[0].kind,
            OpKind::PushSymbol {
                prefix: SymbolPrefix::Function,
                id: pushed,
            } if pushed == id
        ));
    }

    #[test]
    fn undefined_word_is_a_nonfatal_error_reported_once() {
        let compiler = test_compiler();
        let result = build_program(&compiler, "nope nope nope");
        assert!(result.is_err());

        let errors: Vec<_> = compiler
            .reporter
            .messages()
            .into_iter()
            .filter(|m| m.contains("has not been defined"))
            .collect();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn definitions_inside_function_bodies_are_rejected() {
        let compiler = test_compiler();
        let result = build_program(&compiler, "f fun 1 size constant end");
        assert!(result.is_err());
        assert!(compiler
            .reporter
            .messages()
            .iter()
            .any(|m| m.contains("not allowed inside function bodies")));
    }

    #[test]
    fn unbalanced_end_is_fatal() {
        let compiler = test_compiler();
        assert!(build_program(&compiler, "1 end").is_err());
    }

    #[test]
    fn constants_fold_into_pushes() {
        let compiler = test_compiler();
        let program = build_program(&compiler, "10 ten constant ten drop").unwrap();
        assert!(matches!(
            program.main[0].kind,
            OpKind::PushInt { value: 10, .. }
        ));
    }
}
