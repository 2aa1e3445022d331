//! Links the endpoints of block-structured control flow.
//!
//! One forward pass with a stack of open-block indices. After it, every
//! `if`/`else`/`do`/`end` has a jump index: `if` jumps past its `else` (or
//! to its `end`), `else` jumps to the `end`, `do` jumps one past the `end`,
//! and a loop `end` jumps back to its `while`.

use crate::{
    compiler::Compiler,
    middle::ir::{OpKind, Operation},
    report::CResult,
};

pub fn crossreference(compiler: &Compiler, ops: &mut [Operation]) -> CResult<()> {
    let mut stack: Vec<usize> = Vec::new();

    for i in 0..ops.len() {
        match ops[i].kind {
            OpKind::While | OpKind::If => stack.push(i),

            OpKind::Do => {
                let Some(&top) = stack.last() else {
                    return Err(compiler
                        .reporter
                        .fatal_at(ops[i].location, "`do` without matching `while`"));
                };
                if ops[top].kind != OpKind::While {
                    return Err(compiler
                        .reporter
                        .fatal_at(ops[i].location, "`do` without matching `while`"));
                }

                ops[i].jump = top;
                stack.pop();
                stack.push(i);
            }

            OpKind::Else => {
                let Some(&top) = stack.last() else {
                    return Err(compiler
                        .reporter
                        .fatal_at(ops[i].location, "`else` without matching `if`"));
                };
                if ops[top].kind != OpKind::If {
                    return Err(compiler
                        .reporter
                        .fatal_at(ops[i].location, "`else` without matching `if`"));
                }

                ops[top].jump = i + 1;
                stack.pop();
                stack.push(i);
            }

            OpKind::End => {
                let Some(&top) = stack.last() else {
                    return Err(compiler.reporter.compiler_bug_at(
                        ops[i].location,
                        "crossreference found an `end` the builder did not match",
                    ));
                };

                match ops[top].kind {
                    OpKind::If | OpKind::Else => {
                        ops[top].jump = i;
                        stack.pop();
                        ops[i].jump = i + 1;
                    }
                    OpKind::Do => {
                        ops[i].jump = ops[top].jump;
                        ops[top].jump = i + 1;
                        stack.pop();
                    }
                    _ => {
                        compiler.reporter.error_at(
                            ops[i].location,
                            "`end` can only close `while .. do` and `if` blocks",
                        );
                        return Ok(());
                    }
                }
            }

            _ => {}
        }
    }

    if let Some(&top) = stack.last() {
        let op = &ops[top];
        let message = match op.kind {
            OpKind::If => "expected matching `else` or `end` for this `if`",
            OpKind::Else => "expected matching `end` for this `else`",
            OpKind::While => "expected matching `do` for this `while`",
            OpKind::Do => "expected matching `end` for this `do`",
            _ => "unterminated block",
        };
        compiler.reporter.error_at(op.location, message);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        compiler::test_support::{build_program, test_compiler},
        middle::ir::{OpKind, Operation, Program},
    };

    fn main_ops(source: &str) -> Vec<Operation> {
        let compiler = test_compiler();
        let program: Program = build_program(&compiler, source).unwrap();
        program.main
    }

    fn position_of(ops: &[Operation], kind: &OpKind) -> usize {
        ops.iter().position(|op| op.kind == *kind).unwrap()
    }

    #[test]
    fn if_else_end_reciprocity() {
        let ops = main_ops("true if 1 else 2 end drop");

        let if_at = position_of(&ops, &OpKind::If);
        let else_at = position_of(&ops, &OpKind::Else);
        let end_at = position_of(&ops, &OpKind::End);

        // `if` jumps one past its `else`, whose jump points at the `end`.
        assert_eq!(ops[if_at].jump, else_at + 1);
        assert_eq!(ops[else_at].jump, end_at);
        assert_eq!(ops[end_at].jump, end_at + 1);
    }

    #[test]
    fn if_without_else() {
        let ops = main_ops("true if 1 drop end");

        let if_at = position_of(&ops, &OpKind::If);
        let end_at = position_of(&ops, &OpKind::End);

        assert_eq!(ops[if_at].jump, end_at);
        assert_eq!(ops[end_at].jump, end_at + 1);
    }

    #[test]
    fn while_do_end_reciprocity() {
        let ops = main_ops("5 while dup 0 > do 1 - end drop");

        let while_at = position_of(&ops, &OpKind::While);
        let do_at = position_of(&ops, &OpKind::Do);
        let end_at = position_of(&ops, &OpKind::End);

        assert_eq!(ops[do_at].jump, end_at + 1);
        assert_eq!(ops[end_at].jump, while_at);
    }

    #[test]
    fn nested_blocks_link_independently() {
        let ops = main_ops("true if true if 1 drop end else 2 drop end");

        let outer_if = position_of(&ops, &OpKind::If);
        let inner_if = ops
            .iter()
            .enumerate()
            .skip(outer_if + 1)
            .find(|(_, op)| op.kind == OpKind::If)
            .map(|(i, _)| i)
            .unwrap();
        let inner_end = ops[inner_if].jump;
        assert_eq!(ops[inner_end].kind, OpKind::End);

        let else_at = position_of(&ops, &OpKind::Else);
        assert_eq!(ops[outer_if].jump, else_at + 1);
    }

    #[test]
    fn do_without_while_is_fatal() {
        let compiler = test_compiler();
        assert!(build_program(&compiler, "true do end").is_err());
    }

    #[test]
    fn unterminated_while_is_reported() {
        let compiler = test_compiler();
        // The builder matches `end`s; a `while` with no `do` survives to the
        // crossreferencer which reports it as unterminated.
        let result = build_program(&compiler, "while true if 1 drop end");
        assert!(result.is_err() || compiler.reporter.compilation_failed());
    }
}
