//! Stack-polymorphic type checking.
//!
//! Each body (the top-level one and every function with a declared effect)
//! is simulated symbolically over a typestack. The checker is a worklist of
//! `(typestack, instruction pointer)` states rather than a recursion:
//!
//!   * `if` consumes a `bool` and forks a state at its false target;
//!   * `else` and `end` follow their recorded jumps;
//!   * the first time a state reaches a `do` the pre-loop typestack is
//!     recorded and the loop-exit state is forked; the second time the
//!     typestack must match the recording exactly (loop invariance);
//!   * an `end` reached by a second state compares the branch stacks;
//!   * `return` and falling off the end verify against the declared output.
//!
//! Operations are described by one or more alternative stack effects with
//! type variables. An operation applies the first alternative that unifies
//! with the stack top; if none does, the best-scoring alternative shapes the
//! diagnostics.

use hashbrown::HashMap;

use crate::{
    compiler::Compiler,
    frontend::Location,
    middle::{
        ir::{Intrinsic, OpKind, Operation, Program, WordKind},
        ty::{Type, TypeKind, Typestack},
    },
    report::{CResult, Fatal},
};

/// Dynamic callees are re-checked at every call site; this bounds
/// self-recursive dynamic calls which would otherwise never terminate.
const MAX_DYNAMIC_CALL_DEPTH: usize = 64;

pub fn typecheck_program(compiler: &Compiler, program: &Program) -> CResult<()> {
    // The top-level body starts and must end with an empty stack.
    check_body(
        compiler,
        program,
        &program.main,
        Vec::new(),
        Verifier::Declared {
            output: &[],
            location: None,
        },
        0,
    )?;

    for (_, word) in program.words.iter() {
        let WordKind::Function(function) = &word.kind else {
            continue;
        };
        // Dynamic functions are checked at their call sites with the
        // caller's typestack; undeclared ones are rejected when called.
        if function.dynamic {
            continue;
        }
        let Some(effect) = &function.effect else {
            continue;
        };

        let initial = effect
            .input
            .iter()
            .map(|ty| Type::new(ty.kind, word.location))
            .collect();
        check_body(
            compiler,
            program,
            &function.body,
            initial,
            Verifier::Declared {
                output: &effect.output,
                location: Some(word.location),
            },
            0,
        )?;
    }

    Ok(())
}

/// How the typestack of a finished simulation path is validated.
enum Verifier<'a> {
    /// Match against a declared output (a function's effect, or the empty
    /// stack for the top-level body).
    Declared {
        output: &'a [Type],
        location: Option<Location>,
    },
    /// Adopt the first path's result and require every further path to
    /// match it. Used when checking dynamic callees.
    Adopt,
}

struct State {
    stack: Typestack,
    ip: usize,
}

/// One alternative of an operation's stack effect.
struct Effect {
    input: Vec<TypeKind>,
    output: Vec<TypeKind>,
}

fn eff(input: &[TypeKind], output: &[TypeKind]) -> Effect {
    Effect {
        input: input.to_vec(),
        output: output.to_vec(),
    }
}

fn check_body(
    compiler: &Compiler,
    program: &Program,
    ops: &[Operation],
    initial: Typestack,
    verifier: Verifier<'_>,
    depth: usize,
) -> CResult<Typestack> {
    let mut checker = BodyChecker {
        compiler,
        program,
        ops,
        states: vec![State {
            stack: initial,
            ip: 0,
        }],
        do_entries: HashMap::new(),
        end_merges: HashMap::new(),
        verifier,
        adopted: None,
        depth,
    };

    checker.run()?;

    Ok(checker.adopted.unwrap_or_default())
}

struct BodyChecker<'a> {
    compiler: &'a Compiler,
    program: &'a Program,
    ops: &'a [Operation],
    states: Vec<State>,
    /// Pre-loop typestack recorded at each `do`.
    do_entries: HashMap<usize, Typestack>,
    /// Typestack of the first state that passed each `end`.
    end_merges: HashMap<usize, Typestack>,
    verifier: Verifier<'a>,
    adopted: Option<Typestack>,
    depth: usize,
}

enum Flow {
    Continue(usize),
    Terminate,
}

impl<'a> BodyChecker<'a> {
    fn run(&mut self) -> CResult<()> {
        while let Some(mut state) = self.states.pop() {
            loop {
                if state.ip >= self.ops.len() {
                    self.verify_exit(&state.stack, None)?;
                    break;
                }

                match self.step(&mut state)? {
                    Flow::Continue(next) => state.ip = next,
                    Flow::Terminate => break,
                }
            }
        }

        Ok(())
    }

    fn step(&mut self, state: &mut State) -> CResult<Flow> {
        let op = &self.ops[state.ip];
        let ip = state.ip;

        match &op.kind {
            OpKind::PushSymbol { .. } => {
                state.stack.push(Type::new(TypeKind::Pointer, op.location));
            }

            OpKind::PushInt { ty, .. } => {
                state.stack.push(Type::new(*ty, op.location));
            }

            OpKind::Cast(ty) => {
                self.require_arguments(op, &state.stack, 1)?;
                state.stack.pop();
                state.stack.push(Type::new(*ty, op.location));
            }

            OpKind::Intrinsic(Intrinsic::Call) => {
                return Err(self
                    .compiler
                    .reporter
                    .fatal_at(op.location, "`call` is not supported by typechecking"));
            }

            OpKind::Intrinsic(intrinsic) => {
                let alternatives = intrinsic_effects(*intrinsic, op);
                self.apply_effects(op, &mut state.stack, &alternatives)?;
            }

            OpKind::CallSymbol { name, .. } => {
                self.apply_call(op, name, &mut state.stack)?;
            }

            OpKind::If => {
                self.apply_effects(op, &mut state.stack, &[eff(&[TypeKind::Bool], &[])])?;
                self.states.push(State {
                    stack: state.stack.clone(),
                    ip: op.jump,
                });
            }

            OpKind::Else | OpKind::While => {}

            OpKind::Do => {
                self.apply_effects(op, &mut state.stack, &[eff(&[TypeKind::Bool], &[])])?;

                if let Some(recorded) = self.do_entries.get(&ip) {
                    if let Err(shape) = compare_stacks(recorded, &state.stack) {
                        self.compiler.reporter.error_at(
                            op.location,
                            "loop differs stack: the loop body must leave the stack as it found it",
                        );
                        self.explain_shape_mismatch(op.location, recorded, &state.stack, shape);
                        return Err(Fatal);
                    }
                    return Ok(Flow::Terminate);
                }

                self.do_entries.insert(ip, state.stack.clone());
                self.states.push(State {
                    stack: state.stack.clone(),
                    ip: op.jump,
                });
            }

            OpKind::End => {
                if let Some(recorded) = self.end_merges.get(&ip) {
                    if let Err(shape) = compare_stacks(recorded, &state.stack) {
                        self.compiler
                            .reporter
                            .error_at(op.location, "branches must have matching typestacks");
                        self.explain_shape_mismatch(op.location, recorded, &state.stack, shape);
                        return Err(Fatal);
                    }
                    return Ok(Flow::Terminate);
                }

                self.end_merges.insert(ip, state.stack.clone());
                return Ok(Flow::Continue(op.jump));
            }

            OpKind::Return => {
                self.verify_exit(&state.stack, Some(op.location))?;
                return Ok(Flow::Terminate);
            }
        }

        match op.kind {
            OpKind::Else => Ok(Flow::Continue(op.jump)),
            _ => Ok(Flow::Continue(ip + 1)),
        }
    }

    fn apply_call(&self, op: &Operation, name: &str, stack: &mut Typestack) -> CResult<()> {
        let Some(word) = self.program.words.get(name) else {
            return Err(self
                .compiler
                .reporter
                .compiler_bug_at(op.location, format!("call to unregistered word `{name}`")));
        };
        let WordKind::Function(function) = &word.kind else {
            return Err(self
                .compiler
                .reporter
                .compiler_bug_at(op.location, format!("call to non-function word `{name}`")));
        };

        if function.dynamic {
            if self.depth >= MAX_DYNAMIC_CALL_DEPTH {
                return Err(self.compiler.reporter.fatal_at(
                    op.location,
                    format!("dynamic call to `{name}` recurses too deeply to typecheck"),
                ));
            }

            // The dynamic callee consumes the entire current typestack and
            // decides its own output; the first finished path of the callee
            // is adopted as that output.
            let output = check_body(
                self.compiler,
                self.program,
                &function.body,
                stack.clone(),
                Verifier::Adopt,
                self.depth + 1,
            )?;
            *stack = output;
            return Ok(());
        }

        let Some(effect) = &function.effect else {
            return Err(self.compiler.reporter.fatal_at(
                op.location,
                format!("cannot typecheck word `{name}` without a type signature"),
            ));
        };

        let alternative = eff(
            &effect.input.iter().map(|t| t.kind).collect::<Vec<_>>(),
            &effect.output.iter().map(|t| t.kind).collect::<Vec<_>>(),
        );
        self.apply_effects(op, stack, &[alternative])
    }

    /// Applies the first fully unifying alternative, or reports the best
    /// scoring one position by position.
    fn apply_effects(
        &self,
        op: &Operation,
        stack: &mut Typestack,
        alternatives: &[Effect],
    ) -> CResult<()> {
        let min_inputs = alternatives
            .iter()
            .map(|e| e.input.len())
            .min()
            .unwrap_or(0);
        if stack.len() < min_inputs {
            return Err(self.compiler.reporter.fatal_at(
                op.location,
                format!(
                    "missing operand: `{}` requires {} arguments on stack",
                    op.token.text, min_inputs
                ),
            ));
        }

        let mut best: Option<(usize, &Effect, Vec<Mismatch>)> = None;

        for alternative in alternatives {
            match match_alternative(stack, alternative) {
                Ok(bindings) => {
                    let popped = stack.len() - alternative.input.len();
                    stack.truncate(popped);

                    for output in &alternative.output {
                        let kind = match output {
                            TypeKind::Var(name) => match bindings.get(name) {
                                Some(kind) => *kind,
                                None => {
                                    return Err(self.compiler.reporter.compiler_bug_at(
                                        op.location,
                                        "effect output uses an unbound type variable",
                                    ));
                                }
                            },
                            concrete => *concrete,
                        };
                        stack.push(Type::new(kind, op.location));
                    }

                    return Ok(());
                }
                Err((score, mismatches)) => {
                    if best.as_ref().map_or(true, |(s, _, _)| score > *s) {
                        best = Some((score, alternative, mismatches));
                    }
                }
            }
        }

        let (_, alternative, mismatches) = best.expect("at least one alternative");
        if mismatches.is_empty() {
            // Every present position unified but the stack was too short for
            // this alternative.
            return Err(self.compiler.reporter.fatal_at(
                op.location,
                format!(
                    "missing operand: `{}` requires {} arguments on stack",
                    op.token.text,
                    alternative.input.len()
                ),
            ));
        }
        for mismatch in &mismatches {
            self.compiler.reporter.error_at(
                op.location,
                format!(
                    "expected type `{}` but found `{}` for `{}`",
                    mismatch.expected, mismatch.found.kind, op.token.text
                ),
            );
            self.compiler.reporter.info_at(
                mismatch.found.location,
                format!("value of type `{}` was introduced here", mismatch.found.kind),
            );
        }

        Err(Fatal)
    }

    fn require_arguments(&self, op: &Operation, stack: &Typestack, count: usize) -> CResult<()> {
        if stack.len() < count {
            return Err(self.compiler.reporter.fatal_at(
                op.location,
                format!(
                    "missing operand: `{}` requires {} arguments on stack",
                    op.token.text, count
                ),
            ));
        }
        Ok(())
    }

    fn verify_exit(&mut self, stack: &Typestack, at: Option<Location>) -> CResult<()> {
        match &self.verifier {
            Verifier::Declared { output, location } => {
                let expected: Vec<Type> = output.to_vec();
                if let Err(shape) = compare_stacks(&expected, stack) {
                    let report_at = at.or(*location);
                    let message =
                        "function body does not leave the stack described by its type signature";
                    match report_at {
                        Some(location) => self.compiler.reporter.error_at(location, message),
                        None => self.compiler.reporter.error(message),
                    }
                    self.explain_shape_mismatch(
                        report_at.unwrap_or_else(Location::builtin),
                        &expected,
                        stack,
                        shape,
                    );
                    return Err(Fatal);
                }
                Ok(())
            }

            Verifier::Adopt => {
                let Some(previous) = self.adopted.clone() else {
                    self.adopted = Some(stack.clone());
                    return Ok(());
                };

                if let Err(shape) = compare_stacks(&previous, stack) {
                    let message = "dynamically typed function resolves to different \
                                   stack effects on different paths";
                    match at {
                        Some(location) => self.compiler.reporter.error_at(location, message),
                        None => self.compiler.reporter.error(message),
                    }
                    self.explain_shape_mismatch(
                        at.unwrap_or_else(Location::builtin),
                        &previous,
                        stack,
                        shape,
                    );
                    return Err(Fatal);
                }
                Ok(())
            }
        }
    }

    fn explain_shape_mismatch(
        &self,
        at: Location,
        expected: &[Type],
        actual: &[Type],
        shape: ShapeMismatch,
    ) {
        let reporter = &self.compiler.reporter;

        match shape {
            ShapeMismatch::Excess(count) => {
                reporter.info_at(at, format!("there are {count} excess values on the stack"));
                for ty in actual.iter().rev().take(count) {
                    reporter.info_at(
                        ty.location,
                        format!("excess value of type `{ty}` was introduced here"),
                    );
                }
            }
            ShapeMismatch::Missing(count) => {
                reporter.info_at(at, format!("there are {count} missing values on the stack"));
                for ty in expected.iter().rev().take(count) {
                    reporter.info_at(
                        ty.location,
                        format!("missing value of type `{ty}` was expected here"),
                    );
                }
            }
            ShapeMismatch::Types => {
                for (want, have) in expected.iter().zip(actual.iter()) {
                    if !want.kind.matches(have.kind) {
                        reporter.info_at(
                            have.location,
                            format!("expected type `{want}` but found `{have}` here"),
                        );
                    }
                }
            }
        }
    }
}

enum ShapeMismatch {
    Excess(usize),
    Missing(usize),
    Types,
}

fn compare_stacks(expected: &[Type], actual: &[Type]) -> Result<(), ShapeMismatch> {
    if actual.len() > expected.len() {
        return Err(ShapeMismatch::Excess(actual.len() - expected.len()));
    }
    if actual.len() < expected.len() {
        return Err(ShapeMismatch::Missing(expected.len() - actual.len()));
    }
    if expected
        .iter()
        .zip(actual.iter())
        .all(|(want, have)| want.kind.matches(have.kind))
    {
        Ok(())
    } else {
        Err(ShapeMismatch::Types)
    }
}

struct Mismatch {
    expected: TypeKind,
    found: Type,
}

/// Unifies the rightmost entries of the stack against an alternative's
/// input, right to left, binding variables as they are first seen. On
/// failure, returns the number of matching positions and the mismatches.
fn match_alternative(
    stack: &[Type],
    alternative: &Effect,
) -> Result<HashMap<u32, TypeKind>, (usize, Vec<Mismatch>)> {
    let arity = alternative.input.len();
    let mut bindings: HashMap<u32, TypeKind> = HashMap::new();
    let mut mismatches = Vec::new();
    let mut score = 0;

    for offset in 0..arity {
        let want = alternative.input[arity - 1 - offset];
        let Some(have) = stack
            .len()
            .checked_sub(1 + offset)
            .and_then(|index| stack.get(index))
        else {
            // Shorter stack than this alternative needs; everything else
            // counts as a mismatch against a missing value.
            continue;
        };

        let matched = match want {
            TypeKind::Var(name) => match bindings.get(&name) {
                Some(bound) => bound.matches(have.kind),
                None => {
                    bindings.insert(name, have.kind);
                    true
                }
            },
            concrete => concrete.matches(have.kind),
        };

        if matched {
            score += 1;
        } else {
            let expected = match want {
                TypeKind::Var(name) => bindings.get(&name).copied().unwrap_or(want),
                concrete => concrete,
            };
            mismatches.push(Mismatch {
                expected,
                found: *have,
            });
        }
    }

    if mismatches.is_empty() && stack.len() >= arity {
        Ok(bindings)
    } else {
        Err((score, mismatches))
    }
}

/// The effect catalog. `Var` entries unify with whatever the stack holds.
fn intrinsic_effects(intrinsic: Intrinsic, op: &Operation) -> Vec<Effect> {
    use TypeKind::{Any, Bool, Int, Pointer, Var};

    match intrinsic {
        Intrinsic::Add => vec![
            eff(&[Pointer, Int], &[Pointer]),
            eff(&[Int, Pointer], &[Pointer]),
            eff(&[Int, Int], &[Int]),
        ],
        Intrinsic::Subtract => vec![
            eff(&[Pointer, Pointer], &[Int]),
            eff(&[Pointer, Int], &[Pointer]),
            eff(&[Int, Int], &[Int]),
        ],

        Intrinsic::Less
        | Intrinsic::LessEq
        | Intrinsic::Greater
        | Intrinsic::GreaterEq
        | Intrinsic::Equal
        | Intrinsic::NotEqual => vec![
            eff(&[Pointer, Pointer], &[Bool]),
            eff(&[Int, Int], &[Bool]),
            eff(&[Bool, Bool], &[Bool]),
        ],

        Intrinsic::BooleanNegate => vec![eff(&[Bool], &[Bool])],
        Intrinsic::BooleanAnd | Intrinsic::BooleanOr => vec![eff(&[Bool, Bool], &[Bool])],

        Intrinsic::BitwiseAnd
        | Intrinsic::BitwiseOr
        | Intrinsic::BitwiseXor
        | Intrinsic::LeftShift
        | Intrinsic::RightShift
        | Intrinsic::Mul
        | Intrinsic::Div
        | Intrinsic::Mod
        | Intrinsic::Min
        | Intrinsic::Max => vec![eff(&[Int, Int], &[Int])],

        Intrinsic::DivMod => vec![eff(&[Int, Int], &[Int, Int])],

        Intrinsic::Drop => vec![eff(&[Any], &[])],
        Intrinsic::TwoDrop => vec![eff(&[Any, Any], &[])],

        Intrinsic::Dup => vec![eff(&[Var(1)], &[Var(1), Var(1)])],
        Intrinsic::TwoDup => vec![eff(&[Var(1), Var(2)], &[Var(1), Var(2), Var(1), Var(2)])],
        Intrinsic::Over => vec![eff(&[Var(1), Var(2)], &[Var(1), Var(2), Var(1)])],
        Intrinsic::TwoOver => vec![eff(
            &[Var(1), Var(2), Var(3), Var(4)],
            &[Var(1), Var(2), Var(3), Var(4), Var(1), Var(2)],
        )],
        Intrinsic::Swap => vec![eff(&[Var(1), Var(2)], &[Var(2), Var(1)])],
        Intrinsic::TwoSwap => vec![eff(
            &[Var(1), Var(2), Var(3), Var(4)],
            &[Var(3), Var(4), Var(1), Var(2)],
        )],
        Intrinsic::Tuck => vec![eff(&[Var(1), Var(2)], &[Var(2), Var(1), Var(2)])],
        Intrinsic::Rot => vec![eff(&[Var(1), Var(2), Var(3)], &[Var(2), Var(3), Var(1)])],

        Intrinsic::Random32 | Intrinsic::Random64 => vec![eff(&[], &[Int])],

        Intrinsic::Load => vec![eff(&[Pointer], &[Int])],
        Intrinsic::Store => vec![eff(&[Pointer, Any], &[])],
        Intrinsic::Top => vec![eff(&[Var(1)], &[Var(1), Pointer])],

        Intrinsic::Argc => vec![eff(&[], &[Int])],
        Intrinsic::Argv => vec![eff(&[], &[Pointer])],

        Intrinsic::Syscall => {
            let count = syscall_argument_count(op);
            let mut input = vec![Any; count];
            input.push(Int);
            vec![eff(&input, &[Int])]
        }

        // Handled before the catalog is consulted.
        Intrinsic::Call => Vec::new(),
    }
}

/// `syscall3` takes the syscall number plus 3 arguments; the digit is the
/// 8th character of the spelling.
fn syscall_argument_count(op: &Operation) -> usize {
    op.token
        .text
        .as_bytes()
        .get(7)
        .filter(|b| b.is_ascii_digit())
        .map(|b| (b - b'0') as usize)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::compiler::test_support::{build_program, test_compiler};

    fn typecheck(source: &str) -> (crate::compiler::Compiler, CResult<()>) {
        let compiler = test_compiler();
        let program = build_program(&compiler, source).expect("program builds");
        let result = typecheck_program(&compiler, &program);
        (compiler, result)
    }

    fn assert_ok(source: &str) {
        let (compiler, result) = typecheck(source);
        assert!(
            result.is_ok(),
            "expected {source:?} to typecheck, got: {:#?}",
            compiler.reporter.messages()
        );
    }

    fn assert_fails_with(source: &str, needle: &str) {
        let (compiler, result) = typecheck(source);
        assert!(result.is_err(), "expected {source:?} to fail");
        let messages = compiler.reporter.messages();
        assert!(
            messages.iter().any(|m| m.contains(needle)),
            "expected a diagnostic containing {needle:?}, got: {messages:#?}"
        );
    }

    #[test]
    fn declared_binary_add_typechecks() {
        assert_ok("plus fun u64 u64 -- u64 is + end");
    }

    #[test]
    fn missing_operand_points_at_the_shortfall() {
        assert_fails_with("plus fun u64 -- u64 is + end", "missing operand");
    }

    #[test]
    fn branch_arms_must_agree() {
        assert_fails_with(
            "true if 1 else 2 3 end drop",
            "branches must have matching typestacks",
        );
    }

    #[test]
    fn branch_arms_that_agree_pass() {
        assert_ok("true if 1 else 2 end drop");
    }

    #[test]
    fn if_without_else_must_preserve_the_stack_shape() {
        assert_fails_with("true if 1 end drop", "branches must have matching typestacks");
        assert_ok("1 true if drop 2 end drop");
    }

    #[test]
    fn unbalanced_then_branch_fails_at_the_exit() {
        let (_, result) = typecheck("true if 1 end");
        assert!(result.is_err());
    }

    #[test]
    fn loops_must_not_change_the_stack() {
        assert_fails_with("5 while dup 0 > do dup end drop", "loop differs stack");
        assert_ok("5 while dup 0 > do 1 - end drop");
    }

    #[test]
    fn program_must_end_with_an_empty_stack() {
        assert_fails_with("1 2 +", "does not leave the stack");
        assert_ok("1 2 + drop");
    }

    #[test]
    fn pointer_arithmetic_alternatives() {
        assert_ok("buf fun -- ptr is 16 buffer + return end 16 buffer []byte buf drop");
        // ptr + ptr has no matching alternative.
        assert_fails_with(
            "16 buffer []byte buffer buffer + drop",
            "expected type",
        );
    }

    #[test]
    fn comparison_requires_matching_kinds() {
        assert_fails_with("1 true = drop", "expected type");
        assert_ok("1 2 = drop");
        assert_ok("true false = drop");
    }

    #[test]
    fn variables_preserve_the_concrete_type() {
        // dup on a pointer must produce pointers, so store accepts it.
        assert_ok("8 cell []byte cell dup 1 store64 drop");
    }

    #[test]
    fn call_intrinsic_is_unsupported() {
        assert_fails_with(
            "f fun 1 drop end &f call",
            "`call` is not supported by typechecking",
        );
    }

    #[test]
    fn calling_an_undeclared_function_is_fatal() {
        assert_fails_with(
            "helper fun 1 drop end helper",
            "without a type signature",
        );
    }

    #[test]
    fn dynamic_callee_adopts_first_path() {
        assert_ok("shrink fun dyn drop end 1 2 shrink drop");
    }

    #[test]
    fn dynamic_callee_output_reaches_the_caller() {
        // shrink consumes one value; the remaining one must still be dropped.
        assert_fails_with("shrink fun dyn drop end 1 2 shrink", "does not leave the stack");
    }

    #[test]
    fn return_verifies_against_the_declared_output() {
        assert_ok("choose fun bool -- u64 is if 1 return end 2 end");
        assert_fails_with(
            "choose fun bool -- u64 is if true return end 2 end",
            "does not leave the stack",
        );
    }

    #[test]
    fn syscall_effects_scale_with_arity() {
        assert_ok("1 1 \"x\" 1 syscall3 drop");
        assert_fails_with("1 syscall3 drop", "missing operand");
    }

    #[test]
    fn cast_changes_the_top_type() {
        assert_ok("1 bool if 2 drop end");
        assert_fails_with("1 if 2 drop end", "expected type `bool`");
    }
}
