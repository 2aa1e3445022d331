//! The optimizer: three passes iterated to a fixed point.
//!
//! 1. Unreachable-entity elimination — words and strings not reachable from
//!    the top-level body are erased.
//! 2. Compile-time branch folding — a `push`ed constant directly before an
//!    `if` or `do` decides the branch at compile time.
//! 3. Constant stack folding — maximal runs of pushes and pure stack/arith
//!    intrinsics are evaluated on a concrete stack and replaced by pushes of
//!    the results.
//!
//! Erasing operations shifts indices, so every fold rebuilds jump fields by
//! subtracting the number of erased positions strictly before each target.
//! Folding arithmetic uses the code generator's semantics (unsigned compare
//! and division, arithmetic right shift, shift counts masked to 6 bits) so
//! a folded program behaves exactly like the unfolded one.

use std::collections::BTreeSet;

use hashbrown::HashSet;

use crate::{
    compiler::Compiler,
    middle::{
        ir::{Intrinsic, OpKind, Operation, Program, SymbolPrefix, WordKind, EMPTY_JUMP},
        ty::TypeKind,
    },
};

pub fn optimize(compiler: &Compiler, program: &mut Program) {
    loop {
        if remove_unreachable(compiler, program) {
            continue;
        }
        if for_each_body(program, &mut |body| fold_branches(compiler, body)) {
            continue;
        }
        if for_each_body(program, &mut |body| fold_constants(body)) {
            continue;
        }
        break;
    }
}

fn for_each_body(program: &mut Program, pass: &mut dyn FnMut(&mut Vec<Operation>) -> bool) -> bool {
    let mut changed = pass(&mut program.main);
    for (_, word) in program.words.iter_mut() {
        if let WordKind::Function(function) = &mut word.kind {
            changed |= pass(&mut function.body);
        }
    }
    changed
}

/* Unreachable-entity elimination */

fn remove_unreachable(compiler: &Compiler, program: &mut Program) -> bool {
    let mut used_words: HashSet<u64> = HashSet::new();
    let mut used_strings: HashSet<u64> = HashSet::new();

    collect_reachable(program, &program.main, &mut used_words, &mut used_strings);

    let removed_words = program.words.retain(|_, word| {
        !matches!(word.kind, WordKind::Function(_) | WordKind::Array { .. })
            || used_words.contains(&word.id)
    });
    let removed_strings = program.strings.retain_ids(&used_strings);

    if removed_words > 0 {
        compiler
            .reporter
            .optimized(format!("removed {removed_words} unused functions and arrays"));
    }
    if removed_strings > 0 {
        compiler
            .reporter
            .optimized(format!("removed {removed_strings} unused strings"));
    }

    removed_words + removed_strings > 0
}

fn collect_reachable(
    program: &Program,
    body: &[Operation],
    used_words: &mut HashSet<u64>,
    used_strings: &mut HashSet<u64>,
) {
    for op in body {
        let word_id = match op.kind {
            OpKind::PushSymbol {
                prefix: SymbolPrefix::String,
                id,
            } => {
                used_strings.insert(id);
                continue;
            }
            OpKind::PushSymbol { id, .. } => id,
            OpKind::CallSymbol { word_id, .. } => word_id,
            _ => continue,
        };

        if !used_words.insert(word_id) {
            continue;
        }
        if let Some((_, word)) = program.words.find_by_id(word_id) {
            if let WordKind::Function(function) = &word.kind {
                collect_reachable(program, &function.body, used_words, used_strings);
            }
        }
    }
}

/* Compile-time branch folding */

fn fold_branches(compiler: &Compiler, body: &mut Vec<Operation>) -> bool {
    for branch_at in 1..body.len() {
        let condition_at = branch_at - 1;

        let OpKind::PushInt { value, .. } = &body[condition_at].kind else {
            continue;
        };
        let value = *value;
        if !matches!(body[branch_at].kind, OpKind::Do | OpKind::If) {
            continue;
        }

        let mut erased: BTreeSet<usize> = BTreeSet::new();

        match body[branch_at].kind {
            OpKind::Do => {
                // do.jump is one past the matching end.
                let exit_at = body[branch_at].jump;
                let end_at = exit_at - 1;
                let while_at = find_matching_while(body, condition_at);

                if value != 0 {
                    // The loop never exits; everything after it is dead.
                    if exit_at < body.len() {
                        compiler.reporter.warning_at(
                            body[exit_at].location,
                            "dead code: this loop is infinite",
                        );
                        compiler.reporter.info_at(
                            body[while_at].location,
                            "infinite loop introduced here",
                        );
                    }

                    erased.extend(exit_at..body.len());
                    erased.insert(condition_at);
                    erased.insert(branch_at);
                    erased.insert(while_at);
                    compiler.reporter.optimized_at(
                        body[branch_at].location,
                        "optimizing infinite loop (condition is always true)",
                    );
                } else {
                    // The loop never runs at all.
                    erased.extend(condition_at..=end_at);
                    erased.insert(while_at);
                    compiler.reporter.optimized_at(
                        body[branch_at].location,
                        "optimizing never-executed loop (condition is always false)",
                    );
                }
            }

            OpKind::If => {
                // With an else, if.jump is one past the else op; without
                // one it is the end itself.
                let target = body[branch_at].jump;
                let has_else = target >= 1 && body[target - 1].kind == OpKind::Else;
                let (else_at, end_at) = if has_else {
                    (target - 1, body[target - 1].jump)
                } else {
                    (target, target)
                };

                if value != 0 {
                    // Keep the then branch, drop the else (or the bare end).
                    if has_else {
                        erased.extend(else_at..=end_at);
                    } else {
                        erased.insert(end_at);
                    }
                    erased.insert(condition_at);
                    erased.insert(branch_at);
                    compiler.reporter.optimized_at(
                        body[branch_at].location,
                        "optimizing always-taken `if` (condition is always true)",
                    );
                } else {
                    // Drop the then branch (and the else op); keep the else
                    // body if present, dropping its end.
                    erased.extend(condition_at..=else_at);
                    if has_else {
                        erased.insert(end_at);
                    }
                    compiler.reporter.optimized_at(
                        body[branch_at].location,
                        "optimizing never-taken `if` (condition is always false)",
                    );
                }
            }

            _ => unreachable!(),
        }

        erase_and_remap(body, &erased);
        return true;
    }

    false
}

/// Finds the `while` belonging to the `do` that directly follows
/// `condition_at`, skipping over complete inner loops.
fn find_matching_while(body: &[Operation], condition_at: usize) -> usize {
    let mut depth = 0usize;
    let mut i = condition_at;
    while i > 0 {
        i -= 1;
        match body[i].kind {
            OpKind::Do => depth += 1,
            OpKind::While => {
                if depth == 0 {
                    return i;
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    0
}

/// Removes the operations at `erased` indices and re-bases every surviving
/// jump by the number of erased positions strictly before its target.
fn erase_and_remap(body: &mut Vec<Operation>, erased: &BTreeSet<usize>) {
    let mut index = 0;
    body.retain(|_| {
        let keep = !erased.contains(&index);
        index += 1;
        keep
    });

    for op in body.iter_mut() {
        if op.jump != EMPTY_JUMP {
            op.jump -= erased.range(..op.jump).count();
        }
    }
}

/* Constant stack folding */

fn fold_constants(body: &mut Vec<Operation>) -> bool {
    let mut changed = false;
    let mut start: Option<usize> = None;
    let mut stack: Vec<u64> = Vec::new();
    let mut i = 0;

    while i < body.len() {
        let op = &body[i];

        if start.is_none() {
            if matches!(op.kind, OpKind::PushInt { .. }) {
                start = Some(i);
                stack.clear();
            } else {
                i += 1;
                continue;
            }
        }

        let simulated = match &op.kind {
            OpKind::PushInt { value, .. } => {
                stack.push(*value);
                true
            }
            OpKind::Intrinsic(intrinsic) => simulate(*intrinsic, &mut stack),
            _ => false,
        };

        if simulated {
            i += 1;
            continue;
        }

        if let Some(delta) = splice_folded_run(body, start.take().unwrap(), i, &stack) {
            changed = true;
            i = (i as isize + delta) as usize;
        }
        stack.clear();
        i += 1;
    }

    if let Some(start) = start {
        let end = body.len();
        if splice_folded_run(body, start, end, &stack).is_some() {
            changed = true;
        }
    }

    changed
}

/// Replaces `body[start..end]` with pushes of the simulated stack, unless
/// that changes nothing. Returns the length delta when a splice happened.
fn splice_folded_run(
    body: &mut Vec<Operation>,
    start: usize,
    end: usize,
    stack: &[u64],
) -> Option<isize> {
    if start + 1 >= end {
        return None;
    }

    let unchanged = end - start == stack.len()
        && body[start..end]
            .iter()
            .zip(stack.iter())
            .all(|(op, value)| matches!(op.kind, OpKind::PushInt { value: v, .. } if v == *value));
    if unchanged {
        return None;
    }

    // Synthesized pushes reuse the first folded operation's token so they
    // still carry a plausible location.
    let template = body[start].token.clone();
    let replacement: Vec<Operation> = stack
        .iter()
        .map(|&value| {
            Operation::new(
                OpKind::PushInt {
                    value,
                    ty: TypeKind::Int,
                },
                template.clone(),
            )
        })
        .collect();

    let delta = stack.len() as isize - (end - start) as isize;
    body.splice(start..end, replacement);

    for op in body.iter_mut() {
        if op.jump != EMPTY_JUMP && op.jump > start {
            op.jump = (op.jump as isize + delta) as usize;
        }
    }

    Some(delta)
}

/// Simulates one intrinsic on the concrete stack; `false` means the run
/// must stop before this operation.
fn simulate(intrinsic: Intrinsic, stack: &mut Vec<u64>) -> bool {
    use Intrinsic::*;

    let needs = match intrinsic {
        Drop | Dup => 1,
        Add | Subtract | Mul | Div | Mod | Min | Max | Equal | NotEqual | Less | LessEq
        | Greater | GreaterEq | BitwiseAnd | BitwiseOr | BitwiseXor | LeftShift | RightShift
        | Swap | Over | Tuck | TwoDup => 2,
        Rot => 3,
        _ => return false,
    };
    if stack.len() < needs {
        return false;
    }

    // Division folds only when the divisor is known non-zero; the program
    // keeps its runtime fault otherwise.
    if matches!(intrinsic, Div | Mod) && *stack.last().unwrap() == 0 {
        return false;
    }

    match intrinsic {
        Drop => {
            stack.pop();
        }
        Dup => stack.push(*stack.last().unwrap()),
        TwoDup => {
            stack.push(stack[stack.len() - 2]);
            stack.push(stack[stack.len() - 2]);
        }
        Over => stack.push(stack[stack.len() - 2]),
        Swap => {
            let len = stack.len();
            stack.swap(len - 1, len - 2);
        }
        Tuck => {
            let len = stack.len();
            stack.push(stack[len - 1]);
            let len = stack.len();
            stack.swap(len - 2, len - 3);
        }
        Rot => {
            // a b c -- b c a
            let len = stack.len();
            let a = stack[len - 3];
            stack[len - 3] = stack[len - 2];
            stack[len - 2] = stack[len - 1];
            stack[len - 1] = a;
        }
        _ => {
            let a = stack.pop().unwrap();
            let b = stack.pop().unwrap();
            let result = match intrinsic {
                Add => b.wrapping_add(a),
                Subtract => b.wrapping_sub(a),
                Mul => b.wrapping_mul(a),
                Div => b / a,
                Mod => b % a,
                Min => b.min(a),
                Max => b.max(a),
                Equal => (b == a) as u64,
                NotEqual => (b != a) as u64,
                Less => (b < a) as u64,
                LessEq => (b <= a) as u64,
                Greater => (b > a) as u64,
                GreaterEq => (b >= a) as u64,
                BitwiseAnd => b & a,
                BitwiseOr => b | a,
                BitwiseXor => b ^ a,
                // The emitted shifts take the count modulo 64 (`cl`), with
                // an arithmetic right shift.
                LeftShift => b.wrapping_shl((a & 63) as u32),
                RightShift => ((b as i64) >> (a & 63)) as u64,
                _ => unreachable!(),
            };
            stack.push(result);
        }
    }

    true
}
