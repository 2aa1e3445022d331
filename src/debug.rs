//! Control-flow visualization: emits a Graphviz dot graph of the top-level
//! body or of a single function, for compiler debugging.
//!
//! `end` and `return` nodes are collapsed into edges: an edge that would
//! land on one follows its jump (or runs to the exit) instead, so the graph
//! shows only operations that do work.

use std::{fmt::Write, path::Path};

use crate::{
    compiler::Compiler,
    middle::ir::{Intrinsic, OpKind, Operation, Program, WordKind},
    report::CResult,
};

const NODE_PREFIX: &str = "stacky_instr_";

pub fn generate_control_flow_graph(
    compiler: &Compiler,
    program: &Program,
    dot_path: &Path,
    function: Option<&str>,
) -> CResult<()> {
    let body = match function {
        None => &program.main,
        Some(name) => match program.words.get(name).map(|word| &word.kind) {
            Some(WordKind::Function(function)) => &function.body,
            Some(_) => {
                return Err(compiler.reporter.fatal(format!(
                    "`{name}` is not a function (control flow can only be \
                     visualized for functions)"
                )));
            }
            None => {
                return Err(compiler
                    .reporter
                    .fatal(format!("word `{name}` has not been defined")));
            }
        },
    };

    let mut out = String::new();
    out.push_str("digraph Program {\n");
    out.push_str("\tlabelloc=\"t\";\n");
    match function {
        None => out.push_str("\tlabel=\"Control flow of the program\";\n"),
        Some(name) => {
            let _ = writeln!(out, "\tlabel=\"Control flow of function `{name}`\";");
        }
    }

    for (i, op) in body.iter().enumerate() {
        match &op.kind {
            OpKind::PushInt { value, .. } => {
                let _ = writeln!(out, "\t{NODE_PREFIX}{i} [label={value} shape=record];");
                link_next(&mut out, body, i, i + 1, "");
            }

            OpKind::Cast(_) | OpKind::Intrinsic(_) | OpKind::PushSymbol { .. } => {
                // `<` needs escaping in dot labels.
                let label = if matches!(op.kind, OpKind::Intrinsic(Intrinsic::Less)) {
                    "\"&lt;\"".to_string()
                } else {
                    format!("{:?}", op.token.text)
                };
                let _ = writeln!(out, "\t{NODE_PREFIX}{i} [label={label} shape=record];");
                link_next(&mut out, body, i, i + 1, "");
            }

            OpKind::CallSymbol { name, .. } => {
                let _ = writeln!(out, "\t{NODE_PREFIX}{i} [label=\"CALL\\n{name}\"];");
                link_next(&mut out, body, i, i + 1, "");
            }

            OpKind::If => {
                let _ = writeln!(out, "\t{NODE_PREFIX}{i} [label=IF];");
                link_next(&mut out, body, i, i + 1, "[label=T]");
                link_next(&mut out, body, i, op.jump, "[label=F style=dashed]");
            }

            OpKind::Do => {
                let _ = writeln!(out, "\t{NODE_PREFIX}{i} [label=DO];");
                link_next(&mut out, body, i, i + 1, "[label=T]");
                link_next(&mut out, body, i, op.jump, "[label=F style=dashed]");
            }

            OpKind::Else => {
                let _ = writeln!(out, "\t{NODE_PREFIX}{i} [label=ELSE];");
                link_next(&mut out, body, i, op.jump, "");
            }

            OpKind::While => {
                let _ = writeln!(out, "\t{NODE_PREFIX}{i} [label=WHILE];");
                link_next(&mut out, body, i, i + 1, "");
            }

            // Collapsed into the edges that reach them.
            OpKind::Return | OpKind::End => {}
        }
    }

    let _ = writeln!(
        out,
        "\t{NODE_PREFIX}{} [label=RETURN fontcolor=red];",
        body.len()
    );
    out.push_str("}\n");

    std::fs::write(dot_path, out).map_err(|error| {
        compiler.reporter.fatal(format!(
            "could not create file {}: {error}",
            dot_path.display()
        ))
    })
}

/// Draws an edge from `from` to `to`, skipping over `end` jumps and sending
/// `return` to the exit node.
fn link_next(out: &mut String, body: &[Operation], from: usize, mut to: usize, style: &str) {
    while to < body.len() {
        match body[to].kind {
            OpKind::End => to = body[to].jump,
            OpKind::Return => to = body.len(),
            _ => break,
        }
    }
    let _ = writeln!(out, "\t{NODE_PREFIX}{from} -> {NODE_PREFIX}{to} {style};");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::test_support::{build_program, test_compiler};

    #[test]
    fn dot_output_contains_branch_edges() {
        let compiler = test_compiler();
        let program =
            build_program(&compiler, "random64 0 > if 1 drop else 2 drop end").unwrap();

        let path = std::env::temp_dir().join(format!("stacky-cfg-{}.dot", std::process::id()));
        generate_control_flow_graph(&compiler, &program, &path, None).unwrap();

        let out = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert!(out.starts_with("digraph Program {"));
        assert!(out.contains("[label=IF]"));
        assert!(out.contains("[label=T]"));
        assert!(out.contains("[label=F style=dashed]"));
        assert!(out.contains("label=RETURN"));
    }

    #[test]
    fn unknown_function_is_fatal() {
        let compiler = test_compiler();
        let program = build_program(&compiler, "1 drop").unwrap();
        let path = std::env::temp_dir().join("stacky-cfg-unknown.dot");
        assert!(
            generate_control_flow_graph(&compiler, &program, &path, Some("missing")).is_err()
        );
    }
}
