use std::fmt::{self, Write};

use crate::ast::{Expr, FuncCall, NodeId, ObjDecl, OpKind, Stmt, Tree};
use crate::ops::CallType;

/// Render a statement tree as TorqueScript source. Identical trees produce
/// byte-identical output.
#[must_use]
pub fn render(tree: &Tree) -> String {
    let mut out = String::new();
    write_node(tree, tree.root(), 0, &mut out).expect("writing to String cannot fail");
    out
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push('\t');
    }
}

fn write_node(tree: &Tree, id: NodeId, depth: usize, out: &mut String) -> fmt::Result {
    let node = tree.node(id);
    if let Stmt::File { .. } = node.stmt {
        // The root prints as a bare comment line.
        write_stmt(tree, &node.stmt, out)?;
        out.push('\n');
        for &child in &node.children {
            write_node(tree, child, depth, out)?;
        }
        return Ok(());
    }
    indent(out, depth);
    write_stmt(tree, &node.stmt, out)?;
    if node.opens_block {
        out.push('\n');
        indent(out, depth);
        out.push_str("{\n");
        for &child in &node.children {
            write_node(tree, child, depth + 1, out)?;
        }
        indent(out, depth);
        out.push_str(if node.is_object { "};\n" } else { "}\n" });
    } else {
        out.push_str(";\n");
        for &child in &node.children {
            write_node(tree, child, depth, out)?;
        }
    }
    Ok(())
}

fn write_stmt(tree: &Tree, stmt: &Stmt, out: &mut String) -> fmt::Result {
    match stmt {
        Stmt::File { name } => write!(out, "// Decompiled file: {name}"),
        Stmt::FuncDecl {
            name,
            namespace,
            args,
            ..
        } => {
            if namespace.is_empty() {
                write!(out, "function {name}(")?;
            } else {
                write!(out, "function {namespace}::{name}(")?;
            }
            out.push_str(&args.join(", "));
            out.push(')');
            Ok(())
        }
        Stmt::ObjDecl(decl) => write_obj_header(tree, decl, out),
        Stmt::Assignment { target, value } => {
            // `var = var++` collapses back to the `var++` the source held.
            if let Expr::Op(kind @ (OpKind::AddPp | OpKind::SubPp), operands) = value {
                if operands.first() == Some(target) {
                    return write_expr(tree, &Expr::Op(*kind, operands.clone()), out);
                }
            }
            write_expr(tree, target, out)?;
            out.push_str(" = ");
            write_expr(tree, value, out)
        }
        Stmt::If { condition, .. } => {
            out.push_str("if (");
            write_expr(tree, condition, out)?;
            out.push(')');
            Ok(())
        }
        Stmt::Else => {
            out.push_str("else");
            Ok(())
        }
        Stmt::While { condition } => {
            out.push_str("while (");
            if let Some(condition) = condition {
                write_expr(tree, condition, out)?;
            }
            out.push(')');
            Ok(())
        }
        Stmt::Break => {
            out.push_str("break");
            Ok(())
        }
        Stmt::Return { value } => {
            out.push_str("return");
            if let Some(value) = value {
                out.push(' ');
                write_expr(tree, value, out)?;
            }
            Ok(())
        }
        Stmt::Expr(expr) => write_expr(tree, expr, out),
    }
}

fn write_obj_header(tree: &Tree, decl: &ObjDecl, out: &mut String) -> fmt::Result {
    out.push_str(if decl.is_datablock { "datablock " } else { "new " });
    write_expr(tree, &decl.class_name, out)?;
    out.push_str("( ");
    write_expr(tree, &decl.object_name, out)?;
    if !decl.parent.is_empty() {
        write!(out, " : {}", decl.parent)?;
    }
    for arg in &decl.args {
        out.push_str(", ");
        write_expr(tree, arg, out)?;
    }
    out.push_str(" )");
    Ok(())
}

pub(crate) fn write_expr(tree: &Tree, expr: &Expr, out: &mut String) -> fmt::Result {
    match expr {
        Expr::UintLit(value) => write!(out, "{value}"),
        Expr::FltLit(value) => write_float(*value, out),
        Expr::StrLit(value) => {
            out.push('"');
            escape_into(value, out);
            out.push('"');
            Ok(())
        }
        Expr::Ident(name) => {
            out.push_str(name);
            Ok(())
        }
        Expr::Op(kind, operands) => write_op(tree, *kind, operands, out),
        Expr::ArrayAccess(base, index) => {
            write_expr(tree, base, out)?;
            out.push('[');
            // Constant subscripts print as plain integers.
            match fold_index(index) {
                Some(value) => write!(out, "{}", value.trunc() as i64)?,
                None => write_expr(tree, index, out)?,
            }
            out.push(']');
            Ok(())
        }
        Expr::FieldAccess(object, field) => {
            write_expr(tree, object, out)?;
            out.push('.');
            write_expr(tree, field, out)
        }
        Expr::Call(call) => write_call(tree, call, out),
        Expr::Object(id) => match &tree.node(*id).stmt {
            Stmt::ObjDecl(decl) => write_obj_header(tree, decl, out),
            _ => unreachable!("object handle points at a non-object node"),
        },
        Expr::List(items) => write_separated(tree, items, " @ ", out),
    }
}

fn write_op(tree: &Tree, kind: OpKind, operands: &[Expr], out: &mut String) -> fmt::Result {
    match kind {
        OpKind::Neg => {
            let operand = &operands[0];
            if let Some(value) = fold_number(operand) {
                return write_float(-value, out);
            }
            match operand {
                Expr::Ident(_) | Expr::ArrayAccess(..) | Expr::FieldAccess(..) => {
                    out.push('-');
                    write_expr(tree, operand, out)
                }
                _ => {
                    out.push_str("-1.0 * ");
                    write_expr(tree, operand, out)
                }
            }
        }
        OpKind::AddPp | OpKind::SubPp => {
            write_expr(tree, &operands[0], out)?;
            out.push_str(if kind == OpKind::AddPp { "++" } else { "--" });
            Ok(())
        }
        OpKind::Not => {
            if let Expr::Op(inner, inner_operands) = &operands[0] {
                if let Some(complement) = inner.complement() {
                    return write_op(tree, complement, inner_operands, out);
                }
            }
            out.push_str("!(");
            write_expr(tree, &operands[0], out)?;
            out.push(')');
            Ok(())
        }
        OpKind::Complement => {
            out.push('~');
            write_expr(tree, &operands[0], out)
        }
        OpKind::Mul | OpKind::Div => {
            // Additive operands keep their grouping.
            for (i, operand) in operands.iter().enumerate() {
                if i > 0 {
                    out.push_str(kind.separator());
                }
                if matches!(operand, Expr::Op(OpKind::Add | OpKind::Sub, _)) {
                    out.push('(');
                    write_expr(tree, operand, out)?;
                    out.push(')');
                } else {
                    write_expr(tree, operand, out)?;
                }
            }
            Ok(())
        }
        _ => write_separated(tree, operands, kind.separator(), out),
    }
}

fn write_separated(
    tree: &Tree,
    items: &[Expr],
    separator: &str,
    out: &mut String,
) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(separator);
        }
        write_expr(tree, item, out)?;
    }
    Ok(())
}

fn write_call(tree: &Tree, call: &FuncCall, out: &mut String) -> fmt::Result {
    match call.call_type {
        CallType::Function => {
            if !call.namespace.is_empty() {
                write!(out, "{}::", call.namespace)?;
            }
        }
        CallType::Method => {
            if let Some(receiver) = &call.receiver {
                write_expr(tree, receiver, out)?;
            }
            out.push('.');
        }
        CallType::Parent => {
            if call.namespace.is_empty() {
                out.push_str("base::");
            } else {
                write!(out, "{}::", call.namespace)?;
            }
        }
    }
    write!(out, "{}(", call.name)?;
    write_separated(tree, &call.args, ", ", out)?;
    out.push(')');
    Ok(())
}

fn write_float(value: f64, out: &mut String) -> fmt::Result {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        write!(out, "{}", value as i64)
    } else {
        write!(out, "{value}")
    }
}

fn escape_into(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
}

/// Constant-fold a numeric expression tree. Used instead of evaluating
/// printed text: only literals and the arithmetic operators participate.
fn fold_number(expr: &Expr) -> Option<f64> {
    match expr {
        Expr::UintLit(value) => Some(f64::from(*value)),
        Expr::FltLit(value) => Some(*value),
        Expr::Op(kind, operands) => {
            let fold_all = || -> Option<Vec<f64>> { operands.iter().map(fold_number).collect() };
            match kind {
                OpKind::Neg => Some(-fold_number(operands.first()?)?),
                OpKind::Add => fold_all()?.into_iter().reduce(|a, b| a + b),
                OpKind::Sub => fold_all()?.into_iter().reduce(|a, b| a - b),
                OpKind::Mul => fold_all()?.into_iter().reduce(|a, b| a * b),
                OpKind::Div => fold_all()?
                    .into_iter()
                    .try_fold(None, |acc: Option<f64>, b| match acc {
                        None => Ok(Some(b)),
                        Some(a) if b != 0.0 => Ok(Some(a / b)),
                        Some(_) => Err(()),
                    })
                    .ok()
                    .flatten(),
                OpKind::Mod => fold_all()?
                    .into_iter()
                    .try_fold(None, |acc: Option<f64>, b| match acc {
                        None => Ok(Some(b)),
                        Some(a) if b != 0.0 => Ok(Some(a % b)),
                        Some(_) => Err(()),
                    })
                    .ok()
                    .flatten(),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Array subscripts additionally fold quoted numbers (`%a["2"]` prints as
/// `%a[2]`).
fn fold_index(expr: &Expr) -> Option<f64> {
    match expr {
        Expr::StrLit(text) => text.trim().parse().ok(),
        other => fold_number(other),
    }
}
