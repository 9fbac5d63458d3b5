use std::collections::HashMap;
use std::{error, fmt};

use log::{debug, warn};

use crate::ast::{Expr, FuncCall, NodeId, ObjDecl, OpKind, Stmt, Tree};
use crate::code::ByteCode;
use crate::dso::{Dso, Format};
use crate::error::Error;
use crate::ops::{CallType, END_CONTROL, Opcode};
use crate::tables::{FloatTable, StringTable};

/// A decode error together with the tree built up to the failure point, so
/// a debug driver can still render the partial output.
#[derive(Debug)]
pub struct DecodeFailure {
    pub error: Error,
    pub partial: Tree,
}

impl fmt::Display for DecodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl error::Error for DecodeFailure {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&self.error)
    }
}

/// The Torque VM keeps the string register as a growable buffer with a
/// start pointer; this models it as a stack of slots where `None` is the
/// freshly reserved slot an `advance` leaves behind for the next load.
#[derive(Debug, Default)]
struct StrStack {
    slots: Vec<Option<Expr>>,
}

impl StrStack {
    /// Overwrite the top slot, pushing one if the stack is empty.
    fn load(&mut self, value: Expr) {
        match self.slots.last_mut() {
            Some(top) => *top = Some(value),
            None => self.slots.push(Some(value)),
        }
    }

    /// Value in the top slot, if the slot holds one.
    fn top(&self) -> Option<&Expr> {
        self.slots.last().and_then(|slot| slot.as_ref())
    }

    fn pop_slot(&mut self) -> Option<Option<Expr>> {
        self.slots.pop()
    }

    fn pop_value(&mut self) -> Option<Expr> {
        self.slots.pop().flatten()
    }

    /// Fold the top value into a concatenation operator selected by the
    /// separator character, then reserve a fresh slot. Without a character
    /// the value is left for `rewind` to join.
    fn advance(&mut self, ch: Option<char>) -> Option<()> {
        if let Some(ch) = ch {
            let top = self.pop_value()?;
            let wrapped = match ch {
                '\n' => Expr::Op(OpKind::ConcatNl, vec![top]),
                '\t' => Expr::Op(OpKind::ConcatTab, vec![top]),
                ' ' => Expr::Op(OpKind::ConcatSpc, vec![top]),
                ',' => Expr::Op(OpKind::ConcatComma, vec![top]),
                // A NUL separator only ever precedes a string comparison.
                '\0' => Expr::Op(OpKind::StrEqual, vec![top]),
                other => Expr::Op(
                    OpKind::Concat,
                    vec![top, Expr::StrLit(other.to_string())],
                ),
            };
            self.slots.push(Some(wrapped));
        }
        self.slots.push(None);
        Some(())
    }

    /// Merge the two top values: append into an open string operator when
    /// one is present, otherwise collect into a list whose joining
    /// operator is not known yet.
    fn rewind(&mut self) -> Option<()> {
        let s2 = self.pop_value()?;
        let s1 = self.pop_value()?;
        let merged = match (s1, s2) {
            (Expr::List(mut a), Expr::List(b)) => {
                a.extend(b);
                Expr::List(a)
            }
            (Expr::Op(kind, mut operands), Expr::List(b)) if kind.is_string() => {
                operands.push(Expr::Op(OpKind::Concat, b));
                Expr::Op(kind, operands)
            }
            (s1, Expr::List(b)) => {
                let mut items = vec![s1];
                items.extend(b);
                Expr::List(items)
            }
            (Expr::List(mut a), s2) => {
                a.push(s2);
                Expr::List(a)
            }
            (Expr::Op(kind, mut operands), s2) if kind.is_string() => {
                operands.push(s2);
                Expr::Op(kind, operands)
            }
            (s1, s2) => Expr::List(vec![s1, s2]),
        };
        self.slots.push(Some(merged));
        Some(())
    }

    /// Discard the top slot after the last rewind of a sequence.
    fn terminate_rewind(&mut self) -> Option<()> {
        self.pop_slot().map(|_| ())
    }
}

/// Fold a still-undecided juxtaposition into the `@` operator it turns out
/// to have been.
fn fold_list(expr: Expr) -> Expr {
    match expr {
        Expr::List(items) => Expr::Op(OpKind::Concat, items),
        other => other,
    }
}

fn not(expr: Expr) -> Expr {
    Expr::Op(OpKind::Not, vec![expr])
}

/// Which typed stack a conditional jump takes its operand from.
#[derive(Debug, Clone, Copy)]
enum CondStack {
    Int,
    Flt,
}

/// Stack-machine interpreter over a patched v41 code stream. One linear
/// pass: expressions accumulate on the typed stacks, statements are
/// grafted into the tree at the focused node, and block ends fire at the
/// byte addresses recorded when each block was opened.
#[derive(Debug)]
pub struct Decoder {
    code: ByteCode,
    global_strings: StringTable,
    function_strings: StringTable,
    global_floats: FloatTable,
    function_floats: FloatTable,

    ip: usize,
    in_function: u32,
    in_object: u32,
    cur_var: Option<Expr>,
    cur_obj: Option<Expr>,
    cur_field: Option<Expr>,
    setcurvar_create: bool,

    int_stack: Vec<Expr>,
    flt_stack: Vec<Expr>,
    str_stack: StrStack,
    /// Short-circuit `&&`/`||` builders awaiting their closing jump.
    bin_stack: Vec<Expr>,
    arg_frames: Vec<Vec<Expr>>,

    tree: Tree,
    /// Saved (focus, object root) pairs for nested object creation.
    tree_stack: Vec<(NodeId, NodeId)>,
    end_of_block: HashMap<usize, Vec<NodeId>>,
    call_history: Vec<Opcode>,
}

impl Decoder {
    /// Takes ownership of a parsed v41 file. Legacy versions parse but are
    /// not decodable; their opcode table is not carried here.
    pub fn new(mut dso: Dso) -> Result<Self, Error> {
        let format = dso.format()?;
        if format != Format::V41 {
            return Err(Error::UnsupportedVersion(format.version()));
        }
        let code = dso.byte_code.take().ok_or(Error::NotParsed)?;
        let tree = Tree::new(Stmt::File {
            name: dso.name().to_string(),
        });
        Ok(Self {
            code,
            global_strings: std::mem::take(&mut dso.global_strings),
            function_strings: std::mem::take(&mut dso.function_strings),
            global_floats: std::mem::take(&mut dso.global_floats),
            function_floats: std::mem::take(&mut dso.function_floats),
            ip: 0,
            in_function: 0,
            in_object: 0,
            cur_var: None,
            cur_obj: None,
            cur_field: None,
            setcurvar_create: false,
            int_stack: Vec::new(),
            flt_stack: Vec::new(),
            str_stack: StrStack::default(),
            bin_stack: Vec::new(),
            arg_frames: Vec::new(),
            tree,
            tree_stack: Vec::new(),
            end_of_block: HashMap::new(),
            call_history: Vec::new(),
        })
    }

    /// Run the full pass and hand the tree over; on failure the partially
    /// built tree rides along with the error.
    pub fn decode(mut self) -> Result<Tree, DecodeFailure> {
        match self.run() {
            Ok(()) => Ok(self.tree),
            Err(error) => Err(DecodeFailure {
                error,
                partial: self.tree,
            }),
        }
    }

    fn run(&mut self) -> Result<(), Error> {
        while self.ip < self.code.binary_length() {
            if let Some(blocks) = self.end_of_block.remove(&self.ip) {
                for block in blocks {
                    self.close_block(block)?;
                }
            }

            let raw = self.code.get_code()?;
            let Ok(op) = Opcode::try_from(raw) else {
                if raw == END_CONTROL {
                    debug!("IP {}: end control sequence, terminating", self.ip);
                    return Ok(());
                }
                return Err(Error::UnknownOpcode {
                    ip: self.ip,
                    code: raw,
                });
            };
            debug!(
                "IP {}: {:?} (fn depth {}, obj depth {})",
                self.ip, op, self.in_function, self.in_object
            );
            self.dispatch(op)?;
            self.call_history.push(op);
            self.ip = self.code.position();
        }
        Ok(())
    }

    /// A recorded block ends at the current address: refocus its parent,
    /// splice in a pending `else`, and leave function scope.
    fn close_block(&mut self, block: NodeId) -> Result<(), Error> {
        self.tree
            .focus_parent()
            .ok_or(Error::TypeMismatch {
                ip: self.ip,
                expected: "an enclosing block to close",
            })?;
        let pending_else = match &self.tree.node(block).stmt {
            Stmt::If { else_handle, .. } => *else_handle,
            Stmt::FuncDecl { .. } => {
                self.in_function = self.in_function.saturating_sub(1);
                None
            }
            _ => None,
        };
        if let Some(else_id) = pending_else {
            self.tree.attach(else_id);
            self.tree.focus_child().expect("else was just attached");
        }
        Ok(())
    }

    fn dispatch(&mut self, op: Opcode) -> Result<(), Error> {
        match op {
            Opcode::FuncDecl => self.op_func_decl(),
            Opcode::CreateObject => self.op_create_object(),
            Opcode::AddObject => self.op_add_object(),
            Opcode::EndObject => self.op_end_object(),
            Opcode::JmpIffNot => self.op_jump_conditional(CondStack::Flt, false),
            Opcode::JmpIfNot => self.op_jump_conditional(CondStack::Int, false),
            Opcode::JmpIff => self.op_jump_conditional(CondStack::Flt, true),
            Opcode::JmpIf => self.op_jump_conditional(CondStack::Int, true),
            Opcode::JmpIfNotNp => self.op_jump_anchor(OpKind::And),
            Opcode::JmpIfNp => self.op_jump_anchor(OpKind::Or),
            Opcode::Jmp => self.op_jmp(),
            Opcode::Return => self.op_return(),
            Opcode::CmpEq => self.op_compare(OpKind::Equal),
            Opcode::CmpGr => self.op_compare(OpKind::Greater),
            Opcode::CmpGe => self.op_compare(OpKind::GreaterOrEqual),
            Opcode::CmpLt => self.op_compare(OpKind::Less),
            Opcode::CmpLe => self.op_compare(OpKind::LessOrEqual),
            Opcode::CmpNe => self.op_compare(OpKind::NotEqual),
            Opcode::Xor => self.op_int_binary(OpKind::Xor),
            Opcode::Mod => self.op_int_binary(OpKind::Mod),
            Opcode::BitAnd => self.op_int_binary(OpKind::BitAnd),
            Opcode::BitOr => self.op_int_binary(OpKind::BitOr),
            Opcode::Not => {
                let operand = self.pop_int()?;
                self.int_stack.push(not(operand));
                Ok(())
            }
            Opcode::NotF => {
                let operand = self.pop_flt()?;
                self.int_stack.push(not(operand));
                Ok(())
            }
            Opcode::OnesComplement => {
                let operand = self.pop_int()?;
                self.int_stack.push(Expr::Op(OpKind::Complement, vec![operand]));
                Ok(())
            }
            Opcode::Shr => self.op_int_binary(OpKind::ShiftRight),
            Opcode::Shl => self.op_int_binary(OpKind::ShiftLeft),
            Opcode::And => self.op_int_binary(OpKind::And),
            Opcode::Or => self.op_int_binary(OpKind::Or),
            Opcode::Add => self.op_flt_additive(OpKind::Add),
            Opcode::Sub => self.op_flt_additive(OpKind::Sub),
            Opcode::Mul => self.op_flt_binary(OpKind::Mul),
            Opcode::Div => self.op_flt_binary(OpKind::Div),
            Opcode::Neg => {
                let operand = self.pop_flt()?;
                self.flt_stack.push(Expr::Op(OpKind::Neg, vec![operand]));
                Ok(())
            }
            Opcode::SetCurVar => self.op_set_cur_var(false),
            Opcode::SetCurVarCreate => self.op_set_cur_var(true),
            Opcode::SetCurVarArray => self.op_set_cur_var_array(false),
            Opcode::SetCurVarArrayCreate => self.op_set_cur_var_array(true),
            Opcode::LoadVarUint => {
                let var = self.cur_var_expr()?;
                self.int_stack.push(var);
                Ok(())
            }
            Opcode::LoadVarFlt => {
                let var = self.cur_var_expr()?;
                self.flt_stack.push(var);
                Ok(())
            }
            Opcode::LoadVarStr => {
                let var = self.cur_var_expr()?;
                self.str_stack.load(var);
                Ok(())
            }
            Opcode::SaveVarUint => {
                let value = self.peek_int()?;
                self.save_var(value)
            }
            Opcode::SaveVarFlt => {
                let value = self.peek_flt()?;
                // The compiler saves `++`/`--` results twice; the second
                // save, flagged by SETCURVAR_CREATE, is dropped.
                if self.setcurvar_create && value.is_increment() {
                    return Ok(());
                }
                self.save_var(value)
            }
            Opcode::SaveVarStr => {
                let value = fold_list(self.peek_str()?);
                self.save_var(value)
            }
            Opcode::SetCurObject => {
                self.cur_obj = self.str_stack.top().cloned();
                Ok(())
            }
            Opcode::SetCurObjectNew | Opcode::SetCurObjectNewInt => {
                self.cur_obj = None;
                Ok(())
            }
            Opcode::SetCurField => {
                let field = self.get_global_string()?;
                self.cur_field = Some(Expr::Ident(field));
                Ok(())
            }
            Opcode::SetCurFieldArray => {
                let field = self.cur_field.take().ok_or(Error::TypeMismatch {
                    ip: self.ip,
                    expected: "a current field for the array subscript",
                })?;
                let index = self.peek_str()?;
                self.cur_field = Some(Expr::ArrayAccess(Box::new(field), Box::new(index)));
                Ok(())
            }
            Opcode::LoadFieldUint => {
                let field = self.field_expr()?;
                self.int_stack.push(field);
                Ok(())
            }
            Opcode::LoadFieldFlt => {
                let field = self.field_expr()?;
                self.flt_stack.push(field);
                Ok(())
            }
            Opcode::LoadFieldStr => {
                let field = self.field_expr()?;
                self.str_stack.load(field);
                Ok(())
            }
            Opcode::SaveFieldUint => {
                let value = self.peek_int()?;
                self.save_field(value)
            }
            Opcode::SaveFieldFlt => {
                let value = self.peek_flt()?;
                self.save_field(value)
            }
            Opcode::SaveFieldStr => {
                let value = fold_list(self.peek_str()?);
                self.save_field(value)
            }
            Opcode::StrToUint => {
                let value = self.peek_str()?;
                self.int_stack.push(value);
                Ok(())
            }
            Opcode::StrToFlt => {
                let value = self.peek_str()?;
                self.flt_stack.push(value);
                Ok(())
            }
            Opcode::StrToNone => self.op_str_to_none(),
            Opcode::FltToUint => {
                let value = self.pop_flt()?;
                self.int_stack.push(value);
                Ok(())
            }
            Opcode::FltToStr => {
                let value = self.pop_flt()?;
                self.str_stack.load(value);
                Ok(())
            }
            Opcode::FltToNone => self.pop_flt().map(drop),
            Opcode::UintToFlt => {
                let value = self.pop_int()?;
                self.flt_stack.push(value);
                Ok(())
            }
            Opcode::UintToStr => {
                let operand = self.pop_int()?;
                let value = self.drain_bin(operand);
                self.str_stack.load(value);
                Ok(())
            }
            Opcode::UintToNone => self.op_uint_to_none(),
            Opcode::LoadImmedUint => {
                let value = self.code.get_uint()?;
                self.int_stack.push(Expr::UintLit(value));
                Ok(())
            }
            Opcode::LoadImmedFlt => {
                let value = self.get_float()?;
                self.flt_stack.push(Expr::FltLit(value));
                Ok(())
            }
            Opcode::TagToStr => {
                let tag = self.get_global_string()?;
                self.str_stack.load(Expr::Ident(tag));
                Ok(())
            }
            Opcode::LoadImmedStr => {
                let value = self.get_string()?;
                self.str_stack.load(Expr::StrLit(value));
                Ok(())
            }
            Opcode::DocBlockStr => {
                warn!("IP {}: OP_DOCBLOCK_STR ignored", self.ip);
                Ok(())
            }
            Opcode::LoadImmedIdent => {
                let value = self.get_string()?;
                self.str_stack.load(Expr::Ident(value));
                Ok(())
            }
            Opcode::CallFunc | Opcode::CallFuncResolve => self.op_call_func(),
            Opcode::AdvanceStr => self.advance_str(None),
            Opcode::AdvanceStrAppendChar => {
                let ch = self.code.get_code()? as u8 as char;
                self.advance_str(Some(ch))
            }
            Opcode::AdvanceStrComma => self.advance_str(Some(',')),
            Opcode::AdvanceStrNul => self.advance_str(Some('\0')),
            Opcode::RewindStr => {
                self.str_stack.rewind().ok_or(self.str_underflow())
            }
            Opcode::TerminateRewindStr => {
                self.str_stack.terminate_rewind().ok_or(self.str_underflow())
            }
            Opcode::CompareStr => self.op_compare_str(),
            Opcode::Push => self.op_push(),
            Opcode::PushFrame => {
                self.arg_frames.push(Vec::new());
                Ok(())
            }
        }
    }

    // ---- operand helpers -------------------------------------------------

    fn str_underflow(&self) -> Error {
        Error::StackUnderflow {
            ip: self.ip,
            stack: "string",
        }
    }

    fn pop_int(&mut self) -> Result<Expr, Error> {
        self.int_stack.pop().ok_or(Error::StackUnderflow {
            ip: self.ip,
            stack: "integer",
        })
    }

    fn pop_flt(&mut self) -> Result<Expr, Error> {
        self.flt_stack.pop().ok_or(Error::StackUnderflow {
            ip: self.ip,
            stack: "float",
        })
    }

    fn peek_int(&self) -> Result<Expr, Error> {
        self.int_stack.last().cloned().ok_or(Error::StackUnderflow {
            ip: self.ip,
            stack: "integer",
        })
    }

    fn peek_flt(&self) -> Result<Expr, Error> {
        self.flt_stack.last().cloned().ok_or(Error::StackUnderflow {
            ip: self.ip,
            stack: "float",
        })
    }

    fn peek_str(&self) -> Result<Expr, Error> {
        self.str_stack.top().cloned().ok_or(self.str_underflow())
    }

    /// Fold a pending short-circuit builder around a popped condition.
    fn drain_bin(&mut self, operand: Expr) -> Expr {
        match self.bin_stack.pop() {
            Some(Expr::Op(kind, mut operands)) => {
                operands.push(operand);
                Expr::Op(kind, operands)
            }
            Some(other) => {
                // Only And/Or builders are ever pushed.
                self.bin_stack.push(other);
                operand
            }
            None => operand,
        }
    }

    fn cur_var_expr(&self) -> Result<Expr, Error> {
        self.cur_var.clone().ok_or(Error::TypeMismatch {
            ip: self.ip,
            expected: "a current variable",
        })
    }

    fn field_expr(&self) -> Result<Expr, Error> {
        let field = self.cur_field.clone().ok_or(Error::TypeMismatch {
            ip: self.ip,
            expected: "a current field",
        })?;
        Ok(match &self.cur_obj {
            Some(object) => Expr::FieldAccess(Box::new(object.clone()), Box::new(field)),
            // No object: a field inside an object-creation body.
            None => field,
        })
    }

    // ---- table access ----------------------------------------------------

    fn get_global_string(&mut self) -> Result<String, Error> {
        let offset = self.code.get_string_offset()?;
        self.global_strings.get(offset)
    }

    /// Context-sensitive string fetch: patched offsets are always global;
    /// function bodies prefer the function table when it has entries.
    fn get_string(&mut self) -> Result<String, Error> {
        let offset = self.code.get_string_offset()?;
        if self.code.last_offset_patched() {
            return self.global_strings.get(offset);
        }
        if self.in_function > 0 && !self.function_strings.is_empty() {
            match self.function_strings.get(offset) {
                Ok(string) => Ok(string),
                Err(_) => {
                    // Some function-scope strings land in the global table.
                    warn!("string offset {offset} not in function table, trying global");
                    self.global_strings.get(offset)
                }
            }
        } else {
            self.global_strings.get(offset)
        }
    }

    fn get_float(&mut self) -> Result<f64, Error> {
        let offset = self.code.get_float_offset()?;
        if self.in_function > 0 && !self.function_floats.is_empty() {
            self.function_floats.get(offset)
        } else {
            self.global_floats.get(offset)
        }
    }

    /// Read a code-index operand and convert it to a byte offset.
    fn byte_target(&mut self) -> Result<usize, Error> {
        let code_index = self.code.get_code()?;
        self.code.byte_offset(code_index)
    }

    fn record_end(&mut self, target: usize, block: NodeId) {
        self.end_of_block.entry(target).or_default().push(block);
    }

    // ---- declarations and objects ---------------------------------------

    fn op_func_decl(&mut self) -> Result<(), Error> {
        let name = self.get_global_string()?;
        let ns_offset = self.code.get_string_offset()?;
        let namespace = if ns_offset == 0 {
            String::new()
        } else {
            self.global_strings.get(ns_offset)?
        };
        let package = self.get_global_string()?;
        let has_body = self.code.get_code()?;
        let end = self.byte_target()?;
        let argc = self.code.get_code()?;

        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            let offset = self.code.get_string_offset()?;
            let mut arg = self.global_strings.get(offset)?;
            // Parameters are locals; give them their sigil once.
            if !arg.starts_with('%') {
                arg = format!("%{arg}");
                self.global_strings.set(offset, &arg);
            }
            args.push(arg);
        }

        debug!(
            "IP {}: declare function {namespace}::{name} ({argc} args, body ends at {end})",
            self.ip
        );
        let decl = self.tree.append(Stmt::FuncDecl {
            name,
            namespace,
            package,
            has_body,
            end,
            args,
        });
        self.record_end(end, decl);
        self.tree.focus_child().expect("declaration was appended");
        self.in_function += 1;
        Ok(())
    }

    fn op_create_object(&mut self) -> Result<(), Error> {
        let parent = self.get_string()?;
        let is_datablock = self.code.get_uint()? != 0;
        let is_internal = self.code.get_code()?;
        let is_message = self.code.get_code()?;
        let end = self.byte_target()?;

        let mut argv = self.arg_frames.pop().ok_or(Error::StackUnderflow {
            ip: self.ip,
            stack: "argument frame",
        })?;
        // Concatenations arrive as unresolved juxtapositions.
        for arg in argv.iter_mut().skip(1) {
            let folded = fold_list(std::mem::replace(arg, Expr::UintLit(0)));
            *arg = folded;
        }
        if argv.is_empty() {
            return Err(Error::NotImplemented("object creation without a class"));
        }
        let class_name = argv.remove(0);
        if argv.is_empty() {
            return Err(Error::NotImplemented("object creation without a name"));
        }
        let object_name = argv.remove(0);

        debug!(
            "IP {}: create object (datablock: {is_datablock}, parent {parent:?}, ends at {end})",
            self.ip
        );
        let saved = self.tree.focused();
        let object = self.tree.alloc(Stmt::ObjDecl(ObjDecl {
            class_name,
            object_name,
            parent,
            is_datablock,
            is_internal,
            is_message,
            args: argv,
        }));
        self.tree_stack.push((saved, object));
        self.tree.focus(object);
        self.in_object += 1;
        Ok(())
    }

    fn op_add_object(&mut self) -> Result<(), Error> {
        let place_at_root = self.code.get_code()? != 0;
        let &(_, object) = self.tree_stack.last().ok_or(Error::TypeMismatch {
            ip: self.ip,
            expected: "an object under construction",
        })?;
        if place_at_root {
            // A handle slot was pushed before the creation began.
            *self.int_stack.last_mut().ok_or(Error::StackUnderflow {
                ip: self.ip,
                stack: "integer",
            })? = Expr::Object(object);
        } else {
            self.int_stack.push(Expr::Object(object));
        }
        Ok(())
    }

    fn op_end_object(&mut self) -> Result<(), Error> {
        let (saved, _object) = self.tree_stack.pop().ok_or(Error::TypeMismatch {
            ip: self.ip,
            expected: "an object under construction",
        })?;
        self.tree.focus(saved);

        // CREATE immediately followed by ADD means the body is empty; the
        // header then prints as a plain statement without a block.
        let history = &self.call_history;
        if history.len() >= 2
            && history[history.len() - 2] == Opcode::CreateObject
            && history[history.len() - 1] == Opcode::AddObject
        {
            if let Some(Expr::Object(id)) = self.int_stack.last() {
                self.tree.node_mut(*id).opens_block = false;
            }
        }

        let place_at_root = self.code.get_code()? != 0;
        if !place_at_root {
            // Not the target of an assignment: becomes a statement now.
            match self.pop_int()? {
                Expr::Object(id) => self.tree.attach(id),
                _ => {
                    return Err(Error::TypeMismatch {
                        ip: self.ip,
                        expected: "an object handle on the integer stack",
                    });
                }
            }
        }
        self.in_object = self.in_object.saturating_sub(1);
        Ok(())
    }

    // ---- control flow ----------------------------------------------------

    fn op_jump_conditional(&mut self, source: CondStack, jump_when_met: bool) -> Result<(), Error> {
        let target = self.byte_target()?;
        let operand = match source {
            CondStack::Int => self.pop_int()?,
            CondStack::Flt => self.pop_flt()?,
        };
        let condition = self.drain_bin(operand);
        let here = self.code.position();

        if target > here {
            // Forward jump over the block: an `if` whose body runs when the
            // jump is not taken.
            let stored = if jump_when_met {
                not(condition)
            } else {
                condition
            };
            let block = self.tree.append(Stmt::If {
                condition: stored,
                else_handle: None,
            });
            self.record_end(target, block);
            self.tree.focus_child().expect("if was appended");
        } else if target < here {
            // Backward jump: the closing edge of a loop. A While opened by
            // a bare JMP receives its condition; an If assumed earlier is
            // promoted, provided the duplicated condition agrees.
            let focused = self.tree.focused();
            let forward_condition = match &self.tree.node(focused).stmt {
                Stmt::While { .. } => None,
                Stmt::If { condition, .. } => Some(condition.clone()),
                _ => {
                    return Err(Error::TypeMismatch {
                        ip: self.ip,
                        expected: "an enclosing loop for the backward jump",
                    });
                }
            };
            if let Some(existing) = forward_condition {
                if existing != condition {
                    return Err(Error::LoopConditionMismatch { ip: self.ip });
                }
            }
            let filled = if jump_when_met { condition } else { not(condition) };
            self.tree.replace_focused(Stmt::While {
                condition: Some(filled),
            });
        }
        Ok(())
    }

    /// Short-circuit anchor: the operand joins an `&&`/`||` chain that the
    /// closing conditional jump will consume.
    fn op_jump_anchor(&mut self, kind: OpKind) -> Result<(), Error> {
        let _target = self.byte_target()?;
        let operand = self.pop_int()?;
        let combined = self.drain_bin(operand);
        self.bin_stack.push(Expr::Op(kind, vec![combined]));
        Ok(())
    }

    fn op_jmp(&mut self) -> Result<(), Error> {
        let target = self.byte_target()?;
        let here = self.code.position();
        if target <= here {
            return Err(Error::NotImplemented("backward unconditional jump"));
        }

        let focused = self.tree.focused();
        let closes_here = self
            .end_of_block
            .get(&here)
            .is_some_and(|blocks| blocks.contains(&focused));
        if closes_here {
            if self.end_of_block.contains_key(&target) {
                // Jumping past the end of another open block: a `break`.
                self.tree.append(Stmt::Break);
            } else {
                // Jumping over the code that follows the `if`: an `else`.
                let else_block = self.tree.alloc(Stmt::Else);
                self.record_end(target, else_block);
                match &mut self.tree.node_mut(focused).stmt {
                    Stmt::If { else_handle, .. } => *else_handle = Some(else_block),
                    _ => {
                        return Err(Error::TypeMismatch {
                            ip: self.ip,
                            expected: "an if block before else",
                        });
                    }
                }
            }
        } else {
            // Loop compiled jump-first: the backward conditional jump will
            // fill in the condition later.
            let block = self.tree.append(Stmt::While { condition: None });
            self.record_end(target, block);
            self.tree.focus_child().expect("while was appended");
        }
        Ok(())
    }

    fn op_return(&mut self) -> Result<(), Error> {
        if self.ip + 1 >= self.code.binary_length() {
            return Ok(());
        }

        let value = self.str_stack.pop_value().map(fold_list);

        let focused = self.tree.focused();
        let at_function_end = matches!(
            self.tree.node(focused).stmt,
            Stmt::FuncDecl { end, .. } if end == self.ip + 1
        );
        let at_stream_tail =
            self.in_function == 0 && self.code.peek_code_full().ok() == Some(END_CONTROL);
        if value.is_none() && (at_function_end || at_stream_tail) {
            // The compiler's implicit trailing return.
        } else {
            self.tree.append(Stmt::Return { value });
        }

        // v41 emits two return codes; drop the duplicate unless it belongs
        // to the other branch of a conditional.
        if self.code.peek_code().ok() == Some(Opcode::Return as u32)
            && !matches!(
                self.tree.node(self.tree.focused()).stmt,
                Stmt::If { .. } | Stmt::Else
            )
        {
            self.code.get_code()?;
        }
        Ok(())
    }

    // ---- expressions -----------------------------------------------------

    fn op_compare(&mut self, kind: OpKind) -> Result<(), Error> {
        let a = self.pop_flt()?;
        let b = self.pop_flt()?;
        self.int_stack.push(Expr::Op(kind, vec![a, b]));
        Ok(())
    }

    fn op_int_binary(&mut self, kind: OpKind) -> Result<(), Error> {
        let a = self.pop_int()?;
        let b = self.pop_int()?;
        self.int_stack.push(Expr::Op(kind, vec![a, b]));
        Ok(())
    }

    fn op_flt_binary(&mut self, kind: OpKind) -> Result<(), Error> {
        let a = self.pop_flt()?;
        let b = self.pop_flt()?;
        self.flt_stack.push(Expr::Op(kind, vec![a, b]));
        Ok(())
    }

    /// ADD/SUB, with the `++`/`--` idiom recovered: SETCURVAR_CREATE
    /// followed by `var (+|-) 1` is a post-increment, not arithmetic.
    fn op_flt_additive(&mut self, kind: OpKind) -> Result<(), Error> {
        let len = self.flt_stack.len();
        if self.setcurvar_create && len >= 2 && self.flt_stack[len - 2].is_literal_one() {
            self.setcurvar_create = false;
            let a = self.pop_flt()?;
            let b = self.pop_flt()?;
            let pp = if kind == OpKind::Add {
                OpKind::AddPp
            } else {
                OpKind::SubPp
            };
            self.flt_stack.push(Expr::Op(pp, vec![a, b]));
            Ok(())
        } else {
            self.op_flt_binary(kind)
        }
    }

    // ---- variables and fields --------------------------------------------

    fn op_set_cur_var(&mut self, create: bool) -> Result<(), Error> {
        let offset = self.code.get_string_offset()?;
        let mut name = self.global_strings.get(offset)?;
        self.setcurvar_create = create;
        if !create && !name.starts_with('$') && !name.starts_with('%') {
            // Spell the sigil into the table so later loads agree.
            name = if self.in_function > 0 {
                format!("%{name}")
            } else {
                format!("${name}")
            };
            self.global_strings.set(offset, &name);
        }
        debug!("IP {}: current variable {name}", self.ip);
        self.cur_var = Some(Expr::Ident(name));
        self.cur_obj = None;
        Ok(())
    }

    fn op_set_cur_var_array(&mut self, create: bool) -> Result<(), Error> {
        let top = self.peek_str()?;
        let Expr::List(items) = top else {
            return Err(Error::TypeMismatch {
                ip: self.ip,
                expected: "an array name and subscript on the string stack",
            });
        };
        if items.len() != 2 {
            return Err(Error::TypeMismatch {
                ip: self.ip,
                expected: "an array name and subscript on the string stack",
            });
        }
        let mut items = items.into_iter();
        let base = items.next().expect("two items");
        let index = items.next().expect("two items");

        if create && index.is_increment() {
            // `$a[%i++]`: the increment already entered the tree as its own
            // assignment; the subscript keeps the only copy.
            let focused = self.tree.focused();
            if let Some(&last) = self.tree.node(focused).children.last() {
                if matches!(&self.tree.node(last).stmt, Stmt::Assignment { value, .. } if *value == index)
                {
                    self.tree.pop_last_child();
                }
            }
        }

        self.cur_var = Some(Expr::ArrayAccess(Box::new(base), Box::new(index)));
        self.cur_obj = None;
        Ok(())
    }

    fn save_var(&mut self, value: Expr) -> Result<(), Error> {
        let target = self.cur_var_expr()?;
        let assignment = self.tree.append(Stmt::Assignment {
            target,
            value: value.clone(),
        });
        if let Expr::Object(object) = value {
            self.graft_object(assignment, object);
        }
        Ok(())
    }

    fn save_field(&mut self, value: Expr) -> Result<(), Error> {
        let target = match (&self.cur_obj, &self.cur_field) {
            (Some(object), Some(field)) => {
                Expr::FieldAccess(Box::new(object.clone()), Box::new(field.clone()))
            }
            // Field assignment inside an object-creation body.
            (None, Some(field)) => field.clone(),
            _ => {
                return Err(Error::TypeMismatch {
                    ip: self.ip,
                    expected: "a current field",
                });
            }
        };
        let assignment = self.tree.append(Stmt::Assignment {
            target,
            value: value.clone(),
        });
        if let Expr::Object(object) = value {
            self.graft_object(assignment, object);
        }
        Ok(())
    }

    /// An assignment whose right side is an object creation owns the
    /// object's body: the field assignments move under the assignment and
    /// the handle prints only the header.
    fn graft_object(&mut self, assignment: NodeId, object: NodeId) {
        self.tree.adopt_children(object, assignment);
        let (opens_block, is_object) = {
            let node = self.tree.node(object);
            (node.opens_block, node.is_object)
        };
        let node = self.tree.node_mut(assignment);
        node.opens_block = opens_block;
        node.is_object = is_object;
    }

    // ---- discards and calls ----------------------------------------------

    fn op_str_to_none(&mut self) -> Result<(), Error> {
        let slot = self.str_stack.pop_slot().ok_or(self.str_underflow())?;
        // A call whose value nobody read is a procedure-call statement.
        if let Some(Expr::Call(call)) = slot {
            if matches!(
                self.call_history.last(),
                Some(Opcode::CallFunc | Opcode::CallFuncResolve)
            ) {
                self.tree.append(Stmt::Expr(Expr::Call(call)));
            }
        }
        Ok(())
    }

    fn op_uint_to_none(&mut self) -> Result<(), Error> {
        let value = self.pop_int()?;
        // An object handle nobody assigned becomes a statement of its own.
        if let Expr::Object(id) = value {
            if self.call_history.last() == Some(&Opcode::EndObject) {
                self.tree.attach(id);
            }
        }
        Ok(())
    }

    fn op_call_func(&mut self) -> Result<(), Error> {
        let name = self.get_global_string()?;
        let ns_offset = self.code.get_string_offset()?;
        let namespace = if ns_offset == 0 {
            String::new()
        } else {
            self.global_strings.get(ns_offset)?
        };
        let raw_call_type = self.code.get_code()?;
        let call_type = u8::try_from(raw_call_type)
            .ok()
            .and_then(|b| CallType::try_from(b).ok())
            .ok_or(Error::TypeMismatch {
                ip: self.ip,
                expected: "a function/method/parent call type",
            })?;

        let mut args = self.arg_frames.pop().ok_or(Error::StackUnderflow {
            ip: self.ip,
            stack: "argument frame",
        })?;
        for arg in &mut args {
            let folded = fold_list(std::mem::replace(arg, Expr::UintLit(0)));
            *arg = folded;
        }

        let receiver = if call_type == CallType::Method {
            if args.is_empty() {
                return Err(Error::StackUnderflow {
                    ip: self.ip,
                    stack: "argument frame",
                });
            }
            Some(args.remove(0))
        } else {
            None
        };
        if call_type == CallType::Parent {
            debug!("IP {}: parent call `{name}`; rendering syntax unconfirmed", self.ip);
        }

        debug!("IP {}: call {namespace}::{name} ({:?})", self.ip, call_type);
        self.str_stack.load(Expr::Call(Box::new(FuncCall {
            name,
            namespace,
            call_type,
            receiver,
            args,
        })));
        Ok(())
    }

    fn advance_str(&mut self, ch: Option<char>) -> Result<(), Error> {
        self.str_stack.advance(ch).ok_or(self.str_underflow())
    }

    fn op_compare_str(&mut self) -> Result<(), Error> {
        let rhs = self.str_stack.pop_value().ok_or(self.str_underflow())?;
        let op = self.str_stack.pop_value().ok_or(self.str_underflow())?;
        let Expr::Op(kind, mut operands) = op else {
            return Err(Error::TypeMismatch {
                ip: self.ip,
                expected: "a string comparison in progress",
            });
        };
        operands.push(rhs);
        self.int_stack.push(Expr::Op(kind, operands));
        Ok(())
    }

    fn op_push(&mut self) -> Result<(), Error> {
        let value = self.peek_str()?;
        self.arg_frames
            .last_mut()
            .ok_or(Error::StackUnderflow {
                ip: self.ip,
                stack: "argument frame",
            })?
            .push(value);
        Ok(())
    }
}

/// Parse and decode in one step, rendering the reconstructed source.
pub fn decompile(name: &str, data: &[u8]) -> Result<String, Error> {
    let dso = Dso::parse(name, data)?;
    let tree = Decoder::new(dso)?.decode().map_err(|failure| failure.error)?;
    Ok(tree.to_source())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str_stack_load_overwrites_top() {
        let mut stack = StrStack::default();
        stack.load(Expr::Ident("a".into()));
        stack.load(Expr::Ident("b".into()));
        assert_eq!(Some(&Expr::Ident("b".into())), stack.top());
        assert_eq!(1, stack.slots.len());
    }

    #[test]
    fn advance_with_separator_wraps_top() {
        let mut stack = StrStack::default();
        stack.load(Expr::Ident("%a".into()));
        stack.advance(Some(' ')).unwrap();
        stack.load(Expr::Ident("%b".into()));
        stack.rewind().unwrap();
        assert_eq!(
            Some(&Expr::Op(
                OpKind::ConcatSpc,
                vec![Expr::Ident("%a".into()), Expr::Ident("%b".into())]
            )),
            stack.top()
        );
    }

    #[test]
    fn advance_without_separator_builds_list() {
        let mut stack = StrStack::default();
        stack.load(Expr::Ident("name".into()));
        stack.advance(None).unwrap();
        stack.load(Expr::UintLit(3));
        stack.rewind().unwrap();
        assert_eq!(
            Some(&Expr::List(vec![
                Expr::Ident("name".into()),
                Expr::UintLit(3)
            ])),
            stack.top()
        );
    }

    #[test]
    fn nul_advance_prepares_string_comparison() {
        let mut stack = StrStack::default();
        stack.load(Expr::Ident("%s".into()));
        stack.advance(Some('\0')).unwrap();
        stack.load(Expr::StrLit("on".into()));
        let rhs = stack.pop_value().unwrap();
        let op = stack.pop_value().unwrap();
        let Expr::Op(kind, mut operands) = op else {
            panic!("expected comparison builder");
        };
        operands.push(rhs);
        assert_eq!(OpKind::StrEqual, kind);
        assert_eq!(
            vec![Expr::Ident("%s".into()), Expr::StrLit("on".into())],
            operands
        );
    }

    #[test]
    fn rewind_appends_into_open_concat() {
        let mut stack = StrStack::default();
        stack.load(Expr::Ident("%a".into()));
        stack.advance(Some('\n')).unwrap();
        stack.load(Expr::Ident("%b".into()));
        stack.rewind().unwrap();
        // `%a NL %b NL %c` nests: each advance wraps the chain so far.
        stack.advance(Some('\n')).unwrap();
        stack.load(Expr::Ident("%c".into()));
        stack.rewind().unwrap();
        let Some(Expr::Op(OpKind::ConcatNl, operands)) = stack.top() else {
            panic!("expected NL chain");
        };
        assert_eq!(2, operands.len());
        assert_eq!(
            Expr::Op(
                OpKind::ConcatNl,
                vec![Expr::Ident("%a".into()), Expr::Ident("%b".into())]
            ),
            operands[0]
        );
        assert_eq!(Expr::Ident("%c".into()), operands[1]);
    }
}
