//! Bytecode Generator: lowers the same AST the evaluator walks into
//! the stack-machine IR defined in `opcode.rs`, using the per-function state
//! kept in `builder.rs`.
//!
//! **Stack convention**, fixed once here and followed throughout: binary
//! arithmetic/comparison operators push the right operand then the left
//! ("Evaluation order" - top of stack ends up holding the left
//! operand). Field/index reads and writes push the object first, then the
//! key/index (`GetField`/`GetArrayElement`'s own doc comments in
//! `opcode.rs`); a store additionally needs the value pushed *before* the
//! object/key, which falls out naturally of the `Dup`-then-emit-the-read
//! pattern used for both simple and compound assignment below.

use crate::ast::{ForSpec, Node, SignalOp, Stmt, StmtKind, SwitchCase};
use crate::error::CsError;

use super::builder::{FunctionBuilder, GlobalRegistry};
use super::opcode::Opcode;

pub struct Codegen<'r> {
    registry: &'r mut GlobalRegistry,
}

impl<'r> Codegen<'r> {
    pub fn new(registry: &'r mut GlobalRegistry) -> Self {
        Self { registry }
    }

    /// Compiles a function/lambda body into a fresh, registered `FunctionCode`
    /// and returns the name it was pinned under ("Function / lambda
    /// compilation").
    pub fn compile_function(&mut self, hint: &str, arg_names: &[String], body: &[Stmt]) -> Result<String, CsError> {
        let name = self.registry.fresh_name(hint);
        let mut b = FunctionBuilder::new(name.clone(), arg_names.len());
        for (i, arg) in arg_names.iter().enumerate() {
            b.declare_arg(i as u32, arg);
        }
        self.compile_block(&mut b, body)?;
        if !b.block_terminated(b.current_block()) {
            b.emit(Opcode::LoadNull);
            b.emit(Opcode::Return);
        }
        let code = b.build();
        self.registry.register(code);
        Ok(name)
    }

    // ---- statements ---------------------------------------------------

    pub fn compile_block(&mut self, b: &mut FunctionBuilder, stmts: &[Stmt]) -> Result<(), CsError> {
        b.push_local_scope();
        for stmt in stmts {
            self.compile_stmt(b, stmt)?;
            if b.block_terminated(b.current_block()) {
                break;
            }
        }
        b.pop_local_scope();
        Ok(())
    }

    fn compile_stmt(&mut self, b: &mut FunctionBuilder, stmt: &Stmt) -> Result<(), CsError> {
        match &stmt.kind {
            StmtKind::Expression(e) => {
                self.compile_expr(b, e)?;
                b.emit(Opcode::Pop);
            }
            StmtKind::VarDef { name, init } => {
                self.compile_expr(b, init)?;
                let id = b.declare_local(name);
                b.emit(Opcode::SetLocal { id });
            }
            StmtKind::Return(opt) => {
                match opt {
                    Some(e) => self.compile_expr(b, e)?,
                    None => b.emit(Opcode::LoadNull),
                }
                b.emit(Opcode::Return);
            }
            StmtKind::Break => {
                let (_, break_target) = b
                    .loop_targets()
                    .ok_or_else(|| CsError::grammar("`break` outside any loop"))?;
                b.emit(Opcode::Branch { target: break_target });
                self.open_dead_block(b);
            }
            StmtKind::Continue => {
                let (continue_target, _) = b
                    .loop_targets()
                    .ok_or_else(|| CsError::grammar("`continue` outside any loop"))?;
                b.emit(Opcode::Branch { target: continue_target });
                self.open_dead_block(b);
            }
            StmtKind::Block(body) => self.compile_block(b, body)?,
            StmtKind::If { cond, body } => self.compile_if(b, cond, body)?,
            StmtKind::IfElse { cond, then_body, else_body } => self.compile_if_else(b, cond, then_body, else_body)?,
            StmtKind::Switch { scrutinee, cases, default } => self.compile_switch(b, scrutinee, cases, default.as_deref())?,
            StmtKind::While { cond, body } => self.compile_while(b, cond, body)?,
            StmtKind::Loop { cond, body } => self.compile_loop(b, cond, body)?,
            StmtKind::For { spec, body } => self.compile_for(b, spec, body)?,
            StmtKind::Foreach { var_name, iterable, body } => self.compile_foreach(b, var_name, iterable, body)?,
            StmtKind::Function(decl) => {
                let closure_name = self.compile_function(&decl.name, &decl.args, &decl.body)?;
                self.emit_closure_lookup(b, &closure_name);
                let id = b.declare_local(&decl.name);
                b.emit(Opcode::SetLocal { id });
            }
            StmtKind::Namespace { .. } => {
                return Err(CsError::unsupported("`namespace` has no bytecode lowering (the backend's IR has no domain-merge opcode)"));
            }
            StmtKind::Struct(_) => {
                return Err(CsError::unsupported("`struct` has no bytecode lowering (instance construction needs the excluded AST-level struct body at call time)"));
            }
            StmtKind::Try { .. } => {
                return Err(CsError::unsupported("`try`/`catch` has no bytecode lowering (the IR surface has no exception primitive)"));
            }
            StmtKind::Throw(_) => {
                return Err(CsError::unsupported("`throw` has no bytecode lowering (the IR surface has no exception primitive)"));
            }
        }
        Ok(())
    }

    fn open_dead_block(&mut self, b: &mut FunctionBuilder) {
        let nb = b.new_block();
        b.switch_to(nb);
    }

    /// `this.__global_registry`, `LoadString <name>`, `GetField` (    /// "Function / lambda compilation").
    fn emit_closure_lookup(&mut self, b: &mut FunctionBuilder, name: &str) {
        b.emit(Opcode::LoadThis);
        b.emit(Opcode::LoadString { value: "__global_registry".to_string() });
        b.emit(Opcode::GetField);
        b.emit(Opcode::LoadString { value: name.to_string() });
        b.emit(Opcode::GetField);
    }

    fn compile_if(&mut self, b: &mut FunctionBuilder, cond: &Node, body: &[Stmt]) -> Result<(), CsError> {
        self.compile_expr(b, cond)?;
        b.emit(Opcode::CastToBool);
        let body_block = b.new_block();
        let end_block = b.new_block();
        b.emit(Opcode::ConditionalBranch { then_block: body_block, else_block: end_block });
        b.switch_to(body_block);
        self.compile_block(b, body)?;
        if !b.block_terminated(b.current_block()) {
            b.emit(Opcode::Branch { target: end_block });
        }
        b.switch_to(end_block);
        Ok(())
    }

    fn compile_if_else(
        &mut self,
        b: &mut FunctionBuilder,
        cond: &Node,
        then_body: &[Stmt],
        else_body: &[Stmt],
    ) -> Result<(), CsError> {
        self.compile_expr(b, cond)?;
        b.emit(Opcode::CastToBool);
        let then_block = b.new_block();
        let else_block = b.new_block();
        let end_block = b.new_block();
        b.emit(Opcode::ConditionalBranch { then_block, else_block });
        b.switch_to(then_block);
        self.compile_block(b, then_body)?;
        if !b.block_terminated(b.current_block()) {
            b.emit(Opcode::Branch { target: end_block });
        }
        b.switch_to(else_block);
        self.compile_block(b, else_body)?;
        if !b.block_terminated(b.current_block()) {
            b.emit(Opcode::Branch { target: end_block });
        }
        b.switch_to(end_block);
        Ok(())
    }

    /// Lowered as a sequential `TestEq` chain against the scrutinee, held in
    /// an anonymous local so it's evaluated exactly once ("switch/case/default").
    fn compile_switch(
        &mut self,
        b: &mut FunctionBuilder,
        scrutinee: &Node,
        cases: &[SwitchCase],
        default: Option<&[Stmt]>,
    ) -> Result<(), CsError> {
        self.compile_expr(b, scrutinee)?;
        let scrutinee_local = b.anonymous_local();
        b.emit(Opcode::SetLocal { id: scrutinee_local });
        let end_block = b.new_block();

        for case in cases {
            self.compile_expr(b, &case.value)?;
            b.emit(Opcode::GetLocal { id: scrutinee_local });
            b.emit(Opcode::TestEq);
            b.emit(Opcode::CastToBool);
            let body_block = b.new_block();
            let next_block = b.new_block();
            b.emit(Opcode::ConditionalBranch { then_block: body_block, else_block: next_block });
            b.switch_to(body_block);
            self.compile_block(b, &case.body)?;
            if !b.block_terminated(b.current_block()) {
                b.emit(Opcode::Branch { target: end_block });
            }
            b.switch_to(next_block);
        }
        if let Some(default_body) = default {
            self.compile_block(b, default_body)?;
        }
        if !b.block_terminated(b.current_block()) {
            b.emit(Opcode::Branch { target: end_block });
        }
        b.switch_to(end_block);
        Ok(())
    }

    /// "while": pre -> Branch(check); check -> ConditionalBranch(body,
    /// end-wrapper); end-wrapper is the stable `break` target, inserted
    /// before the loop is known to end so `break` can branch to it from
    /// inside the body.
    fn compile_while(&mut self, b: &mut FunctionBuilder, cond: &Node, body: &[Stmt]) -> Result<(), CsError> {
        let check_block = b.new_block();
        b.emit(Opcode::Branch { target: check_block });
        b.switch_to(check_block);
        self.compile_expr(b, cond)?;
        b.emit(Opcode::CastToBool);
        let body_block = b.new_block();
        let break_wrapper = b.new_block();
        let end_block = b.new_block();
        b.emit(Opcode::ConditionalBranch { then_block: body_block, else_block: break_wrapper });

        b.switch_to(body_block);
        b.enter_loop(check_block, break_wrapper);
        self.compile_block(b, body)?;
        b.exit_loop();
        if !b.block_terminated(b.current_block()) {
            b.emit(Opcode::Branch { target: check_block });
        }

        b.switch_to(break_wrapper);
        b.emit(Opcode::Branch { target: end_block });
        b.switch_to(end_block);
        Ok(())
    }

    /// "loop (post-condition do..until)": the body always runs once;
    /// the check block tests the until-condition at the *end* of each
    /// iteration and loops back on false.
    fn compile_loop(&mut self, b: &mut FunctionBuilder, cond: &Node, body: &[Stmt]) -> Result<(), CsError> {
        let body_block = b.new_block();
        b.emit(Opcode::Branch { target: body_block });

        let check_block = b.new_block();
        let break_wrapper = b.new_block();
        let end_block = b.new_block();

        b.switch_to(body_block);
        b.enter_loop(check_block, break_wrapper);
        self.compile_block(b, body)?;
        b.exit_loop();
        if !b.block_terminated(b.current_block()) {
            b.emit(Opcode::Branch { target: check_block });
        }

        b.switch_to(check_block);
        self.compile_expr(b, cond)?;
        b.emit(Opcode::CastToBool);
        b.emit(Opcode::ConditionalBranch { then_block: break_wrapper, else_block: body_block });

        b.switch_to(break_wrapper);
        b.emit(Opcode::Branch { target: end_block });
        b.switch_to(end_block);
        Ok(())
    }

    /// Desugars `for x = start to end [step s]` into a counted `while`-shaped
    /// loop over a hidden loop variable ("for and foreach").
    fn compile_for(&mut self, b: &mut FunctionBuilder, spec: &ForSpec, body: &[Stmt]) -> Result<(), CsError> {
        self.compile_expr(b, &spec.start)?;
        let var_id = b.declare_local(&spec.var_name);
        b.emit(Opcode::SetLocal { id: var_id });

        self.compile_expr(b, &spec.end)?;
        let end_local = b.anonymous_local();
        b.emit(Opcode::SetLocal { id: end_local });

        let step_local = b.anonymous_local();
        match &spec.step {
            Some(step) => self.compile_expr(b, step)?,
            None => b.emit(Opcode::LoadInt { value: 1 }),
        }
        b.emit(Opcode::SetLocal { id: step_local });

        let check_block = b.new_block();
        b.emit(Opcode::Branch { target: check_block });
        b.switch_to(check_block);
        // ascending: var <= end; descending (negative step) handled the same
        // way the tree-walker does - the caller is responsible for a step
        // whose sign matches the direction of travel.
        b.emit(Opcode::GetLocal { id: end_local });
        b.emit(Opcode::GetLocal { id: var_id });
        b.emit(Opcode::TestLe);
        b.emit(Opcode::CastToBool);

        let body_block = b.new_block();
        let break_wrapper = b.new_block();
        let end_block = b.new_block();
        b.emit(Opcode::ConditionalBranch { then_block: body_block, else_block: break_wrapper });

        b.switch_to(body_block);
        b.enter_loop(check_block, break_wrapper);
        self.compile_block(b, body)?;
        b.exit_loop();
        if !b.block_terminated(b.current_block()) {
            b.emit(Opcode::GetLocal { id: var_id });
            b.emit(Opcode::GetLocal { id: step_local });
            b.emit(Opcode::Add);
            b.emit(Opcode::SetLocal { id: var_id });
            b.emit(Opcode::Branch { target: check_block });
        }

        b.switch_to(break_wrapper);
        b.emit(Opcode::Branch { target: end_block });
        b.switch_to(end_block);
        Ok(())
    }

    /// Index-based `foreach` over arrays/strings, the two container kinds
    /// expressible without a dedicated iterator opcode; hash-map iteration
    /// is left to the tree-walker (decision, see DESIGN.md).
    fn compile_foreach(&mut self, b: &mut FunctionBuilder, var_name: &str, iterable: &Node, body: &[Stmt]) -> Result<(), CsError> {
        self.compile_expr(b, iterable)?;
        let container_local = b.anonymous_local();
        b.emit(Opcode::SetLocal { id: container_local });

        b.emit(Opcode::GetLocal { id: container_local });
        b.emit(Opcode::LoadString { value: "size".to_string() });
        b.emit(Opcode::CallField { argc: 0 });
        let size_local = b.anonymous_local();
        b.emit(Opcode::SetLocal { id: size_local });

        b.emit(Opcode::LoadInt { value: 0 });
        let index_local = b.anonymous_local();
        b.emit(Opcode::SetLocal { id: index_local });

        let check_block = b.new_block();
        b.emit(Opcode::Branch { target: check_block });
        b.switch_to(check_block);
        b.emit(Opcode::GetLocal { id: size_local });
        b.emit(Opcode::GetLocal { id: index_local });
        b.emit(Opcode::TestLt);
        b.emit(Opcode::CastToBool);

        let body_block = b.new_block();
        let break_wrapper = b.new_block();
        let end_block = b.new_block();
        b.emit(Opcode::ConditionalBranch { then_block: body_block, else_block: break_wrapper });

        b.switch_to(body_block);
        b.push_local_scope();
        b.emit(Opcode::GetLocal { id: container_local });
        b.emit(Opcode::GetLocal { id: index_local });
        b.emit(Opcode::GetArrayElement);
        let elem_id = b.declare_local(var_name);
        b.emit(Opcode::SetLocal { id: elem_id });

        b.enter_loop(check_block, break_wrapper);
        for stmt in body {
            self.compile_stmt(b, stmt)?;
            if b.block_terminated(b.current_block()) {
                break;
            }
        }
        b.exit_loop();
        b.pop_local_scope();
        if !b.block_terminated(b.current_block()) {
            b.emit(Opcode::GetLocal { id: index_local });
            b.emit(Opcode::LoadInt { value: 1 });
            b.emit(Opcode::Add);
            b.emit(Opcode::SetLocal { id: index_local });
            b.emit(Opcode::Branch { target: check_block });
        }

        b.switch_to(break_wrapper);
        b.emit(Opcode::Branch { target: end_block });
        b.switch_to(end_block);
        Ok(())
    }

    // ---- expressions ----------------------------------------------------

    #[allow(clippy::too_many_lines)]
    pub fn compile_expr(&mut self, b: &mut FunctionBuilder, node: &Node) -> Result<(), CsError> {
        use SignalOp as S;
        match node {
            Node::Value(v) => self.emit_literal(b, v)?,
            Node::Id(name) => self.emit_identifier(b, name),
            Node::Expr(inner) => self.compile_expr(b, inner)?,
            Node::EndLine => b.emit(Opcode::LoadNull),
            Node::Array(items) => self.compile_array_literal(b, items)?,
            Node::ArgList(_) => return Err(CsError::grammar("argument list compiled outside a call")),
            Node::Signal { op: S::Add | S::Sub | S::Mul | S::Div | S::Mod | S::Pow, left: Some(l), right: Some(r) } => {
                self.compile_expr(b, r)?;
                self.compile_expr(b, l)?;
                b.emit(arith_opcode(*op_of(node)));
            }
            Node::Signal { op: S::Minus, left, right } => {
                let operand = right.as_deref().or(left.as_deref()).ok_or_else(|| CsError::grammar("unary `-` missing operand"))?;
                b.emit(Opcode::LoadInt { value: 0 });
                self.compile_expr(b, operand)?;
                b.emit(Opcode::Sub);
            }
            Node::Signal { op: S::Escape, left, right } => {
                let operand = right.as_deref().or(left.as_deref()).ok_or_else(|| CsError::grammar("unary `*` missing operand"))?;
                self.compile_expr(b, operand)?;
                b.emit(Opcode::Dereference);
            }
            Node::Signal { op: S::Not, left, right } => {
                let operand = right.as_deref().or(left.as_deref()).ok_or_else(|| CsError::grammar("`!` missing operand"))?;
                self.compile_expr(b, operand)?;
                b.emit(Opcode::Not);
            }
            Node::Signal { op: S::TypeId, left, right } => {
                let operand = right.as_deref().or(left.as_deref()).ok_or_else(|| CsError::grammar("`typeid` missing operand"))?;
                self.compile_expr(b, operand)?;
                b.emit(Opcode::TypeId);
            }
            Node::Signal { op: S::Und | S::Abo | S::Ueq | S::Aeq, left: Some(l), right: Some(r) } => {
                self.compile_expr(b, r)?;
                self.compile_expr(b, l)?;
                b.emit(compare_opcode(*op_of(node)));
            }
            Node::Signal { op: S::Equ | S::Neq, left: Some(l), right: Some(r) } => {
                self.compile_expr(b, r)?;
                self.compile_expr(b, l)?;
                b.emit(Opcode::TestEq);
                if matches!(op_of(node), S::Neq) {
                    b.emit(Opcode::Not);
                }
            }
            Node::Signal { op: S::And, left: Some(l), right: Some(r) } => {
                self.compile_expr(b, r)?;
                self.compile_expr(b, l)?;
                b.emit(Opcode::And);
            }
            Node::Signal { op: S::Or, left: Some(l), right: Some(r) } => {
                self.compile_expr(b, r)?;
                self.compile_expr(b, l)?;
                b.emit(Opcode::Or);
            }
            Node::Signal { op: S::Inc | S::Dec, left, right } => self.compile_inc_dec(b, *op_of(node), left.as_deref(), right.as_deref())?,
            Node::Signal { op: S::Asi, left: Some(l), right: Some(r) } => self.compile_assign(b, l, r)?,
            Node::Signal { op: S::AddAsi | S::SubAsi | S::MulAsi | S::DivAsi | S::ModAsi | S::PowAsi, left: Some(l), right: Some(r) } => {
                self.compile_compound_assign(b, *op_of(node), l, r)?;
            }
            Node::Signal { op: S::Choice, left: Some(cond), right: Some(branches) } => self.compile_choice(b, cond, branches)?,
            Node::Signal { op: S::Pair, left: Some(l), right: Some(r) } => self.compile_pair(b, l, r)?,
            Node::Signal { op: S::Dot, left: Some(obj), right: Some(name_node) } => {
                let name = name_node.as_id().ok_or_else(|| CsError::grammar("`.` right operand must be an identifier"))?;
                self.compile_expr(b, obj)?;
                b.emit(Opcode::LoadString { value: name.to_string() });
                b.emit(Opcode::GetField);
            }
            Node::Signal { op: S::Arrow, left: Some(ptr), right: Some(name_node) } => {
                let name = name_node.as_id().ok_or_else(|| CsError::grammar("`->` right operand must be an identifier"))?;
                self.compile_expr(b, ptr)?;
                b.emit(Opcode::Dereference);
                b.emit(Opcode::LoadString { value: name.to_string() });
                b.emit(Opcode::GetField);
            }
            Node::Signal { op: S::New | S::GcNew, .. } => {
                return Err(CsError::unsupported("`new`/`gcnew` has no bytecode lowering (struct construction needs the excluded AST-level struct body at call time)"));
            }
            Node::Signal { op: S::Access, left: Some(target), right: Some(index) } => {
                self.compile_expr(b, target)?;
                self.compile_expr(b, index)?;
                b.emit(Opcode::GetArrayElement);
            }
            Node::Signal { op: S::FCall, left: Some(callee), right: Some(args_node) } => {
                let Node::ArgList(arg_nodes) = args_node.as_ref() else {
                    return Err(CsError::grammar("call right operand must be an argument list"));
                };
                self.compile_expr(b, callee)?;
                for arg in arg_nodes {
                    self.compile_expr(b, arg)?;
                }
                b.emit(Opcode::Call { argc: arg_nodes.len() as u32 });
            }
            Node::Signal { op: S::Lambda, left: Some(args_node), right: Some(body_expr) } => {
                self.compile_lambda(b, args_node, body_expr)?;
            }
            Node::Signal { op: S::VarDef, .. } => {
                return Err(CsError::grammar("`var` reached the generator unrewritten - the optimizer should have folded it to a bare identifier"));
            }
            Node::Signal { op: S::Emb, .. } => {
                return Err(CsError::grammar("`emb` may only appear inside a lambda argument list"));
            }
            Node::Signal { .. } => return Err(CsError::grammar("malformed expression (missing operand)")),
        }
        Ok(())
    }

    fn emit_literal(&mut self, b: &mut FunctionBuilder, v: &crate::value::Value) -> Result<(), CsError> {
        use crate::value::Repr;
        match &v.repr {
            Repr::Bool(x) => b.emit(Opcode::LoadBool { value: *x }),
            Repr::Int(x) => b.emit(Opcode::LoadInt { value: *x }),
            Repr::Float(x) => b.emit(Opcode::LoadFloat { value: *x }),
            Repr::Str(s) => b.emit(Opcode::LoadString { value: String::from_utf8_lossy(&s.borrow()).into_owned() }),
            Repr::Null => b.emit(Opcode::LoadNull),
            _ => return Err(CsError::unsupported("this constant kind has no literal bytecode opcode")),
        }
        Ok(())
    }

    fn emit_identifier(&mut self, b: &mut FunctionBuilder, name: &str) {
        if let Some(id) = b.lookup_local(name) {
            b.emit(Opcode::GetLocal { id });
        } else {
            b.note_external(name);
            b.emit(Opcode::LoadThis);
            b.emit(Opcode::LoadString { value: name.to_string() });
            b.emit(Opcode::GetField);
        }
    }

    /// An empty array/map literal is the `array.__new__` factory call; each
    /// element is appended with `push_back` ("Arrays / maps"). Constant
    /// literals fold away before reaching the generator (), so every
    /// literal seen here has at least one non-constant element.
    fn compile_array_literal(&mut self, b: &mut FunctionBuilder, items: &[Node]) -> Result<(), CsError> {
        b.emit(Opcode::LoadThis);
        b.emit(Opcode::LoadString { value: "array".to_string() });
        b.emit(Opcode::GetField);
        b.emit(Opcode::LoadString { value: "__new__".to_string() });
        b.emit(Opcode::CallField { argc: 0 });
        let arr_local = b.anonymous_local();
        b.emit(Opcode::SetLocal { id: arr_local });
        for item in items {
            b.emit(Opcode::GetLocal { id: arr_local });
            b.emit(Opcode::LoadString { value: "push_back".to_string() });
            self.compile_expr(b, item)?;
            b.emit(Opcode::CallField { argc: 1 });
            b.emit(Opcode::Pop);
        }
        b.emit(Opcode::GetLocal { id: arr_local });
        Ok(())
    }

    fn compile_pair(&mut self, b: &mut FunctionBuilder, key: &Node, value: &Node) -> Result<(), CsError> {
        b.emit(Opcode::LoadThis);
        b.emit(Opcode::LoadString { value: "pair".to_string() });
        b.emit(Opcode::GetField);
        b.emit(Opcode::LoadString { value: "__new__".to_string() });
        self.compile_expr(b, key)?;
        self.compile_expr(b, value)?;
        b.emit(Opcode::CallField { argc: 2 });
        Ok(())
    }

    /// Ternary: both branches run in their own block so only the chosen one
    /// executes; the result is threaded through an anonymous local rather
    /// than left on an un-merged stack.
    fn compile_choice(&mut self, b: &mut FunctionBuilder, cond: &Node, branches: &Node) -> Result<(), CsError> {
        let Node::Signal { op: SignalOp::Pair, left: then_n, right: else_n } = branches else {
            return Err(CsError::grammar("`?:` requires a `then:else` pair"));
        };
        let then_expr = then_n.as_deref().ok_or_else(|| CsError::grammar("`?:` missing a branch"))?;
        let else_expr = else_n.as_deref().ok_or_else(|| CsError::grammar("`?:` missing a branch"))?;

        self.compile_expr(b, cond)?;
        b.emit(Opcode::CastToBool);
        let then_block = b.new_block();
        let else_block = b.new_block();
        let end_block = b.new_block();
        b.emit(Opcode::ConditionalBranch { then_block, else_block });

        let result_local = b.anonymous_local();
        b.switch_to(then_block);
        self.compile_expr(b, then_expr)?;
        b.emit(Opcode::SetLocal { id: result_local });
        b.emit(Opcode::Branch { target: end_block });

        b.switch_to(else_block);
        self.compile_expr(b, else_expr)?;
        b.emit(Opcode::SetLocal { id: result_local });
        b.emit(Opcode::Branch { target: end_block });

        b.switch_to(end_block);
        b.emit(Opcode::GetLocal { id: result_local });
        Ok(())
    }

    fn compile_inc_dec(&mut self, b: &mut FunctionBuilder, op: SignalOp, left: Option<&Node>, right: Option<&Node>) -> Result<(), CsError> {
        let (lvalue, prefix) = match (left, right) {
            (None, Some(r)) => (r, true),
            (Some(l), None) => (l, false),
            _ => return Err(CsError::grammar("`++`/`--` must have exactly one operand")),
        };
        let timing = if prefix { ResultTiming::New } else { ResultTiming::Old };
        let delta = if op == SignalOp::Inc { Opcode::IntAdd } else { Opcode::IntSub };
        self.compile_modify(b, lvalue, timing, &mut |bb: &mut FunctionBuilder| {
            bb.emit(Opcode::LoadInt { value: 1 });
            bb.emit(Opcode::Rotate2);
            bb.emit(delta.clone());
        })
    }

    fn compile_compound_assign(&mut self, b: &mut FunctionBuilder, op: SignalOp, lvalue: &Node, rhs: &Node) -> Result<(), CsError> {
        self.compile_expr(b, rhs)?;
        let rhs_local = b.anonymous_local();
        b.emit(Opcode::SetLocal { id: rhs_local });
        let base = base_arith_opcode(op);
        self.compile_modify(b, lvalue, ResultTiming::New, &mut |bb: &mut FunctionBuilder| {
            bb.emit(Opcode::GetLocal { id: rhs_local });
            bb.emit(Opcode::Rotate2);
            bb.emit(base.clone());
        })
    }

    /// Simple assignment ("Assignment transformation"): push the rhs,
    /// `Dup` it, then emit the l-value as a *read* and rewrite the last
    /// emitted instruction into its store form. Works because emitting the
    /// read costs nothing at compile time - it only becomes the store op
    /// once rewritten, never executing as a read.
    fn compile_assign(&mut self, b: &mut FunctionBuilder, lvalue: &Node, rhs: &Node) -> Result<(), CsError> {
        self.compile_expr(b, rhs)?;
        b.emit(Opcode::Dup);
        self.compile_expr(b, lvalue)?;
        b.rewrite_last_to_store()
    }

    /// Modify-in-place transformation shared by compound assignment and
    /// inc/dec: materializes the l-value's addressing operands into
    /// anonymous locals so they can be pushed twice (once to read, once to
    /// write back) without re-evaluating a possibly-effectful sub-expression.
    fn compile_modify(
        &mut self,
        b: &mut FunctionBuilder,
        lvalue: &Node,
        timing: ResultTiming,
        compute: &mut dyn FnMut(&mut FunctionBuilder),
    ) -> Result<(), CsError> {
        match lvalue {
            Node::Id(name) => {
                if let Some(id) = b.lookup_local(name) {
                    b.emit(Opcode::GetLocal { id });
                    let result_local = self.snapshot_if(b, timing, ResultTiming::Old);
                    compute(b);
                    let result_local = result_local.or_else(|| self.snapshot_if(b, timing, ResultTiming::New));
                    b.emit(Opcode::SetLocal { id });
                    b.emit(Opcode::GetLocal { id: result_local.expect("one snapshot branch always taken") });
                } else {
                    b.note_external(name);
                    b.emit(Opcode::LoadThis);
                    b.emit(Opcode::LoadString { value: name.to_string() });
                    b.emit(Opcode::GetField);
                    let result_local = self.snapshot_if(b, timing, ResultTiming::Old);
                    compute(b);
                    let result_local = result_local.or_else(|| self.snapshot_if(b, timing, ResultTiming::New));
                    b.emit(Opcode::LoadThis);
                    b.emit(Opcode::LoadString { value: name.to_string() });
                    b.emit(Opcode::SetField);
                    b.emit(Opcode::GetLocal { id: result_local.expect("one snapshot branch always taken") });
                }
            }
            Node::Signal { op: SignalOp::Dot, left: Some(obj_expr), right: Some(name_node) } => {
                let name = name_node.as_id().ok_or_else(|| CsError::grammar("`.` right operand must be an identifier"))?.to_string();
                self.compile_expr(b, obj_expr)?;
                let obj_local = b.anonymous_local();
                b.emit(Opcode::Dup);
                b.emit(Opcode::SetLocal { id: obj_local });
                b.emit(Opcode::LoadString { value: name.clone() });
                b.emit(Opcode::GetField);
                let result_local = self.snapshot_if(b, timing, ResultTiming::Old);
                compute(b);
                let result_local = result_local.or_else(|| self.snapshot_if(b, timing, ResultTiming::New));
                b.emit(Opcode::GetLocal { id: obj_local });
                b.emit(Opcode::LoadString { value: name });
                b.emit(Opcode::SetField);
                b.emit(Opcode::GetLocal { id: result_local.expect("one snapshot branch always taken") });
            }
            Node::Signal { op: SignalOp::Access, left: Some(obj_expr), right: Some(index_expr) } => {
                self.compile_expr(b, obj_expr)?;
                let obj_local = b.anonymous_local();
                b.emit(Opcode::Dup);
                b.emit(Opcode::SetLocal { id: obj_local });
                self.compile_expr(b, index_expr)?;
                let index_local = b.anonymous_local();
                b.emit(Opcode::Dup);
                b.emit(Opcode::SetLocal { id: index_local });
                b.emit(Opcode::GetArrayElement);
                let result_local = self.snapshot_if(b, timing, ResultTiming::Old);
                compute(b);
                let result_local = result_local.or_else(|| self.snapshot_if(b, timing, ResultTiming::New));
                b.emit(Opcode::GetLocal { id: obj_local });
                b.emit(Opcode::GetLocal { id: index_local });
                b.emit(Opcode::SetArrayElement);
                b.emit(Opcode::GetLocal { id: result_local.expect("one snapshot branch always taken") });
            }
            _ => return Err(CsError::grammar("malformed l-value for modify-in-place")),
        }
        Ok(())
    }

    /// Saves the current top-of-stack value (without consuming it) into a
    /// fresh anonymous local when `timing == want`, returning that local.
    fn snapshot_if(&mut self, b: &mut FunctionBuilder, timing: ResultTiming, want: ResultTiming) -> Option<u32> {
        if timing != want {
            return None;
        }
        b.emit(Opcode::Dup);
        let id = b.anonymous_local();
        b.emit(Opcode::SetLocal { id });
        Some(id)
    }

    fn compile_lambda(&mut self, b: &mut FunctionBuilder, args_node: &Node, body_expr: &Node) -> Result<(), CsError> {
        let Node::ArgList(arg_nodes) = args_node else {
            return Err(CsError::grammar("lambda argument list is malformed"));
        };
        let mut names = Vec::with_capacity(arg_nodes.len());
        for n in arg_nodes {
            let name = n.as_id().ok_or_else(|| CsError::grammar("lambda arguments must be identifiers"))?;
            names.push(name.to_string());
        }
        let body = vec![Stmt::new(StmtKind::Return(Some(body_expr.clone())), crate::ast::SourceLoc::default())];
        let closure_name = self.compile_function("lambda", &names, &body)?;
        self.emit_closure_lookup(b, &closure_name);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultTiming {
    Old,
    New,
}

fn op_of(node: &Node) -> &SignalOp {
    match node {
        Node::Signal { op, .. } => op,
        _ => unreachable!("op_of called on a non-signal node"),
    }
}

fn arith_opcode(op: SignalOp) -> Opcode {
    match op {
        SignalOp::Add => Opcode::Add,
        SignalOp::Sub => Opcode::Sub,
        SignalOp::Mul => Opcode::Mul,
        SignalOp::Div => Opcode::Div,
        SignalOp::Mod => Opcode::Mod,
        SignalOp::Pow => Opcode::Pow,
        _ => unreachable!("arith_opcode called on a non-arithmetic op"),
    }
}

fn base_arith_opcode(op: SignalOp) -> Opcode {
    match op {
        SignalOp::AddAsi => Opcode::Add,
        SignalOp::SubAsi => Opcode::Sub,
        SignalOp::MulAsi => Opcode::Mul,
        SignalOp::DivAsi => Opcode::Div,
        SignalOp::ModAsi => Opcode::Mod,
        SignalOp::PowAsi => Opcode::Pow,
        _ => unreachable!("base_arith_opcode called on a non-compound-assignment op"),
    }
}

fn compare_opcode(op: SignalOp) -> Opcode {
    match op {
        SignalOp::Und => Opcode::TestLt,
        SignalOp::Abo => Opcode::TestGt,
        SignalOp::Ueq => Opcode::TestLe,
        SignalOp::Aeq => Opcode::TestGe,
        _ => unreachable!("compare_opcode called on a non-comparison op"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{SourceLoc, StmtKind};
    use crate::value::Value;
    use pretty_assertions::assert_eq;

    fn num(n: i64) -> Node {
        Node::Value(Value::int(n))
    }

    #[test]
    fn constant_arithmetic_pushes_right_then_left() {
        let mut registry = GlobalRegistry::new();
        let mut cg = Codegen::new(&mut registry);
        let mut b = FunctionBuilder::new("f", 0);
        let node = Node::signal(SignalOp::Sub, Some(num(10)), Some(num(3)));
        cg.compile_expr(&mut b, &node).unwrap();
        let code = b.build();
        assert_eq!(
            &code.blocks[1][..],
            &[Opcode::LoadInt { value: 3 }, Opcode::LoadInt { value: 10 }, Opcode::Sub]
        );
    }

    #[test]
    fn simple_assignment_to_local_dups_and_rewrites() {
        let mut registry = GlobalRegistry::new();
        let mut cg = Codegen::new(&mut registry);
        let mut b = FunctionBuilder::new("f", 0);
        let id = b.declare_local("x");
        let node = Node::signal(SignalOp::Asi, Some(Node::Id("x".to_string())), Some(num(5)));
        cg.compile_expr(&mut b, &node).unwrap();
        let code = b.build();
        assert_eq!(&code.blocks[1][..], &[Opcode::LoadInt { value: 5 }, Opcode::Dup, Opcode::SetLocal { id }]);
    }

    #[test]
    fn if_statement_lowers_to_conditional_branch_with_merge_block() {
        let mut registry = GlobalRegistry::new();
        let mut cg = Codegen::new(&mut registry);
        let mut b = FunctionBuilder::new("f", 0);
        let stmt = Stmt::new(
            StmtKind::If { cond: Node::Value(Value::bool(true)), body: vec![] },
            SourceLoc::default(),
        );
        cg.compile_block(&mut b, std::slice::from_ref(&stmt)).unwrap();
        let code = b.build();
        assert!(code.blocks[1].iter().any(|op| matches!(op, Opcode::ConditionalBranch { .. })));
    }

    #[test]
    fn while_loop_break_targets_the_end_wrapper() {
        let mut registry = GlobalRegistry::new();
        let mut cg = Codegen::new(&mut registry);
        let mut b = FunctionBuilder::new("f", 0);
        let body = vec![Stmt::new(StmtKind::Break, SourceLoc::default())];
        let stmt = Stmt::new(StmtKind::While { cond: Node::Value(Value::bool(true)), body }, SourceLoc::default());
        cg.compile_block(&mut b, std::slice::from_ref(&stmt)).unwrap();
        let code = b.build();
        assert!(code.blocks.iter().any(|blk| blk.iter().any(|op| matches!(op, Opcode::Branch { .. }))));
    }

    #[test]
    fn function_statement_pins_into_registry_and_loads_closure() {
        let mut registry = GlobalRegistry::new();
        let mut cg = Codegen::new(&mut registry);
        let mut b = FunctionBuilder::new("f", 0);
        let decl = crate::ast::FunctionDecl { name: "g".to_string(), args: vec![], body: vec![] };
        let stmt = Stmt::new(StmtKind::Function(decl), SourceLoc::default());
        cg.compile_block(&mut b, std::slice::from_ref(&stmt)).unwrap();
        assert_eq!(registry.functions.len(), 1);
    }

    #[test]
    fn struct_statement_is_unsupported() {
        let mut registry = GlobalRegistry::new();
        let mut cg = Codegen::new(&mut registry);
        let mut b = FunctionBuilder::new("f", 0);
        let decl = crate::ast::StructDecl { name: "Point".to_string(), body: vec![] };
        let stmt = Stmt::new(StmtKind::Struct(decl), SourceLoc::default());
        assert!(matches!(cg.compile_block(&mut b, std::slice::from_ref(&stmt)), Err(CsError::Unsupported(_))));
    }

    #[test]
    fn postfix_increment_snapshots_old_value() {
        let mut registry = GlobalRegistry::new();
        let mut cg = Codegen::new(&mut registry);
        let mut b = FunctionBuilder::new("f", 0);
        b.declare_local("x");
        let node = Node::signal(SignalOp::Inc, Some(Node::Id("x".to_string())), None);
        cg.compile_expr(&mut b, &node).unwrap();
        let code = b.build();
        assert!(code.blocks[1].iter().any(|op| matches!(op, Opcode::IntAdd)));
    }
}
