// File: src/compiler.rs
//
// Bytecode compiler for Smalt.
// Single pass over the AST, one bytecode unit per lexical scope. Name
// resolution order: self, locals, instance fields (absolute index across
// the hierarchy), class variables, globals. Blocks compile against the
// enclosing scope's flat local frame.

use std::sync::Arc;

use ahash::AHashMap;

use crate::ast::{ClassDef, Expr, MethodDef, Program, Stmt};
use crate::bytecode::{
    pack_closure, pack_send, BytecodeUnit, ClassSpec, Constant, MethodSpec, Op,
};
use crate::errors::SmaltError;
use crate::lexer::tokenize;
use crate::parser::Parser;

/// Operand packing limits. Send selectors get 23 bits, closure bodies 15;
/// counts travel in single bytes.
const MAX_SELECTOR_INDEX: usize = 0x7f_ffff;
const MAX_ARG_COUNT: usize = 255;
const MAX_BLOCK_BODY_INDEX: usize = 0x7fff;
const MAX_LOCAL_SLOTS: usize = 255;

/// What kind of scope a statement list belongs to. Blocks turn `^` into a
/// non-local return; methods and the top level return locally.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ScopeKind {
    TopLevel,
    Method,
    Block,
}

/// Field and class-variable tables for the class whose method is being
/// compiled. Empty outside of class bodies.
struct ClassCtx {
    /// Instance-field name to absolute index (superclass fields first).
    fields: AHashMap<String, usize>,
    /// Class-variable name to slot within the defining class.
    class_vars: AHashMap<String, usize>,
    /// True when compiling any method body, so `super` is meaningful.
    in_method: bool,
}

impl ClassCtx {
    fn top_level() -> Self {
        Self { fields: AHashMap::new(), class_vars: AHashMap::new(), in_method: false }
    }
}

/// The flat local frame of one method (or top-level) compilation. Blocks
/// append their parameters here; slot indices are never reused.
struct MethodScope {
    locals: Vec<String>,
    /// Counts MakeClosure emissions, used to reject temporary declarations
    /// after a block literal in the same statement list.
    closures_emitted: usize,
}

impl MethodScope {
    fn new(params: &[String]) -> Self {
        Self { locals: params.to_vec(), closures_emitted: 0 }
    }

    fn resolve(&self, name: &str) -> Option<usize> {
        // Later declarations shadow earlier ones.
        self.locals.iter().rposition(|n| n == name)
    }
}

/// Compile-time view of an already-defined class, kept so subclasses can
/// be compiled later in the same session (or REPL line).
struct ClassInfo {
    /// Absolute field layout: superclass fields first, in declaration
    /// order from the root down.
    field_layout: Vec<String>,
}

pub struct Compiler {
    /// Class registry keyed by class name, for superclass lookups.
    classes: AHashMap<String, ClassInfo>,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        Self { classes: AHashMap::new() }
    }

    /// Lex, parse and compile a source string in one step.
    pub fn compile_source(&mut self, source: &str) -> Result<BytecodeUnit, SmaltError> {
        let tokens = tokenize(source)?;
        let program = Parser::new(tokens).parse()?;
        self.compile(&program)
    }

    /// Compile a parsed program into the top-level bytecode unit.
    pub fn compile(&mut self, program: &Program) -> Result<BytecodeUnit, SmaltError> {
        let mut unit = BytecodeUnit::new();
        let mut scope = MethodScope::new(&[]);
        let ctx = ClassCtx::top_level();
        self.compile_statements(
            &program.statements,
            &mut unit,
            &mut scope,
            &ctx,
            ScopeKind::TopLevel,
        )?;
        Ok(unit)
    }

    /// Compile a statement list. The final expression statement keeps its
    /// value on the stack so it becomes the scope's implicit return value;
    /// every other expression result is popped.
    fn compile_statements(
        &mut self,
        statements: &[Stmt],
        unit: &mut BytecodeUnit,
        scope: &mut MethodScope,
        ctx: &ClassCtx,
        kind: ScopeKind,
    ) -> Result<(), SmaltError> {
        let closures_at_entry = scope.closures_emitted;

        for (i, stmt) in statements.iter().enumerate() {
            let is_last = i == statements.len() - 1;
            match stmt {
                Stmt::VariableDeclaration(names) => {
                    // Flat-frame model: a block created earlier in this list
                    // has claimed the next slots for its parameters.
                    if scope.closures_emitted > closures_at_entry {
                        return Err(SmaltError::compile_error(
                            "Cannot declare temporaries after a block literal in the same scope"
                                .to_string(),
                        ));
                    }
                    for name in names {
                        if scope.locals.len() >= MAX_LOCAL_SLOTS {
                            return Err(SmaltError::compile_error(format!(
                                "Too many locals in one frame (limit {})",
                                MAX_LOCAL_SLOTS
                            )));
                        }
                        scope.locals.push(name.clone());
                    }
                }
                Stmt::Return(value) => {
                    self.compile_expr(value, unit, scope, ctx)?;
                    match kind {
                        ScopeKind::Block => unit.emit(Op::NonLocalReturn, 0),
                        _ => unit.emit(Op::Return, 0),
                    };
                }
                Stmt::Expression(expr) => {
                    self.compile_expr(expr, unit, scope, ctx)?;
                    if !is_last {
                        unit.emit(Op::Pop, 0);
                    }
                }
                Stmt::ClassDefinition(def) => {
                    if kind != ScopeKind::TopLevel {
                        return Err(SmaltError::compile_error(
                            "Class definitions are only allowed at the top level".to_string(),
                        ));
                    }
                    self.compile_class(def, unit)?;
                }
            }
        }
        Ok(())
    }

    fn compile_expr(
        &mut self,
        expr: &Expr,
        unit: &mut BytecodeUnit,
        scope: &mut MethodScope,
        ctx: &ClassCtx,
    ) -> Result<(), SmaltError> {
        match expr {
            Expr::IntegerLiteral(n) => {
                let idx = unit.add_constant(Constant::Int(*n));
                unit.emit(Op::PushConst, idx as i32);
            }
            Expr::FloatLiteral(f) => {
                let idx = unit.add_constant(Constant::Float(*f));
                unit.emit(Op::PushConst, idx as i32);
            }
            Expr::StringLiteral(s) => {
                let idx = unit.add_constant(Constant::Str(s.clone()));
                unit.emit(Op::PushConst, idx as i32);
            }
            Expr::BooleanLiteral(true) => {
                unit.emit(Op::PushTrue, 0);
            }
            Expr::BooleanLiteral(false) => {
                unit.emit(Op::PushFalse, 0);
            }
            Expr::NilLiteral => {
                unit.emit(Op::PushNil, 0);
            }

            Expr::Identifier(name) => self.compile_load(name, unit, scope, ctx)?,

            Expr::Assignment { name, value } => {
                self.compile_expr(value, unit, scope, ctx)?;
                self.compile_store(name, unit, scope, ctx)?;
            }

            Expr::MessageSend { receiver, selector, args } => {
                let is_super = matches!(receiver.as_ref(), Expr::SuperMarker);
                if is_super {
                    if !ctx.in_method {
                        return Err(SmaltError::compile_error(
                            "'super' is only meaningful inside a method".to_string(),
                        ));
                    }
                    unit.emit(Op::PushSelf, 0);
                } else {
                    self.compile_expr(receiver, unit, scope, ctx)?;
                }

                if args.len() > MAX_ARG_COUNT {
                    return Err(SmaltError::compile_error(format!(
                        "Message #{} has too many arguments (limit {})",
                        selector, MAX_ARG_COUNT
                    )));
                }
                for arg in args {
                    self.compile_expr(arg, unit, scope, ctx)?;
                }

                let sel_idx = unit.add_constant(Constant::Str(selector.clone()));
                if sel_idx > MAX_SELECTOR_INDEX {
                    return Err(SmaltError::compile_error(
                        "Constant pool overflow in send operand".to_string(),
                    ));
                }
                let packed = pack_send(sel_idx, args.len());
                unit.emit(if is_super { Op::SuperSend } else { Op::Send }, packed);
            }

            Expr::SuperMarker => {
                return Err(SmaltError::compile_error(
                    "'super' may only appear as a message receiver".to_string(),
                ));
            }

            Expr::ArrayLiteral(elements) => {
                for element in elements {
                    self.compile_expr(element, unit, scope, ctx)?;
                }
                unit.emit(Op::MakeArray, elements.len() as i32);
            }

            Expr::DictionaryLiteral(pairs) => {
                for (key, value) in pairs {
                    self.compile_expr(key, unit, scope, ctx)?;
                    self.compile_expr(value, unit, scope, ctx)?;
                }
                unit.emit(Op::MakeDictionary, pairs.len() as i32);
            }

            Expr::BlockLiteral { params, body } => {
                self.compile_block(params, body, unit, scope, ctx)?;
            }
        }
        Ok(())
    }

    fn compile_load(
        &mut self,
        name: &str,
        unit: &mut BytecodeUnit,
        scope: &mut MethodScope,
        ctx: &ClassCtx,
    ) -> Result<(), SmaltError> {
        if name == "self" {
            unit.emit(Op::PushSelf, 0);
        } else if let Some(slot) = scope.resolve(name) {
            unit.emit(Op::LoadLocal, slot as i32);
        } else if let Some(&idx) = ctx.fields.get(name) {
            unit.emit(Op::LoadField, idx as i32);
        } else if let Some(&idx) = ctx.class_vars.get(name) {
            unit.emit(Op::LoadClassVar, idx as i32);
        } else {
            let idx = unit.add_constant(Constant::Str(name.to_string()));
            unit.emit(Op::LoadGlobal, idx as i32);
        }
        Ok(())
    }

    fn compile_store(
        &mut self,
        name: &str,
        unit: &mut BytecodeUnit,
        scope: &mut MethodScope,
        ctx: &ClassCtx,
    ) -> Result<(), SmaltError> {
        if name == "self" {
            return Err(SmaltError::compile_error("Cannot assign to 'self'".to_string()));
        }
        if let Some(slot) = scope.resolve(name) {
            unit.emit(Op::StoreLocal, slot as i32);
        } else if let Some(&idx) = ctx.fields.get(name) {
            unit.emit(Op::StoreField, idx as i32);
        } else if let Some(&idx) = ctx.class_vars.get(name) {
            unit.emit(Op::StoreClassVar, idx as i32);
        } else {
            let idx = unit.add_constant(Constant::Str(name.to_string()));
            unit.emit(Op::StoreGlobal, idx as i32);
        }
        Ok(())
    }

    /// Lower a block literal: parameters claim the next slots of the
    /// enclosing frame, the body compiles into its own unit against the
    /// extended name table, and MakeClosure records where the parameters
    /// start.
    fn compile_block(
        &mut self,
        params: &[String],
        body: &[Stmt],
        unit: &mut BytecodeUnit,
        scope: &mut MethodScope,
        ctx: &ClassCtx,
    ) -> Result<(), SmaltError> {
        let parent_local_count = scope.locals.len();
        if parent_local_count > MAX_LOCAL_SLOTS || params.len() > MAX_ARG_COUNT {
            return Err(SmaltError::compile_error(
                "Block frame exceeds the local slot limit".to_string(),
            ));
        }

        for param in params {
            scope.locals.push(param.clone());
        }

        let mut body_unit = BytecodeUnit::new();
        self.compile_statements(body, &mut body_unit, scope, ctx, ScopeKind::Block)?;

        let body_idx = unit.add_constant(Constant::Unit(Arc::new(body_unit)));
        if body_idx > MAX_BLOCK_BODY_INDEX {
            return Err(SmaltError::compile_error(
                "Constant pool overflow in closure operand".to_string(),
            ));
        }
        unit.emit(Op::MakeClosure, pack_closure(body_idx, parent_local_count, params.len()));
        scope.closures_emitted += 1;
        Ok(())
    }

    /// Lower a class definition: resolve the superclass, compute the
    /// absolute field layout, compile every method against it, then emit
    /// DefineClass over the assembled descriptor.
    fn compile_class(&mut self, def: &ClassDef, unit: &mut BytecodeUnit) -> Result<(), SmaltError> {
        let mut field_layout: Vec<String> = if def.superclass_name == "Object" {
            Vec::new()
        } else {
            match self.classes.get(&def.superclass_name) {
                Some(info) => info.field_layout.clone(),
                None => {
                    return Err(SmaltError::compile_error(format!(
                        "Unknown superclass '{}' for class '{}'",
                        def.superclass_name, def.name
                    )));
                }
            }
        };
        field_layout.extend(def.instance_fields.iter().cloned());

        let mut fields = AHashMap::new();
        for (idx, name) in field_layout.iter().enumerate() {
            // A subclass field of the same name shadows the inherited slot.
            fields.insert(name.clone(), idx);
        }

        let mut class_vars = AHashMap::new();
        for (idx, name) in def.class_variables.iter().enumerate() {
            class_vars.insert(name.clone(), idx);
        }

        let instance_ctx = ClassCtx { fields, class_vars: class_vars.clone(), in_method: true };
        // Class-side methods see class variables but no instance fields.
        let class_ctx = ClassCtx { fields: AHashMap::new(), class_vars, in_method: true };

        let mut instance_methods = Vec::new();
        for method in &def.instance_methods {
            instance_methods.push(self.compile_method(method, &instance_ctx)?);
        }
        let mut class_methods = Vec::new();
        for method in &def.class_methods {
            class_methods.push(self.compile_method(method, &class_ctx)?);
        }

        self.classes.insert(def.name.clone(), ClassInfo { field_layout });

        let spec = ClassSpec {
            name: def.name.clone(),
            superclass_name: if def.superclass_name == "Object" {
                String::new()
            } else {
                def.superclass_name.clone()
            },
            instance_fields: def.instance_fields.clone(),
            class_variables: def.class_variables.clone(),
            instance_methods,
            class_methods,
        };

        let idx = unit.add_constant(Constant::Class(spec));
        unit.emit(Op::DefineClass, idx as i32);
        Ok(())
    }

    /// Compile one method body as an independent unit whose initial locals
    /// are exactly the parameters.
    fn compile_method(
        &mut self,
        method: &MethodDef,
        ctx: &ClassCtx,
    ) -> Result<MethodSpec, SmaltError> {
        if method.params.len() > MAX_ARG_COUNT {
            return Err(SmaltError::compile_error(format!(
                "Method #{} has too many parameters (limit {})",
                method.selector, MAX_ARG_COUNT
            )));
        }

        let mut unit = BytecodeUnit::new();
        let mut scope = MethodScope::new(&method.params);
        self.compile_statements(&method.body, &mut unit, &mut scope, ctx, ScopeKind::Method)?;

        Ok(MethodSpec {
            selector: method.selector.clone(),
            params: method.params.clone(),
            body: Arc::new(unit),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{unpack_closure, unpack_send, Instruction};

    fn compile(source: &str) -> BytecodeUnit {
        Compiler::new().compile_source(source).unwrap()
    }

    fn ops(unit: &BytecodeUnit) -> Vec<Op> {
        unit.instructions.iter().map(|i| i.op).collect()
    }

    #[test]
    fn test_literal_send_lowering() {
        let unit = compile("3 + 4");
        assert_eq!(ops(&unit), vec![Op::PushConst, Op::PushConst, Op::Send]);
        let (sel_idx, argc) = unpack_send(unit.instructions[2].operand);
        assert_eq!(argc, 1);
        assert_eq!(unit.constants[sel_idx], Constant::Str("+".to_string()));
    }

    #[test]
    fn test_locals_resolve_to_slots() {
        let unit = compile("| x y | x := 10. y := x + 5. y");
        // x := 10 stores into slot 0, y ends up in slot 1.
        assert!(unit
            .instructions
            .contains(&Instruction::new(Op::StoreLocal, 0)));
        assert!(unit
            .instructions
            .contains(&Instruction::new(Op::StoreLocal, 1)));
        // Final load of y stays on the stack as the program result.
        assert_eq!(unit.instructions.last().unwrap().op, Op::LoadLocal);
    }

    #[test]
    fn test_undeclared_name_falls_through_to_global() {
        let unit = compile("counter := 1. counter");
        assert!(ops(&unit).contains(&Op::StoreGlobal));
        assert_eq!(unit.instructions.last().unwrap().op, Op::LoadGlobal);
    }

    #[test]
    fn test_equal_literals_share_one_pool_entry() {
        let unit = compile("'abc' , 'abc'");
        let strings = unit
            .constants
            .iter()
            .filter(|c| matches!(c, Constant::Str(s) if s == "abc"))
            .count();
        assert_eq!(strings, 1);
    }

    #[test]
    fn test_block_operand_records_parent_local_count() {
        let unit = compile("| a b | [ :x :y | x + y ] value: 3 value: 7");
        let closure = unit
            .instructions
            .iter()
            .find(|i| i.op == Op::MakeClosure)
            .expect("block literal should emit MakeClosure");
        let (body_idx, parent_local_count, param_count) = unpack_closure(closure.operand);
        assert_eq!(parent_local_count, 2);
        assert_eq!(param_count, 2);
        assert!(matches!(unit.constants[body_idx], Constant::Unit(_)));
    }

    #[test]
    fn test_block_params_load_from_shared_frame() {
        let unit = compile("| a | [ :x | x ] value: 1");
        let body = unit
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Unit(u) => Some(u.clone()),
                _ => None,
            })
            .unwrap();
        // `x` lives at slot 1 of the enclosing frame, after `a`.
        assert_eq!(body.instructions[0], Instruction::new(Op::LoadLocal, 1));
    }

    #[test]
    fn test_return_inside_block_is_non_local() {
        let unit = compile("[ ^42 ]");
        let body = unit
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Unit(u) => Some(u.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(ops(&body), vec![Op::PushConst, Op::NonLocalReturn]);
    }

    #[test]
    fn test_temporaries_after_block_are_rejected() {
        let err = Compiler::new()
            .compile_source("| a | [ :x | x ]. | b | b := 1")
            .unwrap_err();
        assert!(err.message.contains("after a block literal"));
    }

    #[test]
    fn test_absolute_field_indices_across_hierarchy() {
        let source = r#"
            class Animal [
                | name sound |
                name: aName [ name := aName ]
            ]
            class Dog extends Animal [
                | breed |
                breed: aBreed [ breed := aBreed ]
            ]
        "#;
        let unit = compile(source);
        let classes: Vec<&ClassSpec> = unit
            .constants
            .iter()
            .filter_map(|c| match c {
                Constant::Class(spec) => Some(spec),
                _ => None,
            })
            .collect();
        assert_eq!(classes.len(), 2);

        // Animal's `name` is absolute slot 0.
        let animal_setter = &classes[0].instance_methods[0];
        assert!(animal_setter.body.instructions.contains(&Instruction::new(Op::StoreField, 0)));

        // Dog's `breed` comes after the two inherited fields: slot 2.
        let dog_setter = &classes[1].instance_methods[0];
        assert!(dog_setter.body.instructions.contains(&Instruction::new(Op::StoreField, 2)));
    }

    #[test]
    fn test_unknown_superclass_is_a_compile_error() {
        let err = Compiler::new()
            .compile_source("class Dog extends Animal [ ]")
            .unwrap_err();
        assert!(err.message.contains("Unknown superclass"));
    }

    #[test]
    fn test_super_send_emits_super_send_opcode() {
        let source = r#"
            class Vehicle [
                accelerate [ ^10 ]
            ]
            class Car extends Vehicle [
                accelerate [ | base | base := super accelerate. ^base + 5 ]
            ]
        "#;
        let unit = compile(source);
        let car = unit
            .constants
            .iter()
            .filter_map(|c| match c {
                Constant::Class(spec) if spec.name == "Car" => Some(spec),
                _ => None,
            })
            .next()
            .unwrap();
        let body = &car.instance_methods[0].body;
        assert!(body.instructions.iter().any(|i| i.op == Op::SuperSend));
    }

    #[test]
    fn test_super_outside_method_is_rejected() {
        let err = Compiler::new().compile_source("super foo").unwrap_err();
        assert!(err.message.contains("super"));
    }

    #[test]
    fn test_class_variables_compile_to_slots() {
        let source = r#"
            class Counter [
                classvars Census.
                bump [ Census := 1 ]
                class tally [ ^Census ]
            ]
        "#;
        let unit = compile(source);
        let spec = unit
            .constants
            .iter()
            .filter_map(|c| match c {
                Constant::Class(spec) => Some(spec),
                _ => None,
            })
            .next()
            .unwrap();
        let bump = &spec.instance_methods[0].body;
        assert!(bump.instructions.contains(&Instruction::new(Op::StoreClassVar, 0)));
        let tally = &spec.class_methods[0].body;
        assert!(tally.instructions.contains(&Instruction::new(Op::LoadClassVar, 0)));
    }

    #[test]
    fn test_define_class_uses_reserved_root_name() {
        let unit = compile("class Animal [ ]");
        match &unit.constants[0] {
            Constant::Class(spec) => {
                assert_eq!(spec.name, "Animal");
                assert_eq!(spec.superclass_name, "");
            }
            other => panic!("Expected class constant, got {:?}", other),
        }
    }
}
