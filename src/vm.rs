// File: src/vm.rs
//
// Virtual machine for executing Smalt bytecode.
// Stack-based, single-threaded, with recursive method invocation. Message
// dispatch walks class descriptors as data; non-local returns travel as an
// out-of-band Unwind signal targeted by activation identity.

use std::sync::{Arc, Mutex};

use ahash::AHashMap;

use crate::bytecode::{unpack_closure, unpack_send, BytecodeUnit, Constant, MethodSpec, Op};
use crate::debugger::{Debugger, FrameView, StepAction};
use crate::errors::{closest_match, SmaltError};
use crate::primitives;
use crate::value::{
    lookup_instance_method, BlockValue, DictKey, DictMap, HomeContext, Instance, RuntimeClass,
    Value,
};

/// Value-stack ceiling per activation.
const STACK_LIMIT: usize = 1024;

/// Activation-depth ceiling, guarding the host stack against runaway
/// recursion in user programs.
const MAX_CALL_DEPTH: usize = 1500;

/// The dynamic state of one invocation: top-level program, method, or
/// block. Blocks share the locals array of their creating activation.
struct Activation {
    unit: Arc<BytecodeUnit>,
    ip: usize,
    stack: Vec<Value>,
    locals: Arc<Mutex<Vec<Value>>>,
    receiver: Value,
    /// Class defining the running method; lookup start for super sends.
    current_class: Option<Arc<RuntimeClass>>,
    /// Identity of the method activation a non-local return unwinds to.
    /// For method and top-level activations this is their own token.
    home: Arc<HomeContext>,
    is_block: bool,
    /// For error frames: `Dog>>speak`, `a block in Dog>>speak`, `top level`.
    name: String,
}

impl Activation {
    fn push(&mut self, value: Value) -> Result<(), SmaltError> {
        if self.stack.len() >= STACK_LIMIT {
            return Err(SmaltError::runtime_error(format!(
                "Value stack overflow in {}",
                self.name
            )));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, SmaltError> {
        self.stack.pop().ok_or_else(|| {
            SmaltError::runtime_error(format!("Value stack underflow in {}", self.name))
        })
    }

    fn peek(&self) -> Result<&Value, SmaltError> {
        self.stack.last().ok_or_else(|| {
            SmaltError::runtime_error(format!("Value stack underflow in {}", self.name))
        })
    }
}

/// How an activation finished: a normal value, or a non-local return
/// still looking for its home activation.
enum Flow {
    Normal(Value),
    Unwind { value: Value, home: Arc<HomeContext> },
}

/// The Smalt virtual machine. Globals, the class registry and class
/// variable values live as long as the instance, so one VM can run many
/// top-level programs (the REPL relies on this).
pub struct Vm {
    globals: AHashMap<String, Value>,
    classes: AHashMap<String, Arc<RuntimeClass>>,
    depth: usize,
    trace: bool,
    debugger: Option<Box<dyn Debugger>>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self {
            globals: AHashMap::new(),
            classes: AHashMap::new(),
            depth: 0,
            trace: std::env::var("SMALT_TRACE").is_ok(),
            debugger: None,
        }
    }

    /// Install a debugger polled between instructions.
    pub fn set_debugger(&mut self, debugger: Box<dyn Debugger>) {
        self.debugger = Some(debugger);
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    pub fn global_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.globals.keys().cloned().collect();
        names.sort();
        names
    }

    /// Execute a top-level bytecode unit. On error the VM stays usable:
    /// globals, classes and class-variable values keep their last state.
    pub fn run(&mut self, unit: BytecodeUnit) -> Result<Value, SmaltError> {
        self.depth = 0;
        let home = Arc::new(HomeContext { name: "top level".to_string() });
        let mut activation = Activation {
            unit: Arc::new(unit),
            ip: 0,
            stack: Vec::new(),
            locals: Arc::new(Mutex::new(Vec::new())),
            receiver: Value::Nil,
            current_class: None,
            home,
            is_block: false,
            name: "top level".to_string(),
        };

        match self.run_activation(&mut activation) {
            Ok(Flow::Normal(value)) => Ok(value),
            Ok(Flow::Unwind { .. }) => Err(SmaltError::runtime_error(
                "Non-local return from a dead home context".to_string(),
            )),
            Err(mut err) => {
                err.call_stack.push(frame_label(&activation));
                Err(err)
            }
        }
    }

    /// Fetch-decode-execute for one activation. Runs until Return, a
    /// non-local return, the end of the instruction list, or an error.
    fn run_activation(&mut self, act: &mut Activation) -> Result<Flow, SmaltError> {
        loop {
            if act.ip >= act.unit.instructions.len() {
                // Running off the end is an implicit return.
                let value = act.stack.pop().unwrap_or(Value::Nil);
                return Ok(Flow::Normal(value));
            }

            let instr = act.unit.instructions[act.ip];

            if self.trace {
                eprintln!(
                    "[trace] {:<24} {:>4}  {:?} {}  (stack {})",
                    act.name,
                    act.ip,
                    instr.op,
                    instr.operand,
                    act.stack.len()
                );
            }

            if let Some(debugger) = self.debugger.as_mut() {
                let view = FrameView {
                    name: &act.name,
                    ip: act.ip,
                    instruction: instr,
                    stack_depth: act.stack.len(),
                    locals: act.locals.lock().unwrap().clone(),
                };
                if debugger.before_instruction(&view) == StepAction::Abort {
                    return Err(SmaltError::runtime_error(
                        "Execution aborted by debugger".to_string(),
                    ));
                }
            }

            match instr.op {
                Op::PushConst => {
                    let value = self.constant_value(act, instr.index())?;
                    act.push(value)?;
                }
                Op::Pop => {
                    act.pop()?;
                }
                Op::Dup => {
                    let top = act.peek()?.clone();
                    act.push(top)?;
                }
                Op::PushTrue => act.push(Value::Bool(true))?,
                Op::PushFalse => act.push(Value::Bool(false))?,
                Op::PushNil => act.push(Value::Nil)?,
                Op::PushSelf => {
                    let receiver = act.receiver.clone();
                    act.push(receiver)?;
                }

                Op::LoadLocal => {
                    let slot = self.operand_index(act, instr.operand)?;
                    let locals = act.locals.lock().unwrap();
                    // Slots are grown on demand; an unwritten slot reads nil.
                    let value = locals.get(slot).cloned().unwrap_or(Value::Nil);
                    drop(locals);
                    act.push(value)?;
                }
                Op::StoreLocal => {
                    let slot = self.operand_index(act, instr.operand)?;
                    let value = act.peek()?.clone();
                    let mut locals = act.locals.lock().unwrap();
                    if locals.len() <= slot {
                        locals.resize(slot + 1, Value::Nil);
                    }
                    locals[slot] = value;
                }

                Op::LoadGlobal => {
                    let name = self.constant_string(act, instr.index())?;
                    let value = match self.globals.get(&name) {
                        Some(value) => value.clone(),
                        None => {
                            let known = self.global_names();
                            let mut err = SmaltError::undefined_global(&name);
                            if let Some(close) = closest_match(&name, &known) {
                                err = err.with_suggestion(close.to_string());
                            }
                            return Err(err);
                        }
                    };
                    act.push(value)?;
                }
                Op::StoreGlobal => {
                    let name = self.constant_string(act, instr.index())?;
                    let value = act.peek()?.clone();
                    self.globals.insert(name, value);
                }

                Op::LoadField => {
                    let idx = self.operand_index(act, instr.operand)?;
                    let value = match &act.receiver {
                        Value::Instance(instance) => {
                            let instance = instance.lock().unwrap();
                            instance.fields.get(idx).cloned().ok_or_else(|| {
                                SmaltError::runtime_error(format!(
                                    "Field index {} out of range for {}",
                                    idx, instance.class.name
                                ))
                            })?
                        }
                        other => {
                            return Err(SmaltError::runtime_error(format!(
                                "Field access on {} (not an instance)",
                                other.kind_name()
                            )));
                        }
                    };
                    act.push(value)?;
                }
                Op::StoreField => {
                    let idx = self.operand_index(act, instr.operand)?;
                    let value = act.peek()?.clone();
                    match &act.receiver {
                        Value::Instance(instance) => {
                            let mut instance = instance.lock().unwrap();
                            if idx >= instance.fields.len() {
                                return Err(SmaltError::runtime_error(format!(
                                    "Field index {} out of range for {}",
                                    idx, instance.class.name
                                )));
                            }
                            instance.fields[idx] = value;
                        }
                        other => {
                            return Err(SmaltError::runtime_error(format!(
                                "Field access on {} (not an instance)",
                                other.kind_name()
                            )));
                        }
                    }
                }

                Op::LoadClassVar => {
                    let idx = self.operand_index(act, instr.operand)?;
                    let class = act.current_class.clone().ok_or_else(|| {
                        SmaltError::runtime_error(
                            "Class variable access outside a method".to_string(),
                        )
                    })?;
                    let values = class.class_var_values.lock().unwrap();
                    let value = values.get(idx).cloned().ok_or_else(|| {
                        SmaltError::runtime_error(format!(
                            "Class variable index {} out of range for {}",
                            idx, class.name
                        ))
                    })?;
                    drop(values);
                    act.push(value)?;
                }
                Op::StoreClassVar => {
                    let idx = self.operand_index(act, instr.operand)?;
                    let value = act.peek()?.clone();
                    let class = act.current_class.clone().ok_or_else(|| {
                        SmaltError::runtime_error(
                            "Class variable access outside a method".to_string(),
                        )
                    })?;
                    let mut values = class.class_var_values.lock().unwrap();
                    if idx >= values.len() {
                        return Err(SmaltError::runtime_error(format!(
                            "Class variable index {} out of range for {}",
                            idx, class.name
                        )));
                    }
                    values[idx] = value;
                }

                Op::Send | Op::SuperSend => {
                    let (sel_idx, arg_count) = unpack_send(instr.operand);
                    let selector = self.constant_string(act, sel_idx)?;

                    let mut args = Vec::with_capacity(arg_count);
                    for _ in 0..arg_count {
                        args.push(act.pop()?);
                    }
                    args.reverse();
                    let receiver = act.pop()?;

                    let flow = if instr.op == Op::SuperSend {
                        self.super_send(act, receiver, &selector, args)?
                    } else {
                        self.dispatch(receiver, &selector, args)?
                    };

                    match flow {
                        Flow::Normal(value) => act.push(value)?,
                        Flow::Unwind { value, home } => {
                            // A method activation that is the target consumes
                            // the signal and returns the value locally.
                            if !act.is_block && Arc::ptr_eq(&act.home, &home) {
                                return Ok(Flow::Normal(value));
                            }
                            return Ok(Flow::Unwind { value, home });
                        }
                    }
                }

                Op::Return => {
                    let value = act.stack.pop().unwrap_or(Value::Nil);
                    return Ok(Flow::Normal(value));
                }
                Op::NonLocalReturn => {
                    let value = act.stack.pop().unwrap_or(Value::Nil);
                    if act.is_block {
                        return Ok(Flow::Unwind { value, home: act.home.clone() });
                    }
                    // In a method scope this degenerates to a local return.
                    return Ok(Flow::Normal(value));
                }

                Op::MakeClosure => {
                    let (body_idx, parent_local_count, param_count) =
                        unpack_closure(instr.operand);
                    let unit = match act.unit.constants.get(body_idx) {
                        Some(Constant::Unit(unit)) => unit.clone(),
                        _ => {
                            return Err(SmaltError::runtime_error(format!(
                                "MakeClosure operand {} is not a bytecode unit",
                                body_idx
                            )));
                        }
                    };
                    let block = BlockValue {
                        unit,
                        param_count,
                        parent_local_count,
                        frame: act.locals.clone(),
                        receiver: act.receiver.clone(),
                        defining_class: act.current_class.clone(),
                        home: act.home.clone(),
                    };
                    act.push(Value::Block(Arc::new(block)))?;
                }

                Op::MakeArray => {
                    let count = self.operand_index(act, instr.operand)?;
                    let mut elements = Vec::with_capacity(count);
                    for _ in 0..count {
                        elements.push(act.pop()?);
                    }
                    elements.reverse();
                    act.push(Value::array(elements))?;
                }

                Op::MakeDictionary => {
                    let count = self.operand_index(act, instr.operand)?;
                    let mut flat = Vec::with_capacity(count * 2);
                    for _ in 0..count * 2 {
                        flat.push(act.pop()?);
                    }
                    flat.reverse();
                    let mut map = DictMap::default();
                    for pair in flat.chunks(2) {
                        let key = DictKey::from_value(&pair[0]).ok_or_else(|| {
                            SmaltError::runtime_error(format!(
                                "{} is not a hashable dictionary key",
                                pair[0].kind_name()
                            ))
                        })?;
                        map.insert(key, pair[1].clone());
                    }
                    act.push(Value::dictionary(map))?;
                }

                Op::DefineClass => {
                    let spec = match act.unit.constants.get(instr.index()) {
                        Some(Constant::Class(spec)) => spec.clone(),
                        _ => {
                            return Err(SmaltError::runtime_error(format!(
                                "DefineClass operand {} is not a class descriptor",
                                instr.index()
                            )));
                        }
                    };
                    self.define_class(spec)?;
                }

                Op::LoadCaptured | Op::StoreCaptured => {
                    return Err(SmaltError::runtime_error(format!(
                        "Reserved opcode {:?} is not implemented by this VM",
                        instr.op
                    )));
                }
            }

            act.ip += 1;
        }
    }

    // === Constant access ===

    fn constant_value(&self, act: &Activation, idx: usize) -> Result<Value, SmaltError> {
        match act.unit.constants.get(idx) {
            Some(Constant::Int(n)) => Ok(Value::Int(*n)),
            Some(Constant::Float(f)) => Ok(Value::Float(*f)),
            Some(Constant::Str(s)) => Ok(Value::str_ref(s)),
            Some(Constant::Bool(b)) => Ok(Value::Bool(*b)),
            Some(Constant::Nil) => Ok(Value::Nil),
            Some(_) => Err(SmaltError::runtime_error(format!(
                "Constant {} is a descriptor and cannot be pushed",
                idx
            ))),
            None => Err(SmaltError::runtime_error(format!(
                "Constant index {} out of range (pool size {})",
                idx,
                act.unit.constants.len()
            ))),
        }
    }

    fn constant_string(&self, act: &Activation, idx: usize) -> Result<String, SmaltError> {
        match act.unit.constants.get(idx) {
            Some(Constant::Str(s)) => Ok(s.clone()),
            Some(other) => Err(SmaltError::runtime_error(format!(
                "Constant {} should be a string, found {:?}",
                idx, other
            ))),
            None => Err(SmaltError::runtime_error(format!(
                "Constant index {} out of range (pool size {})",
                idx,
                act.unit.constants.len()
            ))),
        }
    }

    fn operand_index(&self, act: &Activation, operand: i32) -> Result<usize, SmaltError> {
        if operand < 0 {
            return Err(SmaltError::runtime_error(format!(
                "Negative operand {} in {}",
                operand, act.name
            )));
        }
        Ok(operand as usize)
    }

    // === Class definition ===

    fn define_class(&mut self, spec: crate::bytecode::ClassSpec) -> Result<(), SmaltError> {
        let superclass = if spec.superclass_name.is_empty() {
            None
        } else {
            Some(self.classes.get(&spec.superclass_name).cloned().ok_or_else(|| {
                SmaltError::runtime_error(format!(
                    "Superclass '{}' is not defined",
                    spec.superclass_name
                ))
            })?)
        };

        let field_offset = superclass.as_ref().map_or(0, |s| s.total_fields);
        let total_fields = field_offset + spec.instance_fields.len();
        let class_var_count = spec.class_variables.len();

        let class = Arc::new(RuntimeClass {
            name: spec.name.clone(),
            superclass,
            instance_fields: spec.instance_fields,
            field_offset,
            total_fields,
            class_variables: spec.class_variables,
            class_var_values: Mutex::new(vec![Value::Nil; class_var_count]),
            instance_methods: spec.instance_methods.into_iter().map(Arc::new).collect(),
            class_methods: spec.class_methods.into_iter().map(Arc::new).collect(),
        });

        self.classes.insert(spec.name.clone(), class.clone());
        self.globals.insert(spec.name, Value::Class(class));
        Ok(())
    }

    // === Dispatch ===

    /// The dispatch decision tree. Receiver kind first, then selector;
    /// instances walk the class chain; anything left over falls through to
    /// the primitive tables.
    fn dispatch(
        &mut self,
        receiver: Value,
        selector: &str,
        args: Vec<Value>,
    ) -> Result<Flow, SmaltError> {
        match &receiver {
            Value::Block(block) => {
                if is_value_selector(selector, args.len()) {
                    let block = block.clone();
                    return self.invoke_block(&block, args);
                }
                if selector == "whileTrue:" || selector == "whileFalse:" {
                    let want = selector == "whileTrue:";
                    let body = expect_block_arg(&args, 0, selector)?;
                    let cond = block.clone();
                    return self.run_while(&cond, &body, want);
                }
            }

            Value::Bool(b) => match selector {
                "ifTrue:" => {
                    let branch = expect_block_arg(&args, 0, selector)?;
                    return if *b {
                        self.invoke_block(&branch, Vec::new())
                    } else {
                        Ok(Flow::Normal(Value::Nil))
                    };
                }
                "ifFalse:" => {
                    let branch = expect_block_arg(&args, 0, selector)?;
                    return if !*b {
                        self.invoke_block(&branch, Vec::new())
                    } else {
                        Ok(Flow::Normal(Value::Nil))
                    };
                }
                "ifTrue:ifFalse:" => {
                    let then_branch = expect_block_arg(&args, 0, selector)?;
                    let else_branch = expect_block_arg(&args, 1, selector)?;
                    let chosen = if *b { then_branch } else { else_branch };
                    return self.invoke_block(&chosen, Vec::new());
                }
                _ => {}
            },

            Value::Int(n) => match selector {
                "timesRepeat:" => {
                    let body = expect_block_arg(&args, 0, selector)?;
                    for _ in 0..(*n).max(0) {
                        match self.invoke_block(&body, Vec::new())? {
                            Flow::Normal(_) => {}
                            unwind @ Flow::Unwind { .. } => return Ok(unwind),
                        }
                    }
                    return Ok(Flow::Normal(receiver.clone()));
                }
                "to:do:" => {
                    let limit = match args.first() {
                        Some(Value::Int(limit)) => *limit,
                        _ => {
                            return Err(SmaltError::type_error(
                                "to:do: expects an integer bound".to_string(),
                            ));
                        }
                    };
                    let body = expect_block_arg(&args, 1, selector)?;
                    let mut i = *n;
                    while i <= limit {
                        match self.invoke_block(&body, vec![Value::Int(i)])? {
                            Flow::Normal(_) => {}
                            unwind @ Flow::Unwind { .. } => return Ok(unwind),
                        }
                        i += 1;
                    }
                    return Ok(Flow::Normal(receiver.clone()));
                }
                _ => {}
            },

            Value::Array(items) => match selector {
                "size" => {
                    return Ok(Flow::Normal(Value::Int(items.lock().unwrap().len() as i64)));
                }
                "at:" => {
                    let idx = array_index(&args, 0, items.lock().unwrap().len())?;
                    let value = items.lock().unwrap()[idx].clone();
                    return Ok(Flow::Normal(value));
                }
                "at:put:" => {
                    let idx = array_index(&args, 0, items.lock().unwrap().len())?;
                    let value = expect_arg(&args, 1, selector)?;
                    items.lock().unwrap()[idx] = value.clone();
                    return Ok(Flow::Normal(value));
                }
                "do:" => {
                    let body = expect_block_arg(&args, 0, selector)?;
                    let items = items.clone();
                    let mut i = 0;
                    loop {
                        // Re-check the length each step; the block may
                        // mutate the array (and must not deadlock on it).
                        let element = {
                            let items = items.lock().unwrap();
                            if i >= items.len() {
                                break;
                            }
                            items[i].clone()
                        };
                        match self.invoke_block(&body, vec![element])? {
                            Flow::Normal(_) => {}
                            unwind @ Flow::Unwind { .. } => return Ok(unwind),
                        }
                        i += 1;
                    }
                    return Ok(Flow::Normal(Value::Nil));
                }
                "first" => {
                    let items = items.lock().unwrap();
                    return match items.first() {
                        Some(value) => Ok(Flow::Normal(value.clone())),
                        None => Err(SmaltError::runtime_error("Array is empty".to_string())),
                    };
                }
                "last" => {
                    let items = items.lock().unwrap();
                    return match items.last() {
                        Some(value) => Ok(Flow::Normal(value.clone())),
                        None => Err(SmaltError::runtime_error("Array is empty".to_string())),
                    };
                }
                _ => {}
            },

            Value::Dictionary(map) => match selector {
                "size" => {
                    return Ok(Flow::Normal(Value::Int(map.lock().unwrap().len() as i64)));
                }
                "at:" => {
                    let wanted = expect_arg(&args, 0, selector)?;
                    let key = dict_key(&wanted)?;
                    let map = map.lock().unwrap();
                    return match map.get(&key) {
                        Some(value) => Ok(Flow::Normal(value.clone())),
                        None => Err(SmaltError::runtime_error(format!(
                            "Key not found: {}",
                            wanted.display_string()
                        ))),
                    };
                }
                "at:put:" => {
                    let key = dict_key(&expect_arg(&args, 0, selector)?)?;
                    let value = expect_arg(&args, 1, selector)?;
                    map.lock().unwrap().insert(key, value.clone());
                    return Ok(Flow::Normal(value));
                }
                "includesKey:" => {
                    let key = dict_key(&expect_arg(&args, 0, selector)?)?;
                    let found = map.lock().unwrap().contains_key(&key);
                    return Ok(Flow::Normal(Value::Bool(found)));
                }
                "keys" => {
                    let keys: Vec<Value> =
                        map.lock().unwrap().keys().map(|k| k.to_value()).collect();
                    return Ok(Flow::Normal(Value::array(keys)));
                }
                "do:" => {
                    let body = expect_block_arg(&args, 0, selector)?;
                    let values: Vec<Value> = map.lock().unwrap().values().cloned().collect();
                    for value in values {
                        match self.invoke_block(&body, vec![value])? {
                            Flow::Normal(_) => {}
                            unwind @ Flow::Unwind { .. } => return Ok(unwind),
                        }
                    }
                    return Ok(Flow::Normal(Value::Nil));
                }
                _ => {}
            },

            Value::Class(class) => {
                if selector == "new" {
                    let instance = Instance {
                        class: class.clone(),
                        fields: vec![Value::Nil; class.total_fields],
                    };
                    return Ok(Flow::Normal(Value::Instance(Arc::new(Mutex::new(instance)))));
                }
                if let Some(method) = class.lookup_class_method(selector) {
                    let class = class.clone();
                    return self.invoke_method(receiver.clone(), class, method, args);
                }
            }

            Value::Instance(instance) => {
                let class = instance.lock().unwrap().class.clone();
                if let Some((defining, method)) = lookup_instance_method(&class, selector) {
                    return self.invoke_method(receiver.clone(), defining, method, args);
                }
                // No method anywhere on the chain: try the primitives with
                // the instance as left operand, then give up with a
                // suggestion from the chain's selectors.
                if let Some(result) = self.common_primitive(&receiver, selector, &args)? {
                    return Ok(Flow::Normal(result));
                }
                let known = chain_selectors(&class);
                let mut err = SmaltError::does_not_understand(
                    &format!("{} instance", class.name),
                    selector,
                );
                if let Some(close) = closest_match(selector, &known) {
                    err = err.with_suggestion(close.to_string());
                }
                return Err(err);
            }

            _ => {}
        }

        // Fall through: arithmetic, comparison, printing, and the extended
        // primitive table.
        if let Some(result) = self.common_primitive(&receiver, selector, &args)? {
            return Ok(Flow::Normal(result));
        }
        if let Some(result) = primitives::dispatch(selector, &args) {
            return result
                .map(Flow::Normal)
                .map_err(SmaltError::runtime_error);
        }

        Err(SmaltError::does_not_understand(receiver.kind_name(), selector))
    }

    /// Super send: lookup starts at the superclass of the current
    /// activation's defining class. Receiver, self and home are unchanged.
    fn super_send(
        &mut self,
        act: &Activation,
        receiver: Value,
        selector: &str,
        args: Vec<Value>,
    ) -> Result<Flow, SmaltError> {
        let current = act.current_class.clone().ok_or_else(|| {
            SmaltError::runtime_error("Super send outside a method".to_string())
        })?;
        let start = match current.superclass.clone() {
            Some(start) => start,
            None => {
                return Err(SmaltError::does_not_understand(
                    &format!("super of {}", current.name),
                    selector,
                ));
            }
        };

        if let Some((defining, method)) = lookup_instance_method(&start, selector) {
            return self.invoke_method(receiver, defining, method, args);
        }
        if let Some(result) = self.common_primitive(&receiver, selector, &args)? {
            return Ok(Flow::Normal(result));
        }
        if let Some(result) = primitives::dispatch(selector, &args) {
            return result.map(Flow::Normal).map_err(SmaltError::runtime_error);
        }
        Err(SmaltError::does_not_understand(&format!("super of {}", current.name), selector))
    }

    // === Invocation mechanics ===

    /// Invoke a method: fresh activation, arguments at the base of a new
    /// locals array, `self` bound to the receiver, the defining class
    /// recorded for super sends, and a fresh home-context token.
    fn invoke_method(
        &mut self,
        receiver: Value,
        defining_class: Arc<RuntimeClass>,
        method: Arc<MethodSpec>,
        args: Vec<Value>,
    ) -> Result<Flow, SmaltError> {
        if args.len() != method.params.len() {
            return Err(SmaltError::runtime_error(format!(
                "#{} expects {} arguments, got {}",
                method.selector,
                method.params.len(),
                args.len()
            )));
        }
        self.enter_call()?;

        let name = format!("{}>>{}", defining_class.name, method.selector);
        let home = Arc::new(HomeContext { name: name.clone() });
        let mut activation = Activation {
            unit: method.body.clone(),
            ip: 0,
            stack: Vec::new(),
            locals: Arc::new(Mutex::new(args)),
            receiver,
            current_class: Some(defining_class),
            home,
            is_block: false,
            name,
        };

        let flow = self.run_activation(&mut activation);
        self.depth -= 1;
        flow.map_err(|mut err| {
            err.call_stack.push(frame_label(&activation));
            err
        })
    }

    /// Invoke a block: the new activation shares the creating activation's
    /// locals (grown on demand), with the arguments written into the
    /// block's parameter slots. Self, defining class and home context all
    /// come from the block.
    fn invoke_block(
        &mut self,
        block: &Arc<BlockValue>,
        args: Vec<Value>,
    ) -> Result<Flow, SmaltError> {
        if args.len() != block.param_count {
            return Err(SmaltError::runtime_error(format!(
                "Block expects {} arguments, got {}",
                block.param_count,
                args.len()
            )));
        }
        self.enter_call()?;

        {
            let mut frame = block.frame.lock().unwrap();
            let needed = block.parent_local_count + block.param_count;
            if frame.len() < needed {
                frame.resize(needed, Value::Nil);
            }
            for (i, arg) in args.into_iter().enumerate() {
                frame[block.parent_local_count + i] = arg;
            }
        }

        let name = format!("a block in {}", block.home.name);
        let mut activation = Activation {
            unit: block.unit.clone(),
            ip: 0,
            stack: Vec::new(),
            locals: block.frame.clone(),
            receiver: block.receiver.clone(),
            current_class: block.defining_class.clone(),
            home: block.home.clone(),
            is_block: true,
            name,
        };

        let flow = self.run_activation(&mut activation);
        self.depth -= 1;
        flow.map_err(|mut err| {
            err.call_stack.push(frame_label(&activation));
            err
        })
    }

    fn enter_call(&mut self) -> Result<(), SmaltError> {
        self.depth += 1;
        if self.depth > MAX_CALL_DEPTH {
            self.depth -= 1;
            return Err(SmaltError::runtime_error(format!(
                "Call stack overflow (depth limit {})",
                MAX_CALL_DEPTH
            )));
        }
        Ok(())
    }

    /// Alternate a condition block and a body block until the condition
    /// stops answering the wanted boolean. The loop's value is nil.
    fn run_while(
        &mut self,
        cond: &Arc<BlockValue>,
        body: &Arc<BlockValue>,
        want: bool,
    ) -> Result<Flow, SmaltError> {
        loop {
            let outcome = match self.invoke_block(cond, Vec::new())? {
                Flow::Normal(value) => value,
                unwind @ Flow::Unwind { .. } => return Ok(unwind),
            };
            let keep_going = match outcome {
                Value::Bool(b) => b == want,
                other => {
                    return Err(SmaltError::type_error(format!(
                        "Loop condition must answer a boolean, got {}",
                        other.kind_name()
                    )));
                }
            };
            if !keep_going {
                return Ok(Flow::Normal(Value::Nil));
            }
            match self.invoke_block(body, Vec::new())? {
                Flow::Normal(_) => {}
                unwind @ Flow::Unwind { .. } => return Ok(unwind),
            }
        }
    }

    // === Primitive messages shared by every receiver kind ===

    /// Arithmetic, comparison, equality, printing and the small collection
    /// of universal selectors. Answers None when the selector does not
    /// apply, so dispatch can keep falling through.
    fn common_primitive(
        &mut self,
        receiver: &Value,
        selector: &str,
        args: &[Value],
    ) -> Result<Option<Value>, SmaltError> {
        let result = match (selector, args.len()) {
            ("+", 1) | ("-", 1) | ("*", 1) | ("/", 1) => {
                return arithmetic(receiver, selector, &args[0]).map(Some);
            }
            ("<", 1) | (">", 1) | ("<=", 1) | (">=", 1) => {
                return comparison(receiver, selector, &args[0]).map(Some);
            }
            ("=", 1) => Value::Bool(receiver.st_equals(&args[0])),
            ("~=", 1) => Value::Bool(!receiver.st_equals(&args[0])),

            ("print", 0) => {
                print!("{}", receiver.display_string());
                use std::io::Write;
                let _ = std::io::stdout().flush();
                receiver.clone()
            }
            ("println", 0) => {
                println!("{}", receiver.display_string());
                receiver.clone()
            }

            ("asString", 0) | ("printString", 0) => Value::str(receiver.display_string()),
            ("isNil", 0) => Value::Bool(matches!(receiver, Value::Nil)),
            ("notNil", 0) => Value::Bool(!matches!(receiver, Value::Nil)),

            ("not", 0) => match receiver {
                Value::Bool(b) => Value::Bool(!b),
                _ => return Ok(None),
            },

            (",", 1) => match (receiver, &args[0]) {
                (Value::Str(a), Value::Str(b)) => {
                    Value::str(format!("{}{}", a.as_ref(), b.as_ref()))
                }
                (Value::Str(_), other) => {
                    return Err(SmaltError::type_error(format!(
                        "Cannot concatenate String and {}",
                        other.kind_name()
                    )));
                }
                _ => return Ok(None),
            },

            ("size", 0) => match receiver {
                Value::Str(s) => Value::Int(s.chars().count() as i64),
                _ => return Ok(None),
            },

            _ => return Ok(None),
        };
        Ok(Some(result))
    }
}

fn frame_label(act: &Activation) -> String {
    format!("{} @{}", act.name, act.ip)
}

/// `value`, `value:`, `value:value:`, ... up to four arguments.
fn is_value_selector(selector: &str, arg_count: usize) -> bool {
    match arg_count {
        0 => selector == "value",
        1..=4 => selector == "value:".repeat(arg_count),
        _ => false,
    }
}

fn expect_arg(args: &[Value], idx: usize, selector: &str) -> Result<Value, SmaltError> {
    args.get(idx).cloned().ok_or_else(|| {
        SmaltError::runtime_error(format!("#{} is missing argument {}", selector, idx + 1))
    })
}

fn expect_block_arg(
    args: &[Value],
    idx: usize,
    selector: &str,
) -> Result<Arc<BlockValue>, SmaltError> {
    match args.get(idx) {
        Some(Value::Block(block)) => Ok(block.clone()),
        Some(other) => Err(SmaltError::type_error(format!(
            "#{} expects a block argument, got {}",
            selector,
            other.kind_name()
        ))),
        None => Err(SmaltError::runtime_error(format!(
            "#{} is missing argument {}",
            selector,
            idx + 1
        ))),
    }
}

/// 1-based index into an array, checked against the current length.
fn array_index(args: &[Value], idx: usize, len: usize) -> Result<usize, SmaltError> {
    match args.get(idx) {
        Some(Value::Int(n)) => {
            if *n < 1 || *n as usize > len {
                Err(SmaltError::runtime_error(format!(
                    "Array index {} out of bounds (size {})",
                    n, len
                )))
            } else {
                Ok(*n as usize - 1)
            }
        }
        Some(other) => Err(SmaltError::type_error(format!(
            "Array index must be an integer, got {}",
            other.kind_name()
        ))),
        None => Err(SmaltError::runtime_error("Missing array index argument".to_string())),
    }
}

fn dict_key(value: &Value) -> Result<DictKey, SmaltError> {
    DictKey::from_value(value).ok_or_else(|| {
        SmaltError::runtime_error(format!(
            "{} is not a hashable dictionary key",
            value.kind_name()
        ))
    })
}

fn chain_selectors(class: &Arc<RuntimeClass>) -> Vec<String> {
    let mut selectors = Vec::new();
    let mut current = Some(class.clone());
    while let Some(cls) = current {
        selectors.extend(cls.instance_methods.iter().map(|m| m.selector.clone()));
        current = cls.superclass.clone();
    }
    selectors
}

/// Integer arithmetic wraps like the underlying i64; cross-type numeric
/// operations are errors rather than silent coercions.
fn arithmetic(left: &Value, op: &str, right: &Value) -> Result<Value, SmaltError> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => match op {
            "+" => Ok(Value::Int(a.wrapping_add(*b))),
            "-" => Ok(Value::Int(a.wrapping_sub(*b))),
            "*" => Ok(Value::Int(a.wrapping_mul(*b))),
            "/" => {
                if *b == 0 {
                    Err(SmaltError::division_by_zero())
                } else {
                    Ok(Value::Int(a.wrapping_div(*b)))
                }
            }
            _ => unreachable!(),
        },
        (Value::Float(a), Value::Float(b)) => match op {
            "+" => Ok(Value::Float(a + b)),
            "-" => Ok(Value::Float(a - b)),
            "*" => Ok(Value::Float(a * b)),
            "/" => {
                if *b == 0.0 {
                    Err(SmaltError::division_by_zero())
                } else {
                    Ok(Value::Float(a / b))
                }
            }
            _ => unreachable!(),
        },
        _ => Err(SmaltError::type_error(format!(
            "Cannot apply {} to {} and {}",
            op,
            left.kind_name(),
            right.kind_name()
        ))),
    }
}

fn comparison(left: &Value, op: &str, right: &Value) -> Result<Value, SmaltError> {
    let ordering = match (left, right) {
        (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
        _ => {
            return Err(SmaltError::type_error(format!(
                "Cannot compare {} and {}",
                left.kind_name(),
                right.kind_name()
            )));
        }
    };
    let ordering = match ordering {
        Some(ordering) => ordering,
        None => return Ok(Value::Bool(false)), // NaN comparisons
    };
    let result = match op {
        "<" => ordering.is_lt(),
        ">" => ordering.is_gt(),
        "<=" => ordering.is_le(),
        ">=" => ordering.is_ge(),
        _ => unreachable!(),
    };
    Ok(Value::Bool(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;

    fn run(source: &str) -> Result<Value, SmaltError> {
        let unit = Compiler::new().compile_source(source).unwrap();
        Vm::new().run(unit)
    }

    #[test]
    fn test_value_selector_arity_table() {
        assert!(is_value_selector("value", 0));
        assert!(is_value_selector("value:", 1));
        assert!(is_value_selector("value:value:value:value:", 4));
        assert!(!is_value_selector("value:", 0));
        assert!(!is_value_selector("valueWithArguments:", 1));
    }

    #[test]
    fn test_undefined_global_reports_suggestion() {
        let unit = Compiler::new().compile_source("counter := 1. countr").unwrap();
        let err = Vm::new().run(unit).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::UndefinedGlobal);
        assert_eq!(err.suggestion.as_deref(), Some("counter"));
    }

    #[test]
    fn test_division_by_zero_is_an_error() {
        let err = run("1 / 0").unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::DivisionByZero);
    }

    #[test]
    fn test_cross_type_arithmetic_is_an_error() {
        let err = run("1 + 2.0").unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::TypeError);
    }

    #[test]
    fn test_call_depth_guard_fires() {
        let source = r#"
            class Loop [
                spin [ ^self spin ]
            ]
            Loop new spin
        "#;
        let err = run(source).unwrap_err();
        assert!(err.message.contains("Call stack overflow"));
        assert!(!err.call_stack.is_empty());
    }

    #[test]
    fn test_vm_survives_a_runtime_error() {
        let mut compiler = Compiler::new();
        let mut vm = Vm::new();

        let unit = compiler.compile_source("x := 41. 1 / 0").unwrap();
        assert!(vm.run(unit).is_err());

        // Globals written before the error are still observable.
        let unit = compiler.compile_source("x + 1").unwrap();
        match vm.run(unit).unwrap() {
            Value::Int(n) => assert_eq!(n, 42),
            other => panic!("Expected Int, got {:?}", other),
        }
    }

    #[test]
    fn test_dead_home_context_is_an_error() {
        // The method stores a block containing `^`, returns, and the block
        // is invoked afterwards: the home activation is gone.
        let source = r#"
            class Maker [
                make [ ^[ ^1 ] ]
            ]
            b := Maker new make.
            b value
        "#;
        let err = run(source).unwrap_err();
        assert!(err.message.contains("dead home context"));
    }
}
