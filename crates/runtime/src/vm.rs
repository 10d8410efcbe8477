//! The stack VM: value stack, call frames, globals, allocator, and the
//! tracing garbage collector's mutator side. Dispatch is a straight `match`
//! over [`OpCode`], one opcode at a time, matching the reference
//! interpreter's `run()` rather than any threaded-dispatch trick.

use std::ptr;

use lumen_core::{
    Heap, Interner, NativeFn, Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjData, ObjFunction,
    ObjInstance, ObjKind, ObjList, ObjNative, ObjString, OpCode, Table, UpvalueState, Value,
};

use crate::config::VmOptions;
use crate::diagnostics::{Snapshot, SigquitWatch};
use crate::error::{BacktraceFrame, RuntimeError};
use crate::natives;

/// One active invocation: which closure is running, where its bytecode
/// cursor sits, and where its locals start in the shared value stack.
struct CallFrame {
    closure: *mut Obj,
    ip: usize,
    slots_base: usize,
}

/// Collect a full garbage-collection cycle every time total live bytes
/// exceeds `next_gc`, or on every allocation when [`VmOptions::stress_gc`] is
/// set. Scales `next_gc` by [`VmOptions::gc_growth_factor`] after each
/// sweep, giving the heap a self-adjusting growth target.
pub struct Vm {
    stack: Box<[Value]>,
    stack_top: usize,
    frames: Vec<CallFrame>,
    globals: Table,
    strings: Interner,
    open_upvalues: *mut Obj,
    objects: *mut Obj,
    bytes_allocated: usize,
    next_gc: usize,
    gray_stack: Vec<*mut Obj>,
    init_string: *mut Obj,
    /// GC roots for `ObjFunction`s mid-construction by the compiler, pushed
    /// via [`Heap::alloc_function`] and popped via [`Heap::pop_compiler_root`].
    compiler_roots: Vec<*mut Obj>,
    options: VmOptions,
    sigquit: Option<SigquitWatch>,
    dispatch_count: u64,
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new(VmOptions::default())
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        let mut current = self.objects;
        while !current.is_null() {
            let next = unsafe { (*current).next };
            drop(unsafe { Box::from_raw(current) });
            current = next;
        }
    }
}

impl Vm {
    pub fn new(options: VmOptions) -> Self {
        let sigquit = if options.diagnostics_on_sigquit {
            SigquitWatch::install().ok()
        } else {
            None
        };
        let mut vm = Vm {
            stack: vec![Value::Nil; options.stack_size].into_boxed_slice(),
            stack_top: 0,
            frames: Vec::with_capacity(options.frame_max),
            globals: Table::new(),
            strings: Interner::new(),
            open_upvalues: ptr::null_mut(),
            objects: ptr::null_mut(),
            bytes_allocated: 0,
            next_gc: 1024 * 1024,
            gray_stack: Vec::new(),
            init_string: ptr::null_mut(),
            compiler_roots: Vec::new(),
            options,
            sigquit,
            dispatch_count: 0,
        };
        vm.init_string = vm.intern_string("init");
        vm.define_native("print", natives::native_print);
        vm.define_native("println", natives::native_println);
        vm.define_native("readStr", natives::native_read_str);
        vm.define_native("readNum", natives::native_read_num);
        vm.define_native("append", natives::native_append);
        vm.define_native("del", natives::native_del);
        vm
    }

    fn define_native(&mut self, name: &'static str, func: NativeFn) {
        let name_obj = self.intern_string(name);
        self.push(Value::Obj(name_obj));
        let native_obj = self.alloc(ObjData::Native(ObjNative { name, func }));
        self.pop();
        self.globals.set(name_obj, Value::Obj(native_obj));
    }

    // ---- Entry point -----------------------------------------------------

    /// Run a freshly compiled script function to completion. On a runtime
    /// error, prints the message and backtrace to stderr, resets the VM's
    /// stack, and returns the error so the caller can choose an exit code.
    pub fn interpret(&mut self, function: *mut Obj) -> Result<(), RuntimeError> {
        self.push(Value::Obj(function));
        let closure = self.alloc(ObjData::Closure(ObjClosure {
            function,
            upvalues: Box::new([]),
        }));
        self.pop();
        self.push(Value::Obj(closure));
        if let Err(e) = self.call(closure, 0) {
            self.reset_stack();
            eprintln!("{}", e.render());
            return Err(e);
        }
        match self.run() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.reset_stack();
                eprintln!("{}", e.render());
                Err(e)
            }
        }
    }

    fn reset_stack(&mut self) {
        self.stack_top = 0;
        self.frames.clear();
        self.open_upvalues = ptr::null_mut();
    }

    // ---- Value stack -------------------------------------------------

    fn push(&mut self, v: Value) {
        self.stack[self.stack_top] = v;
        self.stack_top += 1;
    }

    fn pop(&mut self) -> Value {
        self.stack_top -= 1;
        self.stack[self.stack_top]
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack_top - 1 - distance]
    }

    // ---- Allocation --------------------------------------------------

    fn alloc(&mut self, data: ObjData) -> *mut Obj {
        let size = approx_size(&data);
        if self.options.stress_gc || self.bytes_allocated + size > self.next_gc {
            self.collect_garbage();
        }
        self.bytes_allocated += size;
        let obj = Box::into_raw(Box::new(Obj {
            marked: false,
            next: self.objects,
            data,
        }));
        self.objects = obj;
        obj
    }

    fn new_class(&mut self, name: *mut Obj) -> *mut Obj {
        self.alloc(ObjData::Class(ObjClass {
            name,
            methods: Table::new(),
        }))
    }

    fn new_instance(&mut self, class: *mut Obj) -> *mut Obj {
        self.alloc(ObjData::Instance(ObjInstance {
            class,
            fields: Table::new(),
        }))
    }

    fn new_bound_method(&mut self, receiver: Value, method: *mut Obj) -> *mut Obj {
        self.alloc(ObjData::BoundMethod(ObjBoundMethod { receiver, method }))
    }

    fn new_list(&mut self, items: Vec<Value>) -> *mut Obj {
        self.alloc(ObjData::List(ObjList { items }))
    }

    // ---- Garbage collection -------------------------------------------

    fn collect_garbage(&mut self) {
        self.mark_roots();
        self.trace_references();
        self.strings.remove_unmarked();
        self.sweep();
        self.next_gc = self.bytes_allocated * self.options.gc_growth_factor.max(1);
    }

    fn mark_roots(&mut self) {
        for i in 0..self.stack_top {
            self.mark_value(self.stack[i]);
        }
        let closures: Vec<*mut Obj> = self.frames.iter().map(|f| f.closure).collect();
        for c in closures {
            self.mark_object(c);
        }
        let mut uv = self.open_upvalues;
        while !uv.is_null() {
            self.mark_object(uv);
            uv = unsafe { (*uv).as_upvalue().expect("open upvalue list node").open_next };
        }
        let entries: Vec<(*mut Obj, Value)> = self.globals.iter().collect();
        for (k, v) in entries {
            self.mark_object(k);
            self.mark_value(v);
        }
        if !self.init_string.is_null() {
            self.mark_object(self.init_string);
        }
        let roots = self.compiler_roots.clone();
        for r in roots {
            self.mark_object(r);
        }
    }

    fn mark_object(&mut self, obj: *mut Obj) {
        if obj.is_null() {
            return;
        }
        if unsafe { (*obj).marked } {
            return;
        }
        unsafe {
            (*obj).marked = true;
        }
        self.gray_stack.push(obj);
    }

    fn mark_value(&mut self, v: Value) {
        if let Some(p) = v.as_obj() {
            self.mark_object(p);
        }
    }

    fn trace_references(&mut self) {
        while let Some(obj) = self.gray_stack.pop() {
            self.blacken_object(obj);
        }
    }

    fn blacken_object(&mut self, obj: *mut Obj) {
        // The match borrows `(*obj).data`, which lives in its own boxed
        // allocation, not inside `self`. Calling `self.mark_*` from within
        // the arms doesn't conflict with that borrow.
        unsafe {
            match &(*obj).data {
                ObjData::String(_) | ObjData::Native(_) => {}
                ObjData::Upvalue(u) => {
                    if let UpvalueState::Closed(v) = u.state {
                        self.mark_value(v);
                    }
                }
                ObjData::Function(f) => {
                    if let Some(n) = f.name {
                        self.mark_object(n);
                    }
                    for c in f.chunk.constants() {
                        self.mark_value(*c);
                    }
                }
                ObjData::Closure(c) => {
                    self.mark_object(c.function);
                    for uv in c.upvalues.iter() {
                        self.mark_object(*uv);
                    }
                }
                ObjData::Class(cl) => {
                    self.mark_object(cl.name);
                    for (k, v) in cl.methods.iter() {
                        self.mark_object(k);
                        self.mark_value(v);
                    }
                }
                ObjData::Instance(inst) => {
                    self.mark_object(inst.class);
                    for (k, v) in inst.fields.iter() {
                        self.mark_object(k);
                        self.mark_value(v);
                    }
                }
                ObjData::BoundMethod(b) => {
                    self.mark_value(b.receiver);
                    self.mark_object(b.method);
                }
                ObjData::List(l) => {
                    for v in l.items.iter() {
                        self.mark_value(*v);
                    }
                }
            }
        }
    }

    fn sweep(&mut self) {
        let mut prev: *mut Obj = ptr::null_mut();
        let mut current = self.objects;
        while !current.is_null() {
            if unsafe { (*current).marked } {
                unsafe {
                    (*current).marked = false;
                }
                prev = current;
                current = unsafe { (*current).next };
            } else {
                let unreached = current;
                current = unsafe { (*current).next };
                if prev.is_null() {
                    self.objects = current;
                } else {
                    unsafe {
                        (*prev).next = current;
                    }
                }
                let size = approx_size(unsafe { &(*unreached).data });
                self.bytes_allocated = self.bytes_allocated.saturating_sub(size);
                drop(unsafe { Box::from_raw(unreached) });
            }
        }
    }

    // ---- Diagnostics ---------------------------------------------------

    fn maybe_report_diagnostics(&mut self) {
        self.dispatch_count += 1;
        if self.dispatch_count & 0xfff != 0 {
            return;
        }
        let requested = self.sigquit.as_ref().is_some_and(|w| w.requested());
        if requested {
            let snapshot = Snapshot {
                frame_depth: self.frames.len(),
                stack_depth: self.stack_top,
                bytes_allocated: self.bytes_allocated,
                next_gc: self.next_gc,
            };
            eprintln!("{snapshot}");
        }
    }

    // ---- Bytecode cursor -----------------------------------------------

    fn current_frame(&self) -> &CallFrame {
        self.frames.last().expect("run() only called with an active frame")
    }

    fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("run() only called with an active frame")
    }

    fn chunk_len(&self, closure: *mut Obj) -> usize {
        unsafe {
            let c = (*closure).as_closure().expect("frame closure");
            (*c.function).as_function().expect("closure function").chunk.len()
        }
    }

    fn byte_at(&self, closure: *mut Obj, offset: usize) -> u8 {
        unsafe {
            let c = (*closure).as_closure().expect("frame closure");
            (*c.function).as_function().expect("closure function").chunk.byte_at(offset)
        }
    }

    fn line_at(&self, closure: *mut Obj, offset: usize) -> u32 {
        unsafe {
            let c = (*closure).as_closure().expect("frame closure");
            (*c.function).as_function().expect("closure function").chunk.line_at(offset)
        }
    }

    fn constant_at(&self, closure: *mut Obj, index: u8) -> Value {
        unsafe {
            let c = (*closure).as_closure().expect("frame closure");
            (*c.function).as_function().expect("closure function").chunk.constant(index)
        }
    }

    fn read_byte(&mut self) -> u8 {
        let closure = self.current_frame().closure;
        let ip = self.current_frame().ip;
        let byte = self.byte_at(closure, ip);
        self.current_frame_mut().ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte();
        let closure = self.current_frame().closure;
        self.constant_at(closure, idx)
    }

    fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
        let mut backtrace = Vec::new();
        for frame in self.frames.iter().rev() {
            let line = self.line_at(frame.closure, frame.ip.saturating_sub(1));
            let name = unsafe {
                let c = (*frame.closure).as_closure().expect("frame closure");
                let function = (*c.function).as_function().expect("closure function");
                function.name.map(|n| (*n).as_string().expect("function name is a string").to_string())
            };
            backtrace.push(BacktraceFrame { function_name: name, line });
        }
        RuntimeError::new(message, backtrace)
    }

    // ---- Calls -----------------------------------------------------------

    fn call(&mut self, closure_ptr: *mut Obj, argc: usize) -> Result<(), RuntimeError> {
        let (arity, upvalue_count) = unsafe {
            let c = (*closure_ptr).as_closure().expect("callee is a closure");
            let f = (*c.function).as_function().expect("closure function");
            (f.arity as usize, f.upvalue_count)
        };
        let _ = upvalue_count;
        if argc != arity {
            let word = if arity == 1 { "argument" } else { "arguments" };
            return Err(self.runtime_error(format!("Expected {arity} {word} but got {argc}.")));
        }
        if self.frames.len() >= self.options.frame_max {
            return Err(self.runtime_error("Stack overflow."));
        }
        let slots_base = self.stack_top - argc - 1;
        self.frames.push(CallFrame { closure: closure_ptr, ip: 0, slots_base });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
        if let Some(ptr) = callee.as_obj() {
            match unsafe { (*ptr).kind() } {
                ObjKind::BoundMethod => {
                    let (receiver, method) = unsafe {
                        let bm = (*ptr).as_bound_method().expect("checked kind above");
                        (bm.receiver, bm.method)
                    };
                    let slot = self.stack_top - argc - 1;
                    self.stack[slot] = receiver;
                    return self.call(method, argc);
                }
                ObjKind::Class => {
                    let instance = self.new_instance(ptr);
                    let slot = self.stack_top - argc - 1;
                    self.stack[slot] = Value::Obj(instance);
                    let init = unsafe { (*ptr).as_class().expect("checked kind above").methods.get(self.init_string) };
                    if let Some(init_val) = init {
                        let closure = init_val.as_obj().expect("method table stores closures");
                        return self.call(closure, argc);
                    } else if argc != 0 {
                        return Err(self.runtime_error(format!("Expected 0 arguments but got {argc}.")));
                    }
                    return Ok(());
                }
                ObjKind::Closure => return self.call(ptr, argc),
                ObjKind::Native => {
                    let func = unsafe { (*ptr).as_native().expect("checked kind above").func };
                    let base = self.stack_top - argc;
                    let args: Vec<Value> = self.stack[base..base + argc].to_vec();
                    let result = func(self, &args).map_err(|msg| self.runtime_error(msg))?;
                    self.stack_top = base - 1;
                    self.push(result);
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(self.runtime_error("Only functions and classes are callable."))
    }

    fn bind_method(&mut self, class_ptr: *mut Obj, name: *mut Obj) -> Result<(), RuntimeError> {
        let method = unsafe { (*class_ptr).as_class().expect("bind_method on a class").methods.get(name) };
        let closure_ptr = match method {
            Some(v) => v.as_obj().expect("method table stores closures"),
            None => {
                let n = unsafe { (*name).as_string().expect("property name is a string") };
                return Err(self.runtime_error(format!("Undefined property '{n}'.")));
            }
        };
        let receiver = self.pop();
        let bound = self.new_bound_method(receiver, closure_ptr);
        self.push(Value::Obj(bound));
        Ok(())
    }

    fn invoke_from_class(&mut self, class_ptr: *mut Obj, name: *mut Obj, argc: usize) -> Result<(), RuntimeError> {
        let method = unsafe { (*class_ptr).as_class().expect("invoke on a class").methods.get(name) };
        let closure_ptr = match method {
            Some(v) => v.as_obj().expect("method table stores closures"),
            None => {
                let n = unsafe { (*name).as_string().expect("property name is a string") };
                return Err(self.runtime_error(format!("Undefined property '{n}'.")));
            }
        };
        self.call(closure_ptr, argc)
    }

    fn invoke(&mut self, name: *mut Obj, argc: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc);
        let inst_ptr = match receiver.as_obj().filter(|p| unsafe { (**p).kind() == ObjKind::Instance }) {
            Some(p) => p,
            None => return Err(self.runtime_error("Only instances have methods.")),
        };
        let field = unsafe { (*inst_ptr).as_instance().expect("checked kind above").fields.get(name) };
        if let Some(v) = field {
            let slot = self.stack_top - argc - 1;
            self.stack[slot] = v;
            return self.call_value(v, argc);
        }
        let class_ptr = unsafe { (*inst_ptr).as_instance().expect("checked kind above").class };
        self.invoke_from_class(class_ptr, name, argc)
    }

    // ---- Upvalues ----------------------------------------------------

    fn capture_upvalue(&mut self, location: usize) -> *mut Obj {
        let mut prev: *mut Obj = ptr::null_mut();
        let mut current = self.open_upvalues;
        while !current.is_null() {
            let loc = unsafe {
                match (*current).as_upvalue().expect("open upvalue list node").state {
                    UpvalueState::Open(l) => l,
                    UpvalueState::Closed(_) => unreachable!("open list holds only open upvalues"),
                }
            };
            if loc == location {
                return current;
            }
            if loc < location {
                break;
            }
            prev = current;
            current = unsafe { (*current).as_upvalue().expect("open upvalue list node").open_next };
        }
        let created = self.alloc(ObjData::Upvalue(lumen_core::ObjUpvalue {
            state: UpvalueState::Open(location),
            open_next: current,
        }));
        if prev.is_null() {
            self.open_upvalues = created;
        } else {
            unsafe {
                (*prev).as_upvalue_mut().expect("open upvalue list node").open_next = created;
            }
        }
        created
    }

    fn close_upvalues(&mut self, watermark: usize) {
        while !self.open_upvalues.is_null() {
            let (loc, next) = unsafe {
                let uv = (*self.open_upvalues).as_upvalue().expect("open upvalue list node");
                let loc = match uv.state {
                    UpvalueState::Open(l) => l,
                    UpvalueState::Closed(_) => unreachable!("open list holds only open upvalues"),
                };
                (loc, uv.open_next)
            };
            if loc < watermark {
                break;
            }
            let value = self.stack[loc];
            unsafe {
                (*self.open_upvalues).as_upvalue_mut().expect("open upvalue list node").state =
                    UpvalueState::Closed(value);
            }
            self.open_upvalues = next;
        }
    }

    // ---- Arithmetic/coercion --------------------------------------------

    fn to_str(&self, v: Value) -> Result<String, RuntimeError> {
        match v {
            Value::Nil => Ok("nil".to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Number(_) => Ok(natives::display_value(&v)),
            _ if v.is_string() => Ok(natives::display_value(&v)),
            _ => Err(self.runtime_error(
                "Can only concatenate strings with strings, numbers, booleans, or nil.",
            )),
        }
    }

    fn op_add(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        if let (Some(an), Some(bn)) = (a.as_number(), b.as_number()) {
            self.pop();
            self.pop();
            self.push(Value::Number(an + bn));
            return Ok(());
        }
        if a.is_string() || b.is_string() {
            let astr = self.to_str(a)?;
            let bstr = self.to_str(b)?;
            self.pop();
            self.pop();
            let combined = format!("{astr}{bstr}");
            let obj = self.intern_string(&combined);
            self.push(Value::Obj(obj));
            return Ok(());
        }
        Err(self.runtime_error("Operands must be numbers."))
    }

    fn binary_arith(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        let (an, bn) = match (a.as_number(), b.as_number()) {
            (Some(an), Some(bn)) => (an, bn),
            _ => return Err(self.runtime_error("Operands must be numbers.")),
        };
        if matches!(op, OpCode::Div | OpCode::Mod) && bn == 0.0 {
            return Err(self.runtime_error("Division by zero."));
        }
        self.pop();
        self.pop();
        let result = match op {
            OpCode::Sub => an - bn,
            OpCode::Mul => an * bn,
            OpCode::Div => an / bn,
            OpCode::Mod => an % bn,
            OpCode::Pow => an.powf(bn),
            _ => unreachable!("binary_arith called with non-arithmetic opcode"),
        };
        self.push(Value::Number(result));
        Ok(())
    }

    fn binary_compare(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        let (an, bn) = match (a.as_number(), b.as_number()) {
            (Some(an), Some(bn)) => (an, bn),
            _ => return Err(self.runtime_error("Operands must be numbers.")),
        };
        self.pop();
        self.pop();
        let result = match op {
            OpCode::Gt => an > bn,
            OpCode::Lt => an < bn,
            OpCode::GtEqu => an >= bn,
            OpCode::LtEqu => an <= bn,
            _ => unreachable!("binary_compare called with non-comparison opcode"),
        };
        self.push(Value::Bool(result));
        Ok(())
    }

    // ---- Dispatch loop ----------------------------------------------------

    #[allow(clippy::too_many_lines)]
    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            self.maybe_report_diagnostics();
            if self.options.trace_exec {
                self.trace_instruction();
            }
            let op = OpCode::from_u8(self.read_byte());
            match op {
                OpCode::Const => {
                    let v = self.read_constant();
                    self.push(v);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Dup => self.push(self.peek(0)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().slots_base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().slots_base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_constant().as_obj().expect("global name is interned");
                    match self.globals.get(name) {
                        Some(v) => self.push(v),
                        None => {
                            let n = unsafe { (*name).as_string().expect("global name is a string") };
                            return Err(self.runtime_error(format!("Undefined variable '{n}'.")));
                        }
                    }
                }
                OpCode::DefGlobal => {
                    let name = self.read_constant().as_obj().expect("global name is interned");
                    let v = self.peek(0);
                    self.globals.set(name, v);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_constant().as_obj().expect("global name is interned");
                    let v = self.peek(0);
                    if self.globals.set(name, v) {
                        self.globals.delete(name);
                        let n = unsafe { (*name).as_string().expect("global name is a string") };
                        return Err(self.runtime_error(format!("Undefined variable '{n}'.")));
                    }
                }
                OpCode::GetUpval => {
                    let idx = self.read_byte() as usize;
                    let closure = self.current_frame().closure;
                    let uv_ptr = unsafe { (*closure).as_closure().expect("frame closure").upvalues[idx] };
                    let v = unsafe {
                        match (*uv_ptr).as_upvalue().expect("upvalue slot").state {
                            UpvalueState::Open(loc) => self.stack[loc],
                            UpvalueState::Closed(v) => v,
                        }
                    };
                    self.push(v);
                }
                OpCode::SetUpval => {
                    let idx = self.read_byte() as usize;
                    let closure = self.current_frame().closure;
                    let uv_ptr = unsafe { (*closure).as_closure().expect("frame closure").upvalues[idx] };
                    let v = self.peek(0);
                    let state = unsafe { (*uv_ptr).as_upvalue().expect("upvalue slot").state };
                    match state {
                        UpvalueState::Open(loc) => self.stack[loc] = v,
                        UpvalueState::Closed(_) => unsafe {
                            (*uv_ptr).as_upvalue_mut().expect("upvalue slot").state = UpvalueState::Closed(v);
                        },
                    }
                }
                OpCode::GetProp => {
                    let name = self.read_constant().as_obj().expect("property name is interned");
                    let receiver = self.peek(0);
                    let inst_ptr = match receiver.as_obj().filter(|p| unsafe { (**p).kind() == ObjKind::Instance }) {
                        Some(p) => p,
                        None => return Err(self.runtime_error("Only instances have properties.")),
                    };
                    let field = unsafe { (*inst_ptr).as_instance().expect("checked kind above").fields.get(name) };
                    if let Some(v) = field {
                        self.pop();
                        self.push(v);
                    } else {
                        let class_ptr = unsafe { (*inst_ptr).as_instance().expect("checked kind above").class };
                        self.bind_method(class_ptr, name)?;
                    }
                }
                OpCode::SetProp => {
                    let name = self.read_constant().as_obj().expect("property name is interned");
                    let value = self.peek(0);
                    let receiver = self.peek(1);
                    let inst_ptr = match receiver.as_obj().filter(|p| unsafe { (**p).kind() == ObjKind::Instance }) {
                        Some(p) => p,
                        None => return Err(self.runtime_error("Only instances have fields.")),
                    };
                    unsafe {
                        (*inst_ptr).as_instance_mut().expect("checked kind above").fields.set(name, value);
                    }
                    let v = self.pop();
                    self.pop();
                    self.push(v);
                }
                OpCode::GetSuper => {
                    let name = self.read_constant().as_obj().expect("method name is interned");
                    let superclass = self.pop().as_obj().expect("compiler guarantees a class here");
                    self.bind_method(superclass, name)?;
                }
                OpCode::BuildList => {
                    let n = self.read_byte() as usize;
                    let base = self.stack_top - n;
                    let items: Vec<Value> = self.stack[base..base + n].to_vec();
                    self.stack_top = base;
                    let list_ptr = self.new_list(items);
                    self.push(Value::Obj(list_ptr));
                }
                OpCode::IndexSub => {
                    let index = self.pop();
                    let receiver = self.pop();
                    let list_ptr = match receiver.as_obj().filter(|p| unsafe { (**p).kind() == ObjKind::List }) {
                        Some(p) => p,
                        None => return Err(self.runtime_error("Can only index a list.")),
                    };
                    let i = match index.as_number() {
                        Some(n) => n as i64,
                        None => return Err(self.runtime_error("List index must be a number.")),
                    };
                    let list = unsafe { (*list_ptr).as_list().expect("checked kind above") };
                    if i < 0 || i as usize >= list.items.len() {
                        return Err(self.runtime_error(format!("List index {i} out of range.")));
                    }
                    self.push(list.items[i as usize]);
                }
                OpCode::StoreSub => {
                    let value = self.pop();
                    let index = self.pop();
                    let receiver = self.pop();
                    let list_ptr = match receiver.as_obj().filter(|p| unsafe { (**p).kind() == ObjKind::List }) {
                        Some(p) => p,
                        None => return Err(self.runtime_error("Can only index a list.")),
                    };
                    let i = match index.as_number() {
                        Some(n) => n as i64,
                        None => return Err(self.runtime_error("List index must be a number.")),
                    };
                    let list = unsafe { (*list_ptr).as_list_mut().expect("checked kind above") };
                    if i < 0 || i as usize >= list.items.len() {
                        return Err(self.runtime_error(format!("List index {i} out of range.")));
                    }
                    list.items[i as usize] = value;
                    self.push(value);
                }
                OpCode::Equ => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::NotEqu => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a != b));
                }
                OpCode::Gt | OpCode::Lt | OpCode::GtEqu | OpCode::LtEqu => self.binary_compare(op)?,
                OpCode::Add => self.op_add()?,
                OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod | OpCode::Pow => self.binary_arith(op)?,
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()));
                }
                OpCode::Negate => {
                    let n = match self.peek(0).as_number() {
                        Some(n) => n,
                        None => return Err(self.runtime_error("Operand must be a number.")),
                    };
                    self.pop();
                    self.push(Value::Number(-n));
                }
                OpCode::Jmp => {
                    let off = self.read_u16();
                    self.current_frame_mut().ip += off as usize;
                }
                OpCode::Jmpf => {
                    let off = self.read_u16();
                    if self.peek(0).is_falsey() {
                        self.current_frame_mut().ip += off as usize;
                    }
                }
                OpCode::Loop => {
                    let off = self.read_u16();
                    self.current_frame_mut().ip -= off as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    let callee = self.peek(argc);
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke => {
                    let name = self.read_constant().as_obj().expect("method name is interned");
                    let argc = self.read_byte() as usize;
                    self.invoke(name, argc)?;
                }
                OpCode::InvokeSuper => {
                    let name = self.read_constant().as_obj().expect("method name is interned");
                    let argc = self.read_byte() as usize;
                    let superclass = self.pop().as_obj().expect("compiler guarantees a class here");
                    self.invoke_from_class(superclass, name, argc)?;
                }
                OpCode::Closure => {
                    let function_ptr = self.read_constant().as_obj().expect("closure operand is a function");
                    let upvalue_count = unsafe { (*function_ptr).as_function().expect("closure function").upvalue_count };
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let base = self.current_frame().slots_base;
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            let enclosing = self.current_frame().closure;
                            let uv = unsafe { (*enclosing).as_closure().expect("frame closure").upvalues[index] };
                            upvalues.push(uv);
                        }
                    }
                    let closure_ptr = self.alloc(ObjData::Closure(ObjClosure {
                        function: function_ptr,
                        upvalues: upvalues.into_boxed_slice(),
                    }));
                    self.push(Value::Obj(closure_ptr));
                }
                OpCode::CloseUpval => {
                    self.close_upvalues(self.stack_top - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("run() only called with an active frame");
                    self.close_upvalues(frame.slots_base);
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack_top = frame.slots_base;
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_constant().as_obj().expect("class name is interned");
                    let class_ptr = self.new_class(name);
                    self.push(Value::Obj(class_ptr));
                }
                OpCode::Inherit => {
                    let superclass_val = self.peek(1);
                    let sub_ptr = self.peek(0).as_obj().expect("compiler always pushes a class here");
                    let super_ptr = match superclass_val.as_obj().filter(|p| unsafe { (**p).kind() == ObjKind::Class }) {
                        Some(p) => p,
                        None => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    let inherited: Vec<(*mut Obj, Value)> =
                        unsafe { (*super_ptr).as_class().expect("checked kind above").methods.iter().collect() };
                    unsafe {
                        let sub_class = (*sub_ptr).as_class_mut().expect("compiler always pushes a class here");
                        for (k, v) in inherited {
                            sub_class.methods.set(k, v);
                        }
                    }
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_constant().as_obj().expect("method name is interned");
                    let method_val = self.peek(0);
                    let class_ptr = self.peek(1).as_obj().expect("compiler always pushes a class here");
                    unsafe {
                        (*class_ptr).as_class_mut().expect("compiler always pushes a class here").methods.set(name, method_val);
                    }
                    self.pop();
                }
            }
        }
    }

    fn trace_instruction(&self) {
        let closure = self.current_frame().closure;
        let ip = self.current_frame().ip;
        if ip >= self.chunk_len(closure) {
            return;
        }
        let byte = self.byte_at(closure, ip);
        let line = self.line_at(closure, ip);
        eprint!("{ip:04} (line {line:4}) ");
        for i in 0..self.stack_top {
            eprint!("[ {:?} ]", self.stack[i]);
        }
        eprintln!(" -> {:?}", OpCode::from_u8(byte));
    }
}

impl Heap for Vm {
    fn intern_string(&mut self, s: &str) -> *mut Obj {
        let hash = Interner::hash_of(s);
        if let Some(existing) = self.strings.find(s, hash) {
            return existing;
        }
        let obj = self.alloc(ObjData::String(ObjString::new(s)));
        self.strings.record(obj);
        obj
    }

    fn alloc_function(&mut self, function: ObjFunction) -> *mut Obj {
        let obj = self.alloc(ObjData::Function(function));
        self.compiler_roots.push(obj);
        obj
    }

    fn pop_compiler_root(&mut self) {
        self.compiler_roots.pop();
    }
}

/// A deliberately rough per-variant size estimate, just precise enough for
/// `next_gc` to track real heap growth; not an exact byte count.
fn approx_size(data: &ObjData) -> usize {
    use std::mem::size_of;
    match data {
        ObjData::String(s) => size_of::<ObjString>() + s.len() + 1,
        ObjData::Function(_) => size_of::<ObjFunction>(),
        ObjData::Closure(c) => size_of::<ObjClosure>() + c.upvalues.len() * size_of::<*mut Obj>(),
        ObjData::Upvalue(_) => size_of::<lumen_core::ObjUpvalue>(),
        ObjData::Class(_) => size_of::<ObjClass>(),
        ObjData::Instance(_) => size_of::<ObjInstance>(),
        ObjData::BoundMethod(_) => size_of::<ObjBoundMethod>(),
        ObjData::Native(_) => size_of::<ObjNative>(),
        ObjData::List(l) => size_of::<ObjList>() + l.items.len() * size_of::<Value>(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumenc::{CompilerConfig, compile};

    fn run_ok(source: &str) -> Vm {
        let mut vm = Vm::new(VmOptions { stress_gc: true, ..VmOptions::default() });
        let function = compile(source, &mut vm, &CompilerConfig::default()).expect("source compiles");
        vm.interpret(function).expect("source runs without a runtime error");
        vm
    }

    fn run_err(source: &str) -> RuntimeError {
        let mut vm = Vm::new(VmOptions::default());
        let function = compile(source, &mut vm, &CompilerConfig::default()).expect("source compiles");
        vm.interpret(function).expect_err("source raises a runtime error")
    }

    #[test]
    fn arithmetic_precedence_and_globals() {
        run_ok("let x = 1 + 2 * 3; if (x != 7) { 1/0; }");
    }

    #[test]
    fn string_concatenation_coerces_numbers_and_booleans() {
        run_ok(r#"
            let s = "n=" + 3 + " ok=" + true;
            if (s != "n=3 ok=true") { 1/0; }
        "#);
    }

    #[test]
    fn closures_capture_and_share_mutable_state() {
        run_ok(r#"
            func makeCounter() {
                let n = 0;
                func inc() {
                    n = n + 1;
                    return n;
                }
                return inc;
            }
            let counter = makeCounter();
            let a = counter();
            let b = counter();
            if (a != 1 || b != 2) { 1/0; }
        "#);
    }

    #[test]
    fn classes_inherit_methods_and_bind_super_calls() {
        run_ok(r#"
            class Animal {
                func speak() { return "..."; }
            }
            class Dog extends Animal {
                func speak() { return "Woof, " + super.speak(); }
            }
            let d = Dog();
            if (d.speak() != "Woof, ...") { 1/0; }
        "#);
    }

    #[test]
    fn list_indexing_reads_and_writes_in_place() {
        run_ok(r#"
            let xs = [1, 2, 3];
            xs[1] = 9;
            if (xs[1] != 9) { 1/0; }
        "#);
    }

    #[test]
    fn match_falls_through_to_default_arm() {
        run_ok(r#"
            let x = 5;
            let label = "none";
            match (x) {
                with 1 -> { label = "one"; }
                _ -> { label = "other"; }
            }
            if (label != "other") { 1/0; }
        "#);
    }

    #[test]
    fn calling_with_wrong_arity_is_a_runtime_error() {
        let err = run_err(r#"
            func f(a) { return a; }
            f(1, 2);
        "#);
        assert!(err.message.contains("Expected 1 argument"));
    }

    #[test]
    fn comparison_of_non_numbers_is_a_runtime_error() {
        let err = run_err(r#"if ("a" < "b") { 1; }"#);
        assert!(err.message.contains("Operands must be numbers"));
    }

    #[test]
    fn division_by_zero_is_a_runtime_error() {
        let err = run_err("let x = 1 / 0;");
        assert!(err.message.contains("Division by zero"));
    }

    #[test]
    fn undefined_global_assignment_is_a_runtime_error() {
        let err = run_err("notDeclared = 1;");
        assert!(err.message.contains("Undefined variable"));
    }

    #[test]
    fn backtrace_reports_innermost_frame_first() {
        let err = run_err(r#"
            func inner() { return 1/0; }
            func outer() { return inner(); }
            outer();
        "#);
        assert!(err.backtrace.len() >= 2);
        assert_eq!(err.backtrace[0].function_name.as_deref(), Some("inner"));
    }
}
