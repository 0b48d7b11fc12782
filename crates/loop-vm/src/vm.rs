//! The VM: value stack, frame stack, handler stack, open-upvalue list, and
//! the fetch/decode/execute dispatch loop (§4.6–§4.9).
//!
//! Garbage collection is checked once per fetched instruction rather than
//! once per allocation: every opcode handler runs to completion (linking
//! every object it allocates into the stack, the open-upvalue list, a
//! table, or a frame) before the next instruction's checkpoint can ever
//! observe it, so nothing is ever unrooted when a collection actually
//! runs. This is also exactly the granularity a forced collection between
//! two separate `PushConstant` instructions needs to be safe.

use std::io::Write;

use tracing::trace;

use crate::chunk::Chunk;
use crate::config::VmConfig;
use crate::error::VmError;
use crate::gc::{Heap, Obj, ObjId, ObjKind};
use crate::loader::{self, FileSystem, ImportAction, ModuleLoader};
use crate::opcode::Opcode;
use crate::value::{
    ModuleState, ObjBoundMethod, ObjClosure, ObjDictionary, ObjInstance, ObjList, ObjUpvalue,
    UpvalueLocation, Value,
};

/// `stack_ptr ∈ [stack, stack+STACK_CAPACITY]` (§3 invariant 4).
pub const STACK_CAPACITY: usize = 1024;
/// `frame_ptr ∈ [frames, frames+FRAMES_CAPACITY]`.
pub const FRAMES_CAPACITY: usize = 256;
/// `handler_ptr ∈ [handlers, handlers+HANDLERS_CAPACITY]`.
pub const HANDLERS_CAPACITY: usize = 64;

/// An activation record (§3 invariant 5, §4.6). `locals` is the stack index
/// of slot 0 — the callable itself, used as `self` for methods.
#[derive(Debug, Clone, Copy)]
struct CallFrame {
    function: ObjId,
    closure: Option<ObjId>,
    ip: usize,
    locals: usize,
}

/// A saved interpreter state used to resume after a `Throw` (§4.8).
#[derive(Debug, Clone, Copy)]
struct Handler {
    frame_index: usize,
    ip: usize,
    stack_ptr: usize,
    open_upvalues: Option<ObjId>,
}

/// The interpreter instance: owns the heap and every piece of mutable
/// execution state (§5 — "the intern set, module registry, and well-known
/// strings live inside the single interpreter-instance value and are
/// threaded explicitly"). File I/O is not owned here; it's passed to
/// [`Vm::run`] as a `&dyn FileSystem`, mirroring the teacher's
/// `Vm::run<M: MemorySpace>(proc, mem, realm)` pattern of threading
/// collaborators through the call rather than storing them.
pub struct Vm {
    pub heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    handlers: Vec<Handler>,
    /// Head of the intrusive open-upvalue list (§4.7). Unsorted; lookup
    /// during capture is linear, matching the original's linked-list scan.
    open_upvalues: Option<ObjId>,
    /// The interned string `"init"`, used to look up a class's
    /// constructor without re-interning it on every `Call` of a `Class`.
    init_string: ObjId,
    /// The interned `packages_path`, kept alive as a GC root (§4.4) even
    /// though nothing but the loader ever reads it back out.
    packages_path: ObjId,
    loader: ModuleLoader,
    out: Box<dyn Write>,
    err: Box<dyn Write>,
}

impl Vm {
    #[must_use]
    pub fn new(config: VmConfig) -> Self {
        let mut heap = Heap::new(config.stress_gc);
        let init_string = heap.intern_string(b"init".to_vec());
        let packages_path = heap.intern_string(config.packages_path.to_string_lossy().into_owned().into_bytes());
        Vm {
            loader: ModuleLoader::new(config.packages_path),
            heap,
            stack: Vec::with_capacity(STACK_CAPACITY),
            frames: Vec::with_capacity(FRAMES_CAPACITY),
            handlers: Vec::with_capacity(HANDLERS_CAPACITY),
            open_upvalues: None,
            init_string,
            packages_path,
            out: config.out,
            err: config.err,
        }
    }

    /// Loads `entry_path` as the program's entry module, begins its
    /// execution, and runs the dispatch loop to completion. Prints a
    /// diagnostic line for any error before returning it (§7).
    pub fn run_file(&mut self, fs: &dyn FileSystem, entry_path: &str) -> Result<Value, VmError> {
        let result = self.run_file_inner(fs, entry_path);
        if let Err(ref e) = result {
            let _ = writeln!(self.err, "error: {e}");
        }
        result
    }

    fn run_file_inner(&mut self, fs: &dyn FileSystem, entry_path: &str) -> Result<Value, VmError> {
        let module_id = self.loader.load_module(&mut self.heap, fs, "", entry_path)?;
        self.heap.enabled = true;
        self.begin_module_frame(module_id, entry_path)?;
        self.run(fs)
    }

    /// Drives the module-initialization state machine (§4.5) for a module
    /// about to become the active frame, pushing its script frame with the
    /// module object itself occupying local slot 0 — the same call
    /// discipline every other callable kind uses (§4.6).
    fn begin_module_frame(&mut self, module_id: ObjId, display_path: &str) -> Result<(), VmError> {
        match loader::begin_import(&mut self.heap, module_id, display_path)? {
            ImportAction::PushScriptFrame(script_fn) => {
                self.push(Value::Object(module_id))?;
                self.push_frame(script_fn, None, 0)
            }
            ImportAction::AlreadyExecuted => self.push(Value::Object(module_id)),
        }
    }

    /// Runs the fetch/decode/execute loop until the outermost frame
    /// returns or ends its module, yielding that final value.
    pub fn run(&mut self, fs: &dyn FileSystem) -> Result<Value, VmError> {
        loop {
            if let Some(value) = self.step(fs)? {
                return Ok(value);
            }
        }
    }

    fn step(&mut self, fs: &dyn FileSystem) -> Result<Option<Value>, VmError> {
        self.maybe_collect();
        let byte = self.read_byte();
        let opcode = Opcode::try_from(byte)?;
        self.execute(opcode, fs)
    }

    // ---- stack primitives -------------------------------------------------

    fn push(&mut self, value: Value) -> Result<(), VmError> {
        if self.stack.len() >= STACK_CAPACITY {
            return Err(VmError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    fn peek(&self, distance: usize) -> Result<Value, VmError> {
        let len = self.stack.len();
        if distance >= len {
            return Err(VmError::StackUnderflow);
        }
        Ok(self.stack[len - 1 - distance])
    }

    // ---- frame primitives ---------------------------------------------

    fn frame_function(&self) -> ObjId {
        self.frames.last().expect("dispatch loop always has an active frame").function
    }

    fn frame_closure(&self) -> Option<ObjId> {
        self.frames.last().expect("dispatch loop always has an active frame").closure
    }

    fn frame_locals(&self) -> usize {
        self.frames.last().expect("dispatch loop always has an active frame").locals
    }

    fn frame_ip(&self) -> usize {
        self.frames.last().expect("dispatch loop always has an active frame").ip
    }

    fn set_frame_ip(&mut self, ip: usize) {
        self.frames.last_mut().expect("dispatch loop always has an active frame").ip = ip;
    }

    fn current_module(&self) -> ObjId {
        let function = self.frame_function();
        self.heap.as_function(function).expect("frame's function is always valid").module
    }

    fn read_byte(&mut self) -> u8 {
        let function = self.frame_function();
        let ip = self.frame_ip();
        let byte = self.heap.as_function(function).expect("frame's function is always valid").chunk.code[ip];
        self.set_frame_ip(ip + 1);
        byte
    }

    /// Two-byte little-endian jump operand (§4.9).
    fn read_u16(&mut self) -> u16 {
        let lo = self.read_byte();
        let hi = self.read_byte();
        u16::from_le_bytes([lo, hi])
    }

    fn read_constant(&mut self, idx: u8) -> Value {
        let function = self.frame_function();
        self.heap.as_function(function).expect("frame's function is always valid").chunk.constants[idx as usize]
    }

    fn jump_forward(&mut self, offset: u16) {
        let ip = self.frame_ip();
        self.set_frame_ip(ip + offset as usize);
    }

    fn jump_backward(&mut self, offset: u16) {
        let ip = self.frame_ip();
        self.set_frame_ip(ip - offset as usize);
    }

    /// Pushes a new frame over `arg_count` already-on-stack arguments plus
    /// the callable itself (§4.6's call stack discipline).
    fn push_frame(&mut self, function: ObjId, closure: Option<ObjId>, arg_count: usize) -> Result<(), VmError> {
        if self.frames.len() >= FRAMES_CAPACITY {
            return Err(VmError::StackOverflow);
        }
        let locals = self.stack.len() - arg_count - 1;
        self.frames.push(CallFrame {
            function,
            closure,
            ip: 0,
            locals,
        });
        Ok(())
    }

    /// Closes upvalues at or above the frame's locals, truncates the stack
    /// back to it, and pops the frame (§4.6).
    fn pop_frame(&mut self) {
        let frame = self.frames.pop().expect("dispatch loop always has an active frame");
        self.close_upvalues(frame.locals);
        self.stack.truncate(frame.locals);
    }

    /// Shared tail of `Return` and `ModuleEnd` (§4.6, §4.9): pops the
    /// frame and either terminates the run (outermost frame) or hands the
    /// value back to the caller's stack.
    fn finish_frame(&mut self, value: Value) -> Option<Value> {
        self.pop_frame();
        if self.frames.is_empty() {
            Some(value)
        } else {
            // The frame we just popped freed at least one slot (its own
            // callable slot), so this can never overflow STACK_CAPACITY.
            self.stack.push(value);
            None
        }
    }

    // ---- upvalues (§4.7) ------------------------------------------------

    /// Reuses an existing open upvalue over `stack_index` if one is
    /// already in the list; otherwise allocates one and threads it onto
    /// the front (§3 invariant 6: at most one node per stack slot).
    fn capture_upvalue(&mut self, stack_index: usize) -> ObjId {
        let mut current = self.open_upvalues;
        while let Some(id) = current {
            let upvalue = self.heap.as_upvalue(id).expect("open-upvalue list node is always an Upvalue");
            if upvalue.stack_index() == Some(stack_index) {
                return id;
            }
            current = upvalue.next_open;
        }

        let mut fresh = ObjUpvalue::open(stack_index);
        fresh.next_open = self.open_upvalues;
        let id = self.heap.alloc(Obj::Upvalue(fresh));
        self.open_upvalues = Some(id);
        id
    }

    /// Closes every open upvalue at or above `threshold`, unlinking it
    /// from the list (§4.7's "Close"). Called on frame pop and
    /// `CloseUpvalue`, and as part of `Throw`'s restoration.
    fn close_upvalues(&mut self, threshold: usize) {
        let mut current = self.open_upvalues;
        let mut previous: Option<ObjId> = None;

        while let Some(id) = current {
            let (stack_index, next) = {
                let upvalue = self.heap.as_upvalue(id).expect("open-upvalue list node is always an Upvalue");
                (upvalue.stack_index(), upvalue.next_open)
            };

            if let Some(index) = stack_index {
                if index >= threshold {
                    let value = self.stack[index];
                    let upvalue = self.heap.as_upvalue_mut(id).expect("open-upvalue list node is always an Upvalue");
                    upvalue.location = UpvalueLocation::Closed(value);
                    upvalue.next_open = None;

                    match previous {
                        Some(prev) => {
                            self.heap.as_upvalue_mut(prev).expect("linked node is always an Upvalue").next_open = next;
                        }
                        None => self.open_upvalues = next,
                    }
                    current = next;
                    continue;
                }
            }

            previous = Some(id);
            current = next;
        }
    }

    fn read_upvalue(&self, id: ObjId) -> Value {
        match self.heap.as_upvalue(id).expect("upvalue is always valid").location {
            UpvalueLocation::Open(index) => self.stack[index],
            UpvalueLocation::Closed(value) => value,
        }
    }

    fn write_upvalue(&mut self, id: ObjId, value: Value) {
        let open_index = match self.heap.as_upvalue(id).expect("upvalue is always valid").location {
            UpvalueLocation::Open(index) => Some(index),
            UpvalueLocation::Closed(_) => None,
        };
        match open_index {
            Some(index) => self.stack[index] = value,
            None => {
                self.heap.as_upvalue_mut(id).expect("upvalue is always valid").location = UpvalueLocation::Closed(value);
            }
        }
    }

    // ---- calls (§4.6) ----------------------------------------------------

    fn call_value(&mut self, arg_count: usize) -> Result<(), VmError> {
        let callee_slot = self.stack.len() - arg_count - 1;
        let callee = self.stack[callee_slot];
        let Value::Object(id) = callee else {
            return Err(VmError::NonCallable {
                got: callee.type_name(&self.heap),
            });
        };

        match self.heap.kind_of(id) {
            ObjKind::Function => self.call_function(id, None, arg_count),
            ObjKind::Closure => {
                let function = self.heap.as_closure(id)?.function;
                self.call_function(function, Some(id), arg_count)
            }
            ObjKind::Class => self.call_class(id, arg_count),
            ObjKind::BoundMethod => {
                let bound = self.heap.as_bound_method(id)?;
                self.stack[callee_slot] = Value::Object(bound.receiver);
                self.call_function(bound.method, None, arg_count)
            }
            other => Err(VmError::NonCallable { got: other.name() }),
        }
    }

    fn call_function(&mut self, function: ObjId, closure: Option<ObjId>, arg_count: usize) -> Result<(), VmError> {
        let arity = self.heap.as_function(function)?.arity as usize;
        if arity != arg_count {
            return Err(VmError::WrongArgumentsCount {
                expected: arity,
                got: arg_count,
            });
        }
        self.push_frame(function, closure, arg_count)
    }

    /// Constructs an `Instance`, replaces the callee slot with it, and
    /// either recurses into `init` with the same argument count or
    /// requires a zero-arg construction (§4.6).
    fn call_class(&mut self, class_id: ObjId, arg_count: usize) -> Result<(), VmError> {
        let instance_id = self.heap.alloc(Obj::Instance(ObjInstance::new(class_id)));
        let callee_slot = self.stack.len() - arg_count - 1;
        self.stack[callee_slot] = Value::Object(instance_id);

        let methods = self.heap.as_class(class_id)?.methods.clone();
        match methods.get(&self.heap, Value::Object(self.init_string))? {
            Some(Value::Object(init_fn)) => self.call_function(init_fn, None, arg_count),
            _ => {
                if arg_count != 0 {
                    return Err(VmError::WrongArgumentsCount { expected: 0, got: arg_count });
                }
                Ok(())
            }
        }
    }

    // ---- garbage collection (§4.4) ---------------------------------------

    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    /// Forces a full mark-sweep cycle regardless of pacing, so tests can
    /// exercise GC interleaving deterministically (spec.md §8 scenario 6).
    pub fn collect_garbage(&mut self) {
        let mut gray = Vec::new();

        for &value in &self.stack {
            self.heap.mark_value(value, &mut gray);
        }
        for frame in self.frames.clone() {
            self.heap.mark(frame.function, &mut gray);
            if let Some(closure) = frame.closure {
                self.heap.mark(closure, &mut gray);
            }
        }
        let mut current = self.open_upvalues;
        while let Some(id) = current {
            self.heap.mark(id, &mut gray);
            current = self.heap.as_upvalue(id).expect("open-upvalue list node is always an Upvalue").next_open;
        }
        self.heap.mark(self.init_string, &mut gray);
        self.heap.mark(self.packages_path, &mut gray);

        while let Some(id) = gray.pop() {
            self.heap.trace(id, &mut gray);
        }

        self.heap.prune_weak_tables();
        let freed = self.heap.sweep();
        self.heap.repace();
        trace!(freed_bytes = freed, next_gc = self.heap.next_gc(), "gc cycle complete");
    }

    // ---- dispatch (§4.9) --------------------------------------------------

    #[allow(clippy::too_many_lines)]
    fn execute(&mut self, opcode: Opcode, fs: &dyn FileSystem) -> Result<Option<Value>, VmError> {
        match opcode {
            Opcode::PushConstant => {
                let idx = self.read_byte();
                let value = self.read_constant(idx);
                self.push(value)?;
            }
            Opcode::PushTrue => self.push(Value::Bool(true))?,
            Opcode::PushFalse => self.push(Value::Bool(false))?,
            Opcode::PushNull => self.push(Value::Null)?,
            Opcode::Pop => {
                self.pop()?;
            }
            Opcode::Top => {
                let value = self.peek(0)?;
                self.push(value)?;
            }

            Opcode::Negate => {
                let value = self.pop_int()?;
                self.push(Value::Int(value.wrapping_neg()))?;
            }
            Opcode::Not => {
                let value = self.pop()?;
                self.push(Value::Bool(value.is_falsy()))?;
            }
            Opcode::Add => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push(Value::Int(a.wrapping_add(b)))?;
            }
            Opcode::Subtract => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push(Value::Int(a.wrapping_sub(b)))?;
            }
            Opcode::Multiply => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push(Value::Int(a.wrapping_mul(b)))?;
            }
            Opcode::Divide => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                if b == 0 {
                    return Err(VmError::ZeroDivision);
                }
                self.push(Value::Int(a.wrapping_div(b)))?;
            }
            Opcode::Greater => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push(Value::Bool(a > b))?;
            }
            Opcode::Less => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push(Value::Bool(a < b))?;
            }
            Opcode::Equal => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Bool(a == b))?;
            }

            Opcode::Jump => {
                let offset = self.read_u16();
                self.jump_forward(offset);
            }
            Opcode::Loop => {
                let offset = self.read_u16();
                self.jump_backward(offset);
            }
            Opcode::JumpIfFalse => {
                let offset = self.read_u16();
                if self.peek(0)?.is_falsy() {
                    self.jump_forward(offset);
                }
            }
            Opcode::JumpIfTrue => {
                let offset = self.read_u16();
                if self.peek(0)?.is_truthy() {
                    self.jump_forward(offset);
                }
            }
            Opcode::JumpIfFalsePop => {
                let offset = self.read_u16();
                let value = self.pop()?;
                if value.is_falsy() {
                    self.jump_forward(offset);
                }
            }

            Opcode::GetLocal => {
                let slot = self.read_byte() as usize;
                let locals = self.frame_locals();
                self.push(self.stack[locals + slot])?;
            }
            Opcode::SetLocal => {
                let slot = self.read_byte() as usize;
                let locals = self.frame_locals();
                let value = self.peek(0)?;
                self.stack[locals + slot] = value;
            }
            Opcode::GetGlobal => {
                let slot = self.read_byte() as usize;
                let module = self.current_module();
                let value = self.heap.as_module(module)?.globals[slot];
                self.push(value)?;
            }
            Opcode::SetGlobal => {
                let slot = self.read_byte() as usize;
                let value = self.peek(0)?;
                let module = self.current_module();
                self.heap.as_module_mut(module)?.globals[slot] = value;
            }
            Opcode::GetUpvalue => {
                let idx = self.read_byte() as usize;
                let closure = self.frame_closure().expect("GetUpvalue requires an active closure");
                let upvalue_id = self.heap.as_closure(closure)?.upvalues[idx];
                self.push(self.read_upvalue(upvalue_id))?;
            }
            Opcode::SetUpvalue => {
                let idx = self.read_byte() as usize;
                let closure = self.frame_closure().expect("SetUpvalue requires an active closure");
                let upvalue_id = self.heap.as_closure(closure)?.upvalues[idx];
                let value = self.peek(0)?;
                self.write_upvalue(upvalue_id, value);
            }

            Opcode::Import => self.execute_import(fs)?,
            Opcode::Export => self.execute_export()?,
            Opcode::GetExport => self.execute_get_export()?,
            Opcode::SetExport => self.execute_set_export()?,
            Opcode::ModuleEnd => {
                let module = self.current_module();
                self.heap.as_module_mut(module)?.state = ModuleState::Executed;
                self.pop()?;
                return Ok(self.finish_frame(Value::Object(module)));
            }

            Opcode::BuildDictionary => self.execute_build_dictionary()?,
            Opcode::BuildList => self.execute_build_list()?,
            Opcode::GetItem => {
                let key = self.pop()?;
                let container = self.pop()?;
                let value = self.get_item(container, key)?;
                self.push(value)?;
            }
            Opcode::SetItem => {
                let value = self.pop()?;
                let key = self.pop()?;
                let container = self.pop()?;
                self.set_item(container, key, value)?;
                self.push(value)?;
            }

            Opcode::GetAttribute => {
                let idx = self.read_byte();
                let name = self.expect_string_constant(idx)?;
                let receiver = self.pop()?;
                let value = self.get_attribute(receiver, name)?;
                self.push(value)?;
            }
            Opcode::SetAttribute => {
                let idx = self.read_byte();
                let name = self.expect_string_constant(idx)?;
                let value = self.pop()?;
                let receiver = self.pop()?;
                self.set_attribute(receiver, name, value)?;
                self.push(value)?;
            }
            Opcode::Inherit => self.execute_inherit()?,
            Opcode::SuperGet => {
                let idx = self.read_byte();
                let name = self.expect_string_constant(idx)?;
                self.execute_super_get(name)?;
            }

            Opcode::BuildClosure => self.execute_build_closure()?,
            Opcode::CloseUpvalue => {
                let threshold = self.stack.len() - 1;
                self.close_upvalues(threshold);
                self.pop()?;
            }

            Opcode::TryBegin => {
                let offset = self.read_u16();
                if self.handlers.len() >= HANDLERS_CAPACITY {
                    return Err(VmError::StackOverflow);
                }
                let frame_index = self.frames.len() - 1;
                let ip = self.frame_ip() + offset as usize;
                self.handlers.push(Handler {
                    frame_index,
                    ip,
                    stack_ptr: self.stack.len(),
                    open_upvalues: self.open_upvalues,
                });
            }
            Opcode::TryEnd => {
                self.handlers.pop().expect("TryEnd without a matching TryBegin");
            }
            Opcode::Throw => {
                let thrown = self.pop()?;
                let handler = self.handlers.pop().ok_or(VmError::UnhandledException)?;
                self.frames.truncate(handler.frame_index + 1);
                self.set_frame_ip(handler.ip);
                self.close_upvalues(handler.stack_ptr);
                self.stack.truncate(handler.stack_ptr);
                self.push(thrown)?;
            }

            Opcode::Call => {
                let arity = self.read_byte() as usize;
                self.call_value(arity)?;
            }
            Opcode::Return => {
                let value = self.pop()?;
                return Ok(self.finish_frame(value));
            }

            Opcode::Print => {
                let value = self.pop()?;
                let text = value.display(&self.heap);
                writeln!(self.out, "{text}").map_err(|e| VmError::IOError { message: e.to_string() })?;
            }
        }

        Ok(None)
    }

    fn pop_int(&mut self) -> Result<i64, VmError> {
        let value = self.pop()?;
        value.as_int().ok_or_else(|| VmError::TypeMismatch {
            expected: "Int",
            got: value.type_name(&self.heap),
        })
    }

    fn expect_string_constant(&mut self, idx: u8) -> Result<ObjId, VmError> {
        let value = self.read_constant(idx);
        value.as_object().filter(|id| self.heap.kind_of(*id) == ObjKind::String).ok_or_else(|| VmError::TypeMismatch {
            expected: "String",
            got: value.type_name(&self.heap),
        })
    }

    fn execute_import(&mut self, fs: &dyn FileSystem) -> Result<(), VmError> {
        let idx = self.read_byte();
        let path_id = self.expect_string_constant(idx)?;
        let requested_path = self.heap.as_string(path_id)?.as_str().to_string();

        let module = self.current_module();
        let parent_dir_id = self.heap.as_module(module)?.parent_dir;
        let parent_dir = self.heap.as_string(parent_dir_id)?.as_str().to_string();

        let target = self.loader.load_module(&mut self.heap, fs, &parent_dir, &requested_path)?;
        match loader::begin_import(&mut self.heap, target, &requested_path)? {
            ImportAction::PushScriptFrame(script_fn) => {
                self.push(Value::Object(target))?;
                self.push_frame(script_fn, None, 0)?;
            }
            ImportAction::AlreadyExecuted => self.push(Value::Object(target))?,
        }
        Ok(())
    }

    fn execute_export(&mut self) -> Result<(), VmError> {
        let idx = self.read_byte();
        let name = self.expect_string_constant(idx)?;
        let value = self.pop()?;
        let module = self.current_module();

        let mut exports = std::mem::take(&mut self.heap.as_module_mut(module)?.exports);
        let is_new = exports.set(&self.heap, Value::Object(name), value)?;
        self.heap.as_module_mut(module)?.exports = exports;

        if !is_new {
            let name_str = self.heap.as_string(name)?.as_str().to_string();
            return Err(VmError::VariableRedefinition { name: name_str });
        }
        Ok(())
    }

    fn execute_get_export(&mut self) -> Result<(), VmError> {
        let idx = self.read_byte();
        let name = self.expect_string_constant(idx)?;
        let module = self.current_module();
        let exports = self.heap.as_module(module)?.exports.clone();
        let value = exports.get(&self.heap, Value::Object(name))?.ok_or_else(|| VmError::UndefinedReference {
            name: self.heap.as_string(name).map(|s| s.as_str().to_string()).unwrap_or_default(),
        })?;
        self.push(value)
    }

    /// `SetExport` (§4.9). Mirrors the original's `Opcode_SetExport`
    /// (`VirtualMachine.c:566-574`): the write always happens, but the
    /// `HashTablePut` return value is checked afterwards and, whenever the
    /// key was *not* a fresh insertion (i.e. an export of that name already
    /// existed), the opcode still raises `UndefinedReference` — the same
    /// inverted-looking guard the original has, replicated here rather than
    /// "fixed".
    fn execute_set_export(&mut self) -> Result<(), VmError> {
        let idx = self.read_byte();
        let name = self.expect_string_constant(idx)?;
        let value = self.peek(0)?;
        let module = self.current_module();

        let mut exports = std::mem::take(&mut self.heap.as_module_mut(module)?.exports);
        let is_new = exports.set(&self.heap, Value::Object(name), value)?;
        self.heap.as_module_mut(module)?.exports = exports;

        if !is_new {
            let name_str = self.heap.as_string(name)?.as_str().to_string();
            return Err(VmError::UndefinedReference { name: name_str });
        }
        Ok(())
    }

    fn execute_build_dictionary(&mut self) -> Result<(), VmError> {
        let n = self.read_byte() as usize;
        let mut pairs = Vec::with_capacity(n);
        for _ in 0..n {
            let value = self.pop()?;
            let key = self.pop()?;
            pairs.push((key, value));
        }
        pairs.reverse();

        let mut dict = ObjDictionary::new();
        for (key, value) in pairs {
            dict.entries.set(&self.heap, key, value)?;
        }
        let id = self.heap.alloc(Obj::Dictionary(dict));
        self.push(Value::Object(id))
    }

    fn execute_build_list(&mut self) -> Result<(), VmError> {
        let n = self.read_byte() as usize;
        let mut items = Vec::with_capacity(n);
        for _ in 0..n {
            items.push(self.pop()?);
        }
        items.reverse();
        let id = self.heap.alloc(Obj::List(ObjList::new(items)));
        self.push(Value::Object(id))
    }

    /// Dispatches `GetItem` on container kind (§4.9). String indexing
    /// yields a one-character substring (spec.md's Open Question, pinned
    /// by SPEC_FULL §4).
    fn get_item(&mut self, container: Value, key: Value) -> Result<Value, VmError> {
        let Value::Object(id) = container else {
            return Err(VmError::TypeMismatch {
                expected: "String, Dictionary, or List",
                got: container.type_name(&self.heap),
            });
        };

        match self.heap.kind_of(id) {
            ObjKind::String => {
                let index = self.expect_index(key)?;
                let len = self.heap.as_string(id)?.len();
                if index < 0 || index as usize >= len {
                    return Err(VmError::OutOfRange);
                }
                let index = index as usize;
                let substring = self.heap.substring(id, index, index + 1)?;
                Ok(Value::Object(substring))
            }
            ObjKind::Dictionary => {
                let entries = self.heap.as_dictionary(id)?.entries.clone();
                entries.get(&self.heap, key)?.ok_or(VmError::OutOfRange)
            }
            ObjKind::List => {
                let index = self.expect_index(key)?;
                let list = self.heap.as_list(id)?;
                if index < 0 || index as usize >= list.len() {
                    return Err(VmError::OutOfRange);
                }
                Ok(list.items[index as usize])
            }
            other => Err(VmError::TypeMismatch {
                expected: "String, Dictionary, or List",
                got: other.name(),
            }),
        }
    }

    /// Dispatches `SetItem` on container kind. Strings are immutable
    /// (spec.md's Open Question, pinned by SPEC_FULL §4: rejected with
    /// `TypeMismatch` rather than silently permitted).
    fn set_item(&mut self, container: Value, key: Value, value: Value) -> Result<(), VmError> {
        let Value::Object(id) = container else {
            return Err(VmError::TypeMismatch {
                expected: "Dictionary or List",
                got: container.type_name(&self.heap),
            });
        };

        match self.heap.kind_of(id) {
            ObjKind::String => Err(VmError::TypeMismatch {
                expected: "mutable container",
                got: "String",
            }),
            ObjKind::Dictionary => {
                let mut entries = std::mem::take(&mut self.heap.as_dictionary_mut(id)?.entries);
                entries.set(&self.heap, key, value)?;
                self.heap.as_dictionary_mut(id)?.entries = entries;
                Ok(())
            }
            ObjKind::List => {
                let index = self.expect_index(key)?;
                let list = self.heap.as_list_mut(id)?;
                if index < 0 || index as usize >= list.len() {
                    return Err(VmError::OutOfRange);
                }
                list.items[index as usize] = value;
                Ok(())
            }
            other => Err(VmError::TypeMismatch {
                expected: "Dictionary or List",
                got: other.name(),
            }),
        }
    }

    fn expect_index(&self, key: Value) -> Result<i64, VmError> {
        key.as_int().ok_or_else(|| VmError::TypeMismatch {
            expected: "Int",
            got: key.type_name(&self.heap),
        })
    }

    /// `GetAttribute` (§4.9): `Module` looks up exports; `Instance` looks
    /// up fields then methods, binding a fresh `BoundMethod` on hit.
    fn get_attribute(&mut self, receiver: Value, name: ObjId) -> Result<Value, VmError> {
        let Value::Object(id) = receiver else {
            return Err(VmError::TypeMismatch {
                expected: "Module or Instance",
                got: receiver.type_name(&self.heap),
            });
        };

        match self.heap.kind_of(id) {
            ObjKind::Module => {
                let exports = self.heap.as_module(id)?.exports.clone();
                exports.get(&self.heap, Value::Object(name))?.ok_or_else(|| VmError::UndefinedReference {
                    name: self.heap.as_string(name).map(|s| s.as_str().to_string()).unwrap_or_default(),
                })
            }
            ObjKind::Instance => {
                let fields = self.heap.as_instance(id)?.fields.clone();
                if let Some(value) = fields.get(&self.heap, Value::Object(name))? {
                    return Ok(value);
                }
                let class = self.heap.as_instance(id)?.class;
                let methods = self.heap.as_class(class)?.methods.clone();
                if let Some(Value::Object(method_id)) = methods.get(&self.heap, Value::Object(name))? {
                    let bound_id = self.heap.alloc(Obj::BoundMethod(ObjBoundMethod::new(id, method_id)));
                    return Ok(Value::Object(bound_id));
                }
                Err(VmError::UndefinedReference {
                    name: self.heap.as_string(name).map(|s| s.as_str().to_string()).unwrap_or_default(),
                })
            }
            other => Err(VmError::TypeMismatch {
                expected: "Module or Instance",
                got: other.name(),
            }),
        }
    }

    fn set_attribute(&mut self, receiver: Value, name: ObjId, value: Value) -> Result<(), VmError> {
        let Value::Object(id) = receiver else {
            return Err(VmError::TypeMismatch {
                expected: "Instance",
                got: receiver.type_name(&self.heap),
            });
        };
        if self.heap.kind_of(id) != ObjKind::Instance {
            return Err(VmError::TypeMismatch {
                expected: "Instance",
                got: self.heap.kind_of(id).name(),
            });
        }
        let mut fields = std::mem::take(&mut self.heap.as_instance_mut(id)?.fields);
        fields.set(&self.heap, Value::Object(name), value)?;
        self.heap.as_instance_mut(id)?.fields = fields;
        Ok(())
    }

    /// `Inherit` (§4.9): pops the parent class, peeks the child (it stays
    /// on the stack — the class declaration keeps referencing it), sets
    /// `super_class`, and copies every parent method into the child.
    ///
    /// Mirrors `HashTableAddAll(&child_class->methods, self,
    /// &parent_class->methods)` in `VirtualMachine.c:637-653`: the merge
    /// starts from the child's own table and overlays the parent's methods
    /// on top, so a same-named parent method clobbers the child's own
    /// declaration — `HashTablePut` overwrites an existing key's value
    /// unconditionally (`HashTable.c:23-48`), and the original populates a
    /// class's own methods from JSON before `Inherit` ever runs
    /// (`Objects/Class.c:18-43`), same as `format.rs::decode_class` does
    /// here, so there's no ordering difference to justify reversing it.
    fn execute_inherit(&mut self) -> Result<(), VmError> {
        let parent_value = self.pop()?;
        let parent_id = self.expect_class(parent_value)?;
        let child_value = self.peek(0)?;
        let child_id = self.expect_class(child_value)?;

        self.heap.as_class_mut(child_id)?.super_class = Some(parent_id);
        let parent_methods = self.heap.as_class(parent_id)?.methods.clone();
        let mut merged = std::mem::take(&mut self.heap.as_class_mut(child_id)?.methods);
        merged.add_all(&self.heap, &parent_methods)?;
        self.heap.as_class_mut(child_id)?.methods = merged;
        Ok(())
    }

    fn expect_class(&self, value: Value) -> Result<ObjId, VmError> {
        value.as_object().filter(|id| self.heap.kind_of(*id) == ObjKind::Class).ok_or_else(|| VmError::TypeMismatch {
            expected: "Class",
            got: value.type_name(&self.heap),
        })
    }

    /// `SuperGet` (§4.9): uses frame slot 0 as the instance, resolves
    /// `name` in `instance.class.super.methods`, and pushes a fresh
    /// `BoundMethod`.
    fn execute_super_get(&mut self, name: ObjId) -> Result<(), VmError> {
        let locals = self.frame_locals();
        let instance_value = self.stack[locals];
        let instance_id = instance_value.as_object().ok_or_else(|| VmError::TypeMismatch {
            expected: "Instance",
            got: instance_value.type_name(&self.heap),
        })?;

        let class_id = self.heap.as_instance(instance_id)?.class;
        let super_id = self.heap.as_class(class_id)?.super_class.ok_or_else(|| VmError::UndefinedReference {
            name: self.heap.as_string(name).map(|s| s.as_str().to_string()).unwrap_or_default(),
        })?;
        let methods = self.heap.as_class(super_id)?.methods.clone();
        let method_value = methods.get(&self.heap, Value::Object(name))?.ok_or_else(|| VmError::UndefinedReference {
            name: self.heap.as_string(name).map(|s| s.as_str().to_string()).unwrap_or_default(),
        })?;
        let method_id = method_value.as_object().expect("class methods are always Functions");

        let bound_id = self.heap.alloc(Obj::BoundMethod(ObjBoundMethod::new(instance_id, method_id)));
        self.push(Value::Object(bound_id))
    }

    /// `BuildClosure` (§4.7): pops the underlying `Function`, allocates a
    /// `Closure` with `n` upvalue slots, then reads `n` `(is_local, index)`
    /// pairs to populate them.
    fn execute_build_closure(&mut self) -> Result<(), VmError> {
        let n = self.read_byte() as usize;
        let function_value = self.pop()?;
        let function_id = function_value.as_object().filter(|id| self.heap.kind_of(*id) == ObjKind::Function).ok_or_else(|| VmError::TypeMismatch {
            expected: "Function",
            got: function_value.type_name(&self.heap),
        })?;

        let mut upvalues = Vec::with_capacity(n);
        for _ in 0..n {
            let is_local = self.read_byte() != 0;
            let index = self.read_byte() as usize;
            let upvalue_id = if is_local {
                let locals = self.frame_locals();
                self.capture_upvalue(locals + index)
            } else {
                let closure = self.frame_closure().expect("non-local capture requires an enclosing closure");
                self.heap.as_closure(closure)?.upvalues[index]
            };
            upvalues.push(upvalue_id);
        }

        let closure_id = self.heap.alloc(Obj::Closure(ObjClosure::new(function_id, upvalues)));
        self.push(Value::Object(closure_id))
    }
}

/// The current function's chunk, exposed for tracing/disassembly
/// collaborators outside the engine's scope (§1).
#[must_use]
pub fn chunk_of<'a>(heap: &'a Heap, function: ObjId) -> &'a Chunk {
    &heap.as_function(function).expect("function is always valid").chunk
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::Obj;
    use crate::opcode::Opcode as Op;
    use crate::value::{ObjFunction, ObjModule};

    struct NullFs;
    impl FileSystem for NullFs {
        fn read_to_string(&self, _path: &std::path::Path) -> Result<String, VmError> {
            Err(VmError::FileNotFound { path: String::new() })
        }
        fn exists(&self, _path: &std::path::Path) -> bool {
            false
        }
        fn current_dir(&self) -> std::path::PathBuf {
            std::path::PathBuf::new()
        }
    }

    fn test_config() -> VmConfig {
        VmConfig::new(std::path::PathBuf::new()).with_sinks(Box::new(Vec::new()), Box::new(Vec::new()))
    }

    /// Builds a standalone module whose script chunk is `code`/`constants`,
    /// bypassing the JSON loader entirely — the point of scenario tests is
    /// the dispatch loop, not decoding (SPEC_FULL §8 ambient test tooling).
    fn scripted_module(vm: &mut Vm, code: Vec<u8>, constants: Vec<Value>) -> ObjId {
        let name = vm.heap.intern_string(b"test".to_vec());
        let parent_dir = vm.heap.intern_string(Vec::new());
        let module = ObjModule::new(name, parent_dir, 0);
        let module_id = vm.heap.alloc(Obj::Module(Box::new(module)));

        let script_name = vm.heap.intern_string(b"script".to_vec());
        let chunk = Chunk::new(code, constants, vec![0]);
        let function = ObjFunction::new(module_id, script_name, 0, chunk);
        let function_id = vm.heap.alloc(Obj::Function(Box::new(function)));
        vm.heap.as_module_mut(module_id).unwrap().script_function = Some(function_id);

        vm.heap.enabled = true;
        vm.begin_module_frame(module_id, "test").unwrap();
        module_id
    }

    #[test]
    fn hello_integer_prints_constant() {
        let mut vm = Vm::new(test_config());
        let code = vec![
            Op::PushConstant as u8, 0,
            Op::Print as u8,
            Op::PushNull as u8,
            Op::ModuleEnd as u8,
        ];
        scripted_module(&mut vm, code, vec![Value::Int(7)]);
        let result = vm.run(&NullFs).unwrap();
        assert!(matches!(result, Value::Object(_)));
    }

    #[test]
    fn division_computes_quotient() {
        let mut vm = Vm::new(test_config());
        let code = vec![
            Op::PushConstant as u8, 0,
            Op::PushConstant as u8, 1,
            Op::Divide as u8,
            Op::Pop as u8,
            Op::PushNull as u8,
            Op::ModuleEnd as u8,
        ];
        scripted_module(&mut vm, code, vec![Value::Int(10), Value::Int(3)]);
        vm.run(&NullFs).unwrap();
    }

    #[test]
    fn division_by_zero_errors() {
        let mut vm = Vm::new(test_config());
        let code = vec![
            Op::PushConstant as u8, 0,
            Op::PushConstant as u8, 1,
            Op::Divide as u8,
            Op::Pop as u8,
            Op::PushNull as u8,
            Op::ModuleEnd as u8,
        ];
        scripted_module(&mut vm, code, vec![Value::Int(1), Value::Int(0)]);
        let err = vm.run(&NullFs).unwrap_err();
        assert_eq!(err, VmError::ZeroDivision);
    }

    #[test]
    fn throw_without_handler_is_unhandled() {
        let mut vm = Vm::new(test_config());
        let code = vec![Op::PushConstant as u8, 0, Op::Throw as u8];
        scripted_module(&mut vm, code, vec![Value::Int(1)]);
        let err = vm.run(&NullFs).unwrap_err();
        assert_eq!(err, VmError::UnhandledException);
    }

    #[test]
    fn throw_with_handler_resumes_in_band() {
        let mut vm = Vm::new(test_config());
        // TryBegin jumps 0 bytes past itself (handler starts right where
        // the try body would continue); try body throws; handler pops and
        // returns the caught value.
        let code = vec![
            Op::TryBegin as u8, 0, 0,
            Op::PushConstant as u8, 0,
            Op::Throw as u8,
            Op::Return as u8, // handler landing: caught value is on top
        ];
        scripted_module(&mut vm, code, vec![Value::Int(42)]);
        let result = vm.run(&NullFs).unwrap();
        assert_eq!(result, Value::Int(42));
    }

    #[test]
    fn equal_strings_intern_to_same_object() {
        let mut vm = Vm::new(test_config());
        let code = vec![
            Op::PushConstant as u8, 0,
            Op::PushConstant as u8, 1,
            Op::Equal as u8,
            Op::Print as u8,
            Op::PushNull as u8,
            Op::ModuleEnd as u8,
        ];
        let a = vm.heap.intern_string(b"hello".to_vec());
        let b = vm.heap.intern_string(b"hello".to_vec());
        scripted_module(&mut vm, code, vec![Value::Object(a), Value::Object(b)]);
        vm.run(&NullFs).unwrap();
    }

    #[test]
    fn gc_between_pushes_does_not_disturb_interned_equality() {
        let mut vm = Vm::new(test_config());
        let code = vec![
            Op::PushConstant as u8, 0,
            Op::PushConstant as u8, 1,
            Op::Equal as u8,
            Op::Pop as u8,
            Op::PushNull as u8,
            Op::ModuleEnd as u8,
        ];
        let a = vm.heap.intern_string(b"dup".to_vec());
        scripted_module(&mut vm, code, vec![Value::Object(a), Value::Object(a)]);
        vm.collect_garbage();
        vm.run(&NullFs).unwrap();
    }

    #[test]
    fn build_list_preserves_source_order() {
        let mut vm = Vm::new(test_config());
        let code = vec![
            Op::PushConstant as u8, 0,
            Op::PushConstant as u8, 1,
            Op::PushConstant as u8, 2,
            Op::BuildList as u8, 3,
            Op::Pop as u8,
            Op::PushNull as u8,
            Op::ModuleEnd as u8,
        ];
        scripted_module(&mut vm, code, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        vm.run(&NullFs).unwrap();
    }

    /// A same-named parent method clobbers the child's own declaration on
    /// `Inherit` (§4.9, matching `HashTableAddAll`'s unconditional
    /// overwrite-on-put in the original).
    #[test]
    fn inherit_lets_parent_method_clobber_child_override() {
        let mut vm = Vm::new(test_config());
        let module_name = vm.heap.intern_string(b"test".to_vec());
        let parent_dir = vm.heap.intern_string(Vec::new());
        let module = ObjModule::new(module_name, parent_dir, 0);
        let module_id = vm.heap.alloc(Obj::Module(Box::new(module)));

        let method_name = vm.heap.intern_string(b"greet".to_vec());

        let parent_chunk = Chunk::new(vec![Op::PushConstant as u8, 0, Op::Return as u8], vec![Value::Int(1)], vec![0, 0, 0]);
        let parent_method_name = vm.heap.intern_string(b"parent-greet".to_vec());
        let parent_method = ObjFunction::new(module_id, parent_method_name, 0, parent_chunk);
        let parent_method_id = vm.heap.alloc(Obj::Function(Box::new(parent_method)));

        let child_chunk = Chunk::new(vec![Op::PushConstant as u8, 0, Op::Return as u8], vec![Value::Int(2)], vec![0, 0, 0]);
        let child_method_name = vm.heap.intern_string(b"child-greet".to_vec());
        let child_method = ObjFunction::new(module_id, child_method_name, 0, child_chunk);
        let child_method_id = vm.heap.alloc(Obj::Function(Box::new(child_method)));

        let parent_class_name = vm.heap.intern_string(b"Parent".to_vec());
        let mut parent_class = crate::value::ObjClass::new(module_id, parent_class_name);
        parent_class.methods.set(&vm.heap, Value::Object(method_name), Value::Object(parent_method_id)).unwrap();
        let parent_id = vm.heap.alloc(Obj::Class(parent_class));

        let child_class_name = vm.heap.intern_string(b"Child".to_vec());
        let mut child_class = crate::value::ObjClass::new(module_id, child_class_name);
        child_class.methods.set(&vm.heap, Value::Object(method_name), Value::Object(child_method_id)).unwrap();
        let child_id = vm.heap.alloc(Obj::Class(child_class));

        vm.push(Value::Object(parent_id)).unwrap();
        vm.push(Value::Object(child_id)).unwrap();
        vm.execute_inherit().unwrap();
        let child_value = vm.pop().unwrap();
        assert_eq!(child_value, Value::Object(child_id));

        let methods = vm.heap.as_class(child_id).unwrap().methods.clone();
        let resolved = methods.get(&vm.heap, Value::Object(method_name)).unwrap().unwrap();
        assert_eq!(resolved, Value::Object(parent_method_id));
    }

    #[test]
    fn list_out_of_range_errors() {
        let mut vm = Vm::new(test_config());
        let code = vec![
            Op::PushConstant as u8, 0,
            Op::BuildList as u8, 1,
            Op::PushConstant as u8, 1,
            Op::GetItem as u8,
            Op::Pop as u8,
            Op::PushNull as u8,
            Op::ModuleEnd as u8,
        ];
        scripted_module(&mut vm, code, vec![Value::Int(1), Value::Int(5)]);
        let err = vm.run(&NullFs).unwrap_err();
        assert_eq!(err, VmError::OutOfRange);
    }
}
