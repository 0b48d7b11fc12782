//! Decodes the on-disk module format (§6) from an already-parsed
//! `serde_json::Value` tree into heap objects. JSON parsing itself is an
//! out-of-scope collaborator (§1); this module only interprets the
//! resulting tree.

use serde_json::Value as Json;

use crate::chunk::Chunk;
use crate::error::VmError;
use crate::gc::{Heap, ObjId};
use crate::table::Table;
use crate::value::{ObjClass, ObjFunction, Value};

fn invalid(message: impl Into<String>) -> VmError {
    VmError::InvalidJSON {
        message: message.into(),
    }
}

fn expect_object<'a>(json: &'a Json, context: &str) -> Result<&'a serde_json::Map<String, Json>, VmError> {
    json.as_object()
        .ok_or_else(|| invalid(format!("expected a JSON object for {context}")))
}

fn expect_array<'a>(json: &'a Json, context: &str) -> Result<&'a Vec<Json>, VmError> {
    json.as_array()
        .ok_or_else(|| invalid(format!("expected a JSON array for {context}")))
}

fn expect_field<'a>(object: &'a serde_json::Map<String, Json>, key: &str) -> Result<&'a Json, VmError> {
    object
        .get(key)
        .ok_or_else(|| invalid(format!("missing field '{key}'")))
}

fn expect_str<'a>(json: &'a Json, context: &str) -> Result<&'a str, VmError> {
    json.as_str()
        .ok_or_else(|| invalid(format!("expected a JSON string for {context}")))
}

fn expect_u64(json: &Json, context: &str) -> Result<u64, VmError> {
    json.as_u64()
        .ok_or_else(|| invalid(format!("expected a non-negative integer for {context}")))
}

fn expect_i64(json: &Json, context: &str) -> Result<i64, VmError> {
    json.as_i64()
        .ok_or_else(|| invalid(format!("expected an integer for {context}")))
}

/// Decodes one `Value-JSON` node: `{ "type": TAG, "data": ... }`.
pub fn decode_value(json: &Json, heap: &mut Heap, module: ObjId) -> Result<Value, VmError> {
    let object = expect_object(json, "value")?;
    let tag = expect_str(expect_field(object, "type")?, "value.type")?;
    let data = expect_field(object, "data")?;

    match tag {
        "Integer" => Ok(Value::Int(expect_i64(data, "value.data")?)),
        "String" => {
            let bytes = expect_str(data, "value.data")?.as_bytes().to_vec();
            Ok(Value::Object(heap.intern_string(bytes)))
        }
        "Function" => decode_function(data, heap, module),
        "Class" => decode_class(data, heap, module),
        other => Err(invalid(format!("unknown value type '{other}'"))),
    }
}

fn decode_function(data: &Json, heap: &mut Heap, module: ObjId) -> Result<Value, VmError> {
    let object = expect_object(data, "function")?;
    let name_value = decode_value(expect_field(object, "name")?, heap, module)?;
    let name = name_value
        .as_object()
        .ok_or_else(|| invalid("function name must decode to a String value"))?;

    let arity = expect_u64(expect_field(object, "arity")?, "function.arity")?;
    let arity = u8::try_from(arity).map_err(|_| invalid("function arity out of range"))?;

    let chunk = decode_chunk(expect_field(object, "chunk")?, heap, module)?;

    let function = ObjFunction::new(module, name, arity, chunk);
    let id = heap.alloc(crate::gc::Obj::Function(Box::new(function)));
    Ok(Value::Object(id))
}

fn decode_class(data: &Json, heap: &mut Heap, module: ObjId) -> Result<Value, VmError> {
    let object = expect_object(data, "class")?;
    let name_value = decode_value(expect_field(object, "name")?, heap, module)?;
    let name = name_value
        .as_object()
        .ok_or_else(|| invalid("class name must decode to a String value"))?;

    let mut class = ObjClass::new(module, name);

    let methods = expect_array(expect_field(object, "methods")?, "class.methods")?;
    let mut decoded_methods = Table::new();
    for method_json in methods {
        let method_object = expect_object(method_json, "class method")?;
        let method_data = expect_field(method_object, "data")?;
        let method_value = decode_function(method_data, heap, module)?;
        let method_id = method_value
            .as_object()
            .ok_or_else(|| invalid("class method must decode to a Function value"))?;
        let method_name = Value::Object(heap.as_function(method_id)?.name);
        decoded_methods.set(heap, method_name, method_value)?;
    }
    class.methods = decoded_methods;

    let id = heap.alloc(crate::gc::Obj::Class(class));
    Ok(Value::Object(id))
}

/// Decodes a `Chunk` JSON object: `{ code, constants, lines }`.
pub fn decode_chunk(json: &Json, heap: &mut Heap, module: ObjId) -> Result<Chunk, VmError> {
    let object = expect_object(json, "chunk")?;

    let code_json = expect_array(expect_field(object, "code")?, "chunk.code")?;
    let mut code = Vec::with_capacity(code_json.len());
    for byte_json in code_json {
        let byte = expect_u64(byte_json, "chunk.code[]")?;
        let byte = u8::try_from(byte).map_err(|_| invalid("chunk code byte out of range"))?;
        code.push(byte);
    }

    let constants_json = expect_array(expect_field(object, "constants")?, "chunk.constants")?;
    let mut constants = Vec::with_capacity(constants_json.len());
    for constant_json in constants_json {
        constants.push(decode_value(constant_json, heap, module)?);
    }

    let lines_json = expect_array(expect_field(object, "lines")?, "chunk.lines")?;
    let mut lines = Vec::with_capacity(lines_json.len());
    for line_json in lines_json {
        let line = expect_u64(line_json, "chunk.lines[]")?;
        lines.push(line as usize);
    }

    Ok(Chunk::new(code, constants, lines))
}

/// Decodes a top-level module file: `{ globals_count, chunk }`. The module
/// object already exists (so `chunk`'s nested Function/Class constants can
/// reference it as `module_ref`); this only patches in its script function.
pub fn decode_module_body(json: &Json, heap: &mut Heap, module: ObjId, script_name: ObjId) -> Result<(), VmError> {
    let object = expect_object(json, "module")?;
    let globals_count = expect_u64(expect_field(object, "globals_count")?, "module.globals_count")?;
    let globals_count = usize::try_from(globals_count).map_err(|_| invalid("globals_count out of range"))?;

    heap.as_module_mut(module)?.globals = vec![Value::Null; globals_count];

    let chunk = decode_chunk(expect_field(object, "chunk")?, heap, module)?;
    let function = ObjFunction::new(module, script_name, 0, chunk);
    let function_id = heap.alloc(crate::gc::Obj::Function(Box::new(function)));

    heap.as_module_mut(module)?.script_function = Some(function_id);
    Ok(())
}
