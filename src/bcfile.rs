// File: src/bcfile.rs
//
// Binary persistence for compiled bytecode units.
// Little-endian throughout. A file is a 12-byte header (magic, format
// version, reserved flags) followed by the top-level unit; class and
// method descriptors nest recursively inside constant pools.

use std::sync::Arc;

use crate::bytecode::{BytecodeUnit, ClassSpec, Constant, Instruction, MethodSpec, Op};
use crate::errors::SmaltError;

pub const MAGIC: [u8; 4] = *b"SMOG";
pub const FORMAT_VERSION: u32 = 1;

// Constant-pool item tags.
const TAG_INT: u8 = 0x01;
const TAG_FLOAT: u8 = 0x02;
const TAG_STRING: u8 = 0x03;
const TAG_BOOL: u8 = 0x04;
const TAG_NIL: u8 = 0x05;
const TAG_CLASS: u8 = 0x06;
const TAG_METHOD: u8 = 0x07;
const TAG_UNIT: u8 = 0x08;

/// True when the byte stream starts with the bytecode magic; the CLI uses
/// this to tell compiled files from source.
pub fn looks_like_bytecode(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[..4] == MAGIC
}

// === Encoding ===

pub fn encode(unit: &BytecodeUnit) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // reserved flags
    encode_unit(unit, &mut out);
    out
}

fn encode_unit(unit: &BytecodeUnit, out: &mut Vec<u8>) {
    out.extend_from_slice(&(unit.constants.len() as u32).to_le_bytes());
    for constant in &unit.constants {
        encode_constant(constant, out);
    }
    out.extend_from_slice(&(unit.instructions.len() as u32).to_le_bytes());
    for instr in &unit.instructions {
        out.push(instr.op.into());
        out.extend_from_slice(&instr.operand.to_le_bytes());
    }
}

fn encode_constant(constant: &Constant, out: &mut Vec<u8>) {
    match constant {
        Constant::Int(n) => {
            out.push(TAG_INT);
            out.extend_from_slice(&n.to_le_bytes());
        }
        Constant::Float(f) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&f.to_le_bytes());
        }
        Constant::Str(s) => {
            out.push(TAG_STRING);
            encode_string(s, out);
        }
        Constant::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        }
        Constant::Nil => out.push(TAG_NIL),
        Constant::Class(spec) => {
            out.push(TAG_CLASS);
            encode_class(spec, out);
        }
        Constant::Method(method) => {
            out.push(TAG_METHOD);
            encode_method(method, out);
        }
        Constant::Unit(unit) => {
            out.push(TAG_UNIT);
            encode_unit(unit, out);
        }
    }
}

fn encode_string(s: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn encode_string_list(items: &[String], out: &mut Vec<u8>) {
    out.extend_from_slice(&(items.len() as u32).to_le_bytes());
    for item in items {
        encode_string(item, out);
    }
}

fn encode_class(spec: &ClassSpec, out: &mut Vec<u8>) {
    encode_string(&spec.name, out);
    encode_string(&spec.superclass_name, out);
    encode_string_list(&spec.instance_fields, out);
    encode_string_list(&spec.class_variables, out);
    out.extend_from_slice(&(spec.instance_methods.len() as u32).to_le_bytes());
    for method in &spec.instance_methods {
        encode_method(method, out);
    }
    out.extend_from_slice(&(spec.class_methods.len() as u32).to_le_bytes());
    for method in &spec.class_methods {
        encode_method(method, out);
    }
}

fn encode_method(method: &MethodSpec, out: &mut Vec<u8>) {
    encode_string(&method.selector, out);
    encode_string_list(&method.params, out);
    encode_unit(&method.body, out);
}

// === Decoding ===

/// Decode and structurally validate a bytecode file. Rejects bad magic,
/// version mismatches, truncation, unknown tags and out-of-range pool
/// references.
pub fn decode(bytes: &[u8]) -> Result<BytecodeUnit, SmaltError> {
    let mut reader = Reader { bytes, pos: 0 };

    let magic = reader.take(4)?;
    if magic != MAGIC {
        return Err(SmaltError::load_error(format!(
            "Bad magic {:02x?}, expected \"SMOG\"",
            magic
        )));
    }
    let version = reader.read_u32()?;
    if version != FORMAT_VERSION {
        return Err(SmaltError::load_error(format!(
            "Unsupported format version {} (expected {})",
            version, FORMAT_VERSION
        )));
    }
    let _flags = reader.read_u32()?;

    let unit = decode_unit(&mut reader)?;
    if reader.pos != bytes.len() {
        return Err(SmaltError::load_error(format!(
            "{} trailing bytes after the bytecode unit",
            bytes.len() - reader.pos
        )));
    }
    validate_unit(&unit)?;
    Ok(unit)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, count: usize) -> Result<&'a [u8], SmaltError> {
        if self.pos + count > self.bytes.len() {
            return Err(SmaltError::load_error(format!(
                "Truncated stream: needed {} bytes at offset {}, have {}",
                count,
                self.pos,
                self.bytes.len() - self.pos
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, SmaltError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, SmaltError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("slice length is 4")))
    }

    fn read_i32(&mut self) -> Result<i32, SmaltError> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes(bytes.try_into().expect("slice length is 4")))
    }

    fn read_i64(&mut self) -> Result<i64, SmaltError> {
        let bytes = self.take(8)?;
        Ok(i64::from_le_bytes(bytes.try_into().expect("slice length is 8")))
    }

    fn read_f64(&mut self) -> Result<f64, SmaltError> {
        let bytes = self.take(8)?;
        Ok(f64::from_le_bytes(bytes.try_into().expect("slice length is 8")))
    }

    fn read_string(&mut self) -> Result<String, SmaltError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| SmaltError::load_error(format!("Invalid UTF-8 in string: {}", e)))
    }

    fn read_string_list(&mut self) -> Result<Vec<String>, SmaltError> {
        let count = self.read_u32()? as usize;
        let mut items = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            items.push(self.read_string()?);
        }
        Ok(items)
    }
}

fn decode_unit(reader: &mut Reader) -> Result<BytecodeUnit, SmaltError> {
    let constant_count = reader.read_u32()? as usize;
    let mut constants = Vec::with_capacity(constant_count.min(1024));
    for _ in 0..constant_count {
        constants.push(decode_constant(reader)?);
    }

    let instruction_count = reader.read_u32()? as usize;
    let mut instructions = Vec::with_capacity(instruction_count.min(4096));
    for _ in 0..instruction_count {
        let opcode = reader.read_u8()?;
        let op = Op::try_from(opcode).map_err(|_| {
            SmaltError::load_error(format!("Unknown opcode byte 0x{:02x}", opcode))
        })?;
        let operand = reader.read_i32()?;
        instructions.push(Instruction::new(op, operand));
    }

    Ok(BytecodeUnit { instructions, constants })
}

fn decode_constant(reader: &mut Reader) -> Result<Constant, SmaltError> {
    let tag = reader.read_u8()?;
    match tag {
        TAG_INT => Ok(Constant::Int(reader.read_i64()?)),
        TAG_FLOAT => Ok(Constant::Float(reader.read_f64()?)),
        TAG_STRING => Ok(Constant::Str(reader.read_string()?)),
        TAG_BOOL => Ok(Constant::Bool(reader.read_u8()? != 0)),
        TAG_NIL => Ok(Constant::Nil),
        TAG_CLASS => Ok(Constant::Class(decode_class(reader)?)),
        TAG_METHOD => Ok(Constant::Method(decode_method(reader)?)),
        TAG_UNIT => Ok(Constant::Unit(Arc::new(decode_unit(reader)?))),
        other => Err(SmaltError::load_error(format!("Unknown constant tag 0x{:02x}", other))),
    }
}

fn decode_class(reader: &mut Reader) -> Result<ClassSpec, SmaltError> {
    let name = reader.read_string()?;
    let superclass_name = reader.read_string()?;
    let instance_fields = reader.read_string_list()?;
    let class_variables = reader.read_string_list()?;

    let instance_method_count = reader.read_u32()? as usize;
    let mut instance_methods = Vec::with_capacity(instance_method_count.min(1024));
    for _ in 0..instance_method_count {
        instance_methods.push(decode_method(reader)?);
    }

    let class_method_count = reader.read_u32()? as usize;
    let mut class_methods = Vec::with_capacity(class_method_count.min(1024));
    for _ in 0..class_method_count {
        class_methods.push(decode_method(reader)?);
    }

    Ok(ClassSpec {
        name,
        superclass_name,
        instance_fields,
        class_variables,
        instance_methods,
        class_methods,
    })
}

fn decode_method(reader: &mut Reader) -> Result<MethodSpec, SmaltError> {
    let selector = reader.read_string()?;
    let params = reader.read_string_list()?;
    let body = Arc::new(decode_unit(reader)?);
    Ok(MethodSpec { selector, params, body })
}

// === Validation ===

/// Check that every pool-referencing operand lands in range and on the
/// right constant kind, recursively through nested units and methods.
pub fn validate_unit(unit: &BytecodeUnit) -> Result<(), SmaltError> {
    use crate::bytecode::{unpack_closure, unpack_send};

    let pool_len = unit.constants.len();
    let check = |idx: usize, what: &str| -> Result<(), SmaltError> {
        if idx >= pool_len {
            return Err(SmaltError::load_error(format!(
                "{} operand {} out of range (pool size {})",
                what, idx, pool_len
            )));
        }
        Ok(())
    };

    for instr in &unit.instructions {
        match instr.op {
            Op::PushConst => check(instr.index(), "PushConst")?,
            Op::LoadGlobal | Op::StoreGlobal => {
                check(instr.index(), "global access")?;
                if !matches!(unit.constants[instr.index()], Constant::Str(_)) {
                    return Err(SmaltError::load_error(format!(
                        "Global-access operand {} is not a string constant",
                        instr.index()
                    )));
                }
            }
            Op::Send | Op::SuperSend => {
                let (sel_idx, _) = unpack_send(instr.operand);
                check(sel_idx, "send selector")?;
                if !matches!(unit.constants[sel_idx], Constant::Str(_)) {
                    return Err(SmaltError::load_error(format!(
                        "Send selector operand {} is not a string constant",
                        sel_idx
                    )));
                }
            }
            Op::MakeClosure => {
                let (body_idx, _, _) = unpack_closure(instr.operand);
                check(body_idx, "MakeClosure")?;
                if !matches!(unit.constants[body_idx], Constant::Unit(_)) {
                    return Err(SmaltError::load_error(format!(
                        "MakeClosure operand {} is not a bytecode unit",
                        body_idx
                    )));
                }
            }
            Op::DefineClass => {
                check(instr.index(), "DefineClass")?;
                if !matches!(unit.constants[instr.index()], Constant::Class(_)) {
                    return Err(SmaltError::load_error(format!(
                        "DefineClass operand {} is not a class descriptor",
                        instr.index()
                    )));
                }
            }
            _ => {}
        }
    }

    for constant in &unit.constants {
        match constant {
            Constant::Unit(nested) => validate_unit(nested)?,
            Constant::Method(method) => validate_unit(&method.body)?,
            Constant::Class(spec) => {
                for method in spec.instance_methods.iter().chain(&spec.class_methods) {
                    validate_unit(&method.body)?;
                }
            }
            _ => {}
        }
    }

    Ok(())
}
