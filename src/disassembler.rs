// File: src/disassembler.rs
//
// Textual rendering of bytecode units: constants with their kinds,
// instructions with resolved pool references, nested units and class
// descriptors listed recursively.

use std::fmt::Write;

use crate::bytecode::{unpack_closure, unpack_send, BytecodeUnit, Constant, Op};

pub fn disassemble(unit: &BytecodeUnit) -> String {
    let mut out = String::new();
    render_unit(unit, "unit", 0, &mut out);
    out
}

fn render_unit(unit: &BytecodeUnit, title: &str, depth: usize, out: &mut String) {
    let pad = "    ".repeat(depth);
    let _ = writeln!(
        out,
        "{}{} ({} instructions, {} constants)",
        pad,
        title,
        unit.instructions.len(),
        unit.constants.len()
    );

    if !unit.constants.is_empty() {
        let _ = writeln!(out, "{}  constants:", pad);
        for (idx, constant) in unit.constants.iter().enumerate() {
            match constant {
                Constant::Int(n) => {
                    let _ = writeln!(out, "{}    [{}] int {}", pad, idx, n);
                }
                Constant::Float(f) => {
                    let _ = writeln!(out, "{}    [{}] float {}", pad, idx, f);
                }
                Constant::Str(s) => {
                    let _ = writeln!(out, "{}    [{}] string {:?}", pad, idx, s);
                }
                Constant::Bool(b) => {
                    let _ = writeln!(out, "{}    [{}] bool {}", pad, idx, b);
                }
                Constant::Nil => {
                    let _ = writeln!(out, "{}    [{}] nil", pad, idx);
                }
                Constant::Class(spec) => {
                    let extends = if spec.superclass_name.is_empty() {
                        "Object".to_string()
                    } else {
                        spec.superclass_name.clone()
                    };
                    let _ = writeln!(
                        out,
                        "{}    [{}] class {} extends {} (fields {:?}, classvars {:?})",
                        pad, idx, spec.name, extends, spec.instance_fields, spec.class_variables
                    );
                    for method in &spec.instance_methods {
                        render_unit(
                            &method.body,
                            &format!("{}>>{}", spec.name, method.selector),
                            depth + 2,
                            out,
                        );
                    }
                    for method in &spec.class_methods {
                        render_unit(
                            &method.body,
                            &format!("{} class>>{}", spec.name, method.selector),
                            depth + 2,
                            out,
                        );
                    }
                }
                Constant::Method(method) => {
                    render_unit(
                        &method.body,
                        &format!("method {}", method.selector),
                        depth + 2,
                        out,
                    );
                }
                Constant::Unit(nested) => {
                    render_unit(nested, &format!("block [{}]", idx), depth + 2, out);
                }
            }
        }
    }

    let _ = writeln!(out, "{}  instructions:", pad);
    for (ip, instr) in unit.instructions.iter().enumerate() {
        let detail = match instr.op {
            Op::Send | Op::SuperSend => {
                let (sel_idx, argc) = unpack_send(instr.operand);
                match unit.constants.get(sel_idx) {
                    Some(Constant::Str(s)) => format!("#{} argc={}", s, argc),
                    _ => format!("selector@{} argc={}", sel_idx, argc),
                }
            }
            Op::MakeClosure => {
                let (body_idx, parent_local_count, param_count) = unpack_closure(instr.operand);
                format!(
                    "body=[{}] parent_locals={} params={}",
                    body_idx, parent_local_count, param_count
                )
            }
            Op::PushConst | Op::LoadGlobal | Op::StoreGlobal | Op::DefineClass => {
                match unit.constants.get(instr.index()) {
                    Some(Constant::Str(s)) => format!("[{}] {:?}", instr.index(), s),
                    Some(Constant::Int(n)) => format!("[{}] {}", instr.index(), n),
                    Some(Constant::Float(f)) => format!("[{}] {}", instr.index(), f),
                    Some(Constant::Class(spec)) => format!("[{}] class {}", instr.index(), spec.name),
                    _ => format!("[{}]", instr.index()),
                }
            }
            Op::LoadLocal | Op::StoreLocal | Op::LoadField | Op::StoreField
            | Op::LoadClassVar | Op::StoreClassVar | Op::MakeArray | Op::MakeDictionary => {
                format!("{}", instr.operand)
            }
            _ => String::new(),
        };
        let _ = writeln!(out, "{}    {:04}  {:?} {}", pad, ip, instr.op, detail);
    }
}

#[cfg(test)]
mod tests {
    use super::disassemble;
    use crate::compiler::Compiler;

    #[test]
    fn test_disassembly_resolves_selectors_and_nests_blocks() {
        let unit = Compiler::new()
            .compile_source("| x | x := 3 + 4. [ :y | y ] value: x")
            .unwrap();
        let listing = disassemble(&unit);

        assert!(listing.contains("#+ argc=1"));
        assert!(listing.contains("#value: argc=1"));
        assert!(listing.contains("MakeClosure"));
        assert!(listing.contains("block ["));
        assert!(listing.contains("StoreLocal 0"));
    }

    #[test]
    fn test_disassembly_lists_class_methods() {
        let unit = Compiler::new()
            .compile_source("class Dog [ speak [ ^'Woof!' ] ]")
            .unwrap();
        let listing = disassemble(&unit);
        assert!(listing.contains("class Dog extends Object"));
        assert!(listing.contains("Dog>>speak"));
        assert!(listing.contains("DefineClass"));
    }
}
