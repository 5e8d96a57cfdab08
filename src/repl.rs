// File: src/repl.rs
//
// Interactive REPL for Smalt.
// One VM instance lives for the whole session, so globals, classes and
// class-variable values persist across inputs. Unbalanced brackets start
// a multi-line continuation.

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::compiler::Compiler;
use crate::disassembler::disassemble;
use crate::value::Value;
use crate::vm::Vm;

pub struct Repl {
    compiler: Compiler,
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { compiler: Compiler::new(), vm: Vm::new(), editor })
    }

    fn show_banner(&self) {
        println!("{}", format!("Smalt {} interactive shell", env!("CARGO_PKG_VERSION")).bright_cyan());
        println!("Type {} for commands, {} to leave.", ":help".bright_yellow(), ":quit".bright_yellow());
        println!();
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();

        let mut buffer = String::new();

        loop {
            let prompt = if buffer.is_empty() {
                "smalt> ".bright_green().to_string()
            } else {
                "....>  ".bright_blue().to_string()
            };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    if buffer.is_empty() && line.trim().starts_with(':') {
                        if self.handle_command(line.trim()) {
                            continue;
                        } else {
                            break;
                        }
                    }

                    buffer.push_str(&line);
                    buffer.push('\n');

                    if is_input_complete(&buffer) {
                        self.eval_input(&buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C (:quit to exit)".bright_yellow());
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "Goodbye!".bright_cyan());
                    break;
                }
                Err(err) => {
                    eprintln!("{} {}", "Error:".bright_red(), err);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Returns true to continue the session, false on :quit.
    fn handle_command(&mut self, cmd: &str) -> bool {
        match cmd.split_whitespace().next().unwrap_or("") {
            ":help" | ":h" => {
                println!("  {}         show this help", ":help".bright_yellow());
                println!("  {}         leave the shell", ":quit".bright_yellow());
                println!("  {}      list defined globals", ":globals".bright_yellow());
                println!("  {} CODE    show the bytecode for CODE without running it", ":dis".bright_yellow());
                true
            }
            ":quit" | ":q" | ":exit" => {
                println!("{}", "Goodbye!".bright_cyan());
                false
            }
            ":globals" | ":g" => {
                let names = self.vm.global_names();
                if names.is_empty() {
                    println!("  (no globals yet)");
                }
                for name in names {
                    if let Some(value) = self.vm.global(&name) {
                        println!("  {} = {}", name.bright_cyan(), value.display_string());
                    }
                }
                true
            }
            ":dis" => {
                let code = cmd.strip_prefix(":dis").unwrap_or("").trim();
                if code.is_empty() {
                    println!("  usage: :dis CODE");
                    return true;
                }
                match self.compiler.compile_source(code) {
                    Ok(unit) => print!("{}", disassemble(&unit)),
                    Err(err) => eprintln!("{}", err),
                }
                true
            }
            other => {
                println!("  unknown command '{}' (try :help)", other);
                true
            }
        }
    }

    fn eval_input(&mut self, source: &str) {
        match self.compiler.compile_source(source) {
            Ok(unit) => match self.vm.run(unit) {
                Ok(Value::Nil) => {}
                Ok(value) => println!("{} {}", "=>".bright_blue(), value.display_string()),
                Err(err) => eprintln!("{}", err),
            },
            Err(err) => eprintln!("{}", err),
        }
    }
}

/// A line is complete when brackets balance outside strings and comments.
fn is_input_complete(source: &str) -> bool {
    let mut depth: i64 = 0;
    let mut chars = source.chars().peekable();
    let mut in_string = false;
    let mut in_comment = false;

    while let Some(c) = chars.next() {
        if in_string {
            if c == '\'' {
                // A doubled quote stays inside the string.
                if chars.peek() == Some(&'\'') {
                    chars.next();
                } else {
                    in_string = false;
                }
            }
            continue;
        }
        if in_comment {
            if c == '"' {
                in_comment = false;
            }
            continue;
        }
        match c {
            '\'' => in_string = true,
            '"' => in_comment = true,
            '[' | '(' | '{' => depth += 1,
            ']' | ')' | '}' => depth -= 1,
            _ => {}
        }
    }

    depth <= 0 && !in_string && !in_comment
}

#[cfg(test)]
mod tests {
    use super::is_input_complete;

    #[test]
    fn test_balanced_input_is_complete() {
        assert!(is_input_complete("3 + 4"));
        assert!(is_input_complete("[ :x | x ] value: 1"));
    }

    #[test]
    fn test_open_bracket_continues() {
        assert!(!is_input_complete("class Dog ["));
        assert!(!is_input_complete("#(1 2"));
    }

    #[test]
    fn test_brackets_inside_strings_and_comments_are_ignored() {
        assert!(is_input_complete("'an [ in a string'"));
        assert!(is_input_complete("\"a [ in a comment\" 1"));
        assert!(!is_input_complete("'unterminated"));
    }
}
