mod chunk;
mod compiler;
mod natives;
mod reporter;
mod table;
mod token;
mod tokenizer;
mod value;
mod vm;

use std::{env, fs, process};

use colored::Colorize;
use reporter::{Phase, Report, Reporter};
use rustyline::error::ReadlineError;
use rustyline::Editor;
use vm::{RunResult, Vm};

const HELP_MSG: &str = "usage:
  loxvm [options] [path]

With no path, starts an interactive REPL.

options:
  -scan <path>
    Print the token stream for <path> instead of running it.
  -parse <path>
    Reserved for a future parse-only mode; currently a no-op.
";

/// Colorizes diagnostics on the way to stdout/stderr: errors in red on
/// stderr, warnings in yellow on stdout. Counts both so the caller can
/// decide an exit code once the run is over.
struct CliReporter {
    errors: usize,
    warnings: usize,
}

impl CliReporter {
    fn new() -> Self {
        CliReporter { errors: 0, warnings: 0 }
    }
}

impl Reporter for CliReporter {
    fn warning(&mut self, report: Report) {
        self.warnings += 1;
        println!("{}", report.to_string().yellow());
    }

    fn error(&mut self, report: Report) {
        self.errors += 1;
        eprintln!("{}", report.to_string().bright_red());
    }
}

fn main() {
    let mut args = env::args().skip(1);
    let first = args.next();

    match first.as_deref() {
        None => run_repl(),
        Some("-scan") => {
            let path = args.next().unwrap_or_else(|| usage_error("expected a file path after -scan"));
            let source = read_source(&path);
            scan_file(&source);
        }
        Some("-parse") => {
            let path = args.next().unwrap_or_else(|| usage_error("expected a file path after -parse"));
            let _source = read_source(&path);
            // Reserved: no standalone parse-only output is defined yet.
        }
        Some("-help") | Some("--help") => {
            println!("{}", HELP_MSG);
        }
        Some(path) => {
            if args.next().is_some() {
                usage_error_void("unexpected extra arguments");
            }
            let source = read_source(path);
            let mut vm = Vm::new();
            let mut cli_reporter = CliReporter::new();
            let result = vm.interpret(&source, &mut cli_reporter);
            process::exit(exit_code_for(result));
        }
    }
}

fn exit_code_for(result: RunResult) -> i32 {
    match result {
        RunResult::Ok => exitcode::OK,
        RunResult::CompileError => exitcode::DATAERR,
        RunResult::RuntimeError => exitcode::SOFTWARE,
    }
}

fn usage_error(message: &str) -> String {
    usage_error_void(message);
    unreachable!()
}

fn usage_error_void(message: &str) {
    eprintln!("{}: {}", "usage error".bright_red(), message);
    process::exit(exitcode::USAGE);
}

fn read_source(path: &str) -> String {
    fs::read_to_string(path).unwrap_or_else(|err| {
        eprintln!("{}: {}", "could not read file".bright_red(), err);
        process::exit(exitcode::IOERR);
    })
}

fn scan_file(source: &str) {
    let mut tokenizer = tokenizer::Tokenizer::new(source);
    loop {
        let token = tokenizer.next_token();
        println!("{:4} {:?} '{}'", token.line, token.typ, token.lexeme);
        if token.typ == token::TokenType::Eof {
            break;
        }
    }
}

fn run_repl() {
    let mut vm = Vm::new();
    let mut editor = Editor::<()>::new();
    println!("loxvm {} — interactive mode, Ctrl-D to exit", env!("CARGO_PKG_VERSION"));
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                editor.add_history_entry(line.as_str());
                let mut cli_reporter = CliReporter::new();
                vm.interpret(&line, &mut cli_reporter);
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("{}: {}", "readline error".bright_red(), err);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_reporter_counts_errors_and_warnings() {
        let mut reporter = CliReporter::new();
        reporter.error(Report::new(Phase::Compiling, "bad", 1));
        reporter.warning(Report::new(Phase::Runtime, "heads up", 1));
        assert_eq!(reporter.errors, 1);
        assert_eq!(reporter.warnings, 1);
    }

    #[test]
    fn exit_code_mapping_matches_spec() {
        assert_eq!(exit_code_for(RunResult::Ok), exitcode::OK);
        assert_eq!(exit_code_for(RunResult::CompileError), exitcode::DATAERR);
        assert_eq!(exit_code_for(RunResult::RuntimeError), exitcode::SOFTWARE);
    }
}
