use std::fs;
use std::process::ExitCode;

use clap::Parser as _;
use slate::{ExecOutcome, VM};

/// Run a Slate source file, or an inline snippet, and print its result.
#[derive(clap::Parser)]
#[command(name = "slate", version, about)]
struct Cli {
    /// Evaluate SOURCE directly instead of reading a file.
    #[arg(short = 'c', long, value_name = "SOURCE")]
    code: Option<String>,

    /// Script to run. Required unless -c is given.
    file: Option<String>,

    /// Arguments passed through to the script, available via `args()`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let source = match (&cli.code, &cli.file) {
        (Some(code), _) => code.clone(),
        (None, Some(path)) => match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                eprintln!("error reading {path}: {err}");
                return ExitCode::from(2);
            }
        },
        (None, None) => {
            eprintln!("usage: slate [-c code] [file] [args...]");
            return ExitCode::from(2);
        }
    };

    let mut vm = VM::create_with_args(cli.args);
    match vm.interpret(&source) {
        ExecOutcome::Ok(value) => {
            println!("{}", vm.display_value(&value));
            ExitCode::SUCCESS
        }
        ExecOutcome::CompileError(errors) => {
            for err in errors {
                eprintln!("{err}");
            }
            ExitCode::FAILURE
        }
        ExecOutcome::RuntimeError(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
