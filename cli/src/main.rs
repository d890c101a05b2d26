mod helper;

use std::{
    env::var,
    ffi::{CStr, CString},
    fs::create_dir_all,
    path::Path,
    process,
};

use clap::Parser;
use nix::{
    sys::{personality, ptrace},
    unistd::{execv, fork, ForkResult},
};
use rustyline::history::DefaultHistory;

use minidbg::{BatchDriver, Debugger};

#[derive(clap::Parser)]
#[command(
    name = "minidbg",
    about = "source-level debugger with spectrum-based fault localization"
)]
struct Args {
    /// Executable to debug
    #[arg(value_name = "PROGRAM")]
    program: String,

    /// Batch file of paired argument/expected-answer lines; when given,
    /// runs every case and reports the suspicious lines
    #[arg(value_name = "BATCH_FILE")]
    batch_file: Option<String>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{}", e);
        process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args = Args::parse();

    if let Some(batch_file) = args.batch_file {
        let info = minidbg::load_program(&args.program)?;
        return BatchDriver::new(args.program, &info).run(&batch_file);
    }

    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            let info = minidbg::load_program(&args.program)?;
            let mut debugger = Debugger::new(args.program.clone(), child, &info);
            debugger.wait_attach()?;
            println!("Started debugging process {}.", child.as_raw());

            let mut editor = rustyline::Editor::<helper::CliHelper, DefaultHistory>::new()
                .map_err(|e| format!("failed to create editor: {}", e))?;
            editor.set_helper(Some(helper::CliHelper::default()));

            let history_path = var("HOME").ok().map(|home| {
                Path::new(&home)
                    .join(".cache")
                    .join("minidbg")
                    .join("history")
            });
            if let Some(history_path) = history_path {
                let _ = editor.load_history(&history_path);
                run_command_loop(&mut editor, &mut debugger)?;
                let parent = history_path.parent().unwrap();
                create_dir_all(parent).map_err(|e| {
                    format!("failed to create directory to save command history: {}", e)
                })?;
                editor
                    .save_history(&history_path)
                    .map_err(|e| format!("failed to save history: {}", e))?;
            } else {
                run_command_loop(&mut editor, &mut debugger)?;
            }

            Ok(())
        }
        Ok(ForkResult::Child) => {
            ptrace::traceme().expect("failed to run traceme");
            personality::set(personality::Persona::ADDR_NO_RANDOMIZE)
                .expect("failed to disable ASLR");
            let path = CString::new(args.program).expect("program path contains NUL");
            let argv: [&CStr; 1] = [path.as_c_str()];
            let _ = execv(&path, &argv);
            eprintln!("failed to exec the program");
            process::exit(1);
        }
        Err(e) => Err(format!("failed to fork process: {}", e)),
    }
}

fn run_command_loop(
    editor: &mut rustyline::Editor<helper::CliHelper, DefaultHistory>,
    debugger: &mut Debugger,
) -> Result<(), String> {
    loop {
        let readline = editor.readline("minidbg> ");
        match readline {
            Ok(line) => {
                editor
                    .add_history_entry(line.as_str())
                    .map_err(|e| format!("failed to add history entry: {}", e))?;

                match debugger.handle_command(&line) {
                    // the engine has already reported the exit
                    Ok(Some(_)) => break,
                    Ok(None) => {}
                    Err(e) => eprintln!("{}", e),
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(rustyline::error::ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(e) => Err(format!("failed to read line: {}", e))?,
        }
    }

    Ok(())
}
