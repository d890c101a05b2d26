use std::collections::{HashMap, HashSet};
use std::ffi::{CStr, CString};
use std::fs;
use std::process;

use nix::{
    sys::{personality, ptrace, wait::waitpid},
    unistd::{execv, fork, ForkResult},
};

use crate::debugger::Debugger;
use crate::dwarf::DebugInfo;

/// The tracee writes its answer here; read after the tracee has exited.
const ANSWER_FILE: &str = "1.txt";

struct Case {
    argv: Vec<String>,
    expected: String,
}

/// Runs the program once per input case under the advice engine and
/// reports the lines executed only by failing runs.
pub struct BatchDriver<'a> {
    program_path: String,
    info: &'a DebugInfo,
    success_lines: HashSet<u64>,
    fail_lines: HashSet<u64>,
}

impl<'a> BatchDriver<'a> {
    pub fn new(program_path: String, info: &'a DebugInfo) -> BatchDriver<'a> {
        BatchDriver {
            program_path,
            info,
            success_lines: HashSet::new(),
            fail_lines: HashSet::new(),
        }
    }

    pub fn run(&mut self, batch_path: &str) -> Result<(), String> {
        let batch = fs::read_to_string(batch_path)
            .map_err(|e| format!("failed to open batch file {}: {}", batch_path, e))?;
        let cases = parse_cases(&batch)?;

        for (number, case) in cases.iter().enumerate() {
            println!("Run {}: {}", number + 1, case.argv.join(" "));
            let hits = self.run_case(case)?;

            let actual = read_answer(ANSWER_FILE);
            println!("correct answer: {}", case.expected);
            println!("test answer: {}", actual);
            if actual == case.expected {
                println!("success");
                self.success_lines.extend(hits.keys().copied());
            } else {
                println!("fail");
                self.fail_lines.extend(hits.keys().copied());
            }
        }

        self.report();
        Ok(())
    }

    fn run_case(&self, case: &Case) -> Result<HashMap<u64, u64>, String> {
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                let mut debugger =
                    Debugger::new_advice(self.program_path.clone(), child, self.info);
                debugger.run_advice()?;
                // reap in case the final resume left the tracee running
                let _ = waitpid(child, None);
                Ok(debugger.take_line_hits())
            }
            Ok(ForkResult::Child) => spawn_tracee(&self.program_path, &case.argv),
            Err(e) => Err(format!("failed to fork tracee: {}", e)),
        }
    }

    fn report(&self) {
        println!();
        println!("Analyze:");
        for line in suspicious_lines(&self.fail_lines, &self.success_lines) {
            println!("Line :{} is likely to be a fault", line);
        }
    }
}

fn suspicious_lines(fail_lines: &HashSet<u64>, success_lines: &HashSet<u64>) -> Vec<u64> {
    let mut lines: Vec<u64> = fail_lines.difference(success_lines).copied().collect();
    lines.sort_unstable();
    lines
}

fn parse_cases(batch: &str) -> Result<Vec<Case>, String> {
    let mut cases = Vec::new();
    let mut lines = batch.lines();
    while let Some(args_line) = lines.next() {
        let expected = lines.next().ok_or_else(|| {
            format!(
                "batch file is malformed: run {} has no expected answer line",
                cases.len() + 1
            )
        })?;
        cases.push(Case {
            argv: args_line.split_whitespace().map(str::to_owned).collect(),
            expected: expected.to_owned(),
        });
    }
    Ok(cases)
}

fn read_answer(path: &str) -> String {
    fs::read_to_string(path)
        .ok()
        .and_then(|text| text.lines().next().map(str::to_owned))
        .unwrap_or_default()
}

// Child side: trace, pin addresses, exec with the argv the input line
// provided.
fn spawn_tracee(program_path: &str, argv: &[String]) -> ! {
    if let Err(e) = ptrace::traceme() {
        eprintln!("failed to run traceme: {}", e);
        process::exit(1);
    }
    let _ = personality::set(personality::Persona::ADDR_NO_RANDOMIZE);

    let path = CString::new(program_path).expect("program path contains NUL");
    let args: Vec<CString> = if argv.is_empty() {
        vec![path.clone()]
    } else {
        argv.iter()
            .map(|arg| CString::new(arg.as_str()).expect("argument contains NUL"))
            .collect()
    };
    let args: Vec<&CStr> = args.iter().map(|arg| arg.as_c_str()).collect();

    let _ = execv(&path, &args);
    eprintln!("failed to exec {}", program_path);
    process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cases_are_consumed_in_pairs() {
        let cases = parse_cases("prog 3 1 2\n1 2 3\nprog 5 4\n4 5\n").unwrap();
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].argv, vec!["prog", "3", "1", "2"]);
        assert_eq!(cases[0].expected, "1 2 3");
        assert_eq!(cases[1].argv, vec!["prog", "5", "4"]);
        assert_eq!(cases[1].expected, "4 5");
    }

    #[test]
    fn a_trailing_unpaired_line_is_malformed() {
        assert!(parse_cases("prog 1\n1\nprog 2\n").is_err());
    }

    #[test]
    fn an_empty_batch_has_no_cases() {
        assert!(parse_cases("").unwrap().is_empty());
    }

    #[test]
    fn suspicious_is_exactly_fail_minus_success() {
        let fail: HashSet<u64> = [10, 12, 14, 20].into_iter().collect();
        let success: HashSet<u64> = [10, 14, 30].into_iter().collect();
        assert_eq!(suspicious_lines(&fail, &success), vec![12, 20]);
        assert!(suspicious_lines(&success, &success).is_empty());
    }
}
