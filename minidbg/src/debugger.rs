use std::collections::HashMap;
use std::fs;

use nix::libc::siginfo_t;
use nix::{
    sys::{
        ptrace,
        signal::Signal,
        wait::{waitpid, WaitStatus},
    },
    unistd::Pid,
};

use crate::breakpoint::Breakpoint;
use crate::command::{self, BreakTarget, Command};
use crate::dwarf::{DebugInfo, FunctionInfo, LineEntry};
use crate::expr::{self, ExprContext, ExprValue};
use crate::reg::{self, Reg, RegSelector};
use crate::{memory, symbol};

const SI_KERNEL: i32 = 0x80;
const TRAP_BRKPT: i32 = 0x1;
const TRAP_TRACE: i32 = 0x2;

pub struct Debugger<'a> {
    program_path: String,
    pid: Pid,
    info: &'a DebugInfo,
    breakpoints: HashMap<u64, Breakpoint>,
    advice: bool,
    line_hits: HashMap<u64, u64>,
    last_line: Option<u64>,
}

impl<'a> Debugger<'a> {
    pub fn new(program_path: String, pid: Pid, info: &'a DebugInfo) -> Debugger<'a> {
        Debugger {
            program_path,
            pid,
            info,
            breakpoints: HashMap::new(),
            advice: false,
            line_hits: HashMap::new(),
            last_line: None,
        }
    }

    /// An engine that records per-line hit counts instead of printing
    /// source windows; used by the batch driver.
    pub fn new_advice(program_path: String, pid: Pid, info: &'a DebugInfo) -> Debugger<'a> {
        Debugger {
            advice: true,
            ..Debugger::new(program_path, pid, info)
        }
    }

    /// Blocks until the initial stop raised by the child's exec.
    pub fn wait_attach(&self) -> Result<(), String> {
        let status = waitpid(self.pid, None)
            .map_err(|e| format!("failed to wait for {}: {}", self.program_path, e))?;
        match status {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => Ok(()),
            other => Err(format!(
                "failed to attach to {}: unexpected stop {:?}",
                self.program_path, other
            )),
        }
    }

    pub fn handle_command(&mut self, line: &str) -> Result<Option<i32>, String> {
        match command::parse(line)? {
            Command::Continue => self.continue_execution(),
            Command::Break(BreakTarget::Address(addr)) => {
                self.set_breakpoint_at_address(addr)?;
                Ok(None)
            }
            Command::Break(BreakTarget::SourceLine { file, line }) => {
                self.set_breakpoint_at_source_line(&file, line)?;
                Ok(None)
            }
            Command::Break(BreakTarget::Function(name)) => {
                self.set_breakpoint_at_function(&name)?;
                Ok(None)
            }
            Command::Step => self.step_in(),
            Command::Next => self.step_over(),
            Command::Finish => self.step_out(),
            Command::StepInstruction => {
                match self.single_step_instruction_with_breakpoint_check()? {
                    Some(status) => Ok(Some(status)),
                    None => {
                        let entry = self.info.line_entry_from_pc(self.get_pc()?)?;
                        self.show_line(&entry);
                        Ok(None)
                    }
                }
            }
            Command::Status => {
                let entry = self.info.line_entry_from_pc(self.get_pc()?)?;
                self.show_line(&entry);
                Ok(None)
            }
            Command::RegisterDump => {
                for (name, value) in reg::dump(self.pid)? {
                    println!("{}: {:#018x}", name, value);
                }
                Ok(None)
            }
            Command::RegisterRead(name) => {
                let value = reg::read(self.pid, &RegSelector::Name(&name))?;
                println!("{}: {:#x}", name, value);
                Ok(None)
            }
            Command::RegisterWrite(name, value) => {
                reg::write(self.pid, &RegSelector::Name(&name), value)?;
                Ok(None)
            }
            Command::MemoryRead(addr) => {
                println!("{:#x}", memory::peek(self.pid, addr)?);
                Ok(None)
            }
            Command::MemoryWrite(addr, value) => {
                memory::poke(self.pid, addr, value)?;
                Ok(None)
            }
            Command::Variables => {
                self.read_variables()?;
                Ok(None)
            }
            Command::Backtrace => {
                self.print_backtrace()?;
                Ok(None)
            }
            Command::Symbol(name) => {
                for sym in symbol::lookup(self.info.symbols(), &name) {
                    println!("{} {} {:#x}", sym.name, sym.kind, sym.addr);
                }
                Ok(None)
            }
        }
    }

    pub fn get_pc(&self) -> Result<u64, String> {
        reg::read(self.pid, &RegSelector::Reg(Reg::RIP))
    }

    pub fn set_pc(&self, pc: u64) -> Result<(), String> {
        reg::write(self.pid, &RegSelector::Reg(Reg::RIP), pc)
    }

    /// Resumes the tracee. Returns the exit status once the tracee is
    /// gone, None while it is merely stopped again.
    pub fn continue_execution(&mut self) -> Result<Option<i32>, String> {
        if let Some(status) = self.step_over_breakpoint()? {
            return Ok(Some(status));
        }
        ptrace::cont(self.pid, None).map_err(|e| format!("failed to continue program: {}", e))?;
        self.wait_for_signal()
    }

    fn wait_for_signal(&mut self) -> Result<Option<i32>, String> {
        let status = waitpid(self.pid, None).map_err(|e| format!("failed to wait pid: {}", e))?;

        match status {
            WaitStatus::Exited(_, code) => {
                println!("Process exited with status {}.", code);
                return Ok(Some(code));
            }
            WaitStatus::Signaled(_, signal, _) => {
                println!("Process terminated by signal {:?}.", signal);
                return Ok(Some(-1));
            }
            WaitStatus::Stopped(..) => {
                let siginfo = ptrace::getsiginfo(self.pid)
                    .map_err(|e| format!("failed to get siginfo: {}", e))?;
                match siginfo.si_signo {
                    nix::libc::SIGTRAP => self.handle_sigtrap(siginfo)?,
                    nix::libc::SIGSEGV => {
                        println!("Tracee segfaulted, reason: {}", siginfo.si_code);
                        if self.advice {
                            // let the fault terminate the run
                            let _ = ptrace::cont(self.pid, Signal::SIGSEGV);
                            return Ok(Some(-1));
                        }
                    }
                    signo => match Signal::try_from(signo) {
                        Ok(signal) => println!("Got signal {:?}", signal),
                        Err(_) => println!("Got signal {}", signo),
                    },
                }
            }
            other => println!("Unexpected wait status: {:?}", other),
        }

        Ok(None)
    }

    fn handle_sigtrap(&mut self, siginfo: siginfo_t) -> Result<(), String> {
        match siginfo.si_code {
            // a breakpoint fired; the trap has already advanced the pc
            // past the int3
            SI_KERNEL | TRAP_BRKPT => {
                let pc = self.get_pc()? - 1;
                self.set_pc(pc)?;
                let entry = self.info.line_entry_from_pc(pc)?;
                self.announce_line(&entry);
                Ok(())
            }
            // single-step completion
            TRAP_TRACE => Ok(()),
            code => {
                println!("Unknown SIGTRAP code {}", code);
                Ok(())
            }
        }
    }

    fn step_over_breakpoint(&mut self) -> Result<Option<i32>, String> {
        let pc = self.get_pc()?;
        let armed = self
            .breakpoints
            .get(&pc)
            .map(|bp| bp.is_enabled())
            .unwrap_or(false);
        if !armed {
            return Ok(None);
        }

        self.breakpoints
            .get_mut(&pc)
            .unwrap()
            .disable()
            .map_err(|e| format!("failed to disable breakpoint: {}", e))?;
        let status = self.single_step_instruction()?;
        if status.is_none() {
            // unwrap because already checked that the breakpoint exists
            self.breakpoints
                .get_mut(&pc)
                .unwrap()
                .enable()
                .map_err(|e| format!("failed to re-enable breakpoint: {}", e))?;
        }
        Ok(status)
    }

    pub fn single_step_instruction(&mut self) -> Result<Option<i32>, String> {
        ptrace::step(self.pid, None)
            .map_err(|e| format!("failed to single step program: {}", e))?;
        self.wait_for_signal()
    }

    pub fn single_step_instruction_with_breakpoint_check(
        &mut self,
    ) -> Result<Option<i32>, String> {
        let pc = self.get_pc()?;
        let status = if self.breakpoints.contains_key(&pc) {
            self.step_over_breakpoint()?
        } else {
            self.single_step_instruction()?
        };
        if status.is_some() {
            return Ok(status);
        }

        let entry = self.info.line_entry_from_pc(self.get_pc()?)?;
        if self.advice {
            self.note_advice_line(&entry);
        }
        Ok(None)
    }

    /// Source-level step into: single-steps until the pc maps to a
    /// different line.
    pub fn step_in(&mut self) -> Result<Option<i32>, String> {
        let start = self.info.line_entry_from_pc(self.get_pc()?)?.line;
        while self.info.line_entry_from_pc(self.get_pc()?)?.line == start {
            if let Some(status) = self.single_step_instruction_with_breakpoint_check()? {
                return Ok(Some(status));
            }
        }

        let entry = self.info.line_entry_from_pc(self.get_pc()?)?;
        self.show_line(&entry);
        Ok(None)
    }

    /// step_in without the source window; hit recording happens in the
    /// single-step path. The advice loop consumes the lookup failure as
    /// its end-of-program signal.
    pub fn step_in_advice(&mut self) -> Result<Option<i32>, String> {
        let start = self.info.line_entry_from_pc(self.get_pc()?)?.line;
        while self.info.line_entry_from_pc(self.get_pc()?)?.line == start {
            if let Some(status) = self.single_step_instruction_with_breakpoint_check()? {
                return Ok(Some(status));
            }
        }
        Ok(None)
    }

    /// Runs until the current function returns, via a temporary
    /// breakpoint at the return address.
    pub fn step_out(&mut self) -> Result<Option<i32>, String> {
        let frame_pointer = reg::read(self.pid, &RegSelector::Reg(Reg::RBP))?;
        let return_address = memory::peek(self.pid, frame_pointer + 8)?;

        let inserted = !self.breakpoints.contains_key(&return_address);
        if inserted {
            self.set_breakpoint_at_address(return_address)?;
        }

        let run = self.continue_execution();
        if inserted {
            let _ = self.remove_breakpoint(return_address);
        }
        run
    }

    /// Source-level step over: breakpoints on every other line of the
    /// enclosing function plus the return address, then one resume.
    pub fn step_over(&mut self) -> Result<Option<i32>, String> {
        let pc = self.get_pc()?;
        let function = self.info.function_from_pc(pc)?;
        let start = self.info.line_entry_from_pc(pc)?;

        let mut to_remove = Vec::new();
        for entry in self
            .info
            .function_line_entries(function.low_pc, function.high_pc)?
        {
            if entry.address != start.address && !self.breakpoints.contains_key(&entry.address) {
                self.set_breakpoint_at_address(entry.address)?;
                to_remove.push(entry.address);
            }
        }

        let frame_pointer = reg::read(self.pid, &RegSelector::Reg(Reg::RBP))?;
        let return_address = memory::peek(self.pid, frame_pointer + 8)?;
        if !self.breakpoints.contains_key(&return_address) {
            self.set_breakpoint_at_address(return_address)?;
            to_remove.push(return_address);
        }

        let run = self.continue_execution();
        for addr in to_remove {
            let _ = self.remove_breakpoint(addr);
        }
        run
    }

    pub fn set_breakpoint_at_address(&mut self, addr: u64) -> Result<(), String> {
        if self.breakpoints.contains_key(&addr) {
            return Err(format!("breakpoint already set at {:#x}", addr));
        }
        let mut breakpoint = Breakpoint::new(self.pid, addr);
        breakpoint
            .enable()
            .map_err(|e| format!("failed to enable breakpoint: {}", e))?;
        self.breakpoints.insert(addr, breakpoint);
        Ok(())
    }

    pub fn set_breakpoint_at_function(&mut self, name: &str) -> Result<(), String> {
        let addresses = self.info.prologue_end_addresses(name)?;
        if addresses.is_empty() {
            return Err(format!("no function named {}", name));
        }
        for addr in addresses {
            if !self.breakpoints.contains_key(&addr) {
                self.set_breakpoint_at_address(addr)?;
            }
        }
        Ok(())
    }

    pub fn set_breakpoint_at_source_line(&mut self, file: &str, line: u64) -> Result<(), String> {
        match self.info.source_line_address(file, line)? {
            Some(addr) => self.set_breakpoint_at_address(addr),
            None => Err(format!("no statement at {}:{}", file, line)),
        }
    }

    /// Removes the table entry first, so the table is consistent even
    /// when restoring the tracee byte fails.
    pub fn remove_breakpoint(&mut self, addr: u64) -> Result<(), String> {
        let mut breakpoint = self
            .breakpoints
            .remove(&addr)
            .ok_or_else(|| format!("no breakpoint at {:#x}", addr))?;
        if breakpoint.is_enabled() {
            breakpoint
                .disable()
                .map_err(|e| format!("failed to disable breakpoint: {}", e))?;
        }
        Ok(())
    }

    pub fn read_variables(&self) -> Result<(), String> {
        let pc = self.get_pc()?;
        let ctx = PtraceExprContext { pid: self.pid };

        for variable in self.info.variables_in_function(pc)? {
            let location = expr::evaluate(
                &variable.location,
                variable.encoding,
                variable.frame_base.as_ref(),
                &ctx,
            )?;
            match location {
                ExprValue::Address(addr) => {
                    let value = memory::peek(self.pid, addr)?;
                    println!("{} ({:#x}) = {}", variable.name, addr, value);
                }
                ExprValue::Register(dwarf_id) => {
                    let value = reg::read(self.pid, &RegSelector::Dwarf(dwarf_id as i32))?;
                    println!("{} (reg {}) = {}", variable.name, dwarf_id, value);
                }
                ExprValue::Literal(_) => {
                    return Err(format!("unhandled variable location for {}", variable.name))
                }
            }
        }
        Ok(())
    }

    /// Walks saved frame pointers until `main`; requires the tracee to
    /// be compiled with frame pointers.
    pub fn print_backtrace(&self) -> Result<(), String> {
        let mut frame_number = 0;
        let mut output_frame = |function: &FunctionInfo| {
            println!(
                "frame #{}: {:#x} {}",
                frame_number, function.low_pc, function.name
            );
            frame_number += 1;
        };

        let mut current = self.info.function_from_pc(self.get_pc()?)?;
        output_frame(&current);

        let mut frame_pointer = reg::read(self.pid, &RegSelector::Reg(Reg::RBP))?;
        let mut return_address = memory::peek(self.pid, frame_pointer + 8)?;
        while current.name != "main" {
            current = self.info.function_from_pc(return_address)?;
            output_frame(&current);
            frame_pointer = memory::peek(self.pid, frame_pointer)?;
            return_address = memory::peek(self.pid, frame_pointer + 8)?;
        }
        Ok(())
    }

    /// Drives one tracee from exec to exit, recording per-line hit
    /// counts: break at main, then source-step until execution leaves
    /// instrumented code.
    pub fn run_advice(&mut self) -> Result<(), String> {
        self.wait_attach()?;
        self.set_breakpoint_at_function("main")?;
        if self.continue_execution()?.is_some() {
            return Ok(());
        }

        loop {
            match self.step_in_advice() {
                Ok(Some(_)) => break,
                Ok(None) => continue,
                // execution left instrumented code; run to completion
                Err(_) => {
                    let _ = self.continue_execution();
                    break;
                }
            }
        }

        let mut lines: Vec<(u64, u64)> = self
            .line_hits
            .iter()
            .map(|(line, count)| (*line, *count))
            .collect();
        lines.sort_unstable();
        println!();
        println!("Conclusion:");
        for (line, count) in lines {
            println!("Line {} was executed {} times", line, count);
        }

        Ok(())
    }

    /// Hands the accumulated hit counts to the batch driver and resets
    /// the advice context for the next run.
    pub fn take_line_hits(&mut self) -> HashMap<u64, u64> {
        self.last_line = None;
        std::mem::take(&mut self.line_hits)
    }

    fn announce_line(&mut self, entry: &LineEntry) {
        if self.advice {
            self.note_advice_line(entry);
        } else {
            self.show_line(entry);
        }
    }

    fn note_advice_line(&mut self, entry: &LineEntry) {
        if self.last_line == Some(entry.line) {
            return;
        }
        self.last_line = Some(entry.line);
        *self.line_hits.entry(entry.line).or_insert(0) += 1;

        match source_line(&entry.file, entry.line) {
            Some(text) => println!("{:>4}  {}", entry.line, text),
            None => println!("{:>4}", entry.line),
        }
    }

    fn show_line(&self, entry: &LineEntry) {
        if self.print_source(&entry.file, entry.line, 2).is_err() {
            println!("{}:{}", entry.file, entry.line);
        }
    }

    fn print_source(&self, file: &str, line: u64, context: u64) -> Result<(), String> {
        let text = fs::read_to_string(file)
            .map_err(|e| format!("failed to open source file {}: {}", file, e))?;
        let start = line.saturating_sub(context).max(1);
        let end = line + context;

        for (index, source_line) in text.lines().enumerate() {
            let number = index as u64 + 1;
            if number < start || number > end {
                continue;
            }
            let marker = if number == line { ">" } else { " " };
            println!("{} {:>4}  {}", marker, number, source_line);
        }
        Ok(())
    }
}

fn source_line(file: &str, line: u64) -> Option<String> {
    let text = fs::read_to_string(file).ok()?;
    text.lines()
        .nth(line.checked_sub(1)? as usize)
        .map(|s| s.trim_end().to_owned())
}

struct PtraceExprContext {
    pid: Pid,
}

impl ExprContext for PtraceExprContext {
    fn reg(&self, dwarf_id: u16) -> Result<u64, String> {
        reg::read(self.pid, &RegSelector::Dwarf(dwarf_id as i32))
    }

    fn pc(&self) -> Result<u64, String> {
        reg::read(self.pid, &RegSelector::Reg(Reg::RIP))
    }

    fn deref_size(&self, addr: u64, size: u8) -> Result<u64, String> {
        memory::peek(self.pid, addr).map(|word| expr::mask_to_size(word, size))
    }
}
