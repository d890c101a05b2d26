use std::os::raw::c_void;

use nix::{sys::ptrace, unistd::Pid};

// Word-granular tracee memory I/O. Sub-word reads are composed by the
// caller from the low bytes of a full word.

pub fn peek(pid: Pid, addr: u64) -> Result<u64, String> {
    ptrace::read(pid, addr as *mut c_void)
        .map(|word| word as u64)
        .map_err(|e| format!("failed to read memory at {:#x}: {}", addr, e))
}

pub fn poke(pid: Pid, addr: u64, word: u64) -> Result<(), String> {
    // SAFETY: addr names tracee memory, word is plain data.
    unsafe {
        ptrace::write(pid, addr as *mut c_void, word as *mut c_void)
            .map_err(|e| format!("failed to write memory at {:#x}: {}", addr, e))
    }
}
