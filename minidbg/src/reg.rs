use nix::libc::user_regs_struct;
use nix::{sys::ptrace, unistd::Pid};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Reg {
    R15,
    R14,
    R13,
    R12,
    RBP,
    RBX,
    R11,
    R10,
    R9,
    R8,
    RAX,
    RCX,
    RDX,
    RSI,
    RDI,
    ORIGRAX,
    RIP,
    CS,
    EFLAGS,
    RSP,
    SS,
    FSBASE,
    GSBASE,
    DS,
    ES,
    FS,
    GS,
}

pub struct RegDescriptor {
    pub reg: Reg,
    pub dwarf_id: i32,
    pub name: &'static str,
}

// Ordered to match the layout of user_regs_struct. DWARF numbers follow
// the System V AMD64 ABI; -1 where DWARF assigns none.
pub static DESCRIPTORS: [RegDescriptor; 27] = [
    RegDescriptor { reg: Reg::R15, dwarf_id: 15, name: "r15" },
    RegDescriptor { reg: Reg::R14, dwarf_id: 14, name: "r14" },
    RegDescriptor { reg: Reg::R13, dwarf_id: 13, name: "r13" },
    RegDescriptor { reg: Reg::R12, dwarf_id: 12, name: "r12" },
    RegDescriptor { reg: Reg::RBP, dwarf_id: 6, name: "rbp" },
    RegDescriptor { reg: Reg::RBX, dwarf_id: 3, name: "rbx" },
    RegDescriptor { reg: Reg::R11, dwarf_id: 11, name: "r11" },
    RegDescriptor { reg: Reg::R10, dwarf_id: 10, name: "r10" },
    RegDescriptor { reg: Reg::R9, dwarf_id: 9, name: "r9" },
    RegDescriptor { reg: Reg::R8, dwarf_id: 8, name: "r8" },
    RegDescriptor { reg: Reg::RAX, dwarf_id: 0, name: "rax" },
    RegDescriptor { reg: Reg::RCX, dwarf_id: 2, name: "rcx" },
    RegDescriptor { reg: Reg::RDX, dwarf_id: 1, name: "rdx" },
    RegDescriptor { reg: Reg::RSI, dwarf_id: 4, name: "rsi" },
    RegDescriptor { reg: Reg::RDI, dwarf_id: 5, name: "rdi" },
    RegDescriptor { reg: Reg::ORIGRAX, dwarf_id: -1, name: "orig_rax" },
    RegDescriptor { reg: Reg::RIP, dwarf_id: -1, name: "rip" },
    RegDescriptor { reg: Reg::CS, dwarf_id: 51, name: "cs" },
    RegDescriptor { reg: Reg::EFLAGS, dwarf_id: 49, name: "eflags" },
    RegDescriptor { reg: Reg::RSP, dwarf_id: 7, name: "rsp" },
    RegDescriptor { reg: Reg::SS, dwarf_id: 52, name: "ss" },
    RegDescriptor { reg: Reg::FSBASE, dwarf_id: 58, name: "fs_base" },
    RegDescriptor { reg: Reg::GSBASE, dwarf_id: 59, name: "gs_base" },
    RegDescriptor { reg: Reg::DS, dwarf_id: 53, name: "ds" },
    RegDescriptor { reg: Reg::ES, dwarf_id: 50, name: "es" },
    RegDescriptor { reg: Reg::FS, dwarf_id: 54, name: "fs" },
    RegDescriptor { reg: Reg::GS, dwarf_id: 55, name: "gs" },
];

pub enum RegSelector<'a> {
    Reg(Reg),
    Name(&'a str),
    Dwarf(i32),
}

pub fn name_of(reg: Reg) -> &'static str {
    DESCRIPTORS
        .iter()
        .find(|d| d.reg == reg)
        .map(|d| d.name)
        .unwrap_or("?")
}

pub fn from_name(name: &str) -> Option<Reg> {
    DESCRIPTORS.iter().find(|d| d.name == name).map(|d| d.reg)
}

fn descriptor_for(selector: &RegSelector) -> Result<&'static RegDescriptor, String> {
    match selector {
        RegSelector::Reg(reg) => DESCRIPTORS.iter().find(|d| d.reg == *reg),
        RegSelector::Name(name) => DESCRIPTORS.iter().find(|d| d.name == *name),
        RegSelector::Dwarf(id) if *id >= 0 => DESCRIPTORS.iter().find(|d| d.dwarf_id == *id),
        RegSelector::Dwarf(_) => None,
    }
    .ok_or_else(|| match selector {
        RegSelector::Reg(reg) => format!("unknown register: {:?}", reg),
        RegSelector::Name(name) => format!("unknown register: {}", name),
        RegSelector::Dwarf(id) => format!("unknown DWARF register number: {}", id),
    })
}

fn value_of(regs: &user_regs_struct, reg: Reg) -> u64 {
    match reg {
        Reg::R15 => regs.r15,
        Reg::R14 => regs.r14,
        Reg::R13 => regs.r13,
        Reg::R12 => regs.r12,
        Reg::RBP => regs.rbp,
        Reg::RBX => regs.rbx,
        Reg::R11 => regs.r11,
        Reg::R10 => regs.r10,
        Reg::R9 => regs.r9,
        Reg::R8 => regs.r8,
        Reg::RAX => regs.rax,
        Reg::RCX => regs.rcx,
        Reg::RDX => regs.rdx,
        Reg::RSI => regs.rsi,
        Reg::RDI => regs.rdi,
        Reg::ORIGRAX => regs.orig_rax,
        Reg::RIP => regs.rip,
        Reg::CS => regs.cs,
        Reg::EFLAGS => regs.eflags,
        Reg::RSP => regs.rsp,
        Reg::SS => regs.ss,
        Reg::FSBASE => regs.fs_base,
        Reg::GSBASE => regs.gs_base,
        Reg::DS => regs.ds,
        Reg::ES => regs.es,
        Reg::FS => regs.fs,
        Reg::GS => regs.gs,
    }
}

fn set_value(regs: &mut user_regs_struct, reg: Reg, value: u64) {
    match reg {
        Reg::R15 => regs.r15 = value,
        Reg::R14 => regs.r14 = value,
        Reg::R13 => regs.r13 = value,
        Reg::R12 => regs.r12 = value,
        Reg::RBP => regs.rbp = value,
        Reg::RBX => regs.rbx = value,
        Reg::R11 => regs.r11 = value,
        Reg::R10 => regs.r10 = value,
        Reg::R9 => regs.r9 = value,
        Reg::R8 => regs.r8 = value,
        Reg::RAX => regs.rax = value,
        Reg::RCX => regs.rcx = value,
        Reg::RDX => regs.rdx = value,
        Reg::RSI => regs.rsi = value,
        Reg::RDI => regs.rdi = value,
        Reg::ORIGRAX => regs.orig_rax = value,
        Reg::RIP => regs.rip = value,
        Reg::CS => regs.cs = value,
        Reg::EFLAGS => regs.eflags = value,
        Reg::RSP => regs.rsp = value,
        Reg::SS => regs.ss = value,
        Reg::FSBASE => regs.fs_base = value,
        Reg::GSBASE => regs.gs_base = value,
        Reg::DS => regs.ds = value,
        Reg::ES => regs.es = value,
        Reg::FS => regs.fs = value,
        Reg::GS => regs.gs = value,
    }
}

pub fn read(pid: Pid, selector: &RegSelector) -> Result<u64, String> {
    let descriptor = descriptor_for(selector)?;
    let regs = ptrace::getregs(pid).map_err(|e| format!("failed to get regs: {}", e))?;
    Ok(value_of(&regs, descriptor.reg))
}

pub fn write(pid: Pid, selector: &RegSelector, value: u64) -> Result<(), String> {
    let descriptor = descriptor_for(selector)?;
    let mut regs = ptrace::getregs(pid).map_err(|e| format!("failed to get regs: {}", e))?;
    set_value(&mut regs, descriptor.reg, value);
    ptrace::setregs(pid, regs).map_err(|e| format!("failed to set regs: {}", e))
}

/// All registers in kernel dump order.
pub fn dump(pid: Pid) -> Result<Vec<(&'static str, u64)>, String> {
    let regs = ptrace::getregs(pid).map_err(|e| format!("failed to get regs: {}", e))?;
    Ok(DESCRIPTORS
        .iter()
        .map(|d| (d.name, value_of(&regs, d.reg)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_table_covers_kernel_dump() {
        assert_eq!(DESCRIPTORS.len(), 27);
        assert_eq!(DESCRIPTORS[0].name, "r15");
        assert_eq!(DESCRIPTORS[16].reg, Reg::RIP);
    }

    #[test]
    fn name_round_trip() {
        for descriptor in &DESCRIPTORS {
            assert_eq!(from_name(descriptor.name), Some(descriptor.reg));
            assert_eq!(name_of(descriptor.reg), descriptor.name);
        }
        assert_eq!(from_name("xyz"), None);
    }

    #[test]
    fn dwarf_ids_follow_the_abi() {
        let by_dwarf = |id| {
            descriptor_for(&RegSelector::Dwarf(id))
                .map(|d| d.name)
                .unwrap()
        };
        assert_eq!(by_dwarf(0), "rax");
        assert_eq!(by_dwarf(5), "rdi");
        assert_eq!(by_dwarf(6), "rbp");
        assert_eq!(by_dwarf(7), "rsp");
        assert!(descriptor_for(&RegSelector::Dwarf(-1)).is_err());
    }

    #[test]
    fn dwarf_ids_are_unique() {
        for (i, a) in DESCRIPTORS.iter().enumerate() {
            for b in &DESCRIPTORS[i + 1..] {
                if a.dwarf_id >= 0 {
                    assert_ne!(a.dwarf_id, b.dwarf_id, "{} vs {}", a.name, b.name);
                }
            }
        }
    }
}
