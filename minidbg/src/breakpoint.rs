use nix::unistd::Pid;

use crate::memory;

const INT3_OPCODE: u8 = 0xCC;

pub struct Breakpoint {
    pid: Pid,
    addr: u64,
    enabled: bool,
    saved_byte: Option<u8>,
}

impl Breakpoint {
    pub fn new(pid: Pid, addr: u64) -> Breakpoint {
        Breakpoint {
            pid,
            addr,
            enabled: false,
            saved_byte: None,
        }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Arms the breakpoint: saves the byte at `addr` and replaces it with
    /// the trap opcode. Memory I/O is word-granular, so only the low byte
    /// of the word is swapped.
    pub fn enable(&mut self) -> Result<(), String> {
        if self.enabled {
            return Ok(());
        }

        let word = memory::peek(self.pid, self.addr)
            .map_err(|e| format!("failed to peek instruction: {}", e))?;
        self.saved_byte = Some((word & 0xFF) as u8);
        memory::poke(self.pid, self.addr, patch_low_byte(word, INT3_OPCODE))
            .map_err(|e| format!("failed to poke breakpoint instruction: {}", e))?;
        self.enabled = true;

        Ok(())
    }

    /// Restores the saved byte at `addr`.
    pub fn disable(&mut self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }

        let saved = self
            .saved_byte
            .ok_or("byte of replaced instruction isn't saved")?;
        let word = memory::peek(self.pid, self.addr)
            .map_err(|e| format!("failed to peek instruction: {}", e))?;
        memory::poke(self.pid, self.addr, patch_low_byte(word, saved))
            .map_err(|e| format!("failed to restore instruction: {}", e))?;
        self.enabled = false;

        Ok(())
    }
}

fn patch_low_byte(word: u64, byte: u8) -> u64 {
    (word & !0xFF) | byte as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_replaces_only_the_low_byte() {
        let word = 0x1122334455667788;
        assert_eq!(patch_low_byte(word, INT3_OPCODE), 0x11223344556677CC);
        assert_eq!(patch_low_byte(word, 0x00), 0x1122334455667700);
    }

    #[test]
    fn patch_round_trips_the_saved_byte() {
        let word: u64 = 0xDEADBEEFCAFEBABE;
        let saved = (word & 0xFF) as u8;
        let armed = patch_low_byte(word, INT3_OPCODE);
        assert_eq!(patch_low_byte(armed, saved), word);
    }

    #[test]
    fn patch_is_idempotent() {
        let word = 0x0102030405060708;
        let once = patch_low_byte(word, INT3_OPCODE);
        assert_eq!(patch_low_byte(once, INT3_OPCODE), once);
    }
}
