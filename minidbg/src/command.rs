const COMMANDS: &[&str] = &[
    "continue",
    "break",
    "step",
    "next",
    "finish",
    "stepi",
    "status",
    "register",
    "memory",
    "variables",
    "backtrace",
    "symbol",
];

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Command {
    Continue,
    Break(BreakTarget),
    Step,
    Next,
    Finish,
    StepInstruction,
    Status,
    RegisterDump,
    RegisterRead(String),
    RegisterWrite(String, u64),
    MemoryRead(u64),
    MemoryWrite(u64, u64),
    Variables,
    Backtrace,
    Symbol(String),
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum BreakTarget {
    Address(u64),
    SourceLine { file: String, line: u64 },
    Function(String),
}

/// Tokenizes on whitespace and dispatches on the first token. A keyword
/// is recognized by an exact match or by a unique prefix; an ambiguous
/// prefix is rejected with the candidate list.
pub fn parse(line: &str) -> Result<Command, String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let keyword = *tokens.first().ok_or("empty command")?;

    match resolve_keyword(keyword, COMMANDS)? {
        "continue" => Ok(Command::Continue),
        "break" => {
            let target = *tokens.get(1).ok_or("break: missing location")?;
            Ok(Command::Break(parse_break_target(target)?))
        }
        "step" => Ok(Command::Step),
        "next" => Ok(Command::Next),
        "finish" => Ok(Command::Finish),
        "stepi" => Ok(Command::StepInstruction),
        "status" => Ok(Command::Status),
        "register" => parse_register(&tokens),
        "memory" => parse_memory(&tokens),
        "variables" => Ok(Command::Variables),
        "backtrace" => Ok(Command::Backtrace),
        "symbol" => {
            let name = *tokens.get(1).ok_or("symbol: missing name")?;
            Ok(Command::Symbol(name.to_owned()))
        }
        _ => unreachable!("resolve_keyword returns members of its set"),
    }
}

fn parse_register(tokens: &[&str]) -> Result<Command, String> {
    let operation = *tokens.get(1).ok_or("register: missing operation")?;
    match resolve_keyword(operation, &["dump", "read", "write"])? {
        "dump" => Ok(Command::RegisterDump),
        "read" => {
            let name = *tokens.get(2).ok_or("register read: missing register name")?;
            Ok(Command::RegisterRead(name.to_owned()))
        }
        "write" => {
            let name = *tokens.get(2).ok_or("register write: missing register name")?;
            let value = *tokens.get(3).ok_or("register write: missing value")?;
            Ok(Command::RegisterWrite(name.to_owned(), parse_hex(value)?))
        }
        _ => unreachable!(),
    }
}

fn parse_memory(tokens: &[&str]) -> Result<Command, String> {
    let operation = *tokens.get(1).ok_or("memory: missing operation")?;
    let addr = parse_hex(*tokens.get(2).ok_or("memory: missing address")?)?;
    match resolve_keyword(operation, &["read", "write"])? {
        "read" => Ok(Command::MemoryRead(addr)),
        "write" => {
            let value = *tokens.get(3).ok_or("memory write: missing value")?;
            Ok(Command::MemoryWrite(addr, parse_hex(value)?))
        }
        _ => unreachable!(),
    }
}

fn parse_break_target(token: &str) -> Result<BreakTarget, String> {
    if token.starts_with("0x") {
        return Ok(BreakTarget::Address(parse_hex(token)?));
    }
    if let Some((file, line)) = token.split_once(':') {
        let line = line
            .parse::<u64>()
            .map_err(|e| format!("failed to parse source line number: {}", e))?;
        return Ok(BreakTarget::SourceLine { file: file.to_owned(), line });
    }
    Ok(BreakTarget::Function(token.to_owned()))
}

fn resolve_keyword<'a>(input: &str, set: &[&'a str]) -> Result<&'a str, String> {
    if let Some(exact) = set.iter().find(|keyword| **keyword == input) {
        return Ok(exact);
    }

    let matches: Vec<&str> = set
        .iter()
        .copied()
        .filter(|keyword| keyword.starts_with(input))
        .collect();
    match matches.len() {
        0 => Err(format!("unknown command: {}", input)),
        1 => Ok(matches[0]),
        _ => Err(format!(
            "ambiguous command {}: matches {}",
            input,
            matches.join(", ")
        )),
    }
}

fn parse_hex(token: &str) -> Result<u64, String> {
    let digits = token.strip_prefix("0x").unwrap_or(token);
    u64::from_str_radix(digits, 16).map_err(|e| format!("failed to parse hex value: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_prefixes_resolve() {
        assert_eq!(parse("c").unwrap(), Command::Continue);
        assert_eq!(parse("cont").unwrap(), Command::Continue);
        assert_eq!(parse("n").unwrap(), Command::Next);
        assert_eq!(parse("fin").unwrap(), Command::Finish);
        assert_eq!(parse("v").unwrap(), Command::Variables);
        assert_eq!(parse("bac").unwrap(), Command::Backtrace);
    }

    #[test]
    fn ambiguous_prefixes_are_rejected() {
        assert!(parse("s").is_err());
        assert!(parse("st").is_err());
        assert!(parse("ste").is_err());
        assert!(parse("b main").is_err());
    }

    #[test]
    fn exact_match_beats_longer_candidates() {
        assert_eq!(parse("step").unwrap(), Command::Step);
        assert_eq!(parse("stepi").unwrap(), Command::StepInstruction);
        assert_eq!(parse("status").unwrap(), Command::Status);
    }

    #[test]
    fn break_targets() {
        assert_eq!(
            parse("break 0x401126").unwrap(),
            Command::Break(BreakTarget::Address(0x401126))
        );
        assert_eq!(
            parse("break sort.c:42").unwrap(),
            Command::Break(BreakTarget::SourceLine { file: "sort.c".into(), line: 42 })
        );
        assert_eq!(
            parse("break main").unwrap(),
            Command::Break(BreakTarget::Function("main".into()))
        );
        assert!(parse("break sort.c:x").is_err());
        assert!(parse("break").is_err());
    }

    #[test]
    fn register_commands() {
        assert_eq!(parse("register dump").unwrap(), Command::RegisterDump);
        assert_eq!(parse("reg d").unwrap(), Command::RegisterDump);
        assert_eq!(
            parse("register read rax").unwrap(),
            Command::RegisterRead("rax".into())
        );
        assert_eq!(
            parse("register write rbx 0xFF").unwrap(),
            Command::RegisterWrite("rbx".into(), 0xFF)
        );
        assert!(parse("register").is_err());
        assert!(parse("register write rbx").is_err());
    }

    #[test]
    fn memory_commands() {
        assert_eq!(parse("memory read 0x400000").unwrap(), Command::MemoryRead(0x400000));
        assert_eq!(
            parse("memory write 0x400000 0xDEADBEEFCAFEBABE").unwrap(),
            Command::MemoryWrite(0x400000, 0xDEADBEEFCAFEBABE)
        );
        assert_eq!(parse("memory read 400000").unwrap(), Command::MemoryRead(0x400000));
        assert!(parse("memory peek 0x400000").is_err());
    }

    #[test]
    fn empty_and_unknown_lines_are_parse_failures() {
        assert!(parse("").is_err());
        assert!(parse("   ").is_err());
        assert!(parse("quit").is_err());
    }
}
