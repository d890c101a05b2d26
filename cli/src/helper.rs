use rustyline::{
    completion::{Completer, Pair},
    highlight::Highlighter,
    hint::Hinter,
    validate::Validator,
    Helper,
};

const COMPLETIONS: &[&str] = &[
    "continue",
    "break",
    "step",
    "next",
    "finish",
    "stepi",
    "status",
    "register dump",
    "register read",
    "register write",
    "memory read",
    "memory write",
    "variables",
    "backtrace",
    "symbol",
];

#[derive(Helper, Default)]
pub struct CliHelper;

impl Completer for CliHelper {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _: &rustyline::Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Self::Candidate>)> {
        let typed = &line[..pos];
        let mut candidates: Vec<Pair> = COMPLETIONS
            .iter()
            .filter(|command| command.starts_with(typed))
            .map(|command| Pair {
                display: command[pos..].to_owned(),
                replacement: command[pos..].to_owned(),
            })
            .collect();

        if let Some(prefix) =
            rustyline::completion::longest_common_prefix(&candidates).map(str::to_owned)
        {
            if !prefix.is_empty() {
                candidates.clear();
                candidates.push(Pair {
                    display: prefix.clone(),
                    replacement: prefix,
                });
            }
        }

        Ok((pos, candidates))
    }
}

impl Validator for CliHelper {}

impl Hinter for CliHelper {
    type Hint = String;
}

impl Highlighter for CliHelper {}
