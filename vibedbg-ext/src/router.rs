//! Component G: the command router.
//!
//! Pattern-matches a normalized command to a typed handler and emits the
//! exact text to run against the debugger adapter, or a composite of
//! several. Routing is table-driven (REDESIGN FLAGS "dynamic command
//! dispatch") rather than a long chain of sequential string comparisons.
//!
//! Parse failures on a matched command's *argument* are not engine-level
//! errors: the routing decision itself succeeded, so they come back as
//! [`RouteResult::ArgumentError`] and the adapter is never invoked.

/// What the router decided to do with one normalized command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteResult {
    /// A typed handler matched. Run this exact text, bypassing the engine's
    /// dangerous-command denylist — the router itself is the vetting step
    /// for these (see DESIGN.md's resolution of the `.detach`/`.kill`
    /// denylist-vs-router open question).
    Dispatch(String),
    /// A typed handler matched but the argument didn't parse. Surfaces as
    /// output directly; the adapter is never invoked.
    ArgumentError(String),
    /// The fixed four-step deadlock-analysis composite: `(label, command)`
    /// pairs run in order and concatenated into one labeled report.
    Composite(Vec<(&'static str, String)>),
    /// Nothing matched; the engine runs the original text verbatim, subject
    /// to the full denylist.
    PassThrough,
}

/// Commands that take no further parsing: routing consists of recognizing
/// the leading token and running the original text as-is.
const SINGLE_TOKEN_COMMANDS: &[&str] = &[
    "k", "kn", "kl", "kp", "kv", // stack-trace family
    "~",                        // threads
    "!process", "!processes",   // processes
    "lm", "!modules",           // modules
    "r",                        // registers
    "g", "p", "t", "gu", "gh", "gn", // execution control
    "bl",                       // breakpoint listing
    ".detach", ".restart", ".kill",  // detach/restart/kill
    "!analyze",                 // analyze
];

/// The composite trigger for the deadlock-analysis report.
const DEADLOCK_COMMAND: &str = "!deadlock";

/// Routes one command. `normalized` is lower-cased and trimmed (the form
/// the engine normalizes to before routing); `original` is the untouched
/// text, preserved so a `Dispatch`/`PassThrough` result runs exactly what
/// the caller sent, casing and spacing included.
pub fn route(normalized: &str, original: &str) -> RouteResult {
    if normalized == DEADLOCK_COMMAND {
        return RouteResult::Composite(deadlock_steps());
    }

    let mut parts = normalized.splitn(2, char::is_whitespace);
    let head = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim();

    if SINGLE_TOKEN_COMMANDS.contains(&head) {
        return RouteResult::Dispatch(original.to_owned());
    }

    match head {
        "bp" => route_breakpoint_set(rest, original),
        "bc" | "bd" | "be" => route_breakpoint_id(head, rest),
        ".attach" => route_attach(rest),
        ".create" | ".dump" => RouteResult::Dispatch(original.to_owned()),
        "db" | "dd" | "dw" | "dq" => route_memory_display(head, rest),
        _ => RouteResult::PassThrough,
    }
}

/// True when `param` is a bare hex digit string, with or without a `0x`
/// prefix — the spec's "matches a hex prefix or starts with a hex digit".
fn looks_like_address(param: &str) -> bool {
    let digits = param.strip_prefix("0x").unwrap_or(param);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_hexdigit())
}

fn parse_hex_u64(param: &str) -> Option<u64> {
    let digits = param.strip_prefix("0x").unwrap_or(param);
    u64::from_str_radix(digits, 16).ok()
}

fn route_breakpoint_set(rest: &str, original: &str) -> RouteResult {
    if rest.is_empty() {
        return RouteResult::ArgumentError("Error: 'bp' requires an address or symbol".to_owned());
    }
    if looks_like_address(rest) {
        match parse_hex_u64(rest) {
            Some(_addr) => RouteResult::Dispatch(original.to_owned()),
            None => RouteResult::ArgumentError(format!("Error: invalid address '{rest}'")),
        }
    } else {
        // A symbol name: no further parsing, pass through as-is.
        RouteResult::Dispatch(original.to_owned())
    }
}

fn route_breakpoint_id(head: &str, rest: &str) -> RouteResult {
    match rest.parse::<u32>() {
        Ok(id) => RouteResult::Dispatch(format!("{head} {id}")),
        Err(_) => RouteResult::ArgumentError(format!(
            "Error: '{head}' requires a decimal breakpoint id, got '{rest}'"
        )),
    }
}

fn route_attach(rest: &str) -> RouteResult {
    match parse_hex_u64(rest) {
        Some(pid) => RouteResult::Dispatch(format!(".attach {pid:#x}")),
        None => RouteResult::ArgumentError(format!(
            "Error: '.attach' requires a hex pid, got '{rest}'"
        )),
    }
}

/// `db|dd|dw|dq <hex-addr> [L<hex-count>]`. Default count is `0x100`; for
/// `dw` the count is doubled, for `dq` multiplied by eight, per the spec's
/// router rule (recorded verbatim; see DESIGN.md for the reasoning).
fn route_memory_display(head: &str, rest: &str) -> RouteResult {
    let mut parts = rest.splitn(2, char::is_whitespace);
    let addr_tok = parts.next().unwrap_or("");
    let count_tok = parts.next().unwrap_or("").trim();

    let Some(addr) = parse_hex_u64(addr_tok) else {
        return RouteResult::ArgumentError(format!(
            "Error: '{head}' requires a hex address, got '{addr_tok}'"
        ));
    };

    let base_count = if count_tok.is_empty() {
        0x100
    } else {
        match count_tok
            .strip_prefix('l')
            .or_else(|| count_tok.strip_prefix('L'))
            .and_then(|c| u64::from_str_radix(c, 16).ok())
        {
            Some(c) => c,
            None => {
                return RouteResult::ArgumentError(format!(
                    "Error: '{head}' has a malformed count '{count_tok}'"
                ))
            }
        }
    };

    let count = match head {
        "dw" => base_count * 2,
        "dq" => base_count * 8,
        _ => base_count,
    };

    RouteResult::Dispatch(format!("{head} {addr:#x} L{count:#x}"))
}

fn deadlock_steps() -> Vec<(&'static str, String)> {
    vec![
        ("threads", "~".to_owned()),
        ("all thread stacks", "~*k".to_owned()),
        ("locks", "!locks".to_owned()),
        ("critical sections", "!critsec".to_owned()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_token_commands_dispatch_verbatim() {
        assert_eq!(route("k", "K"), RouteResult::Dispatch("K".to_owned()));
        assert_eq!(
            route(".detach", ".detach"),
            RouteResult::Dispatch(".detach".to_owned())
        );
    }

    #[test]
    fn breakpoint_by_symbol_dispatches_original_text() {
        assert_eq!(
            route("bp main", "bp main"),
            RouteResult::Dispatch("bp main".to_owned())
        );
    }

    #[test]
    fn breakpoint_by_address_dispatches_original_text() {
        assert_eq!(
            route("bp 0x7ffaa120", "bp 0x7ffaa120"),
            RouteResult::Dispatch("bp 0x7ffaa120".to_owned())
        );
    }

    #[test]
    fn breakpoint_missing_argument_is_an_argument_error() {
        assert!(matches!(route("bp", "bp"), RouteResult::ArgumentError(_)));
    }

    #[test]
    fn breakpoint_clear_with_malformed_id_is_an_argument_error() {
        match route("bc abc", "bc abc") {
            RouteResult::ArgumentError(msg) => assert!(msg.contains("abc")),
            other => panic!("expected ArgumentError, got {other:?}"),
        }
    }

    #[test]
    fn breakpoint_clear_with_decimal_id_dispatches() {
        assert_eq!(
            route("bc 3", "bc 3"),
            RouteResult::Dispatch("bc 3".to_owned())
        );
    }

    #[test]
    fn attach_requires_hex_pid() {
        assert!(matches!(
            route(".attach zz", ".attach zz"),
            RouteResult::ArgumentError(_)
        ));
        assert_eq!(
            route(".attach 1a2b", ".attach 1a2b"),
            RouteResult::Dispatch(".attach 0x1a2b".to_owned())
        );
    }

    #[test]
    fn create_and_dump_pass_path_through() {
        assert_eq!(
            route(".create c:\\a.exe", ".create c:\\a.exe"),
            RouteResult::Dispatch(".create c:\\a.exe".to_owned())
        );
        assert_eq!(
            route(".dump c:\\a.dmp", ".dump c:\\a.dmp"),
            RouteResult::Dispatch(".dump c:\\a.dmp".to_owned())
        );
    }

    #[test]
    fn memory_display_defaults_count_for_db() {
        assert_eq!(
            route("db 1000", "db 1000"),
            RouteResult::Dispatch("db 0x1000 L0x100".to_owned())
        );
    }

    #[test]
    fn memory_display_doubles_count_for_dw() {
        assert_eq!(
            route("dw 1000 l10", "dw 1000 l10"),
            RouteResult::Dispatch("dw 0x1000 L0x20".to_owned())
        );
    }

    #[test]
    fn memory_display_multiplies_count_by_eight_for_dq() {
        assert_eq!(
            route("dq 1000", "dq 1000"),
            RouteResult::Dispatch("dq 0x1000 L0x800".to_owned())
        );
    }

    #[test]
    fn memory_display_rejects_non_hex_address() {
        assert!(matches!(
            route("dd zz", "dd zz"),
            RouteResult::ArgumentError(_)
        ));
    }

    #[test]
    fn unknown_command_falls_through() {
        assert_eq!(route("?foo", "?foo"), RouteResult::PassThrough);
    }

    #[test]
    fn deadlock_composite_runs_four_labeled_steps() {
        match route(DEADLOCK_COMMAND, DEADLOCK_COMMAND) {
            RouteResult::Composite(steps) => assert_eq!(steps.len(), 4),
            other => panic!("expected Composite, got {other:?}"),
        }
    }
}
