//! App supervisor: resolves the launch target, runs prep hooks, spawns and
//! observes the process tree, and tears everything down with graceful →
//! forceful escalation.

pub mod supervisor;
pub mod terminate;

use std::collections::BTreeMap;

pub use supervisor::{AppSupervisor, RunState};
pub use terminate::{collect_process_group, graceful_then_forceful};

/// Expand `$(VAR)` references in `input` against `env`; `$$` escapes a
/// literal `$`. Unknown variables expand to the empty string so no
/// unescaped `$(` survives. Lookup is case-insensitive on Windows,
/// preserving the stored case of the variable.
pub fn expand_env_vars(input: &str, env: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some('(') => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ')' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if closed {
                    if let Some(value) = lookup_env(env, &name) {
                        out.push_str(value);
                    }
                } else {
                    // Unterminated reference: keep the literal text
                    out.push('$');
                    out.push('(');
                    out.push_str(&name);
                }
            }
            _ => out.push('$'),
        }
    }
    out
}

fn lookup_env<'a>(env: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    if let Some(value) = env.get(name) {
        return Some(value);
    }
    if cfg!(windows) {
        return env
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_known_variables() {
        let env = env(&[("SUNSHINE_APP_NAME", "Rocket League")]);
        assert_eq!(
            expand_env_vars("--title $(SUNSHINE_APP_NAME)!", &env),
            "--title Rocket League!"
        );
    }

    #[test]
    fn unknown_variables_expand_to_nothing() {
        let out = expand_env_vars("x$(NOPE)y", &env(&[]));
        assert_eq!(out, "xy");
        assert!(!out.contains("$("));
    }

    #[test]
    fn dollar_dollar_is_a_literal_dollar() {
        assert_eq!(expand_env_vars("cost: $$5", &env(&[])), "cost: $5");
        assert_eq!(expand_env_vars("$$(NOT_A_VAR)", &env(&[])), "$(NOT_A_VAR)");
    }

    #[test]
    fn lone_dollar_passes_through() {
        assert_eq!(expand_env_vars("a$b", &env(&[])), "a$b");
        assert_eq!(expand_env_vars("trailing$", &env(&[])), "trailing$");
    }

    #[test]
    fn unterminated_reference_kept_verbatim() {
        assert_eq!(expand_env_vars("$(OPEN", &env(&[])), "$(OPEN");
    }
}
