//! POSIX shell quoting for command lines sent to `sh -c` or over SSH

/// Quote one argument so a POSIX shell reads it back verbatim
pub fn quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"@%+=:,./_-".contains(&b));
    if plain {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Join an argument vector into a single shell command line
pub fn join<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_args_are_untouched() {
        assert_eq!(quote("tank/home@auto-2026"), "tank/home@auto-2026");
        assert_eq!(join(&["zfs", "send", "-P"]), "zfs send -P");
    }

    #[test]
    fn test_special_args_are_quoted() {
        assert_eq!(quote(""), "''");
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote("$HOME;rm"), "'$HOME;rm'");
    }
}
