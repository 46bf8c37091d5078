// src/command.rs

//! Structural command recognition for AOF replay (spec.md §4.3). The Loader
//! must understand `SELECT`/`MULTI`/`EXEC`/`DISCARD` itself; everything
//! else is an opaque argv handed to the [`crate::collaborators::Dispatcher`].
//! Grounded in the teacher's `aof_loader.rs`, which special-cases exactly
//! these four commands while otherwise dispatching blindly.

use crate::resp::CommandArgv;

/// The subset of commands the Loader must interpret structurally, plus the
/// catch-all for everything the Dispatcher collaborator owns.
#[derive(Debug, Clone)]
pub enum GenericCommand {
    Select(usize),
    Multi,
    Exec,
    Discard,
    Opaque(CommandArgv),
}

/// Classifies a decoded argv. Recognition is case-insensitive on the verb,
/// matching RESP command dispatch conventions generally.
pub fn classify(argv: CommandArgv) -> GenericCommand {
    let Some(verb) = argv.first() else {
        return GenericCommand::Opaque(argv);
    };

    if verb.eq_ignore_ascii_case(b"SELECT") {
        if let Some(db) = argv.get(1).and_then(|b| std::str::from_utf8(b).ok()).and_then(|s| s.parse().ok()) {
            return GenericCommand::Select(db);
        }
        return GenericCommand::Opaque(argv);
    }
    if verb.eq_ignore_ascii_case(b"MULTI") {
        return GenericCommand::Multi;
    }
    if verb.eq_ignore_ascii_case(b"EXEC") {
        return GenericCommand::Exec;
    }
    if verb.eq_ignore_ascii_case(b"DISCARD") {
        return GenericCommand::Discard;
    }

    GenericCommand::Opaque(argv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn argv(words: &[&str]) -> CommandArgv {
        words.iter().map(|w| Bytes::copy_from_slice(w.as_bytes())).collect()
    }

    #[test]
    fn recognizes_select_case_insensitively() {
        match classify(argv(&["select", "3"])) {
            GenericCommand::Select(3) => {}
            other => panic!("expected Select(3), got {other:?}"),
        }
    }

    #[test]
    fn recognizes_transaction_markers() {
        assert!(matches!(classify(argv(&["MULTI"])), GenericCommand::Multi));
        assert!(matches!(classify(argv(&["EXEC"])), GenericCommand::Exec));
        assert!(matches!(classify(argv(&["DISCARD"])), GenericCommand::Discard));
    }

    #[test]
    fn falls_back_to_opaque() {
        let original = argv(&["SET", "k", "v"]);
        match classify(original.clone()) {
            GenericCommand::Opaque(a) => assert_eq!(a, original),
            other => panic!("expected Opaque, got {other:?}"),
        }
    }

    #[test]
    fn malformed_select_falls_back_to_opaque() {
        match classify(argv(&["SELECT", "not-a-number"])) {
            GenericCommand::Opaque(_) => {}
            other => panic!("expected Opaque for malformed SELECT, got {other:?}"),
        }
    }
}
