//! Parse continuation carried between incremental evaluation calls.

/// How much of a not-yet-complete statement is buffered.
///
/// Returned by incremental evaluation and handed back on the next call.
/// `Baseline` means nothing is pending; `Pending` holds the source text
/// accumulated so far, which the next fragment is appended to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Continuation {
    #[default]
    Baseline,
    Pending(String),
}

impl Continuation {
    /// True when no partial statement is buffered.
    pub fn is_baseline(&self) -> bool {
        matches!(self, Continuation::Baseline)
    }

    /// Join a new fragment onto whatever is buffered.
    pub fn append(&self, fragment: &str) -> String {
        match self {
            Continuation::Baseline => fragment.to_string(),
            Continuation::Pending(buffered) => {
                let mut source = String::with_capacity(buffered.len() + fragment.len() + 1);
                source.push_str(buffered);
                if !buffered.ends_with('\n') {
                    source.push('\n');
                }
                source.push_str(fragment);
                source
            }
        }
    }

    /// The buffered text, if any.
    pub fn pending(&self) -> Option<&str> {
        match self {
            Continuation::Baseline => None,
            Continuation::Pending(buffered) => Some(buffered),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_baseline() {
        assert!(Continuation::default().is_baseline());
        assert_eq!(Continuation::default().pending(), None);
    }

    #[test]
    fn test_append_to_baseline() {
        assert_eq!(Continuation::Baseline.append("from alpine"), "from alpine");
    }

    #[test]
    fn test_append_to_pending() {
        let cont = Continuation::Pending("run echo \\".to_string());
        assert_eq!(cont.append("hello"), "run echo \\\nhello");
        assert!(!cont.is_baseline());
    }

    #[test]
    fn test_append_does_not_double_newline() {
        let cont = Continuation::Pending("inside /tmp {\n".to_string());
        assert_eq!(cont.append("}"), "inside /tmp {\n}");
    }
}
