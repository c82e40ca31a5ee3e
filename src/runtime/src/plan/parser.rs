//! Plan parser.
//!
//! Turns plan source into statements. Handles line continuations (`\`),
//! comments, shell and JSON (exec) forms, and `{ ... }` blocks. Input that
//! stops mid-statement is reported as [`Parsed::Incomplete`] so an
//! interactive caller can ask for more.

use box_core::error::{BoxError, Result};

use super::{BuildPlan, Expr, Query, Statement, Step, Verb, VerbSet};

/// Outcome of parsing a chunk of source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    Complete(BuildPlan),
    /// Ends inside a continuation, a quote, a JSON array or an open block.
    Incomplete,
}

impl Parsed {
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Parsed::Incomplete)
    }
}

/// Parse plan source, distinguishing bad input from unfinished input.
pub fn parse_source(source: &str, verbs: &VerbSet) -> Result<Parsed> {
    let lines = match join_logical_lines(source) {
        Some(lines) => lines,
        None => return Ok(Parsed::Incomplete),
    };

    let mut stack = vec![Frame::root()];

    for (line_num, line) in lines {
        let trimmed = line.trim();

        // Skip empty lines and comments
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if trimmed == "}" {
            if stack.len() == 1 {
                return Err(BoxError::parse(line_num, "Unexpected '}' with no open block"));
            }
            if let Some(frame) = stack.pop() {
                let statement = frame.close();
                if let (Some(parent), Some(statement)) = (stack.last_mut(), statement) {
                    parent.body.push(statement);
                }
            }
            continue;
        }

        let parsed = parse_line(trimmed, line_num, verbs)?;
        match parsed {
            Line::Statement(statement) => {
                if let Some(frame) = stack.last_mut() {
                    frame.body.push(statement);
                }
            }
            Line::Open(line, header) => stack.push(Frame {
                header: Some((line, header)),
                body: Vec::new(),
            }),
        }
    }

    if stack.len() > 1 {
        return Ok(Parsed::Incomplete);
    }

    let body = stack.pop().map(|f| f.body).unwrap_or_default();
    Ok(Parsed::Complete(BuildPlan::new(body)))
}

#[derive(Debug)]
enum BlockHeader {
    Inside(String),
    WithUser(String),
}

struct Frame {
    header: Option<(usize, BlockHeader)>,
    body: Vec<Statement>,
}

impl Frame {
    fn root() -> Self {
        Self {
            header: None,
            body: Vec::new(),
        }
    }

    fn close(self) -> Option<Statement> {
        let (line, header) = self.header?;
        let step = match header {
            BlockHeader::Inside(dir) => Step::Inside {
                dir,
                body: self.body,
            },
            BlockHeader::WithUser(user) => Step::WithUser {
                user,
                body: self.body,
            },
        };
        Some(Statement { line, step })
    }
}

enum Line {
    Statement(Statement),
    Open(usize, BlockHeader),
}

/// Join physical lines into logical ones, each tagged with its first line
/// number. Returns `None` when the source ends mid-statement.
fn join_logical_lines(content: &str) -> Option<Vec<(usize, String)>> {
    let mut logical_lines = Vec::new();
    let mut current = String::new();
    let mut start = 0;
    let mut pending = false;

    for (idx, line) in content.lines().enumerate() {
        if !pending {
            start = idx + 1;
        }

        // A whole-line comment never continues, even with a trailing `\`.
        let comment = current.is_empty() && line.trim_start().starts_with('#');
        if let Some(stripped) = line.trim_end().strip_suffix('\\').filter(|_| !comment) {
            current.push_str(stripped.trim_end());
            current.push(' ');
            pending = true;
            continue;
        }

        current.push_str(line);
        if is_open(&current) {
            current.push('\n');
            pending = true;
            continue;
        }

        logical_lines.push((start, std::mem::take(&mut current)));
        pending = false;
    }

    if pending {
        None
    } else {
        Some(logical_lines)
    }
}

/// Whether a logical line still has an unterminated quote or, for exec-form
/// arguments, an unbalanced `[`.
fn is_open(text: &str) -> bool {
    let trimmed = text.trim_start();
    if trimmed.starts_with('#') {
        return false;
    }
    let (_, rest) = split_first_word(trimmed);
    let track_brackets = rest.starts_with('[');

    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in rest.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match quote {
            Some(q) => {
                if c == '\\' && q == '"' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\\' => escaped = true,
                '"' | '\'' => quote = Some(c),
                '[' if track_brackets => depth += 1,
                ']' if track_brackets => depth -= 1,
                _ => {}
            },
        }
    }

    quote.is_some() || depth > 0
}

/// Parse a single logical line into a statement or a block opener.
fn parse_line(line: &str, line_num: usize, verbs: &VerbSet) -> Result<Line> {
    let (keyword, rest) = split_first_word(line);
    let verb = lookup_verb(keyword, line_num, verbs)?;

    let step = match verb {
        Verb::Inside | Verb::WithUser => return parse_block_header(verb, rest, line_num),
        Verb::From => Step::From {
            image: single_arg(verb, rest, line_num)?,
        },
        Verb::Run => parse_run(rest, line_num)?,
        Verb::Copy => parse_copy(rest, line_num)?,
        Verb::Workdir => Step::Workdir {
            path: single_arg(verb, rest, line_num)?,
        },
        Verb::User => Step::User {
            user: single_arg(verb, rest, line_num)?,
        },
        Verb::Env => parse_env(rest, line_num)?,
        Verb::Entrypoint => Step::Entrypoint {
            exec: parse_exec(verb, rest, line_num)?,
        },
        Verb::Cmd => Step::Cmd {
            exec: parse_exec(verb, rest, line_num)?,
        },
        Verb::Expose => Step::Expose {
            port: single_arg(verb, rest, line_num)?,
        },
        Verb::Label => parse_label(rest, line_num)?,
        Verb::Tag => Step::Tag {
            name: single_arg(verb, rest, line_num)?,
        },
        Verb::Set => parse_set(rest, line_num, verbs)?,
        Verb::GetUid | Verb::GetGid | Verb::Read | Verb::GetEnv => {
            Step::Query(parse_query(verb, rest, line_num)?)
        }
    };

    Ok(Line::Statement(Statement {
        line: line_num,
        step,
    }))
}

fn lookup_verb(keyword: &str, line_num: usize, verbs: &VerbSet) -> Result<Verb> {
    let verb = Verb::from_name(keyword)
        .ok_or_else(|| BoxError::parse(line_num, format!("Unknown verb '{keyword}'")))?;
    if !verbs.allows(verb) {
        return Err(BoxError::parse(
            line_num,
            format!("Verb '{verb}' is not available (omitted)"),
        ));
    }
    Ok(verb)
}

/// Split a string into the first word and the rest.
fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

// --- Individual verb parsers ---

fn parse_block_header(verb: Verb, rest: &str, line_num: usize) -> Result<Line> {
    let arg = rest.strip_suffix('{').ok_or_else(|| {
        BoxError::parse(
            line_num,
            format!("{verb} opens a block: {verb} <argument> {{"),
        )
    })?;
    let arg = single_arg(verb, arg.trim(), line_num)?;
    let header = match verb {
        Verb::Inside => BlockHeader::Inside(arg),
        _ => BlockHeader::WithUser(arg),
    };
    Ok(Line::Open(line_num, header))
}

fn single_arg(verb: Verb, rest: &str, line_num: usize) -> Result<String> {
    if rest.is_empty() {
        return Err(BoxError::parse(
            line_num,
            format!("{verb} requires an argument"),
        ));
    }
    if !is_quoted(rest) && rest.split_whitespace().count() > 1 {
        return Err(BoxError::parse(
            line_num,
            format!("{verb} takes exactly one argument, got '{rest}'"),
        ));
    }
    Ok(unquote(rest))
}

fn parse_run(rest: &str, line_num: usize) -> Result<Step> {
    Ok(Step::Run {
        exec: parse_exec(Verb::Run, rest, line_num)?,
    })
}

/// Exec form (`["a", "b"]`) or shell form wrapped in `/bin/sh -c`.
fn parse_exec(verb: Verb, rest: &str, line_num: usize) -> Result<Vec<String>> {
    if rest.is_empty() {
        return Err(BoxError::parse(
            line_num,
            format!("{verb} requires a command"),
        ));
    }

    if rest.starts_with('[') {
        let exec = parse_json_array(rest, line_num)?;
        if exec.is_empty() {
            return Err(BoxError::parse(
                line_num,
                format!("{verb} requires a non-empty command"),
            ));
        }
        Ok(exec)
    } else {
        Ok(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            rest.to_string(),
        ])
    }
}

fn parse_copy(rest: &str, line_num: usize) -> Result<Step> {
    let parts: Vec<&str> = rest.split_whitespace().collect();
    if parts.len() != 2 {
        return Err(BoxError::parse(
            line_num,
            "copy requires a source and a destination",
        ));
    }
    Ok(Step::Copy {
        src: unquote(parts[0]),
        dst: unquote(parts[1]),
    })
}

fn parse_env(rest: &str, line_num: usize) -> Result<Step> {
    if rest.is_empty() {
        return Err(BoxError::parse(line_num, "env requires a key and value"));
    }

    // KEY=VALUE (or KEY="VALUE") and KEY VALUE
    let (key, value) = match (rest.find('='), rest.find(char::is_whitespace)) {
        (Some(eq), None) => (&rest[..eq], unquote(&rest[eq + 1..])),
        (Some(eq), Some(space)) if eq < space => (&rest[..eq], unquote(&rest[eq + 1..])),
        _ => {
            let (key, value) = split_first_word(rest);
            (key, unquote(value))
        }
    };

    if key.is_empty() {
        return Err(BoxError::parse(line_num, "env requires a non-empty key"));
    }
    Ok(Step::Env {
        key: key.to_string(),
        value,
    })
}

fn parse_label(rest: &str, line_num: usize) -> Result<Step> {
    if rest.is_empty() {
        return Err(BoxError::parse(line_num, "label requires key=value"));
    }

    let (key, value) = match rest.find('=') {
        Some(eq) => (unquote(&rest[..eq]), unquote(&rest[eq + 1..])),
        None => {
            let (key, value) = split_first_word(rest);
            (key.to_string(), unquote(value))
        }
    };
    if key.is_empty() {
        return Err(BoxError::parse(line_num, "label requires a non-empty key"));
    }
    Ok(Step::Label { key, value })
}

fn parse_set(rest: &str, line_num: usize, verbs: &VerbSet) -> Result<Step> {
    let (name, expr) = rest
        .split_once('=')
        .ok_or_else(|| BoxError::parse(line_num, "set requires NAME = value"))?;
    let name = name.trim();
    if !is_identifier(name) {
        return Err(BoxError::parse(
            line_num,
            format!("Invalid variable name '{name}'"),
        ));
    }

    let expr = expr.trim();
    let (word, arg) = split_first_word(expr);
    let value = match Verb::from_name(word).filter(Verb::is_query) {
        Some(verb) => {
            let verb = lookup_verb(verb.name(), line_num, verbs)?;
            Expr::Query(parse_query(verb, arg, line_num)?)
        }
        None => Expr::Literal(unquote(expr)),
    };

    Ok(Step::Set {
        name: name.to_string(),
        value,
    })
}

fn parse_query(verb: Verb, rest: &str, line_num: usize) -> Result<Query> {
    let arg = single_arg(verb, rest, line_num)?;
    Ok(match verb {
        Verb::GetUid => Query::GetUid { user: arg },
        Verb::GetGid => Query::GetGid { group: arg },
        Verb::Read => Query::Read { path: arg },
        _ => Query::GetEnv { name: arg },
    })
}

// --- Helpers ---

/// Parse a JSON array string like `["a", "b", "c"]` into a Vec<String>.
fn parse_json_array(s: &str, line_num: usize) -> Result<Vec<String>> {
    serde_json::from_str(s)
        .map_err(|e| BoxError::parse(line_num, format!("Invalid JSON array '{s}': {e}")))
}

fn is_quoted(s: &str) -> bool {
    s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
}

/// Remove surrounding quotes from a string.
fn unquote(s: &str) -> String {
    let s = s.trim();
    if is_quoted(s) {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
