//! Build plan language.
//!
//! A plan is an ordered list of statements, one per logical line:
//!
//! ```text
//! from debian:bookworm
//! run apt-get update && \
//!     apt-get install -y curl
//! set uid = getuid nobody
//! with_user nobody {
//!   run touch /tmp/owned-by-${uid}
//! }
//! workdir /app
//! copy ./src /app/src
//! cmd ["/app/src/start"]
//! ```
//!
//! Verbs form a closed set ([`Verb`]); each parsed statement is a tagged
//! [`Step`] carrying validated arguments. Unknown and omitted verbs are
//! rejected at parse time.

pub mod parser;

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use box_core::error::{BoxError, Result};
use serde::Serialize;

pub use parser::{parse_source, Parsed};

/// Every verb the evaluator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    From,
    Run,
    Copy,
    Workdir,
    User,
    Env,
    Entrypoint,
    Cmd,
    Expose,
    Label,
    Tag,
    Inside,
    WithUser,
    Set,
    GetUid,
    GetGid,
    Read,
    GetEnv,
}

impl Verb {
    pub const ALL: [Verb; 18] = [
        Verb::From,
        Verb::Run,
        Verb::Copy,
        Verb::Workdir,
        Verb::User,
        Verb::Env,
        Verb::Entrypoint,
        Verb::Cmd,
        Verb::Expose,
        Verb::Label,
        Verb::Tag,
        Verb::Inside,
        Verb::WithUser,
        Verb::Set,
        Verb::GetUid,
        Verb::GetGid,
        Verb::Read,
        Verb::GetEnv,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Verb::From => "from",
            Verb::Run => "run",
            Verb::Copy => "copy",
            Verb::Workdir => "workdir",
            Verb::User => "user",
            Verb::Env => "env",
            Verb::Entrypoint => "entrypoint",
            Verb::Cmd => "cmd",
            Verb::Expose => "expose",
            Verb::Label => "label",
            Verb::Tag => "tag",
            Verb::Inside => "inside",
            Verb::WithUser => "with_user",
            Verb::Set => "set",
            Verb::GetUid => "getuid",
            Verb::GetGid => "getgid",
            Verb::Read => "read",
            Verb::GetEnv => "getenv",
        }
    }

    /// Case-insensitive lookup.
    pub fn from_name(name: &str) -> Option<Verb> {
        let lower = name.to_ascii_lowercase();
        Verb::ALL.iter().copied().find(|v| v.name() == lower)
    }

    /// Read-only helpers producing a value instead of an image.
    pub fn is_query(&self) -> bool {
        matches!(self, Verb::GetUid | Verb::GetGid | Verb::Read | Verb::GetEnv)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The verbs a particular evaluator accepts (everything minus `--omit`).
#[derive(Debug, Clone, Default)]
pub struct VerbSet {
    omitted: HashSet<Verb>,
}

impl VerbSet {
    pub fn all() -> Self {
        Self::default()
    }

    /// Build from omitted verb names. Unknown names are a configuration error.
    pub fn omitting<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut omitted = HashSet::new();
        for name in names {
            let name = name.as_ref();
            let verb = Verb::from_name(name).ok_or_else(|| {
                BoxError::ConfigError(format!("Cannot omit unknown verb '{name}'"))
            })?;
            omitted.insert(verb);
        }
        Ok(Self { omitted })
    }

    pub fn allows(&self, verb: Verb) -> bool {
        !self.omitted.contains(&verb)
    }
}

/// Read-only query against the current image or the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "query", rename_all = "snake_case")]
pub enum Query {
    /// Numeric uid of a user from `/etc/passwd`
    GetUid { user: String },
    /// Numeric gid of a group from `/etc/group`
    GetGid { group: String },
    /// Content of a file in the image
    Read { path: String },
    /// Host environment variable, empty when unset
    GetEnv { name: String },
}

impl Query {
    pub fn verb(&self) -> Verb {
        match self {
            Query::GetUid { .. } => Verb::GetUid,
            Query::GetGid { .. } => Verb::GetGid,
            Query::Read { .. } => Verb::Read,
            Query::GetEnv { .. } => Verb::GetEnv,
        }
    }

    /// Whether the query reads the image being built.
    pub fn needs_image(&self) -> bool {
        !matches!(self, Query::GetEnv { .. })
    }

    pub fn argument(&self) -> &str {
        match self {
            Query::GetUid { user } => user,
            Query::GetGid { group } => group,
            Query::Read { path } => path,
            Query::GetEnv { name } => name,
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.verb(), self.argument())
    }
}

/// Right-hand side of `set`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Literal(String),
    Query(Query),
}

/// One verb invocation with its validated arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verb", rename_all = "snake_case")]
pub enum Step {
    From { image: String },
    Run { exec: Vec<String> },
    Copy { src: String, dst: String },
    Workdir { path: String },
    User { user: String },
    Env { key: String, value: String },
    Entrypoint { exec: Vec<String> },
    Cmd { exec: Vec<String> },
    Expose { port: String },
    Label { key: String, value: String },
    Tag { name: String },
    Inside { dir: String, body: Vec<Statement> },
    WithUser { user: String, body: Vec<Statement> },
    Set { name: String, value: Expr },
    Query(Query),
}

impl Step {
    pub fn verb(&self) -> Verb {
        match self {
            Step::From { .. } => Verb::From,
            Step::Run { .. } => Verb::Run,
            Step::Copy { .. } => Verb::Copy,
            Step::Workdir { .. } => Verb::Workdir,
            Step::User { .. } => Verb::User,
            Step::Env { .. } => Verb::Env,
            Step::Entrypoint { .. } => Verb::Entrypoint,
            Step::Cmd { .. } => Verb::Cmd,
            Step::Expose { .. } => Verb::Expose,
            Step::Label { .. } => Verb::Label,
            Step::Tag { .. } => Verb::Tag,
            Step::Inside { .. } => Verb::Inside,
            Step::WithUser { .. } => Verb::WithUser,
            Step::Set { .. } => Verb::Set,
            Step::Query(q) => q.verb(),
        }
    }

    /// Steps that produce a new image and go through the step cache.
    pub fn is_cacheable(&self) -> bool {
        matches!(
            self,
            Step::Run { .. }
                | Step::Copy { .. }
                | Step::Workdir { .. }
                | Step::User { .. }
                | Step::Env { .. }
                | Step::Entrypoint { .. }
                | Step::Cmd { .. }
                | Step::Expose { .. }
                | Step::Label { .. }
        )
    }

    /// Number of leaf steps, counting block bodies.
    pub fn leaf_count(&self) -> usize {
        match self {
            Step::Inside { body, .. } | Step::WithUser { body, .. } => {
                body.iter().map(|s| s.step.leaf_count()).sum()
            }
            _ => 1,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let upper = self.verb().name().to_uppercase();
        match self {
            Step::From { image } => write!(f, "{upper} {image}"),
            Step::Run { exec } => write!(f, "{upper} {}", display_exec(exec)),
            Step::Copy { src, dst } => write!(f, "{upper} {src} {dst}"),
            Step::Workdir { path } => write!(f, "{upper} {path}"),
            Step::User { user } => write!(f, "{upper} {user}"),
            Step::Env { key, value } => write!(f, "{upper} {key}={value}"),
            Step::Entrypoint { exec } | Step::Cmd { exec } => write!(f, "{upper} {exec:?}"),
            Step::Expose { port } => write!(f, "{upper} {port}"),
            Step::Label { key, value } => write!(f, "{upper} {key}={value}"),
            Step::Tag { name } => write!(f, "{upper} {name}"),
            Step::Inside { dir, .. } => write!(f, "{upper} {dir}"),
            Step::WithUser { user, .. } => write!(f, "{upper} {user}"),
            Step::Set { name, value } => match value {
                Expr::Literal(v) => write!(f, "{upper} {name} = {v}"),
                Expr::Query(q) => write!(f, "{upper} {name} = {q}"),
            },
            Step::Query(q) => write!(f, "{}", q.to_string().to_uppercase()),
        }
    }
}

/// Shell-form commands print as the command itself.
fn display_exec(exec: &[String]) -> String {
    match exec {
        [sh, flag, cmd] if sh == "/bin/sh" && flag == "-c" => cmd.clone(),
        _ => format!("{exec:?}"),
    }
}

/// A step and the source line it started on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Statement {
    pub line: usize,
    pub step: Step,
}

/// Parsed plan: statements in source order. Never mutated after load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    statements: Vec<Statement>,
}

impl BuildPlan {
    pub fn new(statements: Vec<Statement>) -> Self {
        Self { statements }
    }

    /// Parse a complete plan. Input ending mid-statement is a parse error.
    pub fn parse(source: &str, verbs: &VerbSet) -> Result<Self> {
        match parse_source(source, verbs)? {
            Parsed::Complete(plan) => Ok(plan),
            Parsed::Incomplete => Err(BoxError::parse(
                source.lines().count().max(1),
                "Unexpected end of input (unfinished statement or block)",
            )),
        }
    }

    /// Parse a plan from a file path.
    pub fn from_file(path: &Path, verbs: &VerbSet) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BoxError::ConfigError(format!(
                "Failed to read plan at {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content, verbs)
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Leaf steps across the plan, used for `Step i/n` numbering.
    pub fn step_count(&self) -> usize {
        self.statements.iter().map(|s| s.step.leaf_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_round_trip_names() {
        for verb in Verb::ALL {
            assert_eq!(Verb::from_name(verb.name()), Some(verb));
        }
        assert_eq!(Verb::from_name("FROM"), Some(Verb::From));
        assert_eq!(Verb::from_name("With_User"), Some(Verb::WithUser));
        assert_eq!(Verb::from_name("flatten"), None);
    }

    #[test]
    fn test_verb_set_omitting() {
        let verbs = VerbSet::omitting(&["run", "GETENV"]).unwrap();
        assert!(!verbs.allows(Verb::Run));
        assert!(!verbs.allows(Verb::GetEnv));
        assert!(verbs.allows(Verb::From));
    }

    #[test]
    fn test_verb_set_omitting_unknown() {
        let err = VerbSet::omitting(&["frobnicate"]).unwrap_err();
        assert!(matches!(err, BoxError::ConfigError(_)));
        assert!(err.to_string().contains("frobnicate"));
    }

    #[test]
    fn test_step_display() {
        let run = Step::Run {
            exec: vec!["/bin/sh".into(), "-c".into(), "apt-get update".into()],
        };
        assert_eq!(run.to_string(), "RUN apt-get update");

        let run = Step::Run {
            exec: vec!["echo".into(), "hi".into()],
        };
        assert_eq!(run.to_string(), r#"RUN ["echo", "hi"]"#);

        let q = Step::Query(Query::GetUid {
            user: "alice".into(),
        });
        assert_eq!(q.to_string(), "GETUID ALICE");
    }

    #[test]
    fn test_step_count_includes_blocks() {
        let plan = BuildPlan::new(vec![
            Statement {
                line: 1,
                step: Step::From {
                    image: "alpine".into(),
                },
            },
            Statement {
                line: 2,
                step: Step::Inside {
                    dir: "/tmp".into(),
                    body: vec![
                        Statement {
                            line: 3,
                            step: Step::Run {
                                exec: vec!["true".into()],
                            },
                        },
                        Statement {
                            line: 4,
                            step: Step::Run {
                                exec: vec!["false".into()],
                            },
                        },
                    ],
                },
            },
        ]);
        assert_eq!(plan.step_count(), 3);
        assert_eq!(plan.statements().len(), 2);
    }

    #[test]
    fn test_cacheable_steps() {
        assert!(Step::Env {
            key: "A".into(),
            value: "b".into()
        }
        .is_cacheable());
        assert!(!Step::From {
            image: "alpine".into()
        }
        .is_cacheable());
        assert!(!Step::Tag { name: "x".into() }.is_cacheable());
    }
}
