//! User-facing build output.
//!
//! Diagnostics go through `tracing`; this logger prints what an operator
//! watching a build wants to see: steps, cached steps, `run` output, results.

use std::io::Write;
use std::sync::Arc;

use crossterm::style::Stylize;
use parking_lot::Mutex;

use crate::config::BuildConfig;

#[derive(Clone)]
enum Sink {
    Stdio,
    Buffer(Arc<Mutex<Vec<u8>>>),
}

/// Build progress printer, one per build.
#[derive(Clone)]
pub struct BuildLogger {
    name: String,
    prefixed: bool,
    color: bool,
    tty: bool,
    trim: bool,
    show_run: bool,
    sink: Sink,
}

impl BuildLogger {
    pub fn new(name: impl Into<String>, config: &BuildConfig) -> Self {
        Self {
            name: name.into(),
            prefixed: false,
            color: config.color,
            tty: config.tty,
            trim: config.trim,
            show_run: config.show_run,
            sink: Sink::Stdio,
        }
    }

    /// Plain logger for messages outside any build (e.g. `main`).
    pub fn plain(name: impl Into<String>, trim: bool) -> Self {
        Self {
            name: name.into(),
            prefixed: false,
            color: false,
            tty: false,
            trim,
            show_run: true,
            sink: Sink::Stdio,
        }
    }

    /// Logger writing into a shared buffer instead of stdout/stderr.
    pub fn buffered(name: impl Into<String>, config: &BuildConfig) -> (Self, Arc<Mutex<Vec<u8>>>) {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let mut logger = Self::new(name, config);
        logger.sink = Sink::Buffer(buf.clone());
        (logger, buf)
    }

    /// Prefix every line with the build name, for interleaved output.
    pub fn prefixed(mut self) -> Self {
        self.prefixed = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `Step 2/5: RUN apt-get update`
    pub fn step(&self, index: usize, total: usize, description: &str) {
        self.emit(false, &format!("Step {index}/{total}: {description}"), bold_head);
    }

    /// A statement evaluated outside a whole plan.
    pub fn exec(&self, description: &str) {
        self.emit(false, &format!("+++ Execute: {description}"), bold_head);
    }

    pub fn cached(&self, image: &str) {
        let line = format!(" ---> Cached {}", short_id(image));
        self.emit(false, &line, |s| s.cyan().to_string());
    }

    pub fn committed(&self, image: &str) {
        let line = format!(" ---> {}", short_id(image));
        self.emit(false, &line, |s| s.dark_grey().to_string());
    }

    /// One line of output from a `run` step.
    pub fn run_output(&self, line: &str) {
        if self.show_run {
            self.emit(false, &format!("  | {line}"), unstyled);
        }
    }

    /// Printable value of an evaluated statement.
    pub fn eval_response(&self, value: &str) {
        self.emit(false, &format!("=> {value}"), |s| s.green().to_string());
    }

    pub fn tag(&self, name: &str) {
        self.emit(false, &format!("+++ Tagged: {name}"), |s| s.yellow().to_string());
    }

    pub fn finish(&self, id: &str) {
        self.emit(false, &format!("+++ Finish: {id}"), |s| {
            s.green().bold().to_string()
        });
    }

    pub fn notice(&self, message: &str) {
        self.emit(false, message, unstyled);
    }

    pub fn error(&self, message: &str) {
        self.emit(true, &format!("+++ Error: {message}"), |s| s.red().to_string());
    }

    fn emit(&self, to_stderr: bool, text: &str, paint: Paint) {
        let width = if self.trim && self.tty {
            crossterm::terminal::size()
                .ok()
                .map(|(cols, _)| cols as usize)
        } else {
            None
        };
        let line = self.render(text, paint, width);

        match &self.sink {
            Sink::Stdio if to_stderr => {
                let _ = writeln!(std::io::stderr().lock(), "{line}");
            }
            Sink::Stdio => {
                let _ = writeln!(std::io::stdout().lock(), "{line}");
            }
            Sink::Buffer(buf) => {
                let mut buf = buf.lock();
                buf.extend_from_slice(line.as_bytes());
                buf.push(b'\n');
            }
        }
    }

    /// Prefix and trim the plain text, then colour what is left. The name
    /// prefix is never coloured.
    fn render(&self, text: &str, paint: Paint, width: Option<usize>) -> String {
        let prefix = if self.prefixed {
            format!("[{}] ", self.name)
        } else {
            String::new()
        };
        let line = format!("{prefix}{text}");
        let line = match width {
            Some(width) => trim_to_width(&line, width),
            None => line,
        };
        if !self.color {
            return line;
        }
        match line.strip_prefix(prefix.as_str()) {
            Some(body) => format!("{prefix}{}", paint(body)),
            None => paint(&line),
        }
    }
}

/// Colours a plain line after it has been trimmed.
type Paint = fn(&str) -> String;

fn unstyled(text: &str) -> String {
    text.to_string()
}

/// Bold up to and including the first `:`.
fn bold_head(text: &str) -> String {
    match text.find(':') {
        Some(i) => {
            let (head, rest) = text.split_at(i + 1);
            format!("{}{rest}", head.bold())
        }
        None => text.bold().to_string(),
    }
}

impl std::fmt::Debug for BuildLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildLogger")
            .field("name", &self.name)
            .field("color", &self.color)
            .field("tty", &self.tty)
            .field("trim", &self.trim)
            .finish()
    }
}

/// Strip an `algo:` prefix and shorten to 12 characters, docker style.
pub fn short_id(image: &str) -> &str {
    let id = image.split_once(':').map(|(_, rest)| rest).unwrap_or(image);
    if id.len() > 12 && id.chars().all(|c| c.is_ascii_hexdigit()) {
        &id[..12]
    } else {
        image
    }
}

/// Cut a line to `width` characters, marking the cut with `…`.
pub fn trim_to_width(line: &str, width: usize) -> String {
    if width == 0 || line.chars().count() <= width {
        return line.to_string();
    }
    let mut out: String = line.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}
