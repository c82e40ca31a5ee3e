//! Interactive session: read a line, evaluate it, print the result.
//!
//! A reader task delivers one line at a time over a single-slot channel and
//! waits for an acknowledgement before reading the next, so input is never
//! consumed ahead of evaluation. Each statement runs under its own
//! cancellation scope; an interrupt cancels that statement only.

use std::any::Any;
use std::io::Write;
use std::panic::AssertUnwindSafe;

use box_core::cancel::{CancelScope, CancellationCoordinator};
use box_core::continuation::Continuation;
use box_core::error::{BoxError, Result};
use box_core::log::BuildLogger;
use box_runtime::{Evaluator, EXECUTED};
use futures::FutureExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

pub const PROMPT: &str = "box> ";
pub const CONTINUATION_PROMPT: &str = "box*> ";

const BANNER: &str = r#"
Welcome to the box shell.

* Enter plan statements one at a time; "help" shows this message again.
* Type "reset" to start over from an empty image.
* Press Control+C to cancel a running statement.
* Press ^D or type "quit" or "exit" to leave.
"#;

const EXIT_HINT: &str = r#"You can press ^D or type "quit" or "exit" to exit the shell"#;

/// Builds a fresh evaluator, on start and on `reset`.
pub type EvaluatorFactory = Box<dyn Fn() -> Result<Box<dyn Evaluator>> + Send>;

/// How the session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    /// `quit`, `exit` or end of input
    Quit,
    /// The evaluator panicked; the message is the panic payload
    Fault(String),
}

enum Input {
    Line(String),
    Eof,
    Failed(std::io::Error),
}

enum Event {
    Input(Input),
    Interrupt,
}

/// Drives one evaluator through the incremental protocol.
pub struct Session {
    evaluator: Box<dyn Evaluator>,
    factory: EvaluatorFactory,
    coordinator: CancellationCoordinator,
    logger: BuildLogger,
    out: Box<dyn Write + Send>,
    interrupts: mpsc::UnboundedReceiver<()>,
}

impl Session {
    pub fn new(
        factory: EvaluatorFactory,
        coordinator: CancellationCoordinator,
        logger: BuildLogger,
        out: Box<dyn Write + Send>,
        interrupts: mpsc::UnboundedReceiver<()>,
    ) -> Result<Self> {
        let evaluator = factory()?;
        Ok(Self {
            evaluator,
            factory,
            coordinator,
            logger,
            out,
            interrupts,
        })
    }

    /// Run until quit, end of input or an evaluator fault.
    ///
    /// The evaluator is closed on every way out, including a fault.
    pub async fn run<R>(mut self, reader: R) -> Result<SessionExit>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let (mut inputs, ack) = spawn_reader(reader);
        self.write(BANNER);
        self.write("\n");

        let mut continuation = Continuation::Baseline;
        loop {
            self.prompt(&continuation);

            let event = tokio::select! {
                input = inputs.recv() => Event::Input(input.unwrap_or(Input::Eof)),
                Some(()) = self.interrupts.recv() => Event::Interrupt,
            };

            let line = match event {
                Event::Interrupt => {
                    // The reader still owes us its line; no ack.
                    self.write("\n");
                    if continuation.is_baseline() {
                        self.logger.notice(EXIT_HINT);
                    } else {
                        self.logger.notice("Statement canceled.");
                        continuation = Continuation::Baseline;
                    }
                    continue;
                }
                Event::Input(Input::Eof) => {
                    self.write("\n");
                    self.shutdown().await;
                    return Ok(SessionExit::Quit);
                }
                Event::Input(Input::Failed(e)) => {
                    self.shutdown().await;
                    return Err(BoxError::IoError(e));
                }
                Event::Input(Input::Line(line)) => line,
            };

            if continuation.is_baseline() {
                match line.trim() {
                    "" => {
                        let _ = ack.send(()).await;
                        continue;
                    }
                    "quit" | "exit" => {
                        self.shutdown().await;
                        return Ok(SessionExit::Quit);
                    }
                    "help" => {
                        self.write(BANNER);
                        self.write("\n");
                        let _ = ack.send(()).await;
                        continue;
                    }
                    "reset" => {
                        if let Err(e) = self.reset().await {
                            self.logger.error(&e.to_string());
                            self.shutdown().await;
                            return Err(e);
                        }
                        let _ = ack.send(()).await;
                        continue;
                    }
                    _ => {}
                }
            }

            let pending = std::mem::take(&mut continuation);
            let scope = CancelScope::new();
            let registration = self.coordinator.register_scope(&scope);
            let outcome = {
                let eval = AssertUnwindSafe(self.evaluator.run_fragment(&line, pending, &scope))
                    .catch_unwind();
                tokio::pin!(eval);
                loop {
                    tokio::select! {
                        outcome = &mut eval => break outcome,
                        Some(()) = self.interrupts.recv() => {
                            self.coordinator.trigger();
                        }
                    }
                }
            };
            self.coordinator.deregister(registration);

            match outcome {
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(error = %message, "Evaluator panicked");
                    self.shutdown().await;
                    return Ok(SessionExit::Fault(message));
                }
                Ok(Ok(_)) => {
                    let value = &self.evaluator.last_result().value;
                    let value = if value.is_empty() { EXECUTED } else { value.as_str() };
                    self.logger.eval_response(value);
                }
                Ok(Err(BoxError::IncompleteStatement(next))) => continuation = next,
                Ok(Err(e)) if e.is_cancelled() => self.logger.notice("Statement canceled."),
                Ok(Err(e)) => self.logger.error(&e.to_string()),
            }

            let _ = ack.send(()).await;
        }
    }

    /// Replace the evaluator with a fresh one and release the old engine.
    async fn reset(&mut self) -> Result<()> {
        let fresh = (self.factory)()?;
        let mut old = std::mem::replace(&mut self.evaluator, fresh);
        if let Err(e) = old.close().await {
            tracing::warn!(error = %e, "Failed to release previous evaluator");
        }
        tracing::debug!("Session reset");
        Ok(())
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.evaluator.close().await {
            tracing::warn!(error = %e, "Failed to release evaluator");
        }
    }

    fn prompt(&mut self, continuation: &Continuation) {
        let prompt = if continuation.is_baseline() {
            PROMPT
        } else {
            CONTINUATION_PROMPT
        };
        self.write(prompt);
    }

    fn write(&mut self, text: &str) {
        let _ = self.out.write_all(text.as_bytes());
        let _ = self.out.flush();
    }
}

/// Read lines one at a time, waiting for an ack after each delivered line.
fn spawn_reader<R>(reader: R) -> (mpsc::Receiver<Input>, mpsc::Sender<()>)
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let (line_tx, line_rx) = mpsc::channel(1);
    let (ack_tx, mut ack_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        let mut lines = reader.lines();
        loop {
            let input = match lines.next_line().await {
                Ok(Some(line)) => Input::Line(line),
                Ok(None) => Input::Eof,
                Err(e) => Input::Failed(e),
            };
            let last = !matches!(input, Input::Line(_));
            if line_tx.send(input).await.is_err() || last {
                return;
            }
            if ack_rx.recv().await.is_none() {
                return;
            }
        }
    });

    (line_rx, ack_tx)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
