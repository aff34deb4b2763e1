//! QuickJS runtime with sandbox limits

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hostbridge_protocol::LogLevel;
use rquickjs::{Context, Ctx, Runtime};
use tokio::runtime::Handle;
use tokio::sync::Notify;

use crate::bindings::{install_bindings, HostApi};
use crate::context::InstanceContext;
use crate::registry::HostOps;
use crate::{InstanceReport, ScriptConfig, ScriptError, ScriptScope, ScriptStatus};

/// Thread-safe cancellation flag that async waiters can park on
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Runs one script instance in its own sandbox
pub struct ScriptHost {
    config: ScriptConfig,
    cancellation: CancellationToken,
}

impl ScriptHost {
    pub fn new(config: ScriptConfig) -> Self {
        Self {
            config,
            cancellation: CancellationToken::new(),
        }
    }

    /// Get the cancellation token for this host
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Cancel a running script
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Execute a script chain against `context` and read out its report
    pub async fn execute(&self, scopes: &[ScriptScope], context: Arc<InstanceContext>) -> InstanceReport {
        tracing::info!(
            instance = %context.id(),
            name = %context.name(),
            scopes = scopes.len(),
            "Running script instance"
        );
        let ops: Arc<dyn HostOps> = context.clone();
        let result = self.run_scripts(scopes, ops).await;
        if let Err(e) = &result {
            context.log(LogLevel::Error, e.to_string());
        }
        context.finish(ScriptStatus::from(&result)).await
    }

    /// Execute scripts in order against `ops`, stopping at the first failure
    pub async fn run_scripts(&self, scopes: &[ScriptScope], ops: Arc<dyn HostOps>) -> Result<(), ScriptError> {
        let config = self.config.clone();
        let cancellation = self.cancellation.clone();
        let scopes = scopes.to_vec();
        let handle = Handle::current();

        // Run the scripts in a blocking task
        let mut task = tokio::task::spawn_blocking(move || {
            execute_scopes_sync(&scopes, &config, &cancellation, ops, handle)
        });

        // Wait with timeout
        let timeout = Duration::from_millis(self.config.timeout_ms);
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ScriptError::InitError(e.to_string())),
            Err(_) => {
                tracing::warn!(timeout_ms = self.config.timeout_ms, "Script timed out, cancelling");
                self.cancellation.cancel();
                // The sandbox must unwind before the recorded state is final
                if let Err(e) = task.await {
                    tracing::warn!(error = %e, "Script task failed while unwinding");
                }
                Err(ScriptError::Timeout)
            }
        }
    }
}

impl Default for ScriptHost {
    fn default() -> Self {
        Self::new(ScriptConfig::default())
    }
}

/// Tracks why a sandbox stopped
struct Limits<'a> {
    config: &'a ScriptConfig,
    cancellation: &'a CancellationToken,
    started: Instant,
}

impl Limits<'_> {
    fn timed_out(&self) -> bool {
        self.started.elapsed() > Duration::from_millis(self.config.timeout_ms)
    }

    /// Map a failure message to the error that best explains it
    fn classify(&self, message: String) -> ScriptError {
        if self.cancellation.is_cancelled() {
            ScriptError::Cancelled
        } else if self.timed_out() {
            ScriptError::Timeout
        } else if message.contains("out of memory") {
            ScriptError::MemoryLimit(self.config.memory_limit)
        } else {
            ScriptError::JsError(message)
        }
    }
}

/// Synchronous script execution (runs in blocking task)
fn execute_scopes_sync(
    scopes: &[ScriptScope],
    config: &ScriptConfig,
    cancellation: &CancellationToken,
    ops: Arc<dyn HostOps>,
    handle: Handle,
) -> Result<(), ScriptError> {
    let runtime = Runtime::new().map_err(|e| ScriptError::InitError(e.to_string()))?;
    runtime.set_memory_limit(config.memory_limit);
    runtime.set_max_stack_size(config.max_stack_size);

    let limits = Limits {
        config,
        cancellation,
        started: Instant::now(),
    };

    // Interrupt on cancellation or timeout
    let cancel = cancellation.clone();
    let started = limits.started;
    let timeout_ms = config.timeout_ms;
    runtime.set_interrupt_handler(Some(Box::new(move || {
        cancel.is_cancelled() || started.elapsed().as_millis() as u64 > timeout_ms
    })));

    for scope in scopes {
        if cancellation.is_cancelled() {
            return Err(ScriptError::Cancelled);
        }
        tracing::debug!(scope = %scope.scope, "Entering script scope");
        ops.enter_scope(&scope.scope);

        // Fresh globals per scope; instance state carries over through `ops`
        let context = Context::full(&runtime).map_err(|e| ScriptError::InitError(e.to_string()))?;
        let api = HostApi::new(Arc::clone(&ops), handle.clone(), cancellation.clone());

        context.with(|ctx| -> Result<(), ScriptError> {
            install_bindings(&ctx, api)?;
            ctx.eval::<(), _>(wrap_source(&scope.source))
                .map_err(|e| limits.classify(exception_message(&ctx, e)))
        })?;

        loop {
            match runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => return Err(limits.classify(e.to_string())),
            }
        }

        context.with(|ctx| -> Result<(), ScriptError> {
            let globals = ctx.globals();
            let done: bool = globals.get(DONE_FLAG).unwrap_or(false);
            let error: Option<String> = globals.get(ERROR_SLOT).unwrap_or(None);
            match (done, error) {
                (_, Some(message)) => Err(limits.classify(message)),
                (false, None) => Err(limits.classify(format!(
                    "script `{}` never settled (awaiting a promise nothing resolves)",
                    scope.scope
                ))),
                (true, None) => Ok(()),
            }
        })?;
    }

    Ok(())
}

const DONE_FLAG: &str = "__script_done";
const ERROR_SLOT: &str = "__script_error";

/// Run the user source as the body of an async function and record how it settled
fn wrap_source(source: &str) -> String {
    format!(
        r#"globalThis.{DONE_FLAG} = false;
(async () => {{
{source}
}})().then(
    () => {{ globalThis.{DONE_FLAG} = true; }},
    (e) => {{
        globalThis.{DONE_FLAG} = true;
        globalThis.{ERROR_SLOT} = e instanceof Error
            ? (e.kind ? `${{e.name}}(${{e.kind}}): ${{e.message}}` : `${{e.name}}: ${{e.message}}`)
            : String(e);
    }}
);"#
    )
}

/// Best-effort text of the exception pending on `ctx`
fn exception_message(ctx: &Ctx<'_>, err: rquickjs::Error) -> String {
    if !matches!(err, rquickjs::Error::Exception) {
        return err.to_string();
    }
    let thrown = ctx.catch();
    if let Some(obj) = thrown.as_object() {
        let name = obj.get::<_, Option<String>>("name").ok().flatten();
        let message = obj.get::<_, Option<String>>("message").ok().flatten();
        if let Some(message) = message {
            return match name {
                Some(name) => format!("{name}: {message}"),
                None => message,
            };
        }
    }
    thrown
        .as_string()
        .and_then(|s| s.to_string().ok())
        .unwrap_or_else(|| err.to_string())
}
