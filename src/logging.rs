//! Logging infrastructure for deskpilot
//!
//! Logs to ~/.deskpilot/logs/ with one file per day and automatic cleanup.
//! Supports per-task context so concurrent session tasks tag their own lines.

use chrono::Local;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

static LOGGER: Mutex<Option<Logger>> = Mutex::new(None);
static TASK_LOG_CONTEXTS: OnceLock<Mutex<HashMap<String, LogContext>>> = OnceLock::new();

/// Logging context attached to the current task (or thread outside tokio)
#[derive(Default, Clone)]
pub struct LogContext {
    pub session: Option<String>,
    pub model: Option<String>,
}

thread_local! {
    static LOG_CONTEXT: RefCell<LogContext> = RefCell::new(LogContext::default());
}

/// Tag the current task with a session id
pub fn set_session(session: &str) {
    if with_task_context_mut(|ctx| {
        ctx.session = Some(session.to_string());
    }) {
        return;
    }

    LOG_CONTEXT.with(|c| {
        c.borrow_mut().session = Some(session.to_string());
    });
}

/// Tag the current task with the model in use
pub fn set_model(model: &str) {
    if with_task_context_mut(|ctx| {
        ctx.model = Some(model.to_string());
    }) {
        return;
    }

    LOG_CONTEXT.with(|c| {
        c.borrow_mut().model = Some(model.to_string());
    });
}

/// Drop the context for the current task
pub fn clear_context() {
    if let Some(task_id) = current_task_id() {
        if let Some(store) = TASK_LOG_CONTEXTS.get() {
            if let Ok(mut contexts) = store.lock() {
                contexts.remove(&task_id);
            }
        }
    }

    LOG_CONTEXT.with(|c| {
        *c.borrow_mut() = LogContext::default();
    });
}

fn current_task_id() -> Option<String> {
    tokio::task::try_id().map(|id| id.to_string())
}

fn with_task_context_mut(update: impl FnOnce(&mut LogContext)) -> bool {
    let Some(task_id) = current_task_id() else {
        return false;
    };

    let store = TASK_LOG_CONTEXTS.get_or_init(|| Mutex::new(HashMap::new()));
    if let Ok(mut contexts) = store.lock() {
        let ctx = contexts.entry(task_id).or_default();
        update(ctx);
        true
    } else {
        false
    }
}

fn context_prefix() -> String {
    let ctx = current_task_id()
        .and_then(|task_id| {
            let store = TASK_LOG_CONTEXTS.get()?;
            let contexts = store.lock().ok()?;
            contexts.get(&task_id).cloned()
        })
        .unwrap_or_else(|| LOG_CONTEXT.with(|c| c.borrow().clone()));

    let mut parts = Vec::new();
    if let Some(ref session) = ctx.session {
        let short = if session.len() > 20 {
            &session[..20]
        } else {
            session
        };
        parts.push(format!("ses:{}", short));
    }
    if let Some(ref model) = ctx.model {
        parts.push(format!("mod:{}", model));
    }

    if parts.is_empty() {
        String::new()
    } else {
        format!("[{}] ", parts.join("|"))
    }
}

struct Logger {
    file: File,
}

impl Logger {
    fn new() -> Option<Self> {
        let log_dir = dirs::home_dir()?.join(".deskpilot").join("logs");
        fs::create_dir_all(&log_dir).ok()?;

        let date = Local::now().format("%Y-%m-%d");
        let path = log_dir.join(format!("deskpilot-{}.log", date));

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .ok()?;

        Some(Self { file })
    }

    fn write(&mut self, level: &str, message: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let ctx = context_prefix();
        let line = format!("[{}] [{}] {}{}\n", timestamp, level, ctx, message);
        let _ = self.file.write_all(line.as_bytes());
        let _ = self.file.flush();
    }
}

/// Initialize the logger (call once at startup)
pub fn init() {
    let mut guard = LOGGER.lock().unwrap();
    if guard.is_none() {
        *guard = Logger::new();
    }
}

pub fn info(message: &str) {
    write_level("INFO", message);
}

pub fn warn(message: &str) {
    write_level("WARN", message);
}

pub fn error(message: &str) {
    write_level("ERROR", message);
}

/// Debug lines are only written when DESKPILOT_TRACE is set
pub fn debug(message: &str) {
    if std::env::var("DESKPILOT_TRACE").is_ok() {
        write_level("DEBUG", message);
    }
}

fn write_level(level: &str, message: &str) {
    if let Ok(mut guard) = LOGGER.lock() {
        if let Some(logger) = guard.as_mut() {
            logger.write(level, message);
        }
    }
}

/// Remove log files older than 7 days
pub fn cleanup_old_logs() {
    if let Some(log_dir) = dirs::home_dir().map(|h| h.join(".deskpilot").join("logs")) {
        if let Ok(entries) = fs::read_dir(&log_dir) {
            let cutoff = Local::now() - chrono::Duration::days(7);
            for entry in entries.flatten() {
                if let Ok(metadata) = entry.metadata() {
                    if let Ok(modified) = metadata.modified() {
                        let modified: chrono::DateTime<Local> = modified.into();
                        if modified < cutoff {
                            let _ = fs::remove_file(entry.path());
                        }
                    }
                }
            }
        }
    }
}

/// Path of today's log file, if a home directory exists
pub fn log_path() -> Option<PathBuf> {
    let log_dir = dirs::home_dir()?.join(".deskpilot").join("logs");
    let date = Local::now().format("%Y-%m-%d");
    Some(log_dir.join(format!("deskpilot-{}.log", date)))
}

/// Truncate a string at a valid UTF-8 boundary for log previews
pub fn truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
