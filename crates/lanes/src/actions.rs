//! Built-in step actions and assertion checks

use std::process::Stdio;
use std::time::Duration;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use convoy_common::{Check, Context, StepAction};

/// Environment variable carrying the lane context (JSON) into `exec` programs
pub const CONTEXT_ENV: &str = "CONVOY_CONTEXT";

/// Run a step. `Ok(Some(partial))` is merged into the lane context.
pub async fn run_step(action: StepAction, context: Context) -> Result<Option<Context>, String> {
    match action {
        StepAction::Set { values } => Ok(Some(values)),
        StepAction::Sleep { ms } => {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(None)
        }
        StepAction::Fail { message } => Err(message),
        StepAction::Exec { program, args, capture } => {
            let stdout = exec(&program, &args, &context).await?;
            Ok(capture.map(|key| {
                let mut partial = Context::new();
                partial.insert(key, Value::String(stdout.trim().to_string()));
                partial
            }))
        }
    }
}

/// Run an assertion check against the context
pub async fn run_check(check: Check, context: Context) -> Result<(), String> {
    match check {
        Check::Equals { key, value } => match context.get(&key) {
            Some(actual) if *actual == value => Ok(()),
            Some(actual) => Err(format!("expected '{}' to equal {}, got {}", key, value, actual)),
            None => Err(format!("expected '{}' to equal {}, but it is not set", key, value)),
        },
        Check::Present { key } => match context.get(&key) {
            Some(value) if !value.is_null() => Ok(()),
            _ => Err(format!("expected '{}' to be present", key)),
        },
        Check::Sleep { ms } => {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(())
        }
        Check::Fail { message } => Err(message),
        Check::Exec { program, args } => exec(&program, &args, &context).await.map(|_| ()),
    }
}

/// Run a program to completion; returns its stdout.
///
/// The program inherits the lane's process group, so halting the lane also
/// reaches anything it leaves running.
async fn exec(program: &str, args: &[String], context: &Context) -> Result<String, String> {
    debug!("exec: {} {:?}", program, args);

    let context_json = serde_json::to_string(context).map_err(|e| e.to_string())?;
    let output = Command::new(program)
        .args(args)
        .env(CONTEXT_ENV, context_json)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| format!("failed to run {}: {}", program, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("{} exited with {}: {}", program, output.status, stderr.trim()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
