//! Failure notifications.
//!
//! Notifiers are fire-and-forget: a notifier error is logged and never changes
//! the outcome of the run it reports on.

use crate::report::RunReport;
use reqwest::blocking::Client;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to run '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {status}")]
    Exit { program: String, status: String },

    #[error("webhook request failed: {0}")]
    Webhook(String),
}

pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;
    fn notify_failure(&self, report: &RunReport) -> Result<(), NotifyError>;
}

/// Invoke every notifier, logging (not propagating) their errors.
pub fn notify_all(notifiers: &[Box<dyn Notifier>], report: &RunReport) {
    for notifier in notifiers {
        match notifier.notify_failure(report) {
            Ok(()) => info!(notifier = notifier.name(), run_id = %report.run_id, "failure notification sent"),
            Err(e) => warn!(notifier = notifier.name(), error = %e, "failure notification failed"),
        }
    }
}

fn subject(report: &RunReport) -> String {
    match &report.failure {
        Some(f) => format!("[marketpulse] run {} failed in {}", short_id(&report.run_id), f.phase),
        None => format!("[marketpulse] run {} succeeded", short_id(&report.run_id)),
    }
}

fn short_id(run_id: &str) -> &str {
    run_id.get(..12).unwrap_or(run_id)
}

/// Plain-text body shared by the email and log notifiers.
pub fn failure_text(report: &RunReport) -> String {
    let mut body = String::new();
    body.push_str(&format!("Run:      {}\n", report.run_id));
    body.push_str(&format!("Started:  {}\n", report.started_at.to_rfc3339()));
    if let Some(done) = report.finished_at {
        body.push_str(&format!("Finished: {}\n", done.to_rfc3339()));
    }
    if let Some(f) = &report.failure {
        body.push_str(&format!("Phase:    {}\nError:    {}\n", f.phase, f.message));
    }
    if let Some(fetch) = &report.fetch {
        body.push_str(&format!(
            "Fetch:    {} merged, {} skipped, {} merge failures\n",
            fetch.merged(),
            fetch.skipped(),
            fetch.merge_failures()
        ));
    }
    if let Some(load) = &report.load {
        body.push_str(&format!(
            "Load:     {} inserted, {} updated\n",
            load.inserted.len(),
            load.updated.len()
        ));
    }
    body
}

/// RFC 5322 message for `sendmail -t`.
pub fn compose_failure_email(from: &str, to: &[String], report: &RunReport) -> String {
    format!(
        "From: {from}\nTo: {}\nSubject: {}\nContent-Type: text/plain; charset=utf-8\n\n{}",
        to.join(", "),
        subject(report),
        failure_text(report)
    )
}

/// Logs the failure at error level.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    fn notify_failure(&self, report: &RunReport) -> Result<(), NotifyError> {
        let (phase, message) = report
            .failure
            .as_ref()
            .map(|f| (f.phase.as_str(), f.message.as_str()))
            .unwrap_or(("-", "-"));
        error!(run_id = %report.run_id, phase, message, "pipeline run failed");
        Ok(())
    }
}

/// Pipes a message to a local sendmail-compatible MTA.
pub struct EmailNotifier {
    sendmail: PathBuf,
    from: String,
    to: Vec<String>,
}

impl EmailNotifier {
    pub fn new(sendmail: impl Into<PathBuf>, from: impl Into<String>, to: Vec<String>) -> Self {
        Self {
            sendmail: sendmail.into(),
            from: from.into(),
            to,
        }
    }
}

impl Notifier for EmailNotifier {
    fn name(&self) -> &str {
        "email"
    }

    fn notify_failure(&self, report: &RunReport) -> Result<(), NotifyError> {
        let program = self.sendmail.display().to_string();
        let spawn_err = |source| NotifyError::Spawn {
            program: program.clone(),
            source,
        };

        let mut child = Command::new(&self.sendmail)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(spawn_err)?;

        let message = compose_failure_email(&self.from, &self.to, report);
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(message.as_bytes()).map_err(spawn_err)?;
        }
        let status = child.wait().map_err(spawn_err)?;
        if !status.success() {
            return Err(NotifyError::Exit {
                program,
                status: status.to_string(),
            });
        }
        Ok(())
    }
}

/// POSTs the report as JSON.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Webhook(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    fn notify_failure(&self, report: &RunReport) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(&self.url)
            .json(report)
            .send()
            .map_err(|e| NotifyError::Webhook(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(NotifyError::Webhook(format!("HTTP {}", resp.status())));
        }
        Ok(())
    }
}
