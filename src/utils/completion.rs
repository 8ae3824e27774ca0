// src/utils/completion.rs
//! End-of-run summary. Rendering and writing always happen; e-mail delivery is
//! best effort and never changes the run's outcome.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Local;
use log::{info, warn};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::defs::{
    PipelineError, MULTIQC_DIR, MULTIQC_REPORT, PIPELINE_INFO_DIR, PIPELINE_REPORT_HTML, PIPELINE_REPORT_TXT,
};
use crate::config::plan::{ExecutionPlan, NotificationPlan};
use crate::engine::scheduler::RunSummary;
use crate::utils::file::{is_remote, write_atomic};

const MIME_BOUNDARY: &str = "nanoseqMimeBoundary";
const BASE64_LINE: usize = 76;

/// What the summary says about a finished run. Runs rejected during configuration
/// have no plan, so only the fields known from the command line are kept.
#[derive(Debug)]
pub struct Completion<'a> {
    pub run_name: &'a str,
    pub out_dir: &'a Path,
    pub input: Option<&'a Path>,
    pub notification: &'a NotificationPlan,
    pub summary: Option<&'a RunSummary>,
    pub error: Option<&'a PipelineError>,
    pub duration: Duration,
}

impl<'a> Completion<'a> {
    pub fn for_plan(
        plan: &'a ExecutionPlan,
        summary: Option<&'a RunSummary>,
        error: Option<&'a PipelineError>,
        duration: Duration,
    ) -> Self {
        Completion {
            run_name: &plan.run_name,
            out_dir: &plan.out_dir,
            input: Some(plan.input.as_path()),
            notification: &plan.notification,
            summary,
            error,
            duration,
        }
    }

    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    pub fn subject(&self) -> String {
        if self.success() {
            format!("[nanoseq] Successful: {}", self.run_name)
        } else {
            format!("[nanoseq] FAILED: {}", self.run_name)
        }
    }

    fn facts(&self) -> Vec<(&'static str, String)> {
        let mut facts = vec![
            ("Run name", self.run_name.to_string()),
            ("Completed at", Local::now().format("%Y-%m-%d %H:%M:%S").to_string()),
            ("Duration", format!("{:.1}s", self.duration.as_secs_f64())),
            ("Status", if self.success() { "success".to_string() } else { "failed".to_string() }),
            ("Output directory", self.out_dir.display().to_string()),
        ];
        if let Some(input) = self.input {
            facts.push(("Samplesheet", input.display().to_string()));
        }
        if let Some(summary) = self.summary {
            facts.push(("Tasks succeeded", summary.tally.succeeded.to_string()));
            facts.push(("Tasks ignored", summary.tally.ignored.to_string()));
            facts.push(("Tasks failed", summary.tally.failed.to_string()));
        }
        if let Some(error) = self.error {
            facts.push(("Error", error.to_string()));
        }
        facts
    }

    pub fn render_text(&self) -> String {
        let mut out = format!("{}\n{}\n", self.subject(), "-".repeat(60));
        for (key, value) in self.facts() {
            out.push_str(&format!("{:<18}: {}\n", key, value));
        }
        out
    }

    pub fn render_html(&self) -> String {
        let status_color = if self.success() { "#2e7d32" } else { "#c62828" };
        let mut rows = String::new();
        for (key, value) in self.facts() {
            rows.push_str(&format!(
                "<tr><th style=\"text-align:left\">{}</th><td>{}</td></tr>\n",
                key,
                escape_html(&value)
            ));
        }
        format!(
            "<html>\n<head><title>{subject}</title></head>\n<body>\n\
             <h1 style=\"color:{color}\">{subject}</h1>\n<table>\n{rows}</table>\n</body>\n</html>\n",
            subject = escape_html(&self.subject()),
            color = status_color,
            rows = rows
        )
    }

    /// Failure mail goes to `--email-on-fail` when set, otherwise to `--email`.
    pub fn recipient(&self) -> Option<&str> {
        let notification = self.notification;
        if self.success() {
            notification.email.as_deref()
        } else {
            notification.email_on_fail.as_deref().or(notification.email.as_deref())
        }
    }

    /// MultiQC report to attach, if it exists and is small enough.
    pub fn attachment(&self) -> Option<PathBuf> {
        let report = self.out_dir.join(MULTIQC_DIR).join(MULTIQC_REPORT);
        let size = fs::metadata(&report).ok()?.len();
        if size <= self.notification.max_attachment_size {
            Some(report)
        } else {
            warn!(
                "MultiQC report is {} bytes, above the {} byte e-mail limit; not attaching",
                size, self.notification.max_attachment_size
            );
            None
        }
    }
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Writes both summaries under `pipeline_info/` and, when a recipient is configured,
/// tries to mail them. Only failing to write the summaries is an error. A remote
/// output directory cannot be written locally, so there the mail is all that is sent.
pub async fn complete(completion: &Completion<'_>) -> Result<()> {
    let text = completion.render_text();
    let html = completion.render_html();
    if is_remote(&completion.out_dir.to_string_lossy()) {
        warn!("Output directory {} is remote; run summary not written", completion.out_dir.display());
    } else {
        let info_dir = completion.out_dir.join(PIPELINE_INFO_DIR);
        write_atomic(&info_dir.join(PIPELINE_REPORT_TXT), &text)?;
        write_atomic(&info_dir.join(PIPELINE_REPORT_HTML), &html)?;
    }

    if let Some(recipient) = completion.recipient() {
        let subject = completion.subject();
        let attachment = completion.attachment();
        match send_sendmail(recipient, &subject, &html, attachment.as_deref()).await {
            Ok(()) => info!("Sent summary e-mail to {} (sendmail)", recipient),
            Err(e) => {
                warn!("sendmail failed ({}); falling back to mail", e);
                match send_mail(recipient, &subject, &text).await {
                    Ok(()) => info!("Sent summary e-mail to {} (mail)", recipient),
                    Err(e) => warn!("Could not send summary e-mail: {}", e),
                }
            }
        }
    }
    Ok(())
}

/// MIME message for `sendmail -t`. The summary body is 8-bit HTML; the attachment is
/// base64 in 76-column lines so no transport sees an over-long line.
pub fn mime_message(recipient: &str, subject: &str, html: &str, attachment: Option<(&str, &[u8])>) -> String {
    let mut message = format!(
        "To: {}\nSubject: {}\nMime-Version: 1.0\nContent-Type: multipart/mixed; boundary=\"{}\"\n\n",
        recipient, subject, MIME_BOUNDARY
    );
    message.push_str(&format!(
        "--{}\nContent-Type: text/html; charset=utf-8\nContent-Transfer-Encoding: 8bit\n\n{}\n",
        MIME_BOUNDARY, html
    ));
    if let Some((name, body)) = attachment {
        message.push_str(&format!(
            "--{}\nContent-Type: text/html; name=\"{}\"\nContent-Transfer-Encoding: base64\n\
             Content-Disposition: attachment; filename=\"{}\"\n\n",
            MIME_BOUNDARY, name, name
        ));
        let encoded = STANDARD.encode(body);
        for line in encoded.as_bytes().chunks(BASE64_LINE) {
            message.push_str(&String::from_utf8_lossy(line));
            message.push('\n');
        }
    }
    message.push_str(&format!("--{}--\n", MIME_BOUNDARY));
    message
}

async fn pipe_to(program: &str, args: &[&str], input: &str) -> Result<()> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| anyhow!("Failed to spawn {}: {}", program, e))?;
    let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("No stdin for {}", program))?;
    stdin.write_all(input.as_bytes()).await?;
    drop(stdin);
    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(anyhow!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

async fn send_sendmail(recipient: &str, subject: &str, html: &str, attachment: Option<&Path>) -> Result<()> {
    let attached = match attachment {
        Some(path) => Some(fs::read(path)?),
        None => None,
    };
    let message = mime_message(recipient, subject, html, attached.as_deref().map(|body| (MULTIQC_REPORT, body)));
    pipe_to("sendmail", &["-t"], &message).await
}

async fn send_mail(recipient: &str, subject: &str, text: &str) -> Result<()> {
    pipe_to("mail", &["-s", subject, recipient], text).await
}
