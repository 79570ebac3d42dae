//! Email notifier.
//!
//! Two tiers, tried in order: an HTML message piped to `sendmail -t`, then
//! a plain-text message through `mail -s`. The second tier only runs when
//! the first one errors, times out, or when plain text was requested
//! outright. The HTML message carries the report archive as a base64
//! attachment when one was produced.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::NotificationSettings;

use super::{Notification, NotificationFailure, Notifier};

/// Line length of base64 bodies (RFC 2045)
const BASE64_LINE: usize = 76;

/// Email notifier backed by the local mail programs
pub struct EmailNotifier {
    recipient: String,
    sendmail_program: String,
    mail_program: String,

    /// Skip the HTML tier
    plaintext: bool,

    /// Budget of each tier
    timeout: Duration,
}

/// A file attached to the HTML message
struct Attachment {
    file_name: String,
    bytes: Vec<u8>,
}

impl Attachment {
    async fn read(path: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        Ok(Self { file_name, bytes })
    }

    fn content_type(&self) -> &'static str {
        if self.file_name.ends_with(".zip") {
            "application/zip"
        } else {
            "application/octet-stream"
        }
    }
}

impl EmailNotifier {
    pub fn new(recipient: impl Into<String>, settings: &NotificationSettings) -> Self {
        Self {
            recipient: recipient.into(),
            sendmail_program: settings.sendmail_program.clone(),
            mail_program: settings.mail_program.clone(),
            plaintext: settings.plaintext_email,
            timeout: Duration::from_secs(settings.email_timeout_seconds),
        }
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    /// Full message for `sendmail -t`, headers included
    fn rich_message(&self, notification: &Notification, attachment: Option<&Attachment>) -> String {
        let headers = format!(
            "To: {}\nSubject: {}\nMime-Version: 1.0\n",
            self.recipient, notification.subject
        );

        let Some(attachment) = attachment else {
            return format!(
                "{}Content-Type: text/html; charset=utf-8\n\n{}\n",
                headers, notification.html
            );
        };

        let boundary = format!("rnadeseq-{}", Uuid::new_v4().simple());
        let encoded = general_purpose::STANDARD.encode(&attachment.bytes);
        let body: Vec<&str> = encoded
            .as_bytes()
            .chunks(BASE64_LINE)
            .filter_map(|line| std::str::from_utf8(line).ok())
            .collect();

        format!(
            "{headers}Content-Type: multipart/mixed; boundary=\"{b}\"\n\n\
             --{b}\n\
             Content-Type: text/html; charset=utf-8\n\n\
             {html}\n\
             --{b}\n\
             Content-Type: {ctype}; name=\"{name}\"\n\
             Content-Transfer-Encoding: base64\n\
             Content-Disposition: attachment; filename=\"{name}\"\n\n\
             {data}\n\
             --{b}--\n",
            headers = headers,
            b = boundary,
            html = notification.html,
            ctype = attachment.content_type(),
            name = attachment.file_name,
            data = body.join("\n"),
        )
    }

    async fn send_rich(&self, notification: &Notification) -> Result<(), NotificationFailure> {
        let attachment = match &notification.attachment {
            Some(path) => match Attachment::read(path).await {
                Ok(attachment) => Some(attachment),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Could not read attachment, sending without it");
                    None
                }
            },
            None => None,
        };

        self.deliver(
            "sendmail",
            &self.sendmail_program,
            &["-t"],
            &self.rich_message(notification, attachment.as_ref()),
        )
        .await
    }

    async fn send_plain(&self, notification: &Notification) -> Result<(), NotificationFailure> {
        self.deliver(
            "mail",
            &self.mail_program,
            &["-s", &notification.subject, &self.recipient],
            &notification.text,
        )
        .await
    }

    async fn deliver(
        &self,
        channel: &str,
        program: &str,
        args: &[&str],
        input: &str,
    ) -> Result<(), NotificationFailure> {
        match timeout(self.timeout, pipe_to(program, args, input)).await {
            Ok(result) => result.map_err(|message| NotificationFailure::new(channel, message)),
            Err(_) => Err(NotificationFailure::new(
                channel,
                format!(
                    "'{}' did not finish within {}s",
                    program,
                    self.timeout.as_secs()
                ),
            )),
        }
    }
}

/// Run `program args`, feeding `input` on stdin while draining its output
async fn pipe_to(program: &str, args: &[&str], input: &str) -> Result<(), String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("could not launch '{}': {}", program, e))?;

    let stdin = child.stdin.take();
    let feed = async move {
        match stdin {
            // Dropped at the end of the block, which signals EOF
            Some(mut stdin) => stdin.write_all(input.as_bytes()).await,
            None => Ok(()),
        }
    };

    let (fed, output) = tokio::join!(feed, child.wait_with_output());
    let output = output.map_err(|e| format!("could not wait for '{}': {}", program, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "'{}' exited with {}: {}",
            program,
            output.status,
            stderr.trim()
        ));
    }
    fed.map_err(|e| format!("could not write to '{}': {}", program, e))?;

    Ok(())
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &str {
        "email"
    }

    async fn notify(&self, notification: &Notification) -> Result<(), NotificationFailure> {
        if !self.plaintext {
            match self.send_rich(notification).await {
                Ok(()) => {
                    info!(recipient = %self.recipient, "Sent summary email");
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "HTML email failed, falling back to plain text");
                }
            }
        }

        self.send_plain(notification).await?;
        info!(recipient = %self.recipient, "Sent plain-text summary email");
        Ok(())
    }
}
