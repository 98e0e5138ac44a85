//! Security alerts raised on admin logins.

use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use quick_xml::escape::escape;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LoginAlert {
    pub username: String,
    pub role: String,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub at: DateTime<Utc>,
}

pub trait AlertSink {
    fn deliver(&self, alert: &LoginAlert) -> anyhow::Result<()>;
}

/// Writes each alert as an RFC 5322 message into an outbox directory, where a
/// relay picks it up.
pub struct OutboxMailer {
    outbox: PathBuf,
    from: String,
    to: String,
}

impl OutboxMailer {
    pub fn new(outbox: PathBuf, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            outbox,
            from: from.into(),
            to: to.into(),
        }
    }

    fn render(&self, alert: &LoginAlert, message_id: &str) -> String {
        let unknown = "unknown";
        let time = alert.at.to_rfc2822();
        let rows = [
            ("Username", alert.username.as_str()),
            ("User Role", alert.role.as_str()),
            ("IP Address", alert.client_ip.as_deref().unwrap_or(unknown)),
            ("Time", time.as_str()),
            ("User Agent", alert.user_agent.as_deref().unwrap_or(unknown)),
        ]
        .iter()
        .map(|(label, value)| {
            format!(
                "<tr><td style=\"padding:8px;font-weight:bold\">{label}:</td><td style=\"padding:8px\">{}</td></tr>",
                escape(*value)
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

        format!(
            "From: \"Security Alert\" <{from}>\r\n\
             To: {to}\r\n\
             Subject: Security Alert: Admin Login Detected - {user}\r\n\
             Date: {date}\r\n\
             Message-ID: <{message_id}@samajd>\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: text/html; charset=utf-8\r\n\
             \r\n\
             <div style=\"font-family:Arial,sans-serif\">\n\
             <h2>New Admin Login Detected</h2>\n\
             <p>A new login to the admin panel was detected. Details are below:</p>\n\
             <table>\n{rows}\n</table>\n\
             <p>If this was you, you can ignore this email. If you did not authorize this login, change your password immediately.</p>\n\
             </div>\r\n",
            from = self.from,
            to = self.to,
            user = alert.username,
            date = time,
        )
    }
}

impl AlertSink for OutboxMailer {
    fn deliver(&self, alert: &LoginAlert) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.outbox).with_context(|| {
            format!("failed to create outbox {}", self.outbox.to_string_lossy())
        })?;
        let message_id = Uuid::new_v4().to_string();
        let path = self.outbox.join(format!(
            "{}-{}.eml",
            alert.at.format("%Y%m%dT%H%M%S"),
            message_id
        ));
        std::fs::write(&path, self.render(alert, &message_id))
            .with_context(|| format!("failed to write alert {}", path.to_string_lossy()))?;
        info!(path = %path.display(), "login alert queued");
        Ok(())
    }
}

/// Hands the alert to the sink. Delivery problems are logged, never raised.
pub fn send_login_alert(sink: &dyn AlertSink, alert: &LoginAlert) {
    if let Err(e) = sink.deliver(alert) {
        error!("failed to send login alert for {}: {e:#}", alert.username);
    }
}
