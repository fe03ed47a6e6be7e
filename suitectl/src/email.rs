//! Outgoing email: credit expiry warnings and tenant membership notices.

use chrono::{DateTime, Utc};
use lettre::{
    AsyncFileTransport, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use rust_decimal::Decimal;
use std::path::Path;

use crate::{
    config::{Config, EmailTransportConfig},
    errors::Error,
};

pub struct EmailService {
    transport: EmailTransport,
    from: Mailbox,
    reply_to: Option<Mailbox>,
    dashboard_url: String,
}

enum EmailTransport {
    Smtp(AsyncSmtpTransport<Tokio1Executor>),
    File(AsyncFileTransport<Tokio1Executor>),
}

/// One expiring allocation as listed in a warning email.
#[derive(Debug, Clone)]
pub struct ExpiringCredits {
    pub remaining: Decimal,
    pub expires_at: DateTime<Utc>,
}

fn internal(operation: &str) -> impl FnOnce(String) -> Error + '_ {
    move |e| Error::Internal {
        operation: format!("{operation}: {e}"),
    }
}

fn mailbox(email: &str, name: Option<&str>) -> Result<Mailbox, Error> {
    match name {
        Some(name) => format!("{name} <{email}>"),
        None => email.to_string(),
    }
    .parse::<Mailbox>()
    .map_err(|e| internal("parse email address")(e.to_string()))
}

impl EmailService {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let email_config = &config.email;

        let transport = match &email_config.transport {
            EmailTransportConfig::Smtp {
                host,
                port,
                username,
                password,
                use_tls,
            } => {
                if !use_tls {
                    tracing::warn!("SMTP TLS is disabled - this is not recommended for production");
                }

                let smtp_builder = if *use_tls {
                    AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                } else {
                    Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host))
                }
                .map_err(|e| internal("create SMTP transport")(e.to_string()))?
                .port(*port)
                .credentials(Credentials::new(username.clone(), password.clone()));

                EmailTransport::Smtp(smtp_builder.build())
            }
            EmailTransportConfig::File { path } => {
                let emails_dir = Path::new(path);
                if !emails_dir.exists() {
                    std::fs::create_dir_all(emails_dir).map_err(|e| internal("create emails directory")(e.to_string()))?;
                }
                EmailTransport::File(AsyncFileTransport::<Tokio1Executor>::new(emails_dir))
            }
        };

        Ok(Self {
            transport,
            from: mailbox(&email_config.from_email, Some(&email_config.from_name))?,
            reply_to: email_config.reply_to.as_deref().map(|r| mailbox(r, None)).transpose()?,
            dashboard_url: config.dashboard_url.trim_end_matches('/').to_string(),
        })
    }

    /// Tell a tenant's admins that some of their credits are about to expire.
    pub async fn send_expiry_warning(
        &self,
        to_email: &str,
        to_name: Option<&str>,
        tenant_name: &str,
        expiring: &[ExpiringCredits],
    ) -> Result<(), Error> {
        let subject = format!("Credits for {tenant_name} are about to expire");
        let body = self.expiry_warning_body(to_name, tenant_name, expiring);
        self.send_email(to_email, to_name, &subject, &body).await
    }

    /// Tell a user they were added to a tenant.
    pub async fn send_member_added(&self, to_email: &str, to_name: Option<&str>, tenant_name: &str) -> Result<(), Error> {
        let subject = format!("You have been added to {tenant_name}");
        let body = self.member_added_body(to_name, tenant_name);
        self.send_email(to_email, to_name, &subject, &body).await
    }

    async fn send_email(&self, to_email: &str, to_name: Option<&str>, subject: &str, body: &str) -> Result<(), Error> {
        let mut builder = Message::builder().from(self.from.clone()).to(mailbox(to_email, to_name)?);
        if let Some(reply_to) = &self.reply_to {
            builder = builder.reply_to(reply_to.clone());
        }
        let message = builder
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(body.to_string())
            .map_err(|e| internal("build email message")(e.to_string()))?;

        match &self.transport {
            EmailTransport::Smtp(smtp) => {
                smtp.send(message).await.map_err(|e| internal("send SMTP email")(e.to_string()))?;
            }
            EmailTransport::File(file) => {
                file.send(message).await.map_err(|e| internal("send file email")(e.to_string()))?;
            }
        }

        Ok(())
    }

    fn greeting(to_name: Option<&str>) -> String {
        match to_name {
            Some(name) => format!("Hello {name},"),
            None => "Hello,".to_string(),
        }
    }

    fn expiry_warning_body(&self, to_name: Option<&str>, tenant_name: &str, expiring: &[ExpiringCredits]) -> String {
        let greeting = Self::greeting(to_name);
        let total: Decimal = expiring.iter().map(|e| e.remaining).sum();
        let rows: String = expiring
            .iter()
            .map(|e| format!("<tr><td>{}</td><td>{}</td></tr>\n", e.remaining.normalize(), e.expires_at.format("%Y-%m-%d")))
            .collect();
        let credits_link = format!("{}/credits", self.dashboard_url);

        format!(
            r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Credits expiring soon</title>
    <style>
        body {{ font-family: Arial, sans-serif; line-height: 1.6; color: #333; }}
        .container {{ max-width: 600px; margin: 0 auto; padding: 20px; }}
        td, th {{ padding: 4px 12px; text-align: left; }}
        .footer {{ margin-top: 30px; font-size: 12px; color: #666; }}
    </style>
</head>
<body>
    <div class="container">
        <h2>Credits expiring soon</h2>

        <p>{greeting}</p>

        <p>{total} credits held by {tenant_name} will expire soon:</p>

        <table>
            <tr><th>Credits</th><th>Expires on</th></tr>
            {rows}
        </table>

        <p>Unused credits are removed on their expiry date. <a href="{credits_link}">View your credits</a></p>

        <div class="footer">
            <p>You receive this email as an administrator of {tenant_name}.</p>
            <p>This is an automated message, please do not reply to this email.</p>
        </div>
    </div>
</body>
</html>"#,
            total = total.normalize(),
        )
    }

    fn member_added_body(&self, to_name: Option<&str>, tenant_name: &str) -> String {
        let greeting = Self::greeting(to_name);
        let dashboard = &self.dashboard_url;

        format!(
            r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Welcome to {tenant_name}</title>
</head>
<body>
    <p>{greeting}</p>
    <p>You now have access to {tenant_name}. <a href="{dashboard}">Sign in</a> to get started.</p>
    <p style="font-size: 12px; color: #666;">This is an automated message, please do not reply to this email.</p>
</body>
</html>"#
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_config;
    use chrono::TimeZone;

    fn service_writing_to(dir: &Path) -> EmailService {
        let mut config = create_test_config();
        config.email.transport = EmailTransportConfig::File {
            path: dir.to_string_lossy().to_string(),
        };
        EmailService::new(&config).unwrap()
    }

    #[test]
    fn expiry_warning_lists_each_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_writing_to(dir.path());
        let expiring = vec![
            ExpiringCredits {
                remaining: Decimal::new(12050, 2),
                expires_at: Utc.with_ymd_and_hms(2026, 12, 31, 0, 0, 0).unwrap(),
            },
            ExpiringCredits {
                remaining: Decimal::from(30),
                expires_at: Utc.with_ymd_and_hms(2027, 1, 15, 0, 0, 0).unwrap(),
            },
        ];

        let body = service.expiry_warning_body(Some("Ada"), "Acme", &expiring);

        assert!(body.contains("Hello Ada,"));
        assert!(body.contains("150.5 credits held by Acme"));
        assert!(body.contains("<td>120.5</td><td>2026-12-31</td>"));
        assert!(body.contains("2027-01-15"));
        assert!(body.contains("/credits"));
    }

    #[test]
    fn member_notice_without_name() {
        let dir = tempfile::tempdir().unwrap();
        let body = service_writing_to(dir.path()).member_added_body(None, "Acme");
        assert!(body.contains("Hello,"));
        assert!(body.contains("access to Acme"));
    }

    #[tokio::test]
    async fn file_transport_writes_one_message_per_email() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_writing_to(dir.path());

        service.send_member_added("new@acme.test", Some("New Person"), "Acme").await.unwrap();
        service
            .send_expiry_warning(
                "admin@acme.test",
                None,
                "Acme",
                &[ExpiringCredits {
                    remaining: Decimal::ONE,
                    expires_at: Utc::now(),
                }],
            )
            .await
            .unwrap();

        let written = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(written, 2);
    }

    #[test]
    fn invalid_sender_is_rejected() {
        let mut config = create_test_config();
        config.email.from_email = "not an address".to_string();
        assert!(EmailService::new(&config).is_err());
    }
}
