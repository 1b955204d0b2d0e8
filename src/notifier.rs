/*!
Email notifications via the Mailgun HTTP API.

One template per kind. Nightly shards carry no email address and
produce no mail; a notifier without credentials logs and drops.
*/

use reqwest::Client;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Submitted,
    Succeeded,
    Failed,
}

impl NotificationKind {
    pub fn subject(&self) -> &'static str {
        match self {
            NotificationKind::Submitted => "Your prompt batch was submitted",
            NotificationKind::Succeeded => "Your prompt batch finished",
            NotificationKind::Failed => "Your prompt batch had failures",
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    client: Client,
    api_key: Option<String>,
    domain: String,
    from: String,
    template_submitted: String,
    template_succeeded: String,
    template_failed: String,
    unsubscribe_url: String,
}

impl Notifier {
    pub fn new(settings: &Settings) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap(),
            api_key: settings.mailgun_api_key.clone(),
            domain: settings.mailgun_domain.clone(),
            from: settings.email_from.clone(),
            template_submitted: settings.template_submitted.clone(),
            template_succeeded: settings.template_succeeded.clone(),
            template_failed: settings.template_failed.clone(),
            unsubscribe_url: settings.unsubscribe_url.clone(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.api_key.is_some() && !self.domain.is_empty()
    }

    fn template(&self, kind: NotificationKind) -> &str {
        match kind {
            NotificationKind::Submitted => &self.template_submitted,
            NotificationKind::Succeeded => &self.template_succeeded,
            NotificationKind::Failed => &self.template_failed,
        }
    }

    /// Send one templated email. `vars` is passed through to the
    /// template renderer.
    pub async fn send(&self, kind: NotificationKind, to: &str, mut vars: Value) -> Result<()> {
        if to.is_empty() {
            return Ok(());
        }
        let Some(api_key) = self.api_key.as_deref() else {
            info!(?kind, to, "email disabled, skipping notification");
            return Ok(());
        };

        if let Value::Object(map) = &mut vars {
            if !self.unsubscribe_url.is_empty() {
                map.insert(
                    "unsubscribe_url".to_string(),
                    Value::String(self.unsubscribe_url.clone()),
                );
            }
        }

        let url = format!("https://api.mailgun.net/v3/{}/messages", self.domain);
        let form = [
            ("from", self.from.as_str()),
            ("to", to),
            ("subject", kind.subject()),
            ("template", self.template(kind)),
        ];
        let vars_json = serde_json::to_string(&vars)?;

        let response = self
            .client
            .post(&url)
            .basic_auth("api", Some(api_key))
            .form(
                &form
                    .iter()
                    .copied()
                    .chain(std::iter::once(("h:X-Mailgun-Variables", vars_json.as_str())))
                    .collect::<Vec<_>>(),
            )
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(?kind, to, %status, body, "email send failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_are_distinct() {
        let subjects = [
            NotificationKind::Submitted.subject(),
            NotificationKind::Succeeded.subject(),
            NotificationKind::Failed.subject(),
        ];
        let unique: std::collections::HashSet<_> = subjects.iter().collect();
        assert_eq!(unique.len(), 3);
    }
}
