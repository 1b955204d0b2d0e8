/*!
Configuration and Settings
*/

use std::env;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Settings {
    // Database
    pub database_url: String,

    // Provider A (Bright Data): dataset-triggered scrapes with snapshot polling
    pub brightdata_api_key: Option<String>,
    pub brightdata_dataset_id: String,
    pub brightdata_health_url: String,

    // Provider B (DataForSEO): task submission with postback callbacks
    pub dataforseo_login: Option<String>,
    pub dataforseo_password: Option<String>,
    pub dataforseo_health_url: String,

    // LLM provider
    pub default_openai_model: String,

    // Email (Mailgun-style HTTP API)
    pub mailgun_api_key: Option<String>,
    pub mailgun_domain: String,
    pub email_from: String,
    pub template_submitted: String,
    pub template_succeeded: String,
    pub template_failed: String,
    pub unsubscribe_url: String,

    // Public base URL used to build provider B postback callbacks
    pub app_url: String,

    // Nightly scheduler
    pub nightly_cron_schedule: String,
    pub testing_mode: bool,
    pub test_user_id: Option<String>,
    pub test_project_id: Option<String>,

    // Probe / polling cadence
    pub health_probe_interval_secs: u64,
    pub snapshot_poll_interval_secs: u64,
    pub snapshot_poll_max_attempts: u32,

    // Queue
    pub queue_redelivery_delay_secs: u64,
    pub queue_max_deliveries: u32,

    pub port: u16,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl Settings {
    pub fn load() -> Result<Self> {
        // Load .env file if exists
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| Error::Config("DATABASE_URL is required".to_string()))?,

            brightdata_api_key: env::var("BRIGHTDATA_API_KEY").ok(),
            brightdata_dataset_id: env_or("BRIGHTDATA_DATASET_ID", "gd_chatgpt_prompts"),
            brightdata_health_url: env_or(
                "BRIGHTDATA_HEALTH_URL",
                "https://api.brightdata.com/status",
            ),

            dataforseo_login: env::var("DATAFORSEO_LOGIN").ok(),
            dataforseo_password: env::var("DATAFORSEO_PASSWORD").ok(),
            dataforseo_health_url: env_or(
                "DATAFORSEO_HEALTH_URL",
                "https://api.dataforseo.com/v3/appendix/status",
            ),

            default_openai_model: env_or("DEFAULT_OPENAI_MODEL", "gpt-4o-mini"),

            mailgun_api_key: env::var("MAILGUN_API_KEY").ok(),
            mailgun_domain: env_or("MAILGUN_DOMAIN", ""),
            email_from: env_or("EMAIL_FROM", "Prompt Runner <noreply@promptrunner.app>"),
            template_submitted: env_or("MAILGUN_TEMPLATE_SUBMITTED", "batch-submitted"),
            template_succeeded: env_or("MAILGUN_TEMPLATE_SUCCEEDED", "batch-succeeded"),
            template_failed: env_or("MAILGUN_TEMPLATE_FAILED", "batch-failed"),
            unsubscribe_url: env_or("UNSUBSCRIBE_URL", ""),

            app_url: env_or("APP_URL", "http://localhost:8080"),

            nightly_cron_schedule: env_or("NIGHTLY_CRON_SCHEDULE", "0 4 * * *"),
            testing_mode: env_parse("TESTING_MODE", false),
            test_user_id: env::var("TEST_USER_ID").ok(),
            test_project_id: env::var("TEST_PROJECT_ID").ok(),

            health_probe_interval_secs: env_parse("HEALTH_PROBE_INTERVAL_SECS", 60),
            snapshot_poll_interval_secs: env_parse("SNAPSHOT_POLL_INTERVAL_SECS", 30),
            // 60 polls at the 30s default puts the wall-clock cap at 30 minutes
            snapshot_poll_max_attempts: env_parse("SNAPSHOT_POLL_MAX_ATTEMPTS", 60),

            queue_redelivery_delay_secs: env_parse("QUEUE_REDELIVERY_DELAY_SECS", 5),
            queue_max_deliveries: env_parse("QUEUE_MAX_DELIVERIES", 5),

            port: env_parse("PORT", 8080),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            return Err(Error::Config("DATABASE_URL must not be empty".to_string()));
        }
        if self.app_url.is_empty() {
            return Err(Error::Config("APP_URL must not be empty".to_string()));
        }
        if self.snapshot_poll_interval_secs == 0 {
            return Err(Error::Config(
                "SNAPSHOT_POLL_INTERVAL_SECS must be positive".to_string(),
            ));
        }
        if self.nightly_cron_schedule.split_whitespace().count() != 5 {
            return Err(Error::Config(format!(
                "NIGHTLY_CRON_SCHEDULE must be a 5-field cron expression, got '{}'",
                self.nightly_cron_schedule
            )));
        }
        Ok(())
    }

    /// True when the scheduler should restrict itself to the configured
    /// test user and project.
    pub fn testing_filter(&self) -> Option<(&str, &str)> {
        if !self.testing_mode {
            return None;
        }
        match (self.test_user_id.as_deref(), self.test_project_id.as_deref()) {
            (Some(u), Some(p)) => Some((u, p)),
            _ => None,
        }
    }
}
