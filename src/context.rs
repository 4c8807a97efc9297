//! Process-wide context built once at startup and borrowed by every cycle.

use std::sync::Arc;

use crate::channels::{Mailbox, Notifier, QuoteSplitter};
use crate::config::Settings;
use crate::llm::LlmProvider;
use crate::pipeline::generate::GenerateOptions;

/// Everything a poll cycle needs.
pub struct AppContext {
    pub mailbox: Arc<dyn Mailbox>,
    pub llm: Arc<dyn LlmProvider>,
    pub notifier: Arc<dyn Notifier>,
    pub splitter: Arc<dyn QuoteSplitter>,
    pub settings: Settings,
    /// Address the mailbox sends as, resolved by the startup probe.
    pub own_address: String,
}

impl AppContext {
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        llm: Arc<dyn LlmProvider>,
        notifier: Arc<dyn Notifier>,
        splitter: Arc<dyn QuoteSplitter>,
        settings: Settings,
        own_address: String,
    ) -> Self {
        Self {
            mailbox,
            llm,
            notifier,
            splitter,
            settings,
            own_address,
        }
    }

    pub fn generate_options(&self) -> GenerateOptions<'_> {
        GenerateOptions {
            persona: &self.settings.persona,
            timeout: self.settings.llm_timeout,
            display_offset: self.settings.display_offset,
            display_label: &self.settings.display_label,
        }
    }

    /// Render an instant in the configured display timezone.
    pub fn display_time(&self, at: chrono::DateTime<chrono::Utc>) -> String {
        crate::pipeline::extract::format_display(
            at,
            self.settings.display_offset,
            &self.settings.display_label,
        )
    }
}
