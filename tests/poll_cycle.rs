//! Integration tests for full poll cycles.
//!
//! Each test wires an `AppContext` from in-memory fakes of the mailbox,
//! completion backend and notifier, then drives the real poll loop.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::timeout;

use novamail::channels::email_types::{FetchedMessage, MessageHeader};
use novamail::channels::{HeuristicQuoteSplitter, Mailbox, Notifier, SentReply};
use novamail::config::Settings;
use novamail::context::AppContext;
use novamail::error::{LlmError, MailboxError, NotifyError};
use novamail::llm::{CompletionRequest, CompletionResponse, LlmProvider};
use novamail::pipeline::generate::UNAVAILABLE_FALLBACK;
use novamail::pipeline::poll_loop::{PollLoop, PollState};
use novamail::pipeline::types::{CycleReport, OutboundReplyPayload};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const OWN_ADDRESS: &str = "bot@novamail.test";

// ── Fakes ───────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeMailbox {
    messages: Mutex<HashMap<String, FetchedMessage>>,
    unread: Mutex<Vec<String>>,
    sent: Mutex<Vec<OutboundReplyPayload>>,
    marked: Mutex<Vec<String>>,
    fail_send: HashSet<String>,
}

impl FakeMailbox {
    fn with(messages: Vec<FetchedMessage>) -> Self {
        let mailbox = Self::default();
        for msg in messages {
            mailbox.unread.lock().unwrap().push(msg.id.clone());
            mailbox.messages.lock().unwrap().insert(msg.id.clone(), msg);
        }
        mailbox
    }

    fn sent(&self) -> Vec<OutboundReplyPayload> {
        self.sent.lock().unwrap().clone()
    }

    fn marked(&self) -> Vec<String> {
        self.marked.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailbox for FakeMailbox {
    fn name(&self) -> &str {
        "fake"
    }

    async fn own_address(&self) -> Result<String, MailboxError> {
        Ok(OWN_ADDRESS.to_string())
    }

    async fn list_unread(&self, max: u32) -> Result<Vec<String>, MailboxError> {
        Ok(self
            .unread
            .lock()
            .unwrap()
            .iter()
            .take(max as usize)
            .cloned()
            .collect())
    }

    async fn get_message(&self, id: &str) -> Result<FetchedMessage, MailboxError> {
        self.messages
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| MailboxError::NotFound { id: id.to_string() })
    }

    async fn send_reply(&self, payload: &OutboundReplyPayload) -> Result<SentReply, MailboxError> {
        let to = payload.to.clone();
        if self.fail_send.iter().any(|f| to.contains(f.as_str())) {
            return Err(MailboxError::SendFailed {
                provider: "fake".into(),
                reason: "relay refused".into(),
            });
        }
        self.sent.lock().unwrap().push(payload.clone());
        Ok(SentReply {
            provider_id: Some(format!("sent-{}", self.sent.lock().unwrap().len())),
        })
    }

    async fn mark_read(&self, id: &str) -> Result<(), MailboxError> {
        self.unread.lock().unwrap().retain(|u| u != id);
        self.marked.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

/// Completion backend with a fixed answer.
struct FakeLlm {
    reply: Option<String>,
    calls: Mutex<usize>,
}

impl FakeLlm {
    fn answering(text: &str) -> Self {
        Self {
            reply: Some(text.to_string()),
            calls: Mutex::new(0),
        }
    }

    fn failing() -> Self {
        Self {
            reply: None,
            calls: Mutex::new(0),
        }
    }
}

#[async_trait]
impl LlmProvider for FakeLlm {
    fn model_name(&self) -> &str {
        "fake-model"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        *self.calls.lock().unwrap() += 1;
        match &self.reply {
            Some(text) => Ok(CompletionResponse {
                content: text.clone(),
            }),
            None => Err(LlmError::RateLimited {
                provider: "fake".into(),
            }),
        }
    }
}

#[derive(Default)]
struct FakeNotifier {
    reports: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for FakeNotifier {
    fn name(&self) -> &str {
        "fake"
    }

    async fn notify(&self, markdown: &str) -> Result<(), NotifyError> {
        self.reports.lock().unwrap().push(markdown.to_string());
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn email(id: &str, from: &str, subject: &str, message_id: &str, body: &str) -> FetchedMessage {
    FetchedMessage {
        id: id.to_string(),
        thread_id: Some(format!("thread-{id}")),
        headers: vec![
            MessageHeader::new("From", from),
            MessageHeader::new("Subject", subject),
            MessageHeader::new("Message-ID", message_id),
            MessageHeader::new("Date", "Sun, 22 Feb 2026 13:45:10 +0700"),
        ],
        body_text: Some(body.to_string()),
        body_html: None,
    }
}

struct Harness {
    mailbox: Arc<FakeMailbox>,
    llm: Arc<FakeLlm>,
    notifier: Arc<FakeNotifier>,
    ctx: AppContext,
}

fn harness(mailbox: FakeMailbox, llm: FakeLlm, settings: Settings) -> Harness {
    let mailbox = Arc::new(mailbox);
    let llm = Arc::new(llm);
    let notifier = Arc::new(FakeNotifier::default());
    let ctx = AppContext::new(
        mailbox.clone(),
        llm.clone(),
        notifier.clone(),
        Arc::new(HeuristicQuoteSplitter),
        settings,
        OWN_ADDRESS.to_string(),
    );
    Harness {
        mailbox,
        llm,
        notifier,
        ctx,
    }
}

async fn one_cycle(ctx: &AppContext) -> (CycleReport, PollState) {
    let (_tx, rx) = watch::channel(false);
    let mut poll = PollLoop::new(ctx, rx);
    let report = timeout(TEST_TIMEOUT, poll.run_cycle())
        .await
        .expect("cycle timed out")
        .expect("listing failed");
    (report, poll.state())
}

/// `n` cycles on one loop, so state carries between them.
async fn cycles(ctx: &AppContext, n: usize) -> Vec<CycleReport> {
    let (_tx, rx) = watch::channel(false);
    let mut poll = PollLoop::new(ctx, rx);
    let mut reports = Vec::with_capacity(n);
    for _ in 0..n {
        let report = timeout(TEST_TIMEOUT, poll.run_cycle())
            .await
            .expect("cycle timed out")
            .expect("listing failed");
        reports.push(report);
    }
    reports
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn replies_in_thread_and_reports() {
    let h = harness(
        FakeMailbox::with(vec![email(
            "m1",
            "Alice <alice@example.com>",
            "Quote request",
            "<abc@x>",
            "Hi, could you send a quote for 20 units?",
        )]),
        FakeLlm::answering("Thanks, here is our quote..."),
        Settings::default(),
    );

    let (report, state) = one_cycle(&h.ctx).await;
    assert_eq!(report.listed, 1);
    assert_eq!(report.replied, 1);
    assert_eq!(report.fallback_replies, 0);
    assert_eq!(state, PollState::Processing { index: 1, total: 1 });

    let sent = h.mailbox.sent();
    assert_eq!(sent.len(), 1);
    let reply = &sent[0];
    assert_eq!(reply.subject, "Re: Quote request");
    assert_eq!(reply.in_reply_to.as_deref(), Some("<abc@x>"));
    assert_eq!(reply.references, vec!["<abc@x>"]);
    assert_eq!(reply.body, "Thanks, here is our quote...");
    assert_eq!(reply.thread_id.as_deref(), Some("thread-m1"));

    let raw = String::from_utf8(reply.raw.clone()).unwrap();
    assert!(raw.contains("In-Reply-To: <abc@x>"));
    assert!(raw.contains("References: <abc@x>"));

    assert_eq!(h.mailbox.marked(), vec!["m1"]);

    let reports = h.notifier.reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].contains("Alice <alice@example.com>"));
    assert!(reports[0].contains("Hi, could you send a quote for 20 units?"));
    assert!(reports[0].contains("Thanks, here is our quote..."));
    assert!(reports[0].contains("2026-02-22 13:45:10 WIB"));
    assert!(reports[0].contains("✅"));
}

#[tokio::test]
async fn send_failure_leaves_message_unread() {
    let mut mailbox = FakeMailbox::with(vec![
        email("m1", "Bob <bob@flaky.test>", "Hello", "<b1@x>", "ping"),
        email("m2", "Carol <carol@example.com>", "Hi", "<c1@x>", "pong"),
    ]);
    mailbox.fail_send.insert("bob@flaky.test".into());
    let h = harness(mailbox, FakeLlm::answering("Noted."), Settings::default());

    let (report, _) = one_cycle(&h.ctx).await;
    assert_eq!(report.send_failures, 1);
    assert_eq!(report.replied, 1);
    assert_eq!(h.mailbox.marked(), vec!["m2"]);

    let reports = h.notifier.reports.lock().unwrap().clone();
    assert!(reports[0].contains("❌"));
    assert!(reports[1].contains("✅"));

    // Still unread, so the next cycle tries again.
    let (again, _) = one_cycle(&h.ctx).await;
    assert_eq!(again.listed, 1);
    assert_eq!(again.send_failures, 1);
}

#[tokio::test]
async fn generation_failure_sends_fallback() {
    let h = harness(
        FakeMailbox::with(vec![email(
            "m1",
            "Alice <alice@example.com>",
            "Re: Invoice",
            "<inv@x>",
            "Where is my invoice?",
        )]),
        FakeLlm::failing(),
        Settings::default(),
    );

    let (report, _) = one_cycle(&h.ctx).await;
    assert_eq!(report.replied, 1);
    assert_eq!(report.fallback_replies, 1);
    assert_eq!(*h.llm.calls.lock().unwrap(), 1);

    let sent = h.mailbox.sent();
    assert_eq!(sent[0].body, UNAVAILABLE_FALLBACK);
    assert_eq!(sent[0].subject, "Re: Invoice");
    assert_eq!(sent[0].in_reply_to.as_deref(), Some("<inv@x>"));
    assert_eq!(h.mailbox.marked(), vec!["m1"]);

    let reports = h.notifier.reports.lock().unwrap();
    assert!(reports[0].contains("⚠️"));
}

#[tokio::test]
async fn self_sent_mail_is_marked_read_without_reply() {
    let h = harness(
        FakeMailbox::with(vec![email(
            "m1",
            "NovaMail <BOT@novamail.test>",
            "Re: Quote request",
            "<self@x>",
            "our own reply",
        )]),
        FakeLlm::answering("should not be used"),
        Settings::default(),
    );

    let (report, _) = one_cycle(&h.ctx).await;
    assert_eq!(report.skipped, 1);
    assert!(h.mailbox.sent().is_empty());
    assert_eq!(h.mailbox.marked(), vec!["m1"]);
    assert_eq!(*h.llm.calls.lock().unwrap(), 0);
    assert!(h.notifier.reports.lock().unwrap().is_empty());
}

#[tokio::test]
async fn blocked_sender_is_left_unread() {
    let settings = Settings {
        allowed_senders: vec!["@example.com".into()],
        ..Settings::default()
    };
    let h = harness(
        FakeMailbox::with(vec![
            email("m1", "Spam <deals@spam.test>", "WIN", "<s@x>", "click"),
            email("m2", "Alice <alice@example.com>", "Hi", "<a@x>", "hello"),
        ]),
        FakeLlm::answering("Hello back"),
        settings,
    );

    let (report, _) = one_cycle(&h.ctx).await;
    assert_eq!(report.skipped, 1);
    assert_eq!(report.replied, 1);
    assert_eq!(h.mailbox.marked(), vec!["m2"]);
    assert_eq!(*h.mailbox.unread.lock().unwrap(), vec!["m1"]);
}

#[tokio::test]
async fn fetch_failure_does_not_stop_cycle() {
    let mailbox = FakeMailbox::with(vec![email(
        "m2",
        "Alice <alice@example.com>",
        "Hi",
        "<a@x>",
        "hello",
    )]);
    mailbox.unread.lock().unwrap().insert(0, "ghost".into());
    let h = harness(mailbox, FakeLlm::answering("Hello back"), Settings::default());

    let (report, state) = one_cycle(&h.ctx).await;
    assert_eq!(report.listed, 2);
    assert_eq!(report.errors, 1);
    assert_eq!(report.replied, 1);
    assert_eq!(state, PollState::Processing { index: 2, total: 2 });
}

#[tokio::test]
async fn empty_inbox_reports_nothing() {
    let h = harness(FakeMailbox::default(), FakeLlm::answering("x"), Settings::default());
    let (report, state) = one_cycle(&h.ctx).await;
    assert_eq!(report, CycleReport::default());
    assert_eq!(state, PollState::Fetching);
}

#[tokio::test]
async fn max_per_cycle_bounds_work() {
    let messages = (1..=5)
        .map(|i| {
            email(
                &format!("m{i}"),
                "Alice <alice@example.com>",
                "Hi",
                &format!("<{i}@x>"),
                "hello",
            )
        })
        .collect();
    let settings = Settings {
        max_per_cycle: 2,
        ..Settings::default()
    };
    let h = harness(FakeMailbox::with(messages), FakeLlm::answering("ok"), settings);

    let (report, _) = one_cycle(&h.ctx).await;
    assert_eq!(report.listed, 2);
    assert_eq!(h.mailbox.marked(), vec!["m1", "m2"]);
}

#[tokio::test]
async fn run_stops_on_shutdown_signal() {
    let settings = Settings {
        poll_interval: Duration::from_secs(3600),
        ..Settings::default()
    };
    let h = harness(FakeMailbox::default(), FakeLlm::answering("x"), settings);

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = tx.send(true);
    });

    let mut poll = PollLoop::new(&h.ctx, rx);
    let cycles = timeout(TEST_TIMEOUT, poll.run())
        .await
        .expect("loop did not stop on shutdown");
    assert_eq!(cycles, 1);
    assert_eq!(poll.state(), PollState::Sleeping);
}

#[tokio::test]
async fn blocked_backlog_does_not_starve_new_mail() {
    let settings = Settings {
        allowed_senders: vec!["@example.com".into()],
        max_per_cycle: 2,
        ..Settings::default()
    };
    let h = harness(
        FakeMailbox::with(vec![
            email("s1", "Spam <a@spam.test>", "WIN", "<s1@x>", "click"),
            email("s2", "Spam <b@spam.test>", "WIN", "<s2@x>", "click"),
            email("m3", "Alice <alice@example.com>", "Hi", "<m3@x>", "hello"),
        ]),
        FakeLlm::answering("Hello back"),
        settings,
    );

    let reports = cycles(&h.ctx, 3).await;
    assert_eq!(reports[0].skipped, 2);
    assert_eq!(reports[1].replied, 1);
    assert_eq!(reports[1].ignored, 2);
    assert_eq!(reports[2].processed(), 0);

    assert_eq!(h.mailbox.marked(), vec!["m3"]);
    assert_eq!(h.mailbox.sent().len(), 1);
    assert_eq!(*h.mailbox.unread.lock().unwrap(), vec!["s1", "s2"]);
}

#[tokio::test]
async fn send_failures_do_not_starve_new_mail() {
    let mut mailbox = FakeMailbox::with(vec![
        email("f1", "Bob <bob@flaky.test>", "Hello", "<f1@x>", "ping"),
        email("m2", "Alice <alice@example.com>", "Hi", "<m2@x>", "hello"),
    ]);
    mailbox.fail_send.insert("bob@flaky.test".into());
    let settings = Settings {
        max_per_cycle: 1,
        ..Settings::default()
    };
    let h = harness(mailbox, FakeLlm::answering("Noted."), settings);

    let reports = cycles(&h.ctx, 3).await;
    assert_eq!(reports[0].send_failures, 1);
    assert_eq!(reports[1].replied, 1);
    // Only the failed one is left, so it is retried.
    assert_eq!(reports[2].send_failures, 1);
    assert_eq!(h.mailbox.marked(), vec!["m2"]);
}

#[tokio::test]
async fn unrepliable_sender_is_never_sent_to_the_model() {
    let mut no_from = email("m1", "x", "Orphan", "<o@x>", "who am I");
    no_from.headers.retain(|h| h.name != "From");
    let h = harness(
        FakeMailbox::with(vec![no_from]),
        FakeLlm::answering("should not be used"),
        Settings::default(),
    );

    let reports = cycles(&h.ctx, 3).await;
    assert_eq!(reports[0].skipped, 1);
    assert_eq!(reports[1].ignored, 1);
    assert_eq!(reports[2].processed(), 0);
    assert_eq!(*h.llm.calls.lock().unwrap(), 0);
    assert!(h.mailbox.sent().is_empty());
    assert!(h.mailbox.marked().is_empty());
}
