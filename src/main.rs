use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use novamail::channels::{
    GmailMailbox, HeuristicQuoteSplitter, ImapMailbox, Mailbox, NoopNotifier, Notifier,
    TelegramNotifier,
};
use novamail::config::{AppConfig, MailboxConfig, env_lookup};
use novamail::context::AppContext;
use novamail::llm::create_provider;
use novamail::pipeline::poll_loop::PollLoop;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; the real environment still applies.
    let _ = dotenvy::dotenv();

    // Install rustls crypto provider before any TLS usage
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _log_guard = init_tracing(env_lookup("NOVAMAIL_LOG_DIR").map(PathBuf::from));

    let config = AppConfig::from_env().context("Invalid configuration")?;
    let settings = config.settings.clone();

    let llm = create_provider(&config.llm).context("Failed to create LLM provider")?;

    let mailbox_kind = config.mailbox.kind();
    let mailbox: Arc<dyn Mailbox> = match config.mailbox {
        MailboxConfig::Gmail(gmail) => {
            Arc::new(GmailMailbox::new(gmail).context("Failed to create Gmail client")?)
        }
        MailboxConfig::Imap(email) => Arc::new(ImapMailbox::new(email)),
    };

    let notifier: Arc<dyn Notifier> = match config.telegram {
        Some(telegram) => Arc::new(
            TelegramNotifier::new(telegram, settings.http_timeout)
                .context("Failed to create Telegram client")?,
        ),
        None => {
            tracing::warn!("TELEGRAM_TOKEN / TELEGRAM_CHAT_ID not set; notifications disabled");
            Arc::new(NoopNotifier)
        }
    };

    // Credential probe: fail fast before the loop starts.
    let own_address = mailbox
        .own_address()
        .await
        .with_context(|| format!("Mailbox credential check failed ({mailbox_kind})"))?;

    eprintln!("🎧 NovaMail v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm.model_name());
    eprintln!("   Mailbox: {} ({})", mailbox_kind, own_address);
    eprintln!("   Poll interval: {}s", settings.poll_interval.as_secs());
    eprintln!("   Notifications: {}", notifier.name());
    eprintln!("   Listening to your inbox. Ctrl-C to stop.\n");

    let ctx = AppContext::new(
        mailbox,
        llm,
        notifier,
        Arc::new(HeuristicQuoteSplitter),
        settings,
        own_address,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received; finishing current message");
        let _ = shutdown_tx.send(true);
    });

    PollLoop::new(&ctx, shutdown_rx).run().await;
    Ok(())
}

/// Stderr logging, plus a daily rolling file when `log_dir` is set.
fn init_tracing(log_dir: Option<PathBuf>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_target(false);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "novamail.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
