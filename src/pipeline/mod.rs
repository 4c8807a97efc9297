//! Reply pipeline.
//!
//! Every unread message flows through:
//! 1. `extract::extract()`: headers, body, timestamp, quote split
//! 2. `generate::generate_reply()`: one completion attempt, fallback text on failure
//! 3. `compose::compose_reply()`: threaded RFC 2822 reply
//! 4. `Mailbox::send_reply()` then `Mailbox::mark_read()`: read only after a successful send
//! 5. `notify::dispatch()`: outcome report, best effort
//!
//! `poll_loop::PollLoop` repeats this on a fixed interval.

pub mod compose;
pub mod extract;
pub mod generate;
pub mod notify;
pub mod poll_loop;
pub mod processor;
pub mod types;
