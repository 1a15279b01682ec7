//! Mock adapter transport for testing.
//!
//! Supports per-command scripted replies, a stateful responder hook, and
//! recording of every written command. All tests use this instead of a real
//! adapter so the suite runs in CI on any platform.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::transport::{Transport, TransportFailure, TransportResult};

/// How the mock answers one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Reply text, delivered on the next read.
    Text(String),
    /// Transport failure on the next read.
    Fatal(String),
    /// Never answers.
    Silent,
    /// Answers only after the reader has given up once; the text is then
    /// waiting in front of the next read.
    Late(String),
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        MockReply::Text(text.into())
    }
}

type Responder = Box<dyn FnMut(&str) -> Option<MockReply> + Send>;

struct MockState {
    /// One-shot replies consumed in order before `persistent` is consulted.
    scripted: HashMap<String, VecDeque<MockReply>>,
    persistent: HashMap<String, MockReply>,
    responder: Option<Responder>,
    fallback: MockReply,
    /// Replies owed for written commands, oldest first.
    pending: VecDeque<MockReply>,
    sent: Vec<String>,
}

/// Scripted transport with command recording.
///
/// Cloning yields another handle on the same state, so a test can keep one
/// handle while the other moves into the command queue.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

fn key(command: &str) -> String {
    command
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

impl MockTransport {
    /// Create a mock that answers `?` to anything unscripted.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                scripted: HashMap::new(),
                persistent: HashMap::new(),
                responder: None,
                fallback: MockReply::text("?"),
                pending: VecDeque::new(),
                sent: Vec::new(),
            })),
        }
    }

    /// Always answer `command` with `reply`.
    pub fn on(&self, command: &str, reply: impl Into<String>) -> &Self {
        self.on_reply(command, MockReply::Text(reply.into()))
    }

    pub fn on_reply(&self, command: &str, reply: MockReply) -> &Self {
        self.state
            .lock()
            .unwrap()
            .persistent
            .insert(key(command), reply);
        self
    }

    /// Answer the next `replies.len()` sends of `command` in order.
    pub fn on_sequence<I, S>(&self, command: &str, replies: I) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.lock().unwrap();
        let queue = state.scripted.entry(key(command)).or_default();
        queue.extend(replies.into_iter().map(|r| MockReply::Text(r.into())));
        drop(state);
        self
    }

    /// Queue a single one-shot reply of any kind.
    pub fn queue_reply(&self, command: &str, reply: MockReply) -> &Self {
        self.state
            .lock()
            .unwrap()
            .scripted
            .entry(key(command))
            .or_default()
            .push_back(reply);
        self
    }

    /// Fail the transport whenever `command` is sent.
    pub fn fail_on(&self, command: &str) -> &Self {
        self.on_reply(command, MockReply::Fatal(format!("link lost during {command}")))
    }

    /// Reply used when nothing else matches.
    pub fn set_fallback(&self, reply: MockReply) -> &Self {
        self.state.lock().unwrap().fallback = reply;
        self
    }

    /// Install a responder consulted before any script. Returning `None`
    /// falls through to the scripted replies.
    pub fn set_responder<F>(&self, responder: F) -> &Self
    where
        F: FnMut(&str) -> Option<MockReply> + Send + 'static,
    {
        self.state.lock().unwrap().responder = Some(Box::new(responder));
        self
    }

    /// Copies of every command written, in order.
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Get the last sent command, if any.
    pub fn last_sent(&self) -> Option<String> {
        self.state.lock().unwrap().sent.last().cloned()
    }

    /// How many times `command` was written.
    pub fn sent_count(&self, command: &str) -> usize {
        let wanted = key(command);
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|c| key(c) == wanted)
            .count()
    }

    pub fn clear_sent(&self) {
        self.state.lock().unwrap().sent.clear();
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write_command(&mut self, command: &str) -> TransportResult<()> {
        let mut state = self.state.lock().unwrap();
        state.sent.push(command.to_string());

        let lookup = key(command);
        let from_responder = state.responder.as_mut().and_then(|r| r(&lookup));
        let reply = match from_responder {
            Some(reply) => reply,
            None => {
                let scripted = state
                    .scripted
                    .get_mut(&lookup)
                    .and_then(|queue| queue.pop_front());
                scripted
                    .or_else(|| state.persistent.get(&lookup).cloned())
                    .unwrap_or_else(|| state.fallback.clone())
            }
        };
        state.pending.push_back(reply);
        Ok(())
    }

    async fn read_reply(&mut self) -> TransportResult<String> {
        let next = self.state.lock().unwrap().pending.pop_front();
        match next {
            Some(MockReply::Text(text)) => Ok(text),
            Some(MockReply::Fatal(reason)) => Err(TransportFailure(reason)),
            Some(MockReply::Late(text)) => {
                self.state
                    .lock()
                    .unwrap()
                    .pending
                    .push_front(MockReply::Text(text));
                std::future::pending().await
            }
            Some(MockReply::Silent) | None => std::future::pending().await,
        }
    }
}
