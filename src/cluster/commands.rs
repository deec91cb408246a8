//! Cluster RPC commands and the pending-request record.
//!
//! Every operation travels as a tagged [`Command`] and comes back as the
//! matching [`CommandReply`] variant, both as a standalone call and inside a
//! batch. Keeping the variants tagged end to end means the batch completion
//! path is an exhaustive match instead of a name/any dance.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::rpc::{Codec, HandlerRegistry, Handlers, HandlersError};
use crate::store::{Store, StoreError};

pub const METHOD_GET: &str = "Cluster.Get";
pub const METHOD_SET: &str = "Cluster.Set";
pub const METHOD_DELETE: &str = "Cluster.Delete";
pub const METHOD_BATCH: &str = "Cluster.Batch";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetArgs {
    pub key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetReply {
    pub value_bytes: Vec<u8>,
    pub exists: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetArgs {
    pub key: String,
    pub value_bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetReply {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteArgs {
    pub key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteReply {}

/// One cache operation, tagged by kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    Get(GetArgs),
    Set(SetArgs),
    Delete(DeleteArgs),
}

impl Command {
    pub fn key(&self) -> &str {
        match self {
            Command::Get(args) => &args.key,
            Command::Set(args) => &args.key,
            Command::Delete(args) => &args.key,
        }
    }

    pub fn service_method(&self) -> &'static str {
        match self {
            Command::Get(_) => METHOD_GET,
            Command::Set(_) => METHOD_SET,
            Command::Delete(_) => METHOD_DELETE,
        }
    }
}

/// Reply to a [`Command`], same tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommandReply {
    Get(GetReply),
    Set(SetReply),
    Delete(DeleteReply),
}

/// An ordered batch of commands for one owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchArgs {
    pub requests: Vec<Command>,
}

/// Replies indexed to match [`BatchArgs::requests`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReply {
    pub responses: Vec<CommandReply>,
}

/// A pending operation: enqueued on the outbox, observed by exactly one
/// batch, completed exactly once.
///
/// The reply slot is written before the done flag flips; waiters sleep on
/// the notify rather than spinning.
pub(crate) struct KeyRequest {
    pub command: Command,
    reply: Mutex<Option<CommandReply>>,
    done: AtomicBool,
    notify: Notify,
}

impl KeyRequest {
    pub fn new(command: Command) -> Arc<Self> {
        Arc::new(Self {
            command,
            reply: Mutex::new(None),
            done: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    /// Complete the request. Failures complete with `None`, leaving the
    /// zero-valued reply in place. Later completions are ignored.
    pub fn complete(&self, reply: Option<CommandReply>) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        if let Some(reply) = reply {
            *self.reply.lock() = Some(reply);
        }
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Wait until completion or until `deadline` elapses. Returns whether
    /// the request completed.
    pub async fn wait(&self, deadline: Duration) -> bool {
        if self.done.load(Ordering::Acquire) {
            return true;
        }

        let _ = tokio::time::timeout(deadline, async {
            loop {
                let notified = self.notify.notified();
                if self.done.load(Ordering::Acquire) {
                    break;
                }
                notified.await;
            }
        })
        .await;

        self.done.load(Ordering::Acquire)
    }

    pub fn take_reply(&self) -> Option<CommandReply> {
        self.reply.lock().take()
    }
}

/// Executes commands against the local store and exposes them over RPC.
#[derive(Clone)]
pub struct CommandHandlers {
    store: Arc<Store>,
}

impl CommandHandlers {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Run one command locally and produce its reply. Store misses read as
    /// zero-valued replies, never errors.
    pub(crate) fn run(&self, command: &Command) -> CommandReply {
        match command {
            Command::Get(args) => CommandReply::Get(self.get(args)),
            Command::Set(args) => CommandReply::Set(self.set(args)),
            Command::Delete(args) => CommandReply::Delete(self.delete(args)),
        }
    }

    fn get(&self, args: &GetArgs) -> GetReply {
        match self.store.get(&args.key) {
            Ok(value_bytes) => GetReply {
                value_bytes,
                exists: true,
            },
            Err(_) => GetReply::default(),
        }
    }

    fn set(&self, args: &SetArgs) -> SetReply {
        if let Err(err) = self.store.set(&args.key, args.value_bytes.clone()) {
            tracing::warn!(%err, key = %args.key, "set rejected by store");
        }
        SetReply {}
    }

    fn delete(&self, args: &DeleteArgs) -> DeleteReply {
        // A missing key is the desired end state, not an error.
        match self.store.delete(&args.key) {
            Ok(()) | Err(StoreError::NotFound) => {}
            Err(err) => tracing::warn!(%err, key = %args.key, "delete rejected by store"),
        }
        DeleteReply {}
    }
}

impl<C: Codec> Handlers<C> for CommandHandlers {
    fn register(&self, registry: &mut HandlerRegistry<C>) -> Result<(), HandlersError> {
        let handlers = self.clone();
        registry.register::<GetArgs, GetReply, _>(METHOD_GET, move |args| Ok(handlers.get(&args)))?;

        let handlers = self.clone();
        registry.register::<SetArgs, SetReply, _>(METHOD_SET, move |args| Ok(handlers.set(&args)))?;

        let handlers = self.clone();
        registry.register::<DeleteArgs, DeleteReply, _>(METHOD_DELETE, move |args| {
            Ok(handlers.delete(&args))
        })?;

        let handlers = self.clone();
        registry.register::<BatchArgs, BatchReply, _>(METHOD_BATCH, move |args| {
            let responses = args
                .requests
                .iter()
                .map(|command| handlers.run(command))
                .collect();
            Ok(BatchReply { responses })
        })?;

        Ok(())
    }
}
