use std::collections::HashMap;

use crossterm::event::Event;

use crate::protocol::{CommandLabel, PendingCommand};
use crate::serial::TransportEvent;
use crate::transfer::DownloadResponse;

/// Well-known bus topics besides the command labels.
pub mod topic {
    pub const STATUS_CONNECTED: &str = "statusConn";
    pub const STATUS_DISCONNECTED: &str = "statusDisc";
    pub const START_PROGRESS: &str = "startProgress";
    pub const UPDATE_PROGRESS: &str = "updatePercentage";
    pub const DOWNLOAD_FINISHED: &str = "downloadFinished";
    pub const TREE_REFRESH: &str = "treeRefresh";
    pub const NOTIFICATION: &str = "notification";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    Info,
    Error,
}

/// A message meant for the user, not the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub level: NotifyLevel,
    pub message: String,
}

impl Notification {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NotifyLevel::Info,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NotifyLevel::Error,
            message: message.into(),
        }
    }
}

/// Payloads carried on the event bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// Raw reply text for the command pending on `session`.
    Reply { session: String, text: String },
    /// Completion status of a file download on `session`.
    Download {
        session: String,
        response: DownloadResponse,
    },
    Progress { index: usize, total: usize },
    Percent(u8),
    Notify(Notification),
    Signal,
}

impl BusEvent {
    /// Session a command reply belongs to, if this is one.
    pub fn session(&self) -> Option<&str> {
        match self {
            Self::Reply { session, .. } | Self::Download { session, .. } => Some(session),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Handler = Box<dyn FnMut(&BusEvent) + Send>;

/// String-topic publish/subscribe with synchronous, in-order delivery.
#[derive(Default)]
pub struct EventBus {
    next_id: u64,
    subscribers: HashMap<String, Vec<(SubscriptionId, Handler)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&mut self, topic: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: FnMut(&BusEvent) + Send + 'static,
    {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers
            .entry(topic.into())
            .or_default()
            .push((id, Box::new(handler)));
        id
    }

    /// Remove one subscription. Returns false if it was already gone.
    pub fn off(&mut self, id: SubscriptionId) -> bool {
        for handlers in self.subscribers.values_mut() {
            if let Some(pos) = handlers.iter().position(|(sub, _)| *sub == id) {
                handlers.remove(pos);
                return true;
            }
        }
        false
    }

    /// Deliver `event` to every subscriber of `topic`, returning how many ran.
    pub fn emit(&mut self, topic: &str, event: &BusEvent) -> usize {
        let Some(handlers) = self.subscribers.get_mut(topic) else {
            tracing::trace!("No subscribers for topic {}", topic);
            return 0;
        };
        for (_, handler) in handlers.iter_mut() {
            handler(event);
        }
        handlers.len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers.get(topic).map_or(0, Vec::len)
    }
}

/// Events driving the controller loop.
#[derive(Debug)]
pub enum AppEvent {
    Input(Event),
    Transport {
        session: String,
        event: TransportEvent,
    },
    /// The reconnect poll saw the session's port again.
    DeviceReappeared {
        session: String,
    },
    /// Re-emit the command token so a parser can finish a reply with no terminator.
    CommandSentinel {
        session: String,
        command: PendingCommand,
    },
    /// Settle delay after a finished command elapsed; leave Command-Pending.
    CommandSettled {
        session: String,
        command: PendingCommand,
    },
    /// Next paced line of an in-band file push.
    PushLine {
        session: String,
        line: String,
        index: usize,
        total: usize,
    },
    /// External transfer or flash tool progress line.
    ToolProgress {
        session: String,
        percent: Option<u8>,
    },
    /// File download finished (either path).
    DownloadDone {
        session: String,
        label: CommandLabel,
        response: DownloadResponse,
    },
    /// Firmware flash tool exited.
    FlashDone {
        success: bool,
    },
    Tick,
}
