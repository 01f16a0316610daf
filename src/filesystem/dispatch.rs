use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use super::parsers::{
    Completion, DownloadParser, ListingParser, MkdirParser, RemoveParser, ReplyParser,
    RunScriptParser,
};
use super::tree::FileTree;
use crate::events::{BusEvent, EventBus, SubscriptionId};
use crate::protocol::CommandLabel;

/// Label → parser table. Each command's reply completes at most once.
pub struct ReplyDispatcher {
    parsers: HashMap<CommandLabel, Box<dyn ReplyParser>>,
    completed: HashSet<CommandLabel>,
}

impl Default for ReplyDispatcher {
    fn default() -> Self {
        let mut dispatcher = Self::empty();
        dispatcher.register(CommandLabel::ListDir, ListingParser::new(CommandLabel::ListDir));
        dispatcher.register(
            CommandLabel::BootstrapList,
            ListingParser::new(CommandLabel::BootstrapList),
        );
        dispatcher.register(CommandLabel::RunScript, RunScriptParser::new());
        dispatcher.register(
            CommandLabel::RemoveFile,
            RemoveParser::new(CommandLabel::RemoveFile),
        );
        dispatcher.register(
            CommandLabel::RemoveDir,
            RemoveParser::new(CommandLabel::RemoveDir),
        );
        dispatcher.register(CommandLabel::CreateDir, MkdirParser::new());
        dispatcher.register(CommandLabel::DownloadFile, DownloadParser);
        dispatcher.register(CommandLabel::SelectiveDownload, DownloadParser);
        dispatcher
    }
}

impl ReplyDispatcher {
    pub fn empty() -> Self {
        Self {
            parsers: HashMap::new(),
            completed: HashSet::new(),
        }
    }

    pub fn register(&mut self, label: CommandLabel, parser: impl ReplyParser + 'static) {
        self.parsers.insert(label, Box::new(parser));
    }

    /// A new command with `label` was issued: forget any earlier reply.
    pub fn begin(&mut self, label: CommandLabel) {
        self.completed.remove(&label);
        if let Some(parser) = self.parsers.get_mut(&label) {
            parser.reset();
        }
    }

    pub fn dispatch(
        &mut self,
        label: CommandLabel,
        event: &BusEvent,
        tree: &mut FileTree,
    ) -> Option<Completion> {
        if self.completed.contains(&label) {
            return None;
        }
        let Some(parser) = self.parsers.get_mut(&label) else {
            tracing::warn!("No reply parser registered for {}", label);
            return None;
        };
        let completion = parser.feed(event, tree)?;
        tracing::debug!("Reply for {} complete: {:?}", label, completion);
        self.completed.insert(label);
        Some(completion)
    }
}

/// Collects bus traffic on every command topic for the controller to drain.
#[derive(Clone, Default)]
pub struct ReplyInbox {
    queue: Arc<Mutex<VecDeque<(CommandLabel, BusEvent)>>>,
}

impl ReplyInbox {
    pub fn subscribe(bus: &mut EventBus) -> (Self, Vec<SubscriptionId>) {
        let inbox = Self::default();
        let ids = CommandLabel::ALL
            .into_iter()
            .map(|label| {
                let queue = Arc::clone(&inbox.queue);
                bus.on(label.topic(), move |event| {
                    if let Ok(mut queue) = queue.lock() {
                        queue.push_back((label, event.clone()));
                    }
                })
            })
            .collect();
        (inbox, ids)
    }

    pub fn drain(&self) -> Vec<(CommandLabel, BusEvent)> {
        match self.queue.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }
}
