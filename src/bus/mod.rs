pub mod command;
pub mod event;

pub use command::{Command, CommandBus, CommandHandler, CommandKind};
pub use event::{Event, EventBus, EventHandler, EventPayload, EventSubscriber, EventType, LoggingSubscriber};
