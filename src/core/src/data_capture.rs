pub mod command_recorder;
pub mod queue;
pub mod recorder;
pub mod replay_recorder;
pub mod tty_parser;
pub mod types;

pub use command_recorder::{CommandStore, JsonLinesStore, LogStore, QueuedCommandRecorder};
pub use queue::BoundedQueue;
pub use recorder::{CommandRecorder, NullRecorder, ReplayRecorder};
pub use replay_recorder::FileReplayRecorder;
pub use tty_parser::{ScreenParser, TtyParser};
pub use types::{CommandEvent, ReplayEvent};
