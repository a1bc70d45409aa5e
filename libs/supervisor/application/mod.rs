//! Application Layer
//!
//! Orchestration on top of the domain ports: the position watcher and its
//! guard, pre-trade validation, the confirmation-gated intake and the
//! operator command surface.

pub mod commands;
pub mod controller;
pub mod guard;
pub mod intake;
pub mod snapshot;
pub mod validator;
pub mod watcher;

pub use commands::{Command, CommandHandler};
pub use controller::ModeController;
pub use guard::SlPlacementGuard;
pub use intake::{BuyOutcome, ConfirmOutcome, OrderIntake};
pub use snapshot::SnapshotCache;
pub use validator::{BuyCheck, OrderValidator, Validation};
pub use watcher::{PollOutcome, PositionWatcher, WatcherConfig};
