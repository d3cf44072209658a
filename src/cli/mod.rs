pub mod terminal;
pub mod visualization;

pub use terminal::{check_for_escape, run_interactive, RawModeGuard, TerminalNotifier};
pub use visualization::annotate_detections;
