// Library root: the extension's execution contexts and the bus between them.
// Re-exported so integration tests and the binary share one API.

pub mod background;
pub mod browser;
pub mod bus;
pub mod content;
pub mod popup;
