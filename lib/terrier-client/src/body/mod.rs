//! Request and response body wrappers used by the retry loop.

mod preview;
mod replay;

pub use self::preview::{ContentPreview, PreviewedBody};
pub use self::replay::ReplayBody;
