#![forbid(unsafe_code)]

mod draft_locks;
mod jobs;
mod runs;

pub use draft_locks::*;
pub use jobs::*;
pub use runs::*;
