#![forbid(unsafe_code)]
//! Parsing for the worker's on-disk session files.
//!
//! The worker logs each session as newline-delimited JSON under a
//! sessions directory, one `*<uuid>.jsonl` file per thread. The gateway
//! treats that stream as opaque except for two read paths:
//!
//! - [`parse_timeline`] reconstructs UI timeline items
//!   (status/user/assistant/reasoning/tool) from the raw lines.
//! - [`ContextResolver`] recovers a thread's working directory from the
//!   leading `session_meta` record or the last `turn_context` record,
//!   with projection and home-directory fallbacks.

mod error;
mod resolver;
mod timeline;

pub use error::SessionLogError;
pub use resolver::{ContextResolver, ContextSource, ResolvedContext};
pub use timeline::{parse_timeline, TimelineItem, TimelineItemKind};

use std::path::Path;

/// Reads a session file into lines for [`parse_timeline`].
pub async fn read_session_lines(path: &Path) -> Result<Vec<String>, SessionLogError> {
    let content =
        tokio::fs::read_to_string(path)
            .await
            .map_err(|source| SessionLogError::Read {
                path: path.to_path_buf(),
                source,
            })?;
    Ok(content.lines().map(|line| line.to_string()).collect())
}
