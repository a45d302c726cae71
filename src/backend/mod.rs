//! Collaborators the daemon core depends on but does not own: the directory
//! walker used for crawls and the kernel notification source.

pub mod notifier;
pub mod walker;
