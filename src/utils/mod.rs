mod bytes;
mod plurals;

pub use bytes::format_bytes;
pub use plurals::pluralize;
