//! Resumption: mapping an opaque remote snapshot onto session state.
//!
//! The remote side reports progress as a status token plus whatever
//! payloads it has. [`classify_token`] is the fixed, total classification
//! table; [`resolve`] turns a snapshot into the `ResumeTo` event applied by
//! the coordinator. Unrecognized tokens are never guessed at: they resolve
//! to [`Resolution::Unknown`] and the coordinator keeps polling without
//! changing displayed state.

mod resolver;
mod snapshot;

pub use resolver::{classify_token, resolve, Resolution, TokenClass};
pub use snapshot::RemoteSnapshot;
