//! PDF writing for incremental updates.
//!
//! ## Architecture
//!
//! ```text
//! SourceDocument (original bytes, untouched)
//!     ↓
//! [IncrementalUpdate] (new and replaced objects, numbered from /Size)
//!     ↓
//! [ObjectSerializer] (serializes PDF objects)
//!     ↓
//! original bytes + objects + xref section + trailer
//! ```
//!
//! Visible signatures get a Form XObject from [`AppearanceStreamBuilder`].

mod appearance_stream;
mod incremental;
mod object_serializer;

pub use appearance_stream::{AppearanceStreamBuilder, text_width};
pub use incremental::{IncrementalUpdate, UpdateLayout};
pub use object_serializer::ObjectSerializer;
