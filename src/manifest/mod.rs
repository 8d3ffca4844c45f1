pub mod errors;
pub mod models;
pub mod source;
pub mod stream_selector;

pub use errors::ManifestError;
pub use models::{
    EncryptionKey, InitSegment, ManifestShape, MediaKind, MediaSegment, ParsedManifest, Protocol,
    Representation, RepresentationContent, Timeline, TrackSelection,
};
pub use source::{JsonManifestSource, ManifestSource};
pub use stream_selector::StreamSelector;
