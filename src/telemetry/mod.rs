//! Telemetry decoding and the object store.
//!
//! Raw payloads are decoded with family-specific layouts into an
//! `ObjectStore`, which is serialized to a sectioned INI file and shared
//! read-only with every downstream phase.

pub mod decoder;
pub mod ini;
pub mod layout;
pub mod object;

pub use decoder::{decode, encode_payload, load, Decoder, DecoderError, PayloadHeader};
pub use ini::IniError;
pub use layout::{FamilyLayout, FieldKind, FieldLayout, LayoutCatalog, ObjectLayout};
pub use object::{FieldValue, Object, ObjectStore};
