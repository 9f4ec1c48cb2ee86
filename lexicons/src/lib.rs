//! Domain record types for the `social.arabica.alpha.*` collections.
//!
//! These mirror the shape of lexicon-generated records in the wider jacquard
//! ecosystem, but are written by hand: the schemas here are small and fixed,
//! so there is no generator step. Each type derives `Serialize`/`Deserialize`
//! with `camelCase` wire fields and flattens unrecognized properties into
//! `extra`, so a record produced by a newer client version round-trips
//! through an older AppView without losing data.

pub mod bean;
pub mod brew;
pub mod brewer;
pub mod grinder;
pub mod roaster;

pub use jacquard_common::types::string::Datetime;

/// Domain records never borrow from wire input, so every `AtUri`/`Did` they
/// hold is `'static` — aliased here so the per-field lifetime stays out of
/// every struct definition below.
pub type AtUri = jacquard_common::types::string::AtUri<'static>;
pub type Did = jacquard_common::types::string::Did<'static>;

/// Reverse-DNS collection identifiers for the application's record types.
pub mod nsid {
    pub const ROASTER: &str = "social.arabica.alpha.roaster";
    pub const BEAN: &str = "social.arabica.alpha.bean";
    pub const GRINDER: &str = "social.arabica.alpha.grinder";
    pub const BREWER: &str = "social.arabica.alpha.brewer";
    pub const BREW: &str = "social.arabica.alpha.brew";

    pub const ALL: &[&str] = &[ROASTER, BEAN, GRINDER, BREWER, BREW];
}

pub use bean::Bean;
pub use brew::{Brew, Pour};
pub use brewer::Brewer;
pub use grinder::Grinder;
pub use roaster::Roaster;

/// Implemented by every domain record so the codec and local index can stay
/// generic over collection type.
pub trait Record: serde::Serialize + serde::de::DeserializeOwned {
    const NSID: &'static str;

    fn created_at(&self) -> &Datetime;
}
