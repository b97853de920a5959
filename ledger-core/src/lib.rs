//! Decision Ledger Core - Entity Types
//!
//! Pure data structures shared by every ledger crate: typed identifiers,
//! entities, the decision status state machine, errors, configuration,
//! clocks, outbound change events and the credential store contract.
//! This crate performs no storage I/O.

mod clock;
mod config;
mod entities;
mod enums;
mod error;
mod event;
mod ids;
mod secrets;

pub use clock::*;
pub use config::*;
pub use entities::*;
pub use enums::*;
pub use error::*;
pub use event::*;
pub use ids::*;
pub use secrets::*;
