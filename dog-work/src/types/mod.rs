pub mod ids;
pub mod args;
pub mod envelope;
pub mod claim;
pub mod events;

pub use ids::{JobId, ClaimToken};
pub use args::{ArgValue, Arguments};
pub use envelope::Envelope;
pub use claim::ClaimedJob;
pub use events::JobEvent;
