//! Change notification and settled live queries
//!
//! Every committed write publishes a [`ChangeEvent`] on the [`ChangeBus`].
//! A [`LiveQuery`] re-runs its query for matching events, but holds the
//! refresh back while its service is capturing a photo or inside the
//! cooldown after a user edit, then emits once.

pub mod bus;
pub mod gate;
pub mod live_query;

pub use bus::{ChangeBus, ChangeEvent, ChangeOrigin, ChangeTable, Scope};
pub use gate::{CaptureGuard, CaptureState, Quiet, SettleGate};
pub use live_query::LiveQuery;
