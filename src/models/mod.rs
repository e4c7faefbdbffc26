pub mod sync_item;
pub mod sync_settings;
pub mod visual_field;

pub use sync_item::{EntityType, ItemStatus, SyncItem, SyncOp};
pub use sync_settings::SyncSettings;
pub use visual_field::{AnswerType, FieldKey, FieldKind, FieldUpdate, VisualField};
