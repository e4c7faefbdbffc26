pub mod background_sync;
pub mod clock_service;
pub mod field_service;
pub mod id_map_service;
pub mod normalize;
pub mod photo_service;
pub mod queue_service;
pub mod remap_service;
pub mod resolver;
pub mod sync_service;
