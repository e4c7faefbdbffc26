use crate::error::AppError;
use crate::models::VisualField;
use crate::services::id_map_service;
use crate::services::photo_service::convert_error;
use local_images::{LocalImage, LocalImageService};
use rusqlite::Connection;
use std::collections::HashSet;

/// Which lookup found the photos
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionTier {
    /// Owner id equals the confirmed id
    Confirmed,
    /// Owner id equals the temporary id
    Temporary,
    /// Temporary id resolved forward through the id map
    MappedFromTemporary,
    /// Confirmed id resolved back to its temporary id through the id map
    MappedFromConfirmed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhotoResolution {
    /// `None` when no tier matched
    pub tier: Option<ResolutionTier>,
    pub images: Vec<LocalImage>,
}

impl PhotoResolution {
    fn empty() -> Self {
        Self {
            tier: None,
            images: Vec::new(),
        }
    }
}

/// The ids a caller knows for one visual
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldIds<'a> {
    pub temp: Option<&'a str>,
    pub confirmed: Option<&'a str>,
}

impl<'a> From<&'a VisualField> for FieldIds<'a> {
    fn from(field: &'a VisualField) -> Self {
        Self {
            temp: field.temp_visual_id.as_deref(),
            confirmed: field.visual_id.as_deref(),
        }
    }
}

/// Finds photos for a visual no matter which id they were filed under
///
/// Tiers run in order and the first non-empty one wins. An image is
/// returned by at most one tier.
pub fn resolve_photos(
    conn: &Connection,
    images: &LocalImageService,
    ids: FieldIds<'_>,
) -> Result<PhotoResolution, AppError> {
    let lookup = |id: &str| images.list_for_entity(conn, id).map_err(convert_error);

    if let Some(confirmed) = ids.confirmed {
        let found = lookup(confirmed)?;
        if !found.is_empty() {
            return Ok(resolution(ResolutionTier::Confirmed, found));
        }
    }

    if let Some(temp) = ids.temp {
        let found = lookup(temp)?;
        if !found.is_empty() {
            return Ok(resolution(ResolutionTier::Temporary, found));
        }

        if let Some(mapped) = id_map_service::confirmed_for(conn, temp)? {
            if ids.confirmed != Some(mapped.as_str()) {
                let found = lookup(&mapped)?;
                if !found.is_empty() {
                    return Ok(resolution(ResolutionTier::MappedFromTemporary, found));
                }
            }
        }
    }

    if let Some(confirmed) = ids.confirmed {
        if let Some(temp) = id_map_service::temp_for(conn, confirmed)? {
            if ids.temp != Some(temp.as_str()) {
                let found = lookup(&temp)?;
                if !found.is_empty() {
                    return Ok(resolution(ResolutionTier::MappedFromConfirmed, found));
                }
            }
        }
    }

    Ok(PhotoResolution::empty())
}

/// Resolves from a single id of unknown kind
pub fn resolve_for_id(
    conn: &Connection,
    images: &LocalImageService,
    id: &str,
    temp_prefix: &str,
) -> Result<PhotoResolution, AppError> {
    let ids = if id_map_service::is_temporary(id, temp_prefix) {
        FieldIds {
            temp: Some(id),
            confirmed: None,
        }
    } else {
        FieldIds {
            temp: None,
            confirmed: Some(id),
        }
    };
    resolve_photos(conn, images, ids)
}

/// Every photo filed under any id of the record, across all tiers
///
/// For removals: a photo captured under the temporary id after the owner
/// rewrite is not shadowed by the ones already moved to the confirmed id.
pub fn all_photos(
    conn: &Connection,
    images: &LocalImageService,
    ids: FieldIds<'_>,
) -> Result<Vec<LocalImage>, AppError> {
    let mut owners: Vec<String> = Vec::new();
    if let Some(confirmed) = ids.confirmed {
        owners.push(confirmed.to_string());
        owners.extend(id_map_service::temp_for(conn, confirmed)?);
    }
    if let Some(temp) = ids.temp {
        owners.push(temp.to_string());
        owners.extend(id_map_service::confirmed_for(conn, temp)?);
    }
    owners.sort();
    owners.dedup();

    let mut seen = HashSet::new();
    let mut found = Vec::new();
    for owner in &owners {
        for image in images.list_for_entity(conn, owner).map_err(convert_error)? {
            if seen.insert(image.image_id) {
                found.push(image);
            }
        }
    }
    Ok(found)
}

fn resolution(tier: ResolutionTier, images: Vec<LocalImage>) -> PhotoResolution {
    log::debug!("Resolved {} photos via {:?}", images.len(), tier);
    PhotoResolution {
        tier: Some(tier),
        images,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityType;
    use crate::testing::temp_images;
    use local_images::NewImage;

    fn setup() -> (Connection, LocalImageService) {
        (crate::database::init_in_memory().unwrap(), temp_images())
    }

    fn add(conn: &Connection, images: &LocalImageService, owner: &str) -> LocalImage {
        images
            .capture(conn, NewImage::new(vec![1, 2, 3], "visual", owner, "svc-1"))
            .unwrap()
    }

    #[test]
    fn test_confirmed_tier() {
        let (conn, images) = setup();
        add(&conn, &images, "4821");
        let res = resolve_photos(&conn, &images, FieldIds { temp: Some("temp_lbw_a"), confirmed: Some("4821") }).unwrap();
        assert_eq!(res.tier, Some(ResolutionTier::Confirmed));
        assert_eq!(res.images.len(), 1);
    }

    #[test]
    fn test_temporary_tier() {
        let (conn, images) = setup();
        add(&conn, &images, "temp_lbw_a");
        let res = resolve_photos(&conn, &images, FieldIds { temp: Some("temp_lbw_a"), confirmed: Some("4821") }).unwrap();
        assert_eq!(res.tier, Some(ResolutionTier::Temporary));
    }

    #[test]
    fn test_mapped_from_temporary_tier() {
        let (conn, images) = setup();
        add(&conn, &images, "4821");
        id_map_service::record_mapping(&conn, "temp_lbw_a", "4821", EntityType::Visual).unwrap();

        // Caller only knows the temporary id
        let res = resolve_photos(&conn, &images, FieldIds { temp: Some("temp_lbw_a"), confirmed: None }).unwrap();
        assert_eq!(res.tier, Some(ResolutionTier::MappedFromTemporary));
        assert_eq!(res.images.len(), 1);
    }

    #[test]
    fn test_mapped_from_confirmed_tier() {
        let (conn, images) = setup();
        // Photo still filed under the temporary id (owner rewrite never happened)
        let image = add(&conn, &images, "temp_lbw_a");
        id_map_service::record_mapping(&conn, "temp_lbw_a", "4821", EntityType::Visual).unwrap();

        let res = resolve_for_id(&conn, &images, "4821", "temp_lbw_").unwrap();
        assert_eq!(res.tier, Some(ResolutionTier::MappedFromConfirmed));
        assert_eq!(res.images, vec![image]);
    }

    #[test]
    fn test_first_non_empty_tier_wins() {
        let (conn, images) = setup();
        let confirmed = add(&conn, &images, "4821");
        add(&conn, &images, "temp_lbw_a");

        let res = resolve_photos(&conn, &images, FieldIds { temp: Some("temp_lbw_a"), confirmed: Some("4821") }).unwrap();
        assert_eq!(res.tier, Some(ResolutionTier::Confirmed));
        assert_eq!(res.images, vec![confirmed]);
    }

    #[test]
    fn test_all_photos_spans_every_tier() {
        let (conn, images) = setup();
        let moved = add(&conn, &images, "4821");
        let late = add(&conn, &images, "temp_lbw_a");
        id_map_service::record_mapping(&conn, "temp_lbw_a", "4821", EntityType::Visual).unwrap();

        let ids = FieldIds { temp: Some("temp_lbw_a"), confirmed: Some("4821") };
        assert_eq!(resolve_photos(&conn, &images, ids).unwrap().images, vec![moved.clone()]);

        let all = all_photos(&conn, &images, ids).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains(&moved));
        assert!(all.contains(&late));

        // Only the temporary id known: the mapping still reaches both
        let all = all_photos(&conn, &images, FieldIds { temp: Some("temp_lbw_a"), confirmed: None }).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_nothing_found() {
        let (conn, images) = setup();
        let res = resolve_for_id(&conn, &images, "temp_lbw_zzz", "temp_lbw_").unwrap();
        assert!(res.tier.is_none());
        assert!(res.images.is_empty());
    }
}
