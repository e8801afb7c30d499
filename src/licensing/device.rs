use crate::licensing::storage::LicensingStore;
use crate::licensing::types::LicensingError;

/// Get the installation id, creating and persisting one on first use.
///
/// The id is a random UUID kept in the durable store, so it is stable for an
/// install and resets with the app data.
pub fn get_device_id(store: &LicensingStore) -> Result<String, LicensingError> {
    if let Some(id) = store.installation_id()? {
        let id = id.trim();
        if !id.is_empty() {
            return Ok(id.to_string());
        }
    }

    let device_id = uuid::Uuid::new_v4().to_string();
    store.save_installation_id(&device_id)?;
    Ok(device_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_device_id_is_stable() {
        let store = LicensingStore::in_memory();
        let first = get_device_id(&store).unwrap();
        assert!(!first.is_empty());
        assert_eq!(get_device_id(&store).unwrap(), first);
    }
}
