//! Device repository implementation

use crate::error::{Error, Result};
use crate::models::{Device, DeviceKind, DevicePlatform, DeviceRegistration};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};

const DEVICE_COLUMNS: &str = "id, client_id, kind, name, registered_at, last_seen_at, last_sync_at,
    is_active, platform, os_version, app_version, push_token";

/// Trait for device registry operations
pub trait DeviceRepository {
    /// Register a device, or refresh and reactivate an existing one
    fn upsert(&self, registration: &DeviceRegistration, now: i64) -> Result<Device>;

    fn get(&self, id: &str) -> Result<Option<Device>>;

    /// Devices of a client, most recently registered first
    fn list(&self, client_id: &str, include_inactive: bool) -> Result<Vec<Device>>;

    /// Flip the active flag; `false` if the device does not exist
    fn set_active(&self, id: &str, active: bool) -> Result<bool>;

    /// Stamp a completed sync session
    fn touch_sync(&self, id: &str, now: i64) -> Result<()>;
}

/// `SQLite` implementation of `DeviceRepository`
pub struct SqliteDeviceRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteDeviceRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
        let kind: String = row.get(2)?;
        let kind = kind
            .parse::<DeviceKind>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
        let platform = row
            .get::<_, Option<String>>(8)?
            .map(|raw| {
                raw.parse::<DevicePlatform>()
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))
            })
            .transpose()?;

        Ok(Device {
            id: row.get(0)?,
            client_id: row.get(1)?,
            kind,
            name: row.get(3)?,
            registered_at: row.get(4)?,
            last_seen_at: row.get(5)?,
            last_sync_at: row.get(6)?,
            is_active: row.get(7)?,
            platform,
            os_version: row.get(9)?,
            app_version: row.get(10)?,
            push_token: row.get(11)?,
        })
    }
}

impl DeviceRepository for SqliteDeviceRepository<'_> {
    fn upsert(&self, registration: &DeviceRegistration, now: i64) -> Result<Device> {
        if registration.device_id.trim().is_empty() || registration.client_id.trim().is_empty() {
            return Err(Error::InvalidInput(
                "device id and client id must not be empty".into(),
            ));
        }

        match self.get(&registration.device_id)? {
            Some(existing) if existing.client_id != registration.client_id => {
                return Err(Error::DeviceOwnership(registration.device_id.clone()));
            }
            Some(_) => {
                self.conn.execute(
                    "UPDATE devices
                     SET kind = ?1, name = COALESCE(?2, name), last_seen_at = ?3, is_active = 1,
                         platform = COALESCE(?5, platform), os_version = COALESCE(?6, os_version),
                         app_version = COALESCE(?7, app_version),
                         push_token = COALESCE(?8, push_token)
                     WHERE id = ?4",
                    params![
                        registration.kind.as_str(),
                        registration.name,
                        now,
                        registration.device_id,
                        registration.platform.map(DevicePlatform::as_str),
                        registration.os_version,
                        registration.app_version,
                        registration.push_token,
                    ],
                )?;
            }
            None => {
                self.conn.execute(
                    "INSERT INTO devices (id, client_id, kind, name, registered_at, last_seen_at,
                         is_active, platform, os_version, app_version, push_token)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5, 1, ?6, ?7, ?8, ?9)",
                    params![
                        registration.device_id,
                        registration.client_id,
                        registration.kind.as_str(),
                        registration.name,
                        now,
                        registration.platform.map(DevicePlatform::as_str),
                        registration.os_version,
                        registration.app_version,
                        registration.push_token,
                    ],
                )?;
                tracing::info!(
                    device_id = %registration.device_id,
                    kind = %registration.kind,
                    "Registered device"
                );
            }
        }

        self.get(&registration.device_id)?
            .ok_or_else(|| Error::DeviceNotRegistered(registration.device_id.clone()))
    }

    fn get(&self, id: &str) -> Result<Option<Device>> {
        let device = self
            .conn
            .query_row(
                &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1"),
                [id],
                Self::parse_device,
            )
            .optional()?;

        Ok(device)
    }

    fn list(&self, client_id: &str, include_inactive: bool) -> Result<Vec<Device>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices
             WHERE client_id = ?1 AND (?2 OR is_active = 1)
             ORDER BY registered_at DESC, id"
        ))?;

        let devices = stmt
            .query_map(params![client_id, include_inactive], Self::parse_device)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(devices)
    }

    fn set_active(&self, id: &str, active: bool) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE devices SET is_active = ?1 WHERE id = ?2",
            params![active, id],
        )?;
        Ok(rows == 1)
    }

    fn touch_sync(&self, id: &str, now: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE devices SET last_sync_at = ?1, last_seen_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn test_register_and_get() {
        let db = setup();
        let conn = db.connection().unwrap();
        let repo = SqliteDeviceRepository::new(&conn);

        let registration =
            DeviceRegistration::new("phone-1", "client-1", DeviceKind::Android).with_name("Pixel");
        let device = repo.upsert(&registration, 1_000).unwrap();

        assert_eq!(device.id, "phone-1");
        assert_eq!(device.name.as_deref(), Some("Pixel"));
        assert_eq!(device.registered_at, 1_000);
        assert!(device.is_active);
        assert_eq!(repo.get("phone-1").unwrap(), Some(device));
        assert!(repo.get("ghost").unwrap().is_none());
    }

    #[test]
    fn test_reregister_reactivates_and_keeps_name() {
        let db = setup();
        let conn = db.connection().unwrap();
        let repo = SqliteDeviceRepository::new(&conn);

        let registration =
            DeviceRegistration::new("phone-1", "client-1", DeviceKind::Android).with_name("Pixel");
        repo.upsert(&registration, 1_000).unwrap();
        assert!(repo.set_active("phone-1", false).unwrap());

        let again = DeviceRegistration::new("phone-1", "client-1", DeviceKind::Android);
        let device = repo.upsert(&again, 2_000).unwrap();

        assert!(device.is_active);
        assert_eq!(device.name.as_deref(), Some("Pixel"));
        assert_eq!(device.registered_at, 1_000);
        assert_eq!(device.last_seen_at, Some(2_000));
    }

    #[test]
    fn test_reregister_refreshes_metadata() {
        let db = setup();
        let conn = db.connection().unwrap();
        let repo = SqliteDeviceRepository::new(&conn);

        let registration = DeviceRegistration::new("mac-1", "client-1", DeviceKind::Desktop)
            .with_platform(DevicePlatform::Macos)
            .with_versions("14.2", "1.0.0")
            .with_push_token("apns-1");
        let device = repo.upsert(&registration, 1_000).unwrap();
        assert_eq!(device.platform, Some(DevicePlatform::Macos));
        assert_eq!(device.os_version.as_deref(), Some("14.2"));
        assert_eq!(device.push_token.as_deref(), Some("apns-1"));

        // An app update reports new versions but no token
        let update = DeviceRegistration::new("mac-1", "client-1", DeviceKind::Desktop)
            .with_versions("14.3", "1.1.0");
        let device = repo.upsert(&update, 2_000).unwrap();
        assert_eq!(device.platform, Some(DevicePlatform::Macos));
        assert_eq!(device.os_version.as_deref(), Some("14.3"));
        assert_eq!(device.app_version.as_deref(), Some("1.1.0"));
        assert_eq!(device.push_token.as_deref(), Some("apns-1"));
    }

    #[test]
    fn test_device_owned_by_other_client() {
        let db = setup();
        let conn = db.connection().unwrap();
        let repo = SqliteDeviceRepository::new(&conn);

        repo.upsert(
            &DeviceRegistration::new("phone-1", "client-1", DeviceKind::Ios),
            1,
        )
        .unwrap();
        let err = repo
            .upsert(
                &DeviceRegistration::new("phone-1", "client-2", DeviceKind::Ios),
                2,
            )
            .unwrap_err();
        assert!(matches!(err, Error::DeviceOwnership(id) if id == "phone-1"));
    }

    #[test]
    fn test_list_filters_inactive() {
        let db = setup();
        let conn = db.connection().unwrap();
        let repo = SqliteDeviceRepository::new(&conn);

        for (id, at) in [("a", 1), ("b", 2), ("c", 3)] {
            repo.upsert(&DeviceRegistration::new(id, "client-1", DeviceKind::Web), at)
                .unwrap();
        }
        repo.upsert(&DeviceRegistration::new("x", "client-2", DeviceKind::Web), 4)
            .unwrap();
        repo.set_active("b", false).unwrap();

        let active: Vec<_> = repo
            .list("client-1", false)
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(active, vec!["c", "a"]);
        assert_eq!(repo.list("client-1", true).unwrap().len(), 3);
    }

    #[test]
    fn test_touch_sync() {
        let db = setup();
        let conn = db.connection().unwrap();
        let repo = SqliteDeviceRepository::new(&conn);

        repo.upsert(&DeviceRegistration::new("a", "client-1", DeviceKind::Web), 1)
            .unwrap();
        repo.touch_sync("a", 50).unwrap();

        let device = repo.get("a").unwrap().unwrap();
        assert_eq!(device.last_sync_at, Some(50));
        assert_eq!(device.last_activity(), 50);
    }
}
