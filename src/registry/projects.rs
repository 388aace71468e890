//! Project records owned by callers, and the credentials of their databases.

use super::model::{
    database_name_for, AttachConnection, DatabaseConnection, NewProject, Project, ProjectPatch, Secret,
    StoredConnection,
};
use super::secret::{SecretCipher, SecretKey};
use super::store::ProjectStore;
use crate::error::AppError;
use chrono::Utc;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;
use uuid::Uuid;

const NAME_PATTERN: &str = r"^[a-zA-Z0-9\s\-_]+$";
const NAME_MIN: usize = 3;
const NAME_MAX: usize = 50;
const DESCRIPTION_MAX: usize = 500;

pub struct ProjectRegistry {
    store: Arc<dyn ProjectStore>,
    cipher: SecretCipher,
    /// Opened credentials, so the store is read once per project.
    live: RwLock<HashMap<Uuid, DatabaseConnection>>,
}

fn validate_name(name: &str) -> Result<String, AppError> {
    let name = name.trim();
    let len = name.chars().count();
    if !(NAME_MIN..=NAME_MAX).contains(&len) {
        return Err(AppError::validation(
            "name",
            format!("must be {} to {} characters", NAME_MIN, NAME_MAX),
        ));
    }
    let re = Regex::new(NAME_PATTERN).map_err(|e| AppError::Registry(e.to_string()))?;
    if !re.is_match(name) {
        return Err(AppError::validation(
            "name",
            "may contain only letters, digits, spaces, hyphens and underscores",
        ));
    }
    Ok(name.to_string())
}

fn validate_description(description: Option<String>) -> Result<Option<String>, AppError> {
    let description = description.map(|d| d.trim().to_string()).filter(|d| !d.is_empty());
    match &description {
        Some(d) if d.chars().count() > DESCRIPTION_MAX => Err(AppError::validation(
            "description",
            format!("must be at most {} characters", DESCRIPTION_MAX),
        )),
        _ => Ok(description),
    }
}

impl ProjectRegistry {
    pub fn new(store: Arc<dyn ProjectStore>, key: &SecretKey) -> Self {
        Self {
            store,
            cipher: SecretCipher::new(key),
            live: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> Arc<dyn ProjectStore> {
        self.store.clone()
    }

    pub async fn create_project(&self, owner_id: &str, req: NewProject) -> Result<Project, AppError> {
        let name = validate_name(&req.name)?;
        let description = validate_description(req.description)?;
        let taken = self
            .store
            .list_projects(owner_id)
            .await?
            .iter()
            .any(|p| p.name.eq_ignore_ascii_case(&name));
        if taken {
            return Err(AppError::Conflict(format!("a project named '{}' already exists", name)));
        }
        let now = Utc::now();
        let project = Project {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            database_name: database_name_for(&name),
            name,
            description,
            database_kind: req.database_kind,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_project(&project).await?;
        info!(project_id = %project.id, kind = %project.database_kind, "project created");
        Ok(project)
    }

    pub async fn list_projects(&self, owner_id: &str) -> Result<Vec<Project>, AppError> {
        self.store.list_projects(owner_id).await
    }

    pub async fn get_project(&self, id: Uuid) -> Result<Project, AppError> {
        self.store
            .get_project(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("project {}", id)))
    }

    /// Projects of other owners are reported as not found.
    pub async fn get_owned(&self, owner_id: &str, id: Uuid) -> Result<Project, AppError> {
        match self.store.get_project(id).await? {
            Some(p) if p.owner_id == owner_id => Ok(p),
            _ => Err(AppError::NotFound(format!("project {}", id))),
        }
    }

    pub async fn update_project(&self, owner_id: &str, id: Uuid, patch: ProjectPatch) -> Result<Project, AppError> {
        let mut project = self.get_owned(owner_id, id).await?;
        if let Some(name) = patch.name {
            let name = validate_name(&name)?;
            let taken = self
                .store
                .list_projects(owner_id)
                .await?
                .iter()
                .any(|p| p.id != id && p.name.eq_ignore_ascii_case(&name));
            if taken {
                return Err(AppError::Conflict(format!("a project named '{}' already exists", name)));
            }
            project.name = name;
        }
        if patch.description.is_some() {
            project.description = validate_description(patch.description)?;
        }
        project.updated_at = Utc::now();
        self.store.update_project(&project).await?;
        Ok(project)
    }

    pub async fn delete_project(&self, id: Uuid) -> Result<bool, AppError> {
        self.forget_connection(id);
        let deleted = self.store.delete_project(id).await?;
        if deleted {
            info!(project_id = %id, "project deleted");
        }
        Ok(deleted)
    }

    /// Persist the connection with its password sealed.
    pub async fn record_connection(&self, conn: DatabaseConnection) -> Result<(), AppError> {
        let stored = StoredConnection {
            project_id: conn.project_id,
            host: conn.host.clone(),
            port: conn.port,
            database: conn.database.clone(),
            username: conn.username.clone(),
            password_sealed: self.cipher.seal(conn.project_id, &conn.password)?,
        };
        self.store.save_connection(&stored).await?;
        self.live
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(conn.project_id, conn);
        Ok(())
    }

    /// Attach a caller-supplied database to a project.
    pub async fn attach_connection(&self, project: &Project, req: AttachConnection) -> Result<DatabaseConnection, AppError> {
        if req.host.trim().is_empty() {
            return Err(AppError::validation("host", "must not be empty"));
        }
        if req.database.trim().is_empty() {
            return Err(AppError::validation("database", "must not be empty"));
        }
        let conn = DatabaseConnection {
            project_id: project.id,
            kind: project.database_kind,
            host: req.host.trim().to_string(),
            port: req.port,
            database: req.database.trim().to_string(),
            username: req.username,
            password: Secret::new(req.password),
        };
        self.record_connection(conn.clone()).await?;
        Ok(conn)
    }

    /// Credentials for a project, opened from the store on first use.
    pub async fn get_connection(&self, project_id: Uuid) -> Result<DatabaseConnection, AppError> {
        let cached = self
            .live
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&project_id)
            .cloned();
        if let Some(c) = cached {
            return Ok(c);
        }
        let stored = self
            .store
            .get_connection(project_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("connection for project {}", project_id)))?;
        let project = self.get_project(project_id).await?;
        let conn = DatabaseConnection {
            project_id,
            kind: project.database_kind,
            password: self.cipher.open(project_id, &stored.password_sealed)?,
            host: stored.host,
            port: stored.port,
            database: stored.database,
            username: stored.username,
        };
        self.live
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(project_id, conn.clone());
        Ok(conn)
    }

    /// Every project with a recorded connection.
    pub async fn connected_projects(&self) -> Result<Vec<Uuid>, AppError> {
        self.store.list_connected().await
    }

    /// Drop both the cached and the stored credentials.
    pub async fn remove_connection(&self, project_id: Uuid) -> Result<bool, AppError> {
        self.forget_connection(project_id);
        self.store.delete_connection(project_id).await
    }

    /// Drop the cached credentials; the stored record is kept.
    pub fn forget_connection(&self, project_id: Uuid) {
        self.live
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&project_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DatabaseKind, MemoryProjectStore};

    fn registry() -> ProjectRegistry {
        ProjectRegistry::new(Arc::new(MemoryProjectStore::new()), &SecretKey::generate())
    }

    fn new_project(name: &str) -> NewProject {
        NewProject {
            name: name.into(),
            description: None,
            database_kind: DatabaseKind::Postgres,
        }
    }

    #[tokio::test]
    async fn names_are_validated_and_unique_per_owner() {
        let reg = registry();
        let p = reg.create_project("alice", new_project("Shop API")).await.unwrap();
        assert_eq!(p.database_name, "db_shop_api");

        let err = reg.create_project("alice", new_project("shop api")).await.unwrap_err();
        assert_eq!(err.code(), "conflict");
        assert!(reg.create_project("bob", new_project("Shop API")).await.is_ok());

        let long = "x".repeat(51);
        for bad in ["ab", "drop;table", long.as_str()] {
            let err = reg.create_project("alice", new_project(bad)).await.unwrap_err();
            assert_eq!(err.code(), "validation_error", "{}", bad);
        }
    }

    #[tokio::test]
    async fn other_owners_cannot_see_a_project() {
        let reg = registry();
        let p = reg.create_project("alice", new_project("Inventory")).await.unwrap();
        assert!(reg.get_owned("alice", p.id).await.is_ok());
        assert_eq!(reg.get_owned("mallory", p.id).await.unwrap_err().code(), "not_found");
    }

    fn attach_body() -> AttachConnection {
        AttachConnection {
            host: "db.internal".into(),
            port: 5432,
            database: "billing".into(),
            username: "svc".into(),
            password: "s3cret-pass".into(),
        }
    }

    #[tokio::test]
    async fn stored_connection_is_sealed_and_reopened() {
        let reg = registry();
        let p = reg.create_project("alice", new_project("Billing")).await.unwrap();
        reg.attach_connection(&p, attach_body()).await.unwrap();
        let stored = reg.store().get_connection(p.id).await.unwrap().unwrap();
        assert!(!stored.password_sealed.contains("s3cret-pass"));

        reg.forget_connection(p.id);
        let conn = reg.get_connection(p.id).await.unwrap();
        assert_eq!(conn.password.expose(), "s3cret-pass");
        assert_eq!(conn.kind, DatabaseKind::Postgres);
        assert_eq!(reg.connected_projects().await.unwrap(), vec![p.id]);
    }

    #[tokio::test]
    async fn another_key_cannot_open_stored_credentials() {
        let store: Arc<dyn ProjectStore> = Arc::new(MemoryProjectStore::new());
        let key = SecretKey::generate();
        let first = ProjectRegistry::new(store.clone(), &key);
        let p = first.create_project("alice", new_project("Billing")).await.unwrap();
        first.attach_connection(&p, attach_body()).await.unwrap();

        let same_key = ProjectRegistry::new(store.clone(), &key);
        assert_eq!(same_key.get_connection(p.id).await.unwrap().password.expose(), "s3cret-pass");
        let other_key = ProjectRegistry::new(store, &SecretKey::generate());
        assert_eq!(other_key.get_connection(p.id).await.unwrap_err().code(), "registry_error");
    }

    #[tokio::test]
    async fn concurrent_creates_differing_in_case_admit_one() {
        let reg = Arc::new(registry());
        let tasks: Vec<_> = ["Shop", "shop", "SHOP", "sHoP"]
            .into_iter()
            .map(|name| {
                let reg = reg.clone();
                tokio::spawn(async move { reg.create_project("alice", new_project(name)).await })
            })
            .collect();
        let mut created = 0;
        for t in tasks {
            match t.await.unwrap() {
                Ok(_) => created += 1,
                Err(e) => assert_eq!(e.code(), "conflict"),
            }
        }
        assert_eq!(created, 1);
        assert_eq!(reg.list_projects("alice").await.unwrap().len(), 1);
    }
}
