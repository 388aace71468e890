//! Project registry: records, credentials and their persistence.

pub mod model;
pub mod projects;
pub mod secret;
pub mod store;

pub use model::{
    database_name_for, short_id, AttachConnection, ConnectionInfo, ContainerInstance, DatabaseConnection, DatabaseKind,
    NewProject, Project, ProjectPatch, ResourceLimits, Secret, StoredConnection,
};
pub use projects::ProjectRegistry;
pub use secret::{generate_password, generate_username, SecretCipher, SecretKey};
pub use store::{MemoryProjectStore, PgProjectStore, ProjectStore};
