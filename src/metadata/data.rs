//! The replicated metadata document.
//!
//! [`Data`] holds every piece of cluster-wide state: meta and data node
//! membership, databases with their retention policies, and users.  It is a
//! plain owned value, so `clone()` is a full deep copy and a clone handed to
//! a reader never observes later mutations.
//!
//! Mutators here validate and change state but never touch `index`; the
//! store bumps the version once per applied command.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::DataError;

/// Shortest finite retention period a policy may declare.
pub const MIN_RETENTION_POLICY_DURATION: Duration = Duration::from_secs(60 * 60);

/// Retention policy name created alongside a database by default.
pub const DEFAULT_RETENTION_POLICY_NAME: &str = "default";

/// Versioned snapshot of all cluster metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data {
    /// Version counter; starts at 1 and grows by one per applied command.
    pub index: u64,
    /// Cluster identifier, fixed by the first meta node registration.
    #[serde(default)]
    pub cluster_id: u64,
    /// Highest node id handed out so far (shared by meta and data nodes).
    #[serde(default)]
    pub max_node_id: u64,
    #[serde(default)]
    pub meta_nodes: Vec<NodeInfo>,
    #[serde(default)]
    pub data_nodes: Vec<NodeInfo>,
    #[serde(default)]
    pub databases: Vec<DatabaseInfo>,
    #[serde(default)]
    pub users: Vec<UserInfo>,
}

impl Default for Data {
    fn default() -> Self {
        Self {
            index: 1,
            cluster_id: 0,
            max_node_id: 0,
            meta_nodes: Vec::new(),
            data_nodes: Vec::new(),
            databases: Vec::new(),
            users: Vec::new(),
        }
    }
}

/// A cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: u64,
    /// HTTP address.
    pub host: String,
    /// Consensus transport address.
    pub tcp_host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    #[serde(default)]
    pub default_retention_policy: String,
    #[serde(default)]
    pub retention_policies: Vec<RetentionPolicyInfo>,
}

impl DatabaseInfo {
    pub fn retention_policy(&self, name: &str) -> Option<&RetentionPolicyInfo> {
        self.retention_policies.iter().find(|rp| rp.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicyInfo {
    pub name: String,
    /// Zero means keep data forever.
    pub duration: Duration,
    pub replica_n: u32,
}

impl RetentionPolicyInfo {
    /// A policy with infinite duration and a single replica.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            duration: Duration::ZERO,
            replica_n: 1,
        }
    }
}

/// Partial update of a retention policy.  `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicyUpdate {
    pub name: Option<String>,
    pub duration: Option<Duration>,
    pub replica_n: Option<u32>,
}

impl RetentionPolicyUpdate {
    pub fn set_name(&mut self, v: &str) {
        self.name = Some(v.to_string());
    }

    pub fn set_duration(&mut self, v: Duration) {
        self.duration = Some(v);
    }

    pub fn set_replica_n(&mut self, v: u32) {
        self.replica_n = Some(v);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Privilege {
    NoPrivileges,
    Read,
    Write,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    /// bcrypt hash of the user's password.
    pub hash: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub privileges: BTreeMap<String, Privilege>,
}

fn validate_duration(d: Duration) -> Result<(), DataError> {
    if d != Duration::ZERO && d < MIN_RETENTION_POLICY_DURATION {
        return Err(DataError::RetentionPolicyDurationTooLow {
            min_secs: MIN_RETENTION_POLICY_DURATION.as_secs(),
        });
    }
    Ok(())
}

impl Data {
    // ── Nodes ───────────────────────────────────────────────────────

    pub fn meta_node_by_tcp_host(&self, tcp_host: &str) -> Option<&NodeInfo> {
        self.meta_nodes.iter().find(|n| n.tcp_host == tcp_host)
    }

    /// Register a meta node and return its id.
    pub fn create_meta_node(&mut self, host: &str, tcp_host: &str) -> Result<u64, DataError> {
        if self.meta_node_by_tcp_host(tcp_host).is_some() {
            return Err(DataError::NodeExists(tcp_host.to_string()));
        }
        self.max_node_id += 1;
        let id = self.max_node_id;
        self.meta_nodes.push(NodeInfo {
            id,
            host: host.to_string(),
            tcp_host: tcp_host.to_string(),
        });
        Ok(id)
    }

    pub fn delete_meta_node(&mut self, id: u64) -> Result<(), DataError> {
        let pos = self
            .meta_nodes
            .iter()
            .position(|n| n.id == id)
            .ok_or(DataError::NodeNotFound(id))?;
        self.meta_nodes.remove(pos);
        Ok(())
    }

    /// Register a data node and return its id.
    pub fn create_data_node(&mut self, host: &str, tcp_host: &str) -> Result<u64, DataError> {
        if self.data_nodes.iter().any(|n| n.tcp_host == tcp_host) {
            return Err(DataError::NodeExists(tcp_host.to_string()));
        }
        self.max_node_id += 1;
        let id = self.max_node_id;
        self.data_nodes.push(NodeInfo {
            id,
            host: host.to_string(),
            tcp_host: tcp_host.to_string(),
        });
        Ok(id)
    }

    pub fn delete_data_node(&mut self, id: u64) -> Result<(), DataError> {
        let pos = self
            .data_nodes
            .iter()
            .position(|n| n.id == id)
            .ok_or(DataError::NodeNotFound(id))?;
        self.data_nodes.remove(pos);
        Ok(())
    }

    // ── Databases & retention policies ──────────────────────────────

    pub fn database(&self, name: &str) -> Option<&DatabaseInfo> {
        self.databases.iter().find(|db| db.name == name)
    }

    fn database_mut(&mut self, name: &str) -> Result<&mut DatabaseInfo, DataError> {
        self.databases
            .iter_mut()
            .find(|db| db.name == name)
            .ok_or_else(|| DataError::DatabaseNotFound(name.to_string()))
    }

    pub fn create_database(&mut self, name: &str) -> Result<(), DataError> {
        if name.is_empty() {
            return Err(DataError::DatabaseNameRequired);
        }
        if self.database(name).is_some() {
            return Err(DataError::DatabaseExists(name.to_string()));
        }
        self.databases.push(DatabaseInfo {
            name: name.to_string(),
            default_retention_policy: String::new(),
            retention_policies: Vec::new(),
        });
        Ok(())
    }

    pub fn drop_database(&mut self, name: &str) -> Result<(), DataError> {
        let pos = self
            .databases
            .iter()
            .position(|db| db.name == name)
            .ok_or_else(|| DataError::DatabaseNotFound(name.to_string()))?;
        self.databases.remove(pos);
        for user in &mut self.users {
            user.privileges.remove(name);
        }
        Ok(())
    }

    /// Add a policy to a database.  The first policy of a database becomes
    /// its default.
    pub fn create_retention_policy(
        &mut self,
        database: &str,
        rp: &RetentionPolicyInfo,
    ) -> Result<(), DataError> {
        if rp.name.is_empty() {
            return Err(DataError::RetentionPolicyNameRequired);
        }
        if rp.replica_n < 1 {
            return Err(DataError::ReplicationFactorTooLow);
        }
        validate_duration(rp.duration)?;

        let db = self.database_mut(database)?;
        if db.retention_policy(&rp.name).is_some() {
            return Err(DataError::RetentionPolicyExists {
                database: database.to_string(),
                name: rp.name.clone(),
            });
        }
        db.retention_policies.push(rp.clone());
        if db.default_retention_policy.is_empty() {
            db.default_retention_policy = rp.name.clone();
        }
        Ok(())
    }

    pub fn update_retention_policy(
        &mut self,
        database: &str,
        name: &str,
        update: &RetentionPolicyUpdate,
    ) -> Result<(), DataError> {
        if let Some(d) = update.duration {
            validate_duration(d)?;
        }
        if update.replica_n == Some(0) {
            return Err(DataError::ReplicationFactorTooLow);
        }

        let db = self.database_mut(database)?;
        if let Some(new_name) = &update.name {
            if new_name.is_empty() {
                return Err(DataError::RetentionPolicyNameRequired);
            }
            if new_name != name && db.retention_policy(new_name).is_some() {
                return Err(DataError::RetentionPolicyExists {
                    database: database.to_string(),
                    name: new_name.clone(),
                });
            }
        }

        let rp = db
            .retention_policies
            .iter_mut()
            .find(|rp| rp.name == name)
            .ok_or_else(|| DataError::RetentionPolicyNotFound {
                database: database.to_string(),
                name: name.to_string(),
            })?;
        if let Some(d) = update.duration {
            rp.duration = d;
        }
        if let Some(n) = update.replica_n {
            rp.replica_n = n;
        }
        if let Some(new_name) = &update.name {
            rp.name = new_name.clone();
            if db.default_retention_policy == name {
                db.default_retention_policy = new_name.clone();
            }
        }
        Ok(())
    }

    pub fn drop_retention_policy(&mut self, database: &str, name: &str) -> Result<(), DataError> {
        let db = self.database_mut(database)?;
        let pos = db
            .retention_policies
            .iter()
            .position(|rp| rp.name == name)
            .ok_or_else(|| DataError::RetentionPolicyNotFound {
                database: database.to_string(),
                name: name.to_string(),
            })?;
        db.retention_policies.remove(pos);
        if db.default_retention_policy == name {
            db.default_retention_policy.clear();
        }
        Ok(())
    }

    pub fn set_default_retention_policy(
        &mut self,
        database: &str,
        name: &str,
    ) -> Result<(), DataError> {
        let db = self.database_mut(database)?;
        if db.retention_policy(name).is_none() {
            return Err(DataError::RetentionPolicyNotFound {
                database: database.to_string(),
                name: name.to_string(),
            });
        }
        db.default_retention_policy = name.to_string();
        Ok(())
    }

    // ── Users ───────────────────────────────────────────────────────

    pub fn user(&self, name: &str) -> Option<&UserInfo> {
        self.users.iter().find(|u| u.name == name)
    }

    fn user_mut(&mut self, name: &str) -> Result<&mut UserInfo, DataError> {
        self.users
            .iter_mut()
            .find(|u| u.name == name)
            .ok_or_else(|| DataError::UserNotFound(name.to_string()))
    }

    pub fn create_user(&mut self, name: &str, hash: &str, admin: bool) -> Result<(), DataError> {
        if name.is_empty() {
            return Err(DataError::UsernameRequired);
        }
        if self.user(name).is_some() {
            return Err(DataError::UserExists(name.to_string()));
        }
        self.users.push(UserInfo {
            name: name.to_string(),
            hash: hash.to_string(),
            admin,
            privileges: BTreeMap::new(),
        });
        Ok(())
    }

    pub fn update_user(&mut self, name: &str, hash: &str) -> Result<(), DataError> {
        self.user_mut(name)?.hash = hash.to_string();
        Ok(())
    }

    pub fn drop_user(&mut self, name: &str) -> Result<(), DataError> {
        let pos = self
            .users
            .iter()
            .position(|u| u.name == name)
            .ok_or_else(|| DataError::UserNotFound(name.to_string()))?;
        self.users.remove(pos);
        Ok(())
    }

    pub fn set_privilege(
        &mut self,
        name: &str,
        database: &str,
        privilege: Privilege,
    ) -> Result<(), DataError> {
        if self.database(database).is_none() {
            return Err(DataError::DatabaseNotFound(database.to_string()));
        }
        self.user_mut(name)?
            .privileges
            .insert(database.to_string(), privilege);
        Ok(())
    }

    pub fn set_admin_privilege(&mut self, name: &str, admin: bool) -> Result<(), DataError> {
        self.user_mut(name)?.admin = admin;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_with_db(name: &str) -> Data {
        let mut data = Data::default();
        data.create_database(name).unwrap();
        data
    }

    #[test]
    fn test_new_document_starts_at_index_one() {
        let data = Data::default();
        assert_eq!(data.index, 1);
        assert!(data.meta_nodes.is_empty());
    }

    #[test]
    fn test_clone_is_independent() {
        let mut data = data_with_db("db0");
        data.create_user("susy", "hash", false).unwrap();
        let snapshot = data.clone();

        data.create_database("db1").unwrap();
        data.set_privilege("susy", "db0", Privilege::Write).unwrap();
        data.index += 1;

        assert_eq!(snapshot.databases.len(), 1);
        assert!(snapshot.user("susy").unwrap().privileges.is_empty());
        assert_eq!(snapshot.index, 1);
    }

    #[test]
    fn test_node_ids_are_shared_between_roles() {
        let mut data = Data::default();
        let m = data.create_meta_node("h1:8091", "h1:8089").unwrap();
        let d = data.create_data_node("h2:8086", "h2:8088").unwrap();
        assert_eq!((m, d), (1, 2));
        assert_eq!(
            data.create_meta_node("other:8091", "h1:8089"),
            Err(DataError::NodeExists("h1:8089".to_string()))
        );
        data.delete_data_node(d).unwrap();
        assert_eq!(data.delete_data_node(d), Err(DataError::NodeNotFound(2)));
    }

    #[test]
    fn test_database_lifecycle() {
        let mut data = data_with_db("db0");
        assert_eq!(
            data.create_database("db0"),
            Err(DataError::DatabaseExists("db0".to_string()))
        );
        assert_eq!(data.create_database(""), Err(DataError::DatabaseNameRequired));
        data.drop_database("db0").unwrap();
        assert!(data.database("db0").is_none());
    }

    #[test]
    fn test_first_retention_policy_becomes_default() {
        let mut data = data_with_db("db0");
        data.create_retention_policy("db0", &RetentionPolicyInfo::new("rp0"))
            .unwrap();
        data.create_retention_policy("db0", &RetentionPolicyInfo::new("rp1"))
            .unwrap();
        assert_eq!(data.database("db0").unwrap().default_retention_policy, "rp0");

        data.set_default_retention_policy("db0", "rp1").unwrap();
        data.drop_retention_policy("db0", "rp1").unwrap();
        assert_eq!(data.database("db0").unwrap().default_retention_policy, "");
    }

    #[test]
    fn test_retention_policy_validation() {
        let mut data = data_with_db("db0");
        let mut rp = RetentionPolicyInfo::new("short");
        rp.duration = Duration::from_secs(60);
        assert!(matches!(
            data.create_retention_policy("db0", &rp),
            Err(DataError::RetentionPolicyDurationTooLow { .. })
        ));

        let mut rp = RetentionPolicyInfo::new("none");
        rp.replica_n = 0;
        assert_eq!(
            data.create_retention_policy("db0", &rp),
            Err(DataError::ReplicationFactorTooLow)
        );

        assert_eq!(
            data.create_retention_policy("nope", &RetentionPolicyInfo::new("rp0")),
            Err(DataError::DatabaseNotFound("nope".to_string()))
        );
    }

    #[test]
    fn test_update_retention_policy_renames_default() {
        let mut data = data_with_db("db0");
        data.create_retention_policy("db0", &RetentionPolicyInfo::new("rp0"))
            .unwrap();

        let mut update = RetentionPolicyUpdate::default();
        update.set_name("rp1");
        update.set_duration(Duration::from_secs(2 * 60 * 60));
        update.set_replica_n(3);
        data.update_retention_policy("db0", "rp0", &update).unwrap();

        let db = data.database("db0").unwrap();
        assert_eq!(db.default_retention_policy, "rp1");
        let rp = db.retention_policy("rp1").unwrap();
        assert_eq!(rp.replica_n, 3);
        assert_eq!(rp.duration, Duration::from_secs(7200));
        assert!(db.retention_policy("rp0").is_none());
    }

    #[test]
    fn test_update_retention_policy_rejects_name_clash() {
        let mut data = data_with_db("db0");
        data.create_retention_policy("db0", &RetentionPolicyInfo::new("rp0"))
            .unwrap();
        data.create_retention_policy("db0", &RetentionPolicyInfo::new("rp1"))
            .unwrap();

        let mut update = RetentionPolicyUpdate::default();
        update.set_name("rp1");
        let before = data.clone();
        assert!(matches!(
            data.update_retention_policy("db0", "rp0", &update),
            Err(DataError::RetentionPolicyExists { .. })
        ));
        assert_eq!(data, before);
    }

    #[test]
    fn test_user_privileges() {
        let mut data = data_with_db("db0");
        data.create_user("susy", "hash", false).unwrap();
        assert_eq!(
            data.set_privilege("susy", "missing", Privilege::Read),
            Err(DataError::DatabaseNotFound("missing".to_string()))
        );
        data.set_privilege("susy", "db0", Privilege::Read).unwrap();

        let user = data.user("susy").unwrap();
        assert_eq!(user.privileges.get("db0"), Some(&Privilege::Read));

        data.set_admin_privilege("susy", true).unwrap();
        assert!(data.user("susy").unwrap().admin);

        data.drop_database("db0").unwrap();
        assert!(data.user("susy").unwrap().privileges.is_empty());
    }
}
