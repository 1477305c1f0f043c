//! Commands replicated through the consensus log.
//!
//! A [`Command`] is the only way the metadata document changes.  The store
//! hands the consensus module the JSON encoding of a command as an opaque
//! byte string; every replica decodes and applies the same bytes in commit
//! order, so validation here must be deterministic.

use serde::{Deserialize, Serialize};

use super::data::{Data, Privilege, RetentionPolicyInfo, RetentionPolicyUpdate};
use crate::errors::DataError;

/// A single mutation of the metadata document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    CreateMetaNode {
        host: String,
        tcp_host: String,
        /// Seeds the cluster id when this is the first registration.
        rand: u64,
    },
    DeleteMetaNode {
        id: u64,
    },
    CreateDataNode {
        host: String,
        tcp_host: String,
    },
    DeleteDataNode {
        id: u64,
    },
    CreateDatabase {
        name: String,
    },
    DropDatabase {
        name: String,
    },
    CreateRetentionPolicy {
        database: String,
        policy: RetentionPolicyInfo,
    },
    UpdateRetentionPolicy {
        database: String,
        name: String,
        update: RetentionPolicyUpdate,
    },
    DropRetentionPolicy {
        database: String,
        name: String,
    },
    SetDefaultRetentionPolicy {
        database: String,
        name: String,
    },
    CreateUser {
        name: String,
        hash: String,
        admin: bool,
    },
    UpdateUser {
        name: String,
        hash: String,
    },
    DropUser {
        name: String,
    },
    SetPrivilege {
        username: String,
        database: String,
        privilege: Privilege,
    },
    SetAdminPrivilege {
        username: String,
        admin: bool,
    },
}

impl Command {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Short name used in logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::CreateMetaNode { .. } => "create_meta_node",
            Command::DeleteMetaNode { .. } => "delete_meta_node",
            Command::CreateDataNode { .. } => "create_data_node",
            Command::DeleteDataNode { .. } => "delete_data_node",
            Command::CreateDatabase { .. } => "create_database",
            Command::DropDatabase { .. } => "drop_database",
            Command::CreateRetentionPolicy { .. } => "create_retention_policy",
            Command::UpdateRetentionPolicy { .. } => "update_retention_policy",
            Command::DropRetentionPolicy { .. } => "drop_retention_policy",
            Command::SetDefaultRetentionPolicy { .. } => "set_default_retention_policy",
            Command::CreateUser { .. } => "create_user",
            Command::UpdateUser { .. } => "update_user",
            Command::DropUser { .. } => "drop_user",
            Command::SetPrivilege { .. } => "set_privilege",
            Command::SetAdminPrivilege { .. } => "set_admin_privilege",
        }
    }

    /// The user whose credentials this command changes, if any.
    pub fn touched_user(&self) -> Option<&str> {
        match self {
            Command::CreateUser { name, .. }
            | Command::UpdateUser { name, .. }
            | Command::DropUser { name } => Some(name),
            _ => None,
        }
    }

    /// Apply the command to `data`.  On error `data` is left untouched.
    pub fn apply_to(&self, data: &mut Data) -> Result<(), DataError> {
        match self {
            Command::CreateMetaNode {
                host,
                tcp_host,
                rand,
            } => {
                data.create_meta_node(host, tcp_host)?;
                if data.cluster_id == 0 {
                    data.cluster_id = *rand;
                }
                Ok(())
            }
            Command::DeleteMetaNode { id } => data.delete_meta_node(*id),
            Command::CreateDataNode { host, tcp_host } => {
                data.create_data_node(host, tcp_host).map(|_| ())
            }
            Command::DeleteDataNode { id } => data.delete_data_node(*id),
            Command::CreateDatabase { name } => data.create_database(name),
            Command::DropDatabase { name } => data.drop_database(name),
            Command::CreateRetentionPolicy { database, policy } => {
                data.create_retention_policy(database, policy)
            }
            Command::UpdateRetentionPolicy {
                database,
                name,
                update,
            } => data.update_retention_policy(database, name, update),
            Command::DropRetentionPolicy { database, name } => {
                data.drop_retention_policy(database, name)
            }
            Command::SetDefaultRetentionPolicy { database, name } => {
                data.set_default_retention_policy(database, name)
            }
            Command::CreateUser { name, hash, admin } => data.create_user(name, hash, *admin),
            Command::UpdateUser { name, hash } => data.update_user(name, hash),
            Command::DropUser { name } => data.drop_user(name),
            Command::SetPrivilege {
                username,
                database,
                privilege,
            } => data.set_privilege(username, database, *privilege),
            Command::SetAdminPrivilege { username, admin } => {
                data.set_admin_privilege(username, *admin)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_is_tagged_by_kind() {
        let cmd = Command::CreateDatabase {
            name: "db0".to_string(),
        };
        let bytes = cmd.encode().unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"{"create_database":{"name":"db0"}}"#
        );
        assert_eq!(Command::decode(&bytes).unwrap(), cmd);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Command::decode(b"not a command").is_err());
        assert!(Command::decode(br#"{"explode_database":{}}"#).is_err());
    }

    #[test]
    fn test_first_meta_node_fixes_cluster_id() {
        let mut data = Data::default();
        Command::CreateMetaNode {
            host: "a:8091".to_string(),
            tcp_host: "a:8089".to_string(),
            rand: 42,
        }
        .apply_to(&mut data)
        .unwrap();
        Command::CreateMetaNode {
            host: "b:8091".to_string(),
            tcp_host: "b:8089".to_string(),
            rand: 7,
        }
        .apply_to(&mut data)
        .unwrap();
        assert_eq!(data.cluster_id, 42);
        assert_eq!(data.meta_nodes.len(), 2);
    }

    #[test]
    fn test_touched_user() {
        let cmd = Command::UpdateUser {
            name: "susy".to_string(),
            hash: "h".to_string(),
        };
        assert_eq!(cmd.touched_user(), Some("susy"));
        assert_eq!(
            Command::CreateDatabase {
                name: "db0".to_string()
            }
            .touched_user(),
            None
        );
    }
}
