use serde::{Deserialize, Serialize};

#[macro_export]
macro_rules! impl_string_id_inner {
    ($Name:ident, $Doc:literal) => {
        #[doc = $Doc]
        #[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
        pub struct $Name(String);

        impl std::fmt::Display for $Name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl $Name {
            /// Build Self from a string trait id.
            pub fn as_str<'a>(&'a self) -> &'a str {
                self.0.as_str()
            }
        }

        impl From<&str> for $Name {
            fn from(id: &str) -> Self {
                $Name::from(id)
            }
        }
        impl From<String> for $Name {
            fn from(id: String) -> Self {
                $Name::from(id.as_str())
            }
        }
        impl From<&$Name> for $Name {
            fn from(id: &$Name) -> $Name {
                id.clone()
            }
        }
        impl From<$Name> for String {
            fn from(id: $Name) -> String {
                id.to_string()
            }
        }
        impl From<&$Name> for String {
            fn from(id: &$Name) -> String {
                id.to_string()
            }
        }
    };
}

/// Identifiers assigned by an administrator or discovered from the array.
#[macro_export]
macro_rules! impl_string_id {
    ($Name:ident, $Doc:literal) => {
        $crate::impl_string_id_inner!($Name, $Doc);
        impl $Name {
            /// Build Self from a string trait id.
            pub fn from<T: Into<String>>(id: T) -> Self {
                $Name(id.into())
            }
        }
    };
}

/// Identifiers generated by the orchestration core, backed by a v4 uuid.
#[macro_export]
macro_rules! impl_string_uuid {
    ($Name:ident, $Doc:literal) => {
        $crate::impl_string_id_inner!($Name, $Doc);
        impl Default for $Name {
            /// Generates new random identifier.
            fn default() -> Self {
                Self::new()
            }
        }
        impl $Name {
            /// Build Self from a string trait id.
            pub fn from<T: Into<String>>(id: T) -> Self {
                $Name(id.into())
            }
            /// Generates new random identifier.
            pub fn new() -> Self {
                $Name(uuid::Uuid::new_v4().to_string())
            }
        }
    };
}

impl_string_id!(StorageSystemId, "ID of a managed storage system");
impl_string_id!(PoolId, "ID of a storage pool on a storage system");
impl_string_uuid!(VolumeId, "UUID of a block volume");
impl_string_uuid!(ConsistencyGroupId, "UUID of a logical consistency group");
impl_string_uuid!(ReplicaId, "UUID of a mirror, full copy, snapshot or snapshot session");
impl_string_uuid!(OperationId, "UUID of a user visible operation");
impl_string_uuid!(WorkflowId, "UUID of a workflow run");
