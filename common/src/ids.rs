use serde::{Deserialize, Serialize};
use std::fmt;

/// Ids enteros asignados por el registry. Se serializan como el número pelado.
macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> u64 {
                id.0
            }
        }
    };
}

record_id!(
    /// Identificador de un registro Task.
    TaskId
);
record_id!(
    /// Identificador de un Model registrado.
    ModelId
);
record_id!(
    /// Identificador de un Dataset subido o generado.
    DatasetId
);
