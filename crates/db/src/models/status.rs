//! Status helper enums mapping to SMALLSERIAL/SMALLINT lookup tables.
//!
//! Each enum variant's discriminant matches the seed data order (1-based)
//! in the corresponding `*_statuses` database table, and the label matches
//! the seeded `name` column.

/// Status ID type matching SMALLINT/SMALLSERIAL in the database.
pub type StatusId = i16;

macro_rules! define_status_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:expr => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $val ),+
        }

        impl $name {
            /// Every variant in seed order.
            pub const ALL: &'static [$name] = &[$( $name::$variant ),+];

            /// Return the database status ID.
            pub fn id(self) -> StatusId {
                self as StatusId
            }

            /// Look up a variant by database status ID.
            pub fn from_id(id: StatusId) -> Option<Self> {
                match id {
                    $( x if x == $val => Some($name::$variant), )+
                    _ => None,
                }
            }

            /// Lower-case name as seeded in the lookup table.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( $name::$variant => $label, )+
                }
            }

            /// Parse a lower-case lookup name (case-insensitive).
            pub fn parse(name: &str) -> Option<Self> {
                let name = name.trim();
                Self::ALL
                    .iter()
                    .copied()
                    .find(|s| s.as_str().eq_ignore_ascii_case(name))
            }
        }

        impl From<$name> for StatusId {
            fn from(value: $name) -> Self {
                value as StatusId
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }
    };
}

define_status_enum! {
    /// Task lifecycle status.
    TaskStatus {
        Created = 1 => "created",
        Started = 2 => "started",
        Succeeded = 3 => "succeeded",
        Failed = 4 => "failed",
        Expired = 5 => "expired",
        Cancelled = 6 => "cancelled",
    }
}

define_status_enum! {
    /// Schedule lifecycle status.
    ScheduleStatus {
        Started = 1 => "started",
        Paused = 2 => "paused",
        Deleted = 3 => "deleted",
    }
}

define_status_enum! {
    /// Execution node lifecycle status.
    NodeStatus {
        Pending = 1 => "pending",
        Starting = 2 => "starting",
        Running = 3 => "running",
        Outdated = 4 => "outdated",
        Finishing = 5 => "finishing",
        Idle = 6 => "idle",
        Terminated = 7 => "terminated",
        Error = 8 => "error",
    }
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        conduit_core::scheduling::task_state_machine::is_terminal(self.id())
    }
}

/// Terminal task statuses, in id order.
pub const TERMINAL_TASK_STATUSES: [StatusId; 4] = [
    TaskStatus::Succeeded as StatusId,
    TaskStatus::Failed as StatusId,
    TaskStatus::Expired as StatusId,
    TaskStatus::Cancelled as StatusId,
];
