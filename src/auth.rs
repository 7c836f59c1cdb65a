//! Statement-level authorization.
//!
//! SQLite consults the authorizer once per sub-action of every statement
//! (each table read, each column access, each schema change). The policy
//! maps engine action codes to a [`Disposition`]; anything unlisted is
//! denied.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use rusqlite::hooks::{AuthAction, Authorization};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Outcome of evaluating one statement sub-action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Disposition {
    Allow,
    Deny,
    Ignore,
}

impl Disposition {
    /// The engine's return code (`SQLITE_OK`, `SQLITE_DENY`, `SQLITE_IGNORE`).
    pub const fn code(self) -> i32 {
        match self {
            Disposition::Allow => 0,
            Disposition::Deny => 1,
            Disposition::Ignore => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Disposition::Allow),
            1 => Some(Disposition::Deny),
            2 => Some(Disposition::Ignore),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "ALLOW" => Some(Disposition::Allow),
            "DENY" => Some(Disposition::Deny),
            "IGNORE" => Some(Disposition::Ignore),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Disposition::Allow => "ALLOW",
            Disposition::Deny => "DENY",
            Disposition::Ignore => "IGNORE",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<Disposition> for Authorization {
    fn from(disposition: Disposition) -> Self {
        match disposition {
            Disposition::Allow => Authorization::Allow,
            Disposition::Deny => Authorization::Deny,
            Disposition::Ignore => Authorization::Ignore,
        }
    }
}

/// SQLite authorizer action codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum ActionCode {
    Copy = 0,
    CreateIndex = 1,
    CreateTable = 2,
    CreateTempIndex = 3,
    CreateTempTable = 4,
    CreateTempTrigger = 5,
    CreateTempView = 6,
    CreateTrigger = 7,
    CreateView = 8,
    Delete = 9,
    DropIndex = 10,
    DropTable = 11,
    DropTempIndex = 12,
    DropTempTable = 13,
    DropTempTrigger = 14,
    DropTempView = 15,
    DropTrigger = 16,
    DropView = 17,
    Insert = 18,
    Pragma = 19,
    Read = 20,
    Select = 21,
    Transaction = 22,
    Update = 23,
    Attach = 24,
    Detach = 25,
    AlterTable = 26,
    Reindex = 27,
    Analyze = 28,
    CreateVtable = 29,
    DropVtable = 30,
    Function = 31,
    Savepoint = 32,
    Recursive = 33,
}

const ACTION_NAMES: [(ActionCode, &str); 34] = [
    (ActionCode::Copy, "COPY"),
    (ActionCode::CreateIndex, "CREATE_INDEX"),
    (ActionCode::CreateTable, "CREATE_TABLE"),
    (ActionCode::CreateTempIndex, "CREATE_TEMP_INDEX"),
    (ActionCode::CreateTempTable, "CREATE_TEMP_TABLE"),
    (ActionCode::CreateTempTrigger, "CREATE_TEMP_TRIGGER"),
    (ActionCode::CreateTempView, "CREATE_TEMP_VIEW"),
    (ActionCode::CreateTrigger, "CREATE_TRIGGER"),
    (ActionCode::CreateView, "CREATE_VIEW"),
    (ActionCode::Delete, "DELETE"),
    (ActionCode::DropIndex, "DROP_INDEX"),
    (ActionCode::DropTable, "DROP_TABLE"),
    (ActionCode::DropTempIndex, "DROP_TEMP_INDEX"),
    (ActionCode::DropTempTable, "DROP_TEMP_TABLE"),
    (ActionCode::DropTempTrigger, "DROP_TEMP_TRIGGER"),
    (ActionCode::DropTempView, "DROP_TEMP_VIEW"),
    (ActionCode::DropTrigger, "DROP_TRIGGER"),
    (ActionCode::DropView, "DROP_VIEW"),
    (ActionCode::Insert, "INSERT"),
    (ActionCode::Pragma, "PRAGMA"),
    (ActionCode::Read, "READ"),
    (ActionCode::Select, "SELECT"),
    (ActionCode::Transaction, "TRANSACTION"),
    (ActionCode::Update, "UPDATE"),
    (ActionCode::Attach, "ATTACH"),
    (ActionCode::Detach, "DETACH"),
    (ActionCode::AlterTable, "ALTER_TABLE"),
    (ActionCode::Reindex, "REINDEX"),
    (ActionCode::Analyze, "ANALYZE"),
    (ActionCode::CreateVtable, "CREATE_VTABLE"),
    (ActionCode::DropVtable, "DROP_VTABLE"),
    (ActionCode::Function, "FUNCTION"),
    (ActionCode::Savepoint, "SAVEPOINT"),
    (ActionCode::Recursive, "RECURSIVE"),
];

impl ActionCode {
    pub const fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        ACTION_NAMES
            .iter()
            .find(|(action, _)| action.code() == code)
            .map(|(action, _)| *action)
    }

    /// Accepts the bare name (`CREATE_TABLE`) or the engine constant
    /// (`SQLITE_CREATE_TABLE`), case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("SQLITE_").unwrap_or(&upper);
        ACTION_NAMES
            .iter()
            .find(|(_, n)| *n == bare)
            .map(|(action, _)| *action)
    }

    pub fn name(self) -> &'static str {
        ACTION_NAMES
            .iter()
            .find(|(action, _)| *action == self)
            .map(|(_, n)| *n)
            .unwrap_or("UNKNOWN")
    }

    /// Numeric code of an engine callback. Actions the binding does not
    /// model carry their raw code.
    pub fn code_of(action: &AuthAction<'_>) -> i32 {
        let known = match action {
            AuthAction::Unknown { code, .. } => return *code,
            AuthAction::CreateIndex { .. } => ActionCode::CreateIndex,
            AuthAction::CreateTable { .. } => ActionCode::CreateTable,
            AuthAction::CreateTempIndex { .. } => ActionCode::CreateTempIndex,
            AuthAction::CreateTempTable { .. } => ActionCode::CreateTempTable,
            AuthAction::CreateTempTrigger { .. } => ActionCode::CreateTempTrigger,
            AuthAction::CreateTempView { .. } => ActionCode::CreateTempView,
            AuthAction::CreateTrigger { .. } => ActionCode::CreateTrigger,
            AuthAction::CreateView { .. } => ActionCode::CreateView,
            AuthAction::Delete { .. } => ActionCode::Delete,
            AuthAction::DropIndex { .. } => ActionCode::DropIndex,
            AuthAction::DropTable { .. } => ActionCode::DropTable,
            AuthAction::DropTempIndex { .. } => ActionCode::DropTempIndex,
            AuthAction::DropTempTable { .. } => ActionCode::DropTempTable,
            AuthAction::DropTempTrigger { .. } => ActionCode::DropTempTrigger,
            AuthAction::DropTempView { .. } => ActionCode::DropTempView,
            AuthAction::DropTrigger { .. } => ActionCode::DropTrigger,
            AuthAction::DropView { .. } => ActionCode::DropView,
            AuthAction::Insert { .. } => ActionCode::Insert,
            AuthAction::Pragma { .. } => ActionCode::Pragma,
            AuthAction::Read { .. } => ActionCode::Read,
            AuthAction::Select => ActionCode::Select,
            AuthAction::Transaction { .. } => ActionCode::Transaction,
            AuthAction::Update { .. } => ActionCode::Update,
            AuthAction::Attach { .. } => ActionCode::Attach,
            AuthAction::Detach { .. } => ActionCode::Detach,
            AuthAction::AlterTable { .. } => ActionCode::AlterTable,
            AuthAction::Reindex { .. } => ActionCode::Reindex,
            AuthAction::Analyze { .. } => ActionCode::Analyze,
            AuthAction::CreateVtable { .. } => ActionCode::CreateVtable,
            AuthAction::DropVtable { .. } => ActionCode::DropVtable,
            AuthAction::Function { .. } => ActionCode::Function,
            AuthAction::Savepoint { .. } => ActionCode::Savepoint,
            AuthAction::Recursive => ActionCode::Recursive,
            #[allow(unreachable_patterns)]
            _ => return -1,
        };
        known.code()
    }
}

impl fmt::Display for ActionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Policy as written in configuration: disposition name to action names.
///
/// ```toml
/// [authorization]
/// ALLOW = ["CREATE_TABLE", "INSERT", "READ", "SELECT"]
/// IGNORE = ["PRAGMA"]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyConfig(pub BTreeMap<String, Vec<String>>);

/// Immutable action-code to disposition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationPolicy {
    table: HashMap<i32, Disposition>,
}

impl AuthorizationPolicy {
    /// Builds a policy from raw engine codes: disposition code to the set of
    /// action codes it applies to.
    pub fn from_raw(config: HashMap<i32, HashSet<i32>>) -> Result<Self, ConfigError> {
        let mut table = HashMap::new();
        for (key, actions) in config {
            let disposition = Disposition::from_code(key).ok_or_else(|| {
                ConfigError::InvalidPolicy(format!(
                    "{key} is not a disposition; allowed keys are ALLOW(0), DENY(1), IGNORE(2)"
                ))
            })?;
            for action in actions {
                insert_unique(&mut table, action, disposition)?;
            }
        }
        Ok(Self { table })
    }

    pub fn from_config(config: &PolicyConfig) -> Result<Self, ConfigError> {
        let mut table = HashMap::new();
        for (key, actions) in &config.0 {
            let disposition = Disposition::from_name(key).ok_or_else(|| {
                ConfigError::InvalidPolicy(format!(
                    "{key} is not a disposition; allowed keys are ALLOW, DENY, IGNORE"
                ))
            })?;
            for name in actions {
                let action = ActionCode::from_name(name).ok_or_else(|| {
                    ConfigError::InvalidPolicy(format!("unknown action {name}"))
                })?;
                insert_unique(&mut table, action.code(), disposition)?;
            }
        }
        Ok(Self { table })
    }

    /// Disposition for an engine action code; unlisted codes are denied.
    pub fn evaluate(&self, action_code: i32) -> Disposition {
        self.table
            .get(&action_code)
            .copied()
            .unwrap_or(Disposition::Deny)
    }

    pub fn evaluate_action(&self, action: &AuthAction<'_>) -> Disposition {
        self.evaluate(ActionCode::code_of(action))
    }

    /// Action codes configured for one disposition, sorted.
    pub fn actions(&self, disposition: Disposition) -> Vec<i32> {
        let mut codes: Vec<i32> = self
            .table
            .iter()
            .filter(|(_, d)| **d == disposition)
            .map(|(code, _)| *code)
            .collect();
        codes.sort_unstable();
        codes
    }
}

fn insert_unique(
    table: &mut HashMap<i32, Disposition>,
    action: i32,
    disposition: Disposition,
) -> Result<(), ConfigError> {
    match table.insert(action, disposition) {
        Some(previous) if previous != disposition => Err(ConfigError::InvalidPolicy(format!(
            "action {action} listed under both {previous} and {disposition}"
        ))),
        _ => Ok(()),
    }
}

impl Default for AuthorizationPolicy {
    fn default() -> Self {
        use ActionCode::*;

        let allow = [
            CreateIndex,
            CreateTable,
            CreateTempIndex,
            CreateTempTable,
            CreateTempTrigger,
            CreateTempView,
            CreateTrigger,
            CreateView,
            Insert,
            Read,
            Select,
            Transaction,
            Update,
            Attach,
            Detach,
            AlterTable,
            Reindex,
            Analyze,
        ];
        let deny = [
            Delete,
            DropIndex,
            DropTable,
            DropTempIndex,
            DropTempTable,
            DropTempTrigger,
            DropTempView,
            DropTrigger,
            DropView,
        ];

        let mut table = HashMap::new();
        table.extend(allow.iter().map(|a| (a.code(), Disposition::Allow)));
        table.extend(deny.iter().map(|a| (a.code(), Disposition::Deny)));
        table.insert(Pragma.code(), Disposition::Ignore);
        Self { table }
    }
}
