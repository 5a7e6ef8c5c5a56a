//! Compiled mapping descriptors: statements, parameter maps, result maps and
//! key generation strategies. Everything here is created by the mapping
//! compiler at registry build time and immutable afterwards.

mod parameter;
pub use parameter::{ParameterMap, ParameterMapping, ParameterMode};
mod result_map;
pub use result_map::{Discriminator, ResultMap, ResultMapping};
mod statement;
pub use statement::{MappedStatement, MappedStatementBuilder};
mod keygen;
pub use keygen::KeyGeneratorKind;

/// What a statement does, which drives cache flushing and key generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    Select,
    Insert,
    Update,
    Delete,
}

impl CommandKind {
    pub fn is_write(&self) -> bool {
        !matches!(self, CommandKind::Select)
    }
}

/// How the driver statement is prepared.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StatementKind {
    Statement,
    #[default]
    Prepared,
    Callable,
}

impl StatementKind {
    pub fn from_name(name: &str) -> Option<StatementKind> {
        Some(match name.to_uppercase().as_str() {
            "STATEMENT" => StatementKind::Statement,
            "PREPARED" => StatementKind::Prepared,
            "CALLABLE" => StatementKind::Callable,
            _ => return None,
        })
    }
}
