pub mod catalog;
pub mod column_type;
pub mod condition;
pub mod ddl;
pub mod dml;
pub mod engine;
pub mod errors;
pub mod operation;
pub mod postgres;
pub mod query;
pub mod session;
pub mod validation;
pub mod value;

#[cfg(test)]
mod testing;

pub use catalog::{ColumnMetadata, TableMetadata, TableSchema};
pub use condition::Condition;
pub use dml::DmlOutcome;
pub use engine::{DdlReport, Engine};
pub use errors::{CoreError, Result};
pub use operation::{DdlOperation, DmlOperation};
pub use postgres::{PgConfig, PgPool};
pub use query::RawQueryResult;
pub use session::Database;
