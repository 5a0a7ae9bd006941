//! The Member/Team/Item tutorial domain built on `datarepo`, plus repository scenarios
//! that every engine's test suite runs.

pub mod custom;
pub mod dto;
pub mod entity;
pub mod repository;
pub mod scenarios;
pub mod spec;

pub use custom::{MemberRepositoryCustom, MemberRepositoryImpl};
pub use dto::{MemberDto, NestedClosedProjection, TeamInfo, UsernameOnly};
pub use entity::{Item, Member, Team};
pub use repository::{
    item_repository, member_repository, team_repository, ItemRepository, MemberRepository,
    TeamRepository,
};
pub use spec::MemberSpec;

/// Expose migration SQL via constants for harnesses.
pub mod migrations {
    pub const LIBSQL_SCHEMA_SQL: &str = include_str!("../migrations/libsql/001_schema.sql");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_covers_every_table() {
        let sql = migrations::LIBSQL_SCHEMA_SQL;
        for table in ["members", "teams", "items"] {
            assert!(sql.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")));
        }
        assert!(sql.contains("team_id INTEGER REFERENCES teams(id)"));
    }
}
