//! Read views: constructor rows and closed projections. None of these are managed by a
//! session.

use std::fmt;

use datarepo::{FromRecord, Projection};
use datarepo_core::{Record, RepoResult};

/// Built by `select new MemberDto(m.id, m.username, t.name) ...`; columns are read in
/// constructor argument order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberDto {
    pub id: i64,
    pub username: String,
    pub team_name: String,
}

impl FromRecord for MemberDto {
    fn from_record(record: &Record) -> RepoResult<Self> {
        Ok(Self {
            id: record.try_get_at(0)?,
            username: record.try_get_at(1)?,
            team_name: record.try_get_at(2)?,
        })
    }
}

impl fmt::Display for MemberDto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MemberDto(id={}, username={}, teamName={})",
            self.id, self.username, self.team_name
        )
    }
}

#[derive(Projection, Debug, Clone, PartialEq, Eq)]
pub struct UsernameOnly {
    pub username: String,
}

#[derive(Projection, Debug, Clone, PartialEq, Eq)]
pub struct TeamInfo {
    pub name: String,
}

/// A member's username with its team's name; `team` is `None` for members without one.
#[derive(Projection, Debug, Clone, PartialEq, Eq)]
pub struct NestedClosedProjection {
    pub username: String,
    #[projection(nested)]
    pub team: Option<TeamInfo>,
}
