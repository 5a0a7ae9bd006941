//! Read views over entity columns.

use crate::query::Path;
use crate::{Record, RepoResult};

/// Construct a value from a result record.
///
/// Implemented by `#[derive(Projection)]`, and by hand for constructor-style results
/// (`select new MemberDto(...)`), which read columns by position.
pub trait FromRecord: Sized {
    fn from_record(record: &Record) -> RepoResult<Self>;
}

/// A closed projection: the repository selects exactly [`Projection::columns`].
pub trait Projection: FromRecord {
    /// Paths relative to the queried entity; nested views are prefixed with their relation.
    fn columns() -> Vec<Path>;

    /// Relations whose nested view may be absent. These are left-joined.
    fn optional_relations() -> Vec<String> {
        Vec::new()
    }

    /// Whether this view itself may be absent (`Option<P>`).
    const OPTIONAL: bool = false;
}

impl<P: FromRecord> FromRecord for Option<P> {
    /// `None` when every selected column is null, as produced by a left join without a match.
    fn from_record(record: &Record) -> RepoResult<Self> {
        if record.is_all_null() {
            Ok(None)
        } else {
            P::from_record(record).map(Some)
        }
    }
}

impl<P: Projection> Projection for Option<P> {
    fn columns() -> Vec<Path> {
        P::columns()
    }

    fn optional_relations() -> Vec<String> {
        P::optional_relations()
    }

    const OPTIONAL: bool = true;
}

/// Prefix the paths of a nested view with `relation`.
pub fn nested(relation: &str, columns: Vec<Path>) -> Vec<Path> {
    columns
        .into_iter()
        .map(|p| Path::joined(relation, p.column))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ParamValue;

    struct TeamInfo {
        name: String,
    }

    impl FromRecord for TeamInfo {
        fn from_record(record: &Record) -> RepoResult<Self> {
            Ok(Self {
                name: record.try_get("name")?,
            })
        }
    }

    impl Projection for TeamInfo {
        fn columns() -> Vec<Path> {
            vec![Path::column("name")]
        }
    }

    #[test]
    fn optional_view_is_none_for_null_columns() {
        let absent = Record::new().with("name", ParamValue::Null);
        assert!(Option::<TeamInfo>::from_record(&absent).unwrap().is_none());
        let present = Record::new().with("name", "teamA");
        let info = Option::<TeamInfo>::from_record(&present).unwrap().unwrap();
        assert_eq!(info.name, "teamA");
        assert!(<Option<TeamInfo> as Projection>::OPTIONAL);
        assert!(!<TeamInfo as Projection>::OPTIONAL);
    }

    #[test]
    fn nested_prefixes_relation() {
        let cols = nested("team", TeamInfo::columns());
        assert_eq!(cols, vec![Path::joined("team", "name")]);
    }
}
