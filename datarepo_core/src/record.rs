use crate::value::{FromParamValue, ParamValue};
use crate::RepoError;

/// An ordered set of named column values. Engines return rows as records and
/// repositories hand records to row adapters and projections.
///
/// Joined columns are named `<relation>.<column>` (e.g. `team.name`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    values: Vec<(String, ParamValue)>,
}

#[derive(Debug, thiserror::Error)]
#[error("column `{column}`: {message}")]
struct ColumnError {
    column: String,
    message: String,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.set(column, value);
        self
    }

    /// Insert or replace a column value.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<ParamValue>) {
        let column = column.into();
        let value = value.into();
        match self.values.iter_mut().find(|(c, _)| *c == column) {
            Some(slot) => slot.1 = value,
            None => self.values.push((column, value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&ParamValue> {
        self.values
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v)
    }

    pub fn get_at(&self, index: usize) -> Option<&ParamValue> {
        self.values.get(index).map(|(_, v)| v)
    }

    /// Typed access by column name. Missing columns and failed conversions are mapping errors.
    pub fn try_get<T: FromParamValue>(&self, column: &str) -> Result<T, RepoError> {
        let value = self.get(column).ok_or_else(|| {
            RepoError::mapping(ColumnError {
                column: column.to_string(),
                message: "missing from row".into(),
            })
        })?;
        T::from_param(value).map_err(|e| {
            RepoError::mapping(ColumnError {
                column: column.to_string(),
                message: e.to_string(),
            })
        })
    }

    /// Typed access by position, for constructor-style results.
    pub fn try_get_at<T: FromParamValue>(&self, index: usize) -> Result<T, RepoError> {
        let (column, value) = self.values.get(index).ok_or_else(|| {
            RepoError::mapping(ColumnError {
                column: format!("#{index}"),
                message: format!("row has only {} column(s)", self.values.len()),
            })
        })?;
        T::from_param(value).map_err(|e| {
            RepoError::mapping(ColumnError {
                column: column.clone(),
                message: e.to_string(),
            })
        })
    }

    /// The columns under `prefix.` with the prefix removed.
    pub fn scoped(&self, prefix: &str) -> Record {
        let values = self
            .values
            .iter()
            .filter_map(|(c, v)| {
                c.strip_prefix(prefix)
                    .and_then(|rest| rest.strip_prefix('.'))
                    .map(|rest| (rest.to_string(), v.clone()))
            })
            .collect();
        Record { values }
    }

    /// Root columns only, without any `relation.column` entries.
    pub fn unscoped(&self) -> Record {
        let values = self
            .values
            .iter()
            .filter(|(c, _)| !c.contains('.'))
            .cloned()
            .collect();
        Record { values }
    }

    /// Copy every column of `other` into this record, overwriting duplicates.
    pub fn merge(&mut self, other: &Record) {
        for (c, v) in &other.values {
            self.set(c.clone(), v.clone());
        }
    }

    pub fn is_all_null(&self) -> bool {
        self.values.iter().all(|(_, v)| v.is_null())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(c, _)| c.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(c, v)| (c.as_str(), v))
    }
}

impl FromIterator<(String, ParamValue)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, ParamValue)>>(iter: I) -> Self {
        let mut r = Record::new();
        for (c, v) in iter {
            r.set(c, v);
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined_row() -> Record {
        Record::new()
            .with("id", 1_i64)
            .with("username", "member1")
            .with("team.id", 3_i64)
            .with("team.name", "teamA")
    }

    #[test]
    fn scoped_strips_prefix_and_ignores_others() {
        let team = joined_row().scoped("team");
        assert_eq!(team.len(), 2);
        assert_eq!(team.try_get::<String>("name").unwrap(), "teamA");
        assert!(joined_row().scoped("tea").is_empty());
        assert_eq!(joined_row().unscoped().len(), 2);
    }

    #[test]
    fn try_get_reports_column_in_mapping_error() {
        let row = joined_row();
        let err = row.try_get::<i32>("username").unwrap_err();
        assert!(matches!(err, RepoError::Mapping { .. }));
        let src = std::error::Error::source(&err).unwrap().to_string();
        assert!(src.contains("username"), "{src}");
        assert!(row.try_get::<i64>("missing").is_err());
    }

    #[test]
    fn positional_access_follows_insertion_order() {
        let row = joined_row();
        assert_eq!(row.try_get_at::<String>(1).unwrap(), "member1");
        assert!(row.try_get_at::<String>(9).is_err());
    }

    #[test]
    fn set_replaces_in_place() {
        let mut row = joined_row();
        row.set("username", "renamed");
        assert_eq!(row.len(), 4);
        assert_eq!(row.get_at(1), Some(&ParamValue::from("renamed")));
        assert!(Record::new().with("a", ParamValue::Null).is_all_null());
    }
}
