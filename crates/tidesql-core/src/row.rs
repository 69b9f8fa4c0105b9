//! Result rows.

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Column names of one result set, shared by all of its rows.
///
/// Lookup by name ignores ASCII case, as SQLite does. When a result repeats a
/// name (`SELECT a.id, b.id ...`) the leftmost column wins.
#[derive(Debug, Clone, Default)]
pub struct Columns {
    names: Vec<String>,
    positions: HashMap<String, usize>,
}

impl Columns {
    pub fn new(names: Vec<String>) -> Self {
        let mut positions = HashMap::with_capacity(names.len());
        for (index, name) in names.iter().enumerate() {
            positions.entry(name.to_ascii_lowercase()).or_insert(index);
        }
        Self { names, positions }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(&name.to_ascii_lowercase()).copied()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// One row stepped out of a statement.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<Columns>,
    values: Vec<Value>,
}

impl Row {
    pub fn with_columns(columns: Arc<Columns>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .position(name)
            .and_then(|index| self.values.get(index))
    }

    /// Column `index` converted to `T`.
    #[allow(clippy::result_large_err)]
    pub fn get_as<T: FromValue>(&self, index: usize) -> Result<T> {
        match self.get(index) {
            Some(value) => T::from_value(value),
            None => Err(missing::<T>(
                format!("no column {index} in a row of {}", self.len()),
                None,
            )),
        }
    }

    /// Column `name` converted to `T`. Conversion errors carry the column
    /// name.
    #[allow(clippy::result_large_err)]
    pub fn get_named<T: FromValue>(&self, name: &str) -> Result<T> {
        let Some(value) = self.get_by_name(name) else {
            return Err(missing::<T>(
                format!("no column named '{name}'"),
                Some(name),
            ));
        };
        T::from_value(value).map_err(|err| match err {
            Error::Type(mut type_error) => {
                type_error.column.get_or_insert_with(|| name.to_string());
                Error::Type(type_error)
            }
            other => other,
        })
    }

    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    /// `(column name, value)` pairs in result order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .names()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

fn missing<T>(actual: String, column: Option<&str>) -> Error {
    Error::Type(TypeError {
        expected: std::any::type_name::<T>(),
        actual,
        column: column.map(str::to_string),
    })
}

/// Conversion out of a borrowed [`Value`].
pub trait FromValue: Sized {
    #[allow(clippy::result_large_err)]
    fn from_value(value: &Value) -> Result<Self>;
}

impl<T> FromValue for T
where
    T: TryFrom<Value, Error = Error>,
{
    fn from_value(value: &Value) -> Result<Self> {
        T::try_from(value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined() -> Row {
        let columns = Columns::new(vec!["id".into(), "Name".into(), "id".into()]);
        Row::with_columns(
            Arc::new(columns),
            vec![Value::Integer(1), Value::Text("ada".into()), Value::Integer(9)],
        )
    }

    #[test]
    fn names_ignore_case_and_leftmost_wins() {
        let row = joined();
        assert_eq!(row.get_named::<String>("name").unwrap(), "ada");
        assert_eq!(row.get_named::<String>("NAME").unwrap(), "ada");
        assert_eq!(row.get_named::<i64>("id").unwrap(), 1);
        assert_eq!(row.get_as::<i64>(2).unwrap(), 9);
        assert_eq!(row.columns().len(), 3);
    }

    #[test]
    fn iter_pairs_names_with_values() {
        let row = joined();
        let pairs: Vec<(&str, &Value)> = row.iter().collect();
        assert_eq!(pairs[1], ("Name", &Value::Text("ada".into())));
        assert_eq!(pairs.len(), 3);
    }

    #[test]
    fn missing_and_mistyped_columns_name_the_column() {
        let row = joined();
        match row.get_named::<i64>("age") {
            Err(Error::Type(e)) => assert_eq!(e.column.as_deref(), Some("age")),
            other => panic!("unexpected: {other:?}"),
        }
        match row.get_named::<i64>("name") {
            Err(Error::Type(e)) => assert_eq!(e.column.as_deref(), Some("name")),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(row.get_as::<i64>(7), Err(Error::Type(_))));
    }
}
