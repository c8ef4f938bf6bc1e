use rusqlite::types::ToSqlOutput;
use rusqlite::{types, Result, Statement};

/// This strong typedef only exists to implement `From<Option<T>>` and friends
/// for the `params!` macro.
pub enum ToSqlType {
  /// A borrowed SQLite-representable value.
  Borrowed(types::ValueRef<'static>),

  /// An owned SQLite-representable value.
  Owned(types::Value),
}

impl rusqlite::ToSql for ToSqlType {
  #[inline]
  fn to_sql(&self) -> Result<ToSqlOutput<'_>> {
    Ok(match *self {
      ToSqlType::Borrowed(v) => ToSqlOutput::Borrowed(v),
      ToSqlType::Owned(ref v) => ToSqlOutput::Borrowed(types::ValueRef::from(v)),
    })
  }
}

impl<T: ?Sized> From<&'static T> for ToSqlType
where
  &'static T: Into<types::ValueRef<'static>>,
{
  #[inline]
  fn from(t: &'static T) -> Self {
    ToSqlType::Borrowed(t.into())
  }
}

macro_rules! from_value(
    ($t:ty) => (
        impl From<$t> for ToSqlType {
            #[inline]
            fn from(t: $t) -> Self { ToSqlType::Owned(t.into()) }
        }
        impl From<Option<$t>> for ToSqlType {
            #[inline]
            fn from(t: Option<$t>) -> Self {
                match t {
                    Some(t) => ToSqlType::Owned(t.into()),
                    None => ToSqlType::Owned(types::Value::Null),
                }
            }
        }
    )
);

from_value!(String);
from_value!(bool);
from_value!(i64);
from_value!(i32);
from_value!(f64);
from_value!(Vec<u8>);

impl From<usize> for ToSqlType {
  #[inline]
  fn from(t: usize) -> Self {
    ToSqlType::Owned(types::Value::Integer(t as i64))
  }
}

/// Positional parameters bindable to a prepared statement.
pub trait Params {
  fn bind(self, stmt: &mut Statement<'_>) -> Result<()>;
}

impl Params for () {
  #[inline]
  fn bind(self, _stmt: &mut Statement<'_>) -> Result<()> {
    return Ok(());
  }
}

impl<const N: usize> Params for [ToSqlType; N] {
  fn bind(self, stmt: &mut Statement<'_>) -> Result<()> {
    for (idx, p) in self.into_iter().enumerate() {
      stmt.raw_bind_parameter(idx + 1, p)?;
    }
    return Ok(());
  }
}

impl Params for Vec<ToSqlType> {
  fn bind(self, stmt: &mut Statement<'_>) -> Result<()> {
    for (idx, p) in self.into_iter().enumerate() {
      stmt.raw_bind_parameter(idx + 1, p)?;
    }
    return Ok(());
  }
}

impl Params for Vec<types::Value> {
  fn bind(self, stmt: &mut Statement<'_>) -> Result<()> {
    for (idx, p) in self.into_iter().enumerate() {
      stmt.raw_bind_parameter(idx + 1, p)?;
    }
    return Ok(());
  }
}

impl<T> Params for (T,)
where
  T: rusqlite::ToSql + Send + Sync,
{
  #[inline]
  fn bind(self, stmt: &mut Statement<'_>) -> Result<()> {
    return stmt.raw_bind_parameter(1, self.0);
  }
}

impl<T0, T1> Params for (T0, T1)
where
  T0: rusqlite::ToSql + Send + Sync,
  T1: rusqlite::ToSql + Send + Sync,
{
  fn bind(self, stmt: &mut Statement<'_>) -> Result<()> {
    stmt.raw_bind_parameter(1, self.0)?;
    return stmt.raw_bind_parameter(2, self.1);
  }
}
